//! dynstats
//!
//! Instruments programs so that, at run time, they report how large their heap
//! objects are and how large the arrays of pointers they hand to library
//! functions are. The static stage lives here; the run-time half is the
//! `dynstats-rt` crate.
//!
//! A typical pipeline loads a [`ir::Module`], classifies its call sites with
//! [`analysis::analyze`], rewrites it with [`rewrite::RewritePlan`] and either
//! emits the result or executes it with the [`interpreter::Interpreter`].

pub mod analysis;
pub mod interpreter;
pub mod ir;
pub mod rewrite;

use crate::analysis::{Analysis, Classifier, LibraryUsage};
use crate::interpreter::{Execution, Interpreter, InterpreterConfig};
use crate::ir::Module;
use crate::ir::layout::LayoutCx;
use crate::rewrite::{RewritePlan, RewriteSummary};
use anyhow::{Context, Result};
use dynstats_rt::Runtime;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Default destination of the library usage report.
pub const DEFAULT_LIB_REPORT_PATH: &str = "/tmp/lib_fn.stat";

/// Reads and validates a program in its JSON form.
///
/// # Arguments
/// * `path` - Path to the JSON file
///
/// # Returns
/// * `Ok(Module)` - The validated module
/// * `Err(anyhow::Error)` - If the file cannot be read, parsed or validated
pub fn load_module(path: &Path) -> Result<Module> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read program {}", path.display()))?;
    let module = Module::from_json(&text)
        .with_context(|| format!("Invalid program {}", path.display()))?;
    info!(
        "Loaded module {} with {} functions",
        module.name,
        module.functions.len()
    );
    Ok(module)
}

/// Analyses `module` and inserts the runtime hooks.
///
/// The analysis is returned along with the rewrite summary since it describes
/// the module before instrumentation.
pub fn instrument(
    module: &mut Module,
    classifier: &Classifier,
) -> Result<(Analysis, RewriteSummary)> {
    let analysis = analysis::analyze(module, classifier)?;
    let plan = RewritePlan::from_sites(module, &analysis.sites);
    let summary = plan.apply(module)?;
    Ok((analysis, summary))
}

/// Results that only need the program text.
#[derive(Debug, Clone)]
pub struct StaticReport {
    pub analysis: Analysis,
    pub library_usage: LibraryUsage,
    /// Name and allocation size of the largest struct
    pub largest_struct: Option<(String, u64)>,
}

impl StaticReport {
    pub fn new(module: &Module, classifier: &Classifier) -> Result<Self> {
        let analysis = analysis::analyze(module, classifier)?;
        let library_usage = analysis.library_usage();
        let largest_struct = LayoutCx::new(module)
            .largest_struct()?
            .map(|(name, size)| (name.to_string(), size));
        Ok(Self {
            analysis,
            library_usage,
            largest_struct,
        })
    }

    /// `Largest struct: N bytes`, if the module has a sized struct.
    pub fn largest_struct_line(&self) -> Option<String> {
        self.largest_struct
            .as_ref()
            .map(|(_, size)| format!("Largest struct: {size} bytes"))
    }
}

/// Appends the library usage report to `path`. Nothing is written if no
/// library receives a pointer array.
pub fn write_library_report(path: &Path, usage: &LibraryUsage) -> Result<()> {
    if usage.is_empty() {
        return Ok(());
    }
    append_report(path, "library", &usage.to_string())
}

/// Appends the largest struct line to `path`. Nothing is written if the module
/// has no sized struct.
pub fn write_struct_report(path: &Path, report: &StaticReport) -> Result<()> {
    let Some(line) = report.largest_struct_line() else {
        return Ok(());
    };
    append_report(path, "struct size", &format!("{line}\n"))
}

fn append_report(path: &Path, kind: &str, text: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {} report {}", kind, path.display()))?;
    file.write_all(text.as_bytes())
        .with_context(|| format!("Failed to write {} report {}", kind, path.display()))?;
    Ok(())
}

/// Interprets an instrumented module against `runtime`.
///
/// The summary is flushed by the finalizer the rewriter registered. A module
/// whose entry did not get one is flushed explicitly once it returns.
pub fn run_instrumented(
    module: &Module,
    runtime: &Runtime,
    summary: &RewriteSummary,
    config: InterpreterConfig,
) -> Result<Execution> {
    let execution = Interpreter::new(module, runtime, config).run()?;
    if !summary.finalizer_registered {
        runtime.flush()?;
    }
    Ok(execution)
}
