//! Exit-time report rendering and output.

use crate::config::{OpenMode, RuntimeConfig};
use crate::stats::{LARGE_OBJECT_THRESHOLD, StatSnapshot};
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write;
use tracing::debug;

/// Renders the summary, one labeled line per metric.
pub fn render(snapshot: &StatSnapshot) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = writeln!(
        out,
        "Size of largest heap object: {}",
        snapshot.largest_object_size
    );
    let _ = writeln!(
        out,
        "Size of the largest shared array of pointers: {}",
        snapshot.largest_array_size
    );
    let _ = writeln!(
        out,
        "Total size of observed shared arrays: {} ({} observations)",
        snapshot.sum_of_observed_array_sizes, snapshot.observed_array_count
    );
    match snapshot.large_fraction() {
        Some(fraction) => {
            let _ = writeln!(
                out,
                "Large heap objects (>= {} bytes): {}/{} = {:.2}",
                LARGE_OBJECT_THRESHOLD,
                snapshot.large_object_count,
                snapshot.allocation_count,
                fraction
            );
        }
        None => {
            let _ = writeln!(out, "No heap allocations recorded");
        }
    }
    out
}

/// Output stream for reports.
///
/// The file is opened on first write and kept open, so truncate mode only
/// clears output left by earlier processes.
#[derive(Debug)]
pub struct ReportSink {
    config: RuntimeConfig,
    file: Option<File>,
}

impl ReportSink {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config, file: None }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Writes `text` to the report file and flushes it.
    pub fn write(&mut self, text: &str) -> Result<()> {
        let path = self.config.report_path();
        let file = match &mut self.file {
            Some(file) => file,
            empty => {
                let mut options = OpenOptions::new();
                options.create(true);
                match self.config.open_mode() {
                    OpenMode::Append => options.append(true),
                    OpenMode::Truncate => options.write(true).truncate(true),
                };
                let file = options
                    .open(path)
                    .with_context(|| format!("Failed to open report file {}", path.display()))?;
                debug!("Opened report file {}", path.display());
                empty.insert(file)
            }
        };
        file.write_all(text.as_bytes())
            .and_then(|_| file.flush())
            .with_context(|| format!("Failed to write report file {}", path.display()))
    }
}
