//! dynstats command line
//!
//! ```bash
//! dynstats analyze program.json
//! dynstats instrument program.json -o instrumented.json --emit text
//! dynstats run program.json --report /tmp/dyn_stats.txt --truncate
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dynstats::analysis::{AllowList, Classifier};
use dynstats::interpreter::InterpreterConfig;
use dynstats::{DEFAULT_LIB_REPORT_PATH, StaticReport};
use dynstats_rt::config::LOG_ENV;
use dynstats_rt::{OpenMode, Runtime, RuntimeConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "dynstats",
    version,
    about = "Collects heap object and shared pointer array size statistics",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the classified call sites and static statistics of a program.
    Analyze(AnalyzeArgs),
    /// Insert the runtime hooks and write the instrumented program.
    Instrument(InstrumentArgs),
    /// Instrument a program and execute it with the interpreter.
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
struct ClassifierArgs {
    /// Additional library function that never receives pointer arrays.
    #[arg(long = "allow", value_name = "NAME")]
    allow: Vec<String>,
}

impl ClassifierArgs {
    fn classifier(&self) -> Classifier {
        let mut allow_list = AllowList::default();
        allow_list.extend(self.allow.iter().cloned());
        Classifier::new(allow_list)
    }
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// Program in JSON form.
    program: PathBuf,

    /// Where to append the largest struct line, e.g. /tmp/struct_size.txt.
    #[arg(long = "struct-report")]
    struct_report: Option<PathBuf>,

    #[command(flatten)]
    classifier: ClassifierArgs,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Emit {
    Json,
    Text,
}

#[derive(Args, Debug)]
struct InstrumentArgs {
    /// Program in JSON form.
    program: PathBuf,

    /// Output path. Prints to stdout if omitted.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Output format.
    #[arg(long = "emit", value_enum, default_value_t = Emit::Json)]
    emit: Emit,

    /// Where to append the library usage report.
    #[arg(long = "lib-report", default_value = DEFAULT_LIB_REPORT_PATH)]
    lib_report: PathBuf,

    #[command(flatten)]
    classifier: ClassifierArgs,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Program in JSON form.
    program: PathBuf,

    /// Summary destination. Defaults to the runtime configuration.
    #[arg(long = "report")]
    report: Option<PathBuf>,

    /// Overwrite the summary instead of appending to it.
    #[arg(long = "truncate")]
    truncate: bool,

    /// Maximum number of executed instructions.
    #[arg(long = "max-steps")]
    max_steps: Option<u64>,

    #[command(flatten)]
    classifier: ClassifierArgs,
}

fn main() -> ExitCode {
    let log_level = std::env::var(LOG_ENV).unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Analyze(args) => analyze(args),
        Commands::Instrument(args) => instrument(args),
        Commands::Run(args) => run(args),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn analyze(args: AnalyzeArgs) -> Result<ExitCode> {
    let module = dynstats::load_module(&args.program)?;
    let report = StaticReport::new(&module, &args.classifier.classifier())?;

    for site in &report.analysis.sites {
        let func = &module.functions[site.location.function];
        println!(
            "{}: {} {} in {} block {}",
            site.location.inst,
            site.kind.name(),
            site.callee,
            func.name,
            site.location.block
        );
    }
    print!("{}", report.library_usage);
    if let Some(line) = report.largest_struct_line() {
        println!("{line}");
    }
    if let Some(path) = &args.struct_report {
        dynstats::write_struct_report(path, &report)?;
    }
    Ok(ExitCode::SUCCESS)
}

fn instrument(args: InstrumentArgs) -> Result<ExitCode> {
    let mut module = dynstats::load_module(&args.program)?;
    let (analysis, summary) = dynstats::instrument(&mut module, &args.classifier.classifier())?;
    dynstats::write_library_report(&args.lib_report, &analysis.library_usage())?;

    let text = match args.emit {
        Emit::Json => module.to_json()?,
        Emit::Text => module.to_string(),
    };
    match &args.output {
        Some(path) => {
            std::fs::write(path, text)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote instrumented program to {}", path.display());
        }
        None => println!("{text}"),
    }
    if !summary.changed() {
        info!("No call site needed instrumentation");
    }
    Ok(ExitCode::SUCCESS)
}

fn run(args: RunArgs) -> Result<ExitCode> {
    let mut module = dynstats::load_module(&args.program)?;
    let (_, summary) = dynstats::instrument(&mut module, &args.classifier.classifier())?;

    let mut config = RuntimeConfig::from_env();
    if let Some(path) = args.report {
        config = config.with_report_path(path);
    }
    if args.truncate {
        config = config.with_open_mode(OpenMode::Truncate);
    }
    let mut interpreter_config = InterpreterConfig::default();
    if let Some(max_steps) = args.max_steps {
        interpreter_config = interpreter_config.with_max_steps(max_steps);
    }

    let runtime = Runtime::new(config);
    let execution = dynstats::run_instrumented(&module, &runtime, &summary, interpreter_config)?;
    info!(
        "Program exited with {} after {} steps",
        execution.exit_value, execution.steps
    );
    if execution.exit_value == 0 {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
