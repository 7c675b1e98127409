//! Common test utilities and macros

use dynstats::analysis::Classifier;
use dynstats::interpreter::InterpreterConfig;
use dynstats::rewrite::RewriteSummary;
use dynstats_rt::{OpenMode, Runtime, RuntimeConfig};
use std::path::{Path, PathBuf};

/// Step budget for the test programs.
const MAX_STEPS: u64 = 10_000;

#[derive(Debug)]
pub enum TestResult {
    Success,
    /// Summary written when the program exits
    Report(String),
    Instrumented(RewriteSummary),
    Error(String),
    ErrorRegex(String),
}

impl PartialEq for TestResult {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TestResult::Success, TestResult::Success) => true,
            (TestResult::Report(a), TestResult::Report(b)) => a == b,
            (TestResult::Instrumented(a), TestResult::Instrumented(b)) => a == b,
            (TestResult::Error(a), TestResult::Error(b)) => a == b,
            (TestResult::ErrorRegex(pattern), TestResult::Error(msg)) => {
                regex::Regex::new(pattern).unwrap().is_match(msg)
            }
            (TestResult::Error(msg), TestResult::ErrorRegex(pattern)) => {
                regex::Regex::new(pattern).unwrap().is_match(msg)
            }
            _ => false,
        }
    }
}

pub fn input_path(input_file: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("inputs")
        .join(input_file)
}

/// Instruments the program and reports what was inserted.
pub fn run_instrument_test(input_file: &Path) -> TestResult {
    let result = dynstats::load_module(input_file).and_then(|mut module| {
        let (_, summary) = dynstats::instrument(&mut module, &Classifier::default())?;
        // The instrumented program must still be well formed.
        module.validate()?;
        Ok(summary)
    });
    match result {
        Ok(summary) => TestResult::Instrumented(summary),
        Err(e) => TestResult::Error(format!("{e:#}")),
    }
}

/// Instruments and interprets the program, returning the summary it wrote.
pub fn run_program_test(input_file: &Path) -> TestResult {
    let dir = tempfile::tempdir().unwrap();
    let report_path = dir.path().join("dyn_stats.txt");
    let config = RuntimeConfig::new()
        .with_report_path(&report_path)
        .with_open_mode(OpenMode::Truncate);
    let runtime = Runtime::new(config);

    let result = dynstats::load_module(input_file).and_then(|mut module| {
        let (_, summary) = dynstats::instrument(&mut module, &Classifier::default())?;
        let config = InterpreterConfig::default().with_max_steps(MAX_STEPS);
        dynstats::run_instrumented(&module, &runtime, &summary, config)
    });
    match result {
        Ok(_) => match std::fs::read_to_string(&report_path) {
            Ok(report) => TestResult::Report(report),
            Err(e) => TestResult::Error(format!("No report written: {e}")),
        },
        Err(e) => TestResult::Error(format!("{e:#}")),
    }
}

#[macro_export]
macro_rules! check_instrument {
    ($test_name:ident, input=$input_file:expr, result=$expected:expr) => {
        #[test]
        fn $test_name() {
            let input_path = crate::common::input_path($input_file);
            let result = crate::common::run_instrument_test(&input_path);
            assert_eq!(result, $expected);
        }
    };
}

#[macro_export]
macro_rules! check_run {
    ($test_name:ident, input=$input_file:expr, result=$expected:expr) => {
        #[test]
        fn $test_name() {
            let input_path = crate::common::input_path($input_file);
            let result = crate::common::run_program_test(&input_path);
            assert_eq!(result, $expected);
        }
    };
}
