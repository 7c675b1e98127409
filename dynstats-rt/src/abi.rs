//! C entry points called by instrumented programs.
//!
//! The symbols and signatures here are the contract with the rewriter and must
//! not change. Every entry point forwards to one process-wide [`Runtime`],
//! built from the environment by the first hook that runs.

use crate::config::{LOG_ENV, RuntimeConfig};
use crate::runtime::{HookSink, Runtime};
use std::ffi::c_void;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

static SUMMARY_DUMPED: AtomicBool = AtomicBool::new(false);

/// Gets the process runtime, creating it on first use.
pub fn process_runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        init_logging();
        let config = RuntimeConfig::from_env();
        info!(
            "dynstats runtime started, report goes to {}",
            config.report_path().display()
        );
        Runtime::new(config)
    })
}

/// Installs a log subscriber if `DYNSTATS_LOG` is set.
///
/// The host program may own its own subscriber, in which case this is a no-op.
fn init_logging() {
    if let Ok(filter) = std::env::var(LOG_ENV) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn record_allocation(addr: *mut c_void, size: usize) {
    process_runtime().record_allocation(addr as usize, size);
}

#[unsafe(no_mangle)]
pub extern "C" fn record_reallocation(old_addr: *mut c_void, new_addr: *mut c_void, size: usize) {
    process_runtime().record_reallocation(old_addr as usize, new_addr as usize, size);
}

#[unsafe(no_mangle)]
pub extern "C" fn remove_range(addr: *mut c_void) {
    process_runtime().remove_range(addr as usize);
}

#[unsafe(no_mangle)]
pub extern "C" fn resolve_array_size(addr: *mut c_void) {
    process_runtime().resolve_array_size(addr as usize);
}

/// Writes the summary. Registered with `atexit` by the rewriter.
///
/// Only the first call per process writes anything.
#[unsafe(no_mangle)]
pub extern "C" fn dump_summary() {
    if SUMMARY_DUMPED.swap(true, Ordering::AcqRel) {
        return;
    }
    process_runtime().dump_summary();
}
