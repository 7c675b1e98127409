//! dynstats runtime
//!
//! Runtime library linked into programs rewritten by `dynstats`. It tracks the
//! address range of every live heap object, resolves pointers handed to
//! library functions to the size of the array they point into, and writes a
//! summary of both when the process exits.
//!
//! Rust embedders use [`Runtime`] directly. Instrumented native code reaches
//! the runtime through the C entry points in [`abi`].

pub mod abi;
pub mod config;
pub mod registry;
pub mod report;
mod runtime;
pub mod stats;

pub use config::{OpenMode, RuntimeConfig};
pub use registry::RangeRegistry;
pub use runtime::{HookSink, Runtime};
pub use stats::StatSnapshot;
