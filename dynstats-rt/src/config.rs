//! Runtime configuration.
//!
//! The runtime is usually linked into a program that knows nothing about it,
//! so configuration comes from the environment. Embedders and tests build a
//! [`RuntimeConfig`] directly instead.

use std::path::{Path, PathBuf};

/// Default location of the exit-time report.
pub const DEFAULT_REPORT_PATH: &str = "/tmp/dyn_stats.txt";

/// Environment variable overriding the report path.
pub const REPORT_PATH_ENV: &str = "DYNSTATS_REPORT";

/// Environment variable selecting truncate-on-open (`1` or `true`).
pub const TRUNCATE_ENV: &str = "DYNSTATS_TRUNCATE";

/// Environment variable holding the `tracing` filter directive.
pub const LOG_ENV: &str = "DYNSTATS_LOG";

/// How the report file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Reports from every run accumulate in the same file.
    #[default]
    Append,
    /// The file is truncated the first time this process writes to it.
    Truncate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    report_path: PathBuf,
    open_mode: OpenMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            report_path: PathBuf::from(DEFAULT_REPORT_PATH),
            open_mode: OpenMode::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a configuration from `DYNSTATS_REPORT` and `DYNSTATS_TRUNCATE`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(path) = lookup(REPORT_PATH_ENV).filter(|path| !path.is_empty()) {
            config.report_path = PathBuf::from(path);
        }
        if lookup(TRUNCATE_ENV).is_some_and(|value| is_truthy(&value)) {
            config.open_mode = OpenMode::Truncate;
        }
        config
    }

    pub fn with_report_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = path.into();
        self
    }

    pub fn with_open_mode(mut self, mode: OpenMode) -> Self {
        self.open_mode = mode;
        self
    }

    pub fn report_path(&self) -> &Path {
        &self.report_path
    }

    pub fn open_mode(&self) -> OpenMode {
        self.open_mode
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::from_lookup(|_| None);
        assert_eq!(config.report_path(), Path::new(DEFAULT_REPORT_PATH));
        assert_eq!(config.open_mode(), OpenMode::Append);
    }

    #[test]
    fn test_lookup_overrides() {
        let vars = HashMap::from([
            (REPORT_PATH_ENV, "/var/tmp/stats.txt"),
            (TRUNCATE_ENV, "True"),
        ]);
        let config = RuntimeConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.report_path(), Path::new("/var/tmp/stats.txt"));
        assert_eq!(config.open_mode(), OpenMode::Truncate);
    }

    #[test]
    fn test_falsy_truncate_keeps_append() {
        let config = RuntimeConfig::from_lookup(|key| (key == TRUNCATE_ENV).then(|| "0".into()));
        assert_eq!(config.open_mode(), OpenMode::Append);
    }
}
