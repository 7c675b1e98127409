//! Summary of the library functions that receive arrays of pointers.

use super::{CallSite, SiteKind};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryUsage {
    /// Names of the library functions, sorted
    pub functions: BTreeSet<String>,
    /// Number of distinct call instructions passing a pointer array
    pub call_sites: usize,
}

impl LibraryUsage {
    pub fn from_sites(sites: &[CallSite]) -> Self {
        let mut functions = BTreeSet::new();
        let mut calls = HashSet::new();
        for site in sites {
            if let SiteKind::PointerArrayConsumer { .. } = site.kind {
                functions.insert(site.callee.clone());
                calls.insert(site.location);
            }
        }
        Self {
            functions,
            call_sites: calls.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Display for LibraryUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        writeln!(f, "Lib functions:")?;
        for name in &self.functions {
            writeln!(f, "{name}")?;
        }
        writeln!(f, "Total call sites: {}", self.call_sites)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{SiteLocation, SizeExpr};
    use crate::ir::{InstId, Operand};

    fn site(inst: u32, callee: &str, kind: SiteKind) -> CallSite {
        CallSite {
            location: SiteLocation {
                function: 0,
                block: 0,
                inst: InstId(inst),
            },
            callee: callee.to_string(),
            kind,
        }
    }

    fn array(arg_index: usize) -> SiteKind {
        SiteKind::PointerArrayConsumer {
            arg_index,
            ptr: Operand::Arg(arg_index),
        }
    }

    #[test]
    fn test_usage_counts_calls_once() {
        let sites = [
            site(1, "execve", array(1)),
            site(1, "execve", array(2)),
            site(4, "execve", array(1)),
            site(6, "qsort", array(0)),
            site(
                8,
                "malloc",
                SiteKind::Allocation {
                    size: SizeExpr::Single(Operand::int(8, 64)),
                },
            ),
        ];
        let usage = LibraryUsage::from_sites(&sites);
        assert_eq!(usage.call_sites, 3);
        assert_eq!(
            usage.to_string(),
            "Lib functions:\nexecve\nqsort\nTotal call sites: 3\n"
        );
    }

    #[test]
    fn test_empty_usage_renders_nothing() {
        let usage = LibraryUsage::from_sites(&[]);
        assert!(usage.is_empty());
        assert_eq!(usage.to_string(), "");
    }
}
