//! Call-site analysis.
//!
//! Finds the calls the rewriter instruments. Only direct calls from function
//! bodies to external declarations are considered: an indirect call has no
//! known target and intrinsics never allocate nor take pointer arrays from
//! program code.

mod classify;
mod library;

pub use classify::{AllowList, CallSite, Classifier, KnownCallee, SiteKind, SizeExpr};
pub use library::LibraryUsage;

use crate::ir::{BlockId, Function, InstId, InstKind, Module, Operand, Type};
use anyhow::Result;
use std::collections::HashMap;
use tracing::{debug, info};

/// Where a call instruction lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteLocation {
    /// Index into [`Module::functions`]
    pub function: usize,
    pub block: BlockId,
    pub inst: InstId,
}

/// A direct call from a function body to an external declaration.
#[derive(Debug, Clone)]
pub struct ExternalCall<'m> {
    pub location: SiteLocation,
    pub callee: &'m Function,
    pub args: &'m [Operand],
    /// Type of every argument, if known
    pub arg_types: Vec<Option<&'m Type>>,
}

/// Counters describing what the scan saw.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub indirect_calls: usize,
    pub intrinsic_calls: usize,
    pub internal_calls: usize,
    pub external_calls: usize,
}

/// Enumerates every call from a defined function to a body-less callee.
pub fn external_calls(module: &Module) -> (Vec<ExternalCall<'_>>, ScanStats) {
    let mut calls = Vec::new();
    let mut stats = ScanStats::default();

    for (func_idx, func) in module.functions.iter().enumerate() {
        if func.is_declaration() {
            continue;
        }
        let values = func.value_types();
        for (block, inst) in func.instructions() {
            let Some((name, args)) = inst.as_direct_call() else {
                if matches!(inst.kind, InstKind::Call { .. }) {
                    debug!("Skipping indirect call {} in {}", inst.id, func.name);
                    stats.indirect_calls += 1;
                }
                continue;
            };
            let Some(callee) = module.function(name) else {
                debug!("Skipping call to unknown function {} in {}", name, func.name);
                continue;
            };
            if callee.is_intrinsic() {
                stats.intrinsic_calls += 1;
                continue;
            }
            if !callee.is_declaration() {
                stats.internal_calls += 1;
                continue;
            }
            stats.external_calls += 1;
            calls.push(ExternalCall {
                location: SiteLocation {
                    function: func_idx,
                    block,
                    inst: inst.id,
                },
                callee,
                args,
                arg_types: args
                    .iter()
                    .map(|arg| func.operand_type(arg, &values))
                    .collect(),
            });
        }
    }
    (calls, stats)
}

/// Result of analysing a whole module.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub sites: Vec<CallSite>,
    pub scan: ScanStats,
}

impl Analysis {
    /// Number of sites of each kind, keyed by kind name.
    pub fn counts(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for site in &self.sites {
            *counts.entry(site.kind.name()).or_insert(0) += 1;
        }
        counts
    }

    pub fn library_usage(&self) -> LibraryUsage {
        LibraryUsage::from_sites(&self.sites)
    }
}

/// Scans and classifies every call site of `module`.
pub fn analyze(module: &Module, classifier: &Classifier) -> Result<Analysis> {
    let (calls, scan) = external_calls(module);
    let mut sites = Vec::new();
    for call in &calls {
        sites.extend(classifier.classify(call)?);
    }
    info!(
        "Found {} instrumentation sites in {} external calls ({} indirect and {} intrinsic calls skipped)",
        sites.len(),
        scan.external_calls,
        scan.indirect_calls,
        scan.intrinsic_calls
    );
    Ok(Analysis { sites, scan })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, Callee, Instruction, Terminator};

    fn call(id: u32, callee: Callee, args: Vec<Operand>) -> Instruction {
        Instruction {
            id: InstId(id),
            ty: Type::Void,
            kind: InstKind::Call { callee, args },
        }
    }

    fn module() -> Module {
        let mut module = Module::new("scan");
        module.functions = vec![
            Function::declare("puts", vec![Type::address()], Type::Int(32)),
            Function::declare("llvm.memcpy", vec![], Type::Void),
            Function {
                name: "helper".into(),
                params: vec![],
                ret: Type::Void,
                blocks: vec![Block {
                    label: "entry".into(),
                    insts: vec![],
                    terminator: Terminator::Ret { value: None },
                }],
            },
            Function {
                name: "main".into(),
                params: vec![Type::address()],
                ret: Type::Void,
                blocks: vec![
                    Block {
                        label: "entry".into(),
                        insts: vec![
                            call(0, Callee::Direct("puts".into()), vec![Operand::Arg(0)]),
                            call(1, Callee::Direct("llvm.memcpy".into()), vec![]),
                            call(2, Callee::Direct("helper".into()), vec![]),
                        ],
                        terminator: Terminator::Jump { target: 1 },
                    },
                    Block {
                        label: "next".into(),
                        insts: vec![call(3, Callee::Indirect(Operand::Arg(0)), vec![])],
                        terminator: Terminator::Ret { value: None },
                    },
                ],
            },
        ];
        module
    }

    #[test]
    fn test_only_external_direct_calls() {
        let module = module();
        let (calls, stats) = external_calls(&module);

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].callee.name, "puts");
        assert_eq!(
            calls[0].location,
            SiteLocation {
                function: 3,
                block: 0,
                inst: InstId(0)
            }
        );
        assert_eq!(calls[0].arg_types, vec![Some(&Type::address())]);
        assert_eq!(
            stats,
            ScanStats {
                indirect_calls: 1,
                intrinsic_calls: 1,
                internal_calls: 1,
                external_calls: 1,
            }
        );
    }
}
