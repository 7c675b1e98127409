//! Inserts runtime hook calls next to the classified call sites.
//!
//! Rewriting happens in two steps. [`RewritePlan::from_sites`] turns sites into
//! insertions without touching the module, then [`RewritePlan::apply`] splices
//! them in. Anchors are instruction ids, which never change, so applying one
//! insertion cannot invalidate another.

use crate::analysis::{CallSite, SiteKind, SizeExpr};
use crate::ir::{BinOp, Callee, Function, InstId, InstKind, Instruction, Module, Operand, Type};
use anyhow::{Context, Result, anyhow, bail};
use smallvec::{SmallVec, smallvec};
use std::collections::HashMap;
use tracing::{debug, info};

/// Function used to register the summary as a process finalizer.
pub const ATEXIT: &str = "atexit";

/// Runtime entry points. Symbols and signatures are fixed by `dynstats-rt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    RecordAllocation,
    RecordReallocation,
    RemoveRange,
    ResolveArraySize,
    DumpSummary,
}

impl Hook {
    pub const ALL: [Hook; 5] = [
        Hook::RecordAllocation,
        Hook::RecordReallocation,
        Hook::RemoveRange,
        Hook::ResolveArraySize,
        Hook::DumpSummary,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            Hook::RecordAllocation => "record_allocation",
            Hook::RecordReallocation => "record_reallocation",
            Hook::RemoveRange => "remove_range",
            Hook::ResolveArraySize => "resolve_array_size",
            Hook::DumpSummary => "dump_summary",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Hook> {
        Hook::ALL.into_iter().find(|hook| hook.symbol() == symbol)
    }

    pub fn params(self) -> Vec<Type> {
        match self {
            Hook::RecordAllocation => vec![Type::address(), Type::size_type()],
            Hook::RecordReallocation => {
                vec![Type::address(), Type::address(), Type::size_type()]
            }
            Hook::RemoveRange | Hook::ResolveArraySize => vec![Type::address()],
            Hook::DumpSummary => vec![],
        }
    }

    pub fn declaration(self) -> Function {
        Function::declare(self.symbol(), self.params(), Type::Void)
    }
}

fn atexit_declaration() -> Function {
    Function::declare(ATEXIT, vec![Type::address()], Type::Int(32))
}

/// An argument of a planned hook call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedArg {
    Value(Operand),
    /// Needs a `mul` synthesized before the call
    Product(Operand, Operand),
    /// Needs a cast to the generic address type
    Address(Operand),
}

impl From<SizeExpr> for PlannedArg {
    fn from(size: SizeExpr) -> Self {
        match size {
            SizeExpr::Single(value) => PlannedArg::Value(value),
            SizeExpr::Product(lhs, rhs) => PlannedArg::Product(lhs, rhs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Anchor {
    /// Right after the given instruction
    After(InstId),
    /// Before the first instruction of the function
    EntryStart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedCall {
    Hook {
        hook: Hook,
        args: SmallVec<[PlannedArg; 3]>,
    },
    /// `atexit(hook)`
    RegisterFinalizer(Hook),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insertion {
    /// Index into [`Module::functions`]
    pub function: usize,
    pub anchor: Anchor,
    pub call: PlannedCall,
}

/// What [`RewritePlan::apply`] inserted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RewriteSummary {
    pub allocations: usize,
    pub reallocations: usize,
    pub deallocations: usize,
    pub array_resolutions: usize,
    pub finalizer_registered: bool,
    pub inserted_instructions: usize,
}

impl RewriteSummary {
    /// Whether any call site was instrumented.
    pub fn changed(&self) -> bool {
        self.allocations + self.reallocations + self.deallocations + self.array_resolutions > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewritePlan {
    insertions: Vec<Insertion>,
}

impl RewritePlan {
    /// Plans one hook call per site and the finalizer registration.
    pub fn from_sites(module: &Module, sites: &[CallSite]) -> Self {
        let mut insertions: Vec<Insertion> = sites
            .iter()
            .map(|site| {
                let result = Operand::Inst(site.location.inst);
                let (hook, args): (Hook, SmallVec<[PlannedArg; 3]>) = match &site.kind {
                    SiteKind::Allocation { size } => (
                        Hook::RecordAllocation,
                        smallvec![PlannedArg::Value(result), PlannedArg::from(size.clone())],
                    ),
                    SiteKind::Reallocation { old_ptr, size } => (
                        Hook::RecordReallocation,
                        smallvec![
                            PlannedArg::Value(old_ptr.clone()),
                            PlannedArg::Value(result),
                            PlannedArg::from(size.clone())
                        ],
                    ),
                    SiteKind::Deallocation { ptr } => {
                        (Hook::RemoveRange, smallvec![PlannedArg::Value(ptr.clone())])
                    }
                    SiteKind::PointerArrayConsumer { ptr, .. } => (
                        Hook::ResolveArraySize,
                        smallvec![PlannedArg::Address(ptr.clone())],
                    ),
                };
                Insertion {
                    function: site.location.function,
                    anchor: Anchor::After(site.location.inst),
                    call: PlannedCall::Hook { hook, args },
                }
            })
            .collect();

        match module.entry_function() {
            Some(entry) => insertions.push(Insertion {
                function: entry,
                anchor: Anchor::EntryStart,
                call: PlannedCall::RegisterFinalizer(Hook::DumpSummary),
            }),
            None => info!(
                "Module {} has no entry function, the embedding program must call {}",
                module.name,
                Hook::DumpSummary.symbol()
            ),
        }
        Self { insertions }
    }

    pub fn insertions(&self) -> &[Insertion] {
        &self.insertions
    }

    pub fn is_empty(&self) -> bool {
        self.insertions.is_empty()
    }

    /// Splices the planned instructions into `module`.
    ///
    /// Insertions sharing an anchor keep their plan order. The instrumented
    /// calls themselves are left untouched. The rewrite is staged on a copy,
    /// so `module` is only modified if every insertion succeeds.
    pub fn apply(self, module: &mut Module) -> Result<RewriteSummary> {
        let mut staged = module.clone();
        let summary = self.apply_to(&mut staged)?;
        *module = staged;

        info!(
            "Instrumented {} allocations, {} reallocations, {} deallocations and {} shared arrays",
            summary.allocations,
            summary.reallocations,
            summary.deallocations,
            summary.array_resolutions
        );
        Ok(summary)
    }

    fn apply_to(self, module: &mut Module) -> Result<RewriteSummary> {
        let mut summary = RewriteSummary::default();
        declare_runtime(module, &self.insertions)?;

        let mut by_function: HashMap<usize, Vec<Insertion>> = HashMap::new();
        for insertion in self.insertions {
            by_function
                .entry(insertion.function)
                .or_default()
                .push(insertion);
        }

        for (func_idx, insertions) in by_function {
            let Some(func) = module.functions.get_mut(func_idx) else {
                bail!("Insertion refers to missing function #{}", func_idx);
            };
            let mut next_id = func.next_inst_id()?.0;
            let mut pending: HashMap<Anchor, Vec<Instruction>> = HashMap::new();
            for insertion in insertions {
                summary.count(&insertion.call);
                let insts = materialize(insertion.call, &mut next_id)
                    .with_context(|| format!("Cannot instrument function '{}'", func.name))?;
                summary.inserted_instructions += insts.len();
                pending.entry(insertion.anchor).or_default().extend(insts);
            }
            splice(func, pending)?;
        }
        Ok(summary)
    }
}

impl RewriteSummary {
    fn count(&mut self, call: &PlannedCall) {
        match call {
            PlannedCall::Hook { hook, .. } => match hook {
                Hook::RecordAllocation => self.allocations += 1,
                Hook::RecordReallocation => self.reallocations += 1,
                Hook::RemoveRange => self.deallocations += 1,
                Hook::ResolveArraySize => self.array_resolutions += 1,
                Hook::DumpSummary => {}
            },
            PlannedCall::RegisterFinalizer(_) => self.finalizer_registered = true,
        }
    }
}

/// Declares every runtime function the plan calls, reusing matching
/// declarations already in the module.
///
/// Hook symbols must match the runtime signature exactly. An existing `atexit`
/// declaration is reused whatever its parameter types, as programs commonly
/// declare it themselves.
fn declare_runtime(module: &mut Module, insertions: &[Insertion]) -> Result<()> {
    let mut needed: Vec<Function> = Vec::new();
    for insertion in insertions {
        let decls = match insertion.call {
            PlannedCall::Hook { hook, .. } => vec![hook.declaration()],
            PlannedCall::RegisterFinalizer(hook) => vec![atexit_declaration(), hook.declaration()],
        };
        for decl in decls {
            if !needed.iter().any(|known| known.name == decl.name) {
                needed.push(decl);
            }
        }
    }

    for decl in needed {
        match module.function(&decl.name) {
            Some(existing) if existing.is_declaration() && compatible(existing, &decl) => {}
            Some(existing) if existing.is_declaration() => bail!(
                "Existing declaration of '{}' conflicts with the runtime signature",
                existing.name
            ),
            Some(existing) => bail!(
                "Module already defines '{}', which is reserved by the runtime",
                existing.name
            ),
            None => {
                debug!("Declaring runtime function {}", decl.name);
                module.functions.push(decl);
            }
        }
    }
    Ok(())
}

fn compatible(existing: &Function, decl: &Function) -> bool {
    if decl.name == ATEXIT {
        existing.ret == decl.ret
    } else {
        existing.same_signature(decl)
    }
}

/// Builds the instructions of one planned call, numbering them from `next_id`.
fn materialize(call: PlannedCall, next_id: &mut u32) -> Result<Vec<Instruction>> {
    let mut fresh = || -> Result<InstId> {
        let id = *next_id;
        *next_id = id
            .checked_add(1)
            .ok_or_else(|| anyhow!("Ran out of instruction ids"))?;
        Ok(InstId(id))
    };
    let mut insts = Vec::new();
    let (symbol, ty, args) = match call {
        PlannedCall::Hook { hook, args } => {
            let mut operands = Vec::with_capacity(args.len());
            for arg in args {
                let operand = match arg {
                    PlannedArg::Value(value) => value,
                    PlannedArg::Product(lhs, rhs) => {
                        let id = fresh()?;
                        insts.push(Instruction {
                            id,
                            ty: Type::size_type(),
                            kind: InstKind::Binary {
                                bin: BinOp::Mul,
                                lhs,
                                rhs,
                            },
                        });
                        Operand::Inst(id)
                    }
                    PlannedArg::Address(value) => {
                        let id = fresh()?;
                        insts.push(Instruction {
                            id,
                            ty: Type::address(),
                            kind: InstKind::Cast { value },
                        });
                        Operand::Inst(id)
                    }
                };
                operands.push(operand);
            }
            (hook.symbol(), Type::Void, operands)
        }
        PlannedCall::RegisterFinalizer(hook) => (
            ATEXIT,
            Type::Int(32),
            vec![Operand::Func(hook.symbol().to_string())],
        ),
    };
    insts.push(Instruction {
        id: fresh()?,
        ty,
        kind: InstKind::Call {
            callee: Callee::Direct(symbol.to_string()),
            args,
        },
    });
    Ok(insts)
}

fn splice(func: &mut Function, mut pending: HashMap<Anchor, Vec<Instruction>>) -> Result<()> {
    if let Some(prologue) = pending.remove(&Anchor::EntryStart) {
        let Some(entry) = func.blocks.first_mut() else {
            bail!("Function '{}' has no entry block", func.name);
        };
        entry.insts.splice(0..0, prologue);
    }

    for block in &mut func.blocks {
        let old = std::mem::take(&mut block.insts);
        let mut insts = Vec::with_capacity(old.len());
        for inst in old {
            let anchor = Anchor::After(inst.id);
            insts.push(inst);
            if let Some(after) = pending.remove(&anchor) {
                insts.extend(after);
            }
        }
        block.insts = insts;
    }

    if let Some(anchor) = pending.keys().next() {
        bail!("Anchor {:?} not found in function '{}'", anchor, func.name);
    }
    Ok(())
}
