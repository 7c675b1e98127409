//! Program representation consumed and rewritten by the instrumentation pass.
//!
//! A [`Module`] is a set of functions. A function with basic blocks is a
//! definition; one without is an external declaration. Every instruction has
//! a function-unique [`InstId`] that also names its result, so anchors stay
//! valid while new instructions are spliced in.

mod display;
pub mod layout;

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Prefix of compiler intrinsics, which are never instrumented.
pub const INTRINSIC_PREFIX: &str = "llvm.";

/// Name of the entry function when the module does not designate one.
pub const DEFAULT_ENTRY: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Type {
    Void,
    /// Integer with the given bit width
    Int(u32),
    Ptr(Box<Type>),
    Array { elem: Box<Type>, len: u64 },
    /// Named struct, defined in [`Module::structs`]
    Struct(String),
}

impl Type {
    /// `i64`, the type of sizes passed to the runtime.
    pub fn size_type() -> Type {
        Type::Int(64)
    }

    /// `i8*`, the generic address type.
    pub fn address() -> Type {
        Type::Int(8).pointer_to()
    }

    pub fn pointer_to(self) -> Type {
        Type::Ptr(Box::new(self))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Ptr(_))
    }

    /// Whether this is the address of a block of addresses.
    pub fn is_pointer_to_pointer(&self) -> bool {
        matches!(self, Type::Ptr(pointee) if pointee.is_pointer())
    }
}

/// Function-unique instruction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstId(pub u32);

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Index of a basic block within its function.
pub type BlockId = usize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// Function parameter by position
    Arg(usize),
    /// Result of an instruction
    Inst(InstId),
    Const { value: u64, ty: Type },
    /// Null pointer of the given type
    Null(Type),
    /// Address of a function
    Func(String),
}

impl Operand {
    pub fn int(value: u64, bits: u32) -> Self {
        Operand::Const {
            value,
            ty: Type::Int(bits),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Callee {
    Direct(String),
    Indirect(Operand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Eq,
    Ne,
    Ult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InstKind {
    Call {
        callee: Callee,
        #[serde(default)]
        args: Vec<Operand>,
    },
    Binary {
        bin: BinOp,
        lhs: Operand,
        rhs: Operand,
    },
    /// Reinterprets `value` as the instruction's type
    Cast { value: Operand },
    /// `base + index * scale`
    PtrAdd {
        base: Operand,
        index: Operand,
        scale: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: InstId,
    /// Result type, `void` for instructions without a result
    #[serde(default = "void")]
    pub ty: Type,
    #[serde(flatten)]
    pub kind: InstKind,
}

fn void() -> Type {
    Type::Void
}

impl Instruction {
    /// Returns the callee name and arguments of a direct call.
    pub fn as_direct_call(&self) -> Option<(&str, &[Operand])> {
        match &self.kind {
            InstKind::Call {
                callee: Callee::Direct(name),
                args,
            } => Some((name, args)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Terminator {
    Ret {
        #[serde(default)]
        value: Option<Operand>,
    },
    Jump {
        target: BlockId,
    },
    /// Goes to `then` if `cond` is non-zero
    Branch {
        cond: Operand,
        then: BlockId,
        #[serde(rename = "else")]
        otherwise: BlockId,
    },
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Ret { .. } => vec![],
            Terminator::Jump { target } => vec![*target],
            Terminator::Branch {
                then, otherwise, ..
            } => vec![*then, *otherwise],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub label: String,
    #[serde(default)]
    pub insts: Vec<Instruction>,
    pub terminator: Terminator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Type>,
    #[serde(default = "void")]
    pub ret: Type,
    #[serde(default)]
    pub blocks: Vec<Block>,
}

impl Function {
    /// Creates an external declaration.
    pub fn declare(name: impl Into<String>, params: Vec<Type>, ret: Type) -> Self {
        Self {
            name: name.into(),
            params,
            ret,
            blocks: Vec::new(),
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn is_intrinsic(&self) -> bool {
        self.name.starts_with(INTRINSIC_PREFIX)
    }

    /// Whether `other` has the same parameter and return types.
    pub fn same_signature(&self, other: &Function) -> bool {
        self.params == other.params && self.ret == other.ret
    }

    /// Iterates over `(block, instruction)` pairs in layout order.
    pub fn instructions(&self) -> impl Iterator<Item = (BlockId, &Instruction)> {
        self.blocks
            .iter()
            .enumerate()
            .flat_map(|(idx, block)| block.insts.iter().map(move |inst| (idx, inst)))
    }

    /// Returns an id above every instruction id of this function.
    ///
    /// Fails if the function already uses the largest representable id.
    pub fn next_inst_id(&self) -> Result<InstId> {
        match self.instructions().map(|(_, inst)| inst.id.0).max() {
            None => Ok(InstId(0)),
            Some(max) => max
                .checked_add(1)
                .map(InstId)
                .ok_or_else(|| anyhow!("Function '{}' has no instruction ids left", self.name)),
        }
    }

    /// Maps every instruction result to its type.
    pub fn value_types(&self) -> HashMap<InstId, &Type> {
        self.instructions()
            .map(|(_, inst)| (inst.id, &inst.ty))
            .collect()
    }

    /// Resolves the type of `operand` using a table from [`Self::value_types`].
    pub fn operand_type<'a>(
        &'a self,
        operand: &'a Operand,
        values: &HashMap<InstId, &'a Type>,
    ) -> Option<&'a Type> {
        match operand {
            Operand::Arg(idx) => self.params.get(*idx),
            Operand::Inst(id) => values.get(id).copied(),
            Operand::Const { ty, .. } | Operand::Null(ty) => Some(ty),
            Operand::Func(_) => None,
        }
    }
}

/// Struct definition. `fields: None` marks an opaque struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    #[serde(default)]
    pub fields: Option<Vec<Type>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    /// Entry function; defaults to `main`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    #[serde(default)]
    pub structs: Vec<StructDef>,
    #[serde(default)]
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry: None,
            structs: Vec::new(),
            functions: Vec::new(),
        }
    }

    /// Parses a module from its JSON form and validates it.
    pub fn from_json(text: &str) -> Result<Self> {
        let module: Module = serde_json::from_str(text)?;
        module.validate()?;
        Ok(module)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|func| func.name == name)
    }

    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|func| func.name == name)
    }

    pub fn struct_def(&self, name: &str) -> Option<&StructDef> {
        self.structs.iter().find(|def| def.name == name)
    }

    /// Index of the entry function, if the module has one with a body.
    ///
    /// Libraries have no entry function.
    pub fn entry_function(&self) -> Option<usize> {
        let name = self.entry.as_deref().unwrap_or(DEFAULT_ENTRY);
        self.function_index(name)
            .filter(|&idx| !self.functions[idx].is_declaration())
    }

    /// Checks the structural rules the analysis and interpreter rely on.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for func in &self.functions {
            if !names.insert(func.name.as_str()) {
                bail!("Function '{}' is defined more than once", func.name);
            }
        }
        if let Some(entry) = &self.entry {
            if self.function(entry).is_none() {
                bail!("Entry function '{}' not found", entry);
            }
        }
        for func in &self.functions {
            self.validate_function(func)?;
        }
        Ok(())
    }

    fn validate_function(&self, func: &Function) -> Result<()> {
        let mut ids = HashSet::new();
        for (block_idx, inst) in func.instructions() {
            if !ids.insert(inst.id) {
                bail!(
                    "Instruction {} appears twice in function '{}'",
                    inst.id,
                    func.name
                );
            }
            if let Some((callee, _)) = inst.as_direct_call() {
                if self.function(callee).is_none() {
                    bail!(
                        "Call to undeclared function '{}' in '{}' block {}",
                        callee,
                        func.name,
                        block_idx
                    );
                }
            }
        }
        for block in &func.blocks {
            for target in block.terminator.successors() {
                if target >= func.blocks.len() {
                    bail!(
                        "Block '{}' of '{}' jumps to missing block {}",
                        block.label,
                        func.name,
                        target
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: u32, ty: Type, callee: &str, args: Vec<Operand>) -> Instruction {
        Instruction {
            id: InstId(id),
            ty,
            kind: InstKind::Call {
                callee: Callee::Direct(callee.to_string()),
                args,
            },
        }
    }

    fn sample() -> Module {
        let mut module = Module::new("sample");
        module.functions.push(Function::declare(
            "malloc",
            vec![Type::size_type()],
            Type::address(),
        ));
        module.functions.push(Function {
            name: "main".into(),
            params: vec![],
            ret: Type::Int(32),
            blocks: vec![Block {
                label: "entry".into(),
                insts: vec![call(
                    3,
                    Type::address(),
                    "malloc",
                    vec![Operand::int(16, 64)],
                )],
                terminator: Terminator::Ret {
                    value: Some(Operand::int(0, 32)),
                },
            }],
        });
        module
    }

    #[test]
    fn test_pointer_to_pointer() {
        assert!(Type::address().pointer_to().is_pointer_to_pointer());
        assert!(!Type::address().is_pointer_to_pointer());
        assert!(!Type::Int(64).is_pointer_to_pointer());
    }

    #[test]
    fn test_json_round_trip_shape() {
        let text = r#"{
            "name": "m",
            "functions": [
                {"name": "free", "params": [{"ptr": {"int": 8}}]},
                {"name": "main", "ret": {"int": 32}, "blocks": [
                    {"label": "entry", "insts": [
                        {"id": 0, "op": "call", "callee": {"direct": "free"},
                         "args": [{"null": {"ptr": {"int": 8}}}]}
                    ], "terminator": {"op": "ret", "value": {"const": {"value": 0, "ty": {"int": 32}}}}}
                ]}
            ]
        }"#;
        let module = Module::from_json(text).unwrap();
        let main = module.function("main").unwrap();
        assert_eq!(main.blocks[0].insts[0].ty, Type::Void);
        assert_eq!(
            main.blocks[0].insts[0].as_direct_call().map(|(name, _)| name),
            Some("free")
        );
        assert!(module.function("free").unwrap().is_declaration());

        let reparsed = Module::from_json(&module.to_json().unwrap()).unwrap();
        assert_eq!(reparsed, module);
    }

    #[test]
    fn test_entry_function() {
        let mut module = sample();
        assert_eq!(module.entry_function(), Some(1));

        module.functions.retain(|func| func.name != "main");
        assert_eq!(module.entry_function(), None);
    }

    #[test]
    fn test_next_inst_id() {
        let module = sample();
        let next = |name: &str| module.function(name).unwrap().next_inst_id().unwrap();
        assert_eq!(next("main"), InstId(4));
        assert_eq!(next("malloc"), InstId(0));
    }

    #[test]
    fn test_next_inst_id_exhausted() {
        let mut module = sample();
        let main = module.functions.iter_mut().find(|f| f.name == "main").unwrap();
        main.blocks[0].insts[0].id = InstId(u32::MAX);
        let err = main.next_inst_id().unwrap_err();
        assert!(err.to_string().contains("no instruction ids left"));
    }

    #[test]
    fn test_validate_undeclared_callee() {
        let mut module = sample();
        module.functions.remove(0);
        let err = module.validate().unwrap_err();
        assert!(err.to_string().contains("undeclared function 'malloc'"));
    }

    #[test]
    fn test_validate_duplicate_ids() {
        let mut module = sample();
        let main = &mut module.functions[1];
        let dup = main.blocks[0].insts[0].clone();
        main.blocks[0].insts.push(dup);
        assert!(module.validate().is_err());
    }

    #[test]
    fn test_validate_missing_block() {
        let mut module = sample();
        module.functions[1].blocks[0].terminator = Terminator::Jump { target: 7 };
        let err = module.validate().unwrap_err();
        assert!(err.to_string().contains("missing block 7"));
    }

    #[test]
    fn test_operand_type() {
        let module = sample();
        let main = module.function("main").unwrap();
        let values = main.value_types();
        assert_eq!(
            main.operand_type(&Operand::Inst(InstId(3)), &values),
            Some(&Type::address())
        );
        assert_eq!(main.operand_type(&Operand::Arg(0), &values), None);
    }
}
