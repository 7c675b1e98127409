//! Textual rendering of the program representation.
//!
//! The syntax loosely follows LLVM assembly and is only meant for humans.

use super::{
    BinOp, Block, Callee, Function, InstKind, Instruction, Module, Operand, Terminator, Type,
};
use std::fmt;

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int(bits) => write!(f, "i{bits}"),
            Type::Ptr(pointee) => write!(f, "{pointee}*"),
            Type::Array { elem, len } => write!(f, "[{len} x {elem}]"),
            Type::Struct(name) => write!(f, "%struct.{name}"),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Arg(idx) => write!(f, "%arg{idx}"),
            Operand::Inst(id) => write!(f, "{id}"),
            Operand::Const { value, ty } => write!(f, "{ty} {value}"),
            Operand::Null(ty) => write!(f, "{ty} null"),
            Operand::Func(name) => write!(f, "@{name}"),
        }
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Eq => "icmp eq",
            BinOp::Ne => "icmp ne",
            BinOp::Ult => "icmp ult",
        };
        f.write_str(name)
    }
}

fn comma_separated(f: &mut fmt::Formatter<'_>, items: &[impl fmt::Display]) -> fmt::Result {
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ty != Type::Void {
            write!(f, "{} = ", self.id)?;
        }
        match &self.kind {
            InstKind::Call { callee, args } => {
                write!(f, "call {} ", self.ty)?;
                match callee {
                    Callee::Direct(name) => write!(f, "@{name}(")?,
                    Callee::Indirect(target) => write!(f, "{target}(")?,
                }
                comma_separated(f, args)?;
                write!(f, ")")
            }
            InstKind::Binary { bin, lhs, rhs } => write!(f, "{bin} {lhs}, {rhs}"),
            InstKind::Cast { value } => write!(f, "bitcast {value} to {}", self.ty),
            InstKind::PtrAdd { base, index, scale } => {
                write!(f, "ptradd {base}, {index} x {scale}")
            }
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Ret { value: None } => write!(f, "ret void"),
            Terminator::Ret { value: Some(value) } => write!(f, "ret {value}"),
            Terminator::Jump { target } => write!(f, "br label %bb{target}"),
            Terminator::Branch {
                cond,
                then,
                otherwise,
            } => write!(f, "br {cond}, label %bb{then}, label %bb{otherwise}"),
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.label)?;
        for inst in &self.insts {
            writeln!(f, "  {inst}")?;
        }
        writeln!(f, "  {}", self.terminator)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = if self.is_declaration() { "declare" } else { "define" };
        write!(f, "{keyword} {} @{}(", self.ret, self.name)?;
        comma_separated(f, &self.params)?;
        if self.is_declaration() {
            return writeln!(f, ")");
        }
        writeln!(f, ") {{")?;
        for (idx, block) in self.blocks.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{block}")?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for def in &self.structs {
            match &def.fields {
                Some(fields) => {
                    write!(f, "%struct.{} = type {{ ", def.name)?;
                    comma_separated(f, fields)?;
                    writeln!(f, " }}")?;
                }
                None => writeln!(f, "%struct.{} = type opaque", def.name)?,
            }
        }
        for func in &self.functions {
            writeln!(f)?;
            write!(f, "{func}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::InstId;

    #[test]
    fn test_type_display() {
        assert_eq!(Type::address().pointer_to().to_string(), "i8**");
        let array = Type::Array {
            elem: Box::new(Type::Int(32)),
            len: 4,
        };
        assert_eq!(array.to_string(), "[4 x i32]");
    }

    #[test]
    fn test_call_display() {
        let inst = Instruction {
            id: InstId(5),
            ty: Type::address(),
            kind: InstKind::Call {
                callee: Callee::Direct("calloc".into()),
                args: vec![Operand::int(300, 64), Operand::Arg(0)],
            },
        };
        assert_eq!(inst.to_string(), "%5 = call i8* @calloc(i64 300, %arg0)");
    }

    #[test]
    fn test_void_call_has_no_result() {
        let inst = Instruction {
            id: InstId(2),
            ty: Type::Void,
            kind: InstKind::Call {
                callee: Callee::Direct("remove_range".into()),
                args: vec![Operand::Inst(InstId(1))],
            },
        };
        assert_eq!(inst.to_string(), "call void @remove_range(%1)");
    }
}
