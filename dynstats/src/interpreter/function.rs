use super::Interpreter;
use crate::ir::{
    BinOp, BlockId, Callee, Function, InstId, InstKind, Instruction, Operand, Terminator, Type,
};
use anyhow::{Result, anyhow, bail};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Executes a single function activation.
#[derive(Debug)]
pub struct FnInterpreter<'m> {
    func: &'m Function,
    args: Vec<u64>,
    values: HashMap<InstId, u64>,
    current_block: BlockId,
}

#[derive(Debug)]
pub enum ControlFlow {
    Continue(BlockId),
    Return(u64),
}

impl<'m> FnInterpreter<'m> {
    pub fn new(func: &'m Function, args: Vec<u64>) -> Self {
        Self {
            func,
            args,
            values: HashMap::new(),
            current_block: 0,
        }
    }

    pub fn run(&mut self, machine: &mut Interpreter<'m, '_>) -> Result<u64> {
        let func = self.func;
        debug!("Entering {}", func.name);
        loop {
            let Some(block) = func.blocks.get(self.current_block) else {
                bail!("Function '{}' has no block {}", func.name, self.current_block);
            };
            trace!("Executing block {} of {}", block.label, func.name);

            for inst in &block.insts {
                machine.step()?;
                self.execute_instruction(inst, machine)?;
            }

            machine.step()?;
            match self.execute_terminator(&block.terminator)? {
                ControlFlow::Continue(next_block) => self.current_block = next_block,
                ControlFlow::Return(value) => {
                    debug!("{} returned {}", func.name, value);
                    return Ok(value);
                }
            }
        }
    }

    fn execute_instruction(
        &mut self,
        inst: &'m Instruction,
        machine: &mut Interpreter<'m, '_>,
    ) -> Result<()> {
        let value = match &inst.kind {
            InstKind::Call { callee, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.evaluate_operand(arg, machine))
                    .collect::<Result<Vec<_>>>()?;
                let target = match callee {
                    Callee::Direct(name) => machine.lookup(name)?,
                    Callee::Indirect(target) => {
                        let address = self.evaluate_operand(target, machine)?;
                        machine.function_at(address)?
                    }
                };
                machine.call(target, args)?
            }
            InstKind::Binary { bin, lhs, rhs } => {
                let lhs = self.evaluate_operand(lhs, machine)?;
                let rhs = self.evaluate_operand(rhs, machine)?;
                eval_binary(*bin, lhs, rhs)
            }
            InstKind::Cast { value } => self.evaluate_operand(value, machine)?,
            InstKind::PtrAdd { base, index, scale } => {
                let base = self.evaluate_operand(base, machine)?;
                let index = self.evaluate_operand(index, machine)?;
                base.wrapping_add(index.wrapping_mul(*scale))
            }
        };
        if inst.ty != Type::Void {
            self.values.insert(inst.id, truncate(value, &inst.ty));
        }
        Ok(())
    }

    fn execute_terminator(&mut self, terminator: &Terminator) -> Result<ControlFlow> {
        match terminator {
            Terminator::Ret { value } => {
                let value = match value {
                    Some(operand) => self.evaluate_local(operand)?,
                    None => 0,
                };
                Ok(ControlFlow::Return(value))
            }
            Terminator::Jump { target } => Ok(ControlFlow::Continue(*target)),
            Terminator::Branch {
                cond,
                then,
                otherwise,
            } => {
                let target = if self.evaluate_local(cond)? != 0 {
                    *then
                } else {
                    *otherwise
                };
                Ok(ControlFlow::Continue(target))
            }
        }
    }

    fn evaluate_operand(&self, operand: &Operand, machine: &Interpreter<'m, '_>) -> Result<u64> {
        match operand {
            Operand::Func(name) => machine.function_address(name),
            _ => self.evaluate_local(operand),
        }
    }

    /// Evaluates an operand that does not need module-level information.
    fn evaluate_local(&self, operand: &Operand) -> Result<u64> {
        match operand {
            Operand::Arg(idx) => self.args.get(*idx).copied().ok_or_else(|| {
                anyhow!(
                    "Argument {} out of bounds in '{}' ({} arguments)",
                    idx,
                    self.func.name,
                    self.args.len()
                )
            }),
            Operand::Inst(id) => self
                .values
                .get(id)
                .copied()
                .ok_or_else(|| anyhow!("Use of undefined value {} in '{}'", id, self.func.name)),
            Operand::Const { value, ty } => Ok(truncate(*value, ty)),
            Operand::Null(_) => Ok(0),
            Operand::Func(name) => bail!("Function address @{} is not a local value", name),
        }
    }
}

fn eval_binary(bin: BinOp, lhs: u64, rhs: u64) -> u64 {
    match bin {
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
        BinOp::Mul => lhs.wrapping_mul(rhs),
        BinOp::Eq => u64::from(lhs == rhs),
        BinOp::Ne => u64::from(lhs != rhs),
        BinOp::Ult => u64::from(lhs < rhs),
    }
}

/// Keeps the low bits of `value` that fit in `ty`.
fn truncate(value: u64, ty: &Type) -> u64 {
    match ty {
        Type::Int(bits) if *bits < 64 => value & ((1u64 << bits) - 1),
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_wraps() {
        assert_eq!(eval_binary(BinOp::Sub, 0, 1), u64::MAX);
        assert_eq!(eval_binary(BinOp::Mul, 300, 8), 2400);
        assert_eq!(eval_binary(BinOp::Ult, 1, 2), 1);
        assert_eq!(eval_binary(BinOp::Eq, 1, 2), 0);
    }

    #[test]
    fn test_truncate_to_width() {
        assert_eq!(truncate(u64::MAX, &Type::Int(32)), u32::MAX as u64);
        assert_eq!(truncate(3, &Type::Int(1)), 1);
        assert_eq!(truncate(u64::MAX, &Type::address()), u64::MAX);
    }

    #[test]
    fn test_undefined_value() {
        let func = Function::declare("f", vec![Type::Int(32)], Type::Void);
        let interpreter = FnInterpreter::new(&func, vec![7]);
        assert_eq!(interpreter.evaluate_local(&Operand::Arg(0)).unwrap(), 7);
        let err = interpreter
            .evaluate_local(&Operand::Inst(InstId(3)))
            .unwrap_err();
        assert!(err.to_string().contains("undefined value %3"));
        assert!(interpreter.evaluate_local(&Operand::Arg(1)).is_err());
    }
}
