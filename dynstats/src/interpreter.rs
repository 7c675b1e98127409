//! Interpreter for the program representation.
//!
//! Runs the entry function of a module so that instrumented programs can be
//! exercised without a native toolchain. Values are untyped 64-bit integers.
//! Calls to the heap management functions are served by a [`SimHeap`] and calls
//! to the runtime hooks are forwarded to a [`HookSink`].

mod function;
mod heap;

pub use function::FnInterpreter;
pub use heap::SimHeap;

use crate::ir::{Function, Module};
use crate::rewrite::{ATEXIT, Hook};
use anyhow::{Result, anyhow, bail};
use dynstats_rt::HookSink;
use tracing::{debug, info};

/// Base of the addresses given to functions.
const FUNCTION_BASE: u64 = 0xf000_0000_0000_0000;
const FUNCTION_STRIDE: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterConfig {
    /// Instructions and terminators executed before giving up
    pub max_steps: u64,
    pub max_call_depth: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
            max_call_depth: 256,
        }
    }
}

impl InterpreterConfig {
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_call_depth(mut self, max_call_depth: usize) -> Self {
        self.max_call_depth = max_call_depth;
        self
    }
}

/// Outcome of a complete run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Execution {
    /// Value returned by the entry function
    pub exit_value: u64,
    pub steps: u64,
    pub finalizers_run: usize,
}

pub struct Interpreter<'m, 's> {
    module: &'m Module,
    hooks: &'s dyn HookSink,
    heap: SimHeap,
    /// Registered with `atexit`, in registration order
    finalizers: Vec<&'m Function>,
    config: InterpreterConfig,
    steps: u64,
    depth: usize,
}

impl<'m, 's> Interpreter<'m, 's> {
    pub fn new(module: &'m Module, hooks: &'s dyn HookSink, config: InterpreterConfig) -> Self {
        Self {
            module,
            hooks,
            heap: SimHeap::new(),
            finalizers: Vec::new(),
            config,
            steps: 0,
            depth: 0,
        }
    }

    /// Runs the entry function, then every registered finalizer in reverse
    /// registration order.
    ///
    /// # Returns
    /// * `Ok(Execution)` - If the entry function and all finalizers returned
    /// * `Err(anyhow::Error)` - If the module has no entry function or the
    ///   execution fails
    pub fn run(mut self) -> Result<Execution> {
        let module = self.module;
        let entry = module
            .entry_function()
            .map(|idx| &module.functions[idx])
            .ok_or_else(|| anyhow!("Module {} has no entry function", module.name))?;
        info!("Starting interpretation of {}", entry.name);

        let exit_value = self.call(entry, vec![0; entry.params.len()])?;
        info!("{} returned {}", entry.name, exit_value);

        let mut finalizers_run = 0;
        while let Some(finalizer) = self.finalizers.pop() {
            debug!("Running finalizer {}", finalizer.name);
            self.call(finalizer, Vec::new())?;
            finalizers_run += 1;
        }

        Ok(Execution {
            exit_value,
            steps: self.steps,
            finalizers_run,
        })
    }

    pub fn heap(&self) -> &SimHeap {
        &self.heap
    }

    pub(crate) fn step(&mut self) -> Result<()> {
        self.steps += 1;
        if self.steps > self.config.max_steps {
            bail!("Step limit of {} exceeded", self.config.max_steps);
        }
        Ok(())
    }

    pub(crate) fn lookup(&self, name: &str) -> Result<&'m Function> {
        self.module
            .function(name)
            .ok_or_else(|| anyhow!("Call to undefined function '{}'", name))
    }

    pub(crate) fn function_address(&self, name: &str) -> Result<u64> {
        let idx = self
            .module
            .function_index(name)
            .ok_or_else(|| anyhow!("Address of undefined function '{}'", name))?;
        Ok(FUNCTION_BASE + idx as u64 * FUNCTION_STRIDE)
    }

    pub(crate) fn function_at(&self, address: u64) -> Result<&'m Function> {
        let offset = address.wrapping_sub(FUNCTION_BASE);
        if address < FUNCTION_BASE || offset % FUNCTION_STRIDE != 0 {
            bail!("Call through non-function address {:#x}", address);
        }
        let module = self.module;
        usize::try_from(offset / FUNCTION_STRIDE)
            .ok()
            .and_then(|idx| module.functions.get(idx))
            .ok_or_else(|| anyhow!("Call through non-function address {:#x}", address))
    }

    pub(crate) fn call(&mut self, func: &'m Function, args: Vec<u64>) -> Result<u64> {
        if func.is_declaration() {
            return self.call_external(func, &args);
        }
        if args.len() < func.params.len() {
            bail!(
                "Function '{}' expects {} arguments, got {}",
                func.name,
                func.params.len(),
                args.len()
            );
        }
        if self.depth >= self.config.max_call_depth {
            bail!(
                "Call depth limit of {} exceeded calling '{}'",
                self.config.max_call_depth,
                func.name
            );
        }
        self.depth += 1;
        let result = FnInterpreter::new(func, args).run(self);
        self.depth -= 1;
        result
    }

    fn call_external(&mut self, func: &'m Function, args: &[u64]) -> Result<u64> {
        let arg = |idx: usize| -> Result<u64> {
            args.get(idx)
                .copied()
                .ok_or_else(|| anyhow!("Call to '{}' is missing argument {}", func.name, idx))
        };
        let value = match func.name.as_str() {
            "malloc" => self.heap.malloc(arg(0)?),
            "calloc" => self.heap.calloc(arg(0)?, arg(1)?),
            "realloc" => self.heap.realloc(arg(0)?, arg(1)?)?,
            "reallocarray" => self.heap.reallocarray(arg(0)?, arg(1)?, arg(2)?)?,
            "free" => {
                self.heap.free(arg(0)?)?;
                0
            }
            ATEXIT => {
                let finalizer = self.function_at(arg(0)?)?;
                debug!("Registering finalizer {}", finalizer.name);
                self.finalizers.push(finalizer);
                0
            }
            name => match Hook::from_symbol(name) {
                Some(hook) => {
                    self.dispatch(hook, args)?;
                    0
                }
                None => {
                    debug!("Ignoring call to external function {}", name);
                    0
                }
            },
        };
        Ok(value)
    }

    fn dispatch(&self, hook: Hook, args: &[u64]) -> Result<()> {
        let expected = hook.params().len();
        if args.len() < expected {
            bail!(
                "Hook {} called with {} arguments, expected {}",
                hook.symbol(),
                args.len(),
                expected
            );
        }
        let arg = |idx: usize| args[idx] as usize;
        match hook {
            Hook::RecordAllocation => self.hooks.record_allocation(arg(0), arg(1)),
            Hook::RecordReallocation => self.hooks.record_reallocation(arg(0), arg(1), arg(2)),
            Hook::RemoveRange => self.hooks.remove_range(arg(0)),
            Hook::ResolveArraySize => self.hooks.resolve_array_size(arg(0)),
            Hook::DumpSummary => self.hooks.dump_summary(),
        }
        Ok(())
    }
}
