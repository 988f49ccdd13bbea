use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tracing::trace;

use crate::data::{DataTree, Number};
use crate::output::OutputCollector;
use crate::template::{Instruction, Opcode, Program};
use crate::vm::VmError;
use crate::vm::syscall::{SyscallContext, SyscallTable};

/// Resource budgets of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum depth of the argument stack.
    pub arg_stack: usize,
    /// Maximum combined depth of call frames and scopes.
    pub code_stack: usize,
    /// Maximum number of instructions executed per run.
    pub steps_limit: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            arg_stack: 8192,
            code_stack: 8192,
            steps_limit: 10240,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    Ready,
    Running,
    Faulted,
    Completed,
}

/// Counters of a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunStats {
    pub steps: u64,
    pub output_bytes: usize,
}

#[derive(Debug)]
struct VmState {
    ip: u32,
    steps: u64,
    args: Vec<DataTree>,
    /// Return addresses.
    calls: Vec<u32>,
    /// Loop scopes, innermost last.
    scopes: Vec<DataTree>,
    /// Reused buffer for syscall arguments.
    syscall_args: Vec<DataTree>,
    output_bytes: usize,
    status: VmStatus,
}

impl VmState {
    fn new() -> Self {
        Self {
            ip: 0,
            steps: 0,
            args: Vec::new(),
            calls: Vec::new(),
            scopes: Vec::new(),
            syscall_args: Vec::new(),
            output_bytes: 0,
            status: VmStatus::Ready,
        }
    }

    fn reset(&mut self) {
        self.ip = 0;
        self.steps = 0;
        self.args.clear();
        self.calls.clear();
        self.scopes.clear();
        self.syscall_args.clear();
        self.output_bytes = 0;
        self.status = VmStatus::Ready;
    }

    fn is_clean(&self) -> bool {
        self.ip == 0
            && self.steps == 0
            && self.args.is_empty()
            && self.calls.is_empty()
            && self.scopes.is_empty()
            && self.syscall_args.is_empty()
            && self.output_bytes == 0
            && self.status == VmStatus::Ready
    }
}

/// Resets the state when dropped, whether the run returned or unwound.
struct ResetOnDrop<'a>(&'a mut VmState);

impl Deref for ResetOnDrop<'_> {
    type Target = VmState;

    fn deref(&self) -> &VmState {
        self.0
    }
}

impl DerefMut for ResetOnDrop<'_> {
    fn deref_mut(&mut self) -> &mut VmState {
        self.0
    }
}

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.reset();
    }
}

/// The template virtual machine.
#[derive(Debug)]
pub struct Vm {
    syscalls: Arc<SyscallTable>,
    limits: Limits,
    state: VmState,
    last_status: VmStatus,
}

impl Vm {
    pub fn new(syscalls: Arc<SyscallTable>, limits: Limits) -> Self {
        Self {
            syscalls,
            limits,
            state: VmState::new(),
            last_status: VmStatus::Ready,
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn syscalls(&self) -> &Arc<SyscallTable> {
        &self.syscalls
    }

    /// Current state; always `Ready` outside of `run`.
    pub fn status(&self) -> VmStatus {
        self.state.status
    }

    /// How the previous run ended (`Ready` before the first run).
    pub fn last_status(&self) -> VmStatus {
        self.last_status
    }

    /// True when no state from a previous run is left.
    pub fn is_clean(&self) -> bool {
        self.state.is_clean()
    }

    /// Clear all execution state. Idempotent.
    pub fn reset(&mut self) {
        self.state.reset();
    }

    /// Execute `program` from `ip_start` until `HLT` or a fault.
    ///
    /// The state is reset on entry and on every exit path.
    pub fn run(
        &mut self,
        program: &Program,
        data: &mut DataTree,
        out: &mut dyn OutputCollector,
        ip_start: u32,
    ) -> Result<RunStats, VmError> {
        self.state.reset();
        let mut exec = Exec {
            state: ResetOnDrop(&mut self.state),
            syscalls: &self.syscalls,
            limits: self.limits,
            program,
            data,
            out,
        };
        exec.state.ip = ip_start;
        exec.state.status = VmStatus::Running;
        let result = exec.run();
        self.last_status = match result {
            Ok(_) => VmStatus::Completed,
            Err(_) => VmStatus::Faulted,
        };
        result
    }
}

enum Flow {
    Next,
    Jump(u32),
    Halt,
}

struct Exec<'a> {
    state: ResetOnDrop<'a>,
    syscalls: &'a SyscallTable,
    limits: Limits,
    program: &'a Program,
    data: &'a mut DataTree,
    out: &'a mut dyn OutputCollector,
}

impl<'a> Exec<'a> {
    fn run(&mut self) -> Result<RunStats, VmError> {
        loop {
            let ip = self.state.ip;
            if self.state.steps >= self.limits.steps_limit {
                return Err(VmError::ExecutionLimitReached { ip });
            }
            let ins = *self
                .program
                .instruction(ip)
                .ok_or(VmError::CodeSegmentOverrun { ip })?;
            let op = ins.decode().ok_or(VmError::IllegalOpcode {
                ip,
                opcode: ins.opcode,
            })?;
            self.state.steps += 1;

            match self.step(ip, op, ins)? {
                Flow::Next => self.state.ip = ip + 1,
                Flow::Jump(target) => self.state.ip = target,
                Flow::Halt => break,
            }
        }
        self.state.status = VmStatus::Completed;
        Ok(RunStats {
            steps: self.state.steps,
            output_bytes: self.state.output_bytes,
        })
    }

    fn step(&mut self, ip: u32, op: Opcode, ins: Instruction) -> Result<Flow, VmError> {
        match op {
            Opcode::Hlt => return Ok(Flow::Halt),
            Opcode::Nop => {}
            Opcode::PushNull => self.push(ip, DataTree::Null)?,
            Opcode::PushBool => self.push(ip, DataTree::Bool(ins.arg != 0))?,
            Opcode::PushInt => self.push(ip, DataTree::Int(ins.imm as i64))?,
            Opcode::PushFloat => self.push(ip, DataTree::Float(f64::from_bits(ins.imm)))?,
            Opcode::PushStr => {
                let s = self.string(ip, ins.arg)?.to_string();
                self.push(ip, DataTree::String(s))?;
            }
            Opcode::PushVar => {
                let path = self.string(ip, ins.arg)?;
                let value = self.lookup(path);
                self.push(ip, value)?;
            }
            Opcode::Pop => {
                self.pop(ip)?;
            }
            Opcode::Dup => {
                let top = self.state.args.last().cloned().ok_or(VmError::StackUnderflow { ip })?;
                self.push(ip, top)?;
            }
            Opcode::Swap => {
                let len = self.state.args.len();
                if len < 2 {
                    return Err(VmError::StackUnderflow { ip });
                }
                self.state.args.swap(len - 1, len - 2);
            }

            Opcode::Emit => {
                let value = self.pop(ip)?;
                self.emit(ip, value.to_text().as_bytes())?;
            }
            Opcode::EmitStr => {
                let program = self.program;
                let s = program
                    .string(ins.arg)
                    .ok_or_else(|| bad_constant(ip, ins.arg))?;
                self.emit(ip, s.as_bytes())?;
            }
            Opcode::Concat => {
                let b = self.pop(ip)?;
                let a = self.pop(ip)?;
                let mut s = a.to_text().into_owned();
                s.push_str(&b.to_text());
                self.push(ip, DataTree::String(s))?;
            }

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                let b = self.pop(ip)?.to_number();
                let a = self.pop(ip)?.to_number();
                let result = arithmetic(op, a, b).map_err(|message| VmError::Runtime {
                    ip,
                    message: message.to_string(),
                })?;
                self.push(ip, result)?;
            }
            Opcode::Neg => {
                let a = self.pop(ip)?.to_number();
                let result = match a {
                    Number::Int(n) => n
                        .checked_neg()
                        .map(DataTree::Int)
                        .unwrap_or(DataTree::Float(-(n as f64))),
                    Number::Float(f) => DataTree::Float(-f),
                };
                self.push(ip, result)?;
            }

            Opcode::Eq | Opcode::Ne => {
                let b = self.pop(ip)?;
                let a = self.pop(ip)?;
                let equal = a.loose_eq(&b);
                self.push(ip, DataTree::Bool(if op == Opcode::Eq { equal } else { !equal }))?;
            }
            Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                let b = self.pop(ip)?;
                let a = self.pop(ip)?;
                let ord = a.compare(&b);
                let result = match op {
                    Opcode::Lt => ord.is_lt(),
                    Opcode::Le => ord.is_le(),
                    Opcode::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                };
                self.push(ip, DataTree::Bool(result))?;
            }
            Opcode::Not => {
                let a = self.pop(ip)?;
                self.push(ip, DataTree::Bool(!a.is_truthy()))?;
            }

            Opcode::Jmp => return self.jump(ip, ins.arg),
            Opcode::JmpIfFalse | Opcode::JmpIfTrue => {
                let cond = self.pop(ip)?.is_truthy();
                if cond == (op == Opcode::JmpIfTrue) {
                    return self.jump(ip, ins.arg);
                }
            }

            Opcode::Call => {
                let flow = self.jump(ip, ins.arg)?;
                self.push_call(ip)?;
                return Ok(flow);
            }
            Opcode::Ret => {
                let ret = self.state.calls.pop().ok_or(VmError::StackUnderflow { ip })?;
                return Ok(Flow::Jump(ret));
            }
            Opcode::CallBlock => {
                let name = self.string(ip, ins.arg)?;
                return self.call_block(ip, name);
            }
            Opcode::CallBlockDyn => {
                let name = self.pop(ip)?.to_text().into_owned();
                return self.call_block(ip, &name);
            }

            Opcode::Syscall => self.syscall(ip, ins.arg, ins.imm)?,

            Opcode::Size => {
                let a = self.pop(ip)?;
                self.push(ip, DataTree::Int(a.size() as i64))?;
            }
            Opcode::Index => {
                let key = self.pop(ip)?;
                let container = self.pop(ip)?;
                let value = container.index(&key).cloned().unwrap_or_default();
                self.push(ip, value)?;
            }
            Opcode::PushScope => {
                let value = self.pop(ip)?;
                self.check_code_stack(ip)?;
                self.state.scopes.push(value);
            }
            Opcode::PopScope => {
                self.state.scopes.pop().ok_or(VmError::StackUnderflow { ip })?;
            }
        }
        Ok(Flow::Next)
    }

    fn push(&mut self, ip: u32, value: DataTree) -> Result<(), VmError> {
        if self.state.args.len() >= self.limits.arg_stack {
            return Err(VmError::StackOverflow { ip });
        }
        self.state.args.push(value);
        Ok(())
    }

    fn pop(&mut self, ip: u32) -> Result<DataTree, VmError> {
        self.state.args.pop().ok_or(VmError::StackUnderflow { ip })
    }

    fn check_code_stack(&self, ip: u32) -> Result<(), VmError> {
        if self.state.calls.len() + self.state.scopes.len() >= self.limits.code_stack {
            return Err(VmError::StackOverflow { ip });
        }
        Ok(())
    }

    fn push_call(&mut self, ip: u32) -> Result<(), VmError> {
        self.check_code_stack(ip)?;
        self.state.calls.push(ip + 1);
        Ok(())
    }

    fn jump(&self, ip: u32, target: u32) -> Result<Flow, VmError> {
        if target as usize >= self.program.code().len() {
            return Err(VmError::CodeSegmentOverrun { ip });
        }
        Ok(Flow::Jump(target))
    }

    fn call_block(&mut self, ip: u32, name: &str) -> Result<Flow, VmError> {
        let Some(entry) = self.program.block(name) else {
            return Err(VmError::InvalidCall {
                name: name.to_string(),
                ip,
                location: self.program.location(ip),
            });
        };
        let flow = self.jump(ip, entry)?;
        self.push_call(ip)?;
        Ok(flow)
    }

    fn string(&self, ip: u32, index: u32) -> Result<&'a str, VmError> {
        self.program.string(index).ok_or_else(|| bad_constant(ip, index))
    }

    fn emit(&mut self, ip: u32, bytes: &[u8]) -> Result<(), VmError> {
        self.out
            .collect(bytes)
            .map_err(|source| VmError::Allocation { ip, source })?;
        self.state.output_bytes += bytes.len();
        Ok(())
    }

    /// Resolve a dotted path against the scopes, innermost first, then the
    /// root. `"."` is the innermost scope itself.
    fn lookup(&self, path: &str) -> DataTree {
        if path == "." {
            return self.state.scopes.last().unwrap_or(&*self.data).clone();
        }
        self.state
            .scopes
            .iter()
            .rev()
            .chain(std::iter::once(&*self.data))
            .find_map(|scope| scope.lookup_path(path))
            .cloned()
            .unwrap_or_default()
    }

    fn syscall(&mut self, ip: u32, slot: u32, argc: u64) -> Result<(), VmError> {
        let program = self.program;
        let Some(name) = program.syscall_name(slot) else {
            return Err(VmError::InvalidSyscall {
                name: format!("#{slot}"),
                ip,
                location: None,
            });
        };
        if !self.syscalls.contains(name) {
            return Err(VmError::InvalidSyscall {
                name: name.to_string(),
                ip,
                location: if ip != 0 { program.location(ip) } else { None },
            });
        }

        let argc = usize::try_from(argc).unwrap_or(usize::MAX);
        let depth = self.state.args.len();
        if argc > depth {
            return Err(VmError::StackUnderflow { ip });
        }
        let mut args = std::mem::take(&mut self.state.syscall_args);
        args.clear();
        args.extend(self.state.args.drain(depth - argc..));

        trace!(name, argc, ip, "syscall");
        let mut ctx = SyscallContext {
            data: &mut *self.data,
            ip,
        };
        let result = self.syscalls.call(name, &mut ctx, &args);
        args.clear();
        self.state.syscall_args = args;

        match result {
            Some(Ok(value)) => self.push(ip, value),
            Some(Err(e)) => Err(VmError::Runtime {
                ip,
                message: format!("{name}: {e}"),
            }),
            None => Err(VmError::InvalidSyscall {
                name: name.to_string(),
                ip,
                location: None,
            }),
        }
    }
}

fn bad_constant(ip: u32, index: u32) -> VmError {
    VmError::Runtime {
        ip,
        message: format!("string constant {index} out of range"),
    }
}

fn arithmetic(op: Opcode, a: Number, b: Number) -> Result<DataTree, &'static str> {
    use Number::Int;

    if matches!(op, Opcode::Div | Opcode::Mod) && b.as_f64() == 0.0 {
        return Err("division by zero");
    }
    let result = match (op, a, b) {
        (Opcode::Add, Int(x), Int(y)) => x.checked_add(y).map(DataTree::Int),
        (Opcode::Sub, Int(x), Int(y)) => x.checked_sub(y).map(DataTree::Int),
        (Opcode::Mul, Int(x), Int(y)) => x.checked_mul(y).map(DataTree::Int),
        (Opcode::Div, Int(x), Int(y)) => match x.checked_rem(y) {
            Some(0) => x.checked_div(y).map(DataTree::Int),
            _ => None,
        },
        (Opcode::Mod, Int(x), Int(y)) => x.checked_rem(y).map(DataTree::Int),
        _ => None,
    };
    // Mixed operands, overflow and inexact integer division fall back to floats.
    Ok(result.unwrap_or_else(|| {
        let (x, y) = (a.as_f64(), b.as_f64());
        DataTree::Float(match op {
            Opcode::Add => x + y,
            Opcode::Sub => x - y,
            Opcode::Mul => x * y,
            Opcode::Div => x / y,
            _ => x % y,
        })
    }))
}
