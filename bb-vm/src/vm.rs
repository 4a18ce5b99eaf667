use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::alu::Flags;
use crate::bytecode::{GENERAL_REGISTERS, Instruction, Opcode, Operand, Program, Register};
use crate::debug_info::DebugInfo;
use crate::memory::Memory;
use crate::settings::Settings;
use crate::value::{BinaryOp, UnaryOp, Value, ValueType};

mod diagnostics;
mod external;
mod user_call;

pub use diagnostics::{disassemble, render_fault};
pub use external::{
    AsyncFunction, ExternalContext, ExternalFunction, ExternalFunctionTable, ExternalOutcome,
    ManagedFunction, Signature, SyncFunction,
};
pub use user_call::{HOST_RETURN_ADDRESS, UserCall};

/// Longest message a `crash` instruction reads from memory, in UTF-16 units.
pub const CRASH_MESSAGE_LIMIT: usize = 256;

#[derive(Clone, Debug, PartialEq)]
pub enum VmError {
    StackOverflow,
    StackUnderflow,
    OutOfMemory {
        requested: usize,
    },
    InvalidFree(u32),
    HeapCorrupted(usize),
    MemoryOutOfBounds {
        address: i64,
        len: usize,
    },
    DivisionByZero,
    InvalidShift(i64),
    InvalidCast {
        from: ValueType,
        to: ValueType,
    },
    TypeMismatch(&'static str),
    MalformedInstruction(String),
    InvalidJump(i64),
    UnknownExternal(i32),
    ExternalFailed(String),
    UserCrash(String),
    InstructionLimitExceeded(u64),
    UnknownExposedFunction(String),
    ArgumentCountMismatch {
        function: String,
        expected: usize,
        got: usize,
    },
    Faulted,
    WaitingForInput,
    NoPendingRequest,
    InvalidSettings(String),
    Internal(String),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::StackOverflow => write!(f, "stack overflow"),
            VmError::StackUnderflow => write!(f, "stack underflow"),
            VmError::OutOfMemory { requested } => {
                write!(f, "out of memory allocating {requested} bytes")
            }
            VmError::InvalidFree(pointer) => write!(f, "invalid free of pointer {pointer}"),
            VmError::HeapCorrupted(header) => write!(f, "corrupted heap block at {header}"),
            VmError::MemoryOutOfBounds { address, len } => {
                write!(f, "memory access out of bounds: {len} bytes at {address}")
            }
            VmError::DivisionByZero => write!(f, "division by zero"),
            VmError::InvalidShift(amount) => write!(f, "invalid shift amount {amount}"),
            VmError::InvalidCast { from, to } => write!(f, "cannot cast {from} to {to}"),
            VmError::TypeMismatch(expected) => write!(f, "type mismatch: expected {expected}"),
            VmError::MalformedInstruction(message) => {
                write!(f, "malformed instruction: {message}")
            }
            VmError::InvalidJump(target) => write!(f, "invalid jump target {target}"),
            VmError::UnknownExternal(id) => write!(f, "unknown external function {id}"),
            VmError::ExternalFailed(message) => write!(f, "external function failed: {message}"),
            VmError::UserCrash(message) => write!(f, "program crashed: {message}"),
            VmError::InstructionLimitExceeded(limit) => {
                write!(f, "instruction limit of {limit} exceeded")
            }
            VmError::UnknownExposedFunction(name) => write!(f, "no exposed function '{name}'"),
            VmError::ArgumentCountMismatch {
                function,
                expected,
                got,
            } => write!(
                f,
                "'{function}' takes {expected} argument(s), got {got}"
            ),
            VmError::Faulted => write!(f, "interpreter has faulted"),
            VmError::WaitingForInput => write!(f, "interpreter is waiting for input"),
            VmError::NoPendingRequest => write!(f, "no external request is pending"),
            VmError::InvalidSettings(message) => write!(f, "invalid settings: {message}"),
            VmError::Internal(message) => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for VmError {}

pub type VmResult<T> = Result<T, VmError>;

/// Terminal error with the machine state at the faulting instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeFault {
    pub error: VmError,
    pub ip: usize,
    pub stack_pointer: usize,
    pub base_pointer: usize,
    pub instruction: Option<String>,
    /// Entry offsets of the active frames, outermost first.
    pub call_trace: Vec<usize>,
}

impl fmt::Display for RuntimeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at ip {} (sp {}, bp {})",
            self.error, self.ip, self.stack_pointer, self.base_pointer
        )?;
        if let Some(instruction) = &self.instruction {
            write!(f, " in `{instruction}`")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionState {
    Ready,
    Running,
    Done,
    Faulted(RuntimeFault),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    WaitingForInput,
}

/// An asynchronous external call waiting for the host's answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputRequest {
    pub function_id: i32,
    pub name: Option<String>,
    pub returns: Option<ValueType>,
}

/// Machine state of the interrupted code, restored when the exposed call
/// returns.
struct ActiveCall {
    call: Rc<UserCall>,
    resume_ip: usize,
    stack_before: usize,
    registers: [Value; GENERAL_REGISTERS],
    flags: Flags,
}

pub struct Interpreter {
    settings: Settings,
    program: Program,
    memory: Memory,
    externals: ExternalFunctionTable,
    registers: [Value; GENERAL_REGISTERS],
    flags: Flags,
    ip: usize,
    state: ExecutionState,
    paused: bool,
    pending_input: Option<InputRequest>,
    delay: u32,
    frames: Vec<usize>,
    user_calls: VecDeque<Rc<UserCall>>,
    active_call: Option<ActiveCall>,
    next_call_id: u64,
    executed: u64,
}

fn operand(operand: Option<Operand>, opcode: Opcode) -> VmResult<Operand> {
    operand.ok_or_else(|| {
        VmError::MalformedInstruction(format!("{}: missing operand", opcode.mnemonic()))
    })
}

impl Interpreter {
    pub fn new(
        settings: Settings,
        program: Program,
        externals: ExternalFunctionTable,
    ) -> VmResult<Self> {
        settings.validate()?;
        let memory = Memory::new(settings.heap_size, settings.stack_size, &program.data)?;
        if let Some(function) = program
            .exposed
            .iter()
            .find(|function| function.offset >= program.code.len())
        {
            return Err(VmError::InvalidJump(function.offset as i64));
        }
        Ok(Self {
            settings,
            program,
            memory,
            externals,
            registers: [Value::Null; GENERAL_REGISTERS],
            flags: Flags::default(),
            ip: 0,
            state: ExecutionState::Ready,
            paused: false,
            pending_input: None,
            delay: 0,
            frames: Vec::new(),
            user_calls: VecDeque::new(),
            active_call: None,
            next_call_id: 0,
            executed: 0,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn debug_info(&self) -> Option<&DebugInfo> {
        self.program.debug.as_ref()
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn registers(&self) -> &[Value; GENERAL_REGISTERS] {
        &self.registers
    }

    pub fn register(&self, register: Register) -> Value {
        match register.general_index() {
            Some(index) => self.registers[index],
            None if register == Register::Sp => Value::I32(self.memory.stack_pointer() as i32),
            None => Value::I32(self.memory.base_pointer() as i32),
        }
    }

    pub fn set_register(&mut self, register: Register, value: Value) -> VmResult<()> {
        if let Some(index) = register.general_index() {
            self.registers[index] = value;
            return Ok(());
        }
        if register == Register::Bp {
            return Err(VmError::MalformedInstruction(
                "bp is read-only".to_string(),
            ));
        }
        let pointer = value
            .as_i64()
            .ok_or(VmError::TypeMismatch("integer stack pointer"))?;
        let pointer = usize::try_from(pointer).map_err(|_| VmError::StackUnderflow)?;
        self.memory.set_stack_pointer(pointer)
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn instructions_executed(&self) -> u64 {
        self.executed
    }

    pub fn pending_input(&self) -> Option<&InputRequest> {
        self.pending_input.as_ref()
    }

    pub fn delay_remaining(&self) -> u32 {
        self.delay
    }

    pub fn queued_calls(&self) -> usize {
        self.user_calls.len()
    }

    pub fn externals(&self) -> &ExternalFunctionTable {
        &self.externals
    }

    /// True once the program finished or faulted.
    pub fn is_done(&self) -> bool {
        matches!(
            self.state,
            ExecutionState::Done | ExecutionState::Faulted(_)
        )
    }

    pub fn is_paused(&self) -> bool {
        self.paused || self.pending_input.is_some() || self.delay > 0
    }

    /// Executes a single instruction. Does nothing while waiting for input or
    /// a delay; delays only elapse through `tick`.
    pub fn step(&mut self) -> Result<(), RuntimeFault> {
        if let ExecutionState::Faulted(fault) = &self.state {
            return Err(fault.clone());
        }
        match self.state {
            ExecutionState::Done => return Ok(()),
            ExecutionState::Ready => self.state = ExecutionState::Running,
            _ => {}
        }
        self.paused = false;
        if self.pending_input.is_some() || self.delay > 0 {
            return Ok(());
        }
        self.step_internal().map_err(|error| self.raise(error))
    }

    /// Runs up to `instructions_per_tick` instructions, stopping early at a
    /// break, a pending request, a delay or the end of the program. Returns
    /// whether there is more work to do.
    pub fn tick(&mut self) -> Result<bool, RuntimeFault> {
        if let ExecutionState::Faulted(fault) = &self.state {
            return Err(fault.clone());
        }
        if self.is_done() {
            return Ok(false);
        }
        if self.pending_input.is_some() {
            return Ok(true);
        }
        if self.delay > 0 {
            self.delay -= 1;
            return Ok(true);
        }
        for _ in 0..self.settings.instructions_per_tick {
            self.step()?;
            if self.is_done() || self.is_paused() {
                break;
            }
        }
        Ok(!self.is_done())
    }

    pub fn run_until_completion(&mut self) -> Result<RunStatus, RuntimeFault> {
        loop {
            if let ExecutionState::Faulted(fault) = &self.state {
                return Err(fault.clone());
            }
            if self.is_done() {
                return Ok(RunStatus::Completed);
            }
            if self.pending_input.is_some() {
                return Ok(RunStatus::WaitingForInput);
            }
            self.tick()?;
        }
    }

    /// Answers the pending asynchronous request; the value becomes the
    /// external call's result.
    pub fn complete_pending(&mut self, value: Option<Value>) -> VmResult<()> {
        if matches!(self.state, ExecutionState::Faulted(_)) {
            return Err(VmError::Faulted);
        }
        let request = self
            .pending_input
            .take()
            .ok_or(VmError::NoPendingRequest)?;
        debug!(id = request.function_id, ?value, "pending request completed");
        if let Err(error) = self.push_result(request.function_id, request.returns, value) {
            self.raise(error.clone());
            return Err(error);
        }
        Ok(())
    }

    pub fn provide_input(&mut self, value: Value) -> VmResult<()> {
        self.complete_pending(Some(value))
    }

    /// Queues a call to an exposed function. It starts once no frame is
    /// active, after every call queued before it.
    pub fn call(&mut self, name: &str, arguments: &[Value]) -> VmResult<Rc<UserCall>> {
        if matches!(self.state, ExecutionState::Faulted(_)) {
            return Err(VmError::Faulted);
        }
        self.next_call_id += 1;
        let call = Rc::new(UserCall::prepare(
            self.next_call_id,
            &self.program,
            name,
            arguments,
        )?);
        debug!(id = call.id(), function = name, "exposed call queued");
        self.user_calls.push_back(Rc::clone(&call));
        if self.state == ExecutionState::Done {
            self.state = ExecutionState::Running;
        }
        Ok(call)
    }

    /// Queues a call and ticks until it completes.
    pub fn call_sync(&mut self, name: &str, arguments: &[Value]) -> VmResult<Option<Value>> {
        let call = self.call(name, arguments)?;
        loop {
            if call.is_completed() {
                return call.return_value();
            }
            if let ExecutionState::Faulted(fault) = &self.state {
                return Err(fault.error.clone());
            }
            if self.is_done() {
                return Err(VmError::Internal(format!(
                    "program ended before '{name}' returned"
                )));
            }
            if self.pending_input.is_some() {
                return Err(VmError::WaitingForInput);
            }
            self.tick().map_err(|fault| fault.error)?;
        }
    }

    fn raise(&mut self, error: VmError) -> RuntimeFault {
        let fault = RuntimeFault {
            error,
            ip: self.ip,
            stack_pointer: self.memory.stack_pointer(),
            base_pointer: self.memory.base_pointer(),
            instruction: self.program.code.get(self.ip).map(ToString::to_string),
            call_trace: self.frames.clone(),
        };
        warn!(ip = fault.ip, error = %fault.error, "runtime fault");
        self.state = ExecutionState::Faulted(fault.clone());
        fault
    }

    fn step_internal(&mut self) -> VmResult<()> {
        if self.frames.is_empty() && self.active_call.is_none() && !self.user_calls.is_empty() {
            return self.start_user_call();
        }
        let Some(instruction) = self.program.code.get(self.ip).copied() else {
            return self.finish_top_level();
        };
        if let Some(limit) = self.settings.max_instructions
            && self.executed >= limit
        {
            return Err(VmError::InstructionLimitExceeded(limit));
        }
        trace!(ip = self.ip, %instruction, "dispatch");
        self.executed += 1;
        self.execute(instruction)
    }

    fn finish_top_level(&mut self) -> VmResult<()> {
        if !self.frames.is_empty() {
            return Err(VmError::InvalidJump(self.ip as i64));
        }
        if self.user_calls.is_empty() {
            debug!(executed = self.executed, "program finished");
            self.state = ExecutionState::Done;
        }
        Ok(())
    }

    fn exit(&mut self) {
        debug!(ip = self.ip, dropped_calls = self.user_calls.len(), "exit");
        self.ip = self.program.code.len();
        self.frames.clear();
        self.active_call = None;
        self.user_calls.clear();
        self.memory.reset_stack();
        self.state = ExecutionState::Done;
    }

    fn execute(&mut self, instruction: Instruction) -> VmResult<()> {
        instruction.validate()?;
        let opcode = instruction.opcode;
        let first = || operand(instruction.operand1, opcode);
        let second = || operand(instruction.operand2, opcode);
        let mut next_ip = self.ip + 1;

        match opcode {
            Opcode::Nop => {}
            Opcode::Exit => {
                self.exit();
                return Ok(());
            }
            Opcode::Break => self.paused = true,
            Opcode::Crash => return Err(VmError::UserCrash(self.crash_message(first()?))),
            Opcode::Jump => next_ip = self.jump_target(first()?)?,
            Opcode::JumpIfEqual
            | Opcode::JumpIfNotEqual
            | Opcode::JumpIfLess
            | Opcode::JumpIfLessOrEqual
            | Opcode::JumpIfGreater
            | Opcode::JumpIfGreaterOrEqual
            | Opcode::JumpIfBelow
            | Opcode::JumpIfAbove => {
                if self.condition_holds(opcode) {
                    next_ip = self.jump_target(first()?)?;
                }
            }
            Opcode::Call => {
                let target = self.jump_target(first()?)?;
                let return_address = i32::try_from(next_ip)
                    .map_err(|_| VmError::InvalidJump(next_ip as i64))?;
                self.memory.enter_frame(return_address)?;
                self.frames.push(target);
                debug!(from = self.ip, to = target, depth = self.frames.len(), "call");
                next_ip = target;
            }
            Opcode::Return => next_ip = self.return_from_frame()?,
            Opcode::CallExternal => self.call_external(first()?)?,
            Opcode::Push => {
                let value = self.read_operand(first()?)?;
                self.memory.push_value(value)?;
            }
            Opcode::Pop8 | Opcode::Pop16 | Opcode::Pop32 | Opcode::Pop64 => {
                let width = pop_width(opcode)?;
                self.memory.pop_bytes(width)?;
            }
            Opcode::PopTo8 | Opcode::PopTo16 | Opcode::PopTo32 | Opcode::PopTo64 => {
                let bytes = self.memory.pop_bytes(pop_width(opcode)?)?;
                self.store_popped(first()?, &bytes)?;
            }
            Opcode::Move => {
                let value = self.read_operand(second()?)?;
                self.write_operand(first()?, value)?;
            }
            Opcode::MathAdd => self.arithmetic(BinaryOp::Add, first()?, second()?)?,
            Opcode::MathSub => self.arithmetic(BinaryOp::Sub, first()?, second()?)?,
            Opcode::MathMul => self.arithmetic(BinaryOp::Mul, first()?, second()?)?,
            Opcode::MathDiv => self.arithmetic(BinaryOp::Div, first()?, second()?)?,
            Opcode::MathMod => self.arithmetic(BinaryOp::Rem, first()?, second()?)?,
            Opcode::BitsAnd => self.arithmetic(BinaryOp::And, first()?, second()?)?,
            Opcode::BitsOr => self.arithmetic(BinaryOp::Or, first()?, second()?)?,
            Opcode::BitsXor => self.arithmetic(BinaryOp::Xor, first()?, second()?)?,
            Opcode::BitsShl => self.arithmetic(BinaryOp::Shl, first()?, second()?)?,
            Opcode::BitsShr => self.arithmetic(BinaryOp::Shr, first()?, second()?)?,
            Opcode::BitsNot => self.unary(UnaryOp::Not, first()?)?,
            Opcode::MathNeg => self.unary(UnaryOp::Neg, first()?)?,
            Opcode::Compare => {
                let lhs = self.read_operand(first()?)?;
                let rhs = self.read_operand(second()?)?;
                self.flags = lhs.compare(rhs)?;
            }
            Opcode::IntToFloat => {
                let target = first()?;
                let value = match self.read_operand(target)? {
                    Value::F32(value) => Value::F32(value),
                    other => other.wrapping_cast(ValueType::F32),
                };
                self.write_raw(target, value)?;
            }
            Opcode::FloatToInt => {
                let target = first()?;
                let value = self.read_operand(target)?;
                if value.ty() != ValueType::F32 {
                    return Err(VmError::TypeMismatch("f32"));
                }
                self.write_raw(target, value.wrapping_cast(ValueType::I32))?;
            }
            Opcode::Allocate => {
                let size = self
                    .read_operand(second()?)?
                    .as_i64()
                    .ok_or(VmError::TypeMismatch("integer size"))?;
                let size = usize::try_from(size)
                    .map_err(|_| VmError::TypeMismatch("non-negative size"))?;
                let pointer = self.memory.allocate(size)?;
                self.write_operand(first()?, Value::I32(pointer as i32))?;
            }
            Opcode::Free => {
                let pointer = self
                    .read_operand(first()?)?
                    .as_i64()
                    .ok_or(VmError::TypeMismatch("integer pointer"))?;
                let pointer = u32::try_from(pointer)
                    .map_err(|_| VmError::InvalidFree(pointer as u32))?;
                self.memory.free(pointer)?;
            }
        }

        self.ip = next_ip;
        Ok(())
    }

    fn condition_holds(&self, opcode: Opcode) -> bool {
        let flags = self.flags;
        match opcode {
            Opcode::JumpIfEqual => flags.equal(),
            Opcode::JumpIfNotEqual => flags.not_equal(),
            Opcode::JumpIfLess => flags.less(),
            Opcode::JumpIfLessOrEqual => flags.less_or_equal(),
            Opcode::JumpIfGreater => flags.greater(),
            Opcode::JumpIfGreaterOrEqual => flags.greater_or_equal(),
            Opcode::JumpIfBelow => flags.below(),
            Opcode::JumpIfAbove => flags.above(),
            _ => false,
        }
    }

    fn jump_target(&self, operand: Operand) -> VmResult<usize> {
        let target = self
            .read_operand(operand)?
            .as_i64()
            .ok_or(VmError::TypeMismatch("integer jump target"))?;
        match usize::try_from(target) {
            Ok(index) if index < self.program.code.len() => Ok(index),
            _ => Err(VmError::InvalidJump(target)),
        }
    }

    fn return_from_frame(&mut self) -> VmResult<usize> {
        if self.frames.pop().is_none() {
            return Err(VmError::StackUnderflow);
        }
        let return_address = self.memory.leave_frame()?;
        debug!(return_address, depth = self.frames.len(), "return");
        if return_address == HOST_RETURN_ADDRESS {
            return self.finish_user_call();
        }
        match usize::try_from(return_address) {
            Ok(target) if target <= self.program.code.len() => Ok(target),
            _ => Err(VmError::InvalidJump(return_address as i64)),
        }
    }

    fn start_user_call(&mut self) -> VmResult<()> {
        let Some(call) = self.user_calls.pop_front() else {
            return Ok(());
        };
        let offset = call.function_offset();
        if offset >= self.program.code.len() {
            return Err(VmError::InvalidJump(offset as i64));
        }
        let stack_before = self.memory.stack_pointer();
        self.memory.reserve(call.function().return_size())?;
        for argument in call.arguments() {
            self.memory.push_value(*argument)?;
        }
        self.memory.enter_frame(HOST_RETURN_ADDRESS)?;
        self.frames.push(offset);
        debug!(id = call.id(), function = %call.function().name, "exposed call started");
        self.active_call = Some(ActiveCall {
            call,
            resume_ip: self.ip,
            stack_before,
            registers: self.registers,
            flags: self.flags,
        });
        self.ip = offset;
        Ok(())
    }

    fn finish_user_call(&mut self) -> VmResult<usize> {
        let active = self.active_call.take().ok_or_else(|| {
            VmError::Internal("host return address without an active exposed call".to_string())
        })?;
        let size = active.call.function().return_size();
        let bytes = self.memory.slice(active.stack_before, size)?.to_vec();
        self.memory.set_stack_pointer(active.stack_before)?;
        self.registers = active.registers;
        self.flags = active.flags;
        active.call.complete(bytes)?;
        debug!(id = active.call.id(), "exposed call completed");
        Ok(active.resume_ip)
    }

    fn call_external(&mut self, operand: Operand) -> VmResult<()> {
        let id = self
            .read_operand(operand)?
            .as_i64()
            .and_then(|id| i32::try_from(id).ok())
            .ok_or(VmError::TypeMismatch("integer function id"))?;
        let mut function = self.externals.take(id).ok_or(VmError::UnknownExternal(id))?;
        let result = self.invoke_external(function.as_mut());
        self.externals.restore(function);
        result
    }

    fn invoke_external(&mut self, function: &mut dyn ExternalFunction) -> VmResult<()> {
        let id = function.id();
        let signature = function.signature().clone();
        let mut args = Vec::with_capacity(signature.parameters.len());
        for ty in signature.parameters.iter().rev() {
            args.push(self.memory.pop_value(*ty)?);
        }
        args.reverse();
        debug!(id, name = function.name().unwrap_or("?"), ?args, "external call");

        let mut context =
            ExternalContext::with_call_id(&mut self.memory, &self.program, self.next_call_id);
        let outcome = function.invoke(&mut context, &args);
        let (next_call_id, queued) = context.into_queued();
        self.next_call_id = next_call_id;
        let outcome = outcome?;
        self.user_calls.extend(queued);

        match outcome {
            ExternalOutcome::Return(value) => self.push_result(id, signature.returns, value),
            ExternalOutcome::Pending => {
                self.pending_input = Some(InputRequest {
                    function_id: id,
                    name: function.name().map(str::to_string),
                    returns: signature.returns,
                });
                debug!(id, "waiting for input");
                Ok(())
            }
            ExternalOutcome::Delay(ticks) => {
                self.delay = ticks;
                Ok(())
            }
        }
    }

    fn push_result(
        &mut self,
        id: i32,
        returns: Option<ValueType>,
        value: Option<Value>,
    ) -> VmResult<()> {
        match (returns, value) {
            (None, None) => Ok(()),
            (None, Some(value)) => Err(VmError::ExternalFailed(format!(
                "function {id} returned {value} but declares no result"
            ))),
            (Some(ty), None) => Err(VmError::ExternalFailed(format!(
                "function {id} returned nothing, expected {ty}"
            ))),
            (Some(ty), Some(value)) => {
                let value = value.try_cast(ty).ok_or(VmError::InvalidCast {
                    from: value.ty(),
                    to: ty,
                })?;
                self.memory.push_value(value)
            }
        }
    }

    fn crash_message(&self, operand: Operand) -> String {
        let pointer = self
            .read_operand(operand)
            .ok()
            .and_then(|value| value.as_i64())
            .and_then(|pointer| usize::try_from(pointer).ok())
            .filter(|pointer| *pointer > 0);
        match pointer {
            Some(pointer) => self
                .memory
                .read_utf16_string(pointer, CRASH_MESSAGE_LIMIT)
                .unwrap_or_else(|_| format!("crashed (unreadable message at {pointer})")),
            None => "crashed".to_string(),
        }
    }

    fn arithmetic(&mut self, op: BinaryOp, target: Operand, source: Operand) -> VmResult<()> {
        let lhs = self.read_operand(target)?;
        let rhs = self.read_operand(source)?;
        let (result, flags) = lhs.binary(op, rhs)?;
        self.flags = flags;
        self.write_operand(target, result)
    }

    fn unary(&mut self, op: UnaryOp, target: Operand) -> VmResult<()> {
        let (result, flags) = self.read_operand(target)?.unary(op)?;
        self.flags = flags;
        self.write_operand(target, result)
    }

    fn effective_address(&self, operand: Operand) -> VmResult<(usize, ValueType)> {
        let (base, offset, ty) = match operand {
            Operand::Absolute { address, ty } => (address as i64, 0, ty),
            Operand::BasePointer { offset, ty } => {
                (self.memory.base_pointer() as i64, offset as i64, ty)
            }
            Operand::Indirect {
                register,
                offset,
                ty,
            } => {
                let base = self
                    .register(register)
                    .as_i64()
                    .ok_or(VmError::TypeMismatch("integer pointer"))?;
                (base, offset as i64, ty)
            }
            Operand::Immediate(_) | Operand::Register(_) => {
                return Err(VmError::MalformedInstruction(format!(
                    "`{operand}` is not a memory operand"
                )));
            }
        };
        let address = base + offset;
        let address = usize::try_from(address).map_err(|_| VmError::MemoryOutOfBounds {
            address,
            len: ty.size(),
        })?;
        Ok((address, ty))
    }

    fn read_operand(&self, operand: Operand) -> VmResult<Value> {
        match operand {
            Operand::Immediate(value) => Ok(value),
            Operand::Register(register) => Ok(self.register(register)),
            _ => {
                let (address, ty) = self.effective_address(operand)?;
                self.memory.read_value(address, ty)
            }
        }
    }

    /// Stores `value` converted to the destination's declared type.
    fn write_operand(&mut self, operand: Operand, value: Value) -> VmResult<()> {
        match operand {
            Operand::Immediate(_) => Err(VmError::MalformedInstruction(format!(
                "cannot write to immediate `{operand}`"
            ))),
            Operand::Register(register) => self.set_register(register, value),
            _ => {
                let (address, ty) = self.effective_address(operand)?;
                let value = value.try_cast(ty).ok_or(VmError::InvalidCast {
                    from: value.ty(),
                    to: ty,
                })?;
                self.memory.write_value(address, value)
            }
        }
    }

    /// Stores `value` bit for bit, ignoring the destination's declared type.
    fn write_raw(&mut self, operand: Operand, value: Value) -> VmResult<()> {
        match operand {
            Operand::Register(register) => self.set_register(register, value),
            _ => {
                let (address, _) = self.effective_address(operand)?;
                self.memory.write_value(address, value)
            }
        }
    }

    fn store_popped(&mut self, target: Operand, bytes: &[u8]) -> VmResult<()> {
        match target {
            Operand::Register(register) => {
                let ty = match bytes.len() {
                    1 => ValueType::U8,
                    2 => ValueType::Char,
                    _ => ValueType::I32,
                };
                let value = Value::from_le_bytes(ty, bytes)?;
                self.set_register(register, value)
            }
            _ => {
                let (address, _) = self.effective_address(target)?;
                self.memory.write_bytes(address, bytes)
            }
        }
    }
}

fn pop_width(opcode: Opcode) -> VmResult<usize> {
    opcode.pop_width().ok_or_else(|| {
        VmError::Internal(format!("{} is not a sized pop", opcode.mnemonic()))
    })
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("ip", &self.ip)
            .field("state", &self.state)
            .field("registers", &self.registers)
            .field("flags", &self.flags)
            .field("stack_pointer", &self.memory.stack_pointer())
            .field("base_pointer", &self.memory.base_pointer())
            .field("call_depth", &self.frames.len())
            .finish_non_exhaustive()
    }
}
