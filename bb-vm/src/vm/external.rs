use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::bytecode::Program;
use crate::memory::Memory;
use crate::value::{Value, ValueType};

use super::{UserCall, VmError, VmResult};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Signature {
    pub parameters: Vec<ValueType>,
    pub returns: Option<ValueType>,
}

impl Signature {
    pub fn new(parameters: Vec<ValueType>, returns: Option<ValueType>) -> Self {
        Self {
            parameters,
            returns,
        }
    }

    pub fn parameter_bytes(&self) -> usize {
        self.parameters.iter().map(|ty| ty.size()).sum()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExternalOutcome {
    /// Finished; the value (if any) is pushed as the call result.
    Return(Option<Value>),
    /// Started a request the host answers later through `complete_pending`.
    Pending,
    /// Suspend the interpreter for this many ticks.
    Delay(u32),
}

/// What an external function can reach while it runs: interpreter memory
/// and the queue of exposed-function calls.
pub struct ExternalContext<'a> {
    memory: &'a mut Memory,
    program: &'a Program,
    next_call_id: u64,
    queued: Vec<Rc<UserCall>>,
}

impl<'a> ExternalContext<'a> {
    pub fn new(memory: &'a mut Memory, program: &'a Program) -> Self {
        Self::with_call_id(memory, program, 0)
    }

    pub(crate) fn with_call_id(
        memory: &'a mut Memory,
        program: &'a Program,
        next_call_id: u64,
    ) -> Self {
        Self {
            memory,
            program,
            next_call_id,
            queued: Vec::new(),
        }
    }

    pub fn memory(&self) -> &Memory {
        &*self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut *self.memory
    }

    /// Queues a call to an exposed function. It runs after the current
    /// external call returns, behind every call already queued.
    pub fn call(&mut self, name: &str, arguments: &[Value]) -> VmResult<Rc<UserCall>> {
        self.next_call_id += 1;
        let call = Rc::new(UserCall::prepare(
            self.next_call_id,
            self.program,
            name,
            arguments,
        )?);
        debug!(id = call.id(), function = name, "exposed call queued by external");
        self.queued.push(Rc::clone(&call));
        Ok(call)
    }

    pub(crate) fn into_queued(self) -> (u64, Vec<Rc<UserCall>>) {
        (self.next_call_id, self.queued)
    }
}

pub trait ExternalFunction {
    fn id(&self) -> i32;
    fn name(&self) -> Option<&str>;
    fn signature(&self) -> &Signature;
    fn invoke(
        &mut self,
        context: &mut ExternalContext<'_>,
        args: &[Value],
    ) -> VmResult<ExternalOutcome>;
}

pub struct SyncFunction<F> {
    id: i32,
    name: Option<String>,
    signature: Signature,
    callback: F,
}

impl<F> SyncFunction<F>
where
    F: FnMut(&mut ExternalContext<'_>, &[Value]) -> VmResult<Option<Value>>,
{
    pub fn new(id: i32, name: Option<String>, signature: Signature, callback: F) -> Self {
        Self {
            id,
            name,
            signature,
            callback,
        }
    }
}

impl<F> ExternalFunction for SyncFunction<F>
where
    F: FnMut(&mut ExternalContext<'_>, &[Value]) -> VmResult<Option<Value>>,
{
    fn id(&self) -> i32 {
        self.id
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn invoke(
        &mut self,
        context: &mut ExternalContext<'_>,
        args: &[Value],
    ) -> VmResult<ExternalOutcome> {
        (self.callback)(context, args).map(ExternalOutcome::Return)
    }
}

/// Starts a request and leaves the interpreter waiting for its answer.
pub struct AsyncFunction<F> {
    id: i32,
    name: Option<String>,
    signature: Signature,
    callback: F,
}

impl<F> AsyncFunction<F>
where
    F: FnMut(&mut ExternalContext<'_>, &[Value]) -> VmResult<()>,
{
    pub fn new(id: i32, name: Option<String>, signature: Signature, callback: F) -> Self {
        Self {
            id,
            name,
            signature,
            callback,
        }
    }
}

impl<F> ExternalFunction for AsyncFunction<F>
where
    F: FnMut(&mut ExternalContext<'_>, &[Value]) -> VmResult<()>,
{
    fn id(&self) -> i32 {
        self.id
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn invoke(
        &mut self,
        context: &mut ExternalContext<'_>,
        args: &[Value],
    ) -> VmResult<ExternalOutcome> {
        (self.callback)(context, args)?;
        Ok(ExternalOutcome::Pending)
    }
}

/// Works on the raw little-endian argument block and returns raw result bytes.
pub struct ManagedFunction<F> {
    id: i32,
    name: Option<String>,
    signature: Signature,
    callback: F,
}

impl<F> ManagedFunction<F>
where
    F: FnMut(&mut ExternalContext<'_>, &[u8]) -> VmResult<Vec<u8>>,
{
    pub fn new(id: i32, name: Option<String>, signature: Signature, callback: F) -> Self {
        Self {
            id,
            name,
            signature,
            callback,
        }
    }
}

impl<F> ExternalFunction for ManagedFunction<F>
where
    F: FnMut(&mut ExternalContext<'_>, &[u8]) -> VmResult<Vec<u8>>,
{
    fn id(&self) -> i32 {
        self.id
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn invoke(
        &mut self,
        context: &mut ExternalContext<'_>,
        args: &[Value],
    ) -> VmResult<ExternalOutcome> {
        let mut raw = Vec::with_capacity(self.signature.parameter_bytes());
        for arg in args {
            raw.extend_from_slice(&arg.to_le_bytes());
        }
        let result = (self.callback)(context, &raw)?;
        match self.signature.returns {
            None if result.is_empty() => Ok(ExternalOutcome::Return(None)),
            None => Err(VmError::ExternalFailed(format!(
                "{} returned {} bytes but declares no result",
                self.name.as_deref().unwrap_or("external function"),
                result.len()
            ))),
            Some(ty) => Value::from_le_bytes(ty, &result)
                .map(|value| ExternalOutcome::Return(Some(value)))
                .map_err(|_| {
                    VmError::ExternalFailed(format!(
                        "{} returned {} bytes for a {ty} result",
                        self.name.as_deref().unwrap_or("external function"),
                        result.len()
                    ))
                }),
        }
    }
}

/// External functions keyed by id. A function is taken out of its slot
/// while it runs so the callback can borrow interpreter memory mutably.
#[derive(Default)]
pub struct ExternalFunctionTable {
    slots: Vec<Option<Box<dyn ExternalFunction>>>,
    by_id: HashMap<i32, usize>,
    by_name: HashMap<String, i32>,
}

impl ExternalFunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `function`, replacing any previous function with the same id.
    pub fn register(&mut self, function: Box<dyn ExternalFunction>) {
        let id = function.id();
        if let Some(name) = function.name() {
            self.by_name.insert(name.to_string(), id);
        }
        if let Some(&slot) = self.by_id.get(&id) {
            self.slots[slot] = Some(function);
            return;
        }
        self.by_id.insert(id, self.slots.len());
        self.slots.push(Some(function));
    }

    pub fn register_sync<F>(
        &mut self,
        id: i32,
        name: impl Into<String>,
        signature: Signature,
        callback: F,
    ) where
        F: FnMut(&mut ExternalContext<'_>, &[Value]) -> VmResult<Option<Value>> + 'static,
    {
        self.register(Box::new(SyncFunction::new(
            id,
            Some(name.into()),
            signature,
            callback,
        )));
    }

    pub fn register_async<F>(
        &mut self,
        id: i32,
        name: impl Into<String>,
        signature: Signature,
        callback: F,
    ) where
        F: FnMut(&mut ExternalContext<'_>, &[Value]) -> VmResult<()> + 'static,
    {
        self.register(Box::new(AsyncFunction::new(
            id,
            Some(name.into()),
            signature,
            callback,
        )));
    }

    pub fn register_managed<F>(
        &mut self,
        id: i32,
        name: impl Into<String>,
        signature: Signature,
        callback: F,
    ) where
        F: FnMut(&mut ExternalContext<'_>, &[u8]) -> VmResult<Vec<u8>> + 'static,
    {
        self.register(Box::new(ManagedFunction::new(
            id,
            Some(name.into()),
            signature,
            callback,
        )));
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn contains(&self, id: i32) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn id_by_name(&self, name: &str) -> Option<i32> {
        self.by_name.get(name).copied()
    }

    pub fn signature(&self, id: i32) -> Option<&Signature> {
        let slot = *self.by_id.get(&id)?;
        self.slots[slot].as_ref().map(|function| function.signature())
    }

    pub(crate) fn take(&mut self, id: i32) -> Option<Box<dyn ExternalFunction>> {
        let slot = *self.by_id.get(&id)?;
        self.slots[slot].take()
    }

    pub(crate) fn restore(&mut self, function: Box<dyn ExternalFunction>) {
        if let Some(&slot) = self.by_id.get(&function.id()) {
            self.slots[slot] = Some(function);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Memory {
        Memory::new(64, 64, &[]).expect("memory")
    }

    fn exposed_program() -> Program {
        Program {
            exposed: vec![crate::bytecode::ExposedFunction {
                name: "notify".to_string(),
                offset: 0,
                parameters: vec![ValueType::I32],
                returns: None,
            }],
            ..Program::default()
        }
    }

    #[test]
    fn register_replaces_same_id() {
        let mut table = ExternalFunctionTable::new();
        table.register_sync(1, "first", Signature::default(), |_, _| Ok(None));
        table.register_sync(
            1,
            "second",
            Signature::new(vec![], Some(ValueType::I32)),
            |_, _| Ok(Some(Value::I32(2))),
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.id_by_name("second"), Some(1));
        assert_eq!(
            table.signature(1).and_then(|signature| signature.returns),
            Some(ValueType::I32)
        );
    }

    #[test]
    fn take_and_restore_round_trip() {
        let mut table = ExternalFunctionTable::new();
        table.register_sync(3, "noop", Signature::default(), |_, _| Ok(None));
        let function = table.take(3).expect("registered");
        assert!(table.take(3).is_none());
        table.restore(function);
        assert!(table.take(3).is_some());
    }

    #[test]
    fn managed_function_sees_raw_arguments() {
        let mut function = ManagedFunction::new(
            9,
            Some("sum_bytes".to_string()),
            Signature::new(vec![ValueType::U8, ValueType::I16], Some(ValueType::I32)),
            |_, raw: &[u8]| {
                let sum: i32 = raw.iter().map(|byte| *byte as i32).sum();
                Ok(sum.to_le_bytes().to_vec())
            },
        );
        let outcome = function
            .invoke(
                &mut ExternalContext::new(&mut memory(), &Program::default()),
                &[Value::U8(1), Value::I16(0x0102)],
            )
            .expect("invoke");
        assert_eq!(outcome, ExternalOutcome::Return(Some(Value::I32(4))));
    }

    #[test]
    fn managed_function_rejects_wrong_result_width() {
        let mut function = ManagedFunction::new(
            9,
            Some("short".to_string()),
            Signature::new(vec![], Some(ValueType::I32)),
            |_, _: &[u8]| Ok(vec![1]),
        );
        assert!(matches!(
            function.invoke(
                &mut ExternalContext::new(&mut memory(), &Program::default()),
                &[]
            ),
            Err(VmError::ExternalFailed(_))
        ));
    }

    #[test]
    fn async_function_reports_pending() {
        let mut function = AsyncFunction::new(
            4,
            None,
            Signature::new(vec![], Some(ValueType::Char)),
            |_, _: &[Value]| Ok(()),
        );
        assert_eq!(
            function
                .invoke(
                    &mut ExternalContext::new(&mut memory(), &Program::default()),
                    &[]
                )
                .expect("invoke"),
            ExternalOutcome::Pending
        );
    }

    #[test]
    fn context_queues_checked_calls() {
        let mut memory = memory();
        let program = exposed_program();
        let mut context = ExternalContext::with_call_id(&mut memory, &program, 7);
        let call = context.call("notify", &[Value::U8(3)]).expect("queued");
        assert_eq!(call.id(), 8);
        assert_eq!(call.arguments(), &[Value::I32(3)]);
        assert!(matches!(
            context.call("missing", &[]),
            Err(VmError::UnknownExposedFunction(_))
        ));
        assert!(matches!(
            context.call("notify", &[]),
            Err(VmError::ArgumentCountMismatch { .. })
        ));
        let (next_id, queued) = context.into_queued();
        assert_eq!(next_id, 10);
        assert_eq!(queued.len(), 1);
    }
}
