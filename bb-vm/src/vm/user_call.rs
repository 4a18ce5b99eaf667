use std::cell::RefCell;

use crate::bytecode::{ExposedFunction, Program};
use crate::value::Value;

use super::{VmError, VmResult};

/// Return address recorded for frames entered on behalf of the host.
pub const HOST_RETURN_ADDRESS: i32 = -1;

/// A host-initiated call into an exposed function. The host keeps an `Rc`
/// handle and polls it; the interpreter fills the result exactly once.
#[derive(Debug)]
pub struct UserCall {
    id: u64,
    function: ExposedFunction,
    arguments: Vec<Value>,
    result: RefCell<Option<Vec<u8>>>,
}

impl UserCall {
    pub(crate) fn new(id: u64, function: ExposedFunction, arguments: Vec<Value>) -> Self {
        Self {
            id,
            function,
            arguments,
            result: RefCell::new(None),
        }
    }

    /// Looks up `name` in `program` and casts `arguments` to its parameter
    /// types.
    pub(crate) fn prepare(
        id: u64,
        program: &Program,
        name: &str,
        arguments: &[Value],
    ) -> VmResult<Self> {
        let function = program
            .exposed_function(name)
            .cloned()
            .ok_or_else(|| VmError::UnknownExposedFunction(name.to_string()))?;
        if arguments.len() != function.parameters.len() {
            return Err(VmError::ArgumentCountMismatch {
                function: function.name,
                expected: function.parameters.len(),
                got: arguments.len(),
            });
        }
        let arguments = arguments
            .iter()
            .zip(&function.parameters)
            .map(|(value, ty)| {
                value.try_cast(*ty).ok_or(VmError::InvalidCast {
                    from: value.ty(),
                    to: *ty,
                })
            })
            .collect::<VmResult<Vec<_>>>()?;
        Ok(Self::new(id, function, arguments))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn function(&self) -> &ExposedFunction {
        &self.function
    }

    pub fn function_offset(&self) -> usize {
        self.function.offset
    }

    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    pub fn is_completed(&self) -> bool {
        self.result.borrow().is_some()
    }

    /// Raw bytes of the return slot; empty for functions without a result.
    pub fn result(&self) -> Option<Vec<u8>> {
        self.result.borrow().clone()
    }

    /// Decoded result, `Ok(None)` for functions without a result.
    pub fn return_value(&self) -> VmResult<Option<Value>> {
        let result = self.result.borrow();
        let Some(bytes) = result.as_ref() else {
            return Err(VmError::Internal(format!(
                "call #{} to {} has not completed",
                self.id, self.function.name
            )));
        };
        match self.function.returns {
            None => Ok(None),
            Some(ty) => Value::from_le_bytes(ty, bytes).map(Some),
        }
    }

    pub(crate) fn complete(&self, bytes: Vec<u8>) -> VmResult<()> {
        let mut result = self.result.borrow_mut();
        if result.is_some() {
            return Err(VmError::Internal(format!(
                "call #{} to {} completed twice",
                self.id, self.function.name
            )));
        }
        *result = Some(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;

    fn call() -> UserCall {
        UserCall::new(
            1,
            ExposedFunction {
                name: "answer".to_string(),
                offset: 0,
                parameters: vec![],
                returns: Some(ValueType::I32),
            },
            vec![],
        )
    }

    #[test]
    fn result_is_set_exactly_once() {
        let call = call();
        assert!(!call.is_completed());
        assert!(call.return_value().is_err());
        call.complete(42i32.to_le_bytes().to_vec()).expect("first completion");
        assert_eq!(call.return_value().expect("value"), Some(Value::I32(42)));
        assert!(matches!(
            call.complete(vec![0; 4]),
            Err(VmError::Internal(_))
        ));
        assert_eq!(call.result(), Some(vec![42, 0, 0, 0]));
    }
}
