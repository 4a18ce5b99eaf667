use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use tracing::debug;
use vm::{
    ExternalContext, ExternalFunction, ExternalFunctionTable, ExternalOutcome, Signature, Value,
    ValueType, VmError, VmResult,
};
use vm_abi::{
    FN_ALLOC, FN_FREE, FN_PRINT_CHAR, FN_PRINT_INT, FN_PRINT_STR, FN_READ_CHAR, FN_SLEEP,
};

/// Longest string `print_str` reads before giving up on a terminator.
pub const MAX_PRINT_UNITS: usize = 4096;

pub type SharedWriter<W> = Rc<RefCell<W>>;

fn write_text<W: Write>(writer: &SharedWriter<W>, text: &str) -> VmResult<()> {
    let mut writer = writer.borrow_mut();
    writer
        .write_all(text.as_bytes())
        .and_then(|_| writer.flush())
        .map_err(|err| VmError::ExternalFailed(format!("console write failed: {err}")))
}

fn int_arg(args: &[Value], index: usize) -> VmResult<i64> {
    args.get(index)
        .and_then(Value::as_i64)
        .ok_or(VmError::TypeMismatch("integer argument"))
}

fn pointer_arg(args: &[Value], index: usize) -> VmResult<u32> {
    let raw = int_arg(args, index)?;
    u32::try_from(raw).map_err(|_| VmError::MemoryOutOfBounds {
        address: raw,
        len: 0,
    })
}

/// Suspends the program for the requested number of ticks.
pub struct Sleep {
    signature: Signature,
}

impl Default for Sleep {
    fn default() -> Self {
        Self {
            signature: Signature::new(vec![ValueType::I32], None),
        }
    }
}

impl ExternalFunction for Sleep {
    fn id(&self) -> i32 {
        FN_SLEEP
    }

    fn name(&self) -> Option<&str> {
        Some("sleep")
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn invoke(
        &mut self,
        _context: &mut ExternalContext<'_>,
        args: &[Value],
    ) -> VmResult<ExternalOutcome> {
        let ticks = int_arg(args, 0)?.clamp(0, u32::MAX as i64) as u32;
        debug!(ticks, "sleep");
        Ok(ExternalOutcome::Delay(ticks))
    }
}

/// Registers the standard console table, writing program output to `writer`.
/// `read_char` only opens a request; the run loop answers it.
pub fn register_console<W: Write + 'static>(
    table: &mut ExternalFunctionTable,
    writer: SharedWriter<W>,
) {
    let out = Rc::clone(&writer);
    table.register_sync(
        FN_PRINT_INT,
        "print_int",
        Signature::new(vec![ValueType::I32], None),
        move |_, args| {
            write_text(&out, &int_arg(args, 0)?.to_string())?;
            Ok(None)
        },
    );

    let out = Rc::clone(&writer);
    table.register_sync(
        FN_PRINT_CHAR,
        "print_char",
        Signature::new(vec![ValueType::Char], None),
        move |_, args| {
            let unit = int_arg(args, 0)?;
            let ch = char::from_u32(unit as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
            write_text(&out, ch.encode_utf8(&mut [0; 4]))?;
            Ok(None)
        },
    );

    let out = writer;
    table.register_sync(
        FN_PRINT_STR,
        "print_str",
        Signature::new(vec![ValueType::I32], None),
        move |context, args| {
            let pointer = pointer_arg(args, 0)?;
            let text = context
                .memory()
                .read_utf16_string(pointer as usize, MAX_PRINT_UNITS)?;
            write_text(&out, &text)?;
            Ok(None)
        },
    );

    table.register_async(
        FN_READ_CHAR,
        "read_char",
        Signature::new(vec![], Some(ValueType::Char)),
        |_, _| Ok(()),
    );

    table.register(Box::new(Sleep::default()));

    table.register_sync(
        FN_ALLOC,
        "alloc",
        Signature::new(vec![ValueType::I32], Some(ValueType::I32)),
        |context, args| {
            let size = int_arg(args, 0)?;
            let size = usize::try_from(size).map_err(|_| VmError::OutOfMemory { requested: 0 })?;
            let pointer = context.memory_mut().allocate(size)?;
            Ok(Some(Value::I32(pointer as i32)))
        },
    );

    table.register_sync(
        FN_FREE,
        "free",
        Signature::new(vec![ValueType::I32], None),
        |context, args| {
            context.memory_mut().free(pointer_arg(args, 0)?)?;
            Ok(None)
        },
    );
}

pub fn console_table<W: Write + 'static>(writer: SharedWriter<W>) -> ExternalFunctionTable {
    let mut table = ExternalFunctionTable::new();
    register_console(&mut table, writer);
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm::{Memory, Program};
    use vm_abi::FUNCTIONS;

    #[test]
    fn table_matches_the_abi() {
        let table = console_table(Rc::new(RefCell::new(Vec::<u8>::new())));
        assert_eq!(table.len(), FUNCTIONS.len());
        for function in FUNCTIONS {
            let signature = table.signature(function.id).expect("registered");
            let parameters: Vec<&str> = signature.parameters.iter().map(|ty| ty.name()).collect();
            assert_eq!(parameters, function.parameters, "{}", function.name);
            assert_eq!(signature.returns.map(ValueType::name), function.returns);
            assert_eq!(table.id_by_name(function.name), Some(function.id));
        }
    }

    #[test]
    fn sleep_clamps_negative_ticks() {
        let mut memory = Memory::new(64, 64, &[]).expect("memory");
        let program = Program::default();
        let mut context = ExternalContext::new(&mut memory, &program);
        let mut sleep = Sleep::default();
        assert_eq!(
            sleep.invoke(&mut context, &[Value::I32(-5)]).expect("sleep"),
            ExternalOutcome::Delay(0)
        );
        assert_eq!(
            sleep.invoke(&mut context, &[Value::I32(3)]).expect("sleep"),
            ExternalOutcome::Delay(3)
        );
    }
}
