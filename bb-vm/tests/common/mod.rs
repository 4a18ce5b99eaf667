#![allow(dead_code, unused_imports)]

use std::cell::RefCell;
use std::rc::Rc;

pub use vm::{
    BytecodeBuilder, ExecutionState, ExternalContext, ExternalFunction, ExternalFunctionTable,
    ExternalOutcome, Instruction, Interpreter, Memory, Opcode, Operand, Program, Register,
    RunStatus, Settings, Signature, Value, ValueType, VmError, VmResult, assemble,
};

pub const PRINT_INT: i32 = 1;
pub const PRINT_CHAR: i32 = 2;
pub const PRINT_STR: i32 = 3;
pub const READ_CHAR: i32 = 4;
pub const SLEEP: i32 = 5;

/// Everything the console functions printed, one entry per call.
pub type Output = Rc<RefCell<Vec<String>>>;

pub struct Sleep {
    signature: Signature,
}

impl Sleep {
    pub fn new() -> Self {
        Self {
            signature: Signature::new(vec![ValueType::I32], None),
        }
    }
}

impl ExternalFunction for Sleep {
    fn id(&self) -> i32 {
        SLEEP
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
        let ticks = args.first().and_then(Value::as_i64).unwrap_or(0);
        Ok(ExternalOutcome::Delay(ticks.max(0) as u32))
    }
}

pub fn console(output: &Output) -> ExternalFunctionTable {
    let mut table = ExternalFunctionTable::new();

    let out = Rc::clone(output);
    table.register_sync(
        PRINT_INT,
        "print_int",
        Signature::new(vec![ValueType::I32], None),
        move |_, args| {
            out.borrow_mut().push(args[0].to_string());
            Ok(None)
        },
    );

    let out = Rc::clone(output);
    table.register_sync(
        PRINT_CHAR,
        "print_char",
        Signature::new(vec![ValueType::Char], None),
        move |_, args| {
            let Value::Char(unit) = args[0] else {
                return Err(VmError::TypeMismatch("char"));
            };
            let text = char::from_u32(unit as u32).unwrap_or('?').to_string();
            out.borrow_mut().push(text);
            Ok(None)
        },
    );

    let out = Rc::clone(output);
    table.register_sync(
        PRINT_STR,
        "print_str",
        Signature::new(vec![ValueType::I32], None),
        move |context, args| {
            let pointer = args[0].as_i64().unwrap_or(0) as usize;
            out.borrow_mut()
                .push(context.memory().read_utf16_string(pointer, 1024)?);
            Ok(None)
        },
    );

    table.register_async(
        READ_CHAR,
        "read_char",
        Signature::new(vec![], Some(ValueType::Char)),
        |_, _| Ok(()),
    );

    table.register(Box::new(Sleep::new()));
    table
}

pub fn boot_with(source: &str, settings: Settings) -> (Interpreter, Output) {
    let program = assemble(source).expect("program should assemble");
    let output = Output::default();
    let vm = Interpreter::new(settings, program, console(&output))
        .expect("interpreter should start");
    (vm, output)
}

pub fn boot(source: &str) -> (Interpreter, Output) {
    boot_with(source, Settings::default())
}

pub fn printed(output: &Output) -> Vec<String> {
    output.borrow().clone()
}

pub const CONSOLE_EXTERNS: &str = "
.extern print_int 1
.extern print_char 2
.extern print_str 3
.extern read_char 4
.extern sleep 5
";

pub fn with_externs(body: &str) -> String {
    format!("{CONSOLE_EXTERNS}{body}")
}
