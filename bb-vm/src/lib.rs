pub mod alu;
pub mod assembler;
pub mod bytecode;
pub mod debug_info;
pub mod memory;
pub mod settings;
pub mod value;
pub mod vm;

pub use alu::{BitWidth, Flags};
pub use assembler::{
    AsmParseError, AssemblerError, BytecodeBuilder, DATA_RESERVED, OperandSlot, assemble,
    assemble_with_externs,
};
pub use bytecode::{
    AddressingMode, ExposedFunction, Instruction, Opcode, Operand, Program, Register,
};
pub use debug_info::{ArgInfo, DebugInfo, DebugInfoBuilder, FunctionInfo, SourceLocation};
pub use memory::{HeapBlock, Memory};
pub use settings::Settings;
pub use value::{BinaryOp, UnaryOp, Value, ValueType, make_same_type};
pub use vm::{
    AsyncFunction, ExecutionState, ExternalContext, ExternalFunction, ExternalFunctionTable,
    ExternalOutcome, InputRequest, Interpreter, ManagedFunction, RunStatus, RuntimeFault,
    Signature, SyncFunction, UserCall, VmError, VmResult, disassemble, render_fault,
};
