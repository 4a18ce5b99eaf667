use std::fmt;

use serde::{Deserialize, Serialize};

use crate::debug_info::DebugInfo;
use crate::value::{Value, ValueType};
use crate::vm::{VmError, VmResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Register {
    Ax,
    Bx,
    Cx,
    Dx,
    Sp,
    Bp,
}

pub const GENERAL_REGISTERS: usize = 4;

impl Register {
    pub fn name(self) -> &'static str {
        match self {
            Register::Ax => "ax",
            Register::Bx => "bx",
            Register::Cx => "cx",
            Register::Dx => "dx",
            Register::Sp => "sp",
            Register::Bp => "bp",
        }
    }

    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "ax" => Some(Register::Ax),
            "bx" => Some(Register::Bx),
            "cx" => Some(Register::Cx),
            "dx" => Some(Register::Dx),
            "sp" => Some(Register::Sp),
            "bp" => Some(Register::Bp),
            _ => None,
        }
    }

    /// Slot in the general register file; `None` for `sp` and `bp`.
    pub fn general_index(self) -> Option<usize> {
        match self {
            Register::Ax => Some(0),
            Register::Bx => Some(1),
            Register::Cx => Some(2),
            Register::Dx => Some(3),
            Register::Sp | Register::Bp => None,
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressingMode {
    Immediate,
    Register,
    Absolute,
    BasePointerRelative,
    Indirect,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Operand {
    Immediate(Value),
    Register(Register),
    Absolute {
        address: u32,
        ty: ValueType,
    },
    BasePointer {
        offset: i32,
        ty: ValueType,
    },
    Indirect {
        register: Register,
        offset: i32,
        ty: ValueType,
    },
}

impl Operand {
    pub fn mode(&self) -> AddressingMode {
        match self {
            Operand::Immediate(_) => AddressingMode::Immediate,
            Operand::Register(_) => AddressingMode::Register,
            Operand::Absolute { .. } => AddressingMode::Absolute,
            Operand::BasePointer { .. } => AddressingMode::BasePointerRelative,
            Operand::Indirect { .. } => AddressingMode::Indirect,
        }
    }

    pub fn is_memory(&self) -> bool {
        self.memory_type().is_some()
    }

    pub fn memory_type(&self) -> Option<ValueType> {
        match self {
            Operand::Absolute { ty, .. }
            | Operand::BasePointer { ty, .. }
            | Operand::Indirect { ty, .. } => Some(*ty),
            Operand::Immediate(_) | Operand::Register(_) => None,
        }
    }

    pub fn is_writable(&self) -> bool {
        match self {
            Operand::Immediate(_) => false,
            Operand::Register(register) => *register != Register::Bp,
            _ => true,
        }
    }
}

fn write_offset(f: &mut fmt::Formatter<'_>, offset: i32) -> fmt::Result {
    match offset {
        0 => Ok(()),
        offset if offset < 0 => write!(f, "-{}", offset.unsigned_abs()),
        offset => write!(f, "+{offset}"),
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Immediate(value) => write!(f, "{value}"),
            Operand::Register(register) => write!(f, "{register}"),
            Operand::Absolute { address, ty } => write!(f, "{ty} [{address}]"),
            Operand::BasePointer { offset, ty } => {
                write!(f, "{ty} [bp")?;
                write_offset(f, *offset)?;
                f.write_str("]")
            }
            Operand::Indirect {
                register,
                offset,
                ty,
            } => {
                write!(f, "{ty} [{register}")?;
                write_offset(f, *offset)?;
                f.write_str("]")
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop,
    Exit,
    Break,
    Crash,
    Jump,
    JumpIfEqual,
    JumpIfNotEqual,
    JumpIfLess,
    JumpIfLessOrEqual,
    JumpIfGreater,
    JumpIfGreaterOrEqual,
    JumpIfBelow,
    JumpIfAbove,
    Call,
    Return,
    CallExternal,
    Push,
    Pop8,
    Pop16,
    Pop32,
    Pop64,
    PopTo8,
    PopTo16,
    PopTo32,
    PopTo64,
    Move,
    MathAdd,
    MathSub,
    MathMul,
    MathDiv,
    MathMod,
    BitsAnd,
    BitsOr,
    BitsXor,
    BitsShl,
    BitsShr,
    BitsNot,
    MathNeg,
    Compare,
    IntToFloat,
    FloatToInt,
    Allocate,
    Free,
}

/// Operand layout an opcode expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shape {
    None,
    Source,
    Target,
    TargetSource,
    SourceSource,
}

impl Opcode {
    pub const ALL: [Opcode; 43] = [
        Opcode::Nop,
        Opcode::Exit,
        Opcode::Break,
        Opcode::Crash,
        Opcode::Jump,
        Opcode::JumpIfEqual,
        Opcode::JumpIfNotEqual,
        Opcode::JumpIfLess,
        Opcode::JumpIfLessOrEqual,
        Opcode::JumpIfGreater,
        Opcode::JumpIfGreaterOrEqual,
        Opcode::JumpIfBelow,
        Opcode::JumpIfAbove,
        Opcode::Call,
        Opcode::Return,
        Opcode::CallExternal,
        Opcode::Push,
        Opcode::Pop8,
        Opcode::Pop16,
        Opcode::Pop32,
        Opcode::Pop64,
        Opcode::PopTo8,
        Opcode::PopTo16,
        Opcode::PopTo32,
        Opcode::PopTo64,
        Opcode::Move,
        Opcode::MathAdd,
        Opcode::MathSub,
        Opcode::MathMul,
        Opcode::MathDiv,
        Opcode::MathMod,
        Opcode::BitsAnd,
        Opcode::BitsOr,
        Opcode::BitsXor,
        Opcode::BitsShl,
        Opcode::BitsShr,
        Opcode::BitsNot,
        Opcode::MathNeg,
        Opcode::Compare,
        Opcode::IntToFloat,
        Opcode::FloatToInt,
        Opcode::Allocate,
        Opcode::Free,
    ];

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::Exit => "exit",
            Opcode::Break => "break",
            Opcode::Crash => "crash",
            Opcode::Jump => "jmp",
            Opcode::JumpIfEqual => "je",
            Opcode::JumpIfNotEqual => "jne",
            Opcode::JumpIfLess => "jl",
            Opcode::JumpIfLessOrEqual => "jle",
            Opcode::JumpIfGreater => "jg",
            Opcode::JumpIfGreaterOrEqual => "jge",
            Opcode::JumpIfBelow => "jb",
            Opcode::JumpIfAbove => "ja",
            Opcode::Call => "call",
            Opcode::Return => "ret",
            Opcode::CallExternal => "callext",
            Opcode::Push => "push",
            Opcode::Pop8 => "pop8",
            Opcode::Pop16 => "pop16",
            Opcode::Pop32 => "pop32",
            Opcode::Pop64 => "pop64",
            Opcode::PopTo8 => "popto8",
            Opcode::PopTo16 => "popto16",
            Opcode::PopTo32 => "popto32",
            Opcode::PopTo64 => "popto64",
            Opcode::Move => "mov",
            Opcode::MathAdd => "add",
            Opcode::MathSub => "sub",
            Opcode::MathMul => "mul",
            Opcode::MathDiv => "div",
            Opcode::MathMod => "mod",
            Opcode::BitsAnd => "and",
            Opcode::BitsOr => "or",
            Opcode::BitsXor => "xor",
            Opcode::BitsShl => "shl",
            Opcode::BitsShr => "shr",
            Opcode::BitsNot => "not",
            Opcode::MathNeg => "neg",
            Opcode::Compare => "cmp",
            Opcode::IntToFloat => "itof",
            Opcode::FloatToInt => "ftoi",
            Opcode::Allocate => "alloc",
            Opcode::Free => "free",
        }
    }

    pub fn parse_mnemonic(op: &str) -> Option<Self> {
        Opcode::ALL
            .iter()
            .copied()
            .find(|opcode| opcode.mnemonic() == op)
    }

    fn shape(self) -> Shape {
        match self {
            Opcode::Nop
            | Opcode::Exit
            | Opcode::Break
            | Opcode::Return
            | Opcode::Pop8
            | Opcode::Pop16
            | Opcode::Pop32
            | Opcode::Pop64 => Shape::None,
            Opcode::Crash
            | Opcode::Jump
            | Opcode::JumpIfEqual
            | Opcode::JumpIfNotEqual
            | Opcode::JumpIfLess
            | Opcode::JumpIfLessOrEqual
            | Opcode::JumpIfGreater
            | Opcode::JumpIfGreaterOrEqual
            | Opcode::JumpIfBelow
            | Opcode::JumpIfAbove
            | Opcode::Call
            | Opcode::CallExternal
            | Opcode::Push
            | Opcode::Free => Shape::Source,
            Opcode::PopTo8
            | Opcode::PopTo16
            | Opcode::PopTo32
            | Opcode::PopTo64
            | Opcode::BitsNot
            | Opcode::MathNeg
            | Opcode::IntToFloat
            | Opcode::FloatToInt => Shape::Target,
            Opcode::Move
            | Opcode::MathAdd
            | Opcode::MathSub
            | Opcode::MathMul
            | Opcode::MathDiv
            | Opcode::MathMod
            | Opcode::BitsAnd
            | Opcode::BitsOr
            | Opcode::BitsXor
            | Opcode::BitsShl
            | Opcode::BitsShr
            | Opcode::Allocate => Shape::TargetSource,
            Opcode::Compare => Shape::SourceSource,
        }
    }

    pub fn operand_count(self) -> usize {
        match self.shape() {
            Shape::None => 0,
            Shape::Source | Shape::Target => 1,
            Shape::TargetSource | Shape::SourceSource => 2,
        }
    }

    /// Byte width moved by the sized pop instructions.
    pub fn pop_width(self) -> Option<usize> {
        match self {
            Opcode::Pop8 | Opcode::PopTo8 => Some(1),
            Opcode::Pop16 | Opcode::PopTo16 => Some(2),
            Opcode::Pop32 | Opcode::PopTo32 => Some(4),
            Opcode::Pop64 | Opcode::PopTo64 => Some(8),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operand1: Option<Operand>,
    pub operand2: Option<Operand>,
}

impl Instruction {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            operand1: None,
            operand2: None,
        }
    }

    pub fn unary(opcode: Opcode, operand: Operand) -> Self {
        Self {
            opcode,
            operand1: Some(operand),
            operand2: None,
        }
    }

    pub fn binary(opcode: Opcode, target: Operand, source: Operand) -> Self {
        Self {
            opcode,
            operand1: Some(target),
            operand2: Some(source),
        }
    }

    /// Checks operand count and kinds for the opcode.
    pub fn validate(&self) -> VmResult<()> {
        let malformed = |reason: &str| -> VmResult<()> {
            Err(VmError::MalformedInstruction(format!(
                "{}: {reason}",
                self.opcode.mnemonic()
            )))
        };
        let present = self.operand1.is_some() as usize + self.operand2.is_some() as usize;
        if self.operand1.is_none() && self.operand2.is_some() {
            return malformed("second operand without a first");
        }
        let expected = self.opcode.operand_count();
        if present != expected {
            return malformed(&format!("expected {expected} operand(s), found {present}"));
        }
        let shape = self.opcode.shape();
        if matches!(shape, Shape::Target | Shape::TargetSource)
            && let Some(target) = self.operand1
            && !target.is_writable()
        {
            return malformed(&format!("operand `{target}` is not writable"));
        }
        if self.opcode == Opcode::PopTo64 && !self.operand1.is_some_and(|op| op.is_memory()) {
            return malformed("64-bit pops need a memory destination");
        }
        if matches!(self.opcode, Opcode::PopTo8 | Opcode::PopTo16 | Opcode::PopTo32)
            && self.operand1 == Some(Operand::Register(Register::Sp))
        {
            return malformed("cannot pop into sp");
        }
        if matches!(self.opcode, Opcode::IntToFloat | Opcode::FloatToInt)
            && let Some(ty) = self.operand1.and_then(|op| op.memory_type())
            && ty.size() != 4
        {
            return malformed(&format!("in-place conversion needs a 32-bit operand, not {ty}"));
        }
        for operand in [self.operand1, self.operand2].into_iter().flatten() {
            if operand.memory_type() == Some(ValueType::Null) {
                return malformed(&format!("operand `{operand}` has no width"));
            }
            if let Operand::Indirect { register, .. } = operand
                && register == Register::Bp
            {
                return malformed("use a base-pointer operand instead of [bp+...] indirection");
            }
        }
        Ok(())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.opcode.mnemonic())?;
        if let Some(operand) = &self.operand1 {
            write!(f, " {operand}")?;
        }
        if let Some(operand) = &self.operand2 {
            write!(f, ", {operand}")?;
        }
        Ok(())
    }
}

/// A function the host may invoke by name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedFunction {
    pub name: String,
    pub offset: usize,
    pub parameters: Vec<ValueType>,
    pub returns: Option<ValueType>,
}

impl ExposedFunction {
    pub fn return_size(&self) -> usize {
        self.returns.map(ValueType::size).unwrap_or(0)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Program {
    pub code: Vec<Instruction>,
    pub data: Vec<u8>,
    pub exposed: Vec<ExposedFunction>,
    pub debug: Option<DebugInfo>,
}

impl Program {
    pub fn new(code: Vec<Instruction>) -> Self {
        Self {
            code,
            ..Self::default()
        }
    }

    pub fn with_data(code: Vec<Instruction>, data: Vec<u8>) -> Self {
        Self {
            code,
            data,
            ..Self::default()
        }
    }

    pub fn with_exposed(mut self, exposed: Vec<ExposedFunction>) -> Self {
        self.exposed = exposed;
        self
    }

    pub fn with_debug(mut self, debug: Option<DebugInfo>) -> Self {
        self.debug = debug;
        self
    }

    pub fn exposed_function(&self, name: &str) -> Option<&ExposedFunction> {
        self.exposed.iter().find(|function| function.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonics_round_trip() {
        for opcode in Opcode::ALL {
            assert_eq!(Opcode::parse_mnemonic(opcode.mnemonic()), Some(opcode));
        }
        assert_eq!(Opcode::parse_mnemonic("ldc"), None);
    }

    #[test]
    fn addressing_mode_follows_operand() {
        let operand = Operand::BasePointer {
            offset: -12,
            ty: ValueType::I32,
        };
        assert_eq!(operand.mode(), AddressingMode::BasePointerRelative);
        assert_eq!(operand.to_string(), "i32 [bp-12]");
        let operand = Operand::Indirect {
            register: Register::Ax,
            offset: 1,
            ty: ValueType::U8,
        };
        assert_eq!(operand.mode(), AddressingMode::Indirect);
        assert_eq!(operand.to_string(), "u8 [ax+1]");
    }

    #[test]
    fn validate_rejects_bad_shapes() {
        let add = Instruction::unary(Opcode::MathAdd, Operand::Register(Register::Ax));
        assert!(matches!(
            add.validate(),
            Err(VmError::MalformedInstruction(_))
        ));

        let to_immediate = Instruction::binary(
            Opcode::Move,
            Operand::Immediate(Value::I32(1)),
            Operand::Register(Register::Ax),
        );
        assert!(to_immediate.validate().is_err());

        let to_bp = Instruction::binary(
            Opcode::Move,
            Operand::Register(Register::Bp),
            Operand::Immediate(Value::I32(1)),
        );
        assert!(to_bp.validate().is_err());

        let pop64 = Instruction::unary(Opcode::PopTo64, Operand::Register(Register::Ax));
        assert!(pop64.validate().is_err());

        let cmp = Instruction::binary(
            Opcode::Compare,
            Operand::Immediate(Value::I32(1)),
            Operand::Immediate(Value::I32(2)),
        );
        assert!(cmp.validate().is_ok());

        let narrow_itof = Instruction::unary(
            Opcode::IntToFloat,
            Operand::Absolute {
                address: 200,
                ty: ValueType::U8,
            },
        );
        assert!(narrow_itof.validate().is_err());
        let wide_ftoi = Instruction::unary(
            Opcode::FloatToInt,
            Operand::Absolute {
                address: 200,
                ty: ValueType::F32,
            },
        );
        assert!(wide_ftoi.validate().is_ok());
    }

    #[test]
    fn instruction_display_uses_assembler_syntax() {
        let instruction = Instruction::binary(
            Opcode::MathAdd,
            Operand::Indirect {
                register: Register::Sp,
                offset: -8,
                ty: ValueType::I32,
            },
            Operand::Immediate(Value::U8(3)),
        );
        assert_eq!(instruction.to_string(), "add i32 [sp-8], 3u8");
        assert_eq!(Instruction::new(Opcode::Return).to_string(), "ret");
    }
}
