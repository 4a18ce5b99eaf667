use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::alu::{self, AluOutput, BitWidth, Flags};
use crate::vm::{VmError, VmResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Null,
    U8,
    I8,
    /// UTF-16 code unit; doubles as the unsigned 16-bit integer type.
    Char,
    I16,
    U32,
    I32,
    F32,
}

impl ValueType {
    pub fn size(self) -> usize {
        match self {
            ValueType::Null => 0,
            ValueType::U8 | ValueType::I8 => 1,
            ValueType::Char | ValueType::I16 => 2,
            ValueType::U32 | ValueType::I32 | ValueType::F32 => 4,
        }
    }

    pub fn width(self) -> Option<BitWidth> {
        match self {
            ValueType::Null => None,
            ValueType::U8 | ValueType::I8 => Some(BitWidth::W8),
            ValueType::Char | ValueType::I16 => Some(BitWidth::W16),
            ValueType::U32 | ValueType::I32 | ValueType::F32 => Some(BitWidth::W32),
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, ValueType::Null | ValueType::F32)
    }

    pub fn is_signed(self) -> bool {
        matches!(self, ValueType::I8 | ValueType::I16 | ValueType::I32)
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Null => "null",
            ValueType::U8 => "u8",
            ValueType::I8 => "i8",
            ValueType::Char => "char",
            ValueType::I16 => "i16",
            ValueType::U32 => "u32",
            ValueType::I32 => "i32",
            ValueType::F32 => "f32",
        }
    }

    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "null" => Some(ValueType::Null),
            "u8" | "byte" => Some(ValueType::U8),
            "i8" => Some(ValueType::I8),
            "char" | "u16" => Some(ValueType::Char),
            "i16" => Some(ValueType::I16),
            "u32" => Some(ValueType::U32),
            "i32" | "int" => Some(ValueType::I32),
            "f32" | "float" => Some(ValueType::F32),
            _ => None,
        }
    }

    fn int_range(self) -> Option<(i64, i64)> {
        match self {
            ValueType::U8 => Some((0, u8::MAX as i64)),
            ValueType::I8 => Some((i8::MIN as i64, i8::MAX as i64)),
            ValueType::Char => Some((0, u16::MAX as i64)),
            ValueType::I16 => Some((i16::MIN as i64, i16::MAX as i64)),
            ValueType::U32 => Some((0, u32::MAX as i64)),
            ValueType::I32 => Some((i32::MIN as i64, i32::MAX as i64)),
            ValueType::Null | ValueType::F32 => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// A typed runtime value. Payload bits beyond the active type are not
/// representable, so every conversion goes through the cast functions below.
#[derive(Clone, Copy, Debug)]
pub enum Value {
    Null,
    U8(u8),
    I8(i8),
    Char(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, value) | (value, Value::Null) => value.is_zero(),
            (Value::U8(a), Value::U8(b)) => a == b,
            (Value::I8(a), Value::I8(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::I16(a), Value::I16(b)) => a == b,
            (Value::U32(a), Value::U32(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    pub fn zero(ty: ValueType) -> Self {
        Value::from_bits(ty, 0)
    }

    pub fn ty(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::U8(_) => ValueType::U8,
            Value::I8(_) => ValueType::I8,
            Value::Char(_) => ValueType::Char,
            Value::I16(_) => ValueType::I16,
            Value::U32(_) => ValueType::U32,
            Value::I32(_) => ValueType::I32,
            Value::F32(_) => ValueType::F32,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Value::Null => true,
            Value::F32(value) => *value == 0.0,
            other => other.to_bits() == 0,
        }
    }

    pub fn size(&self) -> usize {
        self.ty().size()
    }

    /// Raw payload, zero-extended to 64 bits.
    pub fn to_bits(&self) -> u64 {
        match *self {
            Value::Null => 0,
            Value::U8(v) => v as u64,
            Value::I8(v) => v as u8 as u64,
            Value::Char(v) => v as u64,
            Value::I16(v) => v as u16 as u64,
            Value::U32(v) => v as u64,
            Value::I32(v) => v as u32 as u64,
            Value::F32(v) => v.to_bits() as u64,
        }
    }

    /// Builds a value of `ty` from the low bits of `bits`.
    pub fn from_bits(ty: ValueType, bits: u64) -> Self {
        match ty {
            ValueType::Null => Value::Null,
            ValueType::U8 => Value::U8(bits as u8),
            ValueType::I8 => Value::I8(bits as u8 as i8),
            ValueType::Char => Value::Char(bits as u16),
            ValueType::I16 => Value::I16(bits as u16 as i16),
            ValueType::U32 => Value::U32(bits as u32),
            ValueType::I32 => Value::I32(bits as u32 as i32),
            ValueType::F32 => Value::F32(f32::from_bits(bits as u32)),
        }
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        let bits = self.to_bits().to_le_bytes();
        bits[..self.size()].to_vec()
    }

    pub fn from_le_bytes(ty: ValueType, bytes: &[u8]) -> VmResult<Self> {
        if bytes.len() != ty.size() {
            return Err(VmError::Internal(format!(
                "expected {} bytes for {ty}, got {}",
                ty.size(),
                bytes.len()
            )));
        }
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Value::from_bits(ty, u64::from_le_bytes(buf)))
    }

    /// Integer payload with sign taken from the type. `None` for floats and null.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::U8(v) => Some(v as i64),
            Value::I8(v) => Some(v as i64),
            Value::Char(v) => Some(v as i64),
            Value::I16(v) => Some(v as i64),
            Value::U32(v) => Some(v as i64),
            Value::I32(v) => Some(v as i64),
            Value::Null | Value::F32(_) => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Value::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Range-checked conversion. Fails when the value does not fit `ty`.
    pub fn try_cast(self, ty: ValueType) -> Option<Value> {
        if self.ty() == ty {
            return Some(self);
        }
        match (self, ty) {
            (_, ValueType::Null) => None,
            (Value::Null, ty) => Some(Value::zero(ty)),
            (Value::F32(value), ty) => {
                if !value.is_finite() {
                    return None;
                }
                let (min, max) = ty.int_range()?;
                let truncated = value.trunc() as f64;
                if truncated < min as f64 || truncated > max as f64 {
                    return None;
                }
                Some(Value::from_bits(ty, truncated as i64 as u64))
            }
            (value, ValueType::F32) => value.as_i64().map(|v| Value::F32(v as f32)),
            (value, ty) => {
                let number = value.as_i64()?;
                let (min, max) = ty.int_range()?;
                if number < min || number > max {
                    return None;
                }
                Some(Value::from_bits(ty, number as u64))
            }
        }
    }

    /// Two's complement truncation between integer types; float to integer
    /// saturates since there is no bit pattern to wrap.
    pub fn wrapping_cast(self, ty: ValueType) -> Value {
        match (self, ty) {
            (_, ValueType::Null) => Value::Null,
            (Value::Null, ty) => Value::zero(ty),
            (Value::F32(_), ValueType::F32) => self,
            (Value::F32(_), ty) => self.saturating_cast(ty),
            (value, ValueType::F32) => Value::F32(value.as_i64().unwrap_or(0) as f32),
            (value, ty) => Value::from_bits(ty, value.as_i64().unwrap_or(0) as u64),
        }
    }

    /// Clamps into the range of `ty`. NaN becomes zero.
    pub fn saturating_cast(self, ty: ValueType) -> Value {
        match (self, ty) {
            (_, ValueType::Null) => Value::Null,
            (Value::Null, ty) => Value::zero(ty),
            (Value::F32(_), ValueType::F32) => self,
            (value, ValueType::F32) => Value::F32(value.as_i64().unwrap_or(0) as f32),
            (Value::F32(value), ty) => {
                let Some((min, max)) = ty.int_range() else {
                    return Value::zero(ty);
                };
                let clamped = if value.is_nan() {
                    0
                } else {
                    (value as f64).clamp(min as f64, max as f64) as i64
                };
                Value::from_bits(ty, clamped as u64)
            }
            (value, ty) => {
                let Some((min, max)) = ty.int_range() else {
                    return Value::zero(ty);
                };
                let clamped = value.as_i64().unwrap_or(0).clamp(min, max);
                Value::from_bits(ty, clamped as u64)
            }
        }
    }

    pub fn binary(self, op: BinaryOp, rhs: Value) -> VmResult<(Value, Flags)> {
        if matches!(op, BinaryOp::Shl | BinaryOp::Shr) {
            return self.shift(op, rhs);
        }
        let (lhs, rhs) = make_same_type(self, rhs)?;
        let ty = lhs.ty();
        if ty == ValueType::F32 {
            return float_binary(op, lhs.to_f32(), rhs.to_f32());
        }
        let Some(width) = ty.width() else {
            return Err(VmError::TypeMismatch("non-null operands"));
        };
        let (a, b) = (lhs.to_bits(), rhs.to_bits());
        let signed = ty.is_signed();
        let out = match op {
            BinaryOp::Add => alu::add(a, b, width),
            BinaryOp::Sub => alu::sub(a, b, width),
            BinaryOp::Mul => alu::mul(a, b, width),
            BinaryOp::Div if signed => alu::div_s(a, b, width)?,
            BinaryOp::Div => alu::div_u(a, b, width)?,
            BinaryOp::Rem if signed => alu::mod_s(a, b, width)?,
            BinaryOp::Rem => alu::mod_u(a, b, width)?,
            BinaryOp::And => alu::and(a, b, width),
            BinaryOp::Or => alu::or(a, b, width),
            BinaryOp::Xor => alu::xor(a, b, width),
            BinaryOp::Shl | BinaryOp::Shr => unreachable!("shifts are dispatched above"),
        };
        Ok(typed_output(ty, out))
    }

    pub fn unary(self, op: UnaryOp) -> VmResult<(Value, Flags)> {
        let ty = self.ty();
        match (op, self) {
            (_, Value::Null) => Err(VmError::TypeMismatch("non-null operand")),
            (UnaryOp::Not, Value::F32(_)) => Err(VmError::TypeMismatch("integer")),
            (UnaryOp::Neg, Value::F32(value)) => Ok((Value::F32(-value), Flags::from_float(-value))),
            (op, value) => {
                let Some(width) = ty.width() else {
                    return Err(VmError::TypeMismatch("integer"));
                };
                let out = match op {
                    UnaryOp::Not => alu::not(value.to_bits(), width),
                    UnaryOp::Neg => alu::neg(value.to_bits(), width),
                };
                Ok(typed_output(ty, out))
            }
        }
    }

    fn shift(self, op: BinaryOp, amount: Value) -> VmResult<(Value, Flags)> {
        let ty = self.ty();
        let width = match ty {
            ValueType::Null | ValueType::F32 => return Err(VmError::TypeMismatch("integer")),
            other => other.width().ok_or(VmError::TypeMismatch("integer"))?,
        };
        let amount = amount
            .as_i64()
            .ok_or(VmError::TypeMismatch("integer shift amount"))?;
        let count = u32::try_from(amount).map_err(|_| VmError::InvalidShift(amount))?;
        let bits = self.to_bits();
        let out = match op {
            BinaryOp::Shl => alu::shl(bits, count, width)?,
            _ if ty.is_signed() => alu::shr_s(bits, count, width)?,
            _ => alu::shr_u(bits, count, width)?,
        };
        Ok(typed_output(ty, out))
    }

    pub fn add(self, rhs: Value) -> VmResult<Value> {
        Ok(self.binary(BinaryOp::Add, rhs)?.0)
    }

    pub fn sub(self, rhs: Value) -> VmResult<Value> {
        Ok(self.binary(BinaryOp::Sub, rhs)?.0)
    }

    pub fn mul(self, rhs: Value) -> VmResult<Value> {
        Ok(self.binary(BinaryOp::Mul, rhs)?.0)
    }

    pub fn div(self, rhs: Value) -> VmResult<Value> {
        Ok(self.binary(BinaryOp::Div, rhs)?.0)
    }

    pub fn rem(self, rhs: Value) -> VmResult<Value> {
        Ok(self.binary(BinaryOp::Rem, rhs)?.0)
    }

    pub fn bit_and(self, rhs: Value) -> VmResult<Value> {
        Ok(self.binary(BinaryOp::And, rhs)?.0)
    }

    pub fn bit_or(self, rhs: Value) -> VmResult<Value> {
        Ok(self.binary(BinaryOp::Or, rhs)?.0)
    }

    pub fn bit_xor(self, rhs: Value) -> VmResult<Value> {
        Ok(self.binary(BinaryOp::Xor, rhs)?.0)
    }

    pub fn shl(self, rhs: Value) -> VmResult<Value> {
        Ok(self.binary(BinaryOp::Shl, rhs)?.0)
    }

    pub fn shr(self, rhs: Value) -> VmResult<Value> {
        Ok(self.binary(BinaryOp::Shr, rhs)?.0)
    }

    pub fn bit_not(self) -> VmResult<Value> {
        Ok(self.unary(UnaryOp::Not)?.0)
    }

    pub fn neg(self) -> VmResult<Value> {
        Ok(self.unary(UnaryOp::Neg)?.0)
    }

    /// Status flags of `self - rhs`, the way a compare instruction sets them.
    /// `jl`/`jg` read these as signed; unsigned operands (`u8`, `char`,
    /// `u32`) are ordered by `jb`/`ja`, so `cmp 200u8, 100u8` satisfies `ja`
    /// but not `jg`.
    pub fn compare(self, rhs: Value) -> VmResult<Flags> {
        let (lhs, rhs) = make_same_type(self, rhs)?;
        match lhs.ty() {
            ValueType::Null => Ok(Flags {
                zero: true,
                ..Flags::default()
            }),
            ValueType::F32 => Ok(Flags::from_float_ordering(
                lhs.to_f32().partial_cmp(&rhs.to_f32()),
            )),
            ty => {
                let width = ty.width().ok_or(VmError::TypeMismatch("integer"))?;
                Ok(alu::sub(lhs.to_bits(), rhs.to_bits(), width).flags)
            }
        }
    }

    /// Null compares equal to zero of any type.
    pub fn equals(self, rhs: Value) -> bool {
        match make_same_type(self, rhs) {
            Ok((Value::F32(a), Value::F32(b))) => a == b,
            Ok((a, b)) => a.to_bits() == b.to_bits(),
            Err(_) => false,
        }
    }

    pub fn not_equals(self, rhs: Value) -> bool {
        !self.equals(rhs)
    }

    pub fn less_than(self, rhs: Value) -> bool {
        self.ordering(rhs) == Some(Ordering::Less)
    }

    pub fn greater_than(self, rhs: Value) -> bool {
        self.ordering(rhs) == Some(Ordering::Greater)
    }

    pub fn less_or_equal(self, rhs: Value) -> bool {
        matches!(
            self.ordering(rhs),
            Some(Ordering::Less) | Some(Ordering::Equal)
        )
    }

    pub fn greater_or_equal(self, rhs: Value) -> bool {
        matches!(
            self.ordering(rhs),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        )
    }

    /// Relational ordering; `None` whenever either side is null.
    fn ordering(self, rhs: Value) -> Option<Ordering> {
        if self.is_null() || rhs.is_null() {
            return None;
        }
        let (lhs, rhs) = make_same_type(self, rhs).ok()?;
        match (lhs, rhs) {
            (Value::F32(a), Value::F32(b)) => a.partial_cmp(&b),
            (a, b) => Some(a.as_i64()?.cmp(&b.as_i64()?)),
        }
    }

    fn to_f32(self) -> f32 {
        match self {
            Value::F32(v) => v,
            other => other.as_i64().unwrap_or(0) as f32,
        }
    }
}

/// Unifies two operands onto one type: null takes the other side's type,
/// integers mixed with floats become floats, otherwise whichever direction
/// of range-checked cast succeeds first.
pub fn make_same_type(a: Value, b: Value) -> VmResult<(Value, Value)> {
    let (ta, tb) = (a.ty(), b.ty());
    if ta == tb {
        return Ok((a, b));
    }
    if ta == ValueType::Null {
        return Ok((Value::zero(tb), b));
    }
    if tb == ValueType::Null {
        return Ok((a, Value::zero(ta)));
    }
    if ta == ValueType::F32 || tb == ValueType::F32 {
        return Ok((
            a.wrapping_cast(ValueType::F32),
            b.wrapping_cast(ValueType::F32),
        ));
    }
    if let Some(b) = b.try_cast(ta) {
        return Ok((a, b));
    }
    if let Some(a) = a.try_cast(tb) {
        return Ok((a, b));
    }
    Err(VmError::InvalidCast { from: tb, to: ta })
}

fn typed_output(ty: ValueType, out: AluOutput) -> (Value, Flags) {
    (Value::from_bits(ty, out.value), out.flags)
}

fn float_binary(op: BinaryOp, a: f32, b: f32) -> VmResult<(Value, Flags)> {
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(VmError::DivisionByZero),
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        BinaryOp::And | BinaryOp::Or | BinaryOp::Xor | BinaryOp::Shl | BinaryOp::Shr => {
            return Err(VmError::TypeMismatch("integer"));
        }
    };
    Ok((Value::F32(result), Flags::from_float(result)))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Value::Null => f.write_str("null"),
            Value::U8(v) => write!(f, "{v}u8"),
            Value::I8(v) => write!(f, "{v}i8"),
            Value::Char(v) => match char::from_u32(v as u32) {
                Some(ch) if !ch.is_control() && ch != '\'' && ch != '\\' => write!(f, "'{ch}'"),
                _ => write!(f, "{v}u16"),
            },
            Value::I16(v) => write!(f, "{v}i16"),
            Value::U32(v) => write!(f, "{v}u32"),
            Value::I32(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}f32"),
        }
    }
}

impl From<u8> for Value {
    fn from(value: u8) -> Self {
        Value::U8(value)
    }
}

impl From<i8> for Value {
    fn from(value: i8) -> Self {
        Value::I8(value)
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::Char(value)
    }
}

impl From<i16> for Value {
    fn from(value: i16) -> Self {
        Value::I16(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::U32(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::I32(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::F32(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INT_TYPES: [ValueType; 6] = [
        ValueType::U8,
        ValueType::I8,
        ValueType::Char,
        ValueType::I16,
        ValueType::U32,
        ValueType::I32,
    ];

    #[test]
    fn in_range_casts_round_trip() {
        for value in [-129i32, -128, -1, 0, 1, 127, 128, 255, 256, 65535, 65536] {
            let original = Value::I32(value);
            for ty in INT_TYPES {
                let (min, max) = ty.int_range().expect("integer type has a range");
                let fits = (value as i64) >= min && (value as i64) <= max;
                match original.try_cast(ty) {
                    Some(cast) => {
                        assert!(fits, "{value} should not fit {ty}");
                        assert_eq!(cast.try_cast(ValueType::I32), Some(original));
                    }
                    None => assert!(!fits, "{value} should fit {ty}"),
                }
            }
        }
    }

    #[test]
    fn i32_to_u8_cast_checks_range() {
        assert_eq!(Value::I32(255).try_cast(ValueType::U8), Some(Value::U8(255)));
        assert_eq!(Value::I32(256).try_cast(ValueType::U8), None);
        assert_eq!(Value::I32(-1).try_cast(ValueType::U8), None);
    }

    #[test]
    fn float_casts_truncate_and_reject_non_finite() {
        assert_eq!(Value::F32(3.9).try_cast(ValueType::I32), Some(Value::I32(3)));
        assert_eq!(Value::F32(-3.9).try_cast(ValueType::I8), Some(Value::I8(-3)));
        assert_eq!(Value::F32(300.0).try_cast(ValueType::U8), None);
        assert_eq!(Value::F32(f32::NAN).try_cast(ValueType::I32), None);
        assert_eq!(Value::I32(7).try_cast(ValueType::F32), Some(Value::F32(7.0)));
    }

    #[test]
    fn wrapping_and_saturating_casts() {
        assert_eq!(Value::I32(300).wrapping_cast(ValueType::U8), Value::U8(44));
        assert_eq!(Value::I32(-1).wrapping_cast(ValueType::U32), Value::U32(u32::MAX));
        assert_eq!(Value::U8(200).wrapping_cast(ValueType::I8), Value::I8(-56));
        assert_eq!(Value::I32(300).saturating_cast(ValueType::U8), Value::U8(255));
        assert_eq!(Value::I32(-300).saturating_cast(ValueType::I8), Value::I8(-128));
        assert_eq!(Value::F32(1e10).saturating_cast(ValueType::I32), Value::I32(i32::MAX));
        assert_eq!(Value::F32(f32::NAN).wrapping_cast(ValueType::I16), Value::I16(0));
    }

    #[test]
    fn arithmetic_wraps_at_native_width() {
        assert_eq!(Value::U8(255).add(Value::U8(1)).expect("add"), Value::U8(0));
        assert_eq!(Value::I8(127).add(Value::I8(1)).expect("add"), Value::I8(-128));
        assert_eq!(Value::U8(0).sub(Value::U8(1)).expect("sub"), Value::U8(255));
        assert_eq!(
            Value::I32(i32::MAX).mul(Value::I32(2)).expect("mul"),
            Value::I32(-2)
        );
    }

    #[test]
    fn add_reports_carry_and_overflow() {
        let (value, flags) = Value::U8(255)
            .binary(BinaryOp::Add, Value::U8(1))
            .expect("add");
        assert_eq!(value, Value::U8(0));
        assert!(flags.zero);
        assert!(flags.carry);

        let (_, flags) = Value::I8(127)
            .binary(BinaryOp::Add, Value::I8(1))
            .expect("add");
        assert!(flags.overflow);
        assert!(flags.sign);
    }

    #[test]
    fn division_respects_signedness() {
        assert_eq!(Value::I8(-7).div(Value::I8(2)).expect("div"), Value::I8(-3));
        assert_eq!(Value::I8(-7).rem(Value::I8(2)).expect("rem"), Value::I8(-1));
        assert_eq!(Value::U8(250).div(Value::U8(7)).expect("div"), Value::U8(35));
        assert_eq!(Value::I32(5).div(Value::I32(0)), Err(VmError::DivisionByZero));
    }

    #[test]
    fn make_same_type_unifies_operands() {
        let (a, b) = make_same_type(Value::U8(10), Value::I32(5)).expect("unify");
        assert_eq!((a, b), (Value::U8(10), Value::U8(5)));

        let (a, b) = make_same_type(Value::U8(10), Value::I32(1000)).expect("unify");
        assert_eq!((a, b), (Value::I32(10), Value::I32(1000)));

        let (a, b) = make_same_type(Value::Null, Value::I16(3)).expect("unify");
        assert_eq!((a, b), (Value::I16(0), Value::I16(3)));

        let (a, b) = make_same_type(Value::I32(2), Value::F32(0.5)).expect("unify");
        assert_eq!((a, b), (Value::F32(2.0), Value::F32(0.5)));

        let err = make_same_type(Value::I8(-1), Value::U32(u32::MAX)).expect_err("no common type");
        assert!(matches!(err, VmError::InvalidCast { .. }));
    }

    #[test]
    fn null_equals_zero_but_is_unordered() {
        assert_eq!(Value::Null, Value::I32(0));
        assert_eq!(Value::U8(0), Value::Null);
        assert_ne!(Value::Null, Value::I32(1));
        assert!(Value::Null.equals(Value::F32(0.0)));
        assert!(!Value::Null.less_than(Value::I32(1)));
        assert!(!Value::Null.greater_or_equal(Value::I32(0)));
        assert!(Value::I32(-1).less_than(Value::I32(0)));
        assert!(Value::U8(200).greater_than(Value::I32(100)));
    }

    #[test]
    fn bitwise_ops_reject_floats() {
        assert_eq!(
            Value::F32(1.0).bit_and(Value::F32(1.0)),
            Err(VmError::TypeMismatch("integer"))
        );
        assert_eq!(Value::F32(1.0).bit_not(), Err(VmError::TypeMismatch("integer")));
        assert_eq!(
            Value::U8(0b1100).bit_xor(Value::U8(0b1010)).expect("xor"),
            Value::U8(0b0110)
        );
        assert_eq!(Value::U8(0x0F).bit_not().expect("not"), Value::U8(0xF0));
    }

    #[test]
    fn shifts_follow_signedness() {
        assert_eq!(Value::I8(-128).shr(Value::I32(7)).expect("shr"), Value::I8(-1));
        assert_eq!(Value::U8(0x80).shr(Value::I32(7)).expect("shr"), Value::U8(1));
        assert_eq!(Value::U8(0x81).shl(Value::I32(1)).expect("shl"), Value::U8(0x02));
        assert_eq!(
            Value::U8(1).shl(Value::I32(8)),
            Err(VmError::InvalidShift(8))
        );
        assert_eq!(
            Value::U8(1).shl(Value::I32(-1)),
            Err(VmError::InvalidShift(-1))
        );
    }

    #[test]
    fn compare_sets_flags_like_subtraction() {
        let flags = Value::I32(3).compare(Value::I32(5)).expect("compare");
        assert!(flags.less());
        assert!(!flags.equal());
        let flags = Value::U8(5).compare(Value::I32(5)).expect("compare");
        assert!(flags.equal());
        let flags = Value::F32(2.5).compare(Value::F32(1.0)).expect("compare");
        assert!(flags.greater());
        let flags = Value::U8(200).compare(Value::U8(100)).expect("compare");
        assert!(flags.above());
        assert!(!flags.greater());
    }

    #[test]
    fn byte_encoding_is_little_endian() {
        assert_eq!(Value::I32(0x0102_0304).to_le_bytes(), vec![4, 3, 2, 1]);
        assert_eq!(Value::I16(-2).to_le_bytes(), vec![0xFE, 0xFF]);
        assert_eq!(
            Value::from_le_bytes(ValueType::Char, &[0x41, 0x00]).expect("decode"),
            Value::Char(0x41)
        );
        assert!(Value::from_le_bytes(ValueType::I32, &[1, 2]).is_err());
    }

    #[test]
    fn display_matches_assembler_literals() {
        assert_eq!(Value::I32(-5).to_string(), "-5");
        assert_eq!(Value::U8(7).to_string(), "7u8");
        assert_eq!(Value::Char('a' as u16).to_string(), "'a'");
        assert_eq!(Value::Char(10).to_string(), "10u16");
        assert_eq!(Value::F32(1.5).to_string(), "1.5f32");
        assert_eq!(Value::Null.to_string(), "null");
    }
}
