//! Fixed-width integer arithmetic on raw bit patterns.
//!
//! Operands are masked to the requested width before use and results are
//! truncated to it, so callers can pass any zero- or sign-extended pattern.

use std::cmp::Ordering;

use crate::vm::{VmError, VmResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BitWidth {
    W8,
    W16,
    W32,
    W64,
}

impl BitWidth {
    pub fn bits(self) -> u32 {
        match self {
            BitWidth::W8 => 8,
            BitWidth::W16 => 16,
            BitWidth::W32 => 32,
            BitWidth::W64 => 64,
        }
    }

    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }

    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(BitWidth::W8),
            2 => Some(BitWidth::W16),
            4 => Some(BitWidth::W32),
            8 => Some(BitWidth::W64),
            _ => None,
        }
    }

    pub fn mask(self) -> u64 {
        match self {
            BitWidth::W64 => u64::MAX,
            other => (1u64 << other.bits()) - 1,
        }
    }

    fn sign_bit(self) -> u64 {
        1u64 << (self.bits() - 1)
    }
}

/// x86-style status flags produced by every ALU operation and by compares.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    pub zero: bool,
    pub sign: bool,
    pub carry: bool,
    pub overflow: bool,
}

impl Flags {
    pub fn from_result(value: u64, width: BitWidth) -> Self {
        Self {
            zero: value & width.mask() == 0,
            sign: value & width.sign_bit() != 0,
            carry: false,
            overflow: false,
        }
    }

    pub fn from_float(value: f32) -> Self {
        Self {
            zero: value == 0.0,
            sign: value.is_sign_negative() && value != 0.0,
            carry: false,
            overflow: false,
        }
    }

    /// Unordered (NaN) operands set no flags and therefore read as "greater".
    pub fn from_float_ordering(ordering: Option<Ordering>) -> Self {
        match ordering {
            Some(Ordering::Equal) => Self {
                zero: true,
                ..Self::default()
            },
            Some(Ordering::Less) => Self {
                sign: true,
                carry: true,
                ..Self::default()
            },
            Some(Ordering::Greater) | None => Self::default(),
        }
    }

    pub fn equal(self) -> bool {
        self.zero
    }

    pub fn not_equal(self) -> bool {
        !self.zero
    }

    pub fn less(self) -> bool {
        self.sign != self.overflow
    }

    pub fn less_or_equal(self) -> bool {
        self.zero || self.sign != self.overflow
    }

    pub fn greater(self) -> bool {
        !self.zero && self.sign == self.overflow
    }

    pub fn greater_or_equal(self) -> bool {
        self.sign == self.overflow
    }

    pub fn below(self) -> bool {
        self.carry
    }

    pub fn above(self) -> bool {
        !self.carry && !self.zero
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AluOutput {
    pub value: u64,
    pub flags: Flags,
}

impl AluOutput {
    fn plain(value: u64, width: BitWidth) -> Self {
        let value = value & width.mask();
        Self {
            value,
            flags: Flags::from_result(value, width),
        }
    }
}

pub fn sign_extend(value: u64, width: BitWidth) -> i64 {
    let shift = 64 - width.bits();
    ((value << shift) as i64) >> shift
}

pub fn add(a: u64, b: u64, width: BitWidth) -> AluOutput {
    let mask = width.mask();
    let (a, b) = (a & mask, b & mask);
    let (full, carry64) = a.overflowing_add(b);
    let value = full & mask;
    let carry = match width {
        BitWidth::W64 => carry64,
        _ => full > mask,
    };
    let sign = width.sign_bit();
    let overflow = (a & sign) == (b & sign) && (value & sign) != (a & sign);
    AluOutput {
        value,
        flags: Flags {
            carry,
            overflow,
            ..Flags::from_result(value, width)
        },
    }
}

pub fn sub(a: u64, b: u64, width: BitWidth) -> AluOutput {
    let mask = width.mask();
    let (a, b) = (a & mask, b & mask);
    let value = a.wrapping_sub(b) & mask;
    let sign = width.sign_bit();
    let overflow = (a & sign) != (b & sign) && (value & sign) != (a & sign);
    AluOutput {
        value,
        flags: Flags {
            carry: a < b,
            overflow,
            ..Flags::from_result(value, width)
        },
    }
}

/// Carry reports unsigned overflow, overflow reports signed overflow.
pub fn mul(a: u64, b: u64, width: BitWidth) -> AluOutput {
    let mask = width.mask();
    let (a, b) = (a & mask, b & mask);
    let unsigned = a as u128 * b as u128;
    let value = unsigned as u64 & mask;
    let signed = sign_extend(a, width) as i128 * sign_extend(b, width) as i128;
    AluOutput {
        value,
        flags: Flags {
            carry: unsigned > mask as u128,
            overflow: signed != sign_extend(value, width) as i128,
            ..Flags::from_result(value, width)
        },
    }
}

pub fn div_s(a: u64, b: u64, width: BitWidth) -> VmResult<AluOutput> {
    let divisor = sign_extend(b, width) as i128;
    if divisor == 0 {
        return Err(VmError::DivisionByZero);
    }
    let quotient = sign_extend(a, width) as i128 / divisor;
    let value = quotient as u64 & width.mask();
    Ok(AluOutput {
        value,
        flags: Flags {
            overflow: quotient != sign_extend(value, width) as i128,
            ..Flags::from_result(value, width)
        },
    })
}

pub fn div_u(a: u64, b: u64, width: BitWidth) -> VmResult<AluOutput> {
    let mask = width.mask();
    if b & mask == 0 {
        return Err(VmError::DivisionByZero);
    }
    Ok(AluOutput::plain((a & mask) / (b & mask), width))
}

pub fn mod_s(a: u64, b: u64, width: BitWidth) -> VmResult<AluOutput> {
    let divisor = sign_extend(b, width) as i128;
    if divisor == 0 {
        return Err(VmError::DivisionByZero);
    }
    let remainder = sign_extend(a, width) as i128 % divisor;
    Ok(AluOutput::plain(remainder as u64, width))
}

pub fn mod_u(a: u64, b: u64, width: BitWidth) -> VmResult<AluOutput> {
    let mask = width.mask();
    if b & mask == 0 {
        return Err(VmError::DivisionByZero);
    }
    Ok(AluOutput::plain((a & mask) % (b & mask), width))
}

pub fn and(a: u64, b: u64, width: BitWidth) -> AluOutput {
    AluOutput::plain(a & b, width)
}

pub fn or(a: u64, b: u64, width: BitWidth) -> AluOutput {
    AluOutput::plain(a | b, width)
}

pub fn xor(a: u64, b: u64, width: BitWidth) -> AluOutput {
    AluOutput::plain(a ^ b, width)
}

pub fn not(a: u64, width: BitWidth) -> AluOutput {
    AluOutput::plain(!a, width)
}

pub fn neg(a: u64, width: BitWidth) -> AluOutput {
    let a = a & width.mask();
    let value = 0u64.wrapping_sub(a) & width.mask();
    AluOutput {
        value,
        flags: Flags {
            carry: a != 0,
            overflow: a == width.sign_bit(),
            ..Flags::from_result(value, width)
        },
    }
}

fn check_shift(count: u32, width: BitWidth) -> VmResult<()> {
    if count >= width.bits() {
        return Err(VmError::InvalidShift(count as i64));
    }
    Ok(())
}

pub fn shl(a: u64, count: u32, width: BitWidth) -> VmResult<AluOutput> {
    check_shift(count, width)?;
    let a = a & width.mask();
    if count == 0 {
        return Ok(AluOutput::plain(a, width));
    }
    let value = (a << count) & width.mask();
    let carry = (a >> (width.bits() - count)) & 1 != 0;
    let msb = value & width.sign_bit() != 0;
    Ok(AluOutput {
        value,
        flags: Flags {
            carry,
            overflow: count == 1 && msb != carry,
            ..Flags::from_result(value, width)
        },
    })
}

pub fn shr_u(a: u64, count: u32, width: BitWidth) -> VmResult<AluOutput> {
    check_shift(count, width)?;
    let a = a & width.mask();
    if count == 0 {
        return Ok(AluOutput::plain(a, width));
    }
    let value = a >> count;
    Ok(AluOutput {
        value,
        flags: Flags {
            carry: (a >> (count - 1)) & 1 != 0,
            overflow: count == 1 && a & width.sign_bit() != 0,
            ..Flags::from_result(value, width)
        },
    })
}

pub fn shr_s(a: u64, count: u32, width: BitWidth) -> VmResult<AluOutput> {
    check_shift(count, width)?;
    let a = a & width.mask();
    if count == 0 {
        return Ok(AluOutput::plain(a, width));
    }
    let value = (sign_extend(a, width) >> count) as u64 & width.mask();
    Ok(AluOutput {
        value,
        flags: Flags {
            carry: (a >> (count - 1)) & 1 != 0,
            ..Flags::from_result(value, width)
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_wraps_and_sets_carry() {
        let out = add(0xFF, 1, BitWidth::W8);
        assert_eq!(out.value, 0);
        assert!(out.flags.zero);
        assert!(out.flags.carry);
        assert!(!out.flags.overflow);

        let out = add(u64::MAX, 1, BitWidth::W64);
        assert_eq!(out.value, 0);
        assert!(out.flags.carry);
    }

    #[test]
    fn add_sets_signed_overflow() {
        let out = add(0x7F, 1, BitWidth::W8);
        assert_eq!(out.value, 0x80);
        assert!(out.flags.overflow);
        assert!(out.flags.sign);
        assert!(!out.flags.carry);
    }

    #[test]
    fn sub_borrow_and_ordering_flags() {
        let out = sub(3, 5, BitWidth::W32);
        assert_eq!(out.value, 0xFFFF_FFFE);
        assert!(out.flags.carry);
        assert!(out.flags.less());
        assert!(out.flags.below());

        let out = sub(5, 5, BitWidth::W16);
        assert!(out.flags.equal());
        assert!(!out.flags.above());

        // -128 - 1 overflows in 8 bits but still orders as less
        let out = sub(0x80, 1, BitWidth::W8);
        assert!(out.flags.overflow);
        assert!(out.flags.less());
    }

    #[test]
    fn mul_reports_overflow() {
        let out = mul(0x10, 0x10, BitWidth::W8);
        assert_eq!(out.value, 0);
        assert!(out.flags.carry);
        assert!(out.flags.overflow);

        let out = mul(0xFF, 0xFF, BitWidth::W8);
        assert_eq!(out.value, 1);
        assert!(!out.flags.overflow, "-1 * -1 fits in i8");
    }

    #[test]
    fn division_by_zero_faults() {
        assert_eq!(div_s(5, 0, BitWidth::W32), Err(VmError::DivisionByZero));
        assert_eq!(div_u(5, 0x100, BitWidth::W8), Err(VmError::DivisionByZero));
        assert_eq!(mod_s(5, 0, BitWidth::W16), Err(VmError::DivisionByZero));
        assert_eq!(mod_u(5, 0, BitWidth::W64), Err(VmError::DivisionByZero));
    }

    #[test]
    fn signed_min_divided_by_minus_one_wraps() {
        let out = div_s(0x8000_0000, 0xFFFF_FFFF, BitWidth::W32).expect("division");
        assert_eq!(out.value, 0x8000_0000);
        assert!(out.flags.overflow);

        let out = div_s(i64::MIN as u64, u64::MAX, BitWidth::W64).expect("division");
        assert_eq!(out.value, i64::MIN as u64);

        let out = mod_s(0x80, 0xFF, BitWidth::W8).expect("remainder");
        assert_eq!(out.value, 0);
    }

    #[test]
    fn signed_division_truncates_toward_zero() {
        let out = div_s((-7i64) as u64, 2, BitWidth::W32).expect("division");
        assert_eq!(sign_extend(out.value, BitWidth::W32), -3);
        let out = mod_s((-7i64) as u64, 2, BitWidth::W32).expect("remainder");
        assert_eq!(sign_extend(out.value, BitWidth::W32), -1);
    }

    #[test]
    fn neg_of_min_overflows() {
        let out = neg(0x80, BitWidth::W8);
        assert_eq!(out.value, 0x80);
        assert!(out.flags.overflow);
        let out = neg(1, BitWidth::W16);
        assert_eq!(out.value, 0xFFFF);
        assert!(out.flags.carry);
    }

    #[test]
    fn shifts_track_carry_out() {
        let out = shl(0x81, 1, BitWidth::W8).expect("shift");
        assert_eq!(out.value, 0x02);
        assert!(out.flags.carry);

        let out = shr_u(0x81, 1, BitWidth::W8).expect("shift");
        assert_eq!(out.value, 0x40);
        assert!(out.flags.carry);

        let out = shr_s(0x80, 3, BitWidth::W8).expect("shift");
        assert_eq!(out.value, 0xF0);

        let out = shl(1, 63, BitWidth::W64).expect("shift");
        assert_eq!(out.value, 1 << 63);
    }

    #[test]
    fn oversized_shift_is_rejected() {
        assert_eq!(shl(1, 8, BitWidth::W8), Err(VmError::InvalidShift(8)));
        assert_eq!(shr_u(1, 64, BitWidth::W64), Err(VmError::InvalidShift(64)));
        assert!(shr_s(1, 31, BitWidth::W32).is_ok());
    }

    #[test]
    fn bitwise_results_are_masked() {
        assert_eq!(not(0, BitWidth::W16).value, 0xFFFF);
        assert_eq!(and(0x1FF, 0x0F0, BitWidth::W8).value, 0xF0);
        assert_eq!(or(0x100, 0x001, BitWidth::W8).value, 0x01);
        assert!(xor(0xAA, 0xAA, BitWidth::W8).flags.zero);
    }

    #[test]
    fn float_ordering_flags() {
        assert!(Flags::from_float_ordering(Some(Ordering::Equal)).equal());
        let less = Flags::from_float_ordering(Some(Ordering::Less));
        assert!(less.below());
        assert!(less.less());
        let nan = Flags::from_float_ordering(None);
        assert!(nan.greater());
        assert!(nan.above());
    }
}
