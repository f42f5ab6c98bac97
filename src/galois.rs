//! GF(2^16) arithmetic backing the Reed-Solomon codec.
//!
//! Ported from the teacher's PAR2 Galois-field module, which itself follows
//! par2cmdline: same generator polynomial, same log/antilog table
//! construction. STRUBS has no on-wire compatibility requirement pinning it
//! to this particular field, but sticking with GF(2^16) means a single field
//! element still fits a `u16` and the codec can treat a chunk payload as a
//! plain slice of `u16` words with no bit-packing.

use std::ops::{Add, AddAssign, Div, Mul, Sub};
use std::sync::OnceLock;

/// Primitive (irreducible) polynomial used as the field generator:
/// x¹⁶ + x¹² + x³ + x + 1.
const GENERATOR: u32 = 0x1100B;
const FIELD_SIZE: usize = 1 << 16;
const LIMIT: usize = FIELD_SIZE - 1;

struct Tables {
    log: Vec<u16>,
    antilog: Vec<u16>,
}

static TABLES: OnceLock<Tables> = OnceLock::new();

fn tables() -> &'static Tables {
    TABLES.get_or_init(|| {
        let mut log = vec![0u16; FIELD_SIZE];
        let mut antilog = vec![0u16; FIELD_SIZE];
        let mut b = 1u32;
        for l in 0..LIMIT {
            log[b as usize] = l as u16;
            antilog[l] = b as u16;
            b <<= 1;
            if b & FIELD_SIZE as u32 != 0 {
                b ^= GENERATOR;
            }
        }
        log[0] = LIMIT as u16;
        antilog[LIMIT] = 0;
        Tables { log, antilog }
    })
}

/// One element of GF(2^16). Addition is XOR; multiplication/division go
/// through the log/antilog tables built above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Gf16(u16);

impl Gf16 {
    pub const ZERO: Gf16 = Gf16(0);
    pub const ONE: Gf16 = Gf16(1);

    #[inline]
    pub const fn new(value: u16) -> Self {
        Gf16(value)
    }

    #[inline]
    pub const fn value(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// `g ^ exponent`, used to build the Vandermonde matrix rows.
    pub fn pow(self, exponent: u32) -> Gf16 {
        if self.is_zero() {
            return if exponent == 0 { Gf16::ONE } else { Gf16::ZERO };
        }
        let t = tables();
        let log = t.log[self.0 as usize] as u64 * exponent as u64 % LIMIT as u64;
        Gf16(t.antilog[log as usize])
    }

    /// Multiplicative inverse; panics on zero (callers must not invert zero
    /// pivots — that's what `checked_div` and Gaussian-elimination pivoting
    /// guard against).
    pub fn inverse(self) -> Gf16 {
        assert!(!self.is_zero(), "attempted to invert zero in GF(2^16)");
        let t = tables();
        let log = LIMIT - t.log[self.0 as usize] as usize;
        Gf16(t.antilog[log % LIMIT])
    }

    pub fn checked_div(self, rhs: Gf16) -> Option<Gf16> {
        if rhs.is_zero() {
            return None;
        }
        if self.is_zero() {
            return Some(Gf16::ZERO);
        }
        let t = tables();
        let diff = (t.log[self.0 as usize] as i64 - t.log[rhs.0 as usize] as i64)
            .rem_euclid(LIMIT as i64);
        Some(Gf16(t.antilog[diff as usize]))
    }
}

impl Add for Gf16 {
    type Output = Gf16;
    #[inline]
    fn add(self, rhs: Gf16) -> Gf16 {
        Gf16(self.0 ^ rhs.0)
    }
}

impl AddAssign for Gf16 {
    #[inline]
    fn add_assign(&mut self, rhs: Gf16) {
        self.0 ^= rhs.0;
    }
}

// Subtraction is addition in a characteristic-2 field.
impl Sub for Gf16 {
    type Output = Gf16;
    #[inline]
    fn sub(self, rhs: Gf16) -> Gf16 {
        self + rhs
    }
}

impl Mul for Gf16 {
    type Output = Gf16;
    fn mul(self, rhs: Gf16) -> Gf16 {
        if self.is_zero() || rhs.is_zero() {
            return Gf16::ZERO;
        }
        let t = tables();
        let sum = t.log[self.0 as usize] as u32 + t.log[rhs.0 as usize] as u32;
        Gf16(t.antilog[(sum % LIMIT as u32) as usize])
    }
}

impl Div for Gf16 {
    type Output = Gf16;
    fn div(self, rhs: Gf16) -> Gf16 {
        self.checked_div(rhs).expect("division by zero in GF(2^16)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_self_inverse() {
        let a = Gf16::new(0x1234);
        let b = Gf16::new(0xABCD);
        assert_eq!(a + b + b, a);
    }

    #[test]
    fn mul_by_one_is_identity() {
        let a = Gf16::new(0x1234);
        assert_eq!(a * Gf16::ONE, a);
    }

    #[test]
    fn mul_then_div_round_trips() {
        let a = Gf16::new(0x1234);
        let b = Gf16::new(0x5678);
        assert_eq!((a * b) / b, a);
    }

    #[test]
    fn inverse_is_correct() {
        let a = Gf16::new(0x1234);
        assert_eq!(a * a.inverse(), Gf16::ONE);
    }

    #[test]
    fn pow_matches_repeated_mul() {
        let a = Gf16::new(3);
        let mut expected = Gf16::ONE;
        for _ in 0..5 {
            expected = expected * a;
        }
        assert_eq!(a.pow(5), expected);
    }
}
