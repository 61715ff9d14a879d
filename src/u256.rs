//! 256-bit unsigned integer arithmetic.
//!
//! Wraps `ruint::aliases::U256` to provide a stable interface. This adapter
//! module exists so we can swap the underlying library or implement our own
//! arithmetic without changing callers. Pool targets need exact integer
//! division; floating point is never acceptable past the initial difficulty
//! scaling.

use ruint::aliases::U256 as Ruint256;
use std::fmt;
use std::ops::{Div, Mul};

/// A 256-bit unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct U256(Ruint256);

impl U256 {
    /// Zero constant.
    pub const ZERO: Self = Self(Ruint256::ZERO);

    /// Create from four 64-bit limbs, least significant first.
    pub const fn from_limbs(limbs: [u64; 4]) -> Self {
        Self(Ruint256::from_limbs(limbs))
    }

    /// Create from big-endian bytes.
    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(Ruint256::from_be_bytes(bytes))
    }

    /// Convert to big-endian bytes.
    pub fn to_be_bytes(self) -> [u8; 32] {
        self.0.to_be_bytes()
    }
}

impl Div<u64> for U256 {
    type Output = Self;

    fn div(self, rhs: u64) -> Self::Output {
        Self(self.0 / Ruint256::from(rhs))
    }
}

impl Mul<u64> for U256 {
    type Output = Self;

    fn mul(self, rhs: u64) -> Self::Output {
        Self(self.0 * Ruint256::from(rhs))
    }
}

/// Renders as 64 lowercase hex digits, the form pools and block explorers
/// use for targets.
impl fmt::Display for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.to_be_bytes() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_division_u64() {
        let a = U256::from_limbs([100, 0, 0, 0]);
        assert_eq!(a / 10u64, U256::from_limbs([10, 0, 0, 0]));
    }

    #[test]
    fn test_div_mul_loses_low_bits() {
        let a = U256::from_limbs([105, 0, 0, 0]);
        assert_eq!((a / 10u64) * 10u64, U256::from_limbs([100, 0, 0, 0]));
    }

    #[test]
    fn test_be_bytes_roundtrip() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0xcd;
        let v = U256::from_be_bytes(bytes);
        assert_eq!(v.to_be_bytes(), bytes);
    }

    #[test]
    fn test_display_hex() {
        let v = U256::from_limbs([0xff, 0, 0, 0]);
        assert_eq!(
            v.to_string(),
            "00000000000000000000000000000000000000000000000000000000000000ff"
        );
    }

    #[test]
    fn test_ordering() {
        let small = U256::from_limbs([1, 0, 0, 0]);
        let large = U256::from_limbs([0, 0, 0, 1]);
        assert!(small < large);
        assert!(U256::ZERO < small);
    }
}
