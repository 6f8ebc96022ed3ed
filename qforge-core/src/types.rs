//! Shared numeric types and bit-twiddling helpers

use num_complex::Complex64;

/// Index of a computational basis state, little-endian over qubits
/// (bit `i` of the index is the value of qubit `i`).
pub type BasisIndex = u64;

/// Largest register the `u64` basis index can represent.
///
/// One bit is reserved so that `2^n` itself stays representable.
pub const MAX_QUBIT_CAPACITY: usize = 63;

/// Tolerance below which a squared magnitude is treated as exactly zero
pub const FP_NORM_EPSILON: f64 = 1e-10;

pub const ZERO_CMPLX: Complex64 = Complex64::new(0.0, 0.0);
pub const ONE_CMPLX: Complex64 = Complex64::new(1.0, 0.0);

/// 2^power as a basis index
#[inline]
pub fn pow2(power: usize) -> BasisIndex {
    1u64 << power
}

/// Contiguous mask of `length` bits starting at bit `start`
#[inline]
pub fn bit_slice_mask(start: usize, length: usize) -> BasisIndex {
    ((pow2(length)) - 1) << start
}

/// True when the squared magnitude of `c` is negligible
#[inline]
pub fn is_norm_zero(c: Complex64) -> bool {
    c.norm_sqr() <= FP_NORM_EPSILON
}

/// True when two amplitudes agree to within the norm tolerance
#[inline]
pub fn is_same_complex(a: Complex64, b: Complex64) -> bool {
    is_norm_zero(a - b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pow2() {
        assert_eq!(pow2(0), 1);
        assert_eq!(pow2(3), 8);
        assert_eq!(pow2(62), 1 << 62);
    }

    #[test]
    fn test_bit_slice_mask() {
        assert_eq!(bit_slice_mask(0, 3), 0b111);
        assert_eq!(bit_slice_mask(2, 2), 0b1100);
        assert_eq!(bit_slice_mask(4, 0), 0);
    }

    #[test]
    fn test_is_norm_zero() {
        assert!(is_norm_zero(Complex64::new(1e-9, 0.0)));
        assert!(!is_norm_zero(Complex64::new(0.1, 0.0)));
    }
}
