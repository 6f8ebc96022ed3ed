//! Error types shared by every engine layer

use thiserror::Error;

/// Errors surfaced by simulator operations
///
/// Every failure leaves the engine in a well-defined state: either the
/// operation completed atomically or the state is unchanged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    /// Qubit index out of range for the register
    #[error("invalid qubit index {index} for {qubit_count}-qubit register")]
    InvalidQubit { index: usize, qubit_count: usize },

    /// Bit range out of range or of zero length where disallowed
    #[error("invalid bit range [{start}, {start}+{length}) for {qubit_count}-qubit register")]
    InvalidRange {
        start: usize,
        length: usize,
        qubit_count: usize,
    },

    /// Basis state index out of range
    #[error("basis state {index} out of range for dimension {dimension}")]
    InvalidBasisState { index: u64, dimension: u64 },

    /// Malformed operation argument
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// Division or modulus by zero in register arithmetic
    #[error("division or modulus by zero in register arithmetic")]
    DivisionByZero,

    /// Requested register exceeds the representational or memory cap
    #[error("capacity exceeded: {reason}")]
    CapacityExceeded { reason: String },

    /// Measurement or normalization on a state of negligible total probability
    #[error("degenerate state: total probability {norm} below tolerance")]
    DegenerateState { norm: f64 },

    /// Decompose requested on a range that does not factorize
    #[error("range [{start}, {start}+{length}) is not separable within tolerance")]
    SeparabilityViolation { start: usize, length: usize },

    /// Backend allocation or submission failure
    #[error("backend failure: {reason}")]
    BackendFailure { reason: String },
}

impl SimError {
    /// Convenience constructor for free-form invalid arguments
    pub fn invalid(reason: impl Into<String>) -> Self {
        SimError::InvalidArgument {
            reason: reason.into(),
        }
    }
}

/// Result type for simulator operations
pub type Result<T> = std::result::Result<T, SimError>;

/// Bounds-check a qubit index
#[inline]
pub fn check_qubit(index: usize, qubit_count: usize) -> Result<()> {
    if index >= qubit_count {
        return Err(SimError::InvalidQubit { index, qubit_count });
    }
    Ok(())
}

/// Bounds-check a contiguous bit range; zero length is rejected
#[inline]
pub fn check_range(start: usize, length: usize, qubit_count: usize) -> Result<()> {
    if length == 0 || start >= qubit_count || qubit_count - start < length {
        return Err(SimError::InvalidRange {
            start,
            length,
            qubit_count,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_qubit() {
        assert!(check_qubit(2, 3).is_ok());
        assert!(check_qubit(3, 3).is_err());
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(0, 3, 3).is_ok());
        assert!(check_range(1, 3, 3).is_err());
        assert!(check_range(0, 0, 3).is_err());
    }

    #[test]
    fn test_error_display() {
        let err = SimError::InvalidQubit {
            index: 5,
            qubit_count: 2,
        };
        assert_eq!(
            err.to_string(),
            "invalid qubit index 5 for 2-qubit register"
        );
    }
}
