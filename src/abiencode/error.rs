//! Error type returned by the ABI encoder.

use core::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A value does not match the type it is declared as in the app's ABI
    /// encoding, e.g. an address where the encoding declares a uint256.
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
    },
    /// The value list has a different length than the declared type tuple.
    ArityMismatch { expected: usize, got: usize },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::TypeMismatch { expected, got } => {
                write!(f, "abi value does not match declared type: expected {expected}, got {got}")
            }
            Error::ArityMismatch { expected, got } => {
                write!(f, "abi tuple arity mismatch: expected {expected} values, got {got}")
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
