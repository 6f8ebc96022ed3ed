//! Core building blocks for the qforge quantum simulator
//!
//! This crate holds everything the engine layers share: the error type,
//! engine configuration, the parallel amplitude-kernel runtime, the
//! asynchronous dispatch queue, and the `QuantumBackend` operations trait
//! that every engine layer implements so that layers compose freely.

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod parallel;
pub mod types;

pub use backend::QuantumBackend;
pub use config::EngineConfig;
pub use dispatch::DispatchQueue;
pub use error::{Result, SimError};
pub use types::{
    bit_slice_mask, is_norm_zero, is_same_complex, pow2, BasisIndex, FP_NORM_EPSILON,
    MAX_QUBIT_CAPACITY, ONE_CMPLX, ZERO_CMPLX,
};
