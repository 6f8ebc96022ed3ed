//! Unit layer of the qforge quantum simulator
//!
//! `QUnit` tracks per-qubit separability over a sub-engine arena. A
//! still-separable qubit lives as a cached amplitude pair in its shard;
//! single-qubit phase/invert gates buffer symbolically, controlled-phase
//! gates between separable qubits fuse into cross-shard phase buffers,
//! and only operations that genuinely entangle allocate or grow a shared
//! sub-engine. Measurements and extremal probability queries try to
//! factor qubits back out of their engines.

pub mod backend;
pub mod shard;
pub mod unit;

pub use backend::Backend;
pub use shard::{PauliBasis, PhaseBuffer, QubitShard, SingleBuffer};
pub use unit::QUnit;
