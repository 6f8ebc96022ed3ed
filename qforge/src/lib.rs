//! qforge: a layered classical simulator of universal quantum circuits
//!
//! The stack, bottom up:
//!
//! - [`qforge_state::QEngineCpu`]: the dense/sparse state-vector kernel
//! - [`qforge_state::QPager`]: shards one register into page-sized engines
//! - [`qforge_stabilizer::QStabilizer`]: CHP tableau for the Clifford subset
//! - [`qforge_stabilizer::QStabilizerHybrid`]: Clifford-until-proven-otherwise
//! - [`qforge_unit::QUnit`]: per-qubit separability and symbolic gate fusion
//!
//! Every layer implements [`qforge_core::QuantumBackend`], so they stack
//! and swap freely. [`Simulator`] builds the configured stack and adds
//! the named-gate surface.
//!
//! ```
//! use qforge::Simulator;
//!
//! let mut sim = Simulator::new(2).unwrap();
//! sim.h(0).unwrap();
//! sim.cnot(0, 1).unwrap();
//! let bit = sim.measure(0).unwrap();
//! assert_eq!(sim.measure(1).unwrap(), bit);
//! ```

pub mod simulator;

pub use qforge_core::{EngineConfig, QuantumBackend, Result, SimError};
pub use qforge_stabilizer::{QStabilizer, QStabilizerHybrid};
pub use qforge_state::{QEngineCpu, QPager};
pub use qforge_unit::{Backend, QUnit};
pub use simulator::Simulator;

pub mod prelude {
    pub use crate::{EngineConfig, QuantumBackend, Result, SimError, Simulator};
    pub use num_complex::Complex64;
}
