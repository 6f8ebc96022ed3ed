//! State-vector engines for the qforge quantum simulator
//!
//! This crate holds the numerical kernel of the simulator: a dense
//! amplitude store with 64-byte alignment, a sparse hash-map store for
//! states with few nonzero terms, the `QEngineCpu` state-vector engine
//! that applies gates, register arithmetic, and measurement against
//! either store, and the `QPager` layer that shards one logical register
//! into page-sized sub-engines.

pub mod arith;
pub mod engine;
pub mod pager;
pub mod store;

pub use engine::QEngineCpu;
pub use pager::QPager;
pub use store::{DenseStore, SparseStore, StoreKind};
