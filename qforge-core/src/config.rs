//! Engine configuration
//!
//! One struct carries every tuning knob recognized at engine construction.
//! Unset environment variables fall through to the compile-time defaults.

use crate::types::FP_NORM_EPSILON;

/// Configuration for engine construction
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Basis state the register starts in
    pub initial_permutation: u64,

    /// Seed for the engine RNG; `None` draws from entropy
    pub rng_seed: Option<u64>,

    /// Apply an arbitrary global phase at initialization
    ///
    /// Global phase is unobservable, so randomizing it is free and lets
    /// phase-only gates on the top inter-page qubit be skipped.
    pub global_phase_is_random: bool,

    /// Renormalize after every normalization-sensitive gate
    pub do_auto_normalize: bool,

    /// Amplitudes whose squared magnitude falls below this are zeroed
    pub norm_threshold: f64,

    /// Use the sparse amplitude store
    pub use_sparse: bool,

    /// Route operations through the stabilizer-hybrid layer
    pub use_stabilizer: bool,

    /// Shard the state vector into pages once the register outgrows one page
    pub use_paging: bool,

    /// Probability tolerance for declaring a qubit separable
    pub separability_threshold: f64,

    /// Qubits per page (pager geometry hint)
    pub page_qubits: usize,

    /// Hard cap on qubits the pager will fan out over
    pub max_paging_qubits: usize,

    /// Cap on a single amplitude allocation, in mebibytes; 0 means unlimited
    pub max_alloc_mb: usize,

    /// Accelerator selection; -1 selects the default device
    pub device_id: i64,

    /// Prefer host-side memory for amplitude buffers
    pub host_memory: bool,

    /// Queue small operations to a background worker
    pub dispatch_queue: bool,

    /// log2 of the index stride handed to one worker per parallel task
    pub pstride_pow: usize,

    /// Registers below this qubit count run kernels single-threaded
    pub parallel_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_permutation: 0,
            rng_seed: None,
            global_phase_is_random: false,
            do_auto_normalize: true,
            norm_threshold: FP_NORM_EPSILON,
            use_sparse: false,
            use_stabilizer: true,
            use_paging: false,
            separability_threshold: FP_NORM_EPSILON,
            page_qubits: 21,
            max_paging_qubits: 30,
            max_alloc_mb: 0,
            device_id: -1,
            host_memory: true,
            dispatch_queue: false,
            pstride_pow: 11,
            parallel_threshold: 14,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any `QFORGE_*` environment variables set
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = read_env_usize("QFORGE_PAGE_QUBITS") {
            cfg.page_qubits = v;
            cfg.use_paging = true;
        }
        if let Some(v) = read_env_usize("QFORGE_MAX_PAGING_QUBITS") {
            cfg.max_paging_qubits = v;
        }
        if let Some(v) = read_env_usize("QFORGE_MAX_ALLOC_MB") {
            cfg.max_alloc_mb = v;
        }
        if let Some(v) = read_env_usize("QFORGE_PSTRIDE_POW") {
            cfg.pstride_pow = v;
        }
        if let Some(v) = read_env_usize("QFORGE_SEED") {
            cfg.rng_seed = Some(v as u64);
        }
        if std::env::var("QFORGE_USE_SPARSE").is_ok() {
            cfg.use_sparse = true;
        }
        cfg
    }

    pub fn with_initial_permutation(mut self, perm: u64) -> Self {
        self.initial_permutation = perm;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn with_random_global_phase(mut self, enabled: bool) -> Self {
        self.global_phase_is_random = enabled;
        self
    }

    pub fn with_auto_normalize(mut self, enabled: bool) -> Self {
        self.do_auto_normalize = enabled;
        self
    }

    pub fn with_norm_threshold(mut self, threshold: f64) -> Self {
        self.norm_threshold = threshold;
        self
    }

    pub fn with_sparse(mut self, enabled: bool) -> Self {
        self.use_sparse = enabled;
        self
    }

    pub fn with_stabilizer(mut self, enabled: bool) -> Self {
        self.use_stabilizer = enabled;
        self
    }

    pub fn with_paging(mut self, page_qubits: usize) -> Self {
        self.use_paging = true;
        self.page_qubits = page_qubits;
        self
    }

    pub fn with_separability_threshold(mut self, threshold: f64) -> Self {
        self.separability_threshold = threshold;
        self
    }

    pub fn with_dispatch_queue(mut self, enabled: bool) -> Self {
        self.dispatch_queue = enabled;
        self
    }

    /// Bytes a dense amplitude array of `qubit_count` qubits would occupy
    pub fn dense_bytes(qubit_count: usize) -> u128 {
        (16u128) << qubit_count
    }

    /// Whether a dense allocation of `qubit_count` qubits fits under `max_alloc_mb`
    pub fn allocation_fits(&self, qubit_count: usize) -> bool {
        if self.max_alloc_mb == 0 {
            return true;
        }
        Self::dense_bytes(qubit_count) <= (self.max_alloc_mb as u128) << 20
    }
}

fn read_env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = EngineConfig::default();
        assert!(cfg.do_auto_normalize);
        assert!(!cfg.use_sparse);
        assert_eq!(cfg.device_id, -1);
        assert_eq!(cfg.initial_permutation, 0);
    }

    #[test]
    fn test_builder_chain() {
        let cfg = EngineConfig::new()
            .with_seed(7)
            .with_paging(4)
            .with_sparse(true);
        assert_eq!(cfg.rng_seed, Some(7));
        assert!(cfg.use_paging);
        assert_eq!(cfg.page_qubits, 4);
        assert!(cfg.use_sparse);
    }

    #[test]
    fn test_allocation_fits() {
        let cfg = EngineConfig::new();
        assert!(cfg.allocation_fits(40));

        let mut cfg = EngineConfig::new();
        cfg.max_alloc_mb = 1;
        // 16 qubits = 1 MiB of amplitudes exactly
        assert!(cfg.allocation_fits(16));
        assert!(!cfg.allocation_fits(17));
    }
}
