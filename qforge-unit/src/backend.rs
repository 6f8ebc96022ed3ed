//! Tagged sub-engine variant
//!
//! The unit layer treats its sub-engines polymorphically over the fixed
//! capability set: a tagged enum of the concrete engines plus the one
//! operations trait, with no open extension point. Which variant a unit
//! allocates is decided once, from the engine configuration.

use num_complex::Complex64;

use qforge_core::{BasisIndex, EngineConfig, QuantumBackend, Result, SimError};
use qforge_stabilizer::QStabilizerHybrid;
use qforge_state::{QEngineCpu, QPager};

/// A unit-layer sub-engine
#[derive(Clone, Debug)]
pub enum Backend {
    Hybrid(QStabilizerHybrid),
    Paged(QPager),
    Cpu(QEngineCpu),
}

macro_rules! fan {
    ($backend:expr, $e:ident => $body:expr) => {
        match $backend {
            Backend::Hybrid($e) => $body,
            Backend::Paged($e) => $body,
            Backend::Cpu($e) => $body,
        }
    };
}

impl Backend {
    /// Allocate a sub-engine of the kind the configuration selects
    pub fn make(qubit_count: usize, perm: BasisIndex, config: &EngineConfig) -> Result<Self> {
        if config.use_stabilizer {
            Ok(Backend::Hybrid(QStabilizerHybrid::new(
                qubit_count,
                perm,
                config,
            )?))
        } else if config.use_paging && qubit_count > config.page_qubits {
            Ok(Backend::Paged(QPager::new(qubit_count, perm, config)?))
        } else {
            Ok(Backend::Cpu(QEngineCpu::new(qubit_count, perm, config)?))
        }
    }
}

impl QuantumBackend for Backend {
    fn qubit_count(&self) -> usize {
        fan!(self, e => e.qubit_count())
    }

    fn finish(&mut self) {
        fan!(self, e => e.finish())
    }

    fn set_permutation(&mut self, perm: BasisIndex) -> Result<()> {
        fan!(self, e => e.set_permutation(perm))
    }

    fn set_quantum_state(&mut self, amplitudes: &[Complex64]) -> Result<()> {
        fan!(self, e => e.set_quantum_state(amplitudes))
    }

    fn get_quantum_state(&mut self, out: &mut [Complex64]) -> Result<()> {
        fan!(self, e => e.get_quantum_state(out))
    }

    fn get_probs(&mut self, out: &mut [f64]) -> Result<()> {
        fan!(self, e => e.get_probs(out))
    }

    fn get_amplitude(&mut self, perm: BasisIndex) -> Result<Complex64> {
        fan!(self, e => e.get_amplitude(perm))
    }

    fn mtrx(&mut self, m: &[Complex64; 4], target: usize) -> Result<()> {
        fan!(self, e => e.mtrx(m, target))
    }

    fn phase(&mut self, top_left: Complex64, bottom_right: Complex64, target: usize) -> Result<()> {
        fan!(self, e => e.phase(top_left, bottom_right, target))
    }

    fn invert(
        &mut self,
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()> {
        fan!(self, e => e.invert(top_right, bottom_left, target))
    }

    fn mc_mtrx(&mut self, controls: &[usize], m: &[Complex64; 4], target: usize) -> Result<()> {
        fan!(self, e => e.mc_mtrx(controls, m, target))
    }

    fn mac_mtrx(&mut self, controls: &[usize], m: &[Complex64; 4], target: usize) -> Result<()> {
        fan!(self, e => e.mac_mtrx(controls, m, target))
    }

    fn mc_phase(
        &mut self,
        controls: &[usize],
        top_left: Complex64,
        bottom_right: Complex64,
        target: usize,
    ) -> Result<()> {
        fan!(self, e => e.mc_phase(controls, top_left, bottom_right, target))
    }

    fn mac_phase(
        &mut self,
        controls: &[usize],
        top_left: Complex64,
        bottom_right: Complex64,
        target: usize,
    ) -> Result<()> {
        fan!(self, e => e.mac_phase(controls, top_left, bottom_right, target))
    }

    fn mc_invert(
        &mut self,
        controls: &[usize],
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()> {
        fan!(self, e => e.mc_invert(controls, top_right, bottom_left, target))
    }

    fn mac_invert(
        &mut self,
        controls: &[usize],
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()> {
        fan!(self, e => e.mac_invert(controls, top_right, bottom_left, target))
    }

    fn uniformly_controlled_single_bit(
        &mut self,
        controls: &[usize],
        target: usize,
        mtrxs: &[[Complex64; 4]],
    ) -> Result<()> {
        fan!(self, e => e.uniformly_controlled_single_bit(controls, target, mtrxs))
    }

    fn uniform_parity_rz(&mut self, mask: BasisIndex, angle: f64) -> Result<()> {
        fan!(self, e => e.uniform_parity_rz(mask, angle))
    }

    fn c_uniform_parity_rz(
        &mut self,
        controls: &[usize],
        mask: BasisIndex,
        angle: f64,
    ) -> Result<()> {
        fan!(self, e => e.c_uniform_parity_rz(controls, mask, angle))
    }

    fn swap(&mut self, qubit1: usize, qubit2: usize) -> Result<()> {
        fan!(self, e => e.swap(qubit1, qubit2))
    }

    fn rol(&mut self, shift: usize, start: usize, length: usize) -> Result<()> {
        fan!(self, e => e.rol(shift, start, length))
    }

    fn inc(&mut self, to_add: BasisIndex, start: usize, length: usize) -> Result<()> {
        fan!(self, e => e.inc(to_add, start, length))
    }

    fn c_inc(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()> {
        fan!(self, e => e.c_inc(to_add, start, length, controls))
    }

    fn inc_c(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        carry: usize,
    ) -> Result<()> {
        fan!(self, e => e.inc_c(to_add, start, length, carry))
    }

    fn dec_c(
        &mut self,
        to_sub: BasisIndex,
        start: usize,
        length: usize,
        carry: usize,
    ) -> Result<()> {
        fan!(self, e => e.dec_c(to_sub, start, length, carry))
    }

    fn inc_s(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        overflow: usize,
    ) -> Result<()> {
        fan!(self, e => e.inc_s(to_add, start, length, overflow))
    }

    fn inc_sc(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        overflow: usize,
        carry: usize,
    ) -> Result<()> {
        fan!(self, e => e.inc_sc(to_add, start, length, overflow, carry))
    }

    fn dec_sc(
        &mut self,
        to_sub: BasisIndex,
        start: usize,
        length: usize,
        overflow: usize,
        carry: usize,
    ) -> Result<()> {
        fan!(self, e => e.dec_sc(to_sub, start, length, overflow, carry))
    }

    fn mul(
        &mut self,
        to_mul: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
    ) -> Result<()> {
        fan!(self, e => e.mul(to_mul, in_out_start, carry_start, length))
    }

    fn div(
        &mut self,
        to_div: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
    ) -> Result<()> {
        fan!(self, e => e.div(to_div, in_out_start, carry_start, length))
    }

    fn mul_mod_n_out(
        &mut self,
        to_mul: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
    ) -> Result<()> {
        fan!(self, e => e.mul_mod_n_out(to_mul, mod_n, in_start, out_start, length))
    }

    fn imul_mod_n_out(
        &mut self,
        to_mul: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
    ) -> Result<()> {
        fan!(self, e => e.imul_mod_n_out(to_mul, mod_n, in_start, out_start, length))
    }

    fn pow_mod_n_out(
        &mut self,
        base: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
    ) -> Result<()> {
        fan!(self, e => e.pow_mod_n_out(base, mod_n, in_start, out_start, length))
    }

    fn c_mul(
        &mut self,
        to_mul: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()> {
        fan!(self, e => e.c_mul(to_mul, in_out_start, carry_start, length, controls))
    }

    fn c_div(
        &mut self,
        to_div: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()> {
        fan!(self, e => e.c_div(to_div, in_out_start, carry_start, length, controls))
    }

    fn c_mul_mod_n_out(
        &mut self,
        to_mul: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()> {
        fan!(self, e => e.c_mul_mod_n_out(to_mul, mod_n, in_start, out_start, length, controls))
    }

    fn c_imul_mod_n_out(
        &mut self,
        to_mul: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()> {
        fan!(self, e => e.c_imul_mod_n_out(to_mul, mod_n, in_start, out_start, length, controls))
    }

    fn c_pow_mod_n_out(
        &mut self,
        base: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()> {
        fan!(self, e => e.c_pow_mod_n_out(base, mod_n, in_start, out_start, length, controls))
    }

    fn full_add(
        &mut self,
        input1: usize,
        input2: usize,
        carry_in_sum_out: usize,
        carry_out: usize,
    ) -> Result<()> {
        fan!(self, e => e.full_add(input1, input2, carry_in_sum_out, carry_out))
    }

    fn i_full_add(
        &mut self,
        input1: usize,
        input2: usize,
        carry_in_sum_out: usize,
        carry_out: usize,
    ) -> Result<()> {
        fan!(self, e => e.i_full_add(input1, input2, carry_in_sum_out, carry_out))
    }

    fn indexed_lda(
        &mut self,
        index_start: usize,
        index_length: usize,
        value_start: usize,
        value_length: usize,
        values: &[u8],
    ) -> Result<BasisIndex> {
        fan!(self, e => e.indexed_lda(index_start, index_length, value_start, value_length, values))
    }

    fn indexed_adc(
        &mut self,
        index_start: usize,
        index_length: usize,
        value_start: usize,
        value_length: usize,
        carry_index: usize,
        values: &[u8],
    ) -> Result<BasisIndex> {
        fan!(self, e => {
            e.indexed_adc(index_start, index_length, value_start, value_length, carry_index, values)
        })
    }

    fn indexed_sbc(
        &mut self,
        index_start: usize,
        index_length: usize,
        value_start: usize,
        value_length: usize,
        carry_index: usize,
        values: &[u8],
    ) -> Result<BasisIndex> {
        fan!(self, e => {
            e.indexed_sbc(index_start, index_length, value_start, value_length, carry_index, values)
        })
    }

    fn hash(&mut self, start: usize, length: usize, values: &[u8]) -> Result<()> {
        fan!(self, e => e.hash(start, length, values))
    }

    fn set_reg(&mut self, start: usize, length: usize, value: BasisIndex) -> Result<()> {
        fan!(self, e => e.set_reg(start, length, value))
    }

    fn zero_phase_flip(&mut self, start: usize, length: usize) -> Result<()> {
        fan!(self, e => e.zero_phase_flip(start, length))
    }

    fn phase_flip_if_less(
        &mut self,
        greater_perm: BasisIndex,
        start: usize,
        length: usize,
    ) -> Result<()> {
        fan!(self, e => e.phase_flip_if_less(greater_perm, start, length))
    }

    fn c_phase_flip_if_less(
        &mut self,
        greater_perm: BasisIndex,
        start: usize,
        length: usize,
        flag_index: usize,
    ) -> Result<()> {
        fan!(self, e => e.c_phase_flip_if_less(greater_perm, start, length, flag_index))
    }

    fn phase_flip(&mut self) -> Result<()> {
        fan!(self, e => e.phase_flip())
    }

    fn prob(&mut self, qubit: usize) -> Result<f64> {
        fan!(self, e => e.prob(qubit))
    }

    fn prob_all(&mut self, perm: BasisIndex) -> Result<f64> {
        fan!(self, e => e.prob_all(perm))
    }

    fn prob_reg(&mut self, start: usize, length: usize, value: BasisIndex) -> Result<f64> {
        fan!(self, e => e.prob_reg(start, length, value))
    }

    fn prob_mask(&mut self, mask: BasisIndex, value: BasisIndex) -> Result<f64> {
        fan!(self, e => e.prob_mask(mask, value))
    }

    fn prob_parity(&mut self, mask: BasisIndex) -> Result<f64> {
        fan!(self, e => e.prob_parity(mask))
    }

    fn force_m(&mut self, qubit: usize, result: bool, do_force: bool) -> Result<bool> {
        fan!(self, e => e.force_m(qubit, result, do_force))
    }

    fn force_m_parity(&mut self, mask: BasisIndex, result: bool, do_force: bool) -> Result<bool> {
        fan!(self, e => e.force_m_parity(mask, result, do_force))
    }

    fn m_all(&mut self) -> Result<BasisIndex> {
        fan!(self, e => e.m_all())
    }

    fn compose(&mut self, other: Self) -> Result<usize> {
        let start = self.qubit_count();
        self.compose_at(other, start)
    }

    fn compose_at(&mut self, other: Self, start: usize) -> Result<usize> {
        match (self, other) {
            (Backend::Hybrid(a), Backend::Hybrid(b)) => a.compose_at(b, start),
            (Backend::Paged(a), Backend::Paged(b)) => a.compose_at(b, start),
            (Backend::Cpu(a), Backend::Cpu(b)) => a.compose_at(b, start),
            _ => Err(SimError::BackendFailure {
                reason: "cannot compose engines of different kinds".into(),
            }),
        }
    }

    fn decompose(&mut self, start: usize, length: usize) -> Result<Self> {
        match self {
            Backend::Hybrid(e) => e.decompose(start, length).map(Backend::Hybrid),
            Backend::Paged(e) => e.decompose(start, length).map(Backend::Paged),
            Backend::Cpu(e) => e.decompose(start, length).map(Backend::Cpu),
        }
    }

    fn dispose(&mut self, start: usize, length: usize) -> Result<()> {
        fan!(self, e => e.dispose(start, length))
    }

    fn dispose_perm(&mut self, start: usize, length: usize, perm: BasisIndex) -> Result<()> {
        fan!(self, e => e.dispose_perm(start, length, perm))
    }

    fn normalize_state(&mut self) -> Result<()> {
        fan!(self, e => e.normalize_state())
    }

    fn update_running_norm(&mut self) -> Result<f64> {
        fan!(self, e => e.update_running_norm())
    }

    fn sum_sqr_diff(&mut self, other: &mut Self) -> Result<f64> {
        match (self, other) {
            (Backend::Hybrid(a), Backend::Hybrid(b)) => a.sum_sqr_diff(b),
            (Backend::Paged(a), Backend::Paged(b)) => a.sum_sqr_diff(b),
            (Backend::Cpu(a), Backend::Cpu(b)) => a.sum_sqr_diff(b),
            _ => Err(SimError::BackendFailure {
                reason: "cannot compare engines of different kinds".into(),
            }),
        }
    }
}
