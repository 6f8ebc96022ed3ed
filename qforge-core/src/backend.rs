//! The engine operations trait
//!
//! Every engine layer (dense/sparse state vector, pager, stabilizer
//! hybrid, unit) implements this one surface, so layers stack and
//! sub-engines swap freely. There is no open extension point: the trait
//! covers the gate, probability, arithmetic, measurement, and
//! compose/decompose contract of the simulator and nothing else.
//!
//! Conventions: gate matrices are 2×2 row-major `[Complex64; 4]`.
//! Controlled (`mc_`) forms fire when every control reads |1⟩;
//! anti-controlled (`mac_`) forms when every control reads |0⟩. Register
//! arithmetic treats a bit range as a little-endian unsigned integer and
//! permutes basis states modulo the range width.

use num_complex::Complex64;

use crate::error::Result;
use crate::types::BasisIndex;

pub trait QuantumBackend {
    fn qubit_count(&self) -> usize;

    fn max_q_power(&self) -> BasisIndex {
        1u64 << self.qubit_count()
    }

    /// Drain any pending asynchronous work
    fn finish(&mut self) {}

    // --- state preparation and inspection ---

    fn set_permutation(&mut self, perm: BasisIndex) -> Result<()>;
    fn set_quantum_state(&mut self, amplitudes: &[Complex64]) -> Result<()>;
    fn get_quantum_state(&mut self, out: &mut [Complex64]) -> Result<()>;
    fn get_probs(&mut self, out: &mut [f64]) -> Result<()>;
    fn get_amplitude(&mut self, perm: BasisIndex) -> Result<Complex64>;

    // --- single-qubit gates ---

    /// Apply an arbitrary 2×2 unitary to `target`
    fn mtrx(&mut self, m: &[Complex64; 4], target: usize) -> Result<()>;
    /// Apply diag(top_left, bottom_right) to `target`
    fn phase(&mut self, top_left: Complex64, bottom_right: Complex64, target: usize) -> Result<()>;
    /// Apply the anti-diagonal [[0, top_right], [bottom_left, 0]] to `target`
    fn invert(&mut self, top_right: Complex64, bottom_left: Complex64, target: usize)
        -> Result<()>;

    fn mc_mtrx(&mut self, controls: &[usize], m: &[Complex64; 4], target: usize) -> Result<()>;
    fn mac_mtrx(&mut self, controls: &[usize], m: &[Complex64; 4], target: usize) -> Result<()>;
    fn mc_phase(
        &mut self,
        controls: &[usize],
        top_left: Complex64,
        bottom_right: Complex64,
        target: usize,
    ) -> Result<()>;
    fn mac_phase(
        &mut self,
        controls: &[usize],
        top_left: Complex64,
        bottom_right: Complex64,
        target: usize,
    ) -> Result<()>;
    fn mc_invert(
        &mut self,
        controls: &[usize],
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()>;
    fn mac_invert(
        &mut self,
        controls: &[usize],
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()>;

    /// Apply `mtrxs[k]` to `target` on basis states where the controls read
    /// as the little-endian integer k (`controls[j]` supplies bit j).
    /// `mtrxs.len()` must be `2^controls.len()`.
    fn uniformly_controlled_single_bit(
        &mut self,
        controls: &[usize],
        target: usize,
        mtrxs: &[[Complex64; 4]],
    ) -> Result<()>;

    /// Multiply each amplitude by e^{±iθ} by the parity of its index under
    /// `mask`: odd parity gets e^{+iθ}, even parity e^{-iθ}.
    fn uniform_parity_rz(&mut self, mask: BasisIndex, angle: f64) -> Result<()>;
    fn c_uniform_parity_rz(
        &mut self,
        controls: &[usize],
        mask: BasisIndex,
        angle: f64,
    ) -> Result<()>;

    fn swap(&mut self, qubit1: usize, qubit2: usize) -> Result<()>;

    // --- register arithmetic ---

    /// Rotate the bits of the range left by `shift`
    fn rol(&mut self, shift: usize, start: usize, length: usize) -> Result<()>;

    fn inc(&mut self, to_add: BasisIndex, start: usize, length: usize) -> Result<()>;
    fn c_inc(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()>;
    /// Add with carry-out: the carry qubit is flipped on overflow
    fn inc_c(&mut self, to_add: BasisIndex, start: usize, length: usize, carry: usize)
        -> Result<()>;
    fn dec_c(&mut self, to_sub: BasisIndex, start: usize, length: usize, carry: usize)
        -> Result<()>;
    /// Add with signed-overflow flag: the overflow qubit is flipped when
    /// two's-complement addition overflows
    fn inc_s(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        overflow: usize,
    ) -> Result<()>;
    fn inc_sc(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        overflow: usize,
        carry: usize,
    ) -> Result<()>;
    fn dec_sc(
        &mut self,
        to_sub: BasisIndex,
        start: usize,
        length: usize,
        overflow: usize,
        carry: usize,
    ) -> Result<()>;

    /// Multiply the range by an odd `to_mul`, high half into the carry range
    fn mul(
        &mut self,
        to_mul: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
    ) -> Result<()>;
    /// Inverse of `mul`
    fn div(
        &mut self,
        to_div: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
    ) -> Result<()>;

    /// out += (in * to_mul) mod N; the output range starts in |0…0⟩
    fn mul_mod_n_out(
        &mut self,
        to_mul: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
    ) -> Result<()>;
    fn imul_mod_n_out(
        &mut self,
        to_mul: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
    ) -> Result<()>;
    /// out += (base ^ in) mod N; the output range starts in |0…0⟩
    fn pow_mod_n_out(
        &mut self,
        base: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
    ) -> Result<()>;

    fn c_mul(
        &mut self,
        to_mul: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()>;
    fn c_div(
        &mut self,
        to_div: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()>;
    fn c_mul_mod_n_out(
        &mut self,
        to_mul: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()>;
    fn c_imul_mod_n_out(
        &mut self,
        to_mul: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()>;
    fn c_pow_mod_n_out(
        &mut self,
        base: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()>;

    /// Reversible full adder over three qubits with carry-out
    fn full_add(
        &mut self,
        input1: usize,
        input2: usize,
        carry_in_sum_out: usize,
        carry_out: usize,
    ) -> Result<()>;
    fn i_full_add(
        &mut self,
        input1: usize,
        input2: usize,
        carry_in_sum_out: usize,
        carry_out: usize,
    ) -> Result<()>;

    // --- indexed classical-table operations ---

    /// value := table[index]; returns the expectation of the value register
    fn indexed_lda(
        &mut self,
        index_start: usize,
        index_length: usize,
        value_start: usize,
        value_length: usize,
        values: &[u8],
    ) -> Result<BasisIndex>;
    /// value += table[index] + carry, carry flipped on overflow
    fn indexed_adc(
        &mut self,
        index_start: usize,
        index_length: usize,
        value_start: usize,
        value_length: usize,
        carry_index: usize,
        values: &[u8],
    ) -> Result<BasisIndex>;
    /// value -= table[index] + (1 - carry), carry flipped on borrow
    fn indexed_sbc(
        &mut self,
        index_start: usize,
        index_length: usize,
        value_start: usize,
        value_length: usize,
        carry_index: usize,
        values: &[u8],
    ) -> Result<BasisIndex>;
    /// Permute the range by a bijective byte table
    fn hash(&mut self, start: usize, length: usize, values: &[u8]) -> Result<()>;

    /// Measure the range and force it to `value`
    fn set_reg(&mut self, start: usize, length: usize, value: BasisIndex) -> Result<()>;

    // --- phase flips ---

    /// Flip the phase of states whose range reads zero
    fn zero_phase_flip(&mut self, start: usize, length: usize) -> Result<()>;
    /// Flip the phase of states whose range reads less than `greater_perm`
    fn phase_flip_if_less(
        &mut self,
        greater_perm: BasisIndex,
        start: usize,
        length: usize,
    ) -> Result<()>;
    fn c_phase_flip_if_less(
        &mut self,
        greater_perm: BasisIndex,
        start: usize,
        length: usize,
        flag_index: usize,
    ) -> Result<()>;
    /// Global phase flip (observable only relative to another register)
    fn phase_flip(&mut self) -> Result<()>;

    // --- probability and measurement ---

    /// Probability of qubit reading |1⟩
    fn prob(&mut self, qubit: usize) -> Result<f64>;
    /// Probability of the full register reading `perm`
    fn prob_all(&mut self, perm: BasisIndex) -> Result<f64>;
    /// Probability of the range reading `value`
    fn prob_reg(&mut self, start: usize, length: usize, value: BasisIndex) -> Result<f64>;
    /// Probability of the masked bits reading `value`
    fn prob_mask(&mut self, mask: BasisIndex, value: BasisIndex) -> Result<f64>;
    /// Probability of odd parity over the masked bits
    fn prob_parity(&mut self, mask: BasisIndex) -> Result<f64>;

    /// Projective Z-basis measurement. With `do_force`, `result` must have
    /// non-negligible probability, or the call fails.
    fn force_m(&mut self, qubit: usize, result: bool, do_force: bool) -> Result<bool>;

    fn m(&mut self, qubit: usize) -> Result<bool> {
        self.force_m(qubit, false, false)
    }

    /// Projective measurement of the parity of the masked bits
    fn force_m_parity(&mut self, mask: BasisIndex, result: bool, do_force: bool) -> Result<bool>;

    /// Measure every qubit, collapsing to one basis state
    fn m_all(&mut self) -> Result<BasisIndex>;

    // --- composition ---

    /// Tensor-append `other` after this register's last qubit; returns the
    /// start index the appended qubits received
    fn compose(&mut self, other: Self) -> Result<usize>
    where
        Self: Sized;
    /// Tensor-insert `other` at qubit `start`
    fn compose_at(&mut self, other: Self, start: usize) -> Result<usize>
    where
        Self: Sized;
    /// Factor the range out into its own engine; fails with
    /// `SeparabilityViolation` when the range is entangled with the rest
    fn decompose(&mut self, start: usize, length: usize) -> Result<Self>
    where
        Self: Sized;
    /// Decompose and discard
    fn dispose(&mut self, start: usize, length: usize) -> Result<()>;
    /// Discard a range known to hold the basis state `perm`
    fn dispose_perm(&mut self, start: usize, length: usize, perm: BasisIndex) -> Result<()>;

    // --- normalization ---

    /// Rescale to unit norm, zeroing below-threshold amplitudes
    fn normalize_state(&mut self) -> Result<()>;
    /// Recompute and return the running squared norm
    fn update_running_norm(&mut self) -> Result<f64>;

    /// Σ|aᵢ - bᵢ|² against another engine of the same width
    fn sum_sqr_diff(&mut self, other: &mut Self) -> Result<f64>
    where
        Self: Sized;

    fn approx_compare(&mut self, other: &mut Self, error_tol: f64) -> Result<bool>
    where
        Self: Sized,
    {
        Ok(self.sum_sqr_diff(other)? <= error_tol)
    }
}
