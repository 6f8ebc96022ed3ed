//! Stabilizer-hybrid layer
//!
//! Holds either a stabilizer tableau or a dense state-vector backend,
//! never both. Clifford operations run on the tableau; non-Clifford
//! single-qubit matrices first compose into a per-qubit buffered gate
//! ("shard"), and promotion to the dense backend is deferred until an
//! operation actually demands amplitudes. Once promoted, an instance
//! never returns to the tableau except through a full state reset.
//!
//! Controlled gates are trimmed against the tableau's exact Z probe
//! before anything else: a control fixed to |0⟩ eliminates the gate, a
//! control fixed to |1⟩ drops out of the control list, and an emptied
//! list re-dispatches the base gate.

use std::f64::consts::FRAC_1_SQRT_2;

use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use qforge_core::error::{check_qubit, check_range};
use qforge_core::{
    is_norm_zero, is_same_complex, pow2, BasisIndex, EngineConfig, QuantumBackend, Result,
    SimError, FP_NORM_EPSILON, ONE_CMPLX, ZERO_CMPLX,
};
use qforge_state::{QEngineCpu, QPager};

use crate::tableau::QStabilizer;

const I_CMPLX: Complex64 = Complex64::new(0.0, 1.0);

/// Dense backend behind the hybrid: flat CPU engine or pager
#[derive(Clone, Debug)]
pub enum DenseBackend {
    Cpu(QEngineCpu),
    Paged(QPager),
}

macro_rules! dense {
    ($backend:expr, $e:ident => $body:expr) => {
        match $backend {
            DenseBackend::Cpu($e) => $body,
            DenseBackend::Paged($e) => $body,
        }
    };
}

impl DenseBackend {
    fn make(qubit_count: usize, perm: BasisIndex, config: &EngineConfig) -> Result<Self> {
        if config.use_paging && qubit_count > config.page_qubits {
            Ok(DenseBackend::Paged(QPager::new(qubit_count, perm, config)?))
        } else {
            Ok(DenseBackend::Cpu(QEngineCpu::new(
                qubit_count,
                perm,
                config,
            )?))
        }
    }
}

/// Buffered single-qubit gate pending on one qubit
#[derive(Clone, Debug)]
struct CliffordShard {
    gate: [Complex64; 4],
}

impl CliffordShard {
    fn new(gate: [Complex64; 4]) -> Self {
        Self { gate }
    }

    /// Apply `outer` after the buffered gate: gate := outer · gate
    fn compose(&mut self, outer: &[Complex64; 4]) {
        self.gate = mat_mul_2x2(outer, &self.gate);
    }

    fn is_phase(&self) -> bool {
        is_norm_zero(self.gate[1]) && is_norm_zero(self.gate[2])
    }

    fn is_invert(&self) -> bool {
        is_norm_zero(self.gate[0]) && is_norm_zero(self.gate[3])
    }
}

fn mat_mul_2x2(a: &[Complex64; 4], b: &[Complex64; 4]) -> [Complex64; 4] {
    [
        a[0] * b[0] + a[1] * b[2],
        a[0] * b[1] + a[1] * b[3],
        a[2] * b[0] + a[3] * b[2],
        a[2] * b[1] + a[3] * b[3],
    ]
}

/// Clifford-while-possible engine with transparent dense promotion
pub struct QStabilizerHybrid {
    qubit_count: usize,
    stabilizer: Option<QStabilizer>,
    engine: Option<DenseBackend>,
    shards: Vec<Option<CliffordShard>>,
    /// Whether each shard was buffered against a Z-eigenstate qubit
    shards_eigen_z: Vec<bool>,
    config: EngineConfig,
    rng: StdRng,
}

impl QStabilizerHybrid {
    pub fn new(qubit_count: usize, perm: BasisIndex, config: &EngineConfig) -> Result<Self> {
        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut stab_config = config.clone();
        stab_config.rng_seed = Some(rng.gen());
        let stabilizer = QStabilizer::new(qubit_count, perm, &stab_config)?;
        Ok(Self {
            qubit_count,
            stabilizer: Some(stabilizer),
            engine: None,
            shards: vec![None; qubit_count],
            shards_eigen_z: vec![false; qubit_count],
            config: config.clone(),
            rng,
        })
    }

    pub fn is_clifford(&self) -> bool {
        self.stabilizer.is_some()
    }

    fn engine_mut(&mut self) -> &mut DenseBackend {
        self.engine
            .as_mut()
            .expect("hybrid holds exactly one of tableau or engine")
    }

    /// Materialize the tableau into dense amplitudes and flush every
    /// buffered shard. One-way; there is no automatic demotion.
    pub fn switch_to_engine(&mut self) -> Result<()> {
        if self.engine.is_some() {
            return Ok(());
        }
        let mut stabilizer = self
            .stabilizer
            .take()
            .expect("hybrid holds exactly one of tableau or engine");
        let dim = pow2(self.qubit_count) as usize;
        let mut amplitudes = vec![ZERO_CMPLX; dim];
        stabilizer.get_quantum_state(&mut amplitudes)?;

        let mut engine_config = self.config.clone();
        engine_config.rng_seed = Some(self.rng.gen());
        let mut engine = DenseBackend::make(self.qubit_count, 0, &engine_config)?;
        dense!(&mut engine, e => e.set_quantum_state(&amplitudes))?;

        for q in 0..self.qubit_count {
            if let Some(shard) = self.shards[q].take() {
                dense!(&mut engine, e => e.mtrx(&shard.gate, q))?;
            }
        }
        self.engine = Some(engine);
        Ok(())
    }

    /// Flush every buffered shard, promoting if any is pending
    fn flush_buffers(&mut self) -> Result<()> {
        if self.engine.is_some() {
            return Ok(());
        }
        if self.shards.iter().any(Option::is_some) {
            self.switch_to_engine()?;
        }
        Ok(())
    }

    /// A non-phase shard on any of these qubits blocks tableau-side
    /// controlled gates
    fn flush_if_blocked(&mut self, qubits: &[usize]) -> Result<()> {
        if self.engine.is_some() {
            return Ok(());
        }
        let blocked = qubits
            .iter()
            .any(|&q| matches!(&self.shards[q], Some(shard) if !shard.is_phase()));
        if blocked {
            self.switch_to_engine()?;
        }
        Ok(())
    }

    /// Probability-exact control trimming against the tableau.
    ///
    /// Returns `None` when some control makes the gate a provable no-op;
    /// otherwise the list with definite-|1⟩ (or |0⟩ for anti) controls
    /// removed.
    fn trim_controls(&mut self, controls: &[usize], anti: bool) -> Result<Option<Vec<usize>>> {
        if self.engine.is_some() {
            return Ok(Some(controls.to_vec()));
        }
        let mut kept = Vec::with_capacity(controls.len());
        for &c in controls {
            let flip = match &self.shards[c] {
                None => Some(false),
                Some(shard) if shard.is_phase() => Some(false),
                Some(shard) if shard.is_invert() => Some(true),
                _ => None,
            };
            let Some(flip) = flip else {
                kept.push(c);
                continue;
            };
            let stabilizer = self
                .stabilizer
                .as_mut()
                .expect("tableau present when engine is not");
            let mut p = stabilizer.prob(c)?;
            if flip {
                p = 1.0 - p;
            }
            let fires_on = if anti { 0.0 } else { 1.0 };
            if (p - fires_on).abs() <= FP_NORM_EPSILON {
                // Control definitely satisfied: drop it.
            } else if (p - (1.0 - fires_on)).abs() <= FP_NORM_EPSILON {
                // Control definitely unsatisfied: gate is a no-op.
                return Ok(None);
            } else {
                kept.push(c);
            }
        }
        Ok(Some(kept))
    }

    fn apply_global_phase(&mut self, factor: Complex64) {
        if self.config.global_phase_is_random || is_norm_zero(factor - ONE_CMPLX) {
            return;
        }
        if let Some(stabilizer) = self.stabilizer.as_mut() {
            stabilizer.apply_global_phase(factor.arg());
        } else if let Some(engine) = self.engine.as_mut() {
            let _ = dense!(engine, e => e.phase(factor, factor, 0));
        }
    }

    /// Collapse a buffered general shard on a Z-eigenstate qubit
    fn collapse_separable_shard(
        &mut self,
        q: usize,
        result: Option<bool>,
    ) -> Result<bool> {
        let shard = self.shards[q].take().expect("caller checked the shard");
        let stabilizer = self
            .stabilizer
            .as_mut()
            .expect("tableau present when engine is not");
        let held = stabilizer.prob(q)? >= 0.5;
        // Column `held` of the buffered gate is the qubit's actual state.
        let (amp0, amp1) = if held {
            (shard.gate[1], shard.gate[3])
        } else {
            (shard.gate[0], shard.gate[2])
        };
        let total = amp0.norm_sqr() + amp1.norm_sqr();
        let prob_one = if total > FP_NORM_EPSILON {
            amp1.norm_sqr() / total
        } else {
            return Err(SimError::DegenerateState { norm: total });
        };
        let outcome = match result {
            Some(forced) => {
                let p = if forced { prob_one } else { 1.0 - prob_one };
                if p <= FP_NORM_EPSILON {
                    return Err(SimError::invalid(
                        "forced measurement outcome has zero probability",
                    ));
                }
                forced
            }
            None => self.rng.gen::<f64>() < prob_one,
        };
        let stabilizer = self
            .stabilizer
            .as_mut()
            .expect("tableau present when engine is not");
        if outcome != held {
            stabilizer.x(q);
        }
        Ok(outcome)
    }

    /// Clifford classification ladder for a full 2×2 matrix
    fn try_clifford_mtrx(&mut self, m: &[Complex64; 4], t: usize) -> bool {
        let stabilizer = match self.stabilizer.as_mut() {
            Some(s) => s,
            None => return false,
        };
        let same = is_same_complex;
        let (m0, m1, m2, m3) = (m[0], m[1], m[2], m[3]);

        if same(m0, m1) && same(m0, m2) && same(m0, -m3) {
            stabilizer.h(t);
        } else if same(m0, m1) && same(m0, -m2) && same(m0, m3) {
            stabilizer.isqrt_y(t);
        } else if same(m0, -m1) && same(m0, m2) && same(m0, m3) {
            stabilizer.sqrt_y(t);
        } else if same(m0, m1) && same(m0, -I_CMPLX * m2) && same(m0, I_CMPLX * m3) {
            stabilizer.h(t);
            stabilizer.s(t);
        } else if same(m0, I_CMPLX * m1) && same(m0, m2) && same(m0, -I_CMPLX * m3) {
            stabilizer.is(t);
            stabilizer.h(t);
        } else if same(m0, -I_CMPLX * m1) && same(m0, -I_CMPLX * m2) && same(m0, m3) {
            stabilizer.isqrt_x(t);
        } else if same(m0, I_CMPLX * m1) && same(m0, I_CMPLX * m2) && same(m0, m3) {
            stabilizer.sqrt_x(t);
        } else if same(m0, -m1) && same(m0, I_CMPLX * m2) && same(m0, I_CMPLX * m3) {
            stabilizer.y(t);
            stabilizer.h(t);
            stabilizer.s(t);
        } else if same(m0, -I_CMPLX * m1) && same(m0, -m2) && same(m0, -I_CMPLX * m3) {
            stabilizer.is(t);
            stabilizer.h(t);
            stabilizer.y(t);
        } else {
            return false;
        }
        true
    }

    fn tableau_mut(&mut self) -> &mut QStabilizer {
        self.stabilizer
            .as_mut()
            .expect("tableau present when engine is not")
    }

    fn phase_on_tableau(
        &mut self,
        top_left: Complex64,
        bottom_right: Complex64,
        t: usize,
    ) -> Result<()> {
        if is_same_complex(top_left, bottom_right) {
            self.apply_global_phase(top_left);
            return Ok(());
        }
        if is_same_complex(top_left, -bottom_right) {
            self.tableau_mut().z(t);
            self.apply_global_phase(top_left);
            return Ok(());
        }
        let ratio = bottom_right / top_left;
        if is_same_complex(ratio, I_CMPLX) {
            self.tableau_mut().s(t);
            self.apply_global_phase(top_left);
            return Ok(());
        }
        if is_same_complex(ratio, -I_CMPLX) {
            self.tableau_mut().is(t);
            self.apply_global_phase(top_left);
            return Ok(());
        }
        if self.tableau_mut().is_separable_z(t) {
            // A diagonal gate only shifts the global phase of a Z
            // eigenstate.
            let held = self.tableau_mut().prob(t)? >= 0.5;
            self.apply_global_phase(if held { bottom_right } else { top_left });
            return Ok(());
        }
        self.shards[t] = Some(CliffordShard::new([
            top_left, ZERO_CMPLX, ZERO_CMPLX, bottom_right,
        ]));
        self.shards_eigen_z[t] = false;
        Ok(())
    }

    fn invert_on_tableau(
        &mut self,
        top_right: Complex64,
        bottom_left: Complex64,
        t: usize,
    ) -> Result<()> {
        if is_same_complex(top_right, bottom_left) {
            self.tableau_mut().x(t);
            self.apply_global_phase(top_right);
            return Ok(());
        }
        if is_same_complex(top_right, -bottom_left) {
            self.tableau_mut().y(t);
            // M = bl * (-i) * Y
            self.apply_global_phase(bottom_left * Complex64::new(0.0, -1.0));
            return Ok(());
        }
        let ratio = top_right / bottom_left;
        if is_same_complex(ratio, I_CMPLX) {
            self.tableau_mut().s(t);
            self.tableau_mut().x(t);
            self.apply_global_phase(bottom_left);
            return Ok(());
        }
        if is_same_complex(ratio, -I_CMPLX) {
            self.tableau_mut().is(t);
            self.tableau_mut().x(t);
            self.apply_global_phase(bottom_left);
            return Ok(());
        }
        self.shards[t] = Some(CliffordShard::new([
            ZERO_CMPLX,
            top_right,
            bottom_left,
            ZERO_CMPLX,
        ]));
        self.shards_eigen_z[t] = false;
        Ok(())
    }
}

impl QuantumBackend for QStabilizerHybrid {
    fn qubit_count(&self) -> usize {
        self.qubit_count
    }

    fn finish(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            dense!(engine, e => e.finish());
        }
    }

    fn set_permutation(&mut self, perm: BasisIndex) -> Result<()> {
        if perm >= pow2(self.qubit_count) {
            return Err(SimError::InvalidBasisState {
                index: perm,
                dimension: pow2(self.qubit_count),
            });
        }
        // A full reset is the one road back to stabilizer representation.
        self.engine = None;
        self.shards = vec![None; self.qubit_count];
        self.shards_eigen_z = vec![false; self.qubit_count];
        match self.stabilizer.as_mut() {
            Some(stabilizer) => stabilizer.set_permutation(perm)?,
            None => {
                let mut stab_config = self.config.clone();
                stab_config.rng_seed = Some(self.rng.gen());
                self.stabilizer = Some(QStabilizer::new(self.qubit_count, perm, &stab_config)?);
            }
        }
        Ok(())
    }

    fn set_quantum_state(&mut self, amplitudes: &[Complex64]) -> Result<()> {
        if amplitudes.len() as u64 != pow2(self.qubit_count) {
            return Err(SimError::invalid("state length mismatch"));
        }
        if self.qubit_count == 1 && self.stabilizer.is_some() {
            // A single qubit re-prepares on the tableau via one unitary.
            let prob_one = amplitudes[1].norm_sqr();
            let sqrt1 = prob_one.sqrt();
            let sqrt0 = (1.0 - prob_one).max(0.0).sqrt();
            let phase0 = Complex64::from_polar(1.0, amplitudes[0].arg());
            let phase1 = Complex64::from_polar(1.0, amplitudes[1].arg());
            self.set_permutation(0)?;
            let m = [
                sqrt0 * phase0,
                sqrt1 * phase0,
                sqrt1 * phase1,
                -(sqrt0 * phase1),
            ];
            return self.mtrx(&m, 0);
        }
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.set_quantum_state(amplitudes))
    }

    fn get_quantum_state(&mut self, out: &mut [Complex64]) -> Result<()> {
        if self.stabilizer.is_some() && self.shards.iter().all(Option::is_none) {
            return self
                .stabilizer
                .as_mut()
                .expect("checked above")
                .get_quantum_state(out);
        }
        self.flush_buffers()?;
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.get_quantum_state(out))
    }

    fn get_probs(&mut self, out: &mut [f64]) -> Result<()> {
        if self.stabilizer.is_some() && self.shards.iter().all(Option::is_none) {
            return self
                .stabilizer
                .as_mut()
                .expect("checked above")
                .get_probs(out);
        }
        self.flush_buffers()?;
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.get_probs(out))
    }

    fn get_amplitude(&mut self, perm: BasisIndex) -> Result<Complex64> {
        if self.stabilizer.is_some() && self.shards.iter().all(Option::is_none) {
            return self
                .stabilizer
                .as_mut()
                .expect("checked above")
                .get_amplitude(perm);
        }
        self.flush_buffers()?;
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.get_amplitude(perm))
    }

    fn mtrx(&mut self, m: &[Complex64; 4], target: usize) -> Result<()> {
        check_qubit(target, self.qubit_count)?;

        // Fold any pending shard into the incoming matrix first.
        let (mtrx, was_cached) = match self.shards[target].take() {
            Some(mut shard) => {
                shard.compose(m);
                (shard.gate, true)
            }
            None => (*m, false),
        };

        if is_norm_zero(mtrx[1]) && is_norm_zero(mtrx[2]) {
            return self.phase(mtrx[0], mtrx[3], target);
        }
        if is_norm_zero(mtrx[0]) && is_norm_zero(mtrx[3]) {
            return self.invert(mtrx[1], mtrx[2], target);
        }

        if let Some(engine) = self.engine.as_mut() {
            return dense!(engine, e => e.mtrx(&mtrx, target));
        }

        if self.try_clifford_mtrx(&mtrx, target) {
            return Ok(());
        }

        let mut shard = CliffordShard::new(mtrx);
        if !was_cached {
            let stabilizer = self
                .stabilizer
                .as_mut()
                .expect("tableau present when engine is not");
            // Align the buffer with the computational basis when the
            // qubit sits in a known eigenbasis; Z wins ties by probing
            // order.
            if stabilizer.is_separable_z(target) {
                self.shards_eigen_z[target] = true;
            } else if stabilizer.is_separable_x(target) {
                let h = FRAC_1_SQRT_2;
                let conversion = [
                    Complex64::new(h, 0.0),
                    Complex64::new(h, 0.0),
                    Complex64::new(h, 0.0),
                    Complex64::new(-h, 0.0),
                ];
                shard = CliffordShard::new(mat_mul_2x2(&shard.gate, &conversion));
                stabilizer.h(target);
                self.shards_eigen_z[target] = true;
            } else if stabilizer.is_separable_y(target) {
                let h = FRAC_1_SQRT_2;
                // Pending gate times (S·H): the undo of the IS, H pair
                // applied to the tableau below.
                let conversion = [
                    Complex64::new(h, 0.0),
                    Complex64::new(h, 0.0),
                    Complex64::new(0.0, h),
                    Complex64::new(0.0, -h),
                ];
                shard = CliffordShard::new(mat_mul_2x2(&shard.gate, &conversion));
                stabilizer.is(target);
                stabilizer.h(target);
                self.shards_eigen_z[target] = true;
            } else {
                self.shards_eigen_z[target] = false;
            }
        }

        if self.shards_eigen_z[target] {
            if shard.is_phase() {
                return Ok(());
            }
            if shard.is_invert() {
                self.stabilizer
                    .as_mut()
                    .expect("tableau present when engine is not")
                    .x(target);
                return Ok(());
            }
        }

        self.shards[target] = Some(shard);
        Ok(())
    }

    fn phase(&mut self, top_left: Complex64, bottom_right: Complex64, target: usize) -> Result<()> {
        check_qubit(target, self.qubit_count)?;
        if is_same_complex(top_left, ONE_CMPLX) && is_same_complex(bottom_right, ONE_CMPLX) {
            return Ok(());
        }
        if self.shards[target].is_some() {
            let m = [top_left, ZERO_CMPLX, ZERO_CMPLX, bottom_right];
            return self.mtrx(&m, target);
        }
        if let Some(engine) = self.engine.as_mut() {
            return dense!(engine, e => e.phase(top_left, bottom_right, target));
        }
        self.phase_on_tableau(top_left, bottom_right, target)
    }

    fn invert(
        &mut self,
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()> {
        check_qubit(target, self.qubit_count)?;
        if self.shards[target].is_some() {
            let m = [ZERO_CMPLX, top_right, bottom_left, ZERO_CMPLX];
            return self.mtrx(&m, target);
        }
        if let Some(engine) = self.engine.as_mut() {
            return dense!(engine, e => e.invert(top_right, bottom_left, target));
        }
        self.invert_on_tableau(top_right, bottom_left, target)
    }

    fn mc_mtrx(&mut self, controls: &[usize], m: &[Complex64; 4], target: usize) -> Result<()> {
        if is_norm_zero(m[1]) && is_norm_zero(m[2]) {
            return self.mc_phase(controls, m[0], m[3], target);
        }
        if is_norm_zero(m[0]) && is_norm_zero(m[3]) {
            return self.mc_invert(controls, m[1], m[2], target);
        }
        check_qubit(target, self.qubit_count)?;
        let Some(kept) = self.trim_controls(controls, false)? else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.mtrx(m, target);
        }
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.mc_mtrx(&kept, m, target))
    }

    fn mac_mtrx(&mut self, controls: &[usize], m: &[Complex64; 4], target: usize) -> Result<()> {
        if is_norm_zero(m[1]) && is_norm_zero(m[2]) {
            return self.mac_phase(controls, m[0], m[3], target);
        }
        if is_norm_zero(m[0]) && is_norm_zero(m[3]) {
            return self.mac_invert(controls, m[1], m[2], target);
        }
        check_qubit(target, self.qubit_count)?;
        let Some(kept) = self.trim_controls(controls, true)? else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.mtrx(m, target);
        }
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.mac_mtrx(&kept, m, target))
    }

    fn mc_phase(
        &mut self,
        controls: &[usize],
        top_left: Complex64,
        bottom_right: Complex64,
        target: usize,
    ) -> Result<()> {
        check_qubit(target, self.qubit_count)?;
        let Some(kept) = self.trim_controls(controls, false)? else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.phase(top_left, bottom_right, target);
        }
        if self.stabilizer.is_some() {
            // A control-symmetric phase is itself a controlled phase with
            // one fewer control, targeting the dropped control.
            if is_same_complex(top_left, bottom_right) {
                let (head, rest) = kept.split_first().expect("kept is non-empty");
                return self.mc_phase(rest, ONE_CMPLX, top_left, *head);
            }
            if kept.len() == 1 {
                self.flush_if_blocked(&[kept[0], target])?;
                if self.stabilizer.is_some() {
                    // diag(1,1,tl,br) = P(tl) on control, then CZ when
                    // br/tl = -1.
                    let ratio = bottom_right / top_left;
                    if is_same_complex(ratio, -ONE_CMPLX) {
                        self.phase(ONE_CMPLX, top_left, kept[0])?;
                        self.tableau_mut().cz(kept[0], target);
                        return Ok(());
                    }
                }
            }
        }
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.mc_phase(&kept, top_left, bottom_right, target))
    }

    fn mac_phase(
        &mut self,
        controls: &[usize],
        top_left: Complex64,
        bottom_right: Complex64,
        target: usize,
    ) -> Result<()> {
        check_qubit(target, self.qubit_count)?;
        let Some(kept) = self.trim_controls(controls, true)? else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.phase(top_left, bottom_right, target);
        }
        if self.stabilizer.is_some() && kept.len() == 1 {
            self.flush_if_blocked(&[kept[0], target])?;
            if self.stabilizer.is_some() {
                let ratio = bottom_right / top_left;
                if is_same_complex(top_left, bottom_right) {
                    // Phase on the control's |0> branch.
                    return self.phase(top_left, ONE_CMPLX, kept[0]);
                }
                if is_same_complex(ratio, -ONE_CMPLX) {
                    self.phase(top_left, ONE_CMPLX, kept[0])?;
                    self.tableau_mut().anti_cz(kept[0], target);
                    return Ok(());
                }
            }
        }
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.mac_phase(&kept, top_left, bottom_right, target))
    }

    fn mc_invert(
        &mut self,
        controls: &[usize],
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()> {
        check_qubit(target, self.qubit_count)?;
        let Some(kept) = self.trim_controls(controls, false)? else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.invert(top_right, bottom_left, target);
        }
        if self.stabilizer.is_some() && kept.len() == 1 {
            self.flush_if_blocked(&[kept[0], target])?;
            if self.stabilizer.is_some() {
                let ratio = top_right / bottom_left;
                if is_same_complex(ratio, ONE_CMPLX) || is_same_complex(ratio, -ONE_CMPLX) {
                    // M = CX · diag(1,1,bl,tr): phase the control, CZ on
                    // a -1 ratio, then CNOT.
                    self.phase(ONE_CMPLX, bottom_left, kept[0])?;
                    if is_same_complex(ratio, -ONE_CMPLX) {
                        self.tableau_mut().cz(kept[0], target);
                    }
                    self.tableau_mut().cnot(kept[0], target);
                    return Ok(());
                }
            }
        }
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.mc_invert(&kept, top_right, bottom_left, target))
    }

    fn mac_invert(
        &mut self,
        controls: &[usize],
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()> {
        check_qubit(target, self.qubit_count)?;
        let Some(kept) = self.trim_controls(controls, true)? else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.invert(top_right, bottom_left, target);
        }
        if self.stabilizer.is_some() && kept.len() == 1 {
            self.flush_if_blocked(&[kept[0], target])?;
            if self.stabilizer.is_some() {
                let ratio = top_right / bottom_left;
                if is_same_complex(ratio, ONE_CMPLX) || is_same_complex(ratio, -ONE_CMPLX) {
                    self.phase(bottom_left, ONE_CMPLX, kept[0])?;
                    if is_same_complex(ratio, -ONE_CMPLX) {
                        self.tableau_mut().anti_cz(kept[0], target);
                    }
                    self.tableau_mut().anti_cnot(kept[0], target);
                    return Ok(());
                }
            }
        }
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.mac_invert(&kept, top_right, bottom_left, target))
    }

    fn uniformly_controlled_single_bit(
        &mut self,
        controls: &[usize],
        target: usize,
        mtrxs: &[[Complex64; 4]],
    ) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.uniformly_controlled_single_bit(controls, target, mtrxs))
    }

    fn uniform_parity_rz(&mut self, mask: BasisIndex, angle: f64) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.uniform_parity_rz(mask, angle))
    }

    fn c_uniform_parity_rz(
        &mut self,
        controls: &[usize],
        mask: BasisIndex,
        angle: f64,
    ) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.c_uniform_parity_rz(controls, mask, angle))
    }

    fn swap(&mut self, qubit1: usize, qubit2: usize) -> Result<()> {
        check_qubit(qubit1, self.qubit_count)?;
        check_qubit(qubit2, self.qubit_count)?;
        if qubit1 == qubit2 {
            return Ok(());
        }
        if let Some(stabilizer) = self.stabilizer.as_mut() {
            stabilizer.swap(qubit1, qubit2);
            self.shards.swap(qubit1, qubit2);
            self.shards_eigen_z.swap(qubit1, qubit2);
            return Ok(());
        }
        dense!(self.engine_mut(), e => e.swap(qubit1, qubit2))
    }

    fn rol(&mut self, shift: usize, start: usize, length: usize) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.rol(shift, start, length))
    }

    fn inc(&mut self, to_add: BasisIndex, start: usize, length: usize) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.inc(to_add, start, length))
    }

    fn c_inc(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        let Some(kept) = self.trim_controls(controls, false)? else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.inc(to_add, start, length);
        }
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.c_inc(to_add, start, length, &kept))
    }

    fn inc_c(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        carry: usize,
    ) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.inc_c(to_add, start, length, carry))
    }

    fn dec_c(
        &mut self,
        to_sub: BasisIndex,
        start: usize,
        length: usize,
        carry: usize,
    ) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.dec_c(to_sub, start, length, carry))
    }

    fn inc_s(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        overflow: usize,
    ) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.inc_s(to_add, start, length, overflow))
    }

    fn inc_sc(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        overflow: usize,
        carry: usize,
    ) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.inc_sc(to_add, start, length, overflow, carry))
    }

    fn dec_sc(
        &mut self,
        to_sub: BasisIndex,
        start: usize,
        length: usize,
        overflow: usize,
        carry: usize,
    ) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.dec_sc(to_sub, start, length, overflow, carry))
    }

    fn mul(
        &mut self,
        to_mul: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
    ) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.mul(to_mul, in_out_start, carry_start, length))
    }

    fn div(
        &mut self,
        to_div: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
    ) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.div(to_div, in_out_start, carry_start, length))
    }

    fn mul_mod_n_out(
        &mut self,
        to_mul: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
    ) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.mul_mod_n_out(to_mul, mod_n, in_start, out_start, length))
    }

    fn imul_mod_n_out(
        &mut self,
        to_mul: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
    ) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.imul_mod_n_out(to_mul, mod_n, in_start, out_start, length))
    }

    fn pow_mod_n_out(
        &mut self,
        base: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
    ) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.pow_mod_n_out(base, mod_n, in_start, out_start, length))
    }

    fn c_mul(
        &mut self,
        to_mul: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()> {
        let Some(kept) = self.trim_controls(controls, false)? else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.mul(to_mul, in_out_start, carry_start, length);
        }
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.c_mul(to_mul, in_out_start, carry_start, length, &kept))
    }

    fn c_div(
        &mut self,
        to_div: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()> {
        let Some(kept) = self.trim_controls(controls, false)? else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.div(to_div, in_out_start, carry_start, length);
        }
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.c_div(to_div, in_out_start, carry_start, length, &kept))
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
        let Some(kept) = self.trim_controls(controls, false)? else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.mul_mod_n_out(to_mul, mod_n, in_start, out_start, length);
        }
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => {
            e.c_mul_mod_n_out(to_mul, mod_n, in_start, out_start, length, &kept)
        })
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
        let Some(kept) = self.trim_controls(controls, false)? else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.imul_mod_n_out(to_mul, mod_n, in_start, out_start, length);
        }
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => {
            e.c_imul_mod_n_out(to_mul, mod_n, in_start, out_start, length, &kept)
        })
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
        let Some(kept) = self.trim_controls(controls, false)? else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.pow_mod_n_out(base, mod_n, in_start, out_start, length);
        }
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => {
            e.c_pow_mod_n_out(base, mod_n, in_start, out_start, length, &kept)
        })
    }

    fn full_add(
        &mut self,
        input1: usize,
        input2: usize,
        carry_in_sum_out: usize,
        carry_out: usize,
    ) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.full_add(input1, input2, carry_in_sum_out, carry_out))
    }

    fn i_full_add(
        &mut self,
        input1: usize,
        input2: usize,
        carry_in_sum_out: usize,
        carry_out: usize,
    ) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.i_full_add(input1, input2, carry_in_sum_out, carry_out))
    }

    fn indexed_lda(
        &mut self,
        index_start: usize,
        index_length: usize,
        value_start: usize,
        value_length: usize,
        values: &[u8],
    ) -> Result<BasisIndex> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => {
            e.indexed_lda(index_start, index_length, value_start, value_length, values)
        })
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
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => {
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
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => {
            e.indexed_sbc(index_start, index_length, value_start, value_length, carry_index, values)
        })
    }

    fn hash(&mut self, start: usize, length: usize, values: &[u8]) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.hash(start, length, values))
    }

    fn set_reg(&mut self, start: usize, length: usize, value: BasisIndex) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        if value >= pow2(length) {
            return Err(SimError::InvalidBasisState {
                index: value,
                dimension: pow2(length),
            });
        }
        for b in 0..length {
            let want = (value >> b) & 1 == 1;
            let got = self.force_m(start + b, false, false)?;
            if got != want {
                self.invert(ONE_CMPLX, ONE_CMPLX, start + b)?;
            }
        }
        Ok(())
    }

    fn zero_phase_flip(&mut self, start: usize, length: usize) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.zero_phase_flip(start, length))
    }

    fn phase_flip_if_less(
        &mut self,
        greater_perm: BasisIndex,
        start: usize,
        length: usize,
    ) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.phase_flip_if_less(greater_perm, start, length))
    }

    fn c_phase_flip_if_less(
        &mut self,
        greater_perm: BasisIndex,
        start: usize,
        length: usize,
        flag_index: usize,
    ) -> Result<()> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => {
            e.c_phase_flip_if_less(greater_perm, start, length, flag_index)
        })
    }

    fn phase_flip(&mut self) -> Result<()> {
        self.apply_global_phase(Complex64::new(-1.0, 0.0));
        Ok(())
    }

    fn prob(&mut self, qubit: usize) -> Result<f64> {
        check_qubit(qubit, self.qubit_count)?;
        if let Some(engine) = self.engine.as_mut() {
            return dense!(engine, e => e.prob(qubit));
        }
        match &self.shards[qubit] {
            None => self
                .stabilizer
                .as_mut()
                .expect("tableau present when engine is not")
                .prob(qubit),
            Some(shard) if shard.is_phase() => self
                .stabilizer
                .as_mut()
                .expect("tableau present when engine is not")
                .prob(qubit),
            Some(shard) if shard.is_invert() => {
                let p = self
                    .stabilizer
                    .as_mut()
                    .expect("tableau present when engine is not")
                    .prob(qubit)?;
                Ok(1.0 - p)
            }
            Some(shard) => {
                let gate = shard.gate;
                if self.shards_eigen_z[qubit] {
                    let held = self
                        .stabilizer
                        .as_mut()
                        .expect("tableau present when engine is not")
                        .prob(qubit)?
                        >= 0.5;
                    let (amp0, amp1) = if held {
                        (gate[1], gate[3])
                    } else {
                        (gate[0], gate[2])
                    };
                    let total = amp0.norm_sqr() + amp1.norm_sqr();
                    Ok((amp1.norm_sqr() / total).clamp(0.0, 1.0))
                } else {
                    self.switch_to_engine()?;
                    dense!(self.engine_mut(), e => e.prob(qubit))
                }
            }
        }
    }

    fn prob_all(&mut self, perm: BasisIndex) -> Result<f64> {
        Ok(self.get_amplitude(perm)?.norm_sqr())
    }

    fn prob_reg(&mut self, start: usize, length: usize, value: BasisIndex) -> Result<f64> {
        self.flush_buffers()?;
        if let Some(engine) = self.engine.as_mut() {
            return dense!(engine, e => e.prob_reg(start, length, value));
        }
        check_range(start, length, self.qubit_count)?;
        let mask = pow2(length) - 1;
        let mut out = vec![0.0; pow2(self.qubit_count) as usize];
        self.stabilizer
            .as_mut()
            .expect("tableau present when engine is not")
            .get_probs(&mut out)?;
        Ok(out
            .iter()
            .enumerate()
            .filter(|(i, _)| ((*i as u64) >> start) & mask == value)
            .map(|(_, p)| p)
            .sum())
    }

    fn prob_mask(&mut self, mask: BasisIndex, value: BasisIndex) -> Result<f64> {
        self.flush_buffers()?;
        if let Some(engine) = self.engine.as_mut() {
            return dense!(engine, e => e.prob_mask(mask, value));
        }
        let mut out = vec![0.0; pow2(self.qubit_count) as usize];
        self.stabilizer
            .as_mut()
            .expect("tableau present when engine is not")
            .get_probs(&mut out)?;
        Ok(out
            .iter()
            .enumerate()
            .filter(|(i, _)| (*i as u64) & mask == value)
            .map(|(_, p)| p)
            .sum())
    }

    fn prob_parity(&mut self, mask: BasisIndex) -> Result<f64> {
        if mask == 0 {
            return Ok(0.0);
        }
        self.flush_buffers()?;
        if let Some(engine) = self.engine.as_mut() {
            return dense!(engine, e => e.prob_parity(mask));
        }
        let mut out = vec![0.0; pow2(self.qubit_count) as usize];
        self.stabilizer
            .as_mut()
            .expect("tableau present when engine is not")
            .get_probs(&mut out)?;
        Ok(out
            .iter()
            .enumerate()
            .filter(|(i, _)| ((*i as u64) & mask).count_ones() & 1 == 1)
            .map(|(_, p)| p)
            .sum())
    }

    fn force_m(&mut self, qubit: usize, result: bool, do_force: bool) -> Result<bool> {
        check_qubit(qubit, self.qubit_count)?;
        if let Some(engine) = self.engine.as_mut() {
            return dense!(engine, e => e.force_m(qubit, result, do_force));
        }

        // Resolve the target's buffered gate against the measurement.
        let shard_kind = self.shards[qubit]
            .as_ref()
            .map(|s| (s.is_phase(), s.is_invert()));
        match shard_kind {
            Some((true, _)) => {
                self.shards[qubit] = None;
            }
            Some((_, true)) => {
                self.shards[qubit] = None;
                self.stabilizer
                    .as_mut()
                    .expect("tableau present when engine is not")
                    .x(qubit);
            }
            Some((false, false)) => {
                if self.shards_eigen_z[qubit] {
                    return self
                        .collapse_separable_shard(qubit, do_force.then_some(result));
                }
                self.switch_to_engine()?;
                return dense!(self.engine_mut(), e => e.force_m(qubit, result, do_force));
            }
            None => {}
        }

        self.stabilizer
            .as_mut()
            .expect("tableau present when engine is not")
            .force_m(qubit, result, do_force)
    }

    fn force_m_parity(&mut self, mask: BasisIndex, result: bool, do_force: bool) -> Result<bool> {
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.force_m_parity(mask, result, do_force))
    }

    fn m_all(&mut self) -> Result<BasisIndex> {
        let mut value = 0u64;
        for q in 0..self.qubit_count {
            if self.m(q)? {
                value |= pow2(q);
            }
        }
        Ok(value)
    }

    fn compose(&mut self, other: Self) -> Result<usize> {
        let start = self.qubit_count;
        self.compose_at(other, start)
    }

    fn compose_at(&mut self, other: Self, start: usize) -> Result<usize> {
        if start > self.qubit_count {
            return Err(SimError::invalid("compose start past end of register"));
        }
        let mut other = other;
        let n_b = other.qubit_count;

        if self.stabilizer.is_some() && other.stabilizer.is_some() {
            let other_stab = other.stabilizer.take().expect("checked above");
            self.stabilizer
                .as_mut()
                .expect("checked above")
                .compose_at(&other_stab, start)?;
        } else {
            self.switch_to_engine()?;
            other.switch_to_engine()?;
            let other_engine = other.engine.take().expect("switched above");
            let mut mine = self.engine.take().expect("switched above");
            let merge = (|| -> Result<()> {
                match (&mut mine, other_engine) {
                    (DenseBackend::Cpu(a), DenseBackend::Cpu(b)) => {
                        a.compose_at(b, start)?;
                    }
                    (DenseBackend::Paged(a), DenseBackend::Paged(b)) => {
                        a.compose_at(b, start)?;
                    }
                    (DenseBackend::Cpu(a), DenseBackend::Paged(mut b)) => {
                        let dim = b.max_q_power() as usize;
                        let mut amps = vec![ZERO_CMPLX; dim];
                        b.get_quantum_state(&mut amps)?;
                        let mut flat = a.clone_empty(b.qubit_count(), 0)?;
                        flat.set_quantum_state(&amps)?;
                        a.compose_at(flat, start)?;
                    }
                    (DenseBackend::Paged(a), DenseBackend::Cpu(mut b)) => {
                        let dim = b.max_q_power() as usize;
                        let mut amps = vec![ZERO_CMPLX; dim];
                        b.get_quantum_state(&mut amps)?;
                        let mut config = self.config.clone();
                        config.rng_seed = Some(self.rng.gen());
                        let mut paged = QPager::new(b.qubit_count(), 0, &config)?;
                        paged.set_quantum_state(&amps)?;
                        a.compose_at(paged, start)?;
                    }
                }
                Ok(())
            })();
            self.engine = Some(mine);
            merge?;
        }

        // Splice the shard bookkeeping in at the same position.
        let tail_shards: Vec<_> = self.shards.split_off(start);
        let tail_eigen: Vec<_> = self.shards_eigen_z.split_off(start);
        self.shards.extend(other.shards.drain(..));
        self.shards_eigen_z.extend(other.shards_eigen_z.drain(..));
        self.shards.extend(tail_shards);
        self.shards_eigen_z.extend(tail_eigen);

        self.qubit_count += n_b;
        Ok(start)
    }

    fn decompose(&mut self, start: usize, length: usize) -> Result<Self> {
        check_range(start, length, self.qubit_count)?;

        if self.stabilizer.is_some() && length == 1 {
            let q = start;
            let stabilizer = self
                .stabilizer
                .as_mut()
                .expect("checked above");
            // Eigenbasis probes, Z first; a block fixed in no basis means
            // the tableau cannot cleanly factor one qubit out.
            enum Basis {
                Z,
                X,
                Y,
            }
            let basis = if stabilizer.is_separable_z(q) {
                Some(Basis::Z)
            } else if stabilizer.is_separable_x(q) {
                Some(Basis::X)
            } else if stabilizer.is_separable_y(q) {
                Some(Basis::Y)
            } else {
                None
            };
            if let Some(basis) = basis {
                match basis {
                    Basis::Z => {}
                    Basis::X => stabilizer.h(q),
                    Basis::Y => {
                        stabilizer.is(q);
                        stabilizer.h(q);
                    }
                }
                let bit = stabilizer.dispose_z_qubit(q)?;
                let mut dest_config = self.config.clone();
                dest_config.rng_seed = Some(self.rng.gen());
                let mut dest = QStabilizerHybrid::new(1, u64::from(bit), &dest_config)?;
                if let Some(dest_stab) = dest.stabilizer.as_mut() {
                    match basis {
                        Basis::Z => {}
                        Basis::X => dest_stab.h(0),
                        Basis::Y => {
                            dest_stab.h(0);
                            dest_stab.s(0);
                        }
                    }
                }
                dest.shards[0] = self.shards.remove(q);
                dest.shards_eigen_z[0] = self.shards_eigen_z.remove(q);
                self.qubit_count -= 1;
                return Ok(dest);
            }
        }

        self.switch_to_engine()?;
        let mut dest_config = self.config.clone();
        dest_config.rng_seed = Some(self.rng.gen());
        let dest_engine = match self.engine_mut() {
            DenseBackend::Cpu(e) => DenseBackend::Cpu(e.decompose(start, length)?),
            DenseBackend::Paged(e) => DenseBackend::Paged(e.decompose(start, length)?),
        };
        let mut dest = QStabilizerHybrid::new(length, 0, &dest_config)?;
        dest.stabilizer = None;
        dest.engine = Some(dest_engine);
        for i in 0..length {
            dest.shards[i] = self.shards.remove(start);
            dest.shards_eigen_z[i] = self.shards_eigen_z.remove(start);
        }
        self.qubit_count -= length;
        Ok(dest)
    }

    fn dispose(&mut self, start: usize, length: usize) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        if let Some(stabilizer) = self.stabilizer.as_mut() {
            if stabilizer.can_decompose(start, length)
                && (start..start + length).all(|q| self.shards[q].is_none())
            {
                let all_z = (start..start + length)
                    .all(|q| self.stabilizer.as_ref().expect("checked").is_separable_z(q));
                if all_z {
                    self.stabilizer
                        .as_mut()
                        .expect("checked")
                        .dispose(start, length)?;
                    self.shards.drain(start..start + length);
                    self.shards_eigen_z.drain(start..start + length);
                    self.qubit_count -= length;
                    return Ok(());
                }
            }
        }
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.dispose(start, length))?;
        self.shards.drain(start..start + length);
        self.shards_eigen_z.drain(start..start + length);
        self.qubit_count -= length;
        Ok(())
    }

    fn dispose_perm(&mut self, start: usize, length: usize, perm: BasisIndex) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        if self.stabilizer.is_some() {
            return self.dispose(start, length);
        }
        self.switch_to_engine()?;
        dense!(self.engine_mut(), e => e.dispose_perm(start, length, perm))?;
        self.shards.drain(start..start + length);
        self.shards_eigen_z.drain(start..start + length);
        self.qubit_count -= length;
        Ok(())
    }

    fn normalize_state(&mut self) -> Result<()> {
        if let Some(engine) = self.engine.as_mut() {
            return dense!(engine, e => e.normalize_state());
        }
        Ok(())
    }

    fn update_running_norm(&mut self) -> Result<f64> {
        if let Some(engine) = self.engine.as_mut() {
            return dense!(engine, e => e.update_running_norm());
        }
        Ok(1.0)
    }

    fn sum_sqr_diff(&mut self, other: &mut Self) -> Result<f64> {
        if self.qubit_count != other.qubit_count {
            return Err(SimError::invalid(
                "sum_sqr_diff requires equal-width engines",
            ));
        }
        let dim = pow2(self.qubit_count) as usize;
        let mut a = vec![ZERO_CMPLX; dim];
        let mut b = vec![ZERO_CMPLX; dim];
        self.get_quantum_state(&mut a)?;
        other.get_quantum_state(&mut b)?;
        Ok(a.iter().zip(b.iter()).map(|(x, y)| (x - y).norm_sqr()).sum())
    }
}

impl Clone for QStabilizerHybrid {
    fn clone(&self) -> Self {
        Self {
            qubit_count: self.qubit_count,
            stabilizer: self.stabilizer.clone(),
            engine: self.engine.clone(),
            shards: self.shards.clone(),
            shards_eigen_z: self.shards_eigen_z.clone(),
            config: self.config.clone(),
            rng: self.rng.clone(),
        }
    }
}

impl std::fmt::Debug for QStabilizerHybrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QStabilizerHybrid")
            .field("qubit_count", &self.qubit_count)
            .field("clifford", &self.is_clifford())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SQRT1_2: f64 = FRAC_1_SQRT_2;

    fn cfg() -> EngineConfig {
        EngineConfig::new().with_seed(42)
    }

    fn h_mtrx() -> [Complex64; 4] {
        [
            Complex64::new(SQRT1_2, 0.0),
            Complex64::new(SQRT1_2, 0.0),
            Complex64::new(SQRT1_2, 0.0),
            Complex64::new(-SQRT1_2, 0.0),
        ]
    }

    fn t_mtrx() -> [Complex64; 4] {
        [
            ONE_CMPLX,
            ZERO_CMPLX,
            ZERO_CMPLX,
            Complex64::from_polar(1.0, std::f64::consts::FRAC_PI_4),
        ]
    }

    fn state_of(hybrid: &mut QStabilizerHybrid) -> Vec<Complex64> {
        let mut out = vec![ZERO_CMPLX; hybrid.max_q_power() as usize];
        hybrid.get_quantum_state(&mut out).unwrap();
        out
    }

    #[test]
    fn test_stays_clifford_for_clifford_circuit() {
        let mut hybrid = QStabilizerHybrid::new(3, 0, &cfg()).unwrap();
        hybrid.mtrx(&h_mtrx(), 0).unwrap();
        hybrid.mc_invert(&[0], ONE_CMPLX, ONE_CMPLX, 1).unwrap();
        hybrid.mc_invert(&[1], ONE_CMPLX, ONE_CMPLX, 2).unwrap();
        assert!(hybrid.is_clifford());
        let amps = state_of(&mut hybrid);
        assert_relative_eq!(amps[0].re, SQRT1_2, epsilon = 1e-12);
        assert_relative_eq!(amps[7].re, SQRT1_2, epsilon = 1e-12);
    }

    #[test]
    fn test_t_gate_buffers_without_promotion() {
        let mut hybrid = QStabilizerHybrid::new(2, 0, &cfg()).unwrap();
        hybrid.mtrx(&t_mtrx(), 0).unwrap();
        // Diagonal gate on |0>: no shard, no promotion, only global phase.
        assert!(hybrid.is_clifford());

        hybrid.mtrx(&h_mtrx(), 0).unwrap();
        hybrid.mtrx(&t_mtrx(), 0).unwrap();
        // Now the qubit is |+>; T buffers as a shard but stays Clifford.
        assert!(hybrid.is_clifford());
    }

    #[test]
    fn test_non_clifford_promotes_on_entangling_gate() {
        let mut hybrid = QStabilizerHybrid::new(2, 0, &cfg()).unwrap();
        hybrid.mtrx(&h_mtrx(), 0).unwrap();
        hybrid.mtrx(&t_mtrx(), 0).unwrap();
        hybrid.mc_invert(&[0], ONE_CMPLX, ONE_CMPLX, 1).unwrap();
        assert!(!hybrid.is_clifford());

        // Compare against a plain dense engine running the same circuit.
        let mut engine = QEngineCpu::new(2, 0, &cfg()).unwrap();
        engine.mtrx(&h_mtrx(), 0).unwrap();
        engine.mtrx(&t_mtrx(), 0).unwrap();
        engine.mc_invert(&[0], ONE_CMPLX, ONE_CMPLX, 1).unwrap();

        let mut a = state_of(&mut hybrid);
        let mut b = vec![ZERO_CMPLX; 4];
        engine.get_quantum_state(&mut b).unwrap();
        // Compare up to global phase.
        let phase = b[0] / a[0];
        for amp in a.iter_mut() {
            *amp *= phase;
        }
        for (x, y) in a.iter().zip(b.iter()) {
            assert_relative_eq!((x - y).norm(), 0.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_control_trimming_avoids_promotion() {
        // Control fixed at |0>: a non-Clifford controlled gate is a no-op.
        let mut hybrid = QStabilizerHybrid::new(2, 0, &cfg()).unwrap();
        hybrid.mc_mtrx(&[0], &t_mtrx(), 1).unwrap();
        assert!(hybrid.is_clifford());

        // Control fixed at |1>: reduces to the base gate on the target.
        let mut hybrid = QStabilizerHybrid::new(2, 1, &cfg()).unwrap();
        hybrid.mc_phase(&[0], ONE_CMPLX, Complex64::new(-1.0, 0.0), 1)
            .unwrap();
        assert!(hybrid.is_clifford());
    }

    #[test]
    fn test_cz_stays_clifford() {
        let mut hybrid = QStabilizerHybrid::new(2, 0, &cfg()).unwrap();
        hybrid.mtrx(&h_mtrx(), 0).unwrap();
        hybrid.mtrx(&h_mtrx(), 1).unwrap();
        hybrid
            .mc_phase(&[0], ONE_CMPLX, Complex64::new(-1.0, 0.0), 1)
            .unwrap();
        assert!(hybrid.is_clifford());
        let amps = state_of(&mut hybrid);
        assert_relative_eq!(amps[3].re, -0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_measurement_on_tableau() {
        let mut hybrid = QStabilizerHybrid::new(2, 0, &cfg()).unwrap();
        hybrid.mtrx(&h_mtrx(), 0).unwrap();
        hybrid.mc_invert(&[0], ONE_CMPLX, ONE_CMPLX, 1).unwrap();
        let outcome = hybrid.m(0).unwrap();
        assert!(hybrid.is_clifford());
        assert_relative_eq!(
            hybrid.prob(1).unwrap(),
            if outcome { 1.0 } else { 0.0 },
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_eigen_shard_measurement() {
        // T on |0> leaves the qubit deterministic; a buffered general
        // gate on an eigenstate collapses without promotion.
        let mut hybrid = QStabilizerHybrid::new(1, 0, &cfg()).unwrap();
        let rx = {
            let c = Complex64::new((0.3f64 / 2.0).cos(), 0.0);
            let s = Complex64::new(0.0, -(0.3f64 / 2.0).sin());
            [c, s, s, c]
        };
        hybrid.mtrx(&rx, 0).unwrap();
        assert!(hybrid.is_clifford());
        let p = hybrid.prob(0).unwrap();
        assert_relative_eq!(p, (0.15f64).sin().powi(2), epsilon = 1e-10);
        let _ = hybrid.m(0).unwrap();
        assert!(hybrid.is_clifford());
    }

    #[test]
    fn test_compose_stabilizers() {
        let mut a = QStabilizerHybrid::new(1, 1, &cfg()).unwrap();
        let mut b = QStabilizerHybrid::new(2, 0, &cfg()).unwrap();
        b.mtrx(&h_mtrx(), 0).unwrap();
        b.mc_invert(&[0], ONE_CMPLX, ONE_CMPLX, 1).unwrap();
        let start = a.compose(b).unwrap();
        assert_eq!(start, 1);
        assert_eq!(a.qubit_count(), 3);
        assert!(a.is_clifford());
        let amps = state_of(&mut a);
        assert_relative_eq!(amps[0b001].re, SQRT1_2, epsilon = 1e-12);
        assert_relative_eq!(amps[0b111].re, SQRT1_2, epsilon = 1e-12);
    }

    #[test]
    fn test_decompose_separable_qubit() {
        let mut hybrid = QStabilizerHybrid::new(2, 0, &cfg()).unwrap();
        hybrid.mtrx(&h_mtrx(), 1).unwrap();
        let mut dest = hybrid.decompose(1, 1).unwrap();
        assert_eq!(hybrid.qubit_count(), 1);
        assert_eq!(dest.qubit_count(), 1);
        assert_relative_eq!(dest.prob(0).unwrap(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(hybrid.prob(0).unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_set_permutation_returns_to_stabilizer() {
        let mut hybrid = QStabilizerHybrid::new(2, 0, &cfg()).unwrap();
        hybrid.mtrx(&h_mtrx(), 0).unwrap();
        hybrid.mtrx(&t_mtrx(), 0).unwrap();
        hybrid.mc_invert(&[0], ONE_CMPLX, ONE_CMPLX, 1).unwrap();
        assert!(!hybrid.is_clifford());
        hybrid.set_permutation(0).unwrap();
        assert!(hybrid.is_clifford());
        assert_relative_eq!(hybrid.prob(0).unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_swap_moves_shards() {
        let mut hybrid = QStabilizerHybrid::new(2, 0, &cfg()).unwrap();
        hybrid.mtrx(&h_mtrx(), 0).unwrap();
        hybrid.mtrx(&t_mtrx(), 0).unwrap();
        hybrid.swap(0, 1).unwrap();
        assert!(hybrid.is_clifford());
        assert_relative_eq!(hybrid.prob(1).unwrap(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(hybrid.prob(0).unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_arithmetic_promotes() {
        let mut hybrid = QStabilizerHybrid::new(3, 1, &cfg()).unwrap();
        hybrid.inc(2, 0, 3).unwrap();
        assert!(!hybrid.is_clifford());
        assert_relative_eq!(hybrid.prob_all(3).unwrap(), 1.0, epsilon = 1e-12);
    }
}
