//! The QUnit engine
//!
//! Tracks explicit separability of qubits as an optimization over the
//! sub-engines. Per shard, pending work layers outermost-first as: a
//! deferred Hadamard (the basis flag), the single-qubit phase/invert
//! buffer, the cross-shard controlled-phase buffers, and finally the
//! cached amplitude pair or the (engine, index) slot. Incoming
//! operations commute inward through the layers where the algebra
//! allows, and flush the blocking layers where it does not. Qubits
//! entangle only when an operation genuinely requires it, and
//! measurements or extremal probability results re-isolate qubits out
//! of their engines.

use std::collections::BTreeMap;
use std::f64::consts::FRAC_1_SQRT_2;

use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;

use qforge_core::error::{check_qubit, check_range};
use qforge_core::{
    is_norm_zero, is_same_complex, pow2, BasisIndex, EngineConfig, QuantumBackend, Result,
    SimError, FP_NORM_EPSILON, ONE_CMPLX, ZERO_CMPLX,
};

use crate::backend::Backend;
use crate::shard::{
    add_inversion_angles, add_phase_angles, flip_phase_anti, remove_buffer, try_h_commute,
    EngineId, PauliBasis, PhaseBuffer, QubitShard, SingleBuffer,
};

/// Separability-tracking engine over a sub-engine arena
pub struct QUnit {
    qubit_count: usize,
    shards: Vec<QubitShard>,
    engines: Vec<Option<Backend>>,
    config: EngineConfig,
    rng: StdRng,
}

impl QUnit {
    pub fn new(qubit_count: usize, perm: BasisIndex, config: &EngineConfig) -> Result<Self> {
        if qubit_count == 0 {
            return Err(SimError::CapacityExceeded {
                reason: "register needs at least one qubit".into(),
            });
        }
        if perm >= pow2(qubit_count) {
            return Err(SimError::InvalidBasisState {
                index: perm,
                dimension: pow2(qubit_count),
            });
        }
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let shards = (0..qubit_count)
            .map(|q| QubitShard::new((perm >> q) & 1 == 1))
            .collect();
        Ok(Self {
            qubit_count,
            shards,
            engines: Vec::new(),
            config: config.clone(),
            rng,
        })
    }

    /// Number of distinct sub-engines currently allocated
    pub fn engine_count(&self) -> usize {
        self.engines.iter().filter(|e| e.is_some()).count()
    }

    /// Whether a qubit is currently tracked as separable
    pub fn is_isolated(&self, q: usize) -> bool {
        self.shards[q].is_isolated()
    }

    fn sub_config(&mut self) -> EngineConfig {
        let mut config = self.config.clone();
        config.rng_seed = Some(self.rng.gen());
        config
    }

    fn alloc_engine(&mut self, backend: Backend) -> EngineId {
        for (i, slot) in self.engines.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(backend);
                return i;
            }
        }
        self.engines.push(Some(backend));
        self.engines.len() - 1
    }

    fn engine(&mut self, id: EngineId) -> &mut Backend {
        self.engines[id]
            .as_mut()
            .expect("engine ids in shards always point at live engines")
    }

    fn dirty(&mut self, q: usize) {
        self.shards[q].is_prob_dirty = true;
        self.shards[q].is_phase_dirty = true;
    }

    // --- layer flushing ---

    /// Move the pending single-qubit buffer inward and apply it
    fn flush_single(&mut self, q: usize) -> Result<()> {
        let Some(buf) = self.shards[q].buffer.take() else {
            return Ok(());
        };
        if buf.is_invert {
            // X commutes into the cross layer by swapping the branch
            // angles of buffers targeting q; buffers controlled by q flip
            // their condition and must resolve first.
            if !self.shards[q].controls_of.is_empty() {
                self.revert_cross_control(q)?;
            }
            flip_phase_anti(&mut self.shards, q);
        }
        if buf.is_invert {
            self.apply_inner_invert(q, buf.c0, buf.c1)
        } else {
            self.apply_inner_phase(q, buf.c0, buf.c1)
        }
    }

    /// Clear a deferred Hadamard, applying it beneath the buffer layers
    fn revert_basis1(&mut self, q: usize) -> Result<()> {
        if self.shards[q].basis == PauliBasis::Z {
            return Ok(());
        }
        self.flush_single(q)?;
        if self.shards[q].has_cross_buffers() && !try_h_commute(&mut self.shards, q) {
            self.revert_cross_all(q)?;
        }
        self.shards[q].basis = PauliBasis::Z;
        self.apply_inner_h(q)
    }

    fn revert_cross_control(&mut self, q: usize) -> Result<()> {
        let targets: Vec<usize> = self.shards[q].controls_of.keys().copied().collect();
        for t in targets {
            self.apply_buffer(q, t)?;
        }
        Ok(())
    }

    fn revert_cross_target(&mut self, q: usize) -> Result<()> {
        let controls: Vec<usize> = self.shards[q].targets_of.keys().copied().collect();
        for c in controls {
            self.apply_buffer(c, q)?;
        }
        Ok(())
    }

    /// Resolve only the buffers targeting q that flip its basis value
    fn revert_cross_target_inverts(&mut self, q: usize) -> Result<()> {
        let controls: Vec<usize> = self.shards[q]
            .targets_of
            .iter()
            .filter(|(_, b)| b.is_invert)
            .map(|(&c, _)| c)
            .collect();
        for c in controls {
            self.apply_buffer(c, q)?;
        }
        Ok(())
    }

    fn revert_cross_all(&mut self, q: usize) -> Result<()> {
        self.revert_cross_control(q)?;
        self.revert_cross_target(q)
    }

    /// Apply and remove one cross-shard buffer, taking the classical
    /// shortcuts where a participant's value is already settled
    fn apply_buffer(&mut self, c: usize, t: usize) -> Result<()> {
        let Some(buf) = self.shards[t].targets_of.get(&c).copied() else {
            return Ok(());
        };
        remove_buffer(&mut self.shards, c, t);

        // Buffers condition on the inner amplitudes, beneath any pending
        // single-qubit work on the control.
        if self.shards[c].is_isolated() {
            if self.shards[c].amp1.norm_sqr() <= FP_NORM_EPSILON {
                return Ok(());
            }
            if self.shards[c].amp0.norm_sqr() <= FP_NORM_EPSILON {
                return if buf.is_invert {
                    self.apply_inner_invert(t, buf.cmplx0(), buf.cmplx1())
                } else {
                    self.apply_inner_phase(t, buf.cmplx0(), buf.cmplx1())
                };
            }
        }
        if !buf.is_invert && self.shards[t].is_isolated() {
            if self.shards[t].amp1.norm_sqr() <= FP_NORM_EPSILON {
                return self.apply_inner_phase(c, ONE_CMPLX, buf.cmplx0());
            }
            if self.shards[t].amp0.norm_sqr() <= FP_NORM_EPSILON {
                return self.apply_inner_phase(c, ONE_CMPLX, buf.cmplx1());
            }
        }

        let engine_id = self.entangle_bare(&[c, t])?;
        let cm = self.shards[c].mapped;
        let tm = self.shards[t].mapped;
        let engine = self.engine(engine_id);
        if buf.is_invert {
            engine.mc_invert(&[cm], buf.cmplx0(), buf.cmplx1(), tm)?;
        } else {
            engine.mc_phase(&[cm], buf.cmplx0(), buf.cmplx1(), tm)?;
        }
        self.dirty(c);
        self.dirty(t);
        Ok(())
    }

    // --- inner-layer gate application ---

    fn apply_inner_phase(&mut self, q: usize, c0: Complex64, c1: Complex64) -> Result<()> {
        match self.shards[q].unit {
            None => {
                let shard = &mut self.shards[q];
                shard.amp0 *= c0;
                shard.amp1 *= c1;
                Ok(())
            }
            Some(engine_id) => {
                let mapped = self.shards[q].mapped;
                self.engine(engine_id).phase(c0, c1, mapped)?;
                self.shards[q].is_phase_dirty = true;
                Ok(())
            }
        }
    }

    fn apply_inner_invert(&mut self, q: usize, c0: Complex64, c1: Complex64) -> Result<()> {
        match self.shards[q].unit {
            None => {
                let shard = &mut self.shards[q];
                let old0 = shard.amp0;
                shard.amp0 = c0 * shard.amp1;
                shard.amp1 = c1 * old0;
                Ok(())
            }
            Some(engine_id) => {
                let mapped = self.shards[q].mapped;
                self.engine(engine_id).invert(c0, c1, mapped)?;
                self.dirty(q);
                Ok(())
            }
        }
    }

    fn apply_inner_h(&mut self, q: usize) -> Result<()> {
        match self.shards[q].unit {
            None => {
                let shard = &mut self.shards[q];
                let (a0, a1) = (shard.amp0, shard.amp1);
                shard.amp0 = (a0 + a1) * FRAC_1_SQRT_2;
                shard.amp1 = (a0 - a1) * FRAC_1_SQRT_2;
                Ok(())
            }
            Some(engine_id) => {
                let mapped = self.shards[q].mapped;
                let h = h_mtrx();
                self.engine(engine_id).mtrx(&h, mapped)?;
                self.dirty(q);
                Ok(())
            }
        }
    }

    fn apply_inner_mtrx(&mut self, q: usize, m: &[Complex64; 4]) -> Result<()> {
        match self.shards[q].unit {
            None => {
                let shard = &mut self.shards[q];
                let (a0, a1) = (shard.amp0, shard.amp1);
                shard.amp0 = m[0] * a0 + m[1] * a1;
                shard.amp1 = m[2] * a0 + m[3] * a1;
                Ok(())
            }
            Some(engine_id) => {
                let mapped = self.shards[q].mapped;
                self.engine(engine_id).mtrx(m, mapped)?;
                self.dirty(q);
                Ok(())
            }
        }
    }

    /// Flush every pending layer of a qubit down into the amplitudes
    fn flush_all_layers(&mut self, q: usize) -> Result<()> {
        self.revert_basis1(q)?;
        self.flush_single(q)?;
        self.revert_cross_all(q)
    }

    // --- entanglement bookkeeping ---

    /// Merge the named qubits into one sub-engine without touching any
    /// buffer layer
    fn entangle_bare(&mut self, qubits: &[usize]) -> Result<EngineId> {
        for &q in qubits {
            if self.shards[q].is_isolated() {
                let amps = [self.shards[q].amp0, self.shards[q].amp1];
                let config = self.sub_config();
                let mut engine = Backend::make(1, 0, &config)?;
                engine.set_quantum_state(&amps)?;
                let id = self.alloc_engine(engine);
                self.shards[q].unit = Some(id);
                self.shards[q].mapped = 0;
            }
        }

        let first = self.shards[qubits[0]].unit.expect("just entangled");
        for &q in &qubits[1..] {
            let other_id = self.shards[q].unit.expect("just entangled");
            if other_id == first {
                continue;
            }
            let offset = self.engine(first).qubit_count();
            let other = self.engines[other_id]
                .take()
                .expect("engine ids in shards always point at live engines");
            self.engines[first]
                .as_mut()
                .expect("live engine")
                .compose(other)?;
            for shard in &mut self.shards {
                if shard.unit == Some(other_id) {
                    shard.unit = Some(first);
                    shard.mapped += offset;
                }
            }
        }
        Ok(first)
    }

    /// Sort an engine's qubits so shard order matches engine order
    fn order_contiguous(&mut self, engine_id: EngineId) -> Result<()> {
        let members: Vec<usize> = (0..self.qubit_count)
            .filter(|&q| self.shards[q].unit == Some(engine_id))
            .collect();
        for (pos, &q) in members.iter().enumerate() {
            if self.shards[q].mapped == pos {
                continue;
            }
            let other = members
                .iter()
                .copied()
                .find(|&m| self.shards[m].mapped == pos)
                .expect("mapped indices form a permutation");
            let old = self.shards[q].mapped;
            self.engine(engine_id).swap(old, pos)?;
            self.shards[q].mapped = pos;
            self.shards[other].mapped = old;
        }
        Ok(())
    }

    /// Flush, entangle, and order a contiguous range plus any extra bits
    fn entangle_range(&mut self, start: usize, length: usize, extra: &[usize]) -> Result<EngineId> {
        let mut involved: SmallVec<[usize; 8]> = (start..start + length).collect();
        involved.extend_from_slice(extra);
        for &q in &involved {
            self.flush_all_layers(q)?;
        }
        let engine_id = self.entangle_bare(&involved)?;
        self.order_contiguous(engine_id)?;
        Ok(engine_id)
    }

    // --- separation ---

    /// Re-shelve a just-collapsed shared qubit as an isolated shard
    fn separate_bit(&mut self, q: usize, outcome: bool) -> Result<()> {
        let Some(engine_id) = self.shards[q].unit else {
            return Ok(());
        };
        let mapped = self.shards[q].mapped;
        let width = self.engine(engine_id).qubit_count();

        if width == 1 {
            self.engines[engine_id] = None;
        } else {
            self.engine(engine_id)
                .dispose_perm(mapped, 1, u64::from(outcome))?;
            for shard in &mut self.shards {
                if shard.unit == Some(engine_id) && shard.mapped > mapped {
                    shard.mapped -= 1;
                }
            }
        }

        let shard = &mut self.shards[q];
        shard.unit = None;
        shard.mapped = 0;
        shard.amp0 = if outcome { ZERO_CMPLX } else { ONE_CMPLX };
        shard.amp1 = if outcome { ONE_CMPLX } else { ZERO_CMPLX };
        shard.is_prob_dirty = false;
        shard.is_phase_dirty = false;

        // A one-qubit remainder engine re-isolates its last tenant too.
        if width == 2 {
            let last = (0..self.qubit_count)
                .find(|&p| self.shards[p].unit == Some(engine_id));
            if let Some(last) = last {
                let amp0 = self.engine(engine_id).get_amplitude(0)?;
                let amp1 = self.engine(engine_id).get_amplitude(1)?;
                self.engines[engine_id] = None;
                let shard = &mut self.shards[last];
                shard.unit = None;
                shard.mapped = 0;
                shard.amp0 = amp0;
                shard.amp1 = amp1;
                shard.is_prob_dirty = false;
                shard.is_phase_dirty = false;
            }
        }
        Ok(())
    }

    /// After an extremal probability, collapse and re-isolate the qubit
    fn check_shard_separable(&mut self, q: usize, prob_one: f64) -> Result<()> {
        if self.shards[q].is_isolated() {
            return Ok(());
        }
        let threshold = self.config.separability_threshold;
        let outcome = if prob_one >= 1.0 - threshold {
            true
        } else if prob_one <= threshold {
            false
        } else {
            return Ok(());
        };
        let engine_id = self.shards[q].unit.expect("checked above");
        let mapped = self.shards[q].mapped;
        self.engine(engine_id).force_m(mapped, outcome, true)?;
        self.separate_bit(q, outcome)
    }

    /// Logical Z-basis value of a qubit when classically settled
    fn known_value(&self, q: usize) -> Option<bool> {
        let shard = &self.shards[q];
        if !shard.is_isolated() || shard.basis != PauliBasis::Z {
            return None;
        }
        if shard.targets_of.values().any(|b| b.is_invert) {
            return None;
        }
        let mut value = if shard.amp1.norm_sqr() <= FP_NORM_EPSILON {
            false
        } else if shard.amp0.norm_sqr() <= FP_NORM_EPSILON {
            true
        } else {
            return None;
        };
        if let Some(buf) = &shard.buffer {
            if buf.is_invert {
                value = !value;
            }
        }
        Some(value)
    }

    /// Drop definitely-satisfied controls; `None` when the gate cannot fire
    fn trim_known_controls(&self, controls: &[usize], anti: bool) -> Option<Vec<usize>> {
        let mut kept = Vec::with_capacity(controls.len());
        for &c in controls {
            match self.known_value(c) {
                Some(v) if v == !anti => {}
                Some(_) => return None,
                None => kept.push(c),
            }
        }
        Some(kept)
    }

    fn validate_controls(&self, controls: &[usize], target: usize) -> Result<()> {
        let mut seen = 0u64;
        for &c in controls {
            check_qubit(c, self.qubit_count)?;
            if c == target {
                return Err(SimError::invalid("control equals target"));
            }
            if seen & pow2(c) != 0 {
                return Err(SimError::invalid("duplicate control qubit"));
            }
            seen |= pow2(c);
        }
        Ok(())
    }

    /// Prepare an endpoint for a new cross-shard buffer attachment
    fn prepare_buffer_endpoint(&mut self, q: usize, incoming_invert: bool) -> Result<()> {
        self.revert_basis1(q)?;
        if let Some(buf) = &self.shards[q].buffer {
            if buf.is_invert {
                self.flush_single(q)?;
            }
        }
        // Buffers of mixed kind on one target do not commute; resolve
        // the old kind before attaching the new.
        let mixed: Vec<usize> = self.shards[q]
            .targets_of
            .iter()
            .filter(|(_, b)| b.is_invert != incoming_invert)
            .map(|(&c, _)| c)
            .collect();
        for c in mixed {
            self.apply_buffer(c, q)?;
        }
        Ok(())
    }

    /// Entangle-and-forward fallback for controlled single-qubit work
    fn controlled_engine_op(
        &mut self,
        controls: &[usize],
        target: usize,
        anti: bool,
        m: &[Complex64; 4],
    ) -> Result<()> {
        let mut involved: SmallVec<[usize; 8]> = SmallVec::from_slice(controls);
        involved.push(target);
        for &q in involved.iter() {
            self.flush_all_layers(q)?;
        }
        let engine_id = self.entangle_bare(&involved)?;
        let mapped: Vec<usize> = controls.iter().map(|&c| self.shards[c].mapped).collect();
        let mapped_t = self.shards[target].mapped;
        let engine = self.engine(engine_id);
        if anti {
            engine.mac_mtrx(&mapped, m, mapped_t)?;
        } else {
            engine.mc_mtrx(&mapped, m, mapped_t)?;
        }
        for &q in involved.iter() {
            self.dirty(q);
        }
        Ok(())
    }
}

fn h_mtrx() -> [Complex64; 4] {
    [
        Complex64::new(FRAC_1_SQRT_2, 0.0),
        Complex64::new(FRAC_1_SQRT_2, 0.0),
        Complex64::new(FRAC_1_SQRT_2, 0.0),
        Complex64::new(-FRAC_1_SQRT_2, 0.0),
    ]
}

fn is_h_mtrx(m: &[Complex64; 4]) -> bool {
    let h = FRAC_1_SQRT_2;
    is_same_complex(m[0], Complex64::new(h, 0.0))
        && is_same_complex(m[1], Complex64::new(h, 0.0))
        && is_same_complex(m[2], Complex64::new(h, 0.0))
        && is_same_complex(m[3], Complex64::new(-h, 0.0))
}

impl QuantumBackend for QUnit {
    fn qubit_count(&self) -> usize {
        self.qubit_count
    }

    fn finish(&mut self) {
        for engine in self.engines.iter_mut().flatten() {
            engine.finish();
        }
    }

    fn set_permutation(&mut self, perm: BasisIndex) -> Result<()> {
        if perm >= pow2(self.qubit_count) {
            return Err(SimError::InvalidBasisState {
                index: perm,
                dimension: pow2(self.qubit_count),
            });
        }
        self.engines.clear();
        self.shards = (0..self.qubit_count)
            .map(|q| QubitShard::new((perm >> q) & 1 == 1))
            .collect();
        Ok(())
    }

    fn set_quantum_state(&mut self, amplitudes: &[Complex64]) -> Result<()> {
        if amplitudes.len() as u64 != pow2(self.qubit_count) {
            return Err(SimError::invalid("state length mismatch"));
        }
        if self.qubit_count == 1 {
            self.engines.clear();
            let shard = &mut self.shards[0];
            *shard = QubitShard::new(false);
            shard.amp0 = amplitudes[0];
            shard.amp1 = amplitudes[1];
            return Ok(());
        }
        self.set_permutation(0)?;
        let engine_id = self.entangle_bare(&(0..self.qubit_count).collect::<Vec<_>>())?;
        self.order_contiguous(engine_id)?;
        self.engine(engine_id).set_quantum_state(amplitudes)?;
        for q in 0..self.qubit_count {
            self.dirty(q);
        }
        Ok(())
    }

    fn get_quantum_state(&mut self, out: &mut [Complex64]) -> Result<()> {
        if out.len() as u64 != pow2(self.qubit_count) {
            return Err(SimError::invalid("output buffer length mismatch"));
        }
        for q in 0..self.qubit_count {
            self.flush_all_layers(q)?;
        }
        let engine_id = self.entangle_bare(&(0..self.qubit_count).collect::<Vec<_>>())?;
        self.order_contiguous(engine_id)?;
        self.engine(engine_id).get_quantum_state(out)
    }

    fn get_probs(&mut self, out: &mut [f64]) -> Result<()> {
        if out.len() as u64 != pow2(self.qubit_count) {
            return Err(SimError::invalid("output buffer length mismatch"));
        }
        for q in 0..self.qubit_count {
            self.flush_all_layers(q)?;
        }
        let engine_id = self.entangle_bare(&(0..self.qubit_count).collect::<Vec<_>>())?;
        self.order_contiguous(engine_id)?;
        self.engine(engine_id).get_probs(out)
    }

    fn get_amplitude(&mut self, perm: BasisIndex) -> Result<Complex64> {
        if perm >= pow2(self.qubit_count) {
            return Err(SimError::InvalidBasisState {
                index: perm,
                dimension: pow2(self.qubit_count),
            });
        }
        for q in 0..self.qubit_count {
            self.flush_all_layers(q)?;
        }
        // Product of per-engine amplitudes and isolated shard branches.
        let mut amp = ONE_CMPLX;
        let mut engine_perms: BTreeMap<EngineId, BasisIndex> = BTreeMap::new();
        for q in 0..self.qubit_count {
            let bit = (perm >> q) & 1 == 1;
            match self.shards[q].unit {
                None => {
                    amp *= if bit {
                        self.shards[q].amp1
                    } else {
                        self.shards[q].amp0
                    };
                }
                Some(engine_id) => {
                    if bit {
                        *engine_perms.entry(engine_id).or_insert(0) |=
                            pow2(self.shards[q].mapped);
                    } else {
                        engine_perms.entry(engine_id).or_insert(0);
                    }
                }
            }
            if is_norm_zero(amp) {
                return Ok(ZERO_CMPLX);
            }
        }
        for (engine_id, engine_perm) in engine_perms {
            amp *= self.engine(engine_id).get_amplitude(engine_perm)?;
        }
        Ok(amp)
    }

    fn mtrx(&mut self, m: &[Complex64; 4], target: usize) -> Result<()> {
        check_qubit(target, self.qubit_count)?;
        if is_norm_zero(m[1]) && is_norm_zero(m[2]) {
            return self.phase(m[0], m[3], target);
        }
        if is_norm_zero(m[0]) && is_norm_zero(m[3]) {
            return self.invert(m[1], m[2], target);
        }

        if is_h_mtrx(m) {
            // A Hadamard either works on the cached pair directly or
            // toggles the shard's deferred-basis flag.
            if self.shards[target].is_isolated() {
                self.flush_single(target)?;
                if self.shards[target].has_cross_buffers()
                    && !try_h_commute(&mut self.shards, target)
                {
                    self.revert_cross_all(target)?;
                }
            }
            if self.shards[target].is_isolated() {
                return self.apply_inner_h(target);
            }
            let basis = self.shards[target].basis;
            self.shards[target].basis = match basis {
                PauliBasis::Z => PauliBasis::X,
                PauliBasis::X => PauliBasis::Z,
            };
            return Ok(());
        }

        // General matrix: every pending layer must flush first.
        self.revert_basis1(target)?;
        let combined = match self.shards[target].buffer.take() {
            Some(buf) => mat_mul_2x2(m, &buf.matrix()),
            None => *m,
        };
        self.revert_cross_all(target)?;
        self.apply_inner_mtrx(target, &combined)
    }

    fn phase(&mut self, top_left: Complex64, bottom_right: Complex64, target: usize) -> Result<()> {
        check_qubit(target, self.qubit_count)?;
        if is_same_complex(top_left, ONE_CMPLX) && is_same_complex(bottom_right, ONE_CMPLX) {
            return Ok(());
        }
        if self.config.global_phase_is_random && is_same_complex(top_left, bottom_right) {
            return Ok(());
        }

        if self.shards[target].basis == PauliBasis::X {
            // Commute through the deferred H: a σz-like phase becomes a
            // σx-like invert beneath it.
            if is_same_complex(top_left, bottom_right) {
                let buffer = self.shards[target]
                    .buffer
                    .get_or_insert_with(SingleBuffer::identity);
                buffer.compose_phase(top_left, top_left);
                return Ok(());
            }
            if is_same_complex(top_left, -bottom_right) {
                let buffer = self.shards[target]
                    .buffer
                    .get_or_insert_with(SingleBuffer::identity);
                buffer.compose_invert(top_left, top_left);
                return Ok(());
            }
            self.revert_basis1(target)?;
        }

        // A diagonal commutes inward past everything except an
        // invert-kind buffer targeting this qubit.
        let safe_inner = self.shards[target].is_isolated()
            && self.shards[target].buffer.is_none()
            && !self.shards[target].targets_of.values().any(|b| b.is_invert);
        if safe_inner {
            return self.apply_inner_phase(target, top_left, bottom_right);
        }
        let buffer = self.shards[target]
            .buffer
            .get_or_insert_with(SingleBuffer::identity);
        buffer.compose_phase(top_left, bottom_right);
        if buffer.is_identity() {
            self.shards[target].buffer = None;
        }
        Ok(())
    }

    fn invert(
        &mut self,
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()> {
        check_qubit(target, self.qubit_count)?;

        if self.shards[target].basis == PauliBasis::X {
            // Through the deferred H: σx-like inverts become σz-like
            // phases, Y-like inverts pick up a sign.
            if is_same_complex(top_right, bottom_left) {
                let buffer = self.shards[target]
                    .buffer
                    .get_or_insert_with(SingleBuffer::identity);
                buffer.compose_phase(top_right, -top_right);
                return Ok(());
            }
            if is_same_complex(top_right, -bottom_left) {
                let buffer = self.shards[target]
                    .buffer
                    .get_or_insert_with(SingleBuffer::identity);
                buffer.compose_invert(-top_right, top_right);
                return Ok(());
            }
            self.revert_basis1(target)?;
        }

        if self.shards[target].is_isolated()
            && self.shards[target].buffer.is_none()
            && !self.shards[target].has_cross_buffers()
        {
            return self.apply_inner_invert(target, top_right, bottom_left);
        }
        let buffer = self.shards[target]
            .buffer
            .get_or_insert_with(SingleBuffer::identity);
        buffer.compose_invert(top_right, bottom_left);
        if buffer.is_identity() {
            self.shards[target].buffer = None;
        }
        Ok(())
    }

    fn mc_mtrx(&mut self, controls: &[usize], m: &[Complex64; 4], target: usize) -> Result<()> {
        if is_norm_zero(m[1]) && is_norm_zero(m[2]) {
            return self.mc_phase(controls, m[0], m[3], target);
        }
        if is_norm_zero(m[0]) && is_norm_zero(m[3]) {
            return self.mc_invert(controls, m[1], m[2], target);
        }
        check_qubit(target, self.qubit_count)?;
        self.validate_controls(controls, target)?;
        let Some(kept) = self.trim_known_controls(controls, false) else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.mtrx(m, target);
        }
        self.controlled_engine_op(&kept, target, false, m)
    }

    fn mac_mtrx(&mut self, controls: &[usize], m: &[Complex64; 4], target: usize) -> Result<()> {
        if is_norm_zero(m[1]) && is_norm_zero(m[2]) {
            return self.mac_phase(controls, m[0], m[3], target);
        }
        if is_norm_zero(m[0]) && is_norm_zero(m[3]) {
            return self.mac_invert(controls, m[1], m[2], target);
        }
        check_qubit(target, self.qubit_count)?;
        self.validate_controls(controls, target)?;
        let Some(kept) = self.trim_known_controls(controls, true) else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.mtrx(m, target);
        }
        self.controlled_engine_op(&kept, target, true, m)
    }

    fn mc_phase(
        &mut self,
        controls: &[usize],
        top_left: Complex64,
        bottom_right: Complex64,
        target: usize,
    ) -> Result<()> {
        check_qubit(target, self.qubit_count)?;
        self.validate_controls(controls, target)?;
        if is_same_complex(top_left, ONE_CMPLX) && is_same_complex(bottom_right, ONE_CMPLX) {
            return Ok(());
        }
        let Some(kept) = self.trim_known_controls(controls, false) else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.phase(top_left, bottom_right, target);
        }

        let unit_entries = (top_left.norm_sqr() - 1.0).abs() <= FP_NORM_EPSILON
            && (bottom_right.norm_sqr() - 1.0).abs() <= FP_NORM_EPSILON;
        if kept.len() == 1 && unit_entries {
            let c = kept[0];
            // At the control, any gate conditions diagonally.
            self.prepare_buffer_endpoint(c, false)?;
            self.prepare_buffer_endpoint(target, false)?;
            add_phase_angles(
                &mut self.shards,
                c,
                target,
                2.0 * top_left.arg(),
                2.0 * bottom_right.arg(),
            );
            return Ok(());
        }

        let m = [top_left, ZERO_CMPLX, ZERO_CMPLX, bottom_right];
        self.controlled_engine_op(&kept, target, false, &m)
    }

    fn mac_phase(
        &mut self,
        controls: &[usize],
        top_left: Complex64,
        bottom_right: Complex64,
        target: usize,
    ) -> Result<()> {
        check_qubit(target, self.qubit_count)?;
        self.validate_controls(controls, target)?;
        if is_same_complex(top_left, ONE_CMPLX) && is_same_complex(bottom_right, ONE_CMPLX) {
            return Ok(());
        }
        let Some(kept) = self.trim_known_controls(controls, true) else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.phase(top_left, bottom_right, target);
        }
        let m = [top_left, ZERO_CMPLX, ZERO_CMPLX, bottom_right];
        self.controlled_engine_op(&kept, target, true, &m)
    }

    fn mc_invert(
        &mut self,
        controls: &[usize],
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()> {
        check_qubit(target, self.qubit_count)?;
        self.validate_controls(controls, target)?;
        let Some(kept) = self.trim_known_controls(controls, false) else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.invert(top_right, bottom_left, target);
        }

        let unit_entries = (top_right.norm_sqr() - 1.0).abs() <= FP_NORM_EPSILON
            && (bottom_left.norm_sqr() - 1.0).abs() <= FP_NORM_EPSILON;
        if kept.len() == 1 && unit_entries {
            let c = kept[0];
            // At the control, any gate conditions diagonally.
            self.prepare_buffer_endpoint(c, false)?;
            self.prepare_buffer_endpoint(target, true)?;
            add_inversion_angles(
                &mut self.shards,
                c,
                target,
                2.0 * top_right.arg(),
                2.0 * bottom_left.arg(),
            );
            return Ok(());
        }

        let m = [ZERO_CMPLX, top_right, bottom_left, ZERO_CMPLX];
        self.controlled_engine_op(&kept, target, false, &m)
    }

    fn mac_invert(
        &mut self,
        controls: &[usize],
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()> {
        check_qubit(target, self.qubit_count)?;
        self.validate_controls(controls, target)?;
        let Some(kept) = self.trim_known_controls(controls, true) else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.invert(top_right, bottom_left, target);
        }
        let m = [ZERO_CMPLX, top_right, bottom_left, ZERO_CMPLX];
        self.controlled_engine_op(&kept, target, true, &m)
    }

    fn uniformly_controlled_single_bit(
        &mut self,
        controls: &[usize],
        target: usize,
        mtrxs: &[[Complex64; 4]],
    ) -> Result<()> {
        check_qubit(target, self.qubit_count)?;
        self.validate_controls(controls, target)?;
        if mtrxs.len() != 1usize << controls.len() {
            return Err(SimError::invalid(
                "uniformly-controlled gate matrix count mismatch",
            ));
        }
        let mut involved: SmallVec<[usize; 8]> = SmallVec::from_slice(controls);
        involved.push(target);
        for &q in involved.iter() {
            self.flush_all_layers(q)?;
        }
        let engine_id = self.entangle_bare(&involved)?;
        let mapped: Vec<usize> = controls.iter().map(|&c| self.shards[c].mapped).collect();
        let mapped_t = self.shards[target].mapped;
        self.engine(engine_id)
            .uniformly_controlled_single_bit(&mapped, mapped_t, mtrxs)?;
        for &q in involved.iter() {
            self.dirty(q);
        }
        Ok(())
    }

    fn uniform_parity_rz(&mut self, mask: BasisIndex, angle: f64) -> Result<()> {
        if mask == 0 || mask >= pow2(self.qubit_count) {
            return Err(SimError::invalid("parity mask out of range"));
        }
        let qubits: Vec<usize> = (0..self.qubit_count)
            .filter(|&q| mask & pow2(q) != 0)
            .collect();
        for &q in &qubits {
            self.flush_all_layers(q)?;
        }
        let engine_id = self.entangle_bare(&qubits)?;
        let mut engine_mask = 0u64;
        for &q in &qubits {
            engine_mask |= pow2(self.shards[q].mapped);
        }
        self.engine(engine_id).uniform_parity_rz(engine_mask, angle)?;
        for &q in &qubits {
            self.shards[q].is_phase_dirty = true;
        }
        Ok(())
    }

    fn c_uniform_parity_rz(
        &mut self,
        controls: &[usize],
        mask: BasisIndex,
        angle: f64,
    ) -> Result<()> {
        if controls.is_empty() {
            return self.uniform_parity_rz(mask, angle);
        }
        if mask == 0 || mask >= pow2(self.qubit_count) {
            return Err(SimError::invalid("parity mask out of range"));
        }
        let Some(kept) = self.trim_known_controls(controls, false) else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.uniform_parity_rz(mask, angle);
        }
        let mut qubits: Vec<usize> = (0..self.qubit_count)
            .filter(|&q| mask & pow2(q) != 0)
            .collect();
        qubits.extend_from_slice(&kept);
        for &q in &qubits {
            self.flush_all_layers(q)?;
        }
        let engine_id = self.entangle_bare(&qubits)?;
        let mut engine_mask = 0u64;
        for q in (0..self.qubit_count).filter(|&q| mask & pow2(q) != 0) {
            engine_mask |= pow2(self.shards[q].mapped);
        }
        let mapped: Vec<usize> = kept.iter().map(|&c| self.shards[c].mapped).collect();
        self.engine(engine_id)
            .c_uniform_parity_rz(&mapped, engine_mask, angle)?;
        for &q in &qubits {
            self.dirty(q);
        }
        Ok(())
    }

    fn swap(&mut self, qubit1: usize, qubit2: usize) -> Result<()> {
        check_qubit(qubit1, self.qubit_count)?;
        check_qubit(qubit2, self.qubit_count)?;
        if qubit1 == qubit2 {
            return Ok(());
        }
        // Swap is pure bookkeeping: exchange the shard records and rename
        // every buffer edge referencing them.
        let rename = |i: usize| {
            if i == qubit1 {
                qubit2
            } else if i == qubit2 {
                qubit1
            } else {
                i
            }
        };
        let mut edges: BTreeMap<(usize, usize), PhaseBuffer> = BTreeMap::new();
        for &q in &[qubit1, qubit2] {
            for (&t, &b) in self.shards[q].controls_of.iter() {
                edges.insert((q, t), b);
            }
            for (&c, &b) in self.shards[q].targets_of.iter() {
                edges.insert((c, q), b);
            }
        }
        for &(c, t) in edges.keys() {
            remove_buffer(&mut self.shards, c, t);
        }
        self.shards.swap(qubit1, qubit2);
        for (&(c, t), &b) in edges.iter() {
            let (nc, nt) = (rename(c), rename(t));
            self.shards[nt].targets_of.insert(nc, b);
            self.shards[nc].controls_of.insert(nt, b);
        }
        Ok(())
    }

    fn rol(&mut self, shift: usize, start: usize, length: usize) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        if length == 1 || shift % length == 0 {
            return Ok(());
        }
        let engine_id = self.entangle_range(start, length, &[])?;
        let mapped_start = self.shards[start].mapped;
        self.engine(engine_id).rol(shift, mapped_start, length)?;
        for q in start..start + length {
            self.dirty(q);
        }
        Ok(())
    }

    fn inc(&mut self, to_add: BasisIndex, start: usize, length: usize) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        let mask = pow2(length) - 1;
        if to_add & mask == 0 {
            return Ok(());
        }

        // Classical shortcut: a register of settled bits increments in
        // the bookkeeping alone.
        let values: Option<Vec<bool>> = (start..start + length)
            .map(|q| {
                if self.shards[q].buffer.is_none() && !self.shards[q].has_cross_buffers() {
                    self.known_value(q)
                } else {
                    None
                }
            })
            .collect();
        if let Some(bits) = values {
            let mut v = 0u64;
            for (i, &bit) in bits.iter().enumerate() {
                if bit {
                    v |= 1 << i;
                }
            }
            let v = (v + to_add) & mask;
            for i in 0..length {
                let bit = (v >> i) & 1 == 1;
                let shard = &mut self.shards[start + i];
                shard.amp0 = if bit { ZERO_CMPLX } else { ONE_CMPLX };
                shard.amp1 = if bit { ONE_CMPLX } else { ZERO_CMPLX };
            }
            return Ok(());
        }

        let engine_id = self.entangle_range(start, length, &[])?;
        let mapped_start = self.shards[start].mapped;
        self.engine(engine_id).inc(to_add, mapped_start, length)?;
        for q in start..start + length {
            self.dirty(q);
        }
        Ok(())
    }

    fn c_inc(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        let Some(kept) = self.trim_known_controls(controls, false) else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.inc(to_add, start, length);
        }
        let engine_id = self.entangle_range(start, length, &kept)?;
        let mapped_start = self.shards[start].mapped;
        let mapped: Vec<usize> = kept.iter().map(|&c| self.shards[c].mapped).collect();
        self.engine(engine_id)
            .c_inc(to_add, mapped_start, length, &mapped)?;
        for q in start..start + length {
            self.dirty(q);
        }
        Ok(())
    }

    fn inc_c(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        carry: usize,
    ) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        check_qubit(carry, self.qubit_count)?;
        let engine_id = self.entangle_range(start, length, &[carry])?;
        let mapped_start = self.shards[start].mapped;
        let mapped_carry = self.shards[carry].mapped;
        self.engine(engine_id)
            .inc_c(to_add, mapped_start, length, mapped_carry)?;
        for q in start..start + length {
            self.dirty(q);
        }
        self.dirty(carry);
        Ok(())
    }

    fn dec_c(
        &mut self,
        to_sub: BasisIndex,
        start: usize,
        length: usize,
        carry: usize,
    ) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        check_qubit(carry, self.qubit_count)?;
        let engine_id = self.entangle_range(start, length, &[carry])?;
        let mapped_start = self.shards[start].mapped;
        let mapped_carry = self.shards[carry].mapped;
        self.engine(engine_id)
            .dec_c(to_sub, mapped_start, length, mapped_carry)?;
        for q in start..start + length {
            self.dirty(q);
        }
        self.dirty(carry);
        Ok(())
    }

    fn inc_s(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        overflow: usize,
    ) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        check_qubit(overflow, self.qubit_count)?;
        let engine_id = self.entangle_range(start, length, &[overflow])?;
        let mapped_start = self.shards[start].mapped;
        let mapped_overflow = self.shards[overflow].mapped;
        self.engine(engine_id)
            .inc_s(to_add, mapped_start, length, mapped_overflow)?;
        for q in start..start + length {
            self.dirty(q);
        }
        self.dirty(overflow);
        Ok(())
    }

    fn inc_sc(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        overflow: usize,
        carry: usize,
    ) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        check_qubit(overflow, self.qubit_count)?;
        check_qubit(carry, self.qubit_count)?;
        let engine_id = self.entangle_range(start, length, &[overflow, carry])?;
        let mapped_start = self.shards[start].mapped;
        let mapped_overflow = self.shards[overflow].mapped;
        let mapped_carry = self.shards[carry].mapped;
        self.engine(engine_id)
            .inc_sc(to_add, mapped_start, length, mapped_overflow, mapped_carry)?;
        for q in start..start + length {
            self.dirty(q);
        }
        self.dirty(overflow);
        self.dirty(carry);
        Ok(())
    }

    fn dec_sc(
        &mut self,
        to_sub: BasisIndex,
        start: usize,
        length: usize,
        overflow: usize,
        carry: usize,
    ) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        check_qubit(overflow, self.qubit_count)?;
        check_qubit(carry, self.qubit_count)?;
        let engine_id = self.entangle_range(start, length, &[overflow, carry])?;
        let mapped_start = self.shards[start].mapped;
        let mapped_overflow = self.shards[overflow].mapped;
        let mapped_carry = self.shards[carry].mapped;
        self.engine(engine_id)
            .dec_sc(to_sub, mapped_start, length, mapped_overflow, mapped_carry)?;
        for q in start..start + length {
            self.dirty(q);
        }
        self.dirty(overflow);
        self.dirty(carry);
        Ok(())
    }

    fn mul(
        &mut self,
        to_mul: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
    ) -> Result<()> {
        check_range(in_out_start, length, self.qubit_count)?;
        check_range(carry_start, length, self.qubit_count)?;
        let extra: Vec<usize> = (carry_start..carry_start + length).collect();
        let engine_id = self.entangle_range(in_out_start, length, &extra)?;
        let mapped_in = self.shards[in_out_start].mapped;
        let mapped_carry = self.shards[carry_start].mapped;
        self.engine(engine_id)
            .mul(to_mul, mapped_in, mapped_carry, length)?;
        for q in (in_out_start..in_out_start + length).chain(carry_start..carry_start + length) {
            self.dirty(q);
        }
        Ok(())
    }

    fn div(
        &mut self,
        to_div: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
    ) -> Result<()> {
        check_range(in_out_start, length, self.qubit_count)?;
        check_range(carry_start, length, self.qubit_count)?;
        let extra: Vec<usize> = (carry_start..carry_start + length).collect();
        let engine_id = self.entangle_range(in_out_start, length, &extra)?;
        let mapped_in = self.shards[in_out_start].mapped;
        let mapped_carry = self.shards[carry_start].mapped;
        self.engine(engine_id)
            .div(to_div, mapped_in, mapped_carry, length)?;
        for q in (in_out_start..in_out_start + length).chain(carry_start..carry_start + length) {
            self.dirty(q);
        }
        Ok(())
    }

    fn mul_mod_n_out(
        &mut self,
        to_mul: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
    ) -> Result<()> {
        check_range(in_start, length, self.qubit_count)?;
        check_range(out_start, length, self.qubit_count)?;
        let extra: Vec<usize> = (out_start..out_start + length).collect();
        let engine_id = self.entangle_range(in_start, length, &extra)?;
        let mapped_in = self.shards[in_start].mapped;
        let mapped_out = self.shards[out_start].mapped;
        self.engine(engine_id)
            .mul_mod_n_out(to_mul, mod_n, mapped_in, mapped_out, length)?;
        for q in (in_start..in_start + length).chain(out_start..out_start + length) {
            self.dirty(q);
        }
        Ok(())
    }

    fn imul_mod_n_out(
        &mut self,
        to_mul: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
    ) -> Result<()> {
        check_range(in_start, length, self.qubit_count)?;
        check_range(out_start, length, self.qubit_count)?;
        let extra: Vec<usize> = (out_start..out_start + length).collect();
        let engine_id = self.entangle_range(in_start, length, &extra)?;
        let mapped_in = self.shards[in_start].mapped;
        let mapped_out = self.shards[out_start].mapped;
        self.engine(engine_id)
            .imul_mod_n_out(to_mul, mod_n, mapped_in, mapped_out, length)?;
        for q in (in_start..in_start + length).chain(out_start..out_start + length) {
            self.dirty(q);
        }
        Ok(())
    }

    fn pow_mod_n_out(
        &mut self,
        base: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
    ) -> Result<()> {
        check_range(in_start, length, self.qubit_count)?;
        check_range(out_start, length, self.qubit_count)?;
        let extra: Vec<usize> = (out_start..out_start + length).collect();
        let engine_id = self.entangle_range(in_start, length, &extra)?;
        let mapped_in = self.shards[in_start].mapped;
        let mapped_out = self.shards[out_start].mapped;
        self.engine(engine_id)
            .pow_mod_n_out(base, mod_n, mapped_in, mapped_out, length)?;
        for q in (in_start..in_start + length).chain(out_start..out_start + length) {
            self.dirty(q);
        }
        Ok(())
    }

    fn c_mul(
        &mut self,
        to_mul: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()> {
        let Some(kept) = self.trim_known_controls(controls, false) else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.mul(to_mul, in_out_start, carry_start, length);
        }
        check_range(in_out_start, length, self.qubit_count)?;
        check_range(carry_start, length, self.qubit_count)?;
        let mut extra: Vec<usize> = (carry_start..carry_start + length).collect();
        extra.extend_from_slice(&kept);
        let engine_id = self.entangle_range(in_out_start, length, &extra)?;
        let mapped_in = self.shards[in_out_start].mapped;
        let mapped_carry = self.shards[carry_start].mapped;
        let mapped: Vec<usize> = kept.iter().map(|&c| self.shards[c].mapped).collect();
        self.engine(engine_id)
            .c_mul(to_mul, mapped_in, mapped_carry, length, &mapped)?;
        for q in (in_out_start..in_out_start + length).chain(carry_start..carry_start + length) {
            self.dirty(q);
        }
        Ok(())
    }

    fn c_div(
        &mut self,
        to_div: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()> {
        let Some(kept) = self.trim_known_controls(controls, false) else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.div(to_div, in_out_start, carry_start, length);
        }
        check_range(in_out_start, length, self.qubit_count)?;
        check_range(carry_start, length, self.qubit_count)?;
        let mut extra: Vec<usize> = (carry_start..carry_start + length).collect();
        extra.extend_from_slice(&kept);
        let engine_id = self.entangle_range(in_out_start, length, &extra)?;
        let mapped_in = self.shards[in_out_start].mapped;
        let mapped_carry = self.shards[carry_start].mapped;
        let mapped: Vec<usize> = kept.iter().map(|&c| self.shards[c].mapped).collect();
        self.engine(engine_id)
            .c_div(to_div, mapped_in, mapped_carry, length, &mapped)?;
        for q in (in_out_start..in_out_start + length).chain(carry_start..carry_start + length) {
            self.dirty(q);
        }
        Ok(())
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
        let Some(kept) = self.trim_known_controls(controls, false) else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.mul_mod_n_out(to_mul, mod_n, in_start, out_start, length);
        }
        check_range(in_start, length, self.qubit_count)?;
        check_range(out_start, length, self.qubit_count)?;
        let mut extra: Vec<usize> = (out_start..out_start + length).collect();
        extra.extend_from_slice(&kept);
        let engine_id = self.entangle_range(in_start, length, &extra)?;
        let mapped_in = self.shards[in_start].mapped;
        let mapped_out = self.shards[out_start].mapped;
        let mapped: Vec<usize> = kept.iter().map(|&c| self.shards[c].mapped).collect();
        self.engine(engine_id)
            .c_mul_mod_n_out(to_mul, mod_n, mapped_in, mapped_out, length, &mapped)?;
        for q in (in_start..in_start + length).chain(out_start..out_start + length) {
            self.dirty(q);
        }
        Ok(())
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
        let Some(kept) = self.trim_known_controls(controls, false) else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.imul_mod_n_out(to_mul, mod_n, in_start, out_start, length);
        }
        check_range(in_start, length, self.qubit_count)?;
        check_range(out_start, length, self.qubit_count)?;
        let mut extra: Vec<usize> = (out_start..out_start + length).collect();
        extra.extend_from_slice(&kept);
        let engine_id = self.entangle_range(in_start, length, &extra)?;
        let mapped_in = self.shards[in_start].mapped;
        let mapped_out = self.shards[out_start].mapped;
        let mapped: Vec<usize> = kept.iter().map(|&c| self.shards[c].mapped).collect();
        self.engine(engine_id)
            .c_imul_mod_n_out(to_mul, mod_n, mapped_in, mapped_out, length, &mapped)?;
        for q in (in_start..in_start + length).chain(out_start..out_start + length) {
            self.dirty(q);
        }
        Ok(())
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
        let Some(kept) = self.trim_known_controls(controls, false) else {
            return Ok(());
        };
        if kept.is_empty() {
            return self.pow_mod_n_out(base, mod_n, in_start, out_start, length);
        }
        check_range(in_start, length, self.qubit_count)?;
        check_range(out_start, length, self.qubit_count)?;
        let mut extra: Vec<usize> = (out_start..out_start + length).collect();
        extra.extend_from_slice(&kept);
        let engine_id = self.entangle_range(in_start, length, &extra)?;
        let mapped_in = self.shards[in_start].mapped;
        let mapped_out = self.shards[out_start].mapped;
        let mapped: Vec<usize> = kept.iter().map(|&c| self.shards[c].mapped).collect();
        self.engine(engine_id)
            .c_pow_mod_n_out(base, mod_n, mapped_in, mapped_out, length, &mapped)?;
        for q in (in_start..in_start + length).chain(out_start..out_start + length) {
            self.dirty(q);
        }
        Ok(())
    }

    fn full_add(
        &mut self,
        input1: usize,
        input2: usize,
        carry_in_sum_out: usize,
        carry_out: usize,
    ) -> Result<()> {
        let bits = [input1, input2, carry_in_sum_out, carry_out];
        for &b in &bits {
            check_qubit(b, self.qubit_count)?;
            self.flush_all_layers(b)?;
        }
        let engine_id = self.entangle_bare(&bits)?;
        let m: Vec<usize> = bits.iter().map(|&b| self.shards[b].mapped).collect();
        self.engine(engine_id).full_add(m[0], m[1], m[2], m[3])?;
        for &b in &bits {
            self.dirty(b);
        }
        Ok(())
    }

    fn i_full_add(
        &mut self,
        input1: usize,
        input2: usize,
        carry_in_sum_out: usize,
        carry_out: usize,
    ) -> Result<()> {
        let bits = [input1, input2, carry_in_sum_out, carry_out];
        for &b in &bits {
            check_qubit(b, self.qubit_count)?;
            self.flush_all_layers(b)?;
        }
        let engine_id = self.entangle_bare(&bits)?;
        let m: Vec<usize> = bits.iter().map(|&b| self.shards[b].mapped).collect();
        self.engine(engine_id).i_full_add(m[0], m[1], m[2], m[3])?;
        for &b in &bits {
            self.dirty(b);
        }
        Ok(())
    }

    fn indexed_lda(
        &mut self,
        index_start: usize,
        index_length: usize,
        value_start: usize,
        value_length: usize,
        values: &[u8],
    ) -> Result<BasisIndex> {
        check_range(index_start, index_length, self.qubit_count)?;
        check_range(value_start, value_length, self.qubit_count)?;
        let extra: Vec<usize> = (value_start..value_start + value_length).collect();
        let engine_id = self.entangle_range(index_start, index_length, &extra)?;
        let mapped_index = self.shards[index_start].mapped;
        let mapped_value = self.shards[value_start].mapped;
        let result = self.engine(engine_id).indexed_lda(
            mapped_index,
            index_length,
            mapped_value,
            value_length,
            values,
        )?;
        for q in (index_start..index_start + index_length)
            .chain(value_start..value_start + value_length)
        {
            self.dirty(q);
        }
        Ok(result)
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
        check_range(index_start, index_length, self.qubit_count)?;
        check_range(value_start, value_length, self.qubit_count)?;
        check_qubit(carry_index, self.qubit_count)?;
        let mut extra: Vec<usize> = (value_start..value_start + value_length).collect();
        extra.push(carry_index);
        let engine_id = self.entangle_range(index_start, index_length, &extra)?;
        let mapped_index = self.shards[index_start].mapped;
        let mapped_value = self.shards[value_start].mapped;
        let mapped_carry = self.shards[carry_index].mapped;
        let result = self.engine(engine_id).indexed_adc(
            mapped_index,
            index_length,
            mapped_value,
            value_length,
            mapped_carry,
            values,
        )?;
        for q in (index_start..index_start + index_length)
            .chain(value_start..value_start + value_length)
        {
            self.dirty(q);
        }
        self.dirty(carry_index);
        Ok(result)
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
        check_range(index_start, index_length, self.qubit_count)?;
        check_range(value_start, value_length, self.qubit_count)?;
        check_qubit(carry_index, self.qubit_count)?;
        let mut extra: Vec<usize> = (value_start..value_start + value_length).collect();
        extra.push(carry_index);
        let engine_id = self.entangle_range(index_start, index_length, &extra)?;
        let mapped_index = self.shards[index_start].mapped;
        let mapped_value = self.shards[value_start].mapped;
        let mapped_carry = self.shards[carry_index].mapped;
        let result = self.engine(engine_id).indexed_sbc(
            mapped_index,
            index_length,
            mapped_value,
            value_length,
            mapped_carry,
            values,
        )?;
        for q in (index_start..index_start + index_length)
            .chain(value_start..value_start + value_length)
        {
            self.dirty(q);
        }
        self.dirty(carry_index);
        Ok(result)
    }

    fn hash(&mut self, start: usize, length: usize, values: &[u8]) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        let engine_id = self.entangle_range(start, length, &[])?;
        let mapped_start = self.shards[start].mapped;
        self.engine(engine_id).hash(mapped_start, length, values)?;
        for q in start..start + length {
            self.dirty(q);
        }
        Ok(())
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
        check_range(start, length, self.qubit_count)?;
        let engine_id = self.entangle_range(start, length, &[])?;
        let mapped_start = self.shards[start].mapped;
        self.engine(engine_id).zero_phase_flip(mapped_start, length)?;
        for q in start..start + length {
            self.shards[q].is_phase_dirty = true;
        }
        Ok(())
    }

    fn phase_flip_if_less(
        &mut self,
        greater_perm: BasisIndex,
        start: usize,
        length: usize,
    ) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        let engine_id = self.entangle_range(start, length, &[])?;
        let mapped_start = self.shards[start].mapped;
        self.engine(engine_id)
            .phase_flip_if_less(greater_perm, mapped_start, length)?;
        for q in start..start + length {
            self.shards[q].is_phase_dirty = true;
        }
        Ok(())
    }

    fn c_phase_flip_if_less(
        &mut self,
        greater_perm: BasisIndex,
        start: usize,
        length: usize,
        flag_index: usize,
    ) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        check_qubit(flag_index, self.qubit_count)?;
        let engine_id = self.entangle_range(start, length, &[flag_index])?;
        let mapped_start = self.shards[start].mapped;
        let mapped_flag = self.shards[flag_index].mapped;
        self.engine(engine_id)
            .c_phase_flip_if_less(greater_perm, mapped_start, length, mapped_flag)?;
        for q in start..start + length {
            self.shards[q].is_phase_dirty = true;
        }
        self.shards[flag_index].is_phase_dirty = true;
        Ok(())
    }

    fn phase_flip(&mut self) -> Result<()> {
        if self.config.global_phase_is_random {
            return Ok(());
        }
        let neg = Complex64::new(-1.0, 0.0);
        self.apply_inner_phase(0, neg, neg)
    }

    fn prob(&mut self, qubit: usize) -> Result<f64> {
        check_qubit(qubit, self.qubit_count)?;
        self.revert_basis1(qubit)?;
        self.revert_cross_target_inverts(qubit)?;

        let flip = matches!(&self.shards[qubit].buffer, Some(buf) if buf.is_invert);
        let raw = match self.shards[qubit].unit {
            None => {
                let shard = &self.shards[qubit];
                let total = shard.amp0.norm_sqr() + shard.amp1.norm_sqr();
                if total <= FP_NORM_EPSILON {
                    return Err(SimError::DegenerateState { norm: total });
                }
                shard.amp1.norm_sqr() / total
            }
            Some(engine_id) => {
                let mapped = self.shards[qubit].mapped;
                let p = self.engine(engine_id).prob(mapped)?;
                self.shards[qubit].is_prob_dirty = false;
                self.check_shard_separable(qubit, p)?;
                p
            }
        };
        Ok(if flip { 1.0 - raw } else { raw })
    }

    fn prob_all(&mut self, perm: BasisIndex) -> Result<f64> {
        Ok(self.get_amplitude(perm)?.norm_sqr())
    }

    fn prob_reg(&mut self, start: usize, length: usize, value: BasisIndex) -> Result<f64> {
        check_range(start, length, self.qubit_count)?;
        // Product over independent holders of the range's bits.
        let mut prob = 1.0;
        let mut engine_masks: BTreeMap<EngineId, (BasisIndex, BasisIndex)> = BTreeMap::new();
        for i in 0..length {
            let q = start + i;
            self.flush_all_layers(q)?;
            let bit = (value >> i) & 1 == 1;
            match self.shards[q].unit {
                None => {
                    let shard = &self.shards[q];
                    let total = shard.amp0.norm_sqr() + shard.amp1.norm_sqr();
                    if total <= FP_NORM_EPSILON {
                        return Err(SimError::DegenerateState { norm: total });
                    }
                    let p1 = shard.amp1.norm_sqr() / total;
                    prob *= if bit { p1 } else { 1.0 - p1 };
                }
                Some(engine_id) => {
                    let entry = engine_masks.entry(engine_id).or_insert((0, 0));
                    entry.0 |= pow2(self.shards[q].mapped);
                    if bit {
                        entry.1 |= pow2(self.shards[q].mapped);
                    }
                }
            }
        }
        for (engine_id, (mask, masked_value)) in engine_masks {
            prob *= self.engine(engine_id).prob_mask(mask, masked_value)?;
        }
        Ok(prob.clamp(0.0, 1.0))
    }

    fn prob_mask(&mut self, mask: BasisIndex, value: BasisIndex) -> Result<f64> {
        if mask >= pow2(self.qubit_count) {
            return Err(SimError::InvalidBasisState {
                index: mask,
                dimension: pow2(self.qubit_count),
            });
        }
        let mut prob = 1.0;
        let mut engine_masks: BTreeMap<EngineId, (BasisIndex, BasisIndex)> = BTreeMap::new();
        for q in 0..self.qubit_count {
            if mask & pow2(q) == 0 {
                continue;
            }
            self.flush_all_layers(q)?;
            let bit = (value >> q) & 1 == 1;
            match self.shards[q].unit {
                None => {
                    let shard = &self.shards[q];
                    let total = shard.amp0.norm_sqr() + shard.amp1.norm_sqr();
                    if total <= FP_NORM_EPSILON {
                        return Err(SimError::DegenerateState { norm: total });
                    }
                    let p1 = shard.amp1.norm_sqr() / total;
                    prob *= if bit { p1 } else { 1.0 - p1 };
                }
                Some(engine_id) => {
                    let entry = engine_masks.entry(engine_id).or_insert((0, 0));
                    entry.0 |= pow2(self.shards[q].mapped);
                    if bit {
                        entry.1 |= pow2(self.shards[q].mapped);
                    }
                }
            }
        }
        for (engine_id, (engine_mask, masked_value)) in engine_masks {
            prob *= self.engine(engine_id).prob_mask(engine_mask, masked_value)?;
        }
        Ok(prob.clamp(0.0, 1.0))
    }

    fn prob_parity(&mut self, mask: BasisIndex) -> Result<f64> {
        if mask == 0 {
            return Ok(0.0);
        }
        if mask >= pow2(self.qubit_count) {
            return Err(SimError::InvalidBasisState {
                index: mask,
                dimension: pow2(self.qubit_count),
            });
        }
        // Parity composes across independent parts:
        // p_odd(A∪B) = pA(1-pB) + pB(1-pA).
        let mut odd = 0.0f64;
        let fold = |p: f64, acc: f64| acc * (1.0 - p) + p * (1.0 - acc);
        let mut engine_masks: BTreeMap<EngineId, BasisIndex> = BTreeMap::new();
        for q in 0..self.qubit_count {
            if mask & pow2(q) == 0 {
                continue;
            }
            self.flush_all_layers(q)?;
            match self.shards[q].unit {
                None => {
                    let shard = &self.shards[q];
                    let total = shard.amp0.norm_sqr() + shard.amp1.norm_sqr();
                    if total <= FP_NORM_EPSILON {
                        return Err(SimError::DegenerateState { norm: total });
                    }
                    let p1 = shard.amp1.norm_sqr() / total;
                    odd = fold(p1, odd);
                }
                Some(engine_id) => {
                    *engine_masks.entry(engine_id).or_insert(0) |= pow2(self.shards[q].mapped);
                }
            }
        }
        for (engine_id, engine_mask) in engine_masks {
            let p = self.engine(engine_id).prob_parity(engine_mask)?;
            odd = fold(p, odd);
        }
        Ok(odd.clamp(0.0, 1.0))
    }

    fn force_m(&mut self, qubit: usize, result: bool, do_force: bool) -> Result<bool> {
        check_qubit(qubit, self.qubit_count)?;
        self.revert_basis1(qubit)?;
        self.flush_single(qubit)?;
        self.revert_cross_target_inverts(qubit)?;

        let outcome = match self.shards[qubit].unit {
            None => {
                let shard = &self.shards[qubit];
                let total = shard.amp0.norm_sqr() + shard.amp1.norm_sqr();
                if total <= FP_NORM_EPSILON {
                    return Err(SimError::DegenerateState { norm: total });
                }
                let prob_one = shard.amp1.norm_sqr() / total;
                let outcome = if do_force {
                    let p = if result { prob_one } else { 1.0 - prob_one };
                    if p <= FP_NORM_EPSILON {
                        return Err(SimError::invalid(
                            "forced measurement outcome has zero probability",
                        ));
                    }
                    result
                } else {
                    self.rng.gen::<f64>() < prob_one
                };
                let shard = &mut self.shards[qubit];
                shard.amp0 = if outcome { ZERO_CMPLX } else { ONE_CMPLX };
                shard.amp1 = if outcome { ONE_CMPLX } else { ZERO_CMPLX };
                outcome
            }
            Some(engine_id) => {
                let mapped = self.shards[qubit].mapped;
                let outcome = self.engine(engine_id).force_m(mapped, result, do_force)?;
                self.separate_bit(qubit, outcome)?;
                outcome
            }
        };

        // Resolve the remaining symbolic work against the collapsed bit.
        let targets: Vec<usize> = self.shards[qubit].controls_of.keys().copied().collect();
        for t in targets {
            let Some(buf) = self.shards[t].targets_of.get(&qubit).copied() else {
                continue;
            };
            remove_buffer(&mut self.shards, qubit, t);
            if outcome {
                if buf.is_invert {
                    self.apply_inner_invert(t, buf.cmplx0(), buf.cmplx1())?;
                } else {
                    self.apply_inner_phase(t, buf.cmplx0(), buf.cmplx1())?;
                }
            }
        }
        let controls: Vec<usize> = self.shards[qubit].targets_of.keys().copied().collect();
        for c in controls {
            let Some(buf) = self.shards[qubit].targets_of.get(&c).copied() else {
                continue;
            };
            remove_buffer(&mut self.shards, c, qubit);
            // Only phase buffers can remain here; on a collapsed target
            // they reduce to a phase on the control's |1⟩ branch.
            let factor = if outcome { buf.cmplx1() } else { buf.cmplx0() };
            self.apply_inner_phase(c, ONE_CMPLX, factor)?;
        }

        Ok(outcome)
    }

    fn force_m_parity(&mut self, mask: BasisIndex, result: bool, do_force: bool) -> Result<bool> {
        if mask == 0 || mask >= pow2(self.qubit_count) {
            return Err(SimError::invalid("parity mask out of range"));
        }
        let qubits: Vec<usize> = (0..self.qubit_count)
            .filter(|&q| mask & pow2(q) != 0)
            .collect();
        for &q in &qubits {
            self.flush_all_layers(q)?;
        }
        let engine_id = self.entangle_bare(&qubits)?;
        let mut engine_mask = 0u64;
        for &q in &qubits {
            engine_mask |= pow2(self.shards[q].mapped);
        }
        let outcome = self
            .engine(engine_id)
            .force_m_parity(engine_mask, result, do_force)?;
        for &q in &qubits {
            self.dirty(q);
        }
        Ok(outcome)
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
        let engine_offset = self.engines.len();

        // Renumber buffer edges: ours shift up past the insertion point,
        // the newcomer's shift to its landing position.
        renumber_edges(&mut self.shards, |i| if i >= start { i + n_b } else { i });
        renumber_edges(&mut other.shards, |i| i + start);
        for shard in &mut other.shards {
            if let Some(engine_id) = shard.unit.as_mut() {
                *engine_id += engine_offset;
            }
        }

        self.engines.append(&mut other.engines);
        let tail: Vec<QubitShard> = self.shards.split_off(start);
        self.shards.append(&mut other.shards);
        self.shards.extend(tail);
        self.qubit_count += n_b;
        Ok(start)
    }

    fn decompose(&mut self, start: usize, length: usize) -> Result<Self> {
        check_range(start, length, self.qubit_count)?;

        // Buffers straddling the boundary must resolve before the split.
        for q in start..start + length {
            let partners: Vec<usize> = self.shards[q]
                .controls_of
                .keys()
                .chain(self.shards[q].targets_of.keys())
                .copied()
                .filter(|&p| p < start || p >= start + length)
                .collect();
            for p in partners {
                self.apply_buffer(q, p)?;
                self.apply_buffer(p, q)?;
            }
        }

        // Shared engines holding both in-range and out-of-range qubits
        // must factor the range out.
        let needs_split = (start..start + length).any(|q| {
            self.shards[q].unit.is_some_and(|e| {
                (0..self.qubit_count).any(|p| {
                    (p < start || p >= start + length) && self.shards[p].unit == Some(e)
                })
            })
        });
        let mut dest_engine: Option<Backend> = None;
        let mut dest_mapped_start = 0usize;
        if needs_split {
            let engine_id = self.entangle_range(start, length, &[])?;
            self.order_contiguous(engine_id)?;
            let mapped_start = self.shards[start].mapped;
            let extracted = self
                .engine(engine_id)
                .decompose(mapped_start, length)?;
            for q in 0..self.qubit_count {
                if self.shards[q].unit == Some(engine_id) && self.shards[q].mapped > mapped_start {
                    if q < start || q >= start + length {
                        self.shards[q].mapped -= length;
                    }
                }
            }
            dest_engine = Some(extracted);
            dest_mapped_start = mapped_start;
        }

        // Move the shards out and renumber what stays behind.
        let mut dest = QUnit::new(length, 0, &self.sub_config())?;
        let moved: Vec<QubitShard> = self.shards.drain(start..start + length).collect();
        dest.shards = moved;
        renumber_edges(&mut dest.shards, |i| i - start);
        renumber_edges(&mut self.shards, |i| if i >= start + length { i - length } else { i });
        self.qubit_count -= length;

        match dest_engine {
            Some(engine) => {
                let dest_id = dest.alloc_engine(engine);
                for shard in &mut dest.shards {
                    shard.unit = Some(dest_id);
                    shard.mapped -= dest_mapped_start;
                }
            }
            None => {
                // Whole engines may still move across when the range held
                // them exclusively.
                let mut moved_engines: BTreeMap<EngineId, EngineId> = BTreeMap::new();
                let old_ids: Vec<Option<EngineId>> = dest.shards.iter().map(|s| s.unit).collect();
                for old_id in old_ids.iter().flatten() {
                    if !moved_engines.contains_key(old_id) {
                        let engine = self.engines[*old_id]
                            .take()
                            .expect("engine ids in shards always point at live engines");
                        let new_id = dest.alloc_engine(engine);
                        moved_engines.insert(*old_id, new_id);
                    }
                }
                for (shard, old_id) in dest.shards.iter_mut().zip(old_ids.iter()) {
                    if let Some(old_id) = old_id {
                        shard.unit = Some(moved_engines[old_id]);
                    }
                }
            }
        }
        Ok(dest)
    }

    fn dispose(&mut self, start: usize, length: usize) -> Result<()> {
        self.decompose(start, length).map(|_| ())
    }

    fn dispose_perm(&mut self, start: usize, length: usize, perm: BasisIndex) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        if perm >= pow2(length) {
            return Err(SimError::InvalidBasisState {
                index: perm,
                dimension: pow2(length),
            });
        }
        for i in 0..length {
            let bit = (perm >> i) & 1 == 1;
            self.force_m(start + i, bit, true)?;
        }
        self.dispose(start, length)
    }

    fn normalize_state(&mut self) -> Result<()> {
        for engine in self.engines.iter_mut().flatten() {
            engine.normalize_state()?;
        }
        for shard in &mut self.shards {
            if shard.is_isolated() {
                let norm = (shard.amp0.norm_sqr() + shard.amp1.norm_sqr()).sqrt();
                if norm <= FP_NORM_EPSILON {
                    return Err(SimError::DegenerateState {
                        norm: norm * norm,
                    });
                }
                shard.amp0 /= norm;
                shard.amp1 /= norm;
            }
        }
        Ok(())
    }

    fn update_running_norm(&mut self) -> Result<f64> {
        let mut total = 1.0;
        for engine in self.engines.iter_mut().flatten() {
            total *= engine.update_running_norm()?;
        }
        for shard in &self.shards {
            if shard.is_isolated() {
                total *= shard.amp0.norm_sqr() + shard.amp1.norm_sqr();
            }
        }
        Ok(total)
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

fn mat_mul_2x2(a: &[Complex64; 4], b: &[Complex64; 4]) -> [Complex64; 4] {
    [
        a[0] * b[0] + a[1] * b[2],
        a[0] * b[1] + a[1] * b[3],
        a[2] * b[0] + a[3] * b[2],
        a[2] * b[1] + a[3] * b[3],
    ]
}

/// Rebuild every cross-buffer key under an index mapping
fn renumber_edges(shards: &mut [QubitShard], f: impl Fn(usize) -> usize) {
    for shard in shards.iter_mut() {
        shard.controls_of = shard
            .controls_of
            .iter()
            .map(|(&k, &v)| (f(k), v))
            .collect();
        shard.targets_of = shard
            .targets_of
            .iter()
            .map(|(&k, &v)| (f(k), v))
            .collect();
    }
}

impl Clone for QUnit {
    fn clone(&self) -> Self {
        Self {
            qubit_count: self.qubit_count,
            shards: self.shards.clone(),
            engines: self.engines.clone(),
            config: self.config.clone(),
            rng: self.rng.clone(),
        }
    }
}

impl std::fmt::Debug for QUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QUnit")
            .field("qubit_count", &self.qubit_count)
            .field("engine_count", &self.engine_count())
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

    fn cpu_cfg() -> EngineConfig {
        EngineConfig::new().with_seed(42).with_stabilizer(false)
    }

    fn state_of(unit: &mut QUnit) -> Vec<Complex64> {
        let mut out = vec![ZERO_CMPLX; unit.max_q_power() as usize];
        unit.get_quantum_state(&mut out).unwrap();
        out
    }

    fn x_gate(unit: &mut QUnit, q: usize) {
        unit.invert(ONE_CMPLX, ONE_CMPLX, q).unwrap();
    }

    fn h_gate(unit: &mut QUnit, q: usize) {
        unit.mtrx(&h_mtrx(), q).unwrap();
    }

    fn cnot(unit: &mut QUnit, c: usize, t: usize) {
        unit.mc_invert(&[c], ONE_CMPLX, ONE_CMPLX, t).unwrap();
    }

    fn cz(unit: &mut QUnit, c: usize, t: usize) {
        unit.mc_phase(&[c], ONE_CMPLX, Complex64::new(-1.0, 0.0), t)
            .unwrap();
    }

    #[test]
    fn test_initial_permutation_is_isolated() {
        let unit = QUnit::new(4, 0b1010, &cfg()).unwrap();
        for q in 0..4 {
            assert!(unit.is_isolated(q));
        }
        assert_eq!(unit.engine_count(), 0);
    }

    #[test]
    fn test_single_qubit_gates_stay_isolated() {
        let mut unit = QUnit::new(3, 0, &cfg()).unwrap();
        h_gate(&mut unit, 0);
        x_gate(&mut unit, 1);
        unit.phase(ONE_CMPLX, Complex64::new(0.0, 1.0), 2).unwrap();
        for q in 0..3 {
            assert!(unit.is_isolated(q));
        }
        assert_relative_eq!(unit.prob(0).unwrap(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(unit.prob(1).unwrap(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(unit.prob(2).unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_bell_pair_buffers_then_materializes() {
        let mut unit = QUnit::new(2, 0, &cfg()).unwrap();
        h_gate(&mut unit, 0);
        cnot(&mut unit, 0, 1);
        // The CNOT buffers symbolically; nothing entangles yet.
        assert!(unit.is_isolated(0));
        assert!(unit.is_isolated(1));

        let amps = state_of(&mut unit);
        assert_relative_eq!(amps[0].norm(), SQRT1_2, epsilon = 1e-10);
        assert_relative_eq!(amps[3].norm(), SQRT1_2, epsilon = 1e-10);
        assert_relative_eq!(amps[1].norm(), 0.0, epsilon = 1e-10);
        assert_relative_eq!(amps[2].norm(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_bell_measurement_correlation() {
        for seed in 0..8 {
            let mut unit =
                QUnit::new(2, 0, &EngineConfig::new().with_seed(seed)).unwrap();
            h_gate(&mut unit, 0);
            cnot(&mut unit, 0, 1);
            let outcome = unit.m(0).unwrap();
            assert_relative_eq!(
                unit.prob(1).unwrap(),
                if outcome { 1.0 } else { 0.0 },
                epsilon = 1e-10
            );
        }
    }

    #[test]
    fn test_cz_twice_recovers_separability() {
        let mut unit = QUnit::new(2, 0, &cfg()).unwrap();
        h_gate(&mut unit, 0);
        h_gate(&mut unit, 1);
        cz(&mut unit, 0, 1);
        cz(&mut unit, 0, 1);
        // The two CZs cancel in the buffers; no engine was ever built.
        assert!(unit.is_isolated(0));
        assert!(unit.is_isolated(1));
        assert_eq!(unit.engine_count(), 0);
        assert_relative_eq!(unit.prob(0).unwrap(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(unit.prob(1).unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_probability_control_is_noop() {
        let mut unit = QUnit::new(2, 0, &cfg()).unwrap();
        cnot(&mut unit, 0, 1);
        assert!(unit.is_isolated(1));
        assert_relative_eq!(unit.prob(1).unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_one_probability_control_reduces() {
        let mut unit = QUnit::new(2, 1, &cfg()).unwrap();
        cnot(&mut unit, 0, 1);
        assert!(unit.is_isolated(1));
        assert_relative_eq!(unit.prob(1).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_h_twice_is_identity() {
        let mut unit = QUnit::new(1, 0, &cfg()).unwrap();
        h_gate(&mut unit, 0);
        h_gate(&mut unit, 0);
        let amps = state_of(&mut unit);
        assert_relative_eq!(amps[0].norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_matches_plain_engine() {
        use qforge_state::QEngineCpu;
        // The unit layer must be observationally equivalent to a bare
        // state-vector engine over the probability surfaces.
        let mut unit = QUnit::new(3, 0, &cpu_cfg()).unwrap();
        let mut engine = QEngineCpu::new(3, 0, &cfg()).unwrap();

        let t = [
            ONE_CMPLX,
            ZERO_CMPLX,
            ZERO_CMPLX,
            Complex64::from_polar(1.0, std::f64::consts::FRAC_PI_4),
        ];
        h_gate(&mut unit, 0);
        engine.mtrx(&h_mtrx(), 0).unwrap();
        cnot(&mut unit, 0, 1);
        engine.mc_invert(&[0], ONE_CMPLX, ONE_CMPLX, 1).unwrap();
        unit.mtrx(&t, 1).unwrap();
        engine.mtrx(&t, 1).unwrap();
        cz(&mut unit, 1, 2);
        engine
            .mc_phase(&[1], ONE_CMPLX, Complex64::new(-1.0, 0.0), 2)
            .unwrap();
        h_gate(&mut unit, 2);
        engine.mtrx(&h_mtrx(), 2).unwrap();

        for q in 0..3 {
            assert_relative_eq!(
                unit.prob(q).unwrap(),
                engine.prob(q).unwrap(),
                epsilon = 1e-9
            );
        }
        for perm in 0..8u64 {
            assert_relative_eq!(
                unit.prob_all(perm).unwrap(),
                engine.prob_all(perm).unwrap(),
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn test_measurement_separates_engine() {
        let mut unit = QUnit::new(2, 0, &cfg()).unwrap();
        h_gate(&mut unit, 0);
        cnot(&mut unit, 0, 1);
        // Force materialization, then measure: both qubits re-isolate.
        let _ = state_of(&mut unit);
        let _ = unit.m(0).unwrap();
        assert!(unit.is_isolated(0));
        assert!(unit.is_isolated(1));
        assert_eq!(unit.engine_count(), 0);
    }

    #[test]
    fn test_inc_classical_shortcut() {
        let mut unit = QUnit::new(4, 0b0101, &cfg()).unwrap();
        unit.inc(3, 0, 4).unwrap();
        assert_eq!(unit.engine_count(), 0);
        // 5 + 3 = 8
        assert_relative_eq!(unit.prob_all(0b1000).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_inc_on_superposition() {
        let mut unit = QUnit::new(3, 0, &cfg()).unwrap();
        h_gate(&mut unit, 0);
        unit.inc(1, 0, 3).unwrap();
        let amps = state_of(&mut unit);
        // (|0> + |1>)/sqrt(2) + 1 = (|1> + |2>)/sqrt(2)
        assert_relative_eq!(amps[1].norm(), SQRT1_2, epsilon = 1e-10);
        assert_relative_eq!(amps[2].norm(), SQRT1_2, epsilon = 1e-10);
    }

    #[test]
    fn test_swap_is_bookkeeping() {
        let mut unit = QUnit::new(2, 0b01, &cfg()).unwrap();
        h_gate(&mut unit, 1);
        unit.swap(0, 1).unwrap();
        assert_eq!(unit.engine_count(), 0);
        assert_relative_eq!(unit.prob(1).unwrap(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(unit.prob(0).unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_and_decompose() {
        let mut a = QUnit::new(2, 0b01, &cfg()).unwrap();
        let mut b = QUnit::new(1, 1, &cfg()).unwrap();
        h_gate(&mut b, 0);

        let start = a.compose(b).unwrap();
        assert_eq!(start, 2);
        assert_eq!(a.qubit_count(), 3);
        assert_relative_eq!(a.prob(0).unwrap(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(a.prob(2).unwrap(), 0.5, epsilon = 1e-12);

        let mut dest = a.decompose(2, 1).unwrap();
        assert_eq!(a.qubit_count(), 2);
        assert_eq!(dest.qubit_count(), 1);
        assert_relative_eq!(dest.prob(0).unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_decompose_entangled_block() {
        let mut unit = QUnit::new(3, 0, &cfg()).unwrap();
        h_gate(&mut unit, 1);
        cnot(&mut unit, 1, 2);
        let _ = state_of(&mut unit);

        // Qubits 1 and 2 are mutually entangled but separable from 0.
        let mut dest = unit.decompose(1, 2).unwrap();
        assert_eq!(unit.qubit_count(), 1);
        assert_eq!(dest.qubit_count(), 2);
        let amps = state_of(&mut dest);
        assert_relative_eq!(amps[0].norm(), SQRT1_2, epsilon = 1e-9);
        assert_relative_eq!(amps[3].norm(), SQRT1_2, epsilon = 1e-9);
    }

    #[test]
    fn test_ghz_through_unit() {
        let mut unit = QUnit::new(3, 0, &cfg()).unwrap();
        h_gate(&mut unit, 0);
        cnot(&mut unit, 0, 1);
        cnot(&mut unit, 1, 2);
        let amps = state_of(&mut unit);
        assert_relative_eq!(amps[0].norm(), SQRT1_2, epsilon = 1e-9);
        assert_relative_eq!(amps[7].norm(), SQRT1_2, epsilon = 1e-9);
        for i in 1..7 {
            assert_relative_eq!(amps[i].norm(), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_x_basis_deferred_hadamard() {
        let mut unit = QUnit::new(2, 0, &cpu_cfg()).unwrap();
        h_gate(&mut unit, 0);
        cnot(&mut unit, 0, 1);
        let _ = state_of(&mut unit); // entangle
        assert!(!unit.is_isolated(0));
        // H on the shared qubit defers as a basis flag; a second H undoes
        // it with no engine work.
        h_gate(&mut unit, 0);
        assert_eq!(unit.shards[0].basis, PauliBasis::X);
        h_gate(&mut unit, 0);
        assert_eq!(unit.shards[0].basis, PauliBasis::Z);
        // X in the deferred-H frame is a Z; probabilities are unchanged.
        h_gate(&mut unit, 0);
        x_gate(&mut unit, 0);
        assert_relative_eq!(unit.prob(1).unwrap(), 0.5, epsilon = 1e-10);
    }

    #[test]
    fn test_pow_mod_scenario() {
        // Output register holds 2^x mod 15 for each basis input.
        let mut unit = QUnit::new(7, 3, &cfg()).unwrap();
        unit.pow_mod_n_out(2, 15, 0, 3, 4).unwrap();
        let expected = 3 | (8 << 3); // 2^3 mod 15 = 8
        assert_relative_eq!(unit.prob_all(expected).unwrap(), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_prob_reg_and_parity() {
        let mut unit = QUnit::new(3, 0, &cfg()).unwrap();
        h_gate(&mut unit, 0);
        x_gate(&mut unit, 2);
        assert_relative_eq!(unit.prob_reg(0, 2, 0b00).unwrap(), 0.5, epsilon = 1e-10);
        assert_relative_eq!(unit.prob_reg(1, 2, 0b10).unwrap(), 1.0, epsilon = 1e-10);
        assert_relative_eq!(unit.prob_parity(0b101).unwrap(), 0.5, epsilon = 1e-10);
        assert_relative_eq!(unit.prob_parity(0b100).unwrap(), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_set_reg() {
        let mut unit = QUnit::new(4, 0, &cfg()).unwrap();
        unit.set_reg(1, 3, 0b101).unwrap();
        assert_relative_eq!(unit.prob_all(0b1010).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_dispose_perm() {
        let mut unit = QUnit::new(3, 0b010, &cfg()).unwrap();
        unit.dispose_perm(1, 1, 1).unwrap();
        assert_eq!(unit.qubit_count(), 2);
        assert_relative_eq!(unit.prob_all(0).unwrap(), 1.0, epsilon = 1e-12);
    }
}
