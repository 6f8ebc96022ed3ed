//! The amplitude pager
//!
//! `QPager` shards one logical register's 2^n amplitudes into equal
//! power-of-two pages, each held by its own `QEngineCpu`. A qubit below
//! log2(page_size) is intra-page: gates on it dispatch to every page
//! independently. A qubit above is inter-page: gates on it pair up pages,
//! swap the upper half of the low page with the lower half of the high
//! page, act on each page's top intra-page qubit, and swap back. A
//! permutation-only inter-page gate reduces to swapping page pointers,
//! and an inter-page phase gate to scalar multiplies of half the pages.
//!
//! Operations with no per-page decomposition (register arithmetic,
//! compose/decompose, uniformly-controlled gates) combine the pages into
//! one engine, run there, and re-split.

use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use qforge_core::error::{check_qubit, check_range};
use qforge_core::{
    pow2, BasisIndex, EngineConfig, QuantumBackend, Result, SimError, FP_NORM_EPSILON,
    MAX_QUBIT_CAPACITY, ONE_CMPLX,
};

use crate::engine::QEngineCpu;

/// State-vector engine sharded into fixed-size pages
#[derive(Clone)]
pub struct QPager {
    qubit_count: usize,
    qubits_per_page: usize,
    pages: Vec<QEngineCpu>,
    config: EngineConfig,
    rng: StdRng,
}

impl QPager {
    pub fn new(qubit_count: usize, perm: BasisIndex, config: &EngineConfig) -> Result<Self> {
        if qubit_count == 0 || qubit_count > MAX_QUBIT_CAPACITY {
            return Err(SimError::CapacityExceeded {
                reason: format!(
                    "{} qubits outside the supported 1..={} range",
                    qubit_count, MAX_QUBIT_CAPACITY
                ),
            });
        }
        if qubit_count > config.max_paging_qubits {
            return Err(SimError::CapacityExceeded {
                reason: format!(
                    "{} qubits exceeds max_paging_qubits = {}",
                    qubit_count, config.max_paging_qubits
                ),
            });
        }

        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let qubits_per_page = config.page_qubits.clamp(1, qubit_count);
        let page_count = 1usize << (qubit_count - qubits_per_page);
        let page_len = pow2(qubits_per_page);

        let mut pages = Vec::with_capacity(page_count);
        for p in 0..page_count as u64 {
            let mut page_config = config.clone();
            page_config.rng_seed = Some(rng.gen());
            page_config.dispatch_queue = false;
            if perm >> qubits_per_page == p {
                pages.push(QEngineCpu::new(
                    qubits_per_page,
                    perm & (page_len - 1),
                    &page_config,
                )?);
            } else {
                let mut page = QEngineCpu::new(qubits_per_page, 0, &page_config)?;
                page.zero_amplitudes();
                pages.push(page);
            }
        }

        Ok(Self {
            qubit_count,
            qubits_per_page,
            pages,
            config: config.clone(),
            rng,
        })
    }

    /// Wrap an existing flat engine into pager geometry
    pub fn from_engine(engine: QEngineCpu, config: &EngineConfig) -> Result<Self> {
        let mut pager = Self::new(engine.qubit_count(), 0, config)?;
        pager.split_from(engine)?;
        Ok(pager)
    }

    #[inline]
    fn page_len(&self) -> u64 {
        pow2(self.qubits_per_page)
    }

    #[inline]
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    fn is_intra(&self, qubit: usize) -> bool {
        qubit < self.qubits_per_page
    }

    /// Page-space bit for an inter-page qubit
    #[inline]
    fn page_bit(&self, qubit: usize) -> usize {
        1usize << (qubit - self.qubits_per_page)
    }

    fn page_pair(&mut self, a: usize, b: usize) -> (&mut QEngineCpu, &mut QEngineCpu) {
        debug_assert!(a < b);
        let (lo, hi) = self.pages.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    }

    /// Drain the pages into one flat engine
    fn combine(&mut self) -> Result<QEngineCpu> {
        let page_len = self.page_len();
        if self.page_count() == 1 {
            return Ok(self.pages.pop().expect("pager always holds a page"));
        }
        let mut engine = self.pages[0].clone_empty(self.qubit_count, 0)?;
        engine.zero_amplitudes();
        for (p, page) in self.pages.iter_mut().enumerate() {
            engine.set_amplitude_page_from(page, 0, p as u64 * page_len, page_len);
        }
        self.pages.clear();
        Ok(engine)
    }

    /// Rebuild the pages from a flat engine of matching width
    fn split_from(&mut self, mut engine: QEngineCpu) -> Result<()> {
        self.set_geometry(engine.qubit_count());
        let page_len = self.page_len();
        let page_count = 1usize << (self.qubit_count - self.qubits_per_page);
        self.pages.clear();
        if page_count == 1 {
            self.pages.push(engine);
            return Ok(());
        }
        for p in 0..page_count as u64 {
            let mut page = engine.clone_empty(self.qubits_per_page, 0)?;
            page.zero_amplitudes();
            page.set_amplitude_page_from(&mut engine, p * page_len, 0, page_len);
            self.pages.push(page);
        }
        Ok(())
    }

    fn set_geometry(&mut self, qubit_count: usize) {
        self.qubit_count = qubit_count;
        self.qubits_per_page = self.config.page_qubits.clamp(1, qubit_count);
    }

    /// Combine, run one operation on the flat engine, and re-split
    fn with_combined<T>(
        &mut self,
        f: impl FnOnce(&mut QEngineCpu) -> Result<T>,
    ) -> Result<T> {
        let mut engine = self.combine()?;
        let result = f(&mut engine);
        self.split_from(engine)?;
        result
    }

    fn combined_clone(&self) -> Result<QEngineCpu> {
        let mut copy = self.clone();
        copy.combine()
    }

    fn total_raw(&mut self) -> f64 {
        self.pages
            .iter_mut()
            .map(|page| page.prob_sum(|_| true))
            .sum()
    }

    /// Rescaled probability of a predicate over global basis indices
    fn global_prob<F>(&mut self, pred: F) -> Result<f64>
    where
        F: Fn(u64) -> bool + Sync,
    {
        let shift = self.qubits_per_page;
        let mut raw = 0.0;
        let mut total = 0.0;
        for (p, page) in self.pages.iter_mut().enumerate() {
            let offset = (p as u64) << shift;
            raw += page.prob_sum(|j| pred(offset | j));
            total += page.prob_sum(|_| true);
        }
        if total <= FP_NORM_EPSILON {
            return Err(SimError::DegenerateState { norm: total });
        }
        Ok((raw / total).clamp(0.0, 1.0))
    }

    /// Split a control list into intra-page and meta (page-selecting) sets
    fn split_controls(&self, controls: &[usize]) -> (Vec<usize>, usize) {
        let mut intra = Vec::new();
        let mut meta_mask = 0usize;
        for &c in controls {
            if self.is_intra(c) {
                intra.push(c);
            } else {
                meta_mask |= self.page_bit(c);
            }
        }
        (intra, meta_mask)
    }

    /// Apply a single-bit matrix to an inter-page target by pairing pages
    fn meta_controlled(
        &mut self,
        anti: bool,
        meta_mask: usize,
        target: usize,
        intra_controls: &[usize],
        m: &[Complex64; 4],
    ) -> Result<()> {
        let t_bit = self.page_bit(target);
        let want = if anti { 0 } else { meta_mask };
        let sqi = self.qubits_per_page - 1;
        for p in 0..self.page_count() {
            if p & t_bit != 0 || p & meta_mask != want {
                continue;
            }
            let q = p | t_bit;
            let (lo, hi) = self.page_pair(p, q);
            lo.shuffle_buffers(hi)?;
            for page in [&mut *lo, &mut *hi] {
                if intra_controls.is_empty() {
                    page.mtrx(m, sqi)?;
                } else if anti {
                    page.mac_mtrx(intra_controls, m, sqi)?;
                } else {
                    page.mc_mtrx(intra_controls, m, sqi)?;
                }
            }
            lo.shuffle_buffers(hi)?;
        }
        Ok(())
    }

    /// Controls are (partly) meta but the target fits inside a page
    fn semi_meta_controlled(
        &mut self,
        anti: bool,
        meta_mask: usize,
        target: usize,
        intra_controls: &[usize],
        m: &[Complex64; 4],
    ) -> Result<()> {
        let want = if anti { 0 } else { meta_mask };
        for p in 0..self.page_count() {
            if p & meta_mask != want {
                continue;
            }
            let page = &mut self.pages[p];
            if intra_controls.is_empty() {
                page.mtrx(m, target)?;
            } else if anti {
                page.mac_mtrx(intra_controls, m, target)?;
            } else {
                page.mc_mtrx(intra_controls, m, target)?;
            }
        }
        Ok(())
    }

    fn controlled_dispatch(
        &mut self,
        controls: &[usize],
        m: &[Complex64; 4],
        target: usize,
        anti: bool,
    ) -> Result<()> {
        check_qubit(target, self.qubit_count)?;
        for &c in controls {
            check_qubit(c, self.qubit_count)?;
            if c == target {
                return Err(SimError::invalid("control equals target"));
            }
        }
        let (intra, meta_mask) = self.split_controls(controls);
        if self.is_intra(target) {
            return self.semi_meta_controlled(anti, meta_mask, target, &intra, m);
        }
        // The shuffle trick parks the target in the page's top slot; an
        // intra control living there forces the flat path.
        let sqi = self.qubits_per_page - 1;
        if intra.contains(&sqi) {
            let controls = controls.to_vec();
            let m = *m;
            return self.with_combined(move |engine| {
                if anti {
                    engine.mac_mtrx(&controls, &m, target)
                } else {
                    engine.mc_mtrx(&controls, &m, target)
                }
            });
        }
        self.meta_controlled(anti, meta_mask, target, &intra, m)
    }
}

impl QuantumBackend for QPager {
    fn qubit_count(&self) -> usize {
        self.qubit_count
    }

    fn finish(&mut self) {
        for page in &mut self.pages {
            page.finish();
        }
    }

    fn set_permutation(&mut self, perm: BasisIndex) -> Result<()> {
        if perm >= pow2(self.qubit_count) {
            return Err(SimError::InvalidBasisState {
                index: perm,
                dimension: pow2(self.qubit_count),
            });
        }
        let shift = self.qubits_per_page;
        let page_len = self.page_len();
        for (p, page) in self.pages.iter_mut().enumerate() {
            if perm >> shift == p as u64 {
                page.set_permutation(perm & (page_len - 1))?;
            } else {
                page.zero_amplitudes();
            }
        }
        Ok(())
    }

    fn set_quantum_state(&mut self, amplitudes: &[Complex64]) -> Result<()> {
        if amplitudes.len() as u64 != pow2(self.qubit_count) {
            return Err(SimError::invalid("state length mismatch"));
        }
        let page_len = self.page_len() as usize;
        for (p, page) in self.pages.iter_mut().enumerate() {
            page.set_quantum_state(&amplitudes[p * page_len..(p + 1) * page_len])?;
        }
        Ok(())
    }

    fn get_quantum_state(&mut self, out: &mut [Complex64]) -> Result<()> {
        if out.len() as u64 != pow2(self.qubit_count) {
            return Err(SimError::invalid("output buffer length mismatch"));
        }
        let page_len = self.page_len() as usize;
        for (p, page) in self.pages.iter_mut().enumerate() {
            page.get_quantum_state(&mut out[p * page_len..(p + 1) * page_len])?;
        }
        Ok(())
    }

    fn get_probs(&mut self, out: &mut [f64]) -> Result<()> {
        if out.len() as u64 != pow2(self.qubit_count) {
            return Err(SimError::invalid("output buffer length mismatch"));
        }
        let total = self.total_raw();
        if total <= FP_NORM_EPSILON {
            return Err(SimError::DegenerateState { norm: total });
        }
        let page_len = self.page_len() as usize;
        let mut state = vec![qforge_core::ZERO_CMPLX; page_len];
        for (p, page) in self.pages.iter_mut().enumerate() {
            page.get_quantum_state(&mut state)?;
            for (j, amp) in state.iter().enumerate() {
                out[p * page_len + j] = amp.norm_sqr() / total;
            }
        }
        Ok(())
    }

    fn get_amplitude(&mut self, perm: BasisIndex) -> Result<Complex64> {
        if perm >= pow2(self.qubit_count) {
            return Err(SimError::InvalidBasisState {
                index: perm,
                dimension: pow2(self.qubit_count),
            });
        }
        let total = self.total_raw();
        if total <= FP_NORM_EPSILON {
            return Err(SimError::DegenerateState { norm: total });
        }
        let page = (perm >> self.qubits_per_page) as usize;
        let local = perm & (self.page_len() - 1);
        let amp = self.pages[page].read_amplitude_raw(local);
        Ok(amp / total.sqrt())
    }

    fn mtrx(&mut self, m: &[Complex64; 4], target: usize) -> Result<()> {
        check_qubit(target, self.qubit_count)?;
        if qforge_core::is_norm_zero(m[1]) && qforge_core::is_norm_zero(m[2]) {
            return self.phase(m[0], m[3], target);
        }
        if qforge_core::is_norm_zero(m[0]) && qforge_core::is_norm_zero(m[3]) {
            return self.invert(m[1], m[2], target);
        }

        if self.is_intra(target) {
            for page in &mut self.pages {
                page.mtrx(m, target)?;
            }
            return Ok(());
        }

        self.meta_controlled(false, 0, target, &[], m)
    }

    fn phase(&mut self, top_left: Complex64, bottom_right: Complex64, target: usize) -> Result<()> {
        check_qubit(target, self.qubit_count)?;
        if self.is_intra(target) {
            for page in &mut self.pages {
                page.phase(top_left, bottom_right, target)?;
            }
            return Ok(());
        }

        let (mut tl, mut br) = (top_left, bottom_right);
        if self.config.global_phase_is_random {
            br /= tl;
            tl = ONE_CMPLX;
        }
        let t_bit = self.page_bit(target);
        for p in 0..self.page_count() {
            let factor = if p & t_bit == 0 { tl } else { br };
            if (factor - ONE_CMPLX).norm_sqr() > FP_NORM_EPSILON {
                self.pages[p].phase(factor, factor, 0)?;
            }
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
        if self.is_intra(target) {
            for page in &mut self.pages {
                page.invert(top_right, bottom_left, target)?;
            }
            return Ok(());
        }

        // Inter-page inversion is a pure page permutation plus phases.
        let (mut tr, mut bl) = (top_right, bottom_left);
        if self.config.global_phase_is_random {
            bl /= tr;
            tr = ONE_CMPLX;
        }
        let t_bit = self.page_bit(target);
        for p in 0..self.page_count() {
            if p & t_bit != 0 {
                continue;
            }
            let q = p | t_bit;
            self.pages.swap(p, q);
            if (tr - ONE_CMPLX).norm_sqr() > FP_NORM_EPSILON {
                self.pages[p].phase(tr, tr, 0)?;
            }
            if (bl - ONE_CMPLX).norm_sqr() > FP_NORM_EPSILON {
                self.pages[q].phase(bl, bl, 0)?;
            }
        }
        Ok(())
    }

    fn mc_mtrx(&mut self, controls: &[usize], m: &[Complex64; 4], target: usize) -> Result<()> {
        if controls.is_empty() {
            return self.mtrx(m, target);
        }
        self.controlled_dispatch(controls, m, target, false)
    }

    fn mac_mtrx(&mut self, controls: &[usize], m: &[Complex64; 4], target: usize) -> Result<()> {
        if controls.is_empty() {
            return self.mtrx(m, target);
        }
        self.controlled_dispatch(controls, m, target, true)
    }

    fn mc_phase(
        &mut self,
        controls: &[usize],
        top_left: Complex64,
        bottom_right: Complex64,
        target: usize,
    ) -> Result<()> {
        if controls.is_empty() {
            return self.phase(top_left, bottom_right, target);
        }
        let m = [
            top_left,
            qforge_core::ZERO_CMPLX,
            qforge_core::ZERO_CMPLX,
            bottom_right,
        ];
        self.controlled_dispatch(controls, &m, target, false)
    }

    fn mac_phase(
        &mut self,
        controls: &[usize],
        top_left: Complex64,
        bottom_right: Complex64,
        target: usize,
    ) -> Result<()> {
        if controls.is_empty() {
            return self.phase(top_left, bottom_right, target);
        }
        let m = [
            top_left,
            qforge_core::ZERO_CMPLX,
            qforge_core::ZERO_CMPLX,
            bottom_right,
        ];
        self.controlled_dispatch(controls, &m, target, true)
    }

    fn mc_invert(
        &mut self,
        controls: &[usize],
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()> {
        if controls.is_empty() {
            return self.invert(top_right, bottom_left, target);
        }
        let m = [
            qforge_core::ZERO_CMPLX,
            top_right,
            bottom_left,
            qforge_core::ZERO_CMPLX,
        ];
        self.controlled_dispatch(controls, &m, target, false)
    }

    fn mac_invert(
        &mut self,
        controls: &[usize],
        top_right: Complex64,
        bottom_left: Complex64,
        target: usize,
    ) -> Result<()> {
        if controls.is_empty() {
            return self.invert(top_right, bottom_left, target);
        }
        let m = [
            qforge_core::ZERO_CMPLX,
            top_right,
            bottom_left,
            qforge_core::ZERO_CMPLX,
        ];
        self.controlled_dispatch(controls, &m, target, true)
    }

    fn uniformly_controlled_single_bit(
        &mut self,
        controls: &[usize],
        target: usize,
        mtrxs: &[[Complex64; 4]],
    ) -> Result<()> {
        check_qubit(target, self.qubit_count)?;
        let controls = controls.to_vec();
        let mtrxs = mtrxs.to_vec();
        self.with_combined(move |engine| {
            engine.uniformly_controlled_single_bit(&controls, target, &mtrxs)
        })
    }

    fn uniform_parity_rz(&mut self, mask: BasisIndex, angle: f64) -> Result<()> {
        if mask >= pow2(self.qubit_count) {
            return Err(SimError::InvalidBasisState {
                index: mask,
                dimension: pow2(self.qubit_count),
            });
        }
        let shift = self.qubits_per_page;
        let low_mask = mask & (self.page_len() - 1);
        for (p, page) in self.pages.iter_mut().enumerate() {
            let page_parity_odd = ((p as u64) & (mask >> shift)).count_ones() & 1 == 1;
            let page_angle = if page_parity_odd { -angle } else { angle };
            page.uniform_parity_rz(low_mask, page_angle)?;
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
        let controls = controls.to_vec();
        self.with_combined(move |engine| engine.c_uniform_parity_rz(&controls, mask, angle))
    }

    fn swap(&mut self, qubit1: usize, qubit2: usize) -> Result<()> {
        check_qubit(qubit1, self.qubit_count)?;
        check_qubit(qubit2, self.qubit_count)?;
        if qubit1 == qubit2 {
            return Ok(());
        }
        if self.is_intra(qubit1) && self.is_intra(qubit2) {
            for page in &mut self.pages {
                page.swap(qubit1, qubit2)?;
            }
            return Ok(());
        }
        if !self.is_intra(qubit1) && !self.is_intra(qubit2) {
            // Pure page-index permutation.
            let b1 = self.page_bit(qubit1);
            let b2 = self.page_bit(qubit2);
            for p in 0..self.page_count() {
                if p & b1 != 0 && p & b2 == 0 {
                    self.pages.swap(p, (p & !b1) | b2);
                }
            }
            return Ok(());
        }
        self.with_combined(move |engine| engine.swap(qubit1, qubit2))
    }

    fn rol(&mut self, shift: usize, start: usize, length: usize) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        self.with_combined(move |engine| engine.rol(shift, start, length))
    }

    fn inc(&mut self, to_add: BasisIndex, start: usize, length: usize) -> Result<()> {
        check_range(start, length, self.qubit_count)?;
        self.with_combined(move |engine| engine.inc(to_add, start, length))
    }

    fn c_inc(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()> {
        let controls = controls.to_vec();
        self.with_combined(move |engine| engine.c_inc(to_add, start, length, &controls))
    }

    fn inc_c(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        carry: usize,
    ) -> Result<()> {
        self.with_combined(move |engine| engine.inc_c(to_add, start, length, carry))
    }

    fn dec_c(
        &mut self,
        to_sub: BasisIndex,
        start: usize,
        length: usize,
        carry: usize,
    ) -> Result<()> {
        self.with_combined(move |engine| engine.dec_c(to_sub, start, length, carry))
    }

    fn inc_s(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        overflow: usize,
    ) -> Result<()> {
        self.with_combined(move |engine| engine.inc_s(to_add, start, length, overflow))
    }

    fn inc_sc(
        &mut self,
        to_add: BasisIndex,
        start: usize,
        length: usize,
        overflow: usize,
        carry: usize,
    ) -> Result<()> {
        self.with_combined(move |engine| engine.inc_sc(to_add, start, length, overflow, carry))
    }

    fn dec_sc(
        &mut self,
        to_sub: BasisIndex,
        start: usize,
        length: usize,
        overflow: usize,
        carry: usize,
    ) -> Result<()> {
        self.with_combined(move |engine| engine.dec_sc(to_sub, start, length, overflow, carry))
    }

    fn mul(
        &mut self,
        to_mul: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
    ) -> Result<()> {
        self.with_combined(move |engine| engine.mul(to_mul, in_out_start, carry_start, length))
    }

    fn div(
        &mut self,
        to_div: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
    ) -> Result<()> {
        self.with_combined(move |engine| engine.div(to_div, in_out_start, carry_start, length))
    }

    fn mul_mod_n_out(
        &mut self,
        to_mul: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
    ) -> Result<()> {
        self.with_combined(move |engine| {
            engine.mul_mod_n_out(to_mul, mod_n, in_start, out_start, length)
        })
    }

    fn imul_mod_n_out(
        &mut self,
        to_mul: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
    ) -> Result<()> {
        self.with_combined(move |engine| {
            engine.imul_mod_n_out(to_mul, mod_n, in_start, out_start, length)
        })
    }

    fn pow_mod_n_out(
        &mut self,
        base: BasisIndex,
        mod_n: BasisIndex,
        in_start: usize,
        out_start: usize,
        length: usize,
    ) -> Result<()> {
        self.with_combined(move |engine| {
            engine.pow_mod_n_out(base, mod_n, in_start, out_start, length)
        })
    }

    fn c_mul(
        &mut self,
        to_mul: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()> {
        let controls = controls.to_vec();
        self.with_combined(move |engine| {
            engine.c_mul(to_mul, in_out_start, carry_start, length, &controls)
        })
    }

    fn c_div(
        &mut self,
        to_div: BasisIndex,
        in_out_start: usize,
        carry_start: usize,
        length: usize,
        controls: &[usize],
    ) -> Result<()> {
        let controls = controls.to_vec();
        self.with_combined(move |engine| {
            engine.c_div(to_div, in_out_start, carry_start, length, &controls)
        })
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
        let controls = controls.to_vec();
        self.with_combined(move |engine| {
            engine.c_mul_mod_n_out(to_mul, mod_n, in_start, out_start, length, &controls)
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
        let controls = controls.to_vec();
        self.with_combined(move |engine| {
            engine.c_imul_mod_n_out(to_mul, mod_n, in_start, out_start, length, &controls)
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
        let controls = controls.to_vec();
        self.with_combined(move |engine| {
            engine.c_pow_mod_n_out(base, mod_n, in_start, out_start, length, &controls)
        })
    }

    fn full_add(
        &mut self,
        input1: usize,
        input2: usize,
        carry_in_sum_out: usize,
        carry_out: usize,
    ) -> Result<()> {
        self.with_combined(move |engine| {
            engine.full_add(input1, input2, carry_in_sum_out, carry_out)
        })
    }

    fn i_full_add(
        &mut self,
        input1: usize,
        input2: usize,
        carry_in_sum_out: usize,
        carry_out: usize,
    ) -> Result<()> {
        self.with_combined(move |engine| {
            engine.i_full_add(input1, input2, carry_in_sum_out, carry_out)
        })
    }

    fn indexed_lda(
        &mut self,
        index_start: usize,
        index_length: usize,
        value_start: usize,
        value_length: usize,
        values: &[u8],
    ) -> Result<BasisIndex> {
        self.with_combined(move |engine| {
            engine.indexed_lda(index_start, index_length, value_start, value_length, values)
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
        self.with_combined(move |engine| {
            engine.indexed_adc(
                index_start,
                index_length,
                value_start,
                value_length,
                carry_index,
                values,
            )
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
        self.with_combined(move |engine| {
            engine.indexed_sbc(
                index_start,
                index_length,
                value_start,
                value_length,
                carry_index,
                values,
            )
        })
    }

    fn hash(&mut self, start: usize, length: usize, values: &[u8]) -> Result<()> {
        self.with_combined(move |engine| engine.hash(start, length, values))
    }

    fn set_reg(&mut self, start: usize, length: usize, value: BasisIndex) -> Result<()> {
        self.with_combined(move |engine| engine.set_reg(start, length, value))
    }

    fn zero_phase_flip(&mut self, start: usize, length: usize) -> Result<()> {
        self.with_combined(move |engine| engine.zero_phase_flip(start, length))
    }

    fn phase_flip_if_less(
        &mut self,
        greater_perm: BasisIndex,
        start: usize,
        length: usize,
    ) -> Result<()> {
        self.with_combined(move |engine| engine.phase_flip_if_less(greater_perm, start, length))
    }

    fn c_phase_flip_if_less(
        &mut self,
        greater_perm: BasisIndex,
        start: usize,
        length: usize,
        flag_index: usize,
    ) -> Result<()> {
        self.with_combined(move |engine| {
            engine.c_phase_flip_if_less(greater_perm, start, length, flag_index)
        })
    }

    fn phase_flip(&mut self) -> Result<()> {
        if self.config.global_phase_is_random {
            return Ok(());
        }
        let neg = Complex64::new(-1.0, 0.0);
        for page in &mut self.pages {
            page.phase(neg, neg, 0)?;
        }
        Ok(())
    }

    fn prob(&mut self, qubit: usize) -> Result<f64> {
        check_qubit(qubit, self.qubit_count)?;
        if self.is_intra(qubit) {
            let power = pow2(qubit);
            return self.global_prob(move |i| i & power != 0);
        }
        let bit = self.page_bit(qubit);
        let mut raw = 0.0;
        let mut total = 0.0;
        for (p, page) in self.pages.iter_mut().enumerate() {
            let norm = page.prob_sum(|_| true);
            total += norm;
            if p & bit != 0 {
                raw += norm;
            }
        }
        if total <= FP_NORM_EPSILON {
            return Err(SimError::DegenerateState { norm: total });
        }
        Ok((raw / total).clamp(0.0, 1.0))
    }

    fn prob_all(&mut self, perm: BasisIndex) -> Result<f64> {
        if perm >= pow2(self.qubit_count) {
            return Err(SimError::InvalidBasisState {
                index: perm,
                dimension: pow2(self.qubit_count),
            });
        }
        Ok(self.get_amplitude(perm)?.norm_sqr())
    }

    fn prob_reg(&mut self, start: usize, length: usize, value: BasisIndex) -> Result<f64> {
        check_range(start, length, self.qubit_count)?;
        let mask = pow2(length) - 1;
        self.global_prob(move |i| (i >> start) & mask == value)
    }

    fn prob_mask(&mut self, mask: BasisIndex, value: BasisIndex) -> Result<f64> {
        if mask >= pow2(self.qubit_count) {
            return Err(SimError::InvalidBasisState {
                index: mask,
                dimension: pow2(self.qubit_count),
            });
        }
        self.global_prob(move |i| i & mask == value)
    }

    fn prob_parity(&mut self, mask: BasisIndex) -> Result<f64> {
        if mask == 0 {
            return Ok(0.0);
        }
        self.global_prob(move |i| (i & mask).count_ones() & 1 == 1)
    }

    fn force_m(&mut self, qubit: usize, result: bool, do_force: bool) -> Result<bool> {
        check_qubit(qubit, self.qubit_count)?;
        let prob_one = self.prob(qubit)?;
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

        let survivors = if self.is_intra(qubit) {
            let power = pow2(qubit);
            let mut raw = 0.0;
            for page in self.pages.iter_mut() {
                raw += page.prob_sum(|j| (j & power != 0) == outcome);
            }
            raw
        } else {
            let bit = self.page_bit(qubit);
            let mut raw = 0.0;
            for (p, page) in self.pages.iter_mut().enumerate() {
                if (p & bit != 0) == outcome {
                    raw += page.prob_sum(|_| true);
                }
            }
            raw
        };
        if survivors <= FP_NORM_EPSILON {
            return Err(SimError::DegenerateState { norm: survivors });
        }
        let scale = Complex64::new(1.0 / survivors.sqrt(), 0.0);

        if self.is_intra(qubit) {
            let power = pow2(qubit);
            for page in self.pages.iter_mut() {
                page.collapse_scaled(move |j| (j & power != 0) == outcome, scale);
            }
        } else {
            let bit = self.page_bit(qubit);
            for (p, page) in self.pages.iter_mut().enumerate() {
                if (p & bit != 0) == outcome {
                    page.collapse_scaled(|_| true, scale);
                } else {
                    page.zero_amplitudes();
                }
            }
        }
        Ok(outcome)
    }

    fn force_m_parity(&mut self, mask: BasisIndex, result: bool, do_force: bool) -> Result<bool> {
        if mask == 0 || mask >= pow2(self.qubit_count) {
            return Err(SimError::invalid("parity mask out of range"));
        }
        let prob_odd = self.prob_parity(mask)?;
        let outcome = if do_force {
            let p = if result { prob_odd } else { 1.0 - prob_odd };
            if p <= FP_NORM_EPSILON {
                return Err(SimError::invalid(
                    "forced parity outcome has zero probability",
                ));
            }
            result
        } else {
            self.rng.gen::<f64>() < prob_odd
        };

        let shift = self.qubits_per_page;
        let mut survivors = 0.0;
        for (p, page) in self.pages.iter_mut().enumerate() {
            let offset = (p as u64) << shift;
            survivors +=
                page.prob_sum(|j| (((offset | j) & mask).count_ones() & 1 == 1) == outcome);
        }
        if survivors <= FP_NORM_EPSILON {
            return Err(SimError::DegenerateState { norm: survivors });
        }
        let scale = Complex64::new(1.0 / survivors.sqrt(), 0.0);
        for (p, page) in self.pages.iter_mut().enumerate() {
            let offset = (p as u64) << shift;
            page.collapse_scaled(
                move |j| (((offset | j) & mask).count_ones() & 1 == 1) == outcome,
                scale,
            );
        }
        Ok(outcome)
    }

    fn m_all(&mut self) -> Result<BasisIndex> {
        let mut result = 0u64;
        for q in 0..self.qubit_count {
            if self.force_m(q, false, false)? {
                result |= pow2(q);
            }
        }
        Ok(result)
    }

    fn compose(&mut self, other: Self) -> Result<usize> {
        let start = self.qubit_count;
        self.compose_at(other, start)
    }

    fn compose_at(&mut self, other: Self, start: usize) -> Result<usize> {
        let mut other = other;
        let mut engine = self.combine()?;
        let other_engine = other.combine()?;
        let result = engine.compose_at(other_engine, start);
        self.split_from(engine)?;
        result
    }

    fn decompose(&mut self, start: usize, length: usize) -> Result<Self> {
        let mut engine = self.combine()?;
        let result = engine.decompose(start, length);
        match result {
            Ok(dest_engine) => {
                self.split_from(engine)?;
                let mut dest_config = self.config.clone();
                dest_config.rng_seed = Some(self.rng.gen());
                QPager::from_engine(dest_engine, &dest_config)
            }
            Err(e) => {
                self.split_from(engine)?;
                Err(e)
            }
        }
    }

    fn dispose(&mut self, start: usize, length: usize) -> Result<()> {
        let mut engine = self.combine()?;
        let result = engine.dispose(start, length);
        self.split_from(engine)?;
        result
    }

    fn dispose_perm(&mut self, start: usize, length: usize, perm: BasisIndex) -> Result<()> {
        let mut engine = self.combine()?;
        let result = engine.dispose_perm(start, length, perm);
        self.split_from(engine)?;
        result
    }

    fn normalize_state(&mut self) -> Result<()> {
        let total = self.total_raw();
        if total <= FP_NORM_EPSILON {
            return Err(SimError::DegenerateState { norm: total });
        }
        if (total - 1.0).abs() <= f64::EPSILON {
            return Ok(());
        }
        let scale = Complex64::new(1.0 / total.sqrt(), 0.0);
        for page in &mut self.pages {
            page.collapse_scaled(|_| true, scale);
        }
        Ok(())
    }

    fn update_running_norm(&mut self) -> Result<f64> {
        Ok(self.total_raw())
    }

    fn sum_sqr_diff(&mut self, other: &mut Self) -> Result<f64> {
        let mut a = self.combined_clone()?;
        let mut b = other.combined_clone()?;
        a.sum_sqr_diff(&mut b)
    }
}

impl std::fmt::Debug for QPager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QPager")
            .field("qubit_count", &self.qubit_count)
            .field("qubits_per_page", &self.qubits_per_page)
            .field("page_count", &self.page_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use qforge_core::ZERO_CMPLX;

    const SQRT1_2: f64 = std::f64::consts::FRAC_1_SQRT_2;

    fn paged_config(page_qubits: usize) -> EngineConfig {
        EngineConfig::new().with_seed(42).with_paging(page_qubits)
    }

    fn h_mtrx() -> [Complex64; 4] {
        [
            Complex64::new(SQRT1_2, 0.0),
            Complex64::new(SQRT1_2, 0.0),
            Complex64::new(SQRT1_2, 0.0),
            Complex64::new(-SQRT1_2, 0.0),
        ]
    }

    fn state_of<B: QuantumBackend>(backend: &mut B) -> Vec<Complex64> {
        let mut out = vec![ZERO_CMPLX; backend.max_q_power() as usize];
        backend.get_quantum_state(&mut out).unwrap();
        out
    }

    fn assert_matches_engine(pager: &mut QPager, engine: &mut QEngineCpu) {
        let a = state_of(pager);
        let b = state_of(engine);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_relative_eq!((x - y).norm(), 0.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_pager_geometry() {
        let pager = QPager::new(4, 0, &paged_config(2)).unwrap();
        assert_eq!(pager.page_count(), 4);
        assert_eq!(pager.page_len(), 4);
    }

    #[test]
    fn test_intra_page_gate_matches_flat_engine() {
        let mut pager = QPager::new(3, 0, &paged_config(2)).unwrap();
        let mut engine = QEngineCpu::new(3, 0, &EngineConfig::new().with_seed(42)).unwrap();
        pager.mtrx(&h_mtrx(), 0).unwrap();
        engine.mtrx(&h_mtrx(), 0).unwrap();
        assert_matches_engine(&mut pager, &mut engine);
    }

    #[test]
    fn test_inter_page_gate_matches_flat_engine() {
        let mut pager = QPager::new(3, 0, &paged_config(1)).unwrap();
        let mut engine = QEngineCpu::new(3, 0, &EngineConfig::new().with_seed(42)).unwrap();
        // Qubits 1 and 2 are inter-page with 1-qubit pages.
        for q in [0usize, 1, 2] {
            pager.mtrx(&h_mtrx(), q).unwrap();
            engine.mtrx(&h_mtrx(), q).unwrap();
        }
        assert_matches_engine(&mut pager, &mut engine);
    }

    #[test]
    fn test_inter_page_invert_swaps_pages() {
        let mut pager = QPager::new(2, 0, &paged_config(1)).unwrap();
        pager.invert(ONE_CMPLX, ONE_CMPLX, 1).unwrap();
        assert_relative_eq!(pager.prob_all(0b10).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_meta_controlled_bell_pair() {
        // Control is inter-page, target intra-page.
        let mut pager = QPager::new(2, 0, &paged_config(1)).unwrap();
        pager.mtrx(&h_mtrx(), 1).unwrap();
        pager.mc_invert(&[1], ONE_CMPLX, ONE_CMPLX, 0).unwrap();
        assert_relative_eq!(pager.prob_all(0b00).unwrap(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(pager.prob_all(0b11).unwrap(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(pager.prob_all(0b01).unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_meta_target_controlled_gate() {
        // Control intra-page, target inter-page.
        let mut pager = QPager::new(3, 0, &paged_config(1)).unwrap();
        let mut engine = QEngineCpu::new(3, 0, &EngineConfig::new().with_seed(42)).unwrap();
        pager.mtrx(&h_mtrx(), 0).unwrap();
        engine.mtrx(&h_mtrx(), 0).unwrap();
        pager.mc_mtrx(&[0], &h_mtrx(), 2).unwrap();
        engine.mc_mtrx(&[0], &h_mtrx(), 2).unwrap();
        assert_matches_engine(&mut pager, &mut engine);
    }

    #[test]
    fn test_measurement_collapse() {
        let mut pager = QPager::new(2, 0, &paged_config(1)).unwrap();
        pager.mtrx(&h_mtrx(), 1).unwrap();
        pager.mc_invert(&[1], ONE_CMPLX, ONE_CMPLX, 0).unwrap();
        let outcome = pager.m(1).unwrap();
        assert_relative_eq!(
            pager.prob(0).unwrap(),
            if outcome { 1.0 } else { 0.0 },
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_arithmetic_through_combine() {
        let mut pager = QPager::new(4, 5, &paged_config(2)).unwrap();
        pager.inc(3, 0, 4).unwrap();
        assert_relative_eq!(pager.prob_all(8).unwrap(), 1.0, epsilon = 1e-12);
        assert_eq!(pager.page_count(), 4);
    }

    #[test]
    fn test_compose_and_decompose() {
        let cfg = paged_config(1);
        let mut a = QPager::new(2, 0b01, &cfg).unwrap();
        let b = QPager::new(1, 1, &cfg).unwrap();
        a.compose(b).unwrap();
        assert_eq!(a.qubit_count(), 3);
        assert_relative_eq!(a.prob_all(0b101).unwrap(), 1.0, epsilon = 1e-12);

        let mut dest = a.decompose(2, 1).unwrap();
        assert_eq!(a.qubit_count(), 2);
        assert_eq!(dest.qubit_count(), 1);
        assert_relative_eq!(dest.prob(0).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_swap_inter_page() {
        let mut pager = QPager::new(3, 0b001, &paged_config(1)).unwrap();
        pager.swap(0, 2).unwrap();
        assert_relative_eq!(pager.prob_all(0b100).unwrap(), 1.0, epsilon = 1e-12);
        // Swap two meta qubits.
        let mut pager = QPager::new(3, 0b010, &paged_config(1)).unwrap();
        pager.swap(1, 2).unwrap();
        assert_relative_eq!(pager.prob_all(0b100).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_uniform_parity_rz_spanning_pages() {
        let mut pager = QPager::new(3, 0, &paged_config(1)).unwrap();
        let mut engine = QEngineCpu::new(3, 0, &EngineConfig::new().with_seed(42)).unwrap();
        for q in 0..3 {
            pager.mtrx(&h_mtrx(), q).unwrap();
            engine.mtrx(&h_mtrx(), q).unwrap();
        }
        pager.uniform_parity_rz(0b101, 0.3).unwrap();
        engine.uniform_parity_rz(0b101, 0.3).unwrap();
        assert_matches_engine(&mut pager, &mut engine);
    }
}
