//! CHP stabilizer tableau engine
//!
//! Tracks 2n+1 generator rows over n qubits: n destabilizers, n
//! stabilizers, and one scratch row used by deterministic measurement
//! and by amplitude materialization. Each row holds an x-bit and a z-bit
//! per qubit plus a phase exponent r counting powers of i, so row i
//! represents i^r · X^x · Z^z. Clifford gates are column operations with
//! the standard phase bookkeeping; measurement follows the
//! Aaronson-Gottesman update.

use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use qforge_core::error::check_qubit;
use qforge_core::{pow2, BasisIndex, EngineConfig, Result, SimError, ZERO_CMPLX};

/// Stabilizer state over n qubits, reachable from |0…0⟩ by Clifford gates
#[derive(Clone)]
pub struct QStabilizer {
    qubit_count: usize,
    /// x-bit per (row, qubit); rows 0..n destabilizers, n..2n stabilizers,
    /// row 2n scratch
    x: Vec<Vec<bool>>,
    z: Vec<Vec<bool>>,
    /// Phase exponent per row, mod 4 (powers of i)
    r: Vec<u8>,
    phase_offset: f64,
    rand_global_phase: bool,
    rng: StdRng,
}

impl QStabilizer {
    pub fn new(qubit_count: usize, perm: BasisIndex, config: &EngineConfig) -> Result<Self> {
        if qubit_count == 0 {
            return Err(SimError::CapacityExceeded {
                reason: "stabilizer register needs at least one qubit".into(),
            });
        }
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let rows = 2 * qubit_count + 1;
        let mut tableau = Self {
            qubit_count,
            x: vec![vec![false; qubit_count]; rows],
            z: vec![vec![false; qubit_count]; rows],
            r: vec![0; rows],
            phase_offset: 0.0,
            rand_global_phase: config.global_phase_is_random,
            rng,
        };
        tableau.set_permutation(perm)?;
        Ok(tableau)
    }

    #[inline]
    pub fn qubit_count(&self) -> usize {
        self.qubit_count
    }

    #[inline]
    pub fn max_q_power(&self) -> BasisIndex {
        pow2(self.qubit_count)
    }

    #[inline]
    fn rows(&self) -> usize {
        2 * self.qubit_count
    }

    /// Reset to the basis state `perm`
    pub fn set_permutation(&mut self, perm: BasisIndex) -> Result<()> {
        if perm >= self.max_q_power() {
            return Err(SimError::InvalidBasisState {
                index: perm,
                dimension: self.max_q_power(),
            });
        }
        let n = self.qubit_count;
        for row in 0..=self.rows() {
            self.x[row].fill(false);
            self.z[row].fill(false);
            self.r[row] = 0;
            if row < n {
                self.x[row][row] = true;
            } else if row < 2 * n {
                self.z[row][row - n] = true;
            }
        }
        // -Z_j stabilizes |1⟩ on qubit j.
        for j in 0..n {
            if (perm >> j) & 1 == 1 {
                self.r[n + j] = 2;
            }
        }
        self.phase_offset = if self.rand_global_phase {
            self.rng.gen::<f64>() * 2.0 * std::f64::consts::PI
        } else {
            0.0
        };
        Ok(())
    }

    // --- row primitives ---

    /// Phase exponent of the product row_k · row_i (Aaronson-Gottesman g-sum)
    fn clifford(&self, i: usize, k: usize) -> u8 {
        let mut e: i32 = 0;
        for j in 0..self.qubit_count {
            let (xi, zi) = (self.x[i][j], self.z[i][j]);
            let (xk, zk) = (self.x[k][j], self.z[k][j]);
            if xk && !zk {
                // X times ...
                e += i32::from(xi && zi);
                e -= i32::from(!xi && zi);
            } else if xk && zk {
                // Y times ...
                e += i32::from(!xi && zi);
                e -= i32::from(xi && !zi);
            } else if !xk && zk {
                // Z times ...
                e += i32::from(xi && !zi);
                e -= i32::from(xi && zi);
            }
        }
        (e + i32::from(self.r[i]) + i32::from(self.r[k])).rem_euclid(4) as u8
    }

    fn rowcopy(&mut self, i: usize, k: usize) {
        if i == k {
            return;
        }
        let (xk, zk, rk) = (self.x[k].clone(), self.z[k].clone(), self.r[k]);
        self.x[i] = xk;
        self.z[i] = zk;
        self.r[i] = rk;
    }

    fn rowswap(&mut self, i: usize, k: usize) {
        if i == k {
            return;
        }
        self.x.swap(i, k);
        self.z.swap(i, k);
        self.r.swap(i, k);
    }

    /// Zero row `i` and set it to the generator of `basis_col`
    /// (an X generator below `qubit_count`, a Z generator above)
    fn rowset(&mut self, i: usize, basis_col: usize) {
        self.x[i].fill(false);
        self.z[i].fill(false);
        self.r[i] = 0;
        if basis_col < self.qubit_count {
            self.x[i][basis_col] = true;
        } else {
            self.z[i][basis_col - self.qubit_count] = true;
        }
    }

    /// row_i := row_k · row_i
    fn rowmult(&mut self, i: usize, k: usize) {
        self.r[i] = self.clifford(i, k);
        for j in 0..self.qubit_count {
            let xk = self.x[k][j];
            let zk = self.z[k][j];
            self.x[i][j] ^= xk;
            self.z[i][j] ^= zk;
        }
    }

    // --- Clifford gates ---

    pub fn h(&mut self, t: usize) {
        for i in 0..self.rows() {
            let xt = self.x[i][t];
            self.x[i][t] = self.z[i][t];
            self.z[i][t] = xt;
            if self.x[i][t] && self.z[i][t] {
                self.r[i] = (self.r[i] + 2) & 3;
            }
        }
    }

    pub fn s(&mut self, t: usize) {
        for i in 0..self.rows() {
            if self.x[i][t] && self.z[i][t] {
                self.r[i] = (self.r[i] + 2) & 3;
            }
            self.z[i][t] ^= self.x[i][t];
        }
    }

    /// Inverse S
    pub fn is(&mut self, t: usize) {
        for i in 0..self.rows() {
            self.z[i][t] ^= self.x[i][t];
            if self.x[i][t] && self.z[i][t] {
                self.r[i] = (self.r[i] + 2) & 3;
            }
        }
    }

    pub fn x(&mut self, t: usize) {
        for i in 0..self.rows() {
            if self.z[i][t] {
                self.r[i] = (self.r[i] + 2) & 3;
            }
        }
    }

    pub fn y(&mut self, t: usize) {
        for i in 0..self.rows() {
            if self.x[i][t] != self.z[i][t] {
                self.r[i] = (self.r[i] + 2) & 3;
            }
        }
    }

    pub fn z(&mut self, t: usize) {
        for i in 0..self.rows() {
            if self.x[i][t] {
                self.r[i] = (self.r[i] + 2) & 3;
            }
        }
    }

    pub fn sqrt_x(&mut self, t: usize) {
        self.h(t);
        self.s(t);
        self.h(t);
    }

    pub fn isqrt_x(&mut self, t: usize) {
        self.h(t);
        self.is(t);
        self.h(t);
    }

    pub fn sqrt_y(&mut self, t: usize) {
        self.z(t);
        self.h(t);
    }

    pub fn isqrt_y(&mut self, t: usize) {
        self.h(t);
        self.z(t);
    }

    pub fn cnot(&mut self, c: usize, t: usize) {
        for i in 0..self.rows() {
            if self.x[i][c] && self.z[i][t] && (self.x[i][t] == self.z[i][c]) {
                self.r[i] = (self.r[i] + 2) & 3;
            }
            self.x[i][t] ^= self.x[i][c];
            self.z[i][c] ^= self.z[i][t];
        }
    }

    pub fn cz(&mut self, c: usize, t: usize) {
        self.h(t);
        self.cnot(c, t);
        self.h(t);
    }

    pub fn cy(&mut self, c: usize, t: usize) {
        self.is(t);
        self.cnot(c, t);
        self.s(t);
    }

    pub fn anti_cnot(&mut self, c: usize, t: usize) {
        self.x(c);
        self.cnot(c, t);
        self.x(c);
    }

    pub fn anti_cz(&mut self, c: usize, t: usize) {
        self.x(c);
        self.cz(c, t);
        self.x(c);
    }

    pub fn anti_cy(&mut self, c: usize, t: usize) {
        self.x(c);
        self.cy(c, t);
        self.x(c);
    }

    pub fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.cnot(a, b);
        self.cnot(b, a);
        self.cnot(a, b);
    }

    pub fn iswap(&mut self, a: usize, b: usize) {
        self.swap(a, b);
        self.cz(a, b);
        self.s(a);
        self.s(b);
    }

    pub fn iiswap(&mut self, a: usize, b: usize) {
        self.is(a);
        self.is(b);
        self.cz(a, b);
        self.swap(a, b);
    }

    // --- measurement ---

    /// Z-basis measurement with the Aaronson-Gottesman tableau update.
    ///
    /// Deterministic when the qubit commutes with every stabilizer;
    /// forcing an outcome that contradicts a deterministic value fails.
    pub fn force_m(&mut self, t: usize, result: bool, do_force: bool) -> Result<bool> {
        check_qubit(t, self.qubit_count)?;
        let n = self.qubit_count;

        if let Some(p) = (n..2 * n).find(|&i| self.x[i][t]) {
            let outcome = if do_force {
                result
            } else {
                self.rng.gen_bool(0.5)
            };
            for i in 0..2 * n {
                if i != p && self.x[i][t] {
                    self.rowmult(i, p);
                }
            }
            self.rowcopy(p - n, p);
            self.rowset(p, t + n);
            self.r[p] = if outcome { 2 } else { 0 };
            return Ok(outcome);
        }

        // Deterministic: accumulate the stabilizer partners of every
        // destabilizer that anticommutes with Z_t into the scratch row.
        let scratch = 2 * n;
        self.x[scratch].fill(false);
        self.z[scratch].fill(false);
        self.r[scratch] = 0;
        for i in 0..n {
            if self.x[i][t] {
                self.rowmult(scratch, i + n);
            }
        }
        let outcome = self.r[scratch] == 2;
        if do_force && result != outcome {
            return Err(SimError::invalid(
                "forced measurement outcome has zero probability",
            ));
        }
        Ok(outcome)
    }

    pub fn m(&mut self, t: usize) -> Result<bool> {
        self.force_m(t, false, false)
    }

    pub fn m_all(&mut self) -> Result<BasisIndex> {
        let mut result = 0u64;
        for q in 0..self.qubit_count {
            if self.m(q)? {
                result |= pow2(q);
            }
        }
        Ok(result)
    }

    /// Probability of |1⟩: exactly 0, 1/2, or 1 for a stabilizer state
    pub fn prob(&mut self, t: usize) -> Result<f64> {
        check_qubit(t, self.qubit_count)?;
        let n = self.qubit_count;
        if (n..2 * n).any(|i| self.x[i][t]) {
            return Ok(0.5);
        }
        let deterministic = self.force_m(t, false, false)?;
        Ok(if deterministic { 1.0 } else { 0.0 })
    }

    // --- separability probes ---

    /// True iff the stabilizer group fixes the qubit to a Z eigenstate
    pub fn is_separable_z(&self, t: usize) -> bool {
        let n = self.qubit_count;
        !(n..2 * n).any(|i| self.x[i][t])
    }

    /// True iff the qubit is fixed to an X eigenstate
    pub fn is_separable_x(&mut self, t: usize) -> bool {
        self.h(t);
        let result = self.is_separable_z(t);
        self.h(t);
        result
    }

    /// True iff the qubit is fixed to a Y eigenstate
    pub fn is_separable_y(&mut self, t: usize) -> bool {
        self.is(t);
        self.h(t);
        let result = self.is_separable_z(t);
        self.h(t);
        self.s(t);
        result
    }

    /// Bitmask probe: bit 0 set when some stabilizer has X support at the
    /// qubit, bit 1 when some has Z support
    pub fn is_separable(&self, t: usize) -> u8 {
        let n = self.qubit_count;
        let mut probe = 0u8;
        for i in n..2 * n {
            if self.x[i][t] {
                probe |= 1;
            }
            if self.z[i][t] {
                probe |= 2;
            }
        }
        probe
    }

    // --- canonicalization and materialization ---

    /// Gaussian elimination into canonical row-echelon form; returns the
    /// number of X-bearing stabilizer generators (log2 of the support size)
    fn gaussian(&mut self) -> usize {
        let n = self.qubit_count;
        let max = 2 * n;
        let mut i = n;

        for j in 0..n {
            if let Some(k) = (i..max).find(|&k| self.x[k][j]) {
                self.rowswap(i, k);
                self.rowswap(i - n, k - n);
                for k2 in (i + 1)..max {
                    if self.x[k2][j] {
                        self.rowmult(k2, i);
                        self.rowmult(i - n, k2 - n);
                    }
                }
                i += 1;
            }
        }
        let g = i - n;

        for j in 0..n {
            if let Some(k) = (i..max).find(|&k| self.z[k][j]) {
                self.rowswap(i, k);
                self.rowswap(i - n, k - n);
                for k2 in (i + 1)..max {
                    if self.z[k2][j] {
                        self.rowmult(k2, i);
                        self.rowmult(i - n, k2 - n);
                    }
                }
                i += 1;
            }
        }
        g
    }

    /// Write one nonzero basis state of the support into the scratch row
    fn seed(&mut self, g: usize) {
        let n = self.qubit_count;
        let scratch = 2 * n;
        self.x[scratch].fill(false);
        self.z[scratch].fill(false);
        self.r[scratch] = 0;

        for i in (n + g..2 * n).rev() {
            let mut f = u32::from(self.r[i]);
            let mut min_col = 0;
            for j in (0..n).rev() {
                if self.z[i][j] {
                    min_col = j;
                    if self.x[scratch][j] {
                        f = (f + 2) & 3;
                    }
                }
            }
            if f == 2 {
                self.x[scratch][min_col] = !self.x[scratch][min_col];
            }
        }
    }

    /// Basis state and amplitude currently encoded in the scratch row
    ///
    /// The row is i^r · X^x · Z^z; each Y column (x and z both set)
    /// contributes another factor of i, per the CHP convention.
    fn basis_amp(&self, nrm: f64) -> (BasisIndex, Complex64) {
        let scratch = 2 * self.qubit_count;
        let mut e = u32::from(self.r[scratch]);
        let mut perm = 0u64;
        for j in 0..self.qubit_count {
            if self.x[scratch][j] {
                perm |= pow2(j);
                if self.z[scratch][j] {
                    e += 1;
                }
            }
        }
        let mut amp = Complex64::new(nrm, 0.0);
        match e & 3 {
            1 => amp *= Complex64::new(0.0, 1.0),
            2 => amp = -amp,
            3 => amp *= Complex64::new(0.0, -1.0),
            _ => {}
        }
        amp *= Complex64::from_polar(1.0, self.phase_offset);
        (perm, amp)
    }

    /// Walk the 2^g-element support by Gray code, emitting each basis amp
    fn enumerate_support<F>(&mut self, mut emit: F)
    where
        F: FnMut(BasisIndex, Complex64),
    {
        let n = self.qubit_count;
        let scratch = 2 * n;
        let g = self.gaussian();
        let nrm = 0.5f64.powi(g as i32).sqrt();
        self.seed(g);

        let (perm, amp) = self.basis_amp(nrm);
        emit(perm, amp);
        for t in 0..(pow2(g) - 1) {
            let t2 = t ^ (t + 1);
            for b in 0..g {
                if t2 & pow2(b) != 0 {
                    self.rowmult(scratch, n + b);
                }
            }
            let (perm, amp) = self.basis_amp(nrm);
            emit(perm, amp);
        }
    }

    /// Materialize the exact amplitudes in the CHP phase convention
    pub fn get_quantum_state(&mut self, out: &mut [Complex64]) -> Result<()> {
        if out.len() as u64 != self.max_q_power() {
            return Err(SimError::invalid("output buffer length mismatch"));
        }
        out.fill(ZERO_CMPLX);
        self.enumerate_support(|perm, amp| out[perm as usize] = amp);
        Ok(())
    }

    pub fn get_probs(&mut self, out: &mut [f64]) -> Result<()> {
        if out.len() as u64 != self.max_q_power() {
            return Err(SimError::invalid("output buffer length mismatch"));
        }
        out.fill(0.0);
        self.enumerate_support(|perm, amp| out[perm as usize] = amp.norm_sqr());
        Ok(())
    }

    pub fn get_amplitude(&mut self, perm: BasisIndex) -> Result<Complex64> {
        if perm >= self.max_q_power() {
            return Err(SimError::InvalidBasisState {
                index: perm,
                dimension: self.max_q_power(),
            });
        }
        let mut found = ZERO_CMPLX;
        self.enumerate_support(|p, amp| {
            if p == perm {
                found = amp;
            }
        });
        Ok(found)
    }

    /// Fold a global phase into the materialization convention
    pub fn apply_global_phase(&mut self, angle: f64) {
        self.phase_offset += angle;
    }

    /// Any one nonzero (permutation, amplitude) entry
    pub fn any_amplitude(&mut self) -> (BasisIndex, Complex64) {
        let g = self.gaussian();
        let nrm = 0.5f64.powi(g as i32).sqrt();
        self.seed(g);
        self.basis_amp(nrm)
    }

    // --- composition ---

    /// Tensor-insert `other` at qubit `start`; returns `start`
    pub fn compose_at(&mut self, other: &QStabilizer, start: usize) -> Result<usize> {
        if start > self.qubit_count {
            return Err(SimError::invalid("compose start past end of register"));
        }
        let n_a = self.qubit_count;
        let n_b = other.qubit_count;
        let n = n_a + n_b;

        let expand_a = |row: &Vec<bool>| -> Vec<bool> {
            let mut out = vec![false; n];
            for (j, &bit) in row.iter().enumerate() {
                let col = if j < start { j } else { j + n_b };
                out[col] = bit;
            }
            out
        };
        let expand_b = |row: &Vec<bool>| -> Vec<bool> {
            let mut out = vec![false; n];
            for (j, &bit) in row.iter().enumerate() {
                out[start + j] = bit;
            }
            out
        };

        let rows = 2 * n + 1;
        let mut x = Vec::with_capacity(rows);
        let mut z = Vec::with_capacity(rows);
        let mut r = Vec::with_capacity(rows);

        for (source, expand) in [
            (0..n_a, true),
            (0..n_b, false),
            (n_a..2 * n_a, true),
            (n_b..2 * n_b, false),
        ] {
            for row in source {
                if expand {
                    x.push(expand_a(&self.x[row]));
                    z.push(expand_a(&self.z[row]));
                    r.push(self.r[row]);
                } else {
                    x.push(expand_b(&other.x[row]));
                    z.push(expand_b(&other.z[row]));
                    r.push(other.r[row]);
                }
            }
        }
        x.push(vec![false; n]);
        z.push(vec![false; n]);
        r.push(0);

        self.qubit_count = n;
        self.x = x;
        self.z = z;
        self.r = r;
        self.phase_offset += other.phase_offset;
        Ok(start)
    }

    pub fn compose(&mut self, other: &QStabilizer) -> Result<usize> {
        let start = self.qubit_count;
        self.compose_at(other, start)
    }

    /// True when no generator straddles the boundary of the range after
    /// canonicalization, so the range factorizes from the rest
    pub fn can_decompose(&self, start: usize, length: usize) -> bool {
        if length == self.qubit_count {
            return true;
        }
        let mut probe = self.clone();
        probe.gaussian();
        let n = probe.qubit_count;
        let in_range = |j: usize| j >= start && j < start + length;
        let mut inside_rows = 0usize;
        for i in n..2 * n {
            let mut inside = false;
            let mut outside = false;
            for j in 0..n {
                if probe.x[i][j] || probe.z[i][j] {
                    if in_range(j) {
                        inside = true;
                    } else {
                        outside = true;
                    }
                }
            }
            if inside && outside {
                return false;
            }
            if inside {
                inside_rows += 1;
            }
        }
        inside_rows == length
    }

    /// S_dst *= S_src with the paired destabilizer update that keeps
    /// every commutation invariant of the tableau intact
    fn stab_mult(&mut self, dst: usize, src: usize) {
        let n = self.qubit_count;
        self.rowmult(dst, src);
        self.rowmult(src - n, dst - n);
    }

    /// Dispose a single qubit fixed to a Z eigenstate; returns the
    /// eigenvalue bit it held
    pub fn dispose_z_qubit(&mut self, t: usize) -> Result<bool> {
        check_qubit(t, self.qubit_count)?;
        if !self.is_separable_z(t) {
            return Err(SimError::SeparabilityViolation {
                start: t,
                length: 1,
            });
        }
        let n = self.qubit_count;

        if n == 1 {
            let outcome = self.r[1] == 2;
            self.set_permutation(0)?;
            return Ok(outcome);
        }

        // Reduce to a single stabilizer generator carrying Z_t.
        let p = match (n..2 * n).find(|&i| self.z[i][t]) {
            Some(p) => p,
            None => {
                return Err(SimError::SeparabilityViolation {
                    start: t,
                    length: 1,
                })
            }
        };
        for i in n..2 * n {
            if i != p && self.z[i][t] {
                self.stab_mult(i, p);
            }
        }

        // Gauss-Jordan over the remaining stabilizers, columns other than
        // t, reducing row p along the way. A deterministic qubit means
        // ±Z_t is in the group, so row p must land on exactly that.
        let mut used = vec![false; 2 * n];
        for j in 0..n {
            if j == t {
                continue;
            }
            for x_pass in [true, false] {
                let coord = |s: &Self, i: usize| {
                    if x_pass {
                        s.x[i][j]
                    } else {
                        s.z[i][j]
                    }
                };
                let pivot = (n..2 * n).find(|&i| i != p && !used[i] && coord(self, i));
                if let Some(pivot) = pivot {
                    used[pivot] = true;
                    for i in n..2 * n {
                        if i != pivot && coord(self, i) {
                            self.stab_mult(i, pivot);
                        }
                    }
                }
            }
        }
        for j in 0..n {
            if j != t && (self.x[p][j] || self.z[p][j]) {
                return Err(SimError::SeparabilityViolation {
                    start: t,
                    length: 1,
                });
            }
        }

        let outcome = self.r[p] == 2;

        // Clean the destabilizers' Z_t support and give row p's partner a
        // pure X_t destabilizer.
        for i in 0..n {
            if i != p - n && self.z[i][t] {
                self.rowmult(i, p);
            }
        }
        self.rowset(p - n, t);

        // Drop column t and the generator pair (p - n, p).
        let drop_row_hi = p;
        let drop_row_lo = p - n;
        let mut x = Vec::with_capacity(2 * (n - 1) + 1);
        let mut z = Vec::with_capacity(2 * (n - 1) + 1);
        let mut r = Vec::with_capacity(2 * (n - 1) + 1);
        let strip = |row: &Vec<bool>| -> Vec<bool> {
            row.iter()
                .enumerate()
                .filter(|&(j, _)| j != t)
                .map(|(_, &b)| b)
                .collect()
        };
        for i in 0..2 * n {
            if i == drop_row_lo || i == drop_row_hi {
                continue;
            }
            x.push(strip(&self.x[i]));
            z.push(strip(&self.z[i]));
            r.push(self.r[i]);
        }
        x.push(vec![false; n - 1]);
        z.push(vec![false; n - 1]);
        r.push(0);

        self.qubit_count = n - 1;
        self.x = x;
        self.z = z;
        self.r = r;
        Ok(outcome)
    }

    /// Dispose a contiguous range of qubits, each individually fixed to a
    /// Z eigenstate
    pub fn dispose(&mut self, start: usize, length: usize) -> Result<()> {
        qforge_core::error::check_range(start, length, self.qubit_count)?;
        for _ in 0..length {
            self.dispose_z_qubit(start)?;
        }
        Ok(())
    }

    /// Σ|aᵢ - bᵢ|² against another tableau of the same width
    pub fn sum_sqr_diff(&mut self, other: &mut QStabilizer) -> Result<f64> {
        if self.qubit_count != other.qubit_count {
            return Err(SimError::invalid(
                "sum_sqr_diff requires equal-width tableaus",
            ));
        }
        let dim = self.max_q_power() as usize;
        let mut a = vec![ZERO_CMPLX; dim];
        let mut b = vec![ZERO_CMPLX; dim];
        self.get_quantum_state(&mut a)?;
        other.get_quantum_state(&mut b)?;
        Ok(a.iter().zip(b.iter()).map(|(x, y)| (x - y).norm_sqr()).sum())
    }
}

impl std::fmt::Debug for QStabilizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QStabilizer")
            .field("qubit_count", &self.qubit_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SQRT1_2: f64 = std::f64::consts::FRAC_1_SQRT_2;

    fn cfg() -> EngineConfig {
        EngineConfig::new().with_seed(42)
    }

    fn state_of(tableau: &mut QStabilizer) -> Vec<Complex64> {
        let mut out = vec![ZERO_CMPLX; tableau.max_q_power() as usize];
        tableau.get_quantum_state(&mut out).unwrap();
        out
    }

    #[test]
    fn test_initial_permutation() {
        let mut tableau = QStabilizer::new(3, 0b101, &cfg()).unwrap();
        let amps = state_of(&mut tableau);
        assert_relative_eq!(amps[0b101].norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(tableau.prob(0).unwrap(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(tableau.prob(1).unwrap(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(tableau.prob(2).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_hadamard_superposition() {
        let mut tableau = QStabilizer::new(1, 0, &cfg()).unwrap();
        tableau.h(0);
        assert_relative_eq!(tableau.prob(0).unwrap(), 0.5, epsilon = 1e-12);
        let amps = state_of(&mut tableau);
        assert_relative_eq!(amps[0].re, SQRT1_2, epsilon = 1e-12);
        assert_relative_eq!(amps[1].re, SQRT1_2, epsilon = 1e-12);

        tableau.h(0);
        let amps = state_of(&mut tableau);
        assert_relative_eq!(amps[0].re, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_bell_pair() {
        let mut tableau = QStabilizer::new(2, 0, &cfg()).unwrap();
        tableau.h(0);
        tableau.cnot(0, 1);
        let amps = state_of(&mut tableau);
        assert_relative_eq!(amps[0].re, SQRT1_2, epsilon = 1e-12);
        assert_relative_eq!(amps[3].re, SQRT1_2, epsilon = 1e-12);
        assert_relative_eq!(amps[1].norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(amps[2].norm(), 0.0, epsilon = 1e-12);

        let outcome = tableau.m(0).unwrap();
        assert_relative_eq!(
            tableau.prob(1).unwrap(),
            if outcome { 1.0 } else { 0.0 },
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_ghz_state() {
        let mut tableau = QStabilizer::new(3, 0, &cfg()).unwrap();
        tableau.h(0);
        tableau.cnot(0, 1);
        tableau.cnot(1, 2);
        let amps = state_of(&mut tableau);
        assert_relative_eq!(amps[0].re, SQRT1_2, epsilon = 1e-12);
        assert_relative_eq!(amps[7].re, SQRT1_2, epsilon = 1e-12);
        for i in 1..7 {
            assert_relative_eq!(amps[i].norm(), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_s_gate_phase() {
        let mut tableau = QStabilizer::new(1, 0, &cfg()).unwrap();
        tableau.h(0);
        tableau.s(0);
        let amps = state_of(&mut tableau);
        // (|0> + i|1>)/sqrt(2)
        assert_relative_eq!(amps[0].re, SQRT1_2, epsilon = 1e-12);
        assert_relative_eq!(amps[1].im, SQRT1_2, epsilon = 1e-12);

        tableau.is(0);
        tableau.h(0);
        let amps = state_of(&mut tableau);
        assert_relative_eq!(amps[0].re, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_cz_symmetry() {
        let mut tableau = QStabilizer::new(2, 0, &cfg()).unwrap();
        tableau.h(0);
        tableau.h(1);
        tableau.cz(0, 1);
        let amps = state_of(&mut tableau);
        assert_relative_eq!(amps[0].re, 0.5, epsilon = 1e-12);
        assert_relative_eq!(amps[1].re, 0.5, epsilon = 1e-12);
        assert_relative_eq!(amps[2].re, 0.5, epsilon = 1e-12);
        assert_relative_eq!(amps[3].re, -0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_deterministic_measurement() {
        let mut tableau = QStabilizer::new(2, 0b10, &cfg()).unwrap();
        assert!(!tableau.m(0).unwrap());
        assert!(tableau.m(1).unwrap());
        // Forcing against a deterministic value fails.
        assert!(tableau.force_m(1, false, true).is_err());
    }

    #[test]
    fn test_separability_probes() {
        let mut tableau = QStabilizer::new(2, 0, &cfg()).unwrap();
        assert!(tableau.is_separable_z(0));
        assert!(!tableau.is_separable_x(0));

        tableau.h(0);
        assert!(!tableau.is_separable_z(0));
        assert!(tableau.is_separable_x(0));

        tableau.s(0);
        assert!(tableau.is_separable_y(0));
        assert!(!tableau.is_separable_z(0));
        assert!(!tableau.is_separable_x(0));

        // Entangle: no single-qubit basis fixes either qubit.
        let mut tableau = QStabilizer::new(2, 0, &cfg()).unwrap();
        tableau.h(0);
        tableau.cnot(0, 1);
        assert!(!tableau.is_separable_z(0));
        assert!(!tableau.is_separable_x(0));
        assert!(!tableau.is_separable_y(0));
    }

    #[test]
    fn test_probe_restores_state() {
        let mut tableau = QStabilizer::new(2, 0, &cfg()).unwrap();
        tableau.h(0);
        tableau.s(0);
        let before = state_of(&mut tableau);
        let _ = tableau.is_separable_x(0);
        let _ = tableau.is_separable_y(0);
        let after = state_of(&mut tableau);
        for (b, a) in before.iter().zip(after.iter()) {
            assert_relative_eq!((b - a).norm(), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_compose() {
        let mut a = QStabilizer::new(1, 1, &cfg()).unwrap();
        let mut b = QStabilizer::new(2, 0, &cfg()).unwrap();
        b.h(0);
        b.cnot(0, 1);
        let start = a.compose(&b).unwrap();
        assert_eq!(start, 1);
        assert_eq!(a.qubit_count(), 3);
        let amps = state_of(&mut a);
        // |1> tensor Bell = (|001> + |111>)/sqrt(2)
        assert_relative_eq!(amps[0b001].re, SQRT1_2, epsilon = 1e-12);
        assert_relative_eq!(amps[0b111].re, SQRT1_2, epsilon = 1e-12);
    }

    #[test]
    fn test_can_decompose() {
        let mut tableau = QStabilizer::new(3, 0, &cfg()).unwrap();
        tableau.h(0);
        tableau.cnot(0, 1);
        assert!(!tableau.can_decompose(0, 1));
        assert!(!tableau.can_decompose(1, 1));
        assert!(tableau.can_decompose(2, 1));
        assert!(tableau.can_decompose(0, 2));
    }

    #[test]
    fn test_dispose_z_qubit() {
        let mut tableau = QStabilizer::new(3, 0b010, &cfg()).unwrap();
        tableau.h(2);
        let outcome = tableau.dispose_z_qubit(1).unwrap();
        assert!(outcome);
        assert_eq!(tableau.qubit_count(), 2);
        // Remaining state: |0> on old qubit 0, |+> on old qubit 2.
        assert_relative_eq!(tableau.prob(0).unwrap(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(tableau.prob(1).unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_dispose_entangled_fails() {
        let mut tableau = QStabilizer::new(2, 0, &cfg()).unwrap();
        tableau.h(0);
        tableau.cnot(0, 1);
        assert!(tableau.dispose_z_qubit(0).is_err());
    }

    #[test]
    fn test_measurement_collapse_entangles_consistently() {
        // After measuring half a Bell pair, both qubits are Z-separable.
        let mut tableau = QStabilizer::new(2, 0, &cfg()).unwrap();
        tableau.h(0);
        tableau.cnot(0, 1);
        let outcome = tableau.m(0).unwrap();
        assert!(tableau.is_separable_z(0));
        assert!(tableau.is_separable_z(1));
        let other = tableau.m(1).unwrap();
        assert_eq!(outcome, other);
    }

    #[test]
    fn test_sqrt_gates_square_to_paulis() {
        let mut a = QStabilizer::new(1, 0, &cfg()).unwrap();
        a.sqrt_x(0);
        a.sqrt_x(0);
        let mut b = QStabilizer::new(1, 0, &cfg()).unwrap();
        b.x(0);
        // Same measurement distribution as a plain X.
        assert_relative_eq!(a.prob(0).unwrap(), b.prob(0).unwrap(), epsilon = 1e-12);

        let mut c = QStabilizer::new(1, 0, &cfg()).unwrap();
        c.sqrt_y(0);
        c.sqrt_y(0);
        assert_relative_eq!(c.prob(0).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_swap() {
        let mut tableau = QStabilizer::new(2, 0b01, &cfg()).unwrap();
        tableau.swap(0, 1);
        assert_relative_eq!(tableau.prob(0).unwrap(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(tableau.prob(1).unwrap(), 1.0, epsilon = 1e-12);
    }
}
