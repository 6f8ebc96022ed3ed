//! Per-qubit shards and symbolic gate buffers
//!
//! A shard is the unit layer's bookkeeping record for one qubit: either
//! an isolated cached amplitude pair or a (engine, index) reference into
//! a shared sub-engine, plus the pending gate buffers. Cross-shard phase
//! buffers live symmetrically on both endpoints, keyed by shard arena
//! index, so tearing one down is a plain index sweep with no shared
//! ownership involved.
//!
//! Buffer layering, outermost first: pending basis flag (a deferred
//! Hadamard), then the single-qubit phase/invert buffer, then the
//! cross-shard buffers, then the underlying amplitudes. Incoming gates
//! commute inward through the layers or force a flush.

use std::collections::BTreeMap;

use num_complex::Complex64;
use qforge_core::{ONE_CMPLX, ZERO_CMPLX};

/// Angles fold into [-2π, 2π); the gate entries are half-angle polars,
/// so the buffer period is 4π.
const ANGLE_EPSILON: f64 = 1e-9;

pub type ShardId = usize;
pub type EngineId = usize;

/// Basis a shard's bookkeeping is expressed in
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PauliBasis {
    Z,
    X,
}

/// Cross-shard buffered controlled gate
///
/// Attached to a control shard c and a target shard t, meaning: apply
/// diag(e^{iθ0/2}, e^{iθ1/2}) to t whenever c reads |1⟩, postmultiplied
/// by X on t when `is_invert`. Present in the control's `controls_of`
/// and the target's `targets_of` maps simultaneously.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PhaseBuffer {
    pub angle0: f64,
    pub angle1: f64,
    pub is_invert: bool,
}

impl PhaseBuffer {
    /// Gate entry multiplying the target-|0⟩ branch
    #[inline]
    pub fn cmplx0(&self) -> Complex64 {
        Complex64::from_polar(1.0, self.angle0 / 2.0)
    }

    /// Gate entry multiplying the target-|1⟩ branch
    #[inline]
    pub fn cmplx1(&self) -> Complex64 {
        Complex64::from_polar(1.0, self.angle1 / 2.0)
    }

    pub fn is_identity(&self) -> bool {
        !self.is_invert && self.angle0.abs() < ANGLE_EPSILON && self.angle1.abs() < ANGLE_EPSILON
    }

    /// θ0 ≈ θ1: a global-phase-like diagonal or a σx-like invert
    pub fn angles_match(&self) -> bool {
        (self.cmplx0() - self.cmplx1()).norm_sqr() < ANGLE_EPSILON
    }

    pub fn fold(angle: f64) -> f64 {
        let mut a = angle;
        while a < -2.0 * std::f64::consts::PI {
            a += 4.0 * std::f64::consts::PI;
        }
        while a >= 2.0 * std::f64::consts::PI {
            a -= 4.0 * std::f64::consts::PI;
        }
        a
    }
}

/// Pending single-qubit phase or invert gate on one shard
///
/// diag(c0, c1) when not inverted; diag(c0, c1)·X when inverted (c0 is
/// then the top-right entry).
#[derive(Clone, Copy, Debug)]
pub struct SingleBuffer {
    pub c0: Complex64,
    pub c1: Complex64,
    pub is_invert: bool,
}

impl SingleBuffer {
    pub fn identity() -> Self {
        Self {
            c0: ONE_CMPLX,
            c1: ONE_CMPLX,
            is_invert: false,
        }
    }

    /// Compose a later phase gate diag(tl, br) on top
    pub fn compose_phase(&mut self, top_left: Complex64, bottom_right: Complex64) {
        self.c0 *= top_left;
        self.c1 *= bottom_right;
    }

    /// Compose a later invert gate [[0, tr], [bl, 0]] on top
    pub fn compose_invert(&mut self, top_right: Complex64, bottom_left: Complex64) {
        // X·diag(a,b) = diag(b,a)·X
        std::mem::swap(&mut self.c0, &mut self.c1);
        self.c0 *= top_right;
        self.c1 *= bottom_left;
        self.is_invert = !self.is_invert;
    }

    pub fn is_identity(&self) -> bool {
        !self.is_invert
            && (self.c0 - ONE_CMPLX).norm_sqr() < ANGLE_EPSILON
            && (self.c1 - ONE_CMPLX).norm_sqr() < ANGLE_EPSILON
    }

    /// The buffered gate as a dense 2×2 matrix
    pub fn matrix(&self) -> [Complex64; 4] {
        if self.is_invert {
            [ZERO_CMPLX, self.c0, self.c1, ZERO_CMPLX]
        } else {
            [self.c0, ZERO_CMPLX, ZERO_CMPLX, self.c1]
        }
    }
}

/// The unit layer's per-qubit record
#[derive(Clone, Debug)]
pub struct QubitShard {
    /// Owning sub-engine, when entangled
    pub unit: Option<EngineId>,
    /// Index within the owning engine
    pub mapped: usize,
    /// Cached amplitudes, meaningful while isolated
    pub amp0: Complex64,
    pub amp1: Complex64,
    pub basis: PauliBasis,
    pub is_prob_dirty: bool,
    pub is_phase_dirty: bool,
    pub buffer: Option<SingleBuffer>,
    /// Buffers where this shard is the control, keyed by target shard
    pub controls_of: BTreeMap<ShardId, PhaseBuffer>,
    /// Buffers where this shard is the target, keyed by control shard
    pub targets_of: BTreeMap<ShardId, PhaseBuffer>,
}

impl QubitShard {
    pub fn new(bit: bool) -> Self {
        Self {
            unit: None,
            mapped: 0,
            amp0: if bit { ZERO_CMPLX } else { ONE_CMPLX },
            amp1: if bit { ONE_CMPLX } else { ZERO_CMPLX },
            basis: PauliBasis::Z,
            is_prob_dirty: false,
            is_phase_dirty: false,
            buffer: None,
            controls_of: BTreeMap::new(),
            targets_of: BTreeMap::new(),
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.unit.is_none()
    }

    pub fn has_cross_buffers(&self) -> bool {
        !self.controls_of.is_empty() || !self.targets_of.is_empty()
    }
}

/// Ensure a (control → target) buffer exists on both endpoints
fn make_buffer(shards: &mut [QubitShard], control: ShardId, target: ShardId) {
    if !shards[target].targets_of.contains_key(&control) {
        shards[target]
            .targets_of
            .insert(control, PhaseBuffer::default());
        shards[control]
            .controls_of
            .insert(target, PhaseBuffer::default());
    }
}

/// Remove a (control → target) buffer from both endpoints
pub fn remove_buffer(shards: &mut [QubitShard], control: ShardId, target: ShardId) {
    shards[target].targets_of.remove(&control);
    shards[control].controls_of.remove(&target);
}

fn store_buffer(shards: &mut [QubitShard], control: ShardId, target: ShardId, buf: PhaseBuffer) {
    shards[target].targets_of.insert(control, buf);
    shards[control].controls_of.insert(target, buf);
}

/// Fuse additional phase angles into the (control → target) buffer,
/// exploiting symmetry and removing identity buffers
pub fn add_phase_angles(
    shards: &mut [QubitShard],
    control: ShardId,
    target: ShardId,
    angle0_diff: f64,
    angle1_diff: f64,
) {
    make_buffer(shards, control, target);
    let buf = shards[target].targets_of[&control];
    let mut n0 = buf.angle0 + angle0_diff;
    let mut n1 = buf.angle1 + angle1_diff;

    // A buffer whose angle0 vanishes is symmetric under exchange of
    // control and target, so an opposite-direction buffer of that form
    // can fold into this one, keeping the edge count down.
    if !buf.is_invert {
        if let Some(&opposite) = shards[control].targets_of.get(&target) {
            if !opposite.is_invert && opposite.angle0.abs() < ANGLE_EPSILON {
                n1 += opposite.angle1;
                remove_buffer(shards, target, control);
            }
        }
    }

    let n0 = PhaseBuffer::fold(n0);
    let n1 = PhaseBuffer::fold(n1);
    let fused = PhaseBuffer {
        angle0: n0,
        angle1: n1,
        is_invert: buf.is_invert,
    };

    if fused.is_identity() {
        remove_buffer(shards, control, target);
    } else {
        store_buffer(shards, control, target, fused);
    }
}

/// Fuse a controlled-invert on top of the (control → target) buffer
pub fn add_inversion_angles(
    shards: &mut [QubitShard],
    control: ShardId,
    target: ShardId,
    angle0_diff: f64,
    angle1_diff: f64,
) {
    make_buffer(shards, control, target);
    let mut buf = shards[target].targets_of[&control];
    // X on top of diag(a,b)[·X] swaps the entries and toggles the kind.
    std::mem::swap(&mut buf.angle0, &mut buf.angle1);
    buf.is_invert = !buf.is_invert;
    store_buffer(shards, control, target, buf);
    add_phase_angles(shards, control, target, angle0_diff, angle1_diff);
}

/// An X applied to `q` commutes inward by swapping the branch angles of
/// every buffer targeting `q` (the FlipPhaseAnti rule)
pub fn flip_phase_anti(shards: &mut [QubitShard], q: ShardId) {
    let controls: Vec<ShardId> = shards[q].targets_of.keys().copied().collect();
    for c in controls {
        let mut buf = shards[q].targets_of[&c];
        std::mem::swap(&mut buf.angle0, &mut buf.angle1);
        store_buffer(shards, c, q, buf);
    }
}

/// Whether a deferred Hadamard on `q` commutes with its cross-shard
/// buffers, transforming them in place when it does.
///
/// Only two target-side forms commute: a global-phase-like diagonal
/// (unchanged) and a σx-like invert (which becomes a σz-like diagonal).
/// Any buffer where `q` is a control blocks the commute.
pub fn try_h_commute(shards: &mut [QubitShard], q: ShardId) -> bool {
    if !shards[q].controls_of.is_empty() {
        return false;
    }
    let entries: Vec<(ShardId, PhaseBuffer)> =
        shards[q].targets_of.iter().map(|(&c, &b)| (c, b)).collect();
    for (_, buf) in &entries {
        if !buf.angles_match() {
            return false;
        }
    }
    for (c, buf) in entries {
        if buf.is_invert {
            // H·(c·X)·H = c·Z
            let transformed = PhaseBuffer {
                angle0: buf.angle0,
                angle1: PhaseBuffer::fold(buf.angle1 + 2.0 * std::f64::consts::PI),
                is_invert: false,
            };
            store_buffer(shards, c, q, transformed);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn arena(n: usize) -> Vec<QubitShard> {
        (0..n).map(|_| QubitShard::new(false)).collect()
    }

    #[test]
    fn test_phase_buffer_fuses_componentwise() {
        let mut shards = arena(2);
        add_phase_angles(&mut shards, 0, 1, 0.0, PI);
        add_phase_angles(&mut shards, 0, 1, 0.0, PI / 2.0);
        let buf = shards[1].targets_of[&0];
        assert_relative_eq!(buf.angle0, 0.0, epsilon = 1e-12);
        assert_relative_eq!(buf.angle1, 1.5 * PI, epsilon = 1e-12);
        assert_eq!(shards[0].controls_of[&1], buf);
    }

    #[test]
    fn test_cz_twice_cancels() {
        // CZ carries doubled angles (0, 2π); applying it twice folds to
        // the identity and the buffer disappears.
        let mut shards = arena(2);
        add_phase_angles(&mut shards, 0, 1, 0.0, 2.0 * PI);
        assert!(shards[1].targets_of.contains_key(&0));
        add_phase_angles(&mut shards, 0, 1, 0.0, 2.0 * PI);
        assert!(shards[1].targets_of.is_empty());
        assert!(shards[0].controls_of.is_empty());
    }

    #[test]
    fn test_symmetric_relocation() {
        let mut shards = arena(2);
        // Opposite-direction buffer with angle0 = 0 folds into the new one.
        add_phase_angles(&mut shards, 1, 0, 0.0, PI / 2.0);
        add_phase_angles(&mut shards, 0, 1, 0.0, PI / 3.0);
        assert!(shards[0].targets_of.is_empty());
        let buf = shards[1].targets_of[&0];
        assert_relative_eq!(buf.angle1, PI / 2.0 + PI / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_inversion_swaps_and_toggles() {
        let mut shards = arena(2);
        add_phase_angles(&mut shards, 0, 1, 0.3, 0.7);
        add_inversion_angles(&mut shards, 0, 1, 0.0, 0.0);
        let buf = shards[1].targets_of[&0];
        assert!(buf.is_invert);
        assert_relative_eq!(buf.angle0, 0.7, epsilon = 1e-12);
        assert_relative_eq!(buf.angle1, 0.3, epsilon = 1e-12);

        // CNOT twice cancels.
        add_inversion_angles(&mut shards, 0, 1, 0.0, 0.0);
        assert!(shards[1].targets_of.is_empty());
    }

    #[test]
    fn test_flip_phase_anti() {
        let mut shards = arena(2);
        add_phase_angles(&mut shards, 0, 1, 0.3, 0.7);
        flip_phase_anti(&mut shards, 1);
        let buf = shards[1].targets_of[&0];
        assert_relative_eq!(buf.angle0, 0.7, epsilon = 1e-12);
        assert_relative_eq!(buf.angle1, 0.3, epsilon = 1e-12);
        // Both endpoints stay in sync.
        assert_eq!(shards[0].controls_of[&1], buf);
    }

    #[test]
    fn test_h_commute_rules() {
        // Global-phase-like buffer commutes unchanged.
        let mut shards = arena(2);
        add_phase_angles(&mut shards, 0, 1, 0.5, 0.5);
        assert!(try_h_commute(&mut shards, 1));
        assert!(!shards[1].targets_of[&0].is_invert);

        // σx-like invert becomes σz-like diagonal.
        let mut shards = arena(2);
        add_inversion_angles(&mut shards, 0, 1, 0.0, 0.0);
        assert!(try_h_commute(&mut shards, 1));
        let buf = shards[1].targets_of[&0];
        assert!(!buf.is_invert);
        assert_relative_eq!((buf.cmplx0() + buf.cmplx1()).norm(), 0.0, epsilon = 1e-9);

        // A CZ-like buffer blocks the commute.
        let mut shards = arena(2);
        add_phase_angles(&mut shards, 0, 1, 0.0, 2.0 * PI);
        assert!(!try_h_commute(&mut shards, 1));

        // Control-side buffers always block.
        let mut shards = arena(2);
        add_phase_angles(&mut shards, 1, 0, 0.5, 0.5);
        assert!(!try_h_commute(&mut shards, 1));
    }

    #[test]
    fn test_single_buffer_compose() {
        let mut buf = SingleBuffer::identity();
        buf.compose_invert(ONE_CMPLX, ONE_CMPLX);
        buf.compose_invert(ONE_CMPLX, ONE_CMPLX);
        assert!(buf.is_identity());

        let mut buf = SingleBuffer::identity();
        buf.compose_phase(ONE_CMPLX, Complex64::new(0.0, 1.0));
        buf.compose_invert(ONE_CMPLX, ONE_CMPLX);
        // X·S = [[0, i], [1, 0]]
        let m = buf.matrix();
        assert_relative_eq!((m[1] - Complex64::new(0.0, 1.0)).norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!((m[2] - ONE_CMPLX).norm(), 0.0, epsilon = 1e-12);
    }
}
