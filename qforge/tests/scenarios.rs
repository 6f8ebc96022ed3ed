//! End-to-end scenarios across the full engine stack

use approx::assert_relative_eq;
use num_complex::Complex64;
use qforge::prelude::*;
use qforge::QuantumBackend;

const SQRT1_2: f64 = std::f64::consts::FRAC_1_SQRT_2;

fn sim(qubits: usize) -> Simulator {
    Simulator::with_config(qubits, &EngineConfig::new().with_seed(42)).unwrap()
}

#[test]
fn bell_pair() {
    let mut sim = sim(2);
    sim.h(0).unwrap();
    sim.cnot(0, 1).unwrap();

    let amps = sim.amplitudes().unwrap();
    assert_relative_eq!(amps[0b00].norm(), SQRT1_2, epsilon = 1e-10);
    assert_relative_eq!(amps[0b11].norm(), SQRT1_2, epsilon = 1e-10);
    assert_relative_eq!(amps[0b01].norm(), 0.0, epsilon = 1e-10);
    assert_relative_eq!(amps[0b10].norm(), 0.0, epsilon = 1e-10);

    let bit = sim.measure(0).unwrap();
    assert_relative_eq!(
        sim.prob(1).unwrap(),
        if bit { 1.0 } else { 0.0 },
        epsilon = 1e-10
    );
}

#[test]
fn bell_pair_outcome_frequencies() {
    let mut zeros = 0usize;
    for seed in 0..64 {
        let mut sim =
            Simulator::with_config(2, &EngineConfig::new().with_seed(seed)).unwrap();
        sim.h(0).unwrap();
        sim.cnot(0, 1).unwrap();
        let outcome = sim.measure_all().unwrap();
        assert!(outcome == 0b00 || outcome == 0b11);
        if outcome == 0 {
            zeros += 1;
        }
    }
    // Both branches must actually occur.
    assert!(zeros > 8 && zeros < 56);
}

#[test]
fn ghz_three_qubits() {
    let mut sim = sim(3);
    sim.h(0).unwrap();
    sim.cnot(0, 1).unwrap();
    sim.cnot(1, 2).unwrap();

    let amps = sim.amplitudes().unwrap();
    assert_relative_eq!(amps[0b000].norm(), SQRT1_2, epsilon = 1e-10);
    assert_relative_eq!(amps[0b111].norm(), SQRT1_2, epsilon = 1e-10);
    for i in 1..7 {
        assert_relative_eq!(amps[i].norm(), 0.0, epsilon = 1e-10);
    }
}

#[test]
fn grover_single_iteration_marks_three() {
    let mut sim = sim(2);
    // Equal superposition.
    sim.h(0).unwrap();
    sim.h(1).unwrap();
    // Oracle: phase-flip |11>.
    sim.cz(0, 1).unwrap();
    // Diffusion.
    sim.h(0).unwrap();
    sim.h(1).unwrap();
    sim.x(0).unwrap();
    sim.x(1).unwrap();
    sim.cz(0, 1).unwrap();
    sim.x(0).unwrap();
    sim.x(1).unwrap();
    sim.h(0).unwrap();
    sim.h(1).unwrap();

    assert_relative_eq!(sim.prob_all(3).unwrap(), 1.0, epsilon = 1e-9);
}

#[test]
fn qft_round_trip() {
    let amps: Vec<Complex64> = vec![
        Complex64::new(0.5, 0.0),
        Complex64::new(0.0, 0.5),
        Complex64::new(-0.5, 0.0),
        Complex64::new(0.0, -0.5),
        Complex64::new(0.0, 0.0),
        Complex64::new(0.0, 0.0),
        Complex64::new(0.0, 0.0),
        Complex64::new(0.0, 0.0),
    ];
    let mut sim = sim(3);
    sim.backend().set_quantum_state(&amps).unwrap();
    sim.qft(0, 3).unwrap();
    sim.iqft(0, 3).unwrap();

    let out = sim.amplitudes().unwrap();
    for (o, a) in out.iter().zip(amps.iter()) {
        assert_relative_eq!((o - a).norm(), 0.0, epsilon = 1e-9);
    }
}

#[test]
fn modular_exponentiation() {
    // Input register of 3 qubits in uniform superposition, output
    // register of 4 qubits cleared: POWModNOut(2, 15) writes 2^x mod 15.
    let mut sim = sim(7);
    for q in 0..3 {
        sim.h(q).unwrap();
    }
    sim.backend().pow_mod_n_out(2, 15, 0, 3, 4).unwrap();

    for x in 0..8u64 {
        let expected = x | ((mod_pow_naive(2, x, 15)) << 3);
        assert_relative_eq!(sim.prob_all(expected).unwrap(), 0.125, epsilon = 1e-9);
    }
}

#[test]
fn separability_recovery_after_cz_pair() {
    let mut sim = sim(2);
    sim.h(0).unwrap();
    sim.h(1).unwrap();
    sim.cz(0, 1).unwrap();
    sim.cz(0, 1).unwrap();

    // CZ squared is the identity; the unit layer never entangles and
    // both qubits remain isolated shards.
    assert!(sim.backend().is_isolated(0));
    assert!(sim.backend().is_isolated(1));
    assert_eq!(sim.backend().engine_count(), 0);
    assert_relative_eq!(sim.prob(0).unwrap(), 0.5, epsilon = 1e-10);
    assert_relative_eq!(sim.prob(1).unwrap(), 0.5, epsilon = 1e-10);
}

#[test]
fn inc_round_trip_is_identity() {
    let mut sim = sim(4);
    sim.h(0).unwrap();
    sim.h(2).unwrap();
    let before = sim.amplitudes().unwrap();
    sim.backend().inc(5, 0, 4).unwrap();
    sim.backend().inc(16 - 5, 0, 4).unwrap();
    let after = sim.amplitudes().unwrap();
    for (b, a) in before.iter().zip(after.iter()) {
        assert_relative_eq!((b - a).norm(), 0.0, epsilon = 1e-9);
    }
}

#[test]
fn mul_mod_round_trip_is_identity() {
    let mut sim = sim(8);
    sim.h(0).unwrap();
    sim.h(1).unwrap();
    let before = sim.amplitudes().unwrap();
    // gcd(4, 15) = 1
    sim.backend().mul_mod_n_out(4, 15, 0, 4, 4).unwrap();
    sim.backend().imul_mod_n_out(4, 15, 0, 4, 4).unwrap();
    let after = sim.amplitudes().unwrap();
    for (b, a) in before.iter().zip(after.iter()) {
        assert_relative_eq!((b - a).norm(), 0.0, epsilon = 1e-9);
    }
}

#[test]
fn stabilizer_matches_state_vector_for_clifford_circuit() {
    use qforge::{QEngineCpu, QStabilizer};

    let cfg = EngineConfig::new().with_seed(42);
    let mut tableau = QStabilizer::new(3, 0, &cfg).unwrap();
    let mut engine = QEngineCpu::new(3, 0, &cfg).unwrap();

    let h = Complex64::new(SQRT1_2, 0.0);
    let h_m = [h, h, h, -h];
    let one = Complex64::new(1.0, 0.0);
    let neg = Complex64::new(-1.0, 0.0);
    let i_c = Complex64::new(0.0, 1.0);

    // H(0) CNOT(0,1) S(1) CZ(1,2) H(2)
    tableau.h(0);
    engine.mtrx(&h_m, 0).unwrap();
    tableau.cnot(0, 1);
    engine.mc_invert(&[0], one, one, 1).unwrap();
    tableau.s(1);
    engine.phase(one, i_c, 1).unwrap();
    tableau.cz(1, 2);
    engine.mc_phase(&[1], one, neg, 2).unwrap();
    tableau.h(2);
    engine.mtrx(&h_m, 2).unwrap();

    let mut stab_amps = vec![Complex64::new(0.0, 0.0); 8];
    tableau.get_quantum_state(&mut stab_amps).unwrap();
    let mut dense_amps = vec![Complex64::new(0.0, 0.0); 8];
    engine.get_quantum_state(&mut dense_amps).unwrap();

    for (s, d) in stab_amps.iter().zip(dense_amps.iter()) {
        assert_relative_eq!((s - d).norm(), 0.0, epsilon = 1e-9);
    }
}

#[test]
fn unit_layer_matches_direct_engine_distributions() {
    use qforge::QEngineCpu;

    let cfg = EngineConfig::new().with_seed(42).with_stabilizer(false);
    let mut sim = Simulator::with_config(4, &cfg).unwrap();
    let mut engine = QEngineCpu::new(4, 0, &EngineConfig::new().with_seed(42)).unwrap();

    let h = Complex64::new(SQRT1_2, 0.0);
    let h_m = [h, h, h, -h];
    let one = Complex64::new(1.0, 0.0);
    let t_m = [
        one,
        Complex64::new(0.0, 0.0),
        Complex64::new(0.0, 0.0),
        Complex64::from_polar(1.0, std::f64::consts::FRAC_PI_4),
    ];

    sim.h(0).unwrap();
    engine.mtrx(&h_m, 0).unwrap();
    sim.t(0).unwrap();
    engine.mtrx(&t_m, 0).unwrap();
    sim.cnot(0, 2).unwrap();
    engine.mc_invert(&[0], one, one, 2).unwrap();
    sim.h(3).unwrap();
    engine.mtrx(&h_m, 3).unwrap();
    sim.cz(2, 3).unwrap();
    engine
        .mc_phase(&[2], one, Complex64::new(-1.0, 0.0), 3)
        .unwrap();
    sim.x(1).unwrap();
    engine.invert(one, one, 1).unwrap();

    for q in 0..4 {
        assert_relative_eq!(
            sim.prob(q).unwrap(),
            engine.prob(q).unwrap(),
            epsilon = 1e-9
        );
    }
    for perm in 0..16u64 {
        assert_relative_eq!(
            sim.prob_all(perm).unwrap(),
            engine.prob_all(perm).unwrap(),
            epsilon = 1e-9
        );
    }
}

#[test]
fn paged_engine_matches_flat_engine() {
    use qforge::{QEngineCpu, QPager};

    let flat_cfg = EngineConfig::new().with_seed(42);
    let paged_cfg = EngineConfig::new().with_seed(42).with_paging(2);
    let mut flat = QEngineCpu::new(4, 0, &flat_cfg).unwrap();
    let mut paged = QPager::new(4, 0, &paged_cfg).unwrap();

    let h = Complex64::new(SQRT1_2, 0.0);
    let h_m = [h, h, h, -h];
    let one = Complex64::new(1.0, 0.0);

    for backend in [0usize, 1, 2, 3] {
        flat.mtrx(&h_m, backend).unwrap();
        paged.mtrx(&h_m, backend).unwrap();
    }
    flat.mc_invert(&[0], one, one, 3).unwrap();
    paged.mc_invert(&[0], one, one, 3).unwrap();
    flat.mc_phase(&[3], one, Complex64::new(-1.0, 0.0), 1)
        .unwrap();
    paged
        .mc_phase(&[3], one, Complex64::new(-1.0, 0.0), 1)
        .unwrap();

    let mut a = vec![Complex64::new(0.0, 0.0); 16];
    let mut b = vec![Complex64::new(0.0, 0.0); 16];
    flat.get_quantum_state(&mut a).unwrap();
    paged.get_quantum_state(&mut b).unwrap();
    for (x, y) in a.iter().zip(b.iter()) {
        assert_relative_eq!((x - y).norm(), 0.0, epsilon = 1e-9);
    }
}

#[test]
fn compose_decompose_round_trip() {
    let cfg = EngineConfig::new().with_seed(42);
    let mut a = Simulator::with_config(2, &cfg).unwrap();
    a.h(0).unwrap();
    a.cnot(0, 1).unwrap();
    let a_amps = a.amplitudes().unwrap();

    let mut b = Simulator::with_config(1, &cfg).unwrap();
    b.h(0).unwrap();
    b.s(0).unwrap();
    let b_amps = b.amplitudes().unwrap();

    let joint_backend = b.backend().clone();
    a.backend().compose(joint_backend).unwrap();
    assert_eq!(a.qubit_count(), 3);

    let mut recovered = a.backend().decompose(2, 1).unwrap();
    assert_eq!(a.qubit_count(), 2);

    let rec_a = a.amplitudes().unwrap();
    let mut rec_b = vec![Complex64::new(0.0, 0.0); 2];
    recovered.get_quantum_state(&mut rec_b).unwrap();

    // Each factor matches up to a global phase.
    let phase_a = first_phase(&rec_a, &a_amps);
    for (r, o) in rec_a.iter().zip(a_amps.iter()) {
        assert_relative_eq!((r - o * phase_a).norm(), 0.0, epsilon = 1e-9);
    }
    let phase_b = first_phase(&rec_b, &b_amps);
    for (r, o) in rec_b.iter().zip(b_amps.iter()) {
        assert_relative_eq!((r - o * phase_b).norm(), 0.0, epsilon = 1e-9);
    }
}

fn first_phase(found: &[Complex64], reference: &[Complex64]) -> Complex64 {
    for (f, r) in found.iter().zip(reference.iter()) {
        if r.norm_sqr() > 1e-9 {
            return f / r;
        }
    }
    Complex64::new(1.0, 0.0)
}

fn mod_pow_naive(base: u64, exp: u64, n: u64) -> u64 {
    let mut result = 1u64;
    for _ in 0..exp {
        result = result * base % n;
    }
    result
}
