//! Benchmarks for the hot gate kernels

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use num_complex::Complex64;
use qforge_core::{EngineConfig, QuantumBackend, ONE_CMPLX};
use qforge_state::QEngineCpu;

const SQRT1_2: f64 = std::f64::consts::FRAC_1_SQRT_2;

fn h_mtrx() -> [Complex64; 4] {
    [
        Complex64::new(SQRT1_2, 0.0),
        Complex64::new(SQRT1_2, 0.0),
        Complex64::new(SQRT1_2, 0.0),
        Complex64::new(-SQRT1_2, 0.0),
    ]
}

fn bench_single_qubit(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_qubit_gate");
    for qubits in [10usize, 14, 18] {
        group.bench_with_input(BenchmarkId::from_parameter(qubits), &qubits, |b, &n| {
            let cfg = EngineConfig::new().with_seed(7);
            let mut engine = QEngineCpu::new(n, 0, &cfg).unwrap();
            let h = h_mtrx();
            b.iter(|| {
                engine.mtrx(black_box(&h), black_box(n / 2)).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_controlled_gate(c: &mut Criterion) {
    let mut group = c.benchmark_group("controlled_gate");
    for qubits in [10usize, 14, 18] {
        group.bench_with_input(BenchmarkId::from_parameter(qubits), &qubits, |b, &n| {
            let cfg = EngineConfig::new().with_seed(7);
            let mut engine = QEngineCpu::new(n, 0, &cfg).unwrap();
            engine.mtrx(&h_mtrx(), 0).unwrap();
            b.iter(|| {
                engine
                    .mc_invert(black_box(&[0]), ONE_CMPLX, ONE_CMPLX, black_box(n - 1))
                    .unwrap();
            });
        });
    }
    group.finish();
}

fn bench_inc(c: &mut Criterion) {
    let mut group = c.benchmark_group("register_inc");
    for qubits in [10usize, 14] {
        group.bench_with_input(BenchmarkId::from_parameter(qubits), &qubits, |b, &n| {
            let cfg = EngineConfig::new().with_seed(7);
            let mut engine = QEngineCpu::new(n, 1, &cfg).unwrap();
            b.iter(|| {
                engine.inc(black_box(3), 0, n).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_single_qubit, bench_controlled_gate, bench_inc);
criterion_main!(benches);
