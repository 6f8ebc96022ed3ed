//! User-facing simulator over the full engine stack

use num_complex::Complex64;
use std::f64::consts::{FRAC_1_SQRT_2, PI};

use qforge_core::{BasisIndex, EngineConfig, QuantumBackend, Result, ONE_CMPLX, ZERO_CMPLX};
use qforge_unit::QUnit;

/// A quantum register behind the full layer stack
///
/// `Simulator` owns a [`QUnit`] whose sub-engines are chosen from the
/// configuration: the stabilizer hybrid by default, backed by the pager
/// or the flat CPU engine once a register outgrows Clifford form.
pub struct Simulator {
    unit: QUnit,
}

impl Simulator {
    /// A register of `qubit_count` qubits in |0…0⟩, with environment
    /// overrides applied
    pub fn new(qubit_count: usize) -> Result<Self> {
        Self::with_config(qubit_count, &EngineConfig::from_env())
    }

    pub fn with_config(qubit_count: usize, config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            unit: QUnit::new(qubit_count, config.initial_permutation, config)?,
        })
    }

    /// Direct access to the engine stack
    pub fn backend(&mut self) -> &mut QUnit {
        &mut self.unit
    }

    pub fn qubit_count(&self) -> usize {
        self.unit.qubit_count()
    }

    // --- named gates ---

    pub fn h(&mut self, q: usize) -> Result<()> {
        let h = Complex64::new(FRAC_1_SQRT_2, 0.0);
        self.unit.mtrx(&[h, h, h, -h], q)
    }

    pub fn x(&mut self, q: usize) -> Result<()> {
        self.unit.invert(ONE_CMPLX, ONE_CMPLX, q)
    }

    pub fn y(&mut self, q: usize) -> Result<()> {
        self.unit
            .invert(Complex64::new(0.0, -1.0), Complex64::new(0.0, 1.0), q)
    }

    pub fn z(&mut self, q: usize) -> Result<()> {
        self.unit.phase(ONE_CMPLX, Complex64::new(-1.0, 0.0), q)
    }

    pub fn s(&mut self, q: usize) -> Result<()> {
        self.unit.phase(ONE_CMPLX, Complex64::new(0.0, 1.0), q)
    }

    pub fn sdg(&mut self, q: usize) -> Result<()> {
        self.unit.phase(ONE_CMPLX, Complex64::new(0.0, -1.0), q)
    }

    pub fn t(&mut self, q: usize) -> Result<()> {
        self.unit
            .phase(ONE_CMPLX, Complex64::from_polar(1.0, PI / 4.0), q)
    }

    pub fn tdg(&mut self, q: usize) -> Result<()> {
        self.unit
            .phase(ONE_CMPLX, Complex64::from_polar(1.0, -PI / 4.0), q)
    }

    pub fn rx(&mut self, theta: f64, q: usize) -> Result<()> {
        let c = Complex64::new((theta / 2.0).cos(), 0.0);
        let s = Complex64::new(0.0, -(theta / 2.0).sin());
        self.unit.mtrx(&[c, s, s, c], q)
    }

    pub fn ry(&mut self, theta: f64, q: usize) -> Result<()> {
        let c = Complex64::new((theta / 2.0).cos(), 0.0);
        let s = Complex64::new((theta / 2.0).sin(), 0.0);
        self.unit.mtrx(&[c, -s, s, c], q)
    }

    pub fn rz(&mut self, theta: f64, q: usize) -> Result<()> {
        self.unit.phase(
            Complex64::from_polar(1.0, -theta / 2.0),
            Complex64::from_polar(1.0, theta / 2.0),
            q,
        )
    }

    /// Phase-shift gate diag(1, e^{iθ})
    pub fn p(&mut self, theta: f64, q: usize) -> Result<()> {
        self.unit
            .phase(ONE_CMPLX, Complex64::from_polar(1.0, theta), q)
    }

    pub fn cnot(&mut self, control: usize, target: usize) -> Result<()> {
        self.unit.mc_invert(&[control], ONE_CMPLX, ONE_CMPLX, target)
    }

    pub fn cy(&mut self, control: usize, target: usize) -> Result<()> {
        self.unit.mc_invert(
            &[control],
            Complex64::new(0.0, -1.0),
            Complex64::new(0.0, 1.0),
            target,
        )
    }

    pub fn cz(&mut self, control: usize, target: usize) -> Result<()> {
        self.unit
            .mc_phase(&[control], ONE_CMPLX, Complex64::new(-1.0, 0.0), target)
    }

    /// Controlled phase-shift diag(1, 1, 1, e^{iθ})
    pub fn cp(&mut self, theta: f64, control: usize, target: usize) -> Result<()> {
        self.unit
            .mc_phase(&[control], ONE_CMPLX, Complex64::from_polar(1.0, theta), target)
    }

    pub fn ccnot(&mut self, control1: usize, control2: usize, target: usize) -> Result<()> {
        self.unit
            .mc_invert(&[control1, control2], ONE_CMPLX, ONE_CMPLX, target)
    }

    pub fn ccz(&mut self, control1: usize, control2: usize, target: usize) -> Result<()> {
        self.unit.mc_phase(
            &[control1, control2],
            ONE_CMPLX,
            Complex64::new(-1.0, 0.0),
            target,
        )
    }

    pub fn swap(&mut self, qubit1: usize, qubit2: usize) -> Result<()> {
        self.unit.swap(qubit1, qubit2)
    }

    // --- the quantum Fourier transform, little-endian over a range ---

    pub fn qft(&mut self, start: usize, length: usize) -> Result<()> {
        for i in (0..length).rev() {
            self.h(start + i)?;
            for j in (0..i).rev() {
                let angle = PI / pow2f(i - j);
                self.cp(angle, start + j, start + i)?;
            }
        }
        for i in 0..length / 2 {
            self.swap(start + i, start + length - 1 - i)?;
        }
        Ok(())
    }

    pub fn iqft(&mut self, start: usize, length: usize) -> Result<()> {
        for i in 0..length / 2 {
            self.swap(start + i, start + length - 1 - i)?;
        }
        for i in 0..length {
            for j in 0..i {
                let angle = -PI / pow2f(i - j);
                self.cp(angle, start + j, start + i)?;
            }
            self.h(start + i)?;
        }
        Ok(())
    }

    // --- measurement and inspection ---

    pub fn measure(&mut self, q: usize) -> Result<bool> {
        self.unit.m(q)
    }

    pub fn measure_all(&mut self) -> Result<BasisIndex> {
        self.unit.m_all()
    }

    pub fn prob(&mut self, q: usize) -> Result<f64> {
        self.unit.prob(q)
    }

    pub fn prob_all(&mut self, perm: BasisIndex) -> Result<f64> {
        self.unit.prob_all(perm)
    }

    pub fn amplitudes(&mut self) -> Result<Vec<Complex64>> {
        let mut out = vec![ZERO_CMPLX; self.unit.max_q_power() as usize];
        self.unit.get_quantum_state(&mut out)?;
        Ok(out)
    }

    pub fn probabilities(&mut self) -> Result<Vec<f64>> {
        let mut out = vec![0.0; self.unit.max_q_power() as usize];
        self.unit.get_probs(&mut out)?;
        Ok(out)
    }
}

fn pow2f(power: usize) -> f64 {
    (1u64 << power) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sim(qubits: usize) -> Simulator {
        Simulator::with_config(qubits, &EngineConfig::new().with_seed(42)).unwrap()
    }

    #[test]
    fn test_x_flips() {
        let mut sim = sim(1);
        sim.x(0).unwrap();
        assert_relative_eq!(sim.prob(0).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_s_s_is_z() {
        let mut a = sim(1);
        a.h(0).unwrap();
        a.s(0).unwrap();
        a.s(0).unwrap();
        let mut b = sim(1);
        b.h(0).unwrap();
        b.z(0).unwrap();
        let av = a.amplitudes().unwrap();
        let bv = b.amplitudes().unwrap();
        for (x, y) in av.iter().zip(bv.iter()) {
            assert_relative_eq!((x - y).norm(), 0.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_rx_probability() {
        let mut sim = sim(1);
        sim.rx(1.0, 0).unwrap();
        assert_relative_eq!(
            sim.prob(0).unwrap(),
            (0.5f64).sin().powi(2),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_ccnot_truth_table() {
        for perm in 0..8u64 {
            let mut sim = Simulator::with_config(
                3,
                &EngineConfig::new()
                    .with_seed(42)
                    .with_initial_permutation(perm),
            )
            .unwrap();
            sim.ccnot(0, 1, 2).unwrap();
            let expected = if perm & 0b11 == 0b11 { perm ^ 0b100 } else { perm };
            assert_relative_eq!(sim.prob_all(expected).unwrap(), 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_qft_of_zero_is_uniform() {
        let mut sim = sim(3);
        sim.qft(0, 3).unwrap();
        let probs = sim.probabilities().unwrap();
        for p in probs {
            assert_relative_eq!(p, 0.125, epsilon = 1e-9);
        }
    }
}
