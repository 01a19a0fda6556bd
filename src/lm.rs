//! Damped Gauss-Newton (Levenberg-Marquardt) nonlinear least squares.
//!
//! Problems implement [Residuals], a pure function from a parameter vector to a stacked error
//! vector. The solver never mutates the problem, so everything a residual needs must live in the
//! implementing struct for the duration of the solve.
//!
//! ```
//! use nalgebra::DVector;
//! use procam::lm::*;
//!
//! // fit y = m x + c
//! struct Line(Vec<(f64, f64)>);
//! impl Residuals for Line {
//!     fn num_residuals(&self) -> usize {
//!         self.0.len()
//!     }
//!     fn residuals(&self, p: &DVector<f64>) -> DVector<f64> {
//!         DVector::from_iterator(self.0.len(), self.0.iter().map(|(x, y)| y - (p[0] * x + p[1])))
//!     }
//! }
//!
//! let line = Line(vec![(0.0, 1.0), (1.0, 3.0), (2.0, 5.0)]);
//! let mut lm = LevenbergMarquardt::new(&line, DVector::from_vec(vec![0.0, 0.0]), SolverConfig::default());
//! let rms = lm.minimize();
//! assert!(rms < 1e-6);
//! ```
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// A least squares problem. Implementations must be pure: the same parameters always produce the
/// same residuals.
pub trait Residuals: Sync {
    /// Length of the vector returned by [Residuals::residuals].
    fn num_residuals(&self) -> usize;

    /// Stacked errors at `parameters`.
    fn residuals(&self, parameters: &DVector<f64>) -> DVector<f64>;

    /// Jacobian of [Residuals::residuals] with respect to the parameters. Defaults to forward
    /// differences.
    fn jacobian(&self, parameters: &DVector<f64>) -> DMatrix<f64> {
        numerical_jacobian(self, parameters)
    }
}

/// Forward difference Jacobian with step `max(|p_j| * 1e-6, 1e-6)`. Columns are evaluated in
/// parallel.
pub fn numerical_jacobian<R: Residuals + ?Sized>(
    problem: &R,
    parameters: &DVector<f64>,
) -> DMatrix<f64> {
    let e0 = problem.residuals(parameters);
    if parameters.is_empty() {
        return DMatrix::zeros(e0.len(), 0);
    }
    let columns = (0..parameters.len())
        .into_par_iter()
        .map(|j| {
            let step = (parameters[j].abs() * 1e-6).max(1e-6);
            let mut p = parameters.clone();
            p[j] += step;
            (problem.residuals(&p) - &e0) / step
        })
        .collect::<Vec<_>>();
    DMatrix::from_columns(&columns)
}

/// `J^T J`. Every cell is an independent dot product of two Jacobian columns; only the upper
/// triangle is computed.
pub fn normal_matrix(jacobian: &DMatrix<f64>) -> DMatrix<f64> {
    let n = jacobian.ncols();
    let cells = (0..n)
        .flat_map(|i| (i..n).map(move |j| (i, j)))
        .collect::<Vec<_>>();
    let values = cells
        .par_iter()
        .map(|&(i, j)| jacobian.column(i).dot(&jacobian.column(j)))
        .collect::<Vec<_>>();

    let mut jtj = DMatrix::zeros(n, n);
    for (&(i, j), v) in cells.iter().zip(values) {
        jtj[(i, j)] = v;
        jtj[(j, i)] = v;
    }
    jtj
}

/// `J^T e`.
pub fn gradient(jacobian: &DMatrix<f64>, error: &DVector<f64>) -> DVector<f64> {
    let values = (0..jacobian.ncols())
        .into_par_iter()
        .map(|i| jacobian.column(i).dot(error))
        .collect::<Vec<_>>();
    DVector::from_vec(values)
}

/// Solver state. Everything except `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    MaximumIterations,
    LambdaTooLarge,
    ReductionStepTooSmall,
}

/// Termination and damping controls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub maximum_iterations: usize,
    pub maximum_lambda: f64,
    /// Relative reduction of the squared error below which an accepted step ends the solve.
    pub minimum_reduction: f64,
    pub lambda_increment: f64,
    pub initial_lambda: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            maximum_iterations: 100,
            maximum_lambda: 1e7,
            minimum_reduction: 1e-5,
            lambda_increment: 10.0,
            initial_lambda: 1e-3,
        }
    }
}

pub struct LevenbergMarquardt<'a, R: Residuals + ?Sized> {
    problem: &'a R,
    pub parameters: DVector<f64>,
    pub state: State,
    pub config: SolverConfig,
    lambda: f64,
    iterations: usize,
    error: f64,
}

impl<'a, R: Residuals + ?Sized> LevenbergMarquardt<'a, R> {
    pub fn new(problem: &'a R, parameters: DVector<f64>, config: SolverConfig) -> Self {
        let error = problem.residuals(&parameters).norm_squared();
        let state = if error.is_finite() {
            State::Running
        } else {
            State::LambdaTooLarge
        };
        LevenbergMarquardt {
            problem,
            parameters,
            state,
            config,
            lambda: config.initial_lambda,
            iterations: 0,
            error,
        }
    }

    /// `sqrt(|e|^2 / k)` at the current parameters.
    pub fn rms_error(&self) -> f64 {
        let k = self.problem.num_residuals();
        if k == 0 {
            0.0
        } else {
            (self.error / k as f64).sqrt()
        }
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Take one step, retrying with more damping until the error decreases or a terminal state is
    /// reached. Returns the RMS error afterwards.
    pub fn step(&mut self) -> f64 {
        if self.state != State::Running {
            return self.rms_error();
        }
        if self.error == 0.0 {
            self.state = State::ReductionStepTooSmall;
            return self.rms_error();
        }

        let e0 = self.problem.residuals(&self.parameters);
        let jacobian = self.problem.jacobian(&self.parameters);
        let jtj = normal_matrix(&jacobian);
        let jte = gradient(&jacobian, &e0);

        loop {
            let mut augmented = jtj.clone();
            for i in 0..augmented.nrows() {
                let d = jtj[(i, i)];
                augmented[(i, i)] += self.lambda * if d > 0.0 { d } else { 1.0 };
            }

            let mut accepted = false;
            if let Some(delta) = solve(augmented, &jte) {
                let candidate = &self.parameters - delta;
                let error = self.problem.residuals(&candidate).norm_squared();
                if error.is_finite() && error < self.error {
                    let reduction = (self.error - error) / self.error;
                    self.parameters = candidate;
                    self.error = error;
                    self.lambda /= self.config.lambda_increment;
                    accepted = true;
                    if reduction < self.config.minimum_reduction {
                        self.state = State::ReductionStepTooSmall;
                    }
                }
            }
            if !accepted {
                self.lambda *= self.config.lambda_increment;
                if self.lambda > self.config.maximum_lambda {
                    self.state = State::LambdaTooLarge;
                }
            }
            if accepted || self.state != State::Running {
                break;
            }
        }

        self.iterations += 1;
        if self.state == State::Running && self.iterations >= self.config.maximum_iterations {
            self.state = State::MaximumIterations;
        }
        self.rms_error()
    }

    /// Step until a terminal state. Returns the final RMS error.
    pub fn minimize(&mut self) -> f64 {
        while self.state == State::Running {
            self.step();
        }
        log::debug!(
            "LM finished in {} iterations with state {:?}, rms {:.3e}",
            self.iterations,
            self.state,
            self.rms_error()
        );
        self.rms_error()
    }
}

fn solve(a: DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    match a.clone().cholesky() {
        Some(c) => Some(c.solve(b)),
        None => a.lu().solve(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    struct Trig {
        xs: Vec<f64>,
        ys: Vec<f64>,
    }

    fn trig(a: f64, b: f64, x: f64) -> f64 {
        a * (b * x).cos() + b * (a * x).sin()
    }

    impl Residuals for Trig {
        fn num_residuals(&self) -> usize {
            self.xs.len()
        }

        fn residuals(&self, p: &DVector<f64>) -> DVector<f64> {
            DVector::from_iterator(
                self.xs.len(),
                self.xs
                    .iter()
                    .zip(self.ys.iter())
                    .map(|(x, y)| y - trig(p[0], p[1], *x)),
            )
        }
    }

    fn trig_problem() -> Trig {
        let xs = (0..50).map(|i| i as f64 * 2e-4).collect::<Vec<_>>();
        let ys = xs.iter().map(|x| trig(100.0, 102.0, *x)).collect();
        Trig { xs, ys }
    }

    #[test]
    fn test_trig_fit_converges() {
        let problem = trig_problem();
        let mut lm = LevenbergMarquardt::new(
            &problem,
            DVector::from_vec(vec![90.0, 96.0]),
            SolverConfig::default(),
        );
        let initial = lm.rms_error();
        let rms = lm.minimize();
        assert!(rms < initial);
        assert!(lm.state != State::Running);
        assert_abs_diff_eq!(lm.parameters[0], 100.0, epsilon = 1e-4);
        assert_abs_diff_eq!(lm.parameters[1], 102.0, epsilon = 1e-4);
    }

    #[test]
    fn test_exact_start_terminates() {
        let problem = trig_problem();
        let mut lm = LevenbergMarquardt::new(
            &problem,
            DVector::from_vec(vec![100.0, 102.0]),
            SolverConfig::default(),
        );
        assert_eq!(lm.minimize(), 0.0);
        assert_eq!(lm.state, State::ReductionStepTooSmall);
        assert_eq!(lm.iterations(), 0);
    }

    #[test]
    fn test_iteration_cap() {
        let problem = trig_problem();
        let config = SolverConfig {
            maximum_iterations: 1,
            ..SolverConfig::default()
        };
        let mut lm = LevenbergMarquardt::new(&problem, DVector::from_vec(vec![90.0, 96.0]), config);
        lm.minimize();
        assert_eq!(lm.iterations(), 1);
        assert!(lm.state != State::Running);
    }

    struct Linear;

    impl Residuals for Linear {
        fn num_residuals(&self) -> usize {
            3
        }

        fn residuals(&self, p: &DVector<f64>) -> DVector<f64> {
            DVector::from_vec(vec![p[0] - 1.0, 2.0 * p[1] + 4.0, p[0] + p[1]])
        }

        fn jacobian(&self, _p: &DVector<f64>) -> DMatrix<f64> {
            DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 2.0, 1.0, 1.0])
        }
    }

    #[test]
    fn test_analytic_jacobian_matches_numerical() {
        let p = DVector::from_vec(vec![0.3, -0.7]);
        let numeric = numerical_jacobian(&Linear, &p);
        let analytic = Linear.jacobian(&p);
        assert!((numeric - analytic).amax() < 1e-6);
    }

    #[test]
    fn test_normal_matrix_matches_dense_product() {
        let j = DMatrix::from_fn(7, 4, |r, c| (r as f64 + 1.0) * (c as f64 - 1.5));
        let expected = j.transpose() * &j;
        assert!((normal_matrix(&j) - expected).amax() < 1e-12);
    }
}
