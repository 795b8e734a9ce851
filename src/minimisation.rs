use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use argmin::core::observers::{ObserverMode, SlogLogger};
use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use finitediff::FiniteDiff;
use ndarray::{Array1, Array2};
use ndarray_linalg::{Eigh, UPLO};
use thiserror::Error;

use crate::config::Config;
use crate::math::{inverse_from_eigh, symmetrize};
use crate::{EstimationError, Result};

/// The Hessian is rejected when its smallest eigenvalue falls below this fraction of the largest
const MIN_RELATIVE_EIGENVALUE: f64 = 1e-10;

/// A smooth function to be minimised, with its analytic gradient.
pub(crate) trait Objective {
    fn value(&self, theta: &Array1<f64>) -> f64;

    fn gradient(&self, theta: &Array1<f64>) -> Array1<f64>;

    /// Divisor applied to the objective while it is minimised, so the stopping tolerances do not
    /// depend on the sample size.
    fn scale(&self) -> f64 {
        1.0
    }
}

/// Cooperative cancellation of optimizer runs.
///
/// Clones share the same flag, so an `Interrupt` can be handed to another thread and cancelled
/// from there. A cancel request is consumed by the first optimizer run that observes it: that run
/// aborts and any later run starts afresh. An optional timeout bounds every run separately.
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    cancelled: Arc<AtomicBool>,
    timeout: Option<Duration>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort any run that has been going for longer than `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Request that the run currently in progress stops at its next objective evaluation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether a cancel request is still waiting to be observed.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Fill in the configured timeout unless one was set explicitly.
    pub(crate) fn or_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            cancelled: Arc::clone(&self.cancelled),
            timeout: self.timeout.or(timeout),
        }
    }

    fn take_cancellation(&self) -> bool {
        self.cancelled.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
enum Interrupted {
    #[error("the run was cancelled")]
    Cancelled,
    #[error("the run exceeded its time budget of {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Error)]
#[error("the objective evaluated to NaN")]
struct NotANumber;

#[derive(Clone, Copy, Debug)]
pub(crate) struct MinimiserOptions {
    pub(crate) max_iters: u64,
    pub(crate) tol_grad: f64,
    pub(crate) tol_cost: f64,
    pub(crate) memory: usize,
    pub(crate) verbose: bool,
}

impl From<&Config> for MinimiserOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_iters: config.maxiter,
            tol_grad: config.tol_grad,
            tol_cost: config.tol_cost,
            memory: config.lbfgs_memory,
            verbose: config.verbose,
        }
    }
}

/// A stationary point reached by [`minimise`].
#[derive(Clone, Debug)]
pub(crate) struct Solution {
    pub(crate) theta: Array1<f64>,
    /// Unscaled objective at `theta`
    pub(crate) objective: f64,
    pub(crate) iterations: u64,
}

/// The argmin view of an [`Objective`].
struct Problem<'a, O> {
    objective: &'a O,
    interrupt: &'a Interrupt,
    deadline: Option<Instant>,
}

impl<O> Problem<'_, O> {
    fn check_interrupt(&self) -> ::std::result::Result<(), Interrupted> {
        if self.interrupt.take_cancellation() {
            return Err(Interrupted::Cancelled);
        }
        match (self.deadline, self.interrupt.timeout) {
            (Some(deadline), Some(timeout)) if Instant::now() > deadline => {
                Err(Interrupted::TimedOut(timeout))
            }
            _ => Ok(()),
        }
    }
}

impl<O: Objective> CostFunction for Problem<'_, O> {
    type Param = Array1<f64>;
    type Output = f64;

    fn cost(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        self.check_interrupt()?;
        let value = self.objective.value(p) / self.objective.scale();
        if value.is_nan() {
            return Err(NotANumber.into());
        }
        Ok(value)
    }
}

impl<O: Objective> Gradient for Problem<'_, O> {
    type Param = Array1<f64>;
    type Gradient = Array1<f64>;

    fn gradient(
        &self,
        p: &Self::Param,
    ) -> ::std::result::Result<Self::Gradient, argmin::core::Error> {
        self.check_interrupt()?;
        Ok(self.objective.gradient(p) / self.objective.scale())
    }
}

/// Minimise `objective` from `initial` with L-BFGS and a More-Thuente line search.
///
/// # Errors
/// `OptimizationDiverged` unless argmin reports convergence: an exhausted iteration budget, a
/// failed line search, a NaN objective and an interruption all count as divergence.
pub(crate) fn minimise<O: Objective>(
    objective: &O,
    initial: Array1<f64>,
    options: &MinimiserOptions,
    interrupt: &Interrupt,
) -> Result<Solution> {
    let linesearch = MoreThuenteLineSearch::new();
    let solver = LBFGS::new(linesearch, options.memory)
        .with_tolerance_grad(options.tol_grad)
        .and_then(|solver| solver.with_tolerance_cost(options.tol_cost))
        .map_err(|e| EstimationError::invalid_option("tol_grad", e.to_string()))?;

    let problem = Problem {
        objective,
        interrupt,
        deadline: interrupt.timeout.map(|timeout| Instant::now() + timeout),
    };

    let max_iters = options.max_iters;
    let mut executor =
        Executor::new(problem, solver).configure(|state| state.param(initial).max_iters(max_iters));
    if options.verbose {
        executor = executor.add_observer(SlogLogger::term(), ObserverMode::Always);
    }

    let res = executor.run().map_err(|e| {
        let reason = e.downcast_ref::<Interrupted>().map_or_else(
            || format!("the optimizer failed: {e}"),
            ToString::to_string,
        );
        log::debug!("optimizer run aborted: {reason}");
        EstimationError::OptimizationDiverged {
            iterations: 0,
            reason,
        }
    })?;

    let state = res.state();
    let iterations = state.get_iter();
    let status = state.get_termination_status();
    if !matches!(
        status,
        TerminationStatus::Terminated(
            TerminationReason::SolverConverged | TerminationReason::TargetCostReached
        )
    ) {
        return Err(EstimationError::OptimizationDiverged {
            iterations,
            reason: format!("{status:?}"),
        });
    }

    let theta = state
        .get_best_param()
        .cloned()
        .ok_or_else(|| EstimationError::OptimizationDiverged {
            iterations,
            reason: "no parameter vector was recorded".into(),
        })?;
    let objective_value = state.get_best_cost() * objective.scale();
    if !objective_value.is_finite() {
        return Err(EstimationError::OptimizationDiverged {
            iterations,
            reason: format!("the objective at the optimum is {objective_value}"),
        });
    }

    log::debug!("converged after {iterations} iterations, objective {objective_value:.6}");

    Ok(Solution {
        theta,
        objective: objective_value,
        iterations,
    })
}

/// Inverse of the Hessian of `objective` at `theta`.
///
/// The Hessian is the central finite difference of the analytic gradient, symmetrised. It is
/// inverted through its eigendecomposition, so the result is exactly symmetric and positive
/// definite.
///
/// # Errors
/// `SingularHessian` if the Hessian has non-finite entries or is not numerically positive
/// definite.
pub(crate) fn observed_information_inverse<O: Objective>(
    objective: &O,
    theta: &Array1<f64>,
) -> Result<Array2<f64>> {
    let mut hessian = theta.central_hessian(&|p: &Array1<f64>| objective.gradient(p));
    symmetrize(&mut hessian);
    if hessian.iter().any(|v| !v.is_finite()) {
        return Err(EstimationError::SingularHessian(
            "the Hessian has non-finite entries".into(),
        ));
    }

    let (eigenvalues, eigenvectors) = hessian.eigh(UPLO::Lower)?;
    let largest = eigenvalues.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let smallest = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    if !(largest > 0.0 && smallest > MIN_RELATIVE_EIGENVALUE * largest) {
        return Err(EstimationError::SingularHessian(format!(
            "eigenvalues span [{smallest:.3e}, {largest:.3e}]"
        )));
    }

    Ok(inverse_from_eigh(&eigenvalues, &eigenvectors))
}
