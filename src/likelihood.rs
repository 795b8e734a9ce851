//! Negative log-likelihood of the latent-regressor model.
//!
//! The treatment column of the design holds a binary proxy $\hat x_i$ for an unobserved binary
//! regressor $x_i$. For every observation the likelihood sums over the two latent states
//! $s \in \{0, 1\}$ and, within each state, over the $k$ components of the outcome error:
//!
//! $$
//!     \ell_i = \ln \sum_{s} \sum_{j} w_{\hat x_i s} \, \pi_j \,
//!         \frac{1}{\sigma_{sj}} f_0\left(\frac{y_i - \mu_i(s) - m_j}{\sigma_{sj}}\right),
//!     \qquad \mu_i(s) = x_i^\top b + (s - \hat x_i) b_t
//! $$
//!
//! where $w$ is the joint distribution of (proxy, truth) and $(\pi, m, \sigma)$ the error
//! mixture. The sum is evaluated in log space. With $k = 1$ this is the one-step model.
//!
//! The unconstrained parameter vector is laid out as
//! `[b (d), v (3), a (k - 1), ν (k - 1), log σ (k or 2k)]`:
//! - `w = softmax(v₀, v₁, v₂, 0)` over the cells `00, 01, 10, 11` indexed `(proxy, truth)`,
//! - `π = softmax(a, 0)`,
//! - the first `k - 1` component means are `ν`, the last is fixed so the mixture has mean zero,
//! - scales are per (state, component), or per component when homoskedastic.
use itertools::iproduct;
use ndarray::{s, Array1, ArrayView1, ArrayView2};

use crate::design::Design;
use crate::distributions::ErrorDistribution;
use crate::linalg::least_squares;
use crate::math::{log_sum_exp, population_std};
use crate::minimisation::Objective;
use crate::{EstimationError, Result};

/// Number of free measurement logits; the `11` cell is the reference.
const MEASUREMENT_LOGITS: usize = 3;
/// Floor applied to starting cell frequencies
const MIN_CELL_FREQUENCY: f64 = 1e-3;
/// Starting scales never fall below this fraction of the residual standard deviation
const MIN_RELATIVE_SCALE: f64 = 1e-3;

const LATENT_STATES: [f64; 2] = [0.0, 1.0];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ParameterLayout {
    pub(crate) n_coef: usize,
    pub(crate) components: usize,
    pub(crate) homoskedastic: bool,
}

impl ParameterLayout {
    pub(crate) const fn new(n_coef: usize, components: usize, homoskedastic: bool) -> Self {
        Self {
            n_coef,
            components,
            homoskedastic,
        }
    }

    pub(crate) const fn n_scales(&self) -> usize {
        if self.homoskedastic {
            self.components
        } else {
            2 * self.components
        }
    }

    pub(crate) const fn len(&self) -> usize {
        self.scale_offset() + self.n_scales()
    }

    pub(crate) const fn measurement_offset(&self) -> usize {
        self.n_coef
    }

    pub(crate) const fn weight_offset(&self) -> usize {
        self.n_coef + MEASUREMENT_LOGITS
    }

    pub(crate) const fn mean_offset(&self) -> usize {
        self.weight_offset() + self.components - 1
    }

    pub(crate) const fn scale_offset(&self) -> usize {
        self.mean_offset() + self.components - 1
    }

    pub(crate) const fn scale_index(&self, state: usize, component: usize) -> usize {
        if self.homoskedastic {
            component
        } else {
            state * self.components + component
        }
    }

    pub(crate) fn unpack(&self, theta: &Array1<f64>) -> Parameters {
        let k = self.components;

        let mut cell_logits = [0.0; 4];
        for (cell, logit) in cell_logits.iter_mut().take(MEASUREMENT_LOGITS).enumerate() {
            *logit = theta[self.measurement_offset() + cell];
        }
        let cell_log_weights = log_softmax(&cell_logits);

        let component_logits = theta
            .slice(s![self.weight_offset()..self.mean_offset()])
            .iter()
            .copied()
            .chain(std::iter::once(0.0))
            .collect::<Vec<_>>();
        let component_log_weights = log_softmax(&component_logits);
        let component_weights = component_log_weights
            .iter()
            .map(|w| w.exp())
            .collect::<Vec<_>>();

        let mut means = theta
            .slice(s![self.mean_offset()..self.scale_offset()])
            .to_vec();
        let weighted_sum: f64 = means
            .iter()
            .zip(&component_weights)
            .map(|(mean, weight)| mean * weight)
            .sum();
        means.push(-weighted_sum / component_weights[k - 1]);

        let log_scales = theta.slice(s![self.scale_offset()..]).to_vec();
        let scales = log_scales.iter().map(|v| v.exp()).collect();

        Parameters {
            coef: theta.slice(s![..self.n_coef]).to_owned(),
            cell_weights: [
                cell_log_weights[0].exp(),
                cell_log_weights[1].exp(),
                cell_log_weights[2].exp(),
                cell_log_weights[3].exp(),
            ],
            cell_log_weights: [
                cell_log_weights[0],
                cell_log_weights[1],
                cell_log_weights[2],
                cell_log_weights[3],
            ],
            component_weights,
            component_log_weights,
            means,
            log_scales,
            scales,
        }
    }
}

fn log_softmax(logits: &[f64]) -> Vec<f64> {
    let normaliser = log_sum_exp(logits);
    logits.iter().map(|logit| logit - normaliser).collect()
}

/// The parameter vector mapped back to natural parameters.
#[derive(Clone, Debug)]
pub(crate) struct Parameters {
    pub(crate) coef: Array1<f64>,
    /// Joint (proxy, truth) cell probabilities, cell index `2 * proxy + truth`
    pub(crate) cell_weights: [f64; 4],
    pub(crate) cell_log_weights: [f64; 4],
    pub(crate) component_weights: Vec<f64>,
    pub(crate) component_log_weights: Vec<f64>,
    pub(crate) means: Vec<f64>,
    pub(crate) log_scales: Vec<f64>,
    pub(crate) scales: Vec<f64>,
}

/// Negative log-likelihood of a design under a given parameter layout.
#[derive(Clone, Debug)]
pub(crate) struct MixtureLikelihood<'a> {
    y: ArrayView1<'a, f64>,
    x: ArrayView2<'a, f64>,
    treatment: usize,
    layout: ParameterLayout,
    distribution: ErrorDistribution,
}

impl<'a> MixtureLikelihood<'a> {
    /// `treatment` must index a 0/1 column of the design.
    pub(crate) fn new(
        design: &'a Design,
        treatment: usize,
        layout: ParameterLayout,
        distribution: ErrorDistribution,
    ) -> Self {
        Self {
            y: design.response(),
            x: design.regressors(),
            treatment,
            layout,
            distribution,
        }
    }

    pub(crate) const fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub(crate) fn negative_log_likelihood(&self, theta: &Array1<f64>) -> f64 {
        self.evaluate(theta, false).0
    }

    /// Gradient of [`MixtureLikelihood::negative_log_likelihood`].
    pub(crate) fn gradient(&self, theta: &Array1<f64>) -> Array1<f64> {
        self.evaluate(theta, true).1
    }

    fn evaluate(&self, theta: &Array1<f64>, with_gradient: bool) -> (f64, Array1<f64>) {
        let layout = &self.layout;
        let params = layout.unpack(theta);
        let k = layout.components;
        let last = k - 1;
        let t = self.treatment;
        let slope = params.coef[t];
        let mu = self.x.dot(&params.coef);

        let mut nll = 0.0;
        let mut grad = Array1::zeros(if with_gradient { layout.len() } else { 0 });
        let mut terms = vec![0.0; 2 * k];
        let mut standardised = vec![0.0; 2 * k];

        for (ii, (&y, &mu)) in self.y.iter().zip(mu.iter()).enumerate() {
            let proxy = self.x[[ii, t]];
            let proxy_index = usize::from(proxy > 0.5);

            for (state, component) in iproduct!(0..2, 0..k) {
                let term = state * k + component;
                let scale = layout.scale_index(state, component);
                let shift = (LATENT_STATES[state] - proxy) * slope;
                let u = (y - mu - shift - params.means[component]) / params.scales[scale];
                standardised[term] = u;
                terms[term] = params.cell_log_weights[2 * proxy_index + state]
                    + params.component_log_weights[component]
                    + self.distribution.ln_standard_density(u)
                    - params.log_scales[scale];
            }

            let log_likelihood = log_sum_exp(&terms);
            nll -= log_likelihood;

            if !with_gradient {
                continue;
            }

            for (state, component) in iproduct!(0..2, 0..k) {
                let term = state * k + component;
                let responsibility = (terms[term] - log_likelihood).exp();
                if responsibility == 0.0 {
                    continue;
                }
                let scale = layout.scale_index(state, component);
                let u = standardised[term];
                let score = self.distribution.score(u);
                // Derivative of the term with respect to its residual
                let d_residual = score / params.scales[scale];

                for (l, &x_il) in self.x.row(ii).iter().enumerate() {
                    grad[l] += responsibility * d_residual * x_il;
                }
                grad[t] += responsibility * d_residual * (LATENT_STATES[state] - proxy);

                let cell = 2 * proxy_index + state;
                for c in 0..MEASUREMENT_LOGITS {
                    let indicator = if c == cell { 1.0 } else { 0.0 };
                    grad[layout.measurement_offset() + c] -=
                        responsibility * (indicator - params.cell_weights[c]);
                }

                for q in 0..last {
                    let weight_q = params.component_weights[q];
                    let mut d_logit = -weight_q;
                    let mut d_mean = 0.0;
                    if component == q {
                        d_logit += 1.0;
                        d_mean -= d_residual;
                    }
                    if component == last {
                        // The last mean is pinned by the zero-mean constraint
                        let ratio = weight_q / params.component_weights[last];
                        d_logit += d_residual * ratio * params.means[q];
                        d_mean += d_residual * ratio;
                    }
                    grad[layout.weight_offset() + q] -= responsibility * d_logit;
                    grad[layout.mean_offset() + q] -= responsibility * d_mean;
                }

                grad[layout.scale_offset() + scale] -= responsibility * (-u * score - 1.0);
            }
        }

        (nll, grad)
    }
}

impl Objective for MixtureLikelihood<'_> {
    fn value(&self, theta: &Array1<f64>) -> f64 {
        self.negative_log_likelihood(theta)
    }

    fn gradient(&self, theta: &Array1<f64>) -> Array1<f64> {
        Self::gradient(self, theta)
    }

    #[allow(clippy::cast_precision_loss)]
    fn scale(&self) -> f64 {
        self.y.len() as f64
    }
}

#[derive(Clone, Debug)]
pub(crate) struct StartingValues {
    /// Parameter vector in the single-component layout
    pub(crate) theta: Array1<f64>,
    /// Condition number of `XᵀX` met by the least squares stage
    pub(crate) condition_number: f64,
}

/// Single-component starting values built from least squares.
///
/// The latent state of each row is imputed by whichever of the two candidate means gives the
/// residual the higher Normal density. Cell frequencies of the imputed (proxy, truth) table seed
/// the measurement logits and the residual spread within each imputed group seeds the scales.
///
/// # Errors
/// `RankDeficiency` from the least squares stage, `InputShape` if the design fits the response
/// exactly so that no scale can be estimated.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn starting_values(
    design: &Design,
    treatment: usize,
    homoskedastic: bool,
    max_condition_number: f64,
) -> Result<StartingValues> {
    let x = design.regressors();
    let y = design.response();
    let fit = least_squares(x, y, max_condition_number)?;
    let residuals = fit.residuals(x, y);

    let sigma = population_std(&residuals.to_vec()).unwrap_or(0.0);
    if !(sigma > 0.0) {
        return Err(EstimationError::InputShape(
            "the design fits the response exactly, so the outcome scale is not identified".into(),
        ));
    }

    let normal = ErrorDistribution::Normal;
    let slope = fit.coef[treatment];
    let mu = x.dot(&fit.coef);

    let mut counts = [0usize; 4];
    let mut groups: [Vec<f64>; 2] = [vec![], vec![]];
    for ii in 0..design.n_obs() {
        let proxy_is_one = x[[ii, treatment]] > 0.5;
        let imputed_one = if proxy_is_one {
            normal.ln_pdf(y[ii], mu[ii], sigma) > normal.ln_pdf(y[ii], mu[ii] - slope, sigma)
        } else {
            normal.ln_pdf(y[ii], mu[ii] + slope, sigma) > normal.ln_pdf(y[ii], mu[ii], sigma)
        };
        counts[2 * usize::from(proxy_is_one) + usize::from(imputed_one)] += 1;
        groups[usize::from(imputed_one)].push(residuals[ii]);
    }

    let n = design.n_obs() as f64;
    let floored = counts.map(|count| (count as f64 / n).max(MIN_CELL_FREQUENCY));
    let total: f64 = floored.iter().sum();
    let frequencies = floored.map(|frequency| frequency / total);
    let logits = (0..MEASUREMENT_LOGITS).map(|cell| (frequencies[cell] / frequencies[3]).ln());

    let sigma_zero = population_std(&groups[0]);
    let sigma_one = population_std(&groups[1]);
    let floor = MIN_RELATIVE_SCALE * sigma;
    let sigma_zero = sigma_zero.or(sigma_one).unwrap_or(sigma).max(floor);
    let sigma_one = sigma_one.unwrap_or(sigma_zero).max(floor);

    let scales = if homoskedastic {
        let share = groups[1].len() as f64 / n;
        vec![(sigma_one * share + sigma_zero * (1.0 - share)).ln()]
    } else {
        vec![sigma_zero.ln(), sigma_one.ln()]
    };

    Ok(StartingValues {
        theta: fit
            .coef
            .iter()
            .copied()
            .chain(logits)
            .chain(scales)
            .collect(),
        condition_number: fit.condition_number,
    })
}

#[cfg(test)]
mod tests {
    use finitediff::FiniteDiff;
    use ndarray::{Array1, Array2};
    use ndarray_rand::rand::{Rng, SeedableRng};
    use ndarray_rand::rand_distr::StandardNormal;
    use rand_isaac::Isaac64Rng;

    use super::{starting_values, MixtureLikelihood, ParameterLayout};
    use crate::design::Design;
    use crate::distributions::ErrorDistribution;
    use crate::Result;

    /// Binary latent regressor, misclassified proxy and Normal noise.
    fn simulated_design(rng: &mut impl Rng, n: usize) -> Result<Design> {
        let mut y = Array1::zeros(n);
        let mut x = Array2::zeros((n, 1));
        for ii in 0..n {
            let truth = rng.gen_bool(0.4);
            let proxy = if rng.gen_bool(0.1) { !truth } else { truth };
            let noise: f64 = rng.sample(StandardNormal);
            y[ii] = 1.0 + 2.0 * f64::from(u8::from(truth)) + 0.5 * noise;
            x[[ii, 0]] = f64::from(u8::from(proxy));
        }
        Design::new(y, x, true, Some(vec!["proxy".into()]))
    }

    fn random_theta(rng: &mut impl Rng, layout: &ParameterLayout) -> Array1<f64> {
        Array1::from_iter((0..layout.len()).map(|_| rng.gen_range(-0.5..0.5)))
    }

    #[test]
    fn parameter_counts_follow_the_layout() {
        assert_eq!(ParameterLayout::new(2, 1, false).len(), 7);
        assert_eq!(ParameterLayout::new(2, 1, true).len(), 6);
        assert_eq!(ParameterLayout::new(2, 3, false).len(), 2 + 3 + 2 + 2 + 6);
        assert_eq!(ParameterLayout::new(2, 3, true).len(), 2 + 3 + 2 + 2 + 3);
    }

    #[test]
    fn unpacked_weights_are_normalised_and_mixture_has_zero_mean() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let layout = ParameterLayout::new(2, 4, false);
        let theta = random_theta(&mut rng, &layout);

        let params = layout.unpack(&theta);

        approx::assert_relative_eq!(params.cell_weights.iter().sum::<f64>(), 1.0);
        approx::assert_relative_eq!(params.component_weights.iter().sum::<f64>(), 1.0);
        let mixture_mean: f64 = params
            .component_weights
            .iter()
            .zip(&params.means)
            .map(|(w, m)| w * m)
            .sum();
        approx::assert_abs_diff_eq!(mixture_mean, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn single_component_likelihood_matches_direct_density_sum() -> Result<()> {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let design = simulated_design(&mut rng, 50)?;
        let layout = ParameterLayout::new(2, 1, false);
        let theta = random_theta(&mut rng, &layout);
        let likelihood = MixtureLikelihood::new(&design, 1, layout, ErrorDistribution::Normal);

        let params = layout.unpack(&theta);
        let (b0, b1) = (params.coef[0], params.coef[1]);
        let [w00, w01, w10, w11] = params.cell_weights;
        let pdf = |y: f64, loc: f64, scale: f64| ErrorDistribution::Normal.ln_pdf(y, loc, scale).exp();
        let (sigma0, sigma1) = (params.scales[0], params.scales[1]);
        let mut expected = 0.0;
        for (y, row) in design.response().iter().zip(design.regressors().rows()) {
            let mu = b0 + b1 * row[1];
            let density = if row[1] == 1.0 {
                w11 * pdf(*y, mu, sigma1) + w10 * pdf(*y, mu - b1, sigma0)
            } else {
                w01 * pdf(*y, mu + b1, sigma1) + w00 * pdf(*y, mu, sigma0)
            };
            expected -= density.ln();
        }

        approx::assert_relative_eq!(
            likelihood.negative_log_likelihood(&theta),
            expected,
            max_relative = 1e-12
        );
        Ok(())
    }

    #[test]
    fn extreme_outcomes_do_not_underflow() -> Result<()> {
        let design = Design::new(
            Array1::from(vec![0.1, 1.2, 1e4, -0.3]),
            Array2::from_shape_vec((4, 1), vec![0.0, 1.0, 1.0, 0.0])?,
            true,
            None,
        )?;
        let layout = ParameterLayout::new(2, 1, true);
        let theta = Array1::from(vec![0.0, 1.0, 0.0, 0.0, 0.0, (0.05_f64).ln()]);
        let likelihood = MixtureLikelihood::new(&design, 1, layout, ErrorDistribution::Normal);

        let nll = likelihood.negative_log_likelihood(&theta);
        let grad = likelihood.gradient(&theta);

        assert!(nll.is_finite());
        assert!(grad.iter().all(|g| g.is_finite()));
        Ok(())
    }

    fn assert_gradient_matches_finite_difference(
        layout: ParameterLayout,
        distribution: ErrorDistribution,
    ) -> Result<()> {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let design = simulated_design(&mut rng, 200)?;
        let likelihood = MixtureLikelihood::new(&design, 1, layout, distribution);

        for _ in 0..5 {
            let theta = random_theta(&mut rng, &layout);
            let analytic = likelihood.gradient(&theta);
            let numerical = theta.central_diff(&|p: &Array1<f64>| likelihood.negative_log_likelihood(p));

            for (a, n) in analytic.iter().zip(numerical.iter()) {
                approx::assert_relative_eq!(a, n, epsilon = 1e-3, max_relative = 1e-4);
            }
        }
        Ok(())
    }

    #[test]
    fn gradient_matches_finite_difference_for_one_step_model() -> Result<()> {
        assert_gradient_matches_finite_difference(
            ParameterLayout::new(2, 1, false),
            ErrorDistribution::Normal,
        )?;
        assert_gradient_matches_finite_difference(
            ParameterLayout::new(2, 1, true),
            ErrorDistribution::Normal,
        )
    }

    #[test]
    fn gradient_matches_finite_difference_for_heavy_tailed_errors() -> Result<()> {
        assert_gradient_matches_finite_difference(
            ParameterLayout::new(2, 1, false),
            ErrorDistribution::StudentT {
                degrees_of_freedom: 3.0,
            },
        )?;
        assert_gradient_matches_finite_difference(
            ParameterLayout::new(2, 1, true),
            ErrorDistribution::Laplace,
        )
    }

    #[test]
    fn gradient_matches_finite_difference_for_gaussian_mixtures() -> Result<()> {
        assert_gradient_matches_finite_difference(
            ParameterLayout::new(2, 3, false),
            ErrorDistribution::Normal,
        )?;
        assert_gradient_matches_finite_difference(
            ParameterLayout::new(2, 2, true),
            ErrorDistribution::Normal,
        )
    }

    #[test]
    fn starting_values_fill_the_single_component_layout() -> Result<()> {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let design = simulated_design(&mut rng, 300)?;

        for homoskedastic in [false, true] {
            let theta = starting_values(&design, 1, homoskedastic, 1e12)?.theta;
            assert_eq!(theta.len(), ParameterLayout::new(2, 1, homoskedastic).len());
            assert!(theta.iter().all(|v| v.is_finite()));
        }
        Ok(())
    }

    #[test]
    fn exact_fits_have_no_starting_scale() -> Result<()> {
        let design = Design::new(
            Array1::from(vec![1.0, 3.0, 1.0, 3.0]),
            Array2::from_shape_vec((4, 1), vec![0.0, 1.0, 0.0, 1.0])?,
            true,
            None,
        )?;
        assert!(starting_values(&design, 1, false, 1e12).is_err());
        Ok(())
    }
}
