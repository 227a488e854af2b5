use candle_core::{Result, Tensor};

use super::aggregator::AggregatedResult;
use super::params::{CombinedGradient, CombinedParams};
use super::traits::EstimatorParams;

/// Joint loss: mean objective broadcast over D, plus gradient variance.
///
/// loss[d] = mean_s f_s + Var_s[g_sd]
///
/// The result is left as a length-D vector; differentiating its sum
/// pushes the model params toward a lower objective and the estimator
/// params toward lower gradient variance in one backward pass.
pub fn combined_loss(result: &AggregatedResult) -> Result<Tensor> {
    result
        .grad_variance
        .broadcast_add(&result.mean_objective)
}

/// The two parts of the joint gradient, computed separately.
///
/// The objective term is expected to leave the estimator params alone, and
/// the variance term, in expectation, the model params. Nothing enforces
/// this; these parts make it observable.
#[derive(Debug, Clone)]
pub struct GradientDecomposition {
    /// Gradient of Σ_d mean objective (D copies of the mean objective)
    pub objective: CombinedGradient,
    /// Gradient of Σ_d gradient variance
    pub variance: CombinedGradient,
}

/// Split the gradient of Σ combined_loss into objective and variance parts.
///
/// `result` must be freshly computed from `params`; each part runs its own
/// backward pass over the same graph.
pub fn decompose_gradient<P: EstimatorParams>(
    params: &CombinedParams<P>,
    result: &AggregatedResult,
) -> Result<GradientDecomposition> {
    let dim = result.grad_variance.dims1()?;

    let objective_loss = (&result.mean_objective * dim as f64)?;
    let objective = CombinedGradient::from_grads(params, &objective_loss.backward()?)?;

    let variance_loss = result.grad_variance.sum_all()?;
    let variance = CombinedGradient::from_grads(params, &variance_loss.backward()?)?;

    Ok(GradientDecomposition {
        objective,
        variance,
    })
}
