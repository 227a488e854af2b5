use candle_core::{Result, Tensor};

use super::noise::NoiseBatch;
use super::params::{CombinedGradient, CombinedParams};

/// Stochastic objective evaluated on discrete draws.
pub trait StochasticObjective {
    /// Evaluate f(b) for every draw.
    ///
    /// # Arguments
    /// * `b_sd` - Binary draws, shape (S, D)
    ///
    /// # Returns
    /// Cost per draw, shape (S,), or (S, D) to be summed over the last axis
    fn evaluate(&self, b_sd: &Tensor) -> Result<Tensor>;
}

impl<F> StochasticObjective for F
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    fn evaluate(&self, b_sd: &Tensor) -> Result<Tensor> {
        self(b_sd)
    }
}

/// Trainable parameters owned by a gradient estimator.
///
/// The optimization core never looks inside; it only needs the tensors
/// (to read gradients off a `GradStore`) and a detached copy (for monitors).
pub trait EstimatorParams: Sized {
    /// Var-backed tensors, in a fixed order.
    fn tensors(&self) -> Vec<&Tensor>;

    /// Deep copy that shares no storage with the trainable vars.
    fn detached_copy(&self) -> Result<Self>;
}

/// Differentiable control variate c(z) over continuous logistic samples z.
pub trait ControlVariate: EstimatorParams {
    /// Evaluate c(z) and its gradient with respect to z.
    ///
    /// # Arguments
    /// * `z_sd` - Continuous samples, shape (S, D)
    ///
    /// # Returns
    /// `(c_s, dc_dz_sd)` with shapes (S,) and (S, D). Both must stay
    /// differentiable with respect to the control variate parameters.
    fn value_and_input_grad(&self, z_sd: &Tensor) -> Result<(Tensor, Tensor)>;
}

/// Per-sample output of a gradient estimator.
pub struct PerSampleResult {
    /// Objective value per draw, shape (S,)
    pub objective_s: Tensor,
    /// Gradient estimate per draw w.r.t. the model params, shape (S, D)
    pub grad_sd: Tensor,
}

/// Monte Carlo gradient estimator.
pub trait GradientEstimator {
    type Params: EstimatorParams;

    /// Run the estimator on a batch of draws.
    ///
    /// The returned objective values must carry the estimate as their gradient
    /// with respect to `params_rep_sd`: row `s` of `d sum(objective_s) / d params_rep_sd`
    /// equals row `s` of `grad_sd`. Both outputs must be differentiable with
    /// respect to `est_params`.
    ///
    /// # Arguments
    /// * `params_rep_sd` - Model params replicated per draw, shape (S, D)
    /// * `est_params` - Estimator parameters
    /// * `noise` - Uniform noise, each (S, D)
    /// * `objective` - Black-box objective over binary draws
    fn estimate<F>(
        &self,
        params_rep_sd: &Tensor,
        est_params: &Self::Params,
        noise: &NoiseBatch,
        objective: &F,
    ) -> Result<PerSampleResult>
    where
        F: StochasticObjective;
}

/// Read-only observer called by the trainer after an update.
pub trait Monitor<P> {
    /// * `params` - detached copy of the updated combined params
    /// * `iter` - iteration index that produced the update
    /// * `gradient` - raw joint gradient of that iteration
    fn observe(
        &mut self,
        params: CombinedParams<P>,
        iter: usize,
        gradient: &CombinedGradient,
    ) -> Result<()>;
}

impl<P, F> Monitor<P> for F
where
    F: FnMut(CombinedParams<P>, usize, &CombinedGradient) -> Result<()>,
{
    fn observe(
        &mut self,
        params: CombinedParams<P>,
        iter: usize,
        gradient: &CombinedGradient,
    ) -> Result<()> {
        self(params, iter, gradient)
    }
}
