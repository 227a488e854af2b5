use candle_core::{Result, Tensor};
use candle_nn::ops;

use super::noise::NoiseBatch;
use super::traits::{ControlVariate, GradientEstimator, PerSampleResult, StochasticObjective};

/// Configuration for the REBAR estimator.
#[derive(Debug, Clone)]
pub struct RebarConfig {
    /// Uniform noise is clamped to [eps, 1 - eps] before taking logits
    pub eps: f64,
}

impl Default for RebarConfig {
    fn default() -> Self {
        Self { eps: 1e-6 }
    }
}

/// Generalized REBAR gradient estimator for independent Bernoulli draws
/// with logits θ and a learned control variate c(z).
///
/// ```text
/// z  = θ + logit(u)                 b = H(z)
/// z~ = θ + logit(u~),  u~ ~ U | b   (conditional noise from v)
/// g  = [f(b) - c(z~)] ∇log p(b|θ) + ∇c(z) - ∇c(z~)
/// ```
///
/// `g` is unbiased for ∇E[f(b)] whatever the control variate.
#[derive(Debug, Clone)]
pub struct RebarEstimator<C> {
    pub config: RebarConfig,
    _control_variate: std::marker::PhantomData<C>,
}

impl<C> RebarEstimator<C> {
    pub fn new(config: RebarConfig) -> Self {
        Self {
            config,
            _control_variate: std::marker::PhantomData,
        }
    }
}

impl<C> Default for RebarEstimator<C> {
    fn default() -> Self {
        Self::new(RebarConfig::default())
    }
}

/// logit(x) = ln x - ln(1 - x)
fn logit(x: &Tensor) -> Result<Tensor> {
    x.log()? - x.affine(-1.0, 1.0)?.log()?
}

impl<C: ControlVariate> GradientEstimator for RebarEstimator<C> {
    type Params = C;

    fn estimate<F>(
        &self,
        theta_sd: &Tensor,
        control_variate: &C,
        noise: &NoiseBatch,
        objective: &F,
    ) -> Result<PerSampleResult>
    where
        F: StochasticObjective,
    {
        let (s, d) = theta_sd.dims2()?;
        if noise.u.dims() != [s, d] || noise.v.dims() != [s, d] {
            candle_core::bail!(
                "noise shape {:?}/{:?} does not match params {:?}",
                noise.u.dims(),
                noise.v.dims(),
                theta_sd.dims()
            );
        }

        let eps = self.config.eps;
        let u_sd = noise.u.to_dtype(theta_sd.dtype())?.clamp(eps, 1.0 - eps)?;
        let v_sd = noise.v.to_dtype(theta_sd.dtype())?.clamp(eps, 1.0 - eps)?;

        // 1. unconditional relaxed sample and its hard threshold
        let z_sd = (theta_sd + logit(&u_sd)?)?;
        let b_sd = z_sd.detach().gt(0.0)?.to_dtype(theta_sd.dtype())?;
        let not_b_sd = b_sd.affine(-1.0, 1.0)?;

        let p_sd = ops::sigmoid(theta_sd)?;
        let q_sd = p_sd.affine(-1.0, 1.0)?;

        // 2. conditional noise: u~ ∈ (1 - p, 1) if b = 1, (0, 1 - p) if b = 0
        let u_on = (&q_sd + v_sd.mul(&p_sd)?)?;
        let u_off = v_sd.mul(&q_sd)?;
        let u_cond_sd = (b_sd.mul(&u_on)? + not_b_sd.mul(&u_off)?)?.clamp(eps, 1.0 - eps)?;
        let z_cond_sd = (theta_sd + logit(&u_cond_sd)?)?;

        // dz~/dθ = 1 + (du~/dp) p (1 - p) / (u~ (1 - u~))
        let du_dp = (b_sd.mul(&(&v_sd - 1.0)?)? - not_b_sd.mul(&v_sd)?)?;
        let dlogit_du = u_cond_sd.mul(&u_cond_sd.affine(-1.0, 1.0)?)?.recip()?;
        let dz_cond_sd = (du_dp.mul(&p_sd.mul(&q_sd)?)?.mul(&dlogit_du)? + 1.0)?;

        // 3. black-box objective on the hard sample
        let f_s = objective.evaluate(&b_sd)?;
        let f_s = if f_s.rank() > 1 { f_s.sum(1)? } else { f_s };
        if f_s.dims() != [s] {
            candle_core::bail!("objective returned {:?}, expected [{}]", f_s.dims(), s);
        }
        let f_s = f_s.detach();

        // 4. control variate at both samples
        let (_, dc_z_sd) = control_variate.value_and_input_grad(&z_sd)?;
        let (c_cond_s, dc_cond_sd) = control_variate.value_and_input_grad(&z_cond_sd)?;

        // 5. g = [f(b) - c(z~)] (b - p) + dc(z)/dθ - dc(z~)/dθ
        let score_sd = (&b_sd - &p_sd)?;
        let reward_s = (&f_s - &c_cond_s)?;
        let grad_sd = ((reward_s.unsqueeze(1)?.broadcast_mul(&score_sd)? + dc_z_sd)?
            - dc_cond_sd.mul(&dz_cond_sd)?)?;

        // 6. value f(b), gradient w.r.t. θ equal to g
        let zero_sd = (theta_sd - theta_sd.detach())?;
        let objective_s = (grad_sd.detach().mul(&zero_sd)?.sum(1)? + &f_s)?;

        Ok(PerSampleResult {
            objective_s,
            grad_sd,
        })
    }
}
