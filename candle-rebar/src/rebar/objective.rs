use candle_core::{DType, Device, Result, Tensor};

use super::traits::StochasticObjective;

/// Squared distance between binary draws and evenly spaced targets.
///
/// f(b) = Σ_d (b_d - t_d)², t = linspace(0, 1, D)
///
/// The minimizer of E[f(b)] puts p_d = 1 where t_d > 0.5 and p_d = 0 where
/// t_d < 0.5, so the learned logits should split the dimensions in half.
#[derive(Debug, Clone)]
pub struct TargetMatchingObjective {
    target_d: Tensor,
}

impl TargetMatchingObjective {
    pub fn new(dim: usize, device: &Device) -> Result<Self> {
        let denom = if dim > 1 { (dim - 1) as f64 } else { 1.0 };
        let target_d = (Tensor::arange(0u32, dim as u32, device)?.to_dtype(DType::F32)? / denom)?;
        Ok(Self { target_d })
    }

    pub fn from_target(target_d: Tensor) -> Self {
        Self { target_d }
    }

    pub fn target(&self) -> &Tensor {
        &self.target_d
    }

    /// Exact E[f(b)] for independent b_d ~ Bernoulli(sigmoid(θ_d)).
    pub fn expected(&self, theta_d: &Tensor) -> Result<Tensor> {
        let p_d = candle_nn::ops::sigmoid(theta_d)?;
        let target_d = self.target_d.to_dtype(theta_d.dtype())?;
        let one_minus_t = target_d.affine(-1.0, 1.0)?;
        let on = p_d.mul(&one_minus_t.sqr()?)?;
        let off = p_d.affine(-1.0, 1.0)?.mul(&target_d.sqr()?)?;
        (on + off)?.sum_all()
    }
}

impl StochasticObjective for TargetMatchingObjective {
    fn evaluate(&self, b_sd: &Tensor) -> Result<Tensor> {
        // the target follows the dtype of the draws
        let target_d = self.target_d.to_dtype(b_sd.dtype())?;
        b_sd.broadcast_sub(&target_d)?.sqr()?.sum(1)
    }
}
