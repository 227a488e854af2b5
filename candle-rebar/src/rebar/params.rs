use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;

use super::traits::EstimatorParams;

/// Model params and estimator params, updated together.
#[derive(Debug, Clone)]
pub struct CombinedParams<P> {
    /// Model logits θ, shape (D,)
    pub model: Tensor,
    /// Control variate parameters
    pub estimator: P,
}

impl<P: EstimatorParams> CombinedParams<P> {
    /// Create zero-initialized model params next to an estimator built by
    /// `init_estimator`.
    ///
    /// # Arguments
    /// * `vb` - VarBuilder for creating trainable parameters
    /// * `dim` - Model dimension D
    /// * `init_estimator` - Builds the estimator params from `vb.pp("estimator")`
    pub fn new<I>(vb: VarBuilder, dim: usize, init_estimator: I) -> Result<Self>
    where
        I: FnOnce(VarBuilder) -> Result<P>,
    {
        let model = vb
            .pp("model")
            .get_with_hints(dim, "theta", candle_nn::Init::Const(0.0))?;
        let estimator = init_estimator(vb.pp("estimator"))?;
        Ok(Self { model, estimator })
    }

    pub fn from_parts(model: Tensor, estimator: P) -> Self {
        Self { model, estimator }
    }

    pub fn dim(&self) -> Result<usize> {
        self.model.dims1()
    }

    /// Deep copy of both halves; later optimizer steps do not show through.
    pub fn snapshot(&self) -> Result<Self> {
        Ok(Self {
            model: self.model.detach().copy()?,
            estimator: self.estimator.detached_copy()?,
        })
    }

    /// Model params replicated once per Monte Carlo draw, shape (S, D)
    pub fn replicate_model(&self, num_samples: usize) -> Result<Tensor> {
        let dim = self.dim()?;
        self.model
            .unsqueeze(0)?
            .broadcast_as((num_samples, dim))?
            .contiguous()
    }
}

/// Gradient of a scalar loss, split by parameter group.
#[derive(Debug, Clone)]
pub struct CombinedGradient {
    /// Gradient w.r.t. the model params, shape (D,)
    pub model: Tensor,
    /// Gradients w.r.t. the estimator tensors, same order as `EstimatorParams::tensors`
    pub estimator: Vec<Tensor>,
}

impl CombinedGradient {
    /// Pull the gradients of `params` out of `grads`.
    ///
    /// A tensor the loss does not depend on gets an explicit zero gradient.
    pub fn from_grads<P: EstimatorParams>(
        params: &CombinedParams<P>,
        grads: &GradStore,
    ) -> Result<Self> {
        let take = |x: &Tensor| -> Result<Tensor> {
            match grads.get(x) {
                Some(g) => g.copy(),
                None => x.zeros_like(),
            }
        };

        let model = take(&params.model)?;
        let estimator = params
            .estimator
            .tensors()
            .into_iter()
            .map(take)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { model, estimator })
    }

    /// Σ over the estimator tensors of the squared L2 norm
    pub fn estimator_sq_norm(&self) -> Result<f32> {
        let mut tot = 0f32;
        for g in self.estimator.iter() {
            tot += g.sqr()?.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        }
        Ok(tot)
    }

    pub fn model_sq_norm(&self) -> Result<f32> {
        self.model
            .sqr()?
            .sum_all()?
            .to_dtype(DType::F32)?
            .to_scalar::<f32>()
    }

    pub fn all_finite(&self) -> Result<bool> {
        if !all_finite(&self.model)? {
            return Ok(false);
        }
        for g in self.estimator.iter() {
            if !all_finite(g)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Check that no element is NaN or infinite.
pub fn all_finite(x: &Tensor) -> Result<bool> {
    let vals = x.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    Ok(vals.iter().all(|v| v.is_finite()))
}
