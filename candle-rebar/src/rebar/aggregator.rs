use candle_core::{DType, Result, Tensor};

use super::joint_loss::combined_loss;
use super::noise::{NoiseBatch, NoiseSource};
use super::params::CombinedParams;
use super::traits::{GradientEstimator, PerSampleResult, StochasticObjective};

/// Mean objective and per-dimension gradient variance of one noise batch.
#[derive(Debug, Clone)]
pub struct AggregatedResult {
    /// Mean over draws of the objective values, scalar
    pub mean_objective: Tensor,
    /// Population variance over draws of each gradient coordinate, shape (D,)
    pub grad_variance: Tensor,
}

impl AggregatedResult {
    pub fn mean_objective_value(&self) -> Result<f32> {
        self.mean_objective.to_dtype(DType::F32)?.to_scalar::<f32>()
    }
}

/// Population variance along the sample axis (divisor S, not S - 1).
///
/// # Arguments
/// * `x_sd` - Samples, shape (S, D)
///
/// # Returns
/// Variance per column, shape (D,)
pub fn population_variance(x_sd: &Tensor) -> Result<Tensor> {
    let mean_1d = x_sd.mean_keepdim(0)?;
    x_sd.broadcast_sub(&mean_1d)?.sqr()?.mean(0)
}

/// Reduce per-sample estimator output to (mean objective, gradient variance).
///
/// Nothing is detached: both outputs keep their dependence on the
/// parameters that produced `per_sample`.
pub fn aggregate(per_sample: &PerSampleResult) -> Result<AggregatedResult> {
    let mean_objective = per_sample.objective_s.mean(0)?;
    let grad_variance = population_variance(&per_sample.grad_sd)?;
    Ok(AggregatedResult {
        mean_objective,
        grad_variance,
    })
}

/// Drives a gradient estimator over the noise batch of an iteration.
pub struct MonteCarloAggregator<E, F> {
    pub estimator: E,
    pub objective: F,
    pub noise: NoiseSource,
}

impl<E, F> MonteCarloAggregator<E, F>
where
    E: GradientEstimator,
    F: StochasticObjective,
{
    pub fn new(estimator: E, objective: F, noise: NoiseSource) -> Self {
        Self {
            estimator,
            objective,
            noise,
        }
    }

    pub fn num_samples(&self) -> usize {
        self.noise.num_samples()
    }

    pub fn dim(&self) -> usize {
        self.noise.dim()
    }

    /// Run the estimator once, batched over all draws of iteration `iter`.
    pub fn per_sample(
        &self,
        params: &CombinedParams<E::Params>,
        iter: usize,
    ) -> Result<PerSampleResult> {
        let noise = self.noise.draw(iter)?;
        self.per_sample_with_noise(params, &noise)
    }

    pub fn per_sample_with_noise(
        &self,
        params: &CombinedParams<E::Params>,
        noise: &NoiseBatch,
    ) -> Result<PerSampleResult> {
        let dim = params.dim()?;
        if dim != self.dim() {
            candle_core::bail!(
                "model params have {} dimensions, noise source draws {}",
                dim,
                self.dim()
            );
        }

        let params_rep_sd = params.replicate_model(self.num_samples())?;
        self.estimator
            .estimate(&params_rep_sd, &params.estimator, noise, &self.objective)
    }

    /// Mean objective and gradient variance at iteration `iter`.
    pub fn objective_and_variance(
        &self,
        params: &CombinedParams<E::Params>,
        iter: usize,
    ) -> Result<AggregatedResult> {
        aggregate(&self.per_sample(params, iter)?)
    }

    /// Joint loss at iteration `iter`, shape (D,)
    pub fn combined_loss(&self, params: &CombinedParams<E::Params>, iter: usize) -> Result<Tensor> {
        combined_loss(&self.objective_and_variance(params, iter)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebar::{
        CombinedGradient, NeuralControlVariate, RebarEstimator, TargetMatchingObjective,
    };
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn test_mean_objective() -> Result<()> {
        let device = Device::Cpu;
        let per_sample = PerSampleResult {
            objective_s: Tensor::new(&[1f32, 2., 3.], &device)?,
            grad_sd: Tensor::zeros((3, 1), DType::F32, &device)?,
        };
        let agg = aggregate(&per_sample)?;
        assert_abs_diff_eq!(agg.mean_objective_value()?, 2.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_population_variance() -> Result<()> {
        let device = Device::Cpu;
        let per_sample = PerSampleResult {
            objective_s: Tensor::new(&[0f32, 0., 0.], &device)?,
            grad_sd: Tensor::new(&[[1f32], [2.], [3.]], &device)?,
        };
        let agg = aggregate(&per_sample)?;
        let var = agg.grad_variance.to_vec1::<f32>()?;
        assert_eq!(var.len(), 1);
        assert_abs_diff_eq!(var[0], 2.0 / 3.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_variance_per_dimension() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1f32, 5.], [3., 5.]], &device)?;
        let var = population_variance(&x)?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(var[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(var[1], 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_single_sample_zero_variance() -> Result<()> {
        let device = Device::Cpu;
        let dim = 4;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let params = CombinedParams::new(vb, dim, |vb| NeuralControlVariate::new(vb, dim, 3, 0.1))?;

        let aggregator = MonteCarloAggregator::new(
            RebarEstimator::<NeuralControlVariate>::default(),
            TargetMatchingObjective::new(dim, &device)?,
            NoiseSource::new(1, dim, &device),
        );

        let agg = aggregator.objective_and_variance(&params, 0)?;
        assert_eq!(agg.grad_variance.to_vec1::<f32>()?, vec![0f32; dim]);
        assert!(agg.mean_objective_value()?.is_finite());
        Ok(())
    }

    #[test]
    fn test_same_iteration_bit_identical() -> Result<()> {
        let device = Device::Cpu;
        let dim = 5;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let params = CombinedParams::new(vb, dim, |vb| NeuralControlVariate::new(vb, dim, 4, 0.1))?;

        let aggregator = MonteCarloAggregator::new(
            RebarEstimator::<NeuralControlVariate>::default(),
            TargetMatchingObjective::new(dim, &device)?,
            NoiseSource::new(8, dim, &device),
        );

        let first = aggregator.objective_and_variance(&params, 17)?;
        let second = aggregator.objective_and_variance(&params, 17)?;
        assert_eq!(
            first.mean_objective.to_scalar::<f32>()?,
            second.mean_objective.to_scalar::<f32>()?
        );
        assert_eq!(
            first.grad_variance.to_vec1::<f32>()?,
            second.grad_variance.to_vec1::<f32>()?
        );

        let g1 = CombinedGradient::from_grads(
            &params,
            &aggregator.combined_loss(&params, 17)?.sum_all()?.backward()?,
        )?;
        let g2 = CombinedGradient::from_grads(
            &params,
            &aggregator.combined_loss(&params, 17)?.sum_all()?.backward()?,
        )?;
        assert_eq!(g1.model.to_vec1::<f32>()?, g2.model.to_vec1::<f32>()?);
        for (a, b) in g1.estimator.iter().zip(g2.estimator.iter()) {
            assert_eq!(
                a.flatten_all()?.to_vec1::<f32>()?,
                b.flatten_all()?.to_vec1::<f32>()?
            );
        }
        Ok(())
    }

    #[test]
    fn test_dimension_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let params = CombinedParams::new(vb, 3, |vb| NeuralControlVariate::new(vb, 3, 2, 0.1))?;

        let aggregator = MonteCarloAggregator::new(
            RebarEstimator::<NeuralControlVariate>::default(),
            TargetMatchingObjective::new(4, &device)?,
            NoiseSource::new(5, 4, &device),
        );
        assert!(aggregator.objective_and_variance(&params, 0).is_err());
        Ok(())
    }

    #[test]
    fn test_double_precision_params() -> Result<()> {
        let device = Device::Cpu;
        let dim = 3;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
        let params = CombinedParams::new(vb, dim, |vb| NeuralControlVariate::new(vb, dim, 2, 0.1))?;

        let aggregator = MonteCarloAggregator::new(
            RebarEstimator::<NeuralControlVariate>::default(),
            TargetMatchingObjective::new(dim, &device)?,
            NoiseSource::new(6, dim, &device),
        );

        let agg = aggregator.objective_and_variance(&params, 2)?;
        assert_eq!(agg.grad_variance.dtype(), DType::F64);
        assert_abs_diff_eq!(
            agg.mean_objective_value()? as f64,
            agg.mean_objective.to_scalar::<f64>()?,
            epsilon = 1e-6
        );

        let loss = aggregator.combined_loss(&params, 2)?.sum_all()?;
        let gradient = CombinedGradient::from_grads(&params, &loss.backward()?)?;
        assert!(gradient.all_finite()?);
        assert!(gradient.model_sq_norm()? > 0.0);
        Ok(())
    }
}
