//! Joint optimization of a model and its gradient-estimator control variate.
//!
//! A REBAR-style estimator produces per-sample gradients for a discrete
//! (Bernoulli) stochastic objective. The control variate inside the estimator
//! is trained online to minimize the variance of those gradients, while the
//! model parameters are trained to minimize the objective itself.
//!
//! # Key characteristics
//!
//! - Noise is drawn per iteration from a generator seeded by the iteration index
//! - Per-sample gradients are closed-form tensor expressions, so their
//!   variance is differentiable by a single backward pass
//! - Joint loss: `mean_s f(b_s) + Var_s[g_s]` (length D, not reduced)
//! - One `backward` and one optimizer step update both parameter groups
//!
//! # Example
//!
//! ```ignore
//! use candle_rebar::rebar::*;
//!
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
//! let params = CombinedParams::new(vb.clone(), dim, |vb| {
//!     NeuralControlVariate::new(vb, dim, num_hidden, 0.1)
//! })?;
//!
//! let aggregator = MonteCarloAggregator::new(
//!     RebarEstimator::default(),
//!     TargetMatchingObjective::new(dim, &device)?,
//!     NoiseSource::new(num_samples, dim, &device),
//! );
//!
//! let mut trainer = JointTrainer::new(&aggregator, params, varmap.all_vars(), &config)?;
//! let mut monitor = ObjectiveMonitor::new(&aggregator);
//! trainer.run(&mut monitor)?;
//! ```

mod aggregator;
mod control_variate;
mod estimator;
mod joint_loss;
mod monitor;
mod noise;
mod objective;
mod params;
mod traits;
mod trainer;

pub use aggregator::{aggregate, population_variance, AggregatedResult, MonteCarloAggregator};
pub use control_variate::NeuralControlVariate;
pub use estimator::{RebarConfig, RebarEstimator};
pub use joint_loss::{combined_loss, decompose_gradient, GradientDecomposition};
pub use monitor::ObjectiveMonitor;
pub use noise::{NoiseBatch, NoiseSource};
pub use objective::TargetMatchingObjective;
pub use params::{all_finite, CombinedGradient, CombinedParams};
pub use traits::{
    ControlVariate, EstimatorParams, GradientEstimator, Monitor, PerSampleResult,
    StochasticObjective,
};
pub use trainer::{JointTrainer, OptimConfig, TrainerState};
