use std::collections::HashSet;

use candle_core::{Result, TensorId, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{debug, info};

use super::aggregator::MonteCarloAggregator;
use super::params::{all_finite, CombinedGradient, CombinedParams};
use super::traits::{EstimatorParams, GradientEstimator, Monitor, StochasticObjective};

/// Training configuration for the joint loop.
#[derive(Debug, Clone)]
pub struct OptimConfig {
    /// Adam step size
    pub learning_rate: f64,
    /// Fixed number of iterations; there is no early stopping
    pub num_iters: usize,
    /// Call the monitor when `iter % monitor_every == 0`
    pub monitor_every: usize,
    pub show_progress: bool,
    pub verbose: bool,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            num_iters: 2000,
            monitor_every: 10,
            show_progress: false,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Initializing,
    Iterating,
    Terminated,
    /// A step returned an error; no further steps are allowed
    Failed,
}

/// Fixed-length Adam loop over (model params, estimator params).
///
/// Each iteration draws the noise of `iter`, computes the joint loss, runs
/// one backward pass and one optimizer step over every var, and then shows
/// a detached copy of the updated params to the monitor.
pub struct JointTrainer<'a, E, F>
where
    E: GradientEstimator,
    F: StochasticObjective,
{
    aggregator: &'a MonteCarloAggregator<E, F>,
    params: CombinedParams<E::Params>,
    optimizer: AdamW,
    config: OptimConfig,
    iter: usize,
    state: TrainerState,
}

impl<'a, E, F> JointTrainer<'a, E, F>
where
    E: GradientEstimator,
    F: StochasticObjective,
{
    /// * `aggregator` - noise, estimator and objective
    /// * `params` - initial combined params
    /// * `vars` - every trainable var behind `params` (e.g. `varmap.all_vars()`);
    ///   each tensor of `params` must be one of them
    /// * `config` - training configuration
    pub fn new(
        aggregator: &'a MonteCarloAggregator<E, F>,
        params: CombinedParams<E::Params>,
        vars: Vec<Var>,
        config: &OptimConfig,
    ) -> Result<Self> {
        if config.monitor_every == 0 {
            candle_core::bail!("monitor_every must be positive");
        }

        let var_ids: HashSet<TensorId> = vars.iter().map(|v| v.id()).collect();
        if !var_ids.contains(&params.model.id()) {
            candle_core::bail!("model params are not among the trainable vars");
        }
        for (i, x) in params.estimator.tensors().into_iter().enumerate() {
            if !var_ids.contains(&x.id()) {
                candle_core::bail!("estimator tensor {} is not among the trainable vars", i);
            }
        }

        let adam_params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        let optimizer = AdamW::new(vars, adam_params)?;

        Ok(Self {
            aggregator,
            params,
            optimizer,
            config: config.clone(),
            iter: 0,
            state: TrainerState::Initializing,
        })
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// Index of the next iteration to run
    pub fn iter(&self) -> usize {
        self.iter
    }

    pub fn params(&self) -> &CombinedParams<E::Params> {
        &self.params
    }

    pub fn into_params(self) -> CombinedParams<E::Params> {
        self.params
    }

    /// Run a single iteration.
    ///
    /// Returns the raw joint gradient used for the update. Any error,
    /// including a non-finite loss or gradient, moves the trainer to
    /// `Failed` and every later call is refused.
    pub fn step<M>(&mut self, monitor: &mut M) -> Result<CombinedGradient>
    where
        M: Monitor<E::Params>,
    {
        match self.state {
            TrainerState::Terminated => {
                candle_core::bail!("trainer already ran {} iterations", self.iter)
            }
            TrainerState::Failed => {
                candle_core::bail!("trainer failed at iteration {}", self.iter)
            }
            _ => {}
        }
        self.state = TrainerState::Iterating;

        let gradient = match self.try_step(monitor) {
            Ok(gradient) => gradient,
            Err(err) => {
                self.state = TrainerState::Failed;
                return Err(err);
            }
        };

        self.iter += 1;
        if self.iter >= self.config.num_iters {
            self.state = TrainerState::Terminated;
        }
        Ok(gradient)
    }

    fn try_step<M>(&mut self, monitor: &mut M) -> Result<CombinedGradient>
    where
        M: Monitor<E::Params>,
    {
        let t = self.iter;

        let loss = self.aggregator.combined_loss(&self.params, t)?.sum_all()?;
        if !all_finite(&loss)? {
            candle_core::bail!("non-finite joint loss at iteration {}", t);
        }

        let grads = loss.backward()?;
        let gradient = CombinedGradient::from_grads(&self.params, &grads)?;
        if !gradient.all_finite()? {
            candle_core::bail!("non-finite gradient at iteration {}", t);
        }

        self.optimizer.step(&grads)?;

        if t % self.config.monitor_every == 0 {
            monitor.observe(self.params.snapshot()?, t, &gradient)?;
        }
        Ok(gradient)
    }

    /// Run the remaining iterations.
    pub fn run<M>(&mut self, monitor: &mut M) -> Result<()>
    where
        M: Monitor<E::Params>,
    {
        let num_iters = self.config.num_iters;
        info!(
            "Optimizing {} iterations, {} samples x {} dimensions, lr = {}",
            num_iters,
            self.aggregator.num_samples(),
            self.aggregator.dim(),
            self.config.learning_rate
        );

        let pb = ProgressBar::new(num_iters as u64);
        if !self.config.show_progress || self.config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        while self.iter < num_iters {
            let gradient = self.step(monitor)?;
            pb.inc(1);

            if self.config.verbose {
                debug!(
                    "[{}] |grad model|² = {:.6}, |grad estimator|² = {:.6}",
                    self.iter,
                    gradient.model_sq_norm()?,
                    gradient.estimator_sq_norm()?
                );
            }
        }
        self.state = TrainerState::Terminated;

        pb.finish_and_clear();
        info!("Done after {} iterations", self.iter);
        Ok(())
    }
}
