use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::{ops, VarBuilder, VarMap};
use clap::Args;
use log::info;

use crate::rebar::{
    CombinedParams, JointTrainer, MonteCarloAggregator, NeuralControlVariate, NoiseSource,
    ObjectiveMonitor, OptimConfig, RebarEstimator, TargetMatchingObjective,
};

#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    #[arg(long, default_value = "100", help = "Number of Bernoulli logits (D)")]
    pub dim: usize,

    #[arg(long, default_value = "100", help = "Hidden units of the control variate")]
    pub hidden: usize,

    #[arg(long, default_value = "50", help = "Monte Carlo draws per iteration")]
    pub samples: usize,

    #[arg(long, default_value = "0.1")]
    pub lr: f64,

    #[arg(long, default_value = "2000")]
    pub iters: usize,

    #[arg(long, default_value = "10", help = "Report every N iterations")]
    pub every: usize,

    #[arg(long, default_value = "0.1", help = "Std of the initial control variate weights")]
    pub init_scale: f64,

    #[arg(long)]
    pub gpu: bool,

    #[arg(long)]
    pub progress: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

impl Default for DemoArgs {
    fn default() -> Self {
        Self {
            dim: 100,
            hidden: 100,
            samples: 50,
            lr: 0.1,
            iters: 2000,
            every: 10,
            init_scale: 0.1,
            gpu: false,
            progress: false,
            verbose: false,
        }
    }
}

impl DemoArgs {
    pub fn optim_config(&self) -> OptimConfig {
        OptimConfig {
            learning_rate: self.lr,
            num_iters: self.iters,
            monitor_every: self.every,
            show_progress: self.progress,
            verbose: self.verbose,
        }
    }
}

/// Fit logits to `linspace(0, 1, D)` targets with a jointly trained control variate.
pub fn run(args: &DemoArgs) -> Result<()> {
    let device = if args.gpu {
        #[cfg(target_os = "macos")]
        { Device::new_metal(0).unwrap_or(Device::Cpu) }
        #[cfg(target_os = "linux")]
        { Device::new_cuda(0).unwrap_or(Device::Cpu) }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        { Device::Cpu }
    } else {
        Device::Cpu
    };
    info!("Using device: {:?}", device);

    if args.dim == 0 || args.samples == 0 {
        anyhow::bail!("need at least one dimension and one sample");
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

    let params = CombinedParams::new(vb, args.dim, |vb| {
        NeuralControlVariate::new(vb, args.dim, args.hidden, args.init_scale)
    })?;
    info!(
        "Model: {} logits, control variate: {} hidden units",
        args.dim, args.hidden
    );

    let objective = TargetMatchingObjective::new(args.dim, &device)?;
    let target = objective.target().clone();

    let aggregator = MonteCarloAggregator::new(
        RebarEstimator::<NeuralControlVariate>::default(),
        objective,
        NoiseSource::new(args.samples, args.dim, &device),
    );

    // Create optimizer AFTER params are created so varmap contains all variables
    let config = args.optim_config();
    let mut trainer = JointTrainer::new(&aggregator, params, varmap.all_vars(), &config)?;
    let mut monitor = ObjectiveMonitor::new(&aggregator);

    println!("Optimizing...");
    trainer.run(&mut monitor)?;

    let params = trainer.into_params();
    let probs = ops::sigmoid(&params.model)?;
    let gap = probs
        .sub(&target)?
        .abs()?
        .mean_all()?
        .to_scalar::<f32>()?;
    let exact = aggregator.objective.expected(&params.model)?.to_scalar::<f32>()?;
    info!(
        "Final mean |sigmoid(θ) - target| = {:.4}, E[f(b)] = {:.4}, temperature = {:.4}",
        gap,
        exact,
        params.estimator.temperature()?.to_vec1::<f32>()?[0]
    );

    Ok(())
}
