use std::io::Write;

use candle_core::{DType, Result, Tensor};
use candle_nn::ops;
use log::debug;

use super::aggregator::MonteCarloAggregator;
use super::params::{CombinedGradient, CombinedParams};
use super::traits::{GradientEstimator, Monitor, StochasticObjective};

/// Writes `Iteration <t> objective <value>` for every observed iteration,
/// to stdout unless another writer is given.
///
/// The objective is recomputed on the detached params it receives with the
/// noise of the same iteration, so the printed value matches what the
/// optimizer saw up to the update that was just applied.
pub struct ObjectiveMonitor<'a, E, F> {
    aggregator: &'a MonteCarloAggregator<E, F>,
    history: Vec<(usize, f32)>,
    out: Box<dyn Write + 'a>,
}

impl<'a, E, F> ObjectiveMonitor<'a, E, F>
where
    E: GradientEstimator,
    F: StochasticObjective,
{
    pub fn new(aggregator: &'a MonteCarloAggregator<E, F>) -> Self {
        Self::with_writer(aggregator, Box::new(std::io::stdout()))
    }

    /// Record without printing anything
    pub fn quiet(aggregator: &'a MonteCarloAggregator<E, F>) -> Self {
        Self::with_writer(aggregator, Box::new(std::io::sink()))
    }

    pub fn with_writer(
        aggregator: &'a MonteCarloAggregator<E, F>,
        out: Box<dyn Write + 'a>,
    ) -> Self {
        Self {
            aggregator,
            history: vec![],
            out,
        }
    }

    /// (iteration, mean objective) of every observed iteration
    pub fn history(&self) -> &[(usize, f32)] {
        &self.history
    }
}

/// (mean, min, max) over all elements
fn summary(x: &Tensor) -> Result<(f32, f32, f32)> {
    let x = x.flatten_all()?.to_dtype(DType::F32)?;
    let mean = x.mean_all()?.to_scalar::<f32>()?;
    let min = x.min(0)?.to_scalar::<f32>()?;
    let max = x.max(0)?.to_scalar::<f32>()?;
    Ok((mean, min, max))
}

impl<E, F> Monitor<E::Params> for ObjectiveMonitor<'_, E, F>
where
    E: GradientEstimator,
    F: StochasticObjective,
{
    fn observe(
        &mut self,
        params: CombinedParams<E::Params>,
        iter: usize,
        gradient: &CombinedGradient,
    ) -> Result<()> {
        let result = self.aggregator.objective_and_variance(&params, iter)?;
        let objective = result.mean_objective_value()?;
        self.history.push((iter, objective));

        writeln!(self.out, "Iteration {} objective {}", iter, objective)?;

        let (p_mean, p_min, p_max) = summary(&ops::sigmoid(&params.model)?)?;
        let (g_mean, g_min, g_max) = summary(&gradient.model)?;
        let (v_mean, _, v_max) = summary(&result.grad_variance)?;
        debug!(
            "[{}] sigmoid(θ) mean {:.4} [{:.4}, {:.4}], grad mean {:.4} [{:.4}, {:.4}], grad var mean {:.4} max {:.4}",
            iter, p_mean, p_min, p_max, g_mean, g_min, g_max, v_mean, v_max
        );
        Ok(())
    }
}
