use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Uniform;

/// Two independent uniform[0, 1) matrices for one iteration.
#[derive(Debug, Clone)]
pub struct NoiseBatch {
    /// Noise for the unconditional sample, shape (S, D)
    pub u: Tensor,
    /// Noise for the conditional sample, shape (S, D)
    pub v: Tensor,
}

/// Noise source seeded by the iteration index.
///
/// Every call to `draw(t)` builds a fresh generator from `t`, so the
/// optimizer step and any monitor recomputation at the same `t` see
/// bit-identical noise.
#[derive(Debug, Clone)]
pub struct NoiseSource {
    num_samples: usize,
    dim: usize,
    device: Device,
}

impl NoiseSource {
    pub fn new(num_samples: usize, dim: usize, device: &Device) -> Self {
        Self {
            num_samples,
            dim,
            device: device.clone(),
        }
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Draw the noise batch of iteration `iter`: `u` first, then `v`.
    pub fn draw(&self, iter: usize) -> Result<NoiseBatch> {
        let mut rng = StdRng::seed_from_u64(iter as u64);
        let unif = Uniform::new(0f32, 1f32).map_err(candle_core::Error::wrap)?;
        let n = self.num_samples * self.dim;
        let shape = (self.num_samples, self.dim);

        let u_data: Vec<f32> = (0..n).map(|_| rng.sample(unif)).collect();
        let v_data: Vec<f32> = (0..n).map(|_| rng.sample(unif)).collect();

        Ok(NoiseBatch {
            u: Tensor::from_vec(u_data, shape, &self.device)?,
            v: Tensor::from_vec(v_data, shape, &self.device)?,
        })
    }
}
