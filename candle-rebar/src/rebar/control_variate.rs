use candle_core::{Result, Tensor};
use candle_nn::{ops, VarBuilder};

use super::traits::{ControlVariate, EstimatorParams};

/// One-hidden-layer control variate over a relaxed Bernoulli sample.
///
/// ```text
/// λ = exp(log_temperature)
/// ζ = sigmoid(z / λ)
/// c(z) = w2 · tanh(W1 ζ + b1) + b2
/// ```
///
/// The input gradient dc/dz is returned in closed form so that the
/// estimator built on top stays a plain tensor expression of (W1, b1, w2,
/// b2, λ), differentiable by one backward pass.
#[derive(Debug, Clone)]
pub struct NeuralControlVariate {
    /// Hidden weights W1, shape (H, D)
    w1_hd: Tensor,
    /// Hidden bias b1, shape (H,)
    b1_h: Tensor,
    /// Output weights w2, shape (H,)
    w2_h: Tensor,
    /// Output bias b2, shape (1,)
    b2: Tensor,
    /// ln λ of the relaxation, shape (1,)
    log_temperature: Tensor,
}

impl NeuralControlVariate {
    /// Create a control variate with all weights and biases drawn from
    /// N(0, init_scale²) and temperature λ = 1.
    ///
    /// # Arguments
    /// * `vb` - VarBuilder for creating trainable parameters
    /// * `dim` - Input dimension D
    /// * `num_hidden` - Hidden units H
    /// * `init_scale` - Standard deviation of the initial weights
    pub fn new(vb: VarBuilder, dim: usize, num_hidden: usize, init_scale: f64) -> Result<Self> {
        let init_ws = candle_nn::Init::Randn {
            mean: 0.0,
            stdev: init_scale,
        };
        let w1_hd = vb.get_with_hints((num_hidden, dim), "hidden.weight", init_ws)?;
        let b1_h = vb.get_with_hints(num_hidden, "hidden.bias", init_ws)?;
        let w2_h = vb.get_with_hints(num_hidden, "out.weight", init_ws)?;
        let b2 = vb.get_with_hints(1, "out.bias", init_ws)?;
        let log_temperature =
            vb.get_with_hints(1, "log_temperature", candle_nn::Init::Const(0.0))?;

        Ok(Self {
            w1_hd,
            b1_h,
            w2_h,
            b2,
            log_temperature,
        })
    }

    pub fn dim(&self) -> usize {
        self.w1_hd.dims()[1]
    }

    pub fn num_hidden(&self) -> usize {
        self.w1_hd.dims()[0]
    }

    /// Relaxation temperature λ, shape (1,)
    pub fn temperature(&self) -> Result<Tensor> {
        self.log_temperature.exp()
    }
}

impl EstimatorParams for NeuralControlVariate {
    fn tensors(&self) -> Vec<&Tensor> {
        vec![
            &self.w1_hd,
            &self.b1_h,
            &self.w2_h,
            &self.b2,
            &self.log_temperature,
        ]
    }

    fn detached_copy(&self) -> Result<Self> {
        Ok(Self {
            w1_hd: self.w1_hd.detach().copy()?,
            b1_h: self.b1_h.detach().copy()?,
            w2_h: self.w2_h.detach().copy()?,
            b2: self.b2.detach().copy()?,
            log_temperature: self.log_temperature.detach().copy()?,
        })
    }
}

impl ControlVariate for NeuralControlVariate {
    fn value_and_input_grad(&self, z_sd: &Tensor) -> Result<(Tensor, Tensor)> {
        let lambda = self.temperature()?;
        let zeta_sd = ops::sigmoid(&z_sd.broadcast_div(&lambda)?)?;

        let h_sh = zeta_sd
            .matmul(&self.w1_hd.t()?)?
            .broadcast_add(&self.b1_h)?
            .tanh()?;

        let c_s = h_sh
            .broadcast_mul(&self.w2_h)?
            .sum(1)?
            .broadcast_add(&self.b2)?;

        // dc/dζ = W1ᵀ ((1 - h²) ⊙ w2)
        let dh_sh = h_sh.sqr()?.affine(-1.0, 1.0)?.broadcast_mul(&self.w2_h)?;
        let dzeta_sd = dh_sh.matmul(&self.w1_hd)?;

        // dζ/dz = ζ (1 - ζ) / λ
        let dzeta_dz = zeta_sd.mul(&zeta_sd.affine(-1.0, 1.0)?)?;
        let dc_dz_sd = dzeta_sd.mul(&dzeta_dz)?.broadcast_div(&lambda)?;

        Ok((c_s, dc_dz_sd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    #[test]
    fn test_shapes() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);

        let (s, d, h) = (7, 5, 3);
        let cv = NeuralControlVariate::new(vb, d, h, 0.1)?;
        assert_eq!(cv.dim(), d);
        assert_eq!(cv.num_hidden(), h);

        let z = Tensor::randn(0f32, 1f32, (s, d), &Device::Cpu)?;
        let (c, dc) = cv.value_and_input_grad(&z)?;

        assert_eq!(c.dims(), &[s]);
        assert_eq!(dc.dims(), &[s, d]);
        assert_eq!(cv.tensors().len(), 5);
        Ok(())
    }

    #[test]
    fn test_input_grad_matches_autodiff() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        // larger weights so the gradient is not trivially small
        let cv = NeuralControlVariate::new(vb, 4, 6, 1.0)?;

        let z = Var::from_tensor(&Tensor::randn(0f32, 2f32, (3, 4), &device)?)?;
        let (c, dc) = cv.value_and_input_grad(z.as_tensor())?;

        let grads = c.sum_all()?.backward()?;
        let dc_auto = grads.get(z.as_tensor()).expect("gradient w.r.t. z");

        let dc = dc.flatten_all()?.to_vec1::<f32>()?;
        let dc_auto = dc_auto.flatten_all()?.to_vec1::<f32>()?;
        for (a, b) in dc.iter().zip(dc_auto.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_input_grad_depends_on_weights() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cv = NeuralControlVariate::new(vb, 3, 4, 0.5)?;

        let z = Tensor::randn(0f32, 1f32, (5, 3), &device)?;
        let (_, dc) = cv.value_and_input_grad(&z)?;

        // b2 only shifts c(z); everything else shapes dc/dz
        let grads = dc.sqr()?.sum_all()?.backward()?;
        assert!(grads.get(&cv.w1_hd).is_some());
        assert!(grads.get(&cv.b1_h).is_some());
        assert!(grads.get(&cv.w2_h).is_some());
        assert!(grads.get(&cv.log_temperature).is_some());
        Ok(())
    }
}
