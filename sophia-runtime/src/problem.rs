use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2, Axis, Ix1, Ix2};
use rand::{rngs::StdRng, Rng};
use sophia_optim::{Parameter, Tensor};
use statrs::function::erf::erf_inv;

/// Gaussian sample through the inverse error function.
pub fn normal_sample<R: Rng>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    let u = rng.gen_range(f64::EPSILON..1.0);
    mean + std_dev * (2.0_f64).sqrt() * erf_inv(2.0 * u - 1.0)
}

/// `targets = inputs · Wᵀ + b + noise` with a hidden `W` and `b`.
///
/// The model is a weight matrix of shape `[outputs, features]` (parameter 0)
/// and a bias of shape `[outputs]` (parameter 1), trained on mean squared
/// error over the full dataset.
#[derive(Debug, Clone)]
pub struct Regression {
    pub inputs: Array2<f32>,
    pub targets: Array2<f32>,
    pub noise_std: f64,
}

impl Regression {
    pub fn generate(
        rng: &mut StdRng,
        num_samples: usize,
        num_features: usize,
        num_outputs: usize,
        noise_std: f64,
    ) -> Self {
        let weight = Array2::from_shape_fn((num_outputs, num_features), |_| {
            normal_sample(rng, 0.0, 1.0) as f32
        });
        let bias = Array1::from_shape_fn(num_outputs, |_| normal_sample(rng, 0.0, 1.0) as f32);
        let inputs = Array2::from_shape_fn((num_samples, num_features), |_| {
            rng.gen_range(-1.0f32..1.0)
        });
        let mut targets = inputs.dot(&weight.t()) + &bias;
        targets.mapv_inplace(|y| y + normal_sample(rng, 0.0, noise_std) as f32);
        Self {
            inputs,
            targets,
            noise_std,
        }
    }

    pub fn num_features(&self) -> usize {
        self.inputs.ncols()
    }

    pub fn num_outputs(&self) -> usize {
        self.targets.ncols()
    }

    /// Zero-initialized weight and bias.
    pub fn init_params(&self) -> Vec<Parameter> {
        vec![
            Parameter::new(Tensor::from(
                Array2::<f32>::zeros((self.num_outputs(), self.num_features())).into_dyn(),
            )),
            Parameter::new(Tensor::from(Array1::<f32>::zeros(self.num_outputs()).into_dyn())),
        ]
    }

    pub fn predict(&self, params: &[Parameter]) -> Result<Array2<f32>> {
        let (weight, bias) = unpack(params)?;
        if weight.dim() != (self.num_outputs(), self.num_features()) || bias.len() != self.num_outputs() {
            return Err(anyhow!(
                "Model of shape {:?} + {:?} does not fit {} features and {} outputs",
                weight.dim(),
                bias.len(),
                self.num_features(),
                self.num_outputs()
            ));
        }
        Ok(self.inputs.dot(&weight.t()) + &bias)
    }

    /// Mean squared error against `targets`; writes the gradients into `params`.
    pub fn loss_and_grads(&self, params: &mut [Parameter], targets: &Array2<f32>) -> Result<f32> {
        let residual = self.predict(params)? - targets;
        let scale = 2.0 / residual.len() as f32;
        let grad_weight = residual.t().dot(&self.inputs) * scale;
        let grad_bias = residual.sum_axis(Axis(0)) * scale;
        let loss = residual.mapv(|r| r * r).mean().unwrap_or(0.0);

        params[0].set_grad(Tensor::from(grad_weight.into_dyn()));
        params[1].set_grad(Tensor::from(grad_bias.into_dyn()));
        Ok(loss)
    }

    /// Targets drawn from the model's own predictive distribution. Gradients
    /// against them give an unbiased Gauss-Newton curvature sample.
    pub fn sampled_targets(&self, params: &[Parameter], rng: &mut StdRng) -> Result<Array2<f32>> {
        let std_dev = self.noise_std.max(1e-3);
        let mut sampled = self.predict(params)?;
        sampled.mapv_inplace(|y| y + normal_sample(rng, 0.0, std_dev) as f32);
        Ok(sampled)
    }
}

fn unpack(params: &[Parameter]) -> Result<(Array2<f32>, Array1<f32>)> {
    match params {
        [weight, bias] => Ok((
            weight.data.real_view().into_dimensionality::<Ix2>()?.to_owned(),
            bias.data.real_view().into_dimensionality::<Ix1>()?.to_owned(),
        )),
        _ => Err(anyhow!("Expected weight and bias, got {} parameters", params.len())),
    }
}
