use ndarray::{Array2, ArrayView2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use serde::{Serialize, Deserialize};

/// Residual modulation block used by the leap-net architecture.
///
/// The input latent `h` is projected into a tau-sized space, gated
/// element-wise by the tau vector, decoded back and added to `h`:
///
///   y = h + D(tau * E(h))
///
/// Tau carries the discrete structure variables (line status, topology).
/// Tau itself receives no gradient, only E and D are trained.
#[derive(Serialize, Deserialize, Clone)]
pub struct LtauLayer {
    pub e_weights: Array2<f32>,
    pub d_weights: Array2<f32>,
    inputs: Option<Array2<f32>>,
    taus: Option<Array2<f32>>,
    modulated: Option<Array2<f32>>,
}

/// Gradients for the leap block, including the gradient flowing back into the latent.
pub struct LtauGradients {
    pub d_e: Array2<f32>,
    pub d_d: Array2<f32>,
    pub d_input: Array2<f32>,
}

impl LtauLayer {
    pub fn new(dim: usize, tau_dim: usize) -> Self {
        let scale = (1.0 / (dim + tau_dim) as f32).sqrt();
        LtauLayer {
            e_weights: Array2::random((dim, tau_dim), Uniform::new(-scale, scale)),
            d_weights: Array2::random((tau_dim, dim), Uniform::new(-scale, scale)),
            inputs: None,
            taus: None,
            modulated: None,
        }
    }

    /// Latent dimension the block preserves.
    pub fn dim(&self) -> usize {
        self.e_weights.shape()[0]
    }

    pub fn tau_dim(&self) -> usize {
        self.e_weights.shape()[1]
    }

    /// Forward pass for a batch of latents with their per-sample tau vectors.
    pub fn forward_batch(&mut self, inputs: ArrayView2<f32>, taus: ArrayView2<f32>) -> Array2<f32> {
        let encoded = inputs.dot(&self.e_weights);
        let modulated = &encoded * &taus;
        let outputs = &inputs + &modulated.dot(&self.d_weights);

        self.inputs = Some(inputs.to_owned());
        self.taus = Some(taus.to_owned());
        self.modulated = Some(modulated);
        outputs
    }

    /// Backward pass given the gradient at the block output.
    pub fn backward_batch(&self, output_grads: ArrayView2<f32>) -> LtauGradients {
        let inputs = self.inputs.as_ref()
            .expect("No inputs stored. forward_batch() must be called before backward_batch()");
        let taus = self.taus.as_ref()
            .expect("No taus stored. forward_batch() must be called before backward_batch()");
        let modulated = self.modulated.as_ref()
            .expect("No modulation stored. forward_batch() must be called before backward_batch()");

        let d_d = modulated.t().dot(&output_grads);
        let d_modulated = output_grads.dot(&self.d_weights.t());
        let d_encoded = &d_modulated * taus;
        let d_e = inputs.t().dot(&d_encoded);
        let d_input = &output_grads + &d_encoded.dot(&self.e_weights.t());

        LtauGradients { d_e, d_d, d_input }
    }
}
