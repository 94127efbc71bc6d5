use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use serde::{Serialize, Deserialize};
use crate::activations::Activation;

/// A fully connected (dense) layer in a neural network
#[derive(Serialize, Deserialize, Clone)]
pub struct DenseLayer {
    pub weights: Array2<f32>,
    pub biases: Array1<f32>,
    pub activation: Activation,
    pre_activation_output: Option<Array2<f32>>,
    inputs: Option<Array2<f32>>,
}

impl DenseLayer {
    /// Create a new dense layer with the given input size, output size, and activation function.
    /// The weights are initialized with random values from a uniform distribution
    /// between -0.1 and 0.1. The biases are initialized with zeros.
    pub fn new(input_size: usize, output_size: usize, activation: Activation) -> Self {
        let weights = Array2::random((input_size, output_size), Uniform::new(-0.1, 0.1));
        let biases = Array1::zeros(output_size);
        DenseLayer {
            weights,
            biases,
            activation,
            pre_activation_output: None,
            inputs: None,
        }
    }

    pub fn with_weights(mut self, weights: Array2<f32>) -> Self {
        assert_eq!(weights.dim(), (self.weights.dim().0, self.weights.dim().1));
        self.weights = weights;
        self
    }

    pub fn with_biases(mut self, biases: Array1<f32>) -> Self {
        assert_eq!(biases.dim(), self.biases.dim());
        self.biases = biases;
        self
    }

    /// Perform a forward pass for a batch of input vectors.
    /// Stores the inputs and pre-activation outputs for the backward pass.
    pub fn forward_batch(&mut self, inputs: ArrayView2<f32>) -> Array2<f32> {
        self.inputs = Some(inputs.to_owned());
        let mut outputs = inputs.dot(&self.weights) + &self.biases.to_owned().insert_axis(Axis(0));
        self.pre_activation_output = Some(outputs.clone());
        self.activation.apply_batch(&mut outputs);
        outputs
    }

    /// Compute gradients for the layer's weights and biases for a batch of output errors.
    /// Returns the activation-adjusted error (needed to propagate into the layer below),
    /// the weight gradients, and the bias gradients.
    pub fn backward_batch(&self, output_errors: ArrayView2<f32>) -> (Array2<f32>, Array2<f32>, Array1<f32>) {
        let pre_activation_output = self.pre_activation_output.as_ref()
            .expect("No pre-activation output stored. forward_batch() must be called before backward_batch()");
        let inputs = self.inputs.as_ref()
            .expect("No inputs stored. forward_batch() must be called before backward_batch()");

        let activation_deriv = self.activation.derivative_batch(pre_activation_output.view());
        let adjusted_error = output_errors.to_owned() * &activation_deriv;
        let weight_gradients = inputs.t().dot(&adjusted_error);
        let bias_gradients = adjusted_error.sum_axis(Axis(0));

        (adjusted_error, weight_gradients, bias_gradients)
    }

    pub fn output_size(&self) -> usize {
        self.weights.shape()[1]
    }

    pub fn input_size(&self) -> usize {
        self.weights.shape()[0]
    }
}

/// Shorthand alias used by the layer construction macros.
pub type Layer = DenseLayer;

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_forward_batch_known_values() {
        let mut layer = DenseLayer::new(2, 2, Activation::Linear)
            .with_weights(array![[1.0, 0.0], [0.0, 2.0]])
            .with_biases(array![0.5, -0.5]);
        let out = layer.forward_batch(array![[1.0, 1.0], [2.0, 3.0]].view());
        assert_eq!(out, array![[1.5, 1.5], [2.5, 5.5]]);
    }

    #[test]
    fn test_backward_batch_gradients() {
        let mut layer = DenseLayer::new(2, 1, Activation::Linear)
            .with_weights(array![[1.0], [1.0]])
            .with_biases(array![0.0]);
        let _ = layer.forward_batch(array![[1.0, 2.0]].view());
        let (adjusted, w_grad, b_grad) = layer.backward_batch(array![[2.0]].view());
        // linear activation passes the error through unchanged
        assert_eq!(adjusted, array![[2.0]]);
        assert_eq!(w_grad, array![[2.0], [4.0]]);
        assert_eq!(b_grad, array![2.0]);
    }

    #[test]
    fn test_relu_blocks_gradient_for_negative_preactivation() {
        let mut layer = DenseLayer::new(1, 1, Activation::Relu)
            .with_weights(array![[-1.0]])
            .with_biases(array![0.0]);
        let out = layer.forward_batch(array![[3.0]].view());
        assert_eq!(out, array![[0.0]]);
        let (adjusted, _, _) = layer.backward_batch(array![[1.0]].view());
        assert_eq!(adjusted, array![[0.0]]);
    }
}
