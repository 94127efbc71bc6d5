use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Serialize, Deserialize};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use bincode::{serialize, deserialize};

use crate::activations::Activation;
use crate::error::Result;
use crate::layers::DenseLayer;
use crate::optimizer::{Optimizer, OptimizerWrapper};

/// A feed-forward neural network: a stack of dense layers plus the optimizer
/// that updates them.
///
/// The network trains on mean squared error. A softmax output layer pairs
/// with a cross-entropy style target instead; the activation's batch
/// derivative is defined so that `outputs - targets` stays the correct
/// output error in both cases.
#[derive(Serialize, Deserialize, Clone)]
pub struct NeuralNetwork {
    pub layers: Vec<DenseLayer>,
    pub optimizer: OptimizerWrapper,
}

impl NeuralNetwork {
    /// Create a new network from consecutive layer sizes and one activation per layer.
    pub fn new(layer_sizes: &[usize], activations: &[Activation], optimizer: OptimizerWrapper) -> Self {
        assert_eq!(layer_sizes.len() - 1, activations.len());

        let layers = layer_sizes
            .windows(2)
            .zip(activations.iter())
            .map(|(window, &activation)| DenseLayer::new(window[0], window[1], activation))
            .collect::<Vec<_>>();

        NeuralNetwork { layers, optimizer }
    }

    pub fn with_layers(mut self, layers: Vec<DenseLayer>) -> Self {
        self.layers = layers;
        self
    }

    pub fn input_size(&self) -> usize {
        self.layers.first().map_or(0, |l| l.input_size())
    }

    pub fn output_size(&self) -> usize {
        self.layers.last().map_or(0, |l| l.output_size())
    }

    /// Forward pass for a single input vector.
    pub fn forward(&mut self, input: ArrayView1<f32>) -> Array1<f32> {
        let input = input.insert_axis(Axis(0));
        let output = self.forward_batch(input);
        let output_shape = output.shape()[1];
        output.into_shape((output_shape,)).expect("Failed to reshape output")
    }

    /// Forward pass for a batch of input vectors.
    pub fn forward_batch(&mut self, inputs: ArrayView2<f32>) -> Array2<f32> {
        let mut current_output = inputs.to_owned();
        for layer in &mut self.layers {
            current_output = layer.forward_batch(current_output.view());
        }
        current_output
    }

    /// Backpropagate a batch of output errors.
    ///
    /// Returns the gradient w.r.t. the network input (so callers can chain
    /// further blocks below this network) and one (weights, biases) gradient
    /// pair per layer, ordered first to last.
    pub fn backward_batch(&mut self, output_errors: ArrayView2<f32>) -> (Array2<f32>, Vec<(Array2<f32>, Array1<f32>)>) {
        let mut gradients: Vec<(Array2<f32>, Array1<f32>)> = Vec::new();
        let mut current_error = output_errors.to_owned();

        for i in (0..self.layers.len()).rev() {
            let layer = &self.layers[i];
            let (adjusted_error, weight_gradients, bias_gradients) = layer.backward_batch(current_error.view());
            gradients.push((weight_gradients, bias_gradients));
            current_error = adjusted_error.dot(&layer.weights.t());
        }

        gradients.reverse();
        (current_error, gradients)
    }

    /// Apply per-layer gradients through the optimizer. Layer index doubles
    /// as the optimizer slot.
    pub fn apply_gradients(&mut self, gradients: &[(Array2<f32>, Array1<f32>)], learning_rate: f32) {
        for (i, (layer, (weight_gradients, bias_gradients))) in
            self.layers.iter_mut().zip(gradients).enumerate()
        {
            self.optimizer.update_weights(i, &mut layer.weights, weight_gradients, learning_rate);
            self.optimizer.update_biases(i, &mut layer.biases, bias_gradients, learning_rate);
        }
    }

    /// One training step on a batch of inputs and target outputs.
    pub fn train_batch(&mut self, inputs: ArrayView2<f32>, targets: ArrayView2<f32>, learning_rate: f32) {
        let outputs = self.forward_batch(inputs);
        let output_errors = &outputs - &targets;
        let (_, gradients) = self.backward_batch(output_errors.view());
        self.apply_gradients(&gradients, learning_rate);
    }

    /// Blend this network's parameters toward another network's.
    /// `tau = 1` copies outright; small `tau` gives the usual slow target tracking.
    pub fn soft_update_from(&mut self, other: &NeuralNetwork, tau: f32) {
        for (dst, src) in self.layers.iter_mut().zip(other.layers.iter()) {
            dst.weights.zip_mut_with(&src.weights, |d, &s| *d = *d * (1.0 - tau) + s * tau);
            dst.biases.zip_mut_with(&src.biases, |d, &s| *d = *d * (1.0 - tau) + s * tau);
        }
    }

    /// Serialize the network (layers and optimizer state) to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let serialized = serialize(self)?;
        let mut file = fs::File::create(path)?;
        file.write_all(&serialized)?;
        Ok(())
    }

    /// Load a network previously written by [`save`](NeuralNetwork::save).
    pub fn load(path: &Path) -> Result<Self> {
        let mut file = fs::File::open(path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        let deserialized: Self = deserialize(&buffer)?;
        Ok(deserialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::SGD;
    use ndarray::array;

    fn tiny_network() -> NeuralNetwork {
        NeuralNetwork::new(
            &[2, 4, 2],
            &[Activation::Relu, Activation::Linear],
            OptimizerWrapper::SGD(SGD::new()),
        )
    }

    #[test]
    fn test_forward_shapes() {
        let mut net = tiny_network();
        let out = net.forward(array![0.1, -0.2].view());
        assert_eq!(out.len(), 2);
        let out = net.forward_batch(array![[0.1, -0.2], [0.3, 0.4], [0.0, 0.0]].view());
        assert_eq!(out.dim(), (3, 2));
    }

    #[test]
    fn test_train_batch_reduces_loss() {
        let mut net = tiny_network();
        let inputs = array![[0.5, -0.5], [1.0, 1.0], [-1.0, 0.25], [0.0, 0.75]];
        let targets = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [0.0, 0.0]];

        let loss = |net: &mut NeuralNetwork| {
            let out = net.forward_batch(inputs.view());
            (&out - &targets).mapv(|v| v * v).sum()
        };

        let before = loss(&mut net);
        for _ in 0..200 {
            net.train_batch(inputs.view(), targets.view(), 0.05);
        }
        let after = loss(&mut net);
        assert!(after < before, "loss went from {} to {}", before, after);
    }

    #[test]
    fn test_backward_batch_returns_input_gradient() {
        let mut net = tiny_network();
        let inputs = array![[0.5, -0.5], [1.0, 1.0]];
        let out = net.forward_batch(inputs.view());
        let (input_grad, layer_grads) = net.backward_batch(out.view());
        assert_eq!(input_grad.dim(), (2, 2));
        assert_eq!(layer_grads.len(), 2);
        assert_eq!(layer_grads[0].0.dim(), (2, 4));
        assert_eq!(layer_grads[1].1.len(), 2);
    }

    #[test]
    fn test_soft_update_full_tau_copies() {
        let mut a = tiny_network();
        let b = tiny_network();
        a.soft_update_from(&b, 1.0);
        for (la, lb) in a.layers.iter().zip(b.layers.iter()) {
            assert!(la.weights.iter().zip(lb.weights.iter()).all(|(x, y)| (x - y).abs() < 1e-6));
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.bin");

        let mut net = tiny_network();
        let input = array![0.3, 0.7];
        let before = net.forward(input.view());
        net.save(&path).unwrap();

        let mut restored = NeuralNetwork::load(&path).unwrap();
        let after = restored.forward(input.view());
        assert_eq!(before, after);
    }
}
