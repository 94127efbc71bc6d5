use ndarray::{Array1, Array2, ArrayView2};
use serde::{Serialize, Deserialize};

use crate::error::{GridRlError, Result};

/// An enumeration of the possible activation functions that can be used in a neural network layer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Default)]
pub enum Activation {
    #[default]
    Relu,
    Linear,
    Sigmoid,
    Tanh,
    LeakyRelu { alpha: f32 },
    Softmax,
}

impl Activation {
    /// Parse an activation from its lowercase config-file name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "relu" => Ok(Activation::Relu),
            "linear" => Ok(Activation::Linear),
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            "leaky_relu" => Ok(Activation::LeakyRelu { alpha: 0.01 }),
            "softmax" => Ok(Activation::Softmax),
            other => Err(GridRlError::invalid_parameter(
                "activation",
                &format!("unknown activation '{}'", other),
            )),
        }
    }

    /// The config-file name of this activation.
    pub fn name(&self) -> &'static str {
        match self {
            Activation::Relu => "relu",
            Activation::Linear => "linear",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::LeakyRelu { .. } => "leaky_relu",
            Activation::Softmax => "softmax",
        }
    }

    /// Apply the activation function to an input array in-place.
    pub fn apply(&self, input: &mut Array1<f32>) {
        match self {
            Activation::Relu => {
                input.mapv_inplace(|v| v.max(0.0));
            }
            Activation::Linear => {}
            Activation::Sigmoid => {
                input.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp()));
            }
            Activation::Tanh => {
                input.mapv_inplace(|v| v.tanh());
            }
            Activation::LeakyRelu { alpha } => {
                let a = *alpha;
                input.mapv_inplace(|v| if v > 0.0 { v } else { a * v });
            }
            Activation::Softmax => {
                let max = input.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                input.mapv_inplace(|v| (v - max).exp());
                let sum = input.sum();
                input.mapv_inplace(|v| v / sum);
            }
        }
    }

    /// Apply the activation function to a batch of input arrays in-place.
    pub fn apply_batch(&self, inputs: &mut Array2<f32>) {
        match self {
            Activation::Relu => {
                inputs.mapv_inplace(|v| v.max(0.0));
            }
            Activation::Linear => {}
            Activation::Sigmoid => {
                inputs.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp()));
            }
            Activation::Tanh => {
                inputs.mapv_inplace(|v| v.tanh());
            }
            Activation::LeakyRelu { alpha } => {
                let a = *alpha;
                inputs.mapv_inplace(|v| if v > 0.0 { v } else { a * v });
            }
            Activation::Softmax => {
                for mut row in inputs.rows_mut() {
                    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                    row.mapv_inplace(|v| (v - max).exp());
                    let sum = row.sum();
                    row.mapv_inplace(|v| v / sum);
                }
            }
        }
    }

    /// Compute the derivative of the activation function for an input array.
    ///
    /// Softmax returns ones: its outputs are trained with a cross-entropy
    /// style output error (probabilities minus targets), which already folds
    /// the Jacobian in.
    pub fn derivative(&self, input: &Array1<f32>) -> Array1<f32> {
        match self {
            Activation::Relu => {
                input.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 })
            }
            Activation::Linear | Activation::Softmax => {
                Array1::ones(input.len())
            }
            Activation::Sigmoid => {
                input.mapv(|v| {
                    let sigmoid = 1.0 / (1.0 + (-v).exp());
                    sigmoid * (1.0 - sigmoid)
                })
            }
            Activation::Tanh => {
                input.mapv(|v| {
                    let tanh_v = v.tanh();
                    1.0 - tanh_v * tanh_v
                })
            }
            Activation::LeakyRelu { alpha } => {
                let a = *alpha;
                input.mapv(|v| if v > 0.0 { 1.0 } else { a })
            }
        }
    }

    /// Compute the derivative of the activation function for a batch of input arrays.
    pub fn derivative_batch(&self, inputs: ArrayView2<f32>) -> Array2<f32> {
        match self {
            Activation::Relu => {
                inputs.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 })
            }
            Activation::Linear | Activation::Softmax => {
                Array2::ones(inputs.dim())
            }
            Activation::Sigmoid => {
                inputs.mapv(|v| {
                    let sigmoid = 1.0 / (1.0 + (-v).exp());
                    sigmoid * (1.0 - sigmoid)
                })
            }
            Activation::Tanh => {
                inputs.mapv(|v| {
                    let tanh_v = v.tanh();
                    1.0 - tanh_v * tanh_v
                })
            }
            Activation::LeakyRelu { alpha } => {
                let a = *alpha;
                inputs.mapv(|v| if v > 0.0 { 1.0 } else { a })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_relu() {
        let mut input = array![-1.0, 0.0, 2.0];
        Activation::Relu.apply(&mut input);
        assert_eq!(input, array![0.0, 0.0, 2.0]);

        let deriv = Activation::Relu.derivative(&array![-1.0, 0.5]);
        assert_eq!(deriv, array![0.0, 1.0]);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let mut input = array![1.0, 2.0, 3.0];
        Activation::Softmax.apply(&mut input);
        assert!((input.sum() - 1.0).abs() < 1e-6);
        assert!(input[2] > input[1] && input[1] > input[0]);
    }

    #[test]
    fn test_softmax_batch_rows_sum_to_one() {
        let mut inputs = array![[1.0, 2.0, 3.0], [0.0, 0.0, 0.0]];
        Activation::Softmax.apply_batch(&mut inputs);
        for row in inputs.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        // uniform logits give uniform probabilities
        assert!((inputs[[1, 0]] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_from_name_round_trip() {
        for name in ["relu", "linear", "sigmoid", "tanh", "leaky_relu", "softmax"] {
            let act = Activation::from_name(name).unwrap();
            assert_eq!(act.name(), name);
        }
        assert!(Activation::from_name("swish").is_err());
    }

    #[test]
    fn test_sigmoid_derivative_peak() {
        // steepest at zero input
        let deriv = Activation::Sigmoid.derivative(&array![0.0]);
        assert!((deriv[0] - 0.25).abs() < 1e-6);
    }
}
