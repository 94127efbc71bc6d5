use ndarray::{Array1, Array2};
use serde::{Serialize, Deserialize};

/// Parameter update rule.
///
/// `slot` identifies the parameter group being updated so that stateful
/// optimizers keep separate moment estimates per group. A network uses its
/// layer index as the slot; composite models hand out disjoint slot ranges
/// to their parts.
pub trait Optimizer {
    fn update_weights(&mut self, slot: usize, weights: &mut Array2<f32>, gradients: &Array2<f32>, learning_rate: f32);
    fn update_biases(&mut self, slot: usize, biases: &mut Array1<f32>, gradients: &Array1<f32>, learning_rate: f32);
}

#[derive(Serialize, Deserialize, Clone)]
pub enum OptimizerWrapper {
    SGD(SGD),
    Adam(Adam),
}

impl Optimizer for OptimizerWrapper {
    fn update_weights(&mut self, slot: usize, weights: &mut Array2<f32>, gradients: &Array2<f32>, learning_rate: f32) {
        match self {
            OptimizerWrapper::SGD(optimizer) => optimizer.update_weights(slot, weights, gradients, learning_rate),
            OptimizerWrapper::Adam(optimizer) => optimizer.update_weights(slot, weights, gradients, learning_rate),
        }
    }

    fn update_biases(&mut self, slot: usize, biases: &mut Array1<f32>, gradients: &Array1<f32>, learning_rate: f32) {
        match self {
            OptimizerWrapper::SGD(optimizer) => optimizer.update_biases(slot, biases, gradients, learning_rate),
            OptimizerWrapper::Adam(optimizer) => optimizer.update_biases(slot, biases, gradients, learning_rate),
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
pub struct SGD;

impl SGD {
    pub fn new() -> SGD {
        SGD
    }
}

impl Default for SGD {
    fn default() -> Self {
        Self::new()
    }
}

impl Optimizer for SGD {
    fn update_weights(&mut self, _slot: usize, weights: &mut Array2<f32>, gradients: &Array2<f32>, learning_rate: f32) {
        weights.zip_mut_with(gradients, |w, &g| *w -= learning_rate * g);
    }

    fn update_biases(&mut self, _slot: usize, biases: &mut Array1<f32>, gradients: &Array1<f32>, learning_rate: f32) {
        biases.zip_mut_with(gradients, |b, &g| *b -= learning_rate * g);
    }
}

#[derive(Serialize, Deserialize, Clone)]
struct MomentPair<A> {
    m: A,
    v: A,
    t: i32,
}

/// Adam with per-slot first and second moment estimates.
///
/// Slots are allocated lazily on first use, so the optimizer does not need
/// to know the parameter shapes up front and the same instance can serve a
/// composite model.
#[derive(Serialize, Deserialize, Clone)]
pub struct Adam {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    weight_moments: Vec<Option<MomentPair<Array2<f32>>>>,
    bias_moments: Vec<Option<MomentPair<Array1<f32>>>>,
}

impl Adam {
    pub fn new(beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Adam {
            beta1,
            beta2,
            epsilon,
            weight_moments: Vec::new(),
            bias_moments: Vec::new(),
        }
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(0.9, 0.999, 1e-8)
    }
}

impl Optimizer for Adam {
    fn update_weights(&mut self, slot: usize, weights: &mut Array2<f32>, gradients: &Array2<f32>, learning_rate: f32) {
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        if self.weight_moments.len() <= slot {
            self.weight_moments.resize(slot + 1, None);
        }
        let pair = self.weight_moments[slot].get_or_insert_with(|| MomentPair {
            m: Array2::zeros(gradients.dim()),
            v: Array2::zeros(gradients.dim()),
            t: 0,
        });
        pair.t += 1;

        pair.m.zip_mut_with(gradients, |m, &g| *m = *m * beta1 + g * (1.0 - beta1));
        pair.v.zip_mut_with(gradients, |v, &g| *v = *v * beta2 + g * g * (1.0 - beta2));

        let m_hat = pair.m.mapv(|x| x / (1.0 - beta1.powi(pair.t)));
        let v_hat = pair.v.mapv(|x| x / (1.0 - beta2.powi(pair.t)));

        *weights -= &((&m_hat / (v_hat.mapv(f32::sqrt) + epsilon)) * learning_rate);
    }

    fn update_biases(&mut self, slot: usize, biases: &mut Array1<f32>, gradients: &Array1<f32>, learning_rate: f32) {
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        if self.bias_moments.len() <= slot {
            self.bias_moments.resize(slot + 1, None);
        }
        let pair = self.bias_moments[slot].get_or_insert_with(|| MomentPair {
            m: Array1::zeros(gradients.dim()),
            v: Array1::zeros(gradients.dim()),
            t: 0,
        });
        pair.t += 1;

        pair.m.zip_mut_with(gradients, |m, &g| *m = *m * beta1 + g * (1.0 - beta1));
        pair.v.zip_mut_with(gradients, |v, &g| *v = *v * beta2 + g * g * (1.0 - beta2));

        let m_hat = pair.m.mapv(|x| x / (1.0 - beta1.powi(pair.t)));
        let v_hat = pair.v.mapv(|x| x / (1.0 - beta2.powi(pair.t)));

        *biases -= &((&m_hat / (v_hat.mapv(f32::sqrt) + epsilon)) * learning_rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_sgd_step() {
        let mut sgd = SGD::new();
        let mut weights = array![[1.0, 1.0]];
        sgd.update_weights(0, &mut weights, &array![[0.5, -0.5]], 0.1);
        assert_eq!(weights, array![[0.95, 1.05]]);
    }

    #[test]
    fn test_adam_first_step_magnitude() {
        // with bias correction, the first step is close to lr in each coordinate
        let mut adam = Adam::default();
        let mut weights = array![[0.0, 0.0]];
        adam.update_weights(0, &mut weights, &array![[10.0, -0.01]], 0.1);
        assert!((weights[[0, 0]] + 0.1).abs() < 1e-3);
        assert!((weights[[0, 1]] - 0.1).abs() < 1e-3);
    }

    #[test]
    fn test_adam_slots_are_independent() {
        let mut adam = Adam::default();
        let mut a = array![[0.0]];
        let mut b = array![[0.0; 3]];
        // different shapes in different slots must not interfere
        adam.update_weights(0, &mut a, &array![[1.0]], 0.1);
        adam.update_weights(5, &mut b, &array![[1.0, 1.0, 1.0]], 0.1);
        adam.update_weights(0, &mut a, &array![[1.0]], 0.1);
        assert!(a[[0, 0]] < 0.0 && b[[0, 0]] < 0.0);
    }

    #[test]
    fn test_adam_bias_update() {
        let mut adam = Adam::default();
        let mut biases = array![1.0, 2.0];
        adam.update_biases(0, &mut biases, &array![1.0, 0.0], 0.5);
        assert!(biases[0] < 1.0);
        assert_eq!(biases[1], 2.0);
    }
}
