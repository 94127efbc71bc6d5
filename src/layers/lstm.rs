use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3, Axis};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::Uniform;
use serde::{Serialize, Deserialize};

use crate::optimizer::{Optimizer, OptimizerWrapper};

/// LSTM cell for processing observation traces.
///
/// Each call to [`forward_sequence`](LstmCell::forward_sequence) runs a full
/// trace from zeroed states and returns the final hidden state; the recurrent
/// Q heads read their action values from that. Backpropagation through time
/// starts from a gradient at the final hidden state only, which matches how
/// traces are trained here.
#[derive(Serialize, Deserialize, Clone)]
pub struct LstmCell {
    pub input_size: usize,
    pub hidden_size: usize,

    // Input gate
    pub w_ii: Array2<f32>,
    pub w_hi: Array2<f32>,
    pub b_i: Array1<f32>,

    // Forget gate
    pub w_if: Array2<f32>,
    pub w_hf: Array2<f32>,
    pub b_f: Array1<f32>,

    // Cell gate (candidate values)
    pub w_ig: Array2<f32>,
    pub w_hg: Array2<f32>,
    pub b_g: Array1<f32>,

    // Output gate
    pub w_io: Array2<f32>,
    pub w_ho: Array2<f32>,
    pub b_o: Array1<f32>,

    #[serde(skip)]
    cache: Option<LstmCache>,
}

#[derive(Clone)]
struct LstmCache {
    inputs: Array3<f32>,
    hidden_states: Vec<Array2<f32>>,
    cell_states: Vec<Array2<f32>>,
    input_gates: Vec<Array2<f32>>,
    forget_gates: Vec<Array2<f32>>,
    cell_gates: Vec<Array2<f32>>,
    output_gates: Vec<Array2<f32>>,
}

/// Gradients for an LSTM cell, plus the gradient w.r.t. the input sequence.
pub struct LstmGradients {
    pub dw_ii: Array2<f32>, pub dw_hi: Array2<f32>, pub db_i: Array1<f32>,
    pub dw_if: Array2<f32>, pub dw_hf: Array2<f32>, pub db_f: Array1<f32>,
    pub dw_ig: Array2<f32>, pub dw_hg: Array2<f32>, pub db_g: Array1<f32>,
    pub dw_io: Array2<f32>, pub dw_ho: Array2<f32>, pub db_o: Array1<f32>,
    pub dx: Array3<f32>,
}

impl LstmCell {
    pub fn new(input_size: usize, hidden_size: usize) -> Self {
        let scale = (1.0 / (input_size + hidden_size) as f32).sqrt();

        Self {
            input_size,
            hidden_size,

            w_ii: Array2::random((input_size, hidden_size), Uniform::new(-scale, scale)),
            w_hi: Array2::random((hidden_size, hidden_size), Uniform::new(-scale, scale)),
            b_i: Array1::zeros(hidden_size),

            w_if: Array2::random((input_size, hidden_size), Uniform::new(-scale, scale)),
            w_hf: Array2::random((hidden_size, hidden_size), Uniform::new(-scale, scale)),
            // forget gate bias starts at 1
            b_f: Array1::ones(hidden_size),

            w_ig: Array2::random((input_size, hidden_size), Uniform::new(-scale, scale)),
            w_hg: Array2::random((hidden_size, hidden_size), Uniform::new(-scale, scale)),
            b_g: Array1::zeros(hidden_size),

            w_io: Array2::random((input_size, hidden_size), Uniform::new(-scale, scale)),
            w_ho: Array2::random((hidden_size, hidden_size), Uniform::new(-scale, scale)),
            b_o: Array1::zeros(hidden_size),

            cache: None,
        }
    }

    /// Run a trace of shape (batch, trace_len, input_size) and return the final
    /// hidden state of shape (batch, hidden_size).
    pub fn forward_sequence(&mut self, input: ArrayView3<f32>) -> Array2<f32> {
        let (batch_size, seq_len, _) = input.dim();

        let mut h_t = Array2::zeros((batch_size, self.hidden_size));
        let mut c_t: Array2<f32> = Array2::zeros((batch_size, self.hidden_size));

        let mut hidden_states = Vec::with_capacity(seq_len + 1);
        let mut cell_states = Vec::with_capacity(seq_len + 1);
        let mut input_gates = Vec::with_capacity(seq_len);
        let mut forget_gates = Vec::with_capacity(seq_len);
        let mut cell_gates = Vec::with_capacity(seq_len);
        let mut output_gates = Vec::with_capacity(seq_len);

        hidden_states.push(h_t.clone());
        cell_states.push(c_t.clone());

        for t in 0..seq_len {
            let x_t = input.slice(s![.., t, ..]);

            // i_t = sigmoid(x_t W_ii + h_{t-1} W_hi + b_i)
            let i_t = Self::sigmoid(&(x_t.dot(&self.w_ii) + h_t.dot(&self.w_hi) + &self.b_i));

            // f_t = sigmoid(x_t W_if + h_{t-1} W_hf + b_f)
            let f_t = Self::sigmoid(&(x_t.dot(&self.w_if) + h_t.dot(&self.w_hf) + &self.b_f));

            // g_t = tanh(x_t W_ig + h_{t-1} W_hg + b_g)
            let g_t = Self::tanh(&(x_t.dot(&self.w_ig) + h_t.dot(&self.w_hg) + &self.b_g));

            // o_t = sigmoid(x_t W_io + h_{t-1} W_ho + b_o)
            let o_t = Self::sigmoid(&(x_t.dot(&self.w_io) + h_t.dot(&self.w_ho) + &self.b_o));

            c_t = &f_t * &c_t + &i_t * &g_t;
            h_t = &o_t * &Self::tanh(&c_t);

            hidden_states.push(h_t.clone());
            cell_states.push(c_t.clone());
            input_gates.push(i_t);
            forget_gates.push(f_t);
            cell_gates.push(g_t);
            output_gates.push(o_t);
        }

        self.cache = Some(LstmCache {
            inputs: input.to_owned(),
            hidden_states,
            cell_states,
            input_gates,
            forget_gates,
            cell_gates,
            output_gates,
        });

        h_t
    }

    /// Backpropagate through the trace from a gradient at the final hidden state.
    pub fn backward_sequence(&self, final_grad: ArrayView2<f32>) -> LstmGradients {
        let cache = self.cache.as_ref()
            .expect("No cache stored. forward_sequence() must be called before backward_sequence()");
        let (batch_size, seq_len, _) = cache.inputs.dim();

        let mut dw_ii = Array2::zeros((self.input_size, self.hidden_size));
        let mut dw_hi = Array2::zeros((self.hidden_size, self.hidden_size));
        let mut db_i = Array1::zeros(self.hidden_size);

        let mut dw_if = Array2::zeros((self.input_size, self.hidden_size));
        let mut dw_hf = Array2::zeros((self.hidden_size, self.hidden_size));
        let mut db_f = Array1::zeros(self.hidden_size);

        let mut dw_ig = Array2::zeros((self.input_size, self.hidden_size));
        let mut dw_hg = Array2::zeros((self.hidden_size, self.hidden_size));
        let mut db_g = Array1::zeros(self.hidden_size);

        let mut dw_io = Array2::zeros((self.input_size, self.hidden_size));
        let mut dw_ho = Array2::zeros((self.hidden_size, self.hidden_size));
        let mut db_o = Array1::zeros(self.hidden_size);

        let mut dx = Array3::zeros((batch_size, seq_len, self.input_size));
        let mut dh_next = final_grad.to_owned();
        let mut dc_next: Array2<f32> = Array2::zeros((batch_size, self.hidden_size));

        for t in (0..seq_len).rev() {
            let dh = dh_next;
            let x_t = cache.inputs.slice(s![.., t, ..]);
            let h_prev = &cache.hidden_states[t];
            let c_t = &cache.cell_states[t + 1];
            let c_prev = &cache.cell_states[t];

            let i_t = &cache.input_gates[t];
            let f_t = &cache.forget_gates[t];
            let g_t = &cache.cell_gates[t];
            let o_t = &cache.output_gates[t];

            let tanh_c_t = Self::tanh(c_t);
            let do_t = &dh * &tanh_c_t;
            let dc = &dh * o_t * &Self::tanh_derivative(&tanh_c_t) + &dc_next;

            let di_t = &dc * g_t;
            let df_t = &dc * c_prev;
            let dg_t = &dc * i_t;
            dc_next = &dc * f_t;

            let di_gate = di_t * &Self::sigmoid_derivative(i_t);
            let df_gate = df_t * &Self::sigmoid_derivative(f_t);
            let dg_gate = dg_t * &Self::tanh_derivative(g_t);
            let do_gate = do_t * &Self::sigmoid_derivative(o_t);

            dw_ii = &dw_ii + &x_t.t().dot(&di_gate);
            dw_hi = &dw_hi + &h_prev.t().dot(&di_gate);
            db_i = &db_i + &di_gate.sum_axis(Axis(0));

            dw_if = &dw_if + &x_t.t().dot(&df_gate);
            dw_hf = &dw_hf + &h_prev.t().dot(&df_gate);
            db_f = &db_f + &df_gate.sum_axis(Axis(0));

            dw_ig = &dw_ig + &x_t.t().dot(&dg_gate);
            dw_hg = &dw_hg + &h_prev.t().dot(&dg_gate);
            db_g = &db_g + &dg_gate.sum_axis(Axis(0));

            dw_io = &dw_io + &x_t.t().dot(&do_gate);
            dw_ho = &dw_ho + &h_prev.t().dot(&do_gate);
            db_o = &db_o + &do_gate.sum_axis(Axis(0));

            let dx_t = di_gate.dot(&self.w_ii.t())
                + df_gate.dot(&self.w_if.t())
                + dg_gate.dot(&self.w_ig.t())
                + do_gate.dot(&self.w_io.t());

            dx.slice_mut(s![.., t, ..]).assign(&dx_t);

            dh_next = di_gate.dot(&self.w_hi.t())
                + df_gate.dot(&self.w_hf.t())
                + dg_gate.dot(&self.w_hg.t())
                + do_gate.dot(&self.w_ho.t());
        }

        LstmGradients {
            dw_ii, dw_hi, db_i,
            dw_if, dw_hf, db_f,
            dw_ig, dw_hg, db_g,
            dw_io, dw_ho, db_o,
            dx,
        }
    }

    /// Update the cell parameters. Weight slots `slot..slot+8` and bias slots
    /// `slot..slot+4` must not collide with any other parameter group using
    /// the same optimizer.
    pub fn apply_gradients(
        &mut self,
        grads: &LstmGradients,
        optimizer: &mut OptimizerWrapper,
        slot: usize,
        learning_rate: f32,
    ) {
        optimizer.update_weights(slot, &mut self.w_ii, &grads.dw_ii, learning_rate);
        optimizer.update_weights(slot + 1, &mut self.w_hi, &grads.dw_hi, learning_rate);
        optimizer.update_weights(slot + 2, &mut self.w_if, &grads.dw_if, learning_rate);
        optimizer.update_weights(slot + 3, &mut self.w_hf, &grads.dw_hf, learning_rate);
        optimizer.update_weights(slot + 4, &mut self.w_ig, &grads.dw_ig, learning_rate);
        optimizer.update_weights(slot + 5, &mut self.w_hg, &grads.dw_hg, learning_rate);
        optimizer.update_weights(slot + 6, &mut self.w_io, &grads.dw_io, learning_rate);
        optimizer.update_weights(slot + 7, &mut self.w_ho, &grads.dw_ho, learning_rate);

        optimizer.update_biases(slot, &mut self.b_i, &grads.db_i, learning_rate);
        optimizer.update_biases(slot + 1, &mut self.b_f, &grads.db_f, learning_rate);
        optimizer.update_biases(slot + 2, &mut self.b_g, &grads.db_g, learning_rate);
        optimizer.update_biases(slot + 3, &mut self.b_o, &grads.db_o, learning_rate);
    }

    /// Blend this cell's parameters toward another cell's. Used for target networks.
    pub fn soft_update_from(&mut self, other: &LstmCell, tau: f32) {
        for (dst, src) in [
            (&mut self.w_ii, &other.w_ii), (&mut self.w_hi, &other.w_hi),
            (&mut self.w_if, &other.w_if), (&mut self.w_hf, &other.w_hf),
            (&mut self.w_ig, &other.w_ig), (&mut self.w_hg, &other.w_hg),
            (&mut self.w_io, &other.w_io), (&mut self.w_ho, &other.w_ho),
        ] {
            dst.zip_mut_with(src, |d, &s| *d = *d * (1.0 - tau) + s * tau);
        }
        for (dst, src) in [
            (&mut self.b_i, &other.b_i), (&mut self.b_f, &other.b_f),
            (&mut self.b_g, &other.b_g), (&mut self.b_o, &other.b_o),
        ] {
            dst.zip_mut_with(src, |d, &s| *d = *d * (1.0 - tau) + s * tau);
        }
    }

    fn sigmoid(x: &Array2<f32>) -> Array2<f32> {
        x.mapv(|v| 1.0 / (1.0 + (-v).exp()))
    }

    fn sigmoid_derivative(s: &Array2<f32>) -> Array2<f32> {
        s * &(1.0 - s)
    }

    fn tanh(x: &Array2<f32>) -> Array2<f32> {
        x.mapv(|v| v.tanh())
    }

    fn tanh_derivative(t: &Array2<f32>) -> Array2<f32> {
        1.0 - t * t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_forward_shapes() {
        let mut cell = LstmCell::new(4, 6);
        let input = Array3::zeros((2, 5, 4));
        let hidden = cell.forward_sequence(input.view());
        assert_eq!(hidden.dim(), (2, 6));
    }

    #[test]
    fn test_zero_input_zero_hidden_is_bounded() {
        // gates saturate in (0, 1) and tanh in (-1, 1), so |h| < 1
        let mut cell = LstmCell::new(3, 3);
        let input = Array3::from_elem((1, 8, 3), 10.0);
        let hidden = cell.forward_sequence(input.view());
        assert!(hidden.iter().all(|v| v.abs() < 1.0));
    }

    #[test]
    fn test_backward_shapes() {
        let mut cell = LstmCell::new(4, 6);
        let input = Array3::zeros((2, 5, 4));
        let hidden = cell.forward_sequence(input.view());
        let grads = cell.backward_sequence(hidden.view());
        assert_eq!(grads.dw_ii.dim(), (4, 6));
        assert_eq!(grads.dw_ho.dim(), (6, 6));
        assert_eq!(grads.db_f.len(), 6);
        assert_eq!(grads.dx.dim(), (2, 5, 4));
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let mut cell = LstmCell::new(2, 3);
        let input = Array3::from_shape_fn((1, 4, 2), |(_, t, i)| 0.1 * (t as f32 + 1.0) - 0.05 * i as f32);

        // L = 0.5 * sum(h^2), dL/dh = h
        let hidden = cell.forward_sequence(input.view());
        let base_loss: f32 = hidden.iter().map(|v| 0.5 * v * v).sum();
        let grads = cell.backward_sequence(hidden.view());

        let eps = 1e-3;
        let mut perturbed = cell.clone();
        perturbed.w_ig[[0, 1]] += eps;
        let h = perturbed.forward_sequence(input.view());
        let loss: f32 = h.iter().map(|v| 0.5 * v * v).sum();
        let numeric = (loss - base_loss) / eps;
        assert!(
            (numeric - grads.dw_ig[[0, 1]]).abs() < 1e-2,
            "numeric {} vs analytic {}",
            numeric,
            grads.dw_ig[[0, 1]]
        );
    }

    #[test]
    fn test_soft_update_moves_toward_source() {
        let mut target = LstmCell::new(2, 2);
        let online = LstmCell::new(2, 2);
        let before = (target.w_ii[[0, 0]] - online.w_ii[[0, 0]]).abs();
        target.soft_update_from(&online, 0.5);
        let after = (target.w_ii[[0, 0]] - online.w_ii[[0, 0]]).abs();
        assert!(after <= before);
        target.soft_update_from(&online, 1.0);
        assert!((target.w_ii[[0, 0]] - online.w_ii[[0, 0]]).abs() < 1e-6);
    }
}
