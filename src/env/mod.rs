use ndarray::{Array1, ArrayView1};
use serde::{Serialize, Deserialize};

use crate::error::{GridRlError, Result};

pub mod multi;
pub mod toy_case5;

pub use multi::{make_multi_env, MultiEnv, VecEnv};
pub use toy_case5::ToyCase5;

/// Static description of a power grid: element counts and the observation
/// attributes derived from them.
///
/// The topology vector has one entry per grid element connection point:
/// every generator, every load, and both ends of every line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridDescriptor {
    pub n_gen: usize,
    pub n_load: usize,
    pub n_line: usize,
    pub n_sub: usize,
}

impl GridDescriptor {
    pub fn dim_topo(&self) -> usize {
        self.n_gen + self.n_load + 2 * self.n_line
    }

    /// Dimension contributed by one observation attribute to a flattened
    /// observation vector.
    pub fn attr_dim(&self, attr: &str) -> Result<usize> {
        match attr {
            "prod_p" => Ok(self.n_gen),
            "load_p" => Ok(self.n_load),
            "rho" => Ok(self.n_line),
            "line_status" => Ok(self.n_line),
            "topo_vect" => Ok(self.dim_topo()),
            other => Err(GridRlError::UnknownAttribute(other.to_string())),
        }
    }
}

/// A single grid observation, split by attribute.
///
/// `line_status` uses 1.0 for in service, 0.0 for disconnected; `topo_vect`
/// holds the bus (1.0 or 2.0) of each element connection point.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub prod_p: Array1<f32>,
    pub load_p: Array1<f32>,
    pub rho: Array1<f32>,
    pub line_status: Array1<f32>,
    pub topo_vect: Array1<f32>,
}

impl Observation {
    pub fn attr(&self, attr: &str) -> Result<ArrayView1<f32>> {
        match attr {
            "prod_p" => Ok(self.prod_p.view()),
            "load_p" => Ok(self.load_p.view()),
            "rho" => Ok(self.rho.view()),
            "line_status" => Ok(self.line_status.view()),
            "topo_vect" => Ok(self.topo_vect.view()),
            other => Err(GridRlError::UnknownAttribute(other.to_string())),
        }
    }

    /// Flatten the listed attributes, in order, into one vector.
    pub fn extract(&self, attrs: &[String]) -> Result<Array1<f32>> {
        let mut values = Vec::new();
        for attr in attrs {
            values.extend(self.attr(attr)?.iter().copied());
        }
        Ok(Array1::from_vec(values))
    }
}

/// Typed grid action, produced by the action converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridAction {
    DoNothing,
    SetLineStatus { line: usize, connected: bool },
    /// Flip the bus of one element connection point (1 to 2 or back).
    ChangeBus { position: usize },
    /// Force the bus of one element connection point.
    SetBus { position: usize, bus: u8 },
}

/// What one environment step produced.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub obs: Observation,
    pub reward: f32,
    pub done: bool,
}

/// A steppable grid scenario.
///
/// `step` never resets on its own: after `done` the caller decides whether
/// to call `reset` again. The vectorized wrapper adds auto-reset on top.
pub trait GridEnv {
    fn descriptor(&self) -> &GridDescriptor;
    fn name(&self) -> &str;
    /// Hard cap on episode length; `step` reports `done` when reached.
    fn max_episode_len(&self) -> usize;
    fn reset(&mut self) -> Observation;
    fn step(&mut self, action: GridAction) -> StepOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_descriptor_dims() {
        let d = GridDescriptor { n_gen: 2, n_load: 3, n_line: 8, n_sub: 5 };
        assert_eq!(d.dim_topo(), 21);
        assert_eq!(d.attr_dim("prod_p").unwrap(), 2);
        assert_eq!(d.attr_dim("topo_vect").unwrap(), 21);
        assert!(matches!(
            d.attr_dim("does_not_exist"),
            Err(GridRlError::UnknownAttribute(_))
        ));
    }

    #[test]
    fn test_observation_extract_orders_attributes() {
        let obs = Observation {
            prod_p: array![1.0, 2.0],
            load_p: array![3.0],
            rho: array![0.5],
            line_status: array![1.0],
            topo_vect: array![1.0, 1.0],
        };
        let flat = obs
            .extract(&["rho".to_string(), "prod_p".to_string()])
            .unwrap();
        assert_eq!(flat, array![0.5, 1.0, 2.0]);
        assert!(obs.extract(&["nope".to_string()]).is_err());
    }
}
