use serde::{Serialize, Deserialize};

use crate::env::{GridAction, GridDescriptor};
use crate::error::{GridRlError, Result};

/// Switches selecting which action families enter the discrete catalogue.
///
/// All disabled gives a catalogue containing only the do-nothing action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConverterParam {
    /// Per-line connect and disconnect actions.
    pub set_line_status: bool,
    /// Per-position bus flip actions.
    pub change_bus_vect: bool,
    /// Per-position explicit bus assignment actions.
    pub set_topo_vect: bool,
}

/// Maps the agent's discrete action index to a typed grid action.
///
/// The catalogue is enumerated once from the grid descriptor, in a fixed
/// order: do-nothing at index 0, then line status actions (connect before
/// disconnect, per line), then bus flips, then explicit bus assignments
/// (bus 1 before bus 2, per position).
#[derive(Clone, Serialize, Deserialize)]
pub struct ActionConverter {
    actions: Vec<GridAction>,
}

impl ActionConverter {
    pub fn new(descriptor: &GridDescriptor, param: &ConverterParam) -> Self {
        let mut actions = vec![GridAction::DoNothing];
        if param.set_line_status {
            for line in 0..descriptor.n_line {
                actions.push(GridAction::SetLineStatus { line, connected: true });
                actions.push(GridAction::SetLineStatus { line, connected: false });
            }
        }
        if param.change_bus_vect {
            for position in 0..descriptor.dim_topo() {
                actions.push(GridAction::ChangeBus { position });
            }
        }
        if param.set_topo_vect {
            for position in 0..descriptor.dim_topo() {
                actions.push(GridAction::SetBus { position, bus: 1 });
                actions.push(GridAction::SetBus { position, bus: 2 });
            }
        }
        ActionConverter { actions }
    }

    pub fn n_actions(&self) -> usize {
        self.actions.len()
    }

    pub fn to_grid_action(&self, encoded: usize) -> Result<GridAction> {
        self.actions
            .get(encoded)
            .copied()
            .ok_or(GridRlError::InvalidAction {
                action: encoded,
                max_actions: self.actions.len(),
            })
    }
}
