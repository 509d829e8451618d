//! The autoscaler's input and output types

use std::collections::HashMap;

use crate::models::{Lease, TaskAssignmentResult};

/// The direction of a scale action
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleKind {
    /// Add machines to a group
    Up,
    /// Remove machines from a group
    Down,
}

/// A recommendation to change the size of a machine group
///
/// The engine only recommends; executing the change is up to whoever listens
/// on the action stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum AutoScaleAction {
    /// Add this many machines to a group
    ScaleUp {
        /// The rule asking for more machines
        rule_name: String,
        /// How many machines to add
        count: usize,
    },
    /// Terminate these specific hosts in a group
    ScaleDown {
        /// The rule shedding idle machines
        rule_name: String,
        /// The identifiers of the hosts to terminate
        hosts: Vec<String>,
    },
}

impl AutoScaleAction {
    /// The rule this action is for
    pub fn rule_name(&self) -> &str {
        match self {
            AutoScaleAction::ScaleUp { rule_name, .. } => rule_name,
            AutoScaleAction::ScaleDown { rule_name, .. } => rule_name,
        }
    }

    /// The direction of this action
    pub fn kind(&self) -> ScaleKind {
        match self {
            AutoScaleAction::ScaleUp { .. } => ScaleKind::Up,
            AutoScaleAction::ScaleDown { .. } => ScaleKind::Down,
        }
    }
}

/// One tick of input for the autoscaler
#[derive(Debug, Default)]
pub struct AutoscalerInput {
    /// The consolidated lease views of currently idle machines
    pub idle_leases: Vec<Lease>,
    /// The per machine failures for each task that could not be placed
    pub failures: HashMap<String, Vec<TaskAssignmentResult>>,
}

impl AutoscalerInput {
    /// Create a new autoscaler input
    ///
    /// # Arguments
    ///
    /// * `idle_leases` - The lease views of currently idle machines
    /// * `failures` - The failures for each task that could not be placed
    pub fn new(
        idle_leases: Vec<Lease>,
        failures: HashMap<String, Vec<TaskAssignmentResult>>,
    ) -> Self {
        AutoscalerInput {
            idle_leases,
            failures,
        }
    }
}
