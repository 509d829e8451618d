//! The data models shared across the placement engine

mod actions;
mod leases;
mod requests;
mod results;
mod rules;

pub use actions::{AutoScaleAction, AutoscalerInput, ScaleKind};
pub use leases::{Lease, PortRange};
pub use requests::{
    ConstraintEvaluator, ConstraintOutcome, FitnessCalculator, TaskRequest, VmCurrentState,
};
pub use results::{
    AssignmentFailure, ConstraintFailure, ResourceUsage, TaskAssignmentResult, VMAssignmentResult,
    VMResource,
};
pub use rules::{AutoScaleRule, AutoScaleRules, ThresholdRule};
