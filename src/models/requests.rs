//! Task requests and the placement plug-in seams

use std::sync::Arc;

use crate::models::{Lease, TaskAssignmentResult};
use crate::tracker::TaskTracker;

/// The outcome of evaluating a hard constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintOutcome {
    /// This constraint allows the placement
    Passed,
    /// This constraint forbids the placement for a reason
    Failed(String),
}

impl ConstraintOutcome {
    /// Whether this outcome allows the placement
    pub fn is_passed(&self) -> bool {
        matches!(self, ConstraintOutcome::Passed)
    }
}

/// A view of a single machine as seen during one scheduling iteration
///
/// `assigned` holds the assignments made so far in the in-progress iteration
/// while `running` holds the tasks that were already on the machine when the
/// iteration started.
pub struct VmCurrentState<'a> {
    /// The hostname of this machine
    pub hostname: &'a str,
    /// The totaled lease snapshot for this machine if one was published
    pub available: Option<&'a Lease>,
    /// The assignments made on this machine in the current iteration
    pub assigned: Vec<&'a TaskAssignmentResult>,
    /// The tasks already running on this machine
    pub running: Vec<Arc<TaskRequest>>,
}

/// A predicate that can forbid placing a task on a machine
pub trait ConstraintEvaluator: Send + Sync {
    /// The name of this constraint for failure reports
    fn name(&self) -> &str;

    /// Judge whether a task may be placed on a machine
    ///
    /// # Arguments
    ///
    /// * `request` - The task being placed
    /// * `vm` - The machine being considered
    /// * `tracker` - The cluster wide view of running/assigned tasks
    fn evaluate(
        &self,
        request: &TaskRequest,
        vm: &VmCurrentState,
        tracker: &dyn TaskTracker,
    ) -> ConstraintOutcome;
}

/// Scores how well a machine fits a task
///
/// Fitness is a value in [0, 1] where 1 is a perfect fit and 0 rejects the
/// machine outright. Soft constraints implement this same trait; they shift
/// the score but can never cause a rejection on their own.
pub trait FitnessCalculator: Send + Sync {
    /// The name of this calculator
    fn name(&self) -> &str;

    /// Score a machine for a task
    ///
    /// # Arguments
    ///
    /// * `request` - The task being placed
    /// * `vm` - The machine being considered
    /// * `tracker` - The cluster wide view of running/assigned tasks
    fn calculate_fitness(
        &self,
        request: &TaskRequest,
        vm: &VmCurrentState,
        tracker: &dyn TaskTracker,
    ) -> f64;
}

/// A task asking to be placed on some machine
pub struct TaskRequest {
    /// The stable unique id of this task
    pub id: String,
    /// The cpu cores this task needs
    pub cpus: f64,
    /// The memory this task needs in MB
    pub memory_mb: f64,
    /// The network bandwidth this task needs in Mbps
    pub network_mbps: f64,
    /// The disk this task needs in MB
    pub disk_mb: f64,
    /// The number of ports this task needs
    pub ports: u32,
    /// Whether this task must be the only task on its machine
    pub exclusive_host: bool,
    /// The constraints that forbid placements when violated
    pub hard_constraints: Vec<Box<dyn ConstraintEvaluator>>,
    /// The preferences that shift fitness but never forbid placement
    pub soft_constraints: Vec<Box<dyn FitnessCalculator>>,
}

impl TaskRequest {
    /// Create a new task request with no constraints
    ///
    /// # Arguments
    ///
    /// * `id` - The stable unique id for this task
    /// * `cpus` - The cpu cores this task needs
    /// * `memory_mb` - The memory this task needs in MB
    /// * `network_mbps` - The network bandwidth this task needs in Mbps
    /// * `disk_mb` - The disk this task needs in MB
    /// * `ports` - The number of ports this task needs
    pub fn new<T: Into<String>>(
        id: T,
        cpus: f64,
        memory_mb: f64,
        network_mbps: f64,
        disk_mb: f64,
        ports: u32,
    ) -> Self {
        TaskRequest {
            id: id.into(),
            cpus,
            memory_mb,
            network_mbps,
            disk_mb,
            ports,
            exclusive_host: false,
            hard_constraints: Vec::default(),
            soft_constraints: Vec::default(),
        }
    }

    /// Add a hard constraint to this request
    ///
    /// # Arguments
    ///
    /// * `constraint` - The constraint to add
    #[must_use]
    pub fn with_hard_constraint(mut self, constraint: Box<dyn ConstraintEvaluator>) -> Self {
        self.hard_constraints.push(constraint);
        self
    }

    /// Add a soft constraint to this request
    ///
    /// # Arguments
    ///
    /// * `constraint` - The soft constraint to add
    #[must_use]
    pub fn with_soft_constraint(mut self, constraint: Box<dyn FitnessCalculator>) -> Self {
        self.soft_constraints.push(constraint);
        self
    }

    /// Mark this task as requiring a machine all to itself
    #[must_use]
    pub fn exclusive(mut self) -> Self {
        self.exclusive_host = true;
        self
    }
}

impl std::fmt::Debug for TaskRequest {
    /// Debug print this request without its boxed plug-ins
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TaskRequest")
            .field("id", &self.id)
            .field("cpus", &self.cpus)
            .field("memory_mb", &self.memory_mb)
            .field("network_mbps", &self.network_mbps)
            .field("disk_mb", &self.disk_mb)
            .field("ports", &self.ports)
            .field("exclusive_host", &self.exclusive_host)
            .field("hard_constraints", &self.hard_constraints.len())
            .field("soft_constraints", &self.soft_constraints.len())
            .finish()
    }
}
