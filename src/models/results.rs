//! The results of trying to place tasks on machines

use std::sync::Arc;

use crate::models::{Lease, TaskRequest};

/// The resource dimensions tracked on each machine
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VMResource {
    /// Cpu cores
    Cpu,
    /// Memory in MB
    Memory,
    /// Network bandwidth in Mbps
    Network,
    /// Disk in MB
    Disk,
    /// Discrete ports
    Ports,
    /// The pseudo dimension used when a fitness score rejects a machine
    Fitness,
}

impl std::fmt::Display for VMResource {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            VMResource::Cpu => write!(f, "Cpu"),
            VMResource::Memory => write!(f, "Memory"),
            VMResource::Network => write!(f, "Network"),
            VMResource::Disk => write!(f, "Disk"),
            VMResource::Ports => write!(f, "Ports"),
            VMResource::Fitness => write!(f, "Fitness"),
        }
    }
}

/// A machine not having enough of one resource for a task
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AssignmentFailure {
    /// The resource dimension that fell short
    pub resource: VMResource,
    /// How much of this resource the task asked for
    pub asking: f64,
    /// How much of this resource was already used
    pub used: f64,
    /// How much of this resource the machine has in total
    pub available: f64,
}

impl AssignmentFailure {
    /// Create a new assignment failure
    ///
    /// # Arguments
    ///
    /// * `resource` - The resource dimension that fell short
    /// * `asking` - How much the task asked for
    /// * `used` - How much was already used
    /// * `available` - How much the machine has in total
    pub fn new(resource: VMResource, asking: f64, used: f64, available: f64) -> Self {
        AssignmentFailure {
            resource,
            asking,
            used,
            available,
        }
    }
}

impl std::fmt::Display for AssignmentFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}: asking={} used={} available={}",
            self.resource, self.asking, self.used, self.available
        )
    }
}

/// A hard constraint forbidding a placement
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConstraintFailure {
    /// The name of the constraint that failed
    pub name: String,
    /// Why the constraint forbade this placement
    pub reason: String,
}

impl ConstraintFailure {
    /// Create a new constraint failure
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the constraint that failed
    /// * `reason` - Why the constraint forbade this placement
    pub fn new<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        ConstraintFailure {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// The used and additionally available amounts of one resource
///
/// The available amount is in addition to the used amount, not inclusive of
/// it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceUsage {
    /// How much of this resource is used
    pub used: f64,
    /// How much of this resource is additionally available
    pub available: f64,
}

/// The outcome of trying to place one task on one machine
#[derive(Debug)]
pub struct TaskAssignmentResult {
    /// The hostname of the machine this attempt was made against
    pub hostname: String,
    /// The task this attempt placed
    pub request: Arc<TaskRequest>,
    /// Whether the task fit on this machine
    pub successful: bool,
    /// The resource dimensions that fell short if any
    pub failures: Vec<AssignmentFailure>,
    /// The hard constraint that forbade this placement if any
    pub constraint_failure: Option<ConstraintFailure>,
    /// The fitness of this machine for this task in [0, 1]
    pub fitness: f64,
    /// The concrete ports allocated to this task once committed
    pub ports: Vec<u32>,
}

impl TaskAssignmentResult {
    /// Create a successful assignment result
    ///
    /// # Arguments
    ///
    /// * `hostname` - The machine this task fit on
    /// * `request` - The task that fit
    /// * `fitness` - The final blended fitness score
    pub fn success<H: Into<String>>(hostname: H, request: Arc<TaskRequest>, fitness: f64) -> Self {
        TaskAssignmentResult {
            hostname: hostname.into(),
            request,
            successful: true,
            failures: Vec::default(),
            constraint_failure: None,
            fitness,
            ports: Vec::default(),
        }
    }

    /// Create a failed result from resource shortages
    ///
    /// # Arguments
    ///
    /// * `hostname` - The machine this task did not fit on
    /// * `request` - The task that did not fit
    /// * `failures` - The dimensions that fell short
    /// * `fitness` - The fitness score at the point of failure
    pub fn insufficient<H: Into<String>>(
        hostname: H,
        request: Arc<TaskRequest>,
        failures: Vec<AssignmentFailure>,
        fitness: f64,
    ) -> Self {
        TaskAssignmentResult {
            hostname: hostname.into(),
            request,
            successful: false,
            failures,
            constraint_failure: None,
            fitness,
            ports: Vec::default(),
        }
    }

    /// Create a failed result from a hard constraint
    ///
    /// # Arguments
    ///
    /// * `hostname` - The machine this task was forbidden from
    /// * `request` - The task that was forbidden
    /// * `failure` - The constraint that forbade it
    pub fn forbidden<H: Into<String>>(
        hostname: H,
        request: Arc<TaskRequest>,
        failure: ConstraintFailure,
    ) -> Self {
        TaskAssignmentResult {
            hostname: hostname.into(),
            request,
            successful: false,
            failures: Vec::default(),
            constraint_failure: Some(failure),
            fitness: 0.0,
            ports: Vec::default(),
        }
    }
}

/// The committed assignments for one machine at the end of an iteration
#[derive(Debug)]
pub struct VMAssignmentResult {
    /// The hostname these assignments landed on
    pub hostname: String,
    /// The leases that were consumed to make these assignments
    pub leases: Vec<Lease>,
    /// The successful assignments for this machine
    pub results: Vec<TaskAssignmentResult>,
}
