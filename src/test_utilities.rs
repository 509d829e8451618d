//! The utilities for tests involving the placement engine

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::conf::Conf;
use crate::machines::HostDirectory;
use crate::models::{
    ConstraintEvaluator, ConstraintOutcome, FitnessCalculator, Lease, PortRange, TaskRequest,
    VMResource, VmCurrentState,
};
use crate::tracker::TaskTracker;
use crate::utils::{gen_string, now_ms};
use crate::Error;

/// Build a lease with a random id for a host
///
/// # Arguments
///
/// * `hostname` - The hostname this offer comes from
/// * `cpus` - The offered cpu cores
/// * `memory_mb` - The offered memory in MB
/// * `network_mbps` - The offered network bandwidth in Mbps
/// * `disk_mb` - The offered disk in MB
/// * `ranges` - The offered port ranges as begin/end pairs
pub fn gen_lease(
    hostname: &str,
    cpus: f64,
    memory_mb: f64,
    network_mbps: f64,
    disk_mb: f64,
    ranges: &[(u32, u32)],
) -> Lease {
    Lease {
        id: format!("lease-{}", gen_string(12)),
        vm_id: format!("vm-{}", hostname),
        hostname: hostname.to_owned(),
        cpus,
        memory_mb,
        network_mbps,
        disk_mb,
        port_ranges: ranges
            .iter()
            .map(|(beg, end)| PortRange::new(*beg, *end))
            .collect(),
        attributes: HashMap::default(),
        offered_at: now_ms(),
    }
}

/// Build a lease carrying attributes
///
/// # Arguments
///
/// * `hostname` - The hostname this offer comes from
/// * `cpus` - The offered cpu cores
/// * `memory_mb` - The offered memory in MB
/// * `attrs` - The attributes to tag onto the offer
pub fn gen_attr_lease(
    hostname: &str,
    cpus: f64,
    memory_mb: f64,
    attrs: &[(&str, &str)],
) -> Lease {
    let mut lease = gen_lease(hostname, cpus, memory_mb, 1000.0, 100_000.0, &[]);
    for (key, value) in attrs {
        lease
            .attributes
            .insert((*key).to_owned(), (*value).to_owned());
    }
    lease
}

/// A fitness calculator that always returns the same score
pub struct FixedFitness(pub f64);

impl FitnessCalculator for FixedFitness {
    /// The name of this calculator
    fn name(&self) -> &str {
        "FixedFitness"
    }

    /// Score a machine for a task
    fn calculate_fitness(
        &self,
        _request: &TaskRequest,
        _vm: &VmCurrentState,
        _tracker: &dyn TaskTracker,
    ) -> f64 {
        self.0
    }
}

/// A hard constraint that always forbids placement
pub struct RefusingConstraint;

impl ConstraintEvaluator for RefusingConstraint {
    /// The name of this constraint
    fn name(&self) -> &str {
        "RefusingConstraint"
    }

    /// Judge whether a task may be placed on a machine
    fn evaluate(
        &self,
        _request: &TaskRequest,
        _vm: &VmCurrentState,
        _tracker: &dyn TaskTracker,
    ) -> ConstraintOutcome {
        ConstraintOutcome::Failed("this constraint refuses every machine".to_owned())
    }
}

/// A host directory that records disables and serves fixed machine shapes
#[derive(Default)]
pub struct RecordingDirectory {
    /// The hosts that were disabled and until when
    disabled: Mutex<HashMap<String, i64>>,
    /// The machine shape to report per group
    max: RwLock<HashMap<String, HashMap<VMResource, f64>>>,
}

impl RecordingDirectory {
    /// Set the machine shape to report for a group
    ///
    /// # Arguments
    ///
    /// * `group` - The group to shape
    /// * `cpus` - The cpu cores of the group's biggest machine
    /// * `memory_mb` - The memory of the group's biggest machine in MB
    pub fn set_max(&self, group: &str, cpus: f64, memory_mb: f64) {
        let mut shape = HashMap::default();
        shape.insert(VMResource::Cpu, cpus);
        shape.insert(VMResource::Memory, memory_mb);
        shape.insert(VMResource::Network, 10_000.0);
        shape.insert(VMResource::Disk, 1_000_000.0);
        shape.insert(VMResource::Ports, 1000.0);
        let mut max = self.max.write().unwrap();
        max.insert(group.to_owned(), shape);
    }

    /// Snapshot the hosts that were disabled and until when
    pub fn disabled(&self) -> HashMap<String, i64> {
        let disabled = self.disabled.lock().unwrap();
        disabled.clone()
    }
}

impl HostDirectory for RecordingDirectory {
    /// Disable a machine until the given time
    fn disable_until(&self, hostname: &str, until_ms: i64) {
        let mut disabled = self.disabled.lock().unwrap();
        disabled.insert(hostname.to_owned(), until_ms);
    }

    /// The maximum achievable resource vector for one machine of a group
    fn max_resources(&self, group: &str) -> Option<HashMap<VMResource, f64>> {
        let max = self.max.read().unwrap();
        max.get(group).cloned()
    }
}

/// Deserialize a config straight from a YAML string
///
/// # Arguments
///
/// * `yaml` - The raw YAML to build a config from
pub fn conf_from_yaml(yaml: &str) -> Result<Conf, Error> {
    let conf: Conf = serde_yaml::from_str(yaml)?;
    conf.validate()?;
    Ok(conf)
}
