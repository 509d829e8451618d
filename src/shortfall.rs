//! Estimates how many machines a group is short from placement failures
//!
//! The autoscaler treats the evaluator as an opaque oracle: it hands over the
//! known group names and the per task placement failures and gets back a
//! machine count per group. A group missing from the returned map needs
//! nothing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{event, Level};

use crate::machines::HostDirectory;
use crate::models::{TaskAssignmentResult, TaskRequest, VMResource};

/// Estimates per group machine shortfall from placement failures
pub trait ShortfallEvaluator: Send {
    /// Estimate how many machines each group needs to place all failing tasks
    ///
    /// # Arguments
    ///
    /// * `groups` - The names of the known machine groups
    /// * `failures` - The per machine failures for each unplaced task
    fn shortfall(
        &mut self,
        groups: &HashSet<String>,
        failures: &HashMap<String, Vec<TaskAssignmentResult>>,
    ) -> HashMap<String, usize>;
}

/// The remaining capacity of one phantom machine
#[derive(Debug, Clone, Copy)]
struct PhantomMachine {
    /// The remaining cpu cores
    cpus: f64,
    /// The remaining memory in MB
    memory_mb: f64,
    /// The remaining network bandwidth in Mbps
    network_mbps: f64,
    /// The remaining disk in MB
    disk_mb: f64,
    /// The remaining ports
    ports: f64,
}

impl PhantomMachine {
    /// Whether a task still fits on this phantom machine
    ///
    /// # Arguments
    ///
    /// * `request` - The task to check
    fn fits(&self, request: &TaskRequest) -> bool {
        request.cpus <= self.cpus
            && request.memory_mb <= self.memory_mb
            && request.network_mbps <= self.network_mbps
            && request.disk_mb <= self.disk_mb
            && f64::from(request.ports) <= self.ports
    }

    /// Deduct a task's demand from this phantom machine
    ///
    /// # Arguments
    ///
    /// * `request` - The task to place
    fn consume(&mut self, request: &TaskRequest) {
        self.cpus -= request.cpus;
        self.memory_mb -= request.memory_mb;
        self.network_mbps -= request.network_mbps;
        self.disk_mb -= request.disk_mb;
        self.ports -= f64::from(request.ports);
    }
}

/// A shortfall evaluator that packs failed tasks onto phantom machines
///
/// Each group's phantom machine is shaped by the maximum achievable resource
/// vector the assignment engine reports for that group. The estimate is a
/// first fit pack of every failing task, so it leans pessimistic when tasks
/// fragment badly.
pub struct ResourceShortfallEvaluator {
    /// Where to look up each group's maximum machine shape
    directory: Arc<dyn HostDirectory>,
}

impl ResourceShortfallEvaluator {
    /// Create a new resource shortfall evaluator
    ///
    /// # Arguments
    ///
    /// * `directory` - Where to look up each group's maximum machine shape
    pub fn new(directory: Arc<dyn HostDirectory>) -> Self {
        ResourceShortfallEvaluator { directory }
    }

    /// Estimate the machines needed to fit all failing tasks in one group
    ///
    /// # Arguments
    ///
    /// * `group` - The group to estimate for
    /// * `failures` - The per machine failures for each unplaced task
    fn estimate(
        &self,
        group: &str,
        failures: &BTreeMap<&String, &Vec<TaskAssignmentResult>>,
    ) -> usize {
        // get the biggest machine shape this group can field
        let max = match self.directory.max_resources(group) {
            Some(max) => max,
            None => return 0,
        };
        let shape = PhantomMachine {
            cpus: max.get(&VMResource::Cpu).copied().unwrap_or(0.0),
            memory_mb: max.get(&VMResource::Memory).copied().unwrap_or(0.0),
            network_mbps: max.get(&VMResource::Network).copied().unwrap_or(0.0),
            disk_mb: max.get(&VMResource::Disk).copied().unwrap_or(0.0),
            ports: max.get(&VMResource::Ports).copied().unwrap_or(0.0),
        };
        // a group with no known capacity can't be sized
        if shape.cpus <= 0.0 && shape.memory_mb <= 0.0 {
            return 0;
        }
        // pack each failing task onto the first phantom machine it fits
        let mut phantoms: Vec<PhantomMachine> = Vec::default();
        for (task_id, results) in failures {
            // every failure for a task carries the same request
            let request = match results.first() {
                Some(result) => &result.request,
                None => continue,
            };
            // tasks bigger than an empty machine can't be helped by scaling
            if !shape.fits(request) {
                event!(
                    Level::WARN,
                    msg = "Task outsizes this group's machines",
                    task = task_id.as_str(),
                    group = group,
                );
                continue;
            }
            match phantoms.iter_mut().find(|phantom| phantom.fits(request)) {
                Some(phantom) => phantom.consume(request),
                None => {
                    // open a fresh phantom machine for this task
                    let mut phantom = shape;
                    phantom.consume(request);
                    phantoms.push(phantom);
                }
            }
        }
        phantoms.len()
    }
}

impl ShortfallEvaluator for ResourceShortfallEvaluator {
    /// Estimate how many machines each group needs to place all failing tasks
    fn shortfall(
        &mut self,
        groups: &HashSet<String>,
        failures: &HashMap<String, Vec<TaskAssignmentResult>>,
    ) -> HashMap<String, usize> {
        let mut estimates = HashMap::default();
        if failures.is_empty() {
            return estimates;
        }
        // order the tasks so the pack estimate is stable across ticks
        let ordered: BTreeMap<&String, &Vec<TaskAssignmentResult>> = failures.iter().collect();
        for group in groups {
            let needed = self.estimate(group, &ordered);
            if needed > 0 {
                estimates.insert(group.clone(), needed);
            }
        }
        estimates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::models::TaskRequest;

    /// A directory that reports one fixed machine shape for every group
    struct FixedDirectory {
        /// The machine shape to report
        max: HashMap<VMResource, f64>,
    }

    impl FixedDirectory {
        fn new(cpus: f64, memory_mb: f64) -> Self {
            let mut max = HashMap::default();
            max.insert(VMResource::Cpu, cpus);
            max.insert(VMResource::Memory, memory_mb);
            max.insert(VMResource::Network, 10_000.0);
            max.insert(VMResource::Disk, 100_000.0);
            max.insert(VMResource::Ports, 100.0);
            FixedDirectory { max }
        }
    }

    impl HostDirectory for FixedDirectory {
        fn disable_until(&self, _hostname: &str, _until_ms: i64) {}

        fn max_resources(&self, _group: &str) -> Option<HashMap<VMResource, f64>> {
            Some(self.max.clone())
        }
    }

    /// Build a failure record for a task of the given size
    fn failed(task_id: &str, cpus: f64, memory_mb: f64) -> (String, Vec<TaskAssignmentResult>) {
        let request = Arc::new(TaskRequest::new(task_id, cpus, memory_mb, 0.0, 0.0, 0));
        let result = TaskAssignmentResult::insufficient("host1", request, Vec::default(), 0.0);
        (task_id.to_owned(), vec![result])
    }

    #[test]
    fn packs_tasks_onto_phantom_machines() {
        let mut evaluator =
            ResourceShortfallEvaluator::new(Arc::new(FixedDirectory::new(8.0, 16_384.0)));
        let groups: HashSet<String> = ["small".to_owned()].into_iter().collect();
        // three 4 cpu tasks need two 8 cpu machines
        let failures: HashMap<_, _> = [
            failed("task-1", 4.0, 4096.0),
            failed("task-2", 4.0, 4096.0),
            failed("task-3", 4.0, 4096.0),
        ]
        .into_iter()
        .collect();
        let estimates = evaluator.shortfall(&groups, &failures);
        assert_eq!(estimates.get("small"), Some(&2));
    }

    #[test]
    fn oversized_tasks_do_not_inflate_the_estimate() {
        let mut evaluator =
            ResourceShortfallEvaluator::new(Arc::new(FixedDirectory::new(4.0, 8192.0)));
        let groups: HashSet<String> = ["small".to_owned()].into_iter().collect();
        // a 16 cpu task can never fit on a 4 cpu machine
        let failures: HashMap<_, _> = [failed("task-1", 16.0, 4096.0)].into_iter().collect();
        let estimates = evaluator.shortfall(&groups, &failures);
        assert!(estimates.is_empty());
    }

    #[test]
    fn no_failures_means_no_shortfall() {
        let mut evaluator =
            ResourceShortfallEvaluator::new(Arc::new(FixedDirectory::new(8.0, 16_384.0)));
        let groups: HashSet<String> = ["small".to_owned()].into_iter().collect();
        let estimates = evaluator.shortfall(&groups, &HashMap::default());
        assert!(estimates.is_empty());
    }
}
