//! The per machine assignment engine
//!
//! Each worker machine gets one [`MachineState`] that consolidates its live
//! resource offers into a totaled view, evaluates placement constraints and
//! fitness for task requests, and commits assignments against used counters.
//! A machine state is single writer: exactly one scheduler task mutates it at
//! a time, while the published lease snapshot may be read from anywhere.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{event, Level};

use crate::conf::Engine;
use crate::models::{
    AssignmentFailure, ConstraintFailure, ConstraintOutcome, FitnessCalculator, Lease,
    ResourceUsage, TaskAssignmentResult, TaskRequest, VMAssignmentResult, VMResource,
    VmCurrentState,
};
use crate::from_now;
use crate::tracker::TaskTracker;
use crate::utils::now_ms;
use crate::Error;

mod ports;

pub use ports::PortRangePool;

/// Weight task soft constraints more than the global fitness function
const SOFT_CONSTRAINT_WEIGHT_PERCENTAGE: f64 = 75.0;

/// The lease id given to consolidated lease snapshots
const TOTAL_LEASE_ID: &str = "internal-total-lease";

/// The constraint name reported when an exclusive task owns the machine
const EXCLUSIVE_HOST_CONSTRAINT: &str = "ExclusiveHost";

/// The callback fired when a machine hands an offer back to its offerer
pub type LeaseRejectFn = Box<dyn Fn(&Lease) + Send + Sync>;

/// A concurrent index from ids to hostnames
///
/// Two of these are shared across all machine states: one mapping lease ids
/// to hostnames and one mapping vm ids to hostnames. They hold no ownership
/// over the machines they point at.
#[derive(Default)]
pub struct HostnameIndex {
    /// The indexed hostnames
    map: RwLock<HashMap<String, String>>,
}

impl HostnameIndex {
    /// Insert an entry, replacing any existing one
    ///
    /// # Arguments
    ///
    /// * `key` - The id to index
    /// * `hostname` - The hostname to map it to
    pub fn insert<K: Into<String>, H: Into<String>>(&self, key: K, hostname: H) -> Option<String> {
        let mut map = self.map.write().unwrap();
        map.insert(key.into(), hostname.into())
    }

    /// Insert an entry only if the id is not yet indexed
    ///
    /// Returns the already indexed hostname if one exists.
    ///
    /// # Arguments
    ///
    /// * `key` - The id to index
    /// * `hostname` - The hostname to map it to
    pub fn insert_if_absent<K: Into<String>, H: Into<String>>(
        &self,
        key: K,
        hostname: H,
    ) -> Option<String> {
        let mut map = self.map.write().unwrap();
        let key = key.into();
        // hand back the current mapping instead of replacing it
        if let Some(existing) = map.get(&key) {
            return Some(existing.clone());
        }
        map.insert(key, hostname.into());
        None
    }

    /// Remove an entry by id
    ///
    /// # Arguments
    ///
    /// * `key` - The id to drop from the index
    pub fn remove(&self, key: &str) -> Option<String> {
        let mut map = self.map.write().unwrap();
        map.remove(key)
    }

    /// Look up the hostname for an id
    ///
    /// # Arguments
    ///
    /// * `key` - The id to look up
    pub fn get(&self, key: &str) -> Option<String> {
        let map = self.map.read().unwrap();
        map.get(key).cloned()
    }

    /// The number of ids currently indexed
    pub fn len(&self) -> usize {
        let map = self.map.read().unwrap();
        map.len()
    }

    /// Whether this index is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A cluster wide cap on how many stale offers may be rejected in one tick
///
/// Rejecting an offer hands it back to the cluster manager; doing that for
/// every stale offer at once would churn the whole offer stream. The owner
/// resets this at each tick boundary.
#[derive(Debug)]
pub struct RejectLimiter {
    /// The number of rejections allowed per tick
    limit: u64,
    /// The number of rejections left in this tick
    remaining: u64,
}

impl RejectLimiter {
    /// Create a new reject limiter
    ///
    /// # Arguments
    ///
    /// * `limit` - The number of rejections to allow per tick
    pub fn new(limit: u64) -> Self {
        RejectLimiter {
            limit,
            remaining: limit,
        }
    }

    /// Try to consume one rejection from this tick's budget
    pub fn try_reject(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// Refill the budget at a tick boundary
    pub fn reset(&mut self) {
        self.remaining = self.limit;
    }
}

/// The collection of machines as the autoscaler sees it
///
/// The embedding scheduler owns the machine states; this trait is how the
/// autoscaler reaches back into them without racing the scheduling loop. The
/// owner must apply `disable_until` between scheduling iterations.
pub trait HostDirectory: Send + Sync {
    /// Disable a machine until the given time
    ///
    /// # Arguments
    ///
    /// * `hostname` - The machine to disable
    /// * `until_ms` - When the machine may accept offers again as epoch millis
    fn disable_until(&self, hostname: &str, until_ms: i64);

    /// The maximum achievable resource vector for one machine of a group
    ///
    /// # Arguments
    ///
    /// * `group` - The machine group to size
    fn max_resources(&self, group: &str) -> Option<HashMap<VMResource, f64>>;
}

/// The mutable resource state of a single worker machine
pub struct MachineState {
    /// The hostname of this machine
    hostname: String,
    /// The vm id behind the most recently added lease
    curr_vm_id: Option<String>,
    /// The live leases for this machine keyed by lease id
    leases: HashMap<String, Lease>,
    /// The lease ids queued for removal
    leases_to_expire: Mutex<Vec<String>>,
    /// Set when every lease should be expired at the next removal pass
    expire_all_now: AtomicBool,
    /// The task ids queued for unassignment
    tasks_to_unassign: Mutex<Vec<String>>,
    /// The callback that hands an offer back to its offerer
    reject: LeaseRejectFn,
    /// How long an offer may sit unused before it is rejected in seconds
    lease_offer_expiry_secs: i64,
    /// The total offered cpu cores
    total_cpus: f64,
    /// The assigned cpu cores
    used_cpus: f64,
    /// The total offered memory in MB
    total_memory: f64,
    /// The assigned memory in MB
    used_memory: f64,
    /// The total offered network bandwidth in Mbps
    total_network: f64,
    /// The assigned network bandwidth in Mbps
    used_network: f64,
    /// The total offered disk in MB
    total_disk: f64,
    /// The assigned disk in MB
    used_disk: f64,
    /// The offered ports
    ports: PortRangePool,
    /// The latest attributes seen on an offer for this machine
    attributes: HashMap<String, String>,
    /// The published consolidated lease snapshot
    total_lease_view: Option<Arc<Lease>>,
    /// The tasks that were on this machine before the current iteration
    previously_assigned: HashMap<String, Arc<TaskRequest>>,
    /// The assignment results of the current iteration keyed by task id
    iteration: HashMap<String, TaskAssignmentResult>,
    /// The shared index from lease ids to hostnames
    lease_index: Arc<HostnameIndex>,
    /// The shared index from vm ids to hostnames
    vm_index: Arc<HostnameIndex>,
    /// The cluster wide task index
    tracker: Arc<dyn TaskTracker>,
    /// The machine accepts no offers before this time as epoch millis
    disabled_until: i64,
    /// The task monopolizing this machine if any
    exclusive_task_id: Option<String>,
    /// Whether resource status reports include disk
    disk_in_resource_status: bool,
}

impl MachineState {
    /// Create the state for a newly sighted machine
    ///
    /// # Arguments
    ///
    /// * `hostname` - The hostname of this machine
    /// * `conf` - The assignment engine settings
    /// * `reject` - The callback that hands offers back, if any
    /// * `lease_index` - The shared index from lease ids to hostnames
    /// * `vm_index` - The shared index from vm ids to hostnames
    /// * `tracker` - The cluster wide task index
    pub fn new<H: Into<String>>(
        hostname: H,
        conf: &Engine,
        reject: Option<LeaseRejectFn>,
        lease_index: Arc<HostnameIndex>,
        vm_index: Arc<HostnameIndex>,
        tracker: Arc<dyn TaskTracker>,
    ) -> Self {
        let hostname = hostname.into();
        // fall back to logging a warning when no reject callback is registered
        let reject = match reject {
            Some(reject) => reject,
            None => {
                let host = hostname.clone();
                Box::new(move |lease: &Lease| {
                    event!(
                        Level::WARN,
                        msg = "No lease reject action registered to reject lease",
                        host = host,
                        lease = lease.id,
                    );
                })
            }
        };
        MachineState {
            hostname,
            curr_vm_id: None,
            leases: HashMap::default(),
            leases_to_expire: Mutex::new(Vec::default()),
            expire_all_now: AtomicBool::new(false),
            tasks_to_unassign: Mutex::new(Vec::default()),
            reject,
            lease_offer_expiry_secs: conf.lease_offer_expiry_secs as i64,
            total_cpus: 0.0,
            used_cpus: 0.0,
            total_memory: 0.0,
            used_memory: 0.0,
            total_network: 0.0,
            used_network: 0.0,
            total_disk: 0.0,
            used_disk: 0.0,
            ports: PortRangePool::default(),
            attributes: HashMap::default(),
            total_lease_view: None,
            previously_assigned: HashMap::default(),
            iteration: HashMap::default(),
            lease_index,
            vm_index,
            tracker,
            disabled_until: 0,
            exclusive_task_id: None,
            disk_in_resource_status: conf.disk_in_resource_status,
        }
    }

    /// The hostname of this machine
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The vm id behind the most recently added lease
    pub fn current_vm_id(&self) -> Option<&String> {
        self.curr_vm_id.as_ref()
    }

    /// Fold one lease's resources into the running totals
    ///
    /// # Arguments
    ///
    /// * `lease` - The lease to fold in
    fn fold_into_totals(&mut self, lease: &Lease) {
        self.total_cpus += lease.cpus;
        self.total_memory += lease.memory_mb;
        self.total_network += lease.network_mbps;
        self.total_disk += lease.disk_mb;
        self.ports.add(&lease.port_ranges);
        // always replace attributes with the latest offer that carries any
        if !lease.attributes.is_empty() {
            self.attributes.clear();
            self.attributes.extend(lease.attributes.clone());
        }
    }

    /// Ingest a new resource offer for this machine
    ///
    /// Returns false when the machine is disabled and the offer was handed
    /// straight back to its offerer.
    ///
    /// # Arguments
    ///
    /// * `lease` - The offer to ingest
    pub fn add_lease(&mut self, lease: Lease) -> Result<bool, Error> {
        // a new vm id means this hostname was reprovisioned under a new identity
        if self.curr_vm_id.as_deref() != Some(lease.vm_id.as_str()) {
            self.curr_vm_id = Some(lease.vm_id.clone());
            self.vm_index.insert(lease.vm_id.clone(), self.hostname.clone());
        }
        // disabled machines hand every offer straight back
        if now_ms() < self.disabled_until {
            (self.reject)(&lease);
            return Ok(false);
        }
        // the same offer cannot be ingested twice
        if self.leases.contains_key(&lease.id) {
            return Err(Error::DuplicateLease(lease.id));
        }
        // publish this lease to the shared index
        if self
            .lease_index
            .insert_if_absent(lease.id.clone(), self.hostname.clone())
            .is_some()
        {
            event!(
                Level::WARN,
                msg = "Unexpected to add a lease that already exists",
                host = self.hostname,
                lease = lease.id,
            );
        }
        self.fold_into_totals(&lease);
        self.leases.insert(lease.id.clone(), lease);
        Ok(true)
    }

    /// Queue a single lease for removal at the next removal pass
    ///
    /// # Arguments
    ///
    /// * `lease_id` - The id of the lease to expire
    pub fn expire_lease(&self, lease_id: &str) {
        event!(Level::INFO, msg = "Got request to expire lease", host = self.hostname);
        let mut queue = self.leases_to_expire.lock().unwrap();
        queue.push(lease_id.to_owned());
    }

    /// Expire every lease at the next removal pass
    pub fn expire_all_leases(&self) {
        self.expire_all_now.store(true, AtomicOrdering::SeqCst);
    }

    /// Queue a task for unassignment at the next scheduling preparation
    ///
    /// # Arguments
    ///
    /// * `task_id` - The id of the task to unassign
    pub fn mark_task_for_unassign(&self, task_id: &str) {
        let mut queue = self.tasks_to_unassign.lock().unwrap();
        queue.push(task_id.to_owned());
    }

    /// Remove all leases queued for expiry
    ///
    /// Expiring everything fires the reject callback for each removed lease;
    /// individually queued ids are dropped silently since their offerer asked
    /// for the removal.
    ///
    /// # Arguments
    ///
    /// * `force` - Expire every lease regardless of the queued ids
    pub fn remove_expired_leases(&mut self, force: bool) {
        // drain the queued ids into a set
        let expire_ids: HashSet<String> = {
            let mut queue = self.leases_to_expire.lock().unwrap();
            queue.drain(..).collect()
        };
        // consume the expire all latch
        let expire_all = self.expire_all_now.swap(false, AtomicOrdering::SeqCst) || force;
        let lease_index = &self.lease_index;
        let reject = &self.reject;
        self.leases.retain(|id, lease| {
            if expire_all || expire_ids.contains(id) {
                lease_index.remove(id);
                if expire_all {
                    (reject)(lease);
                }
                return false;
            }
            true
        });
    }

    /// Reject leases that sat unused past the offer expiry horizon
    ///
    /// Returns how many leases were rejected. The limiter caps rejections
    /// across the whole cluster; leases it denies simply stay put until a
    /// later tick.
    ///
    /// # Arguments
    ///
    /// * `limiter` - The cluster wide cap on rejections this tick
    pub fn expire_limited_leases(&mut self, limiter: &mut RejectLimiter) -> usize {
        let mut rejected = 0;
        let horizon = from_now!(-self.lease_offer_expiry_secs);
        let lease_index = &self.lease_index;
        let reject = &self.reject;
        self.leases.retain(|id, lease| {
            // only reject stale leases the limiter has budget for
            if lease.offered_at < horizon && limiter.try_reject() {
                lease_index.remove(id);
                (reject)(lease);
                rejected += 1;
                return false;
            }
            true
        });
        if rejected > 0 {
            event!(
                Level::INFO,
                msg = "Rejected stale leases",
                host = self.hostname,
                rejected = rejected,
            );
        }
        rejected
    }

    /// Zero the totals and used counters and re-fold every surviving lease
    ///
    /// Attributes are left alone so they persist when no new offer refreshes
    /// them.
    pub fn reset_resources(&mut self) {
        self.total_cpus = 0.0;
        self.used_cpus = 0.0;
        self.total_memory = 0.0;
        self.used_memory = 0.0;
        self.total_network = 0.0;
        self.used_network = 0.0;
        self.total_disk = 0.0;
        self.used_disk = 0.0;
        self.ports.clear();
        // re-fold every lease we still hold
        let leases = std::mem::take(&mut self.leases);
        for lease in leases.values() {
            self.fold_into_totals(lease);
        }
        self.leases = leases;
    }

    /// Publish an immutable snapshot of the consolidated resources
    ///
    /// The owner calls this after offer consolidation; readers on other
    /// threads hold the snapshot by shared pointer.
    pub fn update_total_lease_view(&mut self) {
        let view = Lease {
            id: TOTAL_LEASE_ID.to_owned(),
            vm_id: TOTAL_LEASE_ID.to_owned(),
            hostname: self.hostname.clone(),
            cpus: self.total_cpus,
            memory_mb: self.total_memory,
            network_mbps: self.total_network,
            disk_mb: self.total_disk,
            port_ranges: self.ports.ranges().to_vec(),
            attributes: self.attributes.clone(),
            offered_at: now_ms(),
        };
        self.total_lease_view = Some(Arc::new(view));
    }

    /// The published consolidated lease snapshot if one exists
    pub fn total_lease_view(&self) -> Option<Arc<Lease>> {
        self.total_lease_view.clone()
    }

    /// Get the value of an attribute from the published snapshot
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the attribute to get
    pub fn attr_value(&self, name: &str) -> Option<String> {
        self.total_lease_view
            .as_ref()
            .and_then(|view| view.attributes.get(name).cloned())
    }

    /// Disable this machine and hand every held offer back
    ///
    /// # Arguments
    ///
    /// * `until_ms` - When the machine may accept offers again as epoch millis
    pub fn set_disabled_until(&mut self, until_ms: i64) {
        event!(
            Level::INFO,
            msg = "Disabling machine",
            host = self.hostname,
            until = until_ms,
        );
        self.disabled_until = until_ms;
        // reject and drop every lease we hold
        let lease_index = &self.lease_index;
        let reject = &self.reject;
        self.leases.retain(|id, lease| {
            lease_index.remove(id);
            (reject)(lease);
            false
        });
    }

    /// Re-enable this machine for offers
    pub fn enable(&mut self) {
        self.disabled_until = 0;
    }

    /// When this machine may accept offers again as epoch millis
    pub fn disabled_until_ms(&self) -> i64 {
        self.disabled_until
    }

    /// Whether this machine still matters to the scheduler
    pub fn is_active(&self) -> bool {
        !self.leases.is_empty()
            || !self.previously_assigned.is_empty()
            || !self.leases_to_expire.lock().unwrap().is_empty()
            || !self.tasks_to_unassign.lock().unwrap().is_empty()
            || now_ms() < self.disabled_until
    }

    /// Whether this machine can take assignments right now
    pub fn is_assignable_now(&self) -> bool {
        now_ms() > self.disabled_until && !self.leases.is_empty()
    }

    /// Seed a task that is already running on this machine
    ///
    /// The owner calls this when it learns of running tasks outside of a
    /// scheduling iteration (e.g. on restart).
    ///
    /// # Arguments
    ///
    /// * `request` - The running task
    pub fn set_assigned_task(&mut self, request: Arc<TaskRequest>) {
        if !self.tracker.add_running_task(request.clone(), &self.hostname) {
            event!(
                Level::ERROR,
                msg = "Unexpected to add duplicate task",
                task = request.id,
            );
        }
        if request.exclusive_host {
            self.exclusive_task_id = Some(request.id.clone());
        }
        self.previously_assigned.insert(request.id.clone(), request);
    }

    /// Apply queued unassignments and clear the last iteration's results
    pub fn prepare_for_scheduling(&mut self) {
        // drain the queued task ids
        let tasks: Vec<String> = {
            let mut queue = self.tasks_to_unassign.lock().unwrap();
            queue.drain(..).collect()
        };
        for task_id in tasks {
            self.tracker.remove_running_task(&task_id);
            self.previously_assigned.remove(&task_id);
            // an unassigned exclusive task frees the machine again
            if self.exclusive_task_id.as_deref() == Some(task_id.as_str()) {
                self.exclusive_task_id = None;
            }
        }
        self.iteration.clear();
    }

    /// Whether any tasks were on this machine before the current iteration
    pub fn has_previously_assigned_tasks(&self) -> bool {
        !self.previously_assigned.is_empty()
    }

    /// The maximum resource vector achievable on this machine
    ///
    /// Sums what is already running with what is currently offered. This is a
    /// sizing hint for scaling estimates, not an allocation count; ports in
    /// particular are summed as range widths.
    pub fn max_resources(&self) -> HashMap<VMResource, f64> {
        let mut cpus = 0.0;
        let mut memory = 0.0;
        let mut network = 0.0;
        let mut ports = 0.0;
        let mut disk = 0.0;
        // count everything already running here
        for request in self.previously_assigned.values() {
            cpus += request.cpus;
            memory += request.memory_mb;
            network += request.network_mbps;
            ports += f64::from(request.ports);
            disk += request.disk_mb;
        }
        // then everything currently offered
        cpus += self.total_cpus;
        memory += self.total_memory;
        network += self.total_network;
        disk += self.total_disk;
        for range in self.ports.ranges() {
            ports += f64::from(range.end - range.beg);
        }
        let mut result = HashMap::default();
        result.insert(VMResource::Cpu, cpus);
        result.insert(VMResource::Memory, memory);
        result.insert(VMResource::Network, network);
        result.insert(VMResource::Ports, ports);
        result.insert(VMResource::Disk, disk);
        result
    }

    /// Build the view of this machine that plug-ins evaluate against
    fn vm_current_state(&self) -> VmCurrentState {
        VmCurrentState {
            hostname: &self.hostname,
            available: self.total_lease_view.as_deref(),
            assigned: self.iteration.values().collect(),
            running: self.previously_assigned.values().cloned().collect(),
        }
    }

    /// Collect every resource dimension this machine falls short on
    ///
    /// # Arguments
    ///
    /// * `request` - The task being placed
    fn resource_failures(&self, request: &TaskRequest) -> Vec<AssignmentFailure> {
        let mut failures = Vec::default();
        if self.used_cpus + request.cpus > self.total_cpus {
            failures.push(AssignmentFailure::new(
                VMResource::Cpu,
                request.cpus,
                self.used_cpus,
                self.total_cpus,
            ));
        }
        if self.used_memory + request.memory_mb > self.total_memory {
            failures.push(AssignmentFailure::new(
                VMResource::Memory,
                request.memory_mb,
                self.used_memory,
                self.total_memory,
            ));
        }
        if self.used_network + request.network_mbps > self.total_network {
            failures.push(AssignmentFailure::new(
                VMResource::Network,
                request.network_mbps,
                self.used_network,
                self.total_network,
            ));
        }
        if self.used_disk + request.disk_mb > self.total_disk {
            failures.push(AssignmentFailure::new(
                VMResource::Disk,
                request.disk_mb,
                self.used_disk,
                self.total_disk,
            ));
        }
        if !self.ports.has_ports(request.ports) {
            failures.push(AssignmentFailure::new(
                VMResource::Ports,
                f64::from(request.ports),
                f64::from(self.ports.used_ports()),
                f64::from(self.ports.total_ports()),
            ));
        }
        failures
    }

    /// Try assigning this machine's resources to a task
    ///
    /// Evaluates hard constraints first, then resource feasibility across all
    /// dimensions, then the fitness function. Soft constraints shift the final
    /// fitness as a weighted average but never reject. Returns `None` when the
    /// machine holds no leases and cannot take assignments this iteration.
    ///
    /// # Arguments
    ///
    /// * `request` - The task to place
    /// * `fitness` - The global fitness function to score with
    pub fn try_assign(
        &self,
        request: &Arc<TaskRequest>,
        fitness: &dyn FitnessCalculator,
    ) -> Option<TaskAssignmentResult> {
        // a machine without offers is not assignable this iteration
        if self.leases.is_empty() {
            return None;
        }
        // an exclusive task owns this machine outright
        if let Some(exclusive) = &self.exclusive_task_id {
            let failure = ConstraintFailure::new(
                EXCLUSIVE_HOST_CONSTRAINT,
                format!("Already has task {} with exclusive host constraint", exclusive),
            );
            return Some(TaskAssignmentResult::forbidden(
                &self.hostname,
                request.clone(),
                failure,
            ));
        }
        let vm = self.vm_current_state();
        // evaluate hard constraints in declaration order and fail on the first
        for constraint in &request.hard_constraints {
            if let ConstraintOutcome::Failed(reason) =
                constraint.evaluate(request, &vm, self.tracker.as_ref())
            {
                let failure = ConstraintFailure::new(constraint.name(), reason);
                return Some(TaskAssignmentResult::forbidden(
                    &self.hostname,
                    request.clone(),
                    failure,
                ));
            }
        }
        // collect every resource dimension that falls short, not just the first
        let failures = self.resource_failures(request);
        if !failures.is_empty() {
            return Some(TaskAssignmentResult::insufficient(
                &self.hostname,
                request.clone(),
                failures,
                0.0,
            ));
        }
        let fit = fitness.calculate_fitness(request, &vm, self.tracker.as_ref());
        // a zero fitness rejects the machine like a resource shortage would
        if fit == 0.0 {
            let failures = vec![AssignmentFailure::new(VMResource::Fitness, 1.0, 1.0, 0.0)];
            return Some(TaskAssignmentResult::insufficient(
                &self.hostname,
                request.clone(),
                failures,
                fit,
            ));
        }
        // soft constraints shift the fitness but never reject
        let final_fit = if request.soft_constraints.is_empty() {
            fit
        } else {
            let sum: f64 = request
                .soft_constraints
                .iter()
                .map(|soft| soft.calculate_fitness(request, &vm, self.tracker.as_ref()))
                .sum();
            let soft_fit = sum / request.soft_constraints.len() as f64;
            (soft_fit * SOFT_CONSTRAINT_WEIGHT_PERCENTAGE
                + fit * (100.0 - SOFT_CONSTRAINT_WEIGHT_PERCENTAGE))
                / 100.0
        };
        Some(TaskAssignmentResult::success(
            &self.hostname,
            request.clone(),
            final_fit,
        ))
    }

    /// Commit an assignment against this machine's used counters
    ///
    /// Allocates one concrete port per requested port onto the result and
    /// records the assignment for the running iteration.
    ///
    /// # Arguments
    ///
    /// * `result` - The successful assignment to commit
    pub fn assign(&mut self, mut result: TaskAssignmentResult) -> Result<(), Error> {
        self.used_cpus += result.request.cpus;
        self.used_memory += result.request.memory_mb;
        self.used_network += result.request.network_mbps;
        self.used_disk += result.request.disk_mb;
        // hand out one concrete port per requested port
        for _ in 0..result.request.ports {
            result.ports.push(self.ports.consume_next()?);
        }
        // tell the tracker about this pending assignment
        if !self
            .tracker
            .add_assigned_task(result.request.clone(), &self.hostname)
        {
            event!(
                Level::ERROR,
                msg = "Unexpected to re-add task to assigned state",
                task = result.request.id,
            );
        }
        // an exclusive task takes the machine for itself
        if result.request.exclusive_host {
            self.exclusive_task_id = Some(result.request.id.clone());
        }
        self.iteration.insert(result.request.id.clone(), result);
        Ok(())
    }

    /// Roll up the iteration's successful assignments and consume the leases
    ///
    /// Returns `None` when no assignment succeeded, leaving the machine's
    /// leases in place for the next iteration. On success the result carries
    /// every held lease and the lease map is left empty.
    pub fn reset_and_harvest_successful(&mut self) -> Option<VMAssignmentResult> {
        if self.iteration.is_empty() {
            return None;
        }
        // only harvest if at least one assignment actually succeeded
        if !self.iteration.values().any(|result| result.successful) {
            return None;
        }
        let results: Vec<TaskAssignmentResult> = self
            .iteration
            .drain()
            .map(|(_, result)| result)
            .filter(|result| result.successful)
            .collect();
        // unlink every consumed lease from the shared index
        for id in self.leases.keys() {
            self.lease_index.remove(id);
        }
        let leases: Vec<Lease> = self.leases.drain().map(|(_, lease)| lease).collect();
        Some(VMAssignmentResult {
            hostname: self.hostname.clone(),
            leases,
            results,
        })
    }

    /// Order machines for scheduling by descending total cpus
    ///
    /// Machines holding no leases sort after machines holding leases so the
    /// scheduler prefers populated hosts.
    ///
    /// # Arguments
    ///
    /// * `other` - The machine to compare against
    pub fn compare_capacity(&self, other: &Self) -> Ordering {
        match (self.leases.is_empty(), other.leases.is_empty()) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ => other
                .total_cpus
                .partial_cmp(&self.total_cpus)
                .unwrap_or(Ordering::Equal),
        }
    }

    /// Report the used and additionally available amounts per resource
    ///
    /// Disk is tracked but left out of this report unless the engine was
    /// configured to include it, since adding it changes the report schema
    /// for consumers.
    pub fn resource_status(&self) -> HashMap<VMResource, ResourceUsage> {
        let mut used_cpus = 0.0;
        let mut used_memory = 0.0;
        let mut used_ports = 0.0;
        let mut used_network = 0.0;
        let mut used_disk = 0.0;
        for request in self.previously_assigned.values() {
            used_cpus += request.cpus;
            used_memory += request.memory_mb;
            used_ports += f64::from(request.ports);
            used_network += request.network_mbps;
            used_disk += request.disk_mb;
        }
        let mut avail_cpus = 0.0;
        let mut avail_memory = 0.0;
        let mut avail_ports = 0.0;
        let mut avail_network = 0.0;
        let mut avail_disk = 0.0;
        for lease in self.leases.values() {
            avail_cpus += lease.cpus;
            avail_memory += lease.memory_mb;
            for range in &lease.port_ranges {
                avail_ports += f64::from(range.end - range.beg);
            }
            avail_network += lease.network_mbps;
            avail_disk += lease.disk_mb;
        }
        let mut status = HashMap::default();
        status.insert(
            VMResource::Cpu,
            ResourceUsage {
                used: used_cpus,
                available: avail_cpus,
            },
        );
        status.insert(
            VMResource::Memory,
            ResourceUsage {
                used: used_memory,
                available: avail_memory,
            },
        );
        status.insert(
            VMResource::Ports,
            ResourceUsage {
                used: used_ports,
                available: avail_ports,
            },
        );
        status.insert(
            VMResource::Network,
            ResourceUsage {
                used: used_network,
                available: avail_network,
            },
        );
        if self.disk_in_resource_status {
            status.insert(
                VMResource::Disk,
                ResourceUsage {
                    used: used_disk,
                    available: avail_disk,
                },
            );
        }
        status
    }

    /// The number of live leases on this machine
    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    /// The totals and used counters for tests and diagnostics
    pub fn resource_totals(&self) -> HashMap<VMResource, (f64, f64)> {
        let mut totals = HashMap::default();
        totals.insert(VMResource::Cpu, (self.used_cpus, self.total_cpus));
        totals.insert(VMResource::Memory, (self.used_memory, self.total_memory));
        totals.insert(VMResource::Network, (self.used_network, self.total_network));
        totals.insert(VMResource::Disk, (self.used_disk, self.total_disk));
        totals
    }
}
