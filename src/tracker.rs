//! The contract for the cluster wide task index
//!
//! The assignment engine reports placements into a tracker and constraint
//! plug-ins read cluster wide state back out of it. How the index is stored
//! and replicated is up to the embedding scheduler; an in-memory
//! implementation ships here for single process use and tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::models::TaskRequest;

/// A task known to the tracker along with where it lives
#[derive(Debug, Clone)]
pub struct ActiveTask {
    /// The task itself
    pub request: Arc<TaskRequest>,
    /// The hostname this task is on
    pub hostname: String,
}

/// The cluster wide index of running and assigned tasks
pub trait TaskTracker: Send + Sync {
    /// Track a task that is already running on a machine
    ///
    /// Returns false if a task with this id was already tracked as running.
    ///
    /// # Arguments
    ///
    /// * `request` - The running task
    /// * `hostname` - The hostname the task runs on
    fn add_running_task(&self, request: Arc<TaskRequest>, hostname: &str) -> bool;

    /// Track a task assigned in the current scheduling iteration
    ///
    /// Returns false if a task with this id was already tracked as assigned.
    ///
    /// # Arguments
    ///
    /// * `request` - The newly assigned task
    /// * `hostname` - The hostname the task was assigned to
    fn add_assigned_task(&self, request: Arc<TaskRequest>, hostname: &str) -> bool;

    /// Stop tracking a running task
    ///
    /// Returns false if no task with this id was tracked as running.
    ///
    /// # Arguments
    ///
    /// * `task_id` - The id of the task to stop tracking
    fn remove_running_task(&self, task_id: &str) -> bool;

    /// Drop all tasks tracked as assigned
    ///
    /// The owner calls this at the start of each scheduling iteration.
    fn clear_assigned_tasks(&self);

    /// Get all tasks currently tracked as running
    fn running_tasks(&self) -> HashMap<String, ActiveTask>;

    /// Get all tasks assigned in the current scheduling iteration
    fn assigned_tasks(&self) -> HashMap<String, ActiveTask>;
}

/// A process local task tracker
#[derive(Default)]
pub struct InMemoryTracker {
    /// The tasks currently running keyed by task id
    running: RwLock<HashMap<String, ActiveTask>>,
    /// The tasks assigned in the current iteration keyed by task id
    assigned: RwLock<HashMap<String, ActiveTask>>,
}

impl TaskTracker for InMemoryTracker {
    /// Track a task that is already running on a machine
    fn add_running_task(&self, request: Arc<TaskRequest>, hostname: &str) -> bool {
        let mut running = self.running.write().unwrap();
        // refuse to double track the same task id
        if running.contains_key(&request.id) {
            return false;
        }
        let task = ActiveTask {
            hostname: hostname.to_owned(),
            request,
        };
        running.insert(task.request.id.clone(), task);
        true
    }

    /// Track a task assigned in the current scheduling iteration
    fn add_assigned_task(&self, request: Arc<TaskRequest>, hostname: &str) -> bool {
        let mut assigned = self.assigned.write().unwrap();
        // refuse to double track the same task id
        if assigned.contains_key(&request.id) {
            return false;
        }
        let task = ActiveTask {
            hostname: hostname.to_owned(),
            request,
        };
        assigned.insert(task.request.id.clone(), task);
        true
    }

    /// Stop tracking a running task
    fn remove_running_task(&self, task_id: &str) -> bool {
        let mut running = self.running.write().unwrap();
        running.remove(task_id).is_some()
    }

    /// Drop all tasks tracked as assigned
    fn clear_assigned_tasks(&self) {
        let mut assigned = self.assigned.write().unwrap();
        assigned.clear();
    }

    /// Get all tasks currently tracked as running
    fn running_tasks(&self) -> HashMap<String, ActiveTask> {
        let running = self.running.read().unwrap();
        running.clone()
    }

    /// Get all tasks assigned in the current scheduling iteration
    fn assigned_tasks(&self) -> HashMap<String, ActiveTask> {
        let assigned = self.assigned.read().unwrap();
        assigned.clone()
    }
}
