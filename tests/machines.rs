//! Tests the per machine assignment engine end to end

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use berth::conf::Engine;
use berth::machines::{HostnameIndex, LeaseRejectFn, MachineState};
use berth::models::{TaskRequest, VMResource};
use berth::test_utilities::{gen_lease, FixedFitness, RefusingConstraint};
use berth::tracker::InMemoryTracker;

/// Build a machine with fresh shared indices and a lease reject counter
fn build_machine(hostname: &str) -> (MachineState, Arc<HostnameIndex>, Arc<AtomicUsize>) {
    let lease_index = Arc::new(HostnameIndex::default());
    let rejected = Arc::new(AtomicUsize::new(0));
    let counter = rejected.clone();
    let reject: LeaseRejectFn = Box::new(move |_lease| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let machine = MachineState::new(
        hostname,
        &Engine::default(),
        Some(reject),
        lease_index.clone(),
        Arc::new(HostnameIndex::default()),
        Arc::new(InMemoryTracker::default()),
    );
    (machine, lease_index, rejected)
}

#[test]
fn simple_placement() {
    let (mut machine, lease_index, _) = build_machine("host1");
    machine
        .add_lease(gen_lease(
            "host1",
            8.0,
            16_384.0,
            1000.0,
            100_000.0,
            &[(31_000, 31_010)],
        ))
        .unwrap();
    machine.update_total_lease_view();
    // a small task with no constraints should fit perfectly
    let request = Arc::new(TaskRequest::new("task-1", 2.0, 4096.0, 100.0, 1000.0, 2));
    let result = machine.try_assign(&request, &FixedFitness(1.0)).unwrap();
    assert!(result.successful);
    assert_eq!(result.fitness, 1.0);
    machine.assign(result).unwrap();
    // committing the assignment moves the used counters
    let totals = machine.resource_totals();
    assert_eq!(totals[&VMResource::Cpu], (2.0, 8.0));
    assert_eq!(totals[&VMResource::Memory], (4096.0, 16_384.0));
    assert_eq!(totals[&VMResource::Network], (100.0, 1000.0));
    assert_eq!(totals[&VMResource::Disk], (1000.0, 100_000.0));
    // harvesting consumes the leases and returns the assignment with ports
    let harvest = machine.reset_and_harvest_successful().unwrap();
    assert_eq!(harvest.hostname, "host1");
    assert_eq!(harvest.leases.len(), 1);
    assert_eq!(harvest.results.len(), 1);
    assert_eq!(harvest.results[0].ports, vec![31_000, 31_001]);
    assert_eq!(machine.lease_count(), 0);
    assert!(lease_index.is_empty());
}

#[test]
fn exclusive_host_is_sticky() {
    let (mut machine, _, _) = build_machine("host1");
    machine
        .add_lease(gen_lease(
            "host1",
            8.0,
            16_384.0,
            1000.0,
            100_000.0,
            &[(31_000, 31_010)],
        ))
        .unwrap();
    machine.update_total_lease_view();
    // the first task takes the machine all for itself
    let exclusive = Arc::new(TaskRequest::new("task-1", 1.0, 1024.0, 0.0, 0.0, 0).exclusive());
    let result = machine.try_assign(&exclusive, &FixedFitness(1.0)).unwrap();
    assert!(result.successful);
    machine.assign(result).unwrap();
    // any other task must now be turned away naming the exclusive constraint
    let request = Arc::new(TaskRequest::new("task-2", 1.0, 1024.0, 0.0, 0.0, 0));
    let result = machine.try_assign(&request, &FixedFitness(1.0)).unwrap();
    assert!(!result.successful);
    let failure = result.constraint_failure.unwrap();
    assert_eq!(failure.name, "ExclusiveHost");
    assert!(failure.reason.contains("task-1"));
}

#[test]
fn zero_fitness_is_a_failure() {
    let (mut machine, _, _) = build_machine("host1");
    machine
        .add_lease(gen_lease(
            "host1",
            8.0,
            16_384.0,
            1000.0,
            100_000.0,
            &[(31_000, 31_010)],
        ))
        .unwrap();
    machine.update_total_lease_view();
    // plenty of resources but the fitness function rejects the machine
    let request = Arc::new(TaskRequest::new("task-1", 1.0, 1024.0, 0.0, 0.0, 0));
    let result = machine.try_assign(&request, &FixedFitness(0.0)).unwrap();
    assert!(!result.successful);
    assert_eq!(result.fitness, 0.0);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].resource, VMResource::Fitness);
}

#[test]
fn hard_constraints_fail_by_name() {
    let (mut machine, _, _) = build_machine("host1");
    machine
        .add_lease(gen_lease("host1", 8.0, 16_384.0, 1000.0, 100_000.0, &[]))
        .unwrap();
    machine.update_total_lease_view();
    let request = Arc::new(
        TaskRequest::new("task-1", 1.0, 1024.0, 0.0, 0.0, 0)
            .with_hard_constraint(Box::new(RefusingConstraint)),
    );
    let result = machine.try_assign(&request, &FixedFitness(1.0)).unwrap();
    assert!(!result.successful);
    let failure = result.constraint_failure.unwrap();
    assert_eq!(failure.name, "RefusingConstraint");
}

#[test]
fn all_failing_dimensions_are_reported() {
    let (mut machine, _, _) = build_machine("host1");
    machine
        .add_lease(gen_lease("host1", 2.0, 2048.0, 1000.0, 100_000.0, &[]))
        .unwrap();
    machine.update_total_lease_view();
    // too many cpus, too much memory, and ports nobody offered
    let request = Arc::new(TaskRequest::new("task-1", 4.0, 4096.0, 100.0, 1000.0, 2));
    let result = machine.try_assign(&request, &FixedFitness(1.0)).unwrap();
    assert!(!result.successful);
    let dimensions: Vec<VMResource> = result
        .failures
        .iter()
        .map(|failure| failure.resource)
        .collect();
    assert_eq!(
        dimensions,
        vec![VMResource::Cpu, VMResource::Memory, VMResource::Ports]
    );
}

#[test]
fn soft_constraints_blend_into_fitness() {
    let (mut machine, _, _) = build_machine("host1");
    machine
        .add_lease(gen_lease("host1", 8.0, 16_384.0, 1000.0, 100_000.0, &[]))
        .unwrap();
    machine.update_total_lease_view();
    // soft fit 0.5 at weight 75 against a perfect global fit
    let request = Arc::new(
        TaskRequest::new("task-1", 1.0, 1024.0, 0.0, 0.0, 0)
            .with_soft_constraint(Box::new(FixedFitness(0.5))),
    );
    let result = machine.try_assign(&request, &FixedFitness(1.0)).unwrap();
    assert!(result.successful);
    assert!((result.fitness - 0.625).abs() < 1e-9);
}

#[test]
fn machines_without_leases_are_not_assignable() {
    let (machine, _, _) = build_machine("host1");
    let request = Arc::new(TaskRequest::new("task-1", 1.0, 1024.0, 0.0, 0.0, 0));
    assert!(machine.try_assign(&request, &FixedFitness(1.0)).is_none());
}

#[test]
fn expire_one_lease_round_trips_totals() {
    let (mut machine, lease_index, rejected) = build_machine("host1");
    let lease = gen_lease("host1", 8.0, 16_384.0, 1000.0, 100_000.0, &[(7000, 7009)]);
    let lease_id = lease.id.clone();
    machine.add_lease(lease).unwrap();
    // expiry is deferred until the removal pass runs
    machine.expire_lease(&lease_id);
    assert_eq!(machine.lease_count(), 1);
    machine.remove_expired_leases(false);
    machine.reset_resources();
    // the machine is back to its pre-add totals
    assert_eq!(machine.lease_count(), 0);
    let totals = machine.resource_totals();
    assert_eq!(totals[&VMResource::Cpu], (0.0, 0.0));
    assert_eq!(totals[&VMResource::Memory], (0.0, 0.0));
    assert!(lease_index.is_empty());
    // individually expired leases are not handed back to the offerer
    assert_eq!(rejected.load(Ordering::SeqCst), 0);
}

#[test]
fn expire_all_matches_forced_removal() {
    // the queued expire-all latch rejects every lease back
    let (mut machine, _, rejected) = build_machine("host1");
    machine
        .add_lease(gen_lease("host1", 4.0, 8192.0, 1000.0, 100_000.0, &[]))
        .unwrap();
    machine
        .add_lease(gen_lease("host1", 4.0, 8192.0, 1000.0, 100_000.0, &[]))
        .unwrap();
    machine.expire_all_leases();
    machine.remove_expired_leases(false);
    assert_eq!(machine.lease_count(), 0);
    assert_eq!(rejected.load(Ordering::SeqCst), 2);
    // a forced removal behaves the same way
    let (mut forced, _, forced_rejected) = build_machine("host1");
    forced
        .add_lease(gen_lease("host1", 4.0, 8192.0, 1000.0, 100_000.0, &[]))
        .unwrap();
    forced
        .add_lease(gen_lease("host1", 4.0, 8192.0, 1000.0, 100_000.0, &[]))
        .unwrap();
    forced.remove_expired_leases(true);
    assert_eq!(forced.lease_count(), 0);
    assert_eq!(forced_rejected.load(Ordering::SeqCst), 2);
}

#[test]
fn reset_resources_keeps_attributes() {
    let (mut machine, _, _) = build_machine("host1");
    let mut lease = gen_lease("host1", 4.0, 8192.0, 1000.0, 100_000.0, &[]);
    lease
        .attributes
        .insert("zone".to_owned(), "us-east-1a".to_owned());
    machine.add_lease(lease).unwrap();
    machine.update_total_lease_view();
    assert_eq!(machine.attr_value("zone").as_deref(), Some("us-east-1a"));
    // resetting refolds totals but leaves attributes alone
    machine.reset_resources();
    machine.update_total_lease_view();
    assert_eq!(machine.attr_value("zone").as_deref(), Some("us-east-1a"));
    let totals = machine.resource_totals();
    assert_eq!(totals[&VMResource::Cpu], (0.0, 4.0));
}

#[test]
fn failed_iterations_harvest_nothing_and_keep_leases() {
    let (mut machine, _, _) = build_machine("host1");
    machine
        .add_lease(gen_lease("host1", 1.0, 1024.0, 1000.0, 100_000.0, &[]))
        .unwrap();
    machine.update_total_lease_view();
    // the task is too big so nothing gets assigned
    let request = Arc::new(TaskRequest::new("task-1", 8.0, 1024.0, 0.0, 0.0, 0));
    let result = machine.try_assign(&request, &FixedFitness(1.0)).unwrap();
    assert!(!result.successful);
    assert!(machine.reset_and_harvest_successful().is_none());
    // the leases stay put for the next iteration
    assert_eq!(machine.lease_count(), 1);
}

#[test]
fn unassigning_tasks_frees_previous_state() {
    let (mut machine, _, _) = build_machine("host1");
    // seed a running exclusive task from before this process started
    let request = Arc::new(TaskRequest::new("task-1", 2.0, 4096.0, 0.0, 0.0, 0).exclusive());
    machine.set_assigned_task(request);
    assert!(machine.has_previously_assigned_tasks());
    machine
        .add_lease(gen_lease("host1", 8.0, 16_384.0, 1000.0, 100_000.0, &[]))
        .unwrap();
    machine.update_total_lease_view();
    // the exclusive marker blocks every newcomer
    let other = Arc::new(TaskRequest::new("task-2", 1.0, 1024.0, 0.0, 0.0, 0));
    let result = machine.try_assign(&other, &FixedFitness(1.0)).unwrap();
    assert!(!result.successful);
    // unassigning the task at the next preparation frees the machine
    machine.mark_task_for_unassign("task-1");
    machine.prepare_for_scheduling();
    assert!(!machine.has_previously_assigned_tasks());
    let result = machine.try_assign(&other, &FixedFitness(1.0)).unwrap();
    assert!(result.successful);
}

#[test]
fn max_resources_counts_ports_as_range_widths() {
    let (mut machine, _, _) = build_machine("host1");
    machine
        .add_lease(gen_lease(
            "host1",
            8.0,
            16_384.0,
            1000.0,
            100_000.0,
            &[(31_000, 31_010)],
        ))
        .unwrap();
    machine.update_total_lease_view();
    let request = Arc::new(TaskRequest::new("task-1", 2.0, 4096.0, 100.0, 1000.0, 2));
    machine.set_assigned_task(request);
    let max = machine.max_resources();
    assert_eq!(max[&VMResource::Cpu], 10.0);
    assert_eq!(max[&VMResource::Memory], 20_480.0);
    // ports sum range widths plus the running task's count
    assert_eq!(max[&VMResource::Ports], 12.0);
}
