//! The autoscaling control loop
//!
//! Each tick pairs the currently idle machines with the tasks that recently
//! failed to place and turns them into scale up or scale down
//! recommendations, honoring per rule cooldowns and the idle host hysteresis
//! band. The loop only recommends; executing a recommendation is up to
//! whoever listens on the action stream.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{event, instrument, Level};

use crate::conf::Autoscaling;
use crate::machines::HostDirectory;
use crate::models::{
    AutoScaleAction, AutoScaleRule, AutoScaleRules, AutoscalerInput, Lease, ScaleKind,
};
use crate::shortfall::{ResourceShortfallEvaluator, ShortfallEvaluator};
use crate::utils::now_ms;

/// Delay the first scale action after boot by up to this many seconds
const INITIAL_COOL_DOWN_SECS: i64 = 120;

/// The bucket for hosts missing the balance attribute
const DEFAULT_BALANCE_BUCKET: &str = "default";

/// How many unread scale actions the broadcast stream buffers per listener
const ACTION_CHANNEL_CAPACITY: usize = 256;

/// The machine groups currently allowed to scale
///
/// Replacing the group set also stamps `last_set_at`, which acts as a global
/// fence that restarts every rule's cooldown.
#[derive(Default)]
pub struct ActiveVmGroups {
    /// The names of the active groups; empty means every group is active
    groups: RwLock<Vec<String>>,
    /// When the group set was last replaced as epoch millis
    last_set_at: AtomicI64,
}

impl ActiveVmGroups {
    /// Replace the set of active groups
    ///
    /// # Arguments
    ///
    /// * `groups` - The names of the groups allowed to scale
    pub fn set_groups(&self, groups: Vec<String>) {
        let mut current = self.groups.write().unwrap();
        *current = groups;
        self.last_set_at.store(now_ms(), AtomicOrdering::SeqCst);
    }

    /// Whether a group is currently allowed to scale
    ///
    /// # Arguments
    ///
    /// * `name` - The group name to check
    pub fn is_active(&self, name: &str) -> bool {
        let groups = self.groups.read().unwrap();
        groups.is_empty() || groups.iter().any(|group| group == name)
    }

    /// When the group set was last replaced as epoch millis
    pub fn last_set_at(&self) -> i64 {
        self.last_set_at.load(AtomicOrdering::SeqCst)
    }
}

/// What a rule last did and when
#[derive(Debug, Clone)]
pub struct ScalingActivity {
    /// When this rule last scaled up as epoch millis
    pub scale_up_at: i64,
    /// When this rule last scaled down as epoch millis
    pub scale_down_at: i64,
    /// The shortfall seen at the last action
    pub shortfall: usize,
    /// How many machines the last action covered
    pub scaled_count: usize,
    /// The direction of the last action if any
    pub last_kind: Option<ScaleKind>,
}

impl ScalingActivity {
    /// Create the activity record for a newly seen rule
    ///
    /// The synthetic timestamps place the first allowed action a fixed delay
    /// after boot instead of immediately.
    ///
    /// # Arguments
    ///
    /// * `cool_down_secs` - The rule's cooldown
    /// * `now` - The current time as epoch millis
    fn initial(cool_down_secs: u64, now: i64) -> Self {
        let cool_ms = cool_down_secs as i64 * 1000;
        let initial_secs = INITIAL_COOL_DOWN_SECS.min(cool_down_secs as i64);
        let at = now - cool_ms + initial_secs * 1000;
        ScalingActivity {
            scale_up_at: at,
            scale_down_at: at,
            shortfall: 0,
            scaled_count: 0,
            last_kind: None,
        }
    }
}

/// One rule's slice of a single tick
struct HostAttributeGroup {
    /// The name of this group and of the rule that governs it
    name: String,
    /// The rule that governs this group
    rule: Arc<dyn AutoScaleRule>,
    /// The idle machines partitioned into this group
    idle_hosts: Vec<Lease>,
    /// The estimated machine shortfall for this group
    shortfall: usize,
}

/// Recommends scaling machine groups up and down
pub struct Autoscaler {
    /// The attribute that partitions machines into scaling groups
    partition_attribute_name: String,
    /// The attribute whose value identifies a host to the terminator
    map_hostname_attribute_name: Option<String>,
    /// The attribute to balance scale down victims across
    scale_down_balanced_by_attribute_name: Option<String>,
    /// Whether to skip estimating shortfall from placement failures
    disable_shortfall_evaluation: bool,
    /// The live rule set, read fresh each tick
    rules: Arc<AutoScaleRules>,
    /// The groups currently allowed to scale
    active_groups: Arc<ActiveVmGroups>,
    /// The machine collection to disable scale down victims through
    directory: Arc<dyn HostDirectory>,
    /// The oracle that estimates machine shortfall per group
    shortfall: Box<dyn ShortfallEvaluator>,
    /// What each rule last did keyed by rule name
    activity: HashMap<String, ScalingActivity>,
    /// The stream of per tick inputs
    inputs: kanal::AsyncReceiver<AutoscalerInput>,
    /// The broadcast stream of scale recommendations
    actions: broadcast::Sender<AutoScaleAction>,
}

impl Autoscaler {
    /// Create a new autoscaler
    ///
    /// # Arguments
    ///
    /// * `conf` - The autoscaler settings
    /// * `directory` - The machine collection to disable victims through
    /// * `inputs` - The stream of per tick inputs
    pub fn new(
        conf: &Autoscaling,
        directory: Arc<dyn HostDirectory>,
        inputs: kanal::AsyncReceiver<AutoscalerInput>,
    ) -> Self {
        // build the starting rules and the default shortfall oracle
        let rules = Arc::new(AutoScaleRules::from_conf(conf));
        let shortfall = Box::new(ResourceShortfallEvaluator::new(directory.clone()));
        let (actions, _) = broadcast::channel(ACTION_CHANNEL_CAPACITY);
        Autoscaler {
            partition_attribute_name: conf.partition_attribute_name.clone(),
            map_hostname_attribute_name: conf.map_hostname_attribute_name.clone(),
            scale_down_balanced_by_attribute_name: conf
                .scale_down_balanced_by_attribute_name
                .clone(),
            disable_shortfall_evaluation: conf.disable_shortfall_evaluation,
            rules,
            active_groups: Arc::new(ActiveVmGroups::default()),
            directory,
            shortfall,
            activity: HashMap::default(),
            inputs,
            actions,
        }
    }

    /// Swap in a different shortfall oracle
    ///
    /// # Arguments
    ///
    /// * `shortfall` - The oracle to estimate machine shortfall with
    #[must_use]
    pub fn with_shortfall_evaluator(mut self, shortfall: Box<dyn ShortfallEvaluator>) -> Self {
        self.shortfall = shortfall;
        self
    }

    /// The live rule set shared with this autoscaler
    pub fn rules(&self) -> Arc<AutoScaleRules> {
        self.rules.clone()
    }

    /// The active group set shared with this autoscaler
    pub fn active_groups(&self) -> Arc<ActiveVmGroups> {
        self.active_groups.clone()
    }

    /// What a rule last did if it has been seen
    ///
    /// # Arguments
    ///
    /// * `rule_name` - The rule to look up
    pub fn activity(&self, rule_name: &str) -> Option<&ScalingActivity> {
        self.activity.get(rule_name)
    }

    /// Subscribe to the stream of scale recommendations
    pub fn subscribe(&self) -> broadcast::Receiver<AutoScaleAction> {
        self.actions.subscribe()
    }

    /// Consume inputs and emit scale recommendations until the stream closes
    pub async fn start(&mut self) {
        event!(Level::INFO, msg = "Autoscaler started");
        loop {
            match self.inputs.recv().await {
                // evaluate this tick at the current time
                Ok(input) => self.tick(input, now_ms()),
                // the input stream only errors when the producer is gone
                Err(error) => {
                    event!(
                        Level::ERROR,
                        msg = "Autoscaler input stream closed",
                        error = error.to_string(),
                    );
                    break;
                }
            }
        }
    }

    /// Evaluate one tick of idle machines and placement failures
    ///
    /// # Arguments
    ///
    /// * `input` - The idle machines and recent placement failures
    /// * `now` - The current time as epoch millis
    #[instrument(name = "Autoscaler::tick", skip_all)]
    pub fn tick(&mut self, input: AutoscalerInput, now: i64) {
        // build a fresh group per rule and seed activity for new rules
        let mut groups: BTreeMap<String, HostAttributeGroup> = BTreeMap::default();
        for rule in self.rules.snapshot() {
            let name = rule.rule_name().to_owned();
            self.activity
                .entry(name.clone())
                .or_insert_with(|| ScalingActivity::initial(rule.cool_down_secs(), now));
            groups.insert(
                name.clone(),
                HostAttributeGroup {
                    name,
                    rule,
                    idle_hosts: Vec::default(),
                    shortfall: 0,
                },
            );
        }
        // estimate the machine shortfall per group unless disabled
        if !self.disable_shortfall_evaluation {
            let names: HashSet<String> = groups.keys().cloned().collect();
            for (name, count) in self.shortfall.shortfall(&names, &input.failures) {
                if let Some(group) = groups.get_mut(&name) {
                    group.shortfall = count;
                }
            }
        }
        // partition the idle machines into their groups
        for lease in input.idle_leases {
            let group = match lease.attr(&self.partition_attribute_name) {
                Some(value) => match groups.get_mut(value) {
                    Some(group) => group,
                    None => continue,
                },
                None => continue,
            };
            // machines too small to matter don't count as idle capacity
            if group.rule.idle_machine_too_small(&lease) {
                continue;
            }
            group.idle_hosts.push(lease);
        }
        // judge each group's scaling needs
        for group in groups.values() {
            self.process_group(group, now);
        }
    }

    /// Emit the scale action one group needs if any
    ///
    /// # Arguments
    ///
    /// * `group` - The group to judge
    /// * `now` - The current time as epoch millis
    fn process_group(&mut self, group: &HostAttributeGroup, now: i64) {
        let rule = &group.rule;
        let cool_ms = rule.cool_down_secs() as i64 * 1000;
        let last_set = self.active_groups.last_set_at();
        // the activity entry was seeded when the group was built
        let (prev_up, prev_down) = match self.activity.get(&group.name) {
            Some(prev) => (prev.scale_up_at, prev.scale_down_at),
            None => return,
        };
        // a pending shortfall suppresses any idle excess
        let excess = if group.shortfall > 0 {
            0
        } else {
            group.idle_hosts.len() as i64 - rule.max_idle_hosts_to_keep() as i64
        };
        // replacing the active group set restarts every cooldown
        let can_scale_down = now > last_set.max(prev_down).max(prev_up) + cool_ms;
        let can_scale_up = now > last_set.max(prev_up) + cool_ms;
        if excess > 0 && can_scale_down {
            // pick victims spread across the balance attribute
            let victims = self.hosts_to_terminate(&group.idle_hosts, excess as usize);
            // disable each victim so it stops taking offers while terminating
            for (hostname, _) in &victims {
                self.directory.disable_until(hostname, now + cool_ms);
            }
            if let Some(activity) = self.activity.get_mut(&group.name) {
                activity.scale_down_at = now;
                activity.shortfall = group.shortfall;
                activity.scaled_count = victims.len();
                activity.last_kind = Some(ScaleKind::Down);
            }
            event!(
                Level::INFO,
                msg = "Scaling down",
                rule = group.name,
                count = victims.len(),
            );
            self.publish(AutoScaleAction::ScaleDown {
                rule_name: group.name.clone(),
                hosts: victims.into_iter().map(|(_, mapped)| mapped).collect(),
            });
        } else if group.shortfall > 0 || (excess <= 0 && can_scale_up) {
            if group.shortfall > 0 || rule.min_idle_hosts_to_keep() > group.idle_hosts.len() {
                // aim for the top of the idle band rather than just clearing
                // the bottom, otherwise the group thrashes around the minimum;
                // a shortfall bids unconditionally since tasks already failed
                let headroom = if excess <= 0 && can_scale_up {
                    rule.max_idle_hosts_to_keep()
                        .saturating_sub(group.idle_hosts.len())
                } else {
                    0
                };
                let amount = headroom.max(group.shortfall);
                if let Some(activity) = self.activity.get_mut(&group.name) {
                    activity.scale_up_at = now;
                    activity.shortfall = group.shortfall;
                    activity.scaled_count = amount;
                    activity.last_kind = Some(ScaleKind::Up);
                }
                event!(
                    Level::INFO,
                    msg = "Scaling up",
                    rule = group.name,
                    count = amount,
                );
                self.publish(AutoScaleAction::ScaleUp {
                    rule_name: group.name.clone(),
                    count: amount,
                });
            }
        }
    }

    /// Pick scale down victims balanced across the balance attribute
    ///
    /// Buckets the candidates by the balance attribute and repeatedly takes
    /// the front host of whichever bucket is currently largest, so the
    /// terminations stay spread across zones. Returns pairs of hostname and
    /// terminate identifier.
    ///
    /// # Arguments
    ///
    /// * `hosts` - The idle candidates to pick from
    /// * `excess` - How many victims to pick
    fn hosts_to_terminate(&self, hosts: &[Lease], excess: usize) -> Vec<(String, String)> {
        // bucket the candidates in encounter order
        let mut buckets: Vec<(String, Vec<&Lease>)> = Vec::default();
        for host in hosts {
            let bucket = match &self.scale_down_balanced_by_attribute_name {
                Some(attr) => host
                    .attr(attr)
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_BALANCE_BUCKET.to_owned()),
                None => DEFAULT_BALANCE_BUCKET.to_owned(),
            };
            match buckets.iter_mut().find(|(name, _)| name == &bucket) {
                Some((_, list)) => list.push(host),
                None => buckets.push((bucket, vec![host])),
            }
        }
        // drain the fronts of the largest buckets round robin
        let mut picked = Vec::default();
        while picked.len() < excess {
            // first encountered bucket wins ties
            let mut take_from = None;
            let mut max = 0;
            for (idx, (_, list)) in buckets.iter().enumerate() {
                if list.len() > max {
                    max = list.len();
                    take_from = Some(idx);
                }
            }
            // stop early if the candidates ran out
            let idx = match take_from {
                Some(idx) => idx,
                None => break,
            };
            let host = buckets[idx].1.remove(0);
            picked.push((host.hostname.clone(), self.mapped_hostname(host)));
        }
        picked
    }

    /// The identifier the terminator knows a host by
    ///
    /// # Arguments
    ///
    /// * `lease` - The consolidated lease view of the host
    fn mapped_hostname(&self, lease: &Lease) -> String {
        let attr = match &self.map_hostname_attribute_name {
            Some(attr) if !attr.is_empty() => attr,
            _ => return lease.hostname.clone(),
        };
        match lease.attr(attr) {
            Some(mapped) => mapped.clone(),
            None => {
                event!(
                    Level::ERROR,
                    msg = "Didn't find mapped hostname attribute",
                    attr = attr.as_str(),
                    host = lease.hostname,
                );
                lease.hostname.clone()
            }
        }
    }

    /// Publish a scale recommendation to the action stream
    ///
    /// # Arguments
    ///
    /// * `action` - The recommendation to publish
    fn publish(&self, action: AutoScaleAction) {
        // a send only fails when nobody is listening yet
        if self.actions.send(action).is_err() {
            event!(Level::DEBUG, msg = "No listeners for scale action");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A directory that ignores everything
    struct NullDirectory;

    impl HostDirectory for NullDirectory {
        fn disable_until(&self, _hostname: &str, _until_ms: i64) {}

        fn max_resources(
            &self,
            _group: &str,
        ) -> Option<HashMap<crate::models::VMResource, f64>> {
            None
        }
    }

    /// Build an autoscaler with the given attribute wiring and no rules
    fn autoscaler(
        map_hostname: Option<&str>,
        balanced_by: Option<&str>,
    ) -> Autoscaler {
        let conf = Autoscaling {
            partition_attribute_name: "asg".to_owned(),
            map_hostname_attribute_name: map_hostname.map(str::to_owned),
            scale_down_balanced_by_attribute_name: balanced_by.map(str::to_owned),
            disable_shortfall_evaluation: false,
            rules: Vec::default(),
        };
        let (_, inputs) = kanal::unbounded_async();
        Autoscaler::new(&conf, Arc::new(NullDirectory), inputs)
    }

    /// Build a lease with attributes for selection tests
    fn host(hostname: &str, attrs: &[(&str, &str)]) -> Lease {
        Lease {
            id: format!("lease-{}", hostname),
            vm_id: format!("vm-{}", hostname),
            hostname: hostname.to_owned(),
            cpus: 4.0,
            memory_mb: 8192.0,
            network_mbps: 1000.0,
            disk_mb: 100_000.0,
            port_ranges: Vec::default(),
            attributes: attrs
                .iter()
                .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
                .collect(),
            offered_at: 0,
        }
    }

    #[test]
    fn initial_cooldown_is_capped_at_two_minutes() {
        let now = 1_000_000_000;
        // a long cooldown allows its first action two minutes after boot
        let activity = ScalingActivity::initial(600, now);
        assert_eq!(activity.scale_up_at, now - 480_000);
        assert_eq!(activity.scale_down_at, now - 480_000);
        // a short cooldown allows its first action a full cooldown after boot
        let activity = ScalingActivity::initial(60, now);
        assert_eq!(activity.scale_up_at, now);
        assert!(activity.last_kind.is_none());
    }

    #[test]
    fn active_groups_default_to_everything() {
        let groups = ActiveVmGroups::default();
        assert!(groups.is_active("anything"));
        assert_eq!(groups.last_set_at(), 0);
        groups.set_groups(vec!["small".to_owned()]);
        assert!(groups.is_active("small"));
        assert!(!groups.is_active("anything"));
        assert!(groups.last_set_at() > 0);
    }

    #[test]
    fn victims_drain_the_largest_bucket_first() {
        let autoscaler = autoscaler(None, Some("zone"));
        let hosts = vec![
            host("h1", &[("zone", "zA")]),
            host("h2", &[("zone", "zA")]),
            host("h3", &[("zone", "zA")]),
            host("h4", &[("zone", "zB")]),
            host("h5", &[("zone", "zB")]),
        ];
        let victims = autoscaler.hosts_to_terminate(&hosts, 4);
        let names: Vec<&str> = victims.iter().map(|(name, _)| name.as_str()).collect();
        // the picks alternate zones once the bucket sizes even out
        assert_eq!(names, vec!["h1", "h2", "h4", "h3"]);
    }

    #[test]
    fn victims_without_the_balance_attribute_share_a_bucket() {
        let autoscaler = autoscaler(None, Some("zone"));
        let hosts = vec![host("h1", &[]), host("h2", &[]), host("h3", &[])];
        // all three land in the default bucket and drain in order
        let victims = autoscaler.hosts_to_terminate(&hosts, 2);
        let names: Vec<&str> = victims.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["h1", "h2"]);
    }

    #[test]
    fn selection_stops_when_candidates_run_out() {
        let autoscaler = autoscaler(None, None);
        let hosts = vec![host("h1", &[]), host("h2", &[])];
        let victims = autoscaler.hosts_to_terminate(&hosts, 5);
        assert_eq!(victims.len(), 2);
    }

    #[test]
    fn terminate_identifiers_prefer_the_mapped_attribute() {
        let autoscaler = autoscaler(Some("instance-id"), None);
        let hosts = vec![
            host("h1", &[("instance-id", "i-12345")]),
            // the attribute is missing here so the hostname stands in
            host("h2", &[]),
        ];
        let victims = autoscaler.hosts_to_terminate(&hosts, 2);
        let mapped: Vec<&str> = victims.iter().map(|(_, mapped)| mapped.as_str()).collect();
        assert_eq!(mapped, vec!["i-12345", "h2"]);
    }
}
