//! The rules that govern scaling machine groups up and down

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::conf::{Autoscaling, RuleConf};
use crate::models::Lease;

/// A per group policy for keeping idle capacity inside a band
///
/// One rule governs one machine group; the group is named after the rule.
pub trait AutoScaleRule: Send + Sync {
    /// The name of this rule and of the group it governs
    fn rule_name(&self) -> &str;

    /// The number of idle hosts below which this group scales up
    fn min_idle_hosts_to_keep(&self) -> usize;

    /// The number of idle hosts above which this group scales down
    fn max_idle_hosts_to_keep(&self) -> usize;

    /// The minimum seconds between scale actions for this rule
    fn cool_down_secs(&self) -> u64;

    /// Whether an idle machine is too small to count as idle capacity
    ///
    /// # Arguments
    ///
    /// * `lease` - The consolidated lease view of the idle machine
    fn idle_machine_too_small(&self, lease: &Lease) -> bool;
}

/// An autoscale rule built from static cpu/memory thresholds
#[derive(Debug, Clone)]
pub struct ThresholdRule {
    /// The settings this rule was built from
    conf: RuleConf,
}

impl ThresholdRule {
    /// Build a threshold rule from its config
    ///
    /// # Arguments
    ///
    /// * `conf` - The settings to build this rule from
    pub fn new(conf: RuleConf) -> Self {
        ThresholdRule { conf }
    }
}

impl AutoScaleRule for ThresholdRule {
    /// The name of this rule and of the group it governs
    fn rule_name(&self) -> &str {
        &self.conf.name
    }

    /// The number of idle hosts below which this group scales up
    fn min_idle_hosts_to_keep(&self) -> usize {
        self.conf.min_idle_hosts_to_keep
    }

    /// The number of idle hosts above which this group scales down
    fn max_idle_hosts_to_keep(&self) -> usize {
        self.conf.max_idle_hosts_to_keep
    }

    /// The minimum seconds between scale actions for this rule
    fn cool_down_secs(&self) -> u64 {
        self.conf.cool_down_secs
    }

    /// Whether an idle machine is too small to count as idle capacity
    fn idle_machine_too_small(&self, lease: &Lease) -> bool {
        lease.cpus < self.conf.min_idle_cpus || lease.memory_mb < self.conf.min_idle_memory_mb
    }
}

/// The live set of autoscale rules keyed by rule name
///
/// Rules can be swapped while the autoscaler runs; each tick reads the set
/// fresh so changes take effect without a restart.
#[derive(Default)]
pub struct AutoScaleRules {
    /// The current rules keyed by name
    rules: RwLock<BTreeMap<String, Arc<dyn AutoScaleRule>>>,
}

impl AutoScaleRules {
    /// Build the starting rule set from config
    ///
    /// # Arguments
    ///
    /// * `conf` - The autoscaler settings to pull rules from
    pub fn from_conf(conf: &Autoscaling) -> Self {
        let rules = AutoScaleRules::default();
        // build a threshold rule for each configured rule
        for rule_conf in &conf.rules {
            rules.replace(Arc::new(ThresholdRule::new(rule_conf.clone())));
        }
        rules
    }

    /// Add a rule or replace the rule with the same name
    ///
    /// # Arguments
    ///
    /// * `rule` - The rule to add or replace
    pub fn replace(&self, rule: Arc<dyn AutoScaleRule>) {
        let mut rules = self.rules.write().unwrap();
        rules.insert(rule.rule_name().to_owned(), rule);
    }

    /// Remove a rule by name
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the rule to remove
    pub fn remove(&self, name: &str) -> Option<Arc<dyn AutoScaleRule>> {
        let mut rules = self.rules.write().unwrap();
        rules.remove(name)
    }

    /// Get a rule by name
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the rule to get
    pub fn get(&self, name: &str) -> Option<Arc<dyn AutoScaleRule>> {
        let rules = self.rules.read().unwrap();
        rules.get(name).cloned()
    }

    /// Snapshot the current rules in name order
    pub fn snapshot(&self) -> Vec<Arc<dyn AutoScaleRule>> {
        let rules = self.rules.read().unwrap();
        rules.values().cloned().collect()
    }
}
