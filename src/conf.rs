//! The shared config for the berth placement engine

use std::path::Path;
use tracing::level_filters::LevelFilter;

use crate::Error;

/// Helps serde default a value to false
fn default_false() -> bool {
    false
}

/// The level to log events at
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Do not log any events
    Off,
    /// Only log errors
    Error,
    /// Log warnings and errors
    Warn,
    /// Log info events and up
    Info,
    /// Log debug events and up
    Debug,
    /// Log everything
    Trace,
}

impl LogLevel {
    /// Convert this log level to a tracing filter
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

impl Default for LogLevel {
    /// Default to logging info events and up
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LogLevel::Off => write!(f, "Off"),
            LogLevel::Error => write!(f, "Error"),
            LogLevel::Warn => write!(f, "Warn"),
            LogLevel::Info => write!(f, "Info"),
            LogLevel::Debug => write!(f, "Debug"),
            LogLevel::Trace => write!(f, "Trace"),
        }
    }
}

/// The tracing settings for berth
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Tracing {
    /// The level to log events at
    #[serde(default)]
    pub level: LogLevel,
}

/// Helps serde default the lease offer expiry to 2 minutes
fn default_lease_offer_expiry_secs() -> u64 {
    120
}

/// Helps serde default the offer reject cap to 4 per tick
fn default_max_offer_rejects_per_tick() -> u64 {
    4
}

/// Settings for the per-machine assignment engine
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Engine {
    /// How long a lease may sit unused before it is rejected back to its offerer
    #[serde(default = "default_lease_offer_expiry_secs")]
    pub lease_offer_expiry_secs: u64,
    /// How many stale offers may be rejected across the cluster in one tick
    #[serde(default = "default_max_offer_rejects_per_tick")]
    pub max_offer_rejects_per_tick: u64,
    /// Whether resource status reports should include disk
    ///
    /// Disk is tracked by the engine but omitted from status reports by
    /// default; including it changes the report schema for consumers.
    #[serde(default = "default_false")]
    pub disk_in_resource_status: bool,
}

impl Default for Engine {
    /// Create a default `Engine` config
    fn default() -> Self {
        Engine {
            lease_offer_expiry_secs: default_lease_offer_expiry_secs(),
            max_offer_rejects_per_tick: default_max_offer_rejects_per_tick(),
            disk_in_resource_status: false,
        }
    }
}

/// The settings for a single autoscaling rule
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RuleConf {
    /// The name of this rule and of the machine group it governs
    pub name: String,
    /// The number of idle hosts below which this group scales up
    #[serde(default)]
    pub min_idle_hosts_to_keep: usize,
    /// The number of idle hosts above which this group scales down
    pub max_idle_hosts_to_keep: usize,
    /// The minimum seconds between scale actions for this rule
    pub cool_down_secs: u64,
    /// Idle machines with fewer cpus than this don't count as idle capacity
    #[serde(default)]
    pub min_idle_cpus: f64,
    /// Idle machines with less memory than this don't count as idle capacity
    #[serde(default)]
    pub min_idle_memory_mb: f64,
}

/// The settings for the autoscaling control loop
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Autoscaling {
    /// The attribute that partitions machines into scaling groups
    pub partition_attribute_name: String,
    /// The attribute whose value identifies a host to the terminator
    ///
    /// Falls back to the hostname when unset or absent on a host.
    #[serde(default)]
    pub map_hostname_attribute_name: Option<String>,
    /// The attribute to balance scale down victims across (e.g. zone)
    ///
    /// All hosts land in one bucket when unset.
    #[serde(default)]
    pub scale_down_balanced_by_attribute_name: Option<String>,
    /// Whether to skip estimating machine shortfall from placement failures
    #[serde(default = "default_false")]
    pub disable_shortfall_evaluation: bool,
    /// The autoscaling rules to start with
    #[serde(default)]
    pub rules: Vec<RuleConf>,
}

/// The settings for berth
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Berth {
    /// The tracing settings
    #[serde(default)]
    pub tracing: Tracing,
    /// The assignment engine settings
    #[serde(default)]
    pub engine: Engine,
    /// The autoscaling settings
    pub autoscaler: Autoscaling,
}

/// The config for the berth placement engine
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Conf {
    /// The berth settings
    pub berth: Berth,
}

impl Conf {
    /// Load a config from a YAML file with env var overlays
    ///
    /// # Arguments
    ///
    /// * `path` - The path to load the config file from
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let conf: Conf = config::Config::builder()
            // load from a file first
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Yaml))
            // then overlay any environment args ontop
            .add_source(
                config::Environment::with_prefix("berth")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        // make sure this config is sane before handing it out
        conf.validate()?;
        Ok(conf)
    }

    /// Make sure this config is internally consistent
    pub fn validate(&self) -> Result<(), Error> {
        // the partition attribute is what groups machines so it cannot be empty
        if self.berth.autoscaler.partition_attribute_name.is_empty() {
            return Err(Error::new("partition_attribute_name cannot be empty"));
        }
        // check each scaling rule
        for rule in &self.berth.autoscaler.rules {
            // rules are keyed by name
            if rule.name.is_empty() {
                return Err(Error::new("autoscale rule names cannot be empty"));
            }
            // the idle band has to be ordered for the hysteresis to make sense
            if rule.min_idle_hosts_to_keep > rule.max_idle_hosts_to_keep {
                return Err(Error::new(format!(
                    "rule {} has min_idle_hosts_to_keep > max_idle_hosts_to_keep",
                    rule.name
                )));
            }
        }
        Ok(())
    }
}
