//! Resource offers from worker machines

use std::collections::HashMap;

/// An inclusive range of ports offered by a machine
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    /// The first port in this range
    pub beg: u32,
    /// The last port in this range
    pub end: u32,
}

impl PortRange {
    /// Create a new inclusive port range
    ///
    /// # Arguments
    ///
    /// * `beg` - The first port in the range
    /// * `end` - The last port in the range
    pub fn new(beg: u32, end: u32) -> Self {
        PortRange { beg, end }
    }

    /// The number of ports in this range
    pub fn size(&self) -> u32 {
        self.end - self.beg + 1
    }
}

/// An offer of resources from a single worker machine
///
/// A lease is immutable once built; the assignment engine consolidates all
/// live leases for a machine into one totaled view before placing tasks.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Lease {
    /// The unique id of this offer
    pub id: String,
    /// The id of the VM backing this offer
    pub vm_id: String,
    /// The hostname this offer came from
    pub hostname: String,
    /// The offered cpu cores
    pub cpus: f64,
    /// The offered memory in MB
    pub memory_mb: f64,
    /// The offered network bandwidth in Mbps
    pub network_mbps: f64,
    /// The offered disk in MB
    pub disk_mb: f64,
    /// The offered port ranges in order
    pub port_ranges: Vec<PortRange>,
    /// The attributes tagged onto this offer (e.g. group or zone)
    pub attributes: HashMap<String, String>,
    /// When this offer was made as epoch millis
    pub offered_at: i64,
}

impl Lease {
    /// Get the value of an attribute on this lease if it is set
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the attribute to get
    pub fn attr(&self, name: &str) -> Option<&String> {
        self.attributes.get(name)
    }

    /// The total number of ports offered across all ranges
    pub fn total_ports(&self) -> u32 {
        self.port_ranges.iter().map(PortRange::size).sum()
    }
}
