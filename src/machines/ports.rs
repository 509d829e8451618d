//! A pool of discrete ports to hand out during a scheduling iteration

use crate::models::PortRange;
use crate::Error;

/// The ports offered to a machine, consumed in range order
///
/// Consumption is append only inside a scheduling iteration; ports only come
/// back when the whole pool is cleared and refilled from surviving leases.
#[derive(Debug, Default)]
pub struct PortRangePool {
    /// The offered ranges in the order they were added
    ranges: Vec<PortRange>,
    /// The total number of ports across all ranges
    total_ports: u32,
    /// How many ports have been handed out so far
    used_ports: u32,
}

impl PortRangePool {
    /// Append more ranges to this pool
    ///
    /// # Arguments
    ///
    /// * `ranges` - The inclusive ranges to add
    pub fn add(&mut self, ranges: &[PortRange]) {
        // fold each new range into our total
        for range in ranges {
            self.ranges.push(*range);
            self.total_ports += range.size();
        }
    }

    /// Check if this pool still has at least this many ports
    ///
    /// # Arguments
    ///
    /// * `num` - The number of ports needed
    pub fn has_ports(&self, num: u32) -> bool {
        num + self.used_ports <= self.total_ports
    }

    /// Hand out the next unused port
    pub fn consume_next(&mut self) -> Result<u32, Error> {
        // walk the ranges to find the one our cursor lands in
        let mut forward = 0;
        for range in &self.ranges {
            if forward + range.size() > self.used_ports {
                // consume in this range
                let port = range.beg + (self.used_ports - forward);
                self.used_ports += 1;
                return Ok(port);
            }
            forward += range.size();
        }
        Err(Error::PortsExhausted(self.total_ports))
    }

    /// Reset this pool to empty
    pub fn clear(&mut self) {
        self.ranges.clear();
        self.total_ports = 0;
        self.used_ports = 0;
    }

    /// The ranges currently in this pool
    pub fn ranges(&self) -> &[PortRange] {
        &self.ranges
    }

    /// The total number of ports across all ranges
    pub fn total_ports(&self) -> u32 {
        self.total_ports
    }

    /// How many ports have been handed out so far
    pub fn used_ports(&self) -> u32 {
        self.used_ports
    }
}
