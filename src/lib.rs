//! A task placement engine for compute clusters
//!
//! Berth consumes resource offers from worker machines, decides which task
//! lands on which machine, and recommends scaling the machine pool up or down
//! so that capacity tracks demand. The per-machine assignment engine lives in
//! [`machines`] and the scaling control loop lives in [`autoscaler`]; the
//! scheduler loop that drives them is expected to be built on top of this
//! crate.

#[macro_use]
extern crate serde_derive;

pub mod autoscaler;
pub mod conf;
mod error;
pub mod machines;
pub mod models;
pub mod shortfall;
pub mod tracker;
pub mod utils;

// expose test utilities if that feature is enabled
#[cfg(feature = "test-utilities")]
pub mod test_utilities;

pub use conf::Conf;
pub use error::Error;
