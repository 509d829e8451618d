//! Sets up tracing for the placement engine using stdout/stderr
//!
//! The engine itself only emits `tracing` events; embedding binaries that
//! ship traces to a collector should install their own subscriber instead of
//! calling [`setup`].

use tracing_subscriber::prelude::*;

use crate::conf::{LogLevel, Tracing};

/// Setup a local stdout tracer
///
/// # Arguments
///
/// * `name` - The name of the service to trace
/// * `conf` - The tracing settings to use
pub fn setup(name: &str, conf: &Tracing) {
    // build our stdout/stderr tracing layer
    let filtered = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(conf.level.to_filter());
    // init our tracing registry but don't panic if one is already installed
    // (test binaries may call setup more than once)
    let registered = tracing_subscriber::registry().with(filtered).try_init();
    // log that tracing is setup before any spans can exist
    if registered.is_ok() && conf.level != LogLevel::Off {
        println!(
            "{}",
            serde_json::json!({
                "timestamp": chrono::Utc::now(),
                "level": "SETP",
                "msg": format!("Logging {} traces for {} to stdout", conf.level, name),
            })
        );
    }
}
