//! Infrastructure layer: job stores, worker runtime, config, notifier transports.

pub mod config;
pub mod jobs;
pub mod notify;


pub use config::{ConfigError, RuntimeConfig};
