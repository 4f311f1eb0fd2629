//! Configuration for the sluice control plane.
//!
//! A [`CoreConfig`] is assembled from defaults, an optional TOML file, and a
//! handful of environment overrides, then run through guard-rail validation
//! before any component starts.

pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{ConfigLoadError, ConfigLoader};
pub use models::{
    CoreConfig, DispatcherConfig, IngestConfig, PriorityConfig, RedisConfig,
    ServiceEntry, ServicesConfig, SubmissionConfig, WatcherConfig,
};
pub use validation::ConfigGuardRailError;
