//! ---
//! fleetsim_section: "01-core-functionality"
//! fleetsim_subsection: "module"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "Shared primitives and utilities for the simulator runtime."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
//! Shared primitives for the fleet simulator workspace.
//! This crate exposes configuration loading, tracing initialisation and
//! wall-clock helpers consumed across the workspace.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, FleetConfig, IngestConfig, LoadedAppConfig, LoggingConfig, MetricsConfig,
};
pub use logging::{init_tracing, LogFormat, LogRotation};
pub use time::epoch_millis;
