//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Core shared primitives for the R-EMS channel manager workspace.
//! This crate exposes configuration loading, logging setup and the wall-clock
//! helpers the sampling scheduler anchors itself to.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, ChannelEntryConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, SchedulerConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use time::{now_millis, start_of_day_millis, MILLIS_PER_DAY};
