//! # Simhospital Core
//!
//! The simulation engine behind the `simhospital` binary.
//!
//! - Configuration loading: pathways, data pools, header defaults and hardcoded messages
//! - The patient store and the effects each pathway step has on a patient record
//! - HL7 v2 message composition from step outcomes
//! - Delivery over MLLP, to a file, or to the console
//! - Per-instance executors and the runner that schedules them
//!
//! **No HTTP concerns**: the dashboard lives in `simhospital-dashboard` and only talks to the
//! engine through [`runner::RunnerHandle`].

pub mod composer;
pub mod config;
pub mod effects;
pub mod error;
pub mod executor;
pub mod loader;
pub mod metrics;
pub mod model;
pub mod pathway;
pub mod pools;
pub mod runner;
pub mod sender;
pub mod store;
pub mod templates;

pub use error::{
    ComposeError, ComposeResult, ConfigError, ConfigResult, SendError, SendResult,
};
