//! Runtime configuration.
//!
//! A [`SimConfig`] is resolved once at process startup (from command-line flags and the YAML
//! header file) and then shared by `Arc` with every component. Nothing in the core reads
//! process-wide environment variables after startup.

use crate::{ConfigError, ConfigResult};
use hl7::{HeaderConfig, Timezone};
use std::path::PathBuf;
use std::time::Duration;

/// Where composed messages are delivered.
#[derive(Clone, Debug, PartialEq)]
pub enum OutputConfig {
    /// Human-readable output on stdout, one segment per line.
    Stdout,
    /// Append to a file, segments terminated by `\r`.
    File { path: PathBuf },
    /// A persistent MLLP connection.
    Mllp(MllpConfig),
}

/// Settings for the MLLP sender.
#[derive(Clone, Debug, PartialEq)]
pub struct MllpConfig {
    /// `host:port` of the receiver.
    pub destination: String,
    /// Interval of idleness after which an empty keep-alive frame is sent. `None` disables it.
    pub keep_alive: Option<Duration>,
    pub retry: RetryPolicy,
}

impl MllpConfig {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            keep_alive: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = Some(interval);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Retry and timeout behaviour of the MLLP sender.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Delivery attempts per message, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Factor applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
    /// Upper bound for the delay between attempts.
    pub max_backoff: Duration,
    /// How long to wait for the matching ACK after a frame is written.
    pub ack_timeout: Duration,
    /// Bound on a single TCP connect.
    pub connect_timeout: Duration,
    /// Consecutive connect failures after which the destination is declared unavailable.
    pub max_connect_failures: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            max_connect_failures: 20,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before attempt number `attempt` (1-based). The first attempt never waits.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "max_attempts must be at least 1".into(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.ack_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "ack_timeout and connect_timeout must be positive".into(),
            ));
        }
        if self.max_connect_failures == 0 {
            return Err(ConfigError::InvalidValue(
                "max_connect_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Immutable simulation settings.
#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Target arrival rate of new pathway instances. Zero disables automatic arrivals.
    pub pathways_per_hour: f64,
    /// Scheduler tick.
    pub sleep_for: Duration,
    /// Evict a patient from the store once its pathway ends.
    pub delete_patients_from_memory: bool,
    pub output: OutputConfig,
    /// Anchored regexes; empty means every pathway is eligible.
    pub pathway_names: Vec<String>,
    /// Anchored regexes; exclusion wins over inclusion.
    pub exclude_pathway_names: Vec<String>,
    pub header: HeaderConfig,
    /// Zone used for every HL7 timestamp.
    pub timezone: Timezone,
    /// Step budget for a single instance of a looping pathway.
    pub max_loop_steps: usize,
    /// How long shutdown waits for running instances before aborting them.
    pub shutdown_timeout: Duration,
    /// Seed for the runner's RNG. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            pathways_per_hour: 1.0,
            sleep_for: Duration::from_secs(1),
            delete_patients_from_memory: false,
            output: OutputConfig::Stdout,
            pathway_names: Vec::new(),
            exclude_pathway_names: Vec::new(),
            header: HeaderConfig::default(),
            timezone: Timezone::utc(),
            max_loop_steps: 1000,
            shutdown_timeout: Duration::from_secs(30),
            seed: None,
        }
    }
}

impl SimConfig {
    /// Check value ranges that the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] describing the first offending setting.
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.pathways_per_hour.is_finite() || self.pathways_per_hour < 0.0 {
            return Err(ConfigError::InvalidValue(format!(
                "pathways_per_hour must be a non-negative number, got {}",
                self.pathways_per_hour
            )));
        }
        if self.sleep_for.is_zero() {
            return Err(ConfigError::InvalidValue("sleep_for must be positive".into()));
        }
        if self.max_loop_steps == 0 {
            return Err(ConfigError::InvalidValue(
                "max_loop_steps must be at least 1".into(),
            ));
        }
        match &self.output {
            OutputConfig::Stdout => {}
            OutputConfig::File { path } => {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::InvalidValue("output_file cannot be empty".into()));
                }
            }
            OutputConfig::Mllp(mllp) => {
                if mllp.destination.trim().is_empty() {
                    return Err(ConfigError::InvalidValue(
                        "mllp_destination is required when output is mllp".into(),
                    ));
                }
                if mllp.keep_alive.is_some_and(|interval| interval.is_zero()) {
                    return Err(ConfigError::InvalidValue(
                        "mllp_keep_alive_interval must be positive".into(),
                    ));
                }
                mllp.retry.validate()?;
            }
        }
        Ok(())
    }
}
