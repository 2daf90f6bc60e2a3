use std::path::PathBuf;
use std::time::Duration;

/// Errors raised while loading or validating configuration. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}", path = path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{file}: schema mismatch at {field}: {message}", file = file.display())]
    Schema {
        file: PathBuf,
        field: String,
        message: String,
    },
    #[error("duplicate pathway name '{0}'")]
    DuplicatePathway(String),
    #[error("invalid pathway '{name}': {reason}")]
    InvalidPathway { name: String, reason: String },
    #[error("invalid hardcoded message '{name}': {reason}")]
    InvalidTemplate { name: String, reason: String },
    #[error("invalid pathway filter '{pattern}': {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error(transparent)]
    Hl7(#[from] hl7::Hl7Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Errors that abort a single pathway instance while applying or rendering a step.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("patient {mrn} has no open encounter")]
    NoOpenEncounter { mrn: String },
    #[error("patient {mrn} already has an open encounter")]
    EncounterAlreadyOpen { mrn: String },
    #[error("unknown location '{0}'")]
    UnknownLocation(String),
    #[error("unknown order profile '{0}'")]
    UnknownOrderProfile(String),
    #[error("no order '{0}' on the open encounter")]
    UnknownOrder(String),
    #[error("unknown hardcoded message '{0}'")]
    UnknownTemplate(String),
    #[error("unknown placeholder {placeholder} in hardcoded message '{template}'")]
    UnknownPlaceholder {
        template: String,
        placeholder: String,
    },
    #[error("data pool '{0}' is empty")]
    EmptyPool(&'static str),
    #[error(transparent)]
    Hl7(#[from] hl7::Hl7Error),
}

pub type ComposeResult<T> = std::result::Result<T, ComposeError>;

/// Delivery errors reported by a [`crate::sender::MessageSink`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("negative acknowledgement {code} for message {control_id}")]
    Nack { code: String, control_id: String },
    #[error("no acknowledgement for message {control_id} within {timeout:?}")]
    AckTimeout {
        control_id: String,
        timeout: Duration,
    },
    #[error("message {control_id} not delivered after {attempts} attempts: {last}")]
    RetriesExhausted {
        control_id: String,
        attempts: u32,
        last: String,
    },
    #[error("destination {destination} unavailable after {failures} consecutive connect failures")]
    Unavailable { destination: String, failures: u32 },
    #[error("sender is closed")]
    Closed,
    #[error("framing error: {0}")]
    Frame(String),
}

impl SendError {
    /// Errors after which no further message can be delivered in this run.
    ///
    /// `Io` only reaches callers from the console and file sinks; the MLLP sink retries I/O
    /// failures internally and reports exhaustion instead.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SendError::Unavailable { .. } | SendError::Io(_))
    }
}

pub type SendResult<T> = std::result::Result<T, SendError>;
