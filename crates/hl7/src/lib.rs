//! HL7 v2 wire support for the hospital simulator.
//!
//! This crate provides the **wire model** and **format helpers** for HL7 v2 messages in ER7
//! (pipe-delimited) encoding:
//! - segments and messages, with 1-based field addressing (`PV1.3`)
//! - escaping of delimiter characters inside field values
//! - the MSH header, built from a YAML header configuration
//! - ACK parsing (MSA segment) and ACK construction for loopback receivers
//! - HL7 timestamp formatting in a configured timezone (IANA name or fixed offset)
//!
//! This crate focuses on:
//! - producing well-formed ER7 text
//! - reading back just enough of a reply to decide delivery (MSA-1, MSA-2)
//!
//! It is NOT a conformance validator and does not know about message structures beyond the
//! segments the simulator emits. Transport framing (MLLP) lives in the simulation core.

pub mod ack;
pub mod datetime;
pub mod header;
pub mod message;

pub use ack::{build_ack, Ack, AckCode};
pub use datetime::{format_date, format_datetime, parse_timezone, Timezone};
pub use header::{HeaderConfig, MessageType};
pub use message::{components, escape, FieldPath, Message, Segment};

/// Errors returned by the `hl7` wire crate.
#[derive(Debug, thiserror::Error)]
pub enum Hl7Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid YAML: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),

    #[error("translation error: {0}")]
    Translation(String),

    #[error("invalid field path '{0}', expected SEG.N such as PV1.3")]
    InvalidFieldPath(String),

    #[error("segment {0} not present in message")]
    MissingSegment(String),

    #[error("malformed acknowledgement: {0}")]
    MalformedAck(String),

    #[error("invalid timezone '{0}', expected UTC, a zone name such as Europe/London, or an offset such as +01:00")]
    InvalidTimezone(String),
}

/// Type alias for Results that can fail with an [`Hl7Error`].
pub type Hl7Result<T> = Result<T, Hl7Error>;
