//! MSH header configuration and construction.

use crate::message::{Message, Segment};
use crate::{Hl7Error, Hl7Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message type and trigger event, rendered into MSH-9 as `code^trigger`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageType {
    pub code: &'static str,
    pub trigger: &'static str,
}

impl MessageType {
    pub const fn new(code: &'static str, trigger: &'static str) -> Self {
        Self { code, trigger }
    }

    pub const ADT_A01: Self = Self::new("ADT", "A01");
    pub const ADT_A02: Self = Self::new("ADT", "A02");
    pub const ADT_A03: Self = Self::new("ADT", "A03");
    pub const ADT_A04: Self = Self::new("ADT", "A04");
    pub const ADT_A08: Self = Self::new("ADT", "A08");
    pub const ORM_O01: Self = Self::new("ORM", "O01");
    pub const ORU_R01: Self = Self::new("ORU", "R01");
    pub const MDM_T02: Self = Self::new("MDM", "T02");
    pub const ACK: Self = Self::new("ACK", "");
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.trigger.is_empty() {
            f.write_str(self.code)
        } else {
            write!(f, "{}^{}", self.code, self.trigger)
        }
    }
}

fn default_processing_id() -> String {
    "P".into()
}

fn default_version() -> String {
    "2.3".into()
}

/// Header values that are the same for every message a run produces.
///
/// These are the lowest-precedence values in composition: anything a pathway step or a
/// hardcoded template sets explicitly wins over them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderConfig {
    pub sending_application: String,
    pub sending_facility: String,
    pub receiving_application: String,
    pub receiving_facility: String,
    #[serde(default = "default_processing_id")]
    pub processing_id: String,
    #[serde(default = "default_version")]
    pub version: String,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            sending_application: "SIMHOSP".into(),
            sending_facility: "SFAC".into(),
            receiving_application: "RAPP".into(),
            receiving_facility: "RFAC".into(),
            processing_id: default_processing_id(),
            version: default_version(),
        }
    }
}

impl HeaderConfig {
    /// Parse a header configuration from YAML text.
    ///
    /// This uses `serde_path_to_error` to report the failing key when the YAML does not match
    /// the expected schema.
    ///
    /// # Errors
    ///
    /// Returns [`Hl7Error::Translation`] on a schema mismatch (including unknown keys) and
    /// [`Hl7Error::InvalidInput`] if an application or facility name is blank.
    pub fn parse(yaml_text: &str) -> Hl7Result<Self> {
        let deserializer = serde_yaml::Deserializer::from_str(yaml_text);
        let header: HeaderConfig = serde_path_to_error::deserialize(deserializer).map_err(|err| {
            let path = err.path().to_string();
            let path = if path.is_empty() || path == "." {
                "<root>".to_string()
            } else {
                path
            };
            Hl7Error::Translation(format!(
                "header schema mismatch at {path}: {}",
                err.into_inner()
            ))
        })?;

        for (name, value) in [
            ("sending_application", &header.sending_application),
            ("sending_facility", &header.sending_facility),
            ("receiving_application", &header.receiving_application),
            ("receiving_facility", &header.receiving_facility),
        ] {
            if value.trim().is_empty() {
                return Err(Hl7Error::InvalidInput(format!("{name} cannot be empty")));
            }
        }

        Ok(header)
    }

    /// Builds a complete MSH segment.
    pub fn msh(&self, message_type: MessageType, control_id: &str, timestamp: &str) -> Segment {
        Segment::new("MSH")
            .with(3, self.sending_application.as_str())
            .with(4, self.sending_facility.as_str())
            .with(5, self.receiving_application.as_str())
            .with(6, self.receiving_facility.as_str())
            .with(7, timestamp)
            .with(9, message_type.to_string())
            .with(10, control_id)
            .with(11, self.processing_id.as_str())
            .with(12, self.version.as_str())
    }

    /// Fills empty MSH fields of an existing message from this configuration.
    ///
    /// Fields already populated (for example by a hardcoded template) are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Hl7Error::MissingSegment`] if the message has no MSH segment.
    pub fn fill_defaults(
        &self,
        message: &mut Message,
        control_id: &str,
        timestamp: &str,
    ) -> Hl7Result<()> {
        let msh = message
            .segment_mut("MSH")
            .ok_or_else(|| Hl7Error::MissingSegment("MSH".into()))?;

        let defaults: [(usize, &str); 7] = [
            (3, self.sending_application.as_str()),
            (4, self.sending_facility.as_str()),
            (5, self.receiving_application.as_str()),
            (6, self.receiving_facility.as_str()),
            (7, timestamp),
            (10, control_id),
            (11, self.processing_id.as_str()),
        ];
        for (index, value) in defaults {
            if msh.field(index).unwrap_or_default().is_empty() {
                msh.set(index, value)?;
            }
        }
        if msh.field(12).unwrap_or_default().is_empty() {
            msh.set(12, self.version.as_str())?;
        }
        Ok(())
    }
}
