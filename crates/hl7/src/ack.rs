//! Acknowledgement parsing (MSA) and construction.
//!
//! The simulator only ever reads two things from a reply: the acknowledgement code (MSA-1)
//! and the control ID it refers to (MSA-2). Everything else in the ACK is ignored.

use crate::header::{HeaderConfig, MessageType};
use crate::message::{Message, Segment};
use crate::{Hl7Error, Hl7Result};
use std::fmt;
use std::str::FromStr;

/// HL7 table 0008 acknowledgement codes, original and enhanced modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AckCode {
    ApplicationAccept,
    ApplicationError,
    ApplicationReject,
    CommitAccept,
    CommitError,
    CommitReject,
}

impl AckCode {
    pub fn as_str(self) -> &'static str {
        match self {
            AckCode::ApplicationAccept => "AA",
            AckCode::ApplicationError => "AE",
            AckCode::ApplicationReject => "AR",
            AckCode::CommitAccept => "CA",
            AckCode::CommitError => "CE",
            AckCode::CommitReject => "CR",
        }
    }

    /// True for AA and CA, the only codes that count as delivered.
    pub fn is_positive(self) -> bool {
        matches!(self, AckCode::ApplicationAccept | AckCode::CommitAccept)
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckCode {
    type Err = Hl7Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "AA" => Ok(AckCode::ApplicationAccept),
            "AE" => Ok(AckCode::ApplicationError),
            "AR" => Ok(AckCode::ApplicationReject),
            "CA" => Ok(AckCode::CommitAccept),
            "CE" => Ok(AckCode::CommitError),
            "CR" => Ok(AckCode::CommitReject),
            other => Err(Hl7Error::MalformedAck(format!(
                "unknown acknowledgement code '{other}'"
            ))),
        }
    }
}

/// The parts of an acknowledgement that decide delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub code: AckCode,
    /// MSA-2: control ID of the message being acknowledged.
    pub control_id: String,
    /// MSA-3, when the receiver supplied one.
    pub text: Option<String>,
}

impl Ack {
    /// Parses an acknowledgement payload.
    ///
    /// # Errors
    ///
    /// Returns [`Hl7Error::MalformedAck`] if the payload is not a message, has no MSA segment,
    /// or carries an unknown code or empty MSA-2.
    pub fn parse(payload: &str) -> Hl7Result<Self> {
        let message =
            Message::parse(payload).map_err(|e| Hl7Error::MalformedAck(e.to_string()))?;
        let msa = message
            .segment("MSA")
            .ok_or_else(|| Hl7Error::MalformedAck("no MSA segment".into()))?;

        let code: AckCode = msa.field(1).unwrap_or_default().parse()?;
        let control_id = msa.field(2).unwrap_or_default().trim();
        if control_id.is_empty() {
            return Err(Hl7Error::MalformedAck("MSA-2 is empty".into()));
        }
        let text = msa
            .field(3)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        Ok(Self {
            code,
            control_id: control_id.to_string(),
            text,
        })
    }

    /// True if this ACK refers to the message with `control_id`.
    pub fn acknowledges(&self, control_id: &str) -> bool {
        self.control_id == control_id
    }
}

/// Builds an ACK for `original`, swapping sender and receiver from the original MSH.
///
/// Used by test receivers and by anyone wiring a loopback endpoint.
///
/// # Errors
///
/// Returns [`Hl7Error::MissingSegment`] if `original` has no MSH, and
/// [`Hl7Error::InvalidInput`] if it has no control ID to acknowledge.
pub fn build_ack(
    original: &Message,
    code: AckCode,
    control_id: &str,
    timestamp: &str,
) -> Hl7Result<Message> {
    let msh = original
        .segment("MSH")
        .ok_or_else(|| Hl7Error::MissingSegment("MSH".into()))?;
    let acked = original
        .control_id()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Hl7Error::InvalidInput("message has no MSH-10 to acknowledge".into()))?;

    let swapped = HeaderConfig {
        sending_application: msh.field(5).unwrap_or_default().to_string(),
        sending_facility: msh.field(6).unwrap_or_default().to_string(),
        receiving_application: msh.field(3).unwrap_or_default().to_string(),
        receiving_facility: msh.field(4).unwrap_or_default().to_string(),
        processing_id: msh.field(11).unwrap_or("P").to_string(),
        version: msh.field(12).unwrap_or("2.3").to_string(),
    };

    let mut ack = Message::new();
    ack.push(swapped.msh(MessageType::ACK, control_id, timestamp));
    ack.push(Segment::new("MSA").with(1, code.as_str()).with(2, acked));
    Ok(ack)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADMIT: &str = "MSH|^~\\&|SIMHOSP|SFAC|RAPP|RFAC|20240101120000||ADT^A01|5001|P|2.3\rPID|1||000000001\r";

    #[test]
    fn test_parse_positive_ack() {
        let ack = Ack::parse("MSH|^~\\&|RAPP|RFAC|SIMHOSP|SFAC|20240101120001||ACK|9|P|2.3\rMSA|AA|5001\r")
            .unwrap();

        assert_eq!(ack.code, AckCode::ApplicationAccept);
        assert!(ack.code.is_positive());
        assert!(ack.acknowledges("5001"));
        assert_eq!(ack.text, None);
    }

    #[test]
    fn test_parse_negative_ack_with_text() {
        let ack = Ack::parse("MSH|^~\\&|R|F|S|F|||ACK|9|P|2.3\rMSA|AR|5001|unknown patient\r").unwrap();

        assert_eq!(ack.code, AckCode::ApplicationReject);
        assert!(!ack.code.is_positive());
        assert_eq!(ack.text.as_deref(), Some("unknown patient"));
    }

    #[test]
    fn test_commit_codes() {
        assert!("CA".parse::<AckCode>().unwrap().is_positive());
        assert!(!"CE".parse::<AckCode>().unwrap().is_positive());
        assert!(!"CR".parse::<AckCode>().unwrap().is_positive());
    }

    #[test]
    fn test_parse_rejects_missing_msa_and_bad_code() {
        assert!(matches!(
            Ack::parse("MSH|^~\\&|R|F|S|F|||ACK|9|P|2.3\r"),
            Err(Hl7Error::MalformedAck(_))
        ));
        assert!(matches!(
            Ack::parse("MSH|^~\\&|R|F|S|F|||ACK|9|P|2.3\rMSA|XX|1\r"),
            Err(Hl7Error::MalformedAck(_))
        ));
        assert!(matches!(
            Ack::parse("MSH|^~\\&|R|F|S|F|||ACK|9|P|2.3\rMSA|AA\r"),
            Err(Hl7Error::MalformedAck(_))
        ));
        assert!(matches!(Ack::parse(""), Err(Hl7Error::MalformedAck(_))));
    }

    #[test]
    fn test_build_ack_swaps_endpoints() {
        let original = Message::parse(ADMIT).unwrap();
        let ack = build_ack(&original, AckCode::ApplicationAccept, "77", "20240101120001").unwrap();

        let msh = ack.segment("MSH").unwrap();
        assert_eq!(msh.field(3), Some("RAPP"));
        assert_eq!(msh.field(5), Some("SIMHOSP"));
        assert_eq!(ack.message_type(), Some("ACK"));

        let parsed = Ack::parse(&ack.to_er7()).unwrap();
        assert!(parsed.acknowledges("5001"));
    }
}
