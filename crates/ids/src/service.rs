//! Internal implementation of the identifier types.

use crate::{IdError, IdResult};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Canonical internal patient identifier (32 lowercase hex characters, no hyphens).
///
/// Once constructed the contained UUID is guaranteed to be in canonical form, so it can be
/// written into messages and URLs without further validation.
///
/// # Construction
/// - [`PatientId::new`] generates a fresh identifier for a newly simulated patient.
/// - [`PatientId::parse`] validates an externally supplied identifier (for example from the
///   dashboard). Hyphenated or uppercase forms are rejected rather than normalised.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct PatientId(Uuid);

impl Default for PatientId {
    fn default() -> Self {
        Self::new()
    }
}

impl PatientId {
    /// Generates a new random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Validates and parses an identifier that must already be in canonical form.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::InvalidInput`] if `input` is not 32 lowercase hex characters.
    pub fn parse(input: &str) -> IdResult<Self> {
        if !Self::is_canonical(input) {
            return Err(IdError::InvalidInput(format!(
                "patient id must be 32 lowercase hex characters without hyphens, got: '{}'",
                input
            )));
        }
        Uuid::parse_str(input)
            .map(Self)
            .map_err(|e| IdError::InvalidInput(e.to_string()))
    }

    /// Returns true if `input` is in canonical form.
    pub fn is_canonical(input: &str) -> bool {
        input.len() == 32
            && input
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    /// Returns the underlying UUID.
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for PatientId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PatientId::parse(s)
    }
}

impl TryFrom<String> for PatientId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PatientId::parse(&value)
    }
}

impl From<PatientId> for String {
    fn from(value: PatientId) -> Self {
        value.to_string()
    }
}

/// Medical record number as written into PID-3.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Mrn(String);

impl Mrn {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Mrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Mrn {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IdError::InvalidInput(format!(
                "MRN must be a non-empty string of digits, got: '{}'",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }
}

/// Sequential MRN allocator.
///
/// MRNs are zero-padded to a fixed width so that they sort the same way as strings and as
/// numbers.
#[derive(Debug)]
pub struct MrnAllocator {
    next: AtomicU64,
}

impl MrnAllocator {
    /// Width that MRNs are zero-padded to.
    pub const WIDTH: usize = 9;

    /// Creates an allocator whose first MRN is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Allocates the next MRN.
    pub fn allocate(&self) -> Mrn {
        let value = self.next.fetch_add(1, Ordering::Relaxed);
        Mrn(format!("{:0width$}", value, width = Self::WIDTH))
    }
}

impl Default for MrnAllocator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

/// Identifier of one pathway instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequential [`InstanceId`] source.
#[derive(Debug, Default)]
pub struct InstanceIdGenerator {
    next: AtomicU64,
}

impl InstanceIdGenerator {
    pub fn next_id(&self) -> InstanceId {
        InstanceId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// An MSH-10 message control ID.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ControlId(String);

impl ControlId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ControlId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Issues unique, strictly increasing control IDs.
///
/// Shared by every composer task; the atomic counter is the only synchronisation needed.
#[derive(Debug)]
pub struct ControlIdGenerator {
    next: AtomicU64,
}

impl ControlIdGenerator {
    /// Creates a generator seeded from the current wall-clock time.
    pub fn new() -> Self {
        let millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        Self::starting_at(millis.saturating_mul(1000))
    }

    /// Creates a generator whose first ID is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Issues the next control ID.
    pub fn next_id(&self) -> ControlId {
        ControlId(self.next.fetch_add(1, Ordering::Relaxed).to_string())
    }
}

impl Default for ControlIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_new_patient_id_is_canonical() {
        let id = PatientId::new();
        let canonical = id.to_string();

        assert_eq!(canonical.len(), 32);
        assert!(PatientId::is_canonical(&canonical));
    }

    #[test]
    fn test_parse_valid_canonical_patient_id() {
        let canonical = "550e8400e29b41d4a716446655440000";
        let id = PatientId::parse(canonical).unwrap();

        assert_eq!(id.to_string(), canonical);
    }

    #[test]
    fn test_parse_rejects_hyphenated_patient_id() {
        let result = PatientId::parse("550e8400-e29b-41d4-a716-446655440000");

        match result {
            Err(IdError::InvalidInput(msg)) => {
                assert!(msg.contains("32 lowercase hex characters"));
            }
            _ => panic!("Expected InvalidInput error"),
        }
    }

    #[test]
    fn test_parse_rejects_uppercase_and_wrong_length() {
        assert!(PatientId::parse("550E8400E29B41D4A716446655440000").is_err());
        assert!(PatientId::parse("550e8400e29b41d4a71644665544000").is_err());
        assert!(PatientId::parse("").is_err());
    }

    #[test]
    fn test_patient_id_serde_uses_canonical_form() {
        let id = PatientId::parse("550e8400e29b41d4a716446655440000").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"550e8400e29b41d4a716446655440000\"");

        let back: PatientId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_mrn_allocator_is_sequential_and_padded() {
        let allocator = MrnAllocator::starting_at(42);

        assert_eq!(allocator.allocate().as_str(), "000000042");
        assert_eq!(allocator.allocate().as_str(), "000000043");
    }

    #[test]
    fn test_mrn_parse_rejects_non_digits() {
        assert!("000123".parse::<Mrn>().is_ok());
        assert!("12a".parse::<Mrn>().is_err());
        assert!("".parse::<Mrn>().is_err());
    }

    #[test]
    fn test_control_ids_strictly_increase() {
        let generator = ControlIdGenerator::starting_at(1000);

        let first: u64 = generator.next_id().as_str().parse().unwrap();
        let second: u64 = generator.next_id().as_str().parse().unwrap();

        assert_eq!(first, 1000);
        assert_eq!(second, 1001);
    }

    #[test]
    fn test_control_ids_unique_across_threads() {
        let generator = Arc::new(ControlIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| generator.next_id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(id.as_str().len() <= 20);
                assert!(seen.insert(id), "control IDs must be unique");
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn test_instance_ids_start_at_one() {
        let generator = InstanceIdGenerator::default();
        assert_eq!(generator.next_id().value(), 1);
        assert_eq!(generator.next_id().value(), 2);
    }
}
