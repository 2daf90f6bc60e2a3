//! Validated primitives shared by the simulator crates.
//!
//! These types sit below both the HL7 wire model and the simulation core, so that neither
//! has to re-validate names, codes or administrative sex values it receives from the other.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors that can occur when creating validated text types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("text cannot be empty")]
    Empty,
    /// The input was not a recognised administrative sex
    #[error("unknown sex '{0}', expected one of F, M, U")]
    UnknownSex(String),
}

/// A string type that guarantees non-empty, trimmed content.
///
/// Used for pathway names, step identifiers and header fields, where an empty value would
/// silently produce an unusable message or an unreachable step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText` from the given input.
    ///
    /// The input is trimmed of leading and trailing whitespace. If the trimmed
    /// result is empty, an error is returned.
    ///
    /// # Errors
    ///
    /// Returns `TextError::Empty` if the input is empty or contains only whitespace.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for NonEmptyText {
    type Err = TextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for NonEmptyText {
    type Error = TextError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NonEmptyText> for String {
    fn from(value: NonEmptyText) -> Self {
        value.0
    }
}

/// A coded value with its human-readable description.
///
/// Maps onto the HL7 `CE` data type (`identifier^text`) and is the unit held by the weighted
/// diagnosis, procedure, allergy and ethnicity pools.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodedValue {
    pub id: String,
    pub text: String,
}

impl CodedValue {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Administrative sex as carried in PID-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sex {
    #[serde(rename = "F", alias = "female")]
    Female,
    #[serde(rename = "M", alias = "male")]
    Male,
    #[serde(rename = "U", alias = "unknown")]
    Unknown,
}

impl Sex {
    /// The single-letter HL7 table 0001 code.
    pub fn code(self) -> &'static str {
        match self {
            Sex::Female => "F",
            Sex::Male => "M",
            Sex::Unknown => "U",
        }
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Sex {
    type Err = TextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "F" | "FEMALE" => Ok(Sex::Female),
            "M" | "MALE" => Ok(Sex::Male),
            "U" | "UNKNOWN" => Ok(Sex::Unknown),
            _ => Err(TextError::UnknownSex(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty_text_trims_input() {
        let text = NonEmptyText::new("  Appendicitis  ").unwrap();
        assert_eq!(text.as_str(), "Appendicitis");
    }

    #[test]
    fn test_non_empty_text_rejects_whitespace() {
        assert_eq!(NonEmptyText::new("   "), Err(TextError::Empty));
        assert_eq!(NonEmptyText::new(""), Err(TextError::Empty));
    }

    #[test]
    fn test_non_empty_text_deserialize_rejects_empty() {
        let ok: NonEmptyText = serde_yaml::from_str("\"ward\"").unwrap();
        assert_eq!(ok.as_str(), "ward");

        let err = serde_yaml::from_str::<NonEmptyText>("\"  \"");
        assert!(err.is_err());
    }

    #[test]
    fn test_sex_parses_codes_and_words() {
        assert_eq!("f".parse::<Sex>().unwrap(), Sex::Female);
        assert_eq!("Male".parse::<Sex>().unwrap(), Sex::Male);
        assert_eq!("U".parse::<Sex>().unwrap(), Sex::Unknown);
        assert!(matches!("X".parse::<Sex>(), Err(TextError::UnknownSex(_))));
    }

    #[test]
    fn test_sex_yaml_uses_hl7_codes() {
        let sex: Sex = serde_yaml::from_str("F").unwrap();
        assert_eq!(sex, Sex::Female);
        assert_eq!(Sex::Male.code(), "M");
    }
}
