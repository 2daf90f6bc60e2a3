//! ER7 segment and message model.
//!
//! Field indexes are 1-based, as in the HL7 standard. MSH is special: MSH-1 *is* the field
//! separator and MSH-2 holds the encoding characters, so the first stored value of an MSH
//! segment is MSH-2.

use crate::{Hl7Error, Hl7Result};
use std::fmt;
use std::str::FromStr;

pub const FIELD_SEPARATOR: char = '|';
pub const COMPONENT_SEPARATOR: char = '^';
pub const REPETITION_SEPARATOR: char = '~';
pub const ESCAPE_CHARACTER: char = '\\';
pub const SUBCOMPONENT_SEPARATOR: char = '&';
pub const SEGMENT_TERMINATOR: char = '\r';

/// MSH-2 value for the default delimiters.
pub const ENCODING_CHARACTERS: &str = "^~\\&";

/// Escapes delimiter characters so that `text` can be placed inside a single component.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            FIELD_SEPARATOR => out.push_str("\\F\\"),
            COMPONENT_SEPARATOR => out.push_str("\\S\\"),
            REPETITION_SEPARATOR => out.push_str("\\R\\"),
            ESCAPE_CHARACTER => out.push_str("\\E\\"),
            SUBCOMPONENT_SEPARATOR => out.push_str("\\T\\"),
            '\r' | '\n' => out.push_str("\\.br\\"),
            other => out.push(other),
        }
    }
    out
}

/// Joins escaped components with `^`, dropping trailing empty components.
pub fn components<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut escaped: Vec<String> = parts.into_iter().map(|p| escape(p.as_ref())).collect();
    while escaped.last().is_some_and(|c| c.is_empty()) {
        escaped.pop();
    }
    escaped.join(&COMPONENT_SEPARATOR.to_string())
}

/// One ER7 segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    id: String,
    fields: Vec<String>,
}

impl Segment {
    pub fn new(id: &str) -> Self {
        let mut segment = Self {
            id: id.to_string(),
            fields: Vec::new(),
        };
        if segment.is_header() {
            segment.fields.push(ENCODING_CHARACTERS.to_string());
        }
        segment
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn is_header(&self) -> bool {
        self.id == "MSH"
    }

    /// Maps a 1-based field index to its position in `fields`.
    fn slot(&self, index: usize) -> Option<usize> {
        match (self.is_header(), index) {
            (_, 0) | (true, 1) => None,
            (true, n) => Some(n - 2),
            (false, n) => Some(n - 1),
        }
    }

    /// Returns field `index` (1-based) as raw ER7 text. Missing trailing fields are `None`.
    pub fn field(&self, index: usize) -> Option<&str> {
        if self.is_header() && index == 1 {
            return Some("|");
        }
        self.slot(index)
            .and_then(|slot| self.fields.get(slot))
            .map(String::as_str)
    }

    /// Sets field `index` (1-based) to already-encoded `value`, padding intermediate fields.
    ///
    /// # Errors
    ///
    /// Returns [`Hl7Error::InvalidFieldPath`] for index 0 and for MSH-1.
    pub fn set(&mut self, index: usize, value: impl Into<String>) -> Hl7Result<()> {
        let slot = self
            .slot(index)
            .ok_or_else(|| Hl7Error::InvalidFieldPath(format!("{}.{}", self.id, index)))?;
        if self.fields.len() <= slot {
            self.fields.resize(slot + 1, String::new());
        }
        self.fields[slot] = value.into();
        Ok(())
    }

    /// Builder form of [`Segment::set`] for indexes known to be valid.
    ///
    /// Index 0 and MSH-1 are silently skipped.
    pub fn with(mut self, index: usize, value: impl Into<String>) -> Self {
        let settable = self.set(index, value).is_ok();
        debug_assert!(settable, "field {index} of {} is not settable", self.id);
        self
    }

    /// Renders the segment without its terminator.
    pub fn to_er7(&self) -> String {
        let mut out = self.id.clone();
        let last = self
            .fields
            .iter()
            .rposition(|f| !f.is_empty())
            .map_or(0, |p| p + 1);
        for field in &self.fields[..last] {
            out.push(FIELD_SEPARATOR);
            out.push_str(field);
        }
        out
    }

    /// Parses one ER7 segment line.
    pub fn parse(line: &str) -> Hl7Result<Self> {
        let mut parts = line.split(FIELD_SEPARATOR);
        let id = parts.next().unwrap_or_default();
        if id.len() != 3 || !id.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Hl7Error::InvalidInput(format!(
                "segment id must be three alphanumeric characters, got '{}'",
                id
            )));
        }
        Ok(Self {
            id: id.to_string(),
            fields: parts.map(str::to_string).collect(),
        })
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_er7())
    }
}

/// A field address such as `PV1.3` (or `PV1-3`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldPath {
    pub segment: String,
    pub field: usize,
}

impl FromStr for FieldPath {
    type Err = Hl7Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (segment, field) = s
            .split_once(['.', '-'])
            .ok_or_else(|| Hl7Error::InvalidFieldPath(s.to_string()))?;
        let field: usize = field
            .parse()
            .map_err(|_| Hl7Error::InvalidFieldPath(s.to_string()))?;
        if segment.len() != 3 || field == 0 {
            return Err(Hl7Error::InvalidFieldPath(s.to_string()));
        }
        Ok(Self {
            segment: segment.to_ascii_uppercase(),
            field,
        })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.segment, self.field)
    }
}

/// An ordered list of segments, the first of which is MSH.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    segments: Vec<Segment>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The first segment with the given id.
    pub fn segment(&self, id: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.id == id)
    }

    pub fn segment_mut(&mut self, id: &str) -> Option<&mut Segment> {
        self.segments.iter_mut().find(|s| s.id == id)
    }

    pub fn field(&self, path: &FieldPath) -> Option<&str> {
        self.segment(&path.segment)
            .and_then(|s| s.field(path.field))
    }

    /// Sets the addressed field in the first matching segment.
    ///
    /// # Errors
    ///
    /// Returns [`Hl7Error::MissingSegment`] if the message has no such segment.
    pub fn set_field(&mut self, path: &FieldPath, value: impl Into<String>) -> Hl7Result<()> {
        self.segment_mut(&path.segment)
            .ok_or_else(|| Hl7Error::MissingSegment(path.segment.clone()))?
            .set(path.field, value)
    }

    /// MSH-9, e.g. `ADT^A01`.
    pub fn message_type(&self) -> Option<&str> {
        self.segment("MSH").and_then(|s| s.field(9))
    }

    /// MSH-10.
    pub fn control_id(&self) -> Option<&str> {
        self.segment("MSH").and_then(|s| s.field(10))
    }

    /// Renders the message with each segment terminated by `\r`.
    pub fn to_er7(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            out.push_str(&segment.to_er7());
            out.push(SEGMENT_TERMINATOR);
        }
        out
    }

    /// Parses ER7 text. Segments may be separated by `\r`, `\n` or `\r\n`.
    ///
    /// # Errors
    ///
    /// Returns [`Hl7Error::InvalidInput`] if the text is empty, does not start with MSH,
    /// or contains a malformed segment id.
    pub fn parse(text: &str) -> Hl7Result<Self> {
        let segments = text
            .split(['\r', '\n'])
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .map(Segment::parse)
            .collect::<Hl7Result<Vec<_>>>()?;

        match segments.first() {
            Some(first) if first.id == "MSH" => Ok(Self { segments }),
            Some(first) => Err(Hl7Error::InvalidInput(format!(
                "message must start with MSH, got {}",
                first.id
            ))),
            None => Err(Hl7Error::InvalidInput("message is empty".into())),
        }
    }
}
