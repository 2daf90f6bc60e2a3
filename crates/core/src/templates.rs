//! Hardcoded message templates.
//!
//! A template file maps template names to raw ER7 segments with `${PLACEHOLDER}` markers:
//!
//! ```yaml
//! custom_admit:
//!   match: { pathway: "admit_.*", step: admission }
//!   segments:
//!     - "MSH|^~\\&|||||||ADT^A01"
//!     - "PID|1||${MRN}^^^SIMHOSP^MR||${FAMILY_NAME}^${GIVEN_NAME}"
//! ```
//!
//! A `match` with a `step` replaces the generated message for that step kind. A `match` with
//! only a `pathway` replaces the whole pathway with a single message.

use crate::loader::read_yaml;
use crate::pathway::yaml_files;
use crate::{ComposeError, ComposeResult, ConfigError, ConfigResult};
use hl7::Message;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Placeholders the composer fills in.
pub const PLACEHOLDERS: &[&str] = &[
    "MRN",
    "PATIENT_ID",
    "GIVEN_NAME",
    "FAMILY_NAME",
    "BIRTH_DATE",
    "SEX",
    "NOW",
    "VISIT_ID",
    "LOCATION",
    "CONTROL_ID",
];

const STEP_KINDS: &[&str] = &[
    "admission",
    "registration",
    "transfer",
    "discharge",
    "update_person",
    "order",
    "result",
    "clinical_note",
];

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateMatch {
    #[serde(default)]
    pub pathway: Option<String>,
    #[serde(default)]
    pub step: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateFile {
    #[serde(default, rename = "match")]
    pub matcher: Option<TemplateMatch>,
    pub segments: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct HardcodedTemplate {
    name: String,
    segments: Vec<String>,
    pathway: Option<Regex>,
    step: Option<String>,
}

/// Splits `text` into literal runs and placeholder names.
fn placeholders(text: &str) -> impl Iterator<Item = Result<&str, &str>> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        match rest.find("${") {
            Some(0) => match rest[2..].find('}') {
                Some(end) => {
                    let name = &rest[2..2 + end];
                    rest = &rest[3 + end..];
                    Some(Err(name))
                }
                None => {
                    let literal = rest;
                    rest = "";
                    Some(Ok(literal))
                }
            },
            Some(start) => {
                let literal = &rest[..start];
                rest = &rest[start..];
                Some(Ok(literal))
            }
            None => {
                let literal = rest;
                rest = "";
                Some(Ok(literal))
            }
        }
    })
}

impl HardcodedTemplate {
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTemplate`] if there are no segments, the first segment is
    /// not MSH, a placeholder is unknown, or the `match` block is empty or invalid.
    pub fn new(name: impl Into<String>, file: TemplateFile) -> ConfigResult<Self> {
        let name = name.into();
        let invalid = |reason: String| ConfigError::InvalidTemplate {
            name: name.clone(),
            reason,
        };

        if !file.segments.first().is_some_and(|s| s.starts_with("MSH")) {
            return Err(invalid("the first segment must be MSH".into()));
        }
        for segment in &file.segments {
            for placeholder in placeholders(segment).filter_map(Result::err) {
                if !PLACEHOLDERS.contains(&placeholder) {
                    return Err(invalid(format!("unknown placeholder ${{{placeholder}}}")));
                }
            }
        }

        let (pathway, step) = match file.matcher {
            None => (None, None),
            Some(TemplateMatch {
                pathway: None,
                step: None,
            }) => return Err(invalid("match needs a pathway, a step, or both".into())),
            Some(TemplateMatch { pathway, step }) => {
                let pathway = pathway
                    .map(|p| {
                        Regex::new(&format!("^(?:{p})$"))
                            .map_err(|e| invalid(format!("invalid pathway pattern '{p}': {e}")))
                    })
                    .transpose()?;
                if let Some(kind) = &step {
                    if !STEP_KINDS.contains(&kind.as_str()) {
                        return Err(invalid(format!("unknown step kind '{kind}'")));
                    }
                }
                (pathway, step)
            }
        };

        Ok(Self {
            name,
            segments: file.segments,
            pathway,
            step,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn matches_pathway(&self, pathway: &str) -> bool {
        self.pathway.as_ref().map_or(true, |re| re.is_match(pathway))
    }

    /// Substitutes placeholders and parses the result.
    ///
    /// Values are inserted verbatim, so callers escape them first.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::UnknownPlaceholder`] if `values` lacks a placeholder, or an
    /// HL7 error if the rendered text is not a message.
    pub fn render(&self, values: &HashMap<&str, String>) -> ComposeResult<Message> {
        let mut text = String::new();
        for segment in &self.segments {
            for part in placeholders(segment) {
                match part {
                    Ok(literal) => text.push_str(literal),
                    Err(name) => {
                        let value =
                            values
                                .get(name)
                                .ok_or_else(|| ComposeError::UnknownPlaceholder {
                                    template: self.name.clone(),
                                    placeholder: format!("${{{name}}}"),
                                })?;
                        text.push_str(value);
                    }
                }
            }
            text.push('\r');
        }
        Ok(Message::parse(&text)?)
    }
}

/// Every hardcoded template, by name.
#[derive(Clone, Debug, Default)]
pub struct HardcodedCatalog {
    templates: BTreeMap<String, HardcodedTemplate>,
}

impl HardcodedCatalog {
    pub fn from_files(
        files: impl IntoIterator<Item = (String, TemplateFile)>,
    ) -> ConfigResult<Self> {
        let mut catalog = Self::default();
        for (name, file) in files {
            catalog.insert(HardcodedTemplate::new(name, file)?)?;
        }
        Ok(catalog)
    }

    fn insert(&mut self, template: HardcodedTemplate) -> ConfigResult<()> {
        if self.templates.contains_key(template.name()) {
            return Err(ConfigError::InvalidTemplate {
                name: template.name().to_string(),
                reason: "defined more than once".into(),
            });
        }
        self.templates.insert(template.name().to_string(), template);
        Ok(())
    }

    /// Loads every YAML file in `dir`. A missing directory yields an empty catalog.
    pub fn load_dir(dir: &Path) -> ConfigResult<Self> {
        let mut catalog = Self::default();
        if !dir.exists() {
            return Ok(catalog);
        }
        for file in yaml_files(dir)? {
            let entries: BTreeMap<String, TemplateFile> = read_yaml(&file)?;
            for (name, entry) in entries {
                catalog.insert(HardcodedTemplate::new(name, entry)?)?;
            }
        }
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Option<&HardcodedTemplate> {
        self.templates.get(name)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// The template replacing steps of kind `step` in `pathway`, if any.
    pub fn for_step(&self, pathway: &str, step: &str) -> Option<&HardcodedTemplate> {
        self.templates
            .values()
            .find(|t| t.step.as_deref() == Some(step) && t.matches_pathway(pathway))
    }

    /// The template replacing the whole of `pathway`, if any.
    pub fn pathway_override(&self, pathway: &str) -> Option<&HardcodedTemplate> {
        self.templates
            .values()
            .find(|t| t.step.is_none() && t.pathway.is_some() && t.matches_pathway(pathway))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(yaml: &str) -> ConfigResult<HardcodedCatalog> {
        let files: BTreeMap<String, TemplateFile> =
            serde_yaml::from_str(yaml).expect("template YAML should parse");
        HardcodedCatalog::from_files(files)
    }

    const TEMPLATES: &str = r#"
custom_admit:
  match: { pathway: "admit_.*", step: admission }
  segments:
    - "MSH|^~\\&|||||||ADT^A01"
    - "PID|1||${MRN}||${FAMILY_NAME}^${GIVEN_NAME}"
whole_pathway:
  match: { pathway: legacy_feed }
  segments:
    - "MSH|^~\\&|LEGACY||||${NOW}||ADT^A08|${CONTROL_ID}"
plain:
  segments:
    - "MSH|^~\\&|||||||ADT^A04"
"#;

    #[test]
    fn test_matching_by_step_and_pathway() {
        let catalog = catalog(TEMPLATES).unwrap();

        assert_eq!(
            catalog.for_step("admit_ward", "admission").map(|t| t.name()),
            Some("custom_admit")
        );
        assert!(catalog.for_step("admit_ward", "discharge").is_none());
        assert!(catalog.for_step("outpatient", "admission").is_none());

        assert_eq!(
            catalog.pathway_override("legacy_feed").map(|t| t.name()),
            Some("whole_pathway")
        );
        assert!(catalog.pathway_override("admit_ward").is_none());
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let catalog = catalog(TEMPLATES).unwrap();
        let values = HashMap::from([
            ("MRN", "000000042".to_string()),
            ("FAMILY_NAME", "Curie".to_string()),
            ("GIVEN_NAME", "Marie".to_string()),
        ]);

        let message = catalog.get("custom_admit").unwrap().render(&values).unwrap();
        let pid = message.segment("PID").unwrap();
        assert_eq!(pid.field(3), Some("000000042"));
        assert_eq!(pid.field(5), Some("Curie^Marie"));
    }

    #[test]
    fn test_render_reports_missing_value() {
        let catalog = catalog(TEMPLATES).unwrap();
        let err = catalog
            .get("custom_admit")
            .unwrap()
            .render(&HashMap::new())
            .unwrap_err();

        assert!(matches!(
            err,
            ComposeError::UnknownPlaceholder { placeholder, .. } if placeholder == "${MRN}"
        ));
    }

    #[test]
    fn test_invalid_templates_are_rejected() {
        let unknown_placeholder = "t:\n  segments: [\"MSH|^~\\\\&|${SHOE_SIZE}\"]\n";
        assert!(matches!(
            catalog(unknown_placeholder),
            Err(ConfigError::InvalidTemplate { reason, .. }) if reason.contains("SHOE_SIZE")
        ));

        let no_msh = "t:\n  segments: [\"PID|1\"]\n";
        assert!(catalog(no_msh).is_err());

        let bad_step = "t:\n  match: { step: teleport }\n  segments: [\"MSH|^~\\\\&\"]\n";
        assert!(catalog(bad_step).is_err());

        let empty_match = "t:\n  match: {}\n  segments: [\"MSH|^~\\\\&\"]\n";
        assert!(catalog(empty_match).is_err());
    }

    #[test]
    fn test_placeholder_scanner_handles_unterminated_marker() {
        let parts: Vec<_> = placeholders("A${X}B${Y").collect();
        assert_eq!(parts, vec![Ok("A"), Err("X"), Ok("B"), Ok("${Y")]);
    }

    #[test]
    fn test_missing_dir_is_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = HardcodedCatalog::load_dir(&dir.path().join("absent")).unwrap();
        assert!(catalog.is_empty());
    }
}
