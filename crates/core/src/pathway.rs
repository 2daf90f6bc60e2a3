//! Pathway definitions, validation and the pathway catalog.
//!
//! A pathway file is a YAML map from pathway name to definition:
//!
//! ```yaml
//! admit_discharge:
//!   patient: new
//!   steps:
//!     - admission: { location: Ward 1 }
//!     - delay: 10s
//!       discharge: {}
//! ```
//!
//! Each step carries exactly one action plus optional `id`, `delay` (a duration or a
//! `{from, to}` range), `basis` (`previous` or `start`), `goto` and `overrides`.

use crate::loader::read_yaml;
use crate::model::PatientRecord;
use crate::pools::DataPools;
use crate::templates::HardcodedCatalog;
use crate::{ConfigError, ConfigResult};
use chrono::NaiveDate;
use hl7::FieldPath;
use rand::Rng;
use regex::Regex;
use serde::Deserialize;
use simhospital_types::Sex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Step target that leaves the pathway.
pub const END: &str = "end";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatientBinding {
    /// Create a fresh patient for every instance.
    #[default]
    New,
    /// Reuse a stored patient no other instance is bound to, creating one if none is free.
    Existing,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayBasis {
    /// Measured from the completion of the previous step.
    #[default]
    Previous,
    /// Measured from the start of the pathway instance.
    Start,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DelayWire {
    Fixed(String),
    Range { from: String, to: String },
}

/// A fixed delay, or a uniformly distributed one when `from < to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "DelayWire")]
pub struct Delay {
    pub from: Duration,
    pub to: Duration,
}

impl TryFrom<DelayWire> for Delay {
    type Error = String;

    fn try_from(wire: DelayWire) -> Result<Self, Self::Error> {
        let parse = |text: &str| {
            humantime::parse_duration(text.trim()).map_err(|e| format!("invalid duration '{text}': {e}"))
        };
        let (from, to) = match wire {
            DelayWire::Fixed(text) => {
                let fixed = parse(&text)?;
                (fixed, fixed)
            }
            DelayWire::Range { from, to } => (parse(&from)?, parse(&to)?),
        };
        if from > to {
            return Err(format!("delay range is inverted: {from:?} > {to:?}"));
        }
        Ok(Self { from, to })
    }
}

impl Delay {
    pub fn fixed(duration: Duration) -> Self {
        Self {
            from: duration,
            to: duration,
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.from == self.to {
            self.from
        } else {
            rng.gen_range(self.from..=self.to)
        }
    }
}

/// Explicit field values applied to every message a step produces.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>")]
pub struct Overrides(pub Vec<(FieldPath, String)>);

impl TryFrom<BTreeMap<String, String>> for Overrides {
    type Error = hl7::Hl7Error;

    fn try_from(map: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        map.into_iter()
            .map(|(path, value)| Ok((path.parse::<FieldPath>()?, value)))
            .collect::<Result<Vec<_>, _>>()
            .map(Overrides)
    }
}

impl Overrides {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdmissionStep {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub patient_class: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistrationStep {
    #[serde(default)]
    pub patient_class: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferStep {
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DischargeStep {}

fn default_diagnoses() -> usize {
    1
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdatePersonStep {
    #[serde(default = "default_diagnoses")]
    pub diagnoses: usize,
    #[serde(default)]
    pub procedures: usize,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderStep {
    pub profile: String,
    /// Key a later `result` step refers to. Defaults to the profile name.
    #[serde(default)]
    pub id: Option<String>,
}

impl OrderStep {
    pub fn key(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.profile)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultStep {
    pub order_id: String,
    /// Explicit values by test id; other tests get generated values.
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClinicalNoteStep {
    #[serde(default)]
    pub note_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardcodedStep {
    pub name: String,
}

/// Predicates over a patient snapshot. Every field that is set must hold.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    #[serde(default)]
    pub has_open_encounter: Option<bool>,
    #[serde(default)]
    pub patient_class: Option<String>,
    #[serde(default)]
    pub sex: Option<Sex>,
    #[serde(default)]
    pub min_age: Option<u32>,
    #[serde(default)]
    pub max_age: Option<u32>,
    #[serde(default)]
    pub has_pending_orders: Option<bool>,
    /// Chance in `[0, 1]` that the condition holds once the other predicates pass.
    #[serde(default)]
    pub probability: Option<f64>,
}

impl Condition {
    pub fn matches<R: Rng + ?Sized>(
        &self,
        record: &PatientRecord,
        today: NaiveDate,
        rng: &mut R,
    ) -> bool {
        let open = record.open_encounter();
        if self
            .has_open_encounter
            .is_some_and(|expected| open.is_some() != expected)
        {
            return false;
        }
        if let Some(class) = &self.patient_class {
            if open.map(|e| e.patient_class.as_str()) != Some(class.as_str()) {
                return false;
            }
        }
        if self.sex.is_some_and(|sex| sex != record.patient.sex) {
            return false;
        }
        let age = record.patient.age_on(today);
        if self.min_age.is_some_and(|min| age < min) || self.max_age.is_some_and(|max| age > max)
        {
            return false;
        }
        if let Some(expected) = self.has_pending_orders {
            if open.is_some_and(|e| e.has_pending_orders()) != expected {
                return false;
            }
        }
        match self.probability {
            Some(p) => rng.gen_bool(p.clamp(0.0, 1.0)),
            None => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BranchCondition {
    pub when: Condition,
    pub goto: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BranchStep {
    pub conditions: Vec<BranchCondition>,
    #[serde(default)]
    pub otherwise: Option<String>,
}

impl BranchStep {
    /// Target of the first matching condition, else `otherwise`. `None` falls through.
    pub fn choose<R: Rng + ?Sized>(
        &self,
        record: &PatientRecord,
        today: NaiveDate,
        rng: &mut R,
    ) -> Option<&str> {
        self.conditions
            .iter()
            .find(|c| c.when.matches(record, today, rng))
            .map(|c| c.goto.as_str())
            .or(self.otherwise.as_deref())
    }
}

/// The single action a step performs.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Admission(AdmissionStep),
    Registration(RegistrationStep),
    Transfer(TransferStep),
    Discharge(DischargeStep),
    UpdatePerson(UpdatePersonStep),
    Order(OrderStep),
    Result(ResultStep),
    ClinicalNote(ClinicalNoteStep),
    HardcodedMessage(HardcodedStep),
    Branch(BranchStep),
}

impl Action {
    /// The YAML key of the action, also used to match hardcoded templates to steps.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Admission(_) => "admission",
            Action::Registration(_) => "registration",
            Action::Transfer(_) => "transfer",
            Action::Discharge(_) => "discharge",
            Action::UpdatePerson(_) => "update_person",
            Action::Order(_) => "order",
            Action::Result(_) => "result",
            Action::ClinicalNote(_) => "clinical_note",
            Action::HardcodedMessage(_) => "hardcoded_message",
            Action::Branch(_) => "branch",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub delay: Option<Delay>,
    #[serde(default)]
    pub basis: DelayBasis,
    #[serde(default)]
    pub goto: Option<String>,
    #[serde(default)]
    pub overrides: Overrides,
    #[serde(flatten)]
    pub action: Action,
}

impl Step {
    pub fn new(action: Action) -> Self {
        Self {
            id: None,
            delay: None,
            basis: DelayBasis::default(),
            goto: None,
            overrides: Overrides::default(),
            action,
        }
    }

    /// Human-readable label for logs: the step id if set, else the action kind.
    pub fn label(&self) -> &str {
        self.id.as_deref().unwrap_or(self.action.kind())
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathwayDefinition {
    #[serde(default)]
    pub patient: PatientBinding,
    #[serde(default, rename = "loop")]
    pub looping: bool,
    pub steps: Vec<Step>,
}

/// A validated pathway.
#[derive(Clone, Debug)]
pub struct Pathway {
    name: String,
    definition: PathwayDefinition,
    step_ids: HashMap<String, usize>,
}

impl Pathway {
    /// Validates a definition.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPathway`] if the name or step list is empty, a step id is
    /// duplicated or reserved, a jump target does not exist, or the step graph has a cycle and
    /// the pathway is not marked `loop: true`.
    pub fn new(name: impl Into<String>, definition: PathwayDefinition) -> ConfigResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(invalid(&name, "pathway name cannot be empty".into()));
        }
        if definition.steps.is_empty() {
            return Err(invalid(&name, "a pathway needs at least one step".into()));
        }

        let mut step_ids = HashMap::new();
        for (index, step) in definition.steps.iter().enumerate() {
            if let Some(id) = &step.id {
                if id == END || id.trim().is_empty() {
                    return Err(invalid(&name, format!("step id '{id}' is reserved or empty")));
                }
                if step_ids.insert(id.clone(), index).is_some() {
                    return Err(invalid(&name, format!("duplicate step id '{id}'")));
                }
            }
        }
        for step in &definition.steps {
            for target in step_targets(step) {
                if target != END && !step_ids.contains_key(target) {
                    return Err(invalid(&name, format!("unknown jump target '{target}'")));
                }
            }
        }

        let pathway = Self {
            name,
            definition,
            step_ids,
        };
        if !pathway.definition.looping {
            if let Some(index) = pathway.find_cycle() {
                return Err(invalid(
                    &pathway.name,
                    format!(
                        "step '{}' is part of a cycle; mark the pathway with `loop: true` to allow it",
                        pathway.definition.steps[index].label()
                    ),
                ));
            }
        }
        Ok(pathway)
    }

    /// A single-step pathway that sends one hardcoded message.
    pub fn hardcoded(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definition: PathwayDefinition {
                patient: PatientBinding::New,
                looping: false,
                steps: vec![Step::new(Action::HardcodedMessage(HardcodedStep {
                    name: template.into(),
                }))],
            },
            step_ids: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step] {
        &self.definition.steps
    }

    pub fn patient(&self) -> PatientBinding {
        self.definition.patient
    }

    pub fn is_looping(&self) -> bool {
        self.definition.looping
    }

    /// Index of `target`, where [`END`] (and anything unknown) is one past the last step.
    pub fn resolve(&self, target: &str) -> usize {
        self.step_ids
            .get(target)
            .copied()
            .unwrap_or(self.definition.steps.len())
    }

    /// Cursor after `current`, given the target a branch chose (if any).
    pub fn next_index(&self, current: usize, branch_target: Option<&str>) -> usize {
        let goto = self.definition.steps.get(current).and_then(|s| s.goto.as_deref());
        match branch_target.or(goto) {
            Some(target) => self.resolve(target),
            None => current + 1,
        }
    }

    fn successors(&self, index: usize) -> Vec<usize> {
        let step = &self.definition.steps[index];
        let fallthrough = self.next_index(index, None);
        let mut next = match &step.action {
            Action::Branch(branch) => {
                let mut targets: Vec<usize> =
                    branch.conditions.iter().map(|c| self.resolve(&c.goto)).collect();
                targets.push(
                    branch
                        .otherwise
                        .as_deref()
                        .map_or(fallthrough, |t| self.resolve(t)),
                );
                targets
            }
            _ => vec![fallthrough],
        };
        next.retain(|&i| i < self.definition.steps.len());
        next
    }

    /// Returns a step on a cycle reachable from the first step, if any.
    fn find_cycle(&self) -> Option<usize> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            Active,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.definition.steps.len()];
        let mut stack: Vec<(usize, Vec<usize>)> = vec![(0, self.successors(0))];
        marks[0] = Mark::Active;

        while let Some((node, pending)) = stack.last_mut() {
            match pending.pop() {
                Some(next) => match marks[next] {
                    Mark::Active => return Some(next),
                    Mark::Unvisited => {
                        marks[next] = Mark::Active;
                        let successors = self.successors(next);
                        stack.push((next, successors));
                    }
                    Mark::Done => {}
                },
                None => {
                    marks[*node] = Mark::Done;
                    stack.pop();
                }
            }
        }
        None
    }

    /// Checks that locations, order profiles and hardcoded messages referenced by the steps
    /// exist.
    pub fn check_references(
        &self,
        pools: &DataPools,
        templates: &HardcodedCatalog,
    ) -> ConfigResult<()> {
        let reject = |reason: String| invalid(&self.name, reason);
        for step in self.steps() {
            match &step.action {
                Action::Admission(AdmissionStep {
                    location: Some(location),
                    ..
                })
                | Action::Transfer(TransferStep {
                    location: Some(location),
                }) if !pools.locations.contains_key(location) => {
                    return Err(reject(format!("unknown location '{location}'")));
                }
                Action::Order(order) if !pools.order_profiles.contains_key(&order.profile) => {
                    return Err(reject(format!("unknown order profile '{}'", order.profile)));
                }
                Action::HardcodedMessage(hardcoded) if templates.get(&hardcoded.name).is_none() => {
                    return Err(reject(format!(
                        "unknown hardcoded message '{}'",
                        hardcoded.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn invalid(name: &str, reason: String) -> ConfigError {
    ConfigError::InvalidPathway {
        name: name.to_string(),
        reason,
    }
}

fn step_targets(step: &Step) -> Vec<&str> {
    let mut targets: Vec<&str> = step.goto.as_deref().into_iter().collect();
    if let Action::Branch(branch) = &step.action {
        targets.extend(branch.conditions.iter().map(|c| c.goto.as_str()));
        targets.extend(branch.otherwise.as_deref());
    }
    targets
}

/// Include/exclude filter over pathway names.
///
/// Patterns are anchored regular expressions, so a plain name matches only itself. Exclusion
/// wins over inclusion and an empty include list admits every name.
#[derive(Clone, Debug, Default)]
pub struct PathwayFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl PathwayFilter {
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidFilter`] if a pattern is not a valid regex.
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> ConfigResult<Self> {
        Ok(Self {
            include: compile_patterns(include)?,
            exclude: compile_patterns(exclude)?,
        })
    }

    pub fn allows(&self, name: &str) -> bool {
        if self.exclude.iter().any(|re| re.is_match(name)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|re| re.is_match(name))
    }
}

fn compile_patterns<S: AsRef<str>>(patterns: &[S]) -> ConfigResult<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| p.as_ref().trim())
        .filter(|p| !p.is_empty())
        .map(|p| {
            Regex::new(&format!("^(?:{p})$")).map_err(|source| ConfigError::InvalidFilter {
                pattern: p.to_string(),
                source,
            })
        })
        .collect()
}

/// Splits a comma-separated flag value into patterns.
pub fn split_names(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Every pathway definition known to the run, by name.
#[derive(Clone, Debug, Default)]
pub struct PathwayCatalog {
    pathways: BTreeMap<String, Arc<Pathway>>,
}

impl PathwayCatalog {
    /// # Errors
    ///
    /// Returns the first validation error, or [`ConfigError::DuplicatePathway`].
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = (String, PathwayDefinition)>,
    ) -> ConfigResult<Self> {
        let mut catalog = Self::default();
        for (name, definition) in definitions {
            catalog.insert(Pathway::new(name, definition)?)?;
        }
        Ok(catalog)
    }

    fn insert(&mut self, pathway: Pathway) -> ConfigResult<()> {
        if self.pathways.contains_key(pathway.name()) {
            return Err(ConfigError::DuplicatePathway(pathway.name().to_string()));
        }
        self.pathways
            .insert(pathway.name().to_string(), Arc::new(pathway));
        Ok(())
    }

    /// Loads every `.yml`/`.yaml` file in `dir`, in file-name order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the directory cannot be listed, and any parse or
    /// validation error from the files. Names must be unique across all files.
    pub fn load_dir(dir: &Path) -> ConfigResult<Self> {
        let mut catalog = Self::default();
        for file in yaml_files(dir)? {
            let definitions: BTreeMap<String, PathwayDefinition> = read_yaml(&file)?;
            for (name, definition) in definitions {
                catalog.insert(Pathway::new(name, definition)?)?;
            }
        }
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pathway>> {
        self.pathways.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.pathways.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pathways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pathways.is_empty()
    }

    /// Pathways admitted by `filter`, in name order.
    pub fn filtered(&self, filter: &PathwayFilter) -> Vec<Arc<Pathway>> {
        self.pathways
            .values()
            .filter(|p| filter.allows(p.name()))
            .cloned()
            .collect()
    }

    /// Runs [`Pathway::check_references`] on every pathway.
    pub fn check_references(
        &self,
        pools: &DataPools,
        templates: &HardcodedCatalog,
    ) -> ConfigResult<()> {
        self.pathways
            .values()
            .try_for_each(|p| p.check_references(pools, templates))
    }
}

/// `.yml` and `.yaml` files directly inside `dir`, sorted by path.
pub(crate) fn yaml_files(dir: &Path) -> ConfigResult<Vec<std::path::PathBuf>> {
    let read_error = |source| ConfigError::Read {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_error)? {
        let path = entry.map_err(read_error)?.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yml" || e == "yaml");
        if is_yaml && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Address, Encounter, Patient};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use simhospital_ids::PatientId;

    fn parse(yaml: &str) -> ConfigResult<PathwayCatalog> {
        let definitions: BTreeMap<String, PathwayDefinition> =
            serde_yaml::from_str(yaml).expect("pathway YAML should parse");
        PathwayCatalog::from_definitions(definitions)
    }

    #[test]
    fn test_parse_steps_with_delays_and_overrides() {
        let catalog = parse(
            r#"
admit_discharge:
  steps:
    - id: admit
      admission: { location: Ward 1 }
      overrides:
        PV1.3: "CUSTOM^BED"
    - delay: 10s
      discharge: {}
    - delay: { from: 1m, to: 2m }
      basis: start
      clinical_note: {}
"#,
        )
        .expect("catalog should be valid");

        let pathway = catalog.get("admit_discharge").unwrap();
        let steps = pathway.steps();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].label(), "admit");
        assert_eq!(steps[0].overrides.0[0].0.to_string(), "PV1.3");
        assert_eq!(steps[1].delay, Some(Delay::fixed(Duration::from_secs(10))));
        assert_eq!(steps[1].action.kind(), "discharge");
        assert_eq!(steps[2].basis, DelayBasis::Start);
        assert_eq!(
            steps[2].delay,
            Some(Delay {
                from: Duration::from_secs(60),
                to: Duration::from_secs(120)
            })
        );
        assert_eq!(pathway.patient(), PatientBinding::New);
    }

    #[test]
    fn test_inverted_delay_is_rejected() {
        let result = serde_yaml::from_str::<BTreeMap<String, PathwayDefinition>>(
            "p:\n  steps:\n    - delay: { from: 2m, to: 1m }\n      discharge: {}\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_delay_sample_stays_in_range() {
        let delay = Delay {
            from: Duration::from_secs(5),
            to: Duration::from_secs(10),
        };
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..100 {
            let d = delay.sample(&mut rng);
            assert!(d >= delay.from && d <= delay.to);
        }
    }

    #[test]
    fn test_cycle_requires_loop_flag() {
        let yaml = r#"
ping:
  steps:
    - id: a
      clinical_note: {}
    - goto: a
      clinical_note: {}
"#;
        let err = parse(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPathway { reason, .. } if reason.contains("cycle")));

        let looping = yaml.replace("ping:\n", "ping:\n  loop: true\n");
        let catalog = parse(&looping).expect("looping pathway should be valid");
        assert!(catalog.get("ping").unwrap().is_looping());
    }

    #[test]
    fn test_branch_cycle_is_detected() {
        let yaml = r#"
retry:
  steps:
    - id: check
      branch:
        conditions:
          - when: { probability: 0.5 }
            goto: check
        otherwise: end
"#;
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn test_unknown_target_and_duplicate_ids() {
        let unknown = "p:\n  steps:\n    - goto: nowhere\n      discharge: {}\n";
        assert!(matches!(
            parse(unknown),
            Err(ConfigError::InvalidPathway { reason, .. }) if reason.contains("nowhere")
        ));

        let duplicate = "p:\n  steps:\n    - id: x\n      discharge: {}\n    - id: x\n      discharge: {}\n";
        assert!(matches!(
            parse(duplicate),
            Err(ConfigError::InvalidPathway { reason, .. }) if reason.contains("duplicate")
        ));

        let empty = "p:\n  steps: []\n";
        assert!(parse(empty).is_err());
    }

    #[test]
    fn test_next_index_follows_goto_and_end() {
        let catalog = parse(
            r#"
p:
  steps:
    - goto: last
      admission: {}
    - clinical_note: {}
    - id: last
      goto: end
      discharge: {}
"#,
        )
        .unwrap();
        let pathway = catalog.get("p").unwrap();

        assert_eq!(pathway.next_index(0, None), 2);
        assert_eq!(pathway.next_index(1, None), 2);
        assert_eq!(pathway.next_index(2, None), 3);
        assert_eq!(pathway.next_index(1, Some(END)), 3);
    }

    fn record(sex: Sex, open_class: Option<&str>) -> PatientRecord {
        let mut record = PatientRecord::new(Patient {
            id: PatientId::new(),
            mrn: "000000009".parse().unwrap(),
            prefix: None,
            given_name: "Alan".into(),
            family_name: "Turing".into(),
            birth_date: NaiveDate::from_ymd_opt(1950, 1, 1).unwrap(),
            sex,
            address: Address::default(),
            ethnicity: None,
            allergies: Vec::new(),
        });
        if let Some(class) = open_class {
            record.encounters.push(Encounter {
                visit_number: "1".into(),
                patient_class: class.into(),
                location: None,
                prior_location: None,
                attending: None,
                admitted_at: chrono::Utc::now(),
                discharged_at: None,
                diagnoses: Vec::new(),
                procedures: Vec::new(),
                orders: Vec::new(),
            });
        }
        record
    }

    #[test]
    fn test_branch_first_match_wins() {
        let branch: BranchStep = serde_yaml::from_str(
            r#"
conditions:
  - when: { sex: F }
    goto: female
  - when: { has_open_encounter: true, patient_class: I, min_age: 60 }
    goto: elderly_inpatient
otherwise: fallback
"#,
        )
        .unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        assert_eq!(
            branch.choose(&record(Sex::Female, Some("I")), today, &mut rng),
            Some("female")
        );
        assert_eq!(
            branch.choose(&record(Sex::Male, Some("I")), today, &mut rng),
            Some("elderly_inpatient")
        );
        assert_eq!(
            branch.choose(&record(Sex::Male, Some("O")), today, &mut rng),
            Some("fallback")
        );
    }

    #[test]
    fn test_probability_bounds() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let patient = record(Sex::Male, None);

        let never = Condition {
            probability: Some(0.0),
            ..Condition::default()
        };
        let always = Condition {
            probability: Some(1.0),
            ..Condition::default()
        };
        for _ in 0..50 {
            assert!(!never.matches(&patient, today, &mut rng));
            assert!(always.matches(&patient, today, &mut rng));
        }
    }

    #[test]
    fn test_filter_is_anchored_and_exclusion_wins() {
        let filter = PathwayFilter::new(
            &split_names("admit.*, discharge"),
            &split_names("admit_icu"),
        )
        .unwrap();

        assert!(filter.allows("admit_ward"));
        assert!(filter.allows("discharge"));
        assert!(!filter.allows("discharge_home"));
        assert!(!filter.allows("admit_icu"));
        assert!(!filter.allows("readmit_ward"));

        let all = PathwayFilter::new::<String>(&[], &["".to_string()]).unwrap();
        assert!(all.allows("anything"));

        assert!(matches!(
            PathwayFilter::new(&["("], &[]),
            Err(ConfigError::InvalidFilter { .. })
        ));
    }

    #[test]
    fn test_load_dir_rejects_duplicates_across_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.yml"),
            "p:\n  steps:\n    - discharge: {}\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.yaml"),
            "p:\n  steps:\n    - discharge: {}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        assert!(matches!(
            PathwayCatalog::load_dir(dir.path()),
            Err(ConfigError::DuplicatePathway(name)) if name == "p"
        ));

        std::fs::remove_file(dir.path().join("b.yaml")).unwrap();
        let catalog = PathwayCatalog::load_dir(dir.path()).unwrap();
        assert_eq!(catalog.names(), vec!["p".to_string()]);
    }
}
