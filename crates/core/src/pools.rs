//! Weighted data pools used to generate patients, encounters and clinical content.
//!
//! Pools are loaded once from YAML and are read-only afterwards; every pathway instance shares
//! them through an `Arc<DataPools>`.

use crate::{ComposeError, ComposeResult, ConfigError, ConfigResult};
use rand::Rng;
use serde::Deserialize;
use simhospital_types::{CodedValue, Sex};
use std::collections::BTreeMap;

/// A pool of values with integer weights.
///
/// Cumulative weights are computed once, so a pick is one uniform draw plus a binary search.
/// Entries with weight zero are never picked.
#[derive(Clone, Debug)]
pub struct WeightedPool<T> {
    items: Vec<T>,
    cumulative: Vec<u64>,
}

impl<T> Default for WeightedPool<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            cumulative: Vec::new(),
        }
    }
}

impl<T> WeightedPool<T> {
    pub fn new(entries: impl IntoIterator<Item = (T, u64)>) -> Self {
        let mut pool = Self::default();
        let mut total = 0u64;
        for (item, weight) in entries {
            if weight == 0 {
                continue;
            }
            total = total.saturating_add(weight);
            pool.items.push(item);
            pool.cumulative.push(total);
        }
        pool
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or_default()
    }

    /// Picks an item with probability proportional to its weight. `None` if the pool is empty.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&T> {
        let total = *self.cumulative.last()?;
        let draw = rng.gen_range(0..total);
        let index = self.cumulative.partition_point(|&c| c <= draw);
        self.items.get(index)
    }

    /// Like [`WeightedPool::pick`], but an empty pool is a composition error naming the pool.
    pub fn pick_from<R: Rng + ?Sized>(&self, name: &'static str, rng: &mut R) -> ComposeResult<&T> {
        self.pick(rng).ok_or(ComposeError::EmptyPool(name))
    }
}

fn default_weight() -> u64 {
    1
}

/// `{value, weight}` entry as written in the data file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Weighted<T> {
    pub value: T,
    #[serde(default = "default_weight")]
    pub weight: u64,
}

/// `{id, text, weight}` entry as written in the data file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeightedCode {
    pub id: String,
    pub text: String,
    #[serde(default = "default_weight")]
    pub weight: u64,
}

fn pool<T>(entries: Vec<Weighted<T>>) -> WeightedPool<T> {
    WeightedPool::new(entries.into_iter().map(|e| (e.value, e.weight)))
}

fn code_pool(entries: Vec<WeightedCode>) -> WeightedPool<CodedValue> {
    WeightedPool::new(
        entries
            .into_iter()
            .map(|e| (CodedValue::new(e.id, e.text), e.weight)),
    )
}

/// An inclusive age range in whole years.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgeBand {
    pub from: u32,
    pub to: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgeBandEntry {
    pub from: u32,
    pub to: u32,
    #[serde(default = "default_weight")]
    pub weight: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BySex<T> {
    #[serde(default = "Vec::new")]
    pub female: Vec<T>,
    #[serde(default = "Vec::new")]
    pub male: Vec<T>,
}

impl<T> Default for BySex<T> {
    fn default() -> Self {
        Self {
            female: Vec::new(),
            male: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddressFile {
    pub streets: Vec<Weighted<String>>,
    pub cities: Vec<Weighted<String>>,
    #[serde(default)]
    pub postcodes: Vec<Weighted<String>>,
    #[serde(default)]
    pub country: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotesFile {
    #[serde(default)]
    pub types: Vec<Weighted<String>>,
    #[serde(default)]
    pub texts: Vec<Weighted<String>>,
}

fn default_max_allergies() -> usize {
    2
}

/// Schema of the main data file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataFile {
    pub given_names: BySex<Weighted<String>>,
    pub surnames: Vec<Weighted<String>>,
    #[serde(default)]
    pub prefixes: BySex<Weighted<String>>,
    pub sex: Vec<Weighted<Sex>>,
    pub ages: Vec<AgeBandEntry>,
    pub address: AddressFile,
    #[serde(default)]
    pub ethnicities: Vec<WeightedCode>,
    #[serde(default)]
    pub patient_classes: Vec<Weighted<String>>,
    #[serde(default)]
    pub diagnoses: Vec<WeightedCode>,
    #[serde(default)]
    pub procedures: Vec<WeightedCode>,
    #[serde(default)]
    pub allergies: Vec<WeightedCode>,
    #[serde(default = "default_max_allergies")]
    pub max_allergies: usize,
    #[serde(default)]
    pub notes: NotesFile,
}

/// A ward, clinic or department with its rooms and beds.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Location {
    pub point_of_care: String,
    #[serde(default)]
    pub facility: String,
    #[serde(default)]
    pub rooms: Vec<String>,
    #[serde(default)]
    pub beds: Vec<String>,
}

/// A concrete place a patient is assigned to, rendered into PV1-3.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bed {
    pub point_of_care: String,
    pub room: String,
    pub bed: String,
    pub facility: String,
}

fn default_doctor_prefix() -> String {
    "Dr".into()
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Doctor {
    pub id: String,
    pub surname: String,
    pub given: String,
    #[serde(default = "default_doctor_prefix")]
    pub prefix: String,
}

fn default_decimals() -> u32 {
    1
}

/// One test inside an order profile, with its normal range.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestDefinition {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub units: String,
    pub low: f64,
    pub high: f64,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
}

impl TestDefinition {
    pub fn code(&self) -> CodedValue {
        CodedValue::new(&self.id, &self.text)
    }

    pub fn reference_range(&self) -> String {
        let precision = self.decimals as usize;
        format!("{:.precision$}-{:.precision$}", self.low, self.high)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderProfile {
    pub service: CodedValue,
    pub tests: Vec<TestDefinition>,
}

/// All generation data for a run.
#[derive(Clone, Debug, Default)]
pub struct DataPools {
    pub given_names_female: WeightedPool<String>,
    pub given_names_male: WeightedPool<String>,
    pub surnames: WeightedPool<String>,
    pub prefixes_female: WeightedPool<String>,
    pub prefixes_male: WeightedPool<String>,
    pub sexes: WeightedPool<Sex>,
    pub ages: WeightedPool<AgeBand>,
    pub streets: WeightedPool<String>,
    pub cities: WeightedPool<String>,
    pub postcodes: WeightedPool<String>,
    pub country: String,
    pub ethnicities: WeightedPool<CodedValue>,
    pub patient_classes: WeightedPool<String>,
    pub diagnoses: WeightedPool<CodedValue>,
    pub procedures: WeightedPool<CodedValue>,
    pub allergies: WeightedPool<CodedValue>,
    pub max_allergies: usize,
    pub note_types: WeightedPool<String>,
    pub note_texts: WeightedPool<String>,
    pub locations: BTreeMap<String, Location>,
    pub doctors: Vec<Doctor>,
    pub order_profiles: BTreeMap<String, OrderProfile>,
}

impl DataPools {
    /// Builds pools from parsed files and checks the pools every patient depends on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for an empty mandatory pool, an inverted age band
    /// or normal range, or a location without beds.
    pub fn from_files(
        data: DataFile,
        locations: BTreeMap<String, Location>,
        doctors: Vec<Doctor>,
        order_profiles: BTreeMap<String, OrderProfile>,
    ) -> ConfigResult<Self> {
        for band in &data.ages {
            if band.from > band.to {
                return Err(ConfigError::InvalidValue(format!(
                    "age band {}-{} is inverted",
                    band.from, band.to
                )));
            }
        }
        for (name, profile) in &order_profiles {
            if profile.tests.is_empty() {
                return Err(ConfigError::InvalidValue(format!(
                    "order profile '{name}' has no tests"
                )));
            }
            if let Some(test) = profile.tests.iter().find(|t| t.low > t.high) {
                return Err(ConfigError::InvalidValue(format!(
                    "order profile '{name}': test '{}' has low > high",
                    test.id
                )));
            }
        }
        if let Some((name, _)) = locations.iter().find(|(_, l)| l.beds.is_empty()) {
            return Err(ConfigError::InvalidValue(format!(
                "location '{name}' has no beds"
            )));
        }

        let pools = Self {
            given_names_female: pool(data.given_names.female),
            given_names_male: pool(data.given_names.male),
            surnames: pool(data.surnames),
            prefixes_female: pool(data.prefixes.female),
            prefixes_male: pool(data.prefixes.male),
            sexes: pool(data.sex),
            ages: WeightedPool::new(
                data.ages
                    .into_iter()
                    .map(|e| (AgeBand { from: e.from, to: e.to }, e.weight)),
            ),
            streets: pool(data.address.streets),
            cities: pool(data.address.cities),
            postcodes: pool(data.address.postcodes),
            country: data.address.country,
            ethnicities: code_pool(data.ethnicities),
            patient_classes: pool(data.patient_classes),
            diagnoses: code_pool(data.diagnoses),
            procedures: code_pool(data.procedures),
            allergies: code_pool(data.allergies),
            max_allergies: data.max_allergies,
            note_types: pool(data.notes.types),
            note_texts: pool(data.notes.texts),
            locations,
            doctors,
            order_profiles,
        };

        for (name, empty) in [
            ("given_names.female", pools.given_names_female.is_empty()),
            ("given_names.male", pools.given_names_male.is_empty()),
            ("surnames", pools.surnames.is_empty()),
            ("sex", pools.sexes.is_empty()),
            ("ages", pools.ages.is_empty()),
            ("address.streets", pools.streets.is_empty()),
            ("address.cities", pools.cities.is_empty()),
        ] {
            if empty {
                return Err(ConfigError::InvalidValue(format!(
                    "data pool '{name}' must have at least one entry with a positive weight"
                )));
            }
        }
        Ok(pools)
    }

    /// Picks a bed in the named location, or in a random location if `name` is `None`.
    pub fn pick_bed<R: Rng + ?Sized>(&self, name: Option<&str>, rng: &mut R) -> ComposeResult<Bed> {
        let location = match name {
            Some(name) => self
                .locations
                .get(name)
                .ok_or_else(|| ComposeError::UnknownLocation(name.to_string()))?,
            None => {
                if self.locations.is_empty() {
                    return Err(ComposeError::EmptyPool("locations"));
                }
                let index = rng.gen_range(0..self.locations.len());
                self.locations
                    .values()
                    .nth(index)
                    .ok_or(ComposeError::EmptyPool("locations"))?
            }
        };
        let room = pick_uniform(&location.rooms, rng).cloned().unwrap_or_default();
        let bed = pick_uniform(&location.beds, rng)
            .cloned()
            .ok_or_else(|| ComposeError::UnknownLocation(location.point_of_care.clone()))?;
        Ok(Bed {
            point_of_care: location.point_of_care.clone(),
            room,
            bed,
            facility: location.facility.clone(),
        })
    }

    pub fn pick_doctor<R: Rng + ?Sized>(&self, rng: &mut R) -> ComposeResult<&Doctor> {
        pick_uniform(&self.doctors, rng).ok_or(ComposeError::EmptyPool("doctors"))
    }

    pub fn order_profile(&self, name: &str) -> ComposeResult<&OrderProfile> {
        self.order_profiles
            .get(name)
            .ok_or_else(|| ComposeError::UnknownOrderProfile(name.to_string()))
    }
}

fn pick_uniform<'a, T, R: Rng + ?Sized>(items: &'a [T], rng: &mut R) -> Option<&'a T> {
    if items.is_empty() {
        return None;
    }
    items.get(rng.gen_range(0..items.len()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    pub(crate) const DATA_YAML: &str = r#"
given_names:
  female:
    - { value: Olivia, weight: 3 }
    - { value: Amelia }
  male:
    - { value: Oliver }
surnames:
  - { value: Smith, weight: 5 }
  - { value: "O'Brien" }
prefixes:
  female: [{ value: Ms }]
  male: [{ value: Mr }]
sex:
  - { value: F, weight: 51 }
  - { value: M, weight: 49 }
ages:
  - { from: 18, to: 40, weight: 2 }
  - { from: 41, to: 90 }
address:
  streets: [{ value: High Street }]
  cities: [{ value: London }]
  postcodes: [{ value: N1 9GU }]
  country: GBR
ethnicities:
  - { id: A, text: White British }
patient_classes:
  - { value: I }
diagnoses:
  - { id: J18.9, text: Pneumonia, weight: 2 }
  - { id: I21.9, text: Myocardial infarction }
procedures:
  - { id: "0JBC0ZZ", text: Excision of skin }
allergies:
  - { id: Z88.0, text: Penicillin }
max_allergies: 1
notes:
  types: [{ value: Discharge summary }]
  texts: [{ value: "Patient stable. Follow up in clinic." }]
"#;

    pub(crate) const LOCATIONS_YAML: &str = r#"
Ward 1:
  point_of_care: W1
  facility: SIMHOSP
  rooms: [Bay 1]
  beds: ["1", "2"]
ED:
  point_of_care: ED
  beds: ["A"]
"#;

    pub(crate) const DOCTORS_YAML: &str = r#"
- { id: "C1", surname: Osman, given: Arif }
"#;

    pub(crate) const ORDER_PROFILES_YAML: &str = r#"
UREA AND ELECTROLYTES:
  service: { id: UE, text: Urea and electrolytes }
  tests:
    - { id: NA, text: Sodium, units: mmol/L, low: 135, high: 145, decimals: 0 }
    - { id: K, text: Potassium, units: mmol/L, low: 3.5, high: 5.3 }
"#;

    pub(crate) fn sample_pools() -> DataPools {
        DataPools::from_files(
            serde_yaml::from_str(DATA_YAML).expect("data should parse"),
            serde_yaml::from_str(LOCATIONS_YAML).expect("locations should parse"),
            serde_yaml::from_str(DOCTORS_YAML).expect("doctors should parse"),
            serde_yaml::from_str(ORDER_PROFILES_YAML).expect("profiles should parse"),
        )
        .expect("sample pools should be valid")
    }

    #[test]
    fn test_pick_follows_weights() {
        let pool = WeightedPool::new([("a", 1), ("b", 0), ("c", 3)]);
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let mut counts = [0usize; 2];
        for _ in 0..4000 {
            match *pool.pick(&mut rng).unwrap() {
                "a" => counts[0] += 1,
                "c" => counts[1] += 1,
                other => panic!("zero-weight entry {other} was picked"),
            }
        }

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.total_weight(), 4);
        let ratio = counts[1] as f64 / counts[0] as f64;
        assert!((2.5..3.5).contains(&ratio), "ratio was {ratio}");
    }

    #[test]
    fn test_empty_pool_picks_nothing() {
        let pool: WeightedPool<u8> = WeightedPool::new([(1, 0)]);
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        assert!(pool.pick(&mut rng).is_none());
        assert!(matches!(
            pool.pick_from("things", &mut rng),
            Err(ComposeError::EmptyPool("things"))
        ));
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let pools = sample_pools();
        let mut a = ChaCha8Rng::seed_from_u64(99);
        let mut b = ChaCha8Rng::seed_from_u64(99);

        for _ in 0..20 {
            assert_eq!(pools.surnames.pick(&mut a), pools.surnames.pick(&mut b));
        }
    }

    #[test]
    fn test_from_files_rejects_empty_mandatory_pool() {
        let mut data: DataFile = serde_yaml::from_str(DATA_YAML).unwrap();
        data.surnames.clear();

        let err = DataPools::from_files(data, BTreeMap::new(), Vec::new(), BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(msg) if msg.contains("surnames")));
    }

    #[test]
    fn test_from_files_rejects_inverted_range() {
        let data: DataFile = serde_yaml::from_str(DATA_YAML).unwrap();
        let profiles: BTreeMap<String, OrderProfile> = serde_yaml::from_str(
            "X:\n  service: { id: X, text: X }\n  tests: [{ id: T, text: T, low: 5, high: 1 }]\n",
        )
        .unwrap();

        assert!(DataPools::from_files(data, BTreeMap::new(), Vec::new(), profiles).is_err());
    }

    #[test]
    fn test_pick_bed_named_and_unknown() {
        let pools = sample_pools();
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        let bed = pools.pick_bed(Some("Ward 1"), &mut rng).unwrap();
        assert_eq!(bed.point_of_care, "W1");
        assert_eq!(bed.room, "Bay 1");
        assert!(["1", "2"].contains(&bed.bed.as_str()));

        assert!(matches!(
            pools.pick_bed(Some("Nowhere"), &mut rng),
            Err(ComposeError::UnknownLocation(_))
        ));
    }

    #[test]
    fn test_reference_range_uses_precision() {
        let pools = sample_pools();
        let profile = pools.order_profile("UREA AND ELECTROLYTES").unwrap();

        assert_eq!(profile.tests[0].reference_range(), "135-145");
        assert_eq!(profile.tests[1].reference_range(), "3.5-5.3");
    }
}
