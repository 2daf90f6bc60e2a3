//! Store mutations performed by pathway steps.
//!
//! Every random choice a step makes (bed, attending doctor, diagnoses, result values) is made
//! here and persisted on the record, so that later steps and messages for the same patient
//! stay consistent with it.

use crate::model::{Address, Encounter, Observation, Order, OrderStatus, Patient, PatientRecord};
use crate::pathway::{Action, ResultStep};
use crate::pools::{DataPools, TestDefinition};
use crate::{ComposeError, ComposeResult};
use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use rand::Rng;
use simhospital_ids::{Mrn, PatientId};
use simhospital_types::Sex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Run-wide counters for visit and order numbers.
#[derive(Debug)]
pub struct Sequences {
    visits: AtomicU64,
    orders: AtomicU64,
}

impl Default for Sequences {
    fn default() -> Self {
        Self {
            visits: AtomicU64::new(1),
            orders: AtomicU64::new(1),
        }
    }
}

impl Sequences {
    pub fn next_visit_number(&self) -> String {
        format!("V{:08}", self.visits.fetch_add(1, Ordering::Relaxed))
    }

    fn next_order_number(&self) -> u64 {
        self.orders.fetch_add(1, Ordering::Relaxed)
    }
}

/// What a step did, as far as message composition is concerned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Admitted,
    Registered,
    Transferred,
    Discharged,
    PersonUpdated { diagnoses: usize, procedures: usize },
    OrderPlaced { key: String },
    Resulted { key: String },
    NoteWritten { note_type: String, text: String },
    Hardcoded { name: String },
    Branch,
}

/// Shared inputs for [`apply`].
#[derive(Clone, Copy)]
pub struct EffectEnv<'a> {
    pub pools: &'a DataPools,
    pub sequences: &'a Sequences,
    pub now: DateTime<Utc>,
}

/// Draws the demographics of a new patient.
///
/// # Errors
///
/// Returns [`ComposeError::EmptyPool`] if a mandatory pool is empty.
pub fn new_patient<R: Rng + ?Sized>(
    mrn: Mrn,
    pools: &DataPools,
    today: NaiveDate,
    rng: &mut R,
) -> ComposeResult<Patient> {
    let sex = *pools.sexes.pick_from("sex", rng)?;
    let female = match sex {
        Sex::Female => true,
        Sex::Male => false,
        Sex::Unknown => rng.gen_bool(0.5),
    };
    let (given_names, prefixes) = if female {
        (&pools.given_names_female, &pools.prefixes_female)
    } else {
        (&pools.given_names_male, &pools.prefixes_male)
    };
    let given_name = given_names.pick_from("given_names", rng)?.clone();
    let family_name = pools.surnames.pick_from("surnames", rng)?.clone();
    let prefix = match sex {
        Sex::Unknown => None,
        _ => prefixes.pick(rng).cloned(),
    };

    let band = *pools.ages.pick_from("ages", rng)?;
    let age = rng.gen_range(band.from..=band.to);
    let birth_date = birth_date_for_age(today, age, rng.gen_range(0..365));

    let address = Address {
        street: format!(
            "{} {}",
            rng.gen_range(1..=200),
            pools.streets.pick_from("address.streets", rng)?
        ),
        city: pools.cities.pick_from("address.cities", rng)?.clone(),
        postcode: pools.postcodes.pick(rng).cloned().unwrap_or_default(),
        country: pools.country.clone(),
    };

    let ethnicity = pools.ethnicities.pick(rng).cloned();
    let mut allergies = Vec::new();
    if !pools.allergies.is_empty() {
        for _ in 0..rng.gen_range(0..=pools.max_allergies) {
            if let Some(allergy) = pools.allergies.pick(rng) {
                if !allergies.contains(allergy) {
                    allergies.push(allergy.clone());
                }
            }
        }
    }

    Ok(Patient {
        id: PatientId::new(),
        mrn,
        prefix,
        given_name,
        family_name,
        birth_date,
        sex,
        address,
        ethnicity,
        allergies,
    })
}

/// A birth date `age` whole years before `today`, moved back by `extra_days` (< 365) so that
/// birthdays spread over the year.
fn birth_date_for_age(today: NaiveDate, age: u32, extra_days: u64) -> NaiveDate {
    let anniversary = today
        .checked_sub_months(Months::new(age.saturating_mul(12)))
        .unwrap_or(NaiveDate::MIN);
    anniversary
        .checked_sub_days(Days::new(extra_days))
        .unwrap_or(anniversary)
}

fn require_open(record: &mut PatientRecord) -> ComposeResult<&mut Encounter> {
    let mrn = record.patient.mrn.to_string();
    record
        .open_encounter_mut()
        .ok_or(ComposeError::NoOpenEncounter { mrn })
}

fn open_encounter<R: Rng + ?Sized>(
    record: &mut PatientRecord,
    env: &EffectEnv<'_>,
    patient_class: String,
    location: Option<&str>,
    with_bed: bool,
    rng: &mut R,
) -> ComposeResult<()> {
    if record.open_encounter().is_some() {
        return Err(ComposeError::EncounterAlreadyOpen {
            mrn: record.patient.mrn.to_string(),
        });
    }
    let bed = if with_bed || location.is_some() {
        Some(env.pools.pick_bed(location, rng)?)
    } else {
        None
    };
    let attending = env.pools.pick_doctor(rng).ok().cloned();
    record.encounters.push(Encounter {
        visit_number: env.sequences.next_visit_number(),
        patient_class,
        location: bed,
        prior_location: None,
        attending,
        admitted_at: env.now,
        discharged_at: None,
        diagnoses: Vec::new(),
        procedures: Vec::new(),
        orders: Vec::new(),
    });
    Ok(())
}

/// Applies `action` to `record`.
///
/// # Errors
///
/// Returns a [`ComposeError`] if the step needs an open encounter and there is none, refers to
/// an unknown location, order profile or order, or draws from an empty pool. On error the
/// record may be partially updated only for steps that add several items (`update_person`).
pub fn apply<R: Rng + ?Sized>(
    action: &Action,
    record: &mut PatientRecord,
    env: &EffectEnv<'_>,
    rng: &mut R,
) -> ComposeResult<Outcome> {
    let now = env.now;
    match action {
        Action::Admission(step) => {
            let class = match &step.patient_class {
                Some(class) => class.clone(),
                None => env
                    .pools
                    .patient_classes
                    .pick(rng)
                    .cloned()
                    .unwrap_or_else(|| "I".into()),
            };
            open_encounter(record, env, class, step.location.as_deref(), true, rng)?;
            Ok(Outcome::Admitted)
        }
        Action::Registration(step) => {
            let class = step.patient_class.clone().unwrap_or_else(|| "O".into());
            open_encounter(record, env, class, None, false, rng)?;
            Ok(Outcome::Registered)
        }
        Action::Transfer(step) => {
            let bed = env.pools.pick_bed(step.location.as_deref(), rng)?;
            let encounter = require_open(record)?;
            encounter.prior_location = encounter.location.replace(bed);
            Ok(Outcome::Transferred)
        }
        Action::Discharge(_) => {
            require_open(record)?.discharged_at = Some(now);
            Ok(Outcome::Discharged)
        }
        Action::UpdatePerson(step) => {
            let encounter = require_open(record)?;
            for _ in 0..step.diagnoses {
                let diagnosis = env.pools.diagnoses.pick_from("diagnoses", rng)?;
                encounter.diagnoses.push((diagnosis.clone(), now));
            }
            for _ in 0..step.procedures {
                let procedure = env.pools.procedures.pick_from("procedures", rng)?;
                encounter.procedures.push((procedure.clone(), now));
            }
            Ok(Outcome::PersonUpdated {
                diagnoses: step.diagnoses,
                procedures: step.procedures,
            })
        }
        Action::Order(step) => {
            let profile = env.pools.order_profile(&step.profile)?;
            let number = env.sequences.next_order_number();
            require_open(record)?.orders.push(Order {
                key: step.key().to_string(),
                profile: step.profile.clone(),
                service: profile.service.clone(),
                placer_number: format!("P{number:08}"),
                filler_number: format!("F{number:08}"),
                ordered_at: now,
                resulted_at: None,
                status: OrderStatus::Pending,
                observations: Vec::new(),
            });
            Ok(Outcome::OrderPlaced {
                key: step.key().to_string(),
            })
        }
        Action::Result(step) => {
            let encounter = require_open(record)?;
            let order = encounter
                .order_mut(&step.order_id)
                .ok_or_else(|| ComposeError::UnknownOrder(step.order_id.clone()))?;
            let profile = env.pools.order_profile(&order.profile)?;
            order.observations = profile
                .tests
                .iter()
                .map(|test| observe(test, step, rng))
                .collect();
            order.status = OrderStatus::Resulted;
            order.resulted_at = Some(now);
            Ok(Outcome::Resulted {
                key: step.order_id.clone(),
            })
        }
        Action::ClinicalNote(step) => {
            require_open(record)?;
            let note_type = match &step.note_type {
                Some(note_type) => note_type.clone(),
                None => env
                    .pools
                    .note_types
                    .pick(rng)
                    .cloned()
                    .unwrap_or_else(|| "Clinical note".into()),
            };
            let text = env.pools.note_texts.pick(rng).cloned().unwrap_or_default();
            Ok(Outcome::NoteWritten { note_type, text })
        }
        Action::HardcodedMessage(step) => Ok(Outcome::Hardcoded {
            name: step.name.clone(),
        }),
        Action::Branch(_) => Ok(Outcome::Branch),
    }
}

/// One observation, explicit from the step or generated around the normal range.
fn observe<R: Rng + ?Sized>(test: &TestDefinition, step: &ResultStep, rng: &mut R) -> Observation {
    let precision = test.decimals as usize;
    let (value, numeric) = match step.values.get(&test.id) {
        Some(explicit) => (explicit.clone(), explicit.trim().parse::<f64>().ok()),
        None => {
            let spread = (test.high - test.low) * 0.25;
            let generated = if spread > 0.0 {
                rng.gen_range((test.low - spread).max(0.0)..=test.high + spread)
            } else {
                test.low
            };
            let text = format!("{generated:.precision$}");
            let rounded = text.parse().unwrap_or(generated);
            (text, Some(rounded))
        }
    };
    let abnormal_flag = match numeric {
        Some(v) if v > test.high => "H",
        Some(v) if v < test.low => "L",
        _ => "",
    };
    Observation {
        test: test.code(),
        value,
        units: test.units.clone(),
        reference_range: test.reference_range(),
        abnormal_flag: abnormal_flag.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pathway::{
        AdmissionStep, ClinicalNoteStep, DischargeStep, OrderStep, RegistrationStep,
        TransferStep, UpdatePersonStep,
    };
    use crate::pools::tests::sample_pools;
    use rand::SeedableRng;
    use chrono::Datelike;
    use rand_chacha::ChaCha8Rng;
    use std::collections::BTreeMap;

    fn setup() -> (DataPools, Sequences, ChaCha8Rng, PatientRecord) {
        let pools = sample_pools();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let today = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let patient = new_patient("000000001".parse().unwrap(), &pools, today, &mut rng)
            .expect("patient should be generated");
        (pools, Sequences::default(), rng, PatientRecord::new(patient))
    }

    #[test]
    fn test_new_patient_draws_from_pools() {
        let (_, _, _, record) = setup();
        let patient = &record.patient;
        let today = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();

        assert!(["Olivia", "Amelia", "Oliver"].contains(&patient.given_name.as_str()));
        assert!(["Smith", "O'Brien"].contains(&patient.family_name.as_str()));
        assert!(patient.address.street.ends_with("High Street"));
        assert_eq!(patient.address.country, "GBR");
        let age = patient.age_on(today);
        assert!((18..=90).contains(&age), "age was {age}");
        assert!(patient.allergies.len() <= 1);
    }

    #[test]
    fn test_birth_date_matches_age() {
        let today = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        for extra in [0, 1, 200, 364] {
            let birth = birth_date_for_age(today, 30, extra);
            let mut years = today.year() - birth.year();
            if (today.month(), today.day()) < (birth.month(), birth.day()) {
                years -= 1;
            }
            assert_eq!(years, 30, "extra days {extra} gave {birth}");
        }
    }

    #[test]
    fn test_admit_transfer_discharge() {
        let (pools, sequences, mut rng, mut record) = setup();
        let env = EffectEnv {
            pools: &pools,
            sequences: &sequences,
            now: Utc::now(),
        };

        let admit = Action::Admission(AdmissionStep {
            location: Some("Ward 1".into()),
            patient_class: None,
        });
        assert_eq!(apply(&admit, &mut record, &env, &mut rng).unwrap(), Outcome::Admitted);
        let encounter = record.open_encounter().unwrap();
        assert_eq!(encounter.patient_class, "I");
        assert_eq!(encounter.location.as_ref().unwrap().point_of_care, "W1");
        assert_eq!(encounter.attending.as_ref().unwrap().surname, "Osman");
        assert_eq!(encounter.visit_number, "V00000001");

        assert!(matches!(
            apply(&admit, &mut record, &env, &mut rng),
            Err(ComposeError::EncounterAlreadyOpen { .. })
        ));

        let transfer = Action::Transfer(TransferStep {
            location: Some("ED".into()),
        });
        apply(&transfer, &mut record, &env, &mut rng).unwrap();
        let encounter = record.open_encounter().unwrap();
        assert_eq!(encounter.location.as_ref().unwrap().point_of_care, "ED");
        assert_eq!(encounter.prior_location.as_ref().unwrap().point_of_care, "W1");

        apply(&Action::Discharge(DischargeStep {}), &mut record, &env, &mut rng).unwrap();
        assert!(record.open_encounter().is_none());
        assert!(record.current_encounter().unwrap().discharged_at.is_some());
    }

    #[test]
    fn test_steps_need_open_encounter() {
        let (pools, sequences, mut rng, mut record) = setup();
        let env = EffectEnv {
            pools: &pools,
            sequences: &sequences,
            now: Utc::now(),
        };

        for action in [
            Action::Discharge(DischargeStep {}),
            Action::ClinicalNote(ClinicalNoteStep::default()),
            Action::UpdatePerson(UpdatePersonStep {
                diagnoses: 1,
                procedures: 0,
            }),
        ] {
            assert!(matches!(
                apply(&action, &mut record, &env, &mut rng),
                Err(ComposeError::NoOpenEncounter { .. })
            ));
        }
    }

    #[test]
    fn test_order_then_result() {
        let (pools, sequences, mut rng, mut record) = setup();
        let env = EffectEnv {
            pools: &pools,
            sequences: &sequences,
            now: Utc::now(),
        };
        apply(
            &Action::Registration(RegistrationStep::default()),
            &mut record,
            &env,
            &mut rng,
        )
        .unwrap();
        assert_eq!(record.open_encounter().unwrap().patient_class, "O");
        assert!(record.open_encounter().unwrap().location.is_none());

        let order = Action::Order(OrderStep {
            profile: "UREA AND ELECTROLYTES".into(),
            id: Some("ue".into()),
        });
        apply(&order, &mut record, &env, &mut rng).unwrap();
        assert!(record.open_encounter().unwrap().has_pending_orders());

        let result = Action::Result(ResultStep {
            order_id: "ue".into(),
            values: BTreeMap::from([("K".to_string(), "6.1".to_string())]),
        });
        apply(&result, &mut record, &env, &mut rng).unwrap();

        let order = record.open_encounter().unwrap().order("ue").unwrap();
        assert_eq!(order.status, OrderStatus::Resulted);
        assert_eq!(order.placer_number, "P00000001");
        assert_eq!(order.observations.len(), 2);
        let potassium = &order.observations[1];
        assert_eq!(potassium.value, "6.1");
        assert_eq!(potassium.abnormal_flag, "H");
        assert_eq!(potassium.reference_range, "3.5-5.3");
        let sodium = &order.observations[0];
        assert!(!sodium.value.contains('.'), "sodium uses 0 decimals: {}", sodium.value);

        let missing = Action::Result(ResultStep {
            order_id: "nope".into(),
            values: BTreeMap::new(),
        });
        assert!(matches!(
            apply(&missing, &mut record, &env, &mut rng),
            Err(ComposeError::UnknownOrder(_))
        ));
    }

    #[test]
    fn test_unknown_profile_is_compose_error() {
        let (pools, sequences, mut rng, mut record) = setup();
        let env = EffectEnv {
            pools: &pools,
            sequences: &sequences,
            now: Utc::now(),
        };
        let order = Action::Order(OrderStep {
            profile: "FULL BLOOD COUNT".into(),
            id: None,
        });

        assert!(matches!(
            apply(&order, &mut record, &env, &mut rng),
            Err(ComposeError::UnknownOrderProfile(_))
        ));
    }
}
