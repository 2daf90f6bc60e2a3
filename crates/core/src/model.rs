//! Simulated patient state.

use crate::pools::{Bed, Doctor};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use simhospital_ids::{Mrn, PatientId};
use simhospital_types::{CodedValue, Sex};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub postcode: String,
    pub country: String,
}

/// Demographics drawn once when the patient is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Patient {
    pub id: PatientId,
    pub mrn: Mrn,
    pub prefix: Option<String>,
    pub given_name: String,
    pub family_name: String,
    pub birth_date: NaiveDate,
    pub sex: Sex,
    pub address: Address,
    pub ethnicity: Option<CodedValue>,
    pub allergies: Vec<CodedValue>,
}

impl Patient {
    /// Age in completed years on `today`.
    pub fn age_on(&self, today: NaiveDate) -> u32 {
        let mut years = today.year() - self.birth_date.year();
        if (today.month(), today.day()) < (self.birth_date.month(), self.birth_date.day()) {
            years -= 1;
        }
        u32::try_from(years).unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Resulted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    pub test: CodedValue,
    pub value: String,
    pub units: String,
    pub reference_range: String,
    /// `H`, `L` or empty.
    pub abnormal_flag: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Order {
    /// Key used by later `result` steps of the same pathway.
    pub key: String,
    pub profile: String,
    pub service: CodedValue,
    pub placer_number: String,
    pub filler_number: String,
    pub ordered_at: DateTime<Utc>,
    pub resulted_at: Option<DateTime<Utc>>,
    pub status: OrderStatus,
    pub observations: Vec<Observation>,
}

/// One visit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Encounter {
    pub visit_number: String,
    pub patient_class: String,
    pub location: Option<Bed>,
    pub prior_location: Option<Bed>,
    pub attending: Option<Doctor>,
    pub admitted_at: DateTime<Utc>,
    pub discharged_at: Option<DateTime<Utc>>,
    pub diagnoses: Vec<(CodedValue, DateTime<Utc>)>,
    pub procedures: Vec<(CodedValue, DateTime<Utc>)>,
    pub orders: Vec<Order>,
}

impl Encounter {
    pub fn is_open(&self) -> bool {
        self.discharged_at.is_none()
    }

    /// The most recent order placed under `key`.
    pub fn order(&self, key: &str) -> Option<&Order> {
        self.orders.iter().rev().find(|o| o.key == key)
    }

    pub fn order_mut(&mut self, key: &str) -> Option<&mut Order> {
        self.orders.iter_mut().rev().find(|o| o.key == key)
    }

    pub fn has_pending_orders(&self) -> bool {
        self.orders.iter().any(|o| o.status == OrderStatus::Pending)
    }
}

/// A patient together with every encounter opened during the run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatientRecord {
    pub patient: Patient,
    pub encounters: Vec<Encounter>,
}

impl PatientRecord {
    pub fn new(patient: Patient) -> Self {
        Self {
            patient,
            encounters: Vec::new(),
        }
    }

    pub fn open_encounter(&self) -> Option<&Encounter> {
        self.encounters.last().filter(|e| e.is_open())
    }

    pub fn open_encounter_mut(&mut self) -> Option<&mut Encounter> {
        self.encounters.last_mut().filter(|e| e.is_open())
    }

    /// The encounter messages should describe: the open one, else the last closed one.
    pub fn current_encounter(&self) -> Option<&Encounter> {
        self.encounters.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patient(birth_date: NaiveDate) -> Patient {
        Patient {
            id: PatientId::new(),
            mrn: "000000001".parse().unwrap(),
            prefix: None,
            given_name: "Ada".into(),
            family_name: "Lovelace".into(),
            birth_date,
            sex: Sex::Female,
            address: Address::default(),
            ethnicity: None,
            allergies: Vec::new(),
        }
    }

    #[test]
    fn test_age_counts_completed_years() {
        let p = patient(NaiveDate::from_ymd_opt(1980, 6, 15).unwrap());

        assert_eq!(p.age_on(NaiveDate::from_ymd_opt(2020, 6, 14).unwrap()), 39);
        assert_eq!(p.age_on(NaiveDate::from_ymd_opt(2020, 6, 15).unwrap()), 40);
    }

    #[test]
    fn test_open_encounter_is_last_undischarged() {
        let mut record = PatientRecord::new(patient(NaiveDate::from_ymd_opt(1990, 1, 1).unwrap()));
        assert!(record.open_encounter().is_none());

        let now = Utc::now();
        record.encounters.push(Encounter {
            visit_number: "V1".into(),
            patient_class: "I".into(),
            location: None,
            prior_location: None,
            attending: None,
            admitted_at: now,
            discharged_at: Some(now),
            diagnoses: Vec::new(),
            procedures: Vec::new(),
            orders: Vec::new(),
        });
        assert!(record.open_encounter().is_none());
        assert_eq!(record.current_encounter().map(|e| e.visit_number.as_str()), Some("V1"));

        let mut reopened = record.encounters[0].clone();
        reopened.visit_number = "V2".into();
        reopened.discharged_at = None;
        record.encounters.push(reopened);
        assert_eq!(record.open_encounter().map(|e| e.visit_number.as_str()), Some("V2"));
    }
}
