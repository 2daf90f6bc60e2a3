//! In-memory patient repository.
//!
//! The outer map sits behind a short `parking_lot` lock that is never held across an
//! `.await`. Each record has its own `tokio::sync::Mutex`, so steps for one patient are
//! serialised while different patients never contend.

use crate::model::{Patient, PatientRecord};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use simhospital_ids::{Mrn, MrnAllocator};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub type SharedRecord = Arc<tokio::sync::Mutex<PatientRecord>>;

#[derive(Debug, Default)]
pub struct PatientStore {
    records: RwLock<HashMap<Mrn, SharedRecord>>,
    claimed: Mutex<HashSet<Mrn>>,
    mrns: MrnAllocator,
}

impl PatientStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an MRN, builds the patient and stores it already claimed by the caller.
    ///
    /// If `build` fails nothing is stored; the allocated MRN is not reused.
    pub fn create<E>(
        &self,
        build: impl FnOnce(Mrn) -> Result<Patient, E>,
    ) -> Result<(Mrn, SharedRecord), E> {
        let mrn = self.mrns.allocate();
        let patient = build(mrn.clone())?;
        let record = Arc::new(tokio::sync::Mutex::new(PatientRecord::new(patient)));
        self.records.write().insert(mrn.clone(), record.clone());
        self.claimed.lock().insert(mrn.clone());
        Ok((mrn, record))
    }

    pub fn get(&self, mrn: &Mrn) -> Option<SharedRecord> {
        self.records.read().get(mrn).cloned()
    }

    /// A copy of the record taken under its lock.
    pub async fn snapshot(&self, mrn: &Mrn) -> Option<PatientRecord> {
        let record = self.get(mrn)?;
        let guard = record.lock().await;
        Some(guard.clone())
    }

    /// Evicts a patient. Returns false if it was not stored.
    pub fn remove(&self, mrn: &Mrn) -> bool {
        let removed = self.records.write().remove(mrn).is_some();
        self.claimed.lock().remove(mrn);
        removed
    }

    /// Claims a random stored patient that no running instance is bound to.
    pub fn claim_existing<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<(Mrn, SharedRecord)> {
        let records = self.records.read();
        let mut claimed = self.claimed.lock();

        let mut free: Vec<&Mrn> = records.keys().filter(|m| !claimed.contains(*m)).collect();
        if free.is_empty() {
            return None;
        }
        free.sort();
        let mrn = free[rng.gen_range(0..free.len())].clone();
        let record = records.get(&mrn)?.clone();
        claimed.insert(mrn.clone());
        Some((mrn, record))
    }

    /// Releases a claim so that later `existing` pathways can pick the patient.
    pub fn release(&self, mrn: &Mrn) {
        self.claimed.lock().remove(mrn);
    }

    pub fn is_claimed(&self, mrn: &Mrn) -> bool {
        self.claimed.lock().contains(mrn)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Stored MRNs in ascending order.
    pub fn mrns(&self) -> Vec<Mrn> {
        let mut mrns: Vec<Mrn> = self.records.read().keys().cloned().collect();
        mrns.sort();
        mrns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Address;
    use chrono::NaiveDate;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use simhospital_ids::PatientId;
    use simhospital_types::Sex;
    use std::convert::Infallible;

    fn build(mrn: Mrn) -> Result<Patient, Infallible> {
        Ok(Patient {
            id: PatientId::new(),
            mrn,
            prefix: None,
            given_name: "Grace".into(),
            family_name: "Hopper".into(),
            birth_date: NaiveDate::from_ymd_opt(1950, 12, 9).unwrap(),
            sex: Sex::Female,
            address: Address::default(),
            ethnicity: None,
            allergies: Vec::new(),
        })
    }

    #[tokio::test]
    async fn test_create_and_snapshot() {
        let store = PatientStore::new();
        let (mrn, record) = store.create(build).unwrap();

        record.lock().await.patient.given_name = "Anita".into();
        let snapshot = store.snapshot(&mrn).await.expect("patient should exist");

        assert_eq!(snapshot.patient.mrn, mrn);
        assert_eq!(snapshot.patient.given_name, "Anita");
        assert_eq!(store.len(), 1);
        assert!(store.is_claimed(&mrn));
    }

    #[test]
    fn test_claim_existing_skips_claimed_patients() {
        let store = PatientStore::new();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let (first, _) = store.create(build).unwrap();
        let (second, _) = store.create(build).unwrap();

        assert!(store.claim_existing(&mut rng).is_none());

        store.release(&second);
        let (claimed, _) = store.claim_existing(&mut rng).expect("one patient is free");
        assert_eq!(claimed, second);
        assert!(store.claim_existing(&mut rng).is_none());

        store.release(&first);
        store.release(&second);
        assert!(store.claim_existing(&mut rng).is_some());
    }

    #[test]
    fn test_remove_drops_record_and_claim() {
        let store = PatientStore::new();
        let (mrn, _) = store.create(build).unwrap();

        assert!(store.remove(&mrn));
        assert!(!store.remove(&mrn));
        assert!(store.get(&mrn).is_none());
        assert!(!store.is_claimed(&mrn));
        assert!(store.is_empty());
    }

    #[test]
    fn test_mrns_are_sorted() {
        let store = PatientStore::new();
        for _ in 0..3 {
            store.create(build).unwrap();
        }
        let mrns: Vec<String> = store.mrns().iter().map(|m| m.to_string()).collect();
        assert_eq!(mrns, vec!["000000001", "000000002", "000000003"]);
    }
}
