//! Runs one pathway instance from start to end.
//!
//! An instance moves `Scheduled -> Running -> {Completed, Aborted}`. Each step waits for its
//! delay, mutates the bound patient under the patient's lock, composes messages from a
//! snapshot taken under the same lock, and sends them in order before the cursor moves on.
//! Any error aborts only the instance it happened in.

use crate::composer::{Composer, StepContext};
use crate::config::SimConfig;
use crate::effects::{self, EffectEnv, Sequences};
use crate::metrics::SimMetrics;
use crate::pathway::{Action, DelayBasis, PatientBinding, Pathway};
use crate::pools::DataPools;
use crate::sender::MessageSink;
use crate::store::{PatientStore, SharedRecord};
use crate::{ComposeError, SendError};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use simhospital_ids::{InstanceId, Mrn};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info, info_span, warn, Instrument};

/// Finished instances kept for the dashboard before the oldest are forgotten.
pub const MAX_FINISHED_INSTANCES: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Scheduled,
    Running,
    Completed,
    Aborted,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Aborted)
    }
}

/// Read-only view of an instance, published in the [`InstanceRegistry`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub pathway: String,
    pub status: InstanceStatus,
    /// Index of the step being executed, or last executed.
    pub step: usize,
    pub mrn: Option<Mrn>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub messages_sent: usize,
    pub error: Option<String>,
}

impl InstanceInfo {
    pub fn scheduled(id: InstanceId, pathway: &str) -> Self {
        Self {
            id,
            pathway: pathway.to_string(),
            status: InstanceStatus::Scheduled,
            step: 0,
            mrn: None,
            started_at: Utc::now(),
            finished_at: None,
            messages_sent: 0,
            error: None,
        }
    }
}

/// Every live instance plus the most recently finished ones.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: RwLock<BTreeMap<InstanceId, InstanceInfo>>,
    finished: parking_lot::Mutex<VecDeque<InstanceId>>,
}

impl InstanceRegistry {
    pub fn insert(&self, info: InstanceInfo) {
        self.instances.write().insert(info.id, info);
    }

    pub fn get(&self, id: InstanceId) -> Option<InstanceInfo> {
        self.instances.read().get(&id).cloned()
    }

    fn update(&self, id: InstanceId, change: impl FnOnce(&mut InstanceInfo)) {
        if let Some(info) = self.instances.write().get_mut(&id) {
            change(info);
        }
    }

    /// Records a terminal status and forgets the oldest finished instances past the limit.
    pub fn finish(&self, id: InstanceId, status: InstanceStatus, error: Option<String>) {
        self.update(id, |info| {
            info.status = status;
            info.finished_at = Some(Utc::now());
            info.error = error;
        });
        let evicted: Vec<InstanceId> = {
            let mut finished = self.finished.lock();
            finished.push_back(id);
            let excess = finished.len().saturating_sub(MAX_FINISHED_INSTANCES);
            finished.drain(..excess).collect()
        };
        if !evicted.is_empty() {
            let mut instances = self.instances.write();
            for id in evicted {
                instances.remove(&id);
            }
        }
    }

    /// Snapshot ordered by instance id.
    pub fn list(&self) -> Vec<InstanceInfo> {
        self.instances.read().values().cloned().collect()
    }

    pub fn running(&self) -> usize {
        self.instances
            .read()
            .values()
            .filter(|i| i.status == InstanceStatus::Running)
            .count()
    }
}

/// Shared services every executor needs.
pub struct SimContext<S> {
    pub config: Arc<SimConfig>,
    pub pools: Arc<DataPools>,
    pub store: Arc<PatientStore>,
    pub composer: Arc<Composer>,
    pub sink: Arc<S>,
    pub sequences: Arc<Sequences>,
    pub registry: Arc<InstanceRegistry>,
    pub metrics: SimMetrics,
}

// Manual impl: `S` itself does not need to be `Clone`.
impl<S> Clone for SimContext<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            pools: self.pools.clone(),
            store: self.store.clone(),
            composer: self.composer.clone(),
            sink: self.sink.clone(),
            sequences: self.sequences.clone(),
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AbortReason {
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("step limit of {0} reached")]
    StepLimit(usize),
    #[error("cancelled")]
    Cancelled,
}

/// What an executor hands back to the runner when its task ends.
#[derive(Debug)]
pub struct InstanceReport {
    pub id: InstanceId,
    pub pathway: String,
    pub steps: usize,
    pub messages: usize,
    pub result: Result<(), AbortReason>,
}

impl InstanceReport {
    pub fn status(&self) -> InstanceStatus {
        if self.result.is_ok() {
            InstanceStatus::Completed
        } else {
            InstanceStatus::Aborted
        }
    }

    /// True if the sink can no longer deliver anything.
    pub fn is_fatal(&self) -> bool {
        matches!(&self.result, Err(AbortReason::Send(err)) if err.is_fatal())
    }
}

pub struct PathwayExecutor<S> {
    ctx: SimContext<S>,
    pathway: Arc<Pathway>,
    id: InstanceId,
    cancel: CancellationToken,
    rng: ChaCha8Rng,
    steps: usize,
    messages: usize,
}

impl<S: MessageSink> PathwayExecutor<S> {
    pub fn new(
        ctx: SimContext<S>,
        pathway: Arc<Pathway>,
        id: InstanceId,
        cancel: CancellationToken,
        rng: ChaCha8Rng,
    ) -> Self {
        Self {
            ctx,
            pathway,
            id,
            cancel,
            rng,
            steps: 0,
            messages: 0,
        }
    }

    /// Drives the instance to a terminal state and records it.
    pub async fn run(mut self) -> InstanceReport {
        let span = info_span!(
            "pathway",
            instance = %self.id,
            pathway = %self.pathway.name(),
            mrn = field::Empty,
        );
        async move {
            let ctx = self.ctx.clone();
            ctx.registry.update(self.id, |info| info.status = InstanceStatus::Running);
            ctx.metrics.pathways_running.inc();
            debug!("pathway started");

            let mut mrn = None;
            let result = self.execute(&mut mrn).await;

            let status = if result.is_ok() {
                InstanceStatus::Completed
            } else {
                InstanceStatus::Aborted
            };
            match &result {
                Ok(()) => info!(steps = self.steps, messages = self.messages, "pathway completed"),
                Err(AbortReason::Cancelled) => info!(steps = self.steps, "pathway cancelled"),
                Err(err) => warn!(steps = self.steps, error = %err, "pathway aborted"),
            }
            ctx.registry.finish(
                self.id,
                status,
                result.as_ref().err().map(ToString::to_string),
            );

            // The terminal status is visible before the patient goes away.
            if let Some(mrn) = mrn {
                if ctx.config.delete_patients_from_memory {
                    ctx.store.remove(&mrn);
                    debug!(%mrn, "patient evicted");
                } else {
                    ctx.store.release(&mrn);
                }
            }
            ctx.metrics.patients.set(i64::try_from(ctx.store.len()).unwrap_or(i64::MAX));
            ctx.metrics.pathways_running.dec();
            match status {
                InstanceStatus::Completed => ctx.metrics.pathways_completed.inc(),
                _ => ctx.metrics.pathways_aborted.inc(),
            }

            InstanceReport {
                id: self.id,
                pathway: self.pathway.name().to_string(),
                steps: self.steps,
                messages: self.messages,
                result,
            }
        }
        .instrument(span)
        .await
    }

    fn today(&self) -> NaiveDate {
        self.ctx.config.timezone.local(Utc::now()).date()
    }

    fn bind_patient(&mut self) -> Result<(Mrn, SharedRecord), ComposeError> {
        if self.pathway.patient() == PatientBinding::Existing {
            if let Some(claimed) = self.ctx.store.claim_existing(&mut self.rng) {
                return Ok(claimed);
            }
        }
        let today = self.today();
        let pools = &self.ctx.pools;
        let rng = &mut self.rng;
        self.ctx
            .store
            .create(|mrn| effects::new_patient(mrn, pools, today, rng))
    }

    async fn execute(&mut self, bound: &mut Option<Mrn>) -> Result<(), AbortReason> {
        if self.cancel.is_cancelled() {
            return Err(AbortReason::Cancelled);
        }
        let (mrn, record) = self.bind_patient()?;
        tracing::Span::current().record("mrn", field::display(&mrn));
        *bound = Some(mrn.clone());
        self.ctx
            .metrics
            .patients
            .set(i64::try_from(self.ctx.store.len()).unwrap_or(i64::MAX));
        self.ctx
            .registry
            .update(self.id, |info| info.mrn = Some(mrn.clone()));

        let pathway = self.pathway.clone();
        let steps = pathway.steps();
        let started = Instant::now();
        let mut previous_done = started;
        let mut cursor = 0;

        while let Some(step) = steps.get(cursor) {
            if self.steps >= self.ctx.config.max_loop_steps {
                return Err(AbortReason::StepLimit(self.ctx.config.max_loop_steps));
            }
            self.steps += 1;
            self.ctx.registry.update(self.id, |info| info.step = cursor);

            if let Some(delay) = &step.delay {
                let base = match step.basis {
                    DelayBasis::Previous => previous_done,
                    DelayBasis::Start => started,
                };
                let deadline = base + delay.sample(&mut self.rng);
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(AbortReason::Cancelled),
                    _ = sleep_until(deadline) => {}
                }
            }
            if self.cancel.is_cancelled() {
                return Err(AbortReason::Cancelled);
            }

            let now = Utc::now();
            let today = self.today();
            let (outcome, branch_target, snapshot) = {
                let mut record = record.lock().await;
                let env = EffectEnv {
                    pools: &self.ctx.pools,
                    sequences: &self.ctx.sequences,
                    now,
                };
                let outcome = effects::apply(&step.action, &mut record, &env, &mut self.rng)?;
                let branch_target = match &step.action {
                    Action::Branch(branch) => branch
                        .choose(&record, today, &mut self.rng)
                        .map(str::to_string),
                    _ => None,
                };
                (outcome, branch_target, record.clone())
            };

            let messages = self.ctx.composer.compose(&StepContext {
                pathway: pathway.name(),
                instance: self.id,
                step_index: cursor,
                step,
                outcome: &outcome,
                record: &snapshot,
                now,
            })?;

            for message in &messages {
                let sent = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(AbortReason::Cancelled),
                    sent = self.ctx.sink.send(message) => sent,
                };
                if let Err(err) = sent {
                    self.ctx.metrics.messages_failed.inc();
                    return Err(err.into());
                }
                self.messages += 1;
                self.ctx.metrics.messages_sent.inc();
                self.ctx
                    .registry
                    .update(self.id, |info| info.messages_sent += 1);
                debug!(
                    step = step.label(),
                    control_id = %message.control_id,
                    message_type = %message.message_type,
                    "message sent"
                );
            }

            previous_done = Instant::now();
            cursor = pathway.next_index(cursor, branch_target.as_deref());
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::composer::OutboundMessage;
    use crate::pathway::PathwayDefinition;
    use crate::pools::tests::sample_pools;
    use crate::templates::HardcodedCatalog;
    use crate::SendResult;
    use hl7::HeaderConfig;
    use rand::SeedableRng;
    use simhospital_ids::{ControlIdGenerator, InstanceIdGenerator};
    use std::time::Duration;

    /// Records what it is sent, with the (possibly paused) tokio clock reading.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) sent: parking_lot::Mutex<Vec<(Instant, OutboundMessage)>>,
        pub(crate) fail_with_unavailable: bool,
        pub(crate) closed: std::sync::atomic::AtomicBool,
    }

    impl RecordingSink {
        pub(crate) fn types(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .map(|(_, m)| m.message_type.clone())
                .collect()
        }
    }

    impl MessageSink for RecordingSink {
        async fn send(&self, message: &OutboundMessage) -> SendResult<()> {
            if self.fail_with_unavailable {
                return Err(SendError::Unavailable {
                    destination: "test".into(),
                    failures: 1,
                });
            }
            self.sent.lock().push((Instant::now(), message.clone()));
            Ok(())
        }

        async fn close(&self) -> SendResult<()> {
            self.closed
                .store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn context<S>(sink: S, config: SimConfig) -> SimContext<S> {
        let pools = Arc::new(sample_pools());
        SimContext {
            composer: Arc::new(Composer::new(
                HeaderConfig::default(),
                config.timezone,
                Arc::new(HardcodedCatalog::default()),
                Arc::new(ControlIdGenerator::starting_at(1)),
            )),
            config: Arc::new(config),
            pools,
            store: Arc::new(PatientStore::new()),
            sink: Arc::new(sink),
            sequences: Arc::new(Sequences::default()),
            registry: Arc::new(InstanceRegistry::default()),
            metrics: SimMetrics::new().unwrap(),
        }
    }

    pub(crate) fn pathway(name: &str, yaml: &str) -> Arc<Pathway> {
        let definition: PathwayDefinition =
            serde_yaml::from_str(yaml).expect("pathway YAML should parse");
        Arc::new(Pathway::new(name, definition).expect("pathway should be valid"))
    }

    async fn run(
        ctx: &SimContext<RecordingSink>,
        pathway: Arc<Pathway>,
        cancel: CancellationToken,
    ) -> InstanceReport {
        let id = InstanceIdGenerator::default().next_id();
        ctx.registry.insert(InstanceInfo::scheduled(id, pathway.name()));
        PathwayExecutor::new(ctx.clone(), pathway, id, cancel, ChaCha8Rng::seed_from_u64(1))
            .run()
            .await
    }

    const ADMIT_DISCHARGE: &str = r#"
steps:
  - admission: { location: Ward 1 }
  - delay: 10s
    discharge: {}
"#;

    #[tokio::test(start_paused = true)]
    async fn test_admit_discharge_sends_two_messages_ten_seconds_apart() {
        let ctx = context(RecordingSink::default(), SimConfig::default());

        let report = run(&ctx, pathway("ad", ADMIT_DISCHARGE), CancellationToken::new()).await;

        assert!(report.result.is_ok(), "{:?}", report.result);
        let sent = ctx.sink.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1.message_type, "ADT^A01");
        assert_eq!(sent[1].1.message_type, "ADT^A03");
        assert_eq!(sent[1].0 - sent[0].0, Duration::from_secs(10));
        assert_eq!(
            ctx.registry.get(report.id).unwrap().status,
            InstanceStatus::Completed
        );
        assert_eq!(ctx.store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_ids_follow_send_order_within_an_instance() {
        let ctx = context(RecordingSink::default(), SimConfig::default());
        let first = pathway("first", ADMIT_DISCHARGE);
        let second = pathway("second", ADMIT_DISCHARGE);

        let (a, b) = tokio::join!(
            run(&ctx, first, CancellationToken::new()),
            run(&ctx, second, CancellationToken::new())
        );
        assert!(a.result.is_ok() && b.result.is_ok());

        let sent = ctx.sink.sent.lock();
        assert_eq!(sent.len(), 4);
        let mut seen = std::collections::HashSet::new();
        for name in ["first", "second"] {
            let ids: Vec<u64> = sent
                .iter()
                .filter(|(_, m)| m.pathway == name)
                .map(|(_, m)| m.control_id.as_str().parse().unwrap())
                .collect();
            assert_eq!(ids.len(), 2);
            assert!(ids[0] < ids[1], "{name}: {ids:?}");
            seen.extend(ids);
        }
        assert_eq!(seen.len(), 4, "control ids are unique across instances");
    }

    #[tokio::test(start_paused = true)]
    async fn test_branch_and_goto_define_message_order() {
        let yaml = r#"
steps:
  - admission: {}
  - branch:
      conditions:
        - when: { has_open_encounter: true }
          goto: note
      otherwise: end
  - id: skipped
    transfer: {}
  - id: note
    clinical_note: {}
    goto: leave
  - update_person: {}
  - id: leave
    discharge: {}
"#;
        let ctx = context(RecordingSink::default(), SimConfig::default());

        let report = run(&ctx, pathway("branchy", yaml), CancellationToken::new()).await;

        assert!(report.result.is_ok());
        assert_eq!(ctx.sink.types(), ["ADT^A01", "MDM^T02", "ADT^A03"]);
        assert_eq!(report.steps, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_basis_measures_from_pathway_start() {
        let yaml = r#"
steps:
  - delay: 5s
    admission: {}
  - delay: 8s
    basis: start
    discharge: {}
"#;
        let ctx = context(RecordingSink::default(), SimConfig::default());
        let begin = Instant::now();

        run(&ctx, pathway("timed", yaml), CancellationToken::new()).await;

        let sent = ctx.sink.sent.lock();
        assert_eq!(sent[0].0 - begin, Duration::from_secs(5));
        assert_eq!(sent[1].0 - begin, Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compose_error_aborts_and_evicts_after_status() {
        let yaml = r#"
steps:
  - discharge: {}
"#;
        let config = SimConfig {
            delete_patients_from_memory: true,
            ..SimConfig::default()
        };
        let ctx = context(RecordingSink::default(), config);

        let report = run(&ctx, pathway("bad", yaml), CancellationToken::new()).await;

        assert!(matches!(
            report.result,
            Err(AbortReason::Compose(ComposeError::NoOpenEncounter { .. }))
        ));
        let info = ctx.registry.get(report.id).unwrap();
        assert_eq!(info.status, InstanceStatus::Aborted);
        assert!(info.error.unwrap().contains("no open encounter"));
        assert!(ctx.store.is_empty());
        assert_eq!(ctx.metrics.pathways_aborted.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_looping_pathway_hits_step_limit() {
        let yaml = r#"
loop: true
steps:
  - id: tick
    delay: 1m
    branch:
      conditions: []
      otherwise: tick
"#;
        let config = SimConfig {
            max_loop_steps: 5,
            ..SimConfig::default()
        };
        let ctx = context(RecordingSink::default(), config);

        let report = run(&ctx, pathway("forever", yaml), CancellationToken::new()).await;

        assert!(matches!(report.result, Err(AbortReason::StepLimit(5))));
        assert_eq!(report.steps, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_delay() {
        let ctx = context(RecordingSink::default(), SimConfig::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let report = run(&ctx, pathway("ad", ADMIT_DISCHARGE), cancel).await;

        assert!(matches!(report.result, Err(AbortReason::Cancelled)));
        assert_eq!(ctx.sink.types(), ["ADT^A01"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_binding_reuses_released_patient() {
        let yaml = r#"
patient: existing
steps:
  - registration: {}
"#;
        let ctx = context(RecordingSink::default(), SimConfig::default());

        run(&ctx, pathway("first", ADMIT_DISCHARGE), CancellationToken::new()).await;
        let report = run(&ctx, pathway("again", yaml), CancellationToken::new()).await;

        assert!(report.result.is_ok());
        assert_eq!(ctx.store.len(), 1);
        let sent = ctx.sink.sent.lock();
        let mrn_of = |payload: &str| {
            hl7::Message::parse(payload)
                .unwrap()
                .segment("PID")
                .and_then(|pid| pid.field(3))
                .map(str::to_string)
        };
        assert_eq!(mrn_of(&sent[0].1.payload), mrn_of(&sent[2].1.payload));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_send_error_is_reported() {
        let sink = RecordingSink {
            fail_with_unavailable: true,
            ..RecordingSink::default()
        };
        let ctx = context(sink, SimConfig::default());

        let report = run(&ctx, pathway("ad", ADMIT_DISCHARGE), CancellationToken::new()).await;

        assert!(report.is_fatal());
        assert_eq!(ctx.metrics.messages_failed.get(), 1);
    }
}
