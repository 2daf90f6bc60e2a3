//! Scheduling and supervision of pathway instances.
//!
//! The [`Runner`] owns a `JoinSet` of executor tasks. New instances arrive as a Poisson process
//! at the configured rate, or on demand through a [`RunnerHandle`]. Shutdown stops arrivals,
//! cancels every instance, waits for them (bounded), and only then closes the sink.

use crate::composer::Composer;
use crate::config::SimConfig;
use crate::effects::Sequences;
use crate::executor::{
    AbortReason, InstanceInfo, InstanceRegistry, InstanceReport, InstanceStatus, PathwayExecutor,
    SimContext,
};
use crate::loader::LoadedConfig;
use crate::metrics::SimMetrics;
use crate::pathway::{Pathway, PathwayCatalog, PathwayFilter};
use crate::sender::MessageSink;
use crate::store::PatientStore;
use crate::templates::HardcodedCatalog;
use crate::{ConfigResult, SendError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp};
use serde::Serialize;
use simhospital_ids::{ControlIdGenerator, InstanceId, InstanceIdGenerator};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const COMMAND_CAPACITY: usize = 64;

/// Poisson arrivals: exponential gaps with mean `3600 / rate` seconds.
#[derive(Debug)]
pub struct ArrivalSchedule {
    gaps: Option<Exp<f64>>,
    next_due: Instant,
}

impl ArrivalSchedule {
    /// A rate of zero (or less) never produces an arrival.
    pub fn new<R: Rng + ?Sized>(pathways_per_hour: f64, now: Instant, rng: &mut R) -> Self {
        let gaps = if pathways_per_hour > 0.0 {
            Exp::new(pathways_per_hour / 3600.0).ok()
        } else {
            None
        };
        let mut schedule = Self {
            gaps,
            next_due: now,
        };
        schedule.next_due = now + schedule.gap(rng);
        schedule
    }

    fn gap<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        self.gaps
            .as_ref()
            .map(|exp| Duration::from_secs_f64(exp.sample(rng)))
            .unwrap_or(Duration::MAX)
    }

    /// Number of arrivals due at `now` since the previous call.
    pub fn due<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R) -> usize {
        if self.gaps.is_none() {
            return 0;
        }
        let mut count = 0;
        while self.next_due <= now {
            count += 1;
            self.next_due += self.gap(rng);
        }
        count
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("unknown pathway '{0}'")]
    UnknownPathway(String),
    #[error("the runner is not running")]
    Stopped,
    #[error("sender failed: {0}")]
    Sink(#[source] SendError),
}

/// Totals for a finished run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub started: u64,
    pub completed: u64,
    pub aborted: u64,
}

/// A catalog entry as shown on the dashboard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PathwaySummary {
    pub name: String,
    pub steps: usize,
    pub looping: bool,
    /// Admitted by the include/exclude filters, so it can start automatically.
    pub eligible: bool,
}

enum Command {
    Start {
        name: String,
        reply: oneshot::Sender<Result<InstanceId, RunnerError>>,
    },
    SetPaused {
        paused: bool,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable control surface over a running [`Runner`].
#[derive(Clone)]
pub struct RunnerHandle {
    commands: mpsc::Sender<Command>,
    registry: Arc<InstanceRegistry>,
    metrics: SimMetrics,
    pathways: Arc<Vec<PathwaySummary>>,
    paused: Arc<AtomicBool>,
}

impl RunnerHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RunnerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| RunnerError::Stopped)?;
        response.await.map_err(|_| RunnerError::Stopped)
    }

    /// Starts one instance of any catalog pathway, ignoring the filters.
    pub async fn start_pathway(&self, name: &str) -> Result<InstanceId, RunnerError> {
        let name = name.to_string();
        self.request(|reply| Command::Start { name, reply }).await?
    }

    /// Stops automatic arrivals. Running instances carry on.
    pub async fn pause(&self) -> Result<(), RunnerError> {
        self.request(|reply| Command::SetPaused {
            paused: true,
            reply,
        })
        .await
    }

    pub async fn resume(&self) -> Result<(), RunnerError> {
        self.request(|reply| Command::SetPaused {
            paused: false,
            reply,
        })
        .await
    }

    /// Asks the runner to shut down gracefully. Returns once the request is accepted.
    pub async fn shutdown(&self) -> Result<(), RunnerError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.registry.list()
    }

    pub fn pathways(&self) -> &[PathwaySummary] {
        &self.pathways
    }

    pub fn metrics(&self) -> &SimMetrics {
        &self.metrics
    }
}

pub struct Runner<S> {
    ctx: SimContext<S>,
    catalog: Arc<PathwayCatalog>,
    eligible: Vec<Arc<Pathway>>,
    templates: Arc<HardcodedCatalog>,
    commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
    rng: ChaCha8Rng,
    ids: InstanceIdGenerator,
    tasks: JoinSet<InstanceReport>,
    task_instances: HashMap<tokio::task::Id, InstanceId>,
    report: RunReport,
}

impl<S: MessageSink> Runner<S> {
    /// Wires loaded configuration, settings and a sink into a runner.
    ///
    /// The header from `config` is used for composition, so callers that read a header file
    /// copy it into `config.header` first.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ConfigError::InvalidFilter`] if a pathway filter pattern is invalid.
    pub fn from_loaded(
        config: SimConfig,
        loaded: LoadedConfig,
        sink: S,
        metrics: SimMetrics,
        cancel: CancellationToken,
    ) -> ConfigResult<(Self, RunnerHandle)> {
        let templates = Arc::new(loaded.templates);
        let composer = Composer::new(
            config.header.clone(),
            config.timezone,
            templates.clone(),
            Arc::new(ControlIdGenerator::new()),
        );
        let ctx = SimContext {
            config: Arc::new(config),
            pools: Arc::new(loaded.pools),
            store: Arc::new(PatientStore::new()),
            composer: Arc::new(composer),
            sink: Arc::new(sink),
            sequences: Arc::new(Sequences::default()),
            registry: Arc::new(InstanceRegistry::default()),
            metrics,
        };
        Self::new(ctx, Arc::new(loaded.catalog), templates, cancel)
    }

    /// Builds a runner and its control handle.
    ///
    /// Cancelling `cancel` has the same effect as [`RunnerHandle::shutdown`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::ConfigError::InvalidFilter`] if a pathway filter pattern is invalid.
    pub fn new(
        ctx: SimContext<S>,
        catalog: Arc<PathwayCatalog>,
        templates: Arc<HardcodedCatalog>,
        cancel: CancellationToken,
    ) -> ConfigResult<(Self, RunnerHandle)> {
        let filter = PathwayFilter::new(
            &ctx.config.pathway_names,
            &ctx.config.exclude_pathway_names,
        )?;
        let eligible = catalog.filtered(&filter);
        let pathways = catalog
            .names()
            .into_iter()
            .filter_map(|name| catalog.get(&name))
            .map(|p| PathwaySummary {
                name: p.name().to_string(),
                steps: p.steps().len(),
                looping: p.is_looping(),
                eligible: filter.allows(p.name()),
            })
            .collect();
        let rng = match ctx.config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let paused = Arc::new(AtomicBool::new(false));
        let handle = RunnerHandle {
            commands: tx,
            registry: ctx.registry.clone(),
            metrics: ctx.metrics.clone(),
            pathways: Arc::new(pathways),
            paused: paused.clone(),
        };
        let runner = Self {
            ctx,
            catalog,
            eligible,
            templates,
            commands: rx,
            cancel,
            paused,
            rng,
            ids: InstanceIdGenerator::default(),
            tasks: JoinSet::new(),
            task_instances: HashMap::new(),
            report: RunReport::default(),
        };
        Ok((runner, handle))
    }

    /// Runs until shutdown is requested or the sink fails fatally.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Sink`] if an instance reported a fatal sink error.
    pub async fn run(mut self) -> Result<RunReport, RunnerError> {
        let config = self.ctx.config.clone();
        info!(
            pathways_per_hour = config.pathways_per_hour,
            eligible = self.eligible.len(),
            "runner started"
        );
        if self.eligible.is_empty() && config.pathways_per_hour > 0.0 {
            warn!("no pathway passes the filters; only on-demand starts will run");
        }

        let mut schedule =
            ArrivalSchedule::new(config.pathways_per_hour, Instant::now(), &mut self.rng);
        let mut ticker = tokio::time::interval(config.sleep_for);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;
        let mut fatal = None;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    if let Some(err) = self.record(joined) {
                        error!(error = %err, "sender failed, stopping the run");
                        fatal = Some(err);
                        break;
                    }
                }
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.handle(command),
                    None => commands_open = false,
                },
                _ = ticker.tick() => {
                    let due = schedule.due(Instant::now(), &mut self.rng);
                    if self.paused.load(Ordering::Relaxed) {
                        if due > 0 {
                            debug!(skipped = due, "arrivals skipped while paused");
                        }
                    } else {
                        for _ in 0..due {
                            self.start_random();
                        }
                    }
                }
            }
        }

        self.shutdown().await;
        match fatal {
            Some(err) => Err(RunnerError::Sink(err)),
            None => Ok(self.report),
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start { name, reply } => {
                let result = match self.catalog.get(&name) {
                    Some(pathway) => Ok(self.spawn(pathway)),
                    None => Err(RunnerError::UnknownPathway(name)),
                };
                let _ = reply.send(result);
            }
            Command::SetPaused { paused, reply } => {
                self.paused.store(paused, Ordering::Relaxed);
                info!(paused, "automatic arrivals toggled");
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                info!("shutdown requested");
                self.cancel.cancel();
                let _ = reply.send(());
            }
        }
    }

    fn start_random(&mut self) {
        if self.eligible.is_empty() {
            return;
        }
        let index = self.rng.gen_range(0..self.eligible.len());
        let pathway = self.eligible[index].clone();
        self.spawn(pathway);
    }

    /// Spawns an executor, substituting a whole-pathway hardcoded message if one matches.
    fn spawn(&mut self, pathway: Arc<Pathway>) -> InstanceId {
        let pathway = match self.templates.pathway_override(pathway.name()) {
            Some(template) => {
                debug!(pathway = pathway.name(), template = template.name(), "pathway overridden");
                Arc::new(Pathway::hardcoded(pathway.name(), template.name()))
            }
            None => pathway,
        };
        let id = self.ids.next_id();
        self.ctx
            .registry
            .insert(InstanceInfo::scheduled(id, pathway.name()));
        self.ctx.metrics.pathways_started.inc();
        self.report.started += 1;

        let rng = ChaCha8Rng::seed_from_u64(self.rng.gen());
        let executor = PathwayExecutor::new(
            self.ctx.clone(),
            pathway,
            id,
            self.cancel.child_token(),
            rng,
        );
        let task = self.tasks.spawn(executor.run());
        self.task_instances.insert(task.id(), id);
        id
    }

    /// Books a finished task. Returns the sink error if it was fatal.
    fn record(
        &mut self,
        joined: Result<(tokio::task::Id, InstanceReport), JoinError>,
    ) -> Option<SendError> {
        match joined {
            Ok((task, report)) => {
                self.task_instances.remove(&task);
                match report.status() {
                    InstanceStatus::Completed => self.report.completed += 1,
                    _ => self.report.aborted += 1,
                }
                match report.result {
                    Err(AbortReason::Send(err)) if err.is_fatal() => Some(err),
                    _ => None,
                }
            }
            Err(err) => {
                self.report.aborted += 1;
                if let Some(id) = self.task_instances.remove(&err.id()) {
                    let reason = if err.is_cancelled() {
                        "aborted at shutdown".to_string()
                    } else {
                        format!("executor task failed: {err}")
                    };
                    warn!(instance = %id, %reason, "pathway task ended without a report");
                    let was_running = self
                        .ctx
                        .registry
                        .get(id)
                        .is_some_and(|info| info.status == InstanceStatus::Running);
                    self.ctx
                        .registry
                        .finish(id, InstanceStatus::Aborted, Some(reason));
                    if was_running {
                        self.ctx.metrics.pathways_running.dec();
                    }
                    self.ctx.metrics.pathways_aborted.inc();
                }
                None
            }
        }
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        let remaining = self.tasks.len();
        info!(remaining, "stopping pathway instances");

        let deadline = self.ctx.config.shutdown_timeout;
        let drained = timeout(deadline, async {
            while let Some(joined) = self.tasks.join_next_with_id().await {
                self.record(joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = self.tasks.len(),
                timeout = ?deadline,
                "shutdown timeout reached, aborting remaining instances"
            );
            self.tasks.abort_all();
            while let Some(joined) = self.tasks.join_next_with_id().await {
                self.record(joined);
            }
        }

        match timeout(deadline, self.ctx.sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "failed to close sender"),
            Err(_) => error!(timeout = ?deadline, "sender did not close in time"),
        }
        info!(
            started = self.report.started,
            completed = self.report.completed,
            aborted = self.report.aborted,
            "runner stopped"
        );
    }
}
