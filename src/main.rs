use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use simhospital_core::config::{MllpConfig, OutputConfig, RetryPolicy, SimConfig};
use simhospital_core::loader::{ConfigPaths, load_all};
use simhospital_core::metrics::SimMetrics;
use simhospital_core::pathway::{PathwayFilter, split_names};
use simhospital_core::runner::Runner;
use simhospital_core::sender::OutputSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Output {
    Stdout,
    File,
    Mllp,
}

/// Simulated Hospital: generates realistic HL7 v2 traffic from configurable patient pathways.
#[derive(Parser, Debug)]
#[command(name = "simhospital", version)]
struct Args {
    /// Directory holding the `configs/` tree; default paths are resolved under it
    #[arg(long, env = "SIMHOSPITAL_LOCAL_PATH", default_value = ".")]
    local_path: PathBuf,
    #[arg(long)]
    pathways_dir: Option<PathBuf>,
    #[arg(long)]
    hardcoded_messages_dir: Option<PathBuf>,
    #[arg(long)]
    header_config_file: Option<PathBuf>,
    #[arg(long)]
    data_config_file: Option<PathBuf>,
    #[arg(long)]
    locations_file: Option<PathBuf>,
    #[arg(long)]
    doctors_file: Option<PathBuf>,
    #[arg(long)]
    order_profile_file: Option<PathBuf>,

    /// Number of pathways that should start per hour
    #[arg(long, default_value_t = 1.0)]
    pathways_per_hour: f64,
    /// How often the scheduler checks for due pathways
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    sleep_for: Duration,
    /// Forget patients once their pathway ends
    #[arg(long)]
    delete_patients_from_memory: bool,
    /// Comma-separated pathway names or regexes to run; empty runs all
    #[arg(long, default_value = "")]
    pathway_names: String,
    /// Comma-separated pathway names or regexes never to run automatically
    #[arg(long, default_value = "")]
    exclude_pathway_names: String,
    /// `UTC`, a zone name such as `Europe/London`, or a fixed offset such as `+01:00`
    #[arg(long, default_value = "UTC")]
    hl7_timezone: String,
    /// Step budget for one instance of a looping pathway
    #[arg(long, default_value_t = 1000)]
    max_loop_steps: usize,
    /// How long shutdown waits for running pathways before aborting them
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    shutdown_timeout: Duration,
    /// Seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_enum, default_value_t = Output::Stdout)]
    output: Output,
    #[arg(long, default_value = "messages.out")]
    output_file: PathBuf,
    /// host:port of the MLLP receiver
    #[arg(long, env = "SIMHOSPITAL_MLLP_DESTINATION", default_value = "")]
    mllp_destination: String,
    #[arg(long)]
    mllp_keep_alive: bool,
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1m")]
    mllp_keep_alive_interval: Duration,
    #[arg(long, default_value_t = 5)]
    mllp_max_attempts: u32,
    #[arg(long, value_parser = humantime::parse_duration, default_value = "200ms")]
    mllp_initial_backoff: Duration,
    #[arg(long, default_value_t = 2.0)]
    mllp_backoff_multiplier: f64,
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    mllp_max_backoff: Duration,
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    mllp_ack_timeout: Duration,
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    mllp_connect_timeout: Duration,
    /// Consecutive connect failures after which the run stops
    #[arg(long, default_value_t = 20)]
    mllp_max_connect_failures: u32,

    #[arg(long, env = "SIMHOSPITAL_DASHBOARD_ADDRESS", default_value = "0.0.0.0:8000")]
    dashboard_address: String,
    /// Base URI of the dashboard endpoints
    #[arg(long, default_value = "simulated-hospital")]
    dashboard_uri: String,
    /// Do not start the dashboard
    #[arg(long)]
    no_dashboard: bool,
    /// Address of the standalone Prometheus endpoint; empty disables it
    #[arg(long, env = "SIMHOSPITAL_METRICS_LISTEN_ADDRESS", default_value = "0.0.0.0:9095")]
    metrics_listen_address: String,

    /// Default log level; RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn config_paths(&self) -> ConfigPaths {
        let defaults = ConfigPaths::under(&self.local_path);
        let pick = |flag: &Option<PathBuf>, default: PathBuf| flag.clone().unwrap_or(default);
        ConfigPaths {
            data: pick(&self.data_config_file, defaults.data),
            locations: pick(&self.locations_file, defaults.locations),
            doctors: pick(&self.doctors_file, defaults.doctors),
            order_profiles: pick(&self.order_profile_file, defaults.order_profiles),
            header: pick(&self.header_config_file, defaults.header),
            pathways_dir: pick(&self.pathways_dir, defaults.pathways_dir),
            hardcoded_dir: pick(&self.hardcoded_messages_dir, defaults.hardcoded_dir),
        }
    }

    fn output_config(&self) -> OutputConfig {
        match self.output {
            Output::Stdout => OutputConfig::Stdout,
            Output::File => OutputConfig::File {
                path: self.output_file.clone(),
            },
            Output::Mllp => {
                let retry = RetryPolicy {
                    max_attempts: self.mllp_max_attempts,
                    initial_backoff: self.mllp_initial_backoff,
                    backoff_multiplier: self.mllp_backoff_multiplier,
                    max_backoff: self.mllp_max_backoff,
                    ack_timeout: self.mllp_ack_timeout,
                    connect_timeout: self.mllp_connect_timeout,
                    max_connect_failures: self.mllp_max_connect_failures,
                };
                let mut mllp = MllpConfig::new(self.mllp_destination.clone()).with_retry(retry);
                if self.mllp_keep_alive {
                    mllp = mllp.with_keep_alive(self.mllp_keep_alive_interval);
                }
                OutputConfig::Mllp(mllp)
            }
        }
    }

    fn sim_config(&self, header: hl7::HeaderConfig) -> anyhow::Result<SimConfig> {
        let config = SimConfig {
            pathways_per_hour: self.pathways_per_hour,
            sleep_for: self.sleep_for,
            delete_patients_from_memory: self.delete_patients_from_memory,
            output: self.output_config(),
            pathway_names: split_names(&self.pathway_names),
            exclude_pathway_names: split_names(&self.exclude_pathway_names),
            header,
            timezone: hl7::parse_timezone(&self.hl7_timezone)?,
            max_loop_steps: self.max_loop_steps,
            shutdown_timeout: self.shutdown_timeout,
            seed: self.seed,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Resolves once SIGINT or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Main entry point for Simulated Hospital
///
/// Loads configuration, opens the configured output, then runs the scheduler and the
/// dashboard until a signal, a dashboard shutdown request, or a fatal sender error.
///
/// # Environment Variables
/// - `RUST_LOG`: log filter, overriding `--log-level`
/// - `SIMHOSPITAL_LOCAL_PATH`, `SIMHOSPITAL_MLLP_DESTINATION`, `SIMHOSPITAL_DASHBOARD_ADDRESS`,
///   `SIMHOSPITAL_METRICS_LISTEN_ADDRESS`: defaults for the matching flags (a `.env` file is
///   read first)
///
/// # Errors
/// Returns an error, and the process exits non-zero, if:
/// - a configuration file is missing or invalid,
/// - no pathway passes the filters while automatic arrivals are enabled,
/// - the output, the dashboard address or the metrics address cannot be opened, or
/// - the sender fails fatally during the run.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let level = args.log_level.to_ascii_lowercase();
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for target in ["simhospital", "simhospital_core", "simhospital_dashboard"] {
        filter = filter.add_directive(format!("{target}={level}").parse()?);
    }
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let paths = args.config_paths();
    let loaded = load_all(&paths).context("failed to load configuration")?;
    let config = args.sim_config(loaded.header.clone())?;

    let filter = PathwayFilter::new(&config.pathway_names, &config.exclude_pathway_names)?;
    let eligible = loaded.eligible_names(&filter);
    if eligible.is_empty() && config.pathways_per_hour > 0.0 {
        anyhow::bail!(
            "no pathway matches --pathway-names '{}' minus --exclude-pathway-names '{}'",
            args.pathway_names,
            args.exclude_pathway_names
        );
    }
    tracing::info!(eligible = ?eligible, "pathways selected");

    let metrics = SimMetrics::new()?;
    let sink = OutputSink::open(&config.output, &metrics)
        .await
        .context("failed to open output")?;

    let cancel = CancellationToken::new();
    let scrapes = simhospital_dashboard::metrics_router(metrics.clone());
    let (runner, handle) = Runner::from_loaded(config, loaded, sink, metrics, cancel.clone())?;

    let metrics_server = if args.metrics_listen_address.is_empty() {
        None
    } else {
        let listener = tokio::net::TcpListener::bind(&args.metrics_listen_address)
            .await
            .with_context(|| {
                format!("failed to bind metrics to {}", args.metrics_listen_address)
            })?;
        tracing::info!("++ Serving metrics on {}/metrics", args.metrics_listen_address);
        Some(tokio::spawn(simhospital_dashboard::serve(
            listener,
            scrapes,
            cancel.clone(),
        )))
    };

    let dashboard = if args.no_dashboard {
        None
    } else {
        let listener = tokio::net::TcpListener::bind(&args.dashboard_address)
            .await
            .with_context(|| format!("failed to bind dashboard to {}", args.dashboard_address))?;
        tracing::info!(
            "++ Starting dashboard on {} under /{}",
            args.dashboard_address,
            args.dashboard_uri.trim_matches('/')
        );
        let app = simhospital_dashboard::router(handle, &args.dashboard_uri);
        Some(tokio::spawn(simhospital_dashboard::serve(
            listener,
            app,
            cancel.clone(),
        )))
    };

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("signal received, shutting down");
        signal_cancel.cancel();
    });

    let result = runner.run().await;
    cancel.cancel();
    for (name, server) in [("Dashboard", dashboard), ("Metrics", metrics_server)] {
        if let Some(server) = server {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("{name} server error: {e}"),
                Err(e) => tracing::error!("{name} server task failed: {e}"),
            }
        }
    }

    match result {
        Ok(report) => {
            tracing::info!(
                started = report.started,
                completed = report.completed,
                aborted = report.aborted,
                "simulation finished"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "simulation stopped");
            Err(e.into())
        }
    }
}
