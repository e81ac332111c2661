//! Sentinel — the operational control plane binary (spec.md §6 CLI
//! surface). Wires the `Orchestrator` to demo collaborator
//! implementations (`NullDomainSource`, `InMemoryStandbyManager`,
//! `RecordingNotifier`); a real deployment supplies its own
//! `DomainSource`/`StandbyManager`/`Notifier` and links against the
//! library crate directly instead of running this binary.

use clap::{Parser, Subcommand, ValueEnum};
use sentinel_ops::alerts::model::Severity;
use sentinel_ops::config::Config;
use sentinel_ops::notify::RecordingNotifier;
use sentinel_ops::orchestrator::{HealthState, Orchestrator};
use sentinel_ops::sampler::NullDomainSource;
use sentinel_ops::standby::InMemoryStandbyManager;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "sentinel")]
#[command(about = "Operational control plane: monitoring, deployment validation, failover, and disaster recovery")]
struct Args {
    /// Path to TOML configuration file. Falls back to $SENTINEL_CONFIG_PATH, then defaults.
    #[arg(short, long, env = "SENTINEL_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "SENTINEL_LOG_LEVEL")]
    log_level: String,

    /// Prometheus metrics + health HTTP port. Omit to disable the endpoint.
    #[arg(long, env = "SENTINEL_METRICS_PORT")]
    metrics_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start sampler, retention maintenance, alert engine, and failover engine; run until a termination signal
    Start,
    /// Print health summary and key counters
    Status,
    /// Invoke channel self-test and print per-channel pass/fail
    TestAlerts,
    /// Emit a synthetic alert at the given severity
    TriggerAlert {
        #[arg(value_enum)]
        severity: SeverityArg,
    },
    /// Force a compression + eviction pass; print counts and new total bytes
    Maintenance,
    /// Write a JSON export of the last N days of snapshots
    Export { days: u32, path: PathBuf },
    /// Run deployment-readiness probes and print a report
    Validate {
        /// Only check the nominated critical subset, with a tighter per-probe cap
        #[arg(long)]
        quick: bool,
    },
    /// Run a disaster-recovery plan for the given trigger (optionally scoped to named components)
    Recover {
        trigger: String,
        components: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SeverityArg {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl From<SeverityArg> for Severity {
    fn from(s: SeverityArg) -> Self {
        match s {
            SeverityArg::Info => Severity::Info,
            SeverityArg::Warning => Severity::Warning,
            SeverityArg::Critical => Severity::Critical,
            SeverityArg::Emergency => Severity::Emergency,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to load config");
                return ExitCode::FAILURE;
            }
        },
        None => Config::from_env_or_default(),
    };

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        Arc::new(NullDomainSource),
        Arc::new(InMemoryStandbyManager::new()),
        Arc::new(RecordingNotifier::default()),
    ));

    match run(orchestrator, args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(orchestrator: Arc<Orchestrator>, args: Args) -> anyhow::Result<ExitCode> {
    match args.command {
        Command::Start => {
            if let Some(port) = args.metrics_port {
                let metrics_orchestrator = Arc::clone(&orchestrator);
                let addr = SocketAddr::from(([0, 0, 0, 0], port));
                tokio::spawn(async move {
                    if let Err(e) = metrics_orchestrator.serve_metrics(addr).await {
                        error!(error = %e, "metrics endpoint exited");
                    }
                });
            }
            orchestrator.run().await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            let summary = orchestrator.health_summary();
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(match summary.state {
                HealthState::Healthy => ExitCode::from(0),
                HealthState::Warning => ExitCode::from(1),
                HealthState::Critical => ExitCode::from(2),
            })
        }
        Command::TestAlerts => {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let results = orchestrator.test_alerts(now_ms).await;
            let mut all_ok = true;
            for (channel, ok) in &results {
                println!("{channel:?}: {}", if *ok { "pass" } else { "fail" });
                all_ok &= ok;
            }
            Ok(if all_ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::TriggerAlert { severity } => {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let alert = orchestrator.trigger_alert(severity.into(), now_ms).await;
            println!("{}", serde_json::to_string_pretty(&alert)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Maintenance => {
            let (compressed, evicted, total_bytes) = orchestrator.run_maintenance()?;
            info!(compressed, evicted, total_bytes, "maintenance pass complete");
            println!("compressed={compressed} evicted={evicted} total_bytes={total_bytes}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Export { days, path } => {
            let count = orchestrator.export_snapshots(days, &path)?;
            println!("exported {count} snapshots to {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate { quick } => {
            let report = orchestrator.validate_deployment(quick).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.passed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::Recover { trigger, components } => {
            let scope = if components.is_empty() {
                None
            } else {
                Some(components.into_iter().collect())
            };
            let execution = orchestrator.recover(trigger, scope).await?;
            println!("{}", serde_json::to_string_pretty(&execution)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
