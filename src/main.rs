// Faultline Controller - Main Entry Point
//
// CLI for the chaos experiment controller:
// - run:   start the controller (starter, failure checker, summary server)
// - apply: seed experiments into the state directory
// - get:   print stored experiments and their states

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faultline_controller::api::{Experiment, ExperimentResult, Report};
use faultline_controller::config::{Config, DEFAULT_CONFIG_PATH};
use faultline_controller::metrics;
use faultline_controller::metrics_server::{self, ServerState};
use faultline_controller::store::{ExperimentClient, FileClient, ReportClient, ResourceClient, WriteOpts};
use faultline_controller::{
    EventLoop, ExperimentChecker, ExperimentStarter, FailureCheckSyncer, PrometheusClient, QueryPubSub,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// How long shutdown waits for running monitors to return
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Faultline: chaos experiment controller
#[derive(Parser, Debug)]
#[command(name = "faultline")]
#[command(author = "Faultline Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Runs chaos experiments and judges them against Prometheus failure conditions", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Controller command to run
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until interrupted
    Run,
    /// Store experiments from a JSON file as Pending
    Apply {
        /// JSON file holding one experiment or an array of experiments
        file: PathBuf,

        /// Namespace for experiments that do not set one
        #[arg(short, long)]
        namespace: Option<String>,
    },
    /// Print stored experiments and their states
    Get {
        /// Only show experiments in this namespace
        #[arg(short, long)]
        namespace: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();
    let config = Config::load_from_path(&args.config)?;

    init_tracing(&config, args.verbose)?;

    match args.command {
        Some(Commands::Run) => {
            info!("Faultline controller v{} starting...", env!("CARGO_PKG_VERSION"));
            run_controller(config).await?;
        }
        Some(Commands::Apply { file, namespace }) => {
            apply_experiments(&config, &file, namespace).await?;
        }
        Some(Commands::Get { namespace }) => {
            get_experiments(&config, namespace).await?;
        }
        None => {
            info!("No command specified. Use \"faultline --help\" for usage.");
        }
    }

    Ok(())
}

/// Initialize tracing from the logging config
fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let filter = if verbose { Level::DEBUG } else { config.log_level()? };
    let env_filter = EnvFilter::builder()
        .with_default_directive(filter.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_env_filter(env_filter);

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

fn experiment_client(config: &Config) -> ExperimentClient {
    Arc::new(FileClient::<Experiment>::new(&config.controller.state_dir))
}

fn report_client(config: &Config) -> ReportClient {
    Arc::new(FileClient::<Report>::new(&config.controller.state_dir))
}

/// Wire up and run the controller until Ctrl-C
async fn run_controller(config: Config) -> Result<()> {
    if config.metrics.enabled {
        metrics::init().context("Failed to initialize metrics")?;
    }

    let root = CancellationToken::new();
    let experiments = experiment_client(&config);
    let namespace = config.controller.watch_namespace().map(str::to_string);

    let backend = PrometheusClient::new(&config.prometheus.url, config.prometheus.request_timeout())
        .context("Failed to create Prometheus client")?;
    info!(
        url = backend.endpoint(),
        polling_ms = config.prometheus.polling_interval_ms,
        "Using Prometheus backend"
    );
    let queries = QueryPubSub::new(Arc::new(backend), config.prometheus.polling_interval(), root.clone());

    let checker = Arc::new(ExperimentChecker::new(queries, experiments.clone(), report_client(&config)));
    let failure_checker = Arc::new(FailureCheckSyncer::new(checker));
    let starter = Arc::new(ExperimentStarter::new(experiments.clone()));

    let event_loop = EventLoop::new(experiments.clone(), config.controller.refresh_interval())
        .with_namespace(namespace.clone())
        .with_syncer(starter)
        .with_syncer(failure_checker.clone());

    let server = if config.server.enabled {
        let addr = config.summary_addr()?;
        let state = ServerState { experiments, namespace };
        let cancel = root.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics_server::start_server(addr, state, cancel).await {
                error!("Summary server failed: {:#}", e);
            }
        }))
    } else {
        None
    };

    let shutdown = root.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        shutdown.cancel();
    });

    event_loop.run(root.clone()).await?;

    if tokio::time::timeout(SHUTDOWN_GRACE, failure_checker.wait_idle()).await.is_err() {
        warn!(in_flight = failure_checker.in_flight(), "Monitors still running at shutdown");
    }
    if let Some(server) = server {
        let _ = server.await;
    }

    info!("Faultline controller stopped");
    Ok(())
}

/// Parse a JSON file holding one experiment or an array of them
fn parse_experiments(content: &str) -> Result<Vec<Experiment>> {
    let value: serde_json::Value = serde_json::from_str(content).context("Invalid JSON")?;
    if value.is_array() {
        serde_json::from_value(value).context("Invalid experiment list")
    } else {
        Ok(vec![serde_json::from_value(value).context("Invalid experiment")?])
    }
}

async fn apply_experiments(config: &Config, file: &Path, namespace: Option<String>) -> Result<()> {
    let content =
        fs::read_to_string(file).with_context(|| format!("Failed to read experiments from {:?}", file))?;
    let parsed = parse_experiments(&content).with_context(|| format!("Failed to parse {:?}", file))?;

    let default_namespace = namespace.or_else(|| config.controller.watch_namespace().map(str::to_string));
    let client = experiment_client(config);

    for mut exp in parsed {
        if exp.metadata.namespace.is_empty() {
            match &default_namespace {
                Some(ns) => exp.metadata.namespace = ns.clone(),
                None => bail!("Experiment {:?} has no namespace; pass --namespace", exp.metadata.name),
            }
        }
        exp.result = ExperimentResult::default();
        exp.metadata.resource_version = String::new();

        let target = exp.resource_ref();
        client
            .write(exp, WriteOpts::overwrite())
            .await
            .with_context(|| format!("Failed to store experiment {}", target))?;
        println!("experiment {} applied", target);
    }
    Ok(())
}

async fn get_experiments(config: &Config, namespace: Option<String>) -> Result<()> {
    let namespace = namespace.or_else(|| config.controller.watch_namespace().map(str::to_string));
    let experiments = experiment_client(config)
        .list(namespace.as_deref())
        .await
        .context("Failed to list experiments")?;

    if experiments.is_empty() {
        println!("No experiments found");
        return Ok(());
    }

    println!("{:<20} {:<30} {:<10} {}", "NAMESPACE", "NAME", "STATE", "STARTED");
    for exp in experiments {
        let started = exp
            .result
            .time_started
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<30} {:<10} {}",
            exp.metadata.namespace,
            exp.metadata.name,
            exp.result.state.to_string(),
            started
        );
        for (key, value) in &exp.result.failure_report {
            println!("    {}: {}", key, value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_and_list() {
        let single = r#"{"metadata": {"namespace": "chaos", "name": "a"}}"#;
        assert_eq!(parse_experiments(single).unwrap().len(), 1);

        let list = r#"[{"metadata": {"namespace": "chaos", "name": "a"}},
                       {"metadata": {"namespace": "chaos", "name": "b"}}]"#;
        let parsed = parse_experiments(list).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].metadata.name, "b");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_experiments("not json").is_err());
        assert!(parse_experiments(r#"{"spec": {}}"#).is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["faultline", "-v", "apply", "exp.json", "--namespace", "chaos"]);
        assert!(args.verbose);
        assert!(matches!(
            args.command,
            Some(Commands::Apply { ref namespace, .. }) if namespace.as_deref() == Some("chaos")
        ));
    }
}
