//! MQTT Schema Governance Proxy CLI
//!
//! Loads the configuration, brings up both broker connections and the
//! pipeline, and manages the process lifecycle. Exit codes: 0 normal exit,
//! 2 configuration error, 3 fatal startup failure, 130 on interrupt.

use anyhow::Result;
use clap::Parser;
use mqtt_schema_proxy::audit::AuditSink;
use mqtt_schema_proxy::broker::BrokerClient;
use mqtt_schema_proxy::http::{self, HealthState};
use mqtt_schema_proxy::metrics::MetricsRegistry;
use mqtt_schema_proxy::quarantine::QuarantineStore;
use mqtt_schema_proxy::schema::SchemaRegistry;
use mqtt_schema_proxy::topic::TopicMatcher;
use mqtt_schema_proxy::{Pipeline, PipelineContext, ProxyConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_STARTUP_FAILURE: u8 = 3;
const EXIT_INTERRUPT: u8 = 130;

/// Window to reach both brokers before startup is declared failed.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// MQTT Schema Governance Proxy
#[derive(Parser, Debug)]
#[command(name = "proxy")]
#[command(version)]
#[command(about = "Store-and-forward schema governance proxy for MQTT", long_about = None)]
struct Args {
    /// Configuration file path (YAML)
    #[arg(short, long, default_value = "config/rules.yaml")]
    config: PathBuf,

    /// Validate messages but do not forward to the upstream broker
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long)]
    json_logs: bool,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    validate_config: bool,

    /// Configuration overrides as dotted.key=value (repeatable)
    #[arg(long = "override", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    if args.json_logs {
        fmt().json().with_env_filter(filter).with_target(true).init();
    } else {
        fmt().with_env_filter(filter).with_target(true).init();
    }

    let mut config = match ProxyConfig::load(&args.config, &args.overrides) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "configuration error");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    if args.dry_run {
        config.global.dry_run = true;
    }

    if args.validate_config {
        // Schema compilation is part of config validity
        if let Err(e) = SchemaRegistry::load_all(&config.validation, 0) {
            error!(error = %e, "schema compilation failed");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
        if let Err(e) = TopicMatcher::build(&config.validation) {
            error!(error = %e, "topic pattern compilation failed");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
        info!(
            patterns = config.validation.topic_patterns.len(),
            mappings = config.validation.schema_mappings.len(),
            schemas = config.validation.schema_files.len(),
            "configuration is valid"
        );
        return ExitCode::SUCCESS;
    }

    match run(args, config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::from(EXIT_STARTUP_FAILURE)
        }
    }
}

async fn run(args: Args, config: ProxyConfig) -> Result<ExitCode> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        dry_run = config.global.dry_run,
        "starting MQTT schema governance proxy"
    );
    if config.global.dry_run {
        info!("dry run mode: messages will be validated but not forwarded");
    }

    // Compile validators; failures here are configuration errors
    let matcher = match TopicMatcher::build(&config.validation) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "invalid topic configuration");
            return Ok(ExitCode::from(EXIT_CONFIG_ERROR));
        }
    };
    let registry =
        match SchemaRegistry::load_all(&config.validation, config.validation_cache_size()) {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "schema load failed");
                return Ok(ExitCode::from(EXIT_CONFIG_ERROR));
            }
        };

    let metrics = MetricsRegistry::new()?;
    let audit = AuditSink::start(&config.monitoring.audit)?;
    let store = Arc::new(QuarantineStore::open(&config.storage)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (intake_tx, intake_rx) = mpsc::channel(config.performance.message_buffer_size);

    let subscriber = Arc::new(BrokerClient::subscriber(
        &config.brokers.subscriber,
        &format!("{}-subscriber", config.global.client_id_prefix),
        config.global.max_message_size,
        matcher.subscription_filters().to_vec(),
        intake_tx,
        config.global.message_timeout(),
        metrics.clone(),
        shutdown_rx.clone(),
    )?);
    let publisher = Arc::new(BrokerClient::publisher(
        &config.brokers.publisher,
        &format!("{}-publisher", config.global.client_id_prefix),
        config.global.max_message_size,
        metrics.clone(),
        shutdown_rx.clone(),
    )?);

    let ctx = Arc::new(PipelineContext::new(
        config.clone(),
        matcher,
        registry,
        store,
        audit,
        metrics.clone(),
        publisher.clone(),
    ));
    let pipeline = Pipeline::start(ctx.clone(), intake_rx, shutdown_rx.clone());

    if config.monitoring.metrics.enabled {
        let monitoring = config.monitoring.metrics.clone();
        let metrics = metrics.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve_metrics(monitoring, metrics, shutdown).await {
                error!(error = %e, "metrics endpoint failed");
            }
        });
    }
    if config.monitoring.health_check.enabled {
        let health = config.monitoring.health_check.clone();
        let state = HealthState {
            subscriber: subscriber.clone(),
            publisher: publisher.clone(),
            ctx: ctx.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve_health(health, state, shutdown).await {
                error!(error = %e, "health endpoint failed");
            }
        });
    }

    // Fail startup if the brokers stay unreachable
    if !wait_for_brokers(&subscriber, &publisher, STARTUP_TIMEOUT).await {
        error!(
            timeout_secs = STARTUP_TIMEOUT.as_secs(),
            "brokers unreachable at startup"
        );
        let _ = shutdown_tx.send(true);
        pipeline.shutdown(Duration::from_secs(1)).await;
        return Ok(ExitCode::from(EXIT_STARTUP_FAILURE));
    }
    info!("proxy started");

    let exit_code = wait_for_signals(&args, &ctx, &subscriber).await;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    subscriber.stop().await;
    pipeline.shutdown(config.global.shutdown_timeout()).await;
    publisher.stop().await;
    info!("shutdown complete");

    Ok(exit_code)
}

async fn wait_for_brokers(
    subscriber: &BrokerClient,
    publisher: &BrokerClient,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if subscriber.is_connected() && publisher.is_connected() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    false
}

#[cfg(unix)]
async fn wait_for_signals(
    args: &Args,
    ctx: &Arc<PipelineContext>,
    subscriber: &Arc<BrokerClient>,
) -> ExitCode {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return ExitCode::FAILURE;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGHUP handler");
            return ExitCode::FAILURE;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                return ExitCode::from(EXIT_INTERRUPT);
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                return ExitCode::SUCCESS;
            }
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading configuration");
                reload_config(args, ctx, subscriber);
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(
    _args: &Args,
    _ctx: &Arc<PipelineContext>,
    _subscriber: &Arc<BrokerClient>,
) -> ExitCode {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt received");
    ExitCode::from(EXIT_INTERRUPT)
}

/// Hot reload: build the new snapshot off the worker path, swap it in, and
/// refresh the subscription set. A bad file leaves the running snapshot in
/// service.
#[cfg(unix)]
fn reload_config(args: &Args, ctx: &Arc<PipelineContext>, subscriber: &Arc<BrokerClient>) {
    let mut new_config = match ProxyConfig::load(&args.config, &args.overrides) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "reload aborted: configuration error");
            return;
        }
    };
    if args.dry_run {
        new_config.global.dry_run = true;
    }

    let filters = new_config.validation.topic_patterns.clone();
    match ctx.reload(new_config) {
        Ok(()) => {
            subscriber.set_subscriptions(filters);
            info!("configuration reloaded");
        }
        Err(e) => warn!(error = %e, "reload aborted: {e}"),
    }
}
