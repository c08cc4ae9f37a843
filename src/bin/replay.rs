//! Quarantine replay tool
//!
//! Re-validates quarantined messages against the current rules and schemas
//! and republishes the ones that now pass. Replayed records are removed
//! from the quarantine; messages that still fail validation are left in
//! place untouched.

use anyhow::{bail, Context, Result};
use clap::Parser;
use mqtt_schema_proxy::broker::BrokerClient;
use mqtt_schema_proxy::metrics::MetricsRegistry;
use mqtt_schema_proxy::quarantine::{ListFilter, Page, QuarantineReason, QuarantineStore};
use mqtt_schema_proxy::schema::{SchemaRegistry, Verdict};
use mqtt_schema_proxy::topic::TopicMatcher;
use mqtt_schema_proxy::ProxyConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

/// Replay quarantined MQTT messages
#[derive(Parser, Debug)]
#[command(name = "replay")]
#[command(version)]
#[command(about = "Re-validate and republish quarantined messages", long_about = None)]
struct Args {
    /// Configuration file path (YAML)
    #[arg(short, long, default_value = "config/rules.yaml")]
    config: PathBuf,

    /// Replay only these record ids (repeatable); default is oldest-first
    #[arg(long = "id", value_name = "UUID")]
    ids: Vec<Uuid>,

    /// Maximum number of records to process
    #[arg(long, default_value_t = 1000)]
    limit: usize,

    /// Only records quarantined for this reason
    #[arg(long)]
    reason: Option<String>,

    /// Re-validate but do not publish or delete
    #[arg(long)]
    dry_run: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Default)]
struct Stats {
    processed: usize,
    replayed: usize,
    still_invalid: usize,
    errors: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).init();

    let config = ProxyConfig::load(&args.config, &[]).context("failed to load configuration")?;
    let matcher = TopicMatcher::build(&config.validation)?;
    let registry = SchemaRegistry::load_all(&config.validation, config.validation_cache_size())?;
    let store = QuarantineStore::open(&config.storage)?;

    let publisher = if args.dry_run {
        None
    } else {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // The driver runs for the lifetime of the tool
        std::mem::forget(shutdown_tx);
        let metrics = MetricsRegistry::new()?;
        let client = Arc::new(BrokerClient::publisher(
            &config.brokers.publisher,
            &format!("{}-replay", config.global.client_id_prefix),
            config.global.max_message_size,
            metrics,
            shutdown_rx,
        )?);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        while !client.is_connected() {
            if tokio::time::Instant::now() > deadline {
                bail!("publisher broker unreachable");
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Some(client)
    };

    let records = if args.ids.is_empty() {
        let filter = ListFilter {
            reason: args.reason.as_deref().map(QuarantineReason::parse),
            ..Default::default()
        };
        store.list(
            &filter,
            &Page {
                limit: args.limit,
                offset: 0,
            },
        )?
    } else {
        let mut records = Vec::new();
        for id in &args.ids {
            match store.get(*id)? {
                Some(record) => records.push(record),
                None => warn!(id = %id, "record not found"),
            }
        }
        records
    };

    if records.is_empty() {
        info!("no quarantined records to process");
        return Ok(());
    }
    info!(records = records.len(), dry_run = args.dry_run, "starting replay");

    let mut stats = Stats::default();
    for record in records {
        stats.processed += 1;

        let payload = match store.read_payload(&record) {
            Ok(p) => p,
            Err(e) => {
                warn!(id = %record.id, error = %e, "payload unreadable");
                stats.errors += 1;
                continue;
            }
        };

        // Re-run the decision flow against current rules
        let decision = matcher.match_topic(&record.topic);
        if !decision.matched {
            stats.still_invalid += 1;
            continue;
        }
        let Some(schema_id) = decision.schema_id else {
            stats.still_invalid += 1;
            continue;
        };
        match registry.validate(&schema_id, &payload) {
            Verdict::Pass | Verdict::Warn(_) => {}
            Verdict::Fail(violation) => {
                info!(id = %record.id, topic = %record.topic, violation = %violation, "still invalid");
                stats.still_invalid += 1;
                continue;
            }
        }

        if args.dry_run {
            info!(id = %record.id, topic = %record.topic, "would replay");
            stats.replayed += 1;
            continue;
        }

        let publisher = publisher.as_ref().expect("publisher present outside dry run");
        match publisher
            .publish_blocking(&record.topic, payload, record.qos, record.retain)
            .await
        {
            Ok(()) => {
                if let Err(e) = store.delete(record.id) {
                    warn!(id = %record.id, error = %e, "replayed but not removed");
                    stats.errors += 1;
                } else {
                    info!(id = %record.id, topic = %record.topic, "replayed");
                    stats.replayed += 1;
                }
            }
            Err(e) => {
                warn!(id = %record.id, error = %e, "publish failed");
                stats.errors += 1;
            }
        }
    }

    info!(
        processed = stats.processed,
        replayed = stats.replayed,
        still_invalid = stats.still_invalid,
        errors = stats.errors,
        "replay complete"
    );
    Ok(())
}
