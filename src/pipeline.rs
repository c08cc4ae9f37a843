//! Proxy core: bounded queue, worker pool, decision flow
//!
//! The subscriber feeds a bounded work queue; a pool of workers drains it
//! and runs each message through size check, topic match, client rules,
//! rate limit, schema validation, and forward. Every message reaches
//! exactly one terminal state (forwarded, quarantined, or dropped with an
//! internal error), each producing an audit record and a metric after the
//! side effect completed. Worker failures never terminate the pipeline:
//! panics and deadline overruns are caught at the message boundary.
//!
//! Per-topic ordering is not preserved across workers; operators that need
//! it run with `worker-threads: 1` or partition deployments by topic
//! prefix.

use crate::audit::{AuditEvent, AuditSink, Decision};
use crate::broker::MessageForwarder;
use crate::config::ProxyConfig;
use crate::metrics::{MessageStatus, MetricsRegistry};
use crate::quarantine::{QuarantineReason, QuarantineStore, RecordMeta};
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::schema::{SchemaRegistry, Verdict};
use crate::topic::TopicMatcher;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The unit of work flowing through the pipeline. Never mutated after
/// construction; decisions carry their metadata alongside.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
    /// Originating publisher's client id when known, else empty
    pub client_id: String,
    pub received_at: DateTime<Utc>,
    pub enqueued_at: Instant,
}

/// Shared state carried by every worker: configuration snapshot, read-only
/// validators, and the audit/metrics sidecars. Replaces any process-global
/// state.
pub struct PipelineContext {
    config: RwLock<Arc<ProxyConfig>>,
    matcher: RwLock<Arc<TopicMatcher>>,
    registry: SchemaRegistry,
    store: Arc<QuarantineStore>,
    limiter: RateLimiter,
    audit: AuditSink,
    metrics: MetricsRegistry,
    forwarder: Arc<dyn MessageForwarder>,
}

impl PipelineContext {
    pub fn new(
        config: ProxyConfig,
        matcher: TopicMatcher,
        registry: SchemaRegistry,
        store: Arc<QuarantineStore>,
        audit: AuditSink,
        metrics: MetricsRegistry,
        forwarder: Arc<dyn MessageForwarder>,
    ) -> Self {
        let limiter = RateLimiter::new(&config.security.rate_limiting);
        Self {
            config: RwLock::new(Arc::new(config)),
            matcher: RwLock::new(Arc::new(matcher)),
            registry,
            store,
            limiter,
            audit,
            metrics,
            forwarder,
        }
    }

    pub fn config(&self) -> Arc<ProxyConfig> {
        self.config.read().clone()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<QuarantineStore> {
        &self.store
    }

    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    /// Swap in a new configuration snapshot: rebuild the topic index,
    /// recompile schemas off the worker path, reset rate limit buckets.
    /// Workers observe the new snapshot at message boundaries; in-flight
    /// validations finish against the prior one.
    pub fn reload(&self, new: ProxyConfig) -> anyhow::Result<()> {
        new.validate()?;
        let matcher = TopicMatcher::build(&new.validation)?;
        self.registry.reload(&new.validation)?;
        self.limiter.reconfigure(&new.security.rate_limiting);

        *self.matcher.write() = Arc::new(matcher);
        *self.config.write() = Arc::new(new);
        info!("configuration snapshot swapped");
        Ok(())
    }

    /// Run one message to its terminal state. Public so the decision flow
    /// can be exercised without broker connections.
    pub async fn process(&self, message: Message) {
        let started = Instant::now();
        let config = self.config();
        let matcher = self.matcher.read().clone();

        // 1. Size check
        if message.payload.len() > config.global.max_message_size {
            let detail = format!(
                "payload size {} exceeds limit {}",
                message.payload.len(),
                config.global.max_message_size
            );
            self.quarantine(&message, QuarantineReason::PayloadTooLarge, detail, None, started)
                .await;
            return;
        }

        // 2. Topic format, then allow-list
        if let Err(reason) = TopicMatcher::validate_topic_name(&message.topic) {
            self.quarantine(
                &message,
                QuarantineReason::TopicNotAllowed,
                format!("malformed topic: {reason}"),
                None,
                started,
            )
            .await;
            return;
        }

        let decision = matcher.match_topic(&message.topic);
        if !decision.matched {
            let detail = format!("topic '{}' does not match any allowed pattern", message.topic);
            self.quarantine(&message, QuarantineReason::TopicNotAllowed, detail, None, started)
                .await;
            return;
        }

        // 3. Client-specific rules
        if !message.client_id.is_empty() && !matcher.client_allows(&message.client_id, &message.topic)
        {
            let detail = format!(
                "client '{}' is not allowed to publish to '{}'",
                message.client_id, message.topic
            );
            self.quarantine(&message, QuarantineReason::TopicNotAllowed, detail, None, started)
                .await;
            return;
        }

        // 4. Per-client rate limit
        match self.limiter.check(&message.client_id) {
            RateDecision::Allowed => {}
            RateDecision::Quarantine => {
                self.quarantine(
                    &message,
                    QuarantineReason::RateLimited,
                    "client publish rate exceeded".to_string(),
                    None,
                    started,
                )
                .await;
                return;
            }
            RateDecision::Drop => {
                self.metrics.message(MessageStatus::Dropped);
                self.emit_audit(
                    &message,
                    Decision::Dropped,
                    None,
                    Some(QuarantineReason::RateLimited),
                    Some("client publish rate exceeded".to_string()),
                    None,
                    None,
                    started,
                    false,
                );
                return;
            }
        }

        // 5. Schema lookup
        let schema_id = match decision.schema_id {
            Some(id) => id,
            None => {
                let detail = format!("no schema bound for topic '{}'", message.topic);
                self.quarantine(&message, QuarantineReason::NoSchemaBound, detail, None, started)
                    .await;
                return;
            }
        };

        // 6. Validate
        let validation_started = Instant::now();
        let verdict = self.registry.validate(&schema_id, &message.payload);
        self.metrics
            .observe_validation_duration(validation_started.elapsed().as_secs_f64());

        let warning = match verdict {
            Verdict::Pass => {
                self.metrics.schema_validation(&schema_id, true);
                None
            }
            Verdict::Warn(violation) => {
                self.metrics.schema_validation(&schema_id, false);
                warn!(
                    topic = %message.topic,
                    schema_id = %schema_id,
                    violation = %violation,
                    "schema violation forwarded in warn-only mode"
                );
                Some(violation.to_string())
            }
            Verdict::Fail(violation) => {
                self.metrics.schema_validation(&schema_id, false);
                self.quarantine(
                    &message,
                    QuarantineReason::SchemaValidationError,
                    violation.to_string(),
                    Some(schema_id),
                    started,
                )
                .await;
                return;
            }
        };

        // 7. Forward (suppressed in dry-run; validation and audit still ran)
        if config.global.dry_run {
            self.metrics.message(MessageStatus::Valid);
            debug!(topic = %message.topic, "dry run: forward suppressed");
            self.emit_audit(
                &message,
                Decision::Forwarded,
                Some(schema_id),
                None,
                None,
                None,
                warning,
                started,
                false,
            );
            return;
        }

        let forward_started = Instant::now();
        let forward_result = self
            .forwarder
            .forward(&message.topic, &message.payload, message.qos, message.retain)
            .await;
        self.metrics
            .observe_forward_duration(forward_started.elapsed().as_secs_f64());

        match forward_result {
            Ok(()) => {
                self.metrics.message(MessageStatus::Valid);
                self.metrics.message(MessageStatus::Forwarded);
                self.emit_audit(
                    &message,
                    Decision::Forwarded,
                    Some(schema_id),
                    None,
                    None,
                    None,
                    warning,
                    started,
                    true,
                );
            }
            Err(e) => {
                // Not retried inline; operators replay from quarantine
                self.quarantine(
                    &message,
                    QuarantineReason::UpstreamUnavailable,
                    format!("forward failed: {e}"),
                    Some(schema_id),
                    started,
                )
                .await;
            }
        }
    }

    /// Persist the record, then report. The audit event is emitted only
    /// after the row committed, so the trail reflects post-commit state.
    async fn quarantine(
        &self,
        message: &Message,
        reason: QuarantineReason,
        detail: String,
        schema_id: Option<String>,
        started: Instant,
    ) {
        let meta = RecordMeta {
            received_at: message.received_at,
            topic: message.topic.clone(),
            client_id: message.client_id.clone(),
            qos: message.qos,
            retain: message.retain,
            reason,
            detail: detail.clone(),
            schema_id: schema_id.clone(),
        };
        let store = self.store.clone();
        let payload = message.payload.clone();

        let result =
            tokio::task::spawn_blocking(move || {
                let id = store.quarantine(meta, &payload)?;
                let bytes = store.total_payload_bytes().unwrap_or(0);
                Ok::<_, crate::error::StoreError>((id, bytes))
            })
            .await;

        match result {
            Ok(Ok((record_id, total_bytes))) => {
                self.metrics.message(MessageStatus::Invalid);
                self.metrics.quarantined(reason.as_str());
                self.metrics.set_quarantine_bytes(total_bytes);
                info!(
                    topic = %message.topic,
                    reason = %reason,
                    record_id = %record_id,
                    "message quarantined"
                );
                self.emit_audit(
                    message,
                    Decision::Quarantined,
                    schema_id,
                    Some(reason),
                    Some(detail),
                    Some(record_id),
                    None,
                    started,
                    false,
                );
            }
            Ok(Err(e)) => {
                error!(topic = %message.topic, error = %e, "quarantine write failed");
                self.drop_internal(message, format!("quarantine write failed: {e}"), started);
            }
            Err(join_err) => {
                error!(topic = %message.topic, error = %join_err, "quarantine task failed");
                self.drop_internal(message, "quarantine task failed".to_string(), started);
            }
        }
    }

    /// Terminal state for bugs and unexpected failures: the message is
    /// dropped but still audited and counted.
    pub(crate) fn drop_internal(&self, message: &Message, detail: String, started: Instant) {
        self.metrics.message(MessageStatus::Dropped);
        self.emit_audit(
            message,
            Decision::Dropped,
            None,
            Some(QuarantineReason::InternalError),
            Some(detail),
            None,
            None,
            started,
            false,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_audit(
        &self,
        message: &Message,
        decision: Decision,
        schema_id: Option<String>,
        reason: Option<QuarantineReason>,
        detail: Option<String>,
        record_id: Option<Uuid>,
        warning: Option<String>,
        started: Instant,
        forwarded: bool,
    ) {
        let dry_run = self.config.read().global.dry_run;
        self.audit.emit(AuditEvent {
            ts: Utc::now(),
            decision,
            topic: message.topic.clone(),
            client_id: message.client_id.clone(),
            schema_id,
            reason,
            detail,
            record_id,
            warning,
            payload_size: message.payload.len(),
            duration_us: started.elapsed().as_micros() as u64,
            forwarded,
            dry_run,
        });
        self.metrics
            .set_audit_events_dropped(self.audit.dropped_events());
    }
}

/// Worker pool over a shared bounded queue.
pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    workers: Vec<JoinHandle<()>>,
    maintenance: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Start `worker_threads` workers draining `intake`.
    pub fn start(
        ctx: Arc<PipelineContext>,
        intake: mpsc::Receiver<Message>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let worker_count = ctx.config().performance.worker_threads;
        let shared_rx = Arc::new(tokio::sync::Mutex::new(intake));

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            workers.push(tokio::spawn(worker_loop(id, ctx.clone(), shared_rx.clone())));
        }
        info!(workers = worker_count, "pipeline started");

        let maintenance = vec![
            tokio::spawn(retention_loop(ctx.clone(), shutdown.clone())),
            tokio::spawn(reaper_loop(ctx.clone(), shutdown)),
        ];

        Self {
            ctx,
            workers,
            maintenance,
        }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Drain in-flight work up to `timeout`, then abandon it.
    pub async fn shutdown(self, timeout: Duration) {
        let drained = tokio::time::timeout(timeout, async {
            for worker in self.workers {
                let _ = worker.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("shutdown timeout reached, abandoning in-flight work");
        }
        for task in self.maintenance {
            task.abort();
        }
        self.ctx.audit.shutdown();
        info!("pipeline stopped");
    }
}

async fn worker_loop(
    id: usize,
    ctx: Arc<PipelineContext>,
    shared_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>,
) {
    debug!(worker = id, "worker started");
    loop {
        let message = {
            let mut rx = shared_rx.lock().await;
            let message = rx.recv().await;
            ctx.metrics.set_queue_depth(rx.len());
            match message {
                Some(m) => m,
                // Intake closed and drained: the subscriber is gone
                None => break,
            }
        };

        let deadline = ctx.config().global.message_timeout();
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            deadline,
            AssertUnwindSafe(ctx.process(message.clone())).catch_unwind(),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(_panic)) => {
                error!(worker = id, topic = %message.topic, "worker panicked processing message");
                ctx.drop_internal(&message, "panic during processing".to_string(), started);
            }
            Err(_elapsed) => {
                error!(
                    worker = id,
                    topic = %message.topic,
                    "message deadline exceeded"
                );
                ctx.drop_internal(
                    &message,
                    format!("processing exceeded {}s deadline", deadline.as_secs()),
                    started,
                );
            }
        }
    }
    debug!(worker = id, "worker stopped");
}

/// Periodic retention sweep: age-based purge plus size-ceiling eviction.
async fn retention_loop(ctx: Arc<PipelineContext>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(ctx.config().storage.quarantine.sweep_interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let store = ctx.store.clone();
        let result = tokio::task::spawn_blocking(move || {
            let stats = store.sweep()?;
            let bytes = store.total_payload_bytes()?;
            Ok::<_, crate::error::StoreError>((stats, bytes))
        })
        .await;

        match result {
            Ok(Ok((_stats, bytes))) => ctx.metrics.set_quarantine_bytes(bytes),
            Ok(Err(e)) => warn!(error = %e, "retention sweep failed"),
            Err(e) => warn!(error = %e, "retention sweep task failed"),
        }
        ctx.limiter.cleanup();
    }
}

/// Periodic orphaned-blob reaper.
async fn reaper_loop(ctx: Arc<PipelineContext>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(ctx.config().storage.payloads.reaper_interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let store = ctx.store.clone();
        if let Ok(Err(e)) = tokio::task::spawn_blocking(move || store.reap_orphans()).await {
            warn!(error = %e, "orphan reaper failed");
        }
    }
}
