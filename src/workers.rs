use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use async_nats::jetstream;
use async_nats::jetstream::AckKind;
use async_nats::jetstream::consumer::PullConsumer;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::{self, Activity};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::WarningSink;
use crate::health::HealthState;
use crate::lookup::MatchedPolicy;
use crate::metrics::{
    ACTIVE_WORKERS, ACTIVITIES_GENERATED, BUS_ERRORS, ERROR_EVALUATE, ERROR_PUBLISH,
    ERROR_UNMARSHAL, INPUTS_RECEIVED, MESSAGES_ERRORED, MESSAGES_SKIPPED, POLICIES_EVALUATED,
    PROCESSING_DURATION, SKIP_NO_MATCHING_POLICY, SKIP_NO_OBJECT_REF,
};
use crate::publisher::ActivityPublisher;

/* ============================= MATCHER TRAIT ============================= */

/// Lookup surface the pool evaluates against.
///
/// Declared here, next to its consumer; the cache module ships the
/// adapter implementing it. That keeps the dependency arrow pointing
/// from the cache toward the pool instead of the other way around.
pub trait ActivityMatcher: Send + Sync {
    fn match_audit(
        &self,
        api_group: &str,
        resource: &str,
        audit: &Value,
    ) -> Result<Option<MatchedPolicy>>;

    fn match_event(
        &self,
        api_group: &str,
        kind: &str,
        event: &Value,
    ) -> Result<Option<MatchedPolicy>>;
}

/* ============================= RECORD PIPELINE ============================= */

/// What kind of record a bus payload is, and where it routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRecord {
    Audit { api_group: String, resource: String },
    Event { api_group: String, kind: String },
    MissingObjectRef,
}

/// Classify a decoded payload. Audit records route by plural resource,
/// cluster events by kind; records without an object reference are
/// skipped before any lookup.
pub fn classify_input(input: &Value) -> InputRecord {
    if input.get("auditID").is_some() || input.get("objectRef").is_some() {
        return match activity::audit_resource(input) {
            Some((api_group, resource)) => InputRecord::Audit { api_group, resource },
            None => InputRecord::MissingObjectRef,
        };
    }
    if input.get("regarding").is_some() || input.get("involvedObject").is_some() {
        return match activity::event_kind(input) {
            Some((api_group, kind)) => InputRecord::Event { api_group, kind },
            None => InputRecord::MissingObjectRef,
        };
    }
    InputRecord::MissingObjectRef
}

/// A matched record ready to publish.
#[derive(Debug)]
pub struct MatchedRecord {
    pub policy_name: String,
    pub activity: Activity,
}

/// Outcome of running one decoded record through the matcher.
#[derive(Debug)]
pub enum RecordOutcome {
    /// Skipped before evaluation; carries the skip-counter reason.
    Skipped(&'static str),
    /// Policies exist but none matched.
    NoMatch,
    /// First matching policy produced an activity.
    Matched(Box<MatchedRecord>),
    /// Evaluation failed; the message is not retried.
    Failed(EngineError),
}

/// Evaluate one decoded record against the cached policies.
pub fn evaluate_record(matcher: &dyn ActivityMatcher, input: &Value) -> RecordOutcome {
    match classify_input(input) {
        InputRecord::MissingObjectRef => RecordOutcome::Skipped(SKIP_NO_OBJECT_REF),

        InputRecord::Audit { api_group, resource } => {
            INPUTS_RECEIVED.with_label_values(&[&api_group, &resource]).inc();
            match matcher.match_audit(&api_group, &resource, input) {
                Ok(Some(matched)) => {
                    POLICIES_EVALUATED
                        .with_label_values(&[&matched.policy_name, &api_group, &matched.kind, "true"])
                        .inc();
                    RecordOutcome::Matched(Box::new(MatchedRecord {
                        activity: activity::activity_from_audit(input, &matched),
                        policy_name: matched.policy_name,
                    }))
                }
                Ok(None) => RecordOutcome::NoMatch,
                Err(e) => record_failure(&api_group, e),
            }
        }

        InputRecord::Event { api_group, kind } => {
            INPUTS_RECEIVED.with_label_values(&[&api_group, &kind]).inc();
            match matcher.match_event(&api_group, &kind, input) {
                Ok(Some(matched)) => {
                    POLICIES_EVALUATED
                        .with_label_values(&[&matched.policy_name, &api_group, &matched.kind, "true"])
                        .inc();
                    RecordOutcome::Matched(Box::new(MatchedRecord {
                        activity: activity::activity_from_event(input, &matched),
                        policy_name: matched.policy_name,
                    }))
                }
                Ok(None) => RecordOutcome::NoMatch,
                Err(e) => record_failure(&api_group, e),
            }
        }
    }
}

fn record_failure(api_group: &str, error: EngineError) -> RecordOutcome {
    if let EngineError::Evaluation { policy, .. } = &error {
        POLICIES_EVALUATED
            .with_label_values(&[policy, api_group, "", "error"])
            .inc();
    }
    RecordOutcome::Failed(error)
}

/* ============================= WORKER POOL ============================= */

/// Fixed pool of workers pull-subscribed to the shared durable consumer.
pub struct WorkerPool {
    jetstream: jetstream::Context,
    matcher: Arc<dyn ActivityMatcher>,
    publisher: ActivityPublisher,
    warnings: WarningSink,
    health: Arc<HealthState>,
    config: EngineConfig,
}

impl WorkerPool {
    pub fn new(
        jetstream: jetstream::Context,
        matcher: Arc<dyn ActivityMatcher>,
        publisher: ActivityPublisher,
        warnings: WarningSink,
        health: Arc<HealthState>,
        config: EngineConfig,
    ) -> Self {
        Self {
            jetstream,
            matcher,
            publisher,
            warnings,
            health,
            config,
        }
    }

    /// Probe the bus resources and launch the workers.
    ///
    /// The durable consumer and both streams are managed declaratively
    /// outside the engine; their absence is a fatal configuration error,
    /// never something to create on the fly.
    pub async fn start(&self, shutdown: &broadcast::Sender<()>) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let stream = self
            .jetstream
            .get_stream(&self.config.input_stream)
            .await
            .with_context(|| format!("input stream '{}' not found", self.config.input_stream))?;

        let consumer: PullConsumer = stream
            .get_consumer(&self.config.durable_consumer)
            .await
            .map_err(anyhow::Error::from_boxed)
            .with_context(|| {
                format!(
                    "durable consumer '{}' not found on stream '{}'",
                    self.config.durable_consumer, self.config.input_stream
                )
            })?;

        self.jetstream
            .get_stream(&self.config.output_stream)
            .await
            .with_context(|| format!("output stream '{}' not found", self.config.output_stream))?;

        info!(
            workers = self.config.worker_count,
            batch_size = self.config.batch_size,
            consumer = %self.config.durable_consumer,
            "worker_pool_starting"
        );

        let mut handles = Vec::with_capacity(self.config.worker_count);
        for id in 0..self.config.worker_count {
            handles.push(tokio::spawn(worker_loop(
                id,
                consumer.clone(),
                self.matcher.clone(),
                self.publisher.clone(),
                self.warnings.clone(),
                self.config.clone(),
                shutdown.subscribe(),
            )));
        }

        self.health.set_pool_running(true);
        Ok(handles)
    }
}

async fn worker_loop(
    id: usize,
    consumer: PullConsumer,
    matcher: Arc<dyn ActivityMatcher>,
    publisher: ActivityPublisher,
    warnings: WarningSink,
    config: EngineConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    ACTIVE_WORKERS.inc();
    info!(worker = id, "worker_started");

    loop {
        let fetch = consumer
            .fetch()
            .max_messages(config.batch_size)
            .expires(config.fetch_wait)
            .messages();

        tokio::select! {
            _ = shutdown.recv() => break,

            batch = fetch => {
                let mut batch = match batch {
                    Ok(batch) => batch,
                    Err(e) => {
                        BUS_ERRORS.inc();
                        warn!(worker = id, error = %e, "fetch_failed");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };

                while let Some(next) = batch.next().await {
                    match next {
                        Ok(message) => {
                            process_message(&message, matcher.as_ref(), &publisher, &warnings).await;
                        }
                        Err(e) => {
                            BUS_ERRORS.inc();
                            warn!(worker = id, error = %e, "batch_receive_failed");
                            break;
                        }
                    }
                }
            }
        }
    }

    ACTIVE_WORKERS.dec();
    info!(worker = id, "worker_stopped");
}

/// Per-message pipeline: decode, classify, evaluate, publish, ack.
async fn process_message(
    message: &jetstream::Message,
    matcher: &dyn ActivityMatcher,
    publisher: &ActivityPublisher,
    warnings: &WarningSink,
) {
    let input: Value = match serde_json::from_slice(&message.payload) {
        Ok(input) => input,
        Err(e) => {
            MESSAGES_ERRORED.with_label_values(&[ERROR_UNMARSHAL]).inc();
            debug!(error = %e, "payload_decode_failed");
            nak(message).await;
            return;
        }
    };

    let started = Instant::now();
    match evaluate_record(matcher, &input) {
        RecordOutcome::Skipped(reason) => {
            MESSAGES_SKIPPED.with_label_values(&[reason]).inc();
            ack(message).await;
        }

        RecordOutcome::NoMatch => {
            MESSAGES_SKIPPED.with_label_values(&[SKIP_NO_MATCHING_POLICY]).inc();
            ack(message).await;
        }

        RecordOutcome::Failed(error) => {
            MESSAGES_ERRORED.with_label_values(&[ERROR_EVALUATE]).inc();
            if let EngineError::Evaluation { policy, rule_index, .. } = &error {
                warnings.emit(policy, *rule_index, &error);
            }
            warn!(error = %error, "evaluation_failed");
            // The message advances; evaluation errors are not retried.
            ack(message).await;
        }

        RecordOutcome::Matched(matched) => {
            match publisher.publish(&matched.activity).await {
                Ok(()) => {
                    ACTIVITIES_GENERATED.with_label_values(&[&matched.policy_name]).inc();
                    PROCESSING_DURATION
                        .with_label_values(&[&matched.policy_name])
                        .observe(started.elapsed().as_secs_f64());
                    ack(message).await;
                }
                Err(e) => {
                    MESSAGES_ERRORED.with_label_values(&[ERROR_PUBLISH]).inc();
                    warn!(error = %e, activity = %matched.activity.name, "publish_failed");
                    nak(message).await;
                }
            }
        }
    }
}

async fn ack(message: &jetstream::Message) {
    if let Err(e) = message.ack().await {
        warn!(error = %e, "ack_failed");
    }
}

async fn nak(message: &jetstream::Message) {
    if let Err(e) = message.ack_with(AckKind::Nak(None)).await {
        warn!(error = %e, "nak_failed");
    }
}

/* ============================= TESTS ============================= */
