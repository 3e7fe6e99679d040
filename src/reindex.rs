use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, bail};
use async_nats::jetstream;
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy, pull};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::{Client, ResourceExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::crd::{
    ActivityPolicy, Condition, PolicySelector, REASON_RETENTION_EXCEEDED, ReindexJob,
    ReindexJobStatus, ReindexPhase, ReindexProgress, TimeRange,
};
use crate::publisher::ActivityPublisher;
use crate::workers::{ActivityMatcher, RecordOutcome, evaluate_record};

/* ============================= CONFIG ============================= */

const REQUEUE_WHILE_HELD: Duration = Duration::from_secs(30);
const REQUEUE_WHILE_RUNNING: Duration = Duration::from_secs(30);
const REPLAY_FETCH_EXPIRES: Duration = Duration::from_secs(5);
const STATUS_RETRY_ATTEMPTS: usize = 3;
const STATUS_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const FIELD_MANAGER: &str = "activity-engine";

/* ============================= CLAIM ============================= */

/// Single-slot claim: only one reindex job may execute at a time across
/// the controller.
#[derive(Default)]
pub struct ReindexClaim {
    holder: Mutex<Option<String>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Acquired,
    AlreadyHeldBySelf,
    Held(String),
}

impl ReindexClaim {
    pub fn try_acquire(&self, name: &str) -> ClaimOutcome {
        let mut holder = self.holder.lock();
        match holder.as_deref() {
            None => {
                *holder = Some(name.to_string());
                ClaimOutcome::Acquired
            }
            Some(current) if current == name => ClaimOutcome::AlreadyHeldBySelf,
            Some(current) => ClaimOutcome::Held(current.to_string()),
        }
    }

    /// Release only if `name` is the current holder.
    pub fn release(&self, name: &str) {
        let mut holder = self.holder.lock();
        if holder.as_deref() == Some(name) {
            *holder = None;
        }
    }

    pub fn holder(&self) -> Option<String> {
        self.holder.lock().clone()
    }
}

/// Releases the claim when dropped, so the slot frees up on every exit
/// path of the replay worker, cancellation and panic included.
struct ClaimGuard {
    claim: Arc<ReindexClaim>,
    name: String,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.claim.release(&self.name);
    }
}

/* ============================= COORDINATOR ============================= */

pub struct ReindexCoordinator {
    client: Client,
    jetstream: jetstream::Context,
    matcher: Arc<dyn ActivityMatcher>,
    publisher: ActivityPublisher,
    config: EngineConfig,
    claim: Arc<ReindexClaim>,
    lifecycle: CancellationToken,
}

impl ReindexCoordinator {
    pub fn new(
        client: Client,
        jetstream: jetstream::Context,
        matcher: Arc<dyn ActivityMatcher>,
        publisher: ActivityPublisher,
        config: EngineConfig,
        lifecycle: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            jetstream,
            matcher,
            publisher,
            config,
            claim: Arc::new(ReindexClaim::default()),
            lifecycle,
        })
    }

    /// Run the ReindexJob controller until the stream ends or the future
    /// is dropped by the caller's shutdown select.
    pub async fn run(self: Arc<Self>) {
        let jobs: Api<ReindexJob> = Api::all(self.client.clone());

        info!("reindex_controller_started");
        Controller::new(jobs, Default::default())
            .run(reconcile, error_policy, self)
            .for_each(|result| async move {
                if let Err(e) = result {
                    warn!(error = %e, "reindex_dispatch_error");
                }
            })
            .await;
        info!("reindex_controller_stopped");
    }
}

/* ============================= RECONCILE ============================= */

async fn reconcile(
    job: Arc<ReindexJob>,
    ctx: Arc<ReindexCoordinator>,
) -> std::result::Result<Action, kube::Error> {
    let name = job.name_any();

    // Completed jobs only age out via their TTL.
    if matches!(
        job.status.as_ref().and_then(|s| s.phase.as_ref()),
        Some(ReindexPhase::Succeeded | ReindexPhase::Failed)
    ) {
        return handle_ttl(&job, &ctx).await;
    }

    // Gate: the requested window must be parseable and inside retention.
    let (start, end) = match parse_range(&job.spec.time_range) {
        Ok(range) => range,
        Err(e) => {
            warn!(job = %name, error = %e, "reindex_range_invalid");
            let status = terminal_status(ReindexPhase::Failed, format!("invalid time range: {e}"), None);
            update_status(&ctx.client, &name, &status).await?;
            return Ok(Action::await_change());
        }
    };

    if exceeds_retention(start, Utc::now(), ctx.config.reindex_retention) {
        info!(job = %name, "reindex_rejected_retention");
        let status = terminal_status(
            ReindexPhase::Failed,
            format!(
                "range start {} predates the {}-day retention window",
                job.spec.time_range.start,
                ctx.config.reindex_retention.as_secs() / 86_400
            ),
            Some(Condition {
                type_: "Terminal".to_string(),
                status: "True".to_string(),
                reason: Some(REASON_RETENTION_EXCEEDED.to_string()),
                message: Some("requested range predates the retention window".to_string()),
                last_transition_time: Some(Utc::now().to_rfc3339()),
            }),
        );
        update_status(&ctx.client, &name, &status).await?;
        return Ok(Action::await_change());
    }

    // Admission: one job at a time across the controller.
    match ctx.claim.try_acquire(&name) {
        ClaimOutcome::Held(holder) => {
            let status = ReindexJobStatus {
                phase: Some(ReindexPhase::Pending),
                message: Some(format!("waiting for running job '{holder}'")),
                ..Default::default()
            };
            update_status(&ctx.client, &name, &status).await?;
            return Ok(Action::requeue(REQUEUE_WHILE_HELD));
        }
        ClaimOutcome::AlreadyHeldBySelf => {
            // Worker is running; it owns progress updates.
            return Ok(Action::requeue(REQUEUE_WHILE_RUNNING));
        }
        ClaimOutcome::Acquired => {}
    }

    update_status(
        &ctx.client,
        &name,
        &ReindexJobStatus {
            phase: Some(ReindexPhase::Running),
            message: Some("replay started".to_string()),
            ..Default::default()
        },
    )
    .await?;

    info!(job = %name, start = %job.spec.time_range.start, end = %job.spec.time_range.end, "reindex_started");

    let guard = ClaimGuard {
        claim: ctx.claim.clone(),
        name: name.clone(),
    };
    let cancel = ctx.lifecycle.child_token();
    let worker_ctx = ctx.clone();
    let worker_job = job.clone();

    tokio::spawn(async move {
        // Claim released on every exit path, including cancellation.
        let _guard = guard;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                info!(job = %worker_job.name_any(), "reindex_cancelled");
                return;
            }
            outcome = run_replay(&worker_ctx, &worker_job, start, end) => outcome,
        };

        let name = worker_job.name_any();
        let status = match outcome {
            Ok(progress) => {
                info!(
                    job = %name,
                    processed = progress.processed,
                    activities = progress.activities_generated,
                    errors = progress.errors,
                    "reindex_succeeded"
                );
                completed_status(ReindexPhase::Succeeded, progress)
            }
            Err(e) => {
                warn!(job = %name, error = %e, "reindex_failed");
                terminal_status(ReindexPhase::Failed, e.to_string(), None)
            }
        };

        if let Err(e) = update_status(&worker_ctx.client, &name, &status).await {
            warn!(job = %name, error = %e, "reindex_status_update_failed");
        }
    });

    Ok(Action::requeue(REQUEUE_WHILE_RUNNING))
}

fn error_policy(
    _job: Arc<ReindexJob>,
    error: &kube::Error,
    _ctx: Arc<ReindexCoordinator>,
) -> Action {
    warn!(error = %error, "reindex_reconcile_error");
    Action::requeue(Duration::from_secs(60))
}

/* ============================= REPLAY WORKER ============================= */

async fn run_replay(
    ctx: &ReindexCoordinator,
    job: &ReindexJob,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> anyhow::Result<ReindexProgress> {
    let name = job.name_any();
    let job_config = job.spec.config.clone().unwrap_or_default();
    let batch_size = job_config
        .batch_size
        .map(|b| b as usize)
        .unwrap_or(ctx.config.reindex_batch_size);
    let rate_limit = job_config.rate_limit.unwrap_or(ctx.config.reindex_rate_limit);
    let dry_run = job_config.dry_run.unwrap_or(false);

    let selected = selected_policy_names(&ctx.client, job.spec.policy_selector.as_ref()).await?;

    let stream = ctx
        .jetstream
        .get_stream(&ctx.config.input_stream)
        .await
        .with_context(|| format!("input stream '{}' not found", ctx.config.input_stream))?;

    // Verify the sibling stream exists before scanning anything.
    ctx.jetstream
        .get_stream(&ctx.config.reindex_stream)
        .await
        .with_context(|| format!("reindex stream '{}' not found", ctx.config.reindex_stream))?;

    let start_time = time::OffsetDateTime::from_unix_timestamp(start.timestamp())
        .context("range start out of bounds")?;
    let end_time = time::OffsetDateTime::from_unix_timestamp(end.timestamp())
        .context("range end out of bounds")?;

    // Ephemeral scan cursor over the historical range; the server reaps
    // it once the replay stops fetching.
    let consumer = stream
        .create_consumer(pull::Config {
            deliver_policy: DeliverPolicy::ByStartTime { start_time },
            ack_policy: AckPolicy::None,
            ..Default::default()
        })
        .await
        .context("failed to create replay consumer")?;

    let total = consumer.cached_info().num_pending;
    let mut progress = ReindexProgress {
        total,
        total_batches: total.div_ceil(batch_size as u64).max(1),
        ..Default::default()
    };

    let mut done = false;
    while !done {
        let mut batch = consumer
            .fetch()
            .max_messages(batch_size)
            .expires(REPLAY_FETCH_EXPIRES)
            .messages()
            .await
            .context("replay fetch failed")?;

        let mut batch_len = 0usize;
        while let Some(next) = batch.next().await {
            let message = next.map_err(anyhow::Error::from_boxed).context("replay batch receive failed")?;

            if let Ok(meta) = message.info()
                && meta.published > end_time
            {
                done = true;
                break;
            }

            batch_len += 1;
            progress.processed += 1;

            let input: Value = match serde_json::from_slice(&message.payload) {
                Ok(input) => input,
                Err(_) => {
                    progress.errors += 1;
                    continue;
                }
            };

            match evaluate_record(ctx.matcher.as_ref(), &input) {
                RecordOutcome::Matched(matched) => {
                    if let Some(selected) = &selected
                        && !selected.contains(&matched.policy_name)
                    {
                        continue;
                    }
                    if dry_run {
                        progress.activities_generated += 1;
                    } else {
                        match ctx.publisher.publish_reindex(&matched.activity).await {
                            Ok(()) => progress.activities_generated += 1,
                            Err(e) => {
                                progress.errors += 1;
                                warn!(job = %name, error = %e, "reindex_publish_failed");
                            }
                        }
                    }
                }
                RecordOutcome::Failed(e) => {
                    progress.errors += 1;
                    warn!(job = %name, error = %e, "reindex_evaluation_failed");
                }
                RecordOutcome::Skipped(_) | RecordOutcome::NoMatch => {}
            }
        }

        // An empty fetch means the scan caught up with the stream head.
        if batch_len == 0 {
            done = true;
        } else {
            progress.current_batch += 1;
        }

        let status = ReindexJobStatus {
            phase: Some(ReindexPhase::Running),
            progress: Some(progress.clone()),
            ..Default::default()
        };
        if let Err(e) = update_status(&ctx.client, &name, &status).await {
            warn!(job = %name, error = %e, "reindex_progress_update_failed");
        }

        if !done {
            tokio::time::sleep(batch_delay(batch_len, rate_limit)).await;
        }
    }

    Ok(progress)
}

/// Pace the replay to `rate_limit` records per second.
fn batch_delay(batch_len: usize, rate_limit: u32) -> Duration {
    if rate_limit == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(batch_len as f64 / rate_limit as f64)
}

async fn selected_policy_names(
    client: &Client,
    selector: Option<&PolicySelector>,
) -> anyhow::Result<Option<HashSet<String>>> {
    let Some(selector) = selector else { return Ok(None) };
    if selector.names.is_empty() && selector.match_labels.is_empty() {
        return Ok(None);
    }

    let mut selected: HashSet<String> = selector.names.iter().cloned().collect();

    if !selector.match_labels.is_empty() {
        let policies: Api<ActivityPolicy> = Api::all(client.clone());
        for policy in policies.list(&ListParams::default()).await? {
            let labels = policy.metadata.labels.clone().unwrap_or_default();
            if selector
                .match_labels
                .iter()
                .all(|(k, v)| labels.get(k) == Some(v))
            {
                selected.insert(policy.name_any());
            }
        }
    }

    Ok(Some(selected))
}

/* ============================= TIME HANDLING ============================= */

fn parse_range(range: &TimeRange) -> anyhow::Result<(DateTime<Utc>, DateTime<Utc>)> {
    let start = DateTime::parse_from_rfc3339(&range.start)
        .with_context(|| format!("invalid start '{}'", range.start))?
        .with_timezone(&Utc);
    let end = DateTime::parse_from_rfc3339(&range.end)
        .with_context(|| format!("invalid end '{}'", range.end))?
        .with_timezone(&Utc);
    if end <= start {
        bail!("end '{}' is not after start '{}'", range.end, range.start);
    }
    Ok((start, end))
}

/// True when `start` predates the retention window ending at `now`.
fn exceeds_retention(start: DateTime<Utc>, now: DateTime<Utc>, retention: Duration) -> bool {
    let floor = now - chrono::Duration::seconds(retention.as_secs() as i64);
    start < floor
}

/// When a completed job expires, if ever.
fn ttl_expiry(job: &ReindexJob) -> Option<DateTime<Utc>> {
    let ttl = job.spec.ttl_seconds?;
    let completed_at = job.status.as_ref()?.completed_at.as_ref()?;
    let completed_at = DateTime::parse_from_rfc3339(completed_at).ok()?.with_timezone(&Utc);
    Some(completed_at + chrono::Duration::seconds(ttl))
}

async fn handle_ttl(
    job: &ReindexJob,
    ctx: &ReindexCoordinator,
) -> std::result::Result<Action, kube::Error> {
    let Some(expires_at) = ttl_expiry(job) else {
        // Absent TTL (or no completion stamp yet): retain forever.
        return Ok(Action::await_change());
    };

    let now = Utc::now();
    if expires_at <= now {
        let name = job.name_any();
        let jobs: Api<ReindexJob> = Api::all(ctx.client.clone());
        jobs.delete(&name, &Default::default()).await?;
        info!(job = %name, "reindex_job_expired");
        return Ok(Action::await_change());
    }

    let remaining = (expires_at - now)
        .to_std()
        .unwrap_or(Duration::from_secs(1));
    Ok(Action::requeue(remaining))
}

/* ============================= STATUS ============================= */

fn terminal_status(
    phase: ReindexPhase,
    message: String,
    condition: Option<Condition>,
) -> ReindexJobStatus {
    ReindexJobStatus {
        phase: Some(phase),
        message: Some(message),
        completed_at: Some(Utc::now().to_rfc3339()),
        conditions: condition.into_iter().collect(),
        ..Default::default()
    }
}

fn completed_status(phase: ReindexPhase, progress: ReindexProgress) -> ReindexJobStatus {
    ReindexJobStatus {
        phase: Some(phase),
        progress: Some(progress),
        completed_at: Some(Utc::now().to_rfc3339()),
        ..Default::default()
    }
}

/// Patch the job status, retrying bounded times on write conflicts.
async fn update_status(
    client: &Client,
    name: &str,
    status: &ReindexJobStatus,
) -> std::result::Result<(), kube::Error> {
    let jobs: Api<ReindexJob> = Api::all(client.clone());
    let patch = serde_json::json!({ "status": status });

    let mut attempt = 0;
    loop {
        match jobs
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 && attempt + 1 < STATUS_RETRY_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(STATUS_RETRY_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ReindexJobSpec;

    fn job_with(ttl_seconds: Option<i64>, completed_at: Option<&str>) -> ReindexJob {
        let mut job = ReindexJob::new(
            "replay-1",
            ReindexJobSpec {
                time_range: TimeRange {
                    start: "2026-06-01T00:00:00Z".to_string(),
                    end: "2026-06-02T00:00:00Z".to_string(),
                },
                config: None,
                policy_selector: None,
                ttl_seconds,
            },
        );
        if let Some(ts) = completed_at {
            job.status = Some(ReindexJobStatus {
                phase: Some(ReindexPhase::Succeeded),
                completed_at: Some(ts.to_string()),
                ..Default::default()
            });
        }
        job
    }

    #[test]
    fn test_claim_single_slot() {
        let claim = ReindexClaim::default();
        assert_eq!(claim.try_acquire("a"), ClaimOutcome::Acquired);
        assert_eq!(claim.try_acquire("b"), ClaimOutcome::Held("a".to_string()));
        assert_eq!(claim.try_acquire("a"), ClaimOutcome::AlreadyHeldBySelf);
    }

    #[test]
    fn test_claim_release_frees_slot() {
        let claim = ReindexClaim::default();
        claim.try_acquire("a");
        claim.release("a");
        assert_eq!(claim.try_acquire("b"), ClaimOutcome::Acquired);
    }

    #[test]
    fn test_claim_release_ignores_non_holder() {
        let claim = ReindexClaim::default();
        claim.try_acquire("a");
        claim.release("b");
        assert_eq!(claim.holder(), Some("a".to_string()));
    }

    #[test]
    fn test_claim_guard_releases_on_drop() {
        let claim = Arc::new(ReindexClaim::default());
        claim.try_acquire("a");
        {
            let _guard = ClaimGuard {
                claim: claim.clone(),
                name: "a".to_string(),
            };
        }
        assert_eq!(claim.holder(), None);
    }

    #[test]
    fn test_parse_range_valid() {
        let (start, end) = parse_range(&TimeRange {
            start: "2026-06-01T00:00:00Z".to_string(),
            end: "2026-06-02T00:00:00Z".to_string(),
        })
        .expect("should parse");
        assert!(end > start);
    }

    #[test]
    fn test_parse_range_rejects_inverted() {
        let result = parse_range(&TimeRange {
            start: "2026-06-02T00:00:00Z".to_string(),
            end: "2026-06-01T00:00:00Z".to_string(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_range_rejects_garbage() {
        let result = parse_range(&TimeRange {
            start: "yesterday".to_string(),
            end: "2026-06-01T00:00:00Z".to_string(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_retention_gate() {
        let now = Utc::now();
        let retention = Duration::from_secs(60 * 24 * 60 * 60);

        let recent = now - chrono::Duration::days(10);
        assert!(!exceeds_retention(recent, now, retention));

        let ancient = now - chrono::Duration::days(90);
        assert!(exceeds_retention(ancient, now, retention));
    }

    #[test]
    fn test_ttl_expiry_absent_ttl_is_forever() {
        let job = job_with(None, Some("2026-06-01T00:00:00Z"));
        assert!(ttl_expiry(&job).is_none());
    }

    #[test]
    fn test_ttl_expiry_computed_from_completion() {
        let job = job_with(Some(3600), Some("2026-06-01T00:00:00Z"));
        let expiry = ttl_expiry(&job).expect("should compute");
        assert_eq!(expiry.to_rfc3339(), "2026-06-01T01:00:00+00:00");
    }

    #[test]
    fn test_ttl_expiry_requires_completion_stamp() {
        let job = job_with(Some(3600), None);
        assert!(ttl_expiry(&job).is_none());
    }

    #[test]
    fn test_batch_delay_paces_to_rate() {
        assert_eq!(batch_delay(100, 100), Duration::from_secs(1));
        assert_eq!(batch_delay(50, 100), Duration::from_millis(500));
        assert_eq!(batch_delay(0, 100), Duration::ZERO);
        assert_eq!(batch_delay(1000, 0), Duration::ZERO);
    }

    #[test]
    fn test_terminal_status_carries_condition() {
        let status = terminal_status(
            ReindexPhase::Failed,
            "too old".to_string(),
            Some(Condition {
                type_: "Terminal".to_string(),
                status: "True".to_string(),
                reason: Some(REASON_RETENTION_EXCEEDED.to_string()),
                message: None,
                last_transition_time: None,
            }),
        );
        assert_eq!(status.phase, Some(ReindexPhase::Failed));
        assert!(status.completed_at.is_some());
        assert_eq!(
            status.conditions[0].reason.as_deref(),
            Some(REASON_RETENTION_EXCEEDED)
        );
    }
}
