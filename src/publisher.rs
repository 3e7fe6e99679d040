use async_nats::jetstream;

use crate::activity::Activity;
use crate::error::{EngineError, Result};
use crate::metrics::{MESSAGES_PUBLISHED, PUBLISH_LATENCY};

/* ============================= SUBJECTS ============================= */

const PLACEHOLDER: &str = "_";
const DEFAULT_TENANT_TYPE: &str = "platform";
const DEFAULT_API_GROUP: &str = "core";

/// Sanitize one subject token: `.` becomes `-` (dots are segment
/// separators on the bus), anything else outside `[A-Za-z0-9_-]`
/// becomes `_`.
pub fn sanitize_token(token: &str) -> String {
    token
        .chars()
        .map(|c| match c {
            '.' => '-',
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => c,
            _ => '_',
        })
        .collect()
}

fn token_or(token: &str, fallback: &str) -> String {
    if token.is_empty() {
        fallback.to_string()
    } else {
        sanitize_token(token)
    }
}

/// Routing subject for a live activity:
/// `<prefix>.<tenantType>.<tenantName>.<apiGroup>.<origin>.<kind>.<namespace>.<name>`
/// with `platform` / `core` / `_` standing in for absent tokens. The
/// final token is the target resource's name; uniqueness lives in the
/// message id, not the subject.
pub fn activity_subject(prefix: &str, activity: &Activity) -> String {
    format!(
        "{}.{}.{}.{}.{}.{}.{}.{}",
        prefix,
        token_or(&activity.tenant.type_, DEFAULT_TENANT_TYPE),
        token_or(&activity.tenant.name, PLACEHOLDER),
        token_or(&activity.resource.api_group, DEFAULT_API_GROUP),
        activity.origin.type_.as_str(),
        token_or(&activity.resource.kind, PLACEHOLDER),
        token_or(&activity.resource.namespace, PLACEHOLDER),
        token_or(&activity.resource.name, PLACEHOLDER),
    )
}

/// Routing subject for a reindexed activity:
/// `reindex.<tenantType>.<apiGroup>.<kind>`.
pub fn reindex_subject(activity: &Activity) -> String {
    format!(
        "reindex.{}.{}.{}",
        token_or(&activity.tenant.type_, DEFAULT_TENANT_TYPE),
        token_or(&activity.resource.api_group, DEFAULT_API_GROUP),
        token_or(&activity.resource.kind, PLACEHOLDER),
    )
}

/* ============================= PUBLISHER ============================= */

/// Serializes activities and publishes them with a stable message id.
///
/// The id equals the activity's name, so the output stream's
/// content-addressed dedup collapses redeliveries silently.
#[derive(Clone)]
pub struct ActivityPublisher {
    jetstream: jetstream::Context,
    prefix: String,
}

impl ActivityPublisher {
    pub fn new(jetstream: jetstream::Context, prefix: impl Into<String>) -> Self {
        Self {
            jetstream,
            prefix: prefix.into(),
        }
    }

    /// Publish onto the live activities stream.
    pub async fn publish(&self, activity: &Activity) -> Result<()> {
        self.publish_to(activity_subject(&self.prefix, activity), activity)
            .await
    }

    /// Publish onto the sibling reindex stream.
    pub async fn publish_reindex(&self, activity: &Activity) -> Result<()> {
        self.publish_to(reindex_subject(activity), activity).await
    }

    async fn publish_to(&self, subject: String, activity: &Activity) -> Result<()> {
        let payload = serde_json::to_vec(activity)?;

        let mut headers = async_nats::HeaderMap::new();
        headers.insert(async_nats::header::NATS_MESSAGE_ID, activity.name.as_str());

        let timer = PUBLISH_LATENCY.start_timer();
        let ack = self
            .jetstream
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| EngineError::Publish {
                subject: subject.clone(),
                reason: e.to_string(),
            })?;
        ack.await.map_err(|e| EngineError::Publish {
            subject,
            reason: e.to_string(),
        })?;
        timer.observe_duration();

        MESSAGES_PUBLISHED.inc();
        Ok(())
    }
}

/* ============================= TESTS ============================= */
