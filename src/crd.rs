use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/* ============================= CONDITION TYPES ============================= */

/// Status condition attached to a policy or reindex job.
///
/// Mirrors the upstream condition convention: `type` + `status` ("True" /
/// "False" / "Unknown") with a machine-readable reason.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

pub const CONDITION_READY: &str = "Ready";
pub const REASON_RETENTION_EXCEEDED: &str = "RetentionWindowExceeded";

/* ============================= ACTIVITY POLICY ============================= */

/// The resource type a policy applies to.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTarget {
    /// API group of the target resource. Empty string means the core group.
    #[serde(default)]
    pub api_group: String,

    /// Singular kind of the target resource (e.g. "Pod").
    pub kind: String,
}

/// A single `(match, summary)` rule.
///
/// `match` is a CEL expression returning a boolean. `summary` is literal
/// text with zero or more `{{ expr }}` substitutions.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    #[serde(rename = "match")]
    pub match_expression: String,

    pub summary: String,
}

/// ActivityPolicy declares how audit records and cluster events for one
/// target resource type are turned into activity summaries.
///
/// Rules are ordered; the first rule whose `match` evaluates true wins.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "activity.stochastic.io",
    version = "v1",
    kind = "ActivityPolicy",
    plural = "activitypolicies",
    status = "ActivityPolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPolicySpec {
    /// Target apiGroup/kind this policy applies to.
    pub target: PolicyTarget,

    /// Rules evaluated against audit records.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audit_rules: Vec<PolicyRule>,

    /// Rules evaluated against cluster events.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_rules: Vec<PolicyRule>,
}

/// Status reported by the control-plane reconciler.
///
/// The engine only reads the `Ready` condition; everything else is owned
/// by the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ActivityPolicy {
    /// A policy is admitted into the engine only while `Ready=True`.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.type_ == CONDITION_READY && c.status == "True")
            })
            .unwrap_or(false)
    }
}

/* ============================= REINDEX JOB ============================= */

/// Half-open historical range to replay, RFC 3339 timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

/// Tuning knobs for a reindex run. Omitted fields fall back to the engine
/// configuration defaults.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReindexConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,

    /// Records per second the replay is throttled to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,

    /// When true, evaluate everything but skip the publish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
}

/// Restricts the replay to a subset of policies.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicySelector {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

/// ReindexJob requests a bounded historical replay of audit records onto
/// the reindex output stream.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "activity.stochastic.io",
    version = "v1",
    kind = "ReindexJob",
    plural = "reindexjobs",
    status = "ReindexJobStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ReindexJobSpec {
    pub time_range: TimeRange,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ReindexConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_selector: Option<PolicySelector>,

    /// Seconds to retain the job after completion. Absent means forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,
}

/// Lifecycle phase of a reindex job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ReindexPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Progress counters written periodically while a job runs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReindexProgress {
    pub total: u64,
    pub processed: u64,
    pub activities_generated: u64,
    pub errors: u64,
    pub current_batch: u64,
    pub total_batches: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReindexJobStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ReindexPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ReindexProgress>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn ready_condition(status: &str) -> Condition {
        Condition {
            type_: CONDITION_READY.to_string(),
            status: status.to_string(),
            reason: None,
            message: None,
            last_transition_time: None,
        }
    }

    #[test]
    fn test_policy_crd_generates_valid_yaml() {
        let crd = ActivityPolicy::crd();
        let yaml = serde_yaml::to_string(&crd).expect("CRD should serialize to YAML");
        assert!(yaml.contains("activity.stochastic.io"));
        assert!(yaml.contains("ActivityPolicy"));
        assert!(yaml.contains("activitypolicies"));
    }

    #[test]
    fn test_policy_crd_api_group() {
        let crd = ActivityPolicy::crd();
        assert_eq!(crd.spec.group, "activity.stochastic.io");
    }

    #[test]
    fn test_policy_crd_is_cluster_scoped() {
        let crd = ActivityPolicy::crd();
        assert_eq!(crd.spec.scope, "Cluster");
    }

    #[test]
    fn test_policy_spec_serialization_roundtrip() {
        let spec = ActivityPolicySpec {
            target: PolicyTarget {
                api_group: "apps".to_string(),
                kind: "Deployment".to_string(),
            },
            audit_rules: vec![PolicyRule {
                match_expression: "audit.verb == 'create'".to_string(),
                summary: "deployment {{ audit.objectRef.name }} created".to_string(),
            }],
            event_rules: vec![],
        };

        let json = serde_json::to_string(&spec).expect("should serialize");
        assert!(json.contains(r#""match":"audit.verb == 'create'""#));
        assert!(json.contains(r#""apiGroup":"apps""#));
        assert!(!json.contains("eventRules"));

        let deserialized: ActivityPolicySpec =
            serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(deserialized.target.kind, "Deployment");
        assert_eq!(deserialized.audit_rules.len(), 1);
        assert!(deserialized.event_rules.is_empty());
    }

    #[test]
    fn test_policy_spec_core_group_defaults_empty() {
        let json = r#"{"target":{"kind":"Pod"}}"#;
        let spec: ActivityPolicySpec = serde_json::from_str(json).expect("should deserialize");
        assert_eq!(spec.target.api_group, "");
        assert_eq!(spec.target.kind, "Pod");
        assert!(spec.audit_rules.is_empty());
    }

    #[test]
    fn test_is_ready_true_condition() {
        let mut policy = ActivityPolicy::new("p", ActivityPolicySpec::default());
        policy.status = Some(ActivityPolicyStatus {
            observed_generation: Some(1),
            conditions: vec![ready_condition("True")],
        });
        assert!(policy.is_ready());
    }

    #[test]
    fn test_is_ready_false_condition() {
        let mut policy = ActivityPolicy::new("p", ActivityPolicySpec::default());
        policy.status = Some(ActivityPolicyStatus {
            observed_generation: None,
            conditions: vec![ready_condition("False")],
        });
        assert!(!policy.is_ready());
    }

    #[test]
    fn test_is_ready_no_status() {
        let policy = ActivityPolicy::new("p", ActivityPolicySpec::default());
        assert!(!policy.is_ready());
    }

    #[test]
    fn test_is_ready_other_condition_type_ignored() {
        let mut policy = ActivityPolicy::new("p", ActivityPolicySpec::default());
        policy.status = Some(ActivityPolicyStatus {
            observed_generation: None,
            conditions: vec![Condition {
                type_: "Compiled".to_string(),
                status: "True".to_string(),
                reason: None,
                message: None,
                last_transition_time: None,
            }],
        });
        assert!(!policy.is_ready());
    }

    #[test]
    fn test_reindex_crd_generates_valid_yaml() {
        let crd = ReindexJob::crd();
        let yaml = serde_yaml::to_string(&crd).expect("CRD should serialize to YAML");
        assert!(yaml.contains("activity.stochastic.io"));
        assert!(yaml.contains("ReindexJob"));
        assert!(yaml.contains("reindexjobs"));
    }

    #[test]
    fn test_reindex_phase_serializes_camel_case() {
        let json = serde_json::to_string(&ReindexPhase::Succeeded).expect("should serialize");
        assert_eq!(json, r#""succeeded""#);
        let phase: ReindexPhase = serde_json::from_str(r#""running""#).expect("should deserialize");
        assert_eq!(phase, ReindexPhase::Running);
    }

    #[test]
    fn test_reindex_spec_roundtrip() {
        let spec = ReindexJobSpec {
            time_range: TimeRange {
                start: "2026-06-01T00:00:00Z".to_string(),
                end: "2026-06-02T00:00:00Z".to_string(),
            },
            config: Some(ReindexConfig {
                batch_size: Some(500),
                rate_limit: Some(50),
                dry_run: Some(true),
            }),
            policy_selector: None,
            ttl_seconds: Some(3600),
        };

        let json = serde_json::to_string(&spec).expect("should serialize");
        assert!(json.contains("timeRange"));
        assert!(json.contains("batchSize"));
        assert!(json.contains("ttlSeconds"));

        let deserialized: ReindexJobSpec = serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(deserialized.config.unwrap().batch_size, Some(500));
        assert_eq!(deserialized.ttl_seconds, Some(3600));
    }

    #[test]
    fn test_reindex_status_defaults_empty() {
        let status = ReindexJobStatus::default();
        let json = serde_json::to_string(&status).expect("should serialize");
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_two_crds_different_names() {
        let policy_crd = ActivityPolicy::crd();
        let reindex_crd = ReindexJob::crd();
        assert_ne!(policy_crd.spec.names.kind, reindex_crd.spec.names.kind);
        assert_ne!(policy_crd.spec.names.plural, reindex_crd.spec.names.plural);
    }
}
