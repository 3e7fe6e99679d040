use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::lookup::MatchedPolicy;

/* ============================= OUTPUT RECORD ============================= */

/// Where the activity originated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum OriginType {
    Audit,
    Event,
}

impl OriginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginType::Audit => "audit",
            OriginType::Event => "event",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    #[serde(rename = "type")]
    pub type_: OriginType,
}

/// Whether a human or an automated component made the change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ChangeSource {
    Human,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TenantRef {
    #[serde(rename = "type", default)]
    pub type_: String,

    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    #[serde(default)]
    pub api_group: String,

    #[serde(default)]
    pub kind: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActorRef {
    #[serde(rename = "type", default)]
    pub type_: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
}

/// A marker/resource pair captured by the `link()` builtin during summary
/// evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLink {
    pub marker: String,

    /// Resource reference coerced to a string-keyed mapping; empty object
    /// when the `ref` argument was not a mapping.
    pub resource: Value,
}

/// Normalized record published to the activities stream.
///
/// `name` is stable and deterministic per input record; it doubles as the
/// bus message id so redeliveries dedupe at the output stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub name: String,
    pub tenant: TenantRef,
    pub resource: ResourceRef,
    pub origin: Origin,
    pub actor: ActorRef,
    pub change_source: ChangeSource,
    pub summary: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<ActivityLink>,

    pub observed_at: String,
}

/* ============================= ACTOR CLASSIFICATION ============================= */

pub const ACTOR_USER: &str = "user";
pub const ACTOR_SERVICE_ACCOUNT: &str = "serviceaccount";
pub const ACTOR_SYSTEM: &str = "system";
pub const ACTOR_UNKNOWN: &str = "unknown";
pub const ACTOR_CONTROLLER: &str = "controller";

/// Classify an audit username into an actor type.
pub fn classify_username(username: &str) -> &'static str {
    if username.is_empty() {
        ACTOR_UNKNOWN
    } else if username.starts_with("system:serviceaccount:") {
        ACTOR_SERVICE_ACCOUNT
    } else if username.starts_with("system:") {
        ACTOR_SYSTEM
    } else {
        ACTOR_USER
    }
}

/// The actor string for an audit record: `user.username`.
pub fn audit_actor(audit: &Value) -> String {
    audit
        .pointer("/user/username")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// The actor string for a cluster event: `reportingController`, falling
/// back to `source.component`.
pub fn event_actor(event: &Value) -> String {
    event
        .get("reportingController")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| event.pointer("/source/component").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

pub fn audit_actor_ref(audit: &Value) -> ActorRef {
    let username = audit_actor(audit);
    let uid = audit
        .pointer("/user/uid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    ActorRef {
        type_: classify_username(&username).to_string(),
        name: username,
        uid,
    }
}

pub fn event_actor_ref(event: &Value) -> ActorRef {
    ActorRef {
        type_: ACTOR_CONTROLLER.to_string(),
        name: event_actor(event),
        uid: String::new(),
    }
}

fn change_source_for(actor_type: &str) -> ChangeSource {
    if actor_type == ACTOR_USER {
        ChangeSource::Human
    } else {
        ChangeSource::System
    }
}

/* ============================= INPUT ACCESSORS ============================= */

fn str_at<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
}

/// The `objectRef` of an audit record, or `None` when the record carries
/// no object reference at all.
pub fn audit_object_ref(audit: &Value) -> Option<ResourceRef> {
    let object_ref = audit.get("objectRef")?;
    if !object_ref.is_object() {
        return None;
    }
    Some(ResourceRef {
        api_group: str_at(object_ref, "/apiGroup").to_string(),
        // Audit object references carry the plural resource, not the kind.
        kind: str_at(object_ref, "/resource").to_string(),
        namespace: str_at(object_ref, "/namespace").to_string(),
        name: str_at(object_ref, "/name").to_string(),
        uid: str_at(object_ref, "/uid").to_string(),
    })
}

/// The plural resource name an audit record targets.
pub fn audit_resource(audit: &Value) -> Option<(String, String)> {
    let object_ref = audit.get("objectRef")?;
    let resource = str_at(object_ref, "/resource");
    if resource.is_empty() {
        return None;
    }
    Some((str_at(object_ref, "/apiGroup").to_string(), resource.to_string()))
}

/// Group extracted from an `apiVersion` string: `"apps/v1"` → `"apps"`,
/// `"v1"` → `""`.
fn group_of_api_version(api_version: &str) -> &str {
    match api_version.rsplit_once('/') {
        Some((group, _)) => group,
        None => "",
    }
}

/// The involved-object reference of a cluster event (`regarding` for
/// events.k8s.io records, `involvedObject` for core records).
pub fn event_object_ref(event: &Value) -> Option<ResourceRef> {
    let involved = event.get("regarding").or_else(|| event.get("involvedObject"))?;
    if !involved.is_object() {
        return None;
    }
    let api_group = {
        let explicit = str_at(involved, "/apiGroup");
        if explicit.is_empty() {
            group_of_api_version(str_at(involved, "/apiVersion")).to_string()
        } else {
            explicit.to_string()
        }
    };
    Some(ResourceRef {
        api_group,
        kind: str_at(involved, "/kind").to_string(),
        namespace: str_at(involved, "/namespace").to_string(),
        name: str_at(involved, "/name").to_string(),
        uid: str_at(involved, "/uid").to_string(),
    })
}

/// The group/kind a cluster event targets.
pub fn event_kind(event: &Value) -> Option<(String, String)> {
    let resource = event_object_ref(event)?;
    if resource.kind.is_empty() {
        return None;
    }
    Some((resource.api_group.clone(), resource.kind))
}

fn tenant_of(input: &Value) -> TenantRef {
    TenantRef {
        type_: str_at(input, "/tenant/type").to_string(),
        name: str_at(input, "/tenant/name").to_string(),
    }
}

fn first_str<'a>(input: &'a Value, pointers: &[&str]) -> Option<&'a str> {
    pointers
        .iter()
        .find_map(|p| input.pointer(p).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

/* ============================= STABLE NAME ============================= */

/// Deterministic fallback identifier: hex of the record's content hash.
fn content_hash(input: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Stable activity name for an audit record, derived from `auditID`.
pub fn audit_activity_name(audit: &Value) -> String {
    match audit.get("auditID").and_then(Value::as_str).filter(|s| !s.is_empty()) {
        Some(id) => id.to_string(),
        None => content_hash(audit),
    }
}

/// Stable activity name for a cluster event, derived from the event uid.
pub fn event_activity_name(event: &Value) -> String {
    match first_str(event, &["/metadata/uid", "/uid"]) {
        Some(uid) => uid.to_string(),
        None => content_hash(event),
    }
}

/* ============================= BUILDERS ============================= */

/// Assemble the activity for a matched audit record.
pub fn activity_from_audit(audit: &Value, matched: &MatchedPolicy) -> Activity {
    let actor = audit_actor_ref(audit);
    let mut resource = audit_object_ref(audit).unwrap_or_default();
    // The routable record carries the kind the policy targeted, not the
    // plural resource from the object reference.
    resource.kind = matched.kind.clone();
    resource.api_group = matched.api_group.clone();

    let observed_at = first_str(audit, &["/stageTimestamp", "/requestReceivedTimestamp"])
        .map(str::to_string)
        .unwrap_or_else(|| Utc::now().to_rfc3339());

    Activity {
        name: audit_activity_name(audit),
        tenant: tenant_of(audit),
        resource,
        origin: Origin { type_: OriginType::Audit },
        change_source: change_source_for(&actor.type_),
        actor,
        summary: matched.summary.clone(),
        links: matched.links.clone(),
        observed_at,
    }
}

/// Assemble the activity for a matched cluster event.
pub fn activity_from_event(event: &Value, matched: &MatchedPolicy) -> Activity {
    let actor = event_actor_ref(event);
    let resource = event_object_ref(event).unwrap_or_default();

    let observed_at = first_str(
        event,
        &["/eventTime", "/lastTimestamp", "/metadata/creationTimestamp"],
    )
    .map(str::to_string)
    .unwrap_or_else(|| Utc::now().to_rfc3339());

    Activity {
        name: event_activity_name(event),
        tenant: tenant_of(event),
        resource,
        origin: Origin { type_: OriginType::Event },
        change_source: change_source_for(&actor.type_),
        actor,
        summary: matched.summary.clone(),
        links: matched.links.clone(),
        observed_at,
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matched(summary: &str) -> MatchedPolicy {
        MatchedPolicy {
            policy_name: "p".to_string(),
            api_group: "".to_string(),
            kind: "Pod".to_string(),
            summary: summary.to_string(),
            links: vec![],
        }
    }

    #[test]
    fn test_classify_username_service_account() {
        assert_eq!(
            classify_username("system:serviceaccount:kube-system:replicaset-controller"),
            ACTOR_SERVICE_ACCOUNT
        );
    }

    #[test]
    fn test_classify_username_system() {
        assert_eq!(classify_username("system:apiserver"), ACTOR_SYSTEM);
    }

    #[test]
    fn test_classify_username_user() {
        assert_eq!(classify_username("jane@example.com"), ACTOR_USER);
    }

    #[test]
    fn test_classify_username_empty() {
        assert_eq!(classify_username(""), ACTOR_UNKNOWN);
    }

    #[test]
    fn test_event_actor_prefers_reporting_controller() {
        let event = json!({
            "reportingController": "kubelet",
            "source": {"component": "scheduler"}
        });
        assert_eq!(event_actor(&event), "kubelet");
    }

    #[test]
    fn test_event_actor_falls_back_to_source_component() {
        let event = json!({"source": {"component": "scheduler"}});
        assert_eq!(event_actor(&event), "scheduler");
    }

    #[test]
    fn test_event_actor_ref_is_controller() {
        let event = json!({"reportingController": "kubelet"});
        let actor = event_actor_ref(&event);
        assert_eq!(actor.type_, ACTOR_CONTROLLER);
        assert_eq!(actor.name, "kubelet");
    }

    #[test]
    fn test_audit_object_ref_missing() {
        let audit = json!({"auditID": "a1", "verb": "get"});
        assert!(audit_object_ref(&audit).is_none());
    }

    #[test]
    fn test_audit_resource_extraction() {
        let audit = json!({
            "objectRef": {"apiGroup": "apps", "resource": "deployments", "name": "web"}
        });
        let (group, resource) = audit_resource(&audit).expect("should resolve");
        assert_eq!(group, "apps");
        assert_eq!(resource, "deployments");
    }

    #[test]
    fn test_event_object_ref_regarding_over_involved() {
        let event = json!({
            "regarding": {"kind": "Pod", "name": "web-1", "namespace": "default"},
            "involvedObject": {"kind": "Deployment", "name": "other"}
        });
        let resource = event_object_ref(&event).expect("should resolve");
        assert_eq!(resource.kind, "Pod");
        assert_eq!(resource.name, "web-1");
    }

    #[test]
    fn test_event_object_ref_group_from_api_version() {
        let event = json!({
            "involvedObject": {"apiVersion": "apps/v1", "kind": "Deployment", "name": "web"}
        });
        let resource = event_object_ref(&event).expect("should resolve");
        assert_eq!(resource.api_group, "apps");
    }

    #[test]
    fn test_event_object_ref_core_api_version() {
        let event = json!({
            "involvedObject": {"apiVersion": "v1", "kind": "Pod", "name": "web"}
        });
        let resource = event_object_ref(&event).expect("should resolve");
        assert_eq!(resource.api_group, "");
    }

    #[test]
    fn test_audit_activity_name_uses_audit_id() {
        let audit = json!({"auditID": "abc-123"});
        assert_eq!(audit_activity_name(&audit), "abc-123");
    }

    #[test]
    fn test_audit_activity_name_fallback_is_deterministic() {
        let audit = json!({"verb": "create", "objectRef": {"resource": "pods"}});
        let a = audit_activity_name(&audit);
        let b = audit_activity_name(&audit);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_event_activity_name_uses_metadata_uid() {
        let event = json!({"metadata": {"uid": "uid-9"}});
        assert_eq!(event_activity_name(&event), "uid-9");
    }

    #[test]
    fn test_activity_from_audit_human_actor() {
        let audit = json!({
            "auditID": "a1",
            "user": {"username": "jane@example.com"},
            "verb": "create",
            "stageTimestamp": "2026-06-01T12:00:00Z",
            "objectRef": {"resource": "pods", "namespace": "default", "name": "web-1"}
        });

        let activity = activity_from_audit(&audit, &matched("pod web-1 created"));

        assert_eq!(activity.name, "a1");
        assert_eq!(activity.origin.type_, OriginType::Audit);
        assert_eq!(activity.change_source, ChangeSource::Human);
        assert_eq!(activity.actor.type_, ACTOR_USER);
        assert_eq!(activity.resource.kind, "Pod");
        assert_eq!(activity.resource.name, "web-1");
        assert_eq!(activity.observed_at, "2026-06-01T12:00:00Z");
        assert_eq!(activity.summary, "pod web-1 created");
    }

    #[test]
    fn test_activity_from_audit_system_actor() {
        let audit = json!({
            "auditID": "a2",
            "user": {"username": "system:serviceaccount:default:builder"},
            "objectRef": {"resource": "pods", "name": "x"}
        });
        let activity = activity_from_audit(&audit, &matched("s"));
        assert_eq!(activity.change_source, ChangeSource::System);
    }

    #[test]
    fn test_activity_from_event_fields() {
        let event = json!({
            "metadata": {"uid": "e7"},
            "reason": "Scheduled",
            "reportingController": "default-scheduler",
            "lastTimestamp": "2026-06-01T09:30:00Z",
            "regarding": {"kind": "Pod", "namespace": "prod", "name": "web-1", "uid": "u1"}
        });

        let activity = activity_from_event(&event, &matched("scheduled"));

        assert_eq!(activity.name, "e7");
        assert_eq!(activity.origin.type_, OriginType::Event);
        assert_eq!(activity.change_source, ChangeSource::System);
        assert_eq!(activity.resource.namespace, "prod");
        assert_eq!(activity.observed_at, "2026-06-01T09:30:00Z");
    }

    #[test]
    fn test_activity_serializes_camel_case() {
        let audit = json!({"auditID": "a1", "user": {"username": "u"}, "objectRef": {"resource": "pods"}});
        let activity = activity_from_audit(&audit, &matched("s"));
        let json = serde_json::to_string(&activity).expect("should serialize");
        assert!(json.contains("changeSource"));
        assert!(json.contains("observedAt"));
        assert!(json.contains(r#""origin":{"type":"audit"}"#));
    }
}
