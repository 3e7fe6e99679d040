use activity_engine::crd::{ActivityPolicy, ActivityPolicySpec, PolicyRule, PolicyTarget};
use serde_json::{Value, json};

pub fn make_policy(
    name: &str,
    api_group: &str,
    kind: &str,
    audit_rules: &[(&str, &str)],
    event_rules: &[(&str, &str)],
) -> ActivityPolicy {
    let to_rules = |pairs: &[(&str, &str)]| -> Vec<PolicyRule> {
        pairs
            .iter()
            .map(|(m, s)| PolicyRule {
                match_expression: m.to_string(),
                summary: s.to_string(),
            })
            .collect()
    };

    ActivityPolicy::new(
        name,
        ActivityPolicySpec {
            target: PolicyTarget {
                api_group: api_group.to_string(),
                kind: kind.to_string(),
            },
            audit_rules: to_rules(audit_rules),
            event_rules: to_rules(event_rules),
        },
    )
}

pub fn make_audit(
    audit_id: &str,
    username: &str,
    verb: &str,
    api_group: &str,
    resource: &str,
    namespace: &str,
    name: &str,
) -> Value {
    json!({
        "auditID": audit_id,
        "verb": verb,
        "user": {"username": username},
        "stageTimestamp": "2026-06-01T12:00:00Z",
        "responseStatus": {"code": 200},
        "objectRef": {
            "apiGroup": api_group,
            "resource": resource,
            "namespace": namespace,
            "name": name,
            "uid": format!("uid-{name}")
        }
    })
}

pub fn make_event(
    uid: &str,
    reason: &str,
    controller: &str,
    api_version: &str,
    kind: &str,
    namespace: &str,
    name: &str,
) -> Value {
    json!({
        "metadata": {"uid": uid, "namespace": namespace},
        "reason": reason,
        "type": "Normal",
        "reportingController": controller,
        "lastTimestamp": "2026-06-01T09:30:00Z",
        "message": format!("{reason} for {name}"),
        "regarding": {
            "apiVersion": api_version,
            "kind": kind,
            "namespace": namespace,
            "name": name,
            "uid": format!("uid-{name}")
        }
    })
}
