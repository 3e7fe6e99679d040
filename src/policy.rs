use kube::ResourceExt;

use crate::crd::ActivityPolicy;
use crate::rule::CompiledRule;

/* ============================= COMPILED POLICY ============================= */

/// An admitted policy with every rule pre-compiled.
///
/// Immutable once built; updates replace the whole object in the cache.
/// Holds a deep copy of the original object for observability.
pub struct CompiledPolicy {
    pub name: String,
    pub api_group: String,
    pub kind: String,
    pub resource: String,
    pub resource_version: String,
    pub audit_rules: Vec<CompiledRule>,
    pub event_rules: Vec<CompiledRule>,
    pub original: ActivityPolicy,
}

impl CompiledPolicy {
    /// Compile all rules of `policy`, which targets the plural `resource`.
    ///
    /// Rule-local compile failures never fail the policy; the offending
    /// rules are retained flagged-invalid and skipped by evaluation.
    pub fn compile(policy: &ActivityPolicy, resource: &str) -> Self {
        let name = policy.name_any();

        let audit_rules = policy
            .spec
            .audit_rules
            .iter()
            .enumerate()
            .map(|(i, rule)| CompiledRule::compile(&name, i, rule))
            .collect();

        let event_rules = policy
            .spec
            .event_rules
            .iter()
            .enumerate()
            .map(|(i, rule)| CompiledRule::compile(&name, i, rule))
            .collect();

        CompiledPolicy {
            api_group: policy.spec.target.api_group.clone(),
            kind: policy.spec.target.kind.clone(),
            resource: resource.to_string(),
            resource_version: policy.resource_version().unwrap_or_default(),
            audit_rules,
            event_rules,
            original: policy.clone(),
            name,
        }
    }

    /// First rule-compile error across both rule lists, if any.
    pub fn first_compile_error(&self) -> Option<String> {
        self.audit_rules
            .iter()
            .chain(self.event_rules.iter())
            .find_map(|rule| rule.compile_error().map(str::to_string))
    }

    pub fn has_audit_rules(&self) -> bool {
        !self.audit_rules.is_empty()
    }

    pub fn has_event_rules(&self) -> bool {
        !self.event_rules.is_empty()
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ActivityPolicySpec, PolicyRule, PolicyTarget};

    fn policy(name: &str, audit_rules: Vec<PolicyRule>, event_rules: Vec<PolicyRule>) -> ActivityPolicy {
        ActivityPolicy::new(
            name,
            ActivityPolicySpec {
                target: PolicyTarget {
                    api_group: "apps".to_string(),
                    kind: "Deployment".to_string(),
                },
                audit_rules,
                event_rules,
            },
        )
    }

    fn rule(match_expression: &str) -> PolicyRule {
        PolicyRule {
            match_expression: match_expression.to_string(),
            summary: "s".to_string(),
        }
    }

    #[test]
    fn test_compile_carries_target_fields() {
        let compiled = CompiledPolicy::compile(&policy("p", vec![rule("true")], vec![]), "deployments");
        assert_eq!(compiled.name, "p");
        assert_eq!(compiled.api_group, "apps");
        assert_eq!(compiled.kind, "Deployment");
        assert_eq!(compiled.resource, "deployments");
        assert!(compiled.has_audit_rules());
        assert!(!compiled.has_event_rules());
    }

    #[test]
    fn test_invalid_rule_retained_and_reported() {
        let compiled = CompiledPolicy::compile(
            &policy("p", vec![rule("!!! not valid !!!"), rule("true")], vec![]),
            "deployments",
        );
        assert_eq!(compiled.audit_rules.len(), 2);
        assert!(!compiled.audit_rules[0].is_valid());
        assert!(compiled.audit_rules[1].is_valid());
        assert!(compiled.first_compile_error().is_some());
    }

    #[test]
    fn test_all_valid_reports_no_error() {
        let compiled = CompiledPolicy::compile(
            &policy("p", vec![rule("true")], vec![rule("false")]),
            "deployments",
        );
        assert!(compiled.first_compile_error().is_none());
    }

    #[test]
    fn test_original_is_deep_copy() {
        let source = policy("p", vec![rule("true")], vec![]);
        let compiled = CompiledPolicy::compile(&source, "deployments");
        assert_eq!(compiled.original.spec.target, source.spec.target);
        assert_eq!(compiled.original.spec.audit_rules, source.spec.audit_rules);
    }
}
