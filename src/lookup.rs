use std::sync::Arc;

use serde_json::Value;

use crate::activity::ActivityLink;
use crate::cache::PolicyCache;
use crate::crd::ActivityPolicy;
use crate::error::Result;
use crate::expr::Bindings;
use crate::workers::ActivityMatcher;

/* ============================= MATCH RESULT ============================= */

/// The outcome of evaluating an input record against the cached policies.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPolicy {
    pub policy_name: String,
    pub api_group: String,
    pub kind: String,
    pub summary: String,
    pub links: Vec<ActivityLink>,
}

/* ============================= ADAPTER ============================= */

/// Exposes the match operations over the policy cache.
///
/// Consumers depend on the [`ActivityMatcher`] trait declared next to the
/// worker pool; this adapter is the cache-backed implementation, which
/// keeps the dependency arrow pointing from the cache to its consumers.
#[derive(Clone)]
pub struct CacheMatcher {
    cache: Arc<PolicyCache>,
}

impl CacheMatcher {
    pub fn new(cache: Arc<PolicyCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<PolicyCache> {
        &self.cache
    }

    /// Control-plane entrypoint: admit an external policy spec.
    pub fn add_policy(&self, policy: &ActivityPolicy, resource: &str) -> Option<String> {
        self.cache.add(policy, resource)
    }

    /// Control-plane entrypoint: replace an admitted policy.
    pub fn update_policy(
        &self,
        old: &ActivityPolicy,
        new: &ActivityPolicy,
        old_resource: &str,
        new_resource: &str,
    ) -> Option<String> {
        self.cache.update(old, new, old_resource, new_resource)
    }

    /// Control-plane entrypoint: retire an admitted policy.
    pub fn remove_policy(&self, policy: &ActivityPolicy, resource: &str) {
        self.cache.remove(policy, resource)
    }
}

impl ActivityMatcher for CacheMatcher {
    /// First matching policy for an audit record targeting
    /// `apiGroup/resource`, or `None`.
    ///
    /// Within a policy the first positively evaluated rule wins and
    /// evaluation stops; across policies the first admitted policy wins.
    /// Evaluation errors surface tagged with policy name and rule index;
    /// the caller decides whether to warn and move on or fail the message.
    fn match_audit(
        &self,
        api_group: &str,
        resource: &str,
        audit: &Value,
    ) -> Result<Option<MatchedPolicy>> {
        let policies = self.cache.get(api_group, resource);
        if policies.is_empty() {
            return Ok(None);
        }

        let bindings = Bindings::for_audit(audit);
        for policy in &policies {
            if !policy.has_audit_rules() {
                continue;
            }
            for rule in &policy.audit_rules {
                if !rule.evaluate_match(&bindings)? {
                    continue;
                }
                let (summary, links) = rule.evaluate_summary(&bindings)?;
                return Ok(Some(MatchedPolicy {
                    policy_name: policy.name.clone(),
                    api_group: api_group.to_string(),
                    kind: policy.kind.clone(),
                    summary,
                    links,
                }));
            }
        }

        Ok(None)
    }

    /// First matching policy for a cluster event targeting
    /// `apiGroup/kind`, or `None`. Mirror of [`Self::match_audit`].
    fn match_event(
        &self,
        api_group: &str,
        kind: &str,
        event: &Value,
    ) -> Result<Option<MatchedPolicy>> {
        let policies = self.cache.get_by_kind(api_group, kind);
        if policies.is_empty() {
            return Ok(None);
        }

        let bindings = Bindings::for_event(event);
        for policy in &policies {
            if !policy.has_event_rules() {
                continue;
            }
            for rule in &policy.event_rules {
                if !rule.evaluate_match(&bindings)? {
                    continue;
                }
                let (summary, links) = rule.evaluate_summary(&bindings)?;
                return Ok(Some(MatchedPolicy {
                    policy_name: policy.name.clone(),
                    api_group: api_group.to_string(),
                    kind: policy.kind.clone(),
                    summary,
                    links,
                }));
            }
        }

        Ok(None)
    }
}

/* ============================= TESTS ============================= */
