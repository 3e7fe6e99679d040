use std::collections::HashMap;
use std::sync::Arc;

use kube::ResourceExt;
use parking_lot::RwLock;
use tracing::info;

use crate::crd::ActivityPolicy;
use crate::policy::CompiledPolicy;

/* ============================= KEYS ============================= */

/// Bucket key: `"<apiGroup>/<indexKey>"`. The core group keys as `"/x"`.
fn bucket_key(api_group: &str, index_key: &str) -> String {
    format!("{api_group}/{index_key}")
}

/* ============================= CACHE ============================= */

pub type Bucket = Vec<Arc<CompiledPolicy>>;

#[derive(Default)]
struct Indices {
    /// Keyed by apiGroup/plural-resource; consulted for audit records.
    by_resource: HashMap<String, Bucket>,

    /// Keyed by apiGroup/kind; consulted for cluster events.
    by_kind: HashMap<String, Bucket>,
}

/// Thread-safe double index of compiled policies.
///
/// Writers hold the exclusive lock across both indices, so readers always
/// observe a policy in both buckets or in neither. Within a bucket,
/// insertion order is the evaluation tie-break: first admitted wins.
/// Reads return a snapshot so no lock is held across evaluation.
#[derive(Default)]
pub struct PolicyCache {
    indices: RwLock<Indices>,
}

impl PolicyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and insert a policy under both indices.
    ///
    /// Bucket mutation cannot fail; the returned value is the first
    /// rule-compile error, surfaced for the status reconciler. Invalid
    /// rules stay in the compiled policy, flagged and skipped.
    pub fn add(&self, policy: &ActivityPolicy, resource: &str) -> Option<String> {
        let compiled = Arc::new(CompiledPolicy::compile(policy, resource));
        let compile_error = compiled.first_compile_error();

        let mut indices = self.indices.write();
        Self::insert(&mut indices, compiled.clone());
        drop(indices);

        info!(
            policy = %compiled.name,
            api_group = %compiled.api_group,
            kind = %compiled.kind,
            resource = %compiled.resource,
            "policy_cached"
        );

        compile_error
    }

    /// Atomically replace `old` with `new`: the old entry leaves both
    /// indices and the new one lands in both under a single write lock,
    /// so readers never see a half-applied update.
    pub fn update(
        &self,
        old: &ActivityPolicy,
        new: &ActivityPolicy,
        old_resource: &str,
        new_resource: &str,
    ) -> Option<String> {
        let compiled = Arc::new(CompiledPolicy::compile(new, new_resource));
        let compile_error = compiled.first_compile_error();

        let mut indices = self.indices.write();
        Self::delete(
            &mut indices,
            &old.name_any(),
            &old.spec.target.api_group,
            &old.spec.target.kind,
            old_resource,
        );
        Self::insert(&mut indices, compiled.clone());
        drop(indices);

        info!(
            policy = %compiled.name,
            api_group = %compiled.api_group,
            kind = %compiled.kind,
            resource = %compiled.resource,
            "policy_updated"
        );

        compile_error
    }

    /// Remove a policy from both indices, dropping emptied buckets.
    pub fn remove(&self, policy: &ActivityPolicy, resource: &str) {
        let name = policy.name_any();
        let mut indices = self.indices.write();
        Self::delete(
            &mut indices,
            &name,
            &policy.spec.target.api_group,
            &policy.spec.target.kind,
            resource,
        );
        drop(indices);

        info!(policy = %name, "policy_removed");
    }

    /// Policies targeting `apiGroup/resource`, in insertion order.
    pub fn get(&self, api_group: &str, resource: &str) -> Bucket {
        self.indices
            .read()
            .by_resource
            .get(&bucket_key(api_group, resource))
            .cloned()
            .unwrap_or_default()
    }

    /// Policies targeting `apiGroup/kind`, in insertion order.
    pub fn get_by_kind(&self, api_group: &str, kind: &str) -> Bucket {
        self.indices
            .read()
            .by_kind
            .get(&bucket_key(api_group, kind))
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of cached policies.
    pub fn len(&self) -> usize {
        self.indices.read().by_resource.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(indices: &mut Indices, compiled: Arc<CompiledPolicy>) {
        indices
            .by_resource
            .entry(bucket_key(&compiled.api_group, &compiled.resource))
            .or_default()
            .push(compiled.clone());
        indices
            .by_kind
            .entry(bucket_key(&compiled.api_group, &compiled.kind))
            .or_default()
            .push(compiled);
    }

    /// Order-preserving removal: sibling policies keep their relative
    /// insertion order, so the first-admitted-wins tie-break survives
    /// deletes of unrelated policies.
    fn delete(indices: &mut Indices, name: &str, api_group: &str, kind: &str, resource: &str) {
        let resource_key = bucket_key(api_group, resource);
        if let Some(bucket) = indices.by_resource.get_mut(&resource_key) {
            if let Some(pos) = bucket.iter().position(|p| p.name == name) {
                bucket.remove(pos);
            }
            if bucket.is_empty() {
                indices.by_resource.remove(&resource_key);
            }
        }

        let kind_key = bucket_key(api_group, kind);
        if let Some(bucket) = indices.by_kind.get_mut(&kind_key) {
            if let Some(pos) = bucket.iter().position(|p| p.name == name) {
                bucket.remove(pos);
            }
            if bucket.is_empty() {
                indices.by_kind.remove(&kind_key);
            }
        }
    }
}

/* ============================= TESTS ============================= */
