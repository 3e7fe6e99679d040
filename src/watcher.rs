use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use kube::{Api, Client, ResourceExt};
use kube_runtime::watcher::{Config, Event, watcher};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cache::PolicyCache;
use crate::crd::ActivityPolicy;
use crate::health::HealthState;
use crate::metrics::ACTIVE_POLICIES;
use crate::resolver::ResourceResolver;

/* ============================= ADMITTED SET ============================= */

/// The last admitted form of a policy: the object as it was when it
/// entered the cache, plus the resolved plural resource. Needed so an
/// update or delete can remove the exact buckets the old form lives in.
struct Admitted {
    object: ActivityPolicy,
    resource: String,
}

/* ============================= WATCHER ============================= */

/// Keeps the policy cache in sync with upstream ActivityPolicy objects.
///
/// Only `Ready=True` policies are admitted. Per policy the state machine
/// is *absent* ⇄ *admitted*: Ready + resolution + compile admits, an
/// update swaps in place, Ready≠True or delete removes.
pub struct PolicyWatcher {
    client: Client,
    cache: Arc<PolicyCache>,
    resolver: Arc<ResourceResolver>,
    health: Arc<HealthState>,
}

impl PolicyWatcher {
    pub fn new(
        client: Client,
        cache: Arc<PolicyCache>,
        resolver: Arc<ResourceResolver>,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            client,
            cache,
            resolver,
            health,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let policies: Api<ActivityPolicy> = Api::all(self.client.clone());
        let mut stream = watcher(policies, Config::default()).boxed();
        let mut admitted: HashMap<String, Admitted> = HashMap::new();

        info!("policy_watcher_started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("policy_watcher_stopped");
                    return Ok(());
                }

                event = stream.next() => {
                    match event {
                        Some(Ok(Event::Applied(policy))) => {
                            self.handle_applied(&mut admitted, policy).await;
                        }
                        Some(Ok(Event::Deleted(policy))) => {
                            self.handle_deleted(&mut admitted, &policy);
                        }
                        Some(Ok(Event::Restarted(policies))) => {
                            self.handle_restarted(&mut admitted, policies).await;
                            self.health.set_cache_synced(true);
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "policy_watch_error");
                        }
                        None => {
                            warn!("policy_watch_stream_ended");
                            return Ok(());
                        }
                    }
                    ACTIVE_POLICIES.set(self.cache.len() as i64);
                }
            }
        }
    }

    async fn handle_applied(&self, admitted: &mut HashMap<String, Admitted>, policy: ActivityPolicy) {
        let name = policy.name_any();
        let ready = policy.is_ready();

        match (admitted.contains_key(&name), ready) {
            // absent → absent: resolution failures on not-ready policies
            // are irrelevant; there is no admitted form to keep consistent.
            (false, false) => {}

            // absent → admitted
            (false, true) => {
                let resource = match self
                    .resolver
                    .resolve(&policy.spec.target.api_group, &policy.spec.target.kind)
                    .await
                {
                    Ok(resource) => resource,
                    Err(e) => {
                        warn!(policy = %name, error = %e, "policy_admit_resolution_failed");
                        return;
                    }
                };

                if let Some(compile_error) = self.cache.add(&policy, &resource) {
                    warn!(policy = %name, error = %compile_error, "policy_rule_compile_failed");
                }
                admitted.insert(name, Admitted { object: policy, resource });
            }

            // admitted → admitted: swap in place
            (true, true) => {
                let new_resource = match self
                    .resolver
                    .resolve(&policy.spec.target.api_group, &policy.spec.target.kind)
                    .await
                {
                    Ok(resource) => resource,
                    Err(e) => {
                        // Leave the previously admitted form intact.
                        warn!(policy = %name, error = %e, "policy_update_resolution_failed");
                        return;
                    }
                };

                if let Some(old) = admitted.get(&name) {
                    if let Some(compile_error) =
                        self.cache.update(&old.object, &policy, &old.resource, &new_resource)
                    {
                        warn!(policy = %name, error = %compile_error, "policy_rule_compile_failed");
                    }
                }
                admitted.insert(name, Admitted { object: policy, resource: new_resource });
            }

            // admitted → absent: ready→not-ready is a pure removal
            (true, false) => {
                if let Some(old) = admitted.remove(&name) {
                    self.cache.remove(&old.object, &old.resource);
                    info!(policy = %name, "policy_no_longer_ready");
                }
            }
        }
    }

    fn handle_deleted(&self, admitted: &mut HashMap<String, Admitted>, policy: &ActivityPolicy) {
        let name = policy.name_any();
        match admitted.remove(&name) {
            Some(old) => self.cache.remove(&old.object, &old.resource),
            // Late delete for a policy that was never admitted (or whose
            // final state is unresolvable): a soft failure, log and move on.
            None => info!(policy = %name, "policy_delete_not_admitted"),
        }
    }

    /// Watch restart delivers the full current list; rebuild the admitted
    /// set from scratch so missed deletes cannot leak stale entries.
    async fn handle_restarted(
        &self,
        admitted: &mut HashMap<String, Admitted>,
        policies: Vec<ActivityPolicy>,
    ) {
        for (_, old) in admitted.drain() {
            self.cache.remove(&old.object, &old.resource);
        }

        info!(count = policies.len(), "policy_watch_resync");
        for policy in policies {
            self.handle_applied(admitted, policy).await;
        }
    }
}
