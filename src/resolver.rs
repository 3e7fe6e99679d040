use kube::Client;
use kube::discovery::Discovery;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{EngineError, Result};

/* ============================= RESOLVER ============================= */

/// Discovery-backed mapping from a target group/kind to its plural
/// resource name.
///
/// On a no-match outcome the cached discovery state is reset and the
/// lookup retried exactly once, so a newly registered target type becomes
/// usable within seconds of registration without restarting the engine.
/// Any other failure surfaces immediately.
pub struct ResourceResolver {
    client: Client,
    discovery: Mutex<Option<Discovery>>,
}

impl ResourceResolver {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovery: Mutex::new(None),
        }
    }

    pub async fn resolve(&self, api_group: &str, kind: &str) -> Result<String> {
        let mut cached = self.discovery.lock().await;

        if cached.is_none() {
            *cached = Some(self.discover().await?);
        }
        if let Some(resource) = cached.as_ref().and_then(|d| Self::find(d, api_group, kind)) {
            return Ok(resource);
        }

        // Unknown group/kind: the type may have been registered since the
        // last discovery sweep. Reset and retry once.
        debug!(group = %api_group, kind = %kind, "resolver_cache_reset");
        *cached = Some(self.discover().await?);

        cached
            .as_ref()
            .and_then(|d| Self::find(d, api_group, kind))
            .ok_or_else(|| EngineError::ResourceNotFound {
                group: api_group.to_string(),
                kind: kind.to_string(),
            })
            .inspect(|resource| {
                info!(group = %api_group, kind = %kind, resource = %resource, "resolver_refreshed");
            })
    }

    async fn discover(&self) -> Result<Discovery> {
        Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| EngineError::Discovery {
                reason: e.to_string(),
            })
    }

    fn find(discovery: &Discovery, api_group: &str, kind: &str) -> Option<String> {
        discovery
            .groups()
            .find(|g| g.name() == api_group)
            .and_then(|g| g.recommended_kind(kind))
            .map(|(resource, _)| resource.plural)
    }
}
