//! Connector registry: tenant → live tunnel.
//!
//! One tunnel per tenant, last writer wins. The registry never
//! branches on transport kind; variants are hidden behind the tunnel.

use crate::error::{GatewayError, Result};
use crate::pipeline;
use crate::tunnel::{TransportKind, Tunnel};
use bytes::Bytes;
use metrics::gauge;
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Alias reachable from inside a container when a connector advertises
/// a loopback address.
const DOCKER_HOST_ALIAS: &str = "host.docker.internal";

/// Registry view of one connector.
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    pub connector_id: String,
    pub tenant_id: String,
    pub transport: TransportKind,
    pub status: String,
    /// Advertised address, after any loopback rewrite. Informational.
    pub address: Option<String>,
}

struct RegistryEntry {
    info: ConnectorInfo,
    tunnel: Arc<Tunnel>,
}

/// Tenant-keyed index of live tunnels.
pub struct ConnectorRegistry {
    connectors: RwLock<HashMap<String, RegistryEntry>>,
    rewrite_loopback: bool,
}

impl ConnectorRegistry {
    pub fn new(rewrite_loopback: bool) -> Self {
        Self {
            connectors: RwLock::new(HashMap::new()),
            rewrite_loopback,
        }
    }

    /// Reads `RUNNING_IN_DOCKER` to decide whether loopback addresses
    /// get rewritten at registration.
    pub fn from_env() -> Self {
        let in_docker = env::var("RUNNING_IN_DOCKER").as_deref() == Ok("true");
        Self::new(in_docker)
    }

    /// Insert a tunnel for its tenant, closing any tunnel it replaces.
    pub fn register(&self, tunnel: Arc<Tunnel>, address: Option<String>) {
        let address = address.map(|a| {
            if self.rewrite_loopback {
                let rewritten = rewrite_loopback_address(&a);
                if rewritten != a {
                    info!(from = %a, to = %rewritten, "rewrote loopback connector address");
                }
                rewritten
            } else {
                a
            }
        });

        let tenant_id = tunnel.tenant_id().to_string();
        let info = ConnectorInfo {
            connector_id: tunnel.connector_id().to_string(),
            tenant_id: tenant_id.clone(),
            transport: tunnel.kind(),
            status: "connected".to_string(),
            address,
        };

        let replaced = {
            let mut connectors = self.connectors.write().unwrap();
            let replaced = connectors.remove(&tenant_id);
            if let Some(prev) = &replaced {
                prev.tunnel.shutdown();
            }
            connectors.insert(tenant_id.clone(), RegistryEntry { info, tunnel });
            replaced
        };

        if let Some(prev) = replaced {
            warn!(
                %tenant_id,
                old_connector = %prev.info.connector_id,
                "replaced existing tunnel for tenant"
            );
        }
        info!(%tenant_id, "connector registered");
        self.update_gauge();
    }

    /// Remove the tenant's entry, but only if it still belongs to the
    /// given tunnel. A tunnel that was replaced must not evict its
    /// successor on the way out.
    pub fn unregister(&self, tenant_id: &str, tunnel_id: &str) -> bool {
        let removed = {
            let mut connectors = self.connectors.write().unwrap();
            match connectors.get(tenant_id) {
                Some(entry) if entry.tunnel.id() == tunnel_id => connectors.remove(tenant_id),
                _ => None,
            }
        };

        match removed {
            Some(entry) => {
                entry.tunnel.shutdown();
                info!(tenant_id, "connector unregistered");
                self.update_gauge();
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, tenant_id: &str) -> Option<Arc<Tunnel>> {
        self.connectors
            .read()
            .unwrap()
            .get(tenant_id)
            .map(|entry| Arc::clone(&entry.tunnel))
    }

    pub fn is_connected(&self, tenant_id: &str) -> bool {
        self.connectors.read().unwrap().contains_key(tenant_id)
    }

    pub fn connected_count(&self) -> usize {
        self.connectors.read().unwrap().len()
    }

    pub fn list(&self) -> Vec<ConnectorInfo> {
        self.connectors
            .read()
            .unwrap()
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Stream a dataset from the tenant's connector into `out`.
    /// `out` is closed exactly once on return, whatever happened; a
    /// missing tenant fails immediately without blocking.
    pub async fn query(
        &self,
        tenant_id: &str,
        dataset: &str,
        rows: Option<i64>,
        out: mpsc::Sender<Bytes>,
    ) -> Result<()> {
        let Some(tunnel) = self.lookup(tenant_id) else {
            drop(out);
            return Err(GatewayError::TenantNotConnected(tenant_id.to_string()));
        };
        pipeline::fetch_dataset(tunnel, dataset, rows, out).await
    }

    fn update_gauge(&self) {
        gauge!("gateway_connected_tenants").set(self.connected_count() as f64);
    }
}

/// Map loopback literals to the host alias so connectors registered
/// from the host stay reachable from inside a container.
pub fn rewrite_loopback_address(address: &str) -> String {
    for loopback in ["localhost", "127.0.0.1", "[::1]", "0.0.0.0"] {
        if address.contains(loopback) {
            return address.replacen(loopback, DOCKER_HOST_ALIAS, 1);
        }
    }
    address.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::testing::mock_tunnel;

    #[test]
    fn test_rewrite_loopback_address() {
        assert_eq!(
            rewrite_loopback_address("localhost:8815"),
            "host.docker.internal:8815"
        );
        assert_eq!(
            rewrite_loopback_address("grpc://127.0.0.1:9000"),
            "grpc://host.docker.internal:9000"
        );
        assert_eq!(
            rewrite_loopback_address("[::1]:8815"),
            "host.docker.internal:8815"
        );
        assert_eq!(
            rewrite_loopback_address("0.0.0.0:80"),
            "host.docker.internal:80"
        );
        assert_eq!(
            rewrite_loopback_address("connector.internal:8815"),
            "connector.internal:8815"
        );
    }

    #[tokio::test]
    async fn test_register_lookup_unregister() {
        let registry = ConnectorRegistry::new(false);
        let (tunnel, _out, _in) = mock_tunnel();
        let tunnel_id = tunnel.id().to_string();

        assert!(!registry.is_connected("tenant-1"));
        registry.register(Arc::clone(&tunnel), None);
        assert!(registry.is_connected("tenant-1"));
        assert!(registry.lookup("tenant-1").is_some());
        assert_eq!(registry.list().len(), 1);

        assert!(registry.unregister("tenant-1", &tunnel_id));
        assert!(!registry.is_connected("tenant-1"));
        assert!(tunnel.is_closed());
    }

    #[tokio::test]
    async fn test_reregister_closes_previous_tunnel() {
        let registry = ConnectorRegistry::new(false);
        let (old, _old_out, _old_in) = mock_tunnel();
        let (new, _new_out, _new_in) = mock_tunnel();
        let old_id = old.id().to_string();

        registry.register(Arc::clone(&old), None);
        registry.register(Arc::clone(&new), None);

        assert!(old.is_closed());
        assert!(!new.is_closed());

        // The replaced tunnel's deferred unregister must not evict the
        // new one.
        assert!(!registry.unregister("tenant-1", &old_id));
        assert!(registry.is_connected("tenant-1"));
    }

    #[tokio::test]
    async fn test_register_applies_docker_rewrite() {
        let registry = ConnectorRegistry::new(true);
        let (tunnel, _out, _in) = mock_tunnel();
        registry.register(tunnel, Some("localhost:8815".to_string()));

        let info = &registry.list()[0];
        assert_eq!(info.address.as_deref(), Some("host.docker.internal:8815"));
    }

    #[tokio::test]
    async fn test_query_unknown_tenant_fails_fast_and_closes_out() {
        let registry = ConnectorRegistry::new(false);
        let (tx, mut rx) = mpsc::channel::<Bytes>(8);

        let result = registry.query("ghost", "sales", None, tx).await;
        assert!(matches!(result, Err(GatewayError::TenantNotConnected(_))));
        // The output channel must close without ever blocking.
        assert!(rx.recv().await.is_none());
    }
}
