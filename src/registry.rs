//! Tunnel Registry (spec §4.6, components F/G).
//!
//! Wraps a [`Configuration`] in a lock so callers can register, transition,
//! and remove tunnels concurrently while the admission checks and ordering
//! guarantees of the configuration model stay intact.

use log::{debug, info};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::model::{Configuration, Tunnel};
use crate::types::{TunnelId, TunnelStatus};

/// Concurrency-safe holder of one agent's [`Configuration`].
///
/// Mirrors the teacher's `RwLock<HashMap<..>>` registry (`state.rs`), but
/// the ordered/conflict-checked collection itself lives in
/// [`Configuration`] rather than a bare `HashMap` so admission rules are
/// enforced in one place regardless of caller.
pub struct Registry {
    configuration: RwLock<Configuration>,
}

impl Registry {
    pub fn new(configuration: Configuration) -> Self {
        Registry {
            configuration: RwLock::new(configuration),
        }
    }

    pub async fn snapshot(&self) -> Configuration {
        self.configuration.read().await.clone()
    }

    /// Admits `tunnel`, rejecting it with the same conflict/capacity errors
    /// [`Configuration::add_tunnel`] would raise.
    pub async fn register(&self, tunnel: Tunnel) -> Result<()> {
        let mut guard = self.configuration.write().await;
        let id = tunnel.id.clone();
        *guard = guard.add_tunnel(tunnel)?;
        info!("registered tunnel {id}");
        Ok(())
    }

    /// Removes a tunnel by id. The caller is responsible for having already
    /// torn down its process-level resources (spec §4.6: the registry only
    /// tracks state, it does not own a process).
    pub async fn remove(&self, id: &TunnelId) -> Result<()> {
        let mut guard = self.configuration.write().await;
        *guard = guard.remove_tunnel(id)?;
        info!("removed tunnel {id}");
        Ok(())
    }

    pub async fn get(&self, id: &TunnelId) -> Option<Tunnel> {
        self.configuration.read().await.find(id).cloned()
    }

    pub async fn list(&self) -> Vec<Tunnel> {
        self.configuration.read().await.tunnels().to_vec()
    }

    /// Applies a validated state transition to the tunnel `id`, replacing
    /// its entry in place without disturbing registry ordering (spec §4.6,
    /// §6 "Restart preserves ordering").
    pub async fn transition(&self, id: &TunnelId, next: TunnelStatus) -> Result<Tunnel> {
        let mut guard = self.configuration.write().await;
        let current = guard
            .find(id)
            .ok_or_else(|| Error::conflict(format!("no tunnel with id '{id}'")))?
            .clone();
        let updated = current.transition(next)?;
        *guard = guard.replace_tunnel(updated.clone())?;
        debug!("tunnel {id} transitioned to {next}");
        Ok(updated)
    }

    pub async fn mark_error(&self, id: &TunnelId, message: impl Into<String>) -> Result<Tunnel> {
        let mut guard = self.configuration.write().await;
        let current = guard
            .find(id)
            .ok_or_else(|| Error::conflict(format!("no tunnel with id '{id}'")))?
            .clone();
        let updated = current.with_error(message)?;
        *guard = guard.replace_tunnel(updated.clone())?;
        Ok(updated)
    }

    pub async fn len(&self) -> usize {
        self.configuration.read().await.tunnels().len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServerSpec, TcpTunnelSpec, TunnelSpec};
    use crate::types::Port;

    fn tcp_tunnel(id: &str, port: u32) -> Tunnel {
        let spec = TcpTunnelSpec {
            local_port: Port::of(port).unwrap(),
            remote_port: None,
        };
        Tunnel::new(TunnelId::of(id).unwrap(), TunnelSpec::Tcp(spec))
    }

    fn empty_registry() -> Registry {
        Registry::new(Configuration::new(ServerSpec::new("s").unwrap()))
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let registry = empty_registry();
        registry.register(tcp_tunnel("a", 22)).await.unwrap();
        let found = registry.get(&TunnelId::of("a").unwrap()).await;
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = empty_registry();
        registry.register(tcp_tunnel("a", 22)).await.unwrap();
        let result = registry.register(tcp_tunnel("a", 23)).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn remove_then_get_returns_none() {
        let registry = empty_registry();
        registry.register(tcp_tunnel("a", 22)).await.unwrap();
        registry.remove(&TunnelId::of("a").unwrap()).await.unwrap();
        assert!(registry.get(&TunnelId::of("a").unwrap()).await.is_none());
    }

    #[tokio::test]
    async fn transition_enforces_the_state_machine() {
        let registry = empty_registry();
        registry.register(tcp_tunnel("a", 22)).await.unwrap();
        let id = TunnelId::of("a").unwrap();
        let result = registry.transition(&id, TunnelStatus::Connected).await;
        assert!(matches!(result, Err(Error::InvalidState(_))));
        registry
            .transition(&id, TunnelStatus::Connecting)
            .await
            .unwrap();
        let connected = registry
            .transition(&id, TunnelStatus::Connected)
            .await
            .unwrap();
        assert_eq!(connected.status, TunnelStatus::Connected);
    }

    #[tokio::test]
    async fn list_preserves_insertion_order() {
        let registry = empty_registry();
        registry.register(tcp_tunnel("a", 1)).await.unwrap();
        registry.register(tcp_tunnel("b", 2)).await.unwrap();
        registry.register(tcp_tunnel("c", 3)).await.unwrap();
        let ids: Vec<_> = registry
            .list()
            .await
            .iter()
            .map(|t| t.id.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
