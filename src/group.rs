//! Scoped Groups (spec §4.8, component I).
//!
//! `Group` and `TemporaryTunnel` guarantee their tunnels are closed even if
//! the caller forgets or a later close fails, aggregating every failure
//! into one [`Error::Cleanup`] rather than losing all but the last.

use std::collections::VecDeque;
use std::sync::Arc;

use log::warn;
use tokio::sync::Mutex;

use crate::client::Client;
use crate::error::{Error, Result};
use crate::model::{HttpTunnelSpec, TcpTunnelSpec};
use crate::types::TunnelId;

/// Order in which a [`Group`]'s tunnels are torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOrder {
    /// Most recently opened closes first (the default).
    Lifo,
    /// Opened order preserved.
    Fifo,
}

/// A caller-scoped set of tunnels on one [`Client`], closed together.
///
/// Mirrors the teacher's ownership pattern of a session object that frees
/// its resources on drop-adjacent teardown (`state.rs`'s disconnected-TTL
/// bookkeeping), but here teardown is explicit via [`Group::close_all`]
/// rather than time-based expiry, since the spec calls for deterministic,
/// caller-driven cleanup (§4.8).
pub struct Group {
    client: Client,
    order: TeardownOrder,
    max_tunnels: usize,
    members: Arc<Mutex<VecDeque<TunnelId>>>,
}

impl Group {
    pub fn new(client: Client, order: TeardownOrder, max_tunnels: usize) -> Self {
        Group {
            client,
            order,
            max_tunnels,
            members: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    async fn admit(&self, id: TunnelId) -> Result<()> {
        let mut members = self.members.lock().await;
        if members.len() >= self.max_tunnels {
            return Err(Error::Capacity(format!(
                "group already holds the maximum of {} tunnels",
                self.max_tunnels
            )));
        }
        members.push_back(id);
        Ok(())
    }

    pub async fn expose_http(&self, spec: HttpTunnelSpec) -> Result<TunnelId> {
        let tunnel = self.client.expose_http(spec).await?;
        let id = tunnel.id;
        if let Err(e) = self.admit(id.clone()).await {
            let _ = self.client.close_tunnel(&id).await;
            return Err(e);
        }
        Ok(id)
    }

    pub async fn expose_tcp(&self, spec: TcpTunnelSpec) -> Result<TunnelId> {
        let tunnel = self.client.expose_tcp(spec).await?;
        let id = tunnel.id;
        if let Err(e) = self.admit(id.clone()).await {
            let _ = self.client.close_tunnel(&id).await;
            return Err(e);
        }
        Ok(id)
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes every member tunnel, in `order`, best-effort: one failure
    /// does not stop the rest. Returns [`Error::Cleanup`] aggregating every
    /// failed close, tagged by tunnel id (spec §4.8, §7, §8 scenario 5).
    pub async fn close_all(&self) -> Result<()> {
        let mut members = self.members.lock().await;
        let ids: Vec<TunnelId> = match self.order {
            TeardownOrder::Lifo => members.iter().rev().cloned().collect(),
            TeardownOrder::Fifo => members.iter().cloned().collect(),
        };
        members.clear();
        drop(members);

        let mut causes = Vec::new();
        for id in ids {
            if let Err(e) = self.client.close_tunnel(&id).await {
                warn!("failed to close tunnel {id} during group teardown: {e}");
                causes.push((id, e));
            }
        }
        Error::from_cleanup(causes)
    }
}

/// A single-tunnel scoped form that also owns its [`Client`], closing both
/// the tunnel and disconnecting the client on teardown (spec §4.8).
pub struct TemporaryTunnel {
    client: Client,
    id: TunnelId,
}

impl TemporaryTunnel {
    pub async fn expose_http(client: Client, spec: HttpTunnelSpec) -> Result<Self> {
        let tunnel = client.expose_http(spec).await?;
        Ok(TemporaryTunnel { client, id: tunnel.id })
    }

    pub async fn expose_tcp(client: Client, spec: TcpTunnelSpec) -> Result<Self> {
        let tunnel = client.expose_tcp(spec).await?;
        Ok(TemporaryTunnel { client, id: tunnel.id })
    }

    pub fn id(&self) -> &TunnelId {
        &self.id
    }

    /// Closes the tunnel then disconnects the owning client, aggregating
    /// both failures into a single [`Error::Cleanup`] if either fails.
    pub async fn close(self) -> Result<()> {
        let mut causes = Vec::new();
        if let Err(e) = self.client.close_tunnel(&self.id).await {
            causes.push((self.id.clone(), e));
        }
        if let Err(e) = self.client.disconnect().await {
            causes.push((self.id.clone(), e));
        }
        Error::from_cleanup(causes)
    }
}
