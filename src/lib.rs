//! Control plane for supervising an `frpc` reverse-proxy tunnel agent.
//!
//! [`Client`](client::Client) is the entry point: resolve the agent binary,
//! connect, expose HTTP/TCP tunnels, and close them again, all backed by a
//! validated [`Configuration`](model::Configuration) and a supervised child
//! process.

pub mod client;
pub mod config;
pub mod emitter;
pub mod error;
pub mod group;
pub mod locator;
pub mod model;
pub mod registry;
pub mod supervisor;
pub mod types;

pub use client::{Client, ClientConfig, Timing};
pub use error::{Error, Result};
pub use group::{Group, TeardownOrder, TemporaryTunnel};
pub use model::{
    BasicAuth, Configuration, HttpTunnelSpec, LoggingSpec, ServerSpec, TcpTunnelSpec, Tunnel,
    TunnelSpec,
};
pub use registry::Registry;
pub use supervisor::{Supervisor, SupervisorState};
pub use types::{Domain, PathSegment, Port, Token, TunnelId, TunnelIdStrategy, TunnelKind, TunnelStatus};
