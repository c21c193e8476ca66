//! Demo binary for the `frpctl` control plane.
//!
//! Exposes one HTTP tunnel and one TCP tunnel against a locally resolved
//! `frpc` binary, then waits for Ctrl-C before tearing everything down.
//! Not a CLI surface for the library: `frpctl` has no wire protocol or
//! command-line interface of its own, applications embed the library
//! directly.

use std::collections::BTreeSet;

use anyhow::Context;
use log::info;

use frpctl::{
    Client, ClientConfig, Domain, HttpTunnelSpec, PathSegment, Port, ServerSpec, TcpTunnelSpec,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    frpctl::config::init();
    let settings = frpctl::config::get();

    let mut server = ServerSpec::new(settings.server_host.clone())
        .context("invalid server host")?
        .with_port(Port::of(settings.server_port).context("invalid server port")?);
    if let Some(token) = &settings.server_token {
        server = server.with_token(frpctl::Token::of(token.clone()).context("invalid token")?);
    }

    let client = Client::new(ClientConfig::new(server)).context("failed to resolve frpc binary")?;
    info!("using frpc at {:?}", client.binary().path);

    client.connect().await.context("failed to connect")?;

    let mut domains = BTreeSet::new();
    domains.insert(Domain::of("demo.example.com")?);
    let http_spec = HttpTunnelSpec::new(Port::of(3000)?, PathSegment::of("app")?, domains)?;
    let http_tunnel = client.expose_http(http_spec).await.context("expose_http failed")?;
    let http_id = http_tunnel.id;
    info!("exposed HTTP tunnel {http_id} ({})", http_tunnel.status);

    let tcp_spec = TcpTunnelSpec {
        local_port: Port::of(22)?,
        remote_port: Some(Port::of(2222)?),
    };
    let tcp_tunnel = client.expose_tcp(tcp_spec).await.context("expose_tcp failed")?;
    let tcp_id = tcp_tunnel.id;
    info!("exposed TCP tunnel {tcp_id} ({})", tcp_tunnel.status);

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutting down");

    client.close_tunnel(&http_id).await.context("failed to close HTTP tunnel")?;
    client.close_tunnel(&tcp_id).await.context("failed to close TCP tunnel")?;
    client.disconnect().await.context("failed to disconnect")?;

    Ok(())
}
