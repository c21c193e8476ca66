//! Client Facade (spec §4.7, §5, component H).
//!
//! The single entry point applications use: `Connect`, `Disconnect`,
//! `ExposeHttp`, `ExposeTcp`, `ListTunnels`, `CloseTunnel`. Internally
//! coordinates the [`Registry`] and [`Supervisor`], re-rendering and
//! restarting the agent process whenever the tunnel set changes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tempfile::TempPath;
use tokio::sync::Mutex;

use crate::emitter;
use crate::error::{Error, Result};
use crate::locator::{self, LocatedBinary};
use crate::model::{
    Configuration, HttpTunnelSpec, ServerSpec, TcpTunnelSpec, Tunnel, TunnelSpec,
};
use crate::registry::Registry;
use crate::supervisor::{Supervisor, SupervisorState};
use crate::types::{Domain, PathSegment, Port, TunnelId, TunnelIdStrategy, TunnelKind, TunnelStatus};

/// Tunable timing knobs for the underlying supervisor, exposed at the
/// facade so callers don't need to reach past it (spec §4.5, §4.7 defaults).
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub startup_timeout: Duration,
    pub min_startup_wait: Duration,
    pub graceful_timeout: Duration,
    /// Bound on how long `ExposeHTTP`/`ExposeTCP` wait for the newly
    /// admitted tunnel to reach `Connected` before failing (spec §4.7).
    pub tunnel_ready_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            startup_timeout: Duration::from_secs(10),
            min_startup_wait: Duration::from_millis(500),
            graceful_timeout: Duration::from_secs(5),
            tunnel_ready_timeout: Duration::from_secs(5),
        }
    }
}

/// Everything needed to stand up a [`Client`] (spec §3 `ClientConfig`).
pub struct ClientConfig {
    pub server: ServerSpec,
    pub binary: Option<PathBuf>,
    pub id_strategy: TunnelIdStrategy,
    pub max_tunnels: usize,
    pub timing: Timing,
}

impl ClientConfig {
    pub fn new(server: ServerSpec) -> Self {
        ClientConfig {
            server,
            binary: None,
            id_strategy: TunnelIdStrategy::default(),
            max_tunnels: crate::model::DEFAULT_MAX_TUNNELS,
            timing: Timing::default(),
        }
    }
}

struct State {
    configuration: Configuration,
    config_path: Option<TempPath>,
}

/// The control-plane client applications hold on to. Cheap to clone; every
/// clone shares the same underlying agent process and registry.
#[derive(Clone)]
pub struct Client {
    registry: Arc<Registry>,
    supervisor: Supervisor,
    state: Arc<Mutex<State>>,
    binary: LocatedBinary,
    id_strategy: TunnelIdStrategy,
    timing: Timing,
    degraded: Arc<AtomicBool>,
}

impl Client {
    /// Resolves the agent binary and prepares an unstarted client. Does not
    /// spawn a process until [`Client::connect`] is called.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let binary = locator::locate(config.binary.as_deref())?;
        if let Some(version) = &binary.version {
            info!("resolved frpc binary at {:?} ({version})", binary.path);
        } else {
            info!("resolved frpc binary at {:?}", binary.path);
        }
        let configuration = Configuration::new(config.server).with_max_tunnels(config.max_tunnels)?;
        Ok(Client {
            registry: Arc::new(Registry::new(configuration.clone())),
            supervisor: Supervisor::new(),
            state: Arc::new(Mutex::new(State {
                configuration,
                config_path: None,
            })),
            binary,
            id_strategy: config.id_strategy,
            timing: config.timing,
            degraded: Arc::new(AtomicBool::new(false)),
        })
    }

    fn ensure_not_degraded(&self) -> Result<()> {
        if self.degraded.load(Ordering::SeqCst) {
            return Err(Error::Degraded);
        }
        Ok(())
    }

    /// Renders `configuration` and (re)starts the supervised process
    /// against it, committing it as the client's current state on success.
    async fn apply(&self, configuration: Configuration, restart_if_running: bool) -> Result<()> {
        let rendered = emitter::emit(&configuration)?;

        let path = tempfile::Builder::new()
            .prefix("frpctl-")
            .suffix(".toml")
            .tempfile()
            .map_err(Error::Io)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let file = path.as_file();
            let mut perms = file.metadata().map_err(Error::Io)?.permissions();
            perms.set_mode(0o600);
            file.set_permissions(perms).map_err(Error::Io)?;
        }
        std::io::Write::write_all(&mut path.as_file(), &rendered).map_err(Error::Io)?;
        let temp_path = path.into_temp_path();

        let running = self.supervisor.state().await == SupervisorState::Running;
        if running && restart_if_running {
            self.supervisor
                .restart(
                    &self.binary.path,
                    &temp_path,
                    Some(self.timing.startup_timeout),
                    Some(self.timing.min_startup_wait),
                    Some(self.timing.graceful_timeout),
                )
                .await?;
        } else if !running {
            self.supervisor
                .start(
                    &self.binary.path,
                    &temp_path,
                    Some(self.timing.startup_timeout),
                    Some(self.timing.min_startup_wait),
                )
                .await?;
        }

        let mut state = self.state.lock().await;
        state.configuration = configuration;
        state.config_path = Some(temp_path);
        Ok(())
    }

    /// Renders the current registry snapshot and (re)starts the supervised
    /// process against it. Used by `connect` and every mutation that needs
    /// the agent to pick up a new tunnel set.
    ///
    /// If this restarts an already-running process and the restart fails,
    /// spec §4.7's failure policy is to roll back rather than degrade
    /// immediately: `rollback_tunnel`, if given, is dropped from the
    /// registry (undoing the admit that triggered this call), then the
    /// previously-committed configuration is re-applied. Only if that
    /// rollback attempt also fails does the client enter degraded mode.
    async fn render_and_apply(&self, restart_if_running: bool) -> Result<()> {
        self.render_and_apply_rollback_on_failure(restart_if_running, None)
            .await
    }

    async fn render_and_apply_rollback_on_failure(
        &self,
        restart_if_running: bool,
        rollback_tunnel: Option<&TunnelId>,
    ) -> Result<()> {
        let configuration = self.registry.snapshot().await;
        let was_running = self.supervisor.state().await == SupervisorState::Running;

        match self.apply(configuration, restart_if_running).await {
            Ok(()) => Ok(()),
            Err(e) if was_running && restart_if_running => {
                error!("restart after configuration change failed, attempting rollback: {e}");
                if let Some(id) = rollback_tunnel {
                    if let Err(remove_err) = self.registry.remove(id).await {
                        warn!("failed to drop rolled-back tunnel {id} from the registry: {remove_err}");
                    }
                }
                let previous = self.state.lock().await.configuration.clone();
                match self.apply(previous, true).await {
                    Ok(()) => Err(e),
                    Err(rollback_err) => {
                        error!(
                            "rollback also failed, entering degraded mode: {rollback_err}"
                        );
                        self.degraded.store(true, Ordering::SeqCst);
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Renders the (possibly empty) registry and starts the supervised
    /// process (spec §4.7 `Connect`).
    pub async fn connect(&self) -> Result<()> {
        self.ensure_not_degraded()?;
        self.render_and_apply(false).await
    }

    /// Stops the supervised process, best-effort closes every tunnel still
    /// in the registry, and removes the rendered config file (spec §4.7,
    /// §6: "the file is removed on Disconnect"). Aggregates any per-tunnel
    /// close failures into a single [`Error::Cleanup`].
    pub async fn disconnect(&self) -> Result<()> {
        self.ensure_not_degraded()?;
        self.supervisor
            .stop(Some(self.timing.graceful_timeout))
            .await?;

        let mut causes = Vec::new();
        for tunnel in self.registry.list().await {
            if let Err(e) = self.discard_tunnel(&tunnel.id, tunnel.status).await {
                causes.push((tunnel.id, e));
            }
        }

        self.state.lock().await.config_path = None;

        Error::from_cleanup(causes)
    }

    /// Removes a tunnel from the registry, walking it through `Disconnected`
    /// first if it was live, without touching the supervised process —
    /// used by `disconnect`, which has already stopped it.
    async fn discard_tunnel(&self, id: &TunnelId, status: TunnelStatus) -> Result<()> {
        if status == TunnelStatus::Connected {
            self.registry.transition(id, TunnelStatus::Disconnected).await?;
        }
        self.registry.remove(id).await
    }

    fn next_id(&self, kind: TunnelKind, local_port: Port, discriminant: &str) -> TunnelId {
        match self.id_strategy {
            TunnelIdStrategy::Random => TunnelId::random(),
            TunnelIdStrategy::Descriptive => TunnelId::descriptive(kind, local_port, discriminant),
        }
    }

    /// Registers an HTTP tunnel, restarts the agent with the new tunnel set
    /// applied, and drives it from `Pending` through `Connecting` to
    /// `Connected`, bounded by `tunnel_ready_timeout` (spec §4.7
    /// `ExposeHTTP`). On timeout the tunnel is left in `Connecting` and an
    /// error is returned rather than a half-ready `Tunnel`.
    pub async fn expose_http(&self, spec: HttpTunnelSpec) -> Result<Tunnel> {
        self.ensure_not_degraded()?;
        let discriminant = spec
            .custom_domains
            .iter()
            .next()
            .map(Domain::as_str)
            .unwrap_or("http")
            .to_string();
        let id = self.next_id(TunnelKind::Http, spec.local_port, &discriminant);
        let tunnel = Tunnel::new(id.clone(), TunnelSpec::Http(spec));
        self.registry.register(tunnel).await?;
        self.render_and_apply_rollback_on_failure(true, Some(&id)).await?;
        self.drive_to_connected(&id).await
    }

    /// Registers a TCP tunnel and drives it to `Connected` the same way as
    /// [`Client::expose_http`] (spec §4.7 `ExposeTCP`).
    pub async fn expose_tcp(&self, spec: TcpTunnelSpec) -> Result<Tunnel> {
        self.ensure_not_degraded()?;
        let discriminant = spec
            .remote_port
            .map(|p| p.get().to_string())
            .unwrap_or_else(|| "auto".to_string());
        let id = self.next_id(TunnelKind::Tcp, spec.local_port, &discriminant);
        let tunnel = Tunnel::new(id.clone(), TunnelSpec::Tcp(spec));
        self.registry.register(tunnel).await?;
        self.render_and_apply_rollback_on_failure(true, Some(&id)).await?;
        self.drive_to_connected(&id).await
    }

    /// Transitions a freshly admitted tunnel `Pending -> Connecting`, then
    /// waits for the supervised process to be `Running` (it already is, by
    /// the time `render_and_apply` returns `Ok`, but the wait is bounded
    /// defensively rather than assumed) before transitioning it to
    /// `Connected`. Leaves the tunnel in `Connecting` on timeout.
    async fn drive_to_connected(&self, id: &TunnelId) -> Result<Tunnel> {
        self.registry.transition(id, TunnelStatus::Connecting).await?;

        let ready = tokio::time::timeout(self.timing.tunnel_ready_timeout, async {
            while self.supervisor.state().await != SupervisorState::Running {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;

        if ready.is_err() {
            return Err(Error::StartupTimeout(self.timing.tunnel_ready_timeout));
        }

        self.registry.transition(id, TunnelStatus::Connected).await
    }

    pub async fn list_tunnels(&self) -> Vec<Tunnel> {
        self.registry.list().await
    }

    /// Removes a tunnel from the registry and restarts the agent without it
    /// (spec §4.7 `CloseTunnel`). Walks the tunnel through `Disconnected`
    /// before removal if it was live, so the state machine never skips a
    /// documented edge on the way to gone.
    pub async fn close_tunnel(&self, id: &TunnelId) -> Result<()> {
        self.ensure_not_degraded()?;
        if let Some(tunnel) = self.registry.get(id).await {
            if tunnel.status == TunnelStatus::Connected {
                self.registry.transition(id, TunnelStatus::Disconnected).await?;
            }
        }
        self.registry.remove(id).await?;
        self.render_and_apply(true).await
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub async fn output_snapshot(&self) -> Vec<String> {
        self.supervisor.output_snapshot().await
    }

    pub fn binary(&self) -> &LocatedBinary {
        &self.binary
    }
}
