//! Configuration Model (spec §3, §4.2, component B).
//!
//! Holds a validated snapshot of everything the agent needs. Mutations are
//! functional: every `with_*`/`add_*`/`remove_*` method returns a new value
//! and never mutates the receiver, mirroring the teacher's frozen-record
//! style (`state.rs`'s `TunnelInfo`, copied-and-replaced rather than mutated
//! in place).

use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::types::{Domain, PathSegment, Port, Token, TunnelId, TunnelKind, TunnelStatus};

/// HTTP header name syntax per spec §3: `[A-Za-z0-9_\-]+`.
fn validate_header_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::validation(format!("invalid header name: {name}")));
    }
    Ok(())
}

/// Basic-auth credentials, validated as `user:pass` with both sides non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub user: String,
    pub pass: String,
}

impl BasicAuth {
    pub fn parse(value: &str) -> Result<Self> {
        let mut parts = value.splitn(2, ':');
        let user = parts.next().unwrap_or("");
        let pass = match parts.next() {
            Some(p) => p,
            None => {
                return Err(Error::validation(
                    "basic auth must contain exactly one ':'",
                ))
            }
        };
        if user.is_empty() || pass.is_empty() {
            return Err(Error::validation(
                "basic auth user and password must both be non-empty",
            ));
        }
        Ok(BasicAuth {
            user: user.to_string(),
            pass: pass.to_string(),
        })
    }
}

/// The HTTP-specific half of a [`TunnelSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTunnelSpec {
    pub local_port: Port,
    pub path: PathSegment,
    pub custom_domains: BTreeSet<Domain>,
    pub strip_path: bool,
    pub websocket: bool,
    pub compression: bool,
    pub encryption: bool,
    pub set_headers: BTreeMap<String, String>,
    pub remove_headers: BTreeSet<String>,
    pub host_header_rewrite: Option<String>,
    pub basic_auth: Option<BasicAuth>,
}

impl HttpTunnelSpec {
    pub fn new(local_port: Port, path: PathSegment, custom_domains: BTreeSet<Domain>) -> Result<Self> {
        if custom_domains.is_empty() {
            return Err(Error::validation(
                "HTTP tunnel requires at least one custom domain",
            ));
        }
        Ok(HttpTunnelSpec {
            local_port,
            path,
            custom_domains,
            strip_path: true,
            websocket: true,
            compression: false,
            encryption: false,
            set_headers: BTreeMap::new(),
            remove_headers: BTreeSet::new(),
            host_header_rewrite: None,
            basic_auth: None,
        })
    }

    pub fn with_set_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_header_name(&name)?;
        self.set_headers.insert(name, value.into());
        Ok(self)
    }

    pub fn with_remove_header(mut self, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_header_name(&name)?;
        self.remove_headers.insert(name);
        Ok(self)
    }

    pub fn with_basic_auth(mut self, value: &str) -> Result<Self> {
        self.basic_auth = Some(BasicAuth::parse(value)?);
        Ok(self)
    }

    /// Computed public URL for a connected tunnel (first domain, scheme
    /// chosen by whether the server enforces TLS is out of this struct's
    /// scope — callers combine this with [`ServerSpec::tls`]).
    pub fn url(&self, domain: &Domain, tls: bool) -> String {
        let scheme = if tls { "https" } else { "http" };
        format!("{}://{}{}/", scheme, domain, self.path.as_location())
    }
}

/// The TCP-specific half of a [`TunnelSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpTunnelSpec {
    pub local_port: Port,
    pub remote_port: Option<Port>,
}

/// A tagged variant over the two tunnel kinds (spec §9: no virtual-dispatch
/// hierarchy is required; emitter and registry pattern-match on the tag).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TunnelSpec {
    Http(HttpTunnelSpec),
    Tcp(TcpTunnelSpec),
}

impl TunnelSpec {
    pub fn kind(&self) -> TunnelKind {
        match self {
            TunnelSpec::Http(_) => TunnelKind::Http,
            TunnelSpec::Tcp(_) => TunnelKind::Tcp,
        }
    }

    pub fn local_port(&self) -> Port {
        match self {
            TunnelSpec::Http(h) => h.local_port,
            TunnelSpec::Tcp(t) => t.local_port,
        }
    }

    pub fn as_http(&self) -> Option<&HttpTunnelSpec> {
        match self {
            TunnelSpec::Http(h) => Some(h),
            TunnelSpec::Tcp(_) => None,
        }
    }

    pub fn as_tcp(&self) -> Option<&TcpTunnelSpec> {
        match self {
            TunnelSpec::Tcp(t) => Some(t),
            TunnelSpec::Http(_) => None,
        }
    }
}

/// One declared tunnel together with its observed lifecycle state.
///
/// Immutable by construction: every state change produces a new `Tunnel`
/// that replaces the prior one in the registry (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: TunnelId,
    pub spec: TunnelSpec,
    pub status: TunnelStatus,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Server-assigned remote port for a TCP tunnel with no caller-supplied
    /// `remote_port`, surfaced once the tunnel reaches `Connected` (spec §3).
    pub assigned_remote_port: Option<Port>,
}

impl Tunnel {
    pub fn new(id: TunnelId, spec: TunnelSpec) -> Self {
        Tunnel {
            id,
            spec,
            status: TunnelStatus::Pending,
            created_at: Utc::now(),
            connected_at: None,
            last_error: None,
            assigned_remote_port: None,
        }
    }

    /// Returns a new `Tunnel` transitioned to `next`, or `InvalidState` if
    /// the transition is not one of the allowed edges in spec §4.6.
    pub fn transition(&self, next: TunnelStatus) -> Result<Tunnel> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_state(format!(
                "tunnel {} cannot go from {} to {next}",
                self.id, self.status
            )));
        }
        let mut copy = self.clone();
        copy.status = next;
        if next == TunnelStatus::Connected {
            copy.connected_at = Some(Utc::now());
        }
        Ok(copy)
    }

    pub fn with_error(&self, message: impl Into<String>) -> Result<Tunnel> {
        let mut copy = self.transition(TunnelStatus::Error)?;
        copy.last_error = Some(message.into());
        Ok(copy)
    }

    pub fn with_assigned_remote_port(&self, port: Port) -> Tunnel {
        let mut copy = self.clone();
        copy.assigned_remote_port = Some(port);
        copy
    }
}

/// The remote server a client's agent connects to (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    pub host: String,
    pub port: Port,
    pub token: Option<Token>,
    pub tls: bool,
    pub max_pool: u32,
}

impl ServerSpec {
    pub fn new(host: impl Into<String>) -> Result<Self> {
        let host = host.into();
        if host.is_empty() {
            return Err(Error::validation("server host must not be empty"));
        }
        Ok(ServerSpec {
            host,
            port: Port::of(7000).expect("7000 is a valid port"),
            token: None,
            tls: false,
            max_pool: 1,
        })
    }

    pub fn with_port(mut self, port: Port) -> Self {
        self.port = port;
        self
    }

    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_max_pool(mut self, max_pool: u32) -> Result<Self> {
        if max_pool < 1 {
            return Err(Error::validation("max_pool must be >= 1"));
        }
        self.max_pool = max_pool;
        Ok(self)
    }
}

/// Logging configuration forwarded into the emitted agent config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSpec {
    pub level: String,
    pub file: Option<String>,
    pub max_size_mb: u32,
    pub backups: u32,
}

impl Default for LoggingSpec {
    fn default() -> Self {
        LoggingSpec {
            level: "info".to_string(),
            file: None,
            max_size_mb: 10,
            backups: 3,
        }
    }
}

/// Default, config-bounded cap on registry size (spec §3).
pub const DEFAULT_MAX_TUNNELS: usize = 10;
/// Hard ceiling a caller-supplied `max_tunnels` may never exceed (spec §3).
pub const MAX_TUNNELS_CEILING: usize = 100;

/// The full, immutable snapshot of one agent instance's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub server: ServerSpec,
    tunnels: Vec<Tunnel>,
    pub logging: LoggingSpec,
    max_tunnels: usize,
}

impl Configuration {
    pub fn new(server: ServerSpec) -> Self {
        Configuration {
            server,
            tunnels: Vec::new(),
            logging: LoggingSpec::default(),
            max_tunnels: DEFAULT_MAX_TUNNELS,
        }
    }

    pub fn with_max_tunnels(mut self, max_tunnels: usize) -> Result<Self> {
        if max_tunnels == 0 || max_tunnels > MAX_TUNNELS_CEILING {
            return Err(Error::validation(format!(
                "max_tunnels must be in [1, {MAX_TUNNELS_CEILING}]"
            )));
        }
        self.max_tunnels = max_tunnels;
        Ok(self)
    }

    pub fn max_tunnels(&self) -> usize {
        self.max_tunnels
    }

    /// Functional update of the server block; never mutates the receiver.
    pub fn with_server(&self, server: ServerSpec) -> Configuration {
        let mut copy = self.clone();
        copy.server = server;
        copy
    }

    pub fn with_logging(&self, logging: LoggingSpec) -> Configuration {
        let mut copy = self.clone();
        copy.logging = logging;
        copy
    }

    pub fn tunnels(&self) -> &[Tunnel] {
        &self.tunnels
    }

    pub fn find(&self, id: &TunnelId) -> Option<&Tunnel> {
        self.tunnels.iter().find(|t| &t.id == id)
    }

    /// Admits `tunnel` at the end of the ordered list, enforcing every
    /// registry-level invariant from spec §3. Returns a new `Configuration`;
    /// the receiver is unchanged on both success and failure.
    pub fn add_tunnel(&self, tunnel: Tunnel) -> Result<Configuration> {
        if self.tunnels.len() >= self.max_tunnels {
            return Err(Error::Capacity(format!(
                "registry already holds the maximum of {} tunnels",
                self.max_tunnels
            )));
        }
        if self.tunnels.iter().any(|t| t.id == tunnel.id) {
            return Err(Error::conflict(format!(
                "tunnel id '{}' already exists",
                tunnel.id
            )));
        }
        if let Some(new_http) = tunnel.spec.as_http() {
            for existing in &self.tunnels {
                if let Some(existing_http) = existing.spec.as_http() {
                    if http_paths_conflict(new_http, existing_http) {
                        return Err(Error::conflict(format!(
                            "path '{}' on tunnel '{}' conflicts with existing tunnel '{}'",
                            new_http.path, tunnel.id, existing.id
                        )));
                    }
                }
            }
        }
        if let Some(new_tcp) = tunnel.spec.as_tcp() {
            if let Some(remote) = new_tcp.remote_port {
                for existing in &self.tunnels {
                    if let Some(existing_tcp) = existing.spec.as_tcp() {
                        if existing_tcp.remote_port == Some(remote) {
                            return Err(Error::conflict(format!(
                                "remote port {} on tunnel '{}' conflicts with existing tunnel '{}'",
                                remote, tunnel.id, existing.id
                            )));
                        }
                    }
                }
            }
        }
        let mut copy = self.clone();
        copy.tunnels.push(tunnel);
        Ok(copy)
    }

    /// Removes the tunnel with `id`, returning a new `Configuration`.
    /// Errors if no such tunnel exists.
    pub fn remove_tunnel(&self, id: &TunnelId) -> Result<Configuration> {
        if !self.tunnels.iter().any(|t| &t.id == id) {
            return Err(Error::conflict(format!("no tunnel with id '{id}'")));
        }
        let mut copy = self.clone();
        copy.tunnels.retain(|t| &t.id != id);
        Ok(copy)
    }

    /// Replaces an existing tunnel in place (same position in the ordered
    /// list), used when a tunnel's status changes without altering
    /// membership or ordering (spec §6: "Restart preserves ordering").
    pub fn replace_tunnel(&self, updated: Tunnel) -> Result<Configuration> {
        let mut copy = self.clone();
        let idx = copy
            .tunnels
            .iter()
            .position(|t| t.id == updated.id)
            .ok_or_else(|| Error::conflict(format!("no tunnel with id '{}'", updated.id)))?;
        copy.tunnels[idx] = updated;
        Ok(copy)
    }

    /// A pure dictionary-like projection of this configuration, used both
    /// by the emitter's round-trip tests and by ordinary structural-diff
    /// assertions (spec §4.2, §8).
    pub fn as_value(&self) -> Value {
        json!({
            "server": {
                "host": self.server.host,
                "port": self.server.port.get(),
                "tls": self.server.tls,
                "max_pool": self.server.max_pool,
            },
            "tunnels": self.tunnels.iter().map(tunnel_value).collect::<Vec<_>>(),
        })
    }
}

fn tunnel_value(t: &Tunnel) -> Value {
    match &t.spec {
        TunnelSpec::Http(h) => json!({
            "id": t.id.as_str(),
            "type": "http",
            "localPort": h.local_port.get(),
            "locations": [h.path.as_location()],
            "customDomains": h.custom_domains.iter().map(Domain::as_str).collect::<Vec<_>>(),
        }),
        TunnelSpec::Tcp(tc) => json!({
            "id": t.id.as_str(),
            "type": "tcp",
            "localPort": tc.local_port.get(),
            "remotePort": tc.remote_port.map(Port::get),
        }),
    }
}

/// Path-conflict check from spec §4.6: two HTTP specs conflict if they
/// share a domain and their paths are equal, one prefixes the other at a
/// `/` boundary, or a wildcard pattern on one matches the other's literal
/// path.
pub fn http_paths_conflict(a: &HttpTunnelSpec, b: &HttpTunnelSpec) -> bool {
    if a.custom_domains.is_disjoint(&b.custom_domains) {
        return false;
    }
    let pa = a.path.as_str();
    let pb = b.path.as_str();
    if pa == pb {
        return true;
    }
    if path_prefix_overlap(pa, pb) {
        return true;
    }
    if wildcard_match(pa, pb) || wildcard_match(pb, pa) {
        return true;
    }
    false
}

/// True when `x` is a prefix of `y` ending at a `/` boundary, or vice versa.
fn path_prefix_overlap(x: &str, y: &str) -> bool {
    let (shorter, longer) = if x.len() <= y.len() { (x, y) } else { (y, x) };
    if !longer.starts_with(shorter) {
        return false;
    }
    longer.as_bytes().get(shorter.len()) == Some(&b'/')
}

/// Compiles `pattern` (containing `*` with greedy semantics) into a regex
/// and checks whether it matches `literal`. Callers are expected to memoise
/// this per insertion, as spec §4.6 requires; [`crate::registry::Registry`]
/// does so via its conflict index.
fn wildcard_match(pattern: &str, literal: &str) -> bool {
    if !pattern.contains('*') {
        return false;
    }
    let escaped = regex::escape(pattern).replace("\\*", ".*");
    match Regex::new(&format!("^{escaped}$")) {
        Ok(re) => re.is_match(literal),
        Err(_) => false,
    }
}

/// `SystemTime`-based helper retained for components that interoperate with
/// `std::time` (e.g. ring-buffer timestamps); the configuration model itself
/// standardises on `chrono::DateTime<Utc>`.
pub fn now_system() -> SystemTime {
    SystemTime::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn domains(names: &[&str]) -> BTreeSet<Domain> {
        names.iter().map(|d| Domain::of(*d).unwrap()).collect()
    }

    fn http_tunnel(id: &str, port: u32, path: &str, domains_: &[&str]) -> Tunnel {
        let spec = HttpTunnelSpec::new(
            Port::of(port).unwrap(),
            PathSegment::of(path).unwrap(),
            domains(domains_),
        )
        .unwrap();
        Tunnel::new(TunnelId::of(id).unwrap(), TunnelSpec::Http(spec))
    }

    fn tcp_tunnel(id: &str, port: u32, remote: Option<u32>) -> Tunnel {
        let spec = TcpTunnelSpec {
            local_port: Port::of(port).unwrap(),
            remote_port: remote.map(|p| Port::of(p).unwrap()),
        };
        Tunnel::new(TunnelId::of(id).unwrap(), TunnelSpec::Tcp(spec))
    }

    #[test]
    fn basic_auth_requires_single_colon_and_nonempty_sides() {
        assert!(BasicAuth::parse("user").is_err());
        assert!(BasicAuth::parse("user:").is_err());
        assert!(BasicAuth::parse(":pw").is_err());
        assert!(BasicAuth::parse("user:pw").is_ok());
    }

    #[test]
    fn http_spec_requires_nonempty_domains() {
        let err = HttpTunnelSpec::new(
            Port::of(3000).unwrap(),
            PathSegment::of("app").unwrap(),
            BTreeSet::new(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn add_and_remove_tunnel_round_trips() {
        let cfg = Configuration::new(ServerSpec::new("tunnel.example.com").unwrap());
        let t = http_tunnel("a", 3000, "app", &["example.com"]);
        let cfg = cfg.add_tunnel(t).unwrap();
        assert_eq!(cfg.tunnels().len(), 1);
        let cfg = cfg.remove_tunnel(&TunnelId::of("a").unwrap()).unwrap();
        assert!(cfg.tunnels().is_empty());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let cfg = Configuration::new(ServerSpec::new("s").unwrap());
        let cfg = cfg
            .add_tunnel(http_tunnel("a", 3000, "app", &["example.com"]))
            .unwrap();
        let result = cfg.add_tunnel(http_tunnel("a", 3001, "other", &["example.com"]));
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[test]
    fn exact_path_conflict_on_shared_domain_is_rejected() {
        let cfg = Configuration::new(ServerSpec::new("s").unwrap());
        let cfg = cfg
            .add_tunnel(http_tunnel("a", 3000, "app", &["example.com"]))
            .unwrap();
        let result = cfg.add_tunnel(http_tunnel("b", 3001, "app", &["example.com"]));
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[test]
    fn disjoint_domains_do_not_conflict() {
        let cfg = Configuration::new(ServerSpec::new("s").unwrap());
        let cfg = cfg
            .add_tunnel(http_tunnel("a", 3000, "app", &["example.com"]))
            .unwrap();
        let result = cfg.add_tunnel(http_tunnel("b", 3001, "app", &["other.com"]));
        assert!(result.is_ok());
    }

    #[test]
    fn prefix_overlap_is_a_conflict() {
        let a = http_tunnel("a", 3000, "app", &["example.com"]);
        let b = http_tunnel("b", 3001, "app/v2", &["example.com"]);
        let conflict = http_paths_conflict(a.spec.as_http().unwrap(), b.spec.as_http().unwrap());
        assert!(conflict);
    }

    #[test]
    fn path_conflict_is_symmetric() {
        let a = http_tunnel("a", 3000, "app", &["example.com"]).spec;
        let b = http_tunnel("b", 3001, "app/v2", &["example.com"]).spec;
        let (ha, hb) = (a.as_http().unwrap(), b.as_http().unwrap());
        assert_eq!(http_paths_conflict(ha, hb), http_paths_conflict(hb, ha));
    }

    #[test]
    fn wildcard_pattern_matches_literal_sibling() {
        let a = http_tunnel("a", 3000, "api/*", &["example.com"]);
        let b = http_tunnel("b", 3001, "api/users", &["example.com"]);
        let conflict = http_paths_conflict(a.spec.as_http().unwrap(), b.spec.as_http().unwrap());
        assert!(conflict);
    }

    #[test]
    fn tcp_remote_port_conflict_is_rejected() {
        let cfg = Configuration::new(ServerSpec::new("s").unwrap());
        let cfg = cfg.add_tunnel(tcp_tunnel("a", 22, Some(2222))).unwrap();
        let result = cfg.add_tunnel(tcp_tunnel("b", 23, Some(2222)));
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[test]
    fn tcp_without_remote_port_never_conflicts() {
        let cfg = Configuration::new(ServerSpec::new("s").unwrap());
        let cfg = cfg.add_tunnel(tcp_tunnel("a", 22, None)).unwrap();
        let result = cfg.add_tunnel(tcp_tunnel("b", 23, None));
        assert!(result.is_ok());
    }

    #[test]
    fn capacity_is_enforced_without_side_effects() {
        let mut cfg = Configuration::new(ServerSpec::new("s").unwrap())
            .with_max_tunnels(1)
            .unwrap();
        cfg = cfg.add_tunnel(tcp_tunnel("a", 1000, None)).unwrap();
        let result = cfg.add_tunnel(tcp_tunnel("b", 1001, None));
        assert!(matches!(result, Err(Error::Capacity(_))));
        assert_eq!(cfg.tunnels().len(), 1);
    }

    #[test]
    fn max_tunnels_is_bounded() {
        let cfg = Configuration::new(ServerSpec::new("s").unwrap());
        assert!(cfg.clone().with_max_tunnels(0).is_err());
        assert!(cfg.clone().with_max_tunnels(101).is_err());
        assert!(cfg.with_max_tunnels(100).is_ok());
    }

    #[test]
    fn insertion_order_is_preserved() {
        let cfg = Configuration::new(ServerSpec::new("s").unwrap());
        let cfg = cfg
            .add_tunnel(http_tunnel("a", 3000, "a", &["example.com"]))
            .unwrap()
            .add_tunnel(http_tunnel("b", 3001, "b", &["example.com"]))
            .unwrap()
            .add_tunnel(http_tunnel("c", 3002, "c", &["example.com"]))
            .unwrap();
        let cfg = cfg.remove_tunnel(&TunnelId::of("b").unwrap()).unwrap();
        let cfg = cfg
            .add_tunnel(http_tunnel("d", 3003, "d", &["example.com"]))
            .unwrap();
        let ids: Vec<_> = cfg.tunnels().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "d"]);
    }

    #[test]
    fn emitting_the_same_configuration_twice_is_idempotent() {
        let cfg = Configuration::new(ServerSpec::new("s").unwrap())
            .add_tunnel(tcp_tunnel("a", 22, Some(2222)))
            .unwrap();
        assert_eq!(cfg.as_value(), cfg.as_value());
    }
}
