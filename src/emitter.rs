//! TOML Emitter (spec §4.3, §6, component C).
//!
//! Produces the agent's on-disk TOML config deterministically: the same
//! [`Configuration`] always emits byte-identical text, with a fixed key
//! order and consistent formatting, so diffs and idempotence tests are
//! meaningful. Top-level keys and the `[[proxies]]` list-of-tables follow
//! the field names spec §6 pins down (`serverAddr`, `auth.token`,
//! `tls.enable`, `transport.poolCount`, `customDomains`, `locations`,
//! `requestHeaders.set.*`, ...).

use std::fmt::Write as _;

use crate::error::Result;
use crate::model::{Configuration, TunnelSpec};

/// Renders `configuration` as the agent's TOML config.
///
/// Key order is fixed rather than derived from a `HashMap`, which is what
/// makes repeated emission byte-identical: top-level scalars first (TOML
/// requires this before any table), then `[auth]`/`[tls]`/`[transport]`/
/// `[log]`, then one `[[proxies]]` entry per tunnel in registry insertion
/// order.
pub fn emit(configuration: &Configuration) -> Result<Vec<u8>> {
    let mut out = String::new();

    writeln!(out, "serverAddr = {}", quote(&configuration.server.host)).ok();
    writeln!(out, "serverPort = {}", configuration.server.port.get()).ok();
    out.push('\n');

    if let Some(token) = &configuration.server.token {
        writeln!(out, "[auth]").ok();
        writeln!(out, "token = {}", quote(token.expose())).ok();
        out.push('\n');
    }

    writeln!(out, "[tls]").ok();
    writeln!(out, "enable = {}", configuration.server.tls).ok();
    out.push('\n');

    writeln!(out, "[transport]").ok();
    writeln!(out, "poolCount = {}", configuration.server.max_pool).ok();
    out.push('\n');

    writeln!(out, "[log]").ok();
    writeln!(out, "level = {}", quote(&configuration.logging.level)).ok();
    if let Some(file) = &configuration.logging.file {
        writeln!(out, "to = {}", quote(file)).ok();
    }
    writeln!(out, "maxDays = {}", configuration.logging.backups).ok();
    writeln!(out, "maxSize = {}", configuration.logging.max_size_mb).ok();
    out.push('\n');

    for tunnel in configuration.tunnels() {
        writeln!(out, "[[proxies]]").ok();
        writeln!(out, "name = {}", quote(tunnel.id.as_str())).ok();
        match &tunnel.spec {
            TunnelSpec::Http(h) => {
                writeln!(out, "type = \"http\"").ok();
                writeln!(out, "localIP = \"127.0.0.1\"").ok();
                writeln!(out, "localPort = {}", h.local_port.get()).ok();
                writeln!(
                    out,
                    "customDomains = [{}]",
                    list(h.custom_domains.iter().map(|d| d.as_str()))
                )
                .ok();
                writeln!(
                    out,
                    "locations = [{}]",
                    list(std::iter::once(h.path.as_location().as_str()))
                )
                .ok();
                writeln!(out, "useEncryption = {}", h.encryption).ok();
                writeln!(out, "useCompression = {}", h.compression).ok();
                writeln!(out, "websocketCompat = {}", h.websocket).ok();
                writeln!(out, "stripPath = {}", h.strip_path).ok();
                if let Some(rewrite) = &h.host_header_rewrite {
                    writeln!(out, "hostHeaderRewrite = {}", quote(rewrite)).ok();
                }
                if let Some(auth) = &h.basic_auth {
                    writeln!(out, "httpUser = {}", quote(&auth.user)).ok();
                    writeln!(out, "httpPwd = {}", quote(&auth.pass)).ok();
                }
                if !h.remove_headers.is_empty() {
                    writeln!(
                        out,
                        "removeHeaders = [{}]",
                        list(h.remove_headers.iter().map(String::as_str))
                    )
                    .ok();
                }
                if !h.set_headers.is_empty() {
                    writeln!(out, "[proxies.requestHeaders.set]").ok();
                    for (name, value) in &h.set_headers {
                        writeln!(out, "{} = {}", name, quote(value)).ok();
                    }
                }
            }
            TunnelSpec::Tcp(t) => {
                writeln!(out, "type = \"tcp\"").ok();
                writeln!(out, "localIP = \"127.0.0.1\"").ok();
                writeln!(out, "localPort = {}", t.local_port.get()).ok();
                if let Some(remote) = t.remote_port {
                    writeln!(out, "remotePort = {}", remote.get()).ok();
                }
            }
        }
        out.push('\n');
    }

    Ok(out.into_bytes())
}

fn list<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.map(quote).collect::<Vec<_>>().join(", ")
}

/// A quoted, escaped TOML basic string.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Configuration, HttpTunnelSpec, ServerSpec, Tunnel, TunnelSpec};
    use crate::types::{Domain, PathSegment, Port, Token, TunnelId};
    use std::collections::BTreeSet;

    fn sample_configuration() -> Configuration {
        let server = ServerSpec::new("tunnel.example.com")
            .unwrap()
            .with_port(Port::of(7000).unwrap())
            .with_token(Token::of("s3cret-abcdefgh").unwrap());
        let mut domains = BTreeSet::new();
        domains.insert(Domain::of("example.com").unwrap());
        let http = HttpTunnelSpec::new(Port::of(3000).unwrap(), PathSegment::of("myapp").unwrap(), domains)
            .unwrap();
        let tunnel = Tunnel::new(TunnelId::of("web").unwrap(), TunnelSpec::Http(http));
        Configuration::new(server).add_tunnel(tunnel).unwrap()
    }

    #[test]
    fn emission_is_idempotent() {
        let cfg = sample_configuration();
        let a = emit(&cfg).unwrap();
        let b = emit(&cfg).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn emitted_text_contains_expected_keys() {
        let cfg = sample_configuration();
        let text = String::from_utf8(emit(&cfg).unwrap()).unwrap();
        assert!(text.contains("serverAddr = \"tunnel.example.com\""));
        assert!(text.contains("serverPort = 7000"));
        assert!(text.contains("[auth]"));
        assert!(text.contains("[tls]"));
        assert!(text.contains("[transport]"));
        assert!(text.contains("[[proxies]]"));
        assert!(text.contains("type = \"http\""));
        assert!(text.contains("localPort = 3000"));
        assert!(text.contains("customDomains = [\"example.com\"]"));
        assert!(text.contains("locations = [\"/myapp\"]"));
    }

    #[test]
    fn the_emitted_text_round_trips_through_a_standard_toml_parser() {
        let cfg = sample_configuration();
        let text = String::from_utf8(emit(&cfg).unwrap()).unwrap();
        let parsed: toml::Value = toml::from_str(&text).unwrap();
        let proxies = parsed.get("proxies").unwrap().as_array().unwrap();
        assert_eq!(proxies.len(), 1);
        let proxy = &proxies[0];
        assert_eq!(proxy.get("type").unwrap().as_str().unwrap(), "http");
        assert_eq!(proxy.get("localPort").unwrap().as_integer().unwrap(), 3000);
        assert_eq!(
            proxy.get("customDomains").unwrap().as_array().unwrap()[0]
                .as_str()
                .unwrap(),
            "example.com"
        );
        assert_eq!(
            proxy.get("locations").unwrap().as_array().unwrap()[0]
                .as_str()
                .unwrap(),
            "/myapp"
        );
    }

    #[test]
    fn token_is_emitted_raw_not_masked() {
        let cfg = sample_configuration();
        let text = String::from_utf8(emit(&cfg).unwrap()).unwrap();
        assert!(text.contains("s3cret-abcdefgh"));
    }

    #[test]
    fn quoting_escapes_special_characters() {
        assert_eq!(quote("a\"b"), "\"a\\\"b\"");
        assert_eq!(quote("a\\b"), "\"a\\\\b\"");
    }

    #[test]
    fn tcp_tunnel_without_remote_port_omits_the_key() {
        let server = ServerSpec::new("s").unwrap();
        let tcp = crate::model::TcpTunnelSpec {
            local_port: Port::of(22).unwrap(),
            remote_port: None,
        };
        let tunnel = Tunnel::new(TunnelId::of("ssh").unwrap(), TunnelSpec::Tcp(tcp));
        let cfg = Configuration::new(server).add_tunnel(tunnel).unwrap();
        let text = String::from_utf8(emit(&cfg).unwrap()).unwrap();
        assert!(!text.contains("remotePort"));
    }

    #[test]
    fn set_headers_are_emitted_under_a_request_headers_subtable() {
        let server = ServerSpec::new("s").unwrap();
        let mut domains = BTreeSet::new();
        domains.insert(Domain::of("example.com").unwrap());
        let http = HttpTunnelSpec::new(Port::of(3000).unwrap(), PathSegment::of("app").unwrap(), domains)
            .unwrap()
            .with_set_header("X-Forwarded-App", "demo")
            .unwrap();
        let tunnel = Tunnel::new(TunnelId::of("web").unwrap(), TunnelSpec::Http(http));
        let cfg = Configuration::new(server).add_tunnel(tunnel).unwrap();
        let text = String::from_utf8(emit(&cfg).unwrap()).unwrap();
        assert!(text.contains("[proxies.requestHeaders.set]"));
        assert!(text.contains("X-Forwarded-App = \"demo\""));
        let parsed: toml::Value = toml::from_str(&text).unwrap();
        let proxy = &parsed.get("proxies").unwrap().as_array().unwrap()[0];
        let set = proxy
            .get("requestHeaders")
            .unwrap()
            .get("set")
            .unwrap()
            .get("X-Forwarded-App")
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(set, "demo");
    }
}
