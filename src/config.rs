//! Demo-binary settings, loaded from the environment (ambient stack).
//!
//! Unlike the library's `Error`-returning APIs, this is read only by
//! `src/main.rs` before anything else runs, so panicking on a malformed
//! (not merely missing) value is acceptable here.

use std::sync::OnceLock;

mod env {
    pub const SERVER_HOST: &str = "FRPCTL_SERVER_HOST";
    pub const SERVER_PORT: &str = "FRPCTL_SERVER_PORT";
    pub const SERVER_TOKEN: &str = "FRPCTL_SERVER_TOKEN";
}

static CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u32,
    pub server_token: Option<String>,
}

impl Config {
    fn load() -> Self {
        let server_host =
            std::env::var(env::SERVER_HOST).unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = std::env::var(env::SERVER_PORT)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(7000);
        let server_token = std::env::var(env::SERVER_TOKEN).ok();
        Config {
            server_host,
            server_port,
            server_token,
        }
    }
}

/// Loads `.env` if present, then the process environment. Must be called
/// once at startup before [`get`].
pub fn init() {
    let _ = dotenvy::dotenv();
    CONFIG.get_or_init(Config::load);
}

/// Returns the global settings. Panics if [`init`] was never called.
pub fn get() -> &'static Config {
    CONFIG.get().expect("config not initialized, call config::init() first")
}
