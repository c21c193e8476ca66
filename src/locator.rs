//! Binary Locator (spec §4.4, component D).
//!
//! Resolves the path to the `frpc` executable the supervisor will spawn,
//! in a fixed priority order, and optionally probes its reported version
//! for diagnostics without failing the resolution if that probe fails.

use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;

use crate::error::{Error, Result};

/// Env var consulted between an explicit path and a `PATH` search.
pub const BINARY_ENV_VAR: &str = "FRPC_BINARY";

/// Fixed install roots checked last, in order, mirroring common package
/// manager, manual-install, and per-user locations (spec §4.4 step 4).
/// `~/.local/bin/frpc` and `./bin/frpc` are resolved relative to `HOME` and
/// the current working directory respectively at search time.
const FIXED_INSTALL_ROOTS: &[&str] = &[
    "/usr/local/bin/frpc",
    "/usr/bin/frpc",
    "/opt/frp/frpc",
];

/// Roots whose first path segment needs runtime expansion before joining
/// with `frpc`, checked after [`FIXED_INSTALL_ROOTS`].
fn expanded_install_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(home) = std::env::var_os("HOME") {
        roots.push(PathBuf::from(home).join(".local/bin/frpc"));
    }
    roots.push(PathBuf::from("./bin/frpc"));
    roots
}

/// A resolved agent binary: its path and, if the probe succeeded, the
/// version string it reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedBinary {
    pub path: PathBuf,
    pub version: Option<String>,
}

/// Resolves the agent binary path per spec §4.4's order:
/// 1. `explicit`, if given, must exist and be executable.
/// 2. `FRPC_BINARY` env var, same requirement.
/// 3. `PATH` search via `which`.
/// 4. A fixed list of common install roots: `/usr/local/bin`, `/usr/bin`,
///    `/opt/frp`, `~/.local/bin`, `./bin`.
///
/// Returns [`Error::BinaryNotFound`] listing every location checked if none
/// resolve.
pub fn locate(explicit: Option<&Path>) -> Result<LocatedBinary> {
    let mut searched = Vec::new();

    if let Some(path) = explicit {
        searched.push(path.display().to_string());
        if is_executable(path) {
            return Ok(finish(path.to_path_buf()));
        }
    }

    if let Ok(from_env) = std::env::var(BINARY_ENV_VAR) {
        let path = PathBuf::from(&from_env);
        searched.push(path.display().to_string());
        if is_executable(&path) {
            return Ok(finish(path));
        }
    }

    searched.push("$PATH".to_string());
    if let Ok(found) = which::which("frpc") {
        return Ok(finish(found));
    }

    for root in FIXED_INSTALL_ROOTS {
        let path = PathBuf::from(root);
        searched.push(path.display().to_string());
        if is_executable(&path) {
            return Ok(finish(path));
        }
    }

    for path in expanded_install_roots() {
        searched.push(path.display().to_string());
        if is_executable(&path) {
            return Ok(finish(path));
        }
    }

    Err(Error::BinaryNotFound { searched })
}

fn finish(path: PathBuf) -> LocatedBinary {
    let version = probe_version(&path);
    LocatedBinary { path, version }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Runs `<binary> --version` and records stdout, never failing resolution
/// if the probe itself errors (spec §4.4: "optional and non-failing").
fn probe_version(path: &Path) -> Option<String> {
    match Command::new(path).arg("--version").output() {
        Ok(output) if output.status.success() => {
            let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        Ok(_) => None,
        Err(e) => {
            debug!("version probe failed for {}: {e}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fake_binary(dir: &Path, name: &str, executable: bool) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\necho fake-version-1.0").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = f.metadata().unwrap().permissions();
            perms.set_mode(if executable { 0o755 } else { 0o644 });
            std::fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    #[test]
    fn explicit_path_wins_when_executable() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write_fake_binary(dir.path(), "frpc", true);
        let located = locate(Some(&bin)).unwrap();
        assert_eq!(located.path, bin);
    }

    #[test]
    fn non_executable_explicit_path_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write_fake_binary(dir.path(), "frpc", false);
        std::env::remove_var(BINARY_ENV_VAR);
        let result = locate(Some(&bin));
        #[cfg(unix)]
        assert!(result.is_err());
        let _ = result;
    }

    #[test]
    fn not_found_lists_every_location_searched() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        std::env::remove_var(BINARY_ENV_VAR);
        match locate(Some(&missing)) {
            Err(Error::BinaryNotFound { searched }) => {
                assert!(searched.iter().any(|s| s.contains("does-not-exist")));
                assert!(searched.contains(&"$PATH".to_string()));
                assert!(searched.iter().any(|s| s.contains(".local/bin/frpc")));
                assert!(searched.iter().any(|s| s.contains("./bin/frpc")));
            }
            other => panic!("expected BinaryNotFound, got {other:?}"),
        }
    }

    #[test]
    fn env_var_is_honored_when_no_explicit_path_given() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write_fake_binary(dir.path(), "frpc-env", true);
        std::env::set_var(BINARY_ENV_VAR, &bin);
        let located = locate(None).unwrap();
        assert_eq!(located.path, bin);
        std::env::remove_var(BINARY_ENV_VAR);
    }
}
