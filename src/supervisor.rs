//! Process Supervisor (spec §4.5, component E).
//!
//! Owns the lifecycle of one `frpc` child process: spawning it against a
//! rendered config file, waiting for readiness or a fatal pattern in its
//! output, and stopping it gracefully (`SIGTERM`, then `SIGKILL` after a
//! timeout).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};

use crate::error::{Error, Result};

/// Supervisor lifecycle state (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl SupervisorState {
    fn can_transition_to(self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Stopping, Stopped)
        )
    }
}

/// Bounded capture of the most recent lines an agent process wrote, used
/// both for readiness/fatal-pattern scanning and for diagnostics snapshots.
#[derive(Debug, Default, Clone)]
pub struct OutputRing {
    lines: std::collections::VecDeque<String>,
    capacity: usize,
}

impl OutputRing {
    fn new(capacity: usize) -> Self {
        OutputRing {
            lines: std::collections::VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

const OUTPUT_RING_CAPACITY: usize = 200;
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MIN_STARTUP_WAIT: Duration = Duration::from_millis(500);
const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(5);

/// Substrings in agent output that indicate a specific startup failure
/// rather than ordinary progress (spec §4.5).
const AUTH_FAILURE_PATTERNS: &[&str] = &[
    "authentication failed",
    "invalid token",
    "auth failed",
    "login to server failed",
];
const PORT_IN_USE_PATTERNS: &[&str] = &["address already in use", "bind: address in use"];

struct Inner {
    state: SupervisorState,
    child: Option<Child>,
    output: Arc<Mutex<OutputRing>>,
}

/// Supervises exactly one agent process. Cloning a `Supervisor` shares the
/// same underlying process handle (spec §5: snapshot-under-lock, release,
/// act, reacquire discipline).
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Mutex<Inner>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor {
            inner: Arc::new(Mutex::new(Inner {
                state: SupervisorState::Stopped,
                child: None,
                output: Arc::new(Mutex::new(OutputRing::new(OUTPUT_RING_CAPACITY))),
            })),
        }
    }

    pub async fn state(&self) -> SupervisorState {
        self.inner.lock().await.state
    }

    /// Spawns `binary -c config_path` and waits for readiness.
    ///
    /// The lock is held only to read/commit the transition; the blocking
    /// wait for readiness happens outside the lock so a concurrent `state()`
    /// call during startup does not deadlock (spec §5).
    pub async fn start(
        &self,
        binary: &Path,
        config_path: &Path,
        startup_timeout: Option<Duration>,
        min_startup_wait: Option<Duration>,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != SupervisorState::Stopped {
                return Err(Error::invalid_state(format!(
                    "supervisor in state {:?}, cannot start",
                    inner.state
                )));
            }
            inner.state = SupervisorState::Starting;
        }

        let mut command = Command::new(binary);
        command
            .arg("-c")
            .arg(config_path)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.inner.lock().await.state = SupervisorState::Stopped;
                return Err(Error::Connection(e.to_string()));
            }
        };

        info!("spawned frpc process (pid {:?})", child.id());

        let output = Arc::new(Mutex::new(OutputRing::new(OUTPUT_RING_CAPACITY)));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        spawn_reader(stdout, Arc::clone(&output));
        spawn_reader(stderr, Arc::clone(&output));

        let readiness = wait_for_readiness(
            &mut child,
            Arc::clone(&output),
            startup_timeout.unwrap_or(DEFAULT_STARTUP_TIMEOUT),
            min_startup_wait.unwrap_or(DEFAULT_MIN_STARTUP_WAIT),
        )
        .await;

        let mut inner = self.inner.lock().await;
        match readiness {
            Ok(()) => {
                inner.child = Some(child);
                inner.output = output;
                inner.state = SupervisorState::Running;
                info!("frpc reported ready");
                Ok(())
            }
            Err(e) => {
                drop(child);
                inner.state = SupervisorState::Stopped;
                warn!("frpc failed to become ready: {e}");
                Err(e)
            }
        }
    }

    /// Sends `SIGTERM`, waits up to `graceful_timeout`, then `SIGKILL`s if
    /// the process has not exited (spec §4.5). Degrades to `Child::kill()`
    /// on non-Unix targets.
    pub async fn stop(&self, graceful_timeout: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != SupervisorState::Running {
            return Err(Error::invalid_state(format!(
                "supervisor in state {:?}, cannot stop",
                inner.state
            )));
        }
        inner.state = SupervisorState::Stopping;
        let mut child = match inner.child.take() {
            Some(c) => c,
            None => {
                inner.state = SupervisorState::Stopped;
                return Ok(());
            }
        };
        drop(inner);

        let grace = graceful_timeout.unwrap_or(DEFAULT_GRACEFUL_TIMEOUT);
        send_terminate(&child);

        let waited = timeout(grace, child.wait()).await;
        match waited {
            Ok(Ok(status)) => {
                debug!("frpc exited gracefully: {status}");
            }
            Ok(Err(e)) => {
                error!("error waiting on frpc process: {e}");
            }
            Err(_) => {
                warn!("frpc did not exit within {grace:?}, sending SIGKILL");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        self.inner.lock().await.state = SupervisorState::Stopped;
        Ok(())
    }

    /// Stop followed by start against a possibly new config path. Runs
    /// under the supervisor's own mutex so no other caller observes an
    /// intermediate `Stopped` state (spec §6 "Restart").
    pub async fn restart(
        &self,
        binary: &Path,
        config_path: &Path,
        startup_timeout: Option<Duration>,
        min_startup_wait: Option<Duration>,
        graceful_timeout: Option<Duration>,
    ) -> Result<()> {
        self.stop(graceful_timeout).await?;
        self.start(binary, config_path, startup_timeout, min_startup_wait)
            .await
    }

    pub async fn output_snapshot(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.output.lock().await.snapshot()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    if let Some(pid) = child.id() {
        let pid = Pid::from_raw(pid as i32);
        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            warn!("failed to send SIGTERM: {e}");
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &Child) {
    // No POSIX signals off Unix; best effort is a direct kill request.
    warn!("graceful stop is not supported on this platform, killing directly");
    let _ = child.id();
}

fn spawn_reader<R>(reader: Option<R>, output: Arc<Mutex<OutputRing>>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let Some(reader) = reader else { return };
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!("frpc: {line}");
                    output.lock().await.push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("error reading frpc output: {e}");
                    break;
                }
            }
        }
    });
}

/// Waits for the supervised process to become ready (spec §4.5): readiness
/// is declared once (a) the child is still alive, (b) `min_startup_wait` has
/// elapsed, and (c) no fatal pattern has appeared in its output — there is
/// no positive "ready" pattern to wait for, since not every agent build logs
/// one. A fatal pattern fails immediately regardless of how much of
/// `min_startup_wait` remains; a child that exits before that without one
/// fails immediately too, rather than riding out the rest of the timeout.
async fn wait_for_readiness(
    child: &mut Child,
    output: Arc<Mutex<OutputRing>>,
    startup_timeout: Duration,
    min_startup_wait: Duration,
) -> Result<()> {
    let deadline = Instant::now() + startup_timeout;
    let min_deadline = Instant::now() + min_startup_wait;

    loop {
        {
            let ring = output.lock().await;
            for line in ring.lines.iter() {
                let lower = line.to_lowercase();
                if AUTH_FAILURE_PATTERNS.iter().any(|p| lower.contains(p)) {
                    return Err(Error::Authentication(line.clone()));
                }
                if PORT_IN_USE_PATTERNS.iter().any(|p| lower.contains(p)) {
                    return Err(Error::PortInUse(line.clone()));
                }
            }
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(Error::Connection(format!(
                    "agent process exited during startup with {status}"
                )));
            }
            Ok(None) => {}
            Err(e) => return Err(Error::Io(e)),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::StartupTimeout(startup_timeout));
        }
        if now >= min_deadline {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_state_transitions_are_documented() {
        use SupervisorState::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
    }

    #[test]
    fn output_ring_drops_oldest_once_full() {
        let mut ring = OutputRing::new(2);
        ring.push("a".to_string());
        ring.push("b".to_string());
        ring.push("c".to_string());
        assert_eq!(ring.snapshot(), vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn new_supervisor_starts_stopped() {
        let supervisor = Supervisor::new();
        assert_eq!(supervisor.state().await, SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn stop_on_a_stopped_supervisor_is_rejected() {
        let supervisor = Supervisor::new();
        let result = supervisor.stop(None).await;
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    async fn sleeping_child() -> Child {
        Command::new("sh")
            .arg("-c")
            .arg("sleep 5")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn readiness_detects_auth_failure_pattern() {
        let mut child = sleeping_child().await;
        let output = Arc::new(Mutex::new(OutputRing::new(10)));
        output
            .lock()
            .await
            .push("2024/01/01 login failed: authentication failed".to_string());
        let result = wait_for_readiness(
            &mut child,
            output,
            Duration::from_millis(200),
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(result, Err(Error::Authentication(_))));
        let _ = child.start_kill();
    }

    #[tokio::test]
    async fn readiness_detects_port_in_use_pattern() {
        let mut child = sleeping_child().await;
        let output = Arc::new(Mutex::new(OutputRing::new(10)));
        output
            .lock()
            .await
            .push("bind: address already in use".to_string());
        let result = wait_for_readiness(
            &mut child,
            output,
            Duration::from_millis(200),
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(result, Err(Error::PortInUse(_))));
        let _ = child.start_kill();
    }

    #[tokio::test]
    async fn readiness_succeeds_once_min_startup_wait_elapses_with_no_fatal_pattern() {
        let mut child = sleeping_child().await;
        let output = Arc::new(Mutex::new(OutputRing::new(10)));
        // No "ready" line ever appears — spec §4.5 does not require one.
        let result = wait_for_readiness(
            &mut child,
            output,
            Duration::from_millis(500),
            Duration::from_millis(50),
        )
        .await;
        assert!(result.is_ok());
        let _ = child.start_kill();
    }

    #[tokio::test]
    async fn readiness_fails_fast_when_the_child_exits_before_min_startup_wait() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("exit 0")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let output = Arc::new(Mutex::new(OutputRing::new(10)));
        let started = Instant::now();
        let result = wait_for_readiness(
            &mut child,
            output,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(Error::Connection(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn readiness_times_out_when_min_startup_wait_exceeds_startup_timeout() {
        let mut child = sleeping_child().await;
        let output = Arc::new(Mutex::new(OutputRing::new(10)));
        let result = wait_for_readiness(
            &mut child,
            output,
            Duration::from_millis(50),
            Duration::from_millis(500),
        )
        .await;
        assert!(matches!(result, Err(Error::StartupTimeout(_))));
        let _ = child.start_kill();
    }
}
