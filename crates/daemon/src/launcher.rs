//! Renderer subprocesses and the startup handshake.
//!
//! A renderer is considered ready once its stdout contains the readiness
//! marker for the port it was given. Until then the launch can end three ways:
//! marker seen, process exited, or the startup deadline passed (the process
//! group is killed).
//!
//! Renderers run in their own process group so that servers they fork (`npx`
//! runs the real server as a grandchild) go down with them.

use crate::deck::DeckId;
use crate::error::{PreviewError, Result};
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_MARKER: &str = "http://localhost:{port}";
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;
const READ_CHUNK: usize = 8 * 1024;
/// Unmatched stdout kept for marker matching; must exceed any marker length.
const MARKER_WINDOW: usize = 4 * 1024;
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Text a renderer prints once it is serving. `{port}` is replaced by the
/// assigned port.
#[derive(Debug, Clone)]
pub struct ReadinessMarker {
    template: String,
}

impl ReadinessMarker {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn expected(&self, port: u16) -> String {
        self.template.replace("{port}", &port.to_string())
    }

    /// Whether `output` announces `port`. A longer port that merely starts
    /// with the same digits does not count.
    pub fn matches(&self, output: &str, port: u16) -> bool {
        let expected = self.expected(port);
        output.match_indices(&expected).any(|(idx, _)| {
            !output[idx + expected.len()..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit())
        })
    }
}

impl Default for ReadinessMarker {
    fn default() -> Self {
        Self::new(DEFAULT_MARKER)
    }
}

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Executable to run, e.g. `npx`.
    pub program: String,
    /// Arguments placed before `<deck> --port <port> --remote`.
    pub args: Vec<String>,
    pub marker: ReadinessMarker,
    pub startup_timeout: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: "npx".to_string(),
            args: vec!["slidev".to_string()],
            marker: ReadinessMarker::default(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }
}

/// A renderer that completed its handshake.
#[derive(Debug)]
pub struct RendererProcess {
    child: Child,
    pid: Option<u32>,
    port: u16,
    output: Vec<JoinHandle<()>>,
}

impl RendererProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill the renderer's process group and wait for the renderer to be reaped.
    pub async fn kill(&mut self) -> io::Result<()> {
        kill_group(self.pid);
        if let Err(e) = self.child.start_kill() {
            if !self.has_exited() {
                return Err(e);
            }
        }

        match timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Error waiting for renderer {:?}: {}", self.pid, e),
            Err(_) => warn!("Timeout waiting for renderer {:?} to exit", self.pid),
        }

        for task in self.output.drain(..) {
            task.abort();
        }
        Ok(())
    }
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!(pgid = raw, "killed renderer process group"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = raw, error = %e, "failed to kill renderer process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[derive(Debug, Clone, Default)]
pub struct Launcher {
    config: LauncherConfig,
}

impl Launcher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    /// Start the renderer for `deck` on `port` and wait for its handshake.
    pub async fn spawn(&self, deck: &DeckId, deck_path: &Path, port: u16) -> Result<RendererProcess> {
        let port_arg = port.to_string();
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(deck_path)
            .args(["--port", port_arg.as_str(), "--remote"])
            .env("NODE_OPTIONS", "--no-warnings")
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(dir) = deck_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }

        let launch_failed = |status: String, stderr: String| PreviewError::LaunchFailed {
            deck: deck.to_string(),
            status,
            stderr,
        };

        let mut child = cmd
            .spawn()
            .map_err(|e| launch_failed(format!("could not spawn {}: {}", self.config.program, e), String::new()))?;
        let pid = child.id();
        info!(%deck, port, ?pid, "starting renderer");

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            kill_group(pid);
            return Err(launch_failed("output streams unavailable".into(), String::new()));
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let captured = Arc::new(Mutex::new(String::new()));
        let stdout_task = tokio::spawn(watch_stdout(
            stdout,
            deck.clone(),
            self.config.marker.clone(),
            port,
            ready_tx,
        ));
        let mut stderr_task = tokio::spawn(capture_stderr(stderr, deck.clone(), captured.clone()));

        let deadline = Instant::now() + self.config.startup_timeout;
        let startup = timeout_at(deadline, wait_for_ready(&mut child, ready_rx)).await;
        match startup {
            Ok(Ok(())) => {
                info!(%deck, port, ?pid, "renderer ready");
                Ok(RendererProcess {
                    child,
                    pid,
                    port,
                    output: vec![stdout_task, stderr_task],
                })
            }
            Ok(Err(status)) => {
                // Anything the renderer forked must not outlive the failed launch.
                kill_group(pid);
                // The pipe closes with the process; let the reader catch up.
                let _ = timeout(Duration::from_secs(1), &mut stderr_task).await;
                let stderr = captured
                    .lock()
                    .map(|s| s.clone())
                    .unwrap_or_default();
                warn!(%deck, port, %status, "renderer exited before becoming ready");
                Err(launch_failed(status, stderr))
            }
            Err(_) => {
                warn!(%deck, port, ?pid, "renderer startup timed out, killing");
                kill_group(pid);
                if let Err(e) = child.kill().await {
                    warn!(%deck, "failed to kill renderer: {}", e);
                }
                stdout_task.abort();
                stderr_task.abort();
                Err(PreviewError::LaunchTimeout {
                    deck: deck.to_string(),
                    timeout: self.config.startup_timeout,
                })
            }
        }
    }
}

/// `Ok` once the marker is seen, `Err(exit description)` if the process ends first.
async fn wait_for_ready(child: &mut Child, ready: oneshot::Receiver<()>) -> std::result::Result<(), String> {
    let marker_seen = tokio::select! {
        biased;
        seen = ready => seen.is_ok(),
        status = child.wait() => return Err(describe_exit(status)),
    };
    if marker_seen {
        return Ok(());
    }
    // stdout closed without the marker; the process decides the outcome.
    Err(describe_exit(child.wait().await))
}

fn describe_exit(status: io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    }
}

/// Read `stream` to the end in fixed-size chunks, handing each one over as text.
async fn drain(mut stream: impl AsyncRead + Unpin, mut on_chunk: impl FnMut(&str)) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => on_chunk(&String::from_utf8_lossy(&buf[..n])),
        }
    }
}

/// Drop the front of `text` so at most `max` bytes remain.
fn keep_tail(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = text.len() - max;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
}

/// Append as much of `chunk` as fits under `limit` bytes.
fn append_capped(buf: &mut String, chunk: &str, limit: usize) {
    let mut take = limit.saturating_sub(buf.len()).min(chunk.len());
    while !chunk.is_char_boundary(take) {
        take -= 1;
    }
    buf.push_str(&chunk[..take]);
}

async fn watch_stdout(
    stdout: impl AsyncRead + Unpin,
    deck: DeckId,
    marker: ReadinessMarker,
    port: u16,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    let mut pending = String::new();
    drain(stdout, |chunk| {
        debug!(%deck, "renderer: {}", chunk.trim_end());
        if ready.is_none() {
            return;
        }
        pending.push_str(chunk);
        if marker.matches(&pending, port) {
            if let Some(tx) = ready.take() {
                let _ = tx.send(());
            }
            pending = String::new();
        } else {
            keep_tail(&mut pending, MARKER_WINDOW);
        }
    })
    .await;
}

async fn capture_stderr(stderr: impl AsyncRead + Unpin, deck: DeckId, captured: Arc<Mutex<String>>) {
    drain(stderr, |chunk| {
        warn!(%deck, "renderer stderr: {}", chunk.trim_end());
        if let Ok(mut buf) = captured.lock() {
            append_capped(&mut buf, chunk, STDERR_CAPTURE_LIMIT);
        }
    })
    .await;
}
