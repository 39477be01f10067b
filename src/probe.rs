//! Running external tools under a deadline.
//!
//! Every subprocess is owned by the call that spawned it: on deadline or
//! cancellation it is killed and reaped before the call returns.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ProbeToolConfig, ScanConfig};
use crate::error::tail_on_char_boundary;
use crate::types::Endpoint;

/// How long to wait for pipe readers once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How a bounded subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Completed(ExitStatus),
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub exit: Exit,
    pub stdout: String,
    pub stderr: String,
}

/// Spawn `program args..`, capture both streams (each capped at
/// `max_output_bytes`) and wait at most `timeout` or until `cancel` fires.
///
/// Returns `Err` only when the process could not be started or waited on.
pub async fn run_bounded(
    program: &str,
    args: &[String],
    timeout: Duration,
    max_output_bytes: usize,
    cancel: &CancellationToken,
) -> std::io::Result<ProcessOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group: a wrapper (`sh -c ...`) and whatever it starts
    // go down together.
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
    let mut child = cmd.spawn()?;

    let stdout_task = child
        .stdout
        .take()
        .map(|s| tokio::spawn(drain(s, max_output_bytes)));
    let stderr_task = child
        .stderr
        .take()
        .map(|s| tokio::spawn(drain(s, max_output_bytes)));

    let waited = tokio::select! {
        res = time::timeout(timeout, child.wait()) => match res {
            Ok(Ok(status)) => Ok(Exit::Completed(status)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(Exit::TimedOut),
        },
        _ = cancel.cancelled() => Ok(Exit::Cancelled),
    };

    if !matches!(waited, Ok(Exit::Completed(_))) {
        terminate(&mut child, program).await;
    }

    let stdout = collect(stdout_task).await;
    let stderr = collect(stderr_task).await;
    Ok(ProcessOutput {
        exit: waited?,
        stdout,
        stderr,
    })
}

/// Kill the child's process group, then kill and reap the child itself.
///
/// The child is not reaped yet when this runs, so its pid (the group id)
/// cannot have been reused.
async fn terminate(child: &mut Child, program: &str) {
    let pid = child.id();
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            kill_group(pid, program);
        }
    }
    match child.kill().await {
        Ok(()) => debug!(program, ?pid, "killed subprocess"),
        Err(e) => warn!(program, error = %e, "failed to kill subprocess"),
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32, program: &str) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        warn!(program, pgid, error = %e, "failed to kill process group");
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, max: usize) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                // Keep reading past the cap so the child never blocks on a full pipe.
                let room = max.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    kept
}

async fn collect(task: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(handle) = task else {
        return String::new();
    };
    let abort = handle.abort_handle();
    match time::timeout(DRAIN_GRACE, handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            // A grandchild still holds the pipe open.
            abort.abort();
            String::new()
        }
    }
}

/// Result of running the probe tool against one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Completed {
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
    },
    TimedOut {
        partial: String,
    },
    Cancelled {
        partial: String,
    },
    LaunchFailed {
        reason: String,
    },
}

/// Runs the probe tool, once per endpoint, with no retries.
#[derive(Debug, Clone)]
pub struct ProbeInvoker {
    tool: ProbeToolConfig,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ProbeInvoker {
    pub fn new(tool: ProbeToolConfig, timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            tool,
            timeout,
            max_output_bytes,
        }
    }

    pub fn from_config(cfg: &ScanConfig) -> Self {
        Self::new(cfg.probe.clone(), cfg.probe_timeout, cfg.max_output_bytes)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arguments for one endpoint: `[extra..] [-6] -Pn -sV --script <script> -p <port> -oX - <ip>`.
    ///
    /// Extra args come first so a wrapper (`sh -c ...`) can be configured.
    pub fn command_args(&self, endpoint: &Endpoint) -> Vec<String> {
        let mut args = self.tool.extra_args.clone();
        if endpoint.ip.is_ipv6() {
            args.push("-6".to_string());
        }
        args.extend([
            "-Pn".to_string(),
            "-sV".to_string(),
            "--script".to_string(),
            self.tool.script.clone(),
            "-p".to_string(),
            endpoint.port.to_string(),
            "-oX".to_string(),
            "-".to_string(),
            endpoint.ip.to_string(),
        ]);
        args
    }

    pub fn command_line(&self, endpoint: &Endpoint) -> String {
        let mut line = self.tool.program.clone();
        for arg in self.command_args(endpoint) {
            line.push(' ');
            line.push_str(&arg);
        }
        line
    }

    pub async fn invoke(&self, endpoint: &Endpoint, cancel: &CancellationToken) -> Invocation {
        let args = self.command_args(endpoint);
        let out = match run_bounded(
            &self.tool.program,
            &args,
            self.timeout,
            self.max_output_bytes,
            cancel,
        )
        .await
        {
            Ok(out) => out,
            Err(e) => {
                return Invocation::LaunchFailed {
                    reason: format!("failed to start {}: {e}", self.tool.program),
                }
            }
        };

        match out.exit {
            Exit::TimedOut => Invocation::TimedOut {
                partial: out.stdout,
            },
            Exit::Cancelled => Invocation::Cancelled {
                partial: out.stdout,
            },
            Exit::Completed(status) if !status.success() && out.stdout.trim().is_empty() => {
                let tail = tail_on_char_boundary(out.stderr.trim(), 512);
                Invocation::LaunchFailed {
                    reason: format!("{} exited with {status}: {tail}", self.tool.program),
                }
            }
            Exit::Completed(status) => Invocation::Completed {
                stdout: out.stdout,
                stderr: out.stderr,
                exit_code: status.code(),
            },
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn captures_stdout_and_exit() {
        let cancel = CancellationToken::new();
        let out = run_bounded(
            "sh",
            &sh("echo hello; echo oops >&2"),
            Duration::from_secs(5),
            1024,
            &cancel,
        )
        .await
        .unwrap();
        assert!(matches!(out.exit, Exit::Completed(s) if s.success()));
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
    }

    #[tokio::test]
    async fn caps_captured_output() {
        let cancel = CancellationToken::new();
        let out = run_bounded(
            "sh",
            &sh("i=0; while [ $i -lt 100 ]; do echo 0123456789; i=$((i+1)); done"),
            Duration::from_secs(5),
            64,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(out.stdout.len(), 64);
    }

    #[tokio::test]
    async fn timeout_kills_promptly() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let out = run_bounded(
            "sh",
            &sh("echo partial; exec sleep 30"),
            Duration::from_millis(300),
            1024,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(out.exit, Exit::TimedOut);
        assert_eq!(out.stdout, "partial\n");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn timeout_kills_background_children_too() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("bg.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pidfile.display());
        let out = run_bounded(
            "sh",
            &sh(&script),
            Duration::from_millis(300),
            1024,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.exit, Exit::TimedOut);

        let pid = std::fs::read_to_string(&pidfile).unwrap();
        assert!(gone_within(pid.trim(), Duration::from_secs(2)).await);
    }

    /// True once `pid` no longer names a live (non-zombie) process.
    async fn gone_within(pid: &str, limit: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if !alive(pid) {
                return true;
            }
            time::sleep(Duration::from_millis(50)).await;
        }
        !alive(pid)
    }

    fn alive(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            // Zombies wait for init to reap them; they no longer run.
            Ok(stat) => stat
                .rsplit_once(") ")
                .map_or(true, |(_, rest)| !rest.starts_with('Z')),
            Err(_) if std::path::Path::new("/proc/self").exists() => false,
            Err(_) => std::process::Command::new("kill")
                .args(["-0", pid])
                .status()
                .map(|s| s.success())
                .unwrap_or(false),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let cancel = CancellationToken::new();
        let res = run_bounded(
            "/definitely/not/a/real/probe-binary",
            &[],
            Duration::from_secs(1),
            1024,
            &cancel,
        )
        .await;
        assert!(res.is_err());
    }

    #[test]
    fn probe_arguments_target_one_port() {
        let inv = ProbeInvoker::new(ProbeToolConfig::default(), Duration::from_secs(1), 1024);
        let ep = Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 8443);
        assert_eq!(
            inv.command_line(&ep),
            "nmap -Pn -sV --script ssl-enum-ciphers -p 8443 -oX - 10.0.0.7"
        );
        let v6 = Endpoint::new("fd00::2".parse().unwrap(), 443);
        assert_eq!(inv.command_args(&v6)[0], "-6");
    }

    #[tokio::test]
    async fn nonzero_exit_without_output_is_launch_failure() {
        let tool = ProbeToolConfig {
            program: "sh".into(),
            script: "ssl-enum-ciphers".into(),
            extra_args: sh("echo 'bad target' >&2; exit 2"),
        };
        let inv = ProbeInvoker::new(tool, Duration::from_secs(5), 1024);
        let ep = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 443);
        match inv.invoke(&ep, &CancellationToken::new()).await {
            Invocation::LaunchFailed { reason } => assert!(reason.contains("bad target")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
