//! Process supervision for the Copilot CLI server.
//!
//! Locates a runnable binary, spawns it with the right transport and auth
//! flags, hands its byte channel to the transport layer, and owns the child
//! for the rest of its life: graceful stop with a bounded grace period,
//! immediate kill, and unexpected-exit notification for the client's restart
//! logic. Never spawns anything when the client was configured with an
//! external server endpoint.

use crate::error::{Error, Result};
use crate::options::ResolvedOptions;
use crate::transport::Transport;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Environment variable through which a github token reaches the server.
pub(crate) const AUTH_TOKEN_ENV: &str = "COPILOT_SDK_AUTH_TOKEN";

/// How long to wait for the TCP port announcement on stdout.
const PORT_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for `stop()` before escalating to a kill.
pub(crate) const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolve the CLI binary: `COPILOT_CLI_PATH` overrides the configured path,
/// then PATH lookup, then the bare name as a last resort.
pub(crate) fn resolve_cli_path(explicit: Option<&PathBuf>) -> PathBuf {
    let env_override = std::env::var("COPILOT_CLI_PATH").ok().filter(|p| !p.is_empty());
    resolve_cli_path_from(explicit, env_override)
}

fn resolve_cli_path_from(explicit: Option<&PathBuf>, env_override: Option<String>) -> PathBuf {
    if let Some(path) = env_override {
        return PathBuf::from(path);
    }
    if let Some(path) = explicit {
        return path.clone();
    }
    which::which("copilot").unwrap_or_else(|_| PathBuf::from("copilot"))
}

/// Launch arguments for the CLI server process.
fn build_launch_args(options: &ResolvedOptions) -> Vec<String> {
    let mut args = vec![
        "--headless".to_string(),
        "--no-auto-update".to_string(),
        "--log-level".to_string(),
        options.log_level.clone(),
    ];

    if options.use_stdio {
        args.push("--stdio".to_string());
    } else if let Some(port) = options.port {
        args.push("--port".to_string());
        args.push(port.to_string());
    }

    if options.github_token.is_some() {
        // The token itself travels via the environment, never argv.
        args.push("--auth-token-env".to_string());
        args.push(AUTH_TOKEN_ENV.to_string());
    }
    if !options.use_logged_in_user {
        args.push("--no-auto-login".to_string());
    }

    args
}

/// Notification that the child exited on its own.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProcessExit {
    pub code: Option<i32>,
}

enum SupervisorCommand {
    Stop {
        grace: Duration,
        done: oneshot::Sender<()>,
    },
    Kill {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the monitor task that owns the child process.
///
/// The monitor waits on the child and reports unexpected exits through the
/// channel returned by [`ProcessSupervisor::new`]. Commanded stops and kills
/// are not reported - the client initiated them and already knows.
pub(crate) struct ProcessSupervisor {
    cmd_tx: mpsc::UnboundedSender<SupervisorCommand>,
}

impl ProcessSupervisor {
    pub(crate) fn new(child: Child) -> (Self, oneshot::Receiver<ProcessExit>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(monitor_child(child, cmd_rx, exit_tx));
        (Self { cmd_tx }, exit_rx)
    }

    /// Graceful shutdown: SIGTERM (on Unix), bounded wait, then kill.
    /// A no-op if the process already exited.
    pub(crate) async fn stop(&self, grace: Duration) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SupervisorCommand::Stop {
                grace,
                done: done_tx,
            })
            .is_err()
        {
            return;
        }
        let _ = done_rx.await;
    }

    /// Immediate kill. Idempotent; a no-op if the process already exited.
    pub(crate) async fn kill(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SupervisorCommand::Kill { done: done_tx })
            .is_err()
        {
            return;
        }
        let _ = done_rx.await;
    }
}

async fn monitor_child(
    mut child: Child,
    mut cmd_rx: mpsc::UnboundedReceiver<SupervisorCommand>,
    exit_tx: oneshot::Sender<ProcessExit>,
) {
    tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            info!("copilot CLI server exited (code {:?})", code);
            let _ = exit_tx.send(ProcessExit { code });
        }
        cmd = cmd_rx.recv() => {
            match cmd {
                Some(SupervisorCommand::Stop { grace, done }) => {
                    graceful_stop(&mut child, grace).await;
                    let _ = done.send(());
                }
                Some(SupervisorCommand::Kill { done }) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    let _ = done.send(());
                }
                // Supervisor dropped without an explicit stop: kill so the
                // child cannot outlive the client.
                None => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
    }
    // Task return drops cmd_rx; later commands observe a closed channel and
    // treat the process as already stopped.
}

async fn graceful_stop(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => return,
            Err(_) => debug!("graceful shutdown timed out after {:?}, killing", grace),
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// A freshly spawned CLI server.
pub(crate) struct SpawnedServer {
    /// Ready transport in stdio mode; `None` in TCP mode (the caller dials).
    pub transport: Option<Transport>,
    /// Announced (or configured) port in TCP mode.
    pub port: Option<u16>,
    pub supervisor: ProcessSupervisor,
    pub exit_rx: oneshot::Receiver<ProcessExit>,
}

/// Spawn the CLI server per the resolved options.
pub(crate) async fn spawn_cli_server(options: &ResolvedOptions) -> Result<SpawnedServer> {
    let cli_path = resolve_cli_path(options.cli_path.as_ref());
    let args = build_launch_args(options);

    // A .js entry point runs under node; Windows cannot rely on the shebang.
    let (program, args) = if cli_path.extension().is_some_and(|ext| ext == "js") {
        let mut node_args = vec![cli_path.to_string_lossy().into_owned()];
        node_args.extend(args);
        (PathBuf::from("node"), node_args)
    } else {
        (cli_path, args)
    };

    debug!("spawning copilot CLI server: {:?} {:?}", program, args);

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .stdin(if options.use_stdio {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }
    if let Some(env) = &options.env {
        cmd.env_clear();
        cmd.envs(env);
    }
    if let Some(token) = &options.github_token {
        cmd.env(AUTH_TOKEN_ENV, token);
    }

    // Linux: ask the kernel to SIGTERM the child if this process dies without
    // running destructors (SIGKILL, OOM kill).
    #[cfg(target_os = "linux")]
    unsafe {
        cmd.pre_exec(|| {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(Error::Spawn)?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stderr")))?;
    tokio::spawn(drain_stderr(stderr));

    if options.use_stdio {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdout")))?;

        let (supervisor, exit_rx) = ProcessSupervisor::new(child);
        Ok(SpawnedServer {
            transport: Some(Transport::from_stdio(stdin, stdout)),
            port: None,
            supervisor,
            exit_rx,
        })
    } else {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdout")))?;

        let port = wait_for_port_announcement(stdout).await?;
        info!("copilot CLI server listening on port {}", port);

        let (supervisor, exit_rx) = ProcessSupervisor::new(child);
        Ok(SpawnedServer {
            transport: None,
            port: Some(port),
            supervisor,
            exit_rx,
        })
    }
}

/// Read stdout until the server announces its port
/// (`... listening on port <n>`), within a bounded wait. Keeps draining
/// stdout in the background afterwards so the server cannot block on a full
/// pipe.
async fn wait_for_port_announcement(stdout: ChildStdout) -> Result<u16> {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();

    let port = tokio::time::timeout(PORT_ANNOUNCE_TIMEOUT, async {
        loop {
            line.clear();
            let bytes_read = line_read(&mut reader, &mut line).await?;
            if bytes_read == 0 {
                return Err(Error::Spawn(std::io::Error::other(
                    "CLI server exited without announcing a port",
                )));
            }

            let trimmed = line.trim();
            debug!("copilot CLI output: {}", trimmed);

            if let Some(port) = parse_port_announcement(trimmed) {
                return Ok(port);
            }
        }
    })
    .await
    .map_err(|_| Error::Timeout(PORT_ANNOUNCE_TIMEOUT))??;

    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => trace!("copilot CLI stdout: {}", line.trim()),
            }
        }
    });

    Ok(port)
}

async fn line_read(
    reader: &mut BufReader<ChildStdout>,
    line: &mut String,
) -> Result<usize> {
    reader.read_line(line).await.map_err(Error::Io)
}

fn parse_port_announcement(line: &str) -> Option<u16> {
    let marker = "listening on port ";
    let idx = line.find(marker)?;
    let digits: String = line[idx + marker.len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Drain stderr so the server cannot deadlock on a full pipe; agents log
/// freely here, so nothing on stderr is treated as fatal.
async fn drain_stderr(stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    warn!("copilot CLI stderr: {}", trimmed);
                }
            }
        }
    }
    debug!("copilot CLI stderr closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ClientOptions;

    fn resolved(options: ClientOptions) -> ResolvedOptions {
        options.resolve().unwrap()
    }

    #[test]
    fn env_override_beats_explicit_path() {
        let explicit = PathBuf::from("/opt/copilot");
        let path =
            resolve_cli_path_from(Some(&explicit), Some("/cache/copilot_v2".to_string()));
        assert_eq!(path, PathBuf::from("/cache/copilot_v2"));
    }

    #[test]
    fn explicit_path_used_without_env() {
        let explicit = PathBuf::from("/opt/copilot");
        let path = resolve_cli_path_from(Some(&explicit), None);
        assert_eq!(path, explicit);
    }

    #[test]
    fn default_args_select_stdio() {
        let args = build_launch_args(&resolved(ClientOptions::default()));
        assert!(args.contains(&"--headless".to_string()));
        assert!(args.contains(&"--stdio".to_string()));
        assert!(!args.contains(&"--no-auto-login".to_string()));
    }

    #[test]
    fn fixed_port_args_select_tcp() {
        let args = build_launch_args(&resolved(ClientOptions {
            port: Some(9000),
            ..Default::default()
        }));
        assert!(!args.contains(&"--stdio".to_string()));
        let idx = args.iter().position(|a| a == "--port").unwrap();
        assert_eq!(args[idx + 1], "9000");
    }

    #[test]
    fn token_adds_auth_flags_and_disables_auto_login() {
        let args = build_launch_args(&resolved(ClientOptions {
            github_token: Some("gho_test_token".into()),
            ..Default::default()
        }));
        let idx = args.iter().position(|a| a == "--auth-token-env").unwrap();
        assert_eq!(args[idx + 1], AUTH_TOKEN_ENV);
        // Token flips use_logged_in_user to false by default.
        assert!(args.contains(&"--no-auto-login".to_string()));
        // The token itself never appears in argv.
        assert!(!args.iter().any(|a| a.contains("gho_test_token")));
    }

    #[test]
    fn parses_port_announcement_lines() {
        assert_eq!(
            parse_port_announcement("CLI server listening on port 8123"),
            Some(8123)
        );
        assert_eq!(
            parse_port_announcement("[info] listening on port 9000 (tcp)"),
            Some(9000)
        );
        assert_eq!(parse_port_announcement("starting up..."), None);
    }

    #[tokio::test]
    async fn spawn_fails_fast_for_missing_binary() {
        let options = resolved(ClientOptions {
            cli_path: Some(PathBuf::from("nonexistent_command_12345")),
            ..Default::default()
        });
        let result = spawn_cli_server(&options).await;
        assert!(matches!(result, Err(Error::Spawn(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_is_idempotent() {
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let (supervisor, _exit_rx) = ProcessSupervisor::new(child);
        supervisor.kill().await;
        // Second kill observes the finished monitor and returns immediately.
        supervisor.kill().await;
    }
}
