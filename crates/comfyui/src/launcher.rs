//! Engine subprocess launching.
//!
//! [`CommandLauncher`] spawns ComfyUI as a detached child whose output is
//! appended to log files. The child is *not* killed when the handle is
//! dropped: a READY engine outlives the invocation that started it and is
//! reused by later invocations on a warm container.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

/// File receiving the engine's stdout.
pub const STDOUT_LOG: &str = "comfyui_stdout.log";

/// File receiving the engine's stderr.
pub const STDERR_LOG: &str = "comfyui_stderr.log";

/// Number of stderr lines surfaced after a failed start.
const STDERR_TAIL_LINES: usize = 50;

/// How long a killed engine process gets to exit before relaunching.
const STALE_EXIT_WAIT: Duration = Duration::from_secs(10);

/// Starts the engine process. Implemented by [`CommandLauncher`] and by
/// fakes in tests.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawn a fresh engine process, replacing any previous one.
    /// Returns the OS process id when known.
    async fn launch(&mut self) -> std::io::Result<Option<u32>>;

    /// `Some(description)` once the launched process has exited.
    fn exit_status(&mut self) -> Option<String>;

    /// Recent engine output worth showing after a failed start.
    async fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// How to start the engine.
#[derive(Debug, Clone)]
pub struct EngineCommand {
    /// Python interpreter used to run the engine.
    pub python: String,
    /// Engine installation directory (contains `main.py`).
    pub install_dir: PathBuf,
    /// Interface the engine listens on.
    pub host: String,
    pub port: u16,
    /// Additional command-line flags.
    pub extra_args: Vec<String>,
    /// Directory receiving the stdout/stderr log files.
    pub log_dir: PathBuf,
}

impl EngineCommand {
    /// Arguments passed to the interpreter.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.install_dir.join("main.py").display().to_string(),
            "--listen".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Spawns the engine with [`tokio::process::Command`].
pub struct CommandLauncher {
    command: EngineCommand,
    child: Option<Child>,
}

impl CommandLauncher {
    pub fn new(command: EngineCommand) -> Self {
        Self {
            command,
            child: None,
        }
    }

    fn stderr_log(&self) -> PathBuf {
        self.command.log_dir.join(STDERR_LOG)
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&mut self) -> std::io::Result<Option<u32>> {
        if let Some(stale) = self.child.take() {
            reap(stale, STALE_EXIT_WAIT).await;
        }

        tokio::fs::create_dir_all(&self.command.log_dir).await?;
        let stdout = open_log(&self.command.log_dir.join(STDOUT_LOG)).await?;
        let stderr = open_log(&self.stderr_log()).await?;

        let args = self.command.args();
        tracing::info!(
            python = %self.command.python,
            args = %args.join(" "),
            log_dir = %self.command.log_dir.display(),
            "Starting engine process",
        );

        let child = Command::new(&self.command.python)
            .args(&args)
            .current_dir(&self.command.install_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(false)
            .spawn()?;

        let pid = child.id();
        tracing::info!(pid = ?pid, "Engine process spawned");
        self.child = Some(child);
        Ok(pid)
    }

    fn exit_status(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unable to query process status: {e}")),
        }
    }

    async fn diagnostics(&self) -> Option<String> {
        let contents = tokio::fs::read_to_string(self.stderr_log()).await.ok()?;
        let tail = tail_lines(&contents, STDERR_TAIL_LINES);
        if tail.is_empty() {
            None
        } else {
            Some(tail)
        }
    }
}

/// Kill a previous engine process and wait for it to exit, so it
/// releases the port before the replacement binds it.
async fn reap(mut stale: Child, wait: Duration) {
    let pid = stale.id();
    tracing::info!(pid = ?pid, "Killing stale engine process before relaunch");
    if let Err(e) = stale.start_kill() {
        tracing::debug!(error = %e, "Stale engine process already gone");
    }
    match tokio::time::timeout(wait, stale.wait()).await {
        Ok(Ok(status)) => tracing::debug!(pid = ?pid, %status, "Stale engine process exited"),
        Ok(Err(e)) => tracing::warn!(pid = ?pid, error = %e, "Failed to wait for stale engine process"),
        Err(_) => tracing::warn!(
            pid = ?pid,
            wait_secs = wait.as_secs(),
            "Stale engine process still running, relaunching anyway",
        ),
    }
}

/// Open a log file for appending and convert it into a child stdio handle.
async fn open_log(path: &Path) -> std::io::Result<Stdio> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(Stdio::from(file.into_std().await))
}

/// Last `n` lines of `text`, joined with newlines.
fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(log_dir: PathBuf) -> EngineCommand {
        EngineCommand {
            python: "python".to_string(),
            install_dir: PathBuf::from("/workspace/ComfyUI"),
            host: "127.0.0.1".to_string(),
            port: 8188,
            extra_args: vec!["--normalvram".to_string(), "--cache-lru".to_string(), "3".to_string()],
            log_dir,
        }
    }

    #[test]
    fn args_include_listen_and_port() {
        let args = command(PathBuf::from("/tmp")).args();
        assert_eq!(
            args,
            [
                "/workspace/ComfyUI/main.py",
                "--listen",
                "127.0.0.1",
                "--port",
                "8188",
                "--normalvram",
                "--cache-lru",
                "3",
            ]
        );
    }

    #[test]
    fn tail_keeps_last_lines() {
        let text = (1..=60).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let tail = tail_lines(&text, 50);
        assert!(tail.starts_with("11\n"));
        assert!(tail.ends_with("60"));
        assert_eq!(tail_lines("a\nb", 50), "a\nb");
    }

    #[test]
    fn exit_status_without_child_is_none() {
        let mut launcher = CommandLauncher::new(command(PathBuf::from("/tmp")));
        assert!(launcher.exit_status().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_failure_for_missing_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = command(dir.path().join("logs"));
        cmd.python = "/nonexistent/kiln-python".to_string();
        cmd.install_dir = dir.path().to_path_buf();

        let mut launcher = CommandLauncher::new(cmd);
        assert!(launcher.launch().await.is_err());
        assert!(dir.path().join("logs").join(STDOUT_LOG).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_process_is_reported_with_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = command(dir.path().join("logs"));
        // `sh main.py ...` runs our stand-in script, which fails immediately.
        cmd.python = "sh".to_string();
        cmd.install_dir = dir.path().to_path_buf();
        std::fs::write(dir.path().join("main.py"), "echo 'boom: no GPU' >&2\nexit 3\n").unwrap();

        let mut launcher = CommandLauncher::new(cmd);
        launcher.launch().await.unwrap();

        let mut status = None;
        for _ in 0..100 {
            status = launcher.exit_status();
            if status.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        assert!(status.unwrap().contains('3'));
        assert_eq!(launcher.diagnostics().await.as_deref(), Some("boom: no GPU"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn relaunch_reaps_the_previous_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = command(dir.path().join("logs"));
        cmd.python = "sh".to_string();
        cmd.install_dir = dir.path().to_path_buf();
        std::fs::write(dir.path().join("main.py"), "sleep 30\n").unwrap();

        let mut launcher = CommandLauncher::new(cmd);
        let first = launcher.launch().await.unwrap().unwrap();
        let second = launcher.launch().await.unwrap().unwrap();
        assert_ne!(first, second);

        // Reaped, so the pid no longer names a process (not even a zombie).
        let alive = std::process::Command::new("kill")
            .args(["-0", &first.to_string()])
            .status()
            .unwrap();
        assert!(!alive.success());

        launcher.child.take().unwrap().kill().await.unwrap();
    }
}
