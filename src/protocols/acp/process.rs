//! ProcessSupervisor - spawns the agent executable and owns its lifecycle.
//!
//! The agent runs with three piped standard streams. A supervisor task
//! owns the `Child` and publishes a [`ProcessEvent`] when the process exits
//! or waiting on it fails. Teardown goes SIGTERM first, then SIGKILL once
//! the grace period has passed.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::api::config::AgentConfig;
use crate::api::types::{AgentId, ApiError, ExitStatus};

/// Process-level signal observed by the supervisor task.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// The process exited (normally or by signal)
    Exited(ExitStatus),
    /// Waiting on the process failed
    Error(String),
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

/// Handle to a running agent process.
pub struct AgentProcess {
    agent_id: AgentId,
    pid: u32,
    signal_tx: mpsc::UnboundedSender<Signal>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    supervisor: JoinHandle<()>,
}

/// Everything `spawn` hands back: the handle, the three streams and the
/// process event feed.
pub struct SpawnedAgent {
    pub process: AgentProcess,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Spawn the agent described by `config`.
    ///
    /// The environment is the caller's environment with `config.env`
    /// applied on top.
    pub fn spawn(config: &AgentConfig) -> Result<SpawnedAgent, ApiError> {
        config.validate()?;

        log::info!(
            "Spawning agent process: agent_id={}, command={}, cwd={}",
            config.id,
            config.command,
            config.working_directory.display()
        );

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .current_dir(&config.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| ApiError::SpawnFailed {
            message: format!("{}: {e}", config.command),
        })?;

        let pid = child.id().ok_or_else(|| ApiError::SpawnFailed {
            message: format!("{}: no process id", config.command),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| ApiError::StdioUnavailable {
            stream: "stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ApiError::StdioUnavailable {
            stream: "stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ApiError::StdioUnavailable {
            stream: "stderr".to_string(),
        })?;

        log::debug!("Agent process spawned: agent_id={}, pid={pid}", config.id);

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let supervisor = tokio::spawn(supervise(
            child,
            config.id.clone(),
            signal_rx,
            events_tx,
            exit_tx,
        ));

        Ok(SpawnedAgent {
            process: AgentProcess {
                agent_id: config.id.clone(),
                pid,
                signal_tx,
                exit_rx,
                supervisor,
            },
            stdin,
            stdout,
            stderr,
            events,
        })
    }
}

impl AgentProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_rx.borrow().clone()
    }

    /// Wait until the process has exited.
    pub async fn wait(&self) -> ExitStatus {
        let mut exit_rx = self.exit_rx.clone();
        let status = match exit_rx.wait_for(Option::is_some).await {
            Ok(status) => status.clone().unwrap_or_else(unknown_status),
            // Supervisor gone without recording an exit
            Err(_) => unknown_status(),
        };
        status
    }

    /// SIGTERM, then SIGKILL if the process is still alive after `grace`.
    pub async fn terminate(&self, grace: Duration) -> ExitStatus {
        if let Some(status) = self.exit_status() {
            return status;
        }

        log::info!(
            "Terminating agent process: agent_id={}, pid={}",
            self.agent_id,
            self.pid
        );
        let _ = self.signal_tx.send(Signal::Terminate);

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(status) => status,
            Err(_) => {
                log::warn!(
                    "Agent ignored SIGTERM, killing: agent_id={}, pid={}",
                    self.agent_id,
                    self.pid
                );
                let _ = self.signal_tx.send(Signal::Kill);
                self.wait().await
            }
        }
    }
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        if self.exit_status().is_none() {
            // The supervisor owns the child; aborting it drops the child, and
            // kill_on_drop takes care of the rest
            self.supervisor.abort();
        }
    }
}

/// Forward agent stderr to the log, line by line.
pub fn forward_stderr(agent_id: AgentId, stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log::debug!("[agent stderr] {line}");
        }
        log::debug!("Agent stderr closed: agent_id={agent_id}");
    })
}

async fn supervise(
    mut child: Child,
    agent_id: AgentId,
    mut signal_rx: mpsc::UnboundedReceiver<Signal>,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(signal) = signal_rx.recv() => send_signal(&mut child, signal, &agent_id),
        }
    };

    let (status, event) = match status {
        Ok(status) => {
            let status = ExitStatus::from(status);
            (status.clone(), ProcessEvent::Exited(status))
        }
        Err(e) => {
            log::error!("Waiting on agent process failed: agent_id={agent_id}, error={e}");
            (unknown_status(), ProcessEvent::Error(e.to_string()))
        }
    };

    log::info!(
        "Agent process exited: agent_id={agent_id}, exit_code={:?}, signal={:?}",
        status.exit_code,
        status.signal
    );
    exit_tx.send_replace(Some(status));
    let _ = events_tx.send(event);
}

fn send_signal(child: &mut Child, signal: Signal, agent_id: &str) {
    #[cfg(unix)]
    if let (Signal::Terminate, Some(pid)) = (signal, child.id()) {
        use nix::sys::signal::{kill, Signal as NixSignal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(pid as i32), NixSignal::SIGTERM) {
            log::debug!("SIGTERM failed: agent_id={agent_id}, error={e}");
        }
        return;
    }

    if let Err(e) = child.start_kill() {
        log::debug!("Kill failed: agent_id={agent_id}, signal={signal:?}, error={e}");
    }
}

fn unknown_status() -> ExitStatus {
    ExitStatus {
        exit_code: None,
        signal: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn sh(script: &str) -> AgentConfig {
        AgentConfig::new("test-agent", "/bin/sh", env::temp_dir()).with_args(["-c", script])
    }

    #[tokio::test]
    async fn test_spawn_bad_executable_fails() {
        let config = AgentConfig::new("missing", "/definitely/not/here", env::temp_dir());
        let result = ProcessSupervisor::spawn(&config);
        assert!(matches!(result, Err(ApiError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_exit_event_carries_status() {
        let mut spawned = ProcessSupervisor::spawn(&sh("exit 3")).unwrap();
        assert!(spawned.process.pid() > 0);

        let event = spawned.events.recv().await.unwrap();
        assert_eq!(
            event,
            ProcessEvent::Exited(ExitStatus {
                exit_code: Some(3),
                signal: None
            })
        );
        assert_eq!(spawned.process.wait().await.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_wait_before_and_after_exit() {
        let spawned = ProcessSupervisor::spawn(&sh("sleep 0.2; exit 5")).unwrap();
        assert_eq!(spawned.process.exit_status(), None);

        let status = spawned.process.wait().await;
        assert_eq!(status.exit_code, Some(5));
        // Already exited: returns the recorded status right away
        assert_eq!(spawned.process.wait().await, status);
        assert_eq!(spawned.process.exit_status(), Some(status));
    }

    #[tokio::test]
    async fn test_env_overrides_are_applied() {
        let config =
            sh("printf %s \"$ACP_TEST_VALUE\" >&2; exit 0").with_env("ACP_TEST_VALUE", "on");
        let spawned = ProcessSupervisor::spawn(&config).unwrap();

        let mut stderr = BufReader::new(spawned.stderr).lines();
        assert_eq!(stderr.next_line().await.unwrap(), Some("on".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let spawned = ProcessSupervisor::spawn(&sh("trap '' TERM; sleep 30")).unwrap();
        // Give the shell a moment to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = spawned.process.terminate(Duration::from_millis(300)).await;
        assert_eq!(status.signal.as_deref(), Some("SIGKILL"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_sends_sigterm_first() {
        let spawned = ProcessSupervisor::spawn(&sh("sleep 30")).unwrap();

        let status = spawned.process.terminate(Duration::from_secs(5)).await;
        assert_eq!(status.signal.as_deref(), Some("SIGTERM"));
    }
}
