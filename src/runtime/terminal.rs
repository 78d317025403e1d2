//! TerminalManager - runs agent-requested commands as supervised child processes.
//!
//! Each terminal owns one child process, a byte buffer shared by stdout and
//! stderr, its exit status and the waiters blocked on `wait_for_exit`.
//! A supervisor task per terminal owns the `Child`; everything else talks to
//! it through a kill channel, so a slow or noisy terminal never blocks
//! another one or the protocol channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::config::TerminalOptions;
use crate::api::types::{
    ApiError, CreateTerminalRequest, ExitStatus, SessionId, SessionUpdate, TerminalId,
    TerminalOutput,
};
use crate::runtime::dispatcher::SessionUpdateDispatcher;

const OUTPUT_BUFFER_SIZE: usize = 4096;
/// How long the supervisor waits for the output readers after the process exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[cfg(not(target_os = "windows"))]
const PLATFORM_SHELL: &str = "/bin/sh";
#[cfg(target_os = "windows")]
const PLATFORM_SHELL: &str = "cmd";

#[derive(Debug, Clone, Copy)]
enum KillSignal {
    /// SIGTERM on POSIX
    Terminate,
    /// SIGKILL
    Force,
}

struct TerminalState {
    output: Vec<u8>,
    byte_limit: Option<usize>,
    exit_status: Option<ExitStatus>,
    waiters: Vec<oneshot::Sender<ExitStatus>>,
    released: bool,
    cleanup: Option<JoinHandle<()>>,
}

/// One terminal record.
struct TerminalProcess {
    id: TerminalId,
    session_id: Option<SessionId>,
    state: Mutex<TerminalState>,
    kill_tx: mpsc::UnboundedSender<KillSignal>,
}

impl TerminalProcess {
    fn state(&self) -> MutexGuard<'_, TerminalState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn has_exited(&self) -> bool {
        self.state().exit_status.is_some()
    }

    fn append_output(&self, chunk: &[u8]) {
        let mut state = self.state();
        let limit = state.byte_limit;
        append_bounded(&mut state.output, chunk, limit);
    }

    /// Record the exit and wake every waiter. Only the first call has an effect.
    fn record_exit(&self, status: ExitStatus) {
        let waiters = {
            let mut state = self.state();
            if state.exit_status.is_some() {
                return;
            }
            state.exit_status = Some(status.clone());
            std::mem::take(&mut state.waiters)
        };

        log::info!(
            "Terminal exited: terminal_id={}, exit_code={:?}, signal={:?}, waiters={}",
            self.id,
            status.exit_code,
            status.signal,
            waiters.len()
        );

        for waiter in waiters {
            let _ = waiter.send(status.clone());
        }
    }

    fn signal(&self, signal: KillSignal) {
        if self.has_exited() {
            return;
        }
        if self.kill_tx.send(signal).is_err() {
            log::debug!("Terminal supervisor already gone: terminal_id={}", self.id);
        }
    }

    fn snapshot(&self) -> TerminalOutput {
        let state = self.state();
        TerminalOutput {
            output: render_output(&state.output),
            truncated: state
                .byte_limit
                .is_some_and(|limit| state.output.len() >= limit),
            exit_status: state.exit_status.clone(),
        }
    }
}

/// Manager for every terminal of one connection.
#[derive(Clone)]
pub struct TerminalManager {
    options: TerminalOptions,
    default_cwd: Arc<Mutex<Option<PathBuf>>>,
    terminals: Arc<Mutex<HashMap<TerminalId, Arc<TerminalProcess>>>>,
    updates: Option<SessionUpdateDispatcher>,
}

impl TerminalManager {
    pub fn new(options: TerminalOptions) -> Self {
        Self {
            options,
            default_cwd: Arc::new(Mutex::new(None)),
            terminals: Arc::new(Mutex::new(HashMap::new())),
            updates: None,
        }
    }

    /// Also publish every output chunk as an `output` session update.
    pub fn with_updates(mut self, dispatcher: SessionUpdateDispatcher) -> Self {
        self.updates = Some(dispatcher);
        self
    }

    /// Working directory used when a create request carries no `cwd`.
    pub fn set_default_cwd(&self, cwd: Option<PathBuf>) {
        *lock(&self.default_cwd) = cwd;
    }

    /// Spawn a command and start buffering its output.
    ///
    /// A command that cannot be spawned still gets a terminal, reported as
    /// exited with the "command not found" code and the error as output.
    pub async fn create(&self, request: CreateTerminalRequest) -> Result<TerminalId, ApiError> {
        if request.command.trim().is_empty() {
            return Err(ApiError::InvalidInput {
                message: "Command cannot be empty".to_string(),
            });
        }

        let terminal_id = Uuid::new_v4().to_string();
        let argv = resolve_command(&request.command, request.args.as_deref());
        let (program, args) = self.wrap_for_platform(argv)?;
        let cwd = request
            .cwd
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| lock(&self.default_cwd).clone());
        let byte_limit = request
            .output_byte_limit
            .or(self.options.default_output_byte_limit)
            .map(|limit| usize::try_from(limit).unwrap_or(usize::MAX));

        log::info!(
            "Spawning terminal command: terminal_id={terminal_id}, program={program}, cwd={:?}",
            cwd
        );
        log::debug!("Terminal command args: terminal_id={terminal_id}, args={args:?}");

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &cwd {
            cmd.current_dir(cwd);
        }
        for var in &request.env {
            cmd.env(&var.name, &var.value);
        }

        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let terminal = Arc::new(TerminalProcess {
            id: terminal_id.clone(),
            session_id: request.session_id.clone(),
            state: Mutex::new(TerminalState {
                output: Vec::new(),
                byte_limit,
                exit_status: None,
                waiters: Vec::new(),
                released: false,
                cleanup: None,
            }),
            kill_tx,
        });

        lock(&self.terminals).insert(terminal_id.clone(), terminal.clone());

        match cmd.spawn() {
            Ok(mut child) => {
                let stdout = child.stdout.take();
                let stderr = child.stderr.take();
                let readers = [
                    stdout.map(|s| self.spawn_reader(s, terminal.clone(), "stdout")),
                    stderr.map(|s| self.spawn_reader(s, terminal.clone(), "stderr")),
                ];
                tokio::spawn(supervise(child, kill_rx, terminal, readers));
            }
            Err(e) => {
                log::warn!(
                    "Failed to spawn terminal command: terminal_id={terminal_id}, error={e}"
                );
                terminal.append_output(format!("{program}: {e}\n").as_bytes());
                terminal.record_exit(ExitStatus::command_not_found());
            }
        }

        Ok(terminal_id)
    }

    /// Current output, truncation flag and exit status.
    pub fn output(&self, terminal_id: &str) -> Result<TerminalOutput, ApiError> {
        Ok(self.get(terminal_id)?.snapshot())
    }

    /// Wait until the process exits; returns immediately if it already has.
    pub async fn wait_for_exit(&self, terminal_id: &str) -> Result<ExitStatus, ApiError> {
        let terminal = self.get(terminal_id)?;
        let rx = {
            let mut state = terminal.state();
            if let Some(status) = &state.exit_status {
                return Ok(status.clone());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            rx
        };

        rx.await.map_err(|_| ApiError::TerminalNotFound {
            terminal_id: terminal_id.to_string(),
        })
    }

    /// Send a termination signal unless the process already exited.
    pub fn kill(&self, terminal_id: &str) -> Result<(), ApiError> {
        let terminal = self.get(terminal_id)?;
        log::info!("Killing terminal: terminal_id={terminal_id}");
        terminal.signal(KillSignal::Terminate);
        Ok(())
    }

    /// Kill if still running and schedule removal of the record.
    ///
    /// An exited terminal is removed immediately; a running one stays
    /// readable for the release grace period. Releasing twice is a no-op.
    pub fn release(&self, terminal_id: &str) -> Result<(), ApiError> {
        let terminal = self.get(terminal_id)?;

        let mut state = terminal.state();
        if state.released {
            log::debug!("Terminal already released: terminal_id={terminal_id}");
            return Ok(());
        }
        state.released = true;

        if state.exit_status.is_some() {
            drop(state);
            self.remove(terminal_id);
            log::info!("Terminal released: terminal_id={terminal_id}");
            return Ok(());
        }

        drop(state);
        terminal.signal(KillSignal::Terminate);

        let grace = self.options.release_grace();
        let terminals = self.terminals.clone();
        let scheduled = terminal.clone();
        let cleanup = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !scheduled.has_exited() {
                log::warn!(
                    "Terminal still running after release grace, forcing kill: terminal_id={}",
                    scheduled.id
                );
                scheduled.signal(KillSignal::Force);
            }
            lock(&terminals).remove(&scheduled.id);
            log::debug!("Terminal record removed: terminal_id={}", scheduled.id);
        });
        terminal.state().cleanup = Some(cleanup);

        log::info!(
            "Terminal released while running, removal in {}ms: terminal_id={terminal_id}",
            grace.as_millis()
        );
        Ok(())
    }

    /// Force-kill every terminal and drop all records. Returns how many there were.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<_> = lock(&self.terminals).drain().map(|(_, t)| t).collect();
        for terminal in &drained {
            if let Some(cleanup) = terminal.state().cleanup.take() {
                cleanup.abort();
            }
            terminal.signal(KillSignal::Force);
        }
        if !drained.is_empty() {
            log::info!("Terminals shut down: count={}", drained.len());
        }
        drained.len()
    }

    pub fn contains(&self, terminal_id: &str) -> bool {
        lock(&self.terminals).contains_key(terminal_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.terminals).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, terminal_id: &str) -> Result<Arc<TerminalProcess>, ApiError> {
        lock(&self.terminals)
            .get(terminal_id)
            .cloned()
            .ok_or_else(|| ApiError::TerminalNotFound {
                terminal_id: terminal_id.to_string(),
            })
    }

    fn remove(&self, terminal_id: &str) {
        if let Some(terminal) = lock(&self.terminals).remove(terminal_id) {
            if let Some(cleanup) = terminal.state().cleanup.take() {
                cleanup.abort();
            }
        }
    }

    fn wrap_for_platform(&self, argv: Vec<String>) -> Result<(String, Vec<String>), ApiError> {
        #[cfg(unix)]
        if self.options.login_shell {
            let line = shlex::try_join(argv.iter().map(String::as_str)).map_err(|e| {
                ApiError::InvalidInput {
                    message: format!("Command cannot be quoted for the login shell: {e}"),
                }
            })?;
            return Ok((login_shell(), vec!["-l".into(), "-c".into(), line]));
        }

        let mut argv = argv.into_iter();
        let program = argv.next().ok_or_else(|| ApiError::InvalidInput {
            message: "Command cannot be empty".to_string(),
        })?;
        Ok((program, argv.collect()))
    }

    fn spawn_reader<R>(
        &self,
        reader: R,
        terminal: Arc<TerminalProcess>,
        label: &'static str,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let updates = self.updates.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = vec![0u8; OUTPUT_BUFFER_SIZE];

            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        terminal.append_output(&buf[..n]);
                        if let Some(updates) = &updates {
                            updates.publish(
                                terminal.session_id.clone(),
                                SessionUpdate::Output {
                                    terminal_id: terminal.id.clone(),
                                    text: String::from_utf8_lossy(&buf[..n]).into_owned(),
                                },
                            );
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "Terminal {label} stream read failed: terminal_id={}, error={e}",
                            terminal.id
                        );
                        break;
                    }
                }
            }
        })
    }
}

async fn supervise(
    mut child: Child,
    mut kill_rx: mpsc::UnboundedReceiver<KillSignal>,
    terminal: Arc<TerminalProcess>,
    readers: [Option<JoinHandle<()>>; 2],
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(signal) = kill_rx.recv() => send_signal(&mut child, signal, &terminal.id),
        }
    };

    // Let the readers drain so the final output is in place before exit is visible
    for reader in readers.into_iter().flatten() {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
            log::debug!(
                "Terminal output still open after exit: terminal_id={}",
                terminal.id
            );
        }
    }

    let status = match status {
        Ok(status) => ExitStatus::from(status),
        Err(e) => {
            log::warn!("Terminal process wait failed: terminal_id={}, error={e}", terminal.id);
            ExitStatus {
                exit_code: None,
                signal: None,
            }
        }
    };
    terminal.record_exit(status);
}

fn send_signal(child: &mut Child, signal: KillSignal, terminal_id: &str) {
    #[cfg(unix)]
    if let (KillSignal::Terminate, Some(pid)) = (signal, child.id()) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(pid as i32);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            log::debug!("SIGTERM failed: terminal_id={terminal_id}, error={e}");
        }
        return;
    }

    if let Err(e) = child.start_kill() {
        log::debug!("Kill failed: terminal_id={terminal_id}, signal={signal:?}, error={e}");
    }
}

/// Build the argv for a command string.
///
/// Explicit arguments are used verbatim. Without them, a string containing
/// shell metacharacters runs through the platform shell; anything else is
/// split on whitespace.
pub fn resolve_command(command: &str, args: Option<&[String]>) -> Vec<String> {
    if let Some(args) = args.filter(|args| !args.is_empty()) {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(command.to_string());
        argv.extend(args.iter().cloned());
        return argv;
    }

    if has_shell_metacharacters(command) {
        #[cfg(target_os = "windows")]
        let flag = "/C";
        #[cfg(not(target_os = "windows"))]
        let flag = "-c";
        return vec![PLATFORM_SHELL.to_string(), flag.to_string(), command.to_string()];
    }

    command.split_whitespace().map(str::to_string).collect()
}

static SHELL_METACHARACTERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[|&;<>()$`\\"'*?\[\]{}~#!\n]"#).expect("shell metacharacter pattern is valid")
});

fn has_shell_metacharacters(command: &str) -> bool {
    SHELL_METACHARACTERS.is_match(command)
}

#[cfg(unix)]
fn login_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.trim().is_empty() && Path::new(shell).is_absolute())
        .unwrap_or_else(|| PLATFORM_SHELL.to_string())
}

/// Append `chunk`, keeping only the newest `limit` bytes.
fn append_bounded(buffer: &mut Vec<u8>, chunk: &[u8], limit: Option<usize>) {
    let Some(limit) = limit else {
        buffer.extend_from_slice(chunk);
        return;
    };

    if chunk.len() >= limit {
        buffer.clear();
        buffer.extend_from_slice(&chunk[chunk.len() - limit..]);
        return;
    }

    buffer.extend_from_slice(chunk);
    if buffer.len() > limit {
        let excess = buffer.len() - limit;
        buffer.drain(..excess);
    }
}

/// Decode the buffer, skipping a partial UTF-8 sequence left at the front by truncation.
fn render_output(buffer: &[u8]) -> String {
    let start = buffer
        .iter()
        .take(3)
        .take_while(|byte| (**byte & 0b1100_0000) == 0b1000_0000)
        .count();
    String::from_utf8_lossy(&buffer[start..]).into_owned()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn test_manager() -> TerminalManager {
        TerminalManager::new(TerminalOptions {
            release_grace_ms: 500,
            login_shell: false,
            default_output_byte_limit: None,
        })
    }

    async fn wait_exit(manager: &TerminalManager, id: &str) -> ExitStatus {
        timeout(Duration::from_secs(5), manager.wait_for_exit(id))
            .await
            .expect("terminal did not exit in time")
            .expect("terminal vanished")
    }

    #[test]
    fn test_resolve_command_prefers_explicit_args() {
        let args = vec!["-la".to_string(), "a b".to_string()];
        assert_eq!(
            resolve_command("ls", Some(args.as_slice())),
            vec!["ls".to_string(), "-la".to_string(), "a b".to_string()]
        );
    }

    #[test]
    fn test_resolve_command_splits_plain_command() {
        assert_eq!(
            resolve_command("cargo  test --quiet", None),
            vec!["cargo", "test", "--quiet"]
        );
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn test_resolve_command_wraps_metacharacters_in_shell() {
        let no_args: Vec<String> = Vec::new();
        assert_eq!(
            resolve_command("ls | wc -l", Some(no_args.as_slice())),
            vec!["/bin/sh", "-c", "ls | wc -l"]
        );
    }

    #[test]
    fn test_append_bounded_keeps_newest_bytes() {
        let mut buffer = Vec::new();
        let mut logical = Vec::new();
        for chunk in [&b"abc"[..], b"", b"defgh", b"ijklmnopqrstuvwxyz", b"1", b"23"] {
            append_bounded(&mut buffer, chunk, Some(7));
            logical.extend_from_slice(chunk);
            assert!(buffer.len() <= 7);
            let keep = logical.len().min(7);
            assert_eq!(buffer, logical[logical.len() - keep..]);
        }
    }

    #[test]
    fn test_render_output_skips_partial_leading_character() {
        let text = "héllo".as_bytes();
        // Drop the first byte of 'h' and the lead byte of 'é'
        assert_eq!(render_output(&text[2..]), "llo");
        assert_eq!(render_output(text), "héllo");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_output_and_exit_status() {
        let manager = test_manager();
        let id = manager
            .create(CreateTerminalRequest::new("echo hi"))
            .await
            .unwrap();

        let status = wait_exit(&manager, &id).await;
        assert_eq!(status.exit_code, Some(0));

        let output = manager.output(&id).unwrap();
        assert_eq!(output.output, "hi\n");
        assert!(!output.truncated);
        assert_eq!(output.exit_status, Some(status));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_byte_limit_truncates_from_front() {
        let manager = test_manager();
        let mut request = CreateTerminalRequest::new("printf abcdefgh");
        request.output_byte_limit = Some(5);
        let id = manager.create(request).await.unwrap();

        wait_exit(&manager, &id).await;

        let output = manager.output(&id).unwrap();
        assert_eq!(output.output, "defgh");
        assert!(output.truncated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdout_and_stderr_share_buffer() {
        let manager = test_manager();
        let id = manager
            .create(CreateTerminalRequest::new("echo out; echo err 1>&2"))
            .await
            .unwrap();

        wait_exit(&manager, &id).await;

        let output = manager.output(&id).unwrap().output;
        assert!(output.contains("out\n"));
        assert!(output.contains("err\n"));
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_command_not_found() {
        let manager = test_manager();
        let id = manager
            .create(CreateTerminalRequest::new("/definitely/not/a/real/binary"))
            .await
            .unwrap();

        let status = wait_exit(&manager, &id).await;
        assert_eq!(status, ExitStatus::command_not_found());
        assert!(!manager.output(&id).unwrap().output.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_running_terminal_resolves_all_waiters() {
        let manager = test_manager();
        let id = manager
            .create(CreateTerminalRequest::new("sleep 30"))
            .await
            .unwrap();

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let manager = manager.clone();
                let id = id.clone();
                tokio::spawn(async move { manager.wait_for_exit(&id).await })
            })
            .collect();
        tokio::task::yield_now().await;

        manager.kill(&id).unwrap();

        for waiter in waiters {
            let status = timeout(Duration::from_secs(5), waiter)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(status.signal.as_deref(), Some("SIGTERM"));
        }

        // Killing an exited terminal is a no-op
        manager.kill(&id).unwrap();
        assert!(manager.output(&id).unwrap().exit_status.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_release_after_exit_removes_immediately() {
        let manager = test_manager();
        let id = manager
            .create(CreateTerminalRequest::new("true"))
            .await
            .unwrap();
        wait_exit(&manager, &id).await;

        manager.release(&id).unwrap();
        assert!(!manager.contains(&id));

        assert!(matches!(
            manager.release(&id),
            Err(ApiError::TerminalNotFound { .. })
        ));
        assert!(matches!(
            manager.kill(&id),
            Err(ApiError::TerminalNotFound { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_release_while_running_keeps_record_for_grace_period() {
        let manager = test_manager();
        let id = manager
            .create(CreateTerminalRequest::new("sleep 30"))
            .await
            .unwrap();

        manager.release(&id).unwrap();
        manager.release(&id).unwrap();

        // Still pollable during the grace period
        let status = wait_exit(&manager, &id).await;
        assert!(status.signal.is_some());
        assert!(manager.output(&id).is_ok());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(!manager.contains(&id));
        assert!(matches!(
            manager.output(&id),
            Err(ApiError::TerminalNotFound { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_kills_running_terminals() {
        let manager = test_manager();
        let id = manager
            .create(CreateTerminalRequest::new("sleep 30"))
            .await
            .unwrap();

        assert_eq!(manager.shutdown(), 1);
        assert!(manager.is_empty());
        assert!(matches!(
            manager.wait_for_exit(&id).await,
            Err(ApiError::TerminalNotFound { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_events_are_published() {
        let dispatcher = SessionUpdateDispatcher::new();
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = seen.clone();
        dispatcher.on_update(move |event| {
            if let SessionUpdate::Output { text, .. } = &event.update {
                sink.lock().unwrap().push_str(text);
            }
        });

        let manager = test_manager().with_updates(dispatcher);
        let mut request = CreateTerminalRequest::new("echo streamed");
        request.session_id = Some("session-1".to_string());
        let id = manager.create(request).await.unwrap();
        wait_exit(&manager, &id).await;

        assert_eq!(*seen.lock().unwrap(), "streamed\n");
    }
}
