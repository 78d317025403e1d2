//! AcpAgent - ACP client side of one agent connection.
//!
//! Ties the pieces together:
//! - spawning the agent (or adopting an existing pair of streams)
//! - the `initialize` handshake and the connection state machine
//! - session requests (`session/new`, `session/prompt`, ...)
//! - the read loop: responses, `session/update` notifications and
//!   agent-initiated requests (permissions, files, terminals)
//! - teardown: cancel permissions, kill terminals, close stdin, wait,
//!   SIGTERM, SIGKILL

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use super::handshake;
use super::process::{forward_stderr, AgentProcess, ProcessEvent, ProcessSupervisor, SpawnedAgent};
use super::rpc::{IncomingMessage, RpcChannel, RpcError, INTERNAL_ERROR, SERVER_ERROR};
use super::state::ConnectionStateMachine;
use super::transport::{Frame, FrameReader, FrameWriter};
use super::update_mapping::parse_session_notification;
use crate::api::config::{AdapterOptions, AgentConfig};
use crate::api::types::{
    AgentId, ApiError, ConnectionState, CreateTerminalRequest, InitializeResult, ModelInfo,
    NewSessionResult, PermissionOption, PromptResult, SessionMode, SessionUpdate,
    SessionUpdateEvent,
};
use crate::protocols::agent_connection::AgentConnection;
use crate::protocols::host::AgentHost;
use crate::runtime::dispatcher::{SessionUpdateDispatcher, Subscription};
use crate::runtime::path::normalize_request_path;
use crate::runtime::permissions::{PermissionBroker, PermissionRequest};
use crate::runtime::terminal::TerminalManager;

/// JSON-RPC method name for session creation
const METHOD_SESSION_NEW: &str = "session/new";
/// JSON-RPC method name for sending prompts
const METHOD_SESSION_PROMPT: &str = "session/prompt";
/// JSON-RPC method name for canceling the current turn (notification)
const METHOD_SESSION_CANCEL: &str = "session/cancel";
const METHOD_SESSION_SET_MODE: &str = "session/set_mode";
/// Unstable upstream, used best-effort only
const METHOD_SESSION_SET_MODEL: &str = "session/set_model";

/// JSON-RPC method name for session notifications
const METHOD_SESSION_UPDATE: &str = "session/update";

const METHOD_REQUEST_PERMISSION: &str = "session/request_permission";
const METHOD_FS_READ_TEXT_FILE: &str = "fs/read_text_file";
const METHOD_FS_WRITE_TEXT_FILE: &str = "fs/write_text_file";
const METHOD_TERMINAL_CREATE: &str = "terminal/create";
const METHOD_TERMINAL_OUTPUT: &str = "terminal/output";
const METHOD_TERMINAL_WAIT_FOR_EXIT: &str = "terminal/wait_for_exit";
const METHOD_TERMINAL_KILL: &str = "terminal/kill";
const METHOD_TERMINAL_RELEASE: &str = "terminal/release";

const DEFAULT_STOP_REASON: &str = "end_turn";

/// Everything that lives exactly as long as one connection.
struct Link {
    generation: u64,
    channel: Arc<RpcChannel>,
    process: Option<AgentProcess>,
    inflight: Arc<Semaphore>,
    /// Cleared when teardown starts; later agent requests are refused.
    admitting: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    options: AdapterOptions,
    host: Arc<dyn AgentHost>,
    state: ConnectionStateMachine,
    dispatcher: SessionUpdateDispatcher,
    permissions: PermissionBroker,
    terminals: TerminalManager,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    teardown_lock: tokio::sync::Mutex<()>,
    current_agent: Mutex<Option<AgentId>>,
    agent_info: Mutex<Option<InitializeResult>>,
    working_directory: Mutex<Option<PathBuf>>,
}

/// ACP client for one agent at a time.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct AcpAgent {
    inner: Arc<Inner>,
}

impl AcpAgent {
    /// Create a disconnected adapter. `host` answers the agent's file requests.
    pub fn new(options: AdapterOptions, host: Arc<dyn AgentHost>) -> Self {
        let dispatcher = SessionUpdateDispatcher::new();
        let terminals =
            TerminalManager::new(options.terminal.clone()).with_updates(dispatcher.clone());

        Self {
            inner: Arc::new(Inner {
                permissions: PermissionBroker::new(dispatcher.clone()),
                terminals,
                dispatcher,
                options,
                host,
                state: ConnectionStateMachine::new(),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                teardown_lock: tokio::sync::Mutex::new(()),
                current_agent: Mutex::new(None),
                agent_info: Mutex::new(None),
                working_directory: Mutex::new(None),
            }),
        }
    }

    /// Register a session update callback.
    pub fn on_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionUpdateEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_update(callback)
    }

    /// Register an error callback (process errors, unexpected exits,
    /// initialization failures).
    pub fn on_error<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ApiError) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_error(callback)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Id of the agent the adapter is connected to, once the handshake succeeded.
    pub fn current_agent(&self) -> Option<AgentId> {
        lock(&self.inner.current_agent).clone()
    }

    /// What the agent answered to `initialize`.
    pub fn agent_info(&self) -> Option<InitializeResult> {
        lock(&self.inner.agent_info).clone()
    }

    /// Terminals run on the agent's behalf, for hosts that poll them directly.
    pub fn terminals(&self) -> &TerminalManager {
        &self.inner.terminals
    }

    /// Spawn the agent described by `config` and perform the handshake.
    ///
    /// On failure the error is reported to error subscribers as well,
    /// everything is cleaned up and the state ends in `Disconnected`.
    pub async fn initialize(&self, config: AgentConfig) -> Result<InitializeResult, ApiError> {
        config.validate()?;
        self.inner.state.transition(ConnectionState::Initializing)?;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        log::info!(
            "Connecting to agent: agent_id={}, command={}",
            config.id,
            config.command
        );

        let attached = match ProcessSupervisor::spawn(&config) {
            Ok(SpawnedAgent {
                process,
                stdin,
                stdout,
                stderr,
                events,
            }) => {
                let stderr_task = forward_stderr(config.id.clone(), stderr);
                self.inner
                    .attach(
                        generation,
                        config.id.clone(),
                        config.working_directory.clone(),
                        FrameReader::new(stdout),
                        FrameWriter::new(stdin),
                        Some((process, events)),
                        vec![stderr_task],
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        self.inner.finish_initialization(generation, attached).await
    }

    /// Connect over an existing pair of byte streams instead of a process.
    ///
    /// End of stream on `reader` counts as the connection being lost.
    pub async fn connect_stream<R, W>(
        &self,
        agent_id: impl Into<AgentId>,
        working_directory: impl Into<PathBuf>,
        reader: R,
        writer: W,
    ) -> Result<InitializeResult, ApiError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let agent_id = agent_id.into();
        self.inner.state.transition(ConnectionState::Initializing)?;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        log::info!("Connecting to agent over streams: agent_id={agent_id}");

        let attached = self
            .inner
            .attach(
                generation,
                agent_id,
                working_directory.into(),
                FrameReader::new(reader),
                FrameWriter::new(writer),
                None,
                Vec::new(),
            )
            .await;

        self.inner.finish_initialization(generation, attached).await
    }

    /// Answer a pending permission request. Unknown ids are ignored.
    pub async fn respond_permission(&self, request_id: &str, option_id: &str) -> bool {
        self.inner.permissions.respond(request_id, option_id).await
    }

    /// Close the connection: pending permissions are cancelled, terminals
    /// killed, the agent is asked to exit and killed if it does not.
    pub async fn disconnect(&self) -> Result<(), ApiError> {
        match self.inner.state.current() {
            ConnectionState::Disconnected => return Ok(()),
            ConnectionState::Initializing | ConnectionState::Ready => {
                if let Err(e) = self.inner.state.transition(ConnectionState::Closing) {
                    log::debug!("Disconnect raced a state change: {e}");
                }
            }
            ConnectionState::Closing | ConnectionState::Error => {}
        }

        log::info!("Disconnecting agent: agent_id={:?}", self.current_agent());
        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.inner.teardown(generation).await;
        self.inner.state.force(ConnectionState::Disconnected);
        Ok(())
    }
}

impl Inner {
    #[allow(clippy::too_many_arguments)]
    async fn attach(
        self: &Arc<Self>,
        generation: u64,
        agent_id: AgentId,
        working_directory: PathBuf,
        reader: FrameReader,
        writer: FrameWriter,
        process: Option<(AgentProcess, mpsc::UnboundedReceiver<ProcessEvent>)>,
        mut tasks: Vec<JoinHandle<()>>,
    ) -> Result<InitializeResult, ApiError> {
        let channel = Arc::new(RpcChannel::new(writer));
        let inflight = Arc::new(Semaphore::new(self.options.max_inflight_requests));
        let admitting = Arc::new(AtomicBool::new(true));

        self.terminals.set_default_cwd(Some(working_directory.clone()));
        *lock(&self.working_directory) = Some(working_directory);

        tasks.push(tokio::spawn(read_loop(
            Arc::downgrade(self),
            generation,
            reader,
            channel.clone(),
            inflight.clone(),
            admitting.clone(),
            process.is_none(),
        )));

        let process = match process {
            Some((process, events)) => {
                tasks.push(tokio::spawn(watch_process(
                    Arc::downgrade(self),
                    generation,
                    events,
                )));
                Some(process)
            }
            None => None,
        };

        *lock(&self.link) = Some(Link {
            generation,
            channel: channel.clone(),
            process,
            inflight,
            admitting,
            tasks,
        });

        let info = handshake::negotiate(&channel, &self.options).await?;

        *lock(&self.agent_info) = Some(info.clone());
        *lock(&self.current_agent) = Some(agent_id.clone());
        if let Err(e) = self.state.transition(ConnectionState::Ready) {
            *lock(&self.current_agent) = None;
            *lock(&self.agent_info) = None;
            return Err(e);
        }

        log::info!("Agent connected: agent_id={agent_id}");
        Ok(info)
    }

    async fn finish_initialization(
        &self,
        generation: u64,
        attached: Result<InitializeResult, ApiError>,
    ) -> Result<InitializeResult, ApiError> {
        let error = match attached {
            Ok(info) => return Ok(info),
            Err(error) => error,
        };

        // An intentional disconnect during the handshake is not a failure to report
        if matches!(
            self.state.current(),
            ConnectionState::Closing | ConnectionState::Disconnected
        ) {
            log::info!("Initialization aborted by disconnect: {error}");
            return Err(error);
        }

        self.dispatcher.report_error(&error);
        self.state.force(ConnectionState::Error);
        self.teardown(generation).await;
        self.state.force(ConnectionState::Disconnected);
        Err(error)
    }

    /// Tear down the link of `generation`. A no-op when that link is
    /// already gone (a newer connection is left alone).
    async fn teardown(&self, generation: u64) {
        let _serialized = self.teardown_lock.lock().await;

        let link = {
            let mut guard = lock(&self.link);
            match guard.as_ref() {
                Some(link) if link.generation == generation => guard.take(),
                _ => None,
            }
        };
        let Some(link) = link else {
            return;
        };

        link.admitting.store(false, Ordering::SeqCst);

        let mut cancelled = self.permissions.cancel_all().await;
        let mut killed = self.terminals.shutdown();

        // Let in-flight agent requests deliver their (now cancelled) answers
        let max_inflight = u32::try_from(self.options.max_inflight_requests).unwrap_or(u32::MAX);
        let _drained = match tokio::time::timeout(
            self.options.kill_grace(),
            link.inflight.acquire_many(max_inflight),
        )
        .await
        {
            Ok(permits) => permits.ok(),
            Err(_) => {
                log::debug!("In-flight agent requests still running at teardown");
                None
            }
        };

        if tokio::time::timeout(self.options.graceful_close_timeout(), link.channel.close())
            .await
            .is_err()
        {
            log::warn!("Closing agent stdin timed out");
            link.channel.fail_pending();
        }

        if let Some(process) = &link.process {
            let exited =
                tokio::time::timeout(self.options.graceful_close_timeout(), process.wait()).await;
            if exited.is_err() {
                process.terminate(self.options.kill_grace()).await;
            }
        }

        for task in &link.tasks {
            task.abort();
        }

        // Requests admitted just before admission closed may have created
        // terminals or permissions after the first pass
        cancelled += self.permissions.cancel_all().await;
        killed += self.terminals.shutdown();

        *lock(&self.current_agent) = None;
        *lock(&self.agent_info) = None;
        *lock(&self.working_directory) = None;
        self.terminals.set_default_cwd(None);
        self.state.force(ConnectionState::Disconnected);

        log::info!(
            "Agent connection torn down: cancelled_permissions={cancelled}, killed_terminals={killed}"
        );
    }

    /// Channel for a session request; only legal in `Ready`.
    fn ready_channel(&self) -> Result<Arc<RpcChannel>, ApiError> {
        self.state.ensure_ready()?;
        lock(&self.link)
            .as_ref()
            .map(|link| link.channel.clone())
            .ok_or(ApiError::NotReady {
                state: self.state.current(),
            })
    }

    fn handle_notification(&self, method: &str, params: &Value) {
        match method {
            METHOD_SESSION_UPDATE => {
                if let Some((session_id, update)) = parse_session_notification(params) {
                    self.dispatcher.publish(session_id, update);
                }
            }
            other => log::debug!("Unknown notification method: {other}"),
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            METHOD_REQUEST_PERMISSION => {
                let params: PermissionParams = parse_params(params)?;
                let outcome = self
                    .permissions
                    .request(PermissionRequest {
                        session_id: params.session_id,
                        tool_call: params.tool_call,
                        options: params.options,
                    })
                    .await;
                Ok(json!({ "outcome": outcome }))
            }
            METHOD_FS_READ_TEXT_FILE => {
                let params: ReadTextFileParams = parse_params(params)?;
                let path = self.request_path(&params.path);
                let content = self.host.read_text_file(&path).await?;
                Ok(json!({ "content": slice_lines(&content, params.line, params.limit) }))
            }
            METHOD_FS_WRITE_TEXT_FILE => {
                let params: WriteTextFileParams = parse_params(params)?;
                let path = self.request_path(&params.path);
                self.host.write_text_file(&path, &params.content).await?;
                Ok(json!({}))
            }
            METHOD_TERMINAL_CREATE => {
                let request: CreateTerminalRequest = parse_params(params)?;
                let terminal_id = self.terminals.create(request).await?;
                Ok(json!({ "terminalId": terminal_id }))
            }
            METHOD_TERMINAL_OUTPUT => {
                let params: TerminalParams = parse_params(params)?;
                let output = self.terminals.output(&params.terminal_id)?;
                to_value(output)
            }
            METHOD_TERMINAL_WAIT_FOR_EXIT => {
                let params: TerminalParams = parse_params(params)?;
                let status = self.terminals.wait_for_exit(&params.terminal_id).await?;
                to_value(status)
            }
            METHOD_TERMINAL_KILL | METHOD_TERMINAL_RELEASE => {
                let params: TerminalParams = parse_params(params)?;
                let result = if method == METHOD_TERMINAL_KILL {
                    self.terminals.kill(&params.terminal_id)
                } else {
                    self.terminals.release(&params.terminal_id)
                };
                match result {
                    Ok(()) => Ok(json!({})),
                    Err(ApiError::TerminalNotFound { terminal_id }) => {
                        log::warn!(
                            "{method} for unknown terminal ignored: terminal_id={terminal_id}"
                        );
                        Ok(json!({}))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            other => {
                log::debug!("Unsupported agent request: method={other}");
                Err(RpcError::method_not_found(other))
            }
        }
    }

    fn request_path(&self, path: &str) -> String {
        match lock(&self.working_directory).as_deref() {
            Some(root) => normalize_request_path(path, root),
            None => normalize_request_path(path, Path::new("/")),
        }
    }
}

#[async_trait]
impl AgentConnection for AcpAgent {
    async fn new_session(&self, cwd: &Path) -> Result<NewSessionResult, ApiError> {
        let channel = self.inner.ready_channel()?;

        let response = channel
            .request(
                METHOD_SESSION_NEW,
                json!({
                    "cwd": cwd.to_string_lossy(),
                    "mcpServers": []
                }),
            )
            .await
            .map_err(|e| ApiError::SessionFailed {
                message: e.to_string(),
            })?;

        let result = parse_new_session(&response)?;
        log::info!(
            "Session created: session={}, modes={}, models={:?}",
            result.session_id,
            result.available_modes.len(),
            result.available_models.as_ref().map(Vec::len)
        );
        Ok(result)
    }

    async fn prompt(&self, session_id: &str, text: &str) -> Result<PromptResult, ApiError> {
        let channel = self.inner.ready_channel()?;
        log::info!(
            "Sending prompt: session={session_id}, prompt_len={}",
            text.len()
        );

        let response = channel
            .request(
                METHOD_SESSION_PROMPT,
                json!({
                    "sessionId": session_id,
                    "prompt": [{ "type": "text", "text": text }]
                }),
            )
            .await;

        match response {
            Ok(result) => {
                let stop_reason = result
                    .get("stopReason")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_STOP_REASON)
                    .to_string();
                self.inner.dispatcher.publish(
                    Some(session_id.to_string()),
                    SessionUpdate::SessionEnded {
                        stop_reason: stop_reason.clone(),
                    },
                );
                Ok(PromptResult { stop_reason })
            }
            Err(e) => {
                log::warn!("Prompt failed: session={session_id}, error={e}");
                self.inner.dispatcher.publish(
                    Some(session_id.to_string()),
                    SessionUpdate::SessionError {
                        message: e.to_string(),
                    },
                );
                Err(ApiError::PromptFailed {
                    message: e.to_string(),
                })
            }
        }
    }

    async fn cancel(&self, session_id: &str) -> Result<(), ApiError> {
        let channel = self.inner.ready_channel()?;
        log::info!("Canceling turn: session={session_id}");

        if let Err(e) = channel
            .notify(METHOD_SESSION_CANCEL, json!({ "sessionId": session_id }))
            .await
        {
            log::warn!("Cancel could not be sent: session={session_id}, error={e}");
        }
        Ok(())
    }

    async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<(), ApiError> {
        let channel = self.inner.ready_channel()?;

        channel
            .request(
                METHOD_SESSION_SET_MODE,
                json!({ "sessionId": session_id, "modeId": mode_id }),
            )
            .await
            .map_err(|e| ApiError::SessionFailed {
                message: e.to_string(),
            })?;

        log::info!("Session mode set: session={session_id}, mode={mode_id}");
        Ok(())
    }

    async fn set_model(&self, session_id: &str, model_id: &str) -> Result<bool, ApiError> {
        let channel = self.inner.ready_channel()?;

        match channel
            .request(
                METHOD_SESSION_SET_MODEL,
                json!({ "sessionId": session_id, "modelId": model_id }),
            )
            .await
        {
            Ok(_) => {
                log::info!("Session model set: session={session_id}, model={model_id}");
                Ok(true)
            }
            Err(e) => {
                log::warn!(
                    "Setting model failed: session={session_id}, model={model_id}, error={e}"
                );
                Ok(false)
            }
        }
    }

    async fn shutdown(&self) -> Result<(), ApiError> {
        self.disconnect().await
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut reader: FrameReader,
    channel: Arc<RpcChannel>,
    inflight: Arc<Semaphore>,
    admitting: Arc<AtomicBool>,
    lost_on_eof: bool,
) {
    loop {
        let frame = match reader.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!("Agent stdout closed");
                break;
            }
            Err(e) => {
                log::warn!("Reading from agent failed: {e}");
                break;
            }
        };

        let message = match frame {
            Frame::Message(message) => message,
            Frame::Noise(line) => {
                log::debug!("[agent stdout] {line}");
                continue;
            }
        };

        let Some(message) = IncomingMessage::classify(message) else {
            log::debug!("Ignoring non JSON-RPC message from agent");
            continue;
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };

        match message {
            IncomingMessage::Response { id, outcome } => channel.complete(&id, outcome),
            IncomingMessage::Notification { method, params } => {
                inner.handle_notification(&method, &params);
            }
            IncomingMessage::Request { id, method, params } => {
                let channel = channel.clone();
                if !admitting.load(Ordering::SeqCst) {
                    log::debug!("Connection closing, rejecting agent request: method={method}");
                    tokio::spawn(async move {
                        let closing = RpcError::new(SERVER_ERROR, "Connection is closing");
                        let _ = channel.respond(id, Err(closing)).await;
                    });
                    continue;
                }
                match inflight.clone().try_acquire_owned() {
                    Ok(permit) => {
                        tokio::spawn(async move {
                            let _permit = permit;
                            let outcome = inner.handle_request(&method, params).await;
                            if let Err(e) = channel.respond(id, outcome).await {
                                log::debug!(
                                    "Failed to answer agent request: method={method}, error={e}"
                                );
                            }
                        });
                    }
                    Err(_) => {
                        log::warn!("Too many in-flight agent requests, rejecting: method={method}");
                        tokio::spawn(async move {
                            let busy = RpcError::new(SERVER_ERROR, "Too many in-flight requests");
                            let _ = channel.respond(id, Err(busy)).await;
                        });
                    }
                }
            }
        }
    }

    let failed = channel.fail_pending();
    if failed > 0 {
        log::debug!("Failed pending requests after stdout closed: count={failed}");
    }

    if lost_on_eof {
        if let Some(inner) = inner.upgrade() {
            connection_lost(inner, generation, None).await;
        }
    }
}

async fn watch_process(
    inner: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    let Some(event) = events.recv().await else {
        return;
    };
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let error = match event {
        ProcessEvent::Error(message) => Some(ApiError::ProcessError { message }),
        ProcessEvent::Exited(status) => match status.exit_code {
            Some(code) if code != 0 => Some(ApiError::UnexpectedExit {
                code: Some(code),
                signal: status.signal,
            }),
            _ => None,
        },
    };
    connection_lost(inner, generation, error).await;
}

/// The agent went away on its own. Reported only when nobody asked for it.
async fn connection_lost(inner: Arc<Inner>, generation: u64, error: Option<ApiError>) {
    // During the handshake the pending `initialize` fails and the
    // initialization path reports and cleans up
    let mut state_rx = inner.state.subscribe();
    let state = match state_rx
        .wait_for(|state| *state != ConnectionState::Initializing)
        .await
    {
        Ok(state) => *state,
        Err(_) => return,
    };

    if state != ConnectionState::Ready {
        log::debug!("Agent connection ended: state={state}");
        return;
    }

    match error {
        Some(error) => {
            inner.dispatcher.report_error(&error);
            inner.state.force(ConnectionState::Error);
        }
        None => log::info!("Agent connection lost"),
    }

    // Teardown aborts the task we run on; give it its own
    tokio::spawn(async move {
        inner.teardown(generation).await;
    });
}

fn parse_new_session(response: &Value) -> Result<NewSessionResult, ApiError> {
    let session_id = response
        .get("sessionId")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::SessionFailed {
            message: "session/new response missing sessionId".to_string(),
        })?
        .to_string();

    let modes = response.get("modes");
    let models = response.get("models");

    Ok(NewSessionResult {
        session_id,
        current_mode_id: modes
            .and_then(|m| m.get("currentModeId"))
            .and_then(Value::as_str)
            .map(str::to_string),
        available_modes: modes
            .and_then(|m| m.get("availableModes"))
            .and_then(|m| lenient_list::<SessionMode>(m))
            .unwrap_or_default(),
        current_model_id: models
            .and_then(|m| m.get("currentModelId"))
            .and_then(Value::as_str)
            .map(str::to_string),
        available_models: models
            .and_then(|m| m.get("availableModels"))
            .and_then(|m| lenient_list::<ModelInfo>(m)),
    })
}

/// Decode a list item by item, dropping malformed items.
fn lenient_list<T: DeserializeOwned>(value: &Value) -> Option<Vec<T>> {
    let items = value.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
    )
}

/// Apply the optional 1-based `line` and `limit` of `fs/read_text_file`.
fn slice_lines(content: &str, line: Option<u64>, limit: Option<u64>) -> String {
    if line.is_none() && limit.is_none() {
        return content.to_string();
    }

    let skip = line.map_or(0, |line| line.saturating_sub(1));
    let skip = usize::try_from(skip).unwrap_or(usize::MAX);
    let take = limit.map_or(usize::MAX, |limit| {
        usize::try_from(limit).unwrap_or(usize::MAX)
    });

    content.split_inclusive('\n').skip(skip).take(take).collect()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionParams {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    tool_call: Value,
    #[serde(default)]
    options: Vec<PermissionOption>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadTextFileParams {
    path: String,
    #[serde(default)]
    line: Option<u64>,
    #[serde(default)]
    limit: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteTextFileParams {
    path: String,
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminalParams {
    terminal_id: String,
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
