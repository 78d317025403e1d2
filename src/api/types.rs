//! Bridge types for the presentation layer.
//!
//! These types provide a stable API surface for whatever renders the
//! connection (chat UI, settings pane), hiding protocol complexity.
//! Everything here is `Serialize` so it can be forwarded as-is.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a configured agent (e.g., "claude-code", "gemini")
pub type AgentId = String;

/// Session identifier issued by the agent on `session/new`
pub type SessionId = String;

/// Terminal identifier issued by this side on `terminal/create` (UUID v4 string)
pub type TerminalId = String;

/// Permission request identifier (UUID v4 string), unique for the connection lifetime
pub type PermissionRequestId = String;

/// Lifecycle state of an agent connection.
///
/// Transitions are the sole truth for whether a session request may be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Initializing,
    Ready,
    Closing,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Authentication method advertised by the agent during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMethod {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Outcome of the one-time capability exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: u16,
    #[serde(default)]
    pub auth_methods: Vec<AuthMethod>,
    /// Capabilities as advertised by the agent (kept opaque)
    #[serde(default)]
    pub agent_capabilities: serde_json::Value,
}

/// A mode the agent can operate in (e.g., "ask", "code").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMode {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A model the agent can be switched to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub model_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Result of `session/new`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResult {
    pub session_id: SessionId,
    pub current_mode_id: Option<String>,
    pub available_modes: Vec<SessionMode>,
    pub current_model_id: Option<String>,
    /// `None` when the agent does not expose model selection
    pub available_models: Option<Vec<ModelInfo>>,
}

/// Result of a completed `session/prompt` turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResult {
    pub stop_reason: String,
}

// ============================================================================
// Session updates
// ============================================================================

/// Who authored a message chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Agent,
}

/// Status of a plan entry after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanEntryStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Blocked,
}

impl PlanEntryStatus {
    /// Map an external status string onto the internal set.
    ///
    /// Unrecognized values fall back to `Pending`.
    pub fn normalize(raw: &str) -> Self {
        match raw {
            "in_progress" | "running" => PlanEntryStatus::Running,
            "completed" | "complete" => PlanEntryStatus::Complete,
            "failed" => PlanEntryStatus::Failed,
            "blocked" => PlanEntryStatus::Blocked,
            _ => PlanEntryStatus::Pending,
        }
    }
}

/// One entry of an agent plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: PlanEntryStatus,
}

/// Content attached to a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolCallContent {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Diff {
        path: String,
        old_text: Option<String>,
        new_text: String,
    },
    #[serde(rename_all = "camelCase")]
    Terminal {
        terminal_id: TerminalId,
    },
}

/// A file location a tool call touches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallLocation {
    pub path: String,
    pub line: Option<u32>,
}

/// A tool call announced by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub tool_call_id: String,
    pub title: String,
    pub kind: Option<String>,
    pub status: Option<String>,
    pub content: Vec<ToolCallContent>,
    pub locations: Vec<ToolCallLocation>,
    pub raw_input: Option<serde_json::Value>,
}

/// A partial update to a previously announced tool call.
///
/// Only `tool_call_id` is always present; a missing id on the wire is
/// replaced by [`UNKNOWN_TOOL_CALL_ID`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallUpdate {
    pub tool_call_id: String,
    pub title: Option<String>,
    pub kind: Option<String>,
    pub status: Option<String>,
    pub content: Option<Vec<ToolCallContent>>,
    pub locations: Option<Vec<ToolCallLocation>>,
    pub raw_output: Option<serde_json::Value>,
}

/// Sentinel used when a tool call update arrives without an identifier.
pub const UNKNOWN_TOOL_CALL_ID: &str = "unknown";

/// A slash command the agent currently accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableCommand {
    pub name: String,
    pub description: String,
    pub input_hint: Option<String>,
}

/// One option the user can pick when the agent asks for permission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    pub name: String,
    /// e.g. "allow_once", "allow_always", "reject_once", "reject_always"
    pub kind: String,
}

/// Decision delivered back to the agent for a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PermissionOutcome {
    Cancelled,
    Selected {
        #[serde(rename = "optionId")]
        option_id: String,
    },
}

/// Typed session update produced from raw protocol payloads.
///
/// Closed set: adding a variant is a compile-time exhaustiveness change for
/// every consumer that matches on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    MessageChunk {
        role: MessageRole,
        text: String,
    },
    ThoughtChunk {
        text: String,
    },
    ToolCall(ToolCall),
    ToolCallUpdate(ToolCallUpdate),
    Plan {
        entries: Vec<PlanEntry>,
    },
    #[serde(rename_all = "camelCase")]
    ModeChanged {
        mode_id: String,
    },
    AvailableCommandsChanged {
        commands: Vec<AvailableCommand>,
    },
    #[serde(rename_all = "camelCase")]
    PermissionRequested {
        request_id: PermissionRequestId,
        tool_call: serde_json::Value,
        options: Vec<PermissionOption>,
    },
    #[serde(rename_all = "camelCase")]
    SessionEnded {
        stop_reason: String,
    },
    SessionError {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Output {
        terminal_id: TerminalId,
        text: String,
    },
}

/// A session update together with the session it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdateEvent {
    /// `None` for updates not tied to a session (e.g., a terminal created without one)
    pub session_id: Option<SessionId>,
    pub update: SessionUpdate,
}

// ============================================================================
// Terminals
// ============================================================================

/// Exit status of a terminal process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitStatus {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

/// Exit code reported for a terminal whose command could not be spawned.
pub const COMMAND_NOT_FOUND_EXIT_CODE: i32 = 127;

impl ExitStatus {
    /// Sentinel status for a command that could not be started at all.
    pub fn command_not_found() -> Self {
        Self {
            exit_code: Some(COMMAND_NOT_FOUND_EXIT_CODE),
            signal: None,
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal().map(signal_name)
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            exit_code: status.code(),
            signal,
        }
    }
}

#[cfg(unix)]
fn signal_name(raw: i32) -> String {
    nix::sys::signal::Signal::try_from(raw)
        .map(|signal| signal.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{raw}"))
}

/// Environment variable for a terminal command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVariable {
    pub name: String,
    pub value: String,
}

/// Parameters of a `terminal/create` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalRequest {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub command: String,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: Vec<EnvVariable>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub output_byte_limit: Option<u64>,
}

impl CreateTerminalRequest {
    /// Request running `command` with default settings.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }
}

/// Snapshot returned by `terminal/output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutput {
    pub output: String,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<ExitStatus>,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by the connection subsystem.
///
/// Tagged with `"type"` so the presentation layer can branch on it.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ApiError {
    /// Invalid input parameter
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
    /// No process id was obtained for the agent
    #[error("Failed to spawn agent process: {message}")]
    SpawnFailed { message: String },
    /// A standard stream of the agent could not be captured
    #[error("Agent {stream} is unavailable")]
    StdioUnavailable { stream: String },
    /// The agent process reported an error
    #[error("Agent process error: {message}")]
    ProcessError { message: String },
    /// The agent exited with a failure status while not being shut down
    #[error("Agent process exited unexpectedly: code={code:?}, signal={signal:?}")]
    UnexpectedExit {
        code: Option<i32>,
        signal: Option<String>,
    },
    /// The capability exchange did not complete
    #[error("Handshake failed: {message}")]
    HandshakeFailed { message: String },
    /// A session operation was attempted outside `Ready`
    #[error("Connection not ready: state={state}")]
    NotReady { state: ConnectionState },
    /// The state machine refused a transition
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Terminal does not exist or was already cleaned up
    #[error("Terminal not found: {terminal_id}")]
    TerminalNotFound { terminal_id: TerminalId },
    /// A prompt turn failed
    #[error("Prompt failed: {message}")]
    PromptFailed { message: String },
    /// A session-level request (new session, mode change) failed
    #[error("Session request failed: {message}")]
    SessionFailed { message: String },
    /// Malformed or unexpected protocol traffic
    #[error("Protocol error: {message}")]
    ProtocolError { message: String },
    /// JSON-RPC error object returned by the agent
    #[error("Agent returned error: code={code}, message={message}")]
    Rpc { code: i64, message: String },
    /// IO error on a stream or the file system
    #[error("IO error: {message}")]
    IoError { message: String },
    /// Path does not exist or is not accessible
    #[error("Path not found: {path}")]
    PathNotFound { path: String },
    /// The protocol channel closed before a response arrived
    #[error("Connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_status_normalization() {
        assert_eq!(
            PlanEntryStatus::normalize("in_progress"),
            PlanEntryStatus::Running
        );
        assert_eq!(
            PlanEntryStatus::normalize("completed"),
            PlanEntryStatus::Complete
        );
        assert_eq!(PlanEntryStatus::normalize("blocked"), PlanEntryStatus::Blocked);
        assert_eq!(PlanEntryStatus::normalize("weird"), PlanEntryStatus::Pending);
    }

    #[test]
    fn test_permission_outcome_wire_shape() {
        let selected = PermissionOutcome::Selected {
            option_id: "allow".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&selected).unwrap(),
            serde_json::json!({"outcome": "selected", "optionId": "allow"})
        );
        assert_eq!(
            serde_json::to_value(PermissionOutcome::Cancelled).unwrap(),
            serde_json::json!({"outcome": "cancelled"})
        );
    }

    #[test]
    fn test_not_ready_error_carries_state() {
        let err = ApiError::NotReady {
            state: ConnectionState::Closing,
        };
        assert_eq!(err.to_string(), "Connection not ready: state=closing");

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "NotReady");
        assert_eq!(json["state"], "closing");
    }

    #[test]
    fn test_terminal_output_omits_missing_exit_status() {
        let output = TerminalOutput {
            output: "hi\n".to_string(),
            truncated: false,
            exit_status: None,
        };
        let json = serde_json::to_value(&output).unwrap();
        assert!(json.get("exitStatus").is_none());
    }
}
