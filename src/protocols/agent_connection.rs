//! AgentConnection trait: host → protocol abstraction boundary.
//!
//! Session-level operations the host issues against a connected agent,
//! without knowing protocol details. Every operation requires the
//! connection to be `Ready` and fails with `NotReady` otherwise.

use std::path::Path;

use async_trait::async_trait;

use crate::api::types::{ApiError, NewSessionResult, PromptResult};

/// Abstract interface for agent protocol connections.
///
/// Implemented by protocol-specific agents (e.g., AcpAgent).
#[async_trait]
pub trait AgentConnection: Send + Sync {
    /// Create a session rooted at `cwd`.
    async fn new_session(&self, cwd: &Path) -> Result<NewSessionResult, ApiError>;

    /// Send a text prompt and wait for the turn to finish.
    ///
    /// Streaming progress arrives through session updates meanwhile.
    async fn prompt(&self, session_id: &str, text: &str) -> Result<PromptResult, ApiError>;

    /// Ask the agent to stop the current turn. Best-effort: a failure to
    /// send is logged, not returned.
    async fn cancel(&self, session_id: &str) -> Result<(), ApiError>;

    async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<(), ApiError>;

    /// Switch the session's model. Returns `Ok(false)` when the agent
    /// refused or does not support it.
    async fn set_model(&self, session_id: &str, model_id: &str) -> Result<bool, ApiError>;

    /// Shutdown the agent connection gracefully.
    ///
    /// This should terminate the child process and clean up resources.
    async fn shutdown(&self) -> Result<(), ApiError>;
}
