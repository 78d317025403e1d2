//! Connection configuration.
//!
//! `AgentConfig` describes which agent to launch; `AdapterOptions` tunes how
//! the adapter talks to it. Both deserialize from the host's settings JSON
//! (camelCase) and are immutable for the lifetime of a connection attempt.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::types::{AgentId, ApiError};

/// Protocol version this side declares during the handshake.
pub const DEFAULT_PROTOCOL_VERSION: u16 = 1;

const DEFAULT_GRACEFUL_CLOSE_MS: u64 = 5_000;
const DEFAULT_KILL_GRACE_MS: u64 = 1_000;
const DEFAULT_MAX_INFLIGHT_REQUESTS: usize = 64;
const DEFAULT_RELEASE_GRACE_MS: u64 = 30_000;

/// Launch description for an agent process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Agent identifier, becomes the "current agent" once connected
    pub id: AgentId,
    /// Human readable name shown in the UI
    #[serde(default)]
    pub display_name: String,
    /// Path to the executable binary
    pub command: String,
    /// Command-line arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the agent, also the root for file requests
    pub working_directory: PathBuf,
    /// Environment overrides, merged over the caller's environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl AgentConfig {
    /// Create a config with no arguments and no environment overrides.
    pub fn new(
        id: impl Into<AgentId>,
        command: impl Into<String>,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            command: command.into(),
            args: Vec::new(),
            working_directory: working_directory.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Reject configs that can never be launched.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.id.trim().is_empty() {
            return Err(ApiError::InvalidInput {
                message: "Agent ID cannot be empty".to_string(),
            });
        }
        if self.command.trim().is_empty() {
            return Err(ApiError::InvalidInput {
                message: format!("Agent command cannot be empty: agent={}", self.id),
            });
        }
        Ok(())
    }
}

/// Adapter tuning knobs. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdapterOptions {
    /// Protocol version declared in `initialize`
    pub protocol_version: u16,
    /// Whether terminal support is advertised to the agent
    pub advertise_terminal: bool,
    /// How long to wait for the agent to exit after its stdin is closed
    pub graceful_close_ms: u64,
    /// How long to wait after SIGTERM before escalating to SIGKILL
    pub kill_grace_ms: u64,
    /// Maximum number of agent-initiated requests served concurrently
    pub max_inflight_requests: usize,
    pub terminal: TerminalOptions,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            advertise_terminal: true,
            graceful_close_ms: DEFAULT_GRACEFUL_CLOSE_MS,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
            max_inflight_requests: DEFAULT_MAX_INFLIGHT_REQUESTS,
            terminal: TerminalOptions::default(),
        }
    }
}

impl AdapterOptions {
    pub fn graceful_close_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_close_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Terminal manager tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TerminalOptions {
    /// Delay between releasing a running terminal and removing its record
    pub release_grace_ms: u64,
    /// Wrap commands in `$SHELL -l -c` on POSIX so they see the user's environment
    pub login_shell: bool,
    /// Byte limit applied when a create request does not carry one
    pub default_output_byte_limit: Option<u64>,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self {
            release_grace_ms: DEFAULT_RELEASE_GRACE_MS,
            login_shell: true,
            default_output_byte_limit: None,
        }
    }
}

impl TerminalOptions {
    pub fn release_grace(&self) -> Duration {
        Duration::from_millis(self.release_grace_ms)
    }
}
