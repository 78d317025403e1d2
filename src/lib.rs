//! Agent connection subsystem.
//!
//! Supervises an ACP agent process, speaks newline-delimited JSON-RPC with
//! it over its standard streams, turns its notifications into typed
//! session updates, correlates permission requests with user decisions and
//! runs the terminals the agent asks for.
//!
//! - `api`: stable types shared with the presentation layer
//! - `protocols`: the ACP wire side
//! - `runtime`: host-side components (subscribers, permissions, terminals, files)
//!
//! Logging goes through the `log` facade; the embedding host installs the
//! backend.

pub mod api;
pub mod protocols;
pub mod runtime;

pub use api::config::{AdapterOptions, AgentConfig, TerminalOptions};
pub use api::types::{ApiError, ConnectionState, SessionUpdate, SessionUpdateEvent};
pub use protocols::acp::AcpAgent;
pub use protocols::{AgentConnection, AgentHost};
pub use runtime::dispatcher::Subscription;
pub use runtime::fs::FsManager;
