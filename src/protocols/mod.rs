//! Protocol layer - abstractions and implementations for agent communication.
//!
//! This module provides:
//! - `AgentConnection` trait: host → protocol abstraction boundary
//! - `AgentHost` trait: protocol → host storage callback boundary
//! - `acp`: ACP protocol implementation (STDIO + JSON-RPC)

pub mod acp;
pub mod agent_connection;
pub mod host;

pub use agent_connection::AgentConnection;
pub use host::AgentHost;
