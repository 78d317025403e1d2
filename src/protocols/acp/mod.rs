//! ACP protocol implementation.
//!
//! This module implements the Agent Client Protocol using STDIO + JSON-RPC
//! to communicate with agent binaries (claude-code, codex, gemini, etc.).

mod agent;
pub mod handshake;
pub mod process;
pub mod rpc;
pub mod state;
pub mod transport;
pub mod update_mapping;

pub use agent::AcpAgent;
