//! AgentHost trait: protocol → host storage callback boundary.
//!
//! The agent asks this side to read and write text files. The connection
//! layer does not touch storage itself; it normalizes the path the agent
//! sent and delegates to the host's implementation (a vault, a workspace
//! directory, an in-memory store in tests).

use async_trait::async_trait;

use crate::api::types::ApiError;

/// Host-side file access used to answer `fs/read_text_file` and
/// `fs/write_text_file`.
///
/// Paths arrive already normalized: relative to the connection's working
/// directory, without leading slashes.
#[async_trait]
pub trait AgentHost: Send + Sync {
    /// Read a whole text file. A missing file reads as `""`.
    async fn read_text_file(&self, path: &str) -> Result<String, ApiError>;

    /// Create or replace a text file.
    async fn write_text_file(&self, path: &str, content: &str) -> Result<(), ApiError>;
}
