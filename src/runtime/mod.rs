//! Runtime modules driven by the agent connection.
//!
//! The runtime domain holds host-side state: subscribers, pending
//! permissions, terminals and file access.

pub mod dispatcher;
pub mod fs;
pub mod path;
pub mod permissions;
pub mod terminal;
