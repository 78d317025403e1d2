//! API types for the presentation-layer bridge.
//!
//! This module defines stable types for configuration, events and errors,
//! isolating protocol complexity from the UI.

pub mod config;
pub mod types;
