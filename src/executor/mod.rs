//! Build executor running on a node.
//!
//! Accepts one job specification per persistent WebSocket connection, spawns
//! the build driver and live-tails its stdout back to the consumer. At most
//! one build runs per executor at a time; a competing connection is rejected
//! with a distinct close code.

pub mod build;
pub mod protocol;

pub use build::BuildServer;
