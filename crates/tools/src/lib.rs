//! Tool registry and destructive-action gate (SPEC_FULL §4.2).

pub mod builtin;
pub mod destructive;
pub mod registry;

pub use registry::{ConfirmCallback, RemoteProvider, Tool, ToolDefinition, ToolOutput, ToolRegistry};
