//! Tools: the trait, the registry, policy, and the built-in set.

pub mod builtin;
pub mod policy;
pub mod registry;
pub mod tool;

pub use policy::{PolicyGate, ToolPolicy};
pub use registry::ToolRegistry;
pub use tool::{Tool, ToolCallResult, ToolContext, ToolKind};
