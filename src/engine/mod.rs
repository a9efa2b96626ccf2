//! Tool-loop engine: guards, dispatch, and the turn loop itself.

pub mod dispatcher;
pub mod evolve;
pub mod guards;
pub mod loop_engine;

pub use dispatcher::ToolCallDispatcher;
pub use evolve::{CapabilitySynthesizer, NoEvolution};
pub use guards::{GuardRails, GuardVerdict};
pub use loop_engine::ToolLoopEngine;
