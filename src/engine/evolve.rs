//! Capability synthesis hook for the turn-limit recovery path.
//!
//! When enabled, a loop that hits its turn limit with no extension tool
//! available may ask a synthesizer to produce one new capability, then retry
//! the whole loop once with it registered. The default implementation is a
//! no-op: synthesis stays off unless an embedder wires in a real one.

use std::sync::Arc;

use async_trait::async_trait;

use crate::tools::tool::Tool;

/// Produces new callable capabilities on demand.
#[async_trait]
pub trait CapabilitySynthesizer: Send + Sync {
    /// Attempt to synthesize a tool suited to `instruction`. `None` means
    /// nothing could be produced and the loop fails over to the plain
    /// turn-limit message.
    async fn synthesize(&self, instruction: &str) -> Option<Arc<dyn Tool>>;
}

/// Disabled synthesizer: never produces anything.
pub struct NoEvolution;

#[async_trait]
impl CapabilitySynthesizer for NoEvolution {
    async fn synthesize(&self, _instruction: &str) -> Option<Arc<dyn Tool>> {
        None
    }
}
