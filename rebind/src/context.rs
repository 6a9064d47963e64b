//! Isolated execution contexts.
//!
//! How a context actually comes to exist (an invisible frame, a sandboxed
//! subprocess, a remote agent) is environment-specific. The core only needs
//! three seams: launch a candidate for an offer, hand it one end of a private
//! channel, and release it. Everything else, including turning a request
//! envelope into a real network action, belongs to the implementation.

use async_trait::async_trait;

use crate::channel::ChannelPort;
use crate::protocol::Offer;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LaunchError {
    /// The context at the offer's locator never reached its loaded state.
    #[error("context failed to load: {0}")]
    Load(String),
}

/// Factory for isolated contexts, one per offer.
///
/// `launch` resolves once the context has reached its loaded state and is
/// ready to receive the sync message. A load failure fails that candidate
/// only; the caller races the rest.
#[async_trait]
pub trait ContextHost: Send + Sync {
    async fn launch(&self, offer: &Offer) -> Result<Box<dyn IsolatedContext>, LaunchError>;
}

/// One live candidate context.
///
/// Dropping the handle tears the context down and releases its resources.
/// Implementations must make drop idempotent and non-blocking.
pub trait IsolatedContext: Send + Sync {
    /// Deliver the synchronization message handing the context its end of a
    /// private channel. The context is expected to answer with an
    /// acknowledgment on that channel; the caller judges what comes back.
    fn post_sync(&mut self, port: ChannelPort);
}
