//! Candidate-context race.
//!
//! One isolated context per offer. Each candidate loads, then runs the
//! two-step handshake: hand the context one end of a fresh private channel,
//! wait for the acknowledgment on the retained end. The first candidate to
//! acknowledge correctly wins the race; a candidate that fails is dropped on
//! the spot, and every other candidate, settled or still pending, is
//! cancelled and torn down the moment the race settles.

use std::sync::Arc;

use crate::channel::ChannelPort;
use crate::context::{ContextHost, IsolatedContext};
use crate::protocol::{ACK_TOKEN, ChannelReply, Offer};
use crate::race;

/// Failure of a single candidate. Never fatal to the race on its own.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CandidateError {
    #[error("candidate {locator} failed to load: {reason}")]
    Load { locator: String, reason: String },

    /// The context acknowledged with the wrong token.
    #[error("candidate {locator} acknowledged with {got:?} instead of \"ACK\"")]
    BadAck { locator: String, got: String },

    /// The context answered the handshake with something other than an
    /// acknowledgment record.
    #[error("candidate {locator} sent a non-acknowledgment during the handshake")]
    Protocol { locator: String },

    #[error("candidate {locator} closed the channel before acknowledging")]
    ChannelClosed { locator: String },
}

/// Every offer was tried and none produced a channel.
#[derive(Debug, Clone, thiserror::Error)]
#[error("no candidate established a channel ({attempted} offers attempted)")]
pub struct NoCandidateError {
    pub attempted: usize,
    pub failures: Vec<CandidateError>,
}

/// The winning candidate: its live context plus our end of the private
/// channel it acknowledged on.
pub struct NegotiatedChannel {
    pub offer: Offer,
    pub context: Box<dyn IsolatedContext>,
    pub port: ChannelPort,
}

/// Race one candidate per offer and return the first to complete the
/// handshake. Zero offers fail immediately.
pub async fn negotiate(
    host: Arc<dyn ContextHost>,
    offers: Vec<Offer>,
) -> Result<NegotiatedChannel, NoCandidateError> {
    let attempted = offers.len();
    let candidates: Vec<_> = offers
        .into_iter()
        .map(|offer| attempt(Arc::clone(&host), offer))
        .collect();

    // first_ok cancels every other candidate once a winner emerges, so a
    // loser still stuck in its handshake has its context dropped right away.
    match race::first_ok(candidates).await {
        Ok(winner) => {
            tracing::info!(
                identity = %winner.offer.identity,
                locator = %winner.offer.locator,
                "Channel established"
            );
            Ok(winner)
        }
        Err(failures) => {
            tracing::warn!(attempted, "Every candidate failed");
            Err(NoCandidateError {
                attempted,
                failures,
            })
        }
    }
}

async fn attempt(
    host: Arc<dyn ContextHost>,
    offer: Offer,
) -> Result<NegotiatedChannel, CandidateError> {
    let mut context = host
        .launch(&offer)
        .await
        .map_err(|e| CandidateError::Load {
            locator: offer.locator.clone(),
            reason: e.to_string(),
        })?;
    tracing::debug!(
        identity = %offer.identity,
        locator = %offer.locator,
        "Candidate loaded, starting handshake"
    );

    let (mut ours, theirs) = ChannelPort::pair();
    context.post_sync(theirs);

    // Error returns drop `context` here, releasing the candidate immediately
    // regardless of how the rest of the race goes.
    match ours.recv().await {
        Some(payload) => match serde_json::from_value::<ChannelReply>(payload) {
            Ok(ChannelReply::Ack { token }) if token == ACK_TOKEN => Ok(NegotiatedChannel {
                offer,
                context,
                port: ours,
            }),
            Ok(ChannelReply::Ack { token }) => Err(CandidateError::BadAck {
                locator: offer.locator.clone(),
                got: token,
            }),
            Ok(_) | Err(_) => Err(CandidateError::Protocol {
                locator: offer.locator.clone(),
            }),
        },
        None => Err(CandidateError::ChannelClosed {
            locator: offer.locator.clone(),
        }),
    }
}
