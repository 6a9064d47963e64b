//! rebind: channel-racing fetch client for DNS rebinding.
//!
//! A coordination server hands out candidate "offers" for a target host; one
//! isolated context is raced per offer, the first to complete a private
//! channel handshake wins, and every fetch for that host is multiplexed over
//! the winning channel under a fresh correlation id.

pub mod channel;
pub mod context;
pub mod protocol;
pub mod race;

mod client;
mod coordination;
mod negotiate;
mod resolver;

#[cfg(test)]
pub(crate) mod testutil;

pub use client::{BodyError, FetchError, FetchResponse, RebindClient, RebindConfig};
pub use context::{ContextHost, IsolatedContext, LaunchError};
pub use coordination::{COORDINATION_PATH, CoordinationClient, CoordinationError};
pub use negotiate::{CandidateError, NegotiatedChannel, NoCandidateError};
pub use protocol::{FetchInit, Offer, RequestId};
pub use resolver::{HostChannel, HostError, HostResolver};
