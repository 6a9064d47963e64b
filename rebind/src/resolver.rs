//! Per-host channel resolution.
//!
//! The first caller for a host runs the whole pipeline (ask the coordination
//! server for offers, race the candidates, install the demultiplexer) behind
//! a per-host once-cell. Every concurrent and later caller shares the same
//! eventual channel, or the same eventual failure: a failed host stays failed
//! for the resolver's lifetime, with no retry.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::channel::{ChannelClosed, PortSender};
use crate::client::PendingFetches;
use crate::context::{ContextHost, IsolatedContext};
use crate::coordination::{CoordinationClient, CoordinationError};
use crate::negotiate::{self, NegotiatedChannel, NoCandidateError};
use crate::protocol::ChannelRequest;

#[derive(Debug, Clone, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    NoCandidate(#[from] NoCandidateError),

    /// Only produced when a negotiation timeout was configured.
    #[error("negotiation for {host} timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },
}

/// The winning channel for one host: a cloneable handle over the send half,
/// keeping the winning context alive for as long as any handle exists.
#[derive(Clone)]
pub struct HostChannel {
    inner: Arc<HostChannelInner>,
}

struct HostChannelInner {
    tx: PortSender,
    _context: Box<dyn IsolatedContext>,
}

impl HostChannel {
    pub fn send(&self, request: &ChannelRequest) -> Result<(), ChannelClosed> {
        match serde_json::to_value(request) {
            Ok(payload) => self.inner.tx.post(payload),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode channel request");
                Err(ChannelClosed)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

pub struct HostResolver {
    coordination: CoordinationClient,
    context_host: Arc<dyn ContextHost>,
    pending: Arc<PendingFetches>,
    channels: DashMap<String, Arc<OnceCell<Result<HostChannel, HostError>>>>,
    negotiation_timeout: Option<Duration>,
}

impl HostResolver {
    pub fn new(
        coordination: CoordinationClient,
        context_host: Arc<dyn ContextHost>,
        pending: Arc<PendingFetches>,
        negotiation_timeout: Option<Duration>,
    ) -> Self {
        Self {
            coordination,
            context_host,
            pending,
            channels: DashMap::new(),
            negotiation_timeout,
        }
    }

    /// The negotiated channel for `host`, negotiating it on first use.
    pub async fn channel(&self, host: &str) -> Result<HostChannel, HostError> {
        let cell = Arc::clone(
            self.channels
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        );
        cell.get_or_init(|| self.resolve(host)).await.clone()
    }

    async fn resolve(&self, host: &str) -> Result<HostChannel, HostError> {
        let negotiation = async {
            let offers = self.coordination.resolve_hosts(host).await?;
            tracing::info!(host, offers = offers.len(), "Negotiating channel");
            let negotiated =
                negotiate::negotiate(Arc::clone(&self.context_host), offers).await?;
            Ok::<_, HostError>(negotiated)
        };

        let negotiated = match self.negotiation_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, negotiation).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(HostError::Timeout {
                        host: host.to_string(),
                        timeout,
                    });
                }
            },
            None => negotiation.await?,
        };

        Ok(self.install(negotiated))
    }

    /// Wire the winning channel up: one demultiplexing task per channel routes
    /// batched outcomes into the pending-fetch table.
    fn install(&self, negotiated: NegotiatedChannel) -> HostChannel {
        let NegotiatedChannel {
            offer,
            context,
            port,
        } = negotiated;
        let (tx, mut rx) = port.split();

        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                pending.dispatch(payload);
            }
            tracing::debug!(identity = %offer.identity, "Channel demultiplexer exiting");
        });

        HostChannel {
            inner: Arc::new(HostChannelInner {
                tx,
                _context: context,
            }),
        }
    }
}
