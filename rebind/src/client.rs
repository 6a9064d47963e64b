//! Fetch front end: request normalization plus channel multiplexing.
//!
//! `RebindClient` is the public surface. Each fetch parses its absolute URL,
//! obtains the host's negotiated channel (triggering negotiation on first
//! use), registers a pending entry under a fresh correlation id, and sends
//! one request envelope. The per-channel demultiplexer settles the entry when
//! a correlated outcome arrives.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use url::Url;

use crate::context::ContextHost;
use crate::coordination::CoordinationClient;
use crate::protocol::{
    Blob, ChannelReply, ChannelRequest, FetchInit, FetchOutcome, RequestEnvelope, RequestId,
};
use crate::resolver::{HostError, HostResolver};

/// Client configuration.
///
/// The base host names the deployment serving the coordination endpoint.
/// The client context is opaque client-identifying metadata forwarded with
/// every host resolution; it defaults to crate and platform fields.
/// Both timeouts are off by default: an unanswered negotiation or request
/// pends indefinitely unless one is configured.
#[derive(Debug, Clone)]
pub struct RebindConfig {
    base_host: String,
    client_context: serde_json::Value,
    negotiation_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

impl RebindConfig {
    pub fn new(base_host: impl Into<String>) -> Self {
        Self {
            base_host: base_host.into(),
            client_context: default_client_context(),
            negotiation_timeout: None,
            request_timeout: None,
        }
    }

    pub fn with_client_context(mut self, client_context: serde_json::Value) -> Self {
        self.client_context = client_context;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = Some(timeout);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

fn default_client_context() -> serde_json::Value {
    serde_json::json!({
        "agent": concat!("rebind/", env!("CARGO_PKG_VERSION")),
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("invalid request url: {0}")]
    Url(String),

    #[error(transparent)]
    Host(#[from] HostError),

    /// The isolated context reported the upstream request as failed.
    #[error("request rejected by the remote context: {reason}")]
    Rejected { reason: String },

    #[error("channel closed before the request could be sent")]
    ChannelClosed,

    /// Only produced when a request timeout was configured.
    #[error("no reply within {timeout:?}")]
    Timeout { timeout: Duration },
}

/// Response to one multiplexed fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    blob: Blob,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BodyError {
    #[error("response body is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("response body is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl FetchResponse {
    fn new(blob: Blob) -> Self {
        Self { blob }
    }

    pub fn content_type(&self) -> &str {
        &self.blob.content_type
    }

    pub fn bytes(&self) -> Result<Vec<u8>, BodyError> {
        Ok(self.blob.bytes()?)
    }

    pub fn text(&self) -> Result<String, BodyError> {
        Ok(String::from_utf8(self.bytes()?)?)
    }
}

/// In-flight fetches, keyed by correlation id. Entries are settled exactly
/// once by the demultiplexer; outcomes for unknown ids are logged and
/// dropped.
pub(crate) struct PendingFetches {
    entries: DashMap<RequestId, oneshot::Sender<Result<FetchResponse, String>>>,
}

impl PendingFetches {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
        })
    }

    fn register(&self, id: RequestId) -> oneshot::Receiver<Result<FetchResponse, String>> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, tx);
        rx
    }

    fn discard(&self, id: RequestId) {
        self.entries.remove(&id);
    }

    /// Route one inbound channel payload. Batched outcomes settle any number
    /// of pending entries in one message.
    pub(crate) fn dispatch(&self, payload: serde_json::Value) {
        let reply: ChannelReply = match serde_json::from_value(payload) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring undecodable channel message");
                return;
            }
        };
        match reply {
            ChannelReply::Ack { .. } => {
                tracing::warn!("Ignoring acknowledgment outside a handshake");
            }
            ChannelReply::Responses { responses } => {
                for (id, outcome) in responses {
                    match self.entries.remove(&id) {
                        Some((_, reply_tx)) => {
                            let result = match outcome {
                                FetchOutcome::Resolve { resolve } => {
                                    Ok(FetchResponse::new(resolve.blob))
                                }
                                FetchOutcome::Reject { error } => Err(error),
                            };
                            let _ = reply_tx.send(result);
                        }
                        None => {
                            tracing::warn!(%id, "Ignoring response with no pending request");
                        }
                    }
                }
            }
        }
    }
}

/// Fetch-like client that tunnels requests through negotiated channels.
pub struct RebindClient {
    resolver: HostResolver,
    pending: Arc<PendingFetches>,
    request_timeout: Option<Duration>,
}

impl RebindClient {
    pub fn new(config: RebindConfig, context_host: Arc<dyn ContextHost>) -> Self {
        let pending = PendingFetches::new();
        let coordination =
            CoordinationClient::new(&config.base_host, config.client_context.clone());
        let resolver = HostResolver::new(
            coordination,
            context_host,
            Arc::clone(&pending),
            config.negotiation_timeout,
        );
        Self {
            resolver,
            pending,
            request_timeout: config.request_timeout,
        }
    }

    /// Fetch `input` through the channel negotiated for its host.
    ///
    /// The first fetch against a host triggers negotiation; concurrent
    /// fetches against the same host share it. Headers are never forwarded;
    /// the channel has no header support.
    pub async fn fetch(&self, input: &str, init: FetchInit) -> Result<FetchResponse, FetchError> {
        let url = Url::parse(input).map_err(|e| FetchError::Url(e.to_string()))?;
        let host = authority(&url)?;
        let init = init.normalize();

        let channel = self.resolver.channel(&host).await?;

        let id = RequestId::new();
        let reply_rx = self.pending.register(id);
        let envelope = ChannelRequest::Fetch(RequestEnvelope {
            id,
            input: url.to_string(),
            init,
        });

        tracing::debug!(%id, url = %url, "Dispatching request");
        if channel.send(&envelope).is_err() {
            self.pending.discard(id);
            return Err(FetchError::ChannelClosed);
        }

        let reply = match self.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, reply_rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.pending.discard(id);
                    return Err(FetchError::Timeout { timeout });
                }
            },
            None => reply_rx.await,
        };

        match reply {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(reason)) => Err(FetchError::Rejected { reason }),
            Err(_) => Err(FetchError::ChannelClosed),
        }
    }
}

/// The `host[:port]` key a URL resolves under. Scheme-default ports are
/// dropped during parsing, so they never appear in the key.
fn authority(url: &Url) -> Result<String, FetchError> {
    let host = url
        .host_str()
        .ok_or_else(|| FetchError::Url(format!("request url {url} has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
