//! Coordination-endpoint client.
//!
//! One lazily-opened websocket per client, reused for every host resolution.
//! Outbound host requests carry a fresh correlation id; a reader task routes
//! replies back to the matching pending resolution. An open failure is cached
//! for the client's lifetime: every pending and future resolution fails with
//! the same connection error, with no retry.

use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{OnceCell, mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{CoordinationReply, CoordinationRequest, Offer, RequestId};

/// Well-known path of the coordination endpoint, relative to the base host.
pub const COORDINATION_PATH: &str = "/v1.websocket";

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinationError {
    /// The endpoint could not be reached. Fatal for the client's lifetime.
    #[error("coordination endpoint unreachable: {0}")]
    Connect(String),

    /// The connection went away before (or while) a resolution was pending.
    #[error("coordination connection closed: {0}")]
    Closed(String),

    /// A message could not be encoded for the wire.
    #[error("coordination protocol error: {0}")]
    Protocol(String),
}

type PendingResolutions = DashMap<RequestId, oneshot::Sender<Vec<Offer>>>;

/// Client for the coordination endpoint at `ws://<base-host>/v1.websocket`.
pub struct CoordinationClient {
    endpoint: String,
    client_context: serde_json::Value,
    connection: OnceCell<Result<Connection, CoordinationError>>,
    pending: Arc<PendingResolutions>,
}

impl CoordinationClient {
    pub fn new(base_host: &str, client_context: serde_json::Value) -> Self {
        Self {
            endpoint: format!("ws://{base_host}{COORDINATION_PATH}"),
            client_context,
            connection: OnceCell::new(),
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Ask the coordination server for rebind offers for `host`.
    ///
    /// The first call opens the connection; concurrent and later calls share
    /// it. Replies are correlated by request id, so calls may resolve in any
    /// order relative to each other.
    pub async fn resolve_hosts(&self, host: &str) -> Result<Vec<Offer>, CoordinationError> {
        let connection = self
            .connection
            .get_or_init(|| Connection::open(self.endpoint.clone(), Arc::clone(&self.pending)))
            .await;
        let connection = match connection {
            Ok(connection) => connection.clone(),
            Err(e) => return Err(e.clone()),
        };

        let request_id = RequestId::new();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(request_id, reply_tx);

        let request = CoordinationRequest::Host {
            request_id,
            client_context: self.client_context.clone(),
            host: host.to_string(),
        };
        let text = match serde_json::to_string(&request) {
            Ok(text) => text,
            Err(e) => {
                self.pending.remove(&request_id);
                return Err(CoordinationError::Protocol(format!(
                    "failed to encode host request: {e}"
                )));
            }
        };

        tracing::debug!(%request_id, host, "Requesting offers");
        if connection.send(text).is_err() {
            self.pending.remove(&request_id);
            return Err(CoordinationError::Closed(
                "connection lost before the request was sent".to_string(),
            ));
        }

        match reply_rx.await {
            Ok(offers) => {
                tracing::debug!(%request_id, host, offers = offers.len(), "Offers received");
                Ok(offers)
            }
            Err(_) => Err(CoordinationError::Closed(
                "connection closed before a reply arrived".to_string(),
            )),
        }
    }
}

/// Write half of the live connection. The read half lives in a reader task.
#[derive(Clone)]
struct Connection {
    tx: mpsc::UnboundedSender<String>,
}

impl Connection {
    async fn open(
        endpoint: String,
        pending: Arc<PendingResolutions>,
    ) -> Result<Connection, CoordinationError> {
        tracing::debug!(endpoint = %endpoint, "Opening coordination connection");
        let (ws, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| CoordinationError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let writer_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::warn!(error = %e, "Coordination write failed");
                    break;
                }
            }
            // Dropping the senders fails every waiter still registered.
            writer_pending.clear();
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => dispatch_reply(&pending, &text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Coordination read failed");
                        break;
                    }
                }
            }
            tracing::debug!("Coordination connection closed");
            pending.clear();
        });

        Ok(Connection { tx })
    }

    fn send(&self, text: String) -> Result<(), ()> {
        self.tx.send(text).map_err(|_| ())
    }
}

fn dispatch_reply(pending: &PendingResolutions, text: &str) {
    let reply: CoordinationReply = match serde_json::from_str(text) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring undecodable coordination message");
            return;
        }
    };
    match pending.remove(&reply.request_id) {
        Some((_, reply_tx)) => {
            let _ = reply_tx.send(reply.offers);
        }
        None => {
            tracing::warn!(
                request_id = %reply.request_id,
                "Ignoring coordination reply with no pending resolution"
            );
        }
    }
}
