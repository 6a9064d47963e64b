//! Shared test doubles: scripted isolated contexts and an in-process
//! coordination server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;

use crate::channel::ChannelPort;
use crate::context::{ContextHost, IsolatedContext, LaunchError};
use crate::protocol::{
    ACK_TOKEN, Blob, ChannelReply, ChannelRequest, CoordinationReply, CoordinationRequest,
    FetchOutcome, Offer, RequestEnvelope, RequestId, ResolvedResponse,
};

pub fn offer(identity: &str) -> Offer {
    Offer {
        identity: identity.to_string(),
        locator: format!("http://{identity}.rebind.example/frame"),
    }
}

/// What a scripted context does once it receives the sync port.
#[derive(Clone)]
pub enum Script {
    /// Acknowledge, then answer fetch envelopes one by one.
    Serve,
    /// Wait for the gate, then behave like `Serve`.
    ServeAfter(Arc<Notify>),
    /// Post a response for an unknown id first, then behave like `Serve`.
    ServeNoisy,
    /// Collect this many envelopes, then answer them all in one batch.
    ServeBatch(usize),
    /// Acknowledge the handshake but never answer any fetch.
    AckOnly,
    /// Acknowledge with the wrong token.
    Nak,
    /// Answer the handshake with a non-acknowledgment record.
    Garbage,
    /// Drop the port without answering.
    Hangup,
    /// Never answer the handshake at all.
    Stall,
    /// Refuse to load.
    FailLoad,
}

/// A [`ContextHost`] whose contexts follow per-identity scripts.
pub struct ScriptedHost {
    default: Script,
    overrides: HashMap<String, Script>,
    launches: AtomicUsize,
    teardowns: Arc<StdMutex<HashMap<String, usize>>>,
}

impl ScriptedHost {
    pub fn serving() -> Arc<Self> {
        Self::scripted(Script::Serve, [])
    }

    pub fn scripted(
        default: Script,
        overrides: impl IntoIterator<Item = (&'static str, Script)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            default,
            overrides: overrides
                .into_iter()
                .map(|(identity, script)| (identity.to_string(), script))
                .collect(),
            launches: AtomicUsize::new(0),
            teardowns: Arc::new(StdMutex::new(HashMap::new())),
        })
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn teardowns_of(&self, identity: &str) -> usize {
        self.teardowns
            .lock()
            .unwrap()
            .get(identity)
            .copied()
            .unwrap_or(0)
    }

    /// Poll until `identity` has been torn down at least `n` times.
    pub async fn wait_for_teardown(&self, identity: &str, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.teardowns_of(identity) < n {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {identity} to be torn down"));
    }
}

#[async_trait]
impl ContextHost for ScriptedHost {
    async fn launch(&self, offer: &Offer) -> Result<Box<dyn IsolatedContext>, LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let script = self
            .overrides
            .get(&offer.identity)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        if matches!(script, Script::FailLoad) {
            return Err(LaunchError::Load(format!(
                "{} refused to load",
                offer.locator
            )));
        }
        Ok(Box::new(ScriptedContext {
            identity: offer.identity.clone(),
            script: Some(script),
            task: None,
            teardowns: Arc::clone(&self.teardowns),
        }))
    }
}

struct ScriptedContext {
    identity: String,
    script: Option<Script>,
    task: Option<tokio::task::JoinHandle<()>>,
    teardowns: Arc<StdMutex<HashMap<String, usize>>>,
}

impl IsolatedContext for ScriptedContext {
    fn post_sync(&mut self, port: ChannelPort) {
        if let Some(script) = self.script.take() {
            self.task = Some(tokio::spawn(run_script(script, port)));
        }
    }
}

impl Drop for ScriptedContext {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        *self
            .teardowns
            .lock()
            .unwrap()
            .entry(self.identity.clone())
            .or_insert(0) += 1;
    }
}

fn ack() -> serde_json::Value {
    serde_json::to_value(ChannelReply::Ack {
        token: ACK_TOKEN.to_string(),
    })
    .unwrap()
}

async fn run_script(script: Script, mut port: ChannelPort) {
    match script {
        Script::Serve => {
            let _ = port.post(ack());
            serve(&mut port, 1).await;
        }
        Script::ServeAfter(gate) => {
            gate.notified().await;
            let _ = port.post(ack());
            serve(&mut port, 1).await;
        }
        Script::ServeNoisy => {
            let _ = port.post(ack());
            let bogus = ChannelReply::Responses {
                responses: HashMap::from([(
                    RequestId::new(),
                    FetchOutcome::Reject {
                        error: "nobody asked".to_string(),
                    },
                )]),
            };
            let _ = port.post(serde_json::to_value(bogus).unwrap());
            serve(&mut port, 1).await;
        }
        Script::ServeBatch(n) => {
            let _ = port.post(ack());
            serve(&mut port, n).await;
        }
        Script::AckOnly => {
            let _ = port.post(ack());
            std::future::pending::<()>().await;
        }
        Script::Nak => {
            let _ = port.post(
                serde_json::to_value(ChannelReply::Ack {
                    token: "NAK".to_string(),
                })
                .unwrap(),
            );
            std::future::pending::<()>().await;
        }
        Script::Garbage => {
            let _ = port.post(json!({"type": "cached"}));
            std::future::pending::<()>().await;
        }
        Script::Hangup => {}
        Script::Stall => {
            std::future::pending::<()>().await;
        }
        Script::FailLoad => unreachable!("FailLoad never reaches the handshake"),
    }
}

/// Answer fetch envelopes, `batch` at a time per reply message.
async fn serve(port: &mut ChannelPort, batch: usize) {
    let mut queued: Vec<RequestEnvelope> = Vec::new();
    while let Some(payload) = port.recv().await {
        let Ok(ChannelRequest::Fetch(envelope)) = serde_json::from_value(payload) else {
            continue;
        };
        queued.push(envelope);
        if queued.len() < batch {
            continue;
        }
        let responses = queued
            .drain(..)
            .map(|envelope| {
                let outcome = respond_to(&envelope);
                (envelope.id, outcome)
            })
            .collect();
        let _ = port.post(serde_json::to_value(ChannelReply::Responses { responses }).unwrap());
    }
}

fn respond_to(envelope: &RequestEnvelope) -> FetchOutcome {
    if envelope.input.ends_with("/fail") {
        FetchOutcome::Reject {
            error: "upstream refused".to_string(),
        }
    } else {
        let body = format!("{} {}", envelope.init.method, envelope.input);
        FetchOutcome::Resolve {
            resolve: ResolvedResponse {
                blob: Blob::from_bytes("text/plain", body.as_bytes()),
            },
        }
    }
}

/// Handle to an in-process coordination server with a fixed offer table.
pub struct CoordinationServer {
    pub base_host: String,
    connections: Arc<AtomicUsize>,
    host_requests: Arc<AtomicUsize>,
}

impl CoordinationServer {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn host_requests(&self) -> usize {
        self.host_requests.load(Ordering::SeqCst)
    }
}

/// Serve `routes` (host → offers) over a real websocket on a loopback port.
pub async fn spawn_coordination_server(routes: HashMap<String, Vec<Offer>>) -> CoordinationServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_host = listener.local_addr().unwrap().to_string();
    let connections = Arc::new(AtomicUsize::new(0));
    let host_requests = Arc::new(AtomicUsize::new(0));

    let accepted = Arc::clone(&connections);
    let served = Arc::clone(&host_requests);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            accepted.fetch_add(1, Ordering::SeqCst);
            let routes = routes.clone();
            let served = Arc::clone(&served);
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let Ok(CoordinationRequest::Host {
                        request_id, host, ..
                    }) = serde_json::from_str(&text)
                    else {
                        continue;
                    };
                    served.fetch_add(1, Ordering::SeqCst);
                    let reply = CoordinationReply {
                        request_id,
                        offers: routes.get(&host).cloned().unwrap_or_default(),
                    };
                    if ws
                        .send(Message::Text(serde_json::to_string(&reply).unwrap()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
    });

    CoordinationServer {
        base_host,
        connections,
        host_requests,
    }
}
