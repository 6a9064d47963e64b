//! Wire protocol types.
//!
//! Two surfaces:
//! - **Coordination socket**: host-resolution request/reply, correlated by id
//! - **Private channel**: sync/ack handshake, then multiplexed fetch traffic

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// Acknowledgment token a candidate context must return during the handshake.
pub const ACK_TOKEN: &str = "ACK";

/// Correlation identifier linking an outbound request to its eventual reply.
///
/// UUID v4 keeps ids unguessable and prevents accidental reuse across the
/// pending tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One candidate target supplied by the coordination server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    /// Opaque frame-identity string.
    pub identity: String,
    /// URL the isolated context is instantiated at.
    pub locator: String,
}

/// Messages sent to the coordination endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum CoordinationRequest {
    /// Ask for rebind offers for a host. `client_context` is opaque
    /// client-identifying metadata the server may use to tailor offers.
    Host {
        request_id: RequestId,
        client_context: serde_json::Value,
        host: String,
    },
}

/// Reply from the coordination endpoint, correlated by request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinationReply {
    pub request_id: RequestId,
    #[serde(default)]
    pub offers: Vec<Offer>,
}

/// Messages sent to an isolated context over the private channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelRequest {
    Fetch(RequestEnvelope),
}

/// Messages an isolated context sends back over the private channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelReply {
    /// Handshake acknowledgment. The token must be [`ACK_TOKEN`]; anything
    /// else fails the candidate.
    Ack { token: String },

    /// Batched fetch outcomes, keyed by correlation id. One message may
    /// settle any number of in-flight requests.
    Responses {
        responses: HashMap<RequestId, FetchOutcome>,
    },
}

/// One multiplexed request: the absolute URL plus its normalized init record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: RequestId,
    pub input: String,
    pub init: FetchInit,
}

/// Normalized request fields forwarded to the isolated context.
///
/// Headers are deliberately absent: the channel does not forward them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchInit {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub mode: RequestMode,
    pub credentials: CredentialsMode,
    pub cache: CacheMode,
    pub redirect: RedirectMode,
    pub referrer: String,
    pub integrity: String,
}

impl Default for FetchInit {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            body: None,
            mode: RequestMode::Cors,
            credentials: CredentialsMode::SameOrigin,
            cache: CacheMode::Default,
            redirect: RedirectMode::Follow,
            referrer: "about:client".to_string(),
            integrity: String::new(),
        }
    }
}

impl FetchInit {
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Canonical form: request methods are case-insensitive on the wire but
    /// forwarded uppercased.
    pub fn normalize(mut self) -> Self {
        self.method = self.method.to_uppercase();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    Cors,
    NoCors,
    SameOrigin,
    Navigate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialsMode {
    Omit,
    SameOrigin,
    Include,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    Default,
    NoStore,
    Reload,
    NoCache,
    ForceCache,
    OnlyIfCached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedirectMode {
    Follow,
    Error,
    Manual,
}

/// Outcome of one multiplexed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FetchOutcome {
    Resolve { resolve: ResolvedResponse },
    Reject { error: String },
}

/// Successful response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedResponse {
    pub blob: Blob,
}

/// Response body shipped through the JSON channel: content type plus a
/// base64-encoded body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub content_type: String,
    pub body: String,
}

impl Blob {
    pub fn from_bytes(content_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            content_type: content_type.into(),
            body: BASE64.encode(bytes),
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.body)
    }
}
