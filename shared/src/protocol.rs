//! Wire protocol for gTunnel communication.
//!
//! Every WebSocket frame carries exactly one [`Envelope`]: an integer type tag,
//! an optional correlation id and the JSON payload for that tag. The payload is
//! kept as raw JSON until a consumer asks for the typed [`Message`], so frames
//! with tags this side does not know still decode at the envelope level.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::time::Duration;

/// Path segment reserved for the relay's own endpoints.
pub const CONTROL_SEGMENT: &str = "___gTl___";

/// WebSocket upgrade endpoint for agents.
pub const WS_PATH: &str = "/___gTl___/ws";

/// Liveness endpoint.
pub const HEALTH_PATH: &str = "/___gTl___/health";

/// Largest frame either side sends or accepts on the tunnel (16 MB).
/// A 10 MB body is about 13.4 MB once base64 encoded.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// How long the relay waits for the `AuthRequest`, and the agent for the `AuthResponse`.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the relay waits for an agent to answer a bridged request.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between agent pings.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// External request forwarded to the agent
    HttpRequest = 1,
    /// Agent's answer to an `HttpRequest`
    HttpResponse = 2,
    /// First frame an agent sends
    AuthRequest = 3,
    /// Relay's verdict on the `AuthRequest`
    AuthResponse = 4,
    /// Reserved
    ConfigRequest = 5,
    /// Reserved
    ConfigResponse = 6,
    /// Reserved
    Error = 7,
}

impl MessageType {
    pub fn tag(self) -> i64 {
        self as i64
    }

    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            1 => Some(Self::HttpRequest),
            2 => Some(Self::HttpResponse),
            3 => Some(Self::AuthRequest),
            4 => Some(Self::AuthResponse),
            5 => Some(Self::ConfigRequest),
            6 => Some(Self::ConfigResponse),
            7 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Credential and routing prefix presented by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub access_token: String,
    /// Empty means "let the relay pick one".
    #[serde(default)]
    pub requested_prefix: String,
}

/// Outcome of the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Routable prefix assigned to the tunnel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

impl AuthResponse {
    pub fn accepted(connection_id: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            success: true,
            message: Some("Authentication successful".to_string()),
            prefix: Some(prefix.into()),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            connection_id: None,
            success: false,
            message: Some(message.into()),
            prefix: None,
        }
    }
}

/// HTTP request forwarded through the tunnel.
///
/// Headers keep one value per name. Bodies travel as base64 strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    /// Path below the routing prefix, including any query string
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

/// HTTP response from the local service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Plain-text response, used when the agent cannot reach its local service.
    pub fn text(status_code: u16, body: impl Into<String>) -> Self {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "text/plain; charset=utf-8".to_string());
        Self {
            status_code,
            headers,
            body: body.into().into_bytes(),
        }
    }
}

/// Typed view of an envelope's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    AuthRequest(AuthRequest),
    AuthResponse(AuthResponse),
    HttpRequest(HttpRequest),
    HttpResponse(HttpResponse),
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::AuthRequest(_) => MessageType::AuthRequest,
            Message::AuthResponse(_) => MessageType::AuthResponse,
            Message::HttpRequest(_) => MessageType::HttpRequest,
            Message::HttpResponse(_) => MessageType::HttpResponse,
        }
    }
}

impl From<AuthRequest> for Message {
    fn from(msg: AuthRequest) -> Self {
        Message::AuthRequest(msg)
    }
}

impl From<AuthResponse> for Message {
    fn from(msg: AuthResponse) -> Self {
        Message::AuthResponse(msg)
    }
}

impl From<HttpRequest> for Message {
    fn from(msg: HttpRequest) -> Self {
        Message::HttpRequest(msg)
    }
}

impl From<HttpResponse> for Message {
    fn from(msg: HttpResponse) -> Self {
        Message::HttpResponse(msg)
    }
}

/// The unit of wire transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub tag: i64,
    /// Correlation id; a reply carries the id of the request it answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub payload: Box<RawValue>,
}

impl Envelope {
    pub fn new(message: &Message, id: Option<String>) -> Result<Self> {
        let payload = match message {
            Message::AuthRequest(p) => serde_json::value::to_raw_value(p)?,
            Message::AuthResponse(p) => serde_json::value::to_raw_value(p)?,
            Message::HttpRequest(p) => serde_json::value::to_raw_value(p)?,
            Message::HttpResponse(p) => serde_json::value::to_raw_value(p)?,
        };
        Ok(Self {
            tag: message.kind().tag(),
            id,
            payload,
        })
    }

    /// `None` for tags outside the known set.
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_tag(self.tag)
    }

    /// Fails with [`Error::FrameTooLarge`] when the result would not fit in
    /// one tunnel frame.
    pub fn encode(&self) -> Result<String> {
        let text = serde_json::to_string(self)?;
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(Error::FrameTooLarge(text.len()));
        }
        Ok(text)
    }

    pub fn decode(data: impl AsRef<[u8]>) -> Result<Self> {
        Ok(serde_json::from_slice(data.as_ref())?)
    }

    /// Decodes the payload as an arbitrary type, ignoring the tag.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(self.payload.get())?)
    }

    pub fn message(&self) -> Result<Message> {
        match self.kind() {
            Some(MessageType::AuthRequest) => Ok(Message::AuthRequest(self.payload()?)),
            Some(MessageType::AuthResponse) => Ok(Message::AuthResponse(self.payload()?)),
            Some(MessageType::HttpRequest) => Ok(Message::HttpRequest(self.payload()?)),
            Some(MessageType::HttpResponse) => Ok(Message::HttpResponse(self.payload()?)),
            Some(MessageType::ConfigRequest)
            | Some(MessageType::ConfigResponse)
            | Some(MessageType::Error)
            | None => Err(Error::UnsupportedMessageType(self.tag)),
        }
    }
}

/// Encodes a message as one frame's worth of text.
pub fn encode(message: &Message, id: Option<String>) -> Result<String> {
    Envelope::new(message, id)?.encode()
}

/// Bodies as standard base64. `null` and a missing field both read as empty.
mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => STANDARD.decode(text).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
