// Engine.IO v4 / socket.io v5 text packet codec
//
// Engine.IO type digit first (0 open, 1 close, 2 ping, 3 pong, 4 message,
// 6 noop); a message carries a socket.io packet with its own type digit
// (0 connect, 1 disconnect, 2 event, 4 connect error). Events look like
// `42["name",{...}]`. Only the default namespace is used.

use serde::{Deserialize, Serialize};

use crate::downloader::errors::DownloadError;

/// Namespace connect request sent after the Engine.IO handshake
pub const CONNECT: &str = "40";

/// Namespace disconnect sent before closing the socket
pub const DISCONNECT: &str = "41";

/// Session parameters from the Engine.IO `open` packet
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    /// Milliseconds between server pings
    #[serde(default)]
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong
    #[serde(default)]
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Noop,
    /// Namespace connected
    Connect,
    /// Namespace disconnected by the server
    Disconnect,
    ConnectError(String),
    Event {
        name: String,
        data: serde_json::Value,
    },
    /// Acks and binary packets; never sent by the backend
    Unsupported(char),
}

fn malformed(text: &str, reason: &str) -> DownloadError {
    let preview: String = text.chars().take(64).collect();
    DownloadError::Transport(format!("malformed packet {:?}: {}", preview, reason))
}

pub fn decode(text: &str) -> Result<Packet, DownloadError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or_else(|| malformed(text, "empty frame"))?;
    let body = chars.as_str();

    match kind {
        '0' => serde_json::from_str(body)
            .map(Packet::Open)
            .map_err(|e| malformed(text, &e.to_string())),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping(body.to_string())),
        '3' => Ok(Packet::Pong(body.to_string())),
        '4' => decode_message(text, body),
        '6' => Ok(Packet::Noop),
        _ => Err(malformed(text, "unknown engine.io packet type")),
    }
}

fn decode_message(text: &str, message: &str) -> Result<Packet, DownloadError> {
    let mut chars = message.chars();
    let kind = chars
        .next()
        .ok_or_else(|| malformed(text, "empty socket.io packet"))?;
    let body = strip_namespace(chars.as_str());

    match kind {
        '0' => Ok(Packet::Connect),
        '1' => Ok(Packet::Disconnect),
        '2' => decode_event(text, body),
        '4' => Ok(Packet::ConnectError(connect_error_message(body))),
        '3' | '5' | '6' => Ok(Packet::Unsupported(kind)),
        _ => Err(malformed(text, "unknown socket.io packet type")),
    }
}

/// `/admin,` prefix of a non-default namespace
fn strip_namespace(body: &str) -> &str {
    if !body.starts_with('/') {
        return body;
    }
    match body.find(',') {
        Some(i) => &body[i + 1..],
        None => "",
    }
}

fn decode_event(text: &str, body: &str) -> Result<Packet, DownloadError> {
    // Optional ack id before the payload
    let payload = body.trim_start_matches(|c: char| c.is_ascii_digit());
    let mut items: Vec<serde_json::Value> =
        serde_json::from_str(payload).map_err(|e| malformed(text, &e.to_string()))?;
    if items.is_empty() {
        return Err(malformed(text, "event without a name"));
    }

    let name = match items.remove(0) {
        serde_json::Value::String(name) => name,
        _ => return Err(malformed(text, "event name is not a string")),
    };
    let data = if items.is_empty() {
        serde_json::Value::Null
    } else {
        items.swap_remove(0)
    };
    Ok(Packet::Event { name, data })
}

fn connect_error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(error) => error.message,
        Err(_) => body.trim_matches('"').to_string(),
    }
}

/// `42["name",data]`
pub fn encode_event<T: Serialize>(name: &str, data: &T) -> Result<String, DownloadError> {
    let payload = serde_json::to_string(&(name, data))
        .map_err(|e| DownloadError::Transport(format!("cannot encode {}: {}", name, e)))?;
    Ok(format!("42{}", payload))
}

pub fn pong(payload: &str) -> String {
    format!("3{}", payload)
}
