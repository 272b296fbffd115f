//! Binary message codec shared with the browser terminal client.
//!
//! Every application message is one ASCII command byte followed by the
//! payload, carried in a binary WebSocket frame. The tag values are fixed
//! by the deployed browser client and must not change. `JSON_DATA` is the
//! odd one out: its tag is `'{'`, so the *entire* message (tag included)
//! parses as a JSON object.

use bytes::Bytes;
use serde::Deserialize;

/// Fixed WebSocket endpoint path.
pub const WS_PATH: &str = "/ws";

/// Sub-protocol announced during the WebSocket handshake.
pub const WS_SUBPROTOCOL: &str = "tty";

/// Upper bound on a reassembled inbound message. The WebSocket layer
/// buffers fragments until a message is complete; without a cap a client
/// that never sends a final fragment grows that buffer forever.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

// Client -> server command bytes.
pub const INPUT: u8 = b'0';
pub const RESIZE_TERMINAL: u8 = b'1';
pub const JSON_DATA: u8 = b'{';

// Server -> client command bytes.
pub const OUTPUT: u8 = b'0';
pub const SET_WINDOW_TITLE: u8 = b'1';
pub const SET_PREFERENCES: u8 = b'2';
pub const SET_RECONNECT: u8 = b'3';

/// Terminal geometry as sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct WindowSize {
    pub columns: u16,
    pub rows: u16,
}

#[derive(Debug, Deserialize)]
struct AuthPayload {
    #[serde(rename = "AuthToken")]
    auth_token: Option<String>,
}

/// A decoded client message.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Raw bytes destined for the PTY.
    Input(Bytes),
    /// Terminal geometry change; the payload is still JSON-encoded.
    Resize(Bytes),
    /// JSON control message (carries the auth token); the slice includes
    /// the tag byte, which doubles as the JSON opening brace.
    JsonData(Bytes),
    /// A command byte this server does not understand.
    Unknown(u8),
}

impl ClientMessage {
    /// Split a complete message into command and payload. Returns `None`
    /// for an empty message.
    pub fn parse(data: Bytes) -> Option<ClientMessage> {
        let tag = *data.first()?;
        Some(match tag {
            INPUT => ClientMessage::Input(data.slice(1..)),
            RESIZE_TERMINAL => ClientMessage::Resize(data.slice(1..)),
            JSON_DATA => ClientMessage::JsonData(data),
            other => ClientMessage::Unknown(other),
        })
    }
}

/// Parse a `RESIZE_TERMINAL` payload: `{"columns":N,"rows":N}`.
pub fn parse_window_size(payload: &[u8]) -> Result<WindowSize, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Extract the `AuthToken` field from a `JSON_DATA` message, if present.
pub fn auth_token(json_data: &[u8]) -> Option<String> {
    serde_json::from_slice::<AuthPayload>(json_data)
        .ok()?
        .auth_token
}

/// A message headed for the client.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// Raw PTY output bytes.
    Output(Bytes),
    /// Window title announced during the handshake.
    WindowTitle(String),
    /// Preferences JSON blob, forwarded verbatim.
    Preferences(String),
    /// Reconnect interval hint, in seconds.
    Reconnect(u32),
}

impl ServerMessage {
    pub fn tag(&self) -> u8 {
        match self {
            ServerMessage::Output(_) => OUTPUT,
            ServerMessage::WindowTitle(_) => SET_WINDOW_TITLE,
            ServerMessage::Preferences(_) => SET_PREFERENCES,
            ServerMessage::Reconnect(_) => SET_RECONNECT,
        }
    }

    /// Encode as tag byte plus payload, ready to send as one binary
    /// WebSocket frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.tag()];
        match self {
            ServerMessage::Output(data) => buf.extend_from_slice(data),
            ServerMessage::WindowTitle(s) | ServerMessage::Preferences(s) => {
                buf.extend_from_slice(s.as_bytes())
            }
            ServerMessage::Reconnect(seconds) => {
                buf.extend_from_slice(seconds.to_string().as_bytes())
            }
        }
        buf
    }
}
