//! Terminal transport events
//!
//! Every message is a JSON object `{"event": "<name>", "data": <payload>}`.

use serde::{Deserialize, Serialize};

use crate::credentials::QuickCredentials;
use crate::remote::PtySize;
use crate::ServerId;

/// Events sent by the browser
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Bearer token issued by the login API
    Authenticate(String),
    ConnectSsh(ServerId),
    QuickConnect(QuickCredentials),
    /// Raw keystrokes
    SshInput(String),
    Resize(ResizeRequest),
    /// A command line; a newline is appended
    SendCommand(String),
    DisconnectSsh,
    Ping,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Authenticate(_) => "authenticate",
            ClientEvent::ConnectSsh(_) => "connect-ssh",
            ClientEvent::QuickConnect(_) => "quick-connect",
            ClientEvent::SshInput(_) => "ssh-input",
            ClientEvent::Resize(_) => "resize",
            ClientEvent::SendCommand(_) => "send-command",
            ClientEvent::DisconnectSsh => "disconnect-ssh",
            ClientEvent::Ping => "ping",
        }
    }
}

/// Terminal geometry from xterm.js
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ResizeRequest {
    pub rows: u32,
    pub cols: u32,
    /// Pixels
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub width: u32,
}

impl From<ResizeRequest> for PtySize {
    fn from(r: ResizeRequest) -> Self {
        PtySize {
            cols: r.cols,
            rows: r.rows,
            pixel_width: r.width,
            pixel_height: r.height,
        }
    }
}

/// Events sent to the browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Authenticated(AuthResult),
    SshConnected,
    SshData(String),
    SshError(ErrorPayload),
    SshClosed,
    Pong,
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::SshError(ErrorPayload {
            error: message.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub error: String,
}

/// Incremental UTF-8 decoder for shell output
///
/// A multi-byte character split across two reads is held back until the
/// rest arrives. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        // Truncated sequence at the end: wait for more bytes
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let leftover = rest.to_vec();
        self.pending = leftover;
        out
    }

    /// Flush whatever is held back (end of stream)
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> ClientEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_client_events_parse() {
        assert!(matches!(
            parse(json!({"event": "authenticate", "data": "tok"})),
            ClientEvent::Authenticate(t) if t == "tok"
        ));
        assert!(matches!(
            parse(json!({"event": "connect-ssh", "data": 12})),
            ClientEvent::ConnectSsh(12)
        ));
        assert!(matches!(
            parse(json!({"event": "ssh-input", "data": "ls\n"})),
            ClientEvent::SshInput(s) if s == "ls\n"
        ));
        assert!(matches!(
            parse(json!({"event": "disconnect-ssh"})),
            ClientEvent::DisconnectSsh
        ));
        assert!(matches!(parse(json!({"event": "ping"})), ClientEvent::Ping));

        let ClientEvent::Resize(size) =
            parse(json!({"event": "resize", "data": {"rows": 40, "cols": 120}}))
        else {
            panic!("expected resize");
        };
        assert_eq!(
            PtySize::from(size),
            PtySize {
                cols: 120,
                rows: 40,
                pixel_width: 0,
                pixel_height: 0
            }
        );

        let ClientEvent::QuickConnect(creds) = parse(json!({
            "event": "quick-connect",
            "data": {"host": "h", "port": 2200, "username": "u", "privateKey": "K"}
        })) else {
            panic!("expected quick-connect");
        };
        assert_eq!(creds.port, Some(2200));
        assert_eq!(creds.private_key.as_deref(), Some("K"));
    }

    #[test]
    fn test_unknown_event_rejected() {
        assert!(serde_json::from_value::<ClientEvent>(json!({"event": "rm-rf"})).is_err());
    }

    #[test]
    fn test_server_events_serialize() {
        let ok = ServerEvent::Authenticated(AuthResult {
            success: true,
            error: None,
        });
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"event": "authenticated", "data": {"success": true}})
        );
        assert_eq!(
            serde_json::to_value(ServerEvent::SshConnected).unwrap(),
            json!({"event": "ssh-connected"})
        );
        assert_eq!(
            serde_json::to_value(ServerEvent::error("boom")).unwrap(),
            json!({"event": "ssh-error", "data": {"error": "boom"}})
        );
        assert_eq!(
            serde_json::to_value(ServerEvent::SshData("x".into())).unwrap(),
            json!({"event": "ssh-data", "data": "x"})
        );
    }

    #[test]
    fn test_decoder_carries_split_characters() {
        let mut decoder = Utf8Decoder::new();
        let bytes = "héllo €".as_bytes();
        // Split inside both multi-byte characters
        let (a, rest) = bytes.split_at(2);
        let (b, c) = rest.split_at(rest.len() - 1);

        let mut text = decoder.decode(a);
        assert_eq!(text, "h");
        text.push_str(&decoder.decode(b));
        text.push_str(&decoder.decode(c));
        assert_eq!(text, "héllo €");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{fffd}b");
        assert_eq!(decoder.decode(b"\xe2\x82"), "");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }
}
