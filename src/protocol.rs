//! Wire protocol shared by the duplex and long-poll transports.
//!
//! Binary frames are discriminated by their first byte: `0x00` resize,
//! `0x01` file upload, anything else is raw terminal input. JSON control
//! traffic rides on the transport's text framing, so it can never
//! collide with the binary markers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::term::{DEFAULT_COLS, DEFAULT_ROWS};

/// First byte of a binary resize frame.
pub const FRAME_RESIZE: u8 = 0x00;
/// First byte of a binary file-upload frame.
pub const FRAME_UPLOAD: u8 = 0x01;

/// A terminal window size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

impl TermSize {
    /// Size applied when no clients are attached.
    pub const DEFAULT: TermSize = TermSize {
        rows: DEFAULT_ROWS,
        cols: DEFAULT_COLS,
    };

    /// Build a size with both dimensions floored at 1.
    pub fn clamped(rows: u16, cols: u16) -> Self {
        TermSize {
            rows: rows.max(1),
            cols: cols.max(1),
        }
    }

    /// Component-wise minimum.
    pub fn min(self, other: TermSize) -> TermSize {
        TermSize {
            rows: self.rows.min(other.rows),
            cols: self.cols.min(other.cols),
        }
    }
}

/// A parsed client binary frame.
#[derive(Debug, PartialEq, Eq)]
pub enum BinaryFrame<'a> {
    /// Window size report.
    Resize(TermSize),
    /// File upload body (everything after the marker byte), decoded by
    /// the upload module.
    Upload(&'a [u8]),
    /// Raw bytes for the child's stdin.
    Input(&'a [u8]),
}

/// Discriminate a binary frame by its first byte.
///
/// A `0x00` frame shorter than the 5 bytes a resize needs is treated as
/// raw input rather than silently dropped.
pub fn parse_binary_frame(data: &[u8]) -> BinaryFrame<'_> {
    match data.first() {
        Some(&FRAME_RESIZE) if data.len() >= 5 => {
            let rows = u16::from_be_bytes([data[1], data[2]]);
            let cols = u16::from_be_bytes([data[3], data[4]]);
            BinaryFrame::Resize(TermSize::clamped(rows, cols))
        }
        Some(&FRAME_UPLOAD) => BinaryFrame::Upload(&data[1..]),
        _ => BinaryFrame::Input(data),
    }
}

/// JSON control messages sent to duplex clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Status {
        viewers: usize,
        cols: u16,
        rows: u16,
        assistant: String,
    },
    Chat {
        #[serde(rename = "userName")]
        user_name: String,
        text: String,
        timestamp: String,
    },
    FileUpload {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: i64,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // Serialization of these enums cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// JSON control messages received from duplex clients.
#[derive(Debug, PartialEq)]
pub enum ClientControl {
    Ping { data: Option<Value> },
    Chat { user_name: String, text: String },
    Other(String),
}

/// Parse a client text frame. `None` when the frame is not a JSON
/// object with a `type` field.
pub fn parse_client_control(text: &str) -> Option<ClientControl> {
    let value: Value = serde_json::from_str(text).ok()?;
    let kind = value.get("type")?.as_str()?.to_string();
    match kind.as_str() {
        "ping" => Some(ClientControl::Ping {
            data: value.get("data").cloned(),
        }),
        "chat" => Some(ClientControl::Chat {
            user_name: value
                .get("userName")
                .and_then(Value::as_str)
                .unwrap_or("anonymous")
                .to_string(),
            text: value
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        _ => Some(ClientControl::Other(kind)),
    }
}

/// Response body of the long-poll `poll` endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct PollResponse {
    /// Base64-encoded screen snapshot.
    pub terminal: String,
    pub viewers: usize,
    pub cols: u16,
    pub rows: u16,
    pub assistant: String,
}

/// Request body of the long-poll `send` endpoint.
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
}

/// Session identifiers are UUID-shaped; anything else is rejected at
/// the HTTP boundary before it can become a registry key.
pub fn valid_session_id(id: &str) -> bool {
    uuid::Uuid::parse_str(id).is_ok()
}

/// Parse the long-poll resize payload `"rows,cols"`.
pub fn parse_resize_data(data: &str) -> Option<TermSize> {
    let (rows, cols) = data.split_once(',')?;
    let rows = rows.trim().parse::<u16>().ok()?;
    let cols = cols.trim().parse::<u16>().ok()?;
    Some(TermSize::clamped(rows, cols))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_frame_big_endian() {
        let frame = [0x00, 0x00, 40, 0x00, 120];
        assert_eq!(
            parse_binary_frame(&frame),
            BinaryFrame::Resize(TermSize {
                rows: 40,
                cols: 120
            })
        );
    }

    #[test]
    fn zero_dimensions_clamp_to_one() {
        let frame = [0x00, 0, 0, 0, 0];
        assert_eq!(
            parse_binary_frame(&frame),
            BinaryFrame::Resize(TermSize { rows: 1, cols: 1 })
        );
    }

    #[test]
    fn short_resize_frame_is_input() {
        let frame = [0x00, 0x01];
        assert_eq!(parse_binary_frame(&frame), BinaryFrame::Input(&frame[..]));
    }

    #[test]
    fn upload_frame_strips_marker() {
        let frame = [0x01, 0x00, 0x05, b'h'];
        assert_eq!(parse_binary_frame(&frame), BinaryFrame::Upload(&frame[1..]));
    }

    #[test]
    fn plain_bytes_are_input() {
        let frame = b"ls -la\r";
        assert_eq!(parse_binary_frame(frame), BinaryFrame::Input(&frame[..]));
    }

    #[test]
    fn server_messages_use_wire_field_names() {
        let status = ServerMessage::Status {
            viewers: 2,
            cols: 80,
            rows: 24,
            assistant: "Claude Code".to_string(),
        }
        .to_json();
        assert!(status.contains(r#""type":"status""#));
        assert!(status.contains(r#""viewers":2"#));

        let exit = ServerMessage::Exit { exit_code: 0 }.to_json();
        assert!(exit.contains(r#""exitCode":0"#));

        let chat = ServerMessage::Chat {
            user_name: "ana".to_string(),
            text: "hi".to_string(),
            timestamp: "2025-01-01T00:00:00Z".to_string(),
        }
        .to_json();
        assert!(chat.contains(r#""userName":"ana""#));

        let upload = ServerMessage::FileUpload {
            success: false,
            filename: None,
            error: Some("Invalid filename".to_string()),
        }
        .to_json();
        assert!(upload.contains(r#""type":"file_upload""#));
        assert!(!upload.contains("filename"));
    }

    #[test]
    fn client_control_parsing() {
        assert_eq!(
            parse_client_control(r#"{"type":"ping","data":123}"#),
            Some(ClientControl::Ping {
                data: Some(serde_json::json!(123))
            })
        );
        assert_eq!(
            parse_client_control(r#"{"type":"chat","userName":"bo","text":"yo"}"#),
            Some(ClientControl::Chat {
                user_name: "bo".to_string(),
                text: "yo".to_string()
            })
        );
        assert_eq!(
            parse_client_control(r#"{"type":"telemetry"}"#),
            Some(ClientControl::Other("telemetry".to_string()))
        );
        assert_eq!(parse_client_control("not json"), None);
    }

    #[test]
    fn session_ids_must_be_uuid_shaped() {
        assert!(valid_session_id("3aee05a6-1a34-4a0f-b9f6-1bd1c5dcf2b1"));
        assert!(!valid_session_id("felix"));
        assert!(!valid_session_id("../escape"));
        assert!(!valid_session_id(""));
    }

    #[test]
    fn poll_resize_payload() {
        assert_eq!(
            parse_resize_data("24,80"),
            Some(TermSize { rows: 24, cols: 80 })
        );
        assert_eq!(
            parse_resize_data("0, 80"),
            Some(TermSize { rows: 1, cols: 80 })
        );
        assert_eq!(parse_resize_data("24"), None);
        assert_eq!(parse_resize_data("a,b"), None);
    }
}
