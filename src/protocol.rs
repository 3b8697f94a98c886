//! Tag-framed message codec shared by both directions of the `tty`
//! WebSocket sub-protocol. Stateless: framing, reassembly, and dispatch are
//! the session's job (see `session.rs`).

use serde::{Deserialize, Serialize};

/// Tags sent by the browser.
pub mod client_tag {
    pub const INPUT: u8 = b'0';
    pub const RESIZE_TERMINAL: u8 = b'1';
    pub const PAUSE: u8 = b'2';
    pub const RESUME: u8 = b'3';
    pub const JSON_DATA: u8 = b'{';
}

/// Tags sent by the server.
pub mod server_tag {
    pub const OUTPUT: u8 = b'0';
    pub const SET_WINDOW_TITLE: u8 = b'1';
    pub const SET_PREFERENCES: u8 = b'2';
}

/// A decoded client->server message, after tag dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Input(Vec<u8>),
    Resize { columns: u16, rows: u16 },
    Pause,
    Resume,
    Handshake(HandshakePayload),
    /// Tag recognized but payload malformed, or tag unrecognized.
    Unknown,
}

/// The JSON handshake payload sent as the first client message.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HandshakePayload {
    #[serde(rename = "AuthToken")]
    pub auth_token: Option<String>,
    pub columns: Option<u16>,
    pub rows: Option<u16>,
}

/// JSON body of a RESIZE_TERMINAL message.
#[derive(Debug, Clone, Deserialize)]
struct ResizePayload {
    columns: u16,
    rows: u16,
}

/// Parses one reassembled binary WebSocket message (tag byte + payload).
/// Unknown tags, and tags with malformed payloads, decode to `Unknown` and
/// are logged by the caller rather than here — the codec stays stateless
/// and side-effect free.
pub fn decode_client_message(frame: &[u8]) -> ClientMessage {
    let Some((&tag, payload)) = frame.split_first() else {
        return ClientMessage::Unknown;
    };

    match tag {
        client_tag::INPUT => ClientMessage::Input(payload.to_vec()),
        client_tag::RESIZE_TERMINAL => match serde_json::from_slice::<ResizePayload>(payload) {
            Ok(r) => ClientMessage::Resize {
                columns: r.columns,
                rows: r.rows,
            },
            Err(_) => ClientMessage::Unknown,
        },
        client_tag::PAUSE => ClientMessage::Pause,
        client_tag::RESUME => ClientMessage::Resume,
        client_tag::JSON_DATA => match serde_json::from_slice::<HandshakePayload>(payload) {
            Ok(h) => ClientMessage::Handshake(h),
            Err(_) => ClientMessage::Unknown,
        },
        _ => ClientMessage::Unknown,
    }
}

/// Builds a server->client OUTPUT frame: tag byte followed by raw PTY bytes.
pub fn encode_output(buf: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(buf.len() + 1);
    frame.push(server_tag::OUTPUT);
    frame.extend_from_slice(buf);
    frame
}

/// Builds the SET_WINDOW_TITLE frame: `"<command> (<hostname>)"`.
pub fn encode_window_title(command: &str, hostname: &str) -> Vec<u8> {
    let mut frame = vec![server_tag::SET_WINDOW_TITLE];
    frame.extend_from_slice(format!("{command} ({hostname})").as_bytes());
    frame
}

/// Builds the SET_PREFERENCES frame, carrying the client-preferences JSON
/// blob verbatim.
pub fn encode_preferences(preferences_json: &str) -> Vec<u8> {
    let mut frame = vec![server_tag::SET_PREFERENCES];
    frame.extend_from_slice(preferences_json.as_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_input_tag() {
        let mut frame = vec![client_tag::INPUT];
        frame.extend_from_slice(b"hello\n");
        assert_eq!(
            decode_client_message(&frame),
            ClientMessage::Input(b"hello\n".to_vec())
        );
    }

    #[test]
    fn zero_byte_input_decodes_to_empty_vec() {
        let frame = vec![client_tag::INPUT];
        assert_eq!(decode_client_message(&frame), ClientMessage::Input(vec![]));
    }

    #[test]
    fn decodes_resize() {
        let mut frame = vec![client_tag::RESIZE_TERMINAL];
        frame.extend_from_slice(br#"{"columns":132,"rows":40}"#);
        assert_eq!(
            decode_client_message(&frame),
            ClientMessage::Resize {
                columns: 132,
                rows: 40
            }
        );
    }

    #[test]
    fn decodes_pause_and_resume() {
        assert_eq!(decode_client_message(&[client_tag::PAUSE]), ClientMessage::Pause);
        assert_eq!(decode_client_message(&[client_tag::RESUME]), ClientMessage::Resume);
    }

    #[test]
    fn decodes_handshake_with_auth_token() {
        let mut frame = vec![client_tag::JSON_DATA];
        frame.extend_from_slice(br#"{"AuthToken":"secret","columns":80,"rows":24}"#);
        match decode_client_message(&frame) {
            ClientMessage::Handshake(h) => {
                assert_eq!(h.auth_token.as_deref(), Some("secret"));
                assert_eq!(h.columns, Some(80));
                assert_eq!(h.rows, Some(24));
            }
            other => panic!("expected Handshake, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_unknown() {
        assert_eq!(decode_client_message(b"9garbage"), ClientMessage::Unknown);
    }

    #[test]
    fn empty_frame_is_unknown() {
        assert_eq!(decode_client_message(b""), ClientMessage::Unknown);
    }

    #[test]
    fn malformed_resize_payload_is_unknown() {
        let mut frame = vec![client_tag::RESIZE_TERMINAL];
        frame.extend_from_slice(b"not json");
        assert_eq!(decode_client_message(&frame), ClientMessage::Unknown);
    }

    #[test]
    fn output_frame_has_tag_prefix() {
        let frame = encode_output(b"abc");
        assert_eq!(frame, vec![server_tag::OUTPUT, b'a', b'b', b'c']);
    }

    #[test]
    fn window_title_format() {
        let frame = encode_window_title("bash", "myhost");
        assert_eq!(frame[0], server_tag::SET_WINDOW_TITLE);
        assert_eq!(&frame[1..], b"bash (myhost)");
    }
}
