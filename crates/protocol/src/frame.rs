//! Binary framing for the WebRTC data channel (spec.md §4.G).
//!
//! Every message is a common `Header { event: u8, length: u16 }` followed by
//! `length` bytes of payload, all big-endian. Grounded in the original's
//! `internal/webrtc/payload/send.go` (event codes, field order, the legacy
//! `length = 7` quirk for `CURSOR_POSITION`).

use thiserror::Error;

pub const EVENT_CURSOR_POSITION: u8 = 0x01;
pub const EVENT_CURSOR_IMAGE: u8 = 0x02;
pub const EVENT_PONG: u8 = 0x03;

const HEADER_LEN: usize = 3;

/// `length` the original always wrote for `CURSOR_POSITION`, even though the
/// payload is actually 4 bytes. Existing clients key off this value; we
/// preserve it on encode and treat it as advisory on decode (spec.md §9).
const CURSOR_POSITION_LEGACY_LENGTH: u16 = 7;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: need at least {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
    #[error("unknown data channel event code {0:#x}")]
    UnknownEvent(u8),
    #[error("incomplete payload: header declares {declared} bytes, only {available} available")]
    IncompletePayload { declared: usize, available: usize },
}

/// A decoded data-channel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelFrame {
    /// Server → client, host's cursor position.
    CursorPosition { x: u16, y: u16 },
    /// Server → client, pointer bitmap change.
    CursorImage {
        width: u16,
        height: u16,
        xhot: u16,
        yhot: u16,
        pixels: Vec<u8>,
    },
    /// Server → client, echoes the client's ping timestamp plus the
    /// server's own timestamp, each split into two big-endian u32 halves.
    Pong {
        client_ts_hi: u32,
        client_ts_lo: u32,
        server_ts_hi: u32,
        server_ts_lo: u32,
    },
}

impl DataChannelFrame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            DataChannelFrame::CursorPosition { x, y } => {
                let mut buf = Vec::with_capacity(HEADER_LEN + 4);
                buf.push(EVENT_CURSOR_POSITION);
                buf.extend_from_slice(&CURSOR_POSITION_LEGACY_LENGTH.to_be_bytes());
                buf.extend_from_slice(&x.to_be_bytes());
                buf.extend_from_slice(&y.to_be_bytes());
                buf
            }
            DataChannelFrame::CursorImage {
                width,
                height,
                xhot,
                yhot,
                pixels,
            } => {
                let length = 8 + pixels.len();
                let mut buf = Vec::with_capacity(HEADER_LEN + length);
                buf.push(EVENT_CURSOR_IMAGE);
                buf.extend_from_slice(&(length as u16).to_be_bytes());
                buf.extend_from_slice(&width.to_be_bytes());
                buf.extend_from_slice(&height.to_be_bytes());
                buf.extend_from_slice(&xhot.to_be_bytes());
                buf.extend_from_slice(&yhot.to_be_bytes());
                buf.extend_from_slice(pixels);
                buf
            }
            DataChannelFrame::Pong {
                client_ts_hi,
                client_ts_lo,
                server_ts_hi,
                server_ts_lo,
            } => {
                let mut buf = Vec::with_capacity(HEADER_LEN + 16);
                buf.push(EVENT_PONG);
                buf.extend_from_slice(&16u16.to_be_bytes());
                buf.extend_from_slice(&client_ts_hi.to_be_bytes());
                buf.extend_from_slice(&client_ts_lo.to_be_bytes());
                buf.extend_from_slice(&server_ts_hi.to_be_bytes());
                buf.extend_from_slice(&server_ts_lo.to_be_bytes());
                buf
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::TooShort {
                need: HEADER_LEN,
                got: buf.len(),
            });
        }
        let event = buf[0];
        let declared_length = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        let payload = &buf[HEADER_LEN..];

        match event {
            EVENT_CURSOR_POSITION => {
                if payload.len() < 4 {
                    return Err(FrameError::IncompletePayload {
                        declared: declared_length,
                        available: payload.len(),
                    });
                }
                let x = u16::from_be_bytes([payload[0], payload[1]]);
                let y = u16::from_be_bytes([payload[2], payload[3]]);
                Ok(DataChannelFrame::CursorPosition { x, y })
            }
            EVENT_CURSOR_IMAGE => {
                if payload.len() < 8 {
                    return Err(FrameError::IncompletePayload {
                        declared: declared_length,
                        available: payload.len(),
                    });
                }
                if payload.len() < declared_length {
                    return Err(FrameError::IncompletePayload {
                        declared: declared_length,
                        available: payload.len(),
                    });
                }
                let width = u16::from_be_bytes([payload[0], payload[1]]);
                let height = u16::from_be_bytes([payload[2], payload[3]]);
                let xhot = u16::from_be_bytes([payload[4], payload[5]]);
                let yhot = u16::from_be_bytes([payload[6], payload[7]]);
                let pixels = payload[8..declared_length].to_vec();
                Ok(DataChannelFrame::CursorImage {
                    width,
                    height,
                    xhot,
                    yhot,
                    pixels,
                })
            }
            EVENT_PONG => {
                if payload.len() < 16 {
                    return Err(FrameError::IncompletePayload {
                        declared: declared_length,
                        available: payload.len(),
                    });
                }
                let client_ts_hi = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                let client_ts_lo = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                let server_ts_hi = u32::from_be_bytes(payload[8..12].try_into().unwrap());
                let server_ts_lo = u32::from_be_bytes(payload[12..16].try_into().unwrap());
                Ok(DataChannelFrame::Pong {
                    client_ts_hi,
                    client_ts_lo,
                    server_ts_hi,
                    server_ts_lo,
                })
            }
            other => Err(FrameError::UnknownEvent(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_position_roundtrip() {
        let frame = DataChannelFrame::CursorPosition { x: 123, y: 456 };
        let encoded = frame.encode();
        assert_eq!(DataChannelFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn cursor_position_wire_length_is_legacy_seven() {
        let encoded = DataChannelFrame::CursorPosition { x: 1, y: 2 }.encode();
        assert_eq!(encoded[0], EVENT_CURSOR_POSITION);
        let declared = u16::from_be_bytes([encoded[1], encoded[2]]);
        assert_eq!(declared, 7);
        // Actual payload after the header is only 4 bytes.
        assert_eq!(encoded.len() - HEADER_LEN, 4);
    }

    #[test]
    fn cursor_image_roundtrip() {
        let frame = DataChannelFrame::CursorImage {
            width: 32,
            height: 32,
            xhot: 3,
            yhot: 3,
            pixels: vec![0xAA; 32 * 32 * 4],
        };
        let encoded = frame.encode();
        assert_eq!(DataChannelFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn cursor_image_length_is_eight_plus_pixels() {
        let pixels = vec![1, 2, 3, 4, 5];
        let encoded = DataChannelFrame::CursorImage {
            width: 1,
            height: 1,
            xhot: 0,
            yhot: 0,
            pixels: pixels.clone(),
        }
        .encode();
        let declared = u16::from_be_bytes([encoded[1], encoded[2]]);
        assert_eq!(declared as usize, 8 + pixels.len());
    }

    #[test]
    fn pong_roundtrip() {
        let frame = DataChannelFrame::Pong {
            client_ts_hi: 1,
            client_ts_lo: 2,
            server_ts_hi: 3,
            server_ts_lo: 4,
        };
        let encoded = frame.encode();
        assert_eq!(DataChannelFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn decode_too_short_header_is_error() {
        let err = DataChannelFrame::decode(&[0x01, 0x00]).unwrap_err();
        assert_eq!(err, FrameError::TooShort { need: 3, got: 2 });
    }

    #[test]
    fn decode_unknown_event_is_error() {
        let buf = [0xFF, 0x00, 0x00];
        let err = DataChannelFrame::decode(&buf).unwrap_err();
        assert_eq!(err, FrameError::UnknownEvent(0xFF));
    }

    #[test]
    fn decode_truncated_cursor_image_is_error() {
        // Declares 16 bytes of payload but only provides 8.
        let mut buf = vec![EVENT_CURSOR_IMAGE, 0x00, 16];
        buf.extend_from_slice(&[0u8; 8]);
        let err = DataChannelFrame::decode(&buf).unwrap_err();
        assert!(matches!(err, FrameError::IncompletePayload { .. }));
    }

    #[test]
    fn all_bytes_big_endian() {
        let encoded = DataChannelFrame::CursorPosition {
            x: 0x0102,
            y: 0x0304,
        }
        .encode();
        assert_eq!(&encoded[3..5], &[0x01, 0x02]);
        assert_eq!(&encoded[5..7], &[0x03, 0x04]);
    }
}
