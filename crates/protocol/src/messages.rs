use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Signalling messages exchanged between the session layer and the media
/// core (spec.md §4.H). The same variant is used for both directions where
/// the shape matches the original's reuse of `Offer`/`Answer`/`Video`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// `signal/offer`: browser's SDP offer (inbound), or the agent's
    /// initial offer carried by `Provide` below.
    Offer { sdp: String, session_id: Uuid },
    /// `signal/answer`: SDP answer, either direction.
    Answer { sdp: String, session_id: Uuid },
    /// `signal/candidate`: trickle ICE candidate, either direction.
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
        session_id: Uuid,
    },
    /// `signal/request` (inbound): create a peer and perform the initial
    /// `SetVideo`. An empty `video` and zero `bitrate` mean "first tier".
    Request {
        session_id: Uuid,
        video: Option<String>,
        bitrate: Option<u64>,
        #[serde(default)]
        video_auto: bool,
    },
    /// `signal/restart` (inbound): renegotiate with `ice_restart = true`.
    /// The same tag is used outbound to carry the resulting offer.
    Restart {
        session_id: Uuid,
        sdp: Option<String>,
    },
    /// `signal/video`: inbound explicit tier selection, or outbound
    /// tier-change notification once the ABR loop or a manual pick resolves
    /// to a concrete `video_id`/`bitrate`.
    Video {
        session_id: Uuid,
        video: Option<String>,
        bitrate: Option<u64>,
        #[serde(default)]
        video_auto: bool,
    },
    /// `signal/provide` (outbound): answer to `signal/request` with the SDP
    /// offer, ICE server list and the tier the peer was attached to.
    Provide {
        session_id: Uuid,
        sdp: String,
        ice_servers: Vec<IceServerInfo>,
        video: String,
        bitrate: u64,
        video_auto: bool,
    },
    /// `signal/close` (outbound): peer connection was torn down.
    Close { session_id: Uuid },
    /// Error reply for any of the above.
    Error { message: String },
}

/// Input events sent over the WebRTC data channel (compact format, spec.md
/// §6's desktop input driver surface).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum InputEvent {
    /// Key press/release: Linux evdev code + down state.
    #[serde(rename = "k")]
    Key { c: u16, d: bool },
    /// Absolute pointer move, coordinates in 0..0xFFFF (spec.md §6).
    #[serde(rename = "m")]
    MouseMove { x: u16, y: u16 },
    /// Mouse button press/release (0 = left, 1 = middle, 2 = right).
    #[serde(rename = "b")]
    Button { b: u8, d: bool },
    /// Scroll event, signed step deltas.
    #[serde(rename = "s")]
    Scroll { dx: i32, dy: i32 },
    /// Touch point update; `ph` is 0=begin, 1=update, 2=end.
    #[serde(rename = "touch")]
    Touch {
        id: u8,
        ph: u8,
        x: u16,
        y: u16,
        pressure: u8,
    },
    /// Client-requested resolution change.
    #[serde(rename = "r")]
    Resize { w: u32, h: u32 },
}

/// ICE server configuration returned to clients for WebRTC setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaling_offer_roundtrip() {
        let msg = SignalingMessage::Offer {
            sdp: "v=0\r\n...".to_string(),
            session_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"offer""#));
        let parsed: SignalingMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            SignalingMessage::Offer { sdp, .. } => assert_eq!(sdp, "v=0\r\n..."),
            _ => panic!("Expected Offer"),
        }
    }

    #[test]
    fn signaling_ice_candidate_snake_case() {
        let msg = SignalingMessage::IceCandidate {
            candidate: "candidate:1 1 UDP 2130706431 ...".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            session_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"ice_candidate""#));
        assert!(!json.contains("ice-candidate"));
    }

    #[test]
    fn signaling_request_defaults_to_no_tier() {
        let json = r#"{"type":"request","session_id":"00000000-0000-0000-0000-000000000000"}"#;
        let msg: SignalingMessage = serde_json::from_str(json).unwrap();
        match msg {
            SignalingMessage::Request {
                video,
                bitrate,
                video_auto,
                ..
            } => {
                assert!(video.is_none());
                assert!(bitrate.is_none());
                assert!(!video_auto);
            }
            _ => panic!("Expected Request"),
        }
    }

    #[test]
    fn signaling_provide_roundtrip() {
        let msg = SignalingMessage::Provide {
            session_id: Uuid::nil(),
            sdp: "v=0".to_string(),
            ice_servers: vec![IceServerInfo {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
            video: "hd".to_string(),
            bitrate: 4000,
            video_auto: true,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"provide""#));
        assert!(!json.contains("username"));
        let parsed: SignalingMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            SignalingMessage::Provide { video, bitrate, .. } => {
                assert_eq!(video, "hd");
                assert_eq!(bitrate, 4000);
            }
            _ => panic!("Expected Provide"),
        }
    }

    #[test]
    fn input_event_compact_format() {
        let key = InputEvent::Key { c: 30, d: true };
        let json = serde_json::to_string(&key).unwrap();
        assert!(json.contains(r#""t":"k""#));
        assert!(json.contains(r#""c":30"#));

        let mouse = InputEvent::MouseMove { x: 100, y: 200 };
        let json = serde_json::to_string(&mouse).unwrap();
        assert!(json.contains(r#""t":"m""#));

        let scroll = InputEvent::Scroll { dx: 0, dy: -30 };
        let json = serde_json::to_string(&scroll).unwrap();
        assert!(json.contains(r#""t":"s""#));

        let touch = InputEvent::Touch {
            id: 0,
            ph: 0,
            x: 1000,
            y: 2000,
            pressure: 255,
        };
        let json = serde_json::to_string(&touch).unwrap();
        assert!(json.contains(r#""t":"touch""#));

        let resize = InputEvent::Resize { w: 1920, h: 1080 };
        let json = serde_json::to_string(&resize).unwrap();
        assert!(json.contains(r#""t":"r""#));
    }

    #[test]
    fn input_event_from_browser() {
        let browser_json = r#"{"t":"k","c":30,"d":true}"#;
        let event: InputEvent = serde_json::from_str(browser_json).unwrap();
        match event {
            InputEvent::Key { c, d } => {
                assert_eq!(c, 30);
                assert!(d);
            }
            _ => panic!("Expected Key"),
        }
    }

    #[test]
    fn config_defaults() {
        let config: crate::AgentConfig = toml::from_str("").unwrap();
        assert_eq!(config.video.tiers.len(), 4);
        assert_eq!(config.ice.stun_urls.len(), 2);
        assert!(config.ice.turn_urls.is_empty());
    }
}
