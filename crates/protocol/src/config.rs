use serde::{Deserialize, Serialize};

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub abr: AbrConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// X11 display name, e.g. ":0"
    #[serde(default = "default_display_name")]
    pub name: String,
    #[serde(default = "default_width")]
    pub default_width: u32,
    #[serde(default = "default_height")]
    pub default_height: u32,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    /// Maximum resize width (0 = unlimited)
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    /// Maximum resize height (0 = unlimited)
    #[serde(default = "default_max_height")]
    pub max_height: u32,
}

/// One named video quality tier, e.g. `hd` at 4000 kbps.
///
/// `video_ids` order in the capture set is the declaration order of `tiers`
/// here, and must ascend by bitrate (lowest tier first): the selector steps
/// `Direction::Higher`/`Lower` by index, so declaration order is what gives
/// it the right adjacency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub id: String,
    /// Nominal bitrate in kbps, used before any real measurement exists.
    pub bitrate: u32,
    /// Force a specific encoder for this tier: "nvh264enc", "vah264enc", "x264enc".
    pub encoder: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Opus bitrate in kbps
    #[serde(default = "default_audio_bitrate")]
    pub bitrate: u32,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

/// Timing constants for the per-peer ABR loop (spec.md §4.F).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbrConfig {
    #[serde(default = "default_abr_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_abr_backoff_secs")]
    pub up_backoff_secs: u64,
    #[serde(default = "default_abr_backoff_secs")]
    pub down_backoff_secs: u64,
    #[serde(default = "default_abr_required_secs")]
    pub stable_required_secs: u64,
    #[serde(default = "default_abr_required_secs")]
    pub unstable_required_secs: u64,
    /// Headroom fraction above/below the current tier's bitrate before switching.
    #[serde(default = "default_abr_theta")]
    pub theta: f64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            name: default_display_name(),
            default_width: default_width(),
            default_height: default_height(),
            framerate: default_framerate(),
            max_width: default_max_width(),
            max_height: default_max_height(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bitrate: default_audio_bitrate(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_abr_tick_ms(),
            up_backoff_secs: default_abr_backoff_secs(),
            down_backoff_secs: default_abr_backoff_secs(),
            stable_required_secs: default_abr_required_secs(),
            unstable_required_secs: default_abr_required_secs(),
            theta: default_abr_theta(),
        }
    }
}

impl AgentConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, agent should not start) or
    /// "WARNING:" (advisory, agent can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.display.framerate == 0 || self.display.framerate > 240 {
            issues.push(format!(
                "ERROR: display.framerate must be between 1 and 240, got {}.",
                self.display.framerate
            ));
        }

        if self.display.max_width != 0 && self.display.max_width < 320 {
            issues.push(format!(
                "ERROR: display.max_width must be 0 (unlimited) or at least 320, got {}.",
                self.display.max_width
            ));
        }
        if self.display.max_height != 0 && self.display.max_height < 240 {
            issues.push(format!(
                "ERROR: display.max_height must be 0 (unlimited) or at least 240, got {}.",
                self.display.max_height
            ));
        }

        if self.video.tiers.is_empty() {
            issues.push("ERROR: video.tiers must declare at least one tier.".to_string());
        }
        let mut seen_ids = std::collections::HashSet::new();
        for tier in &self.video.tiers {
            if tier.bitrate > 100_000 {
                issues.push(format!(
                    "WARNING: video.tiers[{}].bitrate is {} kbps — unusually high, \
                     typical values are 500-20000 kbps.",
                    tier.id, tier.bitrate
                ));
            }
            if tier.bitrate == 0 {
                issues.push(format!(
                    "ERROR: video.tiers[{}].bitrate must be greater than 0.",
                    tier.id
                ));
            }
            if !seen_ids.insert(tier.id.clone()) {
                issues.push(format!(
                    "ERROR: video.tiers contains duplicate id '{}'.",
                    tier.id
                ));
            }
        }

        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }

        if self.abr.theta <= 0.0 {
            issues.push("ERROR: abr.theta must be greater than 0.".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_display_name() -> String {
    ":0".to_string()
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_framerate() -> u32 {
    60
}
fn default_max_width() -> u32 {
    3840
}
fn default_max_height() -> u32 {
    2160
}
fn default_true() -> bool {
    true
}
fn default_audio_bitrate() -> u32 {
    128
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
fn default_abr_tick_ms() -> u64 {
    1250
}
fn default_abr_backoff_secs() -> u64 {
    5
}
fn default_abr_required_secs() -> u64 {
    5
}
fn default_abr_theta() -> f64 {
    0.1
}
fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig {
            id: "hd".to_string(),
            bitrate: 4_000,
            encoder: None,
        },
        TierConfig {
            id: "hq".to_string(),
            bitrate: 2_500,
            encoder: None,
        },
        TierConfig {
            id: "mq".to_string(),
            bitrate: 1_200,
            encoder: None,
        },
        TierConfig {
            id: "lq".to_string(),
            bitrate: 600,
            encoder: None,
        },
    ]
}
