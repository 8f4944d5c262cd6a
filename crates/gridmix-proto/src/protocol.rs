use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Lifecycle status of one channel as reported by the backend.
/// Authoritative over `isRunning` whenever both are present.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    #[default]
    Stopped,
    Running,
    Error,
}

impl ChannelStatus {
    /// Parse a status string from a `thread_status_change` event.  Returns
    /// `None` for statuses this client does not model (caller logs and
    /// ignores, per the event contract).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STOPPED" => Some(Self::Stopped),
            "RUNNING" => Some(Self::Running),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

// ── Push events ───────────────────────────────────────────────────────────────

/// Messages arriving on the transport/thread stream.
///
/// The backend also attaches `message` and `timestamp` fields to every
/// notification; they carry no state and are ignored on decode.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ThreadEvent {
    /// Welcome message sent on every (re)connect — carries a snapshot of
    /// the currently active threads.
    #[serde(rename = "connection", rename_all = "camelCase")]
    Connection {
        #[serde(default)]
        active_threads: Vec<ActiveThread>,
    },
    #[serde(rename = "thread_started", rename_all = "camelCase")]
    ThreadStarted {
        channel_id: u8,
        #[serde(default)]
        channel_name: Option<String>,
    },
    /// Terminal: the channel thread exited.  Older backend revisions spell
    /// the tag in camelCase.
    #[serde(rename = "thread_finished", alias = "threadFinished", rename_all = "camelCase")]
    ThreadFinished {
        channel_id: u8,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "thread_exception", rename_all = "camelCase")]
    ThreadException {
        channel_id: u8,
        #[serde(default)]
        exception_type: Option<String>,
        #[serde(default)]
        error_message: Option<String>,
    },
    #[serde(rename = "thread_status_change", rename_all = "camelCase")]
    ThreadStatusChange {
        channel_id: u8,
        #[serde(default)]
        old_status: Option<String>,
        /// Applied verbatim when present and recognized; otherwise the
        /// event is logged and dropped.
        #[serde(default)]
        new_status: Option<String>,
    },
    #[serde(rename = "massVolumeUpdate", rename_all = "camelCase")]
    MassVolumeUpdate {
        action: MassVolumeAction,
        #[serde(default)]
        excepted_channel_id: Option<u8>,
    },
    /// Any discriminant this client does not know.  Decoded, logged, ignored.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub enum MassVolumeAction {
    #[serde(rename = "muteAllExcept")]
    MuteAllExcept,
    #[serde(rename = "unmuteChannels")]
    UnmuteChannels,
}

/// One entry of the welcome snapshot on the thread stream.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveThread {
    pub channel_id: u8,
    #[serde(default)]
    pub channel_name: Option<String>,
    #[serde(default)]
    pub status: Option<ChannelStatus>,
    #[serde(default)]
    pub volume: Option<u8>,
}

/// Messages arriving on the volume stream.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum VolumeEvent {
    #[serde(rename = "volume", rename_all = "camelCase")]
    Volume { channel_id: u8, volume_level: u8 },
    #[serde(other)]
    Unknown,
}

/// Outbound low-latency volume command on the volume stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCommand {
    pub channel_id: u8,
    pub volume: u8,
}

// ── REST DTOs ─────────────────────────────────────────────────────────────────

/// `GET /api/config` — initial channel listing.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigResponse {
    pub channels: Vec<ConfigChannel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigChannel {
    pub id: u8,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
}

/// `GET /api/config/channels/status` — authoritative refresh.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub channels: Vec<StatusChannel>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChannel {
    pub id: u8,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub volume: u8,
    #[serde(default)]
    pub status: Option<ChannelStatus>,
    /// Backend field is PascalCase on the wire.
    #[serde(default, rename = "SoloMutedThread")]
    pub solo_muted_thread: Option<bool>,
}

/// Shared shape of activate/deactivate/solo/unsolo responses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub channel_name: Option<String>,
    #[serde(default)]
    pub action_performed: Option<String>,
}

/// `GET /api/volume/channels`.  Keys are channel ids as strings.
#[derive(Debug, Clone, Deserialize)]
pub struct VolumesResponse {
    pub volumes: HashMap<String, VolumeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeEntry {
    pub volume_level: u8,
}

/// `GET /api/server/status` — the backend's view of the downstream device.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub is_reachable: bool,
    #[serde(default)]
    pub response_time_ms: i64,
    #[serde(default)]
    pub error_message: Option<String>,
}
