//! Configuration for the signaling channel and peer connections

use serde::{Deserialize, Serialize};
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Timing and retry policy for the signaling channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Per-candidate open-handshake timeout during `connect`
    pub connect_timeout: Duration,

    /// Deadline for each correlated request
    pub request_timeout: Duration,

    /// First reconnect delay; doubles each attempt
    pub reconnect_base: Duration,

    /// Ceiling for the reconnect delay
    pub reconnect_cap: Duration,

    /// Reconnect attempts before the channel gives up
    pub max_reconnect_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
            max_reconnect_attempts: 5,
        }
    }
}

/// One STUN/TURN server entry handed to the peer connections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs (`stun:` / `turn:` schemes)
    pub urls: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Convert to the webrtc-rs configuration type
    pub fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Join reply from the room-management REST collaborator
///
/// Seeds the signaling endpoint, ICE configuration, and the initial roster.
/// The token is consumed opaquely; how it was authorized is the REST
/// service's business.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinGrant {
    pub user_id: String,
    pub ws_url: String,
    pub token: String,
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<ParticipantInfo>>,
}

/// Participant known at join time; `feed_id` present when already publishing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_id: Option<String>,
    pub user_id: String,
    pub display: String,
}
