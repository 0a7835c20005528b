//! Media identity, track attribution, and per-feed bindings
//!
//! All remote feeds share one multiplexed peer connection, so inbound tracks
//! must be attributed back to their owning feed from transport-level
//! identifiers. The grouping-stream id carries a fixed tag prefix followed
//! by the feed id; the track id itself carries a `<feed_id>-<kind>` suffix
//! as the secondary signal.

pub mod aggregator;
pub mod publisher;

use crate::config::IceServerConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

/// Tag prefix on grouping-stream ids of the multiplexed connection
pub const FEED_STREAM_PREFIX: &str = "feed-";

/// Media kind of a single track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Track-id suffix for this kind
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

/// Identity of one publisher's media contribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedDescriptor {
    /// Server-assigned, stable for the lifetime of the publisher's media
    pub feed_id: String,
    pub display: String,
    pub user_id: String,
}

/// Connectivity-path descriptor exchanged over the signaling channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Attribute an inbound track to its owning feed
///
/// Strategies, in order: strip the grouping-stream tag prefix; parse the
/// `<feed_id>-<kind>` track-id suffix; fall back to the first desired feed.
/// `None` means the desired set was empty and the track must be dropped.
pub fn resolve_feed_id(stream_id: &str, track_id: &str, desired: &[String]) -> Option<String> {
    if let Some(feed_id) = stream_id.strip_prefix(FEED_STREAM_PREFIX) {
        if !feed_id.is_empty() {
            return Some(feed_id.to_string());
        }
    }
    if let Some((feed_id, suffix)) = track_id.rsplit_once('-') {
        if MediaKind::from_suffix(suffix).is_some() && !feed_id.is_empty() {
            return Some(feed_id.to_string());
        }
    }
    desired.first().cloned()
}

/// Tracks accumulated for one feed; audio and video arrive independently
#[derive(Debug, Clone)]
pub struct FeedBinding<T> {
    pub audio: Option<T>,
    pub video: Option<T>,
}

impl<T> Default for FeedBinding<T> {
    fn default() -> Self {
        Self {
            audio: None,
            video: None,
        }
    }
}

impl<T> FeedBinding<T> {
    /// Whether any track has arrived yet
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// Composite media handle for one remote feed
pub type FeedMedia = FeedBinding<Arc<TrackRemote>>;

/// Per-feed binding update emitted by the aggregator
#[derive(Clone)]
pub enum FeedMediaEvent {
    /// A track arrived (or was replaced); carries the feed's current composite
    Updated { feed_id: String, media: FeedMedia },
    /// The feed was dropped from the desired set
    Removed { feed_id: String },
}

/// Registry of feed bindings, keyed by feed id
///
/// Generic over the track handle so the accumulation rules are testable
/// without a live peer connection.
pub struct FeedBindings<T> {
    map: HashMap<String, FeedBinding<T>>,
}

impl<T: Clone> FeedBindings<T> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Attach a track to a feed's binding and return the updated composite
    ///
    /// A later track of the other kind must not overwrite the first; a later
    /// track of the same kind replaces it (transport-level renegotiation can
    /// re-issue a track).
    pub fn attach(&mut self, feed_id: &str, kind: MediaKind, track: T) -> FeedBinding<T> {
        let binding = self.map.entry(feed_id.to_string()).or_default();
        match kind {
            MediaKind::Audio => binding.audio = Some(track),
            MediaKind::Video => binding.video = Some(track),
        }
        binding.clone()
    }

    pub fn remove(&mut self, feed_id: &str) -> Option<FeedBinding<T>> {
        self.map.remove(feed_id)
    }

    /// Drop every binding not in the desired set; returns the dropped ids
    pub fn retain_desired(&mut self, desired: &[String]) -> Vec<String> {
        let dropped: Vec<String> = self
            .map
            .keys()
            .filter(|id| !desired.iter().any(|d| d == *id))
            .cloned()
            .collect();
        for id in &dropped {
            self.map.remove(id);
        }
        dropped
    }

    /// Drop everything; returns the dropped ids
    pub fn clear(&mut self) -> Vec<String> {
        let dropped: Vec<String> = self.map.keys().cloned().collect();
        self.map.clear();
        dropped
    }

    pub fn get(&self, feed_id: &str) -> Option<&FeedBinding<T>> {
        self.map.get(feed_id)
    }

    pub fn feed_ids(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<T: Clone> Default for FeedBindings<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a peer connection with default codecs and interceptors
pub(crate) async fn build_peer_connection(
    ice_servers: &[IceServerConfig],
) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| Error::WebRtcError(format!("failed to register codecs: {e}")))?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| Error::WebRtcError(format!("failed to register interceptors: {e}")))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: ice_servers.iter().map(IceServerConfig::to_rtc).collect(),
        ..Default::default()
    };

    let pc = api
        .new_peer_connection(config)
        .await
        .map_err(|e| Error::WebRtcError(format!("failed to create peer connection: {e}")))?;
    debug!("created peer connection with {} ice servers", ice_servers.len());
    Ok(Arc::new(pc))
}
