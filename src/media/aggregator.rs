//! Remote feed aggregator: one multiplexed inbound peer connection
//!
//! Every subscribed remote feed rides the same peer connection, keeping the
//! ICE/DTLS session count at one regardless of room size. Renegotiation
//! applies a server-issued offer for the full desired feed set and returns
//! the local answer; at most one offer/answer exchange executes at a time.
//! Inbound tracks are demultiplexed to feed identities and accumulated into
//! per-feed bindings re-emitted on every update.

use crate::config::IceServerConfig;
use crate::media::{
    build_peer_connection, resolve_feed_id, FeedBindings, FeedDescriptor, FeedMediaEvent,
    IceCandidate, MediaKind,
};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

/// Callback invoked on every per-feed binding update
pub type FeedMediaCallback = Arc<dyn Fn(FeedMediaEvent) + Send + Sync>;

/// Callback invoked per locally gathered candidate, tagged with the
/// representative feed identity
pub type AggregatorIceCallback = Arc<dyn Fn(String, IceCandidate) + Send + Sync>;

/// Owner of the single inbound peer connection carrying all remote feeds
#[derive(Clone)]
pub struct RemoteFeedAggregator {
    inner: Arc<AggregatorInner>,
}

struct AggregatorInner {
    ice_servers: Vec<IceServerConfig>,
    pc: tokio::sync::Mutex<Option<Arc<RTCPeerConnection>>>,
    /// Critical section: one SDP exchange in flight per connection
    negotiation: tokio::sync::Mutex<()>,
    desired: RwLock<Vec<String>>,
    descriptors: RwLock<HashMap<String, FeedDescriptor>>,
    bindings: Mutex<FeedBindings<Arc<TrackRemote>>>,
    media_cb: RwLock<Option<FeedMediaCallback>>,
    ice_cb: RwLock<Option<AggregatorIceCallback>>,
}

impl RemoteFeedAggregator {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                ice_servers,
                pc: tokio::sync::Mutex::new(None),
                negotiation: tokio::sync::Mutex::new(()),
                desired: RwLock::new(Vec::new()),
                descriptors: RwLock::new(HashMap::new()),
                bindings: Mutex::new(FeedBindings::new()),
                media_cb: RwLock::new(None),
                ice_cb: RwLock::new(None),
            }),
        }
    }

    /// Register the per-feed media callback
    pub fn on_feed_media(&self, callback: impl Fn(FeedMediaEvent) + Send + Sync + 'static) {
        *self.inner.media_cb.write() = Some(Arc::new(callback));
    }

    /// Register the outbound ICE candidate callback
    pub fn on_ice_candidate(&self, callback: impl Fn(String, IceCandidate) + Send + Sync + 'static) {
        *self.inner.ice_cb.write() = Some(Arc::new(callback));
    }

    /// Feeds with at least one bound track (snapshot)
    pub fn bound_feeds(&self) -> Vec<String> {
        self.inner.bindings.lock().feed_ids()
    }

    /// Descriptor for a currently desired feed (snapshot)
    pub fn descriptor(&self, feed_id: &str) -> Option<FeedDescriptor> {
        self.inner.descriptors.read().get(feed_id).cloned()
    }

    /// Apply a server-issued offer for the desired feed set, return the answer
    ///
    /// The answer is validated to carry the session-security attributes
    /// (DTLS fingerprint, ICE credentials) before being applied or returned;
    /// a structurally incomplete answer fails with `NegotiationFailed` and
    /// never reaches the signaling layer. Bindings for feeds no longer in
    /// the desired set are released.
    pub async fn renegotiate(
        &self,
        desired: &[String],
        offer_sdp: &str,
        descriptors: &[FeedDescriptor],
    ) -> Result<String> {
        let _exchange = self.inner.negotiation.lock().await;
        info!("renegotiating for {} feeds", desired.len());

        // attribution state must be current before tracks start arriving
        *self.inner.desired.write() = desired.to_vec();
        {
            let mut known = self.inner.descriptors.write();
            known.retain(|id, _| desired.iter().any(|d| d == id));
            for descriptor in descriptors {
                known.insert(descriptor.feed_id.clone(), descriptor.clone());
            }
        }
        let dropped = self.inner.bindings.lock().retain_desired(desired);
        for feed_id in dropped {
            debug!("releasing binding for departed feed {}", feed_id);
            self.inner.emit_media(FeedMediaEvent::Removed { feed_id });
        }

        let pc = self.ensure_connection().await?;

        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| Error::WebRtcError(format!("invalid remote offer: {e}")))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| Error::WebRtcError(format!("failed to apply remote offer: {e}")))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| Error::WebRtcError(format!("failed to create answer: {e}")))?;
        validate_session_security(&answer.sdp)?;

        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| Error::WebRtcError(format!("failed to apply local answer: {e}")))?;

        debug!("renegotiation complete, answer {} bytes", answer.sdp.len());
        Ok(answer.sdp)
    }

    /// Apply a remotely gathered trickle candidate
    ///
    /// Candidates racing a teardown are dropped with a diagnostic, not an
    /// error.
    pub async fn add_ice_candidate(&self, feed_id: &str, candidate: IceCandidate) -> Result<()> {
        let slot = self.inner.pc.lock().await;
        let Some(pc) = slot.as_ref() else {
            debug!(
                "dropping trickle candidate for {}: no active connection",
                feed_id
            );
            return Ok(());
        };
        pc.add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        })
        .await
        .map_err(|e| Error::WebRtcError(format!("failed to add ICE candidate: {e}")))
    }

    /// Release one feed's media binding and bookkeeping entry
    ///
    /// Does not renegotiate; shrinking the connection's subscribed set is
    /// the synchronizer's call.
    pub fn unsubscribe(&self, feed_id: &str) {
        self.inner.descriptors.write().remove(feed_id);
        if self.inner.bindings.lock().remove(feed_id).is_some() {
            info!("unsubscribed feed {}", feed_id);
            self.inner.emit_media(FeedMediaEvent::Removed {
                feed_id: feed_id.to_string(),
            });
        }
    }

    /// Release every binding; used when the desired set becomes empty
    pub fn release_all(&self) {
        *self.inner.desired.write() = Vec::new();
        self.inner.descriptors.write().clear();
        let dropped = self.inner.bindings.lock().clear();
        for feed_id in dropped {
            self.inner.emit_media(FeedMediaEvent::Removed { feed_id });
        }
    }

    /// Close the connection and drop all bindings and callbacks
    ///
    /// Safe to call when no connection exists.
    pub async fn cleanup(&self) {
        *self.inner.ice_cb.write() = None;
        *self.inner.media_cb.write() = None;
        if let Some(pc) = self.inner.pc.lock().await.take() {
            if let Err(e) = pc.close().await {
                warn!("error closing aggregated connection: {}", e);
            }
        }
        self.inner.bindings.lock().clear();
        self.inner.descriptors.write().clear();
        *self.inner.desired.write() = Vec::new();
        info!("remote feed aggregator cleaned up");
    }

    async fn ensure_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut slot = self.inner.pc.lock().await;
        if let Some(pc) = slot.as_ref() {
            return Ok(Arc::clone(pc));
        }

        let pc = build_peer_connection(&self.inner.ice_servers).await?;

        let inner = Arc::downgrade(&self.inner);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let inner = inner.clone();
            Box::pin(async move {
                if let Some(inner) = inner.upgrade() {
                    inner.handle_track(track);
                }
            })
        }));

        let inner = Arc::downgrade(&self.inner);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let inner = inner.clone();
            Box::pin(async move {
                if let (Some(inner), Some(candidate)) = (inner.upgrade(), candidate) {
                    inner.emit_candidate(candidate);
                }
            })
        }));

        pc.on_peer_connection_state_change(Box::new(move |state| {
            debug!("aggregated connection state: {}", state);
            Box::pin(async {})
        }));

        *slot = Some(Arc::clone(&pc));
        Ok(pc)
    }
}

impl AggregatorInner {
    fn handle_track(&self, track: Arc<TrackRemote>) {
        let stream_id = track.stream_id();
        let track_id = track.id();
        let kind = match track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            RTPCodecType::Video => MediaKind::Video,
            _ => {
                warn!("dropping track {} with unspecified codec type", track_id);
                return;
            }
        };

        let desired = self.desired.read().clone();
        match resolve_feed_id(&stream_id, &track_id, &desired) {
            Some(feed_id) => {
                debug!(
                    "track {} (stream '{}') attributed to feed {} as {:?}",
                    track_id, stream_id, feed_id, kind
                );
                let media = self.bindings.lock().attach(&feed_id, kind, track);
                self.emit_media(FeedMediaEvent::Updated { feed_id, media });
            }
            None => {
                let diag = Error::UnresolvedFeed(format!(
                    "track {} (stream '{}') arrived with empty desired set",
                    track_id, stream_id
                ));
                warn!("{}", diag);
            }
        }
    }

    fn emit_candidate(&self, candidate: RTCIceCandidate) {
        // all candidates belong to the one multiplexed transport session;
        // the first desired feed stands in as the representative identity
        let Some(feed_id) = self.desired.read().first().cloned() else {
            debug!("discarding gathered candidate: no desired feeds");
            return;
        };
        let init = match candidate.to_json() {
            Ok(init) => init,
            Err(e) => {
                warn!("failed to serialize gathered candidate: {}", e);
                return;
            }
        };
        let callback = self.ice_cb.read().clone();
        if let Some(callback) = callback {
            callback(
                feed_id,
                IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                },
            );
        }
    }

    fn emit_media(&self, event: FeedMediaEvent) {
        let callback = self.media_cb.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }
}

/// Reject local descriptions missing the session-security attributes
///
/// A description without a DTLS fingerprint or ICE credentials cannot
/// establish the media session; returning one to the signaling layer would
/// fail far from the cause.
fn validate_session_security(sdp: &str) -> Result<()> {
    if !sdp.contains("a=fingerprint:") {
        return Err(Error::NegotiationFailed(
            "local description missing DTLS fingerprint".to_string(),
        ));
    }
    if !sdp.contains("a=ice-ufrag:") {
        return Err(Error::NegotiationFailed(
            "local description missing ICE credentials".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPLETE_SDP: &str = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=ice-ufrag:abcd\r\na=ice-pwd:efgh\r\n\
        a=fingerprint:sha-256 AA:BB\r\n";

    #[test]
    fn test_complete_answer_passes_validation() {
        assert!(validate_session_security(COMPLETE_SDP).is_ok());
    }

    #[test]
    fn test_missing_fingerprint_fails_validation() {
        let sdp = COMPLETE_SDP.replace("a=fingerprint:sha-256 AA:BB\r\n", "");
        assert!(matches!(
            validate_session_security(&sdp),
            Err(Error::NegotiationFailed(_))
        ));
    }

    #[test]
    fn test_missing_ice_credentials_fails_validation() {
        let sdp = COMPLETE_SDP.replace("a=ice-ufrag:abcd\r\n", "");
        assert!(matches!(
            validate_session_security(&sdp),
            Err(Error::NegotiationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_without_connection_is_safe() {
        let aggregator = RemoteFeedAggregator::new(Vec::new());
        aggregator.cleanup().await;
        assert!(aggregator.bound_feeds().is_empty());
    }

    #[tokio::test]
    async fn test_trickle_candidate_without_connection_is_dropped() {
        let aggregator = RemoteFeedAggregator::new(Vec::new());
        let result = aggregator
            .add_ice_candidate(
                "f1",
                IceCandidate {
                    candidate: "candidate:1 1 udp 1 127.0.0.1 4242 typ host".to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                },
            )
            .await;
        assert!(result.is_ok());
    }
}
