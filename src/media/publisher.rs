//! Outbound media session: the local-publish peer connection
//!
//! A narrower instance of the renegotiation discipline: one capture/offer
//! cycle at a time, with a second concurrent attempt rejected outright —
//! duplicate publish attempts are a caller bug, not an expected race.
//! Screen-share takeover swaps the video track in place through the RTP
//! sender, with no full renegotiation.

use crate::config::IceServerConfig;
use crate::media::{build_peer_connection, IceCandidate, MediaKind};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Callback invoked per locally gathered candidate
pub type PublisherIceCallback = Arc<dyn Fn(IceCandidate) + Send + Sync>;

/// Local media tracks produced by `start_capture`
///
/// Device capture writes samples into these; everything past the track
/// objects (camera/microphone/screen acquisition) lives outside this crate.
#[derive(Clone)]
pub struct LocalMediaHandle {
    pub stream_id: String,
    pub audio: Arc<TrackLocalStaticSample>,
    pub video: Arc<TrackLocalStaticSample>,
}

/// Owner of the single outbound peer connection
#[derive(Clone)]
pub struct OutboundMediaSession {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    pc: tokio::sync::Mutex<Option<Arc<RTCPeerConnection>>>,
    senders: tokio::sync::Mutex<HashMap<MediaKind, Arc<RTCRtpSender>>>,
    handle: Mutex<Option<LocalMediaHandle>>,
    /// True from `start_capture` until `set_answer` completes the cycle
    cycle_open: Mutex<bool>,
    mic_muted: AtomicBool,
    video_disabled: AtomicBool,
    ice_cb: RwLock<Option<PublisherIceCallback>>,
}

impl OutboundMediaSession {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                pc: tokio::sync::Mutex::new(None),
                senders: tokio::sync::Mutex::new(HashMap::new()),
                handle: Mutex::new(None),
                cycle_open: Mutex::new(false),
                mic_muted: AtomicBool::new(false),
                video_disabled: AtomicBool::new(false),
                ice_cb: RwLock::new(None),
            }),
        }
    }

    /// Register the outbound ICE candidate callback
    pub fn on_ice_candidate(&self, callback: impl Fn(IceCandidate) + Send + Sync + 'static) {
        *self.inner.ice_cb.write() = Some(Arc::new(callback));
    }

    /// Create the outbound peer connection; no-op when already initialized
    pub async fn initialize(&self, ice_servers: &[IceServerConfig]) -> Result<()> {
        let mut slot = self.inner.pc.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let pc = build_peer_connection(ice_servers).await?;

        let inner = Arc::downgrade(&self.inner);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let inner = inner.clone();
            Box::pin(async move {
                let (Some(inner), Some(candidate)) = (inner.upgrade(), candidate) else {
                    return;
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!("failed to serialize publish candidate: {}", e);
                        return;
                    }
                };
                let callback = inner.ice_cb.read().clone();
                if let Some(callback) = callback {
                    callback(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    });
                }
            })
        }));

        pc.on_peer_connection_state_change(Box::new(move |state| {
            debug!("publish connection state: {}", state);
            Box::pin(async {})
        }));

        *slot = Some(pc);
        info!("outbound media session initialized");
        Ok(())
    }

    /// Produce the local track pair and attach it to the connection
    ///
    /// Rejects with `PublishInProgress` while a capture/offer cycle is
    /// already outstanding.
    pub async fn start_capture(&self) -> Result<LocalMediaHandle> {
        {
            let mut cycle = self.inner.cycle_open.lock();
            if *cycle {
                return Err(Error::PublishInProgress);
            }
            *cycle = true;
        }
        match self.attach_local_tracks().await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                *self.inner.cycle_open.lock() = false;
                Err(e)
            }
        }
    }

    async fn attach_local_tracks(&self) -> Result<LocalMediaHandle> {
        let pc = self.connection().await?;
        let stream_id = format!("local-{}", Uuid::new_v4());

        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                ..Default::default()
            },
            "audio".to_string(),
            stream_id.clone(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            stream_id.clone(),
        ));

        let audio_sender = pc
            .add_track(Arc::clone(&audio) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::WebRtcError(format!("failed to add audio track: {e}")))?;
        let video_sender = pc
            .add_track(Arc::clone(&video) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::WebRtcError(format!("failed to add video track: {e}")))?;

        {
            let mut senders = self.inner.senders.lock().await;
            senders.insert(MediaKind::Audio, audio_sender);
            senders.insert(MediaKind::Video, video_sender);
        }

        let handle = LocalMediaHandle {
            stream_id,
            audio,
            video,
        };
        *self.inner.handle.lock() = Some(handle.clone());
        info!("local capture tracks attached");
        Ok(handle)
    }

    /// Create and apply the local publish offer
    pub async fn create_offer(&self) -> Result<String> {
        let pc = self.connection().await?;
        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| Error::WebRtcError(format!("failed to create offer: {e}")))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| Error::WebRtcError(format!("failed to apply local offer: {e}")))?;
        debug!("publish offer created, {} bytes", offer.sdp.len());
        Ok(offer.sdp)
    }

    /// Apply the server's answer, completing the publish cycle
    pub async fn set_answer(&self, sdp: &str) -> Result<()> {
        let pc = self.connection().await?;
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| Error::WebRtcError(format!("invalid publish answer: {e}")))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| Error::WebRtcError(format!("failed to apply publish answer: {e}")))?;
        *self.inner.cycle_open.lock() = false;
        info!("publish answer applied");
        Ok(())
    }

    /// Swap the live track of one kind in place (camera ⇄ screen share)
    ///
    /// Returns whether an existing track was replaced (`true`) or the track
    /// had to be newly added (`false`).
    pub async fn replace_track(
        &self,
        kind: MediaKind,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<bool> {
        let existing = {
            let senders = self.inner.senders.lock().await;
            senders.get(&kind).cloned()
        };
        match existing {
            Some(sender) => {
                sender
                    .replace_track(Some(
                        Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>
                    ))
                    .await
                    .map_err(|e| Error::WebRtcError(format!("failed to replace track: {e}")))?;
                if let Some(handle) = self.inner.handle.lock().as_mut() {
                    match kind {
                        MediaKind::Audio => handle.audio = Arc::clone(&track),
                        MediaKind::Video => handle.video = Arc::clone(&track),
                    }
                }
                info!("replaced live {:?} track in place", kind);
                Ok(true)
            }
            None => {
                let pc = self.connection().await?;
                let sender = pc
                    .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(|e| Error::WebRtcError(format!("failed to add track: {e}")))?;
                self.inner.senders.lock().await.insert(kind, sender);
                debug!("no live {:?} track to replace; added new sender", kind);
                Ok(false)
            }
        }
    }

    /// Flip microphone enablement; returns the new disabled state
    pub fn toggle_mute(&self) -> bool {
        !self.inner.mic_muted.fetch_xor(true, Ordering::SeqCst)
    }

    /// Flip camera enablement; returns the new disabled state
    pub fn toggle_video(&self) -> bool {
        !self.inner.video_disabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.inner.mic_muted.load(Ordering::SeqCst)
    }

    pub fn is_video_disabled(&self) -> bool {
        self.inner.video_disabled.load(Ordering::SeqCst)
    }

    /// Tear down the connection and every owned resource
    pub async fn stop(&self) {
        if let Some(pc) = self.inner.pc.lock().await.take() {
            if let Err(e) = pc.close().await {
                warn!("error closing publish connection: {}", e);
            }
        }
        self.inner.senders.lock().await.clear();
        *self.inner.handle.lock() = None;
        *self.inner.cycle_open.lock() = false;
        *self.inner.ice_cb.write() = None;
        self.inner.mic_muted.store(false, Ordering::SeqCst);
        self.inner.video_disabled.store(false, Ordering::SeqCst);
        info!("outbound media session stopped");
    }

    async fn connection(&self) -> Result<Arc<RTCPeerConnection>> {
        self.inner
            .pc
            .lock()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| Error::InternalError("outbound session not initialized".to_string()))
    }
}

impl Default for OutboundMediaSession {
    fn default() -> Self {
        Self::new()
    }
}
