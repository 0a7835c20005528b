//! Subscription synchronizer: the only caller of `renegotiate`
//!
//! Roster changes can arrive in bursts and mid-negotiation, but the
//! aggregated peer connection tolerates exactly one offer/answer exchange
//! at a time. The synchronizer serializes: a sync requested while one is in
//! flight sets a pending flag and returns; when the in-flight sync
//! completes, exactly one follow-up runs against the roster as it stands
//! then. Bursts collapse into that single follow-up.

use crate::media::aggregator::RemoteFeedAggregator;
use crate::media::publisher::OutboundMediaSession;
use crate::media::{FeedDescriptor, IceCandidate};
use crate::session::roster::RoomRoster;
use crate::signaling::channel::{ChannelState, SignalingChannel};
use crate::signaling::protocol::{
    types, MemberJoinedEvent, MemberLeftEvent, PublishOfferReply, PublisherJoinedEvent,
    PublisherLeftEvent, RemoteCandidateEvent, SubscribeReply, TrickleIceParams,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// ICE target tag for the subscriber-side connection
const TARGET_SUBSCRIBER: &str = "subscriber";
/// ICE target tag for the publisher-side connection
const TARGET_PUBLISHER: &str = "publisher";

/// Orchestrates roster-driven renegotiation of the aggregated connection
#[derive(Clone)]
pub struct SubscriptionSynchronizer {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    channel: SignalingChannel,
    aggregator: RemoteFeedAggregator,
    roster: Arc<RoomRoster>,
    local_user_id: String,
    flags: Mutex<SyncFlags>,
}

#[derive(Default)]
struct SyncFlags {
    in_progress: bool,
    pending: bool,
}

impl SubscriptionSynchronizer {
    pub fn new(
        channel: SignalingChannel,
        aggregator: RemoteFeedAggregator,
        roster: Arc<RoomRoster>,
        local_user_id: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                channel,
                aggregator,
                roster,
                local_user_id: local_user_id.into(),
                flags: Mutex::new(SyncFlags::default()),
            }),
        }
    }

    /// Bring the subscribed feed set in line with the roster
    ///
    /// Returns immediately when a sync is already in flight, setting the
    /// pending flag instead — the in-flight sync's completion runs exactly
    /// one follow-up reflecting the roster at that moment. A failed sync is
    /// logged and surfaced but leaves the synchronizer ready for the next
    /// trigger.
    pub async fn request_sync(&self) -> Result<()> {
        {
            let mut flags = self.inner.flags.lock();
            if flags.in_progress {
                flags.pending = true;
                debug!("sync already in flight; coalescing");
                return Ok(());
            }
            flags.in_progress = true;
        }

        let mut result = self.sync_once().await;
        loop {
            if let Err(e) = &result {
                warn!("subscription sync failed: {}", e);
            }
            {
                let mut flags = self.inner.flags.lock();
                if !flags.pending {
                    flags.in_progress = false;
                    break;
                }
                flags.pending = false;
            }
            debug!("running coalesced follow-up sync");
            result = self.sync_once().await;
        }
        result
    }

    async fn sync_once(&self) -> Result<()> {
        let desired: Vec<FeedDescriptor> = self
            .inner
            .roster
            .publishers()
            .into_iter()
            .filter(|publisher| publisher.user_id != self.inner.local_user_id)
            .collect();

        if desired.is_empty() {
            debug!("no remote publishers; releasing all feed bindings");
            self.inner.aggregator.release_all();
            return Ok(());
        }

        let feed_ids: Vec<String> = desired.iter().map(|d| d.feed_id.clone()).collect();
        info!("syncing subscriptions for feeds {:?}", feed_ids);

        let reply = self
            .inner
            .channel
            .send_request(types::SUBSCRIBE, json!({ "feed_ids": feed_ids }))
            .await?;
        let reply: SubscribeReply = serde_json::from_value(reply)
            .map_err(|e| Error::DecodeError(format!("malformed subscribe reply: {e}")))?;

        // the server's offer is authoritative for what the exchange covers
        let offered = if reply.feed_ids.is_empty() {
            feed_ids
        } else {
            reply.feed_ids
        };
        let answer = self
            .inner
            .aggregator
            .renegotiate(&offered, &reply.sdp, &desired)
            .await?;

        self.inner
            .channel
            .send(types::SUBSCRIBE_ANSWER, json!({ "sdp": answer }))
            .await?;
        info!("subscription sync complete for {} feeds", offered.len());
        Ok(())
    }

    /// Register the roster-change handlers and the reconnection watcher
    ///
    /// Also wires the aggregator's gathered candidates into `trickle_ice`
    /// sends. Call once after constructing the synchronizer.
    pub fn attach(&self) {
        let channel = &self.inner.channel;

        let me = self.clone();
        channel.on(types::PUBLISHER_JOINED, move |envelope| {
            match serde_json::from_value::<PublisherJoinedEvent>(envelope.payload.clone()) {
                Ok(event) => {
                    info!("publisher joined: {} ({})", event.feed_id, event.display);
                    me.inner.roster.apply_publisher_joined(FeedDescriptor {
                        feed_id: event.feed_id,
                        display: event.display,
                        user_id: event.user_id,
                    });
                    me.spawn_sync();
                }
                Err(e) => warn!("malformed publisher_joined payload: {}", e),
            }
        });

        let me = self.clone();
        channel.on(types::PUBLISHER_LEFT, move |envelope| {
            match serde_json::from_value::<PublisherLeftEvent>(envelope.payload.clone()) {
                Ok(event) => {
                    info!("publisher left: {}", event.feed_id);
                    me.inner.roster.apply_publisher_left(&event.feed_id);
                    me.inner.aggregator.unsubscribe(&event.feed_id);
                    me.spawn_sync();
                }
                Err(e) => warn!("malformed publisher_left payload: {}", e),
            }
        });

        let me = self.clone();
        channel.on(types::MEMBER_JOINED, move |envelope| {
            match serde_json::from_value::<MemberJoinedEvent>(envelope.payload.clone()) {
                Ok(event) => me.inner.roster.apply_member_joined(&event.user_id, &event.display),
                Err(e) => warn!("malformed member_joined payload: {}", e),
            }
        });

        let me = self.clone();
        channel.on(types::MEMBER_LEFT, move |envelope| {
            match serde_json::from_value::<MemberLeftEvent>(envelope.payload.clone()) {
                Ok(event) => {
                    me.inner.roster.apply_member_left(&event.user_id);
                }
                Err(e) => warn!("malformed member_left payload: {}", e),
            }
        });

        let me = self.clone();
        channel.on(types::REMOTE_CANDIDATE, move |envelope| {
            match serde_json::from_value::<RemoteCandidateEvent>(envelope.payload.clone()) {
                Ok(event) => {
                    let me = me.clone();
                    tokio::spawn(async move {
                        let feed_id = event.feed_id.unwrap_or_default();
                        let candidate = IceCandidate {
                            candidate: event.candidate,
                            sdp_mid: event.sdp_mid,
                            sdp_mline_index: event.sdp_mline_index,
                        };
                        if let Err(e) = me.inner.aggregator.add_ice_candidate(&feed_id, candidate).await
                        {
                            warn!("failed to apply remote candidate: {}", e);
                        }
                    });
                }
                Err(e) => warn!("malformed remote_candidate payload: {}", e),
            }
        });

        channel.on(types::ERROR, |envelope| {
            warn!("server error event: {}", envelope.payload);
        });

        // gathered candidates trickle out over the channel as they appear
        let me = self.clone();
        self.inner.aggregator.on_ice_candidate(move |feed_id, candidate| {
            let me = me.clone();
            tokio::spawn(async move {
                let params = TrickleIceParams {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                    target: TARGET_SUBSCRIBER.to_string(),
                    feed_id: Some(feed_id),
                };
                let payload = match serde_json::to_value(&params) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("failed to encode trickle candidate: {}", e);
                        return;
                    }
                };
                if let Err(e) = me.inner.channel.send(types::TRICKLE_ICE, payload).await {
                    debug!("could not trickle candidate: {}", e);
                }
            });
        });

        // a transport swap invalidates in-peer-connection state; force a
        // full resync once the channel is back
        let me = self.clone();
        let mut state_rx = channel.watch_state();
        tokio::spawn(async move {
            let mut previous = *state_rx.borrow();
            while state_rx.changed().await.is_ok() {
                let current = *state_rx.borrow();
                if previous == ChannelState::Reconnecting && current == ChannelState::Connected {
                    info!("transport reconnected; forcing full subscription resync");
                    me.spawn_sync();
                }
                previous = current;
            }
        });
    }

    /// Drive the outbound publish exchange over the signaling channel
    ///
    /// The caller has already run `start_capture`; this creates the offer,
    /// sends it as `publish_offer`, and applies the server's answer.
    pub async fn publish_local(&self, publisher: &OutboundMediaSession) -> Result<()> {
        let offer = publisher.create_offer().await?;
        let reply = self
            .inner
            .channel
            .send_request(types::PUBLISH_OFFER, json!({ "sdp": offer }))
            .await?;
        let reply: PublishOfferReply = serde_json::from_value(reply)
            .map_err(|e| Error::DecodeError(format!("malformed publish_offer reply: {e}")))?;
        publisher.set_answer(&reply.sdp).await?;
        info!("local publish negotiated");
        Ok(())
    }

    /// Route the outbound session's gathered candidates over the channel
    pub fn wire_publisher(&self, publisher: &OutboundMediaSession) {
        let me = self.clone();
        publisher.on_ice_candidate(move |candidate| {
            let me = me.clone();
            tokio::spawn(async move {
                let params = TrickleIceParams {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                    target: TARGET_PUBLISHER.to_string(),
                    feed_id: None,
                };
                let payload = match serde_json::to_value(&params) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("failed to encode trickle candidate: {}", e);
                        return;
                    }
                };
                if let Err(e) = me.inner.channel.send(types::TRICKLE_ICE, payload).await {
                    debug!("could not trickle publish candidate: {}", e);
                }
            });
        });
    }

    fn spawn_sync(&self) {
        let me = self.clone();
        tokio::spawn(async move {
            if let Err(e) = me.request_sync().await {
                warn!("roster-triggered sync failed: {}", e);
            }
        });
    }
}
