//! Outbound media session integration tests
//!
//! Exercises the publish cycle against a real answering peer: capture,
//! offer, answer, in-place track replacement, and the duplicate-cycle
//! rejection.

mod harness;

use confero::signaling::protocol::{types, Envelope};
use confero::{
    ChannelConfig, Error, MediaKind, OutboundMediaSession, RemoteFeedAggregator, RoomRoster,
    SignalingChannel, SubscriptionSynchronizer,
};
use harness::TestServer;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug,webrtc=warn")
        .try_init();
}

/// Answer an offer the way the media server would
async fn answer_offer(offer_sdp: &str) -> anyhow::Result<String> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();
    let pc = api.new_peer_connection(RTCConfiguration::default()).await?;
    pc.set_remote_description(RTCSessionDescription::offer(offer_sdp.to_string())?)
        .await?;
    let answer = pc.create_answer(None).await?;
    let sdp = answer.sdp.clone();
    pc.set_local_description(answer).await?;
    // leave time for the description to settle before dropping the peer
    tokio::time::sleep(Duration::from_millis(10)).await;
    pc.close().await?;
    Ok(sdp)
}

fn screen_track(stream_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            ..Default::default()
        },
        "screen".to_string(),
        stream_id.to_string(),
    ))
}

#[tokio::test]
async fn test_full_publish_cycle() -> anyhow::Result<()> {
    init_test_tracing();
    let session = OutboundMediaSession::new();
    session.initialize(&[]).await?;

    let handle = session.start_capture().await?;
    assert!(handle.stream_id.starts_with("local-"));

    let offer = session.create_offer().await?;
    assert!(offer.contains("a=fingerprint:"));
    assert!(offer.contains("m=audio"));
    assert!(offer.contains("m=video"));

    // a second capture attempt mid-cycle is a caller bug, rejected outright
    assert!(matches!(
        session.start_capture().await,
        Err(Error::PublishInProgress)
    ));

    let answer = answer_offer(&offer).await?;
    session.set_answer(&answer).await?;

    session.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_replace_track_swaps_in_place() -> anyhow::Result<()> {
    init_test_tracing();
    let session = OutboundMediaSession::new();
    session.initialize(&[]).await?;
    let handle = session.start_capture().await?;

    // camera → screen share without a renegotiation
    let replaced = session
        .replace_track(MediaKind::Video, screen_track(&handle.stream_id))
        .await?;
    assert!(replaced, "existing video sender should be replaced in place");

    session.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_publish_exchange_over_signaling() -> anyhow::Result<()> {
    init_test_tracing();
    let server = TestServer::spawn().await?;

    let channel = SignalingChannel::new(ChannelConfig {
        request_timeout: Duration::from_secs(5),
        ..ChannelConfig::default()
    });
    channel.connect(&server.url()).await?;

    let sync = SubscriptionSynchronizer::new(
        channel.clone(),
        RemoteFeedAggregator::new(Vec::new()),
        Arc::new(RoomRoster::new()),
        "me",
    );

    let session = OutboundMediaSession::new();
    session.initialize(&[]).await?;
    sync.wire_publisher(&session);
    session.start_capture().await?;

    // the "server": answer the publish offer out of band, like the SFU would
    let answer_server = {
        let server_ref = &server;
        async move {
            assert!(
                server_ref
                    .wait_until(Duration::from_secs(2), |s| {
                        !s.received_of_kind(types::PUBLISH_OFFER).is_empty()
                    })
                    .await
            );
            let offers = server_ref.received_of_kind(types::PUBLISH_OFFER);
            let offer_sdp = offers[0].payload["sdp"].as_str().unwrap().to_string();
            let answer_sdp = answer_offer(&offer_sdp).await?;
            server_ref.send_to_latest(&Envelope::request(
                types::PUBLISH_OFFER,
                offers[0].request_id.clone().unwrap(),
                json!({ "sdp": answer_sdp }),
            ));
            anyhow::Ok(())
        }
    };

    let (published, answered) = tokio::join!(sync.publish_local(&session), answer_server);
    answered?;
    published?;

    // cycle complete: the next capture attempt is allowed again
    session.stop().await;
    channel.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_initialize_is_idempotent() -> anyhow::Result<()> {
    init_test_tracing();
    let session = OutboundMediaSession::new();
    session.initialize(&[]).await?;
    session.initialize(&[]).await?;
    session.stop().await;
    Ok(())
}
