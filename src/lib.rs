//! Confero — real-time conferencing client core
//!
//! This crate implements the signaling/media-synchronization engine of a
//! conferencing client:
//!
//! - [`SignalingChannel`] owns the WebSocket connection to the signaling
//!   server: request/response correlation, event dispatch, and automatic
//!   reconnection with exponential backoff.
//! - [`RemoteFeedAggregator`] owns the single multiplexed peer connection
//!   that carries every subscribed remote feed, renegotiating it as the
//!   publisher roster changes and demultiplexing inbound tracks to feeds.
//! - [`OutboundMediaSession`] owns the outbound peer connection used to
//!   publish local media, with in-place track replacement for screen share.
//! - [`SubscriptionSynchronizer`] orchestrates the above, coalescing
//!   overlapping renegotiation triggers so at most one offer/answer
//!   exchange is ever in flight.
//!
//! Room management (REST), UI state, and device capture live outside this
//! crate; they interact with it through [`JoinGrant`], media callbacks, and
//! the track handles returned by `start_capture`.

pub mod config;
pub mod media;
pub mod session;
pub mod signaling;

use thiserror::Error as ThisError;

pub use config::{ChannelConfig, IceServerConfig, JoinGrant, ParticipantInfo};
pub use media::aggregator::RemoteFeedAggregator;
pub use media::publisher::{LocalMediaHandle, OutboundMediaSession};
pub use media::{FeedDescriptor, FeedMediaEvent, IceCandidate, MediaKind};
pub use session::roster::RoomRoster;
pub use session::synchronizer::SubscriptionSynchronizer;
pub use signaling::channel::{ChannelState, HandlerId, SignalingChannel};
pub use signaling::protocol::Envelope;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the conferencing core
#[derive(Debug, ThisError)]
pub enum Error {
    /// Operation attempted with no live signaling transport
    #[error("not connected to signaling server")]
    NotConnected,

    /// Every candidate endpoint failed or timed out
    #[error("connect failed: {last}")]
    ConnectFailed {
        /// Error from the last candidate attempted
        last: String,
    },

    /// No correlated response arrived within the request deadline
    #[error("request '{kind}' timed out")]
    RequestTimeout {
        /// Message type of the request that timed out
        kind: String,
    },

    /// The connection was torn down while the request was outstanding
    #[error("signaling channel closed")]
    ChannelClosed,

    /// Server rejected a correlated request
    #[error("server error {code}: {message}")]
    ServerError { code: i64, message: String },

    /// Generated local description is structurally incomplete
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Inbound track could not be attributed to any feed
    #[error("unresolved feed: {0}")]
    UnresolvedFeed(String),

    /// A capture/offer cycle is already outstanding on the publish session
    #[error("publish cycle already in progress")]
    PublishInProgress,

    /// The connect URL could not be parsed or normalized
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// WebRTC stack failure
    #[error("webrtc error: {0}")]
    WebRtcError(String),

    /// Wire payload could not be decoded
    #[error("decode error: {0}")]
    DecodeError(String),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    InternalError(String),
}
