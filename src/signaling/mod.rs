//! Signaling transport: wire protocol, endpoint resolution, and the channel
//!
//! The channel speaks JSON envelopes over a persistent WebSocket. Correlated
//! request/response pairs carry a `request_id`; everything else is either a
//! fire-and-forget send or a server-pushed event.

pub mod channel;
pub mod endpoint;
pub mod protocol;

pub use channel::{ChannelState, HandlerId, SignalingChannel};
pub use protocol::{types, Envelope};
