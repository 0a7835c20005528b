//! Session-level state and orchestration
//!
//! The roster tracks who is in the room and who is publishing; the
//! synchronizer reacts to roster changes by driving the aggregator's
//! renegotiation, one exchange at a time.

pub mod roster;
pub mod synchronizer;

pub use roster::RoomRoster;
pub use synchronizer::SubscriptionSynchronizer;
