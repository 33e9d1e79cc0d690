//! Notification transports for job events.
//!
//! In-process delivery uses `stagehand_events::BusNotifier` over an
//! `InMemoryEventBus`; the Redis transport is behind the `redis` feature.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisPubSubEventBus};
