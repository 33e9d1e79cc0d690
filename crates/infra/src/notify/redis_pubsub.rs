//! Redis pub/sub transport for job events (optional).
//!
//! Each envelope is published as JSON on `stagehand:jobs:<owner_user_id>`.
//! Pub/sub is not durable: offline subscribers miss events and must fall
//! back to reading job rows.
//!
//! `publish` never touches the network. Events go through a bounded queue to
//! a dedicated publisher thread that owns the connection, so handlers running
//! on the async runtime are never blocked by a slow or unreachable Redis.

use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread;
use std::time::Duration;

use redis::Commands;
use thiserror::Error;
use tracing::{debug, warn};

use stagehand_core::OwnerId;
use stagehand_events::{EventBus, JobEventEnvelope, Subscription};

pub const CHANNEL_PREFIX: &str = "stagehand:jobs";

/// Events buffered for the publisher thread before `publish` starts refusing.
pub const PUBLISH_QUEUE_CAPACITY: usize = 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RedisBusError {
    #[error("redis: {0}")]
    Redis(String),

    #[error("serialize: {0}")]
    Serialize(String),

    #[error("publish queue full")]
    Backlog,

    #[error("publisher thread stopped")]
    Closed,
}

/// Per-owner channel name.
pub fn channel_for(owner: OwnerId) -> String {
    format!("{CHANNEL_PREFIX}:{owner}")
}

#[derive(Debug, Clone)]
pub struct RedisPubSubEventBus {
    client: redis::Client,
    outbox: SyncSender<(String, String)>,
}

impl RedisPubSubEventBus {
    /// Open the client and start the publisher thread. No connection is made
    /// until the first event is published.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let (outbox, rx) = mpsc::sync_channel(PUBLISH_QUEUE_CAPACITY);
        let publisher = client.clone();
        thread::Builder::new()
            .name("stagehand-redis-publisher".to_string())
            .spawn(move || publish_loop(publisher, rx))
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        Ok(Self { client, outbox })
    }

    /// Events of a single owner.
    pub fn subscribe_owner(&self, owner: OwnerId) -> Subscription<JobEventEnvelope> {
        self.forward(channel_for(owner), false)
    }

    fn forward(&self, channel: String, pattern: bool) -> Subscription<JobEventEnvelope> {
        let (tx, rx) = mpsc::channel();
        let client = self.client.clone();

        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(err) => {
                    warn!(error = %err, "redis subscribe connection failed");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            let subscribed = if pattern {
                pubsub.psubscribe(&channel)
            } else {
                pubsub.subscribe(&channel)
            };
            if let Err(err) = subscribed {
                warn!(%channel, error = %err, "redis subscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(_) => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let envelope: JobEventEnvelope = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(err) => {
                        debug!(error = %err, "skipping undecodable job event");
                        continue;
                    }
                };

                if tx.send(envelope).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}

impl EventBus<JobEventEnvelope> for RedisPubSubEventBus {
    type Error = RedisBusError;

    fn publish(&self, message: JobEventEnvelope) -> Result<(), Self::Error> {
        let channel = channel_for(message.owner_user_id());
        let payload = serde_json::to_string(&message)
            .map_err(|e| RedisBusError::Serialize(e.to_string()))?;

        match self.outbox.try_send((channel, payload)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RedisBusError::Backlog),
            Err(TrySendError::Disconnected(_)) => Err(RedisBusError::Closed),
        }
    }

    /// Every owner's events.
    fn subscribe(&self) -> Subscription<JobEventEnvelope> {
        self.forward(format!("{CHANNEL_PREFIX}:*"), true)
    }
}

/// Drain the outbox until every bus handle is dropped. A failed publish
/// drops its event and forces a reconnect on the next one.
fn publish_loop(client: redis::Client, rx: mpsc::Receiver<(String, String)>) {
    let mut conn: Option<redis::Connection> = None;

    for (channel, payload) in rx {
        if conn.is_none() {
            match client.get_connection_with_timeout(CONNECT_TIMEOUT) {
                Ok(c) => conn = Some(c),
                Err(err) => {
                    warn!(%channel, error = %err, "redis unavailable, dropping job event");
                    continue;
                }
            }
        }

        let Some(c) = conn.as_mut() else { continue };
        let published: redis::RedisResult<i64> = c.publish(&channel, payload);
        if let Err(err) = published {
            warn!(%channel, error = %err, "redis publish failed, dropping job event");
            conn = None;
        }
    }

    debug!("redis publisher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_are_per_owner() {
        let owner = OwnerId::new();
        let channel = channel_for(owner);
        assert!(channel.starts_with("stagehand:jobs:"));
        assert!(channel.ends_with(&owner.to_string()));
    }

    #[test]
    fn rejects_malformed_url() {
        assert!(RedisPubSubEventBus::new("not a url").is_err());
    }

    #[test]
    fn publish_does_not_wait_for_an_unreachable_server() {
        let bus = RedisPubSubEventBus::new("redis://127.0.0.1:1").unwrap();
        let owner = OwnerId::new();
        let job = stagehand_core::NewJob::new(owner, "material_set", None, "ingest_chunks")
            .into_job(stagehand_core::JobId::new(), chrono::Utc::now())
            .unwrap();
        let envelope = JobEventEnvelope::for_job(
            &job,
            chrono::Utc::now(),
            stagehand_events::JobEvent::Canceled {
                reason: "user".to_string(),
            },
        );

        let started = std::time::Instant::now();
        for _ in 0..10 {
            bus.publish(envelope.clone()).unwrap();
        }
        assert!(started.elapsed() < CONNECT_TIMEOUT);
    }
}
