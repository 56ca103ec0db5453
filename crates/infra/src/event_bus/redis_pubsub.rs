//! Redis pub/sub transport for [`StreamChanged`] notifications.
//!
//! Pub/sub is fire-and-forget: subscribers that are offline miss messages.
//! That is acceptable for change notifications, since readers always catch
//! up from the log itself.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use thiserror::Error;

use streamlog_events::{EventBus, StreamChanged, Subscription};

pub const DEFAULT_CHANNEL: &str = "streamlog.changes";

#[derive(Debug, Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("notification encoding failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct RedisPubSubEventBus {
    client: redis::Client,
    channel: String,
}

impl RedisPubSubEventBus {
    pub fn new(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())?;
        Ok(Self {
            client,
            channel: channel.into(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl EventBus<StreamChanged> for RedisPubSubEventBus {
    type Error = RedisBusError;

    fn publish(&self, message: StreamChanged) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&message)?;
        let mut conn = self.client.get_connection()?;
        let _: i64 = conn.publish(&self.channel, payload)?;
        Ok(())
    }

    fn subscribe(&self) -> Subscription<StreamChanged> {
        let (tx, rx) = mpsc::channel();

        let client = self.client.clone();
        let channel = self.channel.clone();

        // Forwards until the subscription is dropped or the connection dies.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(error = %err, "redis subscription could not connect");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(err) = pubsub.subscribe(&channel) {
                tracing::warn!(channel = %channel, error = %err, "redis subscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(err) => {
                        tracing::warn!(channel = %channel, error = %err, "redis subscription ended");
                        return;
                    }
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let changed: StreamChanged = match serde_json::from_str(&payload) {
                    Ok(c) => c,
                    Err(err) => {
                        tracing::debug!(error = %err, "ignoring malformed notification");
                        continue;
                    }
                };

                if tx.send(changed).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}
