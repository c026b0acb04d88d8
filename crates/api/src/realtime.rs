//! Redis-backed realtime profile-change feed
//!
//! One pub/sub channel per identity (`profile.changed.<uuid>`). Messages are
//! payload-free triggers: the resolver always re-reads the store, so an
//! out-of-order or duplicated delivery can never install stale data.

use async_trait::async_trait;
use futures::StreamExt;
use muse_tokens::{ChangeFeed, ProfileWatch, TokenError, TokenResult};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use uuid::Uuid;

fn channel_for(user_id: Uuid) -> String {
    format!("profile.changed.{user_id}")
}

/// Publish a payload-free "profile changed" trigger for an identity.
///
/// Best effort: a publish failure is logged and swallowed. Subscribers fall
/// back to the cache TTL, so a dropped event costs at most a second of
/// staleness, never correctness.
pub async fn publish_profile_changed(conn: &ConnectionManager, user_id: Uuid) {
    let mut conn = conn.clone();
    let result: Result<i64, redis::RedisError> = conn.publish(channel_for(user_id), "").await;
    if let Err(err) = result {
        tracing::warn!(user_id = %user_id, error = %err, "Failed to publish profile change");
    }
}

/// Redis pub/sub implementation of the resolver's change feed.
pub struct RedisChangeFeed {
    client: redis::Client,
}

impl RedisChangeFeed {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChangeFeed for RedisChangeFeed {
    async fn watch(&self, user_id: Uuid) -> TokenResult<ProfileWatch> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| TokenError::Feed(e.to_string()))?;
        pubsub
            .subscribe(channel_for(user_id))
            .await
            .map_err(|e| TokenError::Feed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    message = messages.next() => {
                        if message.is_none() {
                            tracing::warn!(user_id = %user_id, "Redis pub/sub stream ended");
                            break;
                        }
                        // Payload is ignored; the event itself is the signal
                        if tx.send(()).await.is_err() {
                            break;
                        }
                    }
                    // Receiver dropped; tear down the Redis subscription
                    _ = tx.closed() => break,
                }
            }
        });

        Ok(ProfileWatch { events: rx })
    }
}
