//! Cross-process event relay over Redis pub/sub.
//!
//! Each process exports its locally-originated room events to
//! `salon:rooms:<room id>` and imports what other processes publish there.
//! Imports go through [`ChannelHub::publish_remote`] so they are never
//! re-exported, and the origin tag drops the copy Redis loops back to the
//! publishing process itself.

use std::sync::Arc;

use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelHub, RoomEvent};
use crate::error::ChatResult;

const PATTERN: &str = "salon:rooms:*";

fn channel_name(room_id: Uuid) -> String {
    format!("salon:rooms:{room_id}")
}

#[derive(Debug, Serialize, Deserialize)]
struct RelayEnvelope {
    origin: Uuid,
    room_id: Uuid,
    event: RoomEvent,
}

pub struct RedisRelay {
    client: redis::Client,
    hub: Arc<ChannelHub>,
    origin: Uuid,
}

impl RedisRelay {
    pub fn new(url: &str, hub: Arc<ChannelHub>) -> ChatResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self { client, hub, origin: Uuid::new_v4() })
    }

    /// Pump both directions until the hub closes or Redis goes away.
    pub async fn run(self) -> ChatResult<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(PATTERN).await?;
        let mut inbound = pubsub.into_on_message();
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut outbound = self.hub.firehose();
        info!(origin = %self.origin, pattern = PATTERN, "redis relay running");

        loop {
            tokio::select! {
                msg = inbound.next() => {
                    let Some(msg) = msg else { break };
                    self.ingest(&msg);
                }
                event = outbound.recv() => match event {
                    Ok((room_id, event)) => {
                        let envelope = RelayEnvelope { origin: self.origin, room_id, event };
                        match serde_json::to_string(&envelope) {
                            Ok(payload) => {
                                let sent: redis::RedisResult<()> =
                                    conn.publish(channel_name(room_id), payload).await;
                                if let Err(e) = sent {
                                    warn!(error = %e, "relay publish failed");
                                }
                            }
                            Err(e) => warn!(error = %e, "relay envelope serialization failed"),
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "relay fell behind the local firehose");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        info!(origin = %self.origin, "redis relay stopped");
        Ok(())
    }

    fn ingest(&self, msg: &redis::Msg) {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "relay message with non-text payload");
                return;
            }
        };
        match serde_json::from_str::<RelayEnvelope>(&payload) {
            Ok(envelope) if envelope.origin == self.origin => {}
            Ok(envelope) => {
                self.hub.publish_remote(envelope.room_id, envelope.event);
            }
            Err(e) => debug!(error = %e, "relay message failed to parse"),
        }
    }
}
