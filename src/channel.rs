//! Per-room realtime fan-out.
//!
//! One bounded tokio broadcast channel per room, created on first use and
//! dropped once the last subscriber detaches. Delivery is at-most-once with
//! in-order best effort: a receiver that falls behind the ring capacity sees
//! [`ChannelSignal::Lagged`] in place of the missed events and is expected to
//! reconcile through the message log. That recovery belongs to the room
//! controller, not to the hub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::messages::ChatMessage;

/// Everything that can happen in a room, as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    /// A message cleared the log and is now authoritative.
    Message { message: ChatMessage },
    /// A membership row was created (first join, not reconnects).
    MemberJoined {
        room_id: Uuid,
        user_id: Uuid,
        display_name: String,
        joined_at: u64,
    },
    /// First live connection for this user appeared in the room.
    PresenceJoined { user_id: Uuid, display_name: String },
    /// Last live connection for this user left the room.
    PresenceLeft { user_id: Uuid },
    /// The user is composing. Decays client-side; never persisted.
    Typing { user_id: Uuid, display_name: String },
}

/// What a subscriber's `recv` resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    Event(RoomEvent),
    /// The receiver fell behind and `missed` events were discarded. The
    /// stream continues from the oldest retained event.
    Lagged(u64),
    /// The hub shut down; no further events will arrive.
    Closed,
}

#[derive(Debug)]
pub struct ChannelHub {
    rooms: Mutex<HashMap<Uuid, broadcast::Sender<RoomEvent>>>,
    firehose: broadcast::Sender<(Uuid, RoomEvent)>,
    capacity: usize,
    closed: AtomicBool,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (firehose, _) = broadcast::channel(capacity);
        Self {
            rooms: Mutex::new(HashMap::new()),
            firehose,
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    fn rooms(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, broadcast::Sender<RoomEvent>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach to a room's event stream. The channel is created on first use.
    pub fn subscribe(&self, room_id: Uuid) -> ChatResult<Subscription> {
        if self.is_closed() {
            return Err(ChatError::TransportDisconnected);
        }
        let mut rooms = self.rooms();
        let tx = rooms
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(Subscription {
            room_id,
            rx: tx.subscribe(),
        })
    }

    /// Fan an event out to the room's subscribers. Returns how many
    /// subscribers received it; zero subscribers is not an error.
    pub fn publish(&self, room_id: Uuid, event: RoomEvent) -> usize {
        self.publish_inner(room_id, event, true)
    }

    /// Publish an event that arrived from another process. Skips the
    /// firehose so a relay never re-exports what it just imported.
    pub fn publish_remote(&self, room_id: Uuid, event: RoomEvent) -> usize {
        self.publish_inner(room_id, event, false)
    }

    fn publish_inner(&self, room_id: Uuid, event: RoomEvent, export: bool) -> usize {
        if self.is_closed() {
            return 0;
        }
        if export {
            let _ = self.firehose.send((room_id, event.clone()));
        }
        let mut rooms = self.rooms();
        match rooms.get(&room_id) {
            Some(tx) => match tx.send(event) {
                Ok(n) => n,
                Err(_) => {
                    // Last subscriber is gone; reclaim the channel.
                    rooms.remove(&room_id);
                    0
                }
            },
            None => 0,
        }
    }

    /// Cross-room tap over everything published locally.
    pub fn firehose(&self) -> broadcast::Receiver<(Uuid, RoomEvent)> {
        self.firehose.subscribe()
    }

    /// Tear down one room's channel, forcing its subscribers through their
    /// resubscribe path. Returns how many subscribers were cut loose.
    pub fn reset_room(&self, room_id: Uuid) -> usize {
        self.rooms()
            .remove(&room_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self, room_id: Uuid) -> usize {
        self.rooms()
            .get(&room_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop every room channel. Live subscribers see `Closed`, future
    /// subscriptions fail with a transport error.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.rooms().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A live attachment to one room's event stream. Dropping it detaches.
#[derive(Debug)]
pub struct Subscription {
    room_id: Uuid,
    rx: broadcast::Receiver<RoomEvent>,
}

impl Subscription {
    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    /// Wait for the next signal. Never returns an error: lag and shutdown
    /// are ordinary signals the caller must handle.
    pub async fn recv(&mut self) -> ChannelSignal {
        match self.rx.recv().await {
            Ok(event) => ChannelSignal::Event(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => ChannelSignal::Lagged(missed),
            Err(broadcast::error::RecvError::Closed) => ChannelSignal::Closed,
        }
    }

    /// Non-blocking poll, mostly useful for draining in tests.
    pub fn try_next(&mut self) -> Option<ChannelSignal> {
        use tokio::sync::broadcast::error::TryRecvError;
        match self.rx.try_recv() {
            Ok(event) => Some(ChannelSignal::Event(event)),
            Err(TryRecvError::Lagged(missed)) => Some(ChannelSignal::Lagged(missed)),
            Err(TryRecvError::Closed) => Some(ChannelSignal::Closed),
            Err(TryRecvError::Empty) => None,
        }
    }

    /// Consume the subscription as a stream. The stream ends on shutdown;
    /// lag appears inline like any other signal.
    pub fn into_stream(self) -> impl Stream<Item = ChannelSignal> {
        BroadcastStream::new(self.rx).map(|item| match item {
            Ok(event) => ChannelSignal::Event(event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => ChannelSignal::Lagged(missed),
        })
    }

    /// Explicit detach. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}
