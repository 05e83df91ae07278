//! Client-side room session.
//!
//! A [`RoomController`] owns one user's live view of one room: the timeline
//! with optimistic sends reconciled against channel echoes, the typing and
//! presence surface, catch-up after channel gaps, and a bounded reconnect
//! loop that ends in an explicit offline state instead of retrying forever.
//!
//! The controller is single-owner and driven from one task: mutate it through
//! `&mut self` calls and poll [`RoomController::next_update`] in a loop for
//! everything that happens on its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelHub, ChannelSignal, RoomEvent, Subscription};
use crate::config::{ChatConfig, ReconnectSection};
use crate::error::{ChatError, ChatResult};
use crate::messages::{ChatMessage, MessageLog};
use crate::presence::{PresenceEntry, PresenceTracker};
use crate::rooms::{MembershipGate, Room};
use crate::{now_ms, Chat, Session};

// ---------------------------------------------------------------------------
// View state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    Loading,
    Ready,
    Sending,
    /// Last send failed; the banner text is in `last_error`. Still live.
    Error,
    /// Channel gone, reconnect not yet started.
    Disconnected,
    Reconnecting,
    /// Reconnect budget exhausted. Terminal until the view is reopened.
    Offline,
    Closed,
}

/// One row of the room view's message list.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    /// Authoritative: persisted and sequenced, seen via echo or a page.
    Confirmed(ChatMessage),
    /// Optimistic local send awaiting its echo.
    Pending { local_id: u64, content: String, sent_at: u64 },
    /// No echo within the confirmation window. Kept visible; resending is
    /// the user's call, never automatic.
    Unconfirmed { local_id: u64, content: String, sent_at: u64 },
    /// The send itself failed. `reason` is the user-facing error text.
    Failed { local_id: u64, content: String, reason: String },
}

impl TimelineEntry {
    pub fn content(&self) -> &str {
        match self {
            TimelineEntry::Confirmed(m) => &m.content,
            TimelineEntry::Pending { content, .. }
            | TimelineEntry::Unconfirmed { content, .. }
            | TimelineEntry::Failed { content, .. } => content,
        }
    }

    pub fn local_id(&self) -> Option<u64> {
        match self {
            TimelineEntry::Confirmed(_) => None,
            TimelineEntry::Pending { local_id, .. }
            | TimelineEntry::Unconfirmed { local_id, .. }
            | TimelineEntry::Failed { local_id, .. } => Some(*local_id),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, TimelineEntry::Confirmed(_))
    }
}

/// What a [`RoomController::next_update`] call resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerUpdate {
    /// A live room event was applied to the view.
    Event(RoomEvent),
    /// A pending send passed its confirmation window; the entry is now
    /// unconfirmed and waits on a manual resend.
    PendingExpired { local_id: u64 },
    /// One or more typing indicators decayed.
    TypingDecayed,
    /// The channel dropped `missed` events; the tail was refetched and
    /// `fetched` messages merged.
    Resynced { missed: u64, fetched: usize },
    /// The channel went away. Reconnection starts on the next poll.
    Disconnected,
    /// Resubscribed after `attempt` tries, merging `fetched` missed messages.
    Reconnected { attempt: u32, fetched: usize },
    /// Retry budget exhausted. The view stays offline until reopened.
    Offline,
    /// `close` was called.
    Closed,
}

/// A claim check for an older-history fetch. It pins the view generation
/// that issued it, so a page landing after `close` or a reconnect reset is
/// discarded instead of mutating a stale view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTicket {
    generation: u64,
    before_id: Option<Uuid>,
    limit: usize,
}

impl PageTicket {
    pub fn before_id(&self) -> Option<Uuid> {
        self.before_id
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// The slice of [`ChatConfig`] the controller needs.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub page_size: usize,
    pub confirm_timeout_ms: u64,
    pub typing_ttl_ms: u64,
    pub reconnect: ReconnectSection,
}

impl ControllerConfig {
    pub fn from_config(config: &ChatConfig) -> Self {
        Self {
            page_size: config.chat.page_size,
            confirm_timeout_ms: config.send.confirm_timeout_ms,
            typing_ttl_ms: config.realtime.typing_ttl_ms,
            reconnect: config.reconnect.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct TypingPeer {
    display_name: String,
    expires_at: Instant,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RoomController {
    room: Room,
    session: Session,
    log: Arc<MessageLog>,
    hub: Arc<ChannelHub>,
    presence: Arc<PresenceTracker>,
    cfg: ControllerConfig,
    conn_id: Uuid,
    sub: Option<Subscription>,
    phase: RoomPhase,
    reconnect_attempt: u32,
    generation: u64,
    timeline: Vec<TimelineEntry>,
    pending_deadlines: HashMap<u64, Instant>,
    next_local_id: u64,
    compose: String,
    last_typing_sent: Option<Instant>,
    typing: HashMap<Uuid, TypingPeer>,
    pinned: bool,
    unread: usize,
    last_error: Option<String>,
}

impl RoomController {
    /// Attach to a room: check access, enter public rooms implicitly,
    /// subscribe, then load the newest page. Subscribing strictly before the
    /// fetch means nothing can fall between snapshot and stream.
    pub fn open(chat: &Chat, session: Session, room_id: Uuid) -> ChatResult<Self> {
        Self::attach(
            chat.gate.clone(),
            chat.log.clone(),
            chat.hub.clone(),
            chat.presence.clone(),
            ControllerConfig::from_config(&chat.config),
            session,
            room_id,
        )
    }

    /// Like [`RoomController::open`] with explicit parts and tuning, which
    /// is also how tests shrink the windows.
    pub fn attach(
        gate: Arc<MembershipGate>,
        log: Arc<MessageLog>,
        hub: Arc<ChannelHub>,
        presence: Arc<PresenceTracker>,
        cfg: ControllerConfig,
        session: Session,
        room_id: Uuid,
    ) -> ChatResult<Self> {
        let room = gate.room(room_id)?;
        if !gate.can_read(&session, &room)? {
            return Err(ChatError::Forbidden);
        }
        if room.is_public() {
            gate.enter_public(&session, room.id)?;
        }

        let mut view = Self {
            room,
            session,
            log,
            hub,
            presence,
            cfg,
            conn_id: Uuid::new_v4(),
            sub: None,
            phase: RoomPhase::Loading,
            reconnect_attempt: 0,
            generation: 0,
            timeline: Vec::new(),
            pending_deadlines: HashMap::new(),
            next_local_id: 1,
            compose: String::new(),
            last_typing_sent: None,
            typing: HashMap::new(),
            pinned: true,
            unread: 0,
            last_error: None,
        };
        view.sub = Some(view.hub.subscribe(room_id)?);
        let recent = view.log.page(room_id, None, view.cfg.page_size)?;
        view.timeline = recent.into_iter().map(TimelineEntry::Confirmed).collect();
        view.presence.connect(room_id, view.conn_id, &view.session);
        view.phase = RoomPhase::Ready;
        info!(room_id = %room_id, user_id = %view.session.user_id, "room view ready");
        Ok(view)
    }

    // -- sending ------------------------------------------------------------

    /// Optimistically append and persist. Returns the local id of the new
    /// timeline entry. The entry confirms only when the channel echoes the
    /// message back; the row returned by the log is not enough, because the
    /// echo is what proves fan-out happened.
    pub fn send(&mut self, content: &str) -> ChatResult<u64> {
        if !matches!(self.phase, RoomPhase::Ready | RoomPhase::Error) {
            return Err(ChatError::TransportDisconnected);
        }
        let content = content.trim();
        if content.is_empty() {
            // Nothing worth a timeline row; blank sends are a no-op.
            return Err(ChatError::EmptyContent);
        }

        let local_id = self.next_local_id;
        self.next_local_id += 1;
        self.timeline.push(TimelineEntry::Pending {
            local_id,
            content: content.to_string(),
            sent_at: now_ms(),
        });
        self.pending_deadlines.insert(
            local_id,
            Instant::now() + Duration::from_millis(self.cfg.confirm_timeout_ms),
        );

        self.phase = RoomPhase::Sending;
        match self.log.append(&self.session, self.room.id, content) {
            Ok(_) => {
                self.phase = RoomPhase::Ready;
                self.last_error = None;
                self.presence.touch(self.room.id, self.conn_id);
                Ok(local_id)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(room_id = %self.room.id, local_id, error = %reason, "send failed");
                self.phase = RoomPhase::Error;
                self.last_error = Some(reason.clone());
                self.pending_deadlines.remove(&local_id);
                self.fail_entry(local_id, reason);
                Err(e)
            }
        }
    }

    /// Retry an unconfirmed or failed entry as a brand-new send. The old
    /// entry is removed and the content re-enters at the end of the
    /// timeline. Returns the fresh local id, or `None` for an unknown or
    /// already-settled entry.
    pub fn resend(&mut self, local_id: u64) -> ChatResult<Option<u64>> {
        let idx = self.timeline.iter().position(|e| {
            matches!(
                e,
                TimelineEntry::Unconfirmed { local_id: l, .. }
                | TimelineEntry::Failed { local_id: l, .. } if *l == local_id
            )
        });
        let Some(idx) = idx else {
            return Ok(None);
        };
        let entry = self.timeline.remove(idx);
        let content = entry.content().to_string();
        self.send(&content).map(Some)
    }

    fn fail_entry(&mut self, local_id: u64, reason: String) {
        for entry in self.timeline.iter_mut() {
            let TimelineEntry::Pending { local_id: l, content, .. } = entry else {
                continue;
            };
            if *l != local_id {
                continue;
            }
            let content = std::mem::take(content);
            *entry = TimelineEntry::Failed { local_id, content, reason };
            return;
        }
    }

    // -- composing ----------------------------------------------------------

    pub fn compose(&self) -> &str {
        &self.compose
    }

    pub fn set_compose(&mut self, text: impl Into<String>) {
        self.compose = text.into();
    }

    /// Drain the draft, typically straight into [`RoomController::send`].
    pub fn take_compose(&mut self) -> String {
        std::mem::take(&mut self.compose)
    }

    /// Splice an `@name` token onto the draft, padding with a space when the
    /// draft doesn't already end in whitespace. Wired to clicks on roster
    /// names.
    pub fn insert_mention(&mut self, display_name: &str) {
        let name = display_name.trim();
        if name.is_empty() {
            return;
        }
        if !self.compose.is_empty() && !self.compose.ends_with(char::is_whitespace) {
            self.compose.push(' ');
        }
        self.compose.push('@');
        self.compose.push_str(name);
        self.compose.push(' ');
    }

    /// Broadcast a typing pulse, throttled to half the decay window so a
    /// held-down key doesn't flood the room.
    pub fn notify_typing(&mut self) {
        if !matches!(self.phase, RoomPhase::Ready | RoomPhase::Error) {
            return;
        }
        let min_gap = Duration::from_millis(self.cfg.typing_ttl_ms / 2);
        if let Some(last) = self.last_typing_sent {
            if last.elapsed() < min_gap {
                return;
            }
        }
        self.last_typing_sent = Some(Instant::now());
        self.presence.touch(self.room.id, self.conn_id);
        self.hub.publish(
            self.room.id,
            RoomEvent::Typing {
                user_id: self.session.user_id,
                display_name: self.session.display_name.clone(),
            },
        );
    }

    // -- history ------------------------------------------------------------

    /// Claim check for an older-history fetch, for hosts that run the fetch
    /// on another task and merge through [`RoomController::apply_page`].
    pub fn older_page_ticket(&self) -> PageTicket {
        PageTicket {
            generation: self.generation,
            before_id: self.oldest_confirmed_id(),
            limit: self.cfg.page_size,
        }
    }

    /// Fetch and merge one older page inline. Returns how many messages
    /// were added.
    pub fn fetch_older(&mut self) -> ChatResult<usize> {
        if self.phase == RoomPhase::Closed {
            return Err(ChatError::TransportDisconnected);
        }
        let ticket = self.older_page_ticket();
        let rows = self.log.page(self.room.id, ticket.before_id, ticket.limit)?;
        Ok(self.apply_page(ticket, rows))
    }

    /// Merge a fetched history page, provided the ticket is still current.
    /// A stale ticket (the view closed or reset since it was issued) merges
    /// nothing.
    pub fn apply_page(&mut self, ticket: PageTicket, rows: Vec<ChatMessage>) -> usize {
        if ticket.generation != self.generation || self.phase == RoomPhase::Closed {
            debug!(room_id = %self.room.id, "discarding stale history page");
            return 0;
        }
        self.merge_confirmed(rows, false)
    }

    // -- viewport -----------------------------------------------------------

    /// Pinned means the viewport sits at the live edge: arrivals count as
    /// read immediately. Unpinning starts the unread counter.
    pub fn set_pinned(&mut self, pinned: bool) {
        self.pinned = pinned;
        if pinned {
            self.unread = 0;
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn unread(&self) -> usize {
        self.unread
    }

    /// Clear the unread counter without re-pinning.
    pub fn mark_read(&mut self) {
        self.unread = 0;
    }

    // -- views --------------------------------------------------------------

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn phase(&self) -> RoomPhase {
        self.phase
    }

    pub fn timeline(&self) -> &[TimelineEntry] {
        &self.timeline
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn roster(&self) -> Vec<PresenceEntry> {
        self.presence.roster(self.room.id)
    }

    /// Display names currently composing, sorted for stable rendering.
    pub fn typing_peers(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.typing.values().map(|p| p.display_name.clone()).collect();
        names.sort();
        names
    }

    // -- event pump ---------------------------------------------------------

    /// Drive the view. Resolves with the next state change: a live event, a
    /// decay, or a transport transition. Cancel-safe; poll it in a loop.
    pub async fn next_update(&mut self) -> ControllerUpdate {
        loop {
            match self.phase {
                RoomPhase::Closed => return ControllerUpdate::Closed,
                RoomPhase::Offline => return ControllerUpdate::Offline,
                RoomPhase::Disconnected => return self.reconnect().await,
                _ => {}
            }
            let deadline = self.next_deadline();
            let Some(sub) = self.sub.as_mut() else {
                self.phase = RoomPhase::Disconnected;
                continue;
            };
            let signal = match deadline {
                Some(at) => tokio::select! {
                    signal = sub.recv() => Some(signal),
                    _ = sleep_until(at) => None,
                },
                None => Some(sub.recv().await),
            };
            match signal {
                Some(ChannelSignal::Event(event)) => {
                    if let Some(update) = self.apply_event(event) {
                        return update;
                    }
                }
                Some(ChannelSignal::Lagged(missed)) => {
                    warn!(room_id = %self.room.id, missed, "channel gap, refetching tail");
                    let fetched = self.catch_up();
                    return ControllerUpdate::Resynced { missed, fetched };
                }
                Some(ChannelSignal::Closed) => {
                    info!(room_id = %self.room.id, "channel closed under the view");
                    self.sub = None;
                    self.phase = RoomPhase::Disconnected;
                    return ControllerUpdate::Disconnected;
                }
                None => {
                    if let Some(update) = self.sweep() {
                        return update;
                    }
                }
            }
        }
    }

    /// Detach from the room. Outstanding page tickets die with the bumped
    /// generation; presence drops immediately.
    pub fn close(&mut self) {
        if self.phase == RoomPhase::Closed {
            return;
        }
        self.generation += 1;
        self.sub = None;
        self.phase = RoomPhase::Closed;
        self.presence.disconnect(self.room.id, self.conn_id);
        debug!(room_id = %self.room.id, "room view closed");
    }

    // -- internals ----------------------------------------------------------

    fn apply_event(&mut self, event: RoomEvent) -> Option<ControllerUpdate> {
        match &event {
            RoomEvent::Message { message } => {
                if self.contains_message(message.id) {
                    return None;
                }
                if message.author_id == self.session.user_id {
                    if !self.reconcile_echo(message) {
                        // Echo for a send this view no longer tracks (other
                        // tab, or the entry was resent meanwhile).
                        self.insert_confirmed(message.clone());
                    }
                } else {
                    self.typing.remove(&message.author_id);
                    if !self.pinned {
                        self.unread += 1;
                    }
                    self.insert_confirmed(message.clone());
                }
                Some(ControllerUpdate::Event(event))
            }
            RoomEvent::Typing { user_id, display_name } => {
                if *user_id == self.session.user_id {
                    return None;
                }
                self.typing.insert(
                    *user_id,
                    TypingPeer {
                        display_name: display_name.clone(),
                        expires_at: Instant::now()
                            + Duration::from_millis(self.cfg.typing_ttl_ms),
                    },
                );
                Some(ControllerUpdate::Event(event))
            }
            RoomEvent::MemberJoined { .. }
            | RoomEvent::PresenceJoined { .. }
            | RoomEvent::PresenceLeft { .. } => Some(ControllerUpdate::Event(event)),
        }
    }

    /// Bounded backoff resubscribe: immediate first try, doubling capped
    /// delays between the rest, offline when the budget runs out.
    async fn reconnect(&mut self) -> ControllerUpdate {
        let policy = self.cfg.reconnect.clone();
        let mut delay = Duration::from_millis(policy.initial_delay_ms);
        for attempt in 1..=policy.max_attempts {
            self.phase = RoomPhase::Reconnecting;
            self.reconnect_attempt = attempt;
            match self.hub.subscribe(self.room.id) {
                Ok(sub) => {
                    self.sub = Some(sub);
                    self.generation += 1;
                    let fetched = self.catch_up();
                    self.phase = RoomPhase::Ready;
                    self.reconnect_attempt = 0;
                    info!(room_id = %self.room.id, attempt, fetched, "channel resubscribed");
                    return ControllerUpdate::Reconnected { attempt, fetched };
                }
                Err(e) => {
                    warn!(room_id = %self.room.id, attempt, error = %e, "resubscribe failed");
                    if attempt < policy.max_attempts {
                        sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_millis(policy.max_delay_ms));
                    }
                }
            }
        }
        warn!(room_id = %self.room.id, "reconnect budget exhausted, view offline");
        self.phase = RoomPhase::Offline;
        ControllerUpdate::Offline
    }

    /// Refetch the newest page and merge. A store failure degrades to a
    /// stale view instead of an error; the next signal retries naturally.
    fn catch_up(&mut self) -> usize {
        match self.log.page(self.room.id, None, self.cfg.page_size) {
            Ok(rows) => self.merge_confirmed(rows, true),
            Err(e) => {
                warn!(room_id = %self.room.id, error = %e, "catch-up fetch failed");
                0
            }
        }
    }

    /// Fold authoritative messages into the timeline: reconcile own echoes,
    /// drop duplicates, keep the confirmed region in sequence order.
    /// Returns how many messages were new.
    fn merge_confirmed(&mut self, batch: Vec<ChatMessage>, count_unread: bool) -> usize {
        let mut added = 0;
        for message in batch {
            if self.contains_message(message.id) {
                continue;
            }
            if message.author_id == self.session.user_id {
                if self.reconcile_echo(&message) {
                    continue;
                }
            } else {
                self.typing.remove(&message.author_id);
                if count_unread && !self.pinned {
                    self.unread += 1;
                }
            }
            self.insert_confirmed(message);
            added += 1;
        }
        added
    }

    fn contains_message(&self, id: Uuid) -> bool {
        self.timeline
            .iter()
            .any(|e| matches!(e, TimelineEntry::Confirmed(m) if m.id == id))
    }

    /// Match an authoritative own message against the oldest compatible
    /// optimistic entry: same content, sent within the confirmation window.
    /// Ids cannot correlate an optimistic entry with its echo, so content
    /// plus recency is the join key. A late echo also settles an entry that
    /// already expired to unconfirmed.
    fn reconcile_echo(&mut self, message: &ChatMessage) -> bool {
        let window = self.cfg.confirm_timeout_ms;
        let position = self.timeline.iter().position(|e| match e {
            TimelineEntry::Pending { content, sent_at, .. }
            | TimelineEntry::Unconfirmed { content, sent_at, .. } => {
                *content == message.content && message.created_at.abs_diff(*sent_at) <= window
            }
            _ => false,
        });
        let Some(idx) = position else {
            return false;
        };
        if let Some(local_id) = self.timeline[idx].local_id() {
            self.pending_deadlines.remove(&local_id);
        }
        self.timeline[idx] = TimelineEntry::Confirmed(message.clone());
        true
    }

    /// Place a confirmed message so the confirmed region stays in sequence
    /// order, ahead of any optimistic entries.
    fn insert_confirmed(&mut self, message: ChatMessage) {
        let position = self.timeline.iter().position(|e| match e {
            TimelineEntry::Confirmed(m) => m.seq > message.seq,
            _ => true,
        });
        let entry = TimelineEntry::Confirmed(message);
        match position {
            Some(idx) => self.timeline.insert(idx, entry),
            None => self.timeline.push(entry),
        }
    }

    fn oldest_confirmed_id(&self) -> Option<Uuid> {
        self.timeline.iter().find_map(|e| match e {
            TimelineEntry::Confirmed(m) => Some(m.id),
            _ => None,
        })
    }

    fn next_deadline(&self) -> Option<Instant> {
        let pending = self.pending_deadlines.values().min().copied();
        let typing = self.typing.values().map(|p| p.expires_at).min();
        match (pending, typing) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Expire at most one thing per call so every transition surfaces as
    /// its own update.
    fn sweep(&mut self) -> Option<ControllerUpdate> {
        let now = Instant::now();
        let expired = self
            .pending_deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .min();
        if let Some(local_id) = expired {
            self.pending_deadlines.remove(&local_id);
            for entry in self.timeline.iter_mut() {
                let TimelineEntry::Pending { local_id: l, content, sent_at } = entry else {
                    continue;
                };
                if *l != local_id {
                    continue;
                }
                warn!(room_id = %self.room.id, local_id, "send unconfirmed after timeout");
                let content = std::mem::take(content);
                let sent_at = *sent_at;
                *entry = TimelineEntry::Unconfirmed { local_id, content, sent_at };
                break;
            }
            return Some(ControllerUpdate::PendingExpired { local_id });
        }
        let before = self.typing.len();
        self.typing.retain(|_, p| p.expires_at > now);
        if self.typing.len() < before {
            return Some(ControllerUpdate::TypingDecayed);
        }
        None
    }
}

impl Drop for RoomController {
    fn drop(&mut self) {
        self.close();
    }
}
