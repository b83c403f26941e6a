use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

use shared::{
    domain::{ConversationKey, MessageId, PeerId},
    protocol::{BroadcastFrame, ChangeFeedEvent, ChannelStatus, MessageRecord, PresenceMember},
};
use storage::DeviceStore;

pub mod error;
pub mod presence;
pub mod rest;
pub mod store;

pub use error::SyncError;
pub use presence::{PresenceTracker, PresenceView};
pub use store::{
    day_groups, DeliveryMarker, DeliveryState, MessageStore, StoredMessage, TimelineEntry,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
/// Minimum gap between outgoing typing broadcasts while composing.
const TYPING_REBROADCAST_MIN_INTERVAL: Duration = Duration::from_secs(1);
/// Idle time after the last keystroke before a stop-typing broadcast.
const LOCAL_TYPING_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Engine tunables. Defaults match observed UI expectations; the send
/// watchdog is off by default, so a durable write that never completes
/// leaves its message in `Sending` indefinitely.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Remote typing indicator expiry after the last typing signal.
    pub typing_expiry: Duration,
    /// How long a reconnect may take before the connecting indicator is
    /// shown. Suppresses flicker on routine reconnect churn.
    pub connecting_grace: Duration,
    /// Optional deadline after which a message still in `Sending` is
    /// flipped to `Error`.
    pub sending_timeout: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            typing_expiry: Duration::from_secs(3),
            connecting_grace: Duration::from_secs(1),
            sending_timeout: None,
        }
    }
}

/// Conversation-level synchronization status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Connecting,
    Synced,
    Error,
}

/// Everything the subscribed room delivers: advisory broadcast frames,
/// authoritative change-feed rows, full presence snapshots, and the
/// channel's own lifecycle.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    Broadcast(BroadcastFrame),
    ChangeFeed(ChangeFeedEvent),
    PresenceSync(Vec<PresenceMember>),
    Status(ChannelStatus),
}

/// Events emitted to the embedding UI.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TimelineUpdated(Vec<TimelineEntry>),
    PresenceChanged(PresenceView),
    SyncStatusChanged(SyncStatus),
    /// Diagnostic failures, prefixed `category=<tag>` (see [`SyncError`]).
    Error(String),
}

/// Authoritative persistence for conversation history.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Full conversation fetch, ordered by creation time.
    async fn fetch_conversation(&self, conversation: &ConversationKey)
        -> Result<Vec<MessageRecord>>;
    /// Durable insert; returns the canonical record as stored.
    async fn insert_message(&self, record: &MessageRecord) -> Result<MessageRecord>;
    /// Marks everything from `sender` to `reader` as read.
    async fn update_read_flag(&self, reader: &PeerId, sender: &PeerId) -> Result<()>;
    async fn delete_message(&self, id: &MessageId) -> Result<()>;
}

pub struct MissingDurableStore;

#[async_trait]
impl DurableStore for MissingDurableStore {
    async fn fetch_conversation(
        &self,
        _conversation: &ConversationKey,
    ) -> Result<Vec<MessageRecord>> {
        Err(anyhow!("durable store is unavailable"))
    }

    async fn insert_message(&self, record: &MessageRecord) -> Result<MessageRecord> {
        Err(anyhow!("durable store is unavailable for message {}", record.id))
    }

    async fn update_read_flag(&self, _reader: &PeerId, _sender: &PeerId) -> Result<()> {
        Err(anyhow!("durable store is unavailable"))
    }

    async fn delete_message(&self, id: &MessageId) -> Result<()> {
        Err(anyhow!("durable store is unavailable for message {id}"))
    }
}

/// One subscribed room combining the broadcast, change-feed, and presence
/// streams for a single conversation. The engine owns the handle
/// exclusively; nothing else ever sees the raw channel.
#[async_trait]
pub trait RoomSession: Send + Sync {
    /// Publish on the broadcast stream. `Ok` means the channel
    /// acknowledged the send, not that the peer received it.
    async fn publish(&self, frame: BroadcastFrame) -> Result<()>;
    /// Announce local presence to the room.
    async fn track(&self, member: PresenceMember) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<RoomEvent>;
    async fn leave(&self) -> Result<()>;
}

#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn open(&self, room_key: &str) -> Result<Arc<dyn RoomSession>>;
}

pub struct MissingTransport;

#[async_trait]
impl SyncTransport for MissingTransport {
    async fn open(&self, room_key: &str) -> Result<Arc<dyn RoomSession>> {
        Err(anyhow!("sync transport is unavailable for room {room_key}"))
    }
}

/// Media bytes go out, a public reference URL comes back. Only the URL
/// ever enters a message payload.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, filename: &str) -> Result<String>;
}

pub struct MissingMediaStore;

#[async_trait]
impl MediaStore for MissingMediaStore {
    async fn upload(&self, _bytes: Vec<u8>, filename: &str) -> Result<String> {
        Err(anyhow!("media store is unavailable for upload {filename}"))
    }
}

/// Per-device persistence for the hidden-message overlay and the cached
/// peer-activity timestamps.
#[async_trait]
pub trait OverlayStore: Send + Sync {
    async fn load_hidden(&self, owner: &PeerId) -> Result<HashSet<MessageId>>;
    async fn record_hidden(&self, owner: &PeerId, ids: &[MessageId]) -> Result<()>;
    async fn last_seen(&self, owner: &PeerId, peer: &PeerId) -> Result<Option<DateTime<Utc>>>;
    async fn record_last_seen(&self, owner: &PeerId, peer: &PeerId, at: DateTime<Utc>)
        -> Result<()>;
}

#[async_trait]
impl OverlayStore for DeviceStore {
    async fn load_hidden(&self, owner: &PeerId) -> Result<HashSet<MessageId>> {
        self.hidden_ids(owner).await
    }

    async fn record_hidden(&self, owner: &PeerId, ids: &[MessageId]) -> Result<()> {
        DeviceStore::record_hidden(self, owner, ids).await
    }

    async fn last_seen(&self, owner: &PeerId, peer: &PeerId) -> Result<Option<DateTime<Utc>>> {
        DeviceStore::last_seen(self, owner, peer).await
    }

    async fn record_last_seen(
        &self,
        owner: &PeerId,
        peer: &PeerId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        DeviceStore::record_last_seen(self, owner, peer, at).await
    }
}

/// Ephemeral overlay for tests and sessions without device persistence.
#[derive(Default)]
pub struct MemoryOverlay {
    hidden: Mutex<HashMap<PeerId, HashSet<MessageId>>>,
    activity: Mutex<HashMap<(PeerId, PeerId), DateTime<Utc>>>,
}

#[async_trait]
impl OverlayStore for MemoryOverlay {
    async fn load_hidden(&self, owner: &PeerId) -> Result<HashSet<MessageId>> {
        Ok(self
            .hidden
            .lock()
            .await
            .get(owner)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_hidden(&self, owner: &PeerId, ids: &[MessageId]) -> Result<()> {
        let mut hidden = self.hidden.lock().await;
        hidden
            .entry(owner.clone())
            .or_default()
            .extend(ids.iter().cloned());
        Ok(())
    }

    async fn last_seen(&self, owner: &PeerId, peer: &PeerId) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .activity
            .lock()
            .await
            .get(&(owner.clone(), peer.clone()))
            .copied())
    }

    async fn record_last_seen(
        &self,
        owner: &PeerId,
        peer: &PeerId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut activity = self.activity.lock().await;
        let entry = activity.entry((owner.clone(), peer.clone())).or_insert(at);
        if at > *entry {
            *entry = at;
        }
        Ok(())
    }
}

/// The synchronization engine for one two-party conversation.
///
/// Merges three partially-overlapping event sources into one consistent
/// timeline: optimistic local writes, the advisory broadcast room, and
/// the authoritative change feed. All mutation funnels through the
/// message store's idempotent upsert, which is what makes arbitrary
/// interleaving of channel completions safe.
pub struct SyncEngine {
    conversation: ConversationKey,
    config: SyncConfig,
    durable: Arc<dyn DurableStore>,
    transport: Arc<dyn SyncTransport>,
    media: Arc<dyn MediaStore>,
    overlay: Arc<dyn OverlayStore>,
    inner: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
    /// Bumped on `close`. Async completions capture the generation they
    /// started under and discard themselves if it moved.
    generation: AtomicU64,
}

struct EngineState {
    messages: MessageStore,
    hidden: HashSet<MessageId>,
    presence: PresenceTracker,
    status: SyncStatus,
    session: Option<Arc<dyn RoomSession>>,
    pump_task: Option<JoinHandle<()>>,
    typing_expiry_task: Option<JoinHandle<()>>,
    local_typing_task: Option<JoinHandle<()>>,
    connecting_probe: Option<JoinHandle<()>>,
    last_local_typing_sent: Option<Instant>,
    /// Set when a read sweep ran without a live session; the receipt goes
    /// out on the next subscribe.
    pending_read_receipt: bool,
}

impl SyncEngine {
    pub fn new(conversation: ConversationKey, config: SyncConfig) -> Arc<Self> {
        Self::new_with_dependencies(
            conversation,
            config,
            Arc::new(MissingDurableStore),
            Arc::new(MissingTransport),
            Arc::new(MissingMediaStore),
            Arc::new(MemoryOverlay::default()),
        )
    }

    pub fn new_with_dependencies(
        conversation: ConversationKey,
        config: SyncConfig,
        durable: Arc<dyn DurableStore>,
        transport: Arc<dyn SyncTransport>,
        media: Arc<dyn MediaStore>,
        overlay: Arc<dyn OverlayStore>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let remote = conversation.remote().clone();
        Arc::new(Self {
            conversation,
            config,
            durable,
            transport,
            media,
            overlay,
            inner: Mutex::new(EngineState {
                messages: MessageStore::default(),
                hidden: HashSet::new(),
                presence: PresenceTracker::new(remote, None),
                status: SyncStatus::Connecting,
                session: None,
                pump_task: None,
                typing_expiry_task: None,
                local_typing_task: None,
                connecting_probe: None,
                last_local_typing_sent: None,
                pending_read_receipt: false,
            }),
            events,
            generation: AtomicU64::new(0),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn conversation(&self) -> &ConversationKey {
        &self.conversation
    }

    pub async fn timeline(&self) -> Vec<TimelineEntry> {
        let inner = self.inner.lock().await;
        inner
            .messages
            .visible(&inner.hidden, inner.presence.is_online())
    }

    pub async fn presence(&self) -> PresenceView {
        self.inner.lock().await.presence.view()
    }

    pub async fn status(&self) -> SyncStatus {
        self.inner.lock().await.status
    }

    /// Brings the engine up: loads the device overlay, runs the initial
    /// authoritative fetch, then opens the room. A fetch or subscribe
    /// failure is surfaced as a status/diagnostic event, never as a
    /// panic; `notify_resume` retries both.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let gen = self.generation();
        let local = self.conversation.local().clone();
        let remote = self.conversation.remote().clone();

        let _ = self
            .events
            .send(EngineEvent::SyncStatusChanged(SyncStatus::Connecting));

        match self.overlay.load_hidden(&local).await {
            Ok(hidden) => {
                let mut inner = self.inner.lock().await;
                inner.hidden = hidden;
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to load hidden-message overlay; starting with none");
            }
        }

        match self.overlay.last_seen(&local, &remote).await {
            Ok(Some(at)) => {
                let mut inner = self.inner.lock().await;
                inner.presence.note_activity(at);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to load cached peer activity");
            }
        }

        self.resync(gen).await;
        self.open_room(gen).await;
        Ok(())
    }

    /// The application regained visibility or focus. Mobile platforms
    /// freeze timers and suspend connections silently, so resume always
    /// re-fetches and re-announces presence without waiting for a
    /// stream-level signal.
    pub async fn notify_resume(self: &Arc<Self>) {
        let gen = self.generation();
        info!("resume detected; forcing authoritative resync");
        self.resync(gen).await;
        let has_session = { self.inner.lock().await.session.is_some() };
        if has_session {
            self.announce_presence().await;
        } else {
            self.open_room(gen).await;
        }
    }

    pub async fn send_text(self: &Arc<Self>, text: &str) -> Result<MessageId> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("refusing to send an empty message"));
        }
        self.dispatch_outbound(Some(trimmed.to_string()), None, None)
            .await
    }

    pub async fn send_image(self: &Arc<Self>, bytes: Vec<u8>, filename: &str) -> Result<MessageId> {
        let url = self
            .media
            .upload(bytes, filename)
            .await
            .context("image upload failed")?;
        self.dispatch_outbound(None, Some(url), None).await
    }

    pub async fn send_audio(self: &Arc<Self>, bytes: Vec<u8>, filename: &str) -> Result<MessageId> {
        let url = self
            .media
            .upload(bytes, filename)
            .await
            .context("audio upload failed")?;
        self.dispatch_outbound(None, None, Some(url)).await
    }

    /// Call on every local keystroke. Broadcasts a typing signal at most
    /// once per [`TYPING_REBROADCAST_MIN_INTERVAL`] and schedules the
    /// stop-typing broadcast after idle.
    pub async fn note_composing(self: &Arc<Self>) {
        let gen = self.generation();
        let session = { self.inner.lock().await.session.clone() };
        let Some(session) = session else {
            return;
        };

        let should_send = {
            let mut inner = self.inner.lock().await;
            match inner.last_local_typing_sent {
                Some(at) if at.elapsed() < TYPING_REBROADCAST_MIN_INTERVAL => false,
                _ => {
                    inner.last_local_typing_sent = Some(Instant::now());
                    true
                }
            }
        };
        if should_send {
            if let Err(err) = session
                .publish(BroadcastFrame::Typing {
                    user: self.conversation.local().clone(),
                })
                .await
            {
                debug!(error = %format!("{err:#}"), "typing broadcast failed");
            }
        }

        let engine = Arc::clone(self);
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.local_typing_task.take() {
            task.abort();
        }
        inner.local_typing_task = Some(tokio::spawn(async move {
            tokio::time::sleep(LOCAL_TYPING_IDLE_TIMEOUT).await;
            if engine.generation() != gen {
                return;
            }
            engine.stop_local_typing().await;
        }));
    }

    /// Hides a message on this device only. The shared store is untouched.
    pub async fn hide_message(&self, id: &MessageId) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.hidden.insert(id.clone()) {
                self.emit_timeline_locked(&inner);
            }
        }
        self.overlay
            .record_hidden(self.conversation.local(), std::slice::from_ref(id))
            .await
            .context("failed to persist hidden-message overlay")
    }

    /// Hides every currently known message on this device.
    pub async fn clear_history(&self) -> Result<()> {
        let ids = {
            let mut inner = self.inner.lock().await;
            let ids = inner.messages.ids();
            let mut changed = false;
            for id in &ids {
                changed |= inner.hidden.insert(id.clone());
            }
            if changed {
                self.emit_timeline_locked(&inner);
            }
            ids
        };
        if ids.is_empty() {
            return Ok(());
        }
        self.overlay
            .record_hidden(self.conversation.local(), &ids)
            .await
            .context("failed to persist hidden-message overlay")
    }

    /// Deletes from the durable store; the change feed propagates the
    /// removal to the other device. The local entry goes immediately.
    pub async fn delete_for_everyone(&self, id: &MessageId) -> Result<()> {
        self.durable
            .delete_message(id)
            .await
            .context("durable delete failed")?;
        let mut inner = self.inner.lock().await;
        if inner.messages.remove(id) {
            self.emit_timeline_locked(&inner);
        }
        Ok(())
    }

    /// Tears the engine down. The generation bump fences every in-flight
    /// completion: anything that finishes after this point discards
    /// itself instead of mutating a closed engine.
    pub async fn close(&self) {
        self.generation.fetch_add(1, AtomicOrdering::SeqCst);
        let session = {
            let mut inner = self.inner.lock().await;
            for task in [
                inner.pump_task.take(),
                inner.typing_expiry_task.take(),
                inner.local_typing_task.take(),
                inner.connecting_probe.take(),
            ]
            .into_iter()
            .flatten()
            {
                task.abort();
            }
            inner.last_local_typing_sent = None;
            inner.session.take()
        };
        if let Some(session) = session {
            let _ = session.leave().await;
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(AtomicOrdering::SeqCst)
    }

    fn emit_error(&self, err: &SyncError) {
        let _ = self
            .events
            .send(EngineEvent::Error(format!("category={} {err}", err.category())));
    }

    fn emit_timeline_locked(&self, inner: &EngineState) {
        let entries = inner
            .messages
            .visible(&inner.hidden, inner.presence.is_online());
        let _ = self.events.send(EngineEvent::TimelineUpdated(entries));
    }

    fn emit_presence_locked(&self, inner: &EngineState) {
        let _ = self
            .events
            .send(EngineEvent::PresenceChanged(inner.presence.view()));
    }

    async fn persist_remote_activity(&self, at: DateTime<Utc>) {
        if let Err(err) = self
            .overlay
            .record_last_seen(self.conversation.local(), self.conversation.remote(), at)
            .await
        {
            warn!(error = %format!("{err:#}"), "failed to persist peer activity");
        }
    }

    async fn open_room(self: &Arc<Self>, gen: u64) {
        let room_key = self.conversation.room_key();
        match self.transport.open(&room_key).await {
            Ok(session) => {
                if self.generation() != gen {
                    let _ = session.leave().await;
                    return;
                }
                let pump = self.spawn_room_pump(Arc::clone(&session), gen);
                let mut inner = self.inner.lock().await;
                if let Some(task) = inner.pump_task.take() {
                    task.abort();
                }
                inner.session = Some(session);
                inner.pump_task = Some(pump);
                info!(room_key = %room_key, "room subscription opened");
            }
            Err(err) => {
                self.emit_error(&SyncError::Channel(format!("room subscribe failed: {err:#}")));
            }
        }
    }

    fn spawn_room_pump(
        self: &Arc<Self>,
        session: Arc<dyn RoomSession>,
        gen: u64,
    ) -> JoinHandle<()> {
        let mut events = BroadcastStream::new(session.subscribe());
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if engine.generation() != gen {
                    break;
                }
                match event {
                    Ok(event) => {
                        if let Err(err) = engine.handle_room_event(event, gen).await {
                            engine.emit_error(&err);
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "room event stream lagged; forcing a full resync");
                        engine.resync(gen).await;
                    }
                }
            }
        })
    }

    async fn handle_room_event(
        self: &Arc<Self>,
        event: RoomEvent,
        gen: u64,
    ) -> std::result::Result<(), SyncError> {
        match event {
            RoomEvent::Broadcast(frame) => self.handle_broadcast(frame, gen).await,
            RoomEvent::ChangeFeed(change) => self.handle_change_feed(change, gen).await,
            RoomEvent::PresenceSync(members) => {
                self.handle_presence_sync(members).await;
                Ok(())
            }
            RoomEvent::Status(status) => {
                self.handle_status(status, gen).await;
                Ok(())
            }
        }
    }

    async fn handle_broadcast(
        self: &Arc<Self>,
        frame: BroadcastFrame,
        gen: u64,
    ) -> std::result::Result<(), SyncError> {
        match frame {
            BroadcastFrame::Msg { message } => {
                if !message.has_usable_id() {
                    return Err(SyncError::MalformedEvent(
                        "broadcast message without a usable id".into(),
                    ));
                }
                let message = message.normalized();
                if !self
                    .conversation
                    .involves_pair(&message.sender, &message.receiver)
                {
                    debug!(message_id = %message.id, "discarding broadcast for a foreign identity pair");
                    return Ok(());
                }
                let from_remote = message.sender == *self.conversation.remote();
                let now = Utc::now();
                {
                    let mut inner = self.inner.lock().await;
                    let changed = inner.messages.upsert(message, None, DeliveryState::Sent);
                    // a delivered message supersedes any live typing indicator
                    let typing_cleared = inner.presence.set_typing(false);
                    if typing_cleared {
                        if let Some(task) = inner.typing_expiry_task.take() {
                            task.abort();
                        }
                    }
                    let activity = from_remote && inner.presence.note_activity(now);
                    if changed {
                        self.emit_timeline_locked(&inner);
                    }
                    if typing_cleared || activity {
                        self.emit_presence_locked(&inner);
                    }
                }
                if from_remote {
                    self.persist_remote_activity(now).await;
                }
                Ok(())
            }
            BroadcastFrame::Typing { user } => {
                if user.normalized() == *self.conversation.remote() {
                    self.note_remote_typing(gen).await;
                }
                Ok(())
            }
            BroadcastFrame::StopTyping { user } => {
                if user.normalized() == *self.conversation.remote() {
                    let mut inner = self.inner.lock().await;
                    if let Some(task) = inner.typing_expiry_task.take() {
                        task.abort();
                    }
                    if inner.presence.set_typing(false) {
                        self.emit_presence_locked(&inner);
                    }
                }
                Ok(())
            }
            BroadcastFrame::ReadReceipt { reader } => {
                if reader.normalized() != *self.conversation.remote() {
                    return Ok(());
                }
                let now = Utc::now();
                {
                    let mut inner = self.inner.lock().await;
                    let changed = inner.messages.mark_read_from(self.conversation.local());
                    let activity = inner.presence.note_activity(now);
                    if changed {
                        self.emit_timeline_locked(&inner);
                    }
                    if activity {
                        self.emit_presence_locked(&inner);
                    }
                }
                self.persist_remote_activity(now).await;
                Ok(())
            }
        }
    }

    async fn handle_change_feed(
        self: &Arc<Self>,
        change: ChangeFeedEvent,
        gen: u64,
    ) -> std::result::Result<(), SyncError> {
        match change {
            ChangeFeedEvent::Insert { row } | ChangeFeedEvent::Update { row } => {
                if !row.has_usable_id() {
                    return Err(SyncError::MalformedEvent(
                        "change feed row without a usable id".into(),
                    ));
                }
                let row = row.normalized();
                if !self.conversation.involves_pair(&row.sender, &row.receiver) {
                    debug!(message_id = %row.id, "discarding change-feed row for a foreign identity pair");
                    return Ok(());
                }
                let mut inner = self.inner.lock().await;
                if inner.messages.upsert(row, None, DeliveryState::Sent) {
                    self.emit_timeline_locked(&inner);
                }
                Ok(())
            }
            ChangeFeedEvent::Delete { id: Some(id) } => {
                let mut inner = self.inner.lock().await;
                if inner.messages.remove(&id) {
                    self.emit_timeline_locked(&inner);
                }
                Ok(())
            }
            ChangeFeedEvent::Delete { id: None } => {
                // partial information about a deletion cannot be applied safely
                warn!("change feed delivered a delete without an id; forcing a full resync");
                self.resync(gen).await;
                Ok(())
            }
        }
    }

    async fn handle_presence_sync(&self, members: Vec<PresenceMember>) {
        let now = Utc::now();
        let last_active = {
            let mut inner = self.inner.lock().await;
            let changed = inner.presence.apply_snapshot(&members, now);
            if changed {
                self.emit_presence_locked(&inner);
                // the online flag feeds the delivered tick
                self.emit_timeline_locked(&inner);
            }
            changed.then(|| inner.presence.last_active_at()).flatten()
        };
        if let Some(at) = last_active {
            self.persist_remote_activity(at).await;
        }
    }

    async fn handle_status(self: &Arc<Self>, status: ChannelStatus, gen: u64) {
        match status {
            ChannelStatus::Subscribed => {
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(task) = inner.connecting_probe.take() {
                        task.abort();
                    }
                    if inner.status != SyncStatus::Synced {
                        inner.status = SyncStatus::Synced;
                        let _ = self
                            .events
                            .send(EngineEvent::SyncStatusChanged(SyncStatus::Synced));
                    }
                }
                self.announce_presence().await;
                // covers events between the previous fetch and the
                // subscription taking effect; upsert makes it idempotent
                self.resync(gen).await;
                self.flush_pending_read_receipt().await;
            }
            ChannelStatus::Closed | ChannelStatus::Errored => {
                self.enter_connecting(gen).await;
            }
        }
    }

    async fn enter_connecting(self: &Arc<Self>, gen: u64) {
        let mut inner = self.inner.lock().await;
        if inner.status == SyncStatus::Connecting {
            return;
        }
        inner.status = SyncStatus::Connecting;
        if let Some(task) = inner.connecting_probe.take() {
            task.abort();
        }
        // suppress the indicator for brief reconnections
        let engine = Arc::clone(self);
        let grace = self.config.connecting_grace;
        inner.connecting_probe = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if engine.generation() != gen {
                return;
            }
            let inner = engine.inner.lock().await;
            if inner.status == SyncStatus::Connecting {
                let _ = engine
                    .events
                    .send(EngineEvent::SyncStatusChanged(SyncStatus::Connecting));
            }
        }));
    }

    async fn announce_presence(&self) {
        let session = { self.inner.lock().await.session.clone() };
        let Some(session) = session else {
            return;
        };
        let member = PresenceMember {
            user: self.conversation.local().clone(),
            online_at: Some(Utc::now()),
        };
        if let Err(err) = session.track(member).await {
            self.emit_error(&SyncError::Channel(format!(
                "presence track failed: {err:#}"
            )));
        }
    }

    async fn note_remote_typing(self: &Arc<Self>, gen: u64) {
        let now = Utc::now();
        {
            let mut inner = self.inner.lock().await;
            let typing_changed = inner.presence.set_typing(true);
            let activity_changed = inner.presence.note_activity(now);
            if let Some(task) = inner.typing_expiry_task.take() {
                task.abort();
            }
            let engine = Arc::clone(self);
            let expiry = self.config.typing_expiry;
            inner.typing_expiry_task = Some(tokio::spawn(async move {
                tokio::time::sleep(expiry).await;
                if engine.generation() != gen {
                    return;
                }
                let mut inner = engine.inner.lock().await;
                if inner.presence.set_typing(false) {
                    engine.emit_presence_locked(&inner);
                }
            }));
            if typing_changed || activity_changed {
                self.emit_presence_locked(&inner);
            }
        }
        self.persist_remote_activity(now).await;
    }

    async fn resync(&self, gen: u64) {
        if let Err(err) = self.refresh_from_store(gen).await {
            self.emit_error(&SyncError::SnapshotFetch { source: err });
            let mut inner = self.inner.lock().await;
            if inner.status != SyncStatus::Error {
                inner.status = SyncStatus::Error;
                let _ = self
                    .events
                    .send(EngineEvent::SyncStatusChanged(SyncStatus::Error));
            }
        }
    }

    /// Authoritative fetch applied wholesale through `upsert`. Safe to run
    /// repeatedly and concurrently with live events; dedup comes from the
    /// store contract, not from fetch scheduling.
    async fn refresh_from_store(&self, gen: u64) -> Result<()> {
        let records = self.durable.fetch_conversation(&self.conversation).await?;
        if self.generation() != gen {
            return Ok(());
        }

        let local = self.conversation.local().clone();
        let remote = self.conversation.remote().clone();

        let (unread, remote_activity) = {
            let mut inner = self.inner.lock().await;
            let mut changed = false;
            for record in records {
                if !record.has_usable_id() {
                    warn!("authoritative fetch returned a message without a usable id; skipping");
                    continue;
                }
                let record = record.normalized();
                if !self.conversation.involves_pair(&record.sender, &record.receiver) {
                    continue;
                }
                changed |= inner.messages.upsert(record, None, DeliveryState::Sent);
            }

            let unread = inner.messages.unread_from(&remote, &local);
            if !unread.is_empty() {
                // reading happens now, on this device
                changed |= inner.messages.mark_read_from(&remote);
            }

            let remote_activity = inner.messages.latest_created_at_from(&remote);
            let presence_changed = match remote_activity {
                Some(at) => inner.presence.note_activity(at),
                None => false,
            };

            if changed {
                self.emit_timeline_locked(&inner);
            }
            if presence_changed {
                self.emit_presence_locked(&inner);
            }
            (unread, remote_activity)
        };

        if let Some(at) = remote_activity {
            self.persist_remote_activity(at).await;
        }

        if !unread.is_empty() {
            if let Err(err) = self.durable.update_read_flag(&local, &remote).await {
                warn!(error = %format!("{err:#}"), "failed to persist read flags after sweep");
            }
            self.inner.lock().await.pending_read_receipt = true;
            self.flush_pending_read_receipt().await;
        }

        Ok(())
    }

    async fn flush_pending_read_receipt(&self) {
        let session = {
            let inner = self.inner.lock().await;
            if !inner.pending_read_receipt {
                return;
            }
            inner.session.clone()
        };
        let Some(session) = session else {
            return;
        };
        match session
            .publish(BroadcastFrame::ReadReceipt {
                reader: self.conversation.local().clone(),
            })
            .await
        {
            Ok(()) => {
                self.inner.lock().await.pending_read_receipt = false;
            }
            Err(err) => {
                debug!(error = %format!("{err:#}"), "read receipt broadcast failed; the peer heals on its next fetch");
            }
        }
    }

    async fn dispatch_outbound(
        self: &Arc<Self>,
        text: Option<String>,
        image_url: Option<String>,
        audio_url: Option<String>,
    ) -> Result<MessageId> {
        let gen = self.generation();
        let record = MessageRecord {
            id: MessageId::generate(),
            sender: self.conversation.local().clone(),
            receiver: self.conversation.remote().clone(),
            text,
            image_url,
            audio_url,
            created_at: Some(Utc::now()),
            is_read: false,
        };
        let message_id = record.id.clone();

        self.stop_local_typing().await;

        {
            let mut inner = self.inner.lock().await;
            inner.messages.upsert(
                record.clone(),
                Some(DeliveryState::Sending),
                DeliveryState::Sending,
            );
            self.emit_timeline_locked(&inner);
        }

        if let Some(timeout) = self.config.sending_timeout {
            let engine = Arc::clone(self);
            let id = message_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if engine.generation() != gen {
                    return;
                }
                let mut inner = engine.inner.lock().await;
                if inner
                    .messages
                    .set_delivery_if(&id, DeliveryState::Sending, DeliveryState::Error)
                {
                    engine.emit_timeline_locked(&inner);
                    drop(inner);
                    engine.emit_error(&SyncError::Persistence {
                        message_id: id.to_string(),
                        source: anyhow!("durable write did not complete within {timeout:?}"),
                    });
                }
            });
        }

        // fast path: an acknowledged broadcast already reached the peer
        let session = { self.inner.lock().await.session.clone() };
        if let Some(session) = session {
            match session
                .publish(BroadcastFrame::Msg {
                    message: record.clone(),
                })
                .await
            {
                Ok(()) => {
                    if self.generation() == gen {
                        let mut inner = self.inner.lock().await;
                        if inner.messages.set_delivery_if(
                            &message_id,
                            DeliveryState::Sending,
                            DeliveryState::Sent,
                        ) {
                            self.emit_timeline_locked(&inner);
                        }
                    }
                }
                Err(err) => {
                    debug!(message_id = %message_id, error = %format!("{err:#}"), "broadcast publish failed; relying on the durable write");
                }
            }
        }

        // truth path: the durable write returns the canonical record
        match self.durable.insert_message(&record).await {
            Ok(confirmed) => {
                if self.generation() == gen {
                    let mut confirmed = confirmed.normalized();
                    confirmed.id = record.id.clone();
                    let mut inner = self.inner.lock().await;
                    if inner
                        .messages
                        .upsert(confirmed, Some(DeliveryState::Sent), DeliveryState::Sent)
                    {
                        self.emit_timeline_locked(&inner);
                    }
                }
            }
            Err(err) => {
                if self.generation() == gen {
                    let failure = SyncError::Persistence {
                        message_id: message_id.to_string(),
                        source: err,
                    };
                    let mut inner = self.inner.lock().await;
                    // the peer may already have it over the fast path;
                    // Sent never regresses
                    if inner.messages.set_delivery_if(
                        &message_id,
                        DeliveryState::Sending,
                        DeliveryState::Error,
                    ) {
                        self.emit_timeline_locked(&inner);
                    }
                    drop(inner);
                    self.emit_error(&failure);
                }
            }
        }

        Ok(message_id)
    }

    async fn stop_local_typing(&self) {
        let session;
        {
            let mut inner = self.inner.lock().await;
            if let Some(task) = inner.local_typing_task.take() {
                task.abort();
            }
            if inner.last_local_typing_sent.take().is_none() {
                return;
            }
            session = inner.session.clone();
        }
        if let Some(session) = session {
            if let Err(err) = session
                .publish(BroadcastFrame::StopTyping {
                    user: self.conversation.local().clone(),
                })
                .await
            {
                debug!(error = %format!("{err:#}"), "stop-typing broadcast failed");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
