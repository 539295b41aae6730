//! Durable offline mutation queue with conflict-aware replay.
//!
//! Edits that cannot be published are persisted under [`QUEUE_KEY`] and
//! replayed in enqueue order on the next pass. Content edits carry the text
//! they were based on; if the relays now hold something else, the merge prompt
//! decides what gets published.
//!
//! Per-edit lifecycle: `Queued -> Replaying -> Published`, or
//! `Replaying -> ConflictPending -> Resolved -> Published`. A failed replay
//! returns the edit to `Queued` for the next pass.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    event::{unix_now, Event, KindClass, Tag, UnsignedEvent},
    filter::Filter,
    kv::KvStore,
    pointers::PointerCache,
    publish::Publisher,
    relay::RelayPool,
    store::EventStore,
};

/// Durable store key holding the JSON list of queued edits.
pub const QUEUE_KEY: &str = "offline-edits";

/// What the user meant to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    Vote,
    Repost,
    Publish,
    BookMetadata,
    Chapter,
}

impl EditKind {
    /// Votes, reposts and plain publishes carry a finished template and are
    /// re-sent as is. Book metadata and chapters are content edits.
    pub fn is_resend(self) -> bool {
        matches!(self, EditKind::Vote | EditKind::Repost | EditKind::Publish)
    }
}

/// Logical record targeted by a content edit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub kind: u32,
    pub pubkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

impl RecordRef {
    pub fn new(kind: u32, pubkey: impl Into<String>, d: Option<&str>) -> Self {
        Self {
            kind,
            pubkey: pubkey.into(),
            d: d.map(str::to_string),
        }
    }

    /// Filter selecting the record's current event on relays.
    pub fn filter(&self) -> Filter {
        let mut filter = Filter::new()
            .kinds([self.kind])
            .authors([self.pubkey.clone()]);
        if KindClass::of(self.kind) == KindClass::ParameterizedReplaceable {
            filter = filter.tag('d', [self.d.clone().unwrap_or_default()]);
        }
        filter
    }
}

/// Mutation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EditData {
    /// Re-send a fully formed template. Idempotent by nature; never conflict-checked.
    Resend {
        event: UnsignedEvent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relays: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pow: Option<u8>,
    },
    /// Replace the content of a record, remembering what it was edited from.
    Content {
        record: RecordRef,
        base_content: String,
        content: String,
        #[serde(default)]
        tags: Vec<Tag>,
    },
}

/// One queued mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineEdit {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EditKind,
    pub data: EditData,
    #[serde(default)]
    pub queued_at: u64,
}

impl OfflineEdit {
    fn with_data(kind: EditKind, data: EditData) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            kind,
            data,
            queued_at: unix_now(),
        }
    }

    pub fn resend(kind: EditKind, event: UnsignedEvent) -> Self {
        Self::with_data(
            kind,
            EditData::Resend {
                event,
                relays: None,
                pow: None,
            },
        )
    }

    pub fn resend_to(
        kind: EditKind,
        event: UnsignedEvent,
        relays: Option<Vec<String>>,
        pow: Option<u8>,
    ) -> Self {
        Self::with_data(kind, EditData::Resend { event, relays, pow })
    }

    pub fn content(
        kind: EditKind,
        record: RecordRef,
        base_content: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::with_data(
            kind,
            EditData::Content {
                record,
                base_content: base_content.into(),
                content: content.into(),
                tags: vec![],
            },
        )
    }

    /// Reject an edit whose type and payload disagree.
    pub fn validate(&self) -> Result<()> {
        let resend = matches!(self.data, EditData::Resend { .. });
        if self.kind.is_resend() != resend {
            let mode = if resend { "resend" } else { "content" };
            return Err(Error::InvalidEdit(format!(
                "{:?} edit {} carries a {mode} payload",
                self.kind, self.id
            )));
        }
        Ok(())
    }

    pub fn with_tags(mut self, extra: Vec<Tag>) -> Self {
        match &mut self.data {
            EditData::Resend { event, .. } => event.tags.extend(extra),
            EditData::Content { tags, .. } => tags.extend(extra),
        }
        self
    }
}

/// Where an edit stands in its replay lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditState {
    Queued,
    Replaying,
    ConflictPending,
    Resolved,
    Published,
}

/// Host hook asking for another replay opportunity once connectivity returns.
#[async_trait]
pub trait BackgroundSync: Send + Sync {
    async fn schedule(&self) -> Result<()>;
}

/// Host without background scheduling.
pub struct NoBackgroundSync;

#[async_trait]
impl BackgroundSync for NoBackgroundSync {
    async fn schedule(&self) -> Result<()> {
        Ok(())
    }
}

/// Interactive conflict resolution. Returns `remote`, `local` or an edited string.
#[async_trait]
pub trait MergePrompt: Send + Sync {
    async fn resolve(&self, local: &str, remote: &str) -> Result<String>;
}

/// Current remote content of a logical record, `None` when relays know none.
#[async_trait]
pub trait RemoteState: Send + Sync {
    async fn current_content(&self, record: &RecordRef) -> Result<Option<String>>;
}

/// [`RemoteState`] backed by relay queries reconciled through an [`EventStore`].
pub struct RelayRemoteState {
    pool: Arc<dyn RelayPool>,
    relays: Vec<String>,
    store: Arc<RwLock<EventStore>>,
    pointers: Option<PointerCache>,
}

impl RelayRemoteState {
    pub fn new(pool: Arc<dyn RelayPool>, relays: Vec<String>, store: Arc<RwLock<EventStore>>) -> Self {
        Self {
            pool,
            relays,
            store,
            pointers: None,
        }
    }

    /// Also refresh the latest-id pointer of every record fetched.
    pub fn with_pointers(mut self, pointers: PointerCache) -> Self {
        self.pointers = Some(pointers);
        self
    }
}

#[async_trait]
impl RemoteState for RelayRemoteState {
    async fn current_content(&self, record: &RecordRef) -> Result<Option<String>> {
        let events = self.pool.list(&[record.filter()], &self.relays).await?;
        let latest = {
            let mut store = self.store.write();
            store.add_events(events);
            store
                .latest(record.kind, &record.pubkey, record.d.as_deref())
                .cloned()
        };
        let Some(latest) = latest else {
            return Ok(None);
        };
        if let Some(pointers) = &self.pointers {
            pointers.record(&latest).await?;
        }
        Ok(Some(latest.content))
    }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Ids of edits published and removed from the queue.
    pub published: Vec<String>,
    /// Ids of published edits that went through a merge.
    pub conflicts: Vec<String>,
    /// Edits left queued, with the failure reason.
    pub failed: Vec<(String, String)>,
}

/// Result of [`OfflineQueue::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submitted {
    Published(Event),
    /// Relays were unreachable; the edit with this id was queued.
    Queued(String),
}

/// Persistent queue with an in-memory mirror that owns every mutation.
pub struct OfflineQueue {
    kv: Arc<dyn KvStore>,
    edits: Mutex<Vec<OfflineEdit>>,
    pass: Mutex<()>,
    states: SyncMutex<HashMap<String, EditState>>,
    len_tx: watch::Sender<usize>,
    sync: Arc<dyn BackgroundSync>,
}

impl OfflineQueue {
    /// Load previously persisted edits.
    pub async fn open(kv: Arc<dyn KvStore>, sync: Arc<dyn BackgroundSync>) -> Result<Self> {
        let edits: Vec<OfflineEdit> = match kv.get(QUEUE_KEY).await? {
            Some(data) => serde_json::from_str(&data)?,
            None => vec![],
        };
        let states = edits
            .iter()
            .map(|e| (e.id.clone(), EditState::Queued))
            .collect();
        let (len_tx, _) = watch::channel(edits.len());
        Ok(Self {
            kv,
            edits: Mutex::new(edits),
            pass: Mutex::new(()),
            states: SyncMutex::new(states),
            len_tx,
            sync,
        })
    }

    async fn persist(&self, edits: &[OfflineEdit]) -> Result<()> {
        let data = serde_json::to_string(edits)?;
        self.kv.set(QUEUE_KEY, &data).await
    }

    fn set_state(&self, id: &str, state: EditState) {
        let mut states = self.states.lock();
        if state == EditState::Published {
            states.remove(id);
        } else {
            states.insert(id.to_string(), state);
        }
    }

    /// Persist `edit`, notify pending-count listeners and hint the host to schedule a replay.
    pub async fn queue_offline_edit(&self, edit: OfflineEdit) -> Result<()> {
        edit.validate()?;
        let len = {
            let mut edits = self.edits.lock().await;
            edits.push(edit.clone());
            if let Err(e) = self.persist(&edits).await {
                edits.pop();
                return Err(e);
            }
            edits.len()
        };
        self.set_state(&edit.id, EditState::Queued);
        self.len_tx.send_replace(len);
        info!(id = %edit.id, kind = ?edit.kind, pending = len, "queued offline edit");
        if let Err(e) = self.sync.schedule().await {
            warn!(error = %e, "background sync hint failed");
        }
        Ok(())
    }

    /// Publish now, or queue the edit when no relay can be reached.
    pub async fn submit(&self, publisher: &Publisher, edit: OfflineEdit) -> Result<Submitted> {
        edit.validate()?;
        let (template, relays, pow) = match &edit.data {
            EditData::Resend { event, relays, pow } => (event.clone(), relays.clone(), *pow),
            EditData::Content {
                record,
                content,
                tags,
                ..
            } => (content_template(record, content, tags), None, None),
        };
        match publisher.publish(template, relays.as_deref(), pow).await {
            Ok(ev) => Ok(Submitted::Published(ev)),
            Err(Error::Network(reason)) => {
                warn!(%reason, "relays unreachable, queueing edit");
                let id = edit.id.clone();
                self.queue_offline_edit(edit).await?;
                Ok(Submitted::Queued(id))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn pending(&self) -> Vec<OfflineEdit> {
        self.edits.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.edits.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.edits.lock().await.is_empty()
    }

    /// Pending-count indicator for the UI.
    pub fn subscribe_len(&self) -> watch::Receiver<usize> {
        self.len_tx.subscribe()
    }

    /// Lifecycle state of a queued edit; `None` once published or unknown.
    pub fn state(&self, id: &str) -> Option<EditState> {
        self.states.lock().get(id).copied()
    }

    /// Drop an edit without publishing it.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let len = {
            let mut edits = self.edits.lock().await;
            let before = edits.len();
            edits.retain(|e| e.id != id);
            if edits.len() == before {
                return Ok(false);
            }
            self.persist(&edits).await?;
            edits.len()
        };
        self.states.lock().remove(id);
        self.len_tx.send_replace(len);
        Ok(true)
    }

    /// Replay every queued edit once, in enqueue order.
    ///
    /// Overlapping calls run one after another. Failed edits stay queued for the
    /// next pass and are not retried within this one. Merge prompts are awaited
    /// without a timeout.
    pub async fn process_offline_edits(
        &self,
        publisher: &Publisher,
        remote: &dyn RemoteState,
        merge: &dyn MergePrompt,
    ) -> Result<ReplayReport> {
        let _pass = self.pass.lock().await;
        let snapshot = self.edits.lock().await.clone();
        let mut report = ReplayReport::default();
        for edit in snapshot {
            self.set_state(&edit.id, EditState::Replaying);
            match self.replay(&edit, publisher, remote, merge).await {
                Ok(merged) => {
                    self.remove(&edit.id).await?;
                    self.set_state(&edit.id, EditState::Published);
                    if merged {
                        report.conflicts.push(edit.id.clone());
                    }
                    report.published.push(edit.id);
                }
                Err(e) => {
                    warn!(id = %edit.id, error = %e, "offline edit replay failed");
                    self.set_state(&edit.id, EditState::Queued);
                    report.failed.push((edit.id, e.to_string()));
                }
            }
        }
        info!(
            published = report.published.len(),
            conflicts = report.conflicts.len(),
            failed = report.failed.len(),
            "offline replay pass finished"
        );
        Ok(report)
    }

    /// Publish one edit. Returns whether a merge was needed.
    async fn replay(
        &self,
        edit: &OfflineEdit,
        publisher: &Publisher,
        remote: &dyn RemoteState,
        merge: &dyn MergePrompt,
    ) -> Result<bool> {
        edit.validate()?;
        match &edit.data {
            EditData::Resend { event, relays, pow } => {
                publisher
                    .publish(event.clone(), relays.as_deref(), *pow)
                    .await?;
                Ok(false)
            }
            EditData::Content {
                record,
                base_content,
                content,
                tags,
            } => {
                let (chosen, merged) = match remote.current_content(record).await? {
                    Some(theirs) if &theirs != base_content => {
                        self.set_state(&edit.id, EditState::ConflictPending);
                        info!(id = %edit.id, "remote changed while offline, asking for merge");
                        let resolved = merge.resolve(content, &theirs).await?;
                        self.set_state(&edit.id, EditState::Resolved);
                        (resolved, true)
                    }
                    _ => (content.clone(), false),
                };
                publisher
                    .publish(content_template(record, &chosen, tags), None, None)
                    .await?;
                Ok(merged)
            }
        }
    }
}

fn content_template(record: &RecordRef, content: &str, tags: &[Tag]) -> UnsignedEvent {
    let mut template = UnsignedEvent::new(record.kind, content);
    template.tags = tags.to_vec();
    if let Some(d) = &record.d {
        if !template.tags.iter().any(|t| t.name() == Some("d")) {
            template.tags.insert(0, Tag::identifier(d.clone()));
        }
    }
    template
}
