use crate::notice::Notice;
use crate::store::{ConversationStore, UpsertOutcome};
use chatdesk_core::ingest::{inbound_from_wire, message_from_raw, ConversationTarget, InboundEvent};
use chatdesk_core::model::{ConversationGroup, ConversationKey, Message};
use chatdesk_core::wire::{RawMessage, WireMsg};
use std::collections::HashSet;
use std::ops::AddAssign;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Versioned, immutable listing handed to readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreView {
    pub version: u64,
    pub groups: Arc<[ConversationGroup]>,
}

impl Default for StoreView {
    fn default() -> Self {
        Self {
            version: 0,
            groups: Arc::from(Vec::new()),
        }
    }
}

impl StoreView {
    pub fn find(&self, key: &ConversationKey) -> Option<&ConversationGroup> {
        self.groups.iter().find(|group| &group.key == key)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub dispositions: usize,
    pub removed: usize,
    pub reopened: usize,
    pub unknown_conversations: usize,
    pub malformed: usize,
    pub pruned: usize,
    /// Known ids delivered under a different conversation key and dropped.
    pub key_conflicts: usize,
}

impl AddAssign for IngestReport {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.dispositions += other.dispositions;
        self.removed += other.removed;
        self.reopened += other.reopened;
        self.unknown_conversations += other.unknown_conversations;
        self.malformed += other.malformed;
        self.pruned += other.pruned;
        self.key_conflicts += other.key_conflicts;
    }
}

/// Full poll result plus the store version observed before the fetch began.
/// `rejected` counts items the source could not even decode.
#[derive(Debug, Clone, Default)]
pub struct PollSnapshot {
    pub base_version: u64,
    pub messages: Vec<RawMessage>,
    pub rejected: usize,
}

/// Single writer of the conversation store.
///
/// Each call that changes the store publishes a fresh `StoreView`; readers
/// only ever see complete views.
pub struct Aggregator {
    store: ConversationStore,
    view_tx: watch::Sender<StoreView>,
    notice_tx: broadcast::Sender<Notice>,
    malformed_total: u64,
}

impl Aggregator {
    pub fn new(notice_capacity: usize) -> Self {
        let (view_tx, _) = watch::channel(StoreView::default());
        let (notice_tx, _) = broadcast::channel(notice_capacity.max(1));
        Self {
            store: ConversationStore::new(),
            view_tx,
            notice_tx,
            malformed_total: 0,
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn version(&self) -> u64 {
        self.store.version()
    }

    pub fn malformed_total(&self) -> u64 {
        self.malformed_total
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreView> {
        self.view_tx.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notice_tx.subscribe()
    }

    pub fn notice_sender(&self) -> broadcast::Sender<Notice> {
        self.notice_tx.clone()
    }

    pub fn view(&self) -> StoreView {
        self.view_tx.borrow().clone()
    }

    pub fn ingest(&mut self, event: InboundEvent) -> IngestReport {
        let report = self.apply(event);
        self.publish();
        report
    }

    /// Push frames go through boundary validation first.
    pub fn ingest_wire(&mut self, msg: WireMsg) -> IngestReport {
        let kind = msg.kind();
        match inbound_from_wire(msg) {
            Ok(Some(event)) => self.ingest(event),
            Ok(None) => IngestReport::default(),
            Err(err) => {
                self.record_malformed(kind, &err.to_string());
                IngestReport {
                    malformed: 1,
                    ..IngestReport::default()
                }
            }
        }
    }

    /// Applies a complete poll snapshot, then drops groups it no longer
    /// reports. Pruning is skipped when any item was malformed, since its
    /// conversation cannot be identified.
    pub fn ingest_snapshot(&mut self, snapshot: PollSnapshot) -> IngestReport {
        let mut report = IngestReport::default();
        for _ in 0..snapshot.rejected {
            self.record_malformed("poll_item", "undecodable item");
        }
        report.malformed += snapshot.rejected;
        let mut reported: HashSet<ConversationKey> = HashSet::new();
        for raw in snapshot.messages {
            match message_from_raw(raw) {
                Ok(message) => {
                    reported.insert(message.key.clone());
                    report += self.apply(InboundEvent::NewMessage(message));
                }
                Err(err) => {
                    self.record_malformed("poll_item", &err.to_string());
                    report.malformed += 1;
                }
            }
        }
        if report.malformed == 0 {
            let pruned = self.store.retain_reported(&reported, snapshot.base_version);
            for key in &pruned {
                debug!(event = "snapshot_pruned_group", key = %key);
            }
            report.pruned = pruned.len();
        }
        self.publish();
        debug!(
            event = "poll_snapshot_applied",
            inserted = report.inserted,
            duplicates = report.duplicates,
            pruned = report.pruned,
            malformed = report.malformed,
            version = self.store.version()
        );
        report
    }

    pub fn record_malformed(&mut self, kind: &str, reason: &str) {
        self.malformed_total += 1;
        warn!(
            event = "malformed_event_dropped",
            kind,
            reason,
            malformed_total = self.malformed_total
        );
    }

    fn apply(&mut self, event: InboundEvent) -> IngestReport {
        let mut report = IngestReport::default();
        match event {
            InboundEvent::NewMessage(message)
            | InboundEvent::SendConfirmed(message)
            | InboundEvent::LineReallocated(message) => {
                self.apply_message(message, &mut report);
            }
            InboundEvent::SendFailed(failure) => {
                warn!(
                    event = "send_failed",
                    code = %failure.code,
                    message_id = ?failure.message_id,
                    contact = ?failure.contact
                );
                let _ = self.notice_tx.send(Notice::SendFailed(failure));
            }
            InboundEvent::ConversationRemoved(target) => {
                let removed = match &target {
                    ConversationTarget::Conversation(key) => {
                        usize::from(self.store.remove_group(key))
                    }
                    ConversationTarget::Contact(contact) => self.store.remove_contact(contact),
                };
                if removed == 0 {
                    report.unknown_conversations += 1;
                    info!(event = "unknown_conversation", action = "remove", conversation = ?target);
                }
                report.removed += removed;
            }
            InboundEvent::ConversationReopened(target) => {
                let keys: Vec<ConversationKey> = match &target {
                    ConversationTarget::Conversation(key) => vec![key.clone()],
                    ConversationTarget::Contact(contact) => self.store.keys_for_contact(contact),
                };
                let known = keys.iter().filter(|key| self.store.contains_group(key)).count();
                if known == 0 {
                    report.unknown_conversations += 1;
                    info!(event = "unknown_conversation", action = "reopen", conversation = ?target);
                }
                report.reopened += keys.iter().filter(|key| self.store.reopen(key)).count();
            }
        }
        report
    }

    fn apply_message(&mut self, message: Message, report: &mut IngestReport) {
        let id = message.id.clone();
        let inbound = message.is_from_contact().then(|| message.clone());
        match self.store.upsert(message) {
            UpsertOutcome::Inserted => {
                report.inserted += 1;
                if self
                    .store
                    .message(&id)
                    .is_some_and(|stored| stored.disposition.is_some())
                {
                    report.dispositions += 1;
                }
                if let Some(message) = inbound {
                    let _ = self.notice_tx.send(Notice::NewInbound(message));
                }
            }
            UpsertOutcome::Duplicate {
                disposition_added, ..
            } => {
                report.duplicates += 1;
                report.dispositions += usize::from(disposition_added);
            }
            UpsertOutcome::KeyConflict => {
                report.key_conflicts += 1;
            }
        }
    }

    fn publish(&mut self) {
        let version = self.store.version();
        if self.view_tx.borrow().version == version {
            return;
        }
        let view = StoreView {
            version,
            groups: self.store.snapshot_groups(),
        };
        self.view_tx.send_replace(view);
    }
}
