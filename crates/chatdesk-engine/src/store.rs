use chatdesk_core::model::{
    compare_recent_first, ConversationGroup, ConversationKey, DispositionRef, Message, MessageId,
    OrderKey,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// `disposition_added` is set when the redelivery filled in a
    /// disposition the stored copy did not have yet.
    Duplicate {
        label_changed: bool,
        disposition_added: bool,
    },
    /// The id is already stored under another conversation key. Nothing
    /// changed.
    KeyConflict,
}

impl UpsertOutcome {
    pub fn is_inserted(self) -> bool {
        matches!(self, UpsertOutcome::Inserted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionScope {
    /// Only the group of the given key.
    Conversation,
    /// Every group of the key's contact, whatever the channel.
    Contact,
}

#[derive(Debug, Clone)]
struct GroupEntry {
    messages: BTreeMap<OrderKey, Message>,
    display_name: String,
    label_source: OrderKey,
    changed_version: u64,
    refreshed_at: DateTime<Utc>,
    /// Dispositions cleared by an explicit reopen; redeliveries carrying
    /// them no longer close the group.
    reopened: HashSet<DispositionRef>,
}

impl GroupEntry {
    fn view(&self, key: &ConversationKey) -> ConversationGroup {
        let messages: Vec<Message> = self.messages.values().cloned().collect();
        let closing_disposition = messages
            .iter()
            .rev()
            .find_map(|message| message.disposition.clone());
        ConversationGroup {
            key: key.clone(),
            display_name: self.display_name.clone(),
            is_closed: closing_disposition.is_some(),
            closing_disposition,
            messages,
        }
    }

    fn take_label(&mut self, message: &Message) -> bool {
        let order = message.order_key();
        if order < self.label_source {
            return false;
        }
        self.label_source = order;
        if self.display_name == message.display_name {
            return false;
        }
        self.display_name = message.display_name.clone();
        true
    }

    fn is_reopened(&self, disposition: Option<&DispositionRef>) -> bool {
        disposition.is_some_and(|disposition| self.reopened.contains(disposition))
    }

    /// Fills in the disposition a redelivery carries for the stored message
    /// at `order`. Competing refs resolve to the greatest so merge order
    /// does not matter.
    fn merge_disposition(&mut self, order: &OrderKey, incoming: Option<DispositionRef>) -> bool {
        if self.is_reopened(incoming.as_ref()) {
            return false;
        }
        let (Some(incoming), Some(stored)) = (incoming, self.messages.get_mut(order)) else {
            return false;
        };
        if stored
            .disposition
            .as_ref()
            .is_some_and(|current| *current >= incoming)
        {
            return false;
        }
        stored.disposition = Some(incoming);
        true
    }
}

/// Authoritative in-memory set of messages, grouped per conversation key.
///
/// Every observable change bumps `version`; duplicates that change nothing
/// leave it untouched.
#[derive(Debug, Default)]
pub struct ConversationStore {
    groups: HashMap<ConversationKey, GroupEntry>,
    ids: HashMap<MessageId, (ConversationKey, OrderKey)>,
    version: u64,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn message_count(&self) -> usize {
        self.ids.len()
    }

    pub fn contains_message(&self, id: &MessageId) -> bool {
        self.ids.contains_key(id)
    }

    pub fn contains_group(&self, key: &ConversationKey) -> bool {
        self.groups.contains_key(key)
    }

    pub fn refreshed_at(&self, key: &ConversationKey) -> Option<DateTime<Utc>> {
        self.groups.get(key).map(|entry| entry.refreshed_at)
    }

    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    pub fn upsert(&mut self, mut message: Message) -> UpsertOutcome {
        let now = Utc::now();
        if let Some((known_key, order)) = self.ids.get(&message.id).cloned() {
            if known_key != message.key {
                warn!(
                    event = "store_id_key_mismatch",
                    message_id = %message.id,
                    known_key = %known_key,
                    incoming_key = %message.key
                );
                return UpsertOutcome::KeyConflict;
            }
            let Some(entry) = self.groups.get_mut(&message.key) else {
                return UpsertOutcome::Duplicate {
                    label_changed: false,
                    disposition_added: false,
                };
            };
            entry.refreshed_at = now;
            let label_changed = entry.take_label(&message);
            let disposition_added = entry.merge_disposition(&order, message.disposition);
            if label_changed || disposition_added {
                let version = self.bump();
                if let Some(entry) = self.groups.get_mut(&message.key) {
                    entry.changed_version = version;
                }
            }
            return UpsertOutcome::Duplicate {
                label_changed,
                disposition_added,
            };
        }

        let version = self.bump();
        let order = message.order_key();
        let key = message.key.clone();
        self.ids
            .insert(message.id.clone(), (key.clone(), order.clone()));
        let entry = self.groups.entry(key).or_insert_with(|| GroupEntry {
            messages: BTreeMap::new(),
            display_name: message.display_name.clone(),
            label_source: order.clone(),
            changed_version: version,
            refreshed_at: now,
            reopened: HashSet::new(),
        });
        if entry.is_reopened(message.disposition.as_ref()) {
            message.disposition = None;
        }
        entry.take_label(&message);
        entry.changed_version = version;
        entry.refreshed_at = now;
        entry.messages.insert(order, message);
        UpsertOutcome::Inserted
    }

    pub fn remove_group(&mut self, key: &ConversationKey) -> bool {
        let Some(entry) = self.groups.remove(key) else {
            return false;
        };
        for message in entry.messages.values() {
            self.ids.remove(&message.id);
        }
        self.bump();
        true
    }

    pub fn keys_for_contact(&self, contact: &str) -> Vec<ConversationKey> {
        let mut keys: Vec<ConversationKey> = self
            .groups
            .keys()
            .filter(|key| key.contact == contact)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Removes every group of `contact` across channels.
    pub fn remove_contact(&mut self, contact: &str) -> usize {
        let keys = self.keys_for_contact(contact);
        keys.iter().filter(|key| self.remove_group(key)).count()
    }

    /// Explicit close: attaches `disposition` to the current last message of
    /// each targeted group. Returns how many groups changed.
    ///
    /// Dispositions carried by messages themselves go through `upsert`
    /// instead and stay on the message that carried them.
    pub fn apply_disposition(
        &mut self,
        key: &ConversationKey,
        disposition: &DispositionRef,
        scope: DispositionScope,
    ) -> usize {
        let targets: Vec<ConversationKey> = match scope {
            DispositionScope::Conversation => {
                if self.groups.contains_key(key) {
                    vec![key.clone()]
                } else {
                    Vec::new()
                }
            }
            DispositionScope::Contact => self.keys_for_contact(&key.contact),
        };

        let mut changed = 0;
        for target in targets {
            let Some(entry) = self.groups.get_mut(&target) else {
                continue;
            };
            entry.reopened.remove(disposition);
            let Some(mut last) = entry.messages.last_entry() else {
                continue;
            };
            if last.get().disposition.as_ref() == Some(disposition) {
                continue;
            }
            last.get_mut().disposition = Some(disposition.clone());
            changed += 1;
            let version = self.bump();
            if let Some(entry) = self.groups.get_mut(&target) {
                entry.changed_version = version;
            }
        }
        changed
    }

    /// Clears every disposition of the group so it counts as open again.
    pub fn reopen(&mut self, key: &ConversationKey) -> bool {
        let Some(entry) = self.groups.get_mut(key) else {
            return false;
        };
        let mut cleared = false;
        for message in entry.messages.values_mut() {
            if let Some(disposition) = message.disposition.take() {
                entry.reopened.insert(disposition);
                cleared = true;
            }
        }
        if cleared {
            let version = self.bump();
            if let Some(entry) = self.groups.get_mut(key) {
                entry.changed_version = version;
            }
        }
        cleared
    }

    /// Drops groups a complete poll snapshot no longer reports.
    ///
    /// Groups changed after `base_version` (the store version when the fetch
    /// started) are kept: the snapshot cannot know about them yet.
    pub fn retain_reported(
        &mut self,
        reported: &HashSet<ConversationKey>,
        base_version: u64,
    ) -> Vec<ConversationKey> {
        let mut stale: Vec<ConversationKey> = self
            .groups
            .iter()
            .filter(|(key, entry)| !reported.contains(*key) && entry.changed_version <= base_version)
            .map(|(key, _)| key.clone())
            .collect();
        stale.sort();
        stale.retain(|key| self.remove_group(key));
        stale
    }

    pub fn group(&self, key: &ConversationKey) -> Option<ConversationGroup> {
        self.groups.get(key).map(|entry| entry.view(key))
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        let (key, order) = self.ids.get(id)?;
        self.groups.get(key)?.messages.get(order)
    }

    /// Immutable listing of every group, most recent activity first.
    pub fn snapshot_groups(&self) -> Arc<[ConversationGroup]> {
        let mut groups: Vec<ConversationGroup> = self
            .groups
            .iter()
            .map(|(key, entry)| entry.view(key))
            .collect();
        groups.sort_by(compare_recent_first);
        groups.into()
    }
}
