use crate::aggregator::StoreView;
use chatdesk_core::model::{ConversationGroup, ConversationKey};
use tokio::sync::watch;

/// Keeps one conversation pinned across store updates.
///
/// Only the key is held; the group is looked up again in every new view and
/// compared by value, so a rebuilt but identical group is not a change.
pub struct SelectionTracker {
    views: watch::Receiver<StoreView>,
    selected: Option<ConversationKey>,
    current: Option<ConversationGroup>,
}

impl SelectionTracker {
    pub fn new(views: watch::Receiver<StoreView>) -> Self {
        Self {
            views,
            selected: None,
            current: None,
        }
    }

    pub fn select(&mut self, key: ConversationKey) -> Option<&ConversationGroup> {
        self.selected = Some(key);
        self.resolve();
        self.current.as_ref()
    }

    pub fn clear(&mut self) {
        self.selected = None;
        self.current = None;
    }

    pub fn selected_key(&self) -> Option<&ConversationKey> {
        self.selected.as_ref()
    }

    /// Last resolved group; `None` when nothing is selected or the selected
    /// conversation no longer exists.
    pub fn selection(&self) -> Option<&ConversationGroup> {
        self.current.as_ref()
    }

    /// Re-resolves against the newest view. Returns whether the resolved
    /// group changed.
    pub fn refresh(&mut self) -> bool {
        self.resolve()
    }

    /// Waits for the next view that changes the selection and returns it.
    /// Returns `None` once the store is gone.
    pub async fn changed(&mut self) -> Option<Option<ConversationGroup>> {
        loop {
            if self.views.changed().await.is_err() {
                return None;
            }
            if self.resolve() {
                return Some(self.current.clone());
            }
        }
    }

    fn resolve(&mut self) -> bool {
        let view = self.views.borrow_and_update();
        let next = self
            .selected
            .as_ref()
            .and_then(|key| view.find(key))
            .cloned();
        drop(view);
        if next == self.current {
            return false;
        }
        self.current = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Aggregator;
    use chatdesk_core::wire::{ConversationRefPayload, RawMessage, WireMsg};
    use serde_json::json;

    fn push(aggregator: &mut Aggregator, id: &str, contact: &str, ts: &str) {
        aggregator.ingest_wire(WireMsg::NewMessage(RawMessage {
            id: Some(id.to_string()),
            contact: Some(contact.to_string()),
            channel: Some(json!(1)),
            direction: Some("contact".to_string()),
            timestamp: Some(json!(ts)),
            ..RawMessage::default()
        }));
    }

    fn remove(aggregator: &mut Aggregator, contact: &str) {
        aggregator.ingest_wire(WireMsg::ConversationRemoved(ConversationRefPayload {
            contact: Some(contact.to_string()),
            channel: Some(json!(1)),
            all_channels: false,
        }));
    }

    #[test]
    fn deleting_another_conversation_keeps_selection() {
        let mut aggregator = Aggregator::new(8);
        push(&mut aggregator, "1", "K", "2026-01-01T10:00:00Z");
        push(&mut aggregator, "2", "K2", "2026-01-01T10:05:00Z");

        let mut tracker = SelectionTracker::new(aggregator.subscribe());
        let key = ConversationKey::new("K", Some(1));
        let selected = tracker.select(key.clone()).cloned().expect("resolved");

        remove(&mut aggregator, "K2");
        assert!(!tracker.refresh());
        assert_eq!(tracker.selection(), Some(&selected));
        assert_eq!(tracker.selected_key(), Some(&key));
    }

    #[test]
    fn new_message_in_selected_conversation_is_republished() {
        let mut aggregator = Aggregator::new(8);
        push(&mut aggregator, "1", "K", "2026-01-01T10:00:00Z");
        let mut tracker = SelectionTracker::new(aggregator.subscribe());
        tracker.select(ConversationKey::new("K", Some(1)));

        push(&mut aggregator, "2", "K", "2026-01-01T10:01:00Z");
        assert!(tracker.refresh());
        assert_eq!(tracker.selection().map(|group| group.len()), Some(2));
    }

    #[test]
    fn deleting_selected_conversation_resolves_to_none() {
        let mut aggregator = Aggregator::new(8);
        push(&mut aggregator, "1", "K", "2026-01-01T10:00:00Z");
        let mut tracker = SelectionTracker::new(aggregator.subscribe());
        tracker.select(ConversationKey::new("K", Some(1)));

        remove(&mut aggregator, "K");
        assert!(tracker.refresh());
        assert!(tracker.selection().is_none());
        assert!(tracker.selected_key().is_some());

        push(&mut aggregator, "3", "K", "2026-01-01T11:00:00Z");
        assert!(tracker.refresh());
        assert!(tracker.selection().is_some());
    }

    #[test]
    fn independent_trackers_do_not_interfere() {
        let mut aggregator = Aggregator::new(8);
        push(&mut aggregator, "1", "K", "2026-01-01T10:00:00Z");
        push(&mut aggregator, "2", "J", "2026-01-01T10:00:00Z");
        let mut first = SelectionTracker::new(aggregator.subscribe());
        let mut second = SelectionTracker::new(aggregator.subscribe());
        first.select(ConversationKey::new("K", Some(1)));
        second.select(ConversationKey::new("J", Some(1)));

        push(&mut aggregator, "3", "J", "2026-01-01T10:10:00Z");
        assert!(!first.refresh());
        assert!(second.refresh());
        assert_eq!(first.selection().map(|group| group.len()), Some(1));
    }

    #[tokio::test]
    async fn changed_skips_unrelated_updates() {
        let mut aggregator = Aggregator::new(8);
        push(&mut aggregator, "1", "K", "2026-01-01T10:00:00Z");
        let mut tracker = SelectionTracker::new(aggregator.subscribe());
        tracker.select(ConversationKey::new("K", Some(1)));

        let waiter = tokio::spawn(async move { tracker.changed().await });
        tokio::task::yield_now().await;
        push(&mut aggregator, "2", "other", "2026-01-01T10:01:00Z");
        tokio::task::yield_now().await;
        push(&mut aggregator, "3", "K", "2026-01-01T10:02:00Z");

        let resolved = waiter.await.expect("join").expect("store alive");
        assert_eq!(resolved.map(|group| group.len()), Some(2));
    }

    #[tokio::test]
    async fn changed_ends_when_store_is_dropped() {
        let aggregator = Aggregator::new(8);
        let mut tracker = SelectionTracker::new(aggregator.subscribe());
        drop(aggregator);
        assert!(tracker.changed().await.is_none());
    }
}
