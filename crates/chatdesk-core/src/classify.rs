use crate::model::{ConversationGroup, Direction};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How long an operator reply keeps a conversation in the working queue.
pub const DEFAULT_STANDBY_WINDOW_HOURS: i64 = 6;

pub fn default_standby_window() -> Duration {
    Duration::hours(DEFAULT_STANDBY_WINDOW_HOURS)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Closed,
    AwaitingOperator,
    AwaitingContact,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Closed => "closed",
            Category::AwaitingOperator => "awaiting_operator",
            Category::AwaitingContact => "awaiting_contact",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn classify(group: &ConversationGroup, now: DateTime<Utc>, window: Duration) -> Category {
    if group.is_closed {
        return Category::Closed;
    }
    let Some(last) = group.last_message() else {
        return Category::AwaitingOperator;
    };
    if last.direction == Direction::FromContact {
        return Category::AwaitingOperator;
    }
    if now.signed_duration_since(last.timestamp) <= window {
        Category::AwaitingOperator
    } else {
        Category::AwaitingContact
    }
}

/// Groups split per category; `all` is the unfiltered list. Every list keeps
/// the input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryViews {
    pub all: Vec<ConversationGroup>,
    pub closed: Vec<ConversationGroup>,
    pub awaiting_operator: Vec<ConversationGroup>,
    pub awaiting_contact: Vec<ConversationGroup>,
}

impl CategoryViews {
    pub fn get(&self, category: Category) -> &[ConversationGroup] {
        match category {
            Category::Closed => &self.closed,
            Category::AwaitingOperator => &self.awaiting_operator,
            Category::AwaitingContact => &self.awaiting_contact,
        }
    }

    pub fn counts(&self) -> CategoryCounts {
        CategoryCounts {
            all: self.all.len(),
            closed: self.closed.len(),
            awaiting_operator: self.awaiting_operator.len(),
            awaiting_contact: self.awaiting_contact.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub all: usize,
    pub closed: usize,
    pub awaiting_operator: usize,
    pub awaiting_contact: usize,
}

pub fn partition(groups: &[ConversationGroup], now: DateTime<Utc>, window: Duration) -> CategoryViews {
    let mut views = CategoryViews {
        all: groups.to_vec(),
        ..CategoryViews::default()
    };
    for group in groups {
        let bucket = match classify(group, now, window) {
            Category::Closed => &mut views.closed,
            Category::AwaitingOperator => &mut views.awaiting_operator,
            Category::AwaitingContact => &mut views.awaiting_contact,
        };
        bucket.push(group.clone());
    }
    views
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConversationKey, DispositionRef, Message, MessageId, MessageKind};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn group(direction: Direction, age: Duration, closed: bool) -> ConversationGroup {
        let message = Message {
            id: MessageId::from("1"),
            key: ConversationKey::new("A", Some(1)),
            display_name: "A".to_string(),
            body: String::new(),
            kind: MessageKind::Text,
            media_ref: None,
            direction,
            timestamp: now() - age,
            disposition: closed.then(|| DispositionRef::new("D1")),
        };
        ConversationGroup {
            key: message.key.clone(),
            display_name: "A".to_string(),
            messages: vec![message],
            is_closed: closed,
            closing_disposition: closed.then(|| DispositionRef::new("D1")),
        }
    }

    #[test]
    fn operator_reply_older_than_window_waits_on_contact() {
        let window = default_standby_window();
        let stale = group(Direction::FromOperator, Duration::hours(7), false);
        let fresh = group(Direction::FromOperator, Duration::hours(1), false);
        assert_eq!(classify(&stale, now(), window), Category::AwaitingContact);
        assert_eq!(classify(&fresh, now(), window), Category::AwaitingOperator);
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let edge = group(Direction::FromOperator, Duration::hours(6), false);
        assert_eq!(
            classify(&edge, now(), default_standby_window()),
            Category::AwaitingOperator
        );
    }

    #[test]
    fn contact_message_always_needs_operator() {
        let old = group(Direction::FromContact, Duration::days(30), false);
        assert_eq!(
            classify(&old, now(), default_standby_window()),
            Category::AwaitingOperator
        );
    }

    #[test]
    fn closed_wins_regardless_of_age() {
        for age in [Duration::minutes(1), Duration::hours(7)] {
            let closed = group(Direction::FromOperator, age, true);
            assert_eq!(
                classify(&closed, now(), default_standby_window()),
                Category::Closed
            );
        }
    }

    #[test]
    fn partition_keeps_order_and_all_view() {
        let groups = vec![
            group(Direction::FromContact, Duration::hours(1), false),
            group(Direction::FromOperator, Duration::hours(8), false),
            group(Direction::FromOperator, Duration::hours(2), true),
        ];
        let views = partition(&groups, now(), default_standby_window());
        assert_eq!(views.all, groups);
        assert_eq!(
            views.counts(),
            CategoryCounts {
                all: 3,
                closed: 1,
                awaiting_operator: 1,
                awaiting_contact: 1,
            }
        );
        assert_eq!(views.get(Category::AwaitingContact)[0], groups[1]);
    }
}
