//! Queue Runtime: tracks the user-message queue's lifecycle and emits
//! enqueue/dequeue/blocked/cleared/dropped events through a callback, the
//! way the teacher's session drives its own event-sink callbacks.

use chrono::DateTime;
use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueItemKind {
    Message,
    Approval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueItemSource {
    User,
    System,
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: u64,
    pub kind: QueueItemKind,
    pub source: QueueItemSource,
    pub content: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued(QueueItem),
    BatchDequeued {
        batch_id: u64,
        item_ids: Vec<u64>,
        merged_count: usize,
        queue_len_after: usize,
    },
    Blocked { reason: String },
    Cleared { reason: String },
    Dropped { item: QueueItem, reason: String },
}

#[derive(Debug, Default)]
pub struct QueueRuntime {
    items: Vec<QueueItem>,
    next_id: u64,
    next_batch_id: u64,
    blocked: bool,
    pending_turns: u32,
}

impl QueueRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn pending_turns(&self) -> u32 {
        self.pending_turns
    }

    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    /// Increment `pending_turns` synchronously, before any async hop
    /// attaches the turn task to the chain.
    pub fn begin_turn(&mut self) {
        self.pending_turns += 1;
    }

    /// Decrement `pending_turns` on guaranteed scope exit (even on
    /// exceptions in the caller). Clears the blocked latch once drained.
    pub fn end_turn(&mut self) {
        self.pending_turns = self.pending_turns.saturating_sub(1);
        if self.pending_turns == 0 {
            self.blocked = false;
        }
    }

    pub fn enqueue(
        &mut self,
        kind: QueueItemKind,
        source: QueueItemSource,
        content: String,
        enqueued_at: DateTime<Utc>,
    ) -> QueueEvent {
        let item = QueueItem {
            id: self.next_id,
            kind,
            source,
            content,
            enqueued_at,
        };
        self.next_id += 1;
        self.items.push(item.clone());
        QueueEvent::Enqueued(item)
    }

    pub fn consume(&mut self, n: usize) -> QueueEvent {
        let n = n.min(self.items.len());
        let drained: Vec<QueueItem> = self.items.drain(0..n).collect();
        let item_ids = drained.iter().map(|i| i.id).collect();
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        QueueEvent::BatchDequeued {
            batch_id,
            item_ids,
            merged_count: drained.len(),
            queue_len_after: self.items.len(),
        }
    }

    /// Latches `blocked` if invoked while another turn is already active;
    /// the latch resets only once the chain drains to zero pending turns.
    pub fn try_dequeue(&mut self, reason: String) -> Option<QueueEvent> {
        if self.pending_turns > 0 {
            self.blocked = true;
            Some(QueueEvent::Blocked { reason })
        } else {
            None
        }
    }

    pub fn clear(&mut self, reason: String) -> QueueEvent {
        self.items.clear();
        self.blocked = false;
        QueueEvent::Cleared { reason }
    }

    pub fn drop_item(&mut self, item: QueueItem, reason: String) -> QueueEvent {
        self.items.retain(|i| i.id != item.id);
        QueueEvent::Dropped { item, reason }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(0, 0).expect("epoch is a valid timestamp")
    }

    #[test]
    fn enqueue_assigns_monotonic_ids_in_order() {
        let mut queue = QueueRuntime::new();
        queue.enqueue(QueueItemKind::Message, QueueItemSource::User, "a".to_string(), now());
        queue.enqueue(QueueItemKind::Message, QueueItemSource::User, "b".to_string(), now());
        let ids: Vec<u64> = queue.items().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn consume_drains_in_order_and_reports_remaining_length() {
        let mut queue = QueueRuntime::new();
        queue.enqueue(QueueItemKind::Message, QueueItemSource::User, "a".to_string(), now());
        queue.enqueue(QueueItemKind::Message, QueueItemSource::User, "b".to_string(), now());
        queue.enqueue(QueueItemKind::Message, QueueItemSource::User, "c".to_string(), now());

        let event = queue.consume(2);
        match event {
            QueueEvent::BatchDequeued { item_ids, queue_len_after, merged_count, .. } => {
                assert_eq!(item_ids, vec![0, 1]);
                assert_eq!(merged_count, 2);
                assert_eq!(queue_len_after, 1);
            }
            _ => panic!("expected BatchDequeued"),
        }
    }

    #[test]
    fn blocked_latches_while_a_turn_is_active_and_clears_on_drain() {
        let mut queue = QueueRuntime::new();
        queue.begin_turn();
        assert!(queue.try_dequeue("busy".to_string()).is_some());
        assert!(queue.is_blocked());

        queue.end_turn();
        assert!(!queue.is_blocked());
    }

    #[test]
    fn clear_drains_all_items_and_resets_blocked() {
        let mut queue = QueueRuntime::new();
        queue.begin_turn();
        queue.enqueue(QueueItemKind::Message, QueueItemSource::User, "a".to_string(), now());
        let _ = queue.try_dequeue("busy".to_string());

        queue.clear("shutdown".to_string());
        assert!(queue.is_empty());
        assert!(!queue.is_blocked());
    }
}
