//! Timer-indexed retry schedule.

use super::types::MessageId;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tokio::time::Instant;

/// Min-heap of (due time, insertion order, message).
///
/// Insertion order breaks ties so messages due at the same instant are
/// released first-in first-out.
#[derive(Debug, Default)]
pub struct RetryScheduler {
    heap: BinaryHeap<Reverse<(Instant, u64, MessageId)>>,
    seq: u64,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, due: Instant, message_id: MessageId) {
        self.seq += 1;
        self.heap.push(Reverse((due, self.seq, message_id)));
    }

    /// Earliest due time, if anything is scheduled.
    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((due, _, _))| *due)
    }

    /// Remove and return every message due at or before `now`, in due order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<MessageId> {
        let mut due = Vec::new();
        while let Some(Reverse((at, _, _))) = self.heap.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((_, _, id))) = self.heap.pop() {
                due.push(id);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn releases_in_due_order() {
        let now = Instant::now();
        let mut scheduler = RetryScheduler::new();
        let late = MessageId::from("late".to_string());
        let early = MessageId::from("early".to_string());
        let tied = MessageId::from("tied".to_string());

        scheduler.schedule(now + Duration::from_secs(60), late.clone());
        scheduler.schedule(now + Duration::from_secs(10), early.clone());
        scheduler.schedule(now + Duration::from_secs(10), tied.clone());

        assert_eq!(scheduler.next_due(), Some(now + Duration::from_secs(10)));
        assert!(scheduler.pop_due(now).is_empty());
        assert_eq!(
            scheduler.pop_due(now + Duration::from_secs(10)),
            vec![early, tied]
        );
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.pop_due(now + Duration::from_secs(600)), vec![late]);
        assert!(scheduler.is_empty());
    }
}
