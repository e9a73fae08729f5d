use crate::types::{FlushTrigger, FlushedBatch, SessionId};
use std::collections::VecDeque;
use tokio::task::AbortHandle;
use tokio::time::{Duration, Instant};

/// Handle to the one scheduled timeout flush of a session.
///
/// `generation` is unique per armed timer; a firing timer only flushes when its
/// generation is still the registered one.
#[derive(Debug)]
pub(crate) struct PendingTimer {
    generation: u64,
    handle: AbortHandle,
}

impl PendingTimer {
    pub(crate) fn new(generation: u64, handle: AbortHandle) -> Self {
        Self { generation, handle }
    }

    pub(crate) fn cancel(self) {
        self.handle.abort();
    }
}

/// A drained cycle waiting to be handed to the sink.
#[derive(Debug, Clone)]
pub(crate) enum Delivery {
    Batch(FlushedBatch),
    Empty {
        session_id: SessionId,
        trigger: FlushTrigger,
        item_count: usize,
    },
}

#[derive(Debug)]
pub(crate) struct SessionBuffer {
    items: Vec<String>,
    last_activity: Instant,
    pending_timer: Option<PendingTimer>,
    // Drained cycles not yet delivered, in drain order. Exactly one caller
    // (the one that flipped `delivering`) pops from it at a time.
    outbox: VecDeque<Delivery>,
    delivering: bool,
}

impl SessionBuffer {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            items: Vec::new(),
            last_activity: now,
            pending_timer: None,
            outbox: VecDeque::new(),
            delivering: false,
        }
    }

    /// Appends an item and returns the new buffered length.
    pub(crate) fn push(&mut self, item: String, now: Instant) -> usize {
        self.items.push(item);
        self.last_activity = now;
        self.items.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub(crate) fn has_timer(&self) -> bool {
        self.pending_timer.is_some()
    }

    /// Registers `timer`, cancelling whichever timer it replaces.
    pub(crate) fn arm(&mut self, timer: PendingTimer) {
        if let Some(previous) = self.pending_timer.replace(timer) {
            previous.cancel();
        }
    }

    pub(crate) fn cancel_timer(&mut self) -> bool {
        match self.pending_timer.take() {
            Some(timer) => {
                timer.cancel();
                true
            }
            None => false,
        }
    }

    /// Unregisters the timer without aborting it, but only if `generation` is
    /// still the registered one. Called from inside the firing timer task.
    pub(crate) fn claim_timer(&mut self, generation: u64) -> bool {
        match &self.pending_timer {
            Some(timer) if timer.generation == generation => {
                self.pending_timer = None;
                true
            }
            _ => false,
        }
    }

    /// Takes every buffered item and restarts the activity clock.
    pub(crate) fn drain(&mut self, now: Instant) -> Vec<String> {
        self.last_activity = now;
        std::mem::take(&mut self.items)
    }

    /// Queues a drained cycle. Returns true when the caller became the
    /// session's deliverer and must run the delivery loop.
    pub(crate) fn enqueue(&mut self, delivery: Delivery) -> bool {
        self.outbox.push_back(delivery);
        if self.delivering {
            return false;
        }
        self.delivering = true;
        true
    }

    /// Next queued delivery; releases the deliverer role once the queue is empty.
    pub(crate) fn next_delivery(&mut self) -> Option<Delivery> {
        let next = self.outbox.pop_front();
        if next.is_none() {
            self.delivering = false;
        }
        next
    }

    pub(crate) fn is_delivering(&self) -> bool {
        self.delivering || !self.outbox.is_empty()
    }

    /// Drops buffered items and the pending timer. Returns the discarded item count.
    pub(crate) fn discard(&mut self) -> usize {
        self.cancel_timer();
        let discarded = self.items.len();
        self.items.clear();
        discarded
    }

    /// Drops drained cycles still waiting for the sink. Returns their item count.
    /// A cycle already handed to the sink is not in the outbox.
    pub(crate) fn discard_outbox(&mut self) -> usize {
        self.outbox
            .drain(..)
            .map(|delivery| match delivery {
                Delivery::Batch(batch) => batch.item_count,
                Delivery::Empty { item_count, .. } => item_count,
            })
            .sum()
    }
}

/// Joins `items` into batch text capped at `max_chars` characters.
///
/// Returns `None` when the joined text is blank. The flag reports truncation.
pub(crate) fn compose_batch(
    items: &[String],
    separator: &str,
    max_chars: usize,
) -> Option<(String, bool)> {
    let joined = items.join(separator);
    if joined.trim().is_empty() {
        return None;
    }
    Some(truncate_chars(joined, max_chars))
}

/// Cuts `text` to at most `max_chars` characters. The flag reports truncation.
pub fn truncate_chars(mut text: String, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            text.truncate(cut);
            (text, true)
        }
        None => (text, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn compose_joins_in_order() {
        let (text, truncated) = compose_batch(&items(&["a", "b", "c"]), " ", 100).expect("text");
        assert_eq!(text, "a b c");
        assert!(!truncated);
    }

    #[test]
    fn compose_blank_batch_is_none() {
        assert!(compose_batch(&items(&["  ", "", "\t"]), " ", 100).is_none());
    }

    #[test]
    fn compose_keeps_blank_items_between_content() {
        let (text, _) = compose_batch(&items(&["a", " ", "b"]), " ", 100).expect("text");
        assert_eq!(text, "a   b");
    }

    #[test]
    fn compose_truncates_by_characters() {
        let (text, truncated) =
            compose_batch(&items(&["你好世界", "hello"]), " ", 6).expect("text");
        assert_eq!(text, "你好世界 h");
        assert_eq!(text.chars().count(), 6);
        assert!(truncated);
    }

    #[test]
    fn compose_exact_length_is_not_truncated() {
        let (text, truncated) = compose_batch(&items(&["abc", "de"]), " ", 6).expect("text");
        assert_eq!(text, "abc de");
        assert!(!truncated);
    }

    #[test]
    fn drain_resets_items_and_activity() {
        let start = Instant::now();
        let mut buffer = SessionBuffer::new(start);
        buffer.push("a".to_string(), start);
        assert_eq!(buffer.push("b".to_string(), start), 2);
        let later = start + Duration::from_secs(3);
        assert_eq!(buffer.drain(later), items(&["a", "b"]));
        assert!(buffer.is_empty());
        assert_eq!(buffer.idle_for(later), Duration::ZERO);
    }

    #[test]
    fn outbox_elects_a_single_deliverer() {
        let now = Instant::now();
        let mut buffer = SessionBuffer::new(now);
        let empty = |trigger| Delivery::Empty {
            session_id: SessionId::new("s"),
            trigger,
            item_count: 1,
        };
        assert!(buffer.enqueue(empty(FlushTrigger::Threshold)));
        assert!(!buffer.enqueue(empty(FlushTrigger::Timeout)));
        assert!(buffer.is_delivering());

        assert!(matches!(
            buffer.next_delivery(),
            Some(Delivery::Empty {
                trigger: FlushTrigger::Threshold,
                ..
            })
        ));
        assert!(buffer.next_delivery().is_some());
        assert!(buffer.next_delivery().is_none());
        assert!(!buffer.is_delivering());
        assert!(buffer.enqueue(empty(FlushTrigger::Timeout)));
    }

    #[test]
    fn discarding_the_outbox_counts_queued_items() {
        let mut buffer = SessionBuffer::new(Instant::now());
        let batch = FlushedBatch {
            session_id: SessionId::new("s"),
            text: "a b".to_string(),
            item_count: 2,
            truncated: false,
            trigger: FlushTrigger::Threshold,
            flushed_at: chrono::Utc::now(),
        };
        assert!(buffer.enqueue(Delivery::Batch(batch)));
        assert!(!buffer.enqueue(Delivery::Empty {
            session_id: SessionId::new("s"),
            trigger: FlushTrigger::Timeout,
            item_count: 3,
        }));
        assert_eq!(buffer.discard_outbox(), 5);
        assert!(buffer.next_delivery().is_none());
        assert!(!buffer.is_delivering());
    }

    #[tokio::test]
    async fn arming_replaces_and_aborts_the_previous_timer() {
        let now = Instant::now();
        let mut buffer = SessionBuffer::new(now);
        let first = tokio::spawn(std::future::pending::<()>());
        buffer.arm(PendingTimer::new(1, first.abort_handle()));
        let second = tokio::spawn(std::future::pending::<()>());
        buffer.arm(PendingTimer::new(2, second.abort_handle()));

        let err = first.await.expect_err("first timer aborted");
        assert!(err.is_cancelled());
        assert!(!buffer.claim_timer(1));
        assert!(buffer.claim_timer(2));
        assert!(!buffer.has_timer());
        second.abort();
    }
}
