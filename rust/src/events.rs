//! Time-ordered event queue driving the scheduler.
//!
//! Events are ordered by `(time, kind priority, sequence)`. The fixed kind
//! order `OpEnd < PhaseHook < QueueRefill < OpStart` makes resource releases at
//! an instant visible to proposals made at the same instant.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::types::{OpUid, SimTime};

/// Event kind, declared in processing priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    OpEnd,
    PhaseHook,
    QueueRefill,
    OpStart,
}

/// Request for the proposer to look at one (die, plane).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseHook {
    pub die: u32,
    pub plane: u32,
    /// `"<BASE>.<STATE>"` of the segment that produced the hook, if any.
    pub label: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    OpStart(OpUid),
    OpEnd(OpUid),
    PhaseHook(PhaseHook),
    QueueRefill,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::OpStart(_) => EventKind::OpStart,
            EventPayload::OpEnd(_) => EventKind::OpEnd,
            EventPayload::PhaseHook(_) => EventKind::PhaseHook,
            EventPayload::QueueRefill => EventKind::QueueRefill,
        }
    }
}

/// Handle returned by `push`; the event's sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHandle(pub u64);

#[derive(Clone, Debug)]
pub struct Event {
    pub time: SimTime,
    pub kind: EventKind,
    pub seq: u64,
    pub payload: EventPayload,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then(self.kind.cmp(&other.kind))
            .then(self.seq.cmp(&other.seq))
    }
}

/// Multi-priority min-queue with stable tie-breaking and lazy cancellation.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<Event>>,
    cancelled: FxHashSet<u64>,
    next_seq: u64,
    live: usize,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event; returns its handle.
    pub fn push(&mut self, time: SimTime, payload: EventPayload) -> EventHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Event {
            time,
            kind: payload.kind(),
            seq,
            payload,
        }));
        self.live += 1;
        EventHandle(seq)
    }

    /// Cancel a pending event. With `kind` given, only an event of that kind
    /// is cancelled. Returns whether a pending event was cancelled.
    pub fn remove(&mut self, handle: EventHandle, kind: Option<EventKind>) -> bool {
        if self.cancelled.contains(&handle.0) {
            return false;
        }
        let found = self
            .heap
            .iter()
            .any(|Reverse(e)| e.seq == handle.0 && kind.map_or(true, |k| e.kind == k));
        if found {
            self.cancelled.insert(handle.0);
            self.live -= 1;
        }
        found
    }

    fn discard_cancelled_head(&mut self) {
        while let Some(Reverse(head)) = self.heap.peek() {
            if !self.cancelled.remove(&head.seq) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Earliest pending timestamp.
    pub fn peek_time(&mut self) -> Option<SimTime> {
        self.discard_cancelled_head();
        self.heap.peek().map(|Reverse(e)| e.time)
    }

    /// Remove and return every event sharing the earliest timestamp, in
    /// `(kind priority, sequence)` order.
    pub fn pop_time_batch(&mut self) -> Option<(SimTime, Vec<Event>)> {
        let time = self.peek_time()?;
        let mut batch = Vec::new();
        while let Some(Reverse(head)) = self.heap.peek() {
            if head.time != time {
                break;
            }
            let Some(Reverse(event)) = self.heap.pop() else {
                break;
            };
            if self.cancelled.remove(&event.seq) {
                continue;
            }
            self.live -= 1;
            batch.push(event);
        }
        Some((time, batch))
    }

    /// Pending events in processing order.
    pub fn pending(&self) -> Vec<&Event> {
        let mut events: Vec<&Event> = self
            .heap
            .iter()
            .map(|Reverse(e)| e)
            .filter(|e| !self.cancelled.contains(&e.seq))
            .collect();
        events.sort();
        events
    }

    /// Number of pending (non-cancelled) events.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hook(die: u32) -> EventPayload {
        EventPayload::PhaseHook(PhaseHook {
            die,
            plane: 0,
            label: None,
        })
    }

    #[test]
    fn test_kind_priority_at_same_time() {
        let mut q = EventQueue::new();
        q.push(5.0, EventPayload::OpStart(OpUid(1)));
        q.push(5.0, EventPayload::QueueRefill);
        q.push(5.0, hook(0));
        q.push(5.0, EventPayload::OpEnd(OpUid(0)));

        let (time, batch) = q.pop_time_batch().unwrap();
        assert_eq!(time, 5.0);
        let kinds: Vec<EventKind> = batch.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::OpEnd,
                EventKind::PhaseHook,
                EventKind::QueueRefill,
                EventKind::OpStart
            ]
        );
        assert!(q.is_empty());
    }

    #[test]
    fn test_batch_only_takes_earliest_time() {
        let mut q = EventQueue::new();
        q.push(2.0, hook(0));
        q.push(1.0, hook(1));
        q.push(1.0, hook(2));

        let (time, batch) = q.pop_time_batch().unwrap();
        assert_eq!(time, 1.0);
        assert_eq!(batch.len(), 2);
        // Insertion order breaks ties within a kind
        assert_eq!(batch[0].payload, hook(1));
        assert_eq!(batch[1].payload, hook(2));
        assert_eq!(q.len(), 1);
        assert_eq!(q.peek_time(), Some(2.0));
    }

    #[test]
    fn test_remove_cancels_event() {
        let mut q = EventQueue::new();
        let end = q.push(3.0, EventPayload::OpEnd(OpUid(7)));
        q.push(4.0, hook(0));

        // Wrong kind filter leaves it alone
        assert!(!q.remove(end, Some(EventKind::OpStart)));
        assert!(q.remove(end, Some(EventKind::OpEnd)));
        assert!(!q.remove(end, None));
        assert_eq!(q.len(), 1);

        let (time, batch) = q.pop_time_batch().unwrap();
        assert_eq!(time, 4.0);
        assert_eq!(batch.len(), 1);
        assert!(q.pop_time_batch().is_none());
    }

    #[test]
    fn test_pending_skips_cancelled_in_order() {
        let mut q = EventQueue::new();
        q.push(2.0, hook(0));
        let end = q.push(1.0, EventPayload::OpEnd(OpUid(3)));
        q.push(1.0, EventPayload::OpStart(OpUid(4)));
        q.push(1.0, hook(1));
        q.remove(end, None);

        let pending: Vec<&EventPayload> = q.pending().into_iter().map(|e| &e.payload).collect();
        assert_eq!(
            pending,
            vec![&hook(1), &EventPayload::OpStart(OpUid(4)), &hook(0)]
        );
        assert_eq!(q.len(), 3);
    }

    proptest! {
        #[test]
        fn prop_batches_are_time_ordered(times in proptest::collection::vec(0u32..50, 1..64)) {
            let mut q = EventQueue::new();
            for (i, t) in times.iter().enumerate() {
                q.push(*t as f64, hook(i as u32));
            }
            let mut last = f64::NEG_INFINITY;
            let mut seen = 0;
            while let Some((time, batch)) = q.pop_time_batch() {
                prop_assert!(time > last);
                prop_assert!(batch.iter().all(|e| e.time == time));
                prop_assert!(batch.windows(2).all(|w| w[0].seq < w[1].seq));
                last = time;
                seen += batch.len();
            }
            prop_assert_eq!(seen, times.len());
        }
    }
}
