//! Per-plane state timeline with die and global views.
//!
//! Intervals live in an arena; the per-plane, per-die and global indices hold
//! lightweight references into it. Within one plane intervals never overlap:
//! an insert is clipped to the free gap that contains its start.

use rustc_hash::FxHashMap;

use crate::types::{OpUid, SimTime};

use super::spans::{Span, SpanIndex};
use super::types::StateInterval;

#[derive(Clone, Copy, Debug, PartialEq)]
struct SlotRef {
    start: SimTime,
    end: SimTime,
    slot: usize,
}

impl Span for SlotRef {
    fn start(&self) -> SimTime {
        self.start
    }
    fn end(&self) -> SimTime {
        self.end
    }
    fn set_end(&mut self, end: SimTime) {
        self.end = end;
    }
}

#[derive(Clone, Debug)]
pub struct StateTimeline {
    planes: u32,
    slots: Vec<Option<StateInterval>>,
    by_plane: Vec<SpanIndex<SlotRef>>,
    by_die: Vec<SpanIndex<SlotRef>>,
    global: SpanIndex<SlotRef>,
    by_uid: FxHashMap<OpUid, Vec<usize>>,
}

impl StateTimeline {
    pub fn new(dies: u32, planes: u32) -> Self {
        Self {
            planes,
            slots: Vec::new(),
            by_plane: (0..dies * planes).map(|_| SpanIndex::new()).collect(),
            by_die: (0..dies).map(|_| SpanIndex::new()).collect(),
            global: SpanIndex::new(),
            by_uid: FxHashMap::default(),
        }
    }

    #[inline]
    fn plane_idx(&self, die: u32, plane: u32) -> usize {
        (die * self.planes + plane) as usize
    }

    /// Insert an interval, clipped to the free gap on its plane that contains
    /// its start. Returns the stored `(start, end)` or `None` when nothing of
    /// the interval fits. Zero-length intervals are stored as-is.
    pub fn insert(&mut self, mut interval: StateInterval) -> Option<(SimTime, SimTime)> {
        let idx = self.plane_idx(interval.die, interval.plane);
        let (mut start, mut end) = (interval.start, interval.end);
        if end > start {
            for existing in self.by_plane[idx].overlapping(start, end) {
                if existing.start <= start {
                    start = start.max(existing.end);
                } else {
                    end = end.min(existing.start);
                    break;
                }
            }
            if start >= end {
                return None;
            }
        }
        interval.start = start;
        interval.end = end;
        self.push_raw(interval);
        Some((start, end))
    }

    fn push_raw(&mut self, interval: StateInterval) {
        let slot = self.slots.len();
        let r = SlotRef {
            start: interval.start,
            end: interval.end,
            slot,
        };
        let idx = self.plane_idx(interval.die, interval.plane);
        self.by_plane[idx].insert(r);
        self.by_die[interval.die as usize].insert(r);
        self.global.insert(r);
        self.by_uid.entry(interval.uid).or_default().push(slot);
        self.slots.push(Some(interval));
    }

    fn get(&self, r: &SlotRef) -> Option<&StateInterval> {
        self.slots.get(r.slot).and_then(|s| s.as_ref())
    }

    /// Interval covering `t` on one plane.
    pub fn state_at(&self, die: u32, plane: u32, t: SimTime) -> Option<&StateInterval> {
        let idx = self.plane_idx(die, plane);
        self.by_plane[idx]
            .covering(t)
            .find_map(|r| self.get(r))
    }

    /// Most recent interval on one plane that ended by `t`.
    pub fn last_before(&self, die: u32, plane: u32, t: SimTime) -> Option<&StateInterval> {
        let idx = self.plane_idx(die, plane);
        self.by_plane[idx]
            .last_ended_by(t)
            .and_then(|r| self.get(r))
    }

    /// Intervals on any plane of `die` that intersect `[start, end)`.
    pub fn die_range(&self, die: u32, start: SimTime, end: SimTime) -> Vec<&StateInterval> {
        self.by_die[die as usize]
            .overlapping(start, end)
            .filter_map(|r| self.get(r))
            .collect()
    }

    /// Intervals anywhere that intersect `[start, end)`.
    pub fn global_range(&self, start: SimTime, end: SimTime) -> Vec<&StateInterval> {
        self.global
            .overlapping(start, end)
            .filter_map(|r| self.get(r))
            .collect()
    }

    /// End every interval of `uid` at `t`; intervals starting at or after `t`
    /// are dropped.
    pub fn truncate_op(&mut self, uid: OpUid, t: SimTime) {
        let Some(slots) = self.by_uid.get(&uid).cloned() else {
            return;
        };
        let mut kept = Vec::with_capacity(slots.len());
        for slot in slots {
            let Some(interval) = self.slots[slot].as_mut() else {
                continue;
            };
            let (die, plane) = (interval.die, interval.plane);
            if interval.start >= t {
                self.slots[slot] = None;
            } else if interval.end > t {
                interval.end = t;
                kept.push(slot);
            } else {
                kept.push(slot);
                continue;
            }
            let idx = self.plane_idx(die, plane);
            for index in [
                &mut self.by_plane[idx],
                &mut self.by_die[die as usize],
                &mut self.global,
            ] {
                index.cut_from(t, |r| r.slot == slot);
            }
        }
        if kept.is_empty() {
            self.by_uid.remove(&uid);
        } else {
            self.by_uid.insert(uid, kept);
        }
    }

    /// Live intervals in insertion order.
    pub fn intervals(&self) -> impl Iterator<Item = &StateInterval> + '_ {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    /// Rebuild from intervals previously returned by `intervals`.
    pub fn from_intervals(
        dies: u32,
        planes: u32,
        intervals: impl IntoIterator<Item = StateInterval>,
    ) -> Self {
        let mut timeline = Self::new(dies, planes);
        for interval in intervals {
            timeline.push_raw(interval);
        }
        timeline
    }

    pub fn len(&self) -> usize {
        self.intervals().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BaseId;

    fn iv(uid: u64, plane: u32, state: &str, start: f64, end: f64) -> StateInterval {
        StateInterval {
            uid: OpUid(uid),
            die: 0,
            plane,
            base: BaseId(0),
            state: state.to_string(),
            start,
            end,
        }
    }

    #[test]
    fn test_insert_clips_to_free_gap() {
        let mut tl = StateTimeline::new(1, 2);
        assert_eq!(tl.insert(iv(1, 0, "CORE_BUSY", 10.0, 20.0)), Some((10.0, 20.0)));
        // Starts inside the existing interval: pushed to its end
        assert_eq!(tl.insert(iv(2, 0, "ISSUE", 15.0, 25.0)), Some((20.0, 25.0)));
        // Runs into the existing interval: tail clipped
        assert_eq!(tl.insert(iv(3, 0, "ISSUE", 5.0, 12.0)), Some((5.0, 10.0)));
        // Fully covered: dropped
        assert_eq!(tl.insert(iv(4, 0, "ISSUE", 11.0, 19.0)), None);
        // Other plane unaffected
        assert_eq!(tl.insert(iv(5, 1, "ISSUE", 11.0, 19.0)), Some((11.0, 19.0)));
        assert_eq!(tl.len(), 4);
    }

    #[test]
    fn test_lookup_views() {
        let mut tl = StateTimeline::new(1, 2);
        tl.insert(iv(1, 0, "ISSUE", 0.0, 1.0));
        tl.insert(iv(1, 0, "CORE_BUSY", 1.0, 10.0));
        tl.insert(iv(2, 1, "ISSUE", 3.0, 4.0));

        assert_eq!(tl.state_at(0, 0, 1.0).unwrap().state, "CORE_BUSY");
        assert!(tl.state_at(0, 0, 10.0).is_none());
        assert_eq!(tl.last_before(0, 0, 12.0).unwrap().state, "CORE_BUSY");
        assert_eq!(tl.die_range(0, 2.0, 3.5).len(), 2);
        assert_eq!(tl.global_range(10.0, 20.0).len(), 0);
    }

    #[test]
    fn test_truncate_op() {
        let mut tl = StateTimeline::new(1, 1);
        tl.insert(iv(1, 0, "ISSUE", 0.0, 1.0));
        tl.insert(iv(1, 0, "CORE_BUSY", 1.0, 100.0));
        tl.insert(iv(2, 0, "ISSUE", 100.0, 101.0));

        tl.truncate_op(OpUid(1), 0.5);
        let states: Vec<_> = tl
            .intervals()
            .map(|i| (i.uid, i.state.as_str(), i.start, i.end))
            .collect();
        assert_eq!(
            states,
            vec![(OpUid(1), "ISSUE", 0.0, 0.5), (OpUid(2), "ISSUE", 100.0, 101.0)]
        );
        assert!(tl.state_at(0, 0, 50.0).is_none());
        // The freed gap accepts new intervals
        assert_eq!(tl.insert(iv(3, 0, "X", 0.5, 80.0)), Some((0.5, 80.0)));
    }
}
