//! Start-sorted interval lists with binary-search overlap queries.

use crate::types::SimTime;

/// Half-open `[start, end)` interval stored in a `SpanIndex`.
pub trait Span {
    fn start(&self) -> SimTime;
    fn end(&self) -> SimTime;
    fn set_end(&mut self, end: SimTime);

    fn overlaps(&self, start: SimTime, end: SimTime) -> bool {
        self.start() < end && start < self.end()
    }
}

/// Intervals kept sorted by start. Overlap queries bound the scan with the
/// longest interval ever inserted, so lookups stay O(log n + k).
///
/// Invariant: `items` sorted by start; equal starts keep insertion order.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanIndex<T> {
    items: Vec<T>,
    max_len: SimTime,
}

impl<T> Default for SpanIndex<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            max_len: 0.0,
        }
    }
}

impl<T: Span> SpanIndex<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: impl IntoIterator<Item = T>) -> Self {
        let mut index = Self::new();
        for item in items {
            index.insert(item);
        }
        index
    }

    pub fn insert(&mut self, item: T) {
        self.max_len = self.max_len.max(item.end() - item.start());
        let idx = self.items.partition_point(|x| x.start() <= item.start());
        self.items.insert(idx, item);
    }

    /// Index range that may contain intervals intersecting `[start, end)`.
    fn candidates(&self, start: SimTime, end: SimTime) -> std::ops::Range<usize> {
        let floor = start - self.max_len;
        let lo = self.items.partition_point(|x| x.start() < floor);
        let hi = self.items.partition_point(|x| x.start() < end);
        lo..hi.max(lo)
    }

    /// Intervals intersecting `[start, end)`, in start order.
    pub fn overlapping(&self, start: SimTime, end: SimTime) -> impl Iterator<Item = &T> + '_ {
        self.items[self.candidates(start, end)]
            .iter()
            .filter(move |x| x.overlaps(start, end))
    }

    pub fn any_overlap(&self, start: SimTime, end: SimTime) -> bool {
        self.overlapping(start, end).next().is_some()
    }

    /// Intervals with `start <= t < end`.
    pub fn covering(&self, t: SimTime) -> impl Iterator<Item = &T> + '_ {
        let lo = self.candidates(t, t).start;
        let hi = self.items.partition_point(|x| x.start() <= t);
        self.items[lo..hi.max(lo)]
            .iter()
            .filter(move |x| x.start() <= t && t < x.end())
    }

    /// Latest-ending interval that is over by `t`.
    pub fn last_ended_by(&self, t: SimTime) -> Option<&T> {
        let hi = self.items.partition_point(|x| x.start() <= t);
        self.items[..hi]
            .iter()
            .filter(|x| x.end() <= t)
            .max_by(|a, b| a.end().total_cmp(&b.end()))
    }

    /// Largest end time held, if any.
    pub fn max_end(&self) -> Option<SimTime> {
        self.items.iter().map(|x| x.end()).reduce(SimTime::max)
    }

    /// Drop matching intervals that start at or after `t` and end the
    /// remaining matching ones at `t`. Returns how many were touched.
    pub fn cut_from(&mut self, t: SimTime, mut matches: impl FnMut(&T) -> bool) -> usize {
        let before = self.items.len();
        self.items.retain(|x| !(matches(x) && x.start() >= t));
        let mut touched = before - self.items.len();
        for item in self.items.iter_mut() {
            if item.end() > t && matches(&*item) {
                item.set_end(t);
                touched += 1;
            }
        }
        touched
    }

    pub fn retain(&mut self, f: impl FnMut(&T) -> bool) {
        self.items.retain(f);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Clone> SpanIndex<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Iv(SimTime, SimTime);

    impl Span for Iv {
        fn start(&self) -> SimTime {
            self.0
        }
        fn end(&self) -> SimTime {
            self.1
        }
        fn set_end(&mut self, end: SimTime) {
            self.1 = end;
        }
    }

    fn index(items: &[(f64, f64)]) -> SpanIndex<Iv> {
        SpanIndex::from_items(items.iter().map(|&(s, e)| Iv(s, e)))
    }

    #[test]
    fn test_overlap_is_half_open() {
        let idx = index(&[(0.0, 10.0), (20.0, 30.0)]);
        assert!(idx.any_overlap(5.0, 6.0));
        assert!(!idx.any_overlap(10.0, 20.0));
        assert!(idx.any_overlap(9.9, 20.1));
        assert_eq!(idx.overlapping(9.0, 21.0).count(), 2);
    }

    #[test]
    fn test_long_interval_found_from_far_start() {
        // The long interval starts well before the query; max_len must reach it
        let idx = index(&[(0.0, 1000.0), (500.0, 501.0), (990.0, 991.0)]);
        let hits: Vec<_> = idx.overlapping(995.0, 996.0).collect();
        assert_eq!(hits, vec![&Iv(0.0, 1000.0)]);
    }

    #[test]
    fn test_covering_and_last_ended() {
        let idx = index(&[(0.0, 2.0), (2.0, 5.0), (7.0, 9.0)]);
        let at_two: Vec<_> = idx.covering(2.0).collect();
        assert_eq!(at_two, vec![&Iv(2.0, 5.0)]);
        assert_eq!(idx.covering(6.0).count(), 0);
        assert_eq!(idx.last_ended_by(6.0), Some(&Iv(2.0, 5.0)));
        assert_eq!(idx.last_ended_by(1.0), None);
    }

    #[test]
    fn test_cut_from_truncates_and_drops() {
        let mut idx = index(&[(0.0, 10.0), (10.0, 12.0), (15.0, 20.0)]);
        let touched = idx.cut_from(5.0, |x| x.0 != 15.0);
        assert_eq!(touched, 2);
        assert_eq!(idx.to_vec(), vec![Iv(0.0, 5.0), Iv(15.0, 20.0)]);
    }

    #[test]
    fn test_equal_starts_keep_insertion_order() {
        let idx = index(&[(1.0, 1.0), (1.0, 3.0)]);
        assert_eq!(idx.to_vec(), vec![Iv(1.0, 1.0), Iv(1.0, 3.0)]);
        assert_eq!(idx.max_end(), Some(3.0));
    }

    proptest! {
        #[test]
        fn prop_overlapping_matches_linear_scan(
            spans in proptest::collection::vec((0u32..200, 0u32..60), 0..48),
            query in (0u32..260, 0u32..40),
        ) {
            let items: Vec<(f64, f64)> = spans
                .iter()
                .map(|&(s, len)| (s as f64, (s + len) as f64))
                .collect();
            let idx = index(&items);
            prop_assert!(idx.to_vec().windows(2).all(|w| w[0].0 <= w[1].0));

            let (qs, qe) = (query.0 as f64, (query.0 + query.1) as f64);
            let fast = idx.overlapping(qs, qe).count();
            let slow = items.iter().filter(|&&(s, e)| s < qe && qs < e).count();
            prop_assert_eq!(fast, slow);
        }
    }
}
