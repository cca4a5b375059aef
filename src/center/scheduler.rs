//! Ready-stream scheduling.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use crate::core::StreamSource;

/// Scheduling priority of a ready stream.
///
/// Best-effort streams always go before low-priority ones; inside a class
/// the higher score wins.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Priority {
    /// Stream was opened with a nonzero priority.
    pub low: bool,
    /// Decaying score, higher first.
    pub score: f64,
}

impl Priority {
    /// Best-effort class.
    pub fn best_effort(score: f64) -> Self {
        Self { low: false, score }
    }

    /// Low class.
    pub fn low(score: f64) -> Self {
        Self { low: true, score }
    }

    /// Order in which streams are served: `Less` goes first.
    pub fn rank(&self, other: &Self) -> Ordering {
        self.low
            .cmp(&other.low)
            .then_with(|| other.score.total_cmp(&self.score))
    }
}

/// Streams with something to send, kept sorted by [`Priority::rank`].
#[derive(Debug, Default)]
pub struct ReadyQueue {
    entries: Vec<(u16, Priority)>,
    last_sort: Option<Instant>,
}

impl ReadyQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stream or update its priority.
    pub fn insert(&mut self, stream_id: u16, priority: Priority) {
        self.remove(stream_id);
        let at = self
            .entries
            .partition_point(|(_, p)| p.rank(&priority) != Ordering::Greater);
        self.entries.insert(at, (stream_id, priority));
    }

    /// Remove a stream.
    pub fn remove(&mut self, stream_id: u16) -> bool {
        match self.entries.iter().position(|(id, _)| *id == stream_id) {
            Some(at) => {
                self.entries.remove(at);
                true
            }
            None => false,
        }
    }

    /// Check if a stream is queued.
    pub fn contains(&self, stream_id: u16) -> bool {
        self.entries.iter().any(|(id, _)| *id == stream_id)
    }

    /// Take the stream to serve next.
    pub fn pop(&mut self) -> Option<u16> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0).0)
        }
    }

    /// Stream that would be served next.
    pub fn peek(&self) -> Option<u16> {
        self.entries.first().map(|(id, _)| *id)
    }

    /// Queued streams.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no stream is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids in service order.
    pub fn ids(&self) -> Vec<u16> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    /// When the next periodic re-sort is due, if one is needed. Nothing is
    /// scheduled before the first sort; the next dispatch performs it.
    pub fn next_resort(&self, interval: Duration) -> Option<Instant> {
        if self.entries.len() < 2 {
            return None;
        }
        self.last_sort.map(|at| at + interval)
    }

    /// Refresh priorities from `source` and re-sort, at most once per
    /// `interval`. Streams that no longer exist are dropped.
    pub fn resort<S: StreamSource + ?Sized>(
        &mut self,
        now: Instant,
        interval: Duration,
        source: &S,
    ) {
        if self.entries.len() < 2 {
            self.last_sort = Some(now);
            return;
        }
        if self.last_sort.is_some_and(|at| now < at + interval) {
            return;
        }
        self.last_sort = Some(now);
        self.entries = self
            .entries
            .iter()
            .filter_map(|(id, _)| source.priority(*id, now).map(|p| (*id, p)))
            .collect();
        self.entries.sort_by(|(_, a), (_, b)| a.rank(b));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamFrame;
    use std::collections::HashMap;

    struct Scores(HashMap<u16, Priority>);

    impl StreamSource for Scores {
        fn do_write(&mut self, _stream_id: u16, _now: Instant) -> Option<(StreamFrame, bool)> {
            None
        }

        fn priority(&self, stream_id: u16, _now: Instant) -> Option<Priority> {
            self.0.get(&stream_id).copied()
        }
    }

    #[test]
    fn test_rank_prefers_best_effort_then_score() {
        let a = Priority::best_effort(1.0);
        let b = Priority::best_effort(5.0);
        let c = Priority::low(100.0);
        assert_eq!(b.rank(&a), Ordering::Less);
        assert_eq!(a.rank(&c), Ordering::Less);
    }

    #[test]
    fn test_insert_keeps_order_and_fifo_ties() {
        let mut queue = ReadyQueue::new();
        queue.insert(1, Priority::best_effort(0.0));
        queue.insert(2, Priority::low(9.0));
        queue.insert(3, Priority::best_effort(4.0));
        queue.insert(4, Priority::best_effort(0.0));
        assert_eq!(queue.ids(), vec![3, 1, 4, 2]);

        queue.insert(1, Priority::best_effort(10.0));
        assert_eq!(queue.ids(), vec![1, 3, 4, 2]);
        assert_eq!(queue.pop(), Some(1));
        assert!(!queue.contains(1));
    }

    #[test]
    fn test_resort_refreshes_and_drops_gone_streams() {
        let now = Instant::now();
        let interval = Duration::from_secs(1);
        let mut queue = ReadyQueue::new();
        queue.insert(1, Priority::best_effort(10.0));
        queue.insert(2, Priority::best_effort(5.0));
        queue.insert(3, Priority::best_effort(1.0));

        let mut scores = HashMap::new();
        scores.insert(1, Priority::best_effort(0.0));
        scores.insert(2, Priority::best_effort(7.0));
        let source = Scores(scores);

        queue.resort(now, interval, &source);
        assert_eq!(queue.ids(), vec![2, 1]);
        assert_eq!(queue.next_resort(interval), Some(now + interval));
    }

    #[test]
    fn test_no_resort_deadline_before_first_sort() {
        let now = Instant::now();
        let interval = Duration::from_millis(200);
        let mut queue = ReadyQueue::new();
        queue.insert(1, Priority::best_effort(1.0));
        queue.insert(2, Priority::best_effort(2.0));
        assert_eq!(queue.next_resort(interval), None);

        queue.resort(now, interval, &Scores(HashMap::new()));
        assert!(queue.is_empty());
        assert_eq!(queue.next_resort(interval), None);

        queue.insert(3, Priority::best_effort(1.0));
        queue.insert(4, Priority::best_effort(1.0));
        assert_eq!(queue.next_resort(interval), Some(now + interval));
    }
}
