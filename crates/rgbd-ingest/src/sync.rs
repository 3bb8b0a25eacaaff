//! Approximate-time pairing of two independently stamped streams.
//!
//! Each stream feeds a small bounded queue. After every arrival the queues are
//! resolved oldest-first: the older head (the leader) is matched against the
//! head of the other stream (its partner) when the two are within the slop
//! tolerance and no later message on the leader's stream is a closer match.
//! Paired messages are consumed, so a message is never paired twice.

use std::{collections::VecDeque, time::Duration};

use tracing::trace;

use crate::types::ImageMessage;

/// Anything carrying a capture timestamp.
pub trait Stamped {
    fn stamp_ns(&self) -> i64;
}

impl Stamped for ImageMessage {
    fn stamp_ns(&self) -> i64 {
        self.header.stamp_ns
    }
}

/// Counters describing what the synchronizer did with its input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub paired: u64,
    pub dropped_first: u64,
    pub dropped_second: u64,
    pub out_of_order: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Wait,
    DropFirst,
    DropSecond,
    Pair,
}

/// Pairs messages from two streams whose stamps differ by at most `slop`.
pub struct ApproximateTimeSync<A, B> {
    first: VecDeque<A>,
    second: VecDeque<B>,
    queue_size: usize,
    slop_ns: i64,
    last_first: Option<i64>,
    last_second: Option<i64>,
    stats: SyncStats,
}

impl<A: Stamped, B: Stamped> ApproximateTimeSync<A, B> {
    /// `queue_size` bounds the look-ahead window of each stream (minimum 1).
    pub fn new(queue_size: usize, slop: Duration) -> Self {
        let queue_size = queue_size.max(1);
        Self {
            first: VecDeque::with_capacity(queue_size),
            second: VecDeque::with_capacity(queue_size),
            queue_size,
            slop_ns: i64::try_from(slop.as_nanos()).unwrap_or(i64::MAX),
            last_first: None,
            last_second: None,
            stats: SyncStats::default(),
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Number of messages waiting on each stream.
    pub fn pending(&self) -> (usize, usize) {
        (self.first.len(), self.second.len())
    }

    /// Offer a message from the first stream and return any completed pairs.
    pub fn push_first(&mut self, msg: A) -> Vec<(A, B)> {
        let stamp = msg.stamp_ns();
        if self.last_first.is_some_and(|last| stamp < last) {
            self.stats.out_of_order += 1;
            trace!(stamp, "dropping out-of-order message on first stream");
            return Vec::new();
        }
        self.last_first = Some(stamp);
        if self.first.len() >= self.queue_size {
            self.first.pop_front();
            self.stats.dropped_first += 1;
        }
        self.first.push_back(msg);
        self.resolve(false)
    }

    /// Offer a message from the second stream and return any completed pairs.
    pub fn push_second(&mut self, msg: B) -> Vec<(A, B)> {
        let stamp = msg.stamp_ns();
        if self.last_second.is_some_and(|last| stamp < last) {
            self.stats.out_of_order += 1;
            trace!(stamp, "dropping out-of-order message on second stream");
            return Vec::new();
        }
        self.last_second = Some(stamp);
        if self.second.len() >= self.queue_size {
            self.second.pop_front();
            self.stats.dropped_second += 1;
        }
        self.second.push_back(msg);
        self.resolve(false)
    }

    /// Resolve everything still pending as if no further messages will arrive.
    pub fn flush(&mut self) -> Vec<(A, B)> {
        let pairs = self.resolve(true);
        self.stats.dropped_first += self.first.len() as u64;
        self.stats.dropped_second += self.second.len() as u64;
        self.first.clear();
        self.second.clear();
        pairs
    }

    fn resolve(&mut self, flushing: bool) -> Vec<(A, B)> {
        let mut pairs = Vec::new();
        loop {
            match self.next_step(flushing) {
                Step::Wait => break,
                Step::DropFirst => {
                    self.first.pop_front();
                    self.stats.dropped_first += 1;
                }
                Step::DropSecond => {
                    self.second.pop_front();
                    self.stats.dropped_second += 1;
                }
                Step::Pair => {
                    if let (Some(a), Some(b)) = (self.first.pop_front(), self.second.pop_front()) {
                        self.stats.paired += 1;
                        pairs.push((a, b));
                    }
                }
            }
        }
        pairs
    }

    fn next_step(&self, flushing: bool) -> Step {
        let (Some(a), Some(b)) = (self.first.front(), self.second.front()) else {
            return Step::Wait;
        };
        let (ta, tb) = (a.stamp_ns(), b.stamp_ns());
        let first_leads = ta <= tb;
        let gap = tb.abs_diff(ta);
        let drop_leader = if first_leads {
            Step::DropFirst
        } else {
            Step::DropSecond
        };

        // Every partner-stream message is at least as new as the partner head.
        if gap > self.slop_ns.unsigned_abs() {
            return drop_leader;
        }

        let (partner, leader_next) = if first_leads {
            (tb, self.first.get(1).map(Stamped::stamp_ns))
        } else {
            (ta, self.second.get(1).map(Stamped::stamp_ns))
        };

        match leader_next {
            Some(next) if next.abs_diff(partner) < gap => drop_leader,
            Some(_) => Step::Pair,
            None if flushing
                || self.first.len() >= self.queue_size
                || self.second.len() >= self.queue_size =>
            {
                Step::Pair
            }
            None => Step::Wait,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Msg(i64);

    impl Stamped for Msg {
        fn stamp_ns(&self) -> i64 {
            self.0
        }
    }

    fn ms(v: i64) -> Msg {
        Msg(v * 1_000_000)
    }

    fn stamps(pairs: Vec<(Msg, Msg)>) -> Vec<(i64, i64)> {
        pairs
            .into_iter()
            .map(|(a, b)| (a.0 / 1_000_000, b.0 / 1_000_000))
            .collect()
    }

    #[test]
    fn prefers_later_leader_when_it_is_closer() {
        let mut sync = ApproximateTimeSync::<Msg, Msg>::new(4, Duration::from_millis(100));
        assert!(sync.push_first(ms(0)).is_empty());
        assert!(sync.push_first(ms(20)).is_empty());
        let mut pairs = sync.push_second(ms(25));
        pairs.extend(sync.flush());
        assert_eq!(stamps(pairs), vec![(20, 25)]);
        assert_eq!(sync.stats().dropped_first, 1);
    }

    #[test]
    fn waits_for_lookahead_before_committing() {
        let mut sync = ApproximateTimeSync::<Msg, Msg>::new(4, Duration::from_millis(100));
        assert!(sync.push_first(ms(0)).is_empty());
        assert!(sync.push_second(ms(10)).is_empty());
        assert_eq!(sync.pending(), (1, 1));
        assert_eq!(stamps(sync.push_first(ms(50))), vec![(0, 10)]);
    }

    #[test]
    fn ties_prefer_the_older_message() {
        let mut sync = ApproximateTimeSync::<Msg, Msg>::new(4, Duration::from_millis(100));
        sync.push_first(ms(0));
        sync.push_first(ms(20));
        let pairs = sync.push_second(ms(10));
        assert_eq!(stamps(pairs), vec![(0, 10)]);
    }

    #[test]
    fn single_slot_queue_pairs_immediately() {
        let mut sync = ApproximateTimeSync::<Msg, Msg>::new(1, Duration::from_millis(100));
        assert!(sync.push_first(ms(0)).is_empty());
        assert_eq!(stamps(sync.push_second(ms(30))), vec![(0, 30)]);
    }

    #[test]
    fn out_of_order_messages_are_rejected() {
        let mut sync = ApproximateTimeSync::<Msg, Msg>::new(2, Duration::from_millis(100));
        sync.push_first(ms(50));
        assert!(sync.push_first(ms(40)).is_empty());
        assert_eq!(sync.stats().out_of_order, 1);
        assert_eq!(sync.pending(), (1, 0));
    }

    #[test]
    fn full_queue_evicts_oldest_when_other_stream_is_silent() {
        let mut sync = ApproximateTimeSync::<Msg, Msg>::new(2, Duration::from_millis(100));
        for t in [0, 33, 66, 99] {
            sync.push_first(ms(t));
        }
        assert_eq!(sync.pending(), (2, 0));
        assert_eq!(sync.stats().dropped_first, 2);
        let mut pairs = sync.push_second(ms(100));
        pairs.extend(sync.flush());
        assert_eq!(stamps(pairs), vec![(99, 100)]);
        assert_eq!(sync.stats().dropped_first, 3);
    }
}
