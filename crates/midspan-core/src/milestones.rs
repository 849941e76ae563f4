//! Transaction milestones.
//!
//! A fixed set of timestamps captured as the transaction progresses. Time
//! is always passed in by the caller, never read from a clock, so the
//! machines stay deterministic under test. Capture is monotone: recording
//! a milestone twice keeps the earlier value, and the API-time accumulators
//! only grow.

use std::time::{Duration, Instant};

/// Named timestamps in transaction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Milestone {
    /// State machine constructed
    SmStart,
    /// Client transaction attached
    UaBegin,
    /// First bytes read from the client
    UaFirstRead,
    /// Client request header fully parsed
    UaReadHeaderDone,
    /// Cache read lookup started
    CacheOpenReadBegin,
    /// Cache read lookup finished
    CacheOpenReadEnd,
    /// Cache write open started
    CacheOpenWriteBegin,
    /// Cache write open finished
    CacheOpenWriteEnd,
    /// Name resolution started
    DnsLookupBegin,
    /// Name resolution finished
    DnsLookupEnd,
    /// First origin connect attempt
    ServerFirstConnect,
    /// Latest origin connect attempt
    ServerConnect,
    /// Origin connect completed
    ServerConnectEnd,
    /// Request write to origin started
    ServerBeginWrite,
    /// First bytes read from the origin
    ServerFirstRead,
    /// Origin response header fully parsed
    ServerReadHeaderDone,
    /// Origin connection released
    ServerClose,
    /// Response write to client started
    UaBeginWrite,
    /// Client connection finished
    UaClose,
    /// State machine destroyed
    SmFinish,
}

impl Milestone {
    const COUNT: usize = 20;

    fn index(self) -> usize {
        match self {
            Self::SmStart => 0,
            Self::UaBegin => 1,
            Self::UaFirstRead => 2,
            Self::UaReadHeaderDone => 3,
            Self::CacheOpenReadBegin => 4,
            Self::CacheOpenReadEnd => 5,
            Self::CacheOpenWriteBegin => 6,
            Self::CacheOpenWriteEnd => 7,
            Self::DnsLookupBegin => 8,
            Self::DnsLookupEnd => 9,
            Self::ServerFirstConnect => 10,
            Self::ServerConnect => 11,
            Self::ServerConnectEnd => 12,
            Self::ServerBeginWrite => 13,
            Self::ServerFirstRead => 14,
            Self::ServerReadHeaderDone => 15,
            Self::ServerClose => 16,
            Self::UaBeginWrite => 17,
            Self::UaClose => 18,
            Self::SmFinish => 19,
        }
    }

    /// Milestones that must not precede this one, per the transaction's
    /// partial order. Only immediate predecessors are listed.
    #[must_use]
    pub fn predecessors(self) -> &'static [Milestone] {
        match self {
            Self::SmStart => &[],
            Self::UaBegin => &[Self::SmStart],
            Self::UaFirstRead => &[Self::UaBegin],
            Self::UaReadHeaderDone => &[Self::UaFirstRead],
            Self::CacheOpenReadBegin
            | Self::CacheOpenWriteBegin
            | Self::DnsLookupBegin
            | Self::ServerFirstConnect => &[Self::UaReadHeaderDone],
            Self::CacheOpenReadEnd => &[Self::CacheOpenReadBegin],
            Self::CacheOpenWriteEnd => &[Self::CacheOpenWriteBegin],
            Self::DnsLookupEnd => &[Self::DnsLookupBegin],
            Self::ServerConnect => &[Self::ServerFirstConnect],
            Self::ServerConnectEnd => &[Self::ServerConnect],
            Self::ServerBeginWrite => &[Self::ServerConnectEnd],
            Self::ServerFirstRead => &[Self::ServerBeginWrite],
            Self::ServerReadHeaderDone => &[Self::ServerFirstRead],
            Self::ServerClose => &[Self::ServerReadHeaderDone],
            Self::UaBeginWrite => &[Self::UaReadHeaderDone],
            Self::UaClose => &[Self::UaBeginWrite],
            Self::SmFinish => &[Self::UaClose],
        }
    }
}

/// Milestone store for one transaction.
#[derive(Debug, Clone)]
pub struct Milestones {
    stamps: [Option<Instant>; Milestone::COUNT],
    api_active: Duration,
    api_total: Duration,
}

impl Milestones {
    /// Empty store; `SM_START` is stamped immediately.
    #[must_use]
    pub fn new(now: Instant) -> Self {
        let mut m = Self {
            stamps: [None; Milestone::COUNT],
            api_active: Duration::ZERO,
            api_total: Duration::ZERO,
        };
        m.record(Milestone::SmStart, now);
        m
    }

    /// Record `milestone` at `now`. A second capture keeps the first
    /// value, so timestamps never move backwards.
    pub fn record(&mut self, milestone: Milestone, now: Instant) {
        if self.stamps[milestone.index()].is_none() {
            debug_assert!(
                milestone
                    .predecessors()
                    .iter()
                    .all(|p| self.stamps[p.index()].is_none_or(|t| t <= now)),
                "milestone {milestone:?} recorded before a predecessor"
            );
            self.stamps[milestone.index()] = Some(now);
        }
    }

    /// Clear a milestone so a retry can re-record it (origin retries clear
    /// the connect/read marks).
    pub fn clear(&mut self, milestone: Milestone) {
        self.stamps[milestone.index()] = None;
    }

    /// Timestamp for `milestone`, if captured.
    #[must_use]
    pub fn get(&self, milestone: Milestone) -> Option<Instant> {
        self.stamps[milestone.index()]
    }

    /// Elapsed time between two captured milestones.
    #[must_use]
    pub fn elapsed(&self, from: Milestone, to: Milestone) -> Option<Duration> {
        Some(self.get(to)?.saturating_duration_since(self.get(from)?))
    }

    /// Add observer wall time to the active-API accumulator (time an
    /// observer held the transaction) and the total.
    pub fn add_api_time(&mut self, delta: Duration) {
        self.api_active += delta;
        self.api_total += delta;
    }

    /// Add scheduling overhead to the total-API accumulator only.
    pub fn add_api_overhead(&mut self, delta: Duration) {
        self.api_total += delta;
    }

    /// Time observers actively held the transaction.
    #[must_use]
    pub fn api_active(&self) -> Duration {
        self.api_active
    }

    /// Active time plus callout scheduling overhead.
    #[must_use]
    pub fn api_total(&self) -> Duration {
        self.api_total
    }

    /// Verify the capture order over everything recorded so far.
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        let all = [
            Milestone::SmStart,
            Milestone::UaBegin,
            Milestone::UaFirstRead,
            Milestone::UaReadHeaderDone,
            Milestone::CacheOpenReadBegin,
            Milestone::CacheOpenReadEnd,
            Milestone::CacheOpenWriteBegin,
            Milestone::CacheOpenWriteEnd,
            Milestone::DnsLookupBegin,
            Milestone::DnsLookupEnd,
            Milestone::ServerFirstConnect,
            Milestone::ServerConnect,
            Milestone::ServerConnectEnd,
            Milestone::ServerBeginWrite,
            Milestone::ServerFirstRead,
            Milestone::ServerReadHeaderDone,
            Milestone::ServerClose,
            Milestone::UaBeginWrite,
            Milestone::UaClose,
            Milestone::SmFinish,
        ];
        all.iter().all(|&m| {
            let Some(at) = self.get(m) else { return true };
            m.predecessors().iter().all(|&p| self.get(p).is_none_or(|t| t <= at))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let t0 = Instant::now();
        let mut m = Milestones::new(t0);
        m.record(Milestone::UaBegin, t0 + Duration::from_millis(1));
        m.record(Milestone::UaFirstRead, t0 + Duration::from_millis(2));
        m.record(Milestone::UaReadHeaderDone, t0 + Duration::from_millis(3));
        m.record(Milestone::DnsLookupBegin, t0 + Duration::from_millis(4));
        m.record(Milestone::DnsLookupEnd, t0 + Duration::from_millis(5));
        m.record(Milestone::UaBeginWrite, t0 + Duration::from_millis(6));
        m.record(Milestone::UaClose, t0 + Duration::from_millis(7));
        m.record(Milestone::SmFinish, t0 + Duration::from_millis(8));
        assert!(m.is_ordered());
    }

    #[test]
    fn double_record_keeps_first() {
        let t0 = Instant::now();
        let mut m = Milestones::new(t0);
        m.record(Milestone::UaBegin, t0 + Duration::from_millis(1));
        m.record(Milestone::UaBegin, t0 + Duration::from_millis(50));
        assert_eq!(m.get(Milestone::UaBegin), Some(t0 + Duration::from_millis(1)));
    }

    #[test]
    fn elapsed_between_milestones() {
        let t0 = Instant::now();
        let mut m = Milestones::new(t0);
        m.record(Milestone::UaBegin, t0 + Duration::from_millis(1));
        m.record(Milestone::UaFirstRead, t0 + Duration::from_millis(11));
        assert_eq!(
            m.elapsed(Milestone::UaBegin, Milestone::UaFirstRead),
            Some(Duration::from_millis(10))
        );
        assert_eq!(m.elapsed(Milestone::UaBegin, Milestone::SmFinish), None);
    }

    #[test]
    fn api_time_accumulates() {
        let mut m = Milestones::new(Instant::now());
        m.add_api_time(Duration::from_millis(5));
        m.add_api_overhead(Duration::from_millis(2));
        m.add_api_time(Duration::from_millis(3));
        assert_eq!(m.api_active(), Duration::from_millis(8));
        assert_eq!(m.api_total(), Duration::from_millis(10));
    }

    #[test]
    fn clear_allows_retry_recapture() {
        let t0 = Instant::now();
        let mut m = Milestones::new(t0);
        m.record(Milestone::UaBegin, t0);
        m.record(Milestone::UaFirstRead, t0);
        m.record(Milestone::UaReadHeaderDone, t0);
        m.record(Milestone::ServerFirstConnect, t0 + Duration::from_millis(1));
        m.clear(Milestone::ServerFirstConnect);
        m.record(Milestone::ServerFirstConnect, t0 + Duration::from_millis(9));
        assert_eq!(
            m.get(Milestone::ServerFirstConnect),
            Some(t0 + Duration::from_millis(9))
        );
    }
}
