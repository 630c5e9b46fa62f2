//! Retransmission deadline tracking.
//!
//! Deadlines live in a coarse timing wheel: arming is O(1) and expiry
//! costs one bucket scan per elapsed bucket. Entries are weak handles that
//! the endpoint validates on expiry, so there is no cancellation path;
//! stale entries simply fail validation and fall out.

use std::collections::VecDeque;
use std::sync::OnceLock;

/// An armed deadline. Weak handle to a session slot; whoever receives an
/// expired entry must check generation and request number before acting.
#[derive(Debug, Clone, Copy)]
pub struct TimerEntry {
    /// Session number.
    pub session_num: u16,
    /// Session generation at arm time.
    pub generation: u32,
    /// Slot index within the session.
    pub slot_idx: usize,
    /// Request number the deadline belongs to.
    pub req_num: u32,
    /// Expiration timestamp (microseconds).
    pub expires_at: u64,
}

/// Coarse timing wheel.
///
/// Time is quantized into `bucket_us` buckets; a deadline lands in the
/// bucket its expiry falls into, and deadlines beyond the wheel's span
/// park at the far edge and are re-dispatched as the cursor reaches them.
pub struct TimingWheel {
    buckets: Vec<VecDeque<TimerEntry>>,
    bucket_us: u64,
    /// Index of the bucket the cursor sits on.
    cursor: usize,
    /// Timestamp of the cursor, always bucket-aligned.
    cursor_ts: u64,
}

impl TimingWheel {
    /// Create a wheel of `num_buckets` buckets of `bucket_us` each, with
    /// the cursor at `start_ts`.
    pub fn new(num_buckets: usize, bucket_us: u64, start_ts: u64) -> Self {
        debug_assert!(num_buckets >= 2 && bucket_us > 0);
        Self {
            buckets: vec![VecDeque::new(); num_buckets],
            bucket_us,
            cursor: 0,
            cursor_ts: start_ts,
        }
    }

    /// A wheel sized for datapath RTO tracking: 512 buckets of 50us, a
    /// 25.6ms span covering several multiples of the default timeout.
    pub fn for_rto_tracking(start_ts: u64) -> Self {
        Self::new(512, 50, start_ts)
    }

    /// The bucket a deadline belongs in, relative to the cursor. Already
    /// due deadlines land one bucket ahead so the next advance delivers
    /// them; deadlines past the span park at the far edge.
    fn bucket_for(&self, expires_at: u64) -> usize {
        let ahead = expires_at.saturating_sub(self.cursor_ts) / self.bucket_us;
        let ahead = ahead.clamp(1, self.buckets.len() as u64 - 1);
        (self.cursor + ahead as usize) % self.buckets.len()
    }

    /// Arm a deadline.
    pub fn insert(&mut self, entry: TimerEntry) {
        let bucket = self.bucket_for(entry.expires_at);
        self.buckets[bucket].push_back(entry);
    }

    /// Advance the cursor to `now`, pushing expired entries into `out`.
    ///
    /// The buffer is not cleared; the caller clears it between passes.
    /// The cursor timestamp stays bucket-aligned, so advances smaller
    /// than a bucket accumulate instead of silently stalling the wheel.
    pub fn advance_into(&mut self, now: u64, out: &mut Vec<TimerEntry>) {
        let steps = now.saturating_sub(self.cursor_ts) / self.bucket_us;
        if steps == 0 {
            return;
        }

        // Entries found before their time (parked at the edge, or due in
        // a later lap) go back on the wheel after the cursor has moved.
        let mut deferred = Vec::new();
        for _ in 0..steps.min(self.buckets.len() as u64) {
            while let Some(timer) = self.buckets[self.cursor].pop_front() {
                if timer.expires_at <= now {
                    out.push(timer);
                } else {
                    deferred.push(timer);
                }
            }
            self.cursor = (self.cursor + 1) % self.buckets.len();
        }
        self.cursor_ts += steps * self.bucket_us;

        for timer in deferred {
            self.insert(timer);
        }
    }

    /// Advance the cursor to `now`, returning expired entries.
    pub fn advance(&mut self, now: u64) -> Vec<TimerEntry> {
        let mut expired = Vec::new();
        self.advance_into(now, &mut expired);
        expired
    }

    /// Number of armed deadlines.
    pub fn active_count(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    /// Check whether no deadline is armed.
    pub fn is_empty(&self) -> bool {
        self.active_count() == 0
    }
}

static CLOCK_ANCHOR: OnceLock<minstant::Instant> = OnceLock::new();

/// Monotonic timestamp in microseconds since the first call.
#[inline]
pub fn current_time_us() -> u64 {
    let anchor = CLOCK_ANCHOR.get_or_init(minstant::Instant::now);
    anchor.elapsed().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deadline(req_num: u32, expires_at: u64) -> TimerEntry {
        TimerEntry {
            session_num: 0,
            generation: 0,
            slot_idx: 0,
            req_num,
            expires_at,
        }
    }

    #[test]
    fn test_deadline_fires_once_due() {
        let mut wheel = TimingWheel::new(16, 50, 0);
        wheel.insert(deadline(1, 400));
        assert_eq!(wheel.active_count(), 1);

        assert!(wheel.advance(350).is_empty());

        let fired = wheel.advance(450);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].req_num, 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_staggered_deadlines_fire_selectively() {
        let mut wheel = TimingWheel::new(32, 50, 1_000);
        for i in 0..4 {
            wheel.insert(deadline(i, 1_200 + i as u64 * 300));
        }

        // Due by 1600: the deadlines at 1200 and 1500, nothing else.
        let fired = wheel.advance(1_600);
        assert_eq!(fired.len(), 2);
        assert_eq!(wheel.active_count(), 2);
    }

    #[test]
    fn test_past_deadline_fires_on_next_advance() {
        let mut wheel = TimingWheel::new(16, 50, 500);
        wheel.insert(deadline(9, 450)); // already due at arm time
        let fired = wheel.advance(600);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].req_num, 9);
    }

    #[test]
    fn test_long_deadline_recycles_at_the_edge() {
        // 8 buckets of 50us: a 400us span, far below the deadline.
        let mut wheel = TimingWheel::new(8, 50, 0);
        wheel.insert(deadline(7, 2_000));

        assert!(wheel.advance(400).is_empty());
        assert_eq!(wheel.active_count(), 1);
        assert_eq!(wheel.advance(2_100).len(), 1);
    }

    #[test]
    fn test_subbucket_advances_accumulate() {
        let mut wheel = TimingWheel::new(16, 50, 0);
        wheel.insert(deadline(3, 75));

        // A busy event loop advances far more often than the bucket
        // width; the cursor must still make progress.
        let mut fired = Vec::new();
        for now in (5..=200).step_by(5) {
            wheel.advance_into(now, &mut fired);
        }
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].req_num, 3);
    }

    #[test]
    fn test_rto_tracking_defaults() {
        let mut wheel = TimingWheel::for_rto_tracking(0);
        // One default RTO (5ms) fits well inside the span.
        wheel.insert(deadline(1, 5_000));
        assert!(wheel.advance(4_900).is_empty());
        assert_eq!(wheel.advance(5_100).len(), 1);
    }

    #[test]
    fn test_clock_monotonic() {
        let a = current_time_us();
        let b = current_time_us();
        assert!(b >= a);
    }
}
