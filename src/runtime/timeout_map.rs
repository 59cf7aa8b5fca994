//! Cache of common timer durations.
//!
//! Most timers on a worker use a handful of durations over and over (the
//! one-second housekeeping tick, the zero timeout used by the delay check,
//! retry intervals). For those the reactor keeps one FIFO lane per duration:
//! every deadline in a lane is "now + the same duration", so lanes stay sorted
//! by construction and arming is a push instead of a heap insert.
//!
//! `TimeoutMap` hands out the handle for such a lane. It caches at most
//! [`MAX_FAST_TIMEOUTS`] distinct durations; past that, callers get an
//! uncached [`Timeout::Plain`] that goes through the reactor's heap.

use std::collections::HashMap;
use std::time::Duration;

/// Maximum number of distinct durations served from FIFO lanes.
pub const MAX_FAST_TIMEOUTS: usize = 200;

/// A duration usable to arm a reactor timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeout {
    /// Cached duration with its own lane in the issuing reactor.
    Common {
        reactor_id: u64,
        lane: usize,
        duration: Duration,
    },
    /// Uncached duration, scheduled through the timer heap.
    Plain(Duration),
}

impl Timeout {
    pub fn duration(&self) -> Duration {
        match *self {
            Timeout::Common { duration, .. } => duration,
            Timeout::Plain(duration) => duration,
        }
    }

    pub fn is_common(&self) -> bool {
        matches!(self, Timeout::Common { .. })
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Timeout::Plain(duration)
    }
}

/// Duration → lane mapping for one reactor.
#[derive(Debug)]
pub struct TimeoutMap {
    reactor_id: u64,
    lanes: HashMap<Duration, usize>,
    max_size: usize,
}

impl TimeoutMap {
    pub fn new(reactor_id: u64, max_size: usize) -> Self {
        Self {
            reactor_id,
            lanes: HashMap::with_capacity(max_size.min(16)),
            max_size,
        }
    }

    /// Get a timeout for `duration`.
    ///
    /// Repeated calls with the same duration return the same handle while the
    /// cache has room. Once full, new durations get a fresh `Timeout::Plain`.
    pub fn get(&mut self, duration: Duration) -> Timeout {
        if let Some(&lane) = self.lanes.get(&duration) {
            return self.common(lane, duration);
        }
        if self.lanes.len() >= self.max_size {
            return Timeout::Plain(duration);
        }

        let lane = self.lanes.len();
        self.lanes.insert(duration, lane);
        self.common(lane, duration)
    }

    /// Number of cached durations.
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lanes.len() >= self.max_size
    }

    fn common(&self, lane: usize, duration: Duration) -> Timeout {
        Timeout::Common {
            reactor_id: self.reactor_id,
            lane,
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_duration_same_handle() {
        let mut map = TimeoutMap::new(7, 4);
        let a = map.get(Duration::from_secs(1));
        let b = map.get(Duration::from_millis(1000));
        assert_eq!(a, b);
        assert!(a.is_common());
        assert_eq!(map.len(), 1);

        let zero = map.get(Duration::ZERO);
        assert_ne!(zero, a);
        assert_eq!(zero.duration(), Duration::ZERO);
    }

    #[test]
    fn test_overflow_falls_back_to_plain() {
        let mut map = TimeoutMap::new(7, 2);
        map.get(Duration::from_millis(1));
        map.get(Duration::from_millis(2));
        assert!(map.is_full());

        let t = map.get(Duration::from_millis(3));
        assert_eq!(t, Timeout::Plain(Duration::from_millis(3)));
        assert_eq!(map.len(), 2);

        // Cached entries keep working after the cache filled up.
        assert!(map.get(Duration::from_millis(2)).is_common());
    }
}
