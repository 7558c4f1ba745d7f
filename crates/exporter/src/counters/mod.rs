//! Sliding-window counters over cumulative hardware event counts.
//!
//! The collection loop is the single writer for any given
//! (device, event class) bucket; the exposition path reads
//! concurrently. Buckets live in a `DashMap`, so locking stays
//! bucket-shard local and never spans a call into the monitoring
//! binding.

use std::collections::VecDeque;
use std::fmt;
use std::time::SystemTime;

use dashmap::DashMap;
use tracing::debug;

/// Event classes counted cumulatively per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    /// Hardware/driver XID error events.
    Xid,
    /// Clock throttle/event occurrences.
    ClockThrottle,
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventClass::Xid => write!(f, "xid"),
            EventClass::ClockThrottle => write!(f, "clock_throttle"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Reading {
    cumulative: u64,
    timestamp: SystemTime,
}

/// Bounded ring of timestamped cumulative readings per
/// (device, event class).
pub struct WindowedEventCounter {
    window_size: usize,
    buckets: DashMap<(String, EventClass), VecDeque<Reading>>,
}

impl WindowedEventCounter {
    /// `window_size` bounds retained samples per bucket (count, not
    /// wall time).
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            buckets: DashMap::new(),
        }
    }

    /// Appends a cumulative reading, evicting the oldest beyond the
    /// window.
    pub fn record(&self, device: &str, class: EventClass, cumulative: u64, timestamp: SystemTime) {
        let mut bucket = self
            .buckets
            .entry((device.to_string(), class))
            .or_default();
        if let Some(previous) = bucket.back() {
            if cumulative < previous.cumulative {
                debug!(
                    device,
                    class = %class,
                    previous = previous.cumulative,
                    current = cumulative,
                    gap = ?timestamp
                        .duration_since(previous.timestamp)
                        .unwrap_or_default(),
                    "Cumulative counter went backwards, treating as a reset"
                );
            }
        }
        bucket.push_back(Reading {
            cumulative,
            timestamp,
        });
        while bucket.len() > self.window_size {
            bucket.pop_front();
        }
    }

    /// Difference between the newest and oldest retained reading within
    /// the last `window` samples. A wrapped counter (newest < oldest,
    /// from 32/64-bit overflow or a device reset) yields the newest
    /// value alone, never a negative delta. An empty window yields 0.
    pub fn query_delta(&self, device: &str, class: EventClass, window: usize) -> u64 {
        if window == 0 {
            return 0;
        }
        let Some(bucket) = self.buckets.get(&(device.to_string(), class)) else {
            return 0;
        };
        let Some(newest) = bucket.back() else {
            return 0;
        };
        let oldest = bucket[bucket.len() - window.min(bucket.len())];
        if newest.cumulative < oldest.cumulative {
            newest.cumulative
        } else {
            newest.cumulative - oldest.cumulative
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record_sequence(counter: &WindowedEventCounter, device: &str, values: &[u64]) {
        let start = SystemTime::UNIX_EPOCH;
        for (i, value) in values.iter().enumerate() {
            counter.record(
                device,
                EventClass::Xid,
                *value,
                start + Duration::from_secs(i as u64),
            );
        }
    }

    #[test]
    fn delta_spans_newest_to_oldest_in_window() {
        let counter = WindowedEventCounter::new(4);
        record_sequence(&counter, "gpu-0", &[10, 15, 15, 22]);
        assert_eq!(counter.query_delta("gpu-0", EventClass::Xid, 4), 12);
    }

    #[test]
    fn reset_yields_post_reset_value_never_negative() {
        let counter = WindowedEventCounter::new(4);
        record_sequence(&counter, "gpu-0", &[10, 15, 15, 22, 5]);
        // Window now holds [15, 15, 22, 5]; newest < oldest.
        assert_eq!(counter.query_delta("gpu-0", EventClass::Xid, 4), 5);
    }

    #[test]
    fn empty_window_yields_zero() {
        let counter = WindowedEventCounter::new(4);
        assert_eq!(counter.query_delta("gpu-0", EventClass::Xid, 4), 0);
    }

    #[test]
    fn oldest_readings_evict_beyond_window_size() {
        let counter = WindowedEventCounter::new(2);
        record_sequence(&counter, "gpu-0", &[1, 100, 103]);
        // The reading of 1 was evicted; delta covers [100, 103] only.
        assert_eq!(counter.query_delta("gpu-0", EventClass::Xid, 2), 3);
    }

    #[test]
    fn query_window_narrower_than_retained_samples() {
        let counter = WindowedEventCounter::new(8);
        record_sequence(&counter, "gpu-0", &[1, 5, 9, 13]);
        assert_eq!(counter.query_delta("gpu-0", EventClass::Xid, 2), 4);
        assert_eq!(counter.query_delta("gpu-0", EventClass::Xid, 100), 12);
        assert_eq!(counter.query_delta("gpu-0", EventClass::Xid, 0), 0);
    }

    #[test]
    fn buckets_are_independent_per_device_and_class() {
        let counter = WindowedEventCounter::new(4);
        counter.record("gpu-0", EventClass::Xid, 7, SystemTime::UNIX_EPOCH);
        counter.record("gpu-1", EventClass::Xid, 50, SystemTime::UNIX_EPOCH);
        counter.record("gpu-0", EventClass::ClockThrottle, 3, SystemTime::UNIX_EPOCH);
        assert_eq!(counter.query_delta("gpu-0", EventClass::Xid, 4), 0);
        assert_eq!(counter.query_delta("gpu-1", EventClass::Xid, 4), 0);
        counter.record("gpu-0", EventClass::Xid, 9, SystemTime::UNIX_EPOCH);
        assert_eq!(counter.query_delta("gpu-0", EventClass::Xid, 4), 2);
        assert_eq!(
            counter.query_delta("gpu-0", EventClass::ClockThrottle, 4),
            0
        );
    }
}
