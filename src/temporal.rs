use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;

/// Occurrence counts bucketed by time, covering a bounded horizon.
///
/// All ranges are half-open `[start, end)` over bucket start times, so an
/// event on a boundary is counted in exactly one window.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    bucket_secs: i64,
    horizon_buckets: i64,
    buckets: BTreeMap<i64, u64>,
    latest: Option<i64>,
}

impl SlidingWindow {
    pub fn new(bucket: Duration, horizon: Duration) -> Self {
        let bucket_secs = bucket.num_seconds().max(1);
        let horizon_buckets = (horizon.num_seconds() / bucket_secs).max(1);
        Self { bucket_secs, horizon_buckets, buckets: BTreeMap::new(), latest: None }
    }

    pub fn bucket_of(&self, t: DateTime<Utc>) -> i64 {
        t.timestamp().div_euclid(self.bucket_secs)
    }

    pub fn bucket_start(&self, bucket: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(bucket * self.bucket_secs, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn record(&mut self, t: DateTime<Utc>) {
        let b = self.bucket_of(t);
        *self.buckets.entry(b).or_insert(0) += 1;
        let latest = self.latest.map_or(b, |l| l.max(b));
        self.latest = Some(latest);
        self.prune(latest);
    }

    fn prune(&mut self, latest: i64) {
        let oldest_kept = latest - self.horizon_buckets + 1;
        while let Some((&b, _)) = self.buckets.first_key_value() {
            if b >= oldest_kept {
                break;
            }
            self.buckets.remove(&b);
        }
    }

    /// Sum of buckets in `[start, end)`.
    pub fn count_between(&self, start: i64, end: i64) -> u64 {
        if start >= end {
            return 0;
        }
        self.buckets.range(start..end).map(|(_, c)| *c).sum()
    }

    /// Count over the `n` buckets ending with (and including) `bucket`.
    pub fn count_trailing(&self, bucket: i64, n: i64) -> u64 {
        self.count_between(bucket - n + 1, bucket + 1)
    }

    pub fn bucket_secs(&self) -> i64 {
        self.bucket_secs
    }

    pub fn total(&self) -> u64 {
        self.buckets.values().sum()
    }
}

pub fn buckets_in(window: Duration, bucket_secs: i64) -> i64 {
    (window.num_seconds() / bucket_secs.max(1)).max(1)
}
