use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

use crate::packet::{IpVersion, Protocol};

/// Upper bound on sealed buckets: 24h of one-minute buckets.
pub const MAX_SEALED_BUCKETS: usize = 1440;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostAccum {
    pub bytes: u64,
    pub packets: u64,
}

impl HostAccum {
    pub fn add(&mut self, other: HostAccum) {
        self.bytes += other.bytes;
        self.packets += other.packets;
    }
}

/// One fixed-duration aggregation window.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub start_ms: i64,
    pub hosts: HashMap<IpAddr, HostAccum>,
    pub proto_bytes: [u64; 4],
    pub ip_version_bytes: [u64; 2],
}

impl Bucket {
    pub fn new(start_ms: i64) -> Self {
        Self {
            start_ms,
            hosts: HashMap::new(),
            proto_bytes: [0; 4],
            ip_version_bytes: [0; 2],
        }
    }

    pub fn add_host(&mut self, ip: IpAddr, bytes: u64) {
        let accum = self.hosts.entry(ip).or_default();
        accum.bytes += bytes;
        accum.packets += 1;
    }

    pub fn add_totals(&mut self, protocol: Protocol, ip_version: IpVersion, bytes: u64) {
        self.proto_bytes[protocol.index()] += bytes;
        self.ip_version_bytes[ip_version.index()] += bytes;
    }
}

/// Start of the bucket containing `ts_ms`.
pub fn align(ts_ms: i64, bucket_ms: i64) -> i64 {
    if bucket_ms <= 0 {
        return ts_ms;
    }
    ts_ms - ts_ms.rem_euclid(bucket_ms)
}

/// Immutable sealed buckets, oldest first.
#[derive(Debug)]
pub struct SealedBuckets {
    buckets: VecDeque<Bucket>,
    window_ms: i64,
    max_buckets: usize,
}

impl SealedBuckets {
    pub fn new(window: Duration, bucket_interval: Duration) -> Self {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let bucket_ms = bucket_interval.as_millis().max(1);
        let max_buckets = usize::try_from(window.as_millis().div_ceil(bucket_ms))
            .unwrap_or(MAX_SEALED_BUCKETS)
            .clamp(1, MAX_SEALED_BUCKETS);
        Self {
            buckets: VecDeque::with_capacity(max_buckets),
            window_ms,
            max_buckets,
        }
    }

    /// Appends `bucket` and prunes everything that fell out of the window.
    /// Returns how many buckets were dropped.
    pub fn seal(&mut self, bucket: Bucket, now_ms: i64) -> usize {
        self.buckets.push_back(bucket);
        let cutoff = now_ms.saturating_sub(self.window_ms);
        let mut pruned = 0;
        while self
            .buckets
            .front()
            .is_some_and(|b| b.start_ms < cutoff || self.buckets.len() > self.max_buckets)
        {
            self.buckets.pop_front();
            pruned += 1;
        }
        pruned
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.iter()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn oldest_start(&self) -> Option<i64> {
        self.buckets.front().map(|b| b.start_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE_MS: i64 = 60_000;

    #[test]
    fn test_align_truncates_to_bucket_start() {
        assert_eq!(align(125_000, MINUTE_MS), 120_000);
        assert_eq!(align(120_000, MINUTE_MS), 120_000);
        assert_eq!(align(-1, MINUTE_MS), -MINUTE_MS);
    }

    #[test]
    fn test_bucket_accumulates() {
        let mut bucket = Bucket::new(0);
        let ip: IpAddr = "8.8.8.8".parse().unwrap();
        bucket.add_host(ip, 100);
        bucket.add_host(ip, 50);
        bucket.add_totals(Protocol::Udp, IpVersion::V4, 150);
        assert_eq!(bucket.hosts[&ip], HostAccum { bytes: 150, packets: 2 });
        assert_eq!(bucket.proto_bytes[Protocol::Udp.index()], 150);
        assert_eq!(bucket.ip_version_bytes[IpVersion::V4.index()], 150);
    }

    #[test]
    fn test_window_stabilizes_at_one_day_of_minutes() {
        let mut sealed = SealedBuckets::new(Duration::from_secs(86_400), Duration::from_secs(60));
        let mut now = 0i64;
        for _ in 0..(25 * 60) {
            let start = align(now, MINUTE_MS);
            now += MINUTE_MS;
            sealed.seal(Bucket::new(start), now);
            assert!(sealed.len() <= MAX_SEALED_BUCKETS);
            assert!(sealed.oldest_start().unwrap() >= now - 86_400_000);
        }
        assert_eq!(sealed.len(), MAX_SEALED_BUCKETS);
    }

    #[test]
    fn test_short_window_prunes_by_age() {
        let mut sealed = SealedBuckets::new(Duration::from_secs(300), Duration::from_secs(60));
        for i in 0..10 {
            sealed.seal(Bucket::new(i * MINUTE_MS), (i + 1) * MINUTE_MS);
        }
        assert_eq!(sealed.len(), 5);
        assert_eq!(sealed.oldest_start(), Some(5 * MINUTE_MS));
    }
}
