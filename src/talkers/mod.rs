//! Packet classifier and top-talkers tracker.
//!
//! Every captured packet is attributed to its non-local endpoints inside the
//! currently open bucket. A rotation worker seals buckets into a rolling
//! window; queries aggregate over the window at read time.

pub mod bucket;
pub mod resolver;

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::capture::{CaptureSettings, PacketCapture};
use crate::error::MonitorError;
use crate::geo::{GeoCache, GeoLookup};
use crate::local_net::LocalNetworks;
use crate::locks;
use crate::packet::{IpVersion, PacketSummary, Protocol};
use bucket::{Bucket, HostAccum, SealedBuckets, align};
use resolver::HostnameCache;

const MAX_BREAKDOWN_ENTRIES: usize = 20;
const UNKNOWN_COUNTRY_CODE: &str = "XX";
const UNKNOWN_COUNTRY_NAME: &str = "Unknown";

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TalkerStat {
    pub ip: IpAddr,
    pub hostname: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub country: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub country_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asn: Option<u32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub as_org: String,
    pub total_bytes: u64,
    pub rate_bytes: f64,
    pub packets: u64,
}

impl TalkerStat {
    fn new(ip: IpAddr, accum: HostAccum) -> Self {
        Self {
            ip,
            hostname: String::new(),
            country: String::new(),
            country_name: String::new(),
            asn: None,
            as_org: String::new(),
            total_bytes: accum.bytes,
            rate_bytes: 0.0,
            packets: accum.packets,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CountryStat {
    pub country: String,
    pub country_name: String,
    pub bytes: u64,
    pub connections: usize,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AsnStat {
    pub asn: u32,
    pub as_org: String,
    pub bytes: u64,
    pub connections: usize,
}

pub struct Tracker {
    local: Arc<LocalNetworks>,
    bucket_ms: i64,
    /// Hot path lock; only the open bucket lives here.
    current: Mutex<Bucket>,
    /// Lock order: `sealed` before `current`.
    sealed: RwLock<SealedBuckets>,
    hostnames: HostnameCache,
    geo: Option<GeoCache>,
}

impl Tracker {
    pub fn new(
        local: Arc<LocalNetworks>,
        bucket_interval: Duration,
        window: Duration,
        hostnames: HostnameCache,
        geo: Option<Arc<dyn GeoLookup>>,
    ) -> Self {
        Self::new_at(local, bucket_interval, window, hostnames, geo, crate::now_ms())
    }

    pub fn new_at(
        local: Arc<LocalNetworks>,
        bucket_interval: Duration,
        window: Duration,
        hostnames: HostnameCache,
        geo: Option<Arc<dyn GeoLookup>>,
        now_ms: i64,
    ) -> Self {
        let bucket_ms = i64::try_from(bucket_interval.as_millis())
            .unwrap_or(i64::MAX)
            .max(1);
        Self {
            local,
            bucket_ms,
            current: Mutex::new(Bucket::new(align(now_ms, bucket_ms))),
            sealed: RwLock::new(SealedBuckets::new(window, bucket_interval)),
            hostnames,
            geo: geo.map(GeoCache::new),
        }
    }

    /// Hot path: attribute one packet to the open bucket. Each external
    /// endpoint is credited, so a self-addressed external packet counts twice.
    pub fn record(&self, packet: &PacketSummary) {
        let src_external = !self.local.contains(&packet.src);
        let dst_external = !self.local.contains(&packet.dst);

        let mut current = locks::lock(&self.current);
        if src_external {
            current.add_host(packet.src, packet.length);
        }
        if dst_external {
            current.add_host(packet.dst, packet.length);
        }
        current.add_totals(packet.protocol, packet.ip_version, packet.length);
    }

    pub fn rotate(&self) {
        self.rotate_at(crate::now_ms());
    }

    /// Seals the open bucket and opens a fresh one aligned to `now_ms`.
    pub fn rotate_at(&self, now_ms: i64) {
        let mut sealed = locks::write(&self.sealed);
        let finished = {
            let mut current = locks::lock(&self.current);
            std::mem::replace(&mut *current, Bucket::new(align(now_ms, self.bucket_ms)))
        };
        let hosts = finished.hosts.len();
        let pruned = sealed.seal(finished, now_ms);
        debug!(hosts, pruned, retained = sealed.len(), "Rotated talker bucket.");
    }

    pub fn sealed_len(&self) -> usize {
        locks::read(&self.sealed).len()
    }

    pub fn oldest_bucket_start(&self) -> Option<i64> {
        locks::read(&self.sealed).oldest_start()
    }

    /// Per-IP totals across the sealed window plus the open bucket.
    fn host_totals(&self) -> HashMap<IpAddr, HostAccum> {
        let sealed = locks::read(&self.sealed);
        let mut totals: HashMap<IpAddr, HostAccum> = HashMap::new();
        for bucket in sealed.iter() {
            for (ip, accum) in &bucket.hosts {
                totals.entry(*ip).or_default().add(*accum);
            }
        }
        let current = locks::lock(&self.current);
        for (ip, accum) in &current.hosts {
            totals.entry(*ip).or_default().add(*accum);
        }
        totals
    }

    pub fn top_by_volume(&self, n: usize) -> Vec<TalkerStat> {
        let mut list: Vec<TalkerStat> = self
            .host_totals()
            .into_iter()
            .map(|(ip, accum)| TalkerStat::new(ip, accum))
            .collect();
        list.sort_by(|a, b| b.total_bytes.cmp(&a.total_bytes).then(a.ip.cmp(&b.ip)));
        list.truncate(n);
        list.iter_mut().for_each(|s| self.enrich(s));
        list
    }

    pub fn top_by_rate(&self, n: usize) -> Vec<TalkerStat> {
        self.top_by_rate_at(n, crate::now_ms())
    }

    /// Open bucket only: rate = bucket bytes / max(1, seconds since it opened).
    pub fn top_by_rate_at(&self, n: usize, now_ms: i64) -> Vec<TalkerStat> {
        let mut list: Vec<TalkerStat> = {
            let current = locks::lock(&self.current);
            let elapsed_secs = ((now_ms - current.start_ms) as f64 / 1000.0).max(1.0);
            current
                .hosts
                .iter()
                .map(|(ip, accum)| {
                    let mut stat = TalkerStat::new(*ip, *accum);
                    stat.rate_bytes = accum.bytes as f64 / elapsed_secs;
                    stat
                })
                .collect()
        };
        list.sort_by(|a, b| {
            b.rate_bytes
                .total_cmp(&a.rate_bytes)
                .then(a.ip.cmp(&b.ip))
        });
        list.truncate(n);
        list.iter_mut().for_each(|s| self.enrich(s));
        list
    }

    fn enrich(&self, stat: &mut TalkerStat) {
        stat.hostname = self.hostnames.resolve(stat.ip);
        if let Some(info) = self.geo.as_ref().and_then(|g| g.lookup(stat.ip)) {
            stat.country = info.country;
            stat.country_name = info.country_name;
            stat.asn = info.asn;
            stat.as_org = info.as_org;
        }
    }

    /// Bytes per L4 protocol over the retained window; zero entries omitted.
    pub fn protocol_breakdown(&self) -> BTreeMap<Protocol, u64> {
        let mut totals = [0u64; 4];
        self.for_each_bucket(|b| {
            for (total, bytes) in totals.iter_mut().zip(b.proto_bytes) {
                *total += bytes;
            }
        });
        Protocol::ALL
            .into_iter()
            .map(|p| (p, totals[p.index()]))
            .filter(|(_, bytes)| *bytes > 0)
            .collect()
    }

    pub fn ip_version_breakdown(&self) -> BTreeMap<IpVersion, u64> {
        let mut totals = [0u64; 2];
        self.for_each_bucket(|b| {
            for (total, bytes) in totals.iter_mut().zip(b.ip_version_bytes) {
                *total += bytes;
            }
        });
        IpVersion::ALL
            .into_iter()
            .map(|v| (v, totals[v.index()]))
            .filter(|(_, bytes)| *bytes > 0)
            .collect()
    }

    fn for_each_bucket(&self, mut f: impl FnMut(&Bucket)) {
        let sealed = locks::read(&self.sealed);
        sealed.iter().for_each(&mut f);
        f(&*locks::lock(&self.current));
    }

    /// Top countries by bytes. Addresses without a geo result land in `XX`.
    pub fn country_breakdown(&self) -> Vec<CountryStat> {
        let Some(geo) = &self.geo else {
            return Vec::new();
        };
        let mut countries: HashMap<String, CountryStat> = HashMap::new();
        for (ip, accum) in self.host_totals() {
            let (code, name) = match geo.lookup(ip) {
                Some(info) if !info.country.is_empty() => (info.country, info.country_name),
                _ => (
                    UNKNOWN_COUNTRY_CODE.to_string(),
                    UNKNOWN_COUNTRY_NAME.to_string(),
                ),
            };
            let entry = countries.entry(code.clone()).or_insert_with(|| CountryStat {
                country: code,
                country_name: name,
                bytes: 0,
                connections: 0,
            });
            entry.bytes += accum.bytes;
            entry.connections += 1;
        }
        let mut result: Vec<CountryStat> = countries.into_values().collect();
        result.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.country.cmp(&b.country)));
        result.truncate(MAX_BREAKDOWN_ENTRIES);
        result
    }

    /// Top autonomous systems by bytes. Addresses without an ASN are omitted.
    pub fn asn_breakdown(&self) -> Vec<AsnStat> {
        let Some(geo) = &self.geo else {
            return Vec::new();
        };
        let mut asns: HashMap<u32, AsnStat> = HashMap::new();
        for (ip, accum) in self.host_totals() {
            let Some(info) = geo.lookup(ip) else {
                continue;
            };
            let Some(asn) = info.asn.filter(|asn| *asn != 0) else {
                continue;
            };
            let entry = asns.entry(asn).or_insert_with(|| AsnStat {
                asn,
                as_org: info.as_org,
                bytes: 0,
                connections: 0,
            });
            entry.bytes += accum.bytes;
            entry.connections += 1;
        }
        let mut result: Vec<AsnStat> = asns.into_values().collect();
        result.sort_by(|a, b| b.bytes.cmp(&a.bytes).then(a.asn.cmp(&b.asn)));
        result.truncate(MAX_BREAKDOWN_ENTRIES);
        result
    }
}

/// Opens `device` and feeds the tracker from the blocking pool until shutdown.
pub fn spawn_capture(
    tracker: Arc<Tracker>,
    device: &str,
    settings: CaptureSettings,
    shutdown_rx: watch::Receiver<()>,
) -> Result<JoinHandle<()>, MonitorError> {
    let capture = PacketCapture::open(device, settings)?;
    let device = device.to_string();
    Ok(tokio::task::spawn_blocking(move || {
        capture.run(&shutdown_rx, |packet, _wire_len| tracker.record(packet));
        info!(device = %device, "Talker capture loop stopped.");
    }))
}

pub async fn rotation_loop(
    tracker: Arc<Tracker>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; the open bucket is fresh.
    ticker.tick().await;
    info!(interval_secs = interval.as_secs(), "Talker bucket rotation task started.");

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                info!("Shutdown signal received, terminating bucket rotation loop.");
                break;
            }

            _ = ticker.tick() => tracker.rotate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::tests::StaticGeo;
    use crate::packet;
    use crate::packet::tests::{ipv4_packet, ipv6_packet};
    use std::net::{Ipv4Addr, Ipv6Addr};

    const MINUTE: Duration = Duration::from_secs(60);
    const DAY: Duration = Duration::from_secs(86_400);
    const TCP: u8 = 6;
    const UDP: u8 = 17;

    fn tracker_at(now_ms: i64, geo: Option<Arc<dyn GeoLookup>>) -> Tracker {
        let local = LocalNetworks::new(vec![
            "192.168.1.0/24".parse().unwrap(),
            "fd00::/8".parse().unwrap(),
        ]);
        Tracker::new_at(Arc::new(local), MINUTE, DAY, HostnameCache::disabled(), geo, now_ms)
    }

    fn v4(src: [u8; 4], dst: [u8; 4], proto: u8, len: u16) -> PacketSummary {
        let ip = ipv4_packet(Ipv4Addr::from(src), Ipv4Addr::from(dst), proto, len);
        packet::parse_ip(&ip).unwrap()
    }

    #[test]
    fn test_volume_scenario_single_external_peer() {
        let tracker = tracker_at(0, None);
        for len in [100, 200, 300] {
            tracker.record(&v4([203, 0, 113, 5], [192, 168, 1, 10], TCP, len));
        }
        let top = tracker.top_by_volume(1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].ip, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)));
        assert_eq!(top[0].total_bytes, 600);
        assert_eq!(top[0].packets, 3);
        assert_eq!(top[0].hostname, "203.0.113.5");
    }

    #[test]
    fn test_both_external_roles_attributed() {
        let tracker = tracker_at(0, None);
        tracker.record(&v4([1, 1, 1, 1], [8, 8, 8, 8], TCP, 1000));

        let top = tracker.top_by_volume(10);
        assert_eq!(top.len(), 2);
        assert!(top.iter().all(|s| s.total_bytes == 1000 && s.packets == 1));
        assert_eq!(tracker.protocol_breakdown()[&Protocol::Tcp], 1000);
        assert_eq!(tracker.ip_version_breakdown()[&IpVersion::V4], 1000);
    }

    #[test]
    fn test_self_addressed_external_packet_counts_for_both_roles() {
        let tracker = tracker_at(0, None);
        tracker.record(&v4([8, 8, 8, 8], [8, 8, 8, 8], UDP, 100));

        let top = tracker.top_by_volume(10);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].total_bytes, 200);
        assert_eq!(top[0].packets, 2);
        assert_eq!(tracker.protocol_breakdown()[&Protocol::Udp], 100);
    }

    #[test]
    fn test_ipv6_length_includes_fixed_header() {
        let tracker = tracker_at(0, None);
        let summary = packet::parse_ip(&ipv6_packet(
            Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1),
            "fd00::10".parse().unwrap(),
            UDP,
            100,
        ))
        .unwrap();
        tracker.record(&summary);

        let top = tracker.top_by_volume(10);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].total_bytes, 140);
        assert_eq!(tracker.protocol_breakdown()[&Protocol::Udp], 140);
        assert_eq!(tracker.ip_version_breakdown()[&IpVersion::V6], 140);
    }

    #[test]
    fn test_local_to_local_counts_only_totals() {
        let tracker = tracker_at(0, None);
        tracker.record(&v4([192, 168, 1, 2], [192, 168, 1, 3], UDP, 500));
        assert!(tracker.top_by_volume(10).is_empty());
        assert!(tracker.top_by_rate(10).is_empty());
        assert_eq!(tracker.protocol_breakdown().get(&Protocol::Udp), Some(&500));
        assert!(tracker.protocol_breakdown().get(&Protocol::Tcp).is_none());
    }

    #[test]
    fn test_empty_tracker_returns_empty_results() {
        let tracker = tracker_at(0, None);
        assert!(tracker.top_by_volume(5).is_empty());
        assert!(tracker.top_by_rate_at(5, 30_000).is_empty());
        assert!(tracker.protocol_breakdown().is_empty());
        assert!(tracker.ip_version_breakdown().is_empty());
        assert!(tracker.country_breakdown().is_empty());
        assert!(tracker.asn_breakdown().is_empty());
    }

    #[test]
    fn test_top_n_bounded_and_sorted() {
        let tracker = tracker_at(0, None);
        for i in 1..=20u8 {
            tracker.record(&v4([198, 51, 100, i], [192, 168, 1, 1], TCP, 100 + u16::from(i) * 10));
        }
        let top = tracker.top_by_volume(5);
        assert_eq!(top.len(), 5);
        assert!(top.windows(2).all(|w| w[0].total_bytes > w[1].total_bytes));
        assert_eq!(top[0].total_bytes, 300);

        let by_rate = tracker.top_by_rate_at(5, 10_000);
        assert_eq!(by_rate.len(), 5);
        assert!(by_rate.windows(2).all(|w| w[0].rate_bytes > w[1].rate_bytes));
        assert!(tracker.top_by_volume(0).is_empty());
    }

    #[test]
    fn test_rate_uses_open_bucket_only() {
        let tracker = tracker_at(0, None);
        let peer = [203, 0, 113, 9];
        tracker.record(&v4(peer, [192, 168, 1, 10], TCP, 6_000));
        tracker.rotate_at(60_000);
        tracker.record(&v4(peer, [192, 168, 1, 10], TCP, 1_000));

        // 1000 bytes, 10 seconds into the bucket opened at 60s.
        let by_rate = tracker.top_by_rate_at(1, 70_000);
        assert_eq!(by_rate[0].total_bytes, 1_000);
        assert_eq!(by_rate[0].rate_bytes, 100.0);

        // Less than a second elapsed divides by one.
        assert_eq!(tracker.top_by_rate_at(1, 60_200)[0].rate_bytes, 1_000.0);

        assert_eq!(tracker.top_by_volume(1)[0].total_bytes, 7_000);
    }

    #[test]
    fn test_rotation_over_25_hours_stabilizes() {
        let tracker = tracker_at(0, None);
        for minute in 1..=(25 * 60) {
            let now = minute * 60_000;
            tracker.record(&v4([203, 0, 113, 1], [192, 168, 1, 1], TCP, 100));
            tracker.rotate_at(now);
            assert!(tracker.sealed_len() <= bucket::MAX_SEALED_BUCKETS);
            assert!(tracker.oldest_bucket_start().unwrap() >= now - DAY.as_millis() as i64);
        }
        assert_eq!(tracker.sealed_len(), 1440);
        assert_eq!(tracker.top_by_volume(1)[0].packets, 1440);
    }

    #[test]
    fn test_country_and_asn_breakdowns() {
        let geo = StaticGeo::default()
            .with("1.1.1.1", "AU", Some(13335), "Cloudflare")
            .with("1.0.0.1", "AU", Some(13335), "Cloudflare")
            .with("8.8.8.8", "US", Some(15169), "Google");
        let tracker = tracker_at(0, Some(Arc::new(geo)));
        let lan = [192, 168, 1, 10];
        tracker.record(&v4([1, 1, 1, 1], lan, TCP, 400));
        tracker.record(&v4([1, 0, 0, 1], lan, TCP, 400));
        tracker.record(&v4([8, 8, 8, 8], lan, UDP, 500));
        tracker.record(&v4([9, 9, 9, 9], lan, UDP, 50));

        let countries = tracker.country_breakdown();
        assert_eq!(countries.len(), 3);
        assert_eq!(countries[0].country, "AU");
        assert_eq!(countries[0].bytes, 800);
        assert_eq!(countries[0].connections, 2);
        assert_eq!(countries[1].country, "US");
        assert_eq!(countries[2].country, "XX");
        assert_eq!(countries[2].country_name, "Unknown");

        let asns = tracker.asn_breakdown();
        assert_eq!(asns.len(), 2);
        assert_eq!(asns[0].asn, 13335);
        assert_eq!(asns[0].connections, 2);
        assert_eq!(asns[1].as_org, "Google");

        let top = tracker.top_by_volume(1);
        assert_eq!(top[0].country, "US");
        assert_eq!(top[0].country_name, "US land");
        assert_eq!(top[0].asn, Some(15169));
    }

    #[tokio::test]
    async fn test_rotation_loop_stops_on_shutdown() {
        let tracker = Arc::new(tracker_at(crate::now_ms(), None));
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let handle = tokio::spawn(rotation_loop(
            tracker.clone(),
            Duration::from_millis(10),
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown_tx.send_replace(());
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(tracker.sealed_len() >= 1);
    }
}
