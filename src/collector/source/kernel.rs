//! Kernel counter source: cumulative per-interface counters from procfs plus
//! sysfs-derived classification.

use procfs::FromRead;
use procfs::ProcResult;
use procfs::net::InterfaceDeviceStatus;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{
    CounterValues, InterfaceCategory, InterfaceCounterSnapshot, InterfaceMeta, InterfaceReading,
    SourceReading,
};
use crate::error::MonitorError;

const ARPHRD_PPP: &str = "512";
const ARPHRD_LOOPBACK: &str = "772";
const ARPHRD_NONE: &str = "65534";

pub struct KernelSource {
    proc_net_dev: PathBuf,
    sysfs_root: PathBuf,
    vpn_status_files: HashMap<String, PathBuf>,
    // Classification never changes for a name during the process lifetime.
    category_cache: HashMap<String, InterfaceCategory>,
    resolve_addresses: bool,
}

impl KernelSource {
    pub fn new(
        proc_net_dev: PathBuf,
        sysfs_root: PathBuf,
        vpn_status_files: HashMap<String, PathBuf>,
    ) -> Self {
        Self {
            proc_net_dev,
            sysfs_root,
            vpn_status_files,
            category_cache: HashMap::new(),
            resolve_addresses: true,
        }
    }

    /// Skip host address enumeration; used when the procfs/sysfs roots are fixtures.
    pub fn without_addresses(mut self) -> Self {
        self.resolve_addresses = false;
        self
    }

    pub fn read(&mut self) -> Result<SourceReading, MonitorError> {
        let file = File::open(&self.proc_net_dev).map_err(|source| MonitorError::CounterRead {
            path: self.proc_net_dev.clone(),
            source,
        })?;
        let snapshots = parse_proc_net_dev(file).map_err(|e| {
            MonitorError::Enumeration(io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
        })?;

        let mut addresses = if self.resolve_addresses {
            interface_addresses()
        } else {
            HashMap::new()
        };

        let interfaces = snapshots
            .into_iter()
            .map(|counters| {
                let name = counters.name.as_str();
                let category = self.category(name);
                let vpn_file = self.vpn_status_files.get(name);
                let (vpn_routing, vpn_routing_since) =
                    vpn_routing_status(vpn_file.map(PathBuf::as_path));
                let meta = InterfaceMeta {
                    category,
                    oper_state: read_oper_state(&self.sysfs_root, name),
                    addrs: addresses.remove(name).unwrap_or_default(),
                    vpn_routing,
                    vpn_routing_since,
                    vpn_tracked: vpn_file.is_some(),
                };
                InterfaceReading { counters, meta }
            })
            .collect();

        Ok(SourceReading {
            interfaces,
            authoritative: true,
        })
    }

    fn category(&mut self, name: &str) -> InterfaceCategory {
        if let Some(category) = self.category_cache.get(name) {
            return *category;
        }
        let category = detect_category(&self.sysfs_root, name);
        debug!(interface = %name, ?category, "Detected interface category.");
        self.category_cache.insert(name.to_string(), category);
        category
    }
}

/// Reads `/proc/net/dev` contents through procfs. The first two lines are
/// headers; any malformed interface line fails the whole read. Snapshots are
/// sorted by name.
pub fn parse_proc_net_dev<R: Read>(reader: R) -> ProcResult<Vec<InterfaceCounterSnapshot>> {
    let InterfaceDeviceStatus(devices) = InterfaceDeviceStatus::from_read(reader)?;
    let mut snapshots: Vec<InterfaceCounterSnapshot> = devices
        .into_values()
        .map(|dev| InterfaceCounterSnapshot {
            values: CounterValues {
                rx_bytes: dev.recv_bytes,
                rx_packets: dev.recv_packets,
                rx_errors: dev.recv_errs,
                rx_dropped: dev.recv_drop,
                tx_bytes: dev.sent_bytes,
                tx_packets: dev.sent_packets,
                tx_errors: dev.sent_errs,
                tx_dropped: dev.sent_drop,
            },
            name: dev.name,
        })
        .collect();
    snapshots.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(snapshots)
}

/// First match wins: vendor marker, DEVTYPE, ARPHRD type, then name prefix.
pub fn detect_category(sysfs_root: &Path, name: &str) -> InterfaceCategory {
    let base = sysfs_root.join(name);

    // 1. WireGuard exposes its own sysfs directory.
    if base.join("wireguard").exists() {
        return InterfaceCategory::Vpn;
    }

    // 2. DEVTYPE from uevent
    if let Ok(uevent) = fs::read_to_string(base.join("uevent")) {
        let devtype = uevent
            .lines()
            .find_map(|line| line.strip_prefix("DEVTYPE="))
            .map(str::trim);
        match devtype {
            Some("vlan") => return InterfaceCategory::Vlan,
            // bridges and bonds are grouped with physical links
            Some("bridge" | "bond") => return InterfaceCategory::Physical,
            Some("ppp") => return InterfaceCategory::Ppp,
            Some(
                "wireguard" | "gre" | "gretap" | "ip6gre" | "ip6tnl" | "ipip" | "sit" | "vti"
                | "vti6" | "ipsec" | "xfrm",
            ) => return InterfaceCategory::Vpn,
            _ => {}
        }
    }

    // 3. ARPHRD_* hardware type
    if let Ok(hw_type) = fs::read_to_string(base.join("type")) {
        match hw_type.trim() {
            ARPHRD_LOOPBACK => return InterfaceCategory::Loopback,
            // WireGuard was ruled out above; remaining NONE types are tunnels.
            ARPHRD_NONE => return InterfaceCategory::Vpn,
            ARPHRD_PPP => return InterfaceCategory::Ppp,
            _ => {}
        }
    }

    // 4. Name-based fallback
    let n = name.to_lowercase();
    if ["tun", "tap", "wg", "ipsec"].iter().any(|p| n.starts_with(p)) {
        return InterfaceCategory::Vpn;
    }
    if ["ppp", "wwan", "lte"].iter().any(|p| n.starts_with(p)) {
        return InterfaceCategory::Ppp;
    }
    if n.contains('.') {
        return InterfaceCategory::Vlan;
    }
    InterfaceCategory::Physical
}

fn read_oper_state(sysfs_root: &Path, name: &str) -> String {
    fs::read_to_string(sysfs_root.join(name).join("operstate"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// The sentinel's existence means traffic is routed through the VPN; its
/// content is surfaced as the "since" value.
fn vpn_routing_status(sentinel: Option<&Path>) -> (bool, Option<String>) {
    let Some(path) = sentinel else {
        return (false, None);
    };
    match fs::read_to_string(path) {
        Ok(contents) => {
            let since = contents.trim();
            (true, (!since.is_empty()).then(|| since.to_string()))
        }
        Err(_) => (false, None),
    }
}

/// `addr/prefix` strings per interface name.
fn interface_addresses() -> HashMap<String, Vec<String>> {
    netdev::get_interfaces()
        .into_iter()
        .map(|iface| {
            let v4 = iface
                .ipv4
                .iter()
                .map(|n| format!("{}/{}", n.addr(), n.prefix_len()));
            let v6 = iface
                .ipv6
                .iter()
                .map(|n| format!("{}/{}", n.addr(), n.prefix_len()));
            let addrs: Vec<String> = v4.chain(v6).collect();
            (iface.name, addrs)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PROC_NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 1000      10    0    0    0     0          0         0     1000      10    0    0    0     0       0          0
  eth0: 123456   789    1    2    0     0          0         5   654321     987    3    4    0     0       0          0
   wg0:     500       5    0    0    0     0          0         0      600       6    0    0    0     0       0          0
";

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_parse_proc_net_dev() {
        let snapshots = parse_proc_net_dev(PROC_NET_DEV.as_bytes()).unwrap();
        let names: Vec<&str> = snapshots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["eth0", "lo", "wg0"]);

        let eth0 = &snapshots[0].values;
        assert_eq!(eth0.rx_bytes, 123_456);
        assert_eq!(eth0.rx_packets, 789);
        assert_eq!(eth0.rx_errors, 1);
        assert_eq!(eth0.rx_dropped, 2);
        assert_eq!(eth0.tx_bytes, 654_321);
        assert_eq!(eth0.tx_packets, 987);
        assert_eq!(eth0.tx_errors, 3);
        assert_eq!(eth0.tx_dropped, 4);
        assert_eq!(snapshots[2].values.tx_bytes, 600);
    }

    #[test]
    fn test_parse_header_only_is_empty() {
        let header: String = PROC_NET_DEV.lines().take(2).map(|l| format!("{l}\n")).collect();
        assert!(parse_proc_net_dev(header.as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_line_is_enumeration_error() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "proc/net/dev", &format!("{PROC_NET_DEV} bad0: 1 2 3\n"));
        let mut source =
            KernelSource::new(root.join("proc/net/dev"), root.join("sys"), HashMap::new())
                .without_addresses();
        assert!(matches!(source.read(), Err(MonitorError::Enumeration(_))));
    }

    #[test]
    fn test_detect_category_signal_order() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("wg0/wireguard")).unwrap();
        write(root, "eth0.10/uevent", "INTERFACE=eth0.10\nDEVTYPE=vlan\n");
        write(root, "br0/uevent", "DEVTYPE=bridge\n");
        write(root, "gre1/uevent", "DEVTYPE=gre\n");
        write(root, "lo/type", "772\n");
        write(root, "mytunnel/type", "65534\n");
        write(root, "modem/type", "512\n");
        // DEVTYPE beats the name heuristic.
        write(root, "tunbridge/uevent", "DEVTYPE=bridge\n");

        assert_eq!(detect_category(root, "wg0"), InterfaceCategory::Vpn);
        assert_eq!(detect_category(root, "eth0.10"), InterfaceCategory::Vlan);
        assert_eq!(detect_category(root, "br0"), InterfaceCategory::Physical);
        assert_eq!(detect_category(root, "gre1"), InterfaceCategory::Vpn);
        assert_eq!(detect_category(root, "lo"), InterfaceCategory::Loopback);
        assert_eq!(detect_category(root, "mytunnel"), InterfaceCategory::Vpn);
        assert_eq!(detect_category(root, "modem"), InterfaceCategory::Ppp);
        assert_eq!(detect_category(root, "tunbridge"), InterfaceCategory::Physical);
    }

    #[test]
    fn test_detect_category_name_fallback() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        assert_eq!(detect_category(root, "tun0"), InterfaceCategory::Vpn);
        assert_eq!(detect_category(root, "tap3"), InterfaceCategory::Vpn);
        assert_eq!(detect_category(root, "wg-home"), InterfaceCategory::Vpn);
        assert_eq!(detect_category(root, "ipsec0"), InterfaceCategory::Vpn);
        assert_eq!(detect_category(root, "ppp0"), InterfaceCategory::Ppp);
        assert_eq!(detect_category(root, "wwan0"), InterfaceCategory::Ppp);
        assert_eq!(detect_category(root, "LTE1"), InterfaceCategory::Ppp);
        assert_eq!(detect_category(root, "enp3s0.42"), InterfaceCategory::Vlan);
        assert_eq!(detect_category(root, "enp3s0"), InterfaceCategory::Physical);
    }

    #[test]
    fn test_read_collects_meta_and_vpn_sentinel() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "proc/net/dev", PROC_NET_DEV);
        write(root, "sys/eth0/operstate", "up\n");
        write(root, "run/wg0.active", "2024-05-01T10:00:00Z\n");

        let mut vpn_files = HashMap::new();
        vpn_files.insert("wg0".to_string(), root.join("run/wg0.active"));
        vpn_files.insert("eth0".to_string(), root.join("run/missing"));

        let mut source = KernelSource::new(root.join("proc/net/dev"), root.join("sys"), vpn_files)
            .without_addresses();
        let reading = source.read().unwrap();
        assert!(reading.authoritative);
        assert_eq!(reading.interfaces.len(), 3);

        let by_name = |n: &str| {
            reading
                .interfaces
                .iter()
                .find(|r| r.counters.name == n)
                .unwrap()
                .meta
                .clone()
        };
        let eth0 = by_name("eth0");
        assert_eq!(eth0.oper_state, "up");
        assert!(eth0.vpn_tracked);
        assert!(!eth0.vpn_routing);

        let wg0 = by_name("wg0");
        assert_eq!(wg0.category, InterfaceCategory::Vpn);
        assert_eq!(wg0.oper_state, "unknown");
        assert!(wg0.vpn_routing);
        assert_eq!(wg0.vpn_routing_since.as_deref(), Some("2024-05-01T10:00:00Z"));

        let lo = by_name("lo");
        assert!(!lo.vpn_tracked);
    }

    #[test]
    fn test_category_is_cached_per_name() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "proc/net/dev", PROC_NET_DEV);
        let mut source =
            KernelSource::new(root.join("proc/net/dev"), root.join("sys"), HashMap::new())
                .without_addresses();
        source.read().unwrap();
        // A later sysfs change is not picked up for an already classified name.
        write(root, "sys/eth0/uevent", "DEVTYPE=vlan\n");
        source.read().unwrap();
        assert_eq!(source.category("eth0"), InterfaceCategory::Physical);
    }

    #[test]
    fn test_missing_proc_file_is_counter_read_error() {
        let dir = TempDir::new().unwrap();
        let mut source = KernelSource::new(
            dir.path().join("nope"),
            dir.path().to_path_buf(),
            HashMap::new(),
        );
        assert!(matches!(source.read(), Err(MonitorError::CounterRead { .. })));
    }
}
