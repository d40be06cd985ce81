//! Decides whether an address belongs to the "local" network set.
//!
//! The set is either the configured CIDR list or, when none is configured, a
//! snapshot of the host's own non-loopback, non-link-local interface networks
//! taken once at startup.

use ipnet::IpNet;
use std::net::IpAddr;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct LocalNetworks {
    nets: Vec<IpNet>,
}

impl LocalNetworks {
    pub fn new(nets: Vec<IpNet>) -> Self {
        Self { nets }
    }

    /// Configured CIDRs when any are given, otherwise auto-discovery.
    pub fn from_config(cidrs: &[String]) -> Self {
        if cidrs.is_empty() {
            let discovered = Self::discover();
            if !discovered.nets.is_empty() {
                info!(
                    count = discovered.nets.len(),
                    "LOCAL_NETS: auto-discovered network(s) from interfaces."
                );
                for net in &discovered.nets {
                    info!(network = %net, "Local network.");
                }
            } else {
                warn!("LOCAL_NETS: no local networks configured or discovered; all traffic is external.");
            }
            return discovered;
        }

        let nets = parse_cidrs(cidrs);
        info!(count = nets.len(), "LOCAL_NETS: network(s) from configuration.");
        Self { nets }
    }

    /// One-time snapshot of the host's interface networks.
    pub fn discover() -> Self {
        let mut nets = Vec::new();
        for iface in netdev::get_interfaces() {
            let v4 = iface
                .ipv4
                .iter()
                .map(|n| (IpAddr::V4(n.addr()), n.prefix_len()));
            let v6 = iface
                .ipv6
                .iter()
                .map(|n| (IpAddr::V6(n.addr()), n.prefix_len()));
            for (addr, prefix) in v4.chain(v6) {
                if addr.is_loopback() || is_link_local(&addr) {
                    continue;
                }
                if let Ok(net) = IpNet::new(addr, prefix) {
                    let net = net.trunc();
                    if !nets.contains(&net) {
                        nets.push(net);
                    }
                }
            }
        }
        Self { nets }
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(addr))
    }

    /// Unparsable input is not local; no error is raised.
    pub fn contains_str(&self, addr: &str) -> bool {
        addr.trim()
            .parse::<IpAddr>()
            .map(|ip| self.contains(&ip))
            .unwrap_or(false)
    }

    pub fn networks(&self) -> &[IpNet] {
        &self.nets
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

fn parse_cidrs(cidrs: &[String]) -> Vec<IpNet> {
    let mut nets = Vec::with_capacity(cidrs.len());
    for raw in cidrs {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        match raw.parse::<IpNet>() {
            Ok(net) => nets.push(net.trunc()),
            // A bare address is accepted as a host route.
            Err(e) => match raw.parse::<IpAddr>() {
                Ok(addr) => nets.push(host_net(addr)),
                Err(_) => warn!(cidr = %raw, error = %e, "LOCAL_NETS: invalid CIDR, skipping."),
            },
        }
    }
    nets
}

fn host_net(addr: IpAddr) -> IpNet {
    match addr {
        IpAddr::V4(v4) => IpNet::V4(ipnet::Ipv4Net::from(v4)),
        IpAddr::V6(v6) => IpNet::V6(ipnet::Ipv6Net::from(v6)),
    }
}

fn is_link_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        // fe80::/10
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}
