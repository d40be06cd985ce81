//! Counter sources feeding the rate collector. The variant is chosen once at
//! startup; the collector only ever sees [`SourceReading`]s.

pub mod capture;
pub mod kernel;

use serde::Serialize;

use crate::error::MonitorError;

pub use capture::CaptureSource;
pub use kernel::KernelSource;

/// Cumulative counter values at one instant.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterValues {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

/// A point-in-time cumulative reading for one interface.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct InterfaceCounterSnapshot {
    pub name: String,
    #[serde(flatten)]
    pub values: CounterValues,
}

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceCategory {
    #[default]
    Physical,
    Vlan,
    Ppp,
    Vpn,
    Loopback,
}

/// Auxiliary classification that travels with each reading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceMeta {
    pub category: InterfaceCategory,
    pub oper_state: String,
    pub addrs: Vec<String>,
    pub vpn_routing: bool,
    pub vpn_routing_since: Option<String>,
    pub vpn_tracked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceReading {
    pub counters: InterfaceCounterSnapshot,
    pub meta: InterfaceMeta,
}

/// Everything one tick of a source produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceReading {
    pub interfaces: Vec<InterfaceReading>,
    /// When set, the reading is a full enumeration: tracked interfaces missing
    /// from it are dropped.
    pub authoritative: bool,
}

pub enum CounterSource {
    Kernel(KernelSource),
    Capture(CaptureSource),
}

impl CounterSource {
    pub fn read(&mut self) -> Result<SourceReading, MonitorError> {
        match self {
            CounterSource::Kernel(source) => source.read(),
            CounterSource::Capture(source) => Ok(source.read()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CounterSource::Kernel(_) => "kernel",
            CounterSource::Capture(_) => "capture",
        }
    }
}
