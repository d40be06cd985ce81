//! Capture counter source: one pseudo-interface named after the capture
//! device, fed by a blocking pcap loop and classified by local-network
//! membership.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use super::{
    CounterValues, InterfaceCategory, InterfaceCounterSnapshot, InterfaceMeta, InterfaceReading,
    SourceReading,
};
use crate::capture::{CaptureSettings, PacketCapture};
use crate::error::MonitorError;
use crate::local_net::LocalNetworks;
use crate::locks;
use crate::packet::PacketSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Remote source, local destination.
    Rx,
    /// Local source, remote destination.
    Tx,
    /// Both ends local.
    Internal,
    /// Neither end local.
    Transit,
}

pub fn classify_direction(local: &LocalNetworks, src: &IpAddr, dst: &IpAddr) -> Direction {
    match (local.contains(src), local.contains(dst)) {
        (false, true) => Direction::Rx,
        (true, false) => Direction::Tx,
        (true, true) => Direction::Internal,
        (false, false) => Direction::Transit,
    }
}

/// The hot-path accumulator. Only this struct sits behind the narrow lock.
#[derive(Debug)]
pub struct DirectionCounter {
    local: Arc<LocalNetworks>,
    count_internal: bool,
    totals: Mutex<CounterValues>,
}

impl DirectionCounter {
    pub fn new(local: Arc<LocalNetworks>, count_internal: bool) -> Self {
        Self {
            local,
            count_internal,
            totals: Mutex::new(CounterValues::default()),
        }
    }

    pub fn record(&self, packet: &PacketSummary, wire_len: u32) {
        let bytes = u64::from(wire_len);
        let (rx, tx) = match classify_direction(&self.local, &packet.src, &packet.dst) {
            Direction::Rx => (true, false),
            Direction::Tx => (false, true),
            Direction::Internal if self.count_internal => (true, true),
            Direction::Internal | Direction::Transit => return,
        };
        let mut totals = locks::lock(&self.totals);
        if rx {
            totals.rx_bytes += bytes;
            totals.rx_packets += 1;
        }
        if tx {
            totals.tx_bytes += bytes;
            totals.tx_packets += 1;
        }
    }

    pub fn totals(&self) -> CounterValues {
        *locks::lock(&self.totals)
    }
}

pub struct CaptureSource {
    device: String,
    counter: Arc<DirectionCounter>,
    finished: Arc<AtomicBool>,
}

impl CaptureSource {
    /// Opens the device and starts the blocking read loop on the runtime's
    /// blocking pool. Must be called from within a tokio runtime. The
    /// returned handle completes once the loop observes shutdown.
    pub fn start(
        device: &str,
        settings: CaptureSettings,
        counter: Arc<DirectionCounter>,
        shutdown_rx: watch::Receiver<()>,
    ) -> Result<(Self, JoinHandle<()>), MonitorError> {
        let capture = PacketCapture::open(device, settings)?;
        Ok(Self::spawn_loop(device, counter, move |record| {
            capture.run(&shutdown_rx, record)
        }))
    }

    /// Runs `feed` on the blocking pool, recording every packet it reports,
    /// and marks the source finished when it returns.
    pub(crate) fn spawn_loop<F>(
        device: &str,
        counter: Arc<DirectionCounter>,
        feed: F,
    ) -> (Self, JoinHandle<()>)
    where
        F: FnOnce(&mut dyn FnMut(&PacketSummary, u32)) + Send + 'static,
    {
        let finished = Arc::new(AtomicBool::new(false));
        let loop_counter = counter.clone();
        let loop_finished = finished.clone();
        let loop_device = device.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            feed(&mut |packet: &PacketSummary, wire_len: u32| {
                loop_counter.record(packet, wire_len)
            });
            loop_finished.store(true, Ordering::Release);
            info!(device = %loop_device, "Capture counter loop stopped.");
        });

        (Self::from_parts(device, counter, finished), handle)
    }

    pub(crate) fn from_parts(
        device: &str,
        counter: Arc<DirectionCounter>,
        finished: Arc<AtomicBool>,
    ) -> Self {
        Self {
            device: device.to_string(),
            counter,
            finished,
        }
    }

    pub fn read(&self) -> SourceReading {
        let oper_state = if self.finished.load(Ordering::Acquire) {
            "down"
        } else {
            "up"
        };
        SourceReading {
            interfaces: vec![InterfaceReading {
                counters: InterfaceCounterSnapshot {
                    name: self.device.clone(),
                    values: self.counter.totals(),
                },
                meta: InterfaceMeta {
                    category: InterfaceCategory::Physical,
                    oper_state: oper_state.to_string(),
                    ..Default::default()
                },
            }],
            authoritative: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{IpVersion, Protocol};

    fn local() -> Arc<LocalNetworks> {
        Arc::new(LocalNetworks::new(vec!["192.168.1.0/24".parse().unwrap()]))
    }

    fn packet(src: &str, dst: &str) -> PacketSummary {
        PacketSummary {
            src: src.parse().unwrap(),
            dst: dst.parse().unwrap(),
            length: 60,
            protocol: Protocol::Tcp,
            ip_version: IpVersion::V4,
        }
    }

    #[test]
    fn test_classify_direction() {
        let local = local();
        let lan: IpAddr = "192.168.1.10".parse().unwrap();
        let wan: IpAddr = "8.8.8.8".parse().unwrap();
        assert_eq!(classify_direction(&local, &wan, &lan), Direction::Rx);
        assert_eq!(classify_direction(&local, &lan, &wan), Direction::Tx);
        assert_eq!(classify_direction(&local, &lan, &lan), Direction::Internal);
        assert_eq!(classify_direction(&local, &wan, &wan), Direction::Transit);
    }

    #[test]
    fn test_internal_traffic_not_counted_by_default() {
        let counter = DirectionCounter::new(local(), false);
        counter.record(&packet("8.8.8.8", "192.168.1.10"), 100);
        counter.record(&packet("192.168.1.10", "8.8.8.8"), 40);
        counter.record(&packet("192.168.1.10", "192.168.1.11"), 1000);
        counter.record(&packet("1.1.1.1", "8.8.8.8"), 1000);

        let totals = counter.totals();
        assert_eq!(totals.rx_bytes, 100);
        assert_eq!(totals.rx_packets, 1);
        assert_eq!(totals.tx_bytes, 40);
        assert_eq!(totals.tx_packets, 1);
    }

    #[test]
    fn test_internal_traffic_double_counted_when_enabled() {
        let counter = DirectionCounter::new(local(), true);
        counter.record(&packet("192.168.1.10", "192.168.1.11"), 1000);
        let totals = counter.totals();
        assert_eq!(totals.rx_bytes, 1000);
        assert_eq!(totals.tx_bytes, 1000);
    }

    #[test]
    fn test_read_reports_single_pseudo_interface() {
        let counter = Arc::new(DirectionCounter::new(local(), false));
        counter.record(&packet("8.8.8.8", "192.168.1.10"), 500);
        let finished = Arc::new(AtomicBool::new(false));
        let source = CaptureSource::from_parts("eth1", counter, finished.clone());

        let reading = source.read();
        assert!(!reading.authoritative);
        assert_eq!(reading.interfaces.len(), 1);
        let iface = &reading.interfaces[0];
        assert_eq!(iface.counters.name, "eth1");
        assert_eq!(iface.counters.values.rx_bytes, 500);
        assert_eq!(iface.meta.oper_state, "up");

        finished.store(true, Ordering::Release);
        assert_eq!(source.read().interfaces[0].meta.oper_state, "down");
    }

    #[tokio::test]
    async fn test_spawned_loop_handle_completes_and_marks_down() {
        let counter = Arc::new(DirectionCounter::new(local(), false));
        let (source, handle) = CaptureSource::spawn_loop("eth2", counter, |record| {
            record(&packet("8.8.8.8", "192.168.1.10"), 1500);
            record(&packet("192.168.1.10", "8.8.8.8"), 60);
        });

        handle.await.unwrap();
        let reading = source.read();
        let iface = &reading.interfaces[0];
        assert_eq!(iface.counters.name, "eth2");
        assert_eq!(iface.counters.values.rx_bytes, 1500);
        assert_eq!(iface.counters.values.tx_bytes, 60);
        assert_eq!(iface.meta.oper_state, "down");
    }
}
