//! Live capture plumbing shared by the capture-mode counter source and the
//! top-talkers tracker.

use pcap::{Active, Capture, Device};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::MonitorError;
use crate::packet::{self, LinkLayer, PacketSummary};

/// Read timeout. A timeout is not an error; the loop re-checks shutdown and reads again.
pub const CAPTURE_TIMEOUT_MS: i32 = 100;
pub const IP_ONLY_FILTER: &str = "ip or ip6";

#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    pub promiscuous: bool,
    pub snaplen: i32,
}

/// The configured device, or every non-loopback device that has an address.
pub fn capture_devices(configured: Option<&str>) -> Result<Vec<String>, MonitorError> {
    if let Some(device) = configured {
        return Ok(vec![device.to_string()]);
    }
    let devices = Device::list().map_err(|source| MonitorError::CaptureUnavailable {
        device: "any".to_string(),
        source,
    })?;
    let names: Vec<String> = devices
        .into_iter()
        .filter(|d| d.name != "lo" && !d.addresses.is_empty())
        .map(|d| d.name)
        .collect();
    if names.is_empty() {
        return Err(MonitorError::NoCaptureDevices);
    }
    Ok(names)
}

pub struct PacketCapture {
    device: String,
    cap: Capture<Active>,
    link: LinkLayer,
}

impl PacketCapture {
    pub fn open(device: &str, settings: CaptureSettings) -> Result<Self, MonitorError> {
        let unavailable = |source| MonitorError::CaptureUnavailable {
            device: device.to_string(),
            source,
        };
        let mut cap = Capture::from_device(device)
            .map_err(unavailable)?
            .promisc(settings.promiscuous)
            .snaplen(settings.snaplen)
            .timeout(CAPTURE_TIMEOUT_MS)
            .open()
            .map_err(unavailable)?;

        if let Err(e) = cap.filter(IP_ONLY_FILTER, true) {
            warn!(device = %device, error = %e, "BPF filter error, capturing unfiltered.");
        }

        let linktype = cap.get_datalink().0;
        let link = LinkLayer::from_linktype(linktype).ok_or_else(|| {
            MonitorError::UnsupportedLinkType {
                device: device.to_string(),
                linktype,
            }
        })?;

        info!(device = %device, ?link, promiscuous = settings.promiscuous, "Capture opened.");
        Ok(Self {
            device: device.to_string(),
            cap,
            link,
        })
    }

    /// Blocking read loop. Calls `on_packet` with the classified packet and the
    /// on-wire frame length. Returns when shutdown is signalled or on a read error.
    pub fn run<F>(mut self, shutdown_rx: &watch::Receiver<()>, mut on_packet: F)
    where
        F: FnMut(&PacketSummary, u32),
    {
        loop {
            if shutdown_requested(shutdown_rx) {
                debug!(device = %self.device, "Shutdown signal received, closing capture.");
                break;
            }
            match self.cap.next_packet() {
                Ok(frame) => {
                    if let Some(summary) = packet::parse_frame(frame.data, self.link) {
                        on_packet(&summary, frame.header.len);
                    }
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => {
                    error!(
                        device = %self.device,
                        error = %e,
                        "Capture read error, stopping capture."
                    );
                    break;
                }
            }
        }
    }
}

/// True once the shutdown sender fired or was dropped.
pub fn shutdown_requested(shutdown_rx: &watch::Receiver<()>) -> bool {
    !matches!(shutdown_rx.has_changed(), Ok(false))
}
