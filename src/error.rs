use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    /// Missing privilege or missing device. Fatal to the collector that owns the capture.
    #[error("Capture unavailable on {device}: {source}")]
    CaptureUnavailable {
        device: String,
        #[source]
        source: pcap::Error,
    },
    #[error("No capture devices found")]
    NoCaptureDevices,
    #[error("Unsupported link type {linktype} on {device}")]
    UnsupportedLinkType { device: String, linktype: i32 },
    #[error("Failed to read counters from {}: {source}", path.display())]
    CounterRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Interface enumeration failed: {0}")]
    Enumeration(#[source] io::Error),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl MonitorError {
    /// Errors after which the owning worker should stop instead of retrying next tick.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MonitorError::CaptureUnavailable { .. }
                | MonitorError::NoCaptureDevices
                | MonitorError::UnsupportedLinkType { .. }
        )
    }
}
