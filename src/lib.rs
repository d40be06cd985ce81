pub mod capture;
pub mod collector;
pub mod config;
pub mod error;
pub mod geo;
pub mod local_net;
pub mod locks;
pub mod monitor;
pub mod packet;
pub mod talkers;
pub mod version;

pub use error::MonitorError;
pub use monitor::Monitor;

/// Wall-clock unix milliseconds; every tick and bucket timestamp uses this clock.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
