//! Query façade and lifecycle.
//!
//! A [`Monitor`] is built once at startup, started explicitly, and handed by
//! reference to whatever serves the data. Every accessor returns a copy.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::capture::{self, CaptureSettings};
use crate::collector::source::capture::DirectionCounter;
use crate::collector::source::{CaptureSource, CounterSource, KernelSource};
use crate::collector::{self, Collector, HistoryLimits, HistoryPoint, InterfaceState, SparkPoint};
use crate::config::{MonitorConfig, SourceMode};
use crate::geo::GeoLookup;
use crate::local_net::LocalNetworks;
use crate::locks;
use crate::packet::{IpVersion, Protocol};
use crate::talkers::resolver::{HostnameCache, SystemResolver};
use crate::talkers::{self, AsnStat, CountryStat, TalkerStat, Tracker};

pub const SPARKLINE_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const SPARKLINE_POINTS: usize = 50;
pub const DASHBOARD_TOP_N: usize = 10;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct InterfaceSummary {
    pub name: String,
    pub rx_rate: f64,
    pub tx_rate: f64,
    pub state: String,
}

/// Compact snapshot for small widgets.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Summary {
    pub interfaces: Vec<InterfaceSummary>,
    pub vpn: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpn_iface: Option<String>,
    pub timestamp: i64,
}

/// Everything a live dashboard needs in one push.
#[derive(Serialize, Debug, Clone)]
pub struct Dashboard {
    pub interfaces: Vec<InterfaceState>,
    pub sparklines: BTreeMap<String, Vec<SparkPoint>>,
    pub protocols: BTreeMap<Protocol, u64>,
    pub ip_versions: BTreeMap<IpVersion, u64>,
    pub countries: Vec<CountryStat>,
    pub asns: Vec<AsnStat>,
    pub top_bandwidth: Vec<TalkerStat>,
    pub top_volume: Vec<TalkerStat>,
    pub timestamp: i64,
}

pub struct Monitor {
    config: MonitorConfig,
    local: Arc<LocalNetworks>,
    collector: Arc<Collector>,
    tracker: Arc<Tracker>,
    shutdown_tx: watch::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Monitor {
    /// Builds every component. Nothing runs until [`Monitor::start`].
    pub fn new(config: MonitorConfig, geo: Option<Arc<dyn GeoLookup>>) -> Self {
        let local = Arc::new(LocalNetworks::from_config(&config.local_nets));
        Self::with_local_networks(config, local, geo)
    }

    pub fn with_local_networks(
        config: MonitorConfig,
        local: Arc<LocalNetworks>,
        geo: Option<Arc<dyn GeoLookup>>,
    ) -> Self {
        let collector = Arc::new(Collector::new(HistoryLimits {
            max_age: config.history_max_age,
            max_points: config.history_max_points,
        }));
        let hostnames = if config.resolve_hostnames {
            HostnameCache::new(Arc::new(SystemResolver))
        } else {
            HostnameCache::disabled()
        };
        let tracker = Arc::new(Tracker::new(
            local.clone(),
            config.bucket_interval,
            config.talker_window,
            hostnames,
            geo,
        ));
        let (shutdown_tx, _) = watch::channel(());
        Self {
            config,
            local,
            collector,
            tracker,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawns every worker. Must be called from within a tokio runtime.
    /// Capture failures are logged and leave the affected component idle;
    /// they never fail the call.
    pub fn start(&self) {
        let mut tasks = locks::lock(&self.tasks);
        if !tasks.is_empty() {
            warn!("Monitor already started.");
            return;
        }
        let settings = CaptureSettings {
            promiscuous: self.config.promiscuous,
            snaplen: self.config.snaplen,
        };

        if let Some(source) = self.counter_source(settings, &mut tasks) {
            tasks.push(tokio::spawn(collector::rate_collection_loop(
                self.collector.clone(),
                source,
                self.config.poll_interval,
                self.shutdown_tx.subscribe(),
            )));
        }

        match capture::capture_devices(self.config.device.as_deref()) {
            Ok(devices) => {
                for device in devices {
                    match talkers::spawn_capture(
                        self.tracker.clone(),
                        &device,
                        settings,
                        self.shutdown_tx.subscribe(),
                    ) {
                        Ok(handle) => tasks.push(handle),
                        Err(e) => {
                            error!(device = %device, error = %e, "Cannot open talker capture.")
                        }
                    }
                }
            }
            Err(e) => {
                error!(
                    error = %e,
                    "Cannot list capture devices; top talkers need root or CAP_NET_RAW."
                )
            }
        }
        tasks.push(tokio::spawn(talkers::rotation_loop(
            self.tracker.clone(),
            self.config.bucket_interval,
            self.shutdown_tx.subscribe(),
        )));

        info!(
            mode = ?self.config.mode,
            local_networks = self.local.networks().len(),
            workers = tasks.len(),
            "Monitor started."
        );
    }

    /// Builds the configured counter source. A capture source's blocking loop
    /// handle joins `tasks` so `stop` waits for it.
    fn counter_source(
        &self,
        settings: CaptureSettings,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> Option<CounterSource> {
        match self.config.mode {
            SourceMode::Kernel => Some(CounterSource::Kernel(KernelSource::new(
                self.config.proc_net_dev.clone(),
                self.config.sysfs_root.clone(),
                self.config.vpn_status_files.clone(),
            ))),
            SourceMode::Capture => {
                let device = match capture::capture_devices(self.config.device.as_deref()) {
                    Ok(devices) => devices.into_iter().next()?,
                    Err(e) => {
                        error!(
                            error = %e,
                            "No device for capture counter source; rates stay empty."
                        );
                        return None;
                    }
                };
                let counter = Arc::new(DirectionCounter::new(
                    self.local.clone(),
                    self.config.count_internal_traffic,
                ));
                let shutdown_rx = self.shutdown_tx.subscribe();
                match CaptureSource::start(&device, settings, counter, shutdown_rx) {
                    Ok((source, handle)) => {
                        tasks.push(handle);
                        Some(CounterSource::Capture(source))
                    }
                    Err(e) => {
                        error!(
                            device = %device,
                            error = %e,
                            "Capture counter source unavailable; rates stay empty."
                        );
                        None
                    }
                }
            }
        }
    }

    /// Signals every worker and waits for them to exit.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(());
        let tasks = std::mem::take(&mut *locks::lock(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Worker ended abnormally.");
            }
        }
        info!("Monitor stopped.");
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub fn interfaces(&self) -> Vec<InterfaceState> {
        self.collector.interfaces()
    }

    pub fn history(&self) -> HashMap<String, Vec<HistoryPoint>> {
        self.collector.history()
    }

    pub fn interface_history(&self, name: &str) -> Vec<HistoryPoint> {
        self.collector.interface_history(name)
    }

    pub fn rate_series(
        &self,
        name: &str,
        window: Duration,
        max_points: usize,
    ) -> Vec<HistoryPoint> {
        self.collector.rate_series(name, window, max_points)
    }

    pub fn sparklines(
        &self,
        window: Duration,
        max_points: usize,
    ) -> BTreeMap<String, Vec<SparkPoint>> {
        self.collector.sparklines(window, max_points)
    }

    pub fn top_by_rate(&self, n: usize) -> Vec<TalkerStat> {
        self.tracker.top_by_rate(n)
    }

    pub fn top_by_volume(&self, n: usize) -> Vec<TalkerStat> {
        self.tracker.top_by_volume(n)
    }

    pub fn protocol_breakdown(&self) -> BTreeMap<Protocol, u64> {
        self.tracker.protocol_breakdown()
    }

    pub fn ip_version_breakdown(&self) -> BTreeMap<IpVersion, u64> {
        self.tracker.ip_version_breakdown()
    }

    pub fn country_breakdown(&self) -> Vec<CountryStat> {
        self.tracker.country_breakdown()
    }

    pub fn asn_breakdown(&self) -> Vec<AsnStat> {
        self.tracker.asn_breakdown()
    }

    pub fn summary(&self) -> Summary {
        summarize(&self.collector.interfaces(), crate::now_ms())
    }

    pub fn dashboard(&self) -> Dashboard {
        Dashboard {
            interfaces: self.collector.interfaces(),
            sparklines: self.collector.sparklines(SPARKLINE_WINDOW, SPARKLINE_POINTS),
            protocols: self.tracker.protocol_breakdown(),
            ip_versions: self.tracker.ip_version_breakdown(),
            countries: self.tracker.country_breakdown(),
            asns: self.tracker.asn_breakdown(),
            top_bandwidth: self.tracker.top_by_rate(DASHBOARD_TOP_N),
            top_volume: self.tracker.top_by_volume(DASHBOARD_TOP_N),
            timestamp: crate::now_ms(),
        }
    }
}

fn summarize(interfaces: &[InterfaceState], now_ms: i64) -> Summary {
    // The last routing interface wins when more than one reports routing.
    let vpn_iface = interfaces
        .iter()
        .rev()
        .find(|i| i.vpn_routing)
        .map(|i| i.name.clone());
    Summary {
        interfaces: interfaces
            .iter()
            .map(|i| InterfaceSummary {
                name: i.name.clone(),
                rx_rate: i.rx_rate,
                tx_rate: i.tx_rate,
                state: i.oper_state.clone(),
            })
            .collect(),
        vpn: vpn_iface.is_some(),
        vpn_iface,
        timestamp: now_ms,
    }
}
