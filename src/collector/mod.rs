//! Rate & history collector.
//!
//! One worker turns cumulative counter readings into per-interface rates and
//! a bounded rate history. Readers always receive copies.

pub mod history;
pub mod source;

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::locks;
pub use history::{History, HistoryLimits, HistoryPoint, SparkPoint, downsample};
pub use source::{
    CounterSource, CounterValues, InterfaceCategory, InterfaceMeta, InterfaceReading,
    SourceReading,
};

/// Current view of one tracked interface.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct InterfaceState {
    pub name: String,
    #[serde(rename = "type")]
    pub category: InterfaceCategory,
    pub oper_state: String,
    pub addrs: Vec<String>,
    pub vpn_routing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpn_routing_since: Option<String>,
    pub vpn_tracked: bool,
    #[serde(flatten)]
    pub counters: CounterValues,
    pub rx_rate: f64,
    pub tx_rate: f64,
    /// Last sample time, unix milliseconds.
    pub timestamp: i64,
}

#[derive(Default)]
struct CollectorState {
    interfaces: BTreeMap<String, InterfaceState>,
    history: HashMap<String, History>,
}

enum RateOutcome {
    Computed(f64, f64),
    /// First sample or non-positive elapsed time; keep whatever was there.
    Skipped,
    /// Counters went backwards; treat as a reset and publish zero.
    Reset,
}

pub struct Collector {
    state: RwLock<CollectorState>,
    limits: HistoryLimits,
}

impl Collector {
    pub fn new(limits: HistoryLimits) -> Self {
        Self {
            state: RwLock::new(CollectorState::default()),
            limits,
        }
    }

    pub fn limits(&self) -> HistoryLimits {
        self.limits
    }

    /// One aggregation tick: rates, history append, pruning, new baseline.
    pub fn apply_reading(&self, reading: SourceReading, now_ms: i64) {
        let mut guard = locks::write(&self.state);
        let state = &mut *guard;

        if reading.authoritative {
            let present: Vec<&str> = reading
                .interfaces
                .iter()
                .map(|r| r.counters.name.as_str())
                .collect();
            state.interfaces.retain(|name, _| {
                let keep = present.contains(&name.as_str());
                if !keep {
                    info!(interface = %name, "Interface disappeared, dropping state and history.");
                }
                keep
            });
            state
                .history
                .retain(|name, _| present.contains(&name.as_str()));
        }

        for InterfaceReading { counters, meta } in reading.interfaces {
            let previous = state.interfaces.get(&counters.name);
            let outcome = match previous {
                Some(prev) => compute_rate(&counters.name, prev, &counters.values, now_ms),
                None => {
                    debug!(interface = %counters.name, "New interface tracked.");
                    RateOutcome::Skipped
                }
            };
            let (rx_rate, tx_rate) = match outcome {
                RateOutcome::Computed(rx, tx) => (rx, tx),
                RateOutcome::Reset => (0.0, 0.0),
                RateOutcome::Skipped => previous.map_or((0.0, 0.0), |p| (p.rx_rate, p.tx_rate)),
            };

            if let RateOutcome::Computed(rx, tx) = outcome {
                state
                    .history
                    .entry(counters.name.clone())
                    .or_default()
                    .push(
                        HistoryPoint {
                            timestamp_ms: now_ms,
                            rx_rate: rx,
                            tx_rate: tx,
                        },
                        &self.limits,
                    );
            }

            let name = counters.name;
            state.interfaces.insert(
                name.clone(),
                InterfaceState {
                    name,
                    category: meta.category,
                    oper_state: meta.oper_state,
                    addrs: meta.addrs,
                    vpn_routing: meta.vpn_routing,
                    vpn_routing_since: meta.vpn_routing_since,
                    vpn_tracked: meta.vpn_tracked,
                    counters: counters.values,
                    rx_rate,
                    tx_rate,
                    timestamp: now_ms,
                },
            );
        }

        // Interfaces that stopped producing points still age out.
        for history in state.history.values_mut() {
            history.prune(now_ms, &self.limits);
        }
        state.history.retain(|_, h| !h.is_empty());
    }

    pub fn interfaces(&self) -> Vec<InterfaceState> {
        locks::read(&self.state).interfaces.values().cloned().collect()
    }

    pub fn interface(&self, name: &str) -> Option<InterfaceState> {
        locks::read(&self.state).interfaces.get(name).cloned()
    }

    pub fn history(&self) -> HashMap<String, Vec<HistoryPoint>> {
        locks::read(&self.state)
            .history
            .iter()
            .map(|(name, h)| (name.clone(), h.to_vec()))
            .collect()
    }

    pub fn interface_history(&self, name: &str) -> Vec<HistoryPoint> {
        locks::read(&self.state)
            .history
            .get(name)
            .map(History::to_vec)
            .unwrap_or_default()
    }

    pub fn rate_series(
        &self,
        name: &str,
        window: Duration,
        max_points: usize,
    ) -> Vec<HistoryPoint> {
        self.rate_series_at(name, window, max_points, crate::now_ms())
    }

    /// Points within `window` of `now_ms`, downsampled to at most `max_points`.
    pub fn rate_series_at(
        &self,
        name: &str,
        window: Duration,
        max_points: usize,
        now_ms: i64,
    ) -> Vec<HistoryPoint> {
        let since = window_start(now_ms, window);
        let suffix = locks::read(&self.state)
            .history
            .get(name)
            .map(|h| h.since(since))
            .unwrap_or_default();
        downsample(&suffix, max_points)
    }

    pub fn sparklines(
        &self,
        window: Duration,
        max_points: usize,
    ) -> BTreeMap<String, Vec<SparkPoint>> {
        self.sparklines_at(window, max_points, crate::now_ms())
    }

    pub fn sparklines_at(
        &self,
        window: Duration,
        max_points: usize,
        now_ms: i64,
    ) -> BTreeMap<String, Vec<SparkPoint>> {
        let since = window_start(now_ms, window);
        let state = locks::read(&self.state);
        state
            .history
            .iter()
            .filter_map(|(name, h)| {
                let suffix = h.since(since);
                if suffix.is_empty() {
                    return None;
                }
                let points = downsample(&suffix, max_points)
                    .into_iter()
                    .map(SparkPoint::from)
                    .collect();
                Some((name.clone(), points))
            })
            .collect()
    }
}

fn window_start(now_ms: i64, window: Duration) -> i64 {
    now_ms.saturating_sub(i64::try_from(window.as_millis()).unwrap_or(i64::MAX))
}

fn compute_rate(
    name: &str,
    prev: &InterfaceState,
    current: &CounterValues,
    now_ms: i64,
) -> RateOutcome {
    let elapsed_ms = now_ms - prev.timestamp;
    if elapsed_ms <= 0 {
        warn!(
            interface = %name,
            elapsed_ms,
            "Non-positive elapsed time, skipping rate for this tick."
        );
        return RateOutcome::Skipped;
    }
    let (Some(rx_delta), Some(tx_delta)) = (
        current.rx_bytes.checked_sub(prev.counters.rx_bytes),
        current.tx_bytes.checked_sub(prev.counters.tx_bytes),
    ) else {
        warn!(
            interface = %name,
            prev_rx = prev.counters.rx_bytes,
            rx = current.rx_bytes,
            prev_tx = prev.counters.tx_bytes,
            tx = current.tx_bytes,
            "Counter decreased, treating as reset."
        );
        return RateOutcome::Reset;
    };
    let secs = elapsed_ms as f64 / 1000.0;
    RateOutcome::Computed(rx_delta as f64 / secs, tx_delta as f64 / secs)
}

/// Fixed-interval aggregation worker. A fatal source error stops the worker;
/// anything else skips the tick.
pub async fn rate_collection_loop(
    collector: Arc<Collector>,
    mut source: CounterSource,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    info!(
        source = source.kind(),
        interval_ms = interval.as_millis() as u64,
        "Rate collection task started."
    );

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                info!("Shutdown signal received, terminating rate collection loop.");
                break;
            }

            _ = ticker.tick() => {
                match source.read() {
                    Ok(reading) => collector.apply_reading(reading, crate::now_ms()),
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "Counter source failed, stopping rate collection.");
                        break;
                    }
                    Err(e) => warn!(error = %e, "Counter read failed, skipping tick."),
                }
            }
        }
    }
}
