use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

pub const DEFAULT_HISTORY_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_HISTORY_MAX_POINTS: usize = 86_400;

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct HistoryPoint {
    #[serde(rename = "t")]
    pub timestamp_ms: i64,
    #[serde(rename = "rx")]
    pub rx_rate: f64,
    #[serde(rename = "tx")]
    pub tx_rate: f64,
}

/// Lightweight rate pair for sparkline rendering.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct SparkPoint {
    pub rx: f64,
    pub tx: f64,
}

impl From<HistoryPoint> for SparkPoint {
    fn from(p: HistoryPoint) -> Self {
        Self {
            rx: p.rx_rate,
            tx: p.tx_rate,
        }
    }
}

/// Both bounds apply; whichever is exceeded first triggers pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    pub max_age: Duration,
    pub max_points: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_HISTORY_MAX_AGE,
            max_points: DEFAULT_HISTORY_MAX_POINTS,
        }
    }
}

impl HistoryLimits {
    fn max_age_ms(&self) -> i64 {
        i64::try_from(self.max_age.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Append-mostly, strictly time-ordered rate series for one interface.
#[derive(Debug, Clone, Default)]
pub struct History {
    points: VecDeque<HistoryPoint>,
}

impl History {
    /// Appends and then prunes relative to the appended point's timestamp.
    /// Callers only append points newer than the last one.
    pub fn push(&mut self, point: HistoryPoint, limits: &HistoryLimits) {
        self.points.push_back(point);
        self.prune(point.timestamp_ms, limits);
    }

    /// Drops from the oldest end until both bounds hold. Only the front is
    /// inspected, so a pass over an already-pruned series is O(1) and a no-op.
    pub fn prune(&mut self, now_ms: i64, limits: &HistoryLimits) -> usize {
        let cutoff = now_ms.saturating_sub(limits.max_age_ms());
        let mut removed = 0;
        while self.points.len() > limits.max_points {
            self.points.pop_front();
            removed += 1;
        }
        while self
            .points
            .front()
            .is_some_and(|p| p.timestamp_ms < cutoff)
        {
            self.points.pop_front();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryPoint> {
        self.points.back()
    }

    pub fn to_vec(&self) -> Vec<HistoryPoint> {
        self.points.iter().copied().collect()
    }

    /// The suffix with `timestamp_ms >= since_ms`.
    pub fn since(&self, since_ms: i64) -> Vec<HistoryPoint> {
        let start = self.points.partition_point(|p| p.timestamp_ms < since_ms);
        self.points.range(start..).copied().collect()
    }
}

/// Uniform selection by nearest-index stepping. Never interpolates; output is
/// `min(len, max_points)` long and keeps the input order.
pub fn downsample<T: Copy>(points: &[T], max_points: usize) -> Vec<T> {
    if points.len() <= max_points {
        return points.to_vec();
    }
    if max_points == 0 {
        return Vec::new();
    }
    let step = points.len() as f64 / max_points as f64;
    let last = points.len() - 1;
    (0..max_points)
        .map(|i| {
            let idx = ((i as f64 * step) as usize).min(last);
            points[idx]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(t: i64) -> HistoryPoint {
        HistoryPoint {
            timestamp_ms: t,
            rx_rate: t as f64,
            tx_rate: 0.0,
        }
    }

    #[test]
    fn test_count_bound_keeps_most_recent() {
        let limits = HistoryLimits {
            max_age: Duration::from_secs(3600),
            max_points: 5,
        };
        let mut history = History::default();
        for t in 1..=10 {
            history.push(point(t * 1000), &limits);
        }
        let kept: Vec<i64> = history.to_vec().iter().map(|p| p.timestamp_ms).collect();
        assert_eq!(kept, vec![6000, 7000, 8000, 9000, 10000]);
    }

    #[test]
    fn test_age_bound_and_idempotent_prune() {
        let limits = HistoryLimits {
            max_age: Duration::from_secs(10),
            max_points: 1000,
        };
        let mut history = History::default();
        for t in 0..30 {
            history.push(point(t * 1000), &limits);
        }
        // Cutoff is 29s - 10s = 19s.
        assert_eq!(history.len(), 11);
        assert!(history.to_vec().iter().all(|p| p.timestamp_ms >= 19_000));

        assert_eq!(history.prune(29_000, &limits), 0);
        assert_eq!(history.len(), 11);
    }

    #[test]
    fn test_since_selects_suffix() {
        let mut history = History::default();
        let limits = HistoryLimits::default();
        for t in 0..10 {
            history.push(point(t * 1000), &limits);
        }
        let suffix = history.since(7000);
        assert_eq!(suffix.len(), 3);
        assert_eq!(suffix[0].timestamp_ms, 7000);
        assert!(history.since(50_000).is_empty());
        assert_eq!(history.since(i64::MIN).len(), 10);
    }

    #[test]
    fn test_downsample_lengths_and_order() {
        let input: Vec<i64> = (0..300).collect();
        for max in [0usize, 1, 7, 50, 299, 300, 1000] {
            let out = downsample(&input, max);
            assert_eq!(out.len(), input.len().min(max));
            assert!(out.windows(2).all(|w| w[0] <= w[1]));
            assert!(out.iter().all(|v| input.contains(v)));
        }
    }

    #[test]
    fn test_downsample_short_input_unchanged() {
        let input = vec![3, 1, 2];
        assert_eq!(downsample(&input, 3), input);
        assert_eq!(downsample(&input, 10), input);
    }

    #[test]
    fn test_downsample_nearest_index_stepping() {
        let input: Vec<u32> = (0..10).collect();
        // step = 10 / 4 = 2.5 -> indices 0, 2, 5, 7
        assert_eq!(downsample(&input, 4), vec![0, 2, 5, 7]);
    }
}
