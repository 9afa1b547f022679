use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::settings::BehaviorConfig;

/// One anomaly signal over the sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    RapidRequests,
    PathScanning,
    MethodFuzzing,
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::RapidRequests => write!(f, "RAPID_REQUESTS"),
            Anomaly::PathScanning => write!(f, "PATH_SCANNING"),
            Anomaly::MethodFuzzing => write!(f, "METHOD_FUZZING"),
        }
    }
}

/// What a single observation concluded.
#[derive(Debug, Clone)]
pub struct Observation {
    pub anomalies: Vec<Anomaly>,
    pub suspicious_activity: u32,
    /// The suspicious-activity count crossed the rejection threshold.
    pub should_block: bool,
}

#[derive(Debug)]
struct BehaviorWindow {
    requests: VecDeque<(Instant, String, String)>,
    /// Grows on every anomalous observation; never pruned by the window.
    suspicious_activity: u32,
}

impl BehaviorWindow {
    fn new() -> Self {
        Self {
            requests: VecDeque::new(),
            suspicious_activity: 0,
        }
    }

    fn prune(&mut self, horizon: Duration) {
        let cutoff = Instant::now() - horizon;
        while let Some(front) = self.requests.front() {
            if front.0 < cutoff {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Short-horizon request pattern analysis per fingerprint.
///
/// Each request appends to a pruned 5-minute window and evaluates three
/// independent signals: rapid-fire bursts, path scanning, and method
/// fuzzing. Any firing signal bumps a persistent suspicious-activity
/// counter; once that counter passes the threshold the caller is
/// rejected outright.
pub struct BehaviorAnalyzer {
    windows: DashMap<String, BehaviorWindow>,
    config: BehaviorConfig,
}

impl BehaviorAnalyzer {
    pub fn new(config: &BehaviorConfig) -> Self {
        Self {
            windows: DashMap::new(),
            config: config.clone(),
        }
    }

    /// Record a request for `fingerprint` and evaluate the signals.
    pub fn observe(&self, fingerprint: &str, path: &str, method: &str) -> Observation {
        let now = Instant::now();
        let mut window = self
            .windows
            .entry(fingerprint.to_string())
            .or_insert_with(BehaviorWindow::new);

        window
            .requests
            .push_back((now, path.to_string(), method.to_string()));
        window.prune(Duration::from_secs(self.config.window_secs));

        let mut anomalies = Vec::new();

        let rapid_cutoff = now - Duration::from_secs(self.config.rapid_window_secs);
        let recent = window
            .requests
            .iter()
            .filter(|(ts, _, _)| *ts >= rapid_cutoff)
            .count();
        if recent > self.config.rapid_max {
            anomalies.push(Anomaly::RapidRequests);
        }

        let distinct_paths: HashSet<&str> =
            window.requests.iter().map(|(_, p, _)| p.as_str()).collect();
        if distinct_paths.len() > self.config.max_distinct_paths {
            anomalies.push(Anomaly::PathScanning);
        }

        let distinct_methods: HashSet<&str> =
            window.requests.iter().map(|(_, _, m)| m.as_str()).collect();
        if distinct_methods.len() > self.config.max_distinct_methods {
            anomalies.push(Anomaly::MethodFuzzing);
        }

        if !anomalies.is_empty() {
            window.suspicious_activity += 1;
            warn!(
                fingerprint = fingerprint,
                anomalies = ?anomalies,
                suspicious_activity = window.suspicious_activity,
                "Behavioral anomalies detected"
            );
        }

        let observation = Observation {
            anomalies,
            suspicious_activity: window.suspicious_activity,
            should_block: window.suspicious_activity > self.config.suspicion_threshold,
        };
        drop(window);

        // Low-probability inline sweep keeps the map bounded even if the
        // periodic cleanup task falls behind.
        if rand::rng().random::<f64>() < 0.01 {
            self.evict_empty();
        }

        observation
    }

    /// Evict windows whose request lists have fully aged out.
    pub fn cleanup(&self) {
        let horizon = Duration::from_secs(self.config.window_secs);
        self.windows
            .iter_mut()
            .for_each(|mut entry| entry.value_mut().prune(horizon));
        self.evict_empty();
    }

    pub fn tracked_count(&self) -> usize {
        self.windows.len()
    }

    fn evict_empty(&self) {
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.requests.is_empty());
        let evicted = before - self.windows.len();
        if evicted > 0 {
            debug!(evicted = evicted, "Empty behavior windows evicted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults;

    fn analyzer() -> BehaviorAnalyzer {
        BehaviorAnalyzer::new(&defaults::default_behavior_config())
    }

    #[test]
    fn test_rapid_requests_trip_on_the_101st() {
        let a = analyzer();
        for i in 0..100 {
            let obs = a.observe("fp-1", "/api/items", "GET");
            assert!(obs.anomalies.is_empty(), "tripped early at request {}", i);
        }
        let obs = a.observe("fp-1", "/api/items", "GET");
        assert_eq!(obs.anomalies, vec![Anomaly::RapidRequests]);
        assert_eq!(obs.suspicious_activity, 1);
    }

    #[test]
    fn test_path_scanning_trips_past_fifty_distinct_paths() {
        let mut config = defaults::default_behavior_config();
        // Keep the rapid signal quiet while visiting many paths.
        config.rapid_max = 1000;
        let a = BehaviorAnalyzer::new(&config);

        for i in 0..50 {
            let obs = a.observe("fp-2", &format!("/probe/{}", i), "GET");
            assert!(obs.anomalies.is_empty());
        }
        let obs = a.observe("fp-2", "/probe/50", "GET");
        assert_eq!(obs.anomalies, vec![Anomaly::PathScanning]);
    }

    #[test]
    fn test_method_fuzzing_trips_past_four_methods() {
        let a = analyzer();
        for method in ["GET", "POST", "PUT", "DELETE"] {
            let obs = a.observe("fp-3", "/api/items", method);
            assert!(obs.anomalies.is_empty());
        }
        let obs = a.observe("fp-3", "/api/items", "PATCH");
        assert_eq!(obs.anomalies, vec![Anomaly::MethodFuzzing]);
    }

    #[test]
    fn test_suspicious_counter_accumulates_to_block() {
        let mut config = defaults::default_behavior_config();
        config.max_distinct_methods = 0;
        let a = BehaviorAnalyzer::new(&config);

        // Every observation fires the fuzzing signal (threshold 0), so the
        // suspicious counter climbs once per request and blocks past 5.
        for i in 1..=5 {
            let obs = a.observe("fp-4", "/x", "GET");
            assert_eq!(obs.suspicious_activity, i);
            assert!(!obs.should_block);
        }
        let obs = a.observe("fp-4", "/x", "GET");
        assert_eq!(obs.suspicious_activity, 6);
        assert!(obs.should_block);
    }

    #[test]
    fn test_fingerprints_are_isolated() {
        let a = analyzer();
        for method in ["GET", "POST", "PUT", "DELETE", "PATCH"] {
            a.observe("fp-5", "/x", method);
        }
        let obs = a.observe("fp-6", "/x", "GET");
        assert!(obs.anomalies.is_empty());
        assert_eq!(obs.suspicious_activity, 0);
    }

    #[test]
    fn test_cleanup_evicts_aged_windows() {
        let mut config = defaults::default_behavior_config();
        config.window_secs = 0;
        let a = BehaviorAnalyzer::new(&config);
        a.observe("fp-7", "/x", "GET");
        a.cleanup();
        assert_eq!(a.tracked_count(), 0);
    }
}
