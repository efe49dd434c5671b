//! Health scoring and the reports built from it.
//!
//! Everything here is a pure function of a set of breaker states, which is
//! what keeps the aggregator easy to test.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::resilience::CircuitState;

/// Aggregate system status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Critical => "CRITICAL",
            HealthStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score boundaries between HEALTHY, DEGRADED and CRITICAL.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub degraded: f64,
    pub critical: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded: 0.7,
            critical: 0.5,
        }
    }
}

impl HealthThresholds {
    /// Requires `0 <= critical <= degraded <= 1`.
    pub fn new(degraded: f64, critical: f64) -> Result<Self, ConfigurationError> {
        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        if !in_range(degraded) || !in_range(critical) || critical > degraded {
            return Err(ConfigurationError::InvalidThresholds { degraded, critical });
        }
        Ok(Self { degraded, critical })
    }

    pub fn classify(&self, counts: &BreakerCounts) -> HealthStatus {
        if counts.total == 0 {
            return HealthStatus::Unknown;
        }
        let score = counts.score();
        if score >= self.degraded {
            HealthStatus::Healthy
        } else if score >= self.critical {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        }
    }
}

/// Breaker population by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerCounts {
    pub total: usize,
    pub closed: usize,
    pub half_open: usize,
    pub open: usize,
}

impl BreakerCounts {
    pub fn tally<'a>(states: impl IntoIterator<Item = &'a CircuitState>) -> Self {
        let mut counts = Self::default();
        for state in states {
            counts.total += 1;
            match state {
                CircuitState::Closed => counts.closed += 1,
                CircuitState::HalfOpen => counts.half_open += 1,
                CircuitState::Open => counts.open += 1,
            }
        }
        counts
    }

    /// `(closed + 0.5 * half_open) / total`, or 0 for an empty population.
    pub fn score(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let weighted = self.closed as f64 * CircuitState::Closed.health_weight()
            + self.half_open as f64 * CircuitState::HalfOpen.health_weight()
            + self.open as f64 * CircuitState::Open.health_weight();
        (weighted / self.total as f64).clamp(0.0, 1.0)
    }
}

/// One poll's worth of health data. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub score: f64,
    #[serde(flatten)]
    pub counts: BreakerCounts,
    pub breaker_states: BTreeMap<String, CircuitState>,
}

impl HealthSnapshot {
    pub fn from_states(breaker_states: BTreeMap<String, CircuitState>, thresholds: &HealthThresholds) -> Self {
        let counts = BreakerCounts::tally(breaker_states.values());
        Self {
            timestamp: Utc::now(),
            status: thresholds.classify(&counts),
            score: counts.score(),
            counts,
            breaker_states,
        }
    }
}

/// The current aggregate view, recomputed on every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealthReport {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub score: f64,
    #[serde(flatten)]
    pub counts: BreakerCounts,
    pub breakers: BTreeMap<String, CircuitState>,
    /// Dependencies currently probing recovery (Half-Open).
    pub degraded_services: Vec<String>,
    /// Dependencies currently failing fast (Open).
    pub critical_services: Vec<String>,
    pub thresholds: HealthThresholds,
    pub last_status_change: Option<DateTime<Utc>>,
}

impl SystemHealthReport {
    pub fn from_states(
        breakers: BTreeMap<String, CircuitState>,
        thresholds: HealthThresholds,
        last_status_change: Option<DateTime<Utc>>,
    ) -> Self {
        let counts = BreakerCounts::tally(breakers.values());
        let names_in = |wanted: CircuitState| {
            breakers
                .iter()
                .filter(|(_, state)| **state == wanted)
                .map(|(name, _)| name.clone())
                .collect::<Vec<_>>()
        };

        Self {
            timestamp: Utc::now(),
            status: thresholds.classify(&counts),
            score: counts.score(),
            counts,
            degraded_services: names_in(CircuitState::HalfOpen),
            critical_services: names_in(CircuitState::Open),
            breakers,
            thresholds,
            last_status_change,
        }
    }
}

/// Delivered to health-change callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthChange {
    pub previous: HealthStatus,
    pub current: HealthStatus,
    pub snapshot: HealthSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states(closed: usize, half_open: usize, open: usize) -> BTreeMap<String, CircuitState> {
        let mut map = BTreeMap::new();
        let groups = [
            (closed, CircuitState::Closed),
            (half_open, CircuitState::HalfOpen),
            (open, CircuitState::Open),
        ];
        for (count, state) in groups {
            for i in 0..count {
                map.insert(format!("{}-{i}", state.as_str()), state);
            }
        }
        map
    }

    #[test]
    fn test_score_formula_over_populations() {
        let thresholds = HealthThresholds::default();
        for closed in 0..5 {
            for half_open in 0..5 {
                for open in 0..5 {
                    let snapshot = HealthSnapshot::from_states(states(closed, half_open, open), &thresholds);
                    let total = closed + half_open + open;
                    assert!((0.0..=1.0).contains(&snapshot.score));
                    if total == 0 {
                        assert_eq!(snapshot.status, HealthStatus::Unknown);
                        continue;
                    }
                    let expected = (closed as f64 + 0.5 * half_open as f64) / total as f64;
                    assert!((snapshot.score - expected).abs() < 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_classification_boundaries() {
        let thresholds = HealthThresholds::default();
        // 7/10 closed sits exactly on the degraded threshold.
        assert_eq!(thresholds.classify(&BreakerCounts::tally(states(7, 0, 3).values())), HealthStatus::Healthy);
        assert_eq!(thresholds.classify(&BreakerCounts::tally(states(6, 0, 4).values())), HealthStatus::Degraded);
        assert_eq!(thresholds.classify(&BreakerCounts::tally(states(1, 0, 1).values())), HealthStatus::Degraded);
        assert_eq!(thresholds.classify(&BreakerCounts::tally(states(0, 1, 1).values())), HealthStatus::Critical);
    }

    #[test]
    fn test_threshold_validation() {
        assert!(HealthThresholds::new(0.7, 0.5).is_ok());
        assert!(HealthThresholds::new(0.5, 0.5).is_ok());
        assert!(HealthThresholds::new(0.5, 0.7).is_err());
        assert!(HealthThresholds::new(1.1, 0.5).is_err());
        assert!(HealthThresholds::new(0.7, -0.1).is_err());
        assert!(HealthThresholds::new(f64::NAN, 0.5).is_err());
    }

    #[test]
    fn test_report_lists_failing_services() {
        let mut map = states(2, 0, 0);
        map.insert("signer".into(), CircuitState::Open);
        map.insert("audit".into(), CircuitState::HalfOpen);

        let report = SystemHealthReport::from_states(map, HealthThresholds::default(), None);
        assert_eq!(report.critical_services, vec!["signer".to_string()]);
        assert_eq!(report.degraded_services, vec!["audit".to_string()]);
        assert_eq!(report.counts.total, 4);
    }

    #[test]
    fn test_report_serialization_round_trip() {
        // A score of exactly the critical threshold is still DEGRADED.
        let boundary = SystemHealthReport::from_states(states(1, 1, 1), HealthThresholds::default(), None);
        assert_eq!(serde_json::to_value(&boundary).unwrap()["status"], "DEGRADED");

        let report = SystemHealthReport::from_states(states(0, 1, 1), HealthThresholds::default(), Some(Utc::now()));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "CRITICAL");
        assert_eq!(json["open"], 1);

        let parsed: SystemHealthReport = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.status, report.status);
        assert_eq!(parsed.score, report.score);
        assert_eq!(parsed.counts, report.counts);
        assert_eq!(parsed.breakers, report.breakers);
    }
}
