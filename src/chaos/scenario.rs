//! Chaos scenario definitions.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ValidationError;

/// Target that matches every dependency (still bounded by the blast radius).
pub const WILDCARD_TARGET: &str = "*";

/// Kind of fault a scenario injects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioKind {
    Latency,
    Error,
    CircuitOpen,
    ResourceExhaustion,
}

impl ScenarioKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioKind::Latency => "latency",
            ScenarioKind::Error => "error",
            ScenarioKind::CircuitOpen => "circuit_open",
            ScenarioKind::ResourceExhaustion => "resource_exhaustion",
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fault parameters. Only the field matching the scenario kind is used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioParams {
    pub delay_ms: u64,
    pub error_rate: f64,
    pub resource_level: f64,
}

impl ScenarioParams {
    pub fn latency(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Self::default()
        }
    }

    pub fn errors(error_rate: f64) -> Self {
        Self {
            error_rate,
            ..Self::default()
        }
    }

    pub fn resource_exhaustion(resource_level: f64) -> Self {
        Self {
            resource_level,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_unit("error_rate", self.error_rate)?;
        check_unit("resource_level", self.resource_level)
    }
}

fn check_unit(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ValidationError::new(field, format!("must be within [0, 1], got {value}")));
    }
    Ok(())
}

/// A fault returned in place of a real call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InjectedFault {
    #[error("chaos scenario '{scenario}' injected an error into '{target}'")]
    Error { scenario: String, target: String },

    #[error("chaos scenario '{scenario}' exhausted resources of '{target}' (level {level})")]
    ResourceExhausted {
        scenario: String,
        target: String,
        level: f64,
    },
}

impl InjectedFault {
    pub fn scenario(&self) -> &str {
        match self {
            InjectedFault::Error { scenario, .. } | InjectedFault::ResourceExhausted { scenario, .. } => scenario,
        }
    }

    pub fn kind(&self) -> ScenarioKind {
        match self {
            InjectedFault::Error { .. } => ScenarioKind::Error,
            InjectedFault::ResourceExhausted { .. } => ScenarioKind::ResourceExhaustion,
        }
    }
}

/// One fault-injection experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosScenario {
    pub name: String,
    pub kind: ScenarioKind,
    pub target: String,
    pub params: ScenarioParams,
    /// Targets this scenario may affect. Empty means unrestricted.
    pub blast_radius: BTreeSet<String>,
    /// Effective lifetime, `min(requested, max)`.
    pub duration_ms: u64,
    pub requested_duration_ms: u64,
    pub max_duration_ms: u64,
    pub active: bool,
    pub activated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl ChaosScenario {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// True if `target` is inside the blast radius.
    pub fn permits(&self, target: &str) -> bool {
        self.blast_radius.is_empty() || self.blast_radius.contains(target)
    }

    /// True if this scenario currently affects `target`.
    pub fn applies_to(&self, target: &str, now: DateTime<Utc>) -> bool {
        self.active
            && now < self.expires_at
            && (self.target == WILDCARD_TARGET || self.target == target)
            && self.permits(target)
    }
}
