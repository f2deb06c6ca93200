//! Unit status derived from shared and local state
//!
//! Candidates are collected from every source and the most severe one wins:
//! error > blocked > maintenance > waiting > active.

use std::fmt;

use serde::Serialize;

use super::context::LocalState;
use crate::model::{ClusterState, Unit};

/// Message shown by an active primary
pub const PRIMARY_MESSAGE: &str = "Primary";

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum UnitStatus {
    Active(String),
    Waiting(String),
    Maintenance(String),
    Blocked(String),
    Error(String),
}

impl UnitStatus {
    pub fn name(&self) -> &'static str {
        match self {
            UnitStatus::Active(_) => "active",
            UnitStatus::Waiting(_) => "waiting",
            UnitStatus::Maintenance(_) => "maintenance",
            UnitStatus::Blocked(_) => "blocked",
            UnitStatus::Error(_) => "error",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            UnitStatus::Active(m)
            | UnitStatus::Waiting(m)
            | UnitStatus::Maintenance(m)
            | UnitStatus::Blocked(m)
            | UnitStatus::Error(m) => m,
        }
    }

    /// Higher wins
    pub fn severity(&self) -> u8 {
        match self {
            UnitStatus::Active(_) => 0,
            UnitStatus::Waiting(_) => 1,
            UnitStatus::Maintenance(_) => 2,
            UnitStatus::Blocked(_) => 3,
            UnitStatus::Error(_) => 4,
        }
    }

    /// All status names, for the status gauge
    pub fn names() -> [&'static str; 5] {
        ["active", "waiting", "maintenance", "blocked", "error"]
    }
}

impl Default for UnitStatus {
    fn default() -> Self {
        UnitStatus::Waiting("agent starting".to_string())
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message().is_empty() {
            write!(f, "{}", self.name())
        } else {
            write!(f, "{}: {}", self.name(), self.message())
        }
    }
}

/// Pick the most severe candidate; ties go to the earliest
pub fn highest_precedence(candidates: impl IntoIterator<Item = UnitStatus>) -> UnitStatus {
    candidates
        .into_iter()
        .fold(None::<UnitStatus>, |best, candidate| match best {
            Some(b) if b.severity() >= candidate.severity() => Some(b),
            _ => Some(candidate),
        })
        .unwrap_or_else(|| UnitStatus::Active(String::new()))
}

/// Compute the status of `unit`
pub fn compute_status(state: &ClusterState, unit: &Unit, local: &LocalState) -> UnitStatus {
    let mut candidates = Vec::new();

    if let Some(error) = &local.error {
        candidates.push(UnitStatus::Error(error.clone()));
    }
    if let Some(reason) = &unit.blocked_reason {
        candidates.push(UnitStatus::Blocked(reason.clone()));
    }
    if let Some(message) = &local.maintenance {
        candidates.push(UnitStatus::Maintenance(message.clone()));
    }

    if !local.container_ready {
        candidates.push(UnitStatus::Waiting(
            "waiting for database container".to_string(),
        ));
    } else if !state.initialised {
        candidates.push(UnitStatus::Waiting(
            "awaiting cluster initialisation".to_string(),
        ));
    } else if let Some(backup_id) = &state.restoring {
        candidates.push(UnitStatus::Maintenance(format!(
            "restoring backup {}",
            backup_id
        )));
    } else if !unit.member {
        candidates.push(UnitStatus::Waiting(
            "awaiting cluster membership".to_string(),
        ));
    }

    let active = if local.is_primary {
        PRIMARY_MESSAGE.to_string()
    } else {
        String::new()
    };
    candidates.push(UnitStatus::Active(active));

    highest_precedence(candidates)
}
