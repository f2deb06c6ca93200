//! The shared cluster document ("peer databag")
//!
//! One JSON document per cluster. The leader owns every field except the
//! `units` partition (each unit writes its own entry) and the `operation`
//! mutex (any unit may take it, always through a generation compare-and-swap).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::tls::TlsServerRole;

/// Length of generated passwords
const PASSWORD_LENGTH: usize = 24;

/// Cluster-wide facts, versioned by `generation`
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    /// Monotonic version used for optimistic concurrency
    #[serde(default)]
    pub generation: u64,

    /// Set once the first member reported running; never reverts
    #[serde(default)]
    pub initialised: bool,

    /// Generated credentials for the database and control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialSet>,

    /// Whether synchronous replication is enabled on the control plane
    #[serde(default)]
    pub synchronous_mode: bool,

    /// Units formally joined to the replication group
    #[serde(default)]
    pub members: BTreeSet<String>,

    /// The long-running operation currently holding the cluster mutex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationLease>,

    /// Backup stanza bound to the repository, once created and verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stanza: Option<String>,

    /// Cluster-wide blocked reason (operational failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked: Option<String>,

    /// Backup id of a restore that has started but not yet been confirmed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restoring: Option<String>,

    /// Unit-writable partition, keyed by unit id
    #[serde(default)]
    pub units: BTreeMap<String, UnitData>,
}

impl ClusterState {
    /// Mark the cluster initialised. Never reverts.
    pub fn mark_initialised(&mut self) {
        self.initialised = true;
    }

    /// Units scheduled by the platform and not on their way out
    pub fn planned_units(&self) -> impl Iterator<Item = (&String, &UnitData)> {
        self.units.iter().filter(|(_, data)| !data.departing)
    }

    /// Number of planned units (falls back to the member count before any unit registered)
    pub fn planned_unit_count(&self) -> usize {
        let planned = self.planned_units().count();
        if planned == 0 {
            self.members.len()
        } else {
            planned
        }
    }

    /// Whether the cluster has at most one unit
    pub fn is_single_unit(&self) -> bool {
        self.planned_unit_count() <= 1
    }

    /// Whether the given unit is a formal member
    pub fn is_member(&self, unit: &str) -> bool {
        self.members.contains(unit)
    }

    /// TLS server role a unit last reported
    pub fn tls_server_role(&self, unit: &str) -> TlsServerRole {
        self.units
            .get(unit)
            .map(|data| data.tls_server)
            .unwrap_or_default()
    }

    /// Units currently reporting themselves as the primary-facing TLS server
    pub fn primary_tls_servers(&self) -> Vec<&str> {
        self.units
            .iter()
            .filter(|(_, data)| data.tls_server == TlsServerRole::Primary)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Check that `next` is a legal successor of `self`
    ///
    /// Returns a description of the violated invariant, if any.
    pub fn check_successor(&self, next: &ClusterState) -> Option<String> {
        if self.initialised && !next.initialised {
            return Some("cluster-initialised flag cannot revert".to_string());
        }
        if let (Some(current), Some(proposed)) = (&self.credentials, &next.credentials)
            && proposed.version < current.version
        {
            return Some(format!(
                "credential version cannot go backwards ({} -> {})",
                current.version, proposed.version
            ));
        }
        None
    }
}

/// Per-unit data, written by the unit itself
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnitData {
    /// Address the control plane reaches the unit on
    #[serde(default)]
    pub address: String,

    /// Complete internal certificate material is installed
    #[serde(default)]
    pub tls_ready: bool,

    /// Role the unit's backup-engine TLS server runs in
    #[serde(default)]
    pub tls_server: TlsServerRole,

    /// The platform is removing this unit (written by the leader on peer-departed)
    #[serde(default)]
    pub departing: bool,
}

/// Generated credentials. `version` increments on every regeneration.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSet {
    pub version: u32,
    pub operator_password: String,
    pub replication_password: String,
    pub rewind_password: String,
    pub patroni_password: String,
}

impl CredentialSet {
    /// Generate a fresh credential set at the given version
    pub fn generate(version: u32) -> Self {
        Self {
            version,
            operator_password: generate_password(PASSWORD_LENGTH),
            replication_password: generate_password(PASSWORD_LENGTH),
            rewind_password: generate_password(PASSWORD_LENGTH),
            patroni_password: generate_password(PASSWORD_LENGTH),
        }
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Mutually exclusive long-running operations
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Backup,
    Restore,
    Rescale,
    TlsToggle,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Backup => write!(f, "backup"),
            OperationKind::Restore => write!(f, "restore"),
            OperationKind::Rescale => write!(f, "rescale"),
            OperationKind::TlsToggle => write!(f, "tls-toggle"),
        }
    }
}

/// Holder of the cluster operation mutex
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperationLease {
    pub kind: OperationKind,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}
