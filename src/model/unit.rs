use serde::{Deserialize, Serialize};

use super::cluster_state::ClusterState;

/// Whether a unit holds the leadership lease
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnitRole {
    Leader,
    Follower,
}

/// One member process of the cluster, as seen by its own agent
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unit {
    pub id: String,
    pub address: String,
    pub role: UnitRole,
    pub member: bool,
    pub tls_ready: bool,
    pub blocked_reason: Option<String>,
}

impl Unit {
    /// Build the view of `id` from the shared document plus local knowledge
    pub fn from_state(
        id: &str,
        state: &ClusterState,
        is_leader: bool,
        blocked_reason: Option<String>,
    ) -> Self {
        let data = state.units.get(id);
        Self {
            id: id.to_string(),
            address: data.map(|d| d.address.clone()).unwrap_or_default(),
            role: if is_leader {
                UnitRole::Leader
            } else {
                UnitRole::Follower
            },
            member: state.is_member(id),
            tls_ready: data.is_some_and(|d| d.tls_ready),
            blocked_reason,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == UnitRole::Leader
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked_reason.is_some()
    }
}
