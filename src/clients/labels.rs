//! Label keys shared by every Kubernetes object the agent touches

use std::collections::BTreeMap;

/// Field manager name for patches
pub const FIELD_MANAGER: &str = "postgres-lifecycle";

/// Scope label; Patroni's Kubernetes DCS discovers members through it
pub const SCOPE_LABEL: &str = "postgres-operator.smoketurner.com/cluster";

/// Patroni role label (`master`/`replica`), maintained by Patroni itself
pub const PATRONI_ROLE_LABEL: &str = "spilo-role";

/// Routing label: the unit has joined the cluster and may receive traffic
pub const MEMBER_LABEL: &str = "postgres-operator.smoketurner.com/member";

/// Routing label: `primary` or `replica`, consumed by the cluster services
pub const ROLE_LABEL: &str = "postgres-operator.smoketurner.com/role";

/// Pod annotation carrying the unit status name
pub const STATUS_ANNOTATION: &str = "postgres-lifecycle/status";

/// Pod annotation carrying the unit status message
pub const STATUS_MESSAGE_ANNOTATION: &str = "postgres-lifecycle/status-message";

/// Standard labels for objects owned by a cluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            cluster_name.to_string(),
        ),
        (
            "app.kubernetes.io/component".to_string(),
            "postgresql".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (SCOPE_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Label selector matching every pod of a cluster
pub fn cluster_selector(cluster_name: &str) -> String {
    format!("app.kubernetes.io/name={},app.kubernetes.io/component=postgresql", cluster_name)
}
