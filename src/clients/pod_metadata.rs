//! Pod labels and annotations as the discovery and status surface

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tracing::debug;

use super::labels::{
    FIELD_MANAGER, MEMBER_LABEL, ROLE_LABEL, STATUS_ANNOTATION, STATUS_MESSAGE_ANNOTATION,
};
use super::{Discovery, StatusPublisher};
use crate::controller::UnitStatus;

/// Label gating client traffic; services select `enabled`
pub const CONNECTIONS_LABEL: &str = "postgres-operator.smoketurner.com/connections";

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),
}

/// Merge-patches metadata on the cluster's pods
pub struct PodMetadata {
    pods: Api<Pod>,
}

impl PodMetadata {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
        }
    }

    async fn patch(&self, unit: &str, metadata: serde_json::Value) -> Result<(), MetadataError> {
        let patch = serde_json::json!({ "metadata": metadata });
        self.pods
            .patch(unit, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        debug!(unit, patch = %patch, "Patched pod metadata");
        Ok(())
    }
}

fn member_labels(member: bool) -> serde_json::Value {
    if member {
        serde_json::json!({ "labels": { MEMBER_LABEL: "true" } })
    } else {
        serde_json::json!({ "labels": { MEMBER_LABEL: null, ROLE_LABEL: null } })
    }
}

fn role_labels(primary: bool) -> serde_json::Value {
    let role = if primary { "primary" } else { "replica" };
    serde_json::json!({ "labels": { ROLE_LABEL: role } })
}

fn status_annotations(status: &UnitStatus) -> serde_json::Value {
    serde_json::json!({
        "annotations": {
            STATUS_ANNOTATION: status.name(),
            STATUS_MESSAGE_ANNOTATION: status.message(),
        }
    })
}

#[async_trait]
impl Discovery for PodMetadata {
    async fn set_member(&self, unit: &str, member: bool) -> Result<(), MetadataError> {
        self.patch(unit, member_labels(member)).await
    }

    async fn set_primary(&self, unit: &str, primary: bool) -> Result<(), MetadataError> {
        self.patch(unit, role_labels(primary)).await
    }

    async fn set_client_connections(
        &self,
        unit: &str,
        allowed: bool,
    ) -> Result<(), MetadataError> {
        let value = if allowed { "enabled" } else { "disabled" };
        self.patch(
            unit,
            serde_json::json!({ "labels": { CONNECTIONS_LABEL: value } }),
        )
        .await
    }
}

#[async_trait]
impl StatusPublisher for PodMetadata {
    async fn publish(&self, unit: &str, status: &UnitStatus) -> Result<(), MetadataError> {
        self.patch(unit, status_annotations(status)).await
    }
}
