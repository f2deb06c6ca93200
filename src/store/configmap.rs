use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client};
use tracing::{debug, trace};

use super::{Result, StateStore, StoreError, prepare_successor};
use crate::clients::labels::standard_labels;
use crate::model::ClusterState;

/// Data key holding the serialized document
const STATE_KEY: &str = "cluster-state";

/// Cluster document persisted in a ConfigMap
///
/// The generation check guards the document contents; `resourceVersion` on
/// replace guards the read-to-write window against concurrent writers.
pub struct ConfigMapStore {
    api: Api<ConfigMap>,
    name: String,
    cluster_name: String,
}

impl ConfigMapStore {
    pub fn new(client: Client, namespace: &str, cluster_name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: format!("{}-lifecycle-state", cluster_name),
            cluster_name: cluster_name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn decode(configmap: &ConfigMap) -> Result<ClusterState> {
        match configmap.data.as_ref().and_then(|d| d.get(STATE_KEY)) {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(ClusterState::default()),
        }
    }

    fn encode(&self, state: &ClusterState, resource_version: Option<String>) -> Result<ConfigMap> {
        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                labels: Some(standard_labels(&self.cluster_name)),
                resource_version,
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                STATE_KEY.to_string(),
                serde_json::to_string(state)?,
            )])),
            ..Default::default()
        })
    }
}

/// Map an API conflict (409) onto a generation conflict
fn conflict_or(err: kube::Error, expected: u64) -> StoreError {
    match err {
        kube::Error::Api(ref api_err) if api_err.code == 409 => StoreError::Conflict {
            expected,
            actual: expected + 1,
        },
        other => StoreError::KubeError(other),
    }
}

#[async_trait]
impl StateStore for ConfigMapStore {
    async fn load(&self) -> Result<ClusterState> {
        match self.api.get_opt(&self.name).await? {
            Some(configmap) => Self::decode(&configmap),
            None => {
                trace!(configmap = %self.name, "State ConfigMap absent, using empty document");
                Ok(ClusterState::default())
            }
        }
    }

    async fn compare_and_swap(&self, expected: u64, next: ClusterState) -> Result<ClusterState> {
        let existing = self.api.get_opt(&self.name).await?;
        let current = match &existing {
            Some(configmap) => Self::decode(configmap)?,
            None => ClusterState::default(),
        };
        let stored = prepare_successor(&current, expected, next)?;

        match existing {
            None => {
                let configmap = self.encode(&stored, None)?;
                self.api
                    .create(&PostParams::default(), &configmap)
                    .await
                    .map_err(|e| conflict_or(e, expected))?;
            }
            Some(configmap) => {
                let configmap = self.encode(&stored, configmap.metadata.resource_version)?;
                self.api
                    .replace(&self.name, &PostParams::default(), &configmap)
                    .await
                    .map_err(|e| conflict_or(e, expected))?;
            }
        }

        debug!(
            configmap = %self.name,
            generation = stored.generation,
            "Wrote cluster state"
        );
        Ok(stored)
    }
}
