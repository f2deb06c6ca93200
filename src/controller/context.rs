use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::error::{BackoffConfig, Error, Result};
use crate::clients::{
    BackupEngine, ControlPlane, Discovery, ObjectStorage, StatusPublisher, Workload,
};
use crate::health::HealthState;
use crate::model::{
    BackupRecord, CertificateKind, ClusterState, S3Config, SignalKind, TlsMaterial, TlsState,
    Unit, UnitData,
};
use crate::store::{StateStore, read_modify_write};

/// Default number of readiness polls before a membership pass defers
pub const DEFAULT_READINESS_RETRY_BUDGET: u32 = 5;

/// External systems the controller acts on
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn StateStore>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub backup_engine: Arc<dyn BackupEngine>,
    pub object_storage: Arc<dyn ObjectStorage>,
    pub workload: Arc<dyn Workload>,
    pub discovery: Arc<dyn Discovery>,
    pub publisher: Arc<dyn StatusPublisher>,
}

/// Blocked reason together with the signal kind that raised it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockedReason {
    pub source: SignalKind,
    pub message: String,
}

/// Facts known only to this unit's agent; not shared, not durable
#[derive(Debug, Default)]
pub struct LocalState {
    pub container_ready: bool,
    pub is_primary: bool,
    pub s3: Option<S3Config>,
    pub tls_material: BTreeMap<CertificateKind, TlsMaterial>,
    pub blocked: Option<BlockedReason>,
    pub error: Option<String>,
    pub maintenance: Option<String>,
    /// Backups this unit has attempted, oldest first
    pub backups: Vec<BackupRecord>,
}

impl LocalState {
    pub fn has_complete_material(&self, kind: CertificateKind) -> bool {
        self.tls_material
            .get(&kind)
            .is_some_and(TlsMaterial::is_complete)
    }

    /// Certificate posture of this unit against the shared document
    pub fn tls_state(&self, state: &ClusterState, unit: &str) -> TlsState {
        TlsState {
            external_cert: self.has_complete_material(CertificateKind::External),
            internal_cert: self.has_complete_material(CertificateKind::Internal),
            server: state.tls_server_role(unit),
            single_unit: state.is_single_unit(),
        }
    }

    pub fn blocked_message(&self) -> Option<&str> {
        self.blocked.as_ref().map(|b| b.message.as_str())
    }
}

/// Shared context for the controller
pub struct Context {
    /// This unit's id (pod name)
    pub unit: String,
    /// Address peers and the control plane reach this unit on
    pub address: String,
    /// Backup stanza name for the cluster
    pub stanza: String,
    pub store: Arc<dyn StateStore>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub backup_engine: Arc<dyn BackupEngine>,
    pub object_storage: Arc<dyn ObjectStorage>,
    pub workload: Arc<dyn Workload>,
    pub discovery: Arc<dyn Discovery>,
    pub publisher: Arc<dyn StatusPublisher>,
    pub backoff: BackoffConfig,
    pub readiness_retry_budget: u32,
    pub health_state: Option<Arc<HealthState>>,
    leader: AtomicBool,
    local: Mutex<LocalState>,
}

impl Context {
    pub fn new(unit: &str, stanza: &str, collaborators: Collaborators) -> Self {
        Self {
            unit: unit.to_string(),
            address: unit.to_string(),
            stanza: stanza.to_string(),
            store: collaborators.store,
            control_plane: collaborators.control_plane,
            backup_engine: collaborators.backup_engine,
            object_storage: collaborators.object_storage,
            workload: collaborators.workload,
            discovery: collaborators.discovery,
            publisher: collaborators.publisher,
            backoff: BackoffConfig::default(),
            readiness_retry_budget: DEFAULT_READINESS_RETRY_BUDGET,
            health_state: None,
            leader: AtomicBool::new(false),
            local: Mutex::new(LocalState::default()),
        }
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.address = address.to_string();
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_readiness_retry_budget(mut self, budget: u32) -> Self {
        self.readiness_retry_budget = budget;
        self
    }

    pub fn with_health_state(mut self, health_state: Arc<HealthState>) -> Self {
        self.health_state = Some(health_state);
        self
    }

    /// Whether this unit currently holds the leadership lease
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Set by the lease loop; returns the previous value
    pub fn set_leader(&self, leader: bool) -> bool {
        self.leader.swap(leader, Ordering::SeqCst)
    }

    pub async fn local(&self) -> MutexGuard<'_, LocalState> {
        self.local.lock().await
    }

    pub async fn load_state(&self) -> Result<ClusterState> {
        Ok(self.store.load().await?)
    }

    /// Mutate leader-owned fields of the shared document
    ///
    /// Fails with [`Error::NotLeaderError`] on followers, before anything is read.
    pub async fn with_leader_write<T, F>(&self, what: &'static str, mutate: F) -> Result<T>
    where
        F: FnMut(&mut ClusterState) -> T + Send,
        T: Send,
    {
        if !self.is_leader() {
            return Err(Error::NotLeaderError(what));
        }
        Ok(read_modify_write(self.store.as_ref(), mutate).await?)
    }

    /// Mutate this unit's own partition of the shared document
    pub async fn update_own_unit<F>(&self, mut mutate: F) -> Result<()>
    where
        F: FnMut(&mut UnitData) + Send,
    {
        let unit = self.unit.clone();
        read_modify_write(self.store.as_ref(), |state| {
            mutate(state.units.entry(unit.clone()).or_default())
        })
        .await?;
        Ok(())
    }

    pub async fn set_maintenance(&self, message: Option<String>) {
        self.local().await.maintenance = message;
    }

    /// Ask the control plane whether this unit is the primary and label it accordingly
    pub async fn refresh_role(&self) -> Result<bool> {
        let primary = self.control_plane.primary().await?;
        let is_primary = primary.as_deref() == Some(self.unit.as_str());
        let changed = {
            let mut local = self.local().await;
            let changed = local.is_primary != is_primary;
            local.is_primary = is_primary;
            changed
        };
        if changed {
            debug!(unit = %self.unit, is_primary, "Primary role changed");
        }
        self.discovery.set_primary(&self.unit, is_primary).await?;
        Ok(is_primary)
    }

    /// This unit as seen through the shared document and local knowledge
    pub async fn unit_view(&self, state: &ClusterState) -> Unit {
        let blocked = {
            let local = self.local().await;
            local
                .blocked_message()
                .map(str::to_string)
                .or_else(|| state.blocked.clone())
        };
        Unit::from_state(&self.unit, state, self.is_leader(), blocked)
    }
}
