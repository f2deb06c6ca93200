//! Certificate posture of a unit

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which listener a certificate is for
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CertificateKind {
    /// Unit-to-unit traffic (replication, backup engine TLS server)
    Internal,
    /// Client-facing traffic
    External,
}

impl fmt::Display for CertificateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateKind::Internal => write!(f, "internal"),
            CertificateKind::External => write!(f, "external"),
        }
    }
}

/// PEM material delivered by the certificate provider
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

impl TlsMaterial {
    /// Key, certificate and CA are all present
    pub fn is_complete(&self) -> bool {
        [&self.cert, &self.key, &self.ca]
            .iter()
            .all(|part| part.as_deref().is_some_and(|pem| !pem.trim().is_empty()))
    }

    /// Merge newer material over this one, keeping parts the update omits
    pub fn merge(&mut self, update: TlsMaterial) {
        if update.cert.is_some() {
            self.cert = update.cert;
        }
        if update.key.is_some() {
            self.key = update.key;
        }
        if update.ca.is_some() {
            self.ca = update.ca;
        }
    }
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert", &self.cert.is_some())
            .field("key", &self.key.is_some())
            .field("ca", &self.ca.is_some())
            .finish()
    }
}

/// Role of the backup engine's TLS server on a unit
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TlsServerRole {
    #[default]
    Stopped,
    /// Primary-facing endpoint; at most one unit at a time
    Primary,
    /// Running on a replica after the primary's server was observed
    Replica,
}

impl TlsServerRole {
    pub fn is_running(&self) -> bool {
        !matches!(self, TlsServerRole::Stopped)
    }
}

/// Per-unit certificate posture
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TlsState {
    pub external_cert: bool,
    pub internal_cert: bool,
    pub server: TlsServerRole,
    pub single_unit: bool,
}

impl TlsState {
    /// TLS counts as enabled once the internal triple is installed
    pub fn enabled(&self) -> bool {
        self.internal_cert
    }
}
