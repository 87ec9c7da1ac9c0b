//! Declarative store contract
//!
//! The broker is fed by an external reconciliation source (in production a
//! cluster API) that surfaces link declarations as events. Only the
//! contract lives here: the spec/status types and the [`LinkStore`] trait
//! the core calls back into for auto-connect registration and status
//! reporting.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Link state reported while a tunnel is being established or served
pub const STATE_UP: &str = "Up";
/// Link state reported after a failed connect attempt
pub const STATE_ERROR: &str = "Error";

/// A declared peer, as stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub name: String,
    /// Peer cluster address inside the mesh, CIDR notation
    pub cluster_address: String,
    /// Transport address `host[:port]`, or `"none"` for inbound-only links
    pub endpoint: String,
    /// Primary service CIDR advertised by the peer
    #[serde(default)]
    pub cidr: Option<String>,
    /// Ingress policy entries; a leading `!` denotes a deny entry
    #[serde(default)]
    pub ingress: Vec<String>,
    /// Destination CIDRs routed through this peer
    #[serde(default)]
    pub egress: Vec<String>,
    /// WireGuard public key enabling the alternate datapath
    #[serde(default)]
    pub public_key: Option<String>,
    /// Reference to an API access advertisement target
    #[serde(default)]
    pub api_access: Option<String>,
    #[serde(default)]
    pub dns: Option<DnsSpec>,
    /// Gateway node address, maintained by the store's status machinery
    #[serde(default)]
    pub gateway: Option<String>,
}

/// DNS propagation settings for a link
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSpec {
    #[serde(default)]
    pub dns_ip: Option<String>,
    #[serde(default)]
    pub base_domain: Option<String>,
}

/// Link status written back to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    #[serde(default)]
    pub gateway: Option<String>,
    pub state: String,
    pub message: String,
}

impl LinkStatus {
    pub fn up() -> Self {
        Self {
            gateway: None,
            state: STATE_UP.into(),
            message: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            gateway: None,
            state: STATE_ERROR.into(),
            message: message.into(),
        }
    }
}

/// Reconciliation event kinds emitted by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Added,
    Updated,
    Deleted,
}

/// One reconciliation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEvent {
    pub kind: EventKind,
    pub spec: LinkSpec,
}

/// Store errors surfaced to the core
#[derive(Debug, Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

/// Write access to the declarative store.
///
/// `register_link` materializes a link for an authenticated unknown peer
/// (auto-connect); `update_status` surfaces connect results on the link's
/// status.
#[async_trait]
pub trait LinkStore: Send + Sync {
    async fn register_link(&self, spec: LinkSpec) -> Result<(), StoreError>;

    async fn update_status(&self, name: &str, status: LinkStatus) -> Result<(), StoreError>;
}
