//! Link model and registry
//!
//! A [`Link`] is an immutable snapshot of one declared peer. The [`Links`]
//! registry indexes snapshots by name, by cluster address and by endpoint
//! host; updates replace the snapshot atomically while advertised foreign
//! data survives replacement.

pub mod firewall;

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use base64::Engine;
use ipnet::IpNet;
use thiserror::Error;
use tracing::info;

use crate::net::CidrList;
use crate::protocol::{AccessInfo, DnsInfo};
use crate::store::LinkSpec;

/// Endpoint value of links that only accept inbound tunnels
pub const ENDPOINT_NONE: &str = "none";

/// Link errors
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid cidr {value:?} for {field}: {reason}")]
    InvalidCidr {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("no endpoint")]
    NoEndpoint,

    #[error("invalid endpoint port {0:?}")]
    InvalidPort(String),

    #[error("invalid gateway address {0:?}")]
    InvalidGateway(String),

    #[error("invalid public key {0:?}")]
    InvalidPublicKey(String),

    #[error("cluster address {address} of link {name} collides with link {other}")]
    AddressCollision {
        name: String,
        address: IpAddr,
        other: String,
    },

    #[error("endpoint host {host} of link {name} collides with link {other}")]
    EndpointCollision {
        name: String,
        host: String,
        other: String,
    },

    #[error("egress of link {name} overlaps {other}")]
    CidrOverlap { name: String, other: String },

    #[error("link {0} not found")]
    NotFound(String),
}

/// Ingress policy: ordered allow and deny CIDR lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpRange {
    pub allowed: CidrList,
    pub denied: CidrList,
}

impl IpRange {
    /// Parse policy entries; a leading `!` denotes a deny entry.
    /// An empty list means no policy was declared.
    pub fn parse(list: &[String]) -> Result<Option<Self>, LinkError> {
        if list.is_empty() {
            return Ok(None);
        }
        let mut range = IpRange::default();
        for entry in list {
            let (field, cidr) = match entry.strip_prefix('!') {
                Some(rest) => (&mut range.denied, rest),
                None => (&mut range.allowed, entry.as_str()),
            };
            let net: IpNet = cidr.parse().map_err(|e| LinkError::InvalidCidr {
                field: "ingress",
                value: entry.clone(),
                reason: format!("{}", e),
            })?;
            field.add(net);
        }
        Ok(Some(range))
    }

    pub fn is_set(&self) -> bool {
        !self.allowed.is_empty() || !self.denied.is_empty()
    }

    /// Admission: the address passes iff the allow list is empty or
    /// contains it, and no deny entry contains it.
    pub fn contains(&self, ip: IpAddr) -> bool {
        (self.allowed.is_empty() || self.allowed.contains(ip)) && !self.denied.contains(ip)
    }
}

/// Advertised foreign state attached to a link, preserved across spec
/// updates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkForeignData {
    pub update_pending: bool,
    pub access: AccessInfo,
    pub dns: Option<DnsInfo>,
}

/// One declared peer. Snapshots are immutable; the registry swaps them.
#[derive(Debug, Clone)]
pub struct Link {
    pub name: String,
    /// Primary service CIDR advertised by the peer
    pub service_cidr: Option<IpNet>,
    /// Destination CIDRs routed through this peer
    pub egress: CidrList,
    pub ingress: Option<IpRange>,
    /// Peer address inside the mesh, with the mesh prefix
    pub cluster_address: IpNet,
    /// Gateway node serving this link, if assigned by the store
    pub gateway: Option<IpAddr>,
    pub host: String,
    pub port: u16,
    pub endpoint: String,
    /// WireGuard public key; selects the alternate datapath when set
    pub public_key: Option<String>,
    pub foreign: LinkForeignData,
}

impl Link {
    /// Ingress admission for a destination address.
    ///
    /// `set` distinguishes a declared-and-matched policy from the absence
    /// of any policy.
    pub fn allow_ingress(&self, ip: IpAddr) -> (bool, bool) {
        match &self.ingress {
            Some(range) if range.is_set() => (range.contains(ip), true),
            _ => (true, false),
        }
    }

    /// Links declared with endpoint `"none"` never get dialed.
    pub fn is_inbound_only(&self) -> bool {
        self.endpoint == ENDPOINT_NONE
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{},{},{}]",
            self.name, self.cluster_address, self.egress, self.endpoint
        )
    }
}

#[derive(Default)]
struct Indices {
    by_name: HashMap<String, Arc<Link>>,
    by_endpoint: HashMap<String, Arc<Link>>,
    by_cluster_addr: HashMap<IpAddr, Arc<Link>>,
}

impl Indices {
    fn insert(&mut self, link: Arc<Link>) -> Arc<Link> {
        if let Some(old) = self.by_name.get(&link.name).cloned() {
            if old.host != link.host {
                self.by_endpoint.remove(&old.host);
            }
            if old.cluster_address.addr() != link.cluster_address.addr() {
                self.by_cluster_addr.remove(&old.cluster_address.addr());
            }
        }
        self.by_name.insert(link.name.clone(), link.clone());
        if link.host != ENDPOINT_NONE {
            self.by_endpoint.insert(link.host.clone(), link.clone());
        }
        self.by_cluster_addr
            .insert(link.cluster_address.addr(), link.clone());
        link
    }
}

/// The concurrent link registry.
///
/// One reader-writer lock guards all indices; reads copy `Arc`s out and
/// never hold the lock across caller code.
pub struct Links {
    default_port: u16,
    /// Local service CIDR, used for egress overlap validation
    service_cidr: Option<IpNet>,
    inner: RwLock<Indices>,
}

impl Links {
    pub fn new(default_port: u16, service_cidr: Option<IpNet>) -> Self {
        Self {
            default_port,
            service_cidr,
            inner: RwLock::new(Indices::default()),
        }
    }

    /// Parse and validate a spec into a link snapshot, without touching
    /// the registry.
    pub fn parse(&self, spec: &LinkSpec) -> Result<Link, LinkError> {
        let mut egress = CidrList::new();
        let mut service_cidr = None;
        if let Some(cidr) = spec.cidr.as_deref().filter(|c| !c.is_empty()) {
            let net: IpNet = cidr.parse().map_err(|e| LinkError::InvalidCidr {
                field: "cidr",
                value: cidr.into(),
                reason: format!("{}", e),
            })?;
            service_cidr = Some(net.trunc());
            egress.add(net.trunc());
        }
        for cidr in &spec.egress {
            let net: IpNet = cidr.parse().map_err(|e| LinkError::InvalidCidr {
                field: "egress",
                value: cidr.clone(),
                reason: format!("{}", e),
            })?;
            egress.add(net);
        }

        let ingress = IpRange::parse(&spec.ingress)?;

        let cluster_address: IpNet =
            spec.cluster_address
                .parse()
                .map_err(|e| LinkError::InvalidCidr {
                    field: "cluster address",
                    value: spec.cluster_address.clone(),
                    reason: format!("{}", e),
                })?;

        if spec.endpoint.is_empty() {
            return Err(LinkError::NoEndpoint);
        }

        let gateway = match spec.gateway.as_deref().filter(|g| !g.is_empty()) {
            Some(g) => Some(
                g.parse::<IpAddr>()
                    .map_err(|_| LinkError::InvalidGateway(g.into()))?,
            ),
            None => None,
        };

        let mut endpoint = spec.endpoint.clone();
        let mut port = self.default_port;
        let host;
        if endpoint == ENDPOINT_NONE {
            host = ENDPOINT_NONE.to_string();
        } else {
            match endpoint.rsplit_once(':') {
                Some((h, p)) => {
                    port = p
                        .parse::<u16>()
                        .map_err(|_| LinkError::InvalidPort(p.into()))?;
                    host = h.to_string();
                }
                None => {
                    host = endpoint.clone();
                    endpoint = format!("{}:{}", host, port);
                }
            }
        }

        let public_key = match spec.public_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(key)
                    .map_err(|_| LinkError::InvalidPublicKey(key.into()))?;
                if decoded.len() != 32 {
                    return Err(LinkError::InvalidPublicKey(key.into()));
                }
                Some(key.to_string())
            }
            None => None,
        };

        Ok(Link {
            name: spec.name.clone(),
            service_cidr,
            egress,
            ingress,
            cluster_address,
            gateway,
            host,
            port,
            endpoint,
            public_key,
            foreign: LinkForeignData::default(),
        })
    }

    /// Admit or replace a link.
    ///
    /// Foreign data of a prior snapshot survives. Cluster address and
    /// endpoint collisions with other links are rejected, as is egress
    /// overlap with another link or the local service network.
    pub fn put(&self, spec: &LinkSpec) -> Result<Arc<Link>, LinkError> {
        let mut link = self.parse(spec)?;
        let mut inner = self.inner.write().expect("registry lock poisoned");

        if let Some(other) = inner.by_cluster_addr.get(&link.cluster_address.addr()) {
            if other.name != link.name {
                return Err(LinkError::AddressCollision {
                    name: link.name,
                    address: link.cluster_address.addr(),
                    other: other.name.clone(),
                });
            }
        }
        if link.host != ENDPOINT_NONE {
            if let Some(other) = inner.by_endpoint.get(&link.host) {
                if other.name != link.name {
                    return Err(LinkError::EndpointCollision {
                        name: link.name,
                        host: link.host,
                        other: other.name.clone(),
                    });
                }
            }
        }
        if let Some(service) = &self.service_cidr {
            if link.egress.overlaps_net(service) {
                return Err(LinkError::CidrOverlap {
                    name: link.name,
                    other: format!("local service network {}", service),
                });
            }
        }
        for other in inner.by_name.values() {
            if other.name != link.name && link.egress.overlaps(&other.egress) {
                return Err(LinkError::CidrOverlap {
                    name: link.name,
                    other: format!("link {}", other.name),
                });
            }
        }

        if let Some(old) = inner.by_name.get(&link.name) {
            link.foreign = old.foreign.clone();
        }
        Ok(inner.insert(Arc::new(link)))
    }

    pub fn remove(&self, name: &str) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(link) = inner.by_name.remove(name) {
            inner.by_endpoint.remove(&link.host);
            inner.by_cluster_addr.remove(&link.cluster_address.addr());
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Link>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_name
            .get(name)
            .cloned()
    }

    pub fn get_by_cluster_address(&self, ip: IpAddr) -> Option<Arc<Link>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_cluster_addr
            .get(&ip)
            .cloned()
    }

    pub fn get_by_endpoint(&self, host: &str) -> Option<Arc<Link>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_endpoint
            .get(host)
            .cloned()
    }

    /// Resolve a destination address: cluster addresses first, then a
    /// scan of the egress ranges. Overlapping egress cannot be admitted,
    /// so scan order does not matter.
    pub fn get_by_egress(&self, ip: IpAddr) -> Option<Arc<Link>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        if let Some(link) = inner.by_cluster_addr.get(&ip) {
            return Some(link.clone());
        }
        inner
            .by_name
            .values()
            .find(|l| l.egress.contains(ip))
            .cloned()
    }

    /// Apply advertised access/DNS info with two-phase semantics.
    ///
    /// With `pending` a new value is staged; while a stage is pending,
    /// conflicting non-pending updates are ignored. Returns the new
    /// snapshot and whether anything changed.
    pub fn update_foreign(
        &self,
        name: &str,
        access: Option<&AccessInfo>,
        dns: Option<&DnsInfo>,
        pending: bool,
    ) -> Option<(Arc<Link>, bool)> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let old = inner.by_name.get(name)?.clone();

        let mut updated = (*old).clone();
        let mut changed = false;
        if let Some(access) = access {
            if old.foreign.access != *access && (!old.foreign.update_pending || pending) {
                updated.foreign.access = access.clone();
                updated.foreign.update_pending = pending;
                changed = true;
                if pending {
                    info!(link = name, "new access info pending");
                } else {
                    info!(link = name, "updated access info");
                }
            }
        }
        if let Some(dns) = dns {
            if old.foreign.dns.as_ref() != Some(dns) && (!old.foreign.update_pending || pending) {
                updated.foreign.dns = Some(dns.clone());
                updated.foreign.update_pending = pending;
                changed = true;
                if pending {
                    info!(link = name, "new dns info pending");
                } else {
                    info!(link = name, "updated dns info");
                }
            }
        }

        if changed {
            Some((inner.insert(Arc::new(updated)), true))
        } else {
            Some((old, false))
        }
    }

    /// Confirmation path: the peer echoed staged values back; pending
    /// clears for values that now match.
    pub fn foreign_confirmed(
        &self,
        name: &str,
        access: Option<&AccessInfo>,
        dns: Option<&DnsInfo>,
    ) -> Option<Arc<Link>> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let old = inner.by_name.get(name)?.clone();

        let access_match = access.is_some_and(|a| old.foreign.access == *a);
        let dns_match = dns.is_some_and(|d| old.foreign.dns.as_ref() == Some(d));
        if (access_match || dns_match) && old.foreign.update_pending {
            let mut updated = (*old).clone();
            updated.foreign.update_pending = false;
            info!(link = name, "advertised info confirmed");
            return Some(inner.insert(Arc::new(updated)));
        }
        Some(old)
    }

    /// Snapshot iteration: the callback runs without the registry lock.
    pub fn visit<F>(&self, mut visitor: F)
    where
        F: FnMut(&Arc<Link>) -> bool,
    {
        let links: Vec<Arc<Link>> = {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner.by_name.values().cloned().collect()
        };
        for link in &links {
            if !visitor(link) {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
