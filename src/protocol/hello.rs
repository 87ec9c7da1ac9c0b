//! Hello handshake message
//!
//! The hello is the mandatory first frame in each direction of a tunnel.
//! Fixed header (big-endian):
//!
//! ```text
//! version[u16] | cluster_addr[16] | cluster_prefix[u8] | port[u16]
//!             | service_addr[16] | service_prefix[u8]
//! ```
//!
//! Addresses are 16 bytes, IPv4 carried v4-mapped; the all-zero address
//! with prefix 0 is the anonymous sentinel `::/0`. The header is followed
//! by extension records `id[u16] | len[u16] | value`. Unknown extension
//! ids are preserved verbatim and never fail the handshake.

use std::net::IpAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use ipnet::IpNet;

use super::ProtocolError;
use crate::net::{anonymous_cidr, ip_from_wire, ip_to_wire, is_anonymous};

/// Current hello version
pub const HELLO_VERSION: u16 = 1;

/// Size of the fixed hello header
pub const HELLO_HEADER_SIZE: usize = 38;

/// API access advertisement (CA certificate + token)
pub const EXT_ACCESS_INFO: u16 = 1;
/// DNS advertisement (service IP + cluster domain)
pub const EXT_DNS_INFO: u16 = 2;

/// A raw extension record, kept verbatim for ids this broker does not know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub id: u16,
    pub data: Bytes,
}

/// The hello handshake record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    /// Remote cluster address with mesh prefix, or the anonymous sentinel
    pub cluster_cidr: IpNet,
    /// Port the sender accepts tunnels on
    pub port: u16,
    /// Primary service CIDR advertised as reachable through the sender
    pub cidr: Option<IpNet>,
    pub extensions: Vec<Extension>,
}

impl Default for Hello {
    fn default() -> Self {
        Self::new()
    }
}

impl Hello {
    /// An anonymous hello with no extensions.
    pub fn new() -> Self {
        Self {
            version: HELLO_VERSION,
            cluster_cidr: anonymous_cidr(),
            port: 0,
            cidr: None,
            extensions: Vec::new(),
        }
    }

    pub fn set_cluster_cidr(&mut self, cidr: IpNet) {
        self.cluster_cidr = cidr;
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn set_cidr(&mut self, cidr: IpNet) {
        self.cidr = Some(cidr);
    }

    pub fn is_anonymous(&self) -> bool {
        is_anonymous(&self.cluster_cidr)
    }

    /// Look up an extension by id.
    pub fn extension(&self, id: u16) -> Option<&Extension> {
        self.extensions.iter().find(|e| e.id == id)
    }

    /// Replace or append an extension record.
    pub fn set_extension(&mut self, id: u16, data: Bytes) {
        if let Some(ext) = self.extensions.iter_mut().find(|e| e.id == id) {
            ext.data = data;
        } else {
            self.extensions.push(Extension { id, data });
        }
    }

    pub fn access_info(&self) -> Option<AccessInfo> {
        self.extension(EXT_ACCESS_INFO)
            .and_then(|e| AccessInfo::decode(&e.data))
    }

    pub fn set_access_info(&mut self, info: &AccessInfo) {
        self.set_extension(EXT_ACCESS_INFO, info.encode());
    }

    pub fn dns_info(&self) -> Option<DnsInfo> {
        self.extension(EXT_DNS_INFO)
            .and_then(|e| DnsInfo::decode(&e.data))
    }

    pub fn set_dns_info(&mut self, info: &DnsInfo) {
        self.set_extension(EXT_DNS_INFO, info.encode());
    }

    /// Encode header plus extensions.
    pub fn encode(&self) -> BytesMut {
        let ext_len: usize = self.extensions.iter().map(|e| 4 + e.data.len()).sum();
        let mut buf = BytesMut::with_capacity(HELLO_HEADER_SIZE + ext_len);

        buf.put_u16(self.version);
        buf.put_slice(&ip_to_wire(self.cluster_cidr.addr()));
        buf.put_u8(self.cluster_cidr.prefix_len());
        buf.put_u16(self.port);
        match &self.cidr {
            Some(cidr) => {
                buf.put_slice(&ip_to_wire(cidr.addr()));
                buf.put_u8(cidr.prefix_len());
            }
            None => {
                buf.put_slice(&[0u8; 16]);
                buf.put_u8(0);
            }
        }
        for ext in &self.extensions {
            buf.put_u16(ext.id);
            buf.put_u16(ext.data.len() as u16);
            buf.put_slice(&ext.data);
        }
        buf
    }

    /// Decode a hello payload.
    ///
    /// Fails only on truncation or a declared extension length overrunning
    /// the packet.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HELLO_HEADER_SIZE {
            return Err(ProtocolError::HelloTooShort {
                len: data.len(),
                expected: HELLO_HEADER_SIZE,
            });
        }
        let version = u16::from_be_bytes([data[0], data[1]]);

        let mut addr = [0u8; 16];
        addr.copy_from_slice(&data[2..18]);
        let cluster_cidr = decode_cidr(addr, data[18])?;

        let port = u16::from_be_bytes([data[19], data[20]]);

        addr.copy_from_slice(&data[21..37]);
        let service = decode_cidr(addr, data[37])?;
        let cidr = if is_anonymous(&service) { None } else { Some(service) };

        let mut extensions = Vec::new();
        let mut rest = &data[HELLO_HEADER_SIZE..];
        while !rest.is_empty() {
            if rest.len() < 4 {
                return Err(ProtocolError::HelloTooShort {
                    len: rest.len(),
                    expected: 4,
                });
            }
            let id = u16::from_be_bytes([rest[0], rest[1]]);
            let len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
            rest = &rest[4..];
            if len > rest.len() {
                return Err(ProtocolError::ExtensionOverrun {
                    id,
                    declared: len,
                    remaining: rest.len(),
                });
            }
            extensions.push(Extension {
                id,
                data: Bytes::copy_from_slice(&rest[..len]),
            });
            rest = &rest[len..];
        }

        Ok(Self {
            version,
            cluster_cidr,
            port,
            cidr,
            extensions,
        })
    }
}

fn decode_cidr(addr: [u8; 16], prefix: u8) -> Result<IpNet, ProtocolError> {
    let ip = ip_from_wire(addr);
    IpNet::new(ip, prefix).map_err(|_| ProtocolError::InvalidHello("address prefix length"))
}

/// API access advertisement carried in `EXT_ACCESS_INFO`.
///
/// Layout: `ca_len[u16] | ca_cert | token_len[u16] | token`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessInfo {
    pub ca_cert: String,
    pub token: String,
}

impl AccessInfo {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.ca_cert.len() + self.token.len());
        buf.put_u16(self.ca_cert.len() as u16);
        buf.put_slice(self.ca_cert.as_bytes());
        buf.put_u16(self.token.len() as u16);
        buf.put_slice(self.token.as_bytes());
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }
        let ca_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        let rest = &data[2..];
        if rest.len() < ca_len + 2 {
            return None;
        }
        let ca_cert = String::from_utf8(rest[..ca_len].to_vec()).ok()?;
        let rest = &rest[ca_len..];
        let token_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        let rest = &rest[2..];
        if rest.len() < token_len {
            return None;
        }
        let token = String::from_utf8(rest[..token_len].to_vec()).ok()?;
        Some(Self { ca_cert, token })
    }
}

/// DNS advertisement carried in `EXT_DNS_INFO`.
///
/// Layout: `dns_ip[16] | cluster_domain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsInfo {
    pub dns_ip: IpAddr,
    pub cluster_domain: String,
}

impl DnsInfo {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.cluster_domain.len());
        buf.put_slice(&ip_to_wire(self.dns_ip));
        buf.put_slice(self.cluster_domain.as_bytes());
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 16 {
            return None;
        }
        let mut addr = [0u8; 16];
        addr.copy_from_slice(&data[..16]);
        let cluster_domain = String::from_utf8(data[16..].to_vec()).ok()?;
        Some(Self {
            dns_ip: ip_from_wire(addr),
            cluster_domain,
        })
    }
}

/// A contributor of hello extensions.
///
/// Producers are registered on an [`ExtensionSet`] that is injected into
/// the mux at construction; there is no process-wide registry.
pub trait ExtensionProducer: Send + Sync {
    fn add(&self, hello: &mut Hello);
}

/// The set of extension producers applied to every outbound hello.
#[derive(Clone, Default)]
pub struct ExtensionSet {
    producers: Vec<Arc<dyn ExtensionProducer>>,
}

impl ExtensionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, producer: Arc<dyn ExtensionProducer>) {
        self.producers.push(producer);
    }

    pub fn apply(&self, hello: &mut Hello) {
        for producer in &self.producers {
            producer.add(hello);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}

impl std::fmt::Debug for ExtensionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionSet")
            .field("producers", &self.producers.len())
            .finish()
    }
}
