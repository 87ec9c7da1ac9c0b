//! The broker multiplexer
//!
//! One [`Mux`] per node. It exclusively owns the local tun device and the
//! tunnel listener, keeps at most one authenticated tunnel per peer, and
//! routes IP packets between the tun and peer tunnels via the link
//! registry.

mod connection;

pub use connection::{FailHandler, HelloSink, MuxPort, TunnelConnection};

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ipnet::IpNet;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::links::{Link, LinkError, Links};
use crate::net::CidrList;
use crate::protocol::{ExtensionSet, Hello, ProtocolError};
use crate::store::{LinkSpec, LinkStore, StoreError};
use crate::transport::{dial_tcp, PeerIdentity, TlsContext, TransportError};
use crate::DEFAULT_PORT;

/// Tunnel and mux errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("handshake timeout")]
    HandshakeTimeout,

    #[error("cluster address mismatch: got {got} but expected {expected}")]
    ClusterAddressMismatch { got: IpAddr, expected: IpAddr },

    #[error("cluster address mismatch: own address {own} not in foreign range {remote}")]
    OwnAddressNotInRemoteRange { own: IpAddr, remote: IpNet },

    #[error("cluster address mismatch: remote address {remote} not in local range {local}")]
    RemoteAddressNotInLocalRange { remote: IpAddr, local: IpNet },

    #[error("anonymous peer rejected")]
    AnonymousRejected,

    #[error("unknown peer cluster {0}")]
    UnknownPeer(IpAddr),

    #[error("link {0} is inbound-only")]
    InboundOnly(String),

    #[error("mux is closed")]
    Closed,

    #[error("cannot write tun: {0}")]
    TunWrite(std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Normal closure: the peer went away cleanly.
    pub fn is_eof(&self) -> bool {
        match self {
            TunnelError::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            TunnelError::Protocol(ProtocolError::Io(e)) => {
                e.kind() == std::io::ErrorKind::UnexpectedEof
            }
            _ => false,
        }
    }

    /// Fatal errors make the whole datapath unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TunnelError::TunWrite(_))
    }
}

/// The local virtual L3 interface.
///
/// The mux is the exclusive owner; every call delivers one whole packet.
pub trait Tun: Send + Sync {
    fn write(&self, packet: &[u8]) -> std::io::Result<usize>;
}

/// The node's mesh identity. Immutable after startup.
#[derive(Debug, Clone)]
pub struct MeshIdentity {
    /// Own address inside the mesh, with the mesh prefix
    pub cluster_address: IpNet,
    /// Port advertised to peers
    pub port: u16,
    /// Service CIDRs advertised as reachable through this node
    pub local: CidrList,
}

/// Everything a mux is built from.
pub struct MuxOptions {
    pub identity: MeshIdentity,
    pub links: Arc<Links>,
    pub tun: Arc<dyn Tun>,
    pub extensions: ExtensionSet,
    pub tls: Option<TlsContext>,
    pub store: Option<Arc<dyn LinkStore>>,
    pub sink: Option<Arc<dyn HelloSink>>,
    pub auto_connect: bool,
    pub allow_anonymous: bool,
    pub dial_budget: Duration,
}

/// The per-node multiplexer.
pub struct Mux {
    identity: MeshIdentity,
    links: Arc<Links>,
    tun: Arc<dyn Tun>,
    extensions: ExtensionSet,
    tls: Option<TlsContext>,
    store: Option<Arc<dyn LinkStore>>,
    sink: Option<Arc<dyn HelloSink>>,
    auto_connect: bool,
    allow_anonymous: bool,
    dial_budget: Duration,
    /// Peer tunnels keyed by cluster IP, or remote address for anonymous
    /// peers. Guarded by one mutex; never held across I/O.
    tunnels: Mutex<HashMap<String, Arc<TunnelConnection>>>,
    shutdown: CancellationToken,
}

impl Mux {
    pub fn new(opts: MuxOptions) -> Arc<Self> {
        Arc::new(Self {
            identity: opts.identity,
            links: opts.links,
            tun: opts.tun,
            extensions: opts.extensions,
            tls: opts.tls,
            store: opts.store,
            sink: opts.sink,
            auto_connect: opts.auto_connect,
            allow_anonymous: opts.allow_anonymous,
            dial_budget: opts.dial_budget,
            tunnels: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn links(&self) -> &Arc<Links> {
        &self.links
    }

    pub fn identity(&self) -> &MeshIdentity {
        &self.identity
    }

    fn key_for(link: &Link) -> String {
        link.cluster_address.addr().to_string()
    }

    /// Ensure a live outbound tunnel for a link.
    ///
    /// Idempotent: a healthy tunnel for the link's cluster address is
    /// returned as-is. Dial, TLS handshake and hello exchange each run
    /// under their own deadline derived from the dial budget.
    pub async fn assure_tunnel(
        self: &Arc<Self>,
        link: &Arc<Link>,
    ) -> Result<Arc<TunnelConnection>, TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        let key = Self::key_for(link);
        if let Some(existing) = self.lookup(&key) {
            return Ok(existing);
        }
        if link.is_inbound_only() {
            return Err(TunnelError::InboundOnly(link.name.clone()));
        }

        debug!(link = %link, "dialing peer");
        let remote = format!("{}:{}", link.host, link.port);
        let conn = match &self.tls {
            Some(ctx) => {
                let stream = ctx.dial(&link.host, link.port, self.dial_budget).await?;
                self.open_tunnel(stream, remote, Some(link)).await?
            }
            None => {
                let stream = dial_tcp(&link.host, link.port, self.dial_budget).await?;
                self.open_tunnel(stream, remote, Some(link)).await?
            }
        };
        self.register(key, conn)
    }

    /// Serve one accepted connection: handshake without a pre-declared
    /// link, then bind it to a registered cluster or auto-connect.
    pub async fn serve_incoming<S>(
        self: &Arc<Self>,
        stream: S,
        remote: String,
        peer: Option<PeerIdentity>,
    ) -> Result<Arc<TunnelConnection>, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        let (conn, hello) = self.handshake(stream, remote.clone(), None).await?;

        let key = if hello.is_anonymous() {
            remote.clone()
        } else {
            let ip = hello.cluster_cidr.addr();
            if self.links.get_by_cluster_address(ip).is_none() {
                if let Err(e) = self.auto_register(&hello, peer.as_ref()).await {
                    conn.close();
                    return Err(e);
                }
            }
            ip.to_string()
        };
        info!(%remote, cluster = %hello.cluster_cidr, "tunnel established");
        self.register(key, conn)
    }

    /// Materialize a link for an authenticated unknown peer.
    async fn auto_register(
        &self,
        hello: &Hello,
        peer: Option<&PeerIdentity>,
    ) -> Result<(), TunnelError> {
        let ip = hello.cluster_cidr.addr();
        if !self.auto_connect {
            return Err(TunnelError::UnknownPeer(ip));
        }
        let (Some(peer), Some(store)) = (peer, &self.store) else {
            return Err(TunnelError::UnknownPeer(ip));
        };
        let port = if hello.port > 0 { hello.port } else { DEFAULT_PORT };
        let spec = LinkSpec {
            name: peer.common_name.clone(),
            cluster_address: hello.cluster_cidr.to_string(),
            endpoint: format!("{}:{}", peer.common_name, port),
            cidr: hello.cidr.map(|c| c.to_string()),
            ..Default::default()
        };
        info!(link = %spec.name, cluster = %spec.cluster_address, "auto-connecting unknown peer");
        store.register_link(spec.clone()).await?;
        self.links.put(&spec)?;
        Ok(())
    }

    async fn open_tunnel<S>(
        self: &Arc<Self>,
        stream: S,
        remote: String,
        expected: Option<&Arc<Link>>,
    ) -> Result<Arc<TunnelConnection>, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (conn, _) = self.handshake(stream, remote, expected).await?;
        Ok(conn)
    }

    async fn handshake<S>(
        self: &Arc<Self>,
        stream: S,
        remote: String,
        expected: Option<&Arc<Link>>,
    ) -> Result<(Arc<TunnelConnection>, Hello), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let port: Arc<dyn MuxPort> = self.clone();
        tokio::time::timeout(
            self.dial_budget,
            TunnelConnection::open(port, stream, remote, expected.map(Arc::as_ref)),
        )
        .await
        .map_err(|_| TunnelError::HandshakeTimeout)?
    }

    fn lookup(&self, key: &str) -> Option<Arc<TunnelConnection>> {
        self.tunnels
            .lock()
            .expect("tunnel table lock poisoned")
            .get(key)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Insert a fresh tunnel, spawning its read loop. Losing an insert
    /// race closes the loser and hands back the winner.
    fn register(
        self: &Arc<Self>,
        key: String,
        conn: Arc<TunnelConnection>,
    ) -> Result<Arc<TunnelConnection>, TunnelError> {
        let winner = {
            let mut tunnels = self.tunnels.lock().expect("tunnel table lock poisoned");
            match tunnels.get(&key) {
                Some(existing) if !existing.is_closed() => Some(existing.clone()),
                _ => {
                    tunnels.insert(key, conn.clone());
                    None
                }
            }
        };
        match winner {
            Some(existing) => {
                debug!(conn = %conn, "lost tunnel insert race");
                conn.close();
                Ok(existing)
            }
            None => {
                let serving = conn.clone();
                tokio::spawn(async move { serving.serve().await });
                Ok(conn)
            }
        }
    }

    /// The active tunnel for a destination address, via the registry:
    /// cluster addresses first, then egress ranges.
    pub fn route_for_ip(&self, ip: IpAddr) -> Option<Arc<TunnelConnection>> {
        let link = self.links.get_by_egress(ip)?;
        self.lookup(&Self::key_for(&link))
    }

    /// Close and unregister the tunnel of a link.
    pub fn drop_tunnel(&self, link: &Link) {
        let removed = self
            .tunnels
            .lock()
            .expect("tunnel table lock poisoned")
            .remove(&Self::key_for(link));
        if let Some(conn) = removed {
            info!(conn = %conn, "dropping tunnel");
            conn.close();
        }
    }

    /// Accept loop. Failed TLS handshakes are logged and dropped; the
    /// loop ends when the mux closes.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "broker listening");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("listener closing");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            stream.set_nodelay(true).ok();
                            let mux = self.clone();
                            tokio::spawn(async move {
                                mux.accepted(stream, peer_addr.to_string()).await;
                            });
                        }
                        Err(e) => error!("accept error: {}", e),
                    }
                }
            }
        }
    }

    async fn accepted(self: &Arc<Self>, stream: tokio::net::TcpStream, remote: String) {
        debug!(%remote, "new connection");
        let result = match &self.tls {
            Some(ctx) => match ctx.accept(stream, self.dial_budget).await {
                Ok((tls, identity)) => self
                    .serve_incoming(tls, remote.clone(), identity)
                    .await
                    .map(|_| ()),
                Err(e) => {
                    warn!(%remote, error = %e, "TLS accept failed");
                    return;
                }
            },
            None => self.serve_incoming(stream, remote.clone(), None).await.map(|_| ()),
        };
        if let Err(e) = result {
            warn!(%remote, error = %e, "incoming tunnel rejected");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Shut down: cancel the listener and close every tunnel. Safe to
    /// call any number of times.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("closing mux");
        self.shutdown.cancel();
        let conns: Vec<_> = {
            let mut tunnels = self.tunnels.lock().expect("tunnel table lock poisoned");
            tunnels.drain().map(|(_, c)| c).collect()
        };
        for conn in conns {
            conn.close();
        }
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.lock().expect("tunnel table lock poisoned").len()
    }
}

impl MuxPort for Mux {
    fn cluster_addr(&self) -> IpNet {
        self.identity.cluster_address
    }

    fn advertised_port(&self) -> u16 {
        self.identity.port
    }

    fn local_cidrs(&self) -> &CidrList {
        &self.identity.local
    }

    fn allow_anonymous(&self) -> bool {
        self.allow_anonymous
    }

    fn extensions(&self) -> &ExtensionSet {
        &self.extensions
    }

    fn link_for_cluster_address(&self, ip: IpAddr) -> Option<Arc<Link>> {
        self.links.get_by_cluster_address(ip)
    }

    fn write_tun(&self, packet: &[u8]) -> std::io::Result<usize> {
        self.tun.write(packet)
    }

    fn dispatch_hello(&self, hello: Hello) {
        if let Some(sink) = self.sink.clone() {
            tokio::spawn(async move { sink.hello_received(hello).await });
        }
    }

    fn notify(&self, conn: &Arc<TunnelConnection>, err: Option<&TunnelError>) {
        self.tunnels
            .lock()
            .expect("tunnel table lock poisoned")
            .retain(|_, c| !Arc::ptr_eq(c, conn));
        match err {
            Some(e) if e.is_fatal() => {
                error!(conn = %conn, error = %e, "datapath unusable, closing mux");
                self.close();
            }
            Some(e) => warn!(conn = %conn, error = %e, "tunnel failed"),
            None => debug!(conn = %conn, "tunnel closed"),
        }
    }
}

/// Feeds advertised access and DNS info from validated hellos into the
/// registry.
///
/// A received value stages with `pending`; a peer echoing the staged
/// value back confirms it and clears `pending`.
pub struct RegistryHelloSink {
    links: Arc<Links>,
}

impl RegistryHelloSink {
    pub fn new(links: Arc<Links>) -> Arc<Self> {
        Arc::new(Self { links })
    }
}

#[async_trait::async_trait]
impl HelloSink for RegistryHelloSink {
    async fn hello_received(&self, hello: Hello) {
        if hello.is_anonymous() {
            return;
        }
        let Some(link) = self
            .links
            .get_by_cluster_address(hello.cluster_cidr.addr())
        else {
            return;
        };
        let access = hello.access_info();
        let dns = hello.dns_info();
        if access.is_none() && dns.is_none() {
            return;
        }
        self.links
            .foreign_confirmed(&link.name, access.as_ref(), dns.as_ref());
        self.links
            .update_foreign(&link.name, access.as_ref(), dns.as_ref(), true);
    }
}
