//! One tunnel connection
//!
//! A [`TunnelConnection`] owns one byte stream to a peer. Construction
//! performs the hello handshake; afterwards the serve loop reads frames,
//! applies ingress policy and delivers admitted packets to the tun.
//!
//! The connection holds only a narrow capability reference back to the
//! mux ([`MuxPort`]): failure notification, registry lookup and tun
//! writes. The mux holds the strong reference; removal from its table on
//! close unwinds the reference cycle.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TunnelError;
use crate::links::Link;
use crate::net::{ip_version, CidrList, Ipv4Header};
use crate::protocol::{
    read_frame, write_frame, ExtensionSet, Hello, PACKET_TYPE_DATA, PACKET_TYPE_HELLO,
};
use crate::BUFFER_SIZE;

/// The mux capabilities a tunnel connection may use.
pub trait MuxPort: Send + Sync {
    fn cluster_addr(&self) -> IpNet;
    fn advertised_port(&self) -> u16;
    fn local_cidrs(&self) -> &CidrList;
    fn allow_anonymous(&self) -> bool;
    fn extensions(&self) -> &ExtensionSet;
    fn link_for_cluster_address(&self, ip: IpAddr) -> Option<Arc<Link>>;
    fn write_tun(&self, packet: &[u8]) -> std::io::Result<usize>;
    /// Hand a validated remote hello to the advertisement machinery.
    fn dispatch_hello(&self, hello: Hello);
    /// Connection terminated; `None` means normal closure.
    fn notify(&self, conn: &Arc<TunnelConnection>, err: Option<&TunnelError>);
}

/// Receives the terminal error of a tunnel. Normal closure (EOF) is not
/// reported.
pub trait FailHandler: Send + Sync {
    fn notify(&self, conn: &TunnelConnection, err: &TunnelError);
}

/// Receives validated remote hellos for advertisement processing.
#[async_trait]
pub trait HelloSink: Send + Sync {
    async fn hello_received(&self, hello: Hello);
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One live peer session.
pub struct TunnelConnection {
    port: Arc<dyn MuxPort>,
    remote_address: String,
    /// Peer cluster address, fixed at handshake; unset for anonymous peers
    cluster_cidr: OnceLock<IpNet>,
    /// Serializes frame reads so no caller sees a half frame
    reader: Mutex<BoxedReader>,
    /// Serializes frame writes; a frame is never interleaved
    writer: Mutex<BoxedWriter>,
    handlers: RwLock<Vec<Arc<dyn FailHandler>>>,
    cancel: CancellationToken,
    notified: AtomicBool,
}

impl TunnelConnection {
    /// Take ownership of an established byte stream and run the
    /// handshake. `expected` binds the remote cluster address when the
    /// link is already known (outbound dials).
    pub async fn open<S>(
        port: Arc<dyn MuxPort>,
        stream: S,
        remote_address: String,
        expected: Option<&Link>,
    ) -> Result<(Arc<Self>, Hello), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let conn = Arc::new(Self {
            port,
            remote_address,
            cluster_cidr: OnceLock::new(),
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            handlers: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
            notified: AtomicBool::new(false),
        });
        if let Some(link) = expected {
            let _ = conn.cluster_cidr.set(link.cluster_address);
        }

        let remote_hello = conn.handshake().await?;
        conn.validate(&remote_hello, expected)?;
        if !remote_hello.is_anonymous() {
            let _ = conn.cluster_cidr.set(remote_hello.cluster_cidr);
        }
        conn.port.dispatch_hello(remote_hello.clone());
        Ok((conn, remote_hello))
    }

    fn create_hello(&self) -> Hello {
        let mut hello = Hello::new();
        hello.set_cluster_cidr(self.port.cluster_addr());
        hello.set_port(self.port.advertised_port());
        if let Some(first) = self.port.local_cidrs().iter().next() {
            hello.set_cidr(*first);
        }
        self.port.extensions().apply(&mut hello);
        hello
    }

    /// Exchange hellos: the local hello goes out while the remote's first
    /// frame is read, joined before returning. A read error takes
    /// precedence over a write error for diagnosis.
    async fn handshake(&self) -> Result<Hello, TunnelError> {
        let local = self.create_hello();
        let (read_result, write_result) =
            tokio::join!(self.read_hello(), self.write_hello(&local));
        let remote = read_result?;
        write_result?;
        info!(
            remote = %self.remote_address,
            cluster = %remote.cluster_cidr,
            net = ?remote.cidr,
            port = remote.port,
            "remote hello"
        );
        Ok(remote)
    }

    async fn write_hello(&self, hello: &Hello) -> Result<(), TunnelError> {
        self.write_packet(PACKET_TYPE_HELLO, &hello.encode()).await
    }

    async fn read_hello(&self) -> Result<Hello, TunnelError> {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let (ty, n) = self.read_packet(&mut buffer).await?;
        if ty != PACKET_TYPE_HELLO {
            return Err(crate::protocol::ProtocolError::UnexpectedPacket(ty).into());
        }
        Ok(Hello::decode(&buffer[..n])?)
    }

    fn validate(&self, hello: &Hello, expected: Option<&Link>) -> Result<(), TunnelError> {
        if hello.is_anonymous() {
            if !self.port.allow_anonymous() {
                return Err(TunnelError::AnonymousRejected);
            }
            return Ok(());
        }
        let cidr = hello.cluster_cidr;
        if let Some(link) = expected {
            if link.cluster_address.addr() != cidr.addr() {
                return Err(TunnelError::ClusterAddressMismatch {
                    got: cidr.addr(),
                    expected: link.cluster_address.addr(),
                });
            }
        }
        let own = self.port.cluster_addr();
        if !cidr.contains(&own.addr()) {
            return Err(TunnelError::OwnAddressNotInRemoteRange {
                own: own.addr(),
                remote: cidr,
            });
        }
        if !own.contains(&cidr.addr()) {
            return Err(TunnelError::RemoteAddressNotInLocalRange {
                remote: cidr.addr(),
                local: own,
            });
        }
        Ok(())
    }

    /// Peer cluster address and prefix, known after the handshake unless
    /// the peer is anonymous.
    pub fn cluster_cidr(&self) -> Option<IpNet> {
        self.cluster_cidr.get().copied()
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn register_fail_handler(&self, handler: Arc<dyn FailHandler>) {
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .push(handler);
    }

    /// Read one frame under the read lock.
    pub async fn read_packet(&self, buf: &mut [u8]) -> Result<(u8, usize), TunnelError> {
        let mut reader = self.reader.lock().await;
        Ok(read_frame(&mut *reader, buf).await?)
    }

    /// Write one frame under the write lock.
    pub async fn write_packet(&self, ty: u8, payload: &[u8]) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        let mut writer = self.writer.lock().await;
        Ok(write_frame(&mut *writer, ty, payload).await?)
    }

    /// The read loop. Exits on the first I/O or tun error, or when the
    /// connection is closed, and reports exactly once.
    pub async fn serve(self: Arc<Self>) {
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => None,
            err = self.serve_loop() => Some(err),
        };
        self.finish(outcome).await;
    }

    async fn serve_loop(&self) -> TunnelError {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        loop {
            let (ty, n) = match self.read_packet(&mut buffer).await {
                Ok(frame) => frame,
                Err(e) => return e,
            };
            if n == 0 && ty == PACKET_TYPE_DATA {
                continue;
            }
            if ty != PACKET_TYPE_DATA {
                debug!(conn = %self, "got packet of unknown type {:x}", ty);
                continue;
            }
            let packet = &buffer[..n];
            if ip_version(packet) == Some(4) {
                match Ipv4Header::parse(packet) {
                    Some(header) => {
                        if !self.admit(&header) {
                            continue;
                        }
                    }
                    None => {
                        warn!(conn = %self, "dropping packet with malformed ipv4 header");
                        continue;
                    }
                }
            }
            // Non-IPv4 traffic passes to the tun uninspected
            match self.port.write_tun(packet) {
                Ok(written) if written != n => {
                    return TunnelError::TunWrite(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        format!("packet length {}, but written {}", n, written),
                    ));
                }
                Ok(_) => {}
                Err(e) => return TunnelError::TunWrite(e),
            }
        }
    }

    /// Ingress admission for one inbound IPv4 packet.
    fn admit(&self, header: &Ipv4Header) -> bool {
        let src = IpAddr::V4(header.src);
        let dst = IpAddr::V4(header.dst);
        let own = self.port.cluster_addr();

        if own.contains(&src) {
            let Some(link) = self.port.link_for_cluster_address(src) else {
                warn!(conn = %self, %src, "dropping packet from unknown cluster address");
                return false;
            };
            let (granted, set) = link.allow_ingress(dst);
            if !granted {
                warn!(conn = %self, %src, %dst, "dropping packet denied by ingress policy");
                return false;
            }
            let local = self.port.local_cidrs();
            if !set && !local.is_empty() && !local.contains(dst) {
                warn!(conn = %self, %src, %dst, "dropping packet outside local service range");
                return false;
            }
            true
        } else if dst != own.addr() {
            warn!(conn = %self, %src, %dst, "dropping packet not addressed to this node");
            false
        } else {
            true
        }
    }

    /// Report the terminal state once: the mux always unregisters, fail
    /// handlers only hear real errors (EOF is a normal closure).
    async fn finish(self: &Arc<Self>, outcome: Option<TunnelError>) {
        if self.notified.swap(true, Ordering::SeqCst) {
            return;
        }
        let err = outcome.filter(|e| !e.is_eof());
        self.port.notify(self, err.as_ref());
        if let Some(err) = &err {
            let handlers = self
                .handlers
                .read()
                .expect("handler lock poisoned")
                .clone();
            for handler in handlers {
                handler.notify(self, err);
            }
        }
        self.close();
        // Best-effort stream shutdown; dropping the halves closes the
        // socket regardless.
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Idempotent close: repeat calls are no-ops with the same result.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Display for TunnelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cluster_cidr.get() {
            Some(cidr) => write!(f, "{}[{}]", cidr, self.remote_address),
            None => write!(f, "?[{}]", self.remote_address),
        }
    }
}
