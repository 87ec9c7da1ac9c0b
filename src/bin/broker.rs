//! Meshbridge broker
//!
//! The per-cluster broker node:
//! - accepts peer tunnels over mutually-authenticated TLS
//! - dials the links this node is responsible for
//! - bridges IP packets between the tun device and peer tunnels

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use meshbridge::{
    config::Config,
    links::Links,
    mux::{MeshIdentity, Mux, MuxOptions, RegistryHelloSink, Tun},
    net::CidrList,
    protocol::{DnsInfo, ExtensionProducer, ExtensionSet, Hello},
    reconcile::{Reconciler, Responsible},
    store::{EventKind, LinkSpec, LinkStatus, LinkStore, StoreError, StoreEvent},
    transport::{listen_addr, TlsContext},
};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Meshbridge broker - multi-cluster service-network bridge
#[derive(Parser, Debug)]
#[command(name = "meshbridge-broker")]
#[command(about = "Meshbridge broker - multi-cluster service-network bridge")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

/// Tun stand-in until the router component attaches the real device
/// handle; inbound packets are counted and logged.
struct PendingTun;

impl Tun for PendingTun {
    fn write(&self, packet: &[u8]) -> std::io::Result<usize> {
        debug!(len = packet.len(), "tun write (no device attached)");
        Ok(packet.len())
    }
}

/// Store stand-in for file-driven deployments: registrations and status
/// updates are logged; the declarative source is the config file.
struct FileStore;

#[async_trait::async_trait]
impl LinkStore for FileStore {
    async fn register_link(&self, spec: LinkSpec) -> Result<(), StoreError> {
        info!(link = %spec.name, cluster = %spec.cluster_address, "registering auto-connected link");
        Ok(())
    }

    async fn update_status(&self, name: &str, status: LinkStatus) -> Result<(), StoreError> {
        if status.message.is_empty() {
            info!(link = name, state = %status.state, "link status");
        } else {
            warn!(link = name, state = %status.state, message = %status.message, "link status");
        }
        Ok(())
    }
}

/// Contributes the local DNS advertisement to outbound hellos.
struct DnsAdvertiser {
    info: DnsInfo,
}

impl ExtensionProducer for DnsAdvertiser {
    fn add(&self, hello: &mut Hello) {
        hello.set_dns_info(&self.info);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    let mut config = Config::load(&args.config).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    let settings = config.settings()?;

    let tls = match &config.tls {
        Some(tls) => {
            let ctx = TlsContext::from_files(&tls.cert_file, &tls.key_file, &tls.ca_cert_file)
                .context("Failed to build TLS context")?;
            info!(cert = %tls.cert_file.display(), "TLS enabled");
            Some(ctx)
        }
        None => {
            warn!("TLS disabled, tunnels are unauthenticated");
            None
        }
    };

    let mut local = CidrList::new();
    if let Some(service) = settings.service_cidr {
        local.add(service);
    }

    let mut extensions = ExtensionSet::new();
    if config.advertise.dns_advertisement {
        let dns_ip: IpAddr = settings
            .dns_service_ip
            .ok_or_else(|| anyhow!("dns advertisement requires a dns service ip"))?;
        extensions.register(Arc::new(DnsAdvertiser {
            info: DnsInfo {
                dns_ip,
                cluster_domain: config.advertise.cluster_domain.clone(),
            },
        }));
        info!(%dns_ip, domain = %config.advertise.cluster_domain, "DNS advertisement enabled");
    }

    let links = Arc::new(Links::new(settings.advertised_port, settings.service_cidr));
    let store: Arc<dyn LinkStore> = Arc::new(FileStore);

    let mux = Mux::new(MuxOptions {
        identity: MeshIdentity {
            cluster_address: settings.cluster_address,
            port: settings.advertised_port,
            local,
        },
        links: links.clone(),
        tun: Arc::new(PendingTun),
        extensions,
        tls,
        store: Some(store.clone()),
        sink: Some(RegistryHelloSink::new(links.clone())),
        auto_connect: config.broker.auto_connect,
        allow_anonymous: config.broker.allow_anonymous,
        dial_budget: settings.dial_budget,
    });

    let responsible = Responsible::parse(&config.broker.served_links);
    let reconciler = Reconciler::new(mux.clone(), Some(store), responsible, 8);

    // Seed the reconciler with the declared links
    let (events_tx, events_rx) = mpsc::channel::<StoreEvent>(64);
    let reconciler_task = tokio::spawn(reconciler.clone().run(events_rx));
    for spec in &config.links {
        events_tx
            .send(StoreEvent {
                kind: EventKind::Added,
                spec: spec.clone(),
            })
            .await
            .context("event channel closed")?;
    }

    info!("meshbridge broker v{}", meshbridge::VERSION);
    info!(
        cluster = %settings.cluster_address,
        port = settings.port,
        links = config.links.len(),
        "starting"
    );

    let listener = TcpListener::bind(listen_addr(settings.port))
        .await
        .context("Failed to bind broker port")?;
    let listen_task = tokio::spawn(mux.clone().listen(listener));

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");

    reconciler.close();
    mux.close();
    drop(events_tx);
    reconciler_task.await.ok();
    let _ = listen_task.await;

    Ok(())
}
