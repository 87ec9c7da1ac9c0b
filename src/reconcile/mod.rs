//! Connect reconciler
//!
//! Consumes reconciliation events from the declarative store and keeps one
//! connect task alive per link this node is responsible for. A task
//! ensures a live outbound tunnel: success reschedules the keep-alive
//! probe, failure reschedules with rate-limited backoff. Cancellation is
//! cooperative and observed at wake boundaries.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::links::Links;
use crate::mux::{Mux, TunnelError};
use crate::store::{EventKind, LinkStatus, LinkStore, StoreEvent};

/// Keep-alive probe interval after a successful connect
pub const PROBE_INTERVAL: Duration = Duration::from_secs(600);

/// Initial retry delay
pub const RETRY_BASE: Duration = Duration::from_secs(10);

/// Retry delay ceiling
pub const RETRY_MAX: Duration = Duration::from_secs(600);

/// Exponential backoff with jitter, reset on success. State is per task.
#[derive(Debug)]
pub struct RateLimiter {
    base: Duration,
    max: Duration,
    next: Duration,
}

impl RateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, next: base }
    }

    pub fn succeeded(&mut self) {
        self.next = self.base;
    }

    /// The delay to wait after a failure; doubles up to the ceiling.
    pub fn failed(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);

        // Up to 10% jitter so a fleet of tasks does not retry in lockstep
        let jitter_range = delay.as_millis() as u64 / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };
        delay + Duration::from_millis(jitter)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RETRY_BASE, RETRY_MAX)
    }
}

/// The set of links this node actively dials.
#[derive(Debug, Clone)]
pub enum Responsible {
    All,
    Set(HashSet<String>),
}

impl Responsible {
    /// Parse a comma separated list; the value `all` wins over any names.
    pub fn parse(served: &str) -> Self {
        let names: HashSet<String> = served
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if names.contains("all") {
            Responsible::All
        } else {
            Responsible::Set(names)
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        match self {
            Responsible::All => true,
            Responsible::Set(names) => names.contains(name),
        }
    }
}

/// The control loop ensuring outbound tunnels for served links.
pub struct Reconciler {
    mux: Arc<Mux>,
    store: Option<Arc<dyn LinkStore>>,
    responsible: Responsible,
    workers: Arc<Semaphore>,
    tasks: Mutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(
        mux: Arc<Mux>,
        store: Option<Arc<dyn LinkStore>>,
        responsible: Responsible,
        max_workers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            mux,
            store,
            responsible,
            workers: Arc::new(Semaphore::new(max_workers)),
            tasks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    fn links(&self) -> &Arc<Links> {
        self.mux.links()
    }

    /// Consume store events until the channel closes or the reconciler
    /// shuts down.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<StoreEvent>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }
        self.close();
    }

    /// Apply one reconciliation event to the registry and the task set.
    pub async fn handle(self: &Arc<Self>, event: StoreEvent) {
        let name = event.spec.name.clone();
        match event.kind {
            EventKind::Added | EventKind::Updated => match self.links().put(&event.spec) {
                Ok(link) => {
                    debug!(link = %link, "link admitted");
                    if self.responsible.contains(&name) && !link.is_inbound_only() {
                        self.ensure_task(name);
                    } else {
                        self.cancel_task(&name);
                    }
                }
                Err(e) => {
                    warn!(link = %name, error = %e, "rejecting link");
                    self.cancel_task(&name);
                    self.report(&name, LinkStatus::error(e.to_string())).await;
                }
            },
            EventKind::Deleted => {
                self.cancel_task(&name);
                if let Some(link) = self.links().get(&name) {
                    self.mux.drop_tunnel(&link);
                }
                self.links().remove(&name);
                info!(link = %name, "link removed");
            }
        }
    }

    /// Spawn the connect task for a link unless one is already running.
    /// Running tasks pick up replaced snapshots from the registry.
    fn ensure_task(self: &Arc<Self>, name: String) {
        let cancel = {
            let mut tasks = self.tasks.lock().expect("task table lock poisoned");
            if tasks.contains_key(&name) {
                return;
            }
            let cancel = self.shutdown.child_token();
            tasks.insert(name.clone(), cancel.clone());
            cancel
        };
        let this = self.clone();
        tokio::spawn(async move { this.connect_task(name, cancel).await });
    }

    fn cancel_task(&self, name: &str) {
        let removed = self
            .tasks
            .lock()
            .expect("task table lock poisoned")
            .remove(name);
        if let Some(token) = removed {
            debug!(link = name, "cancelling connect task");
            token.cancel();
        }
    }

    async fn connect_task(self: Arc<Self>, name: String, cancel: CancellationToken) {
        debug!(link = %name, "connect task started");
        let mut limiter = RateLimiter::default();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let Some(link) = self.links().get(&name) else {
                info!(link = %name, "link not found");
                break;
            };
            let delay = {
                let Ok(_permit) = self.workers.acquire().await else {
                    break;
                };
                match self.mux.assure_tunnel(&link).await {
                    Ok(_) => {
                        limiter.succeeded();
                        self.report(&name, LinkStatus::up()).await;
                        PROBE_INTERVAL
                    }
                    Err(TunnelError::Closed) => break,
                    Err(e) => {
                        warn!(link = %name, error = %e, "connect attempt failed");
                        self.report(&name, LinkStatus::error(e.to_string())).await;
                        limiter.failed()
                    }
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        // A cancelled task was already dropped from the table; removing
        // here as well could race a successor registered under the same
        // name.
        if !cancel.is_cancelled() {
            self.tasks
                .lock()
                .expect("task table lock poisoned")
                .remove(&name);
        }
        debug!(link = %name, "connect task stopped");
    }

    async fn report(&self, name: &str, status: LinkStatus) {
        if let Some(store) = &self.store {
            if let Err(e) = store.update_status(name, status).await {
                warn!(link = name, error = %e, "cannot update link status");
            }
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().expect("task table lock poisoned").len()
    }

    /// Cancel every connect task. Safe to call repeatedly.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.tasks
            .lock()
            .expect("task table lock poisoned")
            .clear();
    }
}
