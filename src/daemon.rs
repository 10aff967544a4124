//! Daemon lifecycle and event loop.
//!
//! The daemon owns a single actor task that serializes everything touching
//! the peer registry and the replication controller: discovery events,
//! refresh nudges from the registry API, and control-surface requests. A
//! join for X followed by a leave for X therefore produces exactly one
//! reconciliation after each, in order, and at most one reconciliation runs
//! at any time.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error_span, info, warn, Instrument};

use crate::{
    config::Config,
    discovery::{Discovery, DiscoveryError, DiscoveryEvent, ServiceAd, SERVICE_TYPE},
    docdb::{Connector, DbError, DocDb},
    http,
    peers::{self, PeerInfo, PeerRegistry},
    registry::{Registry, RegistryOptions},
    replication::{RefreshHandle, ReplicationController},
    store::{Store, StoreError},
};

/// Capacity of the control channel into the daemon actor.
const CONTROL_CAP: usize = 16;
/// Delay between DocDB connection attempts at startup.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// How long a shutdown waits for an in-flight reconciliation.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Errors fatal to the daemon.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// A pid file exists; another daemon seems to be running.
    #[error("daemon already running; delete `{pid_file}` if it is stale")]
    AlreadyRunning {
        /// The offending pid file.
        pid_file: PathBuf,
    },
    /// The DocDB stayed unreachable through the whole retry budget.
    #[error("could not reach the document database after {tries} attempts")]
    DbUnreachable {
        /// Attempts made.
        tries: u32,
        /// Last transport error.
        #[source]
        error: DbError,
    },
    /// The store failed while preparing the node.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The discovery backend failed.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    /// The pid file could not be written.
    #[error("pid file `{pid_file}` could not be written")]
    PidFile {
        /// The pid file path.
        pid_file: PathBuf,
        /// Filesystem cause.
        #[source]
        error: std::io::Error,
    },
}

#[derive(derive_more::Debug)]
enum ToDaemon {
    Refresh {
        #[debug("reply")]
        reply: Option<oneshot::Sender<()>>,
    },
    Shutdown {
        #[debug("reply")]
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Cloneable handle into the daemon actor.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    tx: mpsc::Sender<ToDaemon>,
}

impl DaemonHandle {
    /// Run a reconciliation now. Returns false when the daemon is gone.
    pub async fn refresh_replication(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(ToDaemon::Refresh { reply: Some(reply) })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.is_ok()
    }

    /// Ask the daemon to stop, without waiting for it.
    pub fn request_shutdown(&self) {
        let _ = self.tx.try_send(ToDaemon::Shutdown { reply: None });
    }

    /// Stop the actor and wait until it wound down its replication state.
    pub async fn shutdown(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(ToDaemon::Shutdown { reply: Some(reply) })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.is_ok()
    }
}

/// A running registry daemon.
#[derive(derive_more::Debug)]
pub struct Daemon {
    registry: Arc<Registry>,
    handle: DaemonHandle,
    #[debug("Discovery")]
    discovery: Arc<dyn Discovery>,
    actor: AbortOnDropHandle<()>,
    _http: Option<AbortOnDropHandle<()>>,
    pid_file: Option<PathBuf>,
    service_name: String,
}

impl Daemon {
    /// Start a daemon: guard the pid file, connect to the DocDB with the
    /// configured retry budget, sweep stale replication tasks, advertise the
    /// service and begin consuming discovery events.
    pub async fn start(
        config: Config,
        connector: Arc<dyn Connector>,
        discovery: Arc<dyn Discovery>,
    ) -> Result<Daemon, DaemonError> {
        let pid_file = config.pid_path();
        if let Some(path) = &pid_file {
            if path.exists() {
                return Err(DaemonError::AlreadyRunning {
                    pid_file: path.clone(),
                });
            }
        }

        let docdb = connect_with_retries(
            connector.as_ref(),
            &config.local_docdb_url(),
            config.couchdb.tries,
        )
        .await?;
        let store = Store::open(docdb).await?;

        let host = short_hostname();
        let peer_type = config.node.peer_type;
        let mut controller = ReplicationController::new(store.clone(), host.as_str(), peer_type);
        let stale = controller.clear().await?;
        if stale > 0 {
            info!(stale, "cleared replication tasks from a previous run");
        }
        store.set_state_peers(&[]).await?;

        let service_name = peers::format_service_name(
            &host,
            &config.couchdb.prefix,
            peer_type,
            &peers::random_suffix(),
        );
        discovery
            .publish(ServiceAd {
                service_type: SERVICE_TYPE.to_string(),
                instance_name: service_name.clone(),
                port: config.couchdb.port,
            })
            .await?;
        let events = discovery.subscribe();

        if let Some(path) = &pid_file {
            std::fs::write(path, format!("{}\n", std::process::id())).map_err(|error| {
                DaemonError::PidFile {
                    pid_file: path.clone(),
                    error,
                }
            })?;
        }

        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAP);
        // capacity one: refresh nudges coalesce while a run is pending
        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        let handle = DaemonHandle { tx: control_tx };

        let registry = Registry::open(
            store.clone(),
            connector,
            RegistryOptions {
                fixed_peers: config.fixed_peers(),
                local_only: false,
            },
        )
        .await?
        .with_refresh_handle(RefreshHandle::new(refresh_tx));

        let actor = DaemonActor {
            store,
            controller,
            peer_registry: PeerRegistry::new(),
            events,
            events_closed: false,
            control_rx,
            refresh_rx,
            refresh_closed: false,
            prefix: config.couchdb.prefix.clone(),
            own_service_name: service_name.clone(),
        };
        let actor = AbortOnDropHandle::new(tokio::spawn(
            actor.run().instrument(error_span!("daemon", %host)),
        ));

        let http = config.node.control_port.map(|port| {
            let handle = handle.clone();
            AbortOnDropHandle::new(tokio::spawn(async move {
                if let Err(err) = http::serve(port, handle).await {
                    warn!(%port, %err, "control surface failed");
                }
            }))
        });

        info!(service = %service_name, %peer_type, "daemon started");
        Ok(Daemon {
            registry: Arc::new(registry),
            handle,
            discovery,
            actor,
            _http: http,
            pid_file,
            service_name,
        })
    }

    /// The registry API of this node.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// A handle for control-surface style requests.
    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    /// The advertised service instance name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Block until a stop signal arrives or a shutdown is requested through
    /// the control surface, then wind the daemon down.
    pub async fn run(mut self) -> Result<(), DaemonError> {
        tokio::select! {
            _ = wait_for_stop_signal() => info!("stop signal received"),
            _ = &mut self.actor => info!("shutdown requested"),
        }
        self.stop().await
    }

    /// Stop in order: discovery down, advertisement withdrawn, replication
    /// tasks cleared, peer state emptied, pid file removed.
    pub async fn stop(self) -> Result<(), DaemonError> {
        self.discovery.shutdown().await?;
        self.discovery.unpublish().await?;
        if tokio::time::timeout(SHUTDOWN_DEADLINE, self.handle.shutdown())
            .await
            .is_err()
        {
            warn!("shutdown deadline hit, aborting the daemon actor");
        }
        drop(self.actor);
        if let Some(path) = &self.pid_file {
            if let Err(err) = std::fs::remove_file(path) {
                warn!(pid_file = %path.display(), %err, "could not remove pid file");
            }
        }
        info!("daemon stopped");
        Ok(())
    }
}

struct DaemonActor {
    store: Store,
    controller: ReplicationController,
    peer_registry: PeerRegistry,
    events: async_channel::Receiver<DiscoveryEvent>,
    events_closed: bool,
    control_rx: mpsc::Receiver<ToDaemon>,
    refresh_rx: mpsc::Receiver<()>,
    refresh_closed: bool,
    prefix: String,
    own_service_name: String,
}

impl DaemonActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.control_rx.recv() => match msg {
                    Some(ToDaemon::Refresh { reply }) => {
                        self.reconcile().await;
                        if let Some(reply) = reply {
                            let _ = reply.send(());
                        }
                    }
                    Some(ToDaemon::Shutdown { reply }) => {
                        self.wind_down().await;
                        if let Some(reply) = reply {
                            let _ = reply.send(());
                        }
                        break;
                    }
                    None => break,
                },
                nudge = self.refresh_rx.recv(), if !self.refresh_closed => match nudge {
                    Some(()) => self.reconcile().await,
                    None => self.refresh_closed = true,
                },
                event = self.events.recv(), if !self.events_closed => match event {
                    Ok(event) => self.on_event(event).await,
                    Err(_) => self.events_closed = true,
                },
            }
        }
    }

    async fn on_event(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Join(info) => {
                if info.name == self.own_service_name {
                    return;
                }
                let (prefix, peer_type) = peers::parse_service_name(&info.name);
                if prefix != self.prefix {
                    debug!(peer = %info.name, %prefix, "ignoring peer of another tenant");
                    return;
                }
                info!(peer = %info.name, %peer_type, "peer joined");
                if self.peer_registry.on_join(PeerInfo {
                    service_name: info.name,
                    host: info.host,
                    ipv4: info.ipv4,
                    port: info.port,
                    prefix,
                    peer_type,
                }) {
                    self.publish_peers().await;
                }
            }
            DiscoveryEvent::Leave(info) => {
                info!(peer = %info.name, "peer left");
                if self.peer_registry.on_leave(&info.name) {
                    self.publish_peers().await;
                }
            }
        }
        self.reconcile().await;
    }

    /// Expose the known peers to the registry API via the state document.
    async fn publish_peers(&self) {
        let snapshot = self.peer_registry.snapshot();
        let peers: Vec<PeerInfo> = snapshot.all().cloned().collect();
        if let Err(err) = self.store.set_state_peers(&peers).await {
            warn!(%err, "could not publish peer state");
        }
    }

    async fn reconcile(&mut self) {
        // drain pending nudges; this run covers them all
        while self.refresh_rx.try_recv().is_ok() {}
        let snapshot = self.peer_registry.snapshot();
        if let Err(err) = self.controller.reconcile(&snapshot).await {
            warn!(%err, "reconciliation failed");
        }
    }

    async fn wind_down(&mut self) {
        if let Err(err) = self.controller.clear().await {
            warn!(%err, "could not clear replication tasks");
        }
        if let Err(err) = self.store.set_state_peers(&[]).await {
            warn!(%err, "could not clear peer state");
        }
    }
}

async fn connect_with_retries(
    connector: &dyn Connector,
    url: &str,
    tries: u32,
) -> Result<Arc<dyn DocDb>, DaemonError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match connector.connect(url).await {
            Ok(docdb) => return Ok(docdb),
            Err(error) if attempt >= tries => {
                return Err(DaemonError::DbUnreachable { tries, error });
            }
            Err(error) => {
                warn!(%url, attempt, %error, "document database not reachable yet");
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }
}

fn short_hostname() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    host.split('.').next().unwrap_or("localhost").to_string()
}

async fn wait_for_stop_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let term = signal(SignalKind::terminate()).ok();
        let quit = signal(SignalKind::quit()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = recv_or_pending(term) => {}
            _ = recv_or_pending(quit) => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(unix)]
async fn recv_or_pending(sig: Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(mut sig) => {
            sig.recv().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, discovery::ManualDiscovery, docdb::memory::MemoryHub};

    fn test_config(pid_file: &str) -> Config {
        format!("[node]\npid_file = {pid_file}\n[couchdb]\ntries = 1\n")
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn refuses_to_start_on_existing_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid = dir.path().join("ers.pid");
        std::fs::write(&pid, "12345\n").unwrap();

        let hub = MemoryHub::new();
        hub.add_node("http://127.0.0.1:5984/");
        let err = Daemon::start(
            test_config(&pid.display().to_string()),
            hub.connector(),
            Arc::new(ManualDiscovery::new()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn start_publishes_and_stop_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let pid = dir.path().join("ers.pid");

        let hub = MemoryHub::new();
        hub.add_node("http://127.0.0.1:5984/");
        let discovery = Arc::new(ManualDiscovery::new());
        let daemon = Daemon::start(
            test_config(&pid.display().to_string()),
            hub.connector(),
            discovery.clone(),
        )
        .await
        .unwrap();

        assert!(pid.exists());
        let ad = discovery.published().unwrap();
        assert_eq!(ad.service_type, SERVICE_TYPE);
        assert!(ad.instance_name.contains("prefix=ers"));
        assert!(ad.instance_name.contains("type=contributor"));

        daemon.stop().await.unwrap();
        assert!(!pid.exists());
        assert!(discovery.published().is_none());
    }

    #[tokio::test]
    async fn startup_fails_after_retry_budget() {
        let hub = MemoryHub::new(); // no node registered, connect always fails
        let err = Daemon::start(
            test_config("none"),
            hub.connector(),
            Arc::new(ManualDiscovery::new()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DaemonError::DbUnreachable { tries: 1, .. }));
    }
}
