//! The service-discovery interface the daemon consumes.
//!
//! The registry depends on nothing beyond this contract: publish one service
//! descriptor and receive a stream of join/leave events for the `_ers._tcp`
//! service type. The [`ManualDiscovery`] implementation is channel-backed
//! and lets tests (or an embedding application) inject events directly.

use std::{net::Ipv4Addr, sync::RwLock};

use async_trait::async_trait;

/// The advertised service type.
pub const SERVICE_TYPE: &str = "_ers._tcp";

/// A service registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAd {
    /// Service type, normally [`SERVICE_TYPE`].
    pub service_type: String,
    /// Instance name carrying the `prefix=`/`type=` parameters.
    pub instance_name: String,
    /// Advertised port.
    pub port: u16,
}

/// A peer as seen by the discovery backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Advertised instance name.
    pub name: String,
    /// Host name of the peer.
    pub host: String,
    /// Resolved IPv4 address, when available.
    pub ipv4: Option<Ipv4Addr>,
    /// Advertised port.
    pub port: u16,
}

/// A join or leave observed on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A service appeared.
    Join(ServiceInfo),
    /// A service disappeared.
    Leave(ServiceInfo),
}

/// Errors from a discovery backend.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The backend failed; the peer registry stays consistent.
    #[error("discovery backend failed")]
    Backend {
        /// Backend-level cause.
        #[source]
        error: anyhow::Error,
    },
}

/// A service-discovery provider.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Advertise this node's service.
    async fn publish(&self, ad: ServiceAd) -> Result<(), DiscoveryError>;

    /// Withdraw the advertisement.
    async fn unpublish(&self) -> Result<(), DiscoveryError>;

    /// The stream of join/leave events. Events are serialized in
    /// observation order.
    fn subscribe(&self) -> async_channel::Receiver<DiscoveryEvent>;

    /// Stop the backend and its subscriptions.
    async fn shutdown(&self) -> Result<(), DiscoveryError>;
}

/// A discovery backend driven by hand.
#[derive(Debug)]
pub struct ManualDiscovery {
    tx: async_channel::Sender<DiscoveryEvent>,
    rx: async_channel::Receiver<DiscoveryEvent>,
    published: RwLock<Option<ServiceAd>>,
}

impl ManualDiscovery {
    /// Create a backend with an unbounded event queue.
    pub fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self {
            tx,
            rx,
            published: RwLock::new(None),
        }
    }

    /// Inject a join event.
    pub fn announce_join(&self, info: ServiceInfo) {
        let _ = self.tx.try_send(DiscoveryEvent::Join(info));
    }

    /// Inject a leave event.
    pub fn announce_leave(&self, info: ServiceInfo) {
        let _ = self.tx.try_send(DiscoveryEvent::Leave(info));
    }

    /// The currently advertised service, if any.
    pub fn published(&self) -> Option<ServiceAd> {
        self.published.read().unwrap().clone()
    }
}

impl Default for ManualDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Discovery for ManualDiscovery {
    async fn publish(&self, ad: ServiceAd) -> Result<(), DiscoveryError> {
        *self.published.write().unwrap() = Some(ad);
        Ok(())
    }

    async fn unpublish(&self) -> Result<(), DiscoveryError> {
        *self.published.write().unwrap() = None;
        Ok(())
    }

    fn subscribe(&self) -> async_channel::Receiver<DiscoveryEvent> {
        self.rx.clone()
    }

    async fn shutdown(&self) -> Result<(), DiscoveryError> {
        self.tx.close();
        Ok(())
    }
}
