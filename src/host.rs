//! The overlay host: listener, identity, handler registry, and maintenance.
//!
//! A [`Host`] couples an Ed25519 identity with a TCP listener, the routing
//! table, the RPC client, and the lookup engine. It is a cheap-clone handle
//! (`Arc` inner) so connection tasks and background services can share it
//! freely.
//!
//! Two background services run from construction until [`Host::close`]:
//!
//! - the **ping service** re-probes peers that have been quiet for a ping
//!   period, refreshing the ones that still answer;
//! - the **latency prune** removes peers that stayed silent past the latency
//!   period.
//!
//! # Example
//!
//! ```no_run
//! use meshkad::Host;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let host = Host::builder().port(0).build().await?;
//! println!("listening as {}", host.address());
//!
//! let accept = host.clone();
//! tokio::spawn(async move { accept.listen().await });
//!
//! host.bootstrap("node://aabbccddeeff00112233445566778899aabbccdd@203.0.113.9:4000").await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{bail, Context, Result};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, trace};

use crate::core::{unix_now, Dht, Peer, RoutingTable};
use crate::identity::{self, format_node_address, PeerKey, SIGNATURE_LEN};
use crate::net::TcpClient;
use crate::protocol::{RpcRequest, FIND_NODE_METHOD, PING_METHOD, PONG_RESPONSE};
use crate::server;

/// Default bound on stored peers (the replication parameter).
pub const DEFAULT_MAX_PEERS: usize = 160;

/// Default interval between ping service passes, in seconds.
pub const DEFAULT_PING_PERIOD: u64 = 1200;

/// Default silence threshold before a peer is considered offline, in seconds.
pub const DEFAULT_LATENCY_PERIOD: u64 = 3600;

/// Boxed future returned by RPC handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// An RPC handler: invoked with the host, the authenticated sender, and the
/// decoded request. The returned value becomes the response `data`; an error
/// becomes a `success=false` response carrying the error text.
pub type RpcHandler = Arc<dyn Fn(Host, Peer, RpcRequest) -> HandlerFuture + Send + Sync>;

/// Configuration for a [`Host`], with the defaults applied by
/// [`Host::builder`].
pub struct HostBuilder {
    port: u16,
    identity: Option<SigningKey>,
    max_peers: usize,
    concurrent_requests: Option<usize>,
    ping_period: u64,
    latency_period: u64,
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self {
            port: 0,
            identity: None,
            max_peers: DEFAULT_MAX_PEERS,
            concurrent_requests: None,
            ping_period: DEFAULT_PING_PERIOD,
            latency_period: DEFAULT_LATENCY_PERIOD,
        }
    }
}

impl HostBuilder {
    /// Listening TCP port. Zero lets the OS pick one.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Ed25519 identity to use instead of a freshly generated one.
    pub fn identity(mut self, key: SigningKey) -> Self {
        self.identity = Some(key);
        self
    }

    /// Bound on stored peers (the replication parameter). Must be >= 1.
    pub fn max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    /// Lookup concurrency α. Defaults to 5% of `max_peers`, at least one.
    pub fn concurrent_requests(mut self, concurrent_requests: usize) -> Self {
        self.concurrent_requests = Some(concurrent_requests);
        self
    }

    /// Interval between ping service passes, in seconds.
    pub fn ping_period(mut self, seconds: u64) -> Self {
        self.ping_period = seconds;
        self
    }

    /// Silence threshold before a peer is pruned, in seconds. Must exceed the
    /// ping period.
    pub fn latency_period(mut self, seconds: u64) -> Self {
        self.latency_period = seconds;
        self
    }

    /// Validate the configuration, bind the listener, and start the host.
    pub async fn build(self) -> Result<Host> {
        if self.max_peers < 1 {
            bail!("max peers must be >= 1");
        }
        let alpha = self
            .concurrent_requests
            .unwrap_or_else(|| (self.max_peers / 20).max(1));
        if alpha < 1 {
            bail!("concurrent requests must be >= 1");
        }
        if alpha > self.max_peers {
            bail!("concurrent requests must not exceed max peers");
        }
        if self.ping_period >= self.latency_period {
            bail!("ping period should be less than latency period");
        }

        let signing_key = Arc::new(
            self.identity
                .unwrap_or_else(|| SigningKey::generate(&mut OsRng)),
        );
        let peer_key = identity::peer_key(&signing_key.verifying_key());

        let table = Arc::new(Mutex::new(RoutingTable::new(
            peer_key,
            self.max_peers,
            self.latency_period,
        )?));

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port))
            .await
            .context("failed to bind listener")?;
        let local = listener.local_addr().context("failed to read bound address")?;
        let bound_ip = match local.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };

        let client = Arc::new(TcpClient::new(signing_key.clone(), table.clone()));
        let dht = Dht::new(peer_key, self.max_peers, alpha, table.clone(), client.clone());

        let host = Host {
            inner: Arc::new(HostInner {
                signing_key,
                peer_key,
                bound_ip,
                port: local.port(),
                listener: Mutex::new(Some(listener)),
                table,
                client,
                dht,
                handlers: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
                shutdown: watch::channel(false).0,
                services: StdMutex::new(Vec::new()),
                ping_period: self.ping_period,
                latency_period: self.latency_period,
            }),
        };

        host.register_builtin_handlers().await;
        host.spawn_services();
        Ok(host)
    }
}

struct HostInner {
    signing_key: Arc<SigningKey>,
    peer_key: PeerKey,
    bound_ip: Ipv4Addr,
    port: u16,
    listener: Mutex<Option<TcpListener>>,
    table: Arc<Mutex<RoutingTable>>,
    client: Arc<TcpClient>,
    dht: Dht<TcpClient>,
    handlers: RwLock<HashMap<String, RpcHandler>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    services: StdMutex<Vec<JoinHandle<()>>>,
    ping_period: u64,
    latency_period: u64,
}

/// A running overlay node. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Start configuring a host.
    pub fn builder() -> HostBuilder {
        HostBuilder::default()
    }

    /// The host's 160-bit peer key.
    pub fn peer_key(&self) -> PeerKey {
        self.inner.peer_key
    }

    /// The host's Ed25519 public key.
    pub fn public_key(&self) -> VerifyingKey {
        self.inner.signing_key.verifying_key()
    }

    /// The bound TCP port.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// The host's own `node://` address.
    ///
    /// A wildcard bind is reported as the loopback address; deployments with
    /// a routable interface should bind it explicitly or advertise their
    /// public address out of band.
    pub fn address(&self) -> String {
        let ip = if self.inner.bound_ip.is_unspecified() {
            Ipv4Addr::LOCALHOST
        } else {
            self.inner.bound_ip
        };
        format_node_address(&self.inner.peer_key, ip, self.inner.port)
    }

    /// All advertisable `node://` addresses of this host.
    pub fn addresses(&self) -> Vec<String> {
        vec![self.address()]
    }

    /// Sign a digest with the host's private key.
    pub fn sign(&self, digest: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.inner.signing_key.sign(digest).to_bytes()
    }

    /// Assemble a signed payload for a message body.
    pub(crate) fn seal(&self, body: &[u8]) -> Vec<u8> {
        identity::seal_payload(&self.inner.signing_key, body)
    }

    /// Shared handle to the routing table.
    pub fn route_table(&self) -> Arc<Mutex<RoutingTable>> {
        self.inner.table.clone()
    }

    /// Snapshot of the currently known peers.
    pub async fn peers(&self) -> Vec<Peer> {
        let table = self.inner.table.lock().await;
        table.peers()
    }

    /// Register an RPC method, replacing any handler of the same name.
    pub async fn register_rpc_method(&self, name: &str, handler: RpcHandler) {
        let mut handlers = self.inner.handlers.write().await;
        handlers.insert(name.to_string(), handler);
    }

    pub(crate) async fn handler(&self, name: &str) -> Option<RpcHandler> {
        let handlers = self.inner.handlers.read().await;
        handlers.get(name).cloned()
    }

    /// Send one signed request to the node at `address`.
    pub async fn send_message(
        &self,
        address: &str,
        version: i64,
        method: &str,
        data: Value,
    ) -> Result<Value> {
        self.inner.client.send_message(address, version, method, data).await
    }

    /// Probe the node at `address` for liveness.
    pub async fn ping(&self, address: &str) -> Result<()> {
        self.inner.client.ping(address).await
    }

    /// Ask the node at `address` for the peers it knows closest to `target`.
    pub async fn find_node(&self, address: &str, target: &PeerKey) -> Result<Vec<String>> {
        self.inner.client.find_node(address, target).await
    }

    /// Find the live peers closest to `target` through an iterative lookup.
    pub async fn find_closest_nodes(&self, target: &PeerKey) -> Vec<Peer> {
        self.inner.dht.find_closest_nodes(target).await
    }

    /// Join the overlay through a known node: ping it, then walk the network
    /// towards our own key so nearby peers land in the routing table.
    pub async fn bootstrap(&self, address: &str) -> Result<()> {
        self.ping(address).await?;
        let neighbours = self.find_closest_nodes(&self.peer_key()).await;
        debug!(count = neighbours.len(), "bootstrap lookup finished");
        Ok(())
    }

    /// Accept and serve connections until the host is closed.
    ///
    /// Each accepted connection is served in its own task; accept errors are
    /// logged and do not stop the loop.
    pub async fn listen(&self) -> Result<()> {
        let listener = {
            let mut slot = self.inner.listener.lock().await;
            slot.take()
        }
        .context("host is already listening or closed")?;

        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        trace!(%remote, "accepted connection");
                        tokio::spawn(server::handle_connection(self.clone(), stream, remote));
                    }
                    Err(err) => {
                        debug!("accept failed: {err}");
                    }
                },
            }
        }
        Ok(())
    }

    /// Whether [`Host::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop the host: ends the accept loop and the background services.
    /// In-flight connection tasks run to completion under their deadlines.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown.send(true);

        let mut services = self
            .inner
            .services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for service in services.drain(..) {
            service.abort();
        }
    }

    async fn register_builtin_handlers(&self) {
        self.register_rpc_method(
            PING_METHOD,
            Arc::new(|_host, _peer, _request| {
                Box::pin(async { Ok(Value::String(PONG_RESPONSE.to_string())) })
            }),
        )
        .await;

        self.register_rpc_method(
            FIND_NODE_METHOD,
            Arc::new(|host, _peer, request| {
                Box::pin(async move {
                    let key_hex = request
                        .data
                        .as_str()
                        .context("node key not found in request body")?;
                    let bytes = hex::decode(key_hex).context("invalid node key encoding")?;
                    let target: PeerKey = bytes
                        .as_slice()
                        .try_into()
                        .ok()
                        .context("invalid node key length")?;

                    let table = host.route_table();
                    let peers = {
                        let table = table.lock().await;
                        table.sort_by_proximity(&target)
                    };
                    let addresses: Vec<Value> = peers
                        .iter()
                        .map(|peer| Value::String(peer.address()))
                        .collect();
                    Ok(Value::Array(addresses))
                })
            }),
        )
        .await;
    }

    fn spawn_services(&self) {
        let ping_host = self.clone();
        let ping_service = tokio::spawn(async move { ping_host.ping_service().await });

        let prune_host = self.clone();
        let prune_service = tokio::spawn(async move { prune_host.prune_service().await });

        let mut services = self
            .inner
            .services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        services.push(ping_service);
        services.push(prune_service);
    }

    /// Re-probe peers that have been quiet for a ping period. A peer that
    /// answers is refreshed through the client's table update; one that does
    /// not will eventually exceed the latency period and be pruned.
    async fn ping_service(self) {
        let period = self.inner.ping_period.max(1);
        let mut ticker = interval(Duration::from_secs(period));
        ticker.tick().await;

        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let now = unix_now();
            let quiet: Vec<Peer> = {
                let table = self.inner.table.lock().await;
                table
                    .peers()
                    .into_iter()
                    .filter(|peer| now.saturating_sub(peer.last_seen()) >= self.inner.ping_period)
                    .collect()
            };

            let probes = quiet.into_iter().map(|peer| {
                let client = self.inner.client.clone();
                async move {
                    if let Err(err) = client.ping(&peer.address()).await {
                        debug!(
                            peer = %hex::encode(&peer.key()[..8]),
                            "maintenance ping failed: {err:#}"
                        );
                    }
                }
            });
            futures::future::join_all(probes).await;
        }
    }

    /// Drop peers that stayed silent past the latency period.
    async fn prune_service(self) {
        let period = self.inner.latency_period.max(1);
        let mut ticker = interval(Duration::from_secs(period));
        ticker.tick().await;

        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let now = unix_now();
            let mut table = self.inner.table.lock().await;
            let silent: Vec<PeerKey> = table
                .peers()
                .into_iter()
                .filter(|peer| now.saturating_sub(peer.last_seen()) > self.inner.latency_period)
                .map(|peer| *peer.key())
                .collect();
            for key in silent {
                debug!(peer = %hex::encode(&key[..8]), "pruning silent peer");
                if let Err(err) = table.remove(&key) {
                    debug!("prune failed: {err:#}");
                }
            }
        }
    }
}
