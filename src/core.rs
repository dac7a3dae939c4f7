//! Transport-agnostic overlay logic.
//!
//! This module contains the building blocks the rest of the crate composes:
//!
//! - **Peer records**: [`Peer`] couples a peer key with its IPv4 endpoint and
//!   the time of the last authenticated interaction.
//! - **Routing**: [`RoutingTable`], a bounded peer store partitioned into
//!   distance buckets with a liveness-driven replacement policy.
//! - **Network seam**: the [`Network`] trait abstracts the RPC transport so
//!   the lookup engine can run against the TCP client or an in-memory mock.
//! - **Lookup**: [`Dht`] performs the iterative α-parallel closest-node
//!   search.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::identity::{bucket_index, format_node_address, parse_node_address, xor_distance, PeerKey, PEER_KEY_LEN};

/// Current wall clock as unix seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

// ============================================================================
// Peer Records
// ============================================================================

/// A known overlay peer: key, IPv4 endpoint, and last-seen timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    key: PeerKey,
    ip: Ipv4Addr,
    port: u16,
    last_seen: u64,
}

impl Peer {
    /// Create a peer record stamped with the current time.
    pub fn new(key: PeerKey, ip: Ipv4Addr, port: u16) -> Self {
        Self {
            key,
            ip,
            port,
            last_seen: unix_now(),
        }
    }

    /// Create a peer record from a `node://` address.
    pub fn from_address(address: &str) -> Result<Self> {
        let (key, ip, port) = parse_node_address(address)?;
        Ok(Self::new(key, ip, port))
    }

    /// The peer's 160-bit key.
    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    /// The peer's IPv4 address.
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// The peer's TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Unix timestamp of the most recent authenticated interaction.
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// The peer's full `node://` address.
    pub fn address(&self) -> String {
        format_node_address(&self.key, self.ip, self.port)
    }
}

// ============================================================================
// Routing Table
// ============================================================================

/// Bounded peer store partitioned by XOR distance from the locus key.
///
/// Peers live in a flat list (insertion/refresh order) with a side index
/// mapping bucket index to the keys it holds. When the table is full, a new
/// peer can still enter by pruning a *bloated* bucket (one holding more than
/// a single peer) if the newcomer's own bucket is empty, or by replacing the
/// least recently seen peer once it has been silent past the latency period.
#[derive(Debug)]
pub struct RoutingTable {
    locus: PeerKey,
    max_peers: usize,
    latency_period: u64,
    peers: Vec<Peer>,
    buckets: HashMap<usize, Vec<PeerKey>>,
}

impl RoutingTable {
    /// Create an empty routing table anchored at `locus`.
    ///
    /// `max_peers` bounds the stored peer count and must be at least one.
    /// `latency_period` is the grace period in seconds before a silent peer
    /// may be replaced.
    pub fn new(locus: PeerKey, max_peers: usize, latency_period: u64) -> Result<Self> {
        if max_peers < 1 {
            bail!("max peers must be >= 1");
        }
        Ok(Self {
            locus,
            max_peers,
            latency_period,
            peers: Vec::new(),
            buckets: HashMap::new(),
        })
    }

    /// The host's own peer key anchoring the distance buckets.
    pub fn locus(&self) -> &PeerKey {
        &self.locus
    }

    /// Number of stored peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the table holds no peers.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Insert or refresh a peer.
    ///
    /// An existing record has its endpoint updated and its last-seen stamp
    /// refreshed. The locus key is never stored. Returns whether the peer is
    /// present in the table afterwards.
    pub fn insert(&mut self, key: PeerKey, ip: Ipv4Addr, port: u16) -> bool {
        if key == self.locus {
            return false;
        }

        if let Some(peer) = self.peers.iter_mut().find(|peer| peer.key == key) {
            peer.ip = ip;
            peer.port = port;
            peer.last_seen = unix_now();
            return true;
        }

        let bucket = bucket_index(&self.locus, &key);
        if self.peers.len() < self.max_peers {
            self.append(Peer::new(key, ip, port), bucket);
            return true;
        }

        // Table full. If the newcomer's bucket is empty, make room by pruning
        // the tail of any bloated bucket.
        if self.buckets.get(&bucket).map_or(true, |keys| keys.is_empty()) {
            let victim = self
                .buckets
                .values()
                .find(|keys| keys.len() > 1)
                .and_then(|keys| keys.last().copied());
            if let Some(victim) = victim {
                let removed = self.remove(&victim);
                debug_assert!(removed.is_ok(), "bucket index out of sync with peer list");
                self.append(Peer::new(key, ip, port), bucket);
                return true;
            }
        }

        // Replace the least recently seen peer if it has been silent past the
        // latency period.
        let ordered = self.sort_by_last_seen();
        if let Some(oldest) = ordered.last() {
            if unix_now().saturating_sub(oldest.last_seen) > self.latency_period {
                let victim = oldest.key;
                let removed = self.remove(&victim);
                debug_assert!(removed.is_ok(), "bucket index out of sync with peer list");
                self.append(Peer::new(key, ip, port), bucket);
                return true;
            }
        }

        false
    }

    fn append(&mut self, peer: Peer, bucket: usize) {
        self.buckets.entry(bucket).or_default().push(peer.key);
        self.peers.push(peer);
    }

    /// Remove a peer from the list and the bucket index.
    ///
    /// Removing a key that is not present is a programmer error and fails,
    /// as does an inconsistent bucket index.
    pub fn remove(&mut self, key: &PeerKey) -> Result<()> {
        let peer_index = self
            .peers
            .iter()
            .position(|peer| &peer.key == key)
            .context("peer not found in peers list")?;

        let bucket = bucket_index(&self.locus, key);
        let keys = self
            .buckets
            .get_mut(&bucket)
            .context("bucket entry does not exist for peer")?;
        let key_index = keys
            .iter()
            .position(|stored| stored == key)
            .context("peer key not found in bucket")?;

        keys.remove(key_index);
        self.peers.remove(peer_index);
        Ok(())
    }

    /// Look up a stored peer by key.
    pub fn get(&self, key: &PeerKey) -> Option<&Peer> {
        self.peers.iter().find(|peer| &peer.key == key)
    }

    /// Snapshot of the stored peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.clone()
    }

    /// Stored peers ordered most recently seen first.
    ///
    /// The sort is stable, so peers sharing a last-seen second keep their
    /// insertion order.
    pub fn sort_by_last_seen(&self) -> Vec<Peer> {
        let mut peers = self.peers.clone();
        peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        peers
    }

    /// Stored peers ordered closest first by XOR distance to `key`.
    pub fn sort_by_proximity(&self, key: &PeerKey) -> Vec<Peer> {
        let mut peers = self.peers.clone();
        peers.sort_by(|a, b| xor_distance(&a.key, key).cmp(&xor_distance(&b.key, key)));
        peers
    }
}

// ============================================================================
// Network Seam
// ============================================================================

/// RPC transport abstraction used by the lookup engine.
///
/// Production uses the TCP client; tests substitute an in-memory mock.
#[async_trait]
pub trait Network: Send + Sync + 'static {
    /// Probe the node at `address` for liveness.
    async fn ping(&self, address: &str) -> Result<()>;

    /// Ask the node at `address` for the peers it knows closest to `target`.
    ///
    /// Returns `node://` addresses ordered closest first.
    async fn find_node(&self, address: &str, target: &PeerKey) -> Result<Vec<String>>;
}

// ============================================================================
// Iterative Lookup
// ============================================================================

/// Shared bookkeeping of one lookup, guarded by a single mutex.
#[derive(Default)]
struct LookupState {
    /// Liveness-checked peers accumulated across rounds, the result set.
    results: Vec<Peer>,
    /// Every key already considered: results, dead peers, rejected
    /// candidates, and the batch currently in flight. Nothing in this set is
    /// ever reconsidered.
    known: HashSet<PeerKey>,
    /// Candidates accepted in the current round, awaiting a liveness probe.
    pending: Vec<Peer>,
}

/// Iterative closest-node lookup engine over a [`Network`] transport.
pub struct Dht<N: Network> {
    locus: PeerKey,
    max_peers: usize,
    alpha: usize,
    table: Arc<Mutex<RoutingTable>>,
    network: Arc<N>,
}

impl<N: Network> Clone for Dht<N> {
    fn clone(&self) -> Self {
        Self {
            locus: self.locus,
            max_peers: self.max_peers,
            alpha: self.alpha,
            table: self.table.clone(),
            network: self.network.clone(),
        }
    }
}

impl<N: Network> Dht<N> {
    /// Create a lookup engine sharing the host's routing table and transport.
    pub fn new(
        locus: PeerKey,
        max_peers: usize,
        alpha: usize,
        table: Arc<Mutex<RoutingTable>>,
        network: Arc<N>,
    ) -> Self {
        Self {
            locus,
            max_peers,
            alpha: alpha.max(1),
            table,
            network,
        }
    }

    /// Find the live peers closest to `target`.
    ///
    /// Seeds from the current routing table, then repeatedly queries the α
    /// closest unvisited live peers with FIND_NODE, admitting only candidates
    /// at or inside the current frontier distance. Every admitted candidate
    /// is liveness-checked before it can appear in the result, so the
    /// returned list holds at most `max_peers` live peers, closest first.
    pub async fn find_closest_nodes(&self, target: &PeerKey) -> Vec<Peer> {
        let snapshot = {
            let table = self.table.lock().await;
            table.peers()
        };

        let state = Arc::new(Mutex::new(LookupState::default()));
        let mut current = self.probe_alive(snapshot, target, &state).await;
        if current.is_empty() {
            return Vec::new();
        }

        loop {
            // Fold the live batch into the result set and fix this round's
            // frontier: the farthest distance accumulated so far.
            let frontier = {
                let mut state = state.lock().await;
                for peer in &current {
                    state.results.push(peer.clone());
                }
                state
                    .results
                    .sort_by(|a, b| xor_distance(&a.key, target).cmp(&xor_distance(&b.key, target)));
                match state.results.last() {
                    Some(farthest) => xor_distance(&farthest.key, target),
                    None => [0xFF; PEER_KEY_LEN],
                }
            };

            let batch: Vec<Peer> = current.iter().take(self.alpha).cloned().collect();
            let probes = batch.into_iter().map(|peer| {
                let state = state.clone();
                let network = self.network.clone();
                let locus = self.locus;
                let target = *target;
                async move {
                    let addresses = match network.find_node(&peer.address(), &target).await {
                        Ok(addresses) => addresses,
                        Err(err) => {
                            debug!(
                                peer = %hex::encode(&peer.key()[..8]),
                                "find_node probe failed: {err:#}"
                            );
                            return;
                        }
                    };

                    let mut state = state.lock().await;
                    for address in addresses {
                        let Ok(candidate) = Peer::from_address(&address) else {
                            continue;
                        };
                        if state.known.contains(candidate.key()) {
                            continue;
                        }
                        let outside_frontier =
                            xor_distance(candidate.key(), &target) > frontier;
                        if outside_frontier || *candidate.key() == locus {
                            // Block reconsideration without admitting it.
                            state.known.insert(*candidate.key());
                            continue;
                        }
                        state.known.insert(*candidate.key());
                        state.pending.push(candidate);
                    }
                }
            });
            futures::future::join_all(probes).await;

            let pending = {
                let mut state = state.lock().await;
                std::mem::take(&mut state.pending)
            };
            if pending.is_empty() {
                break;
            }

            current = self.probe_alive(pending, target, &state).await;
            if current.is_empty() {
                break;
            }
        }

        let mut results = {
            let mut state = state.lock().await;
            std::mem::take(&mut state.results)
        };
        results.sort_by(|a, b| xor_distance(&a.key, target).cmp(&xor_distance(&b.key, target)));
        results.truncate(self.max_peers);
        results
    }

    /// Ping candidates with α-bounded concurrency and keep the ones that
    /// answer, ordered closest first to `target`. All candidates are marked
    /// as considered, dead or alive.
    async fn probe_alive(
        &self,
        candidates: Vec<Peer>,
        target: &PeerKey,
        state: &Arc<Mutex<LookupState>>,
    ) -> Vec<Peer> {
        {
            let mut state = state.lock().await;
            for peer in &candidates {
                state.known.insert(*peer.key());
            }
        }

        let network = self.network.clone();
        let mut alive: Vec<Peer> = stream::iter(candidates.into_iter().map(|peer| {
            let network = network.clone();
            async move {
                match network.ping(&peer.address()).await {
                    Ok(()) => Some(peer),
                    Err(err) => {
                        debug!(
                            peer = %hex::encode(&peer.key()[..8]),
                            "liveness probe failed: {err:#}"
                        );
                        None
                    }
                }
            }
        }))
        .buffer_unordered(self.alpha)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .flatten()
        .collect();

        alive.sort_by(|a, b| xor_distance(&a.key, target).cmp(&xor_distance(&b.key, target)));
        alive
    }
}
