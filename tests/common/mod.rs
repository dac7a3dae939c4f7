use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use meshkad::{format_node_address, parse_node_address, Dht, Network, PeerKey, RoutingTable, PEER_KEY_LEN};

pub const TEST_PORT: u16 = 4000;
pub const TEST_LATENCY_PERIOD: u64 = 3600;

/// Shared lookup of in-memory nodes, addressed by peer key, with failure
/// injection.
#[derive(Default)]
pub struct NetworkRegistry {
    tables: RwLock<HashMap<PeerKey, Arc<Mutex<RoutingTable>>>>,
    failures: RwLock<HashSet<PeerKey>>,
}

impl NetworkRegistry {
    pub async fn register(&self, key: PeerKey, table: Arc<Mutex<RoutingTable>>) {
        let mut tables = self.tables.write().await;
        tables.insert(key, table);
    }

    pub async fn set_failure(&self, key: PeerKey, fail: bool) {
        let mut failures = self.failures.write().await;
        if fail {
            failures.insert(key);
        } else {
            failures.remove(&key);
        }
    }

    async fn table_of(&self, key: &PeerKey) -> Option<Arc<Mutex<RoutingTable>>> {
        let tables = self.tables.read().await;
        tables.get(key).cloned()
    }

    async fn should_fail(&self, key: &PeerKey) -> bool {
        let failures = self.failures.read().await;
        failures.contains(key)
    }
}

/// In-memory [`Network`] that resolves addresses through the registry
/// instead of opening sockets.
#[derive(Clone)]
pub struct MockNetwork {
    registry: Arc<NetworkRegistry>,
}

impl MockNetwork {
    pub fn new(registry: Arc<NetworkRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Network for MockNetwork {
    async fn ping(&self, address: &str) -> Result<()> {
        let (key, _, _) = parse_node_address(address)?;
        if self.registry.should_fail(&key).await {
            return Err(anyhow!("injected network failure"));
        }
        if self.registry.table_of(&key).await.is_some() {
            Ok(())
        } else {
            Err(anyhow!("peer not reachable"))
        }
    }

    async fn find_node(&self, address: &str, target: &PeerKey) -> Result<Vec<String>> {
        let (key, _, _) = parse_node_address(address)?;
        if self.registry.should_fail(&key).await {
            return Err(anyhow!("injected network failure"));
        }
        let table = self
            .registry
            .table_of(&key)
            .await
            .ok_or_else(|| anyhow!("peer not reachable"))?;
        let table = table.lock().await;
        Ok(table
            .sort_by_proximity(target)
            .iter()
            .map(|peer| peer.address())
            .collect())
    }
}

/// One in-memory node: a routing table plus a lookup engine wired to the
/// mock network.
pub struct TestNode {
    pub key: PeerKey,
    pub ip: Ipv4Addr,
    pub table: Arc<Mutex<RoutingTable>>,
    pub dht: Dht<MockNetwork>,
}

impl TestNode {
    pub async fn new(
        registry: Arc<NetworkRegistry>,
        key: PeerKey,
        max_peers: usize,
        alpha: usize,
    ) -> Self {
        let ip = ip_for(&key);
        let table = Arc::new(Mutex::new(
            RoutingTable::new(key, max_peers, TEST_LATENCY_PERIOD).expect("routing table"),
        ));
        let network = MockNetwork::new(registry.clone());
        let dht = Dht::new(key, max_peers, alpha, table.clone(), Arc::new(network));
        registry.register(key, table.clone()).await;
        Self {
            key,
            ip,
            table,
            dht,
        }
    }

    pub fn address(&self) -> String {
        format_node_address(&self.key, self.ip, TEST_PORT)
    }

    pub async fn add_peer(&self, other: &TestNode) {
        let mut table = self.table.lock().await;
        assert!(table.insert(other.key, other.ip, TEST_PORT));
    }
}

/// Peer key carrying `index` in its low four bytes, so XOR distances can be
/// reasoned about as integer XOR.
pub fn make_key(index: u32) -> PeerKey {
    let mut key = [0u8; PEER_KEY_LEN];
    key[PEER_KEY_LEN - 4..].copy_from_slice(&index.to_be_bytes());
    key
}

fn ip_for(key: &PeerKey) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, key[PEER_KEY_LEN - 2], key[PEER_KEY_LEN - 1])
}
