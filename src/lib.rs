//! # meshkad
//!
//! A signed, find-node-only Kademlia-style overlay over TCP. Each node keeps
//! a distance-bucketed routing table of peers, authenticates every message
//! with per-peer Ed25519 signatures, and converges on the live peers closest
//! to any 160-bit key through iterative parallel lookups.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`identity`]: peer keys (SHA-1 of the Ed25519 public key), the
//!   `node://` address codec, XOR distances, and the 96-byte peer signature.
//! - [`core`]: the transport-agnostic overlay logic — [`Peer`] records, the
//!   [`RoutingTable`], the [`Network`] trait, and the [`Dht`] lookup engine.
//! - [`framing`]: length-prefixed frames with per-operation deadlines.
//! - [`protocol`]: the JSON request/response messages exchanged between
//!   peers.
//! - [`net`]: the outbound [`TcpClient`] that signs, frames, and verifies
//!   RPC exchanges.
//! - [`host`]: the [`Host`] — listener, identity, handler registry, and the
//!   background ping and prune services.
//!
//! ## Getting started
//!
//! Build a [`Host`], spawn its accept loop, and bootstrap from a known node:
//!
//! ```no_run
//! use meshkad::Host;
//!
//! # async fn run(boot_address: &str) -> anyhow::Result<()> {
//! let host = Host::builder().port(4000).build().await?;
//!
//! let accept = host.clone();
//! tokio::spawn(async move { accept.listen().await });
//!
//! host.bootstrap(boot_address).await?;
//!
//! let closest = host.find_closest_nodes(&host.peer_key()).await;
//! println!("{} neighbours", closest.len());
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` wires these pieces into a runnable node with
//! bootstrap flags and a periodic status log.

pub mod core;
pub mod framing;
pub mod host;
pub mod identity;
pub mod net;
pub mod protocol;
mod server;

pub use crate::core::{Dht, Network, Peer, RoutingTable};
pub use crate::host::{
    HandlerFuture, Host, HostBuilder, RpcHandler, DEFAULT_LATENCY_PERIOD, DEFAULT_MAX_PEERS,
    DEFAULT_PING_PERIOD,
};
pub use crate::identity::{
    body_digest, bucket_index, format_node_address, parse_node_address, peer_key,
    recover_peer_key, seal_payload, xor_distance, PeerKey, SignatureError, PEER_KEY_LEN,
    PEER_SIGNATURE_LEN, PUBLIC_KEY_LEN, SIGNATURE_LEN,
};
pub use crate::net::TcpClient;
pub use crate::protocol::{
    RpcRequest, RpcResponse, FIND_NODE_METHOD, PING_METHOD, PONG_RESPONSE, PROTOCOL_VERSION,
};
