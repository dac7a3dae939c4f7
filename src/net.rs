//! Outbound RPC client over TCP.
//!
//! [`TcpClient`] dials a `node://` address, sends one signed framed request,
//! reads one signed framed response, and verifies that the responder is the
//! identity named in the address before trusting anything in the reply. A
//! successful exchange refreshes the peer in the routing table; a failed one
//! leaves the table untouched.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::trace;

use crate::core::{Network, RoutingTable};
use crate::framing::{read_frame, write_frame};
use crate::identity::{
    body_digest, parse_node_address, recover_peer_key, seal_payload, PeerKey, PEER_SIGNATURE_LEN,
};
use crate::protocol::{
    RpcRequest, RpcResponse, FIND_NODE_METHOD, PING_METHOD, PONG_RESPONSE, PROTOCOL_VERSION,
};

/// Deadline for establishing an outbound TCP connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Signing RPC client shared by the host and the lookup engine.
pub struct TcpClient {
    signing_key: Arc<SigningKey>,
    table: Arc<Mutex<RoutingTable>>,
}

impl TcpClient {
    /// Create a client signing with `signing_key` and recording successful
    /// exchanges in `table`.
    pub fn new(signing_key: Arc<SigningKey>, table: Arc<Mutex<RoutingTable>>) -> Self {
        Self { signing_key, table }
    }

    /// Send one signed request to the node at `address` and return the
    /// response data.
    ///
    /// Fails on an unparseable address, connect or frame deadline expiry, a
    /// response signed by a different identity than the address names, or a
    /// `success=false` response (whose reason string becomes the error).
    pub async fn send_message(
        &self,
        address: &str,
        version: i64,
        method: &str,
        data: Value,
    ) -> Result<Value> {
        let (expected_key, ip, port) = parse_node_address(address)?;

        let mut stream = timeout(DIAL_TIMEOUT, TcpStream::connect((ip, port)))
            .await
            .context("connect deadline expired")?
            .with_context(|| format!("failed to connect to {ip}:{port}"))?;

        let body = serde_json::to_vec(&RpcRequest {
            version,
            method: method.to_string(),
            data,
        })?;
        let payload = seal_payload(&self.signing_key, &body);
        write_frame(&mut stream, &payload).await?;
        trace!(%method, peer = %hex::encode(&expected_key[..8]), "request sent");

        let response_payload = read_frame(&mut stream).await?;
        if response_payload.len() <= PEER_SIGNATURE_LEN {
            bail!("incomplete response body");
        }
        let (signature, response_body) = response_payload.split_at(PEER_SIGNATURE_LEN);

        let responder_key = recover_peer_key(signature, &body_digest(response_body))?;
        if responder_key != expected_key {
            bail!("peer key in address does not match peer key in response");
        }

        {
            let mut table = self.table.lock().await;
            table.insert(expected_key, ip, port);
        }

        let response: RpcResponse = serde_json::from_slice(response_body)?;
        if !response.success {
            let reason = response
                .data
                .as_str()
                .unwrap_or("unspecified remote error")
                .to_string();
            bail!("{reason}");
        }
        Ok(response.data)
    }

    /// Probe the node at `address` and require the exact pong reply.
    pub async fn ping(&self, address: &str) -> Result<()> {
        let data = self
            .send_message(address, PROTOCOL_VERSION, PING_METHOD, Value::Null)
            .await?;
        match data.as_str() {
            Some(PONG_RESPONSE) => Ok(()),
            _ => bail!("expected [{PONG_RESPONSE}] as response"),
        }
    }

    /// Ask the node at `address` for the peers it knows closest to `target`.
    pub async fn find_node(&self, address: &str, target: &PeerKey) -> Result<Vec<String>> {
        let data = self
            .send_message(
                address,
                PROTOCOL_VERSION,
                FIND_NODE_METHOD,
                Value::String(hex::encode(target)),
            )
            .await?;
        serde_json::from_value(data).context("malformed find_node response")
    }
}

#[async_trait]
impl Network for TcpClient {
    async fn ping(&self, address: &str) -> Result<()> {
        TcpClient::ping(self, address).await
    }

    async fn find_node(&self, address: &str, target: &PeerKey) -> Result<Vec<String>> {
        TcpClient::find_node(self, address, target).await
    }
}
