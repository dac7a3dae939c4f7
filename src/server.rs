//! Inbound RPC connection handling.
//!
//! Each accepted connection carries exactly one request: a framed payload of
//! `[96-byte peer signature ‖ JSON body]`. The signature is verified before
//! anything else is trusted; only then is the sender recorded in the routing
//! table, under the source IP and source port of the connection. Every
//! outcome, success or failure, is answered with a signed framed
//! [`RpcResponse`] and the connection is closed.

use std::net::{IpAddr, SocketAddr};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::core::Peer;
use crate::framing::{read_frame, write_frame};
use crate::host::Host;
use crate::identity::{body_digest, recover_peer_key, PEER_SIGNATURE_LEN};
use crate::protocol::{RpcRequest, RpcResponse};

/// Serve one request on an accepted connection.
///
/// Errors never propagate: they are wrapped into a `success=false` response
/// so the remote peer always learns why it was rejected.
pub(crate) async fn handle_connection(host: Host, mut stream: TcpStream, remote: SocketAddr) {
    let response = match process_request(&host, &mut stream, remote).await {
        Ok(data) => RpcResponse {
            success: true,
            data,
        },
        Err(err) => RpcResponse {
            success: false,
            data: Value::String(err.to_string()),
        },
    };

    if let Err(err) = send_response(&host, &mut stream, &response).await {
        debug!(%remote, "failed to send response: {err:#}");
    }
}

async fn process_request(
    host: &Host,
    stream: &mut TcpStream,
    remote: SocketAddr,
) -> Result<Value> {
    let payload = read_frame(stream).await?;
    if payload.len() <= PEER_SIGNATURE_LEN {
        bail!("Incomplete request body");
    }
    let (signature, body) = payload.split_at(PEER_SIGNATURE_LEN);

    let peer_key = recover_peer_key(signature, &body_digest(body))
        .map_err(|_| anyhow!("Invalid peer signature"))?;

    let request: RpcRequest = serde_json::from_slice(body)?;

    // The sender is recorded under the source port of this connection; peers
    // are expected to dial from the port they listen on.
    let IpAddr::V4(ip) = remote.ip() else {
        bail!("non-IPv4 remote address");
    };
    let peer = Peer::new(peer_key, ip, remote.port());
    {
        let table = host.route_table();
        let mut table = table.lock().await;
        table.insert(peer_key, ip, remote.port());
    }

    trace!(
        method = %request.method,
        peer = %hex::encode(&peer_key[..8]),
        "dispatching request"
    );

    let handler = host
        .handler(&request.method)
        .await
        .context("Unknown RPC method")?;
    let result = handler(host.clone(), peer, request).await;

    if let Err(err) = &result {
        debug!(peer = %hex::encode(&peer_key[..8]), "handler failed: {err:#}");
    }
    result
}

async fn send_response(host: &Host, stream: &mut TcpStream, response: &RpcResponse) -> Result<()> {
    let body = serde_json::to_vec(response)?;
    let payload = host.seal(&body);
    write_frame(stream, &payload).await
}
