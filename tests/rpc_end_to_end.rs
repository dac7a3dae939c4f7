use std::sync::Arc;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde_json::{json, Value};
use tokio::net::TcpStream;

use meshkad::framing::{read_frame, write_frame};
use meshkad::{
    body_digest, format_node_address, parse_node_address, recover_peer_key, seal_payload, Host,
    RpcRequest, RpcResponse, PEER_SIGNATURE_LEN, PROTOCOL_VERSION,
};

fn spawn_host(host: &Host) {
    let accept = host.clone();
    tokio::spawn(async move { accept.listen().await });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ping_round_trip_updates_both_routing_tables() {
    let server = Host::builder().port(0).build().await.expect("server host");
    spawn_host(&server);

    let client = Host::builder().port(0).build().await.expect("client host");

    client.ping(&server.address()).await.expect("ping succeeds");

    // The server learned the caller, the caller learned the server.
    let server_peers = server.peers().await;
    assert!(server_peers
        .iter()
        .any(|peer| peer.key() == &client.peer_key()));

    let client_peers = client.peers().await;
    let server_record = client_peers
        .iter()
        .find(|peer| peer.key() == &server.peer_key())
        .expect("server recorded at client");
    assert_eq!(server_record.port(), server.port());

    server.close();
    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn find_node_returns_proximity_ordered_known_peers() {
    let server = Host::builder().port(0).build().await.expect("server host");
    spawn_host(&server);

    let client = Host::builder().port(0).build().await.expect("client host");
    let target = client.peer_key();

    // The only peer the server knows after this exchange is the caller
    // itself, recorded under the source port of the connection.
    let addresses = client
        .find_node(&server.address(), &target)
        .await
        .expect("find_node succeeds");
    assert_eq!(addresses.len(), 1);
    let (key, _, _) = parse_node_address(&addresses[0]).expect("address parses");
    assert_eq!(key, client.peer_key());

    server.close();
    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mismatched_signature_is_rejected_without_table_update() {
    let server = Host::builder().port(0).build().await.expect("server host");
    spawn_host(&server);

    let body = serde_json::to_vec(&RpcRequest {
        version: PROTOCOL_VERSION,
        method: "ping".to_string(),
        data: Value::Null,
    })
    .expect("serialize request");

    // Sign a different body, then send the original one.
    let key = SigningKey::generate(&mut OsRng);
    let foreign = seal_payload(&key, b"{\"something\":\"else\"}");
    let mut payload = foreign[..PEER_SIGNATURE_LEN].to_vec();
    payload.extend_from_slice(&body);

    let mut stream = TcpStream::connect(("127.0.0.1", server.port()))
        .await
        .expect("connect");
    write_frame(&mut stream, &payload).await.expect("send");

    let response_payload = read_frame(&mut stream).await.expect("response");
    let (signature, response_body) = response_payload.split_at(PEER_SIGNATURE_LEN);

    // The rejection itself is signed by the server.
    let responder = recover_peer_key(signature, &body_digest(response_body))
        .expect("response signature verifies");
    assert_eq!(responder, server.peer_key());

    let response: RpcResponse =
        serde_json::from_slice(response_body).expect("response decodes");
    assert!(!response.success);
    assert_eq!(response.data, Value::String("Invalid peer signature".into()));

    assert!(
        server.peers().await.is_empty(),
        "an unauthenticated peer must not enter the routing table"
    );

    server.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn truncated_payload_is_reported_as_incomplete() {
    let server = Host::builder().port(0).build().await.expect("server host");
    spawn_host(&server);

    let mut stream = TcpStream::connect(("127.0.0.1", server.port()))
        .await
        .expect("connect");
    write_frame(&mut stream, &[0u8; 40]).await.expect("send");

    let response_payload = read_frame(&mut stream).await.expect("response");
    let (_, response_body) = response_payload.split_at(PEER_SIGNATURE_LEN);
    let response: RpcResponse =
        serde_json::from_slice(response_body).expect("response decodes");
    assert!(!response.success);
    assert_eq!(response.data, Value::String("Incomplete request body".into()));

    server.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_methods_are_rejected_by_name() {
    let server = Host::builder().port(0).build().await.expect("server host");
    spawn_host(&server);

    let client = Host::builder().port(0).build().await.expect("client host");
    let err = client
        .send_message(&server.address(), PROTOCOL_VERSION, "no_such_method", Value::Null)
        .await
        .expect_err("unknown method must fail");
    assert_eq!(err.to_string(), "Unknown RPC method");

    server.close();
    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn find_node_requires_a_hex_key() {
    let server = Host::builder().port(0).build().await.expect("server host");
    spawn_host(&server);

    let client = Host::builder().port(0).build().await.expect("client host");
    let err = client
        .send_message(&server.address(), PROTOCOL_VERSION, "find_node", json!(42))
        .await
        .expect_err("numeric key must fail");
    assert_eq!(err.to_string(), "node key not found in request body");

    server.close();
    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn custom_methods_can_be_registered() {
    let server = Host::builder().port(0).build().await.expect("server host");
    server
        .register_rpc_method(
            "echo",
            Arc::new(|_host, _peer, request| Box::pin(async move { Ok(request.data) })),
        )
        .await;
    spawn_host(&server);

    let client = Host::builder().port(0).build().await.expect("client host");
    let data = json!({"payload": [1, 2, 3]});
    let echoed = client
        .send_message(&server.address(), PROTOCOL_VERSION, "echo", data.clone())
        .await
        .expect("echo succeeds");
    assert_eq!(echoed, data);

    server.close();
    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn responder_identity_must_match_the_dialed_address() {
    let server = Host::builder().port(0).build().await.expect("server host");
    spawn_host(&server);

    let client = Host::builder().port(0).build().await.expect("client host");

    // Forge an address claiming a different identity behind the server's port.
    let forged_key = client.peer_key();
    let forged = format_node_address(&forged_key, "127.0.0.1".parse().unwrap(), server.port());
    let err = client.ping(&forged).await.expect_err("forged address fails");
    assert_eq!(
        err.to_string(),
        "peer key in address does not match peer key in response"
    );
    assert!(
        client.peers().await.is_empty(),
        "a failed exchange must not update the routing table"
    );

    server.close();
    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closing_a_host_stops_the_accept_loop() {
    let server = Host::builder().port(0).build().await.expect("server host");
    let accept = server.clone();
    let accept_task = tokio::spawn(async move { accept.listen().await });

    let client = Host::builder().port(0).build().await.expect("client host");
    client.ping(&server.address()).await.expect("ping succeeds");

    server.close();
    accept_task
        .await
        .expect("accept task joins")
        .expect("listen returns cleanly");
    assert!(server.is_closed());

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bootstrap_walks_the_network_towards_our_own_key() {
    // A small line of hosts ordered by distance to the last one, so each hop
    // of the walk moves strictly closer.
    let boot = Host::builder().port(0).build().await.expect("boot host");
    spawn_host(&boot);

    let joiner = Host::builder().port(0).build().await.expect("joining host");
    spawn_host(&joiner);

    joiner.bootstrap(&boot.address()).await.expect("bootstrap");

    let peers = joiner.peers().await;
    assert!(peers.iter().any(|peer| peer.key() == &boot.peer_key()));

    boot.close();
    joiner.close();
}
