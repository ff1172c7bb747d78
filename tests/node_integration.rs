//! End-to-end node tests against a mocked registry agent

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use otter_node::wire::{encode_frame, now_secs};
use otter_node::{Credentials, NdArray, Node, NodeConfig, OnReceive, PayloadMap, ReceivedBatch, Value};

fn node_config(registry: &str, id: &str, name: &str, role: &str, targets: &[&str]) -> NodeConfig {
    let mut config = NodeConfig::for_node(
        0,
        name,
        role,
        "CPU",
        registry,
        targets.iter().map(|t| t.to_string()).collect(),
    );
    config.node.id = Some(id.to_string());
    config.node.listen_host = "127.0.0.1".to_string();
    config.node.advertise_address = Some("127.0.0.1".parse().unwrap());
    config.registry.poll_interval_ms = 100;
    config.dispatch.connect_timeout_ms = 500;
    config.dispatch.retry_delay_ms = 100;
    config
}

/// Registry agent that accepts registrations and deregistrations
async fn registry() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

/// Make the agent report these nodes as its services
async fn announce(server: &MockServer, nodes: &[&Node]) {
    let mut services = serde_json::Map::new();
    for node in nodes {
        let identity = node.identity();
        services.insert(
            identity.node_id.clone(),
            json!({
                "ID": identity.node_id,
                "Service": identity.container_name,
                "Tags": identity.tags,
                "Port": identity.listen_port,
                "Address": "127.0.0.1",
            }),
        );
    }

    Mock::given(method("GET"))
        .and(path("/v1/agent/services"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::Value::Object(services)))
        .mount(server)
        .await;
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

async fn send_raw(node: &Node, from: &Credentials, payload: &PayloadMap) {
    let frame = encode_frame(from, payload, Some(now_secs())).unwrap();
    let mut stream = TcpStream::connect(node.local_addr()).await.unwrap();
    stream.write_all(&frame).await.unwrap();
    stream.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_client_delivers_to_server() {
    let server = registry().await;

    let a = Node::start(node_config(&server.uri(), "node-a", "A", "server", &[]), None)
        .await
        .unwrap();
    let b = Node::start(node_config(&server.uri(), "node-b", "B", "client", &["server"]), None)
        .await
        .unwrap();
    announce(&server, &[&a, &b]).await;

    let mut payload = PayloadMap::new();
    payload.insert("var1".to_string(), Value::Int(42));
    payload.insert(
        "weights".to_string(),
        Value::Array(NdArray::from_f64(vec![2, 2], &[0.5, 1.5, 2.5, 3.5]).unwrap()),
    );
    b.send_data_to_peers(payload).unwrap();

    assert!(a.wait_for_data(Duration::from_secs(5)).await);

    let from_b = a.received_from(&Credentials::new("B", "client")).unwrap();
    assert_eq!(from_b["var1"], Value::Int(42));
    let weights = from_b["weights"].as_array().unwrap();
    assert_eq!(weights.shape(), &[2, 2]);
    assert_eq!(weights.to_f64_vec(), vec![0.5, 1.5, 2.5, 3.5]);

    assert!(wait_until(Duration::from_secs(2), || b.sent_peer_count() == 1).await);

    // A has no target roles and never sends
    assert!(b.received_data().is_empty());
    assert_eq!(a.sent_peer_count(), 0);

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_nodes_exchange_both_ways() {
    let server = registry().await;

    let a = Node::start(node_config(&server.uri(), "node-a", "A", "server", &["client"]), None)
        .await
        .unwrap();
    let b = Node::start(node_config(&server.uri(), "node-b", "B", "client", &["server"]), None)
        .await
        .unwrap();
    announce(&server, &[&a, &b]).await;

    let mut request = PayloadMap::new();
    request.insert("question".to_string(), Value::Str("ping".to_string()));
    b.send_data_to_peers(request).unwrap();

    // A answers once something has arrived
    assert!(a.wait_for_data(Duration::from_secs(5)).await);
    let mut reply = PayloadMap::new();
    reply.insert("answer".to_string(), Value::Str("pong".to_string()));
    a.send_data_to_peers(reply).unwrap();

    assert!(b.wait_for_data(Duration::from_secs(5)).await);
    assert_eq!(
        b.received_from(&Credentials::new("A", "server")).unwrap()["answer"],
        Value::Str("pong".to_string())
    );
    assert_eq!(
        a.received_from(&Credentials::new("B", "client")).unwrap()["question"],
        Value::Str("ping".to_string())
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_each_peer_receives_once() {
    let server = registry().await;

    let batches = Arc::new(Mutex::new(Vec::<Credentials>::new()));
    let seen = Arc::clone(&batches);
    let callback: OnReceive = Arc::new(move |batch: &ReceivedBatch| seen.lock().push(batch.from.clone()));

    let a = Node::start(
        node_config(&server.uri(), "node-a", "A", "server", &[]),
        Some(callback),
    )
    .await
    .unwrap();
    let b = Node::start(node_config(&server.uri(), "node-b", "B", "client", &["server"]), None)
        .await
        .unwrap();
    announce(&server, &[&a, &b]).await;

    let mut payload = PayloadMap::new();
    payload.insert("flag".to_string(), Value::Bool(true));
    b.send_data_to_peers(payload).unwrap();

    assert!(wait_until(Duration::from_secs(5), || batches.lock().len() == 1).await);

    // Several more poll rounds must not deliver again
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(batches.lock().as_slice(), &[Credentials::new("B", "client")]);
    assert_eq!(b.sent_peer_count(), 1);

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_non_matching_peers_are_skipped() {
    let server = registry().await;

    let a = Node::start(node_config(&server.uri(), "node-a", "A", "server", &[]), None)
        .await
        .unwrap();
    let db = Node::start(node_config(&server.uri(), "node-db", "DB", "storage", &[]), None)
        .await
        .unwrap();
    let b = Node::start(node_config(&server.uri(), "node-b", "B", "client", &["server"]), None)
        .await
        .unwrap();
    announce(&server, &[&a, &db, &b]).await;

    let mut payload = PayloadMap::new();
    payload.insert("n".to_string(), Value::Float(1.25));
    b.send_data_to_peers(payload).unwrap();

    assert!(a.wait_for_data(Duration::from_secs(5)).await);
    assert!(!db.wait_for_data(Duration::from_millis(400)).await);
    assert_eq!(b.sent_peer_count(), 1);

    for node in [&a, &db, &b] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_peer_registered_late_still_receives() {
    let server = registry().await;

    let b = Node::start(node_config(&server.uri(), "node-b", "B", "client", &["server"]), None)
        .await
        .unwrap();
    announce(&server, &[&b]).await;

    let mut payload = PayloadMap::new();
    payload.insert("var1".to_string(), Value::Int(7));
    b.send_data_to_peers(payload).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(b.sent_peer_count(), 0);

    let a = Node::start(node_config(&server.uri(), "node-a", "A", "server", &[]), None)
        .await
        .unwrap();
    server.reset().await;
    announce(&server, &[&a, &b]).await;

    assert!(a.wait_for_data(Duration::from_secs(5)).await);
    assert_eq!(
        a.received_from(&Credentials::new("B", "client")).unwrap()["var1"],
        Value::Int(7)
    );

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_later_batches_overwrite_per_variable() {
    let server = registry().await;
    let a = Node::start(node_config(&server.uri(), "node-a", "A", "server", &[]), None)
        .await
        .unwrap();
    let sender = Credentials::new("C", "client");

    let mut first = PayloadMap::new();
    first.insert("var1".to_string(), Value::Int(1));
    first.insert("label".to_string(), Value::Str("first".to_string()));
    send_raw(&a, &sender, &first).await;
    assert!(a.wait_for_data(Duration::from_secs(5)).await);

    let mut second = PayloadMap::new();
    second.insert("var1".to_string(), Value::Int(2));
    send_raw(&a, &sender, &second).await;

    assert!(
        wait_until(Duration::from_secs(5), || {
            a.received_from(&sender).map(|vars| vars["var1"] == Value::Int(2)).unwrap_or(false)
        })
        .await
    );
    let vars = a.received_from(&sender).unwrap();
    assert_eq!(vars["label"], Value::Str("first".to_string()));
    assert_eq!(vars.len(), 2);

    a.shutdown().await;
}

#[tokio::test]
async fn test_oversized_frame_is_dropped() {
    let server = registry().await;
    let mut config = node_config(&server.uri(), "node-a", "A", "server", &[]);
    config.receiver.max_frame_bytes = 256;
    let a = Node::start(config, None).await.unwrap();

    let mut big = PayloadMap::new();
    big.insert("blob".to_string(), Value::Bytes(vec![7u8; 4096]));
    send_raw(&a, &Credentials::new("Big", "client"), &big).await;

    let mut small = PayloadMap::new();
    small.insert("ok".to_string(), Value::Bool(true));
    send_raw(&a, &Credentials::new("Small", "client"), &small).await;

    assert!(
        wait_until(Duration::from_secs(5), || a
            .received_from(&Credentials::new("Small", "client"))
            .is_some())
        .await
    );
    assert!(a.received_from(&Credentials::new("Big", "client")).is_none());

    a.shutdown().await;
}

#[tokio::test]
async fn test_registration_body() {
    let server = registry().await;
    let mut config = node_config(&server.uri(), "node-a", "A", "server", &[]);
    config.node.tags = vec!["edge".to_string(), "server".to_string()];
    let a = Node::start(config, None).await.unwrap();
    let port = a.local_addr().port();

    let requests = server.received_requests().await.unwrap();
    let registration = requests
        .iter()
        .find(|r| r.url.path() == "/v1/agent/service/register")
        .expect("no registration request");
    let body: serde_json::Value = registration.body_json().unwrap();

    assert_eq!(body["Name"], "A");
    assert_eq!(body["ID"], "node-a");
    assert_eq!(body["Port"], port);
    assert_eq!(body["Address"], "127.0.0.1");
    assert_eq!(body["Tags"], json!(["server", "CPU", "edge"]));
    assert_eq!(body["Check"]["TCP"], format!("127.0.0.1:{}", port));
    assert_eq!(body["Check"]["Interval"], "5s");
    assert_eq!(body["Check"]["Timeout"], "1s");
    assert_eq!(body["Check"]["DeregisterCriticalServiceAfter"], "10s");

    a.shutdown().await;
}
