//! End-to-end tests running a real server and real clients over loopback.

use crosswire_client::{ClientConfig, ClientEngine, ClientEvent};
use crosswire_core::{
    Parameters, RegistryBuilder, RpcError, Serializer, ServiceBuilder, ServiceRegistry,
};
use crosswire_server::{ServerConfig, ServerEngine, ServerEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn serializer() -> Arc<Serializer> {
    Arc::new(Serializer::new(RegistryBuilder::new().build().unwrap()))
}

/// Inventory service with a seeded stock table; `AddItem(name, qty)` returns
/// the new count, `Stall` never completes within any test's patience.
fn inventory(serializer: Arc<Serializer>) -> Arc<ServiceRegistry> {
    let stock = Arc::new(Mutex::new(HashMap::from([("apple".to_string(), 1i32)])));
    let s = Arc::clone(&serializer);
    ServiceRegistry::builder()
        .service(
            ServiceBuilder::new("Inventory")
                .method("AddItem", move |_caller, params| {
                    let s = Arc::clone(&s);
                    let stock = Arc::clone(&stock);
                    async move {
                        let params = params.ok_or("AddItem requires parameters")?;
                        let name: String = params.get(&s, 0)?;
                        let qty: i32 = params.get(&s, 1)?;
                        let mut stock = stock.lock().unwrap();
                        let count = stock.entry(name).or_insert(0);
                        *count += qty;
                        Ok(Some(s.serialize(&*count)?))
                    }
                })
                .method("Stall", |_caller, _params| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(None)
                }),
        )
        .build()
        .unwrap()
}

async fn start_server(
    serializer: Arc<Serializer>,
    services: Arc<ServiceRegistry>,
    max_peers: usize,
) -> (ServerEngine, String) {
    let config = ServerConfig {
        max_peers,
        ..ServerConfig::default()
    };
    let server = ServerEngine::new(config, serializer, services);
    let addr = server.bind("127.0.0.1:0").await.unwrap();
    (server, format!("ws://{}", addr))
}

fn client(serializer: Arc<Serializer>, services: Arc<ServiceRegistry>) -> ClientEngine {
    let config = ClientConfig {
        connect_timeout_ms: 2_000,
        call_timeout_ms: 5_000,
    };
    ClientEngine::new(config, serializer, services)
}

/// Drive `connect` to its outcome; panics on `ConnectFailed`.
async fn connect(client: &ClientEngine, url: &str) {
    let mut events = client.events();
    client.connect(url).unwrap();
    match events.recv().await.unwrap() {
        ClientEvent::Connected => {}
        other => panic!("connect did not succeed: {other:?}"),
    }
}

#[tokio::test]
async fn add_item_round_trip_returns_the_new_count() {
    let s = serializer();
    let (_server, url) = start_server(Arc::clone(&s), inventory(Arc::clone(&s)), 8).await;
    let client = client(Arc::clone(&s), ServiceRegistry::empty());
    connect(&client, &url).await;

    let mut params = Parameters::new();
    params.push(&s, &"apple".to_string()).unwrap();
    params.push(&s, &2i32).unwrap();
    let count: i32 = client.call("Inventory", "AddItem", params).await.unwrap();
    assert_eq!(count, 3);
    assert_eq!(client.pending_call_count(), 0);
}

#[tokio::test]
async fn unknown_method_surfaces_the_remote_error_text() {
    let s = serializer();
    let (_server, url) = start_server(Arc::clone(&s), inventory(Arc::clone(&s)), 8).await;
    let client = client(Arc::clone(&s), ServiceRegistry::empty());
    connect(&client, &url).await;

    let err = client
        .call::<i32>("Inventory", "RemoveItem", Parameters::new())
        .await
        .unwrap_err();
    match err {
        RpcError::Remote { message } => {
            assert_eq!(message, "Method 'RemoveItem' not found in service 'Inventory'");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn stalled_call_times_out_and_is_untracked() {
    let s = serializer();
    let (_server, url) = start_server(Arc::clone(&s), inventory(Arc::clone(&s)), 8).await;
    let client = client(Arc::clone(&s), ServiceRegistry::empty());
    connect(&client, &url).await;

    let err = client
        .call_with_timeout::<()>(
            "Inventory",
            "Stall",
            Parameters::new(),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout));
    assert_eq!(client.pending_call_count(), 0);
}

#[tokio::test]
async fn capacity_is_enforced_at_the_handshake_and_released_on_disconnect() {
    let s = serializer();
    let (server, url) = start_server(Arc::clone(&s), ServiceRegistry::empty(), 1).await;
    let mut server_events = server.events();

    let first = client(Arc::clone(&s), ServiceRegistry::empty());
    connect(&first, &url).await;
    assert_eq!(server.peer_count(), 1);

    // Second handshake is rejected before any peer context exists.
    let second = client(Arc::clone(&s), ServiceRegistry::empty());
    let mut events = second.events();
    second.connect(&url).unwrap();
    match events.recv().await.unwrap() {
        ClientEvent::ConnectFailed { .. } => {}
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(server.peer_count(), 1);

    // Releasing the only slot admits the next peer.
    let _ = server_events.recv().await; // PeerConnected for `first`
    first.disconnect();
    loop {
        if let ServerEvent::PeerDisconnected { .. } = server_events.recv().await.unwrap() {
            break;
        }
    }
    let third = client(Arc::clone(&s), ServiceRegistry::empty());
    connect(&third, &url).await;
    assert_eq!(server.peer_count(), 1);
}

#[tokio::test]
async fn disconnect_faults_every_pending_call() {
    let s = serializer();
    let (_server, url) = start_server(Arc::clone(&s), inventory(Arc::clone(&s)), 8).await;
    let client = client(Arc::clone(&s), ServiceRegistry::empty());
    connect(&client, &url).await;

    let mut calls = Vec::new();
    for _ in 0..3 {
        let c = client.clone();
        calls.push(tokio::spawn(async move {
            c.call::<()>("Inventory", "Stall", Parameters::new()).await
        }));
    }
    // Let the requests reach the wire before tearing down.
    while client.pending_call_count() < 3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    client.disconnect();
    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Disconnected { .. }), "got {err:?}");
    }
    assert_eq!(client.pending_call_count(), 0);
}

#[tokio::test]
async fn server_calls_back_into_a_client_service() {
    let s = serializer();
    let (server, url) = start_server(Arc::clone(&s), ServiceRegistry::empty(), 8).await;
    let mut server_events = server.events();

    let echo = {
        let s = Arc::clone(&s);
        ServiceRegistry::builder()
            .service(ServiceBuilder::new("Echo").sync_method("Shout", move |caller, params| {
                assert_eq!(caller.id(), "server");
                let params = params.ok_or("Shout requires parameters")?;
                let text: String = params.get(&s, 0)?;
                Ok(Some(s.serialize(&text.to_uppercase())?))
            }))
            .build()
            .unwrap()
    };
    let client = client(Arc::clone(&s), echo);
    connect(&client, &url).await;

    let client_id = match server_events.recv().await.unwrap() {
        ServerEvent::PeerConnected { client_id } => client_id,
        other => panic!("unexpected event: {other:?}"),
    };
    let mut params = Parameters::new();
    params.push(&s, &"ping".to_string()).unwrap();
    let shouted: String = server
        .call_peer(&client_id, "Echo", "Shout", params)
        .await
        .unwrap();
    assert_eq!(shouted, "PING");
}

#[tokio::test]
async fn broadcast_reaches_every_connected_peer() {
    let s = serializer();
    let (server, url) = start_server(Arc::clone(&s), ServiceRegistry::empty(), 8).await;
    let mut server_events = server.events();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut clients = Vec::new();
    for _ in 0..2 {
        let tx = tx.clone();
        let s2 = Arc::clone(&s);
        let alerts = ServiceRegistry::builder()
            .service(ServiceBuilder::new("Alerts").sync_method("Notice", move |_caller, params| {
                let params = params.ok_or("Notice requires parameters")?;
                let text: String = params.get(&s2, 0)?;
                let _ = tx.send(text);
                Ok(None)
            }))
            .build()
            .unwrap();
        let c = client(Arc::clone(&s), alerts);
        connect(&c, &url).await;
        let _ = server_events.recv().await; // PeerConnected
        clients.push(c);
    }

    let mut params = Parameters::new();
    params.push(&s, &"restart imminent".to_string()).unwrap();
    let sent = server.broadcast("Alerts", "Notice", params).unwrap();
    assert_eq!(sent, 2);
    for _ in 0..2 {
        let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text, "restart imminent");
    }
}
