//! Inventory demo.
//!
//! One binary, two modes:
//! - serve: host an `Inventory` service and push restock notices to every
//!   connected client
//! - connect: call the service through a hand-written typed proxy
//!
//! Run a server and a client:
//!   cargo run -p crosswire-demo-inventory -- serve --port 9000
//!   cargo run -p crosswire-demo-inventory -- connect --url ws://127.0.0.1:9000
//!
//! The proxy pattern shown here is the intended way to consume a crosswire
//! service: a thin struct over [`ClientEngine`] with one typed method per
//! remote method, so call sites never touch `Parameters` directly.

use crosswire_client::{ClientConfig, ClientEngine, ClientEvent};
use crosswire_core::{
    Parameters, RegistryBuilder, RpcError, Serializer, ServiceBuilder, ServiceRegistry,
};
use crosswire_server::{ServerConfig, ServerEngine, ServerEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("inventory=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("serve") => {
            let port = parse_arg(&args, "--port").unwrap_or(9000);
            serve(port).await
        }
        Some("connect") => {
            let url = parse_arg_string(&args, "--url")
                .unwrap_or_else(|| "ws://127.0.0.1:9000".to_string());
            connect(&url).await
        }
        _ => {
            eprintln!("usage: inventory serve [--port N] | connect [--url ws://...]");
            Ok(())
        }
    }
}

fn serializer() -> anyhow::Result<Arc<Serializer>> {
    Ok(Arc::new(Serializer::new(RegistryBuilder::new().build()?)))
}

async fn serve(port: u16) -> anyhow::Result<()> {
    let serializer = serializer()?;
    let stock: Arc<Mutex<HashMap<String, i32>>> = Arc::new(Mutex::new(HashMap::new()));

    let services = {
        let s = Arc::clone(&serializer);
        let stock = Arc::clone(&stock);
        let get_s = Arc::clone(&serializer);
        let get_stock = Arc::clone(&stock);
        ServiceRegistry::builder()
            .service(
                ServiceBuilder::new("Inventory")
                    .sync_method("AddItem", move |caller, params| {
                        let params = params.ok_or("AddItem requires parameters")?;
                        let name: String = params.get(&s, 0)?;
                        let qty: i32 = params.get(&s, 1)?;
                        let mut stock = stock.lock().unwrap();
                        let count = stock.entry(name.clone()).or_insert(0);
                        *count += qty;
                        tracing::info!("{} added {} x {} (now {})", caller, qty, name, count);
                        Ok(Some(s.serialize(&*count)?))
                    })
                    .sync_method("GetCount", move |_caller, params| {
                        let params = params.ok_or("GetCount requires parameters")?;
                        let name: String = params.get(&get_s, 0)?;
                        let count = get_stock.lock().unwrap().get(&name).copied().unwrap_or(0);
                        Ok(Some(get_s.serialize(&count)?))
                    }),
            )
            .build()?
    };

    let server = ServerEngine::new(ServerConfig::default(), Arc::clone(&serializer), services);
    let addr = server.bind(&format!("127.0.0.1:{port}")).await?;
    tracing::info!("inventory server on ws://{}", addr);

    // Announce each arrival to everyone already connected.
    let mut events = server.events();
    while let Ok(event) = events.recv().await {
        if let ServerEvent::PeerConnected { client_id } = event {
            let mut params = Parameters::new();
            params.push(&serializer, &format!("{client_id} joined"))?;
            let reached = server.send_to_where(|id| id != client_id, "Alerts", "Notice", params)?;
            tracing::info!("announced {} to {} peers", client_id, reached);
        }
    }
    Ok(())
}

/// Hand-written typed proxy for the remote `Inventory` service.
struct InventoryClient {
    engine: ClientEngine,
    serializer: Arc<Serializer>,
}

impl InventoryClient {
    fn new(engine: ClientEngine) -> Self {
        let serializer = Arc::clone(engine.serializer());
        Self { engine, serializer }
    }

    async fn add_item(&self, name: &str, qty: i32) -> Result<i32, RpcError> {
        let mut params = Parameters::new();
        params.push(&self.serializer, &name.to_string())?;
        params.push(&self.serializer, &qty)?;
        self.engine.call("Inventory", "AddItem", params).await
    }

    async fn get_count(&self, name: &str) -> Result<i32, RpcError> {
        let mut params = Parameters::new();
        params.push(&self.serializer, &name.to_string())?;
        self.engine.call("Inventory", "GetCount", params).await
    }
}

async fn connect(url: &str) -> anyhow::Result<()> {
    let serializer = serializer()?;

    // Local service the server calls back into.
    let services = {
        let s = Arc::clone(&serializer);
        ServiceRegistry::builder()
            .service(ServiceBuilder::new("Alerts").sync_method("Notice", move |_caller, params| {
                let params = params.ok_or("Notice requires parameters")?;
                let text: String = params.get(&s, 0)?;
                tracing::info!("server notice: {}", text);
                Ok(None)
            }))
            .build()?
    };

    let engine = ClientEngine::new(ClientConfig::default(), serializer, services);
    let mut events = engine.events();
    engine.connect(url)?;
    match events.recv().await? {
        ClientEvent::Connected => tracing::info!("connected to {}", url),
        other => anyhow::bail!("connect failed: {other:?}"),
    }

    let inventory = InventoryClient::new(engine.clone());
    let count = inventory.add_item("apple", 2).await?;
    tracing::info!("apple count after add: {}", count);
    let count = inventory.get_count("apple").await?;
    tracing::info!("apple count queried: {}", count);

    // Linger briefly so a notice about the next client can arrive.
    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    engine.disconnect();
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<u16> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
}

fn parse_arg_string(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
