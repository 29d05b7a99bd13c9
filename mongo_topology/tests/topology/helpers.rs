use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use mongo_topology::{
    Connector, ConnectorError, HelloCommand, SdamEvent, ServerAddress, Topology, TopologyBuilder,
    TopologyDescription,
};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::subscriber::set_global_default;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

// Set TEST_LOG to see the crate's logs while running tests
static TRACING: Lazy<()> = Lazy::new(|| {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    if std::env::var("TEST_LOG").is_ok() {
        let formatting_layer = BunyanFormattingLayer::new("topology-tests".into(), std::io::stdout);
        let subscriber = Registry::default()
            .with(env_filter)
            .with(JsonStorageLayer)
            .with(formatting_layer);
        LogTracer::init().expect("Failed to set logger");
        set_global_default(subscriber).expect("Failed to set subscriber");
    }
});

pub const ELECTION_1: &str = "7fffffff0000000000000001";

#[derive(Debug, Clone)]
enum Script {
    Reply { document: Value, latency: Duration },
    Fail,
}

/// In-memory stand-in for a deployment: each address answers with whatever it was last told to.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    scripts: Arc<Mutex<HashMap<ServerAddress, Script>>>,
    calls: Arc<Mutex<HashMap<ServerAddress, usize>>>,
}

impl ScriptedConnector {
    pub fn respond(&self, host: &str, document: Value) {
        self.respond_after(host, document, Duration::ZERO);
    }

    pub fn respond_after(&self, host: &str, document: Value, latency: Duration) {
        self.scripts
            .lock()
            .unwrap()
            .insert(address(host), Script::Reply { document, latency });
    }

    pub fn fail(&self, host: &str) {
        self.scripts.lock().unwrap().insert(address(host), Script::Fail);
    }

    pub fn calls(&self, host: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&address(host))
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn hello(
        &self,
        address: &ServerAddress,
        command: &HelloCommand,
    ) -> Result<Value, ConnectorError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(address.clone())
            .or_default() += 1;

        // Awaitable handshakes are held by the server until something changes
        if let Some(max_await_time) = command.max_await_time {
            tokio::time::sleep(max_await_time).await;
        }

        let script = self.scripts.lock().unwrap().get(address).cloned();
        match script {
            Some(Script::Reply { document, latency }) => {
                tokio::time::sleep(latency).await;
                Ok(document)
            }
            Some(Script::Fail) | None => Err(ConnectorError::ConnectionFailed {
                address: address.clone(),
                message: "connection refused".to_string(),
            }),
        }
    }
}

pub fn address(host: &str) -> ServerAddress {
    host.parse().unwrap()
}

pub fn standalone() -> Value {
    json!({"ok": 1, "ismaster": true, "minWireVersion": 0, "maxWireVersion": 13})
}

pub fn mongos() -> Value {
    json!({"ok": 1, "ismaster": true, "msg": "isdbgrid", "minWireVersion": 0, "maxWireVersion": 13})
}

pub fn primary(hosts: &[&str], set_version: i32, election_id: &str) -> Value {
    json!({
        "ok": 1,
        "ismaster": true,
        "setName": "rs0",
        "hosts": hosts,
        "setVersion": set_version,
        "electionId": {"$oid": election_id},
        "minWireVersion": 0,
        "maxWireVersion": 13,
    })
}

pub fn secondary(hosts: &[&str]) -> Value {
    json!({
        "ok": 1,
        "ismaster": false,
        "secondary": true,
        "setName": "rs0",
        "hosts": hosts,
        "minWireVersion": 0,
        "maxWireVersion": 13,
    })
}

pub struct TestTopology {
    pub topology: Topology,
    pub connector: ScriptedConnector,
    pub events: broadcast::Receiver<SdamEvent>,
}

impl TestTopology {
    /// Waits until the published description satisfies `predicate`, panicking after a minute.
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&TopologyDescription) -> bool,
    ) -> Arc<TopologyDescription> {
        let wait = async {
            loop {
                let description = self.topology.description();
                if predicate(&description) {
                    return description;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(60), wait)
            .await
            .expect("Topology never reached the expected state")
    }

    /// Every event received so far.
    pub fn drain_events(&mut self) -> Vec<SdamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Starts a topology over `hosts`. `configure` can adjust the builder before it is built.
pub fn spawn_topology(
    connector: ScriptedConnector,
    hosts: &[&str],
    configure: impl FnOnce(TopologyBuilder) -> TopologyBuilder,
) -> TestTopology {
    Lazy::force(&TRACING);

    let builder = configure(
        Topology::builder()
            .set_hosts(hosts)
            .set_heartbeat_frequency(Duration::from_secs(10))
            .set_server_selection_timeout(Duration::from_secs(5))
            .set_connector(connector.clone()),
    );
    let events = builder.subscribe_events();
    let topology = builder.build().expect("Failed to build topology");

    TestTopology {
        topology,
        connector,
        events,
    }
}
