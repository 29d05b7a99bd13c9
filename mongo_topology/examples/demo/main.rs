use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use mongo_topology::{
    Connector, ConnectorError, HelloCommand, Membership, ReadPreference, ReadPreferenceOptions,
    SelectionCriteria, ServerAddress, Topology,
};
use serde_json::{json, Value};
use tracing::subscriber::set_global_default;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

const MEMBERS: [&str; 3] = ["db1:27017", "db2:27017", "db3:27017"];

/// Pretends to be a three member replica set whose primary can be moved around.
#[derive(Debug, Clone, Default)]
struct SimulatedReplicaSet {
    primary: Arc<Mutex<Option<String>>>,
    election: Arc<Mutex<u8>>,
}

impl SimulatedReplicaSet {
    fn elect(&self, host: &str) {
        *self.primary.lock().unwrap() = Some(host.to_string());
        *self.election.lock().unwrap() += 1;
    }
}

#[async_trait]
impl Connector for SimulatedReplicaSet {
    async fn hello(
        &self,
        address: &ServerAddress,
        command: &HelloCommand,
    ) -> Result<Value, ConnectorError> {
        if let Some(max_await_time) = command.max_await_time {
            tokio::time::sleep(max_await_time).await;
        }
        tokio::time::sleep(Duration::from_millis(3)).await;

        let host = address.to_string();
        let is_primary = self.primary.lock().unwrap().as_deref() == Some(host.as_str());
        let election = *self.election.lock().unwrap();
        let mut reply = json!({
            "ok": 1,
            "ismaster": is_primary,
            "secondary": !is_primary,
            "setName": "rs0",
            "hosts": MEMBERS,
            "minWireVersion": 0,
            "maxWireVersion": 17,
            "logicalSessionTimeoutMinutes": 30,
        });
        if is_primary {
            reply["setVersion"] = json!(1);
            reply["electionId"] = json!({ "$oid": format!("7fffffff00000000000000{:02x}", election) });
        }
        Ok(reply)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();

    let deployment = SimulatedReplicaSet::default();
    deployment.elect("db1:27017");

    let topology = Topology::builder()
        .set_hosts(&["db1:27017"])
        .set_replica_set("rs0")
        .set_heartbeat_frequency(Duration::from_secs(1))
        .set_connector(deployment.clone())
        .build()?;

    let membership = Membership::new(topology.clone());
    let mut changes = membership.subscribe();
    tokio::spawn(async move {
        while let Some(change) = changes.recv().await {
            println!("membership: {:?}", change);
        }
    });

    let primary = topology.select_server(&SelectionCriteria::Write).await?;
    println!("writes go to {}", primary.address);

    let nearest = SelectionCriteria::from(ReadPreference::Nearest {
        options: ReadPreferenceOptions::default(),
    });
    let reader = topology.select_server(&nearest).await?;
    println!("nearest reads go to {}", reader.address);

    println!("moving the primary to db2");
    deployment.elect("db2:27017");
    tokio::time::sleep(Duration::from_secs(3)).await;

    let primary = topology.select_server(&SelectionCriteria::Write).await?;
    println!("writes now go to {}", primary.address);
    println!("{:#?}", membership.snapshot());

    topology.close().await?;
    Ok(())
}

fn setup_tracing() {
    // Redirect all `log`'s events to the subscriber
    LogTracer::init().expect("Failed to set logger");
    // Set up tracing
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let formatting_layer = BunyanFormattingLayer::new("mongo-topology-demo".into(), std::io::stdout);
    let subscriber = Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(formatting_layer);
    set_global_default(subscriber).expect("Failed to set subscriber");
}
