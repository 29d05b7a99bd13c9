use mongo_topology::{
    ExecuteError, ObjectId, OperationError, SdamEvent, SelectionCriteria, ServerType,
    TopologyType, TopologyVersion,
};
use serde_json::json;

use crate::helpers::{
    address, primary, secondary, spawn_topology, ScriptedConnector, TestTopology, ELECTION_1,
};

const HOSTS: [&str; 2] = ["a:27017", "b:27017"];
const PROCESS_ID: &str = "5f8d0d55b54764421b7156c5";

/// A two member replica set with `a` as primary, once both members are known.
async fn replica_set(connector: ScriptedConnector) -> TestTopology {
    connector.respond("a", primary(&HOSTS, 1, ELECTION_1));
    connector.respond("b", secondary(&HOSTS));
    let test = spawn_topology(connector, &HOSTS, |builder| builder.set_replica_set("rs0"));
    test.wait_for(|description| {
        description.topology_type == TopologyType::ReplicaSetWithPrimary
            && description.servers.values().all(|server| server.is_known())
    })
    .await;
    test
}

fn pool_cleared(events: &[SdamEvent], host: &str) -> bool {
    let expected = address(host);
    events.iter().any(|event| {
        matches!(event, SdamEvent::PoolClearRequested { address, .. } if *address == expected)
    })
}

#[tokio::test(start_paused = true)]
async fn not_writable_primary_marks_the_server_unknown_until_the_next_check() {
    // Arrange
    let connector = ScriptedConnector::default();
    let mut test = replica_set(connector).await;
    test.drain_events();

    // Act
    test.topology
        .handle_application_error(address("a"), OperationError::command(10107, "not master"))
        .await;

    // Assert
    let description = test.topology.description();
    assert_eq!(description.topology_type, TopologyType::ReplicaSetNoPrimary);
    let server = description.server(&address("a")).unwrap();
    assert_eq!(server.server_type, ServerType::Unknown);
    assert!(server.error.as_deref().unwrap().contains("not master"));
    assert!(!pool_cleared(&test.drain_events(), "a"));

    // The monitor is asked to check right away and finds the primary again
    test.wait_for(|description| description.topology_type == TopologyType::ReplicaSetWithPrimary)
        .await;

    test.topology.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_error_requests_a_pool_clear() {
    // Arrange
    let connector = ScriptedConnector::default();
    let mut test = replica_set(connector).await;
    test.drain_events();

    // Act
    test.topology
        .handle_application_error(
            address("a"),
            OperationError::command(91, "The server is in quiesce mode and will shut down"),
        )
        .await;

    // Assert
    assert!(pool_cleared(&test.drain_events(), "a"));
    assert_eq!(
        test.topology.description().topology_type,
        TopologyType::ReplicaSetNoPrimary
    );

    test.topology.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn network_error_clears_the_pool_and_marks_the_server_unknown() {
    // Arrange
    let connector = ScriptedConnector::default();
    let mut test = replica_set(connector).await;
    test.drain_events();

    // Act
    test.topology
        .handle_application_error(address("b"), OperationError::network("connection reset"))
        .await;

    // Assert
    assert!(pool_cleared(&test.drain_events(), "b"));
    let description = test.topology.description();
    assert!(!description.server(&address("b")).unwrap().is_known());
    assert_eq!(description.topology_type, TopologyType::ReplicaSetWithPrimary);

    test.topology.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn network_timeout_after_handshake_is_ignored() {
    // Arrange
    let connector = ScriptedConnector::default();
    let mut test = replica_set(connector).await;
    test.drain_events();
    let before = test.topology.description();

    // Act
    test.topology
        .handle_application_error(
            address("a"),
            OperationError::Network {
                message: "socket timed out".to_string(),
                timeout: true,
                before_handshake: false,
            },
        )
        .await;

    // Assert
    assert_eq!(*test.topology.description(), *before);
    assert!(!pool_cleared(&test.drain_events(), "a"));

    test.topology.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn error_with_stale_topology_version_is_ignored() {
    // Arrange
    let mut reply = primary(&HOSTS, 1, ELECTION_1);
    reply["topologyVersion"] = json!({"processId": {"$oid": PROCESS_ID}, "counter": 5});
    let connector = ScriptedConnector::default();
    connector.respond("a", reply);
    connector.respond("b", secondary(&HOSTS));
    let test = spawn_topology(connector, &HOSTS, |builder| builder.set_replica_set("rs0"));
    test.wait_for(|description| description.primary().is_some())
        .await;
    let stale = OperationError::Command {
        code: Some(10107),
        message: "not master".to_string(),
        topology_version: Some(TopologyVersion {
            process_id: ObjectId::parse_str(PROCESS_ID).unwrap(),
            counter: 4,
        }),
    };

    // Act
    test.topology
        .handle_application_error(address("a"), stale)
        .await;

    // Assert
    let description = test.topology.description();
    assert_eq!(
        description.server(&address("a")).unwrap().server_type,
        ServerType::RsPrimary
    );

    test.topology.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn execute_reports_operation_failures() {
    // Arrange
    let connector = ScriptedConnector::default();
    let test = replica_set(connector).await;

    // Act
    let result = test
        .topology
        .execute(&SelectionCriteria::Write, |server| async move {
            assert_eq!(server.address, address("a"));
            Err::<(), _>(OperationError::command(10107, "not master"))
        })
        .await;

    // Assert
    assert!(matches!(
        result,
        Err(ExecuteError::Operation(OperationError::Command {
            code: Some(10107),
            ..
        }))
    ));
    assert_eq!(
        test.topology.description().topology_type,
        TopologyType::ReplicaSetNoPrimary
    );

    test.topology.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn execute_returns_the_operation_result() {
    // Arrange
    let connector = ScriptedConnector::default();
    let test = replica_set(connector).await;

    // Act
    let result = test
        .topology
        .execute(&SelectionCriteria::Write, |server| async move {
            Ok(server.address.to_string())
        })
        .await;

    // Assert
    assert_eq!(result.unwrap(), "a:27017");

    test.topology.close().await.unwrap();
}
