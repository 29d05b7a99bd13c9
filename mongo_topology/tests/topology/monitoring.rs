use std::time::Duration;

use mongo_topology::{SdamEvent, ServerType, Timestamp};
use serde_json::json;

use crate::helpers::{address, mongos, spawn_topology, standalone, ScriptedConnector};

fn started_heartbeats(events: &[SdamEvent], awaited: bool) -> usize {
    events
        .iter()
        .filter(|event| {
            matches!(event, SdamEvent::ServerHeartbeatStarted { awaited: a, .. } if *a == awaited)
        })
        .count()
}

fn streaming_mongos() -> serde_json::Value {
    let mut reply = mongos();
    reply["topologyVersion"] = json!({"processId": {"$oid": "5f8d0d55b54764421b7156c5"}, "counter": 0});
    reply
}

fn failed_heartbeats(events: &[SdamEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, SdamEvent::ServerHeartbeatFailed { .. }))
        .count()
}

#[tokio::test(start_paused = true)]
async fn known_server_is_retried_once_before_being_reported_unknown() {
    // Arrange
    let connector = ScriptedConnector::default();
    connector.respond("a", standalone());
    let mut test = spawn_topology(connector.clone(), &["a"], |builder| builder);
    test.wait_for(|description| description.has_known_servers())
        .await;
    assert_eq!(connector.calls("a"), 1);
    test.drain_events();

    // Act
    connector.fail("a");
    let description = test
        .wait_for(|description| !description.has_known_servers())
        .await;

    // Assert
    assert_eq!(connector.calls("a"), 3);
    assert_eq!(failed_heartbeats(&test.drain_events()), 2);
    let server = description.server(&address("a")).unwrap();
    assert!(server.error.as_deref().unwrap().contains("connection refused"));
    assert_eq!(server.round_trip_time, None);

    test.topology.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unknown_server_is_not_retried() {
    // Arrange
    let connector = ScriptedConnector::default();
    connector.fail("a");

    // Act
    let mut test = spawn_topology(connector.clone(), &["a"], |builder| builder);
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Assert
    assert_eq!(connector.calls("a"), 1);
    assert_eq!(failed_heartbeats(&test.drain_events()), 1);
    assert!(test
        .topology
        .description()
        .first_error()
        .unwrap()
        .contains("connection refused"));

    test.topology.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn immediate_checks_respect_the_minimum_heartbeat_frequency() {
    // Arrange
    let connector = ScriptedConnector::default();
    connector.respond("a", standalone());
    let test = spawn_topology(connector.clone(), &["a"], |builder| builder);
    test.wait_for(|description| description.has_known_servers())
        .await;

    // Act
    for _ in 0..5 {
        test.topology.request_immediate_check();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let early = connector.calls("a");
    tokio::time::sleep(Duration::from_millis(500)).await;
    let later = connector.calls("a");

    // Assert
    assert_eq!(early, 1);
    assert_eq!(later, 2);

    test.topology.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn servers_are_polled_every_heartbeat() {
    // Arrange
    let connector = ScriptedConnector::default();
    connector.respond("a", mongos());

    // Act
    let test = spawn_topology(connector.clone(), &["a"], |builder| {
        builder.set_heartbeat_frequency(Duration::from_secs(2))
    });
    tokio::time::sleep(Duration::from_millis(6500)).await;

    // Assert
    assert_eq!(connector.calls("a"), 4);

    test.topology.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn streaming_server_is_checked_with_awaitable_handshakes() {
    // Arrange
    let mut reply = streaming_mongos();
    reply["$clusterTime"] = json!({
        "clusterTime": {"$timestamp": {"t": 1700000000, "i": 3}},
        "signature": {"keyId": 0},
    });
    let connector = ScriptedConnector::default();
    connector.respond_after("a", reply, Duration::from_millis(4));
    let mut test = spawn_topology(connector, &["a"], |builder| builder);

    // Act
    tokio::time::sleep(Duration::from_secs(25)).await;

    // Assert
    let events = test.drain_events();
    assert!(events.iter().any(|event| matches!(
        event,
        SdamEvent::ServerHeartbeatSucceeded { awaited: true, .. }
    )));
    let description = test.topology.description();
    let server = description.server(&address("a")).unwrap();
    assert_eq!(server.server_type, ServerType::Mongos);
    assert!(server.round_trip_time.is_some());
    assert_eq!(
        test.topology.cluster_time().map(|time| time.cluster_time),
        Some(Timestamp {
            t: 1700000000,
            i: 3
        })
    );

    test.topology.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_stream_falls_back_to_polling() {
    // Arrange
    let connector = ScriptedConnector::default();
    connector.respond("a", streaming_mongos());
    let mut test = spawn_topology(connector.clone(), &["a"], |builder| builder);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(started_heartbeats(&test.drain_events(), true), 1);

    // Act
    connector.fail("a");
    tokio::time::sleep(Duration::from_secs(14)).await;
    let at_failure = test.drain_events();
    tokio::time::sleep(Duration::from_secs(10)).await;
    let one_heartbeat_later = test.drain_events();
    tokio::time::sleep(Duration::from_secs(10)).await;
    let two_heartbeats_later = test.drain_events();

    // Assert
    let after_stream_failed = at_failure
        .iter()
        .skip_while(|event| {
            !matches!(event, SdamEvent::ServerHeartbeatFailed { awaited: true, .. })
        })
        .skip(1)
        .find(|event| matches!(event, SdamEvent::ServerHeartbeatStarted { .. }));
    assert!(matches!(
        after_stream_failed,
        Some(SdamEvent::ServerHeartbeatStarted { awaited: false, .. })
    ));
    assert_eq!(failed_heartbeats(&at_failure), 2);
    assert!(!test.topology.description().has_known_servers());

    for polled in [one_heartbeat_later, two_heartbeats_later] {
        assert_eq!(started_heartbeats(&polled, false), 1);
        assert_eq!(started_heartbeats(&polled, true), 0);
    }

    test.topology.close().await.unwrap();
}
