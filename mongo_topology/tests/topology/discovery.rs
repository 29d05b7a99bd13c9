use std::time::Duration;

use mongo_topology::{
    MemberRole, Membership, MembershipChange, SdamEvent, ServerType, TopologyType,
};

use crate::helpers::{
    address, primary, secondary, spawn_topology, standalone, ScriptedConnector, ELECTION_1,
};

const MEMBERS: [&str; 3] = ["a:27017", "b:27017", "c:27017"];

#[tokio::test(start_paused = true)]
async fn replica_set_is_discovered_from_a_single_seed() {
    // Arrange
    let connector = ScriptedConnector::default();
    connector.respond("a", primary(&MEMBERS, 1, ELECTION_1));
    connector.respond("b", secondary(&MEMBERS));
    connector.respond("c", secondary(&MEMBERS));

    // Act
    let mut test = spawn_topology(connector, &["a"], |builder| builder.set_replica_set("rs0"));
    let description = test
        .wait_for(|description| {
            description.topology_type == TopologyType::ReplicaSetWithPrimary
                && description
                    .servers
                    .values()
                    .filter(|server| server.server_type == ServerType::RsSecondary)
                    .count()
                    == 2
        })
        .await;

    // Assert
    assert_eq!(description.servers.len(), 3);
    assert_eq!(
        description.primary().map(|server| server.address.clone()),
        Some(address("a"))
    );

    let events = test.drain_events();
    assert!(matches!(events.first(), Some(SdamEvent::TopologyOpening { .. })));
    let opened = events
        .iter()
        .filter_map(|event| match event {
            SdamEvent::ServerOpening { address, .. } => Some(address.clone()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(opened, vec![address("a"), address("b"), address("c")]);
    assert!(events
        .iter()
        .all(|event| event.topology_id() == test.topology.id()));

    test.topology.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn host_removed_by_the_primary_is_no_longer_monitored() {
    // Arrange
    let connector = ScriptedConnector::default();
    connector.respond("a", primary(&MEMBERS, 1, ELECTION_1));
    connector.respond("b", secondary(&MEMBERS));
    connector.respond("c", secondary(&MEMBERS));
    let mut test = spawn_topology(connector.clone(), &["a"], |builder| {
        builder.set_replica_set("rs0")
    });
    test.wait_for(|description| description.servers.len() == 3)
        .await;

    // Act
    connector.respond("a", primary(&MEMBERS[..2], 2, ELECTION_1));
    connector.respond("b", secondary(&MEMBERS[..2]));
    test.wait_for(|description| !description.has_server(&address("c")))
        .await;
    let calls = connector.calls("c");
    tokio::time::sleep(Duration::from_secs(60)).await;

    // Assert
    assert_eq!(connector.calls("c"), calls);
    let removed = address("c");
    assert!(test.drain_events().iter().any(|event| matches!(
        event,
        SdamEvent::ServerClosed { address, .. } if *address == removed
    )));

    test.topology.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn direct_connection_stays_single() {
    // Arrange
    let connector = ScriptedConnector::default();
    connector.respond("a", secondary(&MEMBERS));

    // Act
    let test = spawn_topology(connector.clone(), &["a"], |builder| {
        builder.set_direct_connection(true)
    });
    let description = test
        .wait_for(|description| description.has_known_servers())
        .await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    // Assert
    assert_eq!(description.topology_type, TopologyType::Single);
    assert_eq!(test.topology.description().servers.len(), 1);
    assert_eq!(connector.calls("b"), 0);

    test.topology.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn standalone_among_several_seeds_is_dropped() {
    // Arrange
    let connector = ScriptedConnector::default();
    connector.respond("a", standalone());
    connector.fail("b");

    // Act
    let test = spawn_topology(connector, &["a", "b"], |builder| builder);
    let description = test
        .wait_for(|description| !description.has_server(&address("a")))
        .await;

    // Assert
    assert_eq!(description.topology_type, TopologyType::Unknown);
    assert!(description.has_server(&address("b")));

    test.topology.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn membership_reports_failover() {
    // Arrange
    let connector = ScriptedConnector::default();
    connector.respond("a", primary(&MEMBERS, 1, ELECTION_1));
    connector.respond("b", secondary(&MEMBERS));
    connector.respond("c", secondary(&MEMBERS));
    let test = spawn_topology(connector.clone(), &["a", "b", "c"], |builder| {
        builder.set_replica_set("rs0")
    });
    let membership = Membership::new(test.topology.clone());
    test.wait_for(|description| {
        description.topology_type == TopologyType::ReplicaSetWithPrimary
            && description.has_known_servers()
            && description.servers.values().all(|server| server.is_known())
    })
    .await;
    assert_eq!(membership.primary(), Some(address("a")));
    let mut changes = membership.subscribe();

    // Act
    connector.fail("a");
    let change = tokio::time::timeout(Duration::from_secs(60), changes.recv())
        .await
        .unwrap();

    // Assert
    assert_eq!(
        change,
        Some(MembershipChange::Left {
            role: MemberRole::Primary,
            address: address("a"),
        })
    );
    assert_eq!(membership.primary(), None);
    assert_eq!(
        membership.secondaries(),
        vec![address("b"), address("c")]
    );

    test.topology.close().await.unwrap();
    assert_eq!(changes.recv().await, None);
}
