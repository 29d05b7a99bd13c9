use std::{sync::Arc, time::Duration};

use uuid::Uuid;

use crate::{
    membership::MemberRole, server_address::ServerAddress,
    server_description::ServerDescription, topology_description::TopologyDescription,
};

/// Everything a [`Topology`](crate::Topology) reports through
/// [`subscribe_events`](crate::Topology::subscribe_events).
///
/// Events for one topology are sent in the order the actor observed them. Every variant
/// carries the id of the topology that produced it.
#[derive(Clone, Debug)]
pub enum SdamEvent {
    TopologyOpening {
        topology_id: Uuid,
    },
    TopologyClosed {
        topology_id: Uuid,
    },
    TopologyDescriptionChanged {
        topology_id: Uuid,
        previous: Arc<TopologyDescription>,
        new: Arc<TopologyDescription>,
    },
    ServerOpening {
        topology_id: Uuid,
        address: ServerAddress,
    },
    ServerClosed {
        topology_id: Uuid,
        address: ServerAddress,
    },
    ServerDescriptionChanged {
        topology_id: Uuid,
        address: ServerAddress,
        previous: Arc<ServerDescription>,
        new: Arc<ServerDescription>,
    },
    ServerHeartbeatStarted {
        topology_id: Uuid,
        address: ServerAddress,
        awaited: bool,
    },
    ServerHeartbeatSucceeded {
        topology_id: Uuid,
        address: ServerAddress,
        duration: Duration,
        awaited: bool,
    },
    ServerHeartbeatFailed {
        topology_id: Uuid,
        address: ServerAddress,
        duration: Duration,
        error: String,
        awaited: bool,
    },
    MemberJoined {
        topology_id: Uuid,
        role: MemberRole,
        address: ServerAddress,
    },
    MemberLeft {
        topology_id: Uuid,
        role: MemberRole,
        address: ServerAddress,
    },
    /// The connection pool for `address` should drop its connections.
    PoolClearRequested {
        topology_id: Uuid,
        address: ServerAddress,
    },
}

impl SdamEvent {
    pub fn topology_id(&self) -> Uuid {
        match self {
            SdamEvent::TopologyOpening { topology_id }
            | SdamEvent::TopologyClosed { topology_id }
            | SdamEvent::TopologyDescriptionChanged { topology_id, .. }
            | SdamEvent::ServerOpening { topology_id, .. }
            | SdamEvent::ServerClosed { topology_id, .. }
            | SdamEvent::ServerDescriptionChanged { topology_id, .. }
            | SdamEvent::ServerHeartbeatStarted { topology_id, .. }
            | SdamEvent::ServerHeartbeatSucceeded { topology_id, .. }
            | SdamEvent::ServerHeartbeatFailed { topology_id, .. }
            | SdamEvent::MemberJoined { topology_id, .. }
            | SdamEvent::MemberLeft { topology_id, .. }
            | SdamEvent::PoolClearRequested { topology_id, .. } => *topology_id,
        }
    }
}
