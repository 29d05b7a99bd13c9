use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    hello::{ClusterTime, HelloReply, ObjectId, TopologyVersion},
    server_address::ServerAddress,
};

/// What a single node is, as far as the last observation can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ServerType {
    Unknown,
    Standalone,
    Mongos,
    RsPrimary,
    RsSecondary,
    RsArbiter,
    RsGhost,
    RsOther,
    /// Named as primary by another member but not yet checked.
    PossiblePrimary,
}

impl ServerType {
    pub fn is_replica_set_member(&self) -> bool {
        matches!(
            self,
            ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::RsArbiter
                | ServerType::RsOther
                | ServerType::RsGhost
        )
    }
}

impl Default for ServerType {
    fn default() -> Self {
        ServerType::Unknown
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The latest known state of one node.
///
/// Values are immutable snapshots: every heartbeat produces a fresh one and the
/// [`TopologyDescription`](crate::topology_description::TopologyDescription) swaps it in.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescription {
    pub address: ServerAddress,
    pub server_type: ServerType,
    pub round_trip_time: Option<Duration>,
    pub set_name: Option<String>,
    pub set_version: Option<i32>,
    pub election_id: Option<ObjectId>,
    pub hosts: Vec<ServerAddress>,
    pub passives: Vec<ServerAddress>,
    pub arbiters: Vec<ServerAddress>,
    pub primary: Option<ServerAddress>,
    pub me: Option<ServerAddress>,
    pub tags: HashMap<String, String>,
    pub passive: bool,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    pub logical_session_timeout_minutes: Option<i64>,
    pub last_write_date: Option<DateTime<Utc>>,
    pub last_update_time: DateTime<Utc>,
    pub topology_version: Option<TopologyVersion>,
    pub cluster_time: Option<ClusterTime>,
    pub error: Option<String>,
}

impl ServerDescription {
    /// A description for an address nothing is known about yet.
    pub fn unknown(address: ServerAddress) -> Self {
        Self {
            address,
            server_type: ServerType::Unknown,
            round_trip_time: None,
            set_name: None,
            set_version: None,
            election_id: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            primary: None,
            me: None,
            tags: HashMap::new(),
            passive: false,
            min_wire_version: 0,
            max_wire_version: 0,
            logical_session_timeout_minutes: None,
            last_write_date: None,
            last_update_time: Utc::now(),
            topology_version: None,
            cluster_time: None,
            error: None,
        }
    }

    /// A description for a node whose last check failed.
    pub fn unknown_with_error(address: ServerAddress, error: impl fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::unknown(address)
        }
    }

    /// Builds a description from a successful handshake.
    ///
    /// A reply without a truthy `ok` yields an Unknown description carrying the server's error message.
    pub fn from_reply(
        address: ServerAddress,
        reply: HelloReply,
        round_trip_time: Option<Duration>,
    ) -> Self {
        if !reply.is_ok() {
            let message = reply
                .errmsg
                .unwrap_or_else(|| "handshake did not return ok: 1".to_string());
            return Self::unknown_with_error(address, message);
        }

        let server_type = reply.server_type();
        Self {
            address,
            server_type,
            round_trip_time,
            set_name: reply.set_name,
            set_version: reply.set_version,
            election_id: reply.election_id,
            hosts: reply.hosts,
            passives: reply.passives,
            arbiters: reply.arbiters,
            primary: reply.primary,
            me: reply.me,
            tags: reply.tags,
            passive: reply.passive.unwrap_or(false),
            min_wire_version: reply.min_wire_version,
            max_wire_version: reply.max_wire_version,
            logical_session_timeout_minutes: reply.logical_session_timeout_minutes,
            last_write_date: reply.last_write.and_then(|lw| lw.last_write_date),
            last_update_time: Utc::now(),
            topology_version: reply.topology_version,
            cluster_time: reply.cluster_time,
            error: None,
        }
    }

    /// Placeholder for a member another node named as its primary.
    pub fn possible_primary(address: ServerAddress) -> Self {
        Self {
            server_type: ServerType::PossiblePrimary,
            ..Self::unknown(address)
        }
    }

    pub fn is_known(&self) -> bool {
        self.server_type != ServerType::Unknown
    }

    pub fn is_data_bearing(&self) -> bool {
        matches!(
            self.server_type,
            ServerType::Standalone
                | ServerType::Mongos
                | ServerType::RsPrimary
                | ServerType::RsSecondary
        )
    }

    pub fn is_writable(&self) -> bool {
        matches!(
            self.server_type,
            ServerType::Standalone | ServerType::Mongos | ServerType::RsPrimary
        )
    }

    pub fn is_readable(&self) -> bool {
        self.is_writable() || self.server_type == ServerType::RsSecondary
    }

    /// Every member this node reports: hosts, passives and arbiters.
    pub fn all_hosts(&self) -> BTreeSet<ServerAddress> {
        self.hosts
            .iter()
            .chain(self.passives.iter())
            .chain(self.arbiters.iter())
            .cloned()
            .collect()
    }

    /// Compares everything that matters for topology decisions.
    ///
    /// Round trip time, cluster time and the wall-clock timestamps change on every
    /// heartbeat and are ignored.
    pub fn is_equivalent_to(&self, other: &ServerDescription) -> bool {
        let as_set = |hosts: &[ServerAddress]| hosts.iter().cloned().collect::<BTreeSet<_>>();

        self.address == other.address
            && self.server_type == other.server_type
            && self.min_wire_version == other.min_wire_version
            && self.max_wire_version == other.max_wire_version
            && self.me == other.me
            && as_set(&self.hosts) == as_set(&other.hosts)
            && as_set(&self.passives) == as_set(&other.passives)
            && as_set(&self.arbiters) == as_set(&other.arbiters)
            && self.tags == other.tags
            && self.passive == other.passive
            && self.set_name == other.set_name
            && self.set_version == other.set_version
            && self.election_id == other.election_id
            && self.primary == other.primary
            && self.logical_session_timeout_minutes == other.logical_session_timeout_minutes
            && self.topology_version == other.topology_version
            && self.error == other.error
    }
}
