use std::{collections::HashMap, fmt, time::Duration};

use serde::Serialize;

use crate::{
    hello::ObjectId,
    server_address::ServerAddress,
    server_description::{ServerDescription, ServerType},
};

/// Oldest wire protocol version this crate can talk to.
pub const MIN_SUPPORTED_WIRE_VERSION: i32 = 6;
/// Newest wire protocol version this crate can talk to.
pub const MAX_SUPPORTED_WIRE_VERSION: i32 = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TopologyType {
    Unknown,
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
}

impl TopologyType {
    pub fn is_replica_set(&self) -> bool {
        matches!(
            self,
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary
        )
    }

    fn for_server_type(server_type: ServerType) -> Self {
        match server_type {
            ServerType::Standalone => TopologyType::Single,
            ServerType::Mongos => TopologyType::Sharded,
            ServerType::RsPrimary => TopologyType::ReplicaSetWithPrimary,
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                TopologyType::ReplicaSetNoPrimary
            }
            _ => TopologyType::Unknown,
        }
    }
}

impl fmt::Display for TopologyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Describes why a known server can't be used, if its wire range doesn't overlap ours.
pub(crate) fn wire_compatibility_error(server: &ServerDescription) -> Option<String> {
    if !server.is_known() || server.server_type == ServerType::PossiblePrimary {
        return None;
    }

    if server.min_wire_version > MAX_SUPPORTED_WIRE_VERSION {
        return Some(format!(
            "Server at {} requires wire version {}, but this client only supports up to {}",
            server.address, server.min_wire_version, MAX_SUPPORTED_WIRE_VERSION
        ));
    }

    if server.max_wire_version < MIN_SUPPORTED_WIRE_VERSION {
        return Some(format!(
            "Server at {} reports wire version {}, but this client requires at least {}",
            server.address, server.max_wire_version, MIN_SUPPORTED_WIRE_VERSION
        ));
    }

    None
}

/// An immutable snapshot of the whole deployment.
///
/// New snapshots are produced with [`TopologyDescription::update`]; the previous value is
/// never touched, so readers holding an `Arc` to it keep a consistent view.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyDescription {
    pub topology_type: TopologyType,
    pub servers: HashMap<ServerAddress, ServerDescription>,
    pub set_name: Option<String>,
    pub max_set_version: Option<i32>,
    pub max_election_id: Option<ObjectId>,
    pub logical_session_timeout_minutes: Option<i64>,
    pub compatibility_error: Option<String>,
    pub common_wire_version: Option<i32>,
    pub heartbeat_frequency: Duration,
    pub local_threshold: Duration,
}

impl TopologyDescription {
    pub fn new(
        topology_type: TopologyType,
        seeds: impl IntoIterator<Item = ServerAddress>,
        set_name: Option<String>,
        heartbeat_frequency: Duration,
        local_threshold: Duration,
    ) -> Self {
        let servers = seeds
            .into_iter()
            .map(|address| (address.clone(), ServerDescription::unknown(address)))
            .collect();

        Self {
            topology_type,
            servers,
            set_name,
            max_set_version: None,
            max_election_id: None,
            logical_session_timeout_minutes: None,
            compatibility_error: None,
            common_wire_version: None,
            heartbeat_frequency,
            local_threshold,
        }
        .recompute()
    }

    /// Merges one observation into a copy of this description.
    ///
    /// The merge never fails: replies that don't fit the deployment are dropped or reset to
    /// Unknown and the returned description reflects that.
    pub fn update(&self, server_description: ServerDescription) -> TopologyDescription {
        let mut next = self.clone();
        let address = server_description.address.clone();

        let server_description = match (&next.set_name, &server_description.set_name) {
            (Some(expected), Some(actual)) if expected != actual => {
                tracing::warn!(
                    "Server {} reports replica set `{}` but `{}` was expected",
                    address,
                    actual,
                    expected
                );
                if next.topology_type.is_replica_set() {
                    next.servers.remove(&address);
                    next.check_if_has_primary();
                    return next.recompute();
                }
                ServerDescription::unknown_with_error(
                    address.clone(),
                    format!("replica set name mismatch: expected `{}`, got `{}`", expected, actual),
                )
            }
            _ => server_description,
        };
        let server_type = server_description.server_type;
        next.servers
            .insert(address.clone(), server_description.clone());

        if next.topology_type == TopologyType::Single {
            return next.recompute();
        }

        if next.topology_type == TopologyType::Unknown {
            if server_type == ServerType::Standalone && self.servers.len() != 1 {
                tracing::warn!(
                    "Dropping standalone {} from a topology seeded with {} hosts",
                    address,
                    self.servers.len()
                );
                next.servers.remove(&address);
            } else {
                next.topology_type = TopologyType::for_server_type(server_type);
            }
        }

        if next.topology_type == TopologyType::Sharded
            && !matches!(server_type, ServerType::Mongos | ServerType::Unknown)
        {
            tracing::warn!(
                "Dropping {} from a sharded topology: it reports itself as {}",
                address,
                server_type
            );
            next.servers.remove(&address);
        }

        if next.topology_type == TopologyType::ReplicaSetNoPrimary {
            match server_type {
                ServerType::Mongos | ServerType::Standalone => {
                    next.drop_non_member(&address, server_type);
                }
                ServerType::RsPrimary => next.update_rs_from_primary(&server_description),
                ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                    next.update_rs_without_primary(&server_description)
                }
                _ => {}
            }
        } else if next.topology_type == TopologyType::ReplicaSetWithPrimary {
            match server_type {
                ServerType::Mongos | ServerType::Standalone => {
                    next.drop_non_member(&address, server_type);
                    next.check_if_has_primary();
                }
                ServerType::RsPrimary => next.update_rs_from_primary(&server_description),
                ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                    next.update_rs_with_primary_from_member(&server_description)
                }
                _ => next.check_if_has_primary(),
            }
        }

        next.recompute()
    }

    fn drop_non_member(&mut self, address: &ServerAddress, server_type: ServerType) {
        tracing::warn!(
            "Dropping {} from replica set `{}`: it reports itself as {}",
            address,
            self.set_name.as_deref().unwrap_or_default(),
            server_type
        );
        self.servers.remove(address);
    }

    fn check_if_has_primary(&mut self) {
        self.topology_type = if self
            .servers
            .values()
            .any(|server| server.server_type == ServerType::RsPrimary)
        {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    fn update_rs_from_primary(&mut self, primary: &ServerDescription) {
        if self.set_name.is_none() {
            self.set_name = primary.set_name.clone();
        } else if self.set_name != primary.set_name {
            self.servers.remove(&primary.address);
            self.check_if_has_primary();
            return;
        }

        if let (Some(set_version), Some(election_id)) = (primary.set_version, primary.election_id) {
            if let (Some(max_set_version), Some(max_election_id)) =
                (self.max_set_version, self.max_election_id)
            {
                let reported = (set_version, election_id);
                let recorded = (max_set_version, max_election_id);
                let other_primary = self.servers.values().any(|server| {
                    server.server_type == ServerType::RsPrimary && server.address != primary.address
                });

                if reported < recorded || (reported == recorded && other_primary) {
                    tracing::debug!(
                        "Ignoring stale primary {} with set version {} and election id {}",
                        primary.address,
                        set_version,
                        election_id
                    );
                    self.servers.insert(
                        primary.address.clone(),
                        ServerDescription::unknown(primary.address.clone()),
                    );
                    self.check_if_has_primary();
                    return;
                }
            }
            self.max_election_id = Some(election_id);
        }

        if let Some(set_version) = primary.set_version {
            if self.max_set_version.map_or(true, |max| set_version > max) {
                self.max_set_version = Some(set_version);
            }
        }

        for server in self.servers.values_mut() {
            if server.server_type == ServerType::RsPrimary && server.address != primary.address {
                tracing::info!("Demoting former primary {}", server.address);
                *server = ServerDescription::unknown(server.address.clone());
            }
        }

        let reported = primary.all_hosts();
        for address in reported.iter() {
            if !self.servers.contains_key(address) {
                self.servers
                    .insert(address.clone(), ServerDescription::unknown(address.clone()));
            }
        }
        self.servers.retain(|address, _| reported.contains(address));

        self.check_if_has_primary();
    }

    fn update_rs_with_primary_from_member(&mut self, member: &ServerDescription) {
        if self.set_name != member.set_name || member.me.as_ref().map_or(false, |me| *me != member.address) {
            tracing::warn!(
                "Dropping {}: its replica set name or `me` field doesn't match",
                member.address
            );
            self.servers.remove(&member.address);
        }
        self.check_if_has_primary();
    }

    fn update_rs_without_primary(&mut self, member: &ServerDescription) {
        self.topology_type = TopologyType::ReplicaSetNoPrimary;
        if self.set_name.is_none() {
            self.set_name = member.set_name.clone();
        } else if self.set_name != member.set_name {
            self.servers.remove(&member.address);
            return;
        }

        for address in member.all_hosts() {
            self.servers
                .entry(address.clone())
                .or_insert_with(|| ServerDescription::unknown(address));
        }

        if let Some(hint) = &member.primary {
            if let Some(server) = self.servers.get_mut(hint) {
                if server.server_type == ServerType::Unknown {
                    *server = ServerDescription::possible_primary(hint.clone());
                }
            }
        }

        if member.me.as_ref().map_or(false, |me| *me != member.address) {
            tracing::warn!(
                "Dropping {}: it reports itself as {}",
                member.address,
                member.me.as_ref().map(ToString::to_string).unwrap_or_default()
            );
            self.servers.remove(&member.address);
        }
    }

    /// Recomputes the fields derived from the server map.
    fn recompute(mut self) -> Self {
        self.compatibility_error = self
            .sorted_servers()
            .into_iter()
            .find_map(wire_compatibility_error);

        self.common_wire_version = self
            .servers
            .values()
            .filter(|server| server.is_known() && server.max_wire_version != 0)
            .map(|server| server.max_wire_version)
            .min();

        let mut timeout: Option<i64> = None;
        for server in self.servers.values().filter(|s| s.is_data_bearing()) {
            match server.logical_session_timeout_minutes {
                None => {
                    timeout = None;
                    break;
                }
                Some(minutes) => timeout = Some(timeout.map_or(minutes, |t| t.min(minutes))),
            }
        }
        self.logical_session_timeout_minutes = timeout;

        self
    }

    /// Servers ordered by address.
    pub fn sorted_servers(&self) -> Vec<&ServerDescription> {
        let mut servers = self.servers.values().collect::<Vec<_>>();
        servers.sort_by(|a, b| a.address.cmp(&b.address));
        servers
    }

    pub fn server(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub fn has_server(&self, address: &ServerAddress) -> bool {
        self.servers.contains_key(address)
    }

    pub fn has_known_servers(&self) -> bool {
        self.servers.values().any(ServerDescription::is_known)
    }

    pub fn has_data_bearing_servers(&self) -> bool {
        self.servers.values().any(ServerDescription::is_data_bearing)
    }

    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers
            .values()
            .find(|server| server.server_type == ServerType::RsPrimary)
    }

    /// The error of the first failing server, by address order.
    pub fn first_error(&self) -> Option<&str> {
        self.sorted_servers()
            .into_iter()
            .find_map(|server| server.error.as_deref())
    }

    pub fn supports_sessions(&self) -> bool {
        self.logical_session_timeout_minutes.is_some()
    }

    /// Equal apart from per-heartbeat noise in the member descriptions.
    pub fn is_equivalent_to(&self, other: &TopologyDescription) -> bool {
        self.topology_type == other.topology_type
            && self.set_name == other.set_name
            && self.max_set_version == other.max_set_version
            && self.max_election_id == other.max_election_id
            && self.compatibility_error == other.compatibility_error
            && self.logical_session_timeout_minutes == other.logical_session_timeout_minutes
            && self.servers.len() == other.servers.len()
            && self.servers.iter().all(|(address, server)| {
                other
                    .servers
                    .get(address)
                    .map_or(false, |theirs| server.is_equivalent_to(theirs))
            })
    }
}
