//! Replica set and sharded-proxy membership as join/leave events.
use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::{
    events::SdamEvent,
    server_address::ServerAddress,
    server_description::ServerType,
    topology_description::{TopologyDescription, TopologyType},
    Topology,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MemberRole {
    Primary,
    Secondary,
    Arbiter,
    /// A secondary that can never become primary.
    Passive,
    /// A sharded-cluster front-end.
    Proxy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Joined {
        role: MemberRole,
        address: ServerAddress,
    },
    Left {
        role: MemberRole,
        address: ServerAddress,
    },
}

/// Who holds which role in one [`TopologyDescription`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    roles: BTreeMap<ServerAddress, MemberRole>,
}

impl MembershipSnapshot {
    pub fn from_description(description: &TopologyDescription) -> Self {
        let roles = description
            .servers
            .values()
            .filter_map(|server| {
                let role = match server.server_type {
                    ServerType::RsPrimary => MemberRole::Primary,
                    ServerType::RsSecondary if server.passive => MemberRole::Passive,
                    ServerType::RsSecondary => MemberRole::Secondary,
                    ServerType::RsArbiter => MemberRole::Arbiter,
                    ServerType::Mongos if description.topology_type == TopologyType::Sharded => {
                        MemberRole::Proxy
                    }
                    _ => return None,
                };
                Some((server.address.clone(), role))
            })
            .collect();

        Self { roles }
    }

    pub fn role_of(&self, address: &ServerAddress) -> Option<MemberRole> {
        self.roles.get(address).copied()
    }

    pub fn members(&self, role: MemberRole) -> Vec<ServerAddress> {
        self.roles
            .iter()
            .filter(|(_, r)| **r == role)
            .map(|(address, _)| address.clone())
            .collect()
    }

    pub fn primary(&self) -> Option<ServerAddress> {
        self.members(MemberRole::Primary).into_iter().next()
    }

    /// What changed since `previous`: departures first, then arrivals, each ordered by address.
    ///
    /// A member whose role changed leaves its old role and joins its new one.
    pub fn changes_from(&self, previous: &MembershipSnapshot) -> Vec<MembershipChange> {
        let left = previous
            .roles
            .iter()
            .filter(|(address, role)| self.roles.get(*address) != Some(*role))
            .map(|(address, role)| MembershipChange::Left {
                role: *role,
                address: address.clone(),
            });

        let joined = self
            .roles
            .iter()
            .filter(|(address, role)| previous.roles.get(*address) != Some(*role))
            .map(|(address, role)| MembershipChange::Joined {
                role: *role,
                address: address.clone(),
            });

        left.chain(joined).collect()
    }
}

/// Role-oriented view over a [`Topology`].
#[derive(Clone, Debug)]
pub struct Membership {
    topology: Topology,
}

impl Membership {
    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }

    pub fn snapshot(&self) -> MembershipSnapshot {
        MembershipSnapshot::from_description(&self.topology.description())
    }

    pub fn primary(&self) -> Option<ServerAddress> {
        self.snapshot().primary()
    }

    pub fn secondaries(&self) -> Vec<ServerAddress> {
        self.snapshot().members(MemberRole::Secondary)
    }

    pub fn arbiters(&self) -> Vec<ServerAddress> {
        self.snapshot().members(MemberRole::Arbiter)
    }

    pub fn passives(&self) -> Vec<ServerAddress> {
        self.snapshot().members(MemberRole::Passive)
    }

    pub fn proxies(&self) -> Vec<ServerAddress> {
        self.snapshot().members(MemberRole::Proxy)
    }

    /// Join/leave events from now on. Dropping the returned value unsubscribes.
    pub fn subscribe(&self) -> MembershipEvents {
        MembershipEvents {
            topology_id: self.topology.id(),
            receiver: self.topology.subscribe_events(),
        }
    }
}

pub struct MembershipEvents {
    topology_id: Uuid,
    receiver: broadcast::Receiver<SdamEvent>,
}

impl MembershipEvents {
    /// Waits for the next join or leave. Returns `None` once the topology is closed or gone.
    pub async fn recv(&mut self) -> Option<MembershipChange> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.topology_id() != self.topology_id => continue,
                Ok(SdamEvent::MemberJoined { role, address, .. }) => {
                    return Some(MembershipChange::Joined { role, address })
                }
                Ok(SdamEvent::MemberLeft { role, address, .. }) => {
                    return Some(MembershipChange::Left { role, address })
                }
                Ok(SdamEvent::TopologyClosed { .. }) => return None,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Membership subscriber lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
