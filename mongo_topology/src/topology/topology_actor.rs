use std::{collections::HashMap, sync::Arc};

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{instrument, Span};
use uuid::Uuid;

use crate::{
    connector::Connector,
    events::SdamEvent,
    hello::ClusterTime,
    membership::{MembershipChange, MembershipSnapshot},
    monitor::{MonitorHandle, MonitorSettings, MIN_HEARTBEAT_FREQUENCY},
    operation_error::OperationError,
    server_address::ServerAddress,
    server_description::{ServerDescription, ServerType},
    topology_description::TopologyDescription,
};

use super::{TopologyMessage, TopologyOptions};

/// Wire version below which a state change error means the server dropped all connections.
const POOL_CLEARING_MAX_WIRE_VERSION: i32 = 7;

pub struct TopologyActor {
    id: Uuid,
    options: TopologyOptions,
    connector: Box<dyn Connector>,
    receiver: mpsc::Receiver<TopologyMessage>,
    /// Allows monitors to report back to the actor.
    receiver_internal: mpsc::Receiver<TopologyMessage>,
    sender_internal: mpsc::Sender<TopologyMessage>,
    description: Arc<TopologyDescription>,
    description_sender: watch::Sender<Arc<TopologyDescription>>,
    cluster_time: watch::Sender<Option<ClusterTime>>,
    events: broadcast::Sender<SdamEvent>,
    monitors: HashMap<ServerAddress, MonitorHandle>,
    next_generation: u64,
    closed: bool,
}

impl TopologyActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: Uuid,
        options: TopologyOptions,
        connector: Box<dyn Connector>,
        receiver: mpsc::Receiver<TopologyMessage>,
        description_sender: watch::Sender<Arc<TopologyDescription>>,
        cluster_time: watch::Sender<Option<ClusterTime>>,
        events: broadcast::Sender<SdamEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let description = Arc::clone(&description_sender.borrow());
        Self {
            id,
            options,
            connector,
            receiver,
            receiver_internal: rx,
            sender_internal: tx,
            description,
            description_sender,
            cluster_time,
            events,
            monitors: HashMap::new(),
            next_generation: 0,
            closed: false,
        }
    }

    fn emit(&self, event: SdamEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            topology_id: self.id,
            connector: self.connector.clone(),
            heartbeat_frequency: self.options.heartbeat_frequency,
            min_heartbeat_frequency: MIN_HEARTBEAT_FREQUENCY,
            connect_timeout: self.options.connect_timeout,
            events: self.events.clone(),
            topology: self.sender_internal.clone(),
        }
    }

    /// Emits the opening events and starts a monitor per seed.
    fn start(&mut self) {
        tracing::info!(
            "Opening topology {} with seeds {:?}",
            self.id,
            self.options.hosts
        );
        self.emit(SdamEvent::TopologyOpening {
            topology_id: self.id,
        });

        let empty = Arc::new(TopologyDescription::new(
            self.description.topology_type,
            Vec::new(),
            self.description.set_name.clone(),
            self.description.heartbeat_frequency,
            self.description.local_threshold,
        ));
        self.emit(SdamEvent::TopologyDescriptionChanged {
            topology_id: self.id,
            previous: empty,
            new: Arc::clone(&self.description),
        });

        let seeds = self
            .description
            .sorted_servers()
            .into_iter()
            .map(|server| server.address.clone())
            .collect::<Vec<_>>();
        for address in seeds {
            self.start_monitor(address);
        }
    }

    fn start_monitor(&mut self, address: ServerAddress) {
        self.next_generation += 1;
        tracing::debug!(
            "Starting monitor for {} (generation {})",
            address,
            self.next_generation
        );
        self.emit(SdamEvent::ServerOpening {
            topology_id: self.id,
            address: address.clone(),
        });
        let monitor =
            MonitorHandle::spawn(address.clone(), self.next_generation, self.monitor_settings());
        self.monitors.insert(address, monitor);
    }

    fn stop_monitor(&mut self, address: &ServerAddress) {
        if let Some(monitor) = self.monitors.remove(address) {
            tracing::debug!("Stopping monitor for {}", address);
            monitor.close();
            self.emit(SdamEvent::ServerClosed {
                topology_id: self.id,
                address: address.clone(),
            });
        }
    }

    /// Message handler for the TopologyActor
    #[instrument(
        level = "debug",
        name = "Topology Actor - Handle Message",
        skip(self),
        fields(correlation_id)
    )]
    fn handle_message(&mut self, msg: TopologyMessage) {
        Span::current().record("correlation_id", Uuid::new_v4().to_string());
        match msg {
            TopologyMessage::ServerUpdated {
                description,
                generation,
            } => {
                let live_generation = self
                    .monitors
                    .get(&description.address)
                    .map(MonitorHandle::generation);
                if live_generation != Some(generation) {
                    tracing::trace!(
                        "Dropping update for {} from retired monitor generation {}",
                        description.address,
                        generation
                    );
                    return;
                }
                self.apply_server_description(*description);
            }
            TopologyMessage::ApplicationError {
                address,
                error,
                respond_to,
            } => {
                self.handle_application_error(address, error);
                let _ = respond_to.send(());
            }
            TopologyMessage::RequestImmediateCheck => {
                for monitor in self.monitors.values() {
                    monitor.request_check();
                }
            }
            TopologyMessage::Close { respond_to } => {
                self.close();
                let _ = respond_to.send(());
            }
        }
    }

    /// Merges one server description and publishes the result.
    #[instrument(
        level = "debug",
        name = "Topology Actor - Apply Server Description",
        skip(self, server_description),
        fields(address = %server_description.address)
    )]
    fn apply_server_description(&mut self, server_description: ServerDescription) {
        if let Some(cluster_time) = &server_description.cluster_time {
            self.advance_cluster_time(cluster_time);
        }

        let previous = Arc::clone(&self.description);
        let address = server_description.address.clone();
        let next = Arc::new(previous.update(server_description));

        if let (Some(old), Some(new)) = (previous.server(&address), next.server(&address)) {
            if !old.is_equivalent_to(new) {
                tracing::debug!(
                    "{} changed from {} to {}",
                    address,
                    old.server_type,
                    new.server_type
                );
                self.emit(SdamEvent::ServerDescriptionChanged {
                    topology_id: self.id,
                    address: address.clone(),
                    previous: Arc::new(old.clone()),
                    new: Arc::new(new.clone()),
                });
            }
        }

        self.description = Arc::clone(&next);
        self.description_sender.send_replace(Arc::clone(&next));
        self.reconcile_monitors(&previous, &next);

        if !previous.is_equivalent_to(&next) {
            tracing::info!(
                "Topology {} is now {} with {} servers",
                self.id,
                next.topology_type,
                next.servers.len()
            );
            self.emit(SdamEvent::TopologyDescriptionChanged {
                topology_id: self.id,
                previous: Arc::clone(&previous),
                new: Arc::clone(&next),
            });

            let changes = MembershipSnapshot::from_description(&next)
                .changes_from(&MembershipSnapshot::from_description(&previous));
            for change in changes {
                let event = match change {
                    MembershipChange::Joined { role, address } => SdamEvent::MemberJoined {
                        topology_id: self.id,
                        role,
                        address,
                    },
                    MembershipChange::Left { role, address } => SdamEvent::MemberLeft {
                        topology_id: self.id,
                        role,
                        address,
                    },
                };
                self.emit(event);
            }
        }
    }

    /// Starts monitors for new members, stops them for departed ones and chases primary hints.
    fn reconcile_monitors(&mut self, previous: &TopologyDescription, next: &TopologyDescription) {
        let departed = self
            .monitors
            .keys()
            .filter(|address| !next.has_server(address))
            .cloned()
            .collect::<Vec<_>>();
        for address in departed {
            self.stop_monitor(&address);
        }

        let arrived = next
            .sorted_servers()
            .into_iter()
            .filter(|server| !self.monitors.contains_key(&server.address))
            .map(|server| server.address.clone())
            .collect::<Vec<_>>();
        for address in arrived {
            self.start_monitor(address);
        }

        for server in next.servers.values() {
            let newly_hinted = server.server_type == ServerType::PossiblePrimary
                && previous
                    .server(&server.address)
                    .map_or(true, |old| old.server_type != ServerType::PossiblePrimary);
            if newly_hinted {
                if let Some(monitor) = self.monitors.get(&server.address) {
                    tracing::debug!("Checking possible primary {}", server.address);
                    monitor.request_check();
                }
            }
        }
    }

    fn advance_cluster_time(&mut self, cluster_time: &ClusterTime) {
        self.cluster_time.send_if_modified(|current| {
            let newer = current
                .as_ref()
                .map_or(true, |known| cluster_time.cluster_time > known.cluster_time);
            if newer {
                *current = Some(cluster_time.clone());
            }
            newer
        });
    }

    /// Reacts to an error the connection pool saw while running an operation.
    #[instrument(
        level = "debug",
        name = "Topology Actor - Handle Application Error",
        skip(self)
    )]
    fn handle_application_error(&mut self, address: ServerAddress, error: OperationError) {
        let server = match self.description.server(&address) {
            Some(server) => server.clone(),
            None => {
                tracing::debug!("Ignoring error from {}: no longer part of the topology", address);
                return;
            }
        };

        match &error {
            OperationError::Network {
                timeout,
                before_handshake,
                ..
            } => {
                if *timeout && !*before_handshake {
                    return;
                }
                if !*timeout {
                    if let Some(monitor) = self.monitors.get(&address) {
                        monitor.reset();
                    }
                }
                self.request_pool_clear(&address);
                self.mark_server_unknown(&server, &error);
            }
            OperationError::Command { .. } if error.is_state_change_error() => {
                if let (Some(reported), Some(current)) =
                    (error.topology_version(), server.topology_version.as_ref())
                {
                    if !reported.is_more_recent_than(current) {
                        tracing::debug!(
                            "Ignoring stale state change error from {}: {}",
                            address,
                            error
                        );
                        return;
                    }
                }

                if server.max_wire_version <= POOL_CLEARING_MAX_WIRE_VERSION
                    || error.is_node_shutting_down()
                {
                    self.request_pool_clear(&address);
                }
                self.mark_server_unknown(&server, &error);
                if let Some(monitor) = self.monitors.get(&address) {
                    monitor.request_check();
                }
            }
            OperationError::Command { .. } => {}
        }
    }

    fn request_pool_clear(&self, address: &ServerAddress) {
        tracing::debug!("Requesting pool clear for {}", address);
        self.emit(SdamEvent::PoolClearRequested {
            topology_id: self.id,
            address: address.clone(),
        });
    }

    fn mark_server_unknown(&mut self, server: &ServerDescription, error: &OperationError) {
        let mut unknown = ServerDescription::unknown_with_error(server.address.clone(), error);
        unknown.topology_version = error
            .topology_version()
            .copied()
            .or(server.topology_version);
        self.apply_server_description(unknown);
    }

    /// Stops every monitor and emits the closing events.
    fn close(&mut self) {
        if self.closed {
            return;
        }
        tracing::info!("Closing topology {}", self.id);

        let mut addresses = self.monitors.keys().cloned().collect::<Vec<_>>();
        addresses.sort();
        for address in addresses {
            self.stop_monitor(&address);
        }

        self.emit(SdamEvent::TopologyClosed {
            topology_id: self.id,
        });
        self.closed = true;
    }
}

#[instrument(level = "debug", name = "Running Topology Actor", skip(actor), fields(topology_id = %actor.id))]
pub async fn run_topology_actor(mut actor: TopologyActor) {
    actor.start();
    while !actor.closed {
        tokio::select! {
            opt_msg = actor.receiver.recv() => {
                let msg = match opt_msg {
                    Some(msg) => msg,
                    None => break,
                };
                actor.handle_message(msg);
            },
            Some(msg) = actor.receiver_internal.recv() => {
                actor.handle_message(msg);
            }
        }
    }
    actor.close();
}
