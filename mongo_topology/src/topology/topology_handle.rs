use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::Instant,
};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    connector::Connector,
    events::SdamEvent,
    hello::ClusterTime,
    operation_error::{ExecuteError, OperationError},
    server_address::ServerAddress,
    server_description::ServerDescription,
    server_selection::{self, SelectionCriteria, SelectionError},
    topology_description::TopologyDescription,
    TopologyError,
};

use super::{run_topology_actor, TopologyActor, TopologyBuilder, TopologyMessage, TopologyOptions};

/**
A handle to a running topology.

The backing actor owns one monitor per known server and the current [`TopologyDescription`].
Cloning this handle is cheap and does not start a new actor. When the last handle is dropped
the actor stops and takes its monitors with it.

```rust
# tokio_test::block_on(async {
use mongo_topology::Topology;

let result = Topology::builder().set_hosts(&["localhost:27017"]).build();
// Every topology needs a connector to reach its servers
assert!(result.is_err());
# })
```
*/
#[derive(Clone, Debug)]
pub struct Topology {
    id: Uuid,
    sender: mpsc::Sender<TopologyMessage>,
    description: watch::Receiver<Arc<TopologyDescription>>,
    cluster_time: watch::Receiver<Option<ClusterTime>>,
    events: broadcast::Sender<SdamEvent>,
    server_selection_timeout: Duration,
    socket_timeout: Option<Duration>,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    // Only the builder creates topologies, after validating the options
    pub(crate) fn new(
        options: TopologyOptions,
        connector: Box<dyn Connector>,
        events: broadcast::Sender<SdamEvent>,
    ) -> Self {
        let id = Uuid::new_v4();
        let initial = TopologyDescription::new(
            options.initial_topology_type(),
            options.hosts.iter().cloned(),
            options.replica_set.clone(),
            options.heartbeat_frequency,
            options.local_threshold,
        );
        let (description_sender, description) = watch::channel(Arc::new(initial));
        let (cluster_time_sender, cluster_time) = watch::channel(None);
        let (sender, receiver) = mpsc::channel(8);
        let server_selection_timeout = options.server_selection_timeout;
        let socket_timeout = options.socket_timeout;

        let actor = TopologyActor::new(
            id,
            options,
            connector,
            receiver,
            description_sender,
            cluster_time_sender,
            events.clone(),
        );
        tokio::spawn(run_topology_actor(actor));

        Self {
            id,
            sender,
            description,
            cluster_time,
            events,
            server_selection_timeout,
            socket_timeout,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The configured `socketTimeoutMS`, for the connection pool running operations.
    pub fn socket_timeout(&self) -> Option<Duration> {
        self.socket_timeout
    }

    /// The latest published description.
    pub fn description(&self) -> Arc<TopologyDescription> {
        Arc::clone(&self.description.borrow())
    }

    /// Events from now on. Dropping the receiver unsubscribes.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SdamEvent> {
        self.events.subscribe()
    }

    /// The highest `$clusterTime` any server has reported.
    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.cluster_time.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Asks every monitor to check its server as soon as it is allowed to.
    pub fn request_immediate_check(&self) {
        // A full mailbox already holds work that will publish a new description
        let _ = self.sender.try_send(TopologyMessage::RequestImmediateCheck);
    }

    /// Finds a server for `criteria`, waiting for the topology to change while none qualifies.
    ///
    /// Gives up after the server selection timeout with [`SelectionError::Timeout`], carrying the
    /// last description seen. An incompatible deployment fails right away.
    #[instrument(level = "debug", name = "Topology Handle - Select Server", skip(self))]
    pub async fn select_server(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<ServerDescription, SelectionError> {
        let deadline = Instant::now() + self.server_selection_timeout;
        let mut receiver = self.description.clone();

        loop {
            if self.is_closed() {
                return Err(SelectionError::TopologyClosed);
            }

            let description = Arc::clone(&receiver.borrow_and_update());
            if let Some(server) = server_selection::select_server(&description, criteria)? {
                tracing::debug!("Selected {}", server.address);
                return Ok(server.clone());
            }

            tracing::trace!("No suitable server yet, requesting an immediate check");
            self.request_immediate_check();

            match tokio::time::timeout_at(deadline, receiver.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(SelectionError::TopologyClosed),
                Err(_) => {
                    let description = Arc::clone(&receiver.borrow());
                    let message = match description.first_error() {
                        Some(error) => format!(
                            "no server matched {:?} within {:?}, last error: {}",
                            criteria, self.server_selection_timeout, error
                        ),
                        None => format!(
                            "no server matched {:?} within {:?}",
                            criteria, self.server_selection_timeout
                        ),
                    };
                    tracing::debug!("{}", message);
                    return Err(SelectionError::Timeout {
                        message,
                        description: Box::new(description.as_ref().clone()),
                    });
                }
            }
        }
    }

    /// Reports an operation failure against `address`, so the topology can react to it.
    ///
    /// Returns once the topology has processed the error.
    #[instrument(
        level = "debug",
        name = "Topology Handle - Handle Application Error",
        skip(self)
    )]
    pub async fn handle_application_error(&self, address: ServerAddress, error: OperationError) {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .sender
            .send(TopologyMessage::ApplicationError {
                address,
                error,
                respond_to: tx,
            })
            .await;
        if sent.is_ok() {
            let _ = rx.await;
        }
    }

    /// Selects a server, runs `operation` against it and reports any failure back.
    pub async fn execute<T, F, Fut>(
        &self,
        criteria: &SelectionCriteria,
        operation: F,
    ) -> Result<T, ExecuteError>
    where
        F: FnOnce(ServerDescription) -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let server = self.select_server(criteria).await?;
        let address = server.address.clone();

        match operation(server).await {
            Ok(value) => Ok(value),
            Err(error) => {
                self.handle_application_error(address, error.clone()).await;
                Err(error.into())
            }
        }
    }

    /// Stops all monitors. Closing an already closed topology does nothing.
    #[instrument(level = "debug", name = "Topology Handle - Close", skip(self))]
    pub async fn close(&self) -> Result<(), TopologyError> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(TopologyMessage::Close { respond_to: tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        rx.await.context("Topology actor task has been killed")?;
        // Resolves once the actor has dropped its mailbox
        self.sender.closed().await;
        Ok(())
    }
}
