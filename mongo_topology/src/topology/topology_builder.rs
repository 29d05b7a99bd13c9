use std::time::Duration;

use tokio::sync::broadcast;
use tracing::instrument;

use crate::{
    connector::Connector, events::SdamEvent, server_address::ServerAddress, Topology,
    TopologyError,
};

use super::TopologyOptions;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct TopologyBuilder {
    connector: Option<Box<dyn Connector>>,
    events: broadcast::Sender<SdamEvent>,
    hosts: Vec<String>,
    options: TopologyOptions,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every option, including hosts previously set through `set_options`.
    pub fn set_options(mut self, options: TopologyOptions) -> Self {
        self.options = options;
        self
    }

    pub fn set_hosts<T>(mut self, hosts: &[T]) -> Self
    where
        T: AsRef<str>,
    {
        for host in hosts {
            self.hosts.push(host.as_ref().to_string());
        }
        self
    }

    pub fn set_connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Box::new(connector));
        self
    }

    pub fn set_replica_set(mut self, set_name: &str) -> Self {
        self.options.replica_set = Some(set_name.to_string());
        self
    }

    pub fn set_direct_connection(mut self, direct_connection: bool) -> Self {
        self.options.direct_connection = Some(direct_connection);
        self
    }

    pub fn set_heartbeat_frequency(mut self, heartbeat_frequency: Duration) -> Self {
        self.options.heartbeat_frequency = heartbeat_frequency;
        self
    }

    pub fn set_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.options.connect_timeout = connect_timeout;
        self
    }

    pub fn set_socket_timeout(mut self, socket_timeout: Duration) -> Self {
        self.options.socket_timeout = Some(socket_timeout);
        self
    }

    pub fn set_server_selection_timeout(mut self, server_selection_timeout: Duration) -> Self {
        self.options.server_selection_timeout = server_selection_timeout;
        self
    }

    pub fn set_local_threshold(mut self, local_threshold: Duration) -> Self {
        self.options.local_threshold = local_threshold;
        self
    }

    /// Subscribes to the events of every topology this builder creates, including the opening
    /// events emitted before [`build`](Self::build) returns.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SdamEvent> {
        self.events.subscribe()
    }

    /// Validates the options, then starts a new topology and returns a handle to it.
    ///
    /// Each call creates an independent topology, so a configured builder can act as a
    /// template. Must be called from within a tokio runtime.
    #[instrument(level = "debug", name = "Build TopologyBuilder", skip(self))]
    pub fn build(&self) -> Result<Topology, TopologyError> {
        let mut options = self.options.clone();
        for host in self.hosts.iter() {
            let address = host.parse::<ServerAddress>().map_err(|e| {
                tracing::error!("{}", e);
                e
            })?;
            if !options.hosts.contains(&address) {
                options.hosts.push(address);
            }
        }

        options.validate().map_err(|e| {
            tracing::error!("{}", e);
            e
        })?;

        let connector = match &self.connector {
            Some(connector) => connector.clone(),
            None => {
                tracing::error!("No connector was supplied");
                return Err(TopologyError::MissingConnectorError);
            }
        };

        tracing::trace!("Topology options: {:?}", &options);

        Ok(Topology::new(options, connector, self.events.clone()))
    }
}

impl Default for TopologyBuilder {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connector: None,
            events,
            hosts: Vec::new(),
            options: TopologyOptions::default(),
        }
    }
}
