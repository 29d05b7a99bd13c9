use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tokio::sync::oneshot;

use crate::{
    operation_error::OperationError,
    server_address::ServerAddress,
    server_description::ServerDescription,
    topology_description::TopologyType,
    TopologyError, MIN_HEARTBEAT_FREQUENCY,
};

pub const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(10_000);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

#[derive(Debug)]
pub enum TopologyMessage {
    /// A monitor finished a check. Dropped unless `generation` matches the live monitor.
    ServerUpdated {
        description: Box<ServerDescription>,
        generation: u64,
    },
    /// The connection pool saw an operation fail against `address`.
    ApplicationError {
        address: ServerAddress,
        error: OperationError,
        respond_to: oneshot::Sender<()>,
    },
    /// Ask every monitor to check as soon as it is allowed to.
    RequestImmediateCheck,
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

fn deserialize_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn deserialize_optional_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
}

/// Discovery and monitoring settings, named the way connection strings name them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopologyOptions {
    pub hosts: Vec<ServerAddress>,
    #[serde(rename = "heartbeatFrequencyMS", deserialize_with = "deserialize_millis")]
    pub heartbeat_frequency: Duration,
    #[serde(rename = "connectTimeoutMS", deserialize_with = "deserialize_millis")]
    pub connect_timeout: Duration,
    #[serde(
        rename = "socketTimeoutMS",
        deserialize_with = "deserialize_optional_millis"
    )]
    /// Not used by monitors. Carried for the connection pool through
    /// [`Topology::socket_timeout`](crate::Topology::socket_timeout).
    pub socket_timeout: Option<Duration>,
    #[serde(
        rename = "serverSelectionTimeoutMS",
        deserialize_with = "deserialize_millis"
    )]
    pub server_selection_timeout: Duration,
    #[serde(rename = "localThresholdMS", deserialize_with = "deserialize_millis")]
    pub local_threshold: Duration,
    #[serde(alias = "setName")]
    pub replica_set: Option<String>,
    pub direct_connection: Option<bool>,
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            heartbeat_frequency: DEFAULT_HEARTBEAT_FREQUENCY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            socket_timeout: None,
            server_selection_timeout: DEFAULT_SERVER_SELECTION_TIMEOUT,
            local_threshold: DEFAULT_LOCAL_THRESHOLD,
            replica_set: None,
            direct_connection: None,
        }
    }
}

impl TopologyOptions {
    /// Applies `key=value&...` pairs on top of the defaults. Values are percent-decoded, keys
    /// are case-insensitive and unrecognized keys are ignored.
    pub fn from_query_string(query: &str) -> Result<Self, TopologyError> {
        let mut options = TopologyOptions::default();
        let query = query.trim_start_matches('?');

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let invalid = |message: String| TopologyError::InvalidOption {
                option: key.to_string(),
                message,
            };
            if value.is_empty() {
                return Err(invalid("expected key=value".to_string()));
            }

            let millis = || -> Result<Duration, TopologyError> {
                value
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|e| invalid(e.to_string()))
            };

            match key.to_ascii_lowercase().as_str() {
                "heartbeatfrequencyms" => options.heartbeat_frequency = millis()?,
                "connecttimeoutms" => options.connect_timeout = millis()?,
                "sockettimeoutms" => options.socket_timeout = Some(millis()?),
                "serverselectiontimeoutms" => options.server_selection_timeout = millis()?,
                "localthresholdms" => options.local_threshold = millis()?,
                "replicaset" | "setname" => options.replica_set = Some(value.to_string()),
                "directconnection" => {
                    options.direct_connection =
                        Some(value.parse::<bool>().map_err(|e| invalid(e.to_string()))?)
                }
                _ => tracing::debug!("Ignoring unsupported option `{}`", key),
            }
        }

        Ok(options)
    }

    pub(crate) fn validate(&self) -> Result<(), TopologyError> {
        if self.hosts.is_empty() {
            return Err(TopologyError::MissingHostsError);
        }

        if self.direct_connection == Some(true) && self.hosts.len() > 1 {
            return Err(TopologyError::InvalidOption {
                option: "directConnection".to_string(),
                message: "a direct connection can only have one host".to_string(),
            });
        }

        if self.heartbeat_frequency < MIN_HEARTBEAT_FREQUENCY {
            return Err(TopologyError::InvalidOption {
                option: "heartbeatFrequencyMS".to_string(),
                message: format!(
                    "must be at least {}ms",
                    MIN_HEARTBEAT_FREQUENCY.as_millis()
                ),
            });
        }

        Ok(())
    }

    /// The topology type before any server has been heard from.
    pub fn initial_topology_type(&self) -> TopologyType {
        if self.direct_connection == Some(true) {
            TopologyType::Single
        } else if self.replica_set.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        }
    }
}
