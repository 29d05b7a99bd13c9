use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::{connector::Connector, events::SdamEvent, topology::TopologyMessage};

/// Checks are never scheduled closer together than this.
pub const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMessage {
    /// Check as soon as the minimum heartbeat spacing allows.
    RequestCheck,
    /// Abandon streaming and any in-flight handshake, then fall back to polling.
    Reset,
}

/// Everything a monitor needs from the topology that owns it.
#[derive(Debug, Clone)]
pub(crate) struct MonitorSettings {
    pub(crate) topology_id: Uuid,
    pub(crate) connector: Box<dyn Connector>,
    pub(crate) heartbeat_frequency: Duration,
    pub(crate) min_heartbeat_frequency: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) events: broadcast::Sender<SdamEvent>,
    pub(crate) topology: mpsc::Sender<TopologyMessage>,
}
