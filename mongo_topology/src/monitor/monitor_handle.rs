use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

use crate::server_address::ServerAddress;

use super::{run_monitor_actor, MonitorActor, MonitorMessage, MonitorSettings};

/// Owning handle to one server's monitor task.
///
/// Only the topology actor holds these. Dropping the handle aborts the task, including any
/// handshake it has in flight.
#[derive(Debug)]
pub struct MonitorHandle {
    address: ServerAddress,
    generation: u64,
    sender: mpsc::Sender<MonitorMessage>,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub(crate) fn spawn(address: ServerAddress, generation: u64, settings: MonitorSettings) -> Self {
        // One slot per message kind is enough: repeated requests coalesce.
        let (sender, receiver) = mpsc::channel(2);
        let closed = Arc::new(AtomicBool::new(false));
        let actor = MonitorActor::new(
            address.clone(),
            generation,
            receiver,
            settings,
            Arc::clone(&closed),
        );
        let task = tokio::spawn(run_monitor_actor(actor));

        Self {
            address,
            generation,
            sender,
            closed,
            task,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn request_check(&self) {
        self.notify(MonitorMessage::RequestCheck);
    }

    pub fn reset(&self) {
        self.notify(MonitorMessage::Reset);
    }

    fn notify(&self, message: MonitorMessage) {
        match self.sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::trace!("{:?} for {} already pending", message, self.address);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Monitor for {} is no longer running", self.address);
            }
        }
    }

    /// Silences the monitor at once, then aborts its task at the next yield point.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.task.abort();
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.close();
    }
}
