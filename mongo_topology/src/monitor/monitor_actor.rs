use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::{sync::mpsc, time::Instant};
use tracing::instrument;

use crate::{
    connector::ConnectorError,
    events::SdamEvent,
    hello::{HelloCommand, HelloReply, TopologyVersion},
    server_address::ServerAddress,
    server_description::ServerDescription,
    topology::TopologyMessage,
};

use super::{
    rtt::{RoundTripTime, RttPinger},
    MonitorMessage, MonitorSettings,
};

enum CheckOutcome {
    Publish(ServerDescription),
    /// A known server failed once; check again right away before reporting it.
    Retry,
}

pub struct MonitorActor {
    address: ServerAddress,
    generation: u64,
    receiver: mpsc::Receiver<MonitorMessage>,
    settings: MonitorSettings,
    /// Set by the handle when it is closed, before the task is aborted.
    closed: Arc<AtomicBool>,
    rtt: RoundTripTime,
    hello_ok: bool,
    /// Set while the server accepts awaitable handshakes.
    topology_version: Option<TopologyVersion>,
    pinger: Option<RttPinger>,
    server_known: bool,
    retrying: bool,
    last_check_started: Option<Instant>,
}

impl MonitorActor {
    pub(crate) fn new(
        address: ServerAddress,
        generation: u64,
        receiver: mpsc::Receiver<MonitorMessage>,
        settings: MonitorSettings,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            address,
            generation,
            receiver,
            settings,
            closed,
            rtt: RoundTripTime::default(),
            hello_ok: false,
            topology_version: None,
            pinger: None,
            server_known: false,
            retrying: false,
            last_check_started: None,
        }
    }

    fn is_streaming(&self) -> bool {
        self.topology_version.is_some()
    }

    fn hello_command(&self) -> HelloCommand {
        HelloCommand {
            hello_ok: self.hello_ok,
            topology_version: self.topology_version,
            max_await_time: self
                .topology_version
                .map(|_| self.settings.heartbeat_frequency),
        }
    }

    fn earliest_next_check(&self) -> Instant {
        let now = Instant::now();
        match self.last_check_started {
            Some(started) => (started + self.settings.min_heartbeat_frequency).max(now),
            None => now,
        }
    }

    /// Drops streaming state so the next check is a plain poll.
    fn reset(&mut self) {
        self.topology_version = None;
        self.pinger = None;
        self.hello_ok = false;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn emit(&self, event: SdamEvent) {
        if self.is_closed() {
            return;
        }
        // No subscribers is fine
        let _ = self.settings.events.send(event);
    }

    fn decode_reply(&self, document: serde_json::Value) -> Result<HelloReply, ConnectorError> {
        let reply: HelloReply =
            serde_json::from_value(document).map_err(|e| ConnectorError::MalformedReply {
                address: self.address.clone(),
                message: e.to_string(),
            })?;

        if !reply.is_ok() {
            return Err(ConnectorError::CommandFailed {
                address: self.address.clone(),
                code: reply.code,
                message: reply
                    .errmsg
                    .unwrap_or_else(|| "handshake did not return ok: 1".to_string()),
            });
        }

        Ok(reply)
    }

    fn process_result(
        &mut self,
        result: Result<serde_json::Value, ConnectorError>,
        started: Instant,
        awaited: bool,
    ) -> CheckOutcome {
        let duration = started.elapsed();
        match result.and_then(|document| self.decode_reply(document)) {
            Ok(reply) => {
                if awaited {
                    if let Some(pinger) = &self.pinger {
                        let measured = pinger.current();
                        if measured.average().is_some() {
                            self.rtt = measured;
                        }
                    }
                } else {
                    self.rtt.add_sample(duration);
                }

                self.hello_ok = reply.hello_ok.unwrap_or(false);
                if reply.supports_streaming() {
                    if self.pinger.is_none() {
                        tracing::debug!("{} supports streaming, switching to awaitable checks", self.address);
                        self.pinger = Some(RttPinger::spawn(
                            self.address.clone(),
                            self.settings.connector.clone(),
                            self.settings.heartbeat_frequency,
                            self.rtt,
                        ));
                    }
                    self.topology_version = reply.topology_version;
                } else {
                    self.topology_version = None;
                    self.pinger = None;
                }

                self.emit(SdamEvent::ServerHeartbeatSucceeded {
                    topology_id: self.settings.topology_id,
                    address: self.address.clone(),
                    duration,
                    awaited,
                });

                let description =
                    ServerDescription::from_reply(self.address.clone(), reply, self.rtt.average());
                self.server_known = description.is_known();
                self.retrying = false;
                CheckOutcome::Publish(description)
            }
            Err(e) => {
                tracing::debug!("Heartbeat to {} failed. Caused by: {}", self.address, e);
                self.emit(SdamEvent::ServerHeartbeatFailed {
                    topology_id: self.settings.topology_id,
                    address: self.address.clone(),
                    duration,
                    error: e.to_string(),
                    awaited,
                });

                self.reset();
                self.rtt.reset();

                if self.server_known && !self.retrying {
                    self.retrying = true;
                    return CheckOutcome::Retry;
                }

                self.retrying = false;
                self.server_known = false;
                CheckOutcome::Publish(ServerDescription::unknown_with_error(
                    self.address.clone(),
                    e,
                ))
            }
        }
    }

    /// Hands a description to the topology. Returns false once the topology is gone.
    async fn publish(&self, description: ServerDescription) -> bool {
        if self.is_closed() {
            return false;
        }
        self.settings
            .topology
            .send(TopologyMessage::ServerUpdated {
                description: Box::new(description),
                generation: self.generation,
            })
            .await
            .is_ok()
    }
}

#[instrument(
    level = "debug",
    name = "Running Monitor Actor",
    skip(actor),
    fields(address = %actor.address, generation = actor.generation)
)]
pub async fn run_monitor_actor(mut actor: MonitorActor) {
    let mut next_check = Instant::now();
    loop {
        if !actor.is_streaming() {
            tokio::select! {
                _ = tokio::time::sleep_until(next_check) => {}
                msg = actor.receiver.recv() => {
                    match msg {
                        Some(MonitorMessage::RequestCheck) => {
                            next_check = next_check.min(actor.earliest_next_check());
                        }
                        Some(MonitorMessage::Reset) => actor.reset(),
                        None => break,
                    }
                    continue;
                }
            }
        }

        let started = Instant::now();
        actor.last_check_started = Some(started);
        let command = actor.hello_command();
        let awaited = command.is_awaitable();
        let deadline = if awaited {
            actor.settings.connect_timeout + actor.settings.heartbeat_frequency
        } else {
            actor.settings.connect_timeout
        };

        actor.emit(SdamEvent::ServerHeartbeatStarted {
            topology_id: actor.settings.topology_id,
            address: actor.address.clone(),
            awaited,
        });
        tracing::trace!("Sending {:?}", command);

        let connector = actor.settings.connector.clone();
        let address = actor.address.clone();
        let hello = async move {
            let result = tokio::time::timeout(deadline, connector.hello(&address, &command)).await;
            match result {
                Ok(result) => result,
                Err(_) => Err(ConnectorError::Timeout { address }),
            }
        };
        tokio::pin!(hello);

        // Requests that arrive while a check is in flight are coalesced into it
        let result = loop {
            tokio::select! {
                result = &mut hello => break Some(result),
                msg = actor.receiver.recv() => match msg {
                    Some(MonitorMessage::RequestCheck) => continue,
                    Some(MonitorMessage::Reset) => break None,
                    None => return,
                }
            }
        };

        let result = match result {
            Some(result) => result,
            None => {
                tracing::debug!("Monitor reset while a check was in flight");
                actor.reset();
                next_check = actor.earliest_next_check();
                continue;
            }
        };

        match actor.process_result(result, started, awaited) {
            CheckOutcome::Retry => {
                tracing::debug!("Retrying check of {} immediately", actor.address);
                next_check = Instant::now();
            }
            CheckOutcome::Publish(description) => {
                if !actor.publish(description).await {
                    break;
                }
                next_check = started + actor.settings.heartbeat_frequency;
            }
        }
    }
    tracing::debug!("Monitor for {} stopped", actor.address);
}
