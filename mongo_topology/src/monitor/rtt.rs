use std::time::Duration;

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::{connector::Connector, hello::HelloCommand, server_address::ServerAddress};

/// New samples are weighted 1/5 (alpha = 0.2).
const RTT_WEIGHT_DIVISOR: u128 = 5;

/// Exponentially weighted moving average of handshake latency.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RoundTripTime {
    average: Option<Duration>,
}

impl RoundTripTime {
    pub fn add_sample(&mut self, sample: Duration) {
        self.average = Some(match self.average {
            None => sample,
            Some(previous) => {
                let nanos = (previous.as_nanos() * (RTT_WEIGHT_DIVISOR - 1) + sample.as_nanos())
                    / RTT_WEIGHT_DIVISOR;
                Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
            }
        });
    }

    pub fn average(&self) -> Option<Duration> {
        self.average
    }

    pub fn reset(&mut self) {
        self.average = None;
    }
}

/// Measures latency on its own schedule while the monitor is blocked in an awaitable handshake.
///
/// The task is aborted when the pinger is dropped.
#[derive(Debug)]
pub(crate) struct RttPinger {
    latest: watch::Receiver<RoundTripTime>,
    task: JoinHandle<()>,
}

impl RttPinger {
    pub(crate) fn spawn(
        address: ServerAddress,
        connector: Box<dyn Connector>,
        heartbeat_frequency: Duration,
        initial: RoundTripTime,
    ) -> Self {
        let (sender, latest) = watch::channel(initial);

        let task = tokio::spawn(async move {
            let mut rtt = initial;
            let mut interval =
                tokio::time::interval_at(Instant::now() + heartbeat_frequency, heartbeat_frequency);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let command = HelloCommand::default();

            loop {
                interval.tick().await;
                let start = Instant::now();
                match connector.hello(&address, &command).await {
                    Ok(_) => {
                        rtt.add_sample(start.elapsed());
                        if sender.send(rtt).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("RTT measurement for {} failed. Caused by: {}", address, e);
                    }
                }
            }
        });

        Self { latest, task }
    }

    pub(crate) fn current(&self) -> RoundTripTime {
        *self.latest.borrow()
    }
}

impl Drop for RttPinger {
    fn drop(&mut self) {
        self.task.abort();
    }
}
