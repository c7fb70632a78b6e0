//! Live status fan-out.
//!
//! One broadcast channel per job. Every subscriber first receives the latest
//! known snapshot, then each later change. Snapshots that would move the
//! phase backwards are dropped, and a subscription ends right after the
//! terminal snapshot.

use addlidar_core::prelude::*;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Default)]
pub struct StatusHub {
    channels: Arc<Mutex<HashMap<String, JobChannel>>>,
}

struct JobChannel {
    /// Dropped once the job is terminal so receivers close after draining.
    sender: Option<broadcast::Sender<StatusSnapshot>>,
    last: StatusSnapshot,
}

impl JobChannel {
    fn new(snapshot: StatusSnapshot) -> Self {
        let sender = (!snapshot.is_terminal()).then(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Self {
            sender,
            last: snapshot,
        }
    }
}

impl StatusHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, JobChannel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `snapshot` as the latest and pushes it to current subscribers.
    ///
    /// Returns the number of subscribers reached.
    pub fn publish(&self, snapshot: StatusSnapshot) -> usize {
        let mut channels = self.channels();
        let Some(channel) = channels.get_mut(&snapshot.job_name) else {
            channels.insert(snapshot.job_name.clone(), JobChannel::new(snapshot));
            return 0;
        };

        if channel.last.is_terminal() {
            debug!(job_name = %snapshot.job_name, "Ignoring update after terminal status");
            return 0;
        }
        if snapshot.phase.rank() < channel.last.phase.rank() {
            debug!(
                job_name = %snapshot.job_name,
                from = %channel.last.phase,
                to = %snapshot.phase,
                "Ignoring phase regression"
            );
            return 0;
        }

        let terminal = snapshot.is_terminal();
        channel.last = snapshot.clone();
        let reached = match &channel.sender {
            // No receivers is not an error.
            Some(sender) => sender.send(snapshot).unwrap_or(0),
            None => 0,
        };
        if terminal {
            channel.sender = None;
        }
        reached
    }

    /// Subscribes to a job. `current` seeds the channel if nothing was published yet.
    pub fn subscribe(&self, current: StatusSnapshot) -> StatusSubscription {
        let mut channels = self.channels();
        let channel = channels
            .entry(current.job_name.clone())
            .or_insert_with(|| JobChannel::new(current));

        StatusSubscription {
            pending: Some(channel.last.clone()),
            receiver: channel.sender.as_ref().map(broadcast::Sender::subscribe),
            last_rank: None,
            done: false,
        }
    }

    pub fn latest(&self, job_name: &str) -> Option<StatusSnapshot> {
        self.channels().get(job_name).map(|c| c.last.clone())
    }

    pub fn subscriber_count(&self, job_name: &str) -> usize {
        self.channels()
            .get(job_name)
            .and_then(|c| c.sender.as_ref())
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Forgets the job. Open subscriptions close once drained.
    pub fn remove(&self, job_name: &str) {
        self.channels().remove(job_name);
    }
}

pub struct StatusSubscription {
    pending: Option<StatusSnapshot>,
    receiver: Option<broadcast::Receiver<StatusSnapshot>>,
    last_rank: Option<u8>,
    done: bool,
}

impl StatusSubscription {
    /// Next snapshot, or [`None`] after the terminal one was delivered.
    ///
    /// Cancel safe.
    pub async fn next(&mut self) -> Option<StatusSnapshot> {
        loop {
            if self.done {
                return None;
            }

            let snapshot = match self.pending.take() {
                Some(snapshot) => snapshot,
                None => {
                    let receiver = self.receiver.as_mut()?;
                    match receiver.recv().await {
                        Ok(snapshot) => snapshot,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Status subscriber lagged behind");
                            continue;
                        }
                        Err(RecvError::Closed) => {
                            self.done = true;
                            return None;
                        }
                    }
                }
            };

            let rank = snapshot.phase.rank();
            if self.last_rank.is_some_and(|last| rank < last) {
                continue;
            }
            self.last_rank = Some(rank);
            if snapshot.is_terminal() {
                self.done = true;
            }
            return Some(snapshot);
        }
    }

    pub fn into_stream(self) -> BoxStream<'static, StatusSnapshot> {
        stream::unfold(self, |mut subscription| async move {
            let snapshot = subscription.next().await?;
            Some((snapshot, subscription))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot(phase: Phase, state: JobState) -> StatusSnapshot {
        StatusSnapshot {
            job_name: "lidar-job-a".into(),
            phase,
            state,
            message: format!("{phase}"),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn late_subscriber_gets_latest_first() {
        let hub = StatusHub::new();
        hub.publish(snapshot(Phase::Pending, JobState::Running));
        hub.publish(snapshot(Phase::Running, JobState::Running));

        let mut sub = hub.subscribe(snapshot(Phase::Pending, JobState::Running));
        assert_eq!(sub.next().await.unwrap().phase, Phase::Running);

        hub.publish(snapshot(Phase::Succeeded, JobState::Succeeded));
        assert_eq!(sub.next().await.unwrap().phase, Phase::Succeeded);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn subscribers_see_the_same_terminal_snapshot() {
        let hub = StatusHub::new();
        hub.publish(snapshot(Phase::Running, JobState::Running));
        let mut a = hub.subscribe(snapshot(Phase::Pending, JobState::Running));
        let mut b = hub.subscribe(snapshot(Phase::Pending, JobState::Running));
        assert_eq!(hub.subscriber_count("lidar-job-a"), 2);

        let terminal = snapshot(Phase::Failed, JobState::Failed);
        assert_eq!(hub.publish(terminal.clone()), 2);

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.next().await.unwrap().phase, Phase::Running);
            assert_eq!(sub.next().await.unwrap(), terminal);
            assert!(sub.next().await.is_none());
        }
    }

    #[tokio::test]
    async fn regressions_are_dropped() {
        let hub = StatusHub::new();
        hub.publish(snapshot(Phase::Running, JobState::Running));
        let mut sub = hub.subscribe(snapshot(Phase::Running, JobState::Running));

        assert_eq!(hub.publish(snapshot(Phase::Pending, JobState::Running)), 0);
        assert_eq!(hub.latest("lidar-job-a").unwrap().phase, Phase::Running);

        hub.publish(snapshot(Phase::Succeeded, JobState::Succeeded));
        let mut phases = Vec::new();
        while let Some(snapshot) = sub.next().await {
            phases.push(snapshot.phase);
        }
        assert_eq!(phases, [Phase::Running, Phase::Succeeded]);
    }

    #[tokio::test]
    async fn terminal_job_yields_once_and_closes() {
        let hub = StatusHub::new();
        let mut sub = hub.subscribe(snapshot(Phase::Succeeded, JobState::Succeeded));
        assert_eq!(sub.next().await.unwrap().phase, Phase::Succeeded);
        assert!(sub.next().await.is_none());

        // Nothing moves a finished job.
        hub.publish(snapshot(Phase::Running, JobState::Running));
        assert_eq!(hub.latest("lidar-job-a").unwrap().phase, Phase::Succeeded);
    }

    #[tokio::test]
    async fn removing_the_job_closes_subscribers() {
        let hub = StatusHub::new();
        hub.publish(snapshot(Phase::Running, JobState::Running));
        let mut sub = hub.subscribe(snapshot(Phase::Running, JobState::Running));
        assert!(sub.next().await.is_some());

        hub.remove("lidar-job-a");
        assert!(sub.next().await.is_none());
        assert!(hub.latest("lidar-job-a").is_none());
    }
}
