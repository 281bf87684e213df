use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use uuid::Uuid;

#[derive(Debug)]
enum Schedule<K> {
    Set { key: K, after: Duration },
    Clear { key: K },
}

/// Cheap handle used to (re)schedule or clear deadlines.
#[derive(Debug)]
pub struct TimeoutHandle<K = Uuid> {
    tx: mpsc::UnboundedSender<Schedule<K>>,
}

impl<K> Clone for TimeoutHandle<K> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<K: Debug> TimeoutHandle<K> {
    /// Arm (or move) the deadline of `key`. Past deadlines fire at once.
    pub fn schedule(&self, key: K, deadline: DateTime<Utc>) {
        let after = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.schedule_in(key, after);
    }

    pub fn schedule_in(&self, key: K, after: Duration) {
        if let Err(mpsc::error::SendError(schedule)) = self.tx.send(Schedule::Set { key, after }) {
            tracing::warn!(?schedule, "Timeout supervisor stopped, deadline not armed");
        }
    }

    pub fn clear(&self, key: K) {
        let _ = self.tx.send(Schedule::Clear { key });
    }
}

/// Tracks one deadline per key and reports the keys whose deadline passed.
///
/// The supervisor never changes a run. It only sends the key on the
/// expiry channel; the coordinator then acts on whatever is still in
/// flight, under each run's lock, so a completion racing the deadline is
/// applied exactly once.
pub struct TimeoutSupervisor<K = Uuid> {
    kind: &'static str,
    commands: mpsc::UnboundedReceiver<Schedule<K>>,
    expired: mpsc::Sender<K>,
}

impl<K> TimeoutSupervisor<K>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
{
    /// `kind` names the deadlines in logs, e.g. "job deadline".
    pub fn new(kind: &'static str, expired: mpsc::Sender<K>) -> (Self, TimeoutHandle<K>) {
        let (tx, commands) = mpsc::unbounded_channel();
        (
            Self {
                kind,
                commands,
                expired,
            },
            TimeoutHandle { tx },
        )
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let TimeoutSupervisor {
            kind,
            mut commands,
            expired,
        } = self;
        let mut queue: DelayQueue<K> = DelayQueue::new();
        let mut keys: HashMap<K, delay_queue::Key> = HashMap::new();

        enum Wake<K> {
            Command(Schedule<K>),
            Expired(K),
        }

        loop {
            let wake = tokio::select! {
                _ = shutdown.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => Wake::Command(cmd),
                    None => break,
                },
                Some(entry) = std::future::poll_fn(|cx| queue.poll_expired(cx)) => {
                    Wake::Expired(entry.into_inner())
                }
            };

            match wake {
                Wake::Command(Schedule::Set { key, after }) => {
                    match keys.get(&key) {
                        Some(slot) => queue.reset(slot, after),
                        None => {
                            let slot = queue.insert(key.clone(), after);
                            keys.insert(key.clone(), slot);
                        }
                    }
                    tracing::debug!(kind, key = ?key, remaining_ms = after.as_millis() as u64, "Deadline armed");
                }
                Wake::Command(Schedule::Clear { key }) => {
                    if let Some(slot) = keys.remove(&key) {
                        queue.remove(&slot);
                        tracing::debug!(kind, key = ?key, "Deadline cleared");
                    }
                }
                Wake::Expired(key) => {
                    keys.remove(&key);
                    tracing::debug!(kind, key = ?key, "Deadline reached");
                    if expired.send(key).await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(kind, "Timeout supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> (TimeoutHandle, mpsc::Receiver<Uuid>, CancellationToken) {
        let (tx, rx) = mpsc::channel(16);
        let (supervisor, handle) = TimeoutSupervisor::new("job deadline", tx);
        let shutdown = CancellationToken::new();
        tokio::spawn(supervisor.run(shutdown.clone()));
        (handle, rx, shutdown)
    }

    fn in_ms(ms: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(ms)
    }

    #[tokio::test]
    async fn reports_expired_jobs_in_deadline_order() {
        let (handle, mut rx, _shutdown) = start();
        let late = Uuid::new_v4();
        let early = Uuid::new_v4();

        handle.schedule(late, in_ms(120));
        handle.schedule(early, in_ms(20));

        assert_eq!(rx.recv().await, Some(early));
        assert_eq!(rx.recv().await, Some(late));
    }

    #[tokio::test]
    async fn past_deadline_fires_immediately() {
        let (handle, mut rx, _shutdown) = start();
        let job = Uuid::new_v4();
        handle.schedule(job, in_ms(-1_000));

        let fired = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert_eq!(fired.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn cleared_deadline_never_fires() {
        let (handle, mut rx, _shutdown) = start();
        let cleared = Uuid::new_v4();
        let kept = Uuid::new_v4();

        handle.schedule(cleared, in_ms(20));
        handle.clear(cleared);
        handle.schedule(kept, in_ms(60));

        assert_eq!(rx.recv().await, Some(kept));
        let nothing = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn rescheduling_moves_the_deadline() {
        let (handle, mut rx, _shutdown) = start();
        let job = Uuid::new_v4();
        let other = Uuid::new_v4();

        handle.schedule(job, in_ms(20));
        handle.schedule(job, in_ms(150));
        handle.schedule(other, in_ms(60));

        assert_eq!(rx.recv().await, Some(other));
        assert_eq!(rx.recv().await, Some(job));
    }

    #[tokio::test]
    async fn relative_deadlines_use_any_key() {
        let (tx, mut rx) = mpsc::channel(16);
        let (supervisor, handle) = TimeoutSupervisor::new("reorder window", tx);
        let shutdown = CancellationToken::new();
        tokio::spawn(supervisor.run(shutdown.clone()));

        handle.schedule_in(("web1", 1), Duration::from_millis(80));
        handle.schedule_in(("web1", 0), Duration::from_millis(20));
        handle.schedule_in(("web2", 0), Duration::from_millis(40));
        handle.clear(("web2", 0));

        assert_eq!(rx.recv().await, Some(("web1", 0)));
        assert_eq!(rx.recv().await, Some(("web1", 1)));
    }

    #[tokio::test]
    async fn shutdown_stops_supervisor() {
        let (handle, mut rx, shutdown) = start();
        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.schedule(Uuid::new_v4(), in_ms(0));
        assert_eq!(rx.recv().await, None);
    }
}
