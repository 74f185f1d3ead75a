//! Repeating timers that report into the orchestrator's timer channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// INIT ballot for the next height while joining.
    JoiningInit,
    /// INIT ballot for the next round, or the next height after a commit.
    BroadcastInit,
    BroadcastProposal,
    BroadcastAccept,
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimerId::JoiningInit => "joining-init",
            TimerId::BroadcastInit => "broadcast-init",
            TimerId::BroadcastProposal => "broadcast-proposal",
            TimerId::BroadcastAccept => "broadcast-accept",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub id: TimerId,
    pub generation: u64,
}

pub struct Timers {
    tx: mpsc::Sender<TimerFired>,
    active: Mutex<HashMap<TimerId, (u64, JoinHandle<()>)>>,
    generation: AtomicU64,
}

impl fmt::Debug for Timers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active: Vec<TimerId> = self.lock().keys().copied().collect();
        f.debug_struct("Timers").field("active", &active).finish()
    }
}

impl Timers {
    pub fn new(tx: mpsc::Sender<TimerFired>) -> Self {
        Self { tx, active: Mutex::new(HashMap::new()), generation: AtomicU64::new(0) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TimerId, (u64, JoinHandle<()>)>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fires after `first`, then every `interval` until stopped. Starting a
    /// running timer replaces it.
    pub fn start(&self, id: TimerId, first: Duration, interval: Duration) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(first).await;
            loop {
                if tx.send(TimerFired { id, generation }).await.is_err() {
                    return;
                }
                tokio::time::sleep(interval).await;
            }
        });
        if let Some((_, old)) = self.lock().insert(id, (generation, handle)) {
            old.abort();
        }
        trace!(target: "states", timer = %id, ?first, ?interval, "timer started");
    }

    pub fn stop(&self, id: TimerId) {
        if let Some((_, handle)) = self.lock().remove(&id) {
            handle.abort();
            trace!(target: "states", timer = %id, "timer stopped");
        }
    }

    pub fn stop_all(&self) {
        for (_, (_, handle)) in self.lock().drain() {
            handle.abort();
        }
    }

    pub fn is_running(&self, id: TimerId) -> bool {
        self.lock().contains_key(&id)
    }

    /// A fire sent before its timer was stopped or restarted is stale.
    pub fn is_current(&self, fired: &TimerFired) -> bool {
        self.lock().get(&fired.id).map_or(false, |(g, _)| *g == fired.generation)
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timer_repeats_until_stopped() {
        let (tx, mut rx) = mpsc::channel(16);
        let timers = Timers::new(tx);
        timers.start(TimerId::BroadcastInit, Duration::from_millis(5), Duration::from_millis(5));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.id, TimerId::BroadcastInit);
        assert!(timers.is_current(&first));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.generation, first.generation);

        timers.stop(TimerId::BroadcastInit);
        assert!(!timers.is_current(&second));
        assert!(!timers.is_running(TimerId::BroadcastInit));
    }

    #[tokio::test]
    async fn test_restart_makes_old_fires_stale() {
        let (tx, mut rx) = mpsc::channel(16);
        let timers = Timers::new(tx);
        timers.start(TimerId::BroadcastAccept, Duration::from_millis(1), Duration::from_secs(60));
        let old = rx.recv().await.unwrap();
        timers.start(TimerId::BroadcastAccept, Duration::from_millis(1), Duration::from_secs(60));
        let new = rx.recv().await.unwrap();
        assert!(!timers.is_current(&old));
        assert!(timers.is_current(&new));
    }
}
