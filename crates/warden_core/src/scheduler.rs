//! Auto-stop deadline tracking.
//!
//! One scheduler per process holds the deadline of every running
//! application. A background loop sleeps until the nearest deadline (or
//! until an entry changes), removes each elapsed entry and sends its id to
//! the orchestrator. An entry is removed before it is sent, so each
//! scheduled deadline fires at most once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::models::AppId;

#[derive(Default)]
struct Table {
    entries: HashMap<AppId, DateTime<Utc>>,
    /// Generation of the last local change per application
    touched: HashMap<AppId, u64>,
    generation: u64,
}

impl Table {
    fn touch(&mut self, app_id: AppId) {
        self.generation += 1;
        self.touched.insert(app_id, self.generation);
    }

    fn changed_since(&self, app_id: &AppId, generation: u64) -> bool {
        self.touched.get(app_id).is_some_and(|g| *g > generation)
    }
}

struct Inner {
    table: Mutex<Table>,
    wake: Notify,
    stopped: AtomicBool,
    clock: Arc<dyn Clock>,
}

/// Process-wide deadline table. Cheap to clone.
#[derive(Clone)]
pub struct DeadlineScheduler {
    inner: Arc<Inner>,
}

impl DeadlineScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table::default()),
                wake: Notify::new(),
                stopped: AtomicBool::new(false),
                clock,
            }),
        }
    }

    /// Register `at` as the deadline of `app_id`, replacing any previous one.
    /// A deadline in the past fires on the next loop turn.
    pub fn schedule(&self, app_id: AppId, at: DateTime<Utc>) {
        let previous = {
            let mut table = self.inner.table.lock();
            table.touch(app_id);
            table.entries.insert(app_id, at)
        };
        debug!(
            app_id = %app_id,
            deadline = %at,
            replaced = previous.is_some(),
            "Scheduled auto-stop"
        );
        self.inner.wake.notify_one();
    }

    /// Drop the deadline of `app_id`, returning it if there was one.
    pub fn cancel(&self, app_id: AppId) -> Option<DateTime<Utc>> {
        let removed = {
            let mut table = self.inner.table.lock();
            table.touch(app_id);
            table.entries.remove(&app_id)
        };
        if removed.is_some() {
            debug!(app_id = %app_id, "Cancelled auto-stop");
            self.inner.wake.notify_one();
        }
        removed
    }

    pub fn deadline(&self, app_id: AppId) -> Option<DateTime<Utc>> {
        self.inner.table.lock().entries.get(&app_id).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.table.lock().entries.is_empty()
    }

    /// Counter bumped by every schedule, cancel and firing.
    ///
    /// Read it before taking a snapshot of the store and pass it to
    /// [`replace_all`](Self::replace_all).
    pub fn generation(&self) -> u64 {
        self.inner.table.lock().generation
    }

    /// Replace the table with a snapshot taken at `since`.
    ///
    /// Applications scheduled, cancelled or fired after `since` keep their
    /// current entry, since the snapshot may predate that change.
    pub fn replace_all(&self, since: u64, snapshot: HashMap<AppId, DateTime<Utc>>) {
        {
            let mut table = self.inner.table.lock();
            let mut entries: HashMap<AppId, DateTime<Utc>> = snapshot
                .into_iter()
                .filter(|(id, _)| !table.changed_since(id, since))
                .collect();
            for (id, at) in &table.entries {
                if table.changed_since(id, since) {
                    entries.insert(*id, *at);
                }
            }
            table.entries = entries;
        }
        self.inner.wake.notify_one();
    }

    /// Ask the loop to exit.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Remove and return every entry due at `now`, earliest first.
    fn take_due(&self, now: DateTime<Utc>) -> Vec<AppId> {
        let mut table = self.inner.table.lock();
        let mut due: Vec<(AppId, DateTime<Utc>)> = table
            .entries
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, at)| (*id, *at))
            .collect();
        for (id, _) in &due {
            table.entries.remove(id);
            table.touch(*id);
        }
        due.sort_by_key(|(_, at)| *at);
        due.into_iter().map(|(id, _)| id).collect()
    }

    fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.inner.table.lock().entries.values().min().copied()
    }

    /// Run the firing loop until [`stop`](Self::stop) is called or the
    /// receiver goes away.
    pub async fn run(self, fired: mpsc::Sender<AppId>) {
        debug!("Deadline scheduler started");
        loop {
            if self.is_stopped() {
                break;
            }

            let now = self.inner.clock.now();
            for app_id in self.take_due(now) {
                debug!(app_id = %app_id, "Auto-stop deadline elapsed");
                if fired.send(app_id).await.is_err() {
                    debug!("Deadline receiver closed");
                    return;
                }
            }

            match self.next_deadline() {
                Some(at) => {
                    let wait = (at - self.inner.clock.now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    trace!("Sleeping {:?} until next deadline", wait);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.inner.wake.notified() => {}
                    }
                }
                None => self.inner.wake.notified().await,
            }
        }
        debug!("Deadline scheduler stopped");
    }
}

impl std::fmt::Debug for DeadlineScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineScheduler")
            .field("entries", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
