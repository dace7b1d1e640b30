use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use pricewise_core::config::SessionsConfig;

use crate::sessions::SessionStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub scanned: usize,
    pub reaped: usize,
    pub skipped_busy: usize,
    pub files_released: usize,
}

/// Expires sessions whose last activity is older than the inactivity threshold.
pub struct SessionReaper {
    store: Arc<SessionStore>,
    inactivity: Duration,
    interval: StdDuration,
}

impl SessionReaper {
    pub fn new(store: Arc<SessionStore>, inactivity: Duration, interval: StdDuration) -> Self {
        Self { store, inactivity, interval }
    }

    pub fn from_config(store: Arc<SessionStore>, config: &SessionsConfig) -> Self {
        let hours = i64::try_from(config.inactivity_hours).unwrap_or(i64::MAX / 3600);
        Self::new(
            store,
            Duration::hours(hours.min(24 * 365 * 100)),
            StdDuration::from_secs(config.sweep_interval_secs),
        )
    }

    /// One pass over the store.
    ///
    /// A session whose lock is held is mid-turn and is skipped. For the rest, inactivity is
    /// rechecked while the session lock is held, so an action that landed after the scan keeps
    /// the session alive. A reaped session is retired before its lock is released, so a request
    /// that fetched it just before the sweep sees it as gone.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> ReapReport {
        let cutoff = now - self.inactivity;
        let mut report = ReapReport::default();

        for (id, handle) in self.store.entries().await {
            report.scanned += 1;
            let Ok(mut session) = handle.try_lock() else {
                report.skipped_busy += 1;
                debug!(event_name = "reaper.session_busy", session_id = %id, "session busy");
                continue;
            };
            if !session.is_inactive_since(cutoff) {
                continue;
            }
            if !self.store.remove_if_current(&id, &handle).await {
                continue;
            }
            session.retire();

            let files = session.take_files();
            drop(session);
            let released = self.store.release_files(&id, files).await;
            report.reaped += 1;
            report.files_released += released;

            info!(
                event_name = "reaper.session_reaped",
                session_id = %id,
                correlation_id = "reaper",
                files_released = released,
                "inactive session reaped"
            );
        }

        info!(
            event_name = "reaper.sweep_completed",
            correlation_id = "reaper",
            scanned = report.scanned,
            reaped = report.reaped,
            skipped_busy = report.skipped_busy,
            "session sweep finished"
        );
        report
    }

    /// Runs `sweep_once` on the configured interval until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick fires immediately; nothing can be stale yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once(Utc::now()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(event_name = "reaper.stopped", "session reaper stopped");
        })
    }
}
