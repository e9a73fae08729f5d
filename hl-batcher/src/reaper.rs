use crate::engine::EngineInner;
use crate::types::SessionId;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Result of one reaper sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub reaped_sessions: usize,
    /// Buffered items dropped without delivery.
    pub discarded_items: usize,
    /// Stale sessions kept because a batch of theirs is still being delivered.
    pub skipped_delivering: usize,
}

impl EngineInner {
    /// Removes every session idle longer than `staleness`, cancelling its timer.
    /// Buffered items are discarded, never flushed.
    pub(crate) fn reap_stale(&self, now: Instant) -> ReapReport {
        let staleness = self.cfg.staleness;
        let mut report = ReapReport::default();
        let mut discarded: Vec<(SessionId, usize)> = Vec::new();

        self.sessions.retain(|session_id, buffer| {
            if buffer.idle_for(now) <= staleness {
                return true;
            }
            if buffer.is_delivering() {
                report.skipped_delivering += 1;
                return true;
            }
            let items = buffer.discard();
            if items > 0 {
                discarded.push((session_id.clone(), items));
            }
            report.reaped_sessions += 1;
            report.discarded_items += items;
            false
        });

        for (session_id, items) in &discarded {
            tracing::warn!(
                session_id = %session_id,
                discarded_items = items,
                "reaped stale session with undelivered items"
            );
        }
        self.stats
            .reaped_sessions
            .fetch_add(report.reaped_sessions as u64, Ordering::Relaxed);
        self.stats
            .discarded_items
            .fetch_add(report.discarded_items as u64, Ordering::Relaxed);
        report
    }
}

pub(crate) fn spawn_reaper(inner: Arc<EngineInner>) -> JoinHandle<()> {
    let period = inner.cfg.reap_interval;
    let shutdown = inner.shutdown.child_token();
    let runtime = inner.runtime.clone();
    runtime.spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("session reaper received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    let report = inner.reap_stale(Instant::now());
                    if report.reaped_sessions > 0 {
                        tracing::info!(
                            reaped_sessions = report.reaped_sessions,
                            discarded_items = report.discarded_items,
                            live_sessions = inner.sessions.len(),
                            "session reaper sweep"
                        );
                    } else {
                        tracing::debug!(live_sessions = inner.sessions.len(), "session reaper sweep");
                    }
                }
            }
        }
    })
}
