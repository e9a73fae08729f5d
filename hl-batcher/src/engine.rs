use crate::buffer::{Delivery, PendingTimer, SessionBuffer, compose_batch};
use crate::config::EngineConfig;
use crate::error::{BatcherError, Result, panic_payload_to_string};
use crate::reaper::{self, ReapReport};
use crate::sink::FlushSink;
use crate::types::{FlushTrigger, FlushedBatch, IngestResult, SessionId};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Debounces inbound items per session and flushes them as batches.
///
/// Each session flushes when its buffer reaches `threshold` items (inline, on
/// the ingesting call) or when `timeout` passes without a new item (on a timer
/// task). Every ingest re-arms the session's single timer. A background reaper
/// discards sessions idle longer than `staleness` without delivering them.
pub struct DebounceEngine {
    inner: Arc<EngineInner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct EngineInner {
    pub(crate) cfg: EngineConfig,
    pub(crate) sessions: DashMap<SessionId, SessionBuffer>,
    sink: Arc<dyn FlushSink>,
    pub(crate) runtime: Handle,
    next_generation: AtomicU64,
    pub(crate) shutdown: CancellationToken,
    pub(crate) stats: EngineStats,
}

#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    ingested: AtomicU64,
    threshold_flushes: AtomicU64,
    timeout_flushes: AtomicU64,
    empty_flushes: AtomicU64,
    truncated_batches: AtomicU64,
    sink_failures: AtomicU64,
    pub(crate) reaped_sessions: AtomicU64,
    pub(crate) discarded_items: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatsSnapshot {
    pub ingested: u64,
    pub threshold_flushes: u64,
    pub timeout_flushes: u64,
    pub empty_flushes: u64,
    pub truncated_batches: u64,
    pub sink_failures: u64,
    pub reaped_sessions: u64,
    pub discarded_items: u64,
    pub live_sessions: usize,
}

impl DebounceEngine {
    /// Builds the engine and starts its reaper. Must be called inside a tokio
    /// runtime; timers and the reaper run on that runtime.
    pub fn new(cfg: EngineConfig, sink: Arc<dyn FlushSink>) -> Result<Self> {
        cfg.validate()?;
        let runtime = Handle::try_current().map_err(|_| BatcherError::NoRuntime)?;
        let inner = Arc::new(EngineInner {
            cfg,
            sessions: DashMap::new(),
            sink,
            runtime,
            next_generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            stats: EngineStats::default(),
        });
        let reaper = reaper::spawn_reaper(Arc::clone(&inner));
        tracing::info!(
            threshold = inner.cfg.threshold,
            timeout_ms = inner.cfg.timeout.as_millis() as u64,
            staleness_ms = inner.cfg.staleness.as_millis() as u64,
            max_batch_length = inner.cfg.max_batch_length,
            reap_interval_ms = inner.cfg.reap_interval.as_millis() as u64,
            "debounce engine started"
        );
        Ok(Self {
            inner,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.cfg
    }

    /// Buffers `content` for `session_id`.
    ///
    /// When the append fills the buffer to `threshold`, the session's timer is
    /// cancelled, the buffer drained, and the batch handed to the sink before
    /// this call returns (unless an earlier batch of the same session is still
    /// being delivered, in which case it is queued behind it). Otherwise the
    /// session's timer is re-armed to fire at `now + timeout`.
    pub async fn ingest(
        &self,
        session_id: impl Into<SessionId>,
        content: impl Into<String>,
        now: Instant,
    ) -> Result<IngestResult> {
        let session_id = session_id.into();
        let (result, delivery) = self.accept(session_id.clone(), content.into(), now)?;
        if let Some(task) = delivery {
            if let Err(e) = task.await {
                tracing::error!(error = %e, session_id = %session_id, "flush delivery task failed");
            }
        }
        Ok(result)
    }

    /// Same as [`DebounceEngine::ingest`], but a threshold flush is delivered on
    /// a background task and this call never waits on the sink. Items of one
    /// session are buffered in call order.
    pub fn submit(
        &self,
        session_id: impl Into<SessionId>,
        content: impl Into<String>,
        now: Instant,
    ) -> Result<IngestResult> {
        let (result, _detached) = self.accept(session_id.into(), content.into(), now)?;
        Ok(result)
    }

    fn accept(
        &self,
        session_id: SessionId,
        content: String,
        now: Instant,
    ) -> Result<(IngestResult, Option<JoinHandle<()>>)> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BatcherError::ShutDown);
        }
        self.inner.stats.ingested.fetch_add(1, Ordering::Relaxed);

        let (result, must_deliver, buffered) = {
            let mut buffer = self
                .inner
                .sessions
                .entry(session_id.clone())
                .or_insert_with(|| SessionBuffer::new(now));
            let buffered = buffer.push(content, now);
            if buffered >= self.inner.cfg.threshold {
                buffer.cancel_timer();
                let items = buffer.drain(now);
                let delivery = self
                    .inner
                    .compose(&session_id, items, FlushTrigger::Threshold);
                let result = match &delivery {
                    Delivery::Batch(batch) => IngestResult::Flushed(batch.clone()),
                    Delivery::Empty { .. } => IngestResult::FlushedEmpty,
                };
                (result, buffer.enqueue(delivery), buffered)
            } else {
                let timer = self.inner.schedule_timeout(&session_id, now);
                buffer.arm(timer);
                (IngestResult::Buffered, false, buffered)
            }
        };

        if !result.is_flush() {
            tracing::debug!(session_id = %session_id, buffered, "message buffered, flush timer re-armed");
        }
        if !must_deliver {
            return Ok((result, None));
        }
        let inner = Arc::clone(&self.inner);
        let task = self
            .inner
            .runtime
            .spawn(async move { inner.deliver(&session_id).await });
        Ok((result, Some(task)))
    }

    /// Items currently buffered (not yet flushed) for `session_id`.
    pub fn pending_items(&self, session_id: &str) -> usize {
        self.inner
            .sessions
            .get(session_id)
            .map(|buffer| buffer.len())
            .unwrap_or(0)
    }

    /// Items buffered across all sessions.
    pub fn buffered_items(&self) -> usize {
        self.inner.sessions.iter().map(|buffer| buffer.len()).sum()
    }

    /// Sessions with a drained batch queued for, or currently in, the sink.
    pub fn delivering_sessions(&self) -> usize {
        self.inner
            .sessions
            .iter()
            .filter(|buffer| buffer.is_delivering())
            .count()
    }

    pub fn has_pending_timer(&self, session_id: &str) -> bool {
        self.inner
            .sessions
            .get(session_id)
            .map(|buffer| buffer.has_timer())
            .unwrap_or(false)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Runs one reaper sweep against `now`. The background reaper calls the
    /// same sweep on every `reap_interval` tick.
    pub fn reap_stale(&self, now: Instant) -> ReapReport {
        self.inner.reap_stale(now)
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        let stats = &self.inner.stats;
        EngineStatsSnapshot {
            ingested: stats.ingested.load(Ordering::Relaxed),
            threshold_flushes: stats.threshold_flushes.load(Ordering::Relaxed),
            timeout_flushes: stats.timeout_flushes.load(Ordering::Relaxed),
            empty_flushes: stats.empty_flushes.load(Ordering::Relaxed),
            truncated_batches: stats.truncated_batches.load(Ordering::Relaxed),
            sink_failures: stats.sink_failures.load(Ordering::Relaxed),
            reaped_sessions: stats.reaped_sessions.load(Ordering::Relaxed),
            discarded_items: stats.discarded_items.load(Ordering::Relaxed),
            live_sessions: self.inner.sessions.len(),
        }
    }

    /// Cancels every timer, stops the reaper and drops all buffered state.
    /// Buffered items are not flushed. Later `ingest` calls fail with
    /// [`BatcherError::ShutDown`].
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let reaper = self.reaper.lock().await.take();
        if let Some(handle) = reaper {
            match tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "session reaper join failed");
                }
                Err(_) => {
                    tracing::warn!("timed out waiting for session reaper shutdown");
                }
            }
        }

        let mut cancelled_timers = 0usize;
        let mut discarded_items = 0usize;
        self.inner.sessions.retain(|_, buffer| {
            if buffer.has_timer() {
                cancelled_timers += 1;
            }
            discarded_items += buffer.discard() + buffer.discard_outbox();
            false
        });
        self.inner
            .stats
            .discarded_items
            .fetch_add(discarded_items as u64, Ordering::Relaxed);
        tracing::info!(cancelled_timers, discarded_items, "debounce engine shut down");
    }
}

impl Drop for DebounceEngine {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl EngineInner {
    fn schedule_timeout(self: &Arc<Self>, session_id: &SessionId, now: Instant) -> PendingTimer {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let deadline = now + self.cfg.timeout;
        let inner = Arc::clone(self);
        let session_id = session_id.clone();
        let shutdown = self.shutdown.clone();
        let task = self.runtime.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {}
            }
            inner.flush_on_timeout(&session_id, generation).await;
        });
        PendingTimer::new(generation, task.abort_handle())
    }

    /// Timer callback. Flushes only if `generation` is still the session's
    /// registered timer; a timer superseded by a later ingest, a threshold
    /// flush or the reaper is a no-op.
    pub(crate) async fn flush_on_timeout(&self, session_id: &SessionId, generation: u64) {
        let must_deliver = {
            let Some(mut buffer) = self.sessions.get_mut(session_id) else {
                tracing::trace!(session_id = %session_id, generation, "timer fired for removed session");
                return;
            };
            if !buffer.claim_timer(generation) {
                tracing::trace!(session_id = %session_id, generation, "stale timer ignored");
                return;
            }
            if buffer.is_empty() {
                return;
            }
            let items = buffer.drain(Instant::now());
            let delivery = self.compose(session_id, items, FlushTrigger::Timeout);
            buffer.enqueue(delivery)
        };
        if must_deliver {
            self.deliver(session_id).await;
        }
    }

    fn compose(&self, session_id: &SessionId, items: Vec<String>, trigger: FlushTrigger) -> Delivery {
        let counter = match trigger {
            FlushTrigger::Threshold => &self.stats.threshold_flushes,
            FlushTrigger::Timeout => &self.stats.timeout_flushes,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        match compose_batch(&items, &self.cfg.separator, self.cfg.max_batch_length) {
            Some((text, truncated)) => {
                if truncated {
                    self.stats.truncated_batches.fetch_add(1, Ordering::Relaxed);
                }
                Delivery::Batch(FlushedBatch {
                    session_id: session_id.clone(),
                    text,
                    item_count: items.len(),
                    truncated,
                    trigger,
                    flushed_at: Utc::now(),
                })
            }
            None => {
                self.stats.empty_flushes.fetch_add(1, Ordering::Relaxed);
                Delivery::Empty {
                    session_id: session_id.clone(),
                    trigger,
                    item_count: items.len(),
                }
            }
        }
    }

    /// Hands queued cycles of one session to the sink, in drain order, until
    /// its outbox is empty. Only the caller that won `SessionBuffer::enqueue`
    /// runs this, so a session never has two sink calls in flight.
    async fn deliver(&self, session_id: &SessionId) {
        loop {
            let next = match self.sessions.get_mut(session_id) {
                Some(mut buffer) => buffer.next_delivery(),
                None => None,
            };
            let Some(delivery) = next else {
                return;
            };
            if let Err(e) = self.dispatch(delivery).await {
                self.stats.sink_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "batch dropped after sink failure");
            }
        }
    }

    async fn dispatch(&self, delivery: Delivery) -> Result<()> {
        match delivery {
            Delivery::Batch(batch) => {
                tracing::info!(
                    session_id = %batch.session_id,
                    trigger = %batch.trigger,
                    items = batch.item_count,
                    chars = batch.text.chars().count(),
                    truncated = batch.truncated,
                    "batch flushed"
                );
                let outcome = AssertUnwindSafe(self.sink.on_flush(&batch))
                    .catch_unwind()
                    .await;
                settle(&batch.session_id, outcome)
            }
            Delivery::Empty {
                session_id,
                trigger,
                ..
            } => {
                tracing::info!(session_id = %session_id, trigger = %trigger, "blank batch discarded");
                let outcome = AssertUnwindSafe(self.sink.on_empty(&session_id))
                    .catch_unwind()
                    .await;
                settle(&session_id, outcome)
            }
        }
    }
}

fn settle(
    session_id: &SessionId,
    outcome: std::thread::Result<anyhow::Result<()>>,
) -> Result<()> {
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(BatcherError::sink(session_id, format!("{e:#}"))),
        Err(payload) => Err(BatcherError::sink(
            session_id,
            format!("sink panicked: {}", panic_payload_to_string(payload.as_ref())),
        )),
    }
}
