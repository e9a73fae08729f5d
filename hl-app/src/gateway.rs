//! Inbound multiplexer: all channel adapters feed a single queue. Private
//! messages are debounced per sender; group messages are held in the mention
//! cache until someone addresses the bot.

use crate::config::GroupConfig;
use crate::relay::{Prepared, Relay, Route};
use anyhow::Result;
use hl_batcher::{DebounceEngine, IngestResult, MentionCache, render_history, truncate_chars};
use hl_channels::InboundMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub struct Gateway {
    group: GroupConfig,
    prune_interval: Duration,
    engine: Arc<DebounceEngine>,
    mentions: Arc<MentionCache>,
    relay: Arc<Relay>,
    inbound_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(
        group: GroupConfig,
        prune_interval: Duration,
        engine: Arc<DebounceEngine>,
        mentions: Arc<MentionCache>,
        relay: Arc<Relay>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            group,
            prune_interval,
            engine,
            mentions,
            relay,
            inbound_rx: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
            shutdown,
        }
    }

    /// Runs until every adapter has closed its sender or shutdown is requested.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop().await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(&self) -> Result<()> {
        let mut rx = self.inbound_rx.lock().await;
        let mut forwards: JoinSet<()> = JoinSet::new();
        let mut prune = tokio::time::interval_at(
            Instant::now() + self.prune_interval,
            self.prune_interval,
        );
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!(in_flight = forwards.len(), "gateway received shutdown signal");
                    forwards.abort_all();
                    return Ok(());
                }
                _ = prune.tick() => {
                    let dropped = self.mentions.prune(Instant::now());
                    tracing::debug!(
                        dropped,
                        groups = self.mentions.group_count(),
                        "mention cache pruned"
                    );
                }
                Some(joined) = forwards.join_next(), if !forwards.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "group relay task failed");
                    }
                }
                msg = rx.recv() => {
                    let Some(inbound) = msg else {
                        tracing::info!(in_flight = forwards.len(), "all inbound channels closed");
                        while forwards.join_next().await.is_some() {}
                        return Ok(());
                    };
                    match self.handle_inbound(inbound) {
                        Ok(Some(prepared)) => {
                            let relay = Arc::clone(&self.relay);
                            forwards.spawn(async move {
                                if let Err(e) = relay.forward(prepared).await {
                                    tracing::warn!(%e, "group relay failed");
                                }
                            });
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(%e, "handle_inbound failed"),
                    }
                }
            }
        }
    }

    /// Routes one message without waiting on anything downstream. Private
    /// messages go to the engine, whose threshold flushes deliver on their own
    /// tasks. Returns a group prompt that is ready to relay, if any.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(channel_id = %inbound.channel_id, sender_id = %inbound.sender_id)
    )]
    fn handle_inbound(&self, inbound: InboundMessage) -> Result<Option<Prepared>> {
        let now = Instant::now();
        if let Some(group_id) = inbound.group_id.as_deref() {
            let route = Route::new(&inbound.channel_id, group_id);
            return Ok(self.handle_group(route, inbound.sender_id, inbound.content, now));
        }

        let session_id = Route::new(&inbound.channel_id, &inbound.sender_id).session_id();
        match self.engine.submit(session_id.clone(), inbound.content, now)? {
            IngestResult::Buffered => {}
            IngestResult::Flushed(batch) => {
                tracing::debug!(
                    session_id = %session_id,
                    items = batch.item_count,
                    "inbound message completed a batch"
                );
            }
            IngestResult::FlushedEmpty => {
                tracing::debug!(session_id = %session_id, "inbound message completed a blank batch");
            }
        }
        Ok(None)
    }

    fn handle_group(
        &self,
        route: Route,
        sender_id: String,
        content: String,
        now: Instant,
    ) -> Option<Prepared> {
        if !self.group.enabled {
            return Some(self.prepare_group(route, format!("{sender_id}: {content}")));
        }

        let group_key = route.session_id();
        if !mentions_bot(&content, &self.group.mention_prefixes) {
            self.mentions.record(group_key, sender_id, content, now);
            return None;
        }

        let history = self.mentions.take_on_mention(group_key.clone(), sender_id, content, now);
        tracing::info!(
            group = %group_key,
            messages = history.len(),
            "bot mentioned; releasing group history"
        );
        Some(self.prepare_group(route, render_history(&history)))
    }

    fn prepare_group(&self, route: Route, text: String) -> Prepared {
        let (text, truncated) = truncate_chars(text, self.engine.config().max_batch_length);
        Prepared {
            route,
            is_group: true,
            text,
            truncated,
        }
    }
}

/// True when `content` starts with one of `prefixes`, ignoring ASCII case and
/// leading whitespace.
fn mentions_bot(content: &str, prefixes: &[String]) -> bool {
    let trimmed = content.trim_start();
    prefixes
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .any(|p| {
            trimmed
                .get(..p.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(p))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::tests::{RecordingChannel, echo_relay};
    use async_trait::async_trait;
    use hl_batcher::{
        ChannelSink, EngineConfig, FlushSink, FlushedBatch, MentionCacheConfig, SinkEvent,
    };
    use tokio::sync::Notify;

    struct Harness {
        gateway: Arc<Gateway>,
        engine: Arc<DebounceEngine>,
        channel: Arc<RecordingChannel>,
        shutdown: CancellationToken,
        tx: mpsc::Sender<InboundMessage>,
    }

    fn harness_with(
        sink: Arc<dyn FlushSink>,
        engine_cfg: EngineConfig,
        group: GroupConfig,
    ) -> Harness {
        let engine = Arc::new(DebounceEngine::new(engine_cfg, sink).expect("engine"));
        let mentions = Arc::new(MentionCache::new(MentionCacheConfig::default()).expect("cache"));
        let channel = Arc::new(RecordingChannel::default());
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel(16);
        let gateway = Arc::new(Gateway::new(
            group,
            Duration::from_secs(300),
            engine.clone(),
            mentions,
            echo_relay(channel.clone()),
            rx,
            shutdown.clone(),
        ));
        Harness {
            gateway,
            engine,
            channel,
            shutdown,
            tx,
        }
    }

    fn threshold(n: usize) -> EngineConfig {
        EngineConfig {
            threshold: n,
            ..EngineConfig::default()
        }
    }

    fn harness(group: GroupConfig) -> (Harness, mpsc::UnboundedReceiver<SinkEvent>) {
        let (sink, events) = ChannelSink::new();
        (harness_with(Arc::new(sink), threshold(3), group), events)
    }

    fn inbound(sender: &str, group: Option<&str>, content: &str) -> InboundMessage {
        InboundMessage {
            message_id: format!("{sender}-{content}"),
            channel_id: "console".to_string(),
            sender_id: sender.to_string(),
            group_id: group.map(str::to_string),
            content: content.to_string(),
            metadata: serde_json::Value::Null,
            received_at: chrono::Utc::now(),
        }
    }

    /// Feeds `messages`, closes the input and waits for the loop to finish.
    async fn run_to_end(
        gateway: Arc<Gateway>,
        tx: mpsc::Sender<InboundMessage>,
        messages: Vec<InboundMessage>,
    ) {
        let handle = gateway.start();
        for message in messages {
            tx.send(message).await.expect("send");
        }
        drop(tx);
        handle.await.expect("gateway task");
    }

    #[test]
    fn mention_prefix_matching() {
        let prefixes = vec!["@bot".to_string(), "  ".to_string(), "小助手".to_string()];
        assert!(mentions_bot("@bot hi", &prefixes));
        assert!(mentions_bot("   @BOT, hi", &prefixes));
        assert!(mentions_bot("小助手 在吗", &prefixes));
        assert!(!mentions_bot("hi @bot", &prefixes));
        assert!(!mentions_bot("@bo", &prefixes));
        assert!(!mentions_bot("é", &["ab".to_string()]));
    }

    #[tokio::test]
    async fn private_messages_are_debounced_per_sender() {
        let (h, mut events) = harness(GroupConfig::default());
        run_to_end(
            h.gateway.clone(),
            h.tx,
            vec![
                inbound("alice", None, "a"),
                inbound("bob", None, "x"),
                inbound("alice", None, "b"),
                inbound("alice", None, "c"),
            ],
        )
        .await;

        match events.recv().await.expect("flush event") {
            SinkEvent::Flushed(batch) => {
                assert_eq!(batch.session_id.as_str(), "console/alice");
                assert_eq!(batch.text, "a b c");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(h.engine.pending_items("console/alice"), 0);
        assert_eq!(h.engine.pending_items("console/bob"), 1);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn group_history_is_released_on_mention() {
        let (h, _events) = harness(GroupConfig::default());
        run_to_end(
            h.gateway.clone(),
            h.tx,
            vec![
                inbound("alice", Some("g1"), "lunch?"),
                inbound("bob", Some("g1"), "@bot where should we go"),
                inbound("carol", Some("g1"), "after the mention"),
            ],
        )
        .await;

        let sent = h.channel.sent.lock().await.clone();
        assert_eq!(
            sent,
            vec![(
                "g1".to_string(),
                "alice: lunch?\nbob: @bot where should we go".to_string()
            )]
        );
        assert_eq!(h.engine.stats().ingested, 0);
    }

    #[tokio::test]
    async fn disabled_group_gating_relays_immediately() {
        let (h, _events) = harness(GroupConfig {
            enabled: false,
            ..GroupConfig::default()
        });
        run_to_end(
            h.gateway.clone(),
            h.tx,
            vec![inbound("alice", Some("g1"), "hi"), inbound("bob", Some("g1"), "yo")],
        )
        .await;

        let mut sent = h.channel.sent.lock().await.clone();
        sent.sort();
        assert_eq!(
            sent,
            vec![
                ("g1".to_string(), "alice: hi".to_string()),
                ("g1".to_string(), "bob: yo".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn group_prompts_are_capped_at_max_batch_length() {
        let (sink, _events) = ChannelSink::new();
        let h = harness_with(
            Arc::new(sink),
            EngineConfig {
                max_batch_length: 12,
                ..threshold(3)
            },
            GroupConfig::default(),
        );
        assert!(h
            .gateway
            .handle_inbound(inbound("alice", Some("g1"), "a rather long opening line"))
            .expect("record")
            .is_none());
        let prepared = h
            .gateway
            .handle_inbound(inbound("bob", Some("g1"), "@bot summarize"))
            .expect("mention")
            .expect("prompt released");
        assert!(prepared.is_group);
        assert!(prepared.truncated);
        assert_eq!(prepared.text, "alice: a rat");

        let short = h
            .gateway
            .handle_inbound(inbound("bob", Some("g1"), "@bot hi"))
            .expect("mention")
            .expect("prompt released");
        assert!(!short.truncated);
        assert_eq!(short.text, "bob: @bot hi");
    }

    #[tokio::test]
    async fn disabled_gating_prompts_are_capped_too() {
        let (sink, _events) = ChannelSink::new();
        let h = harness_with(
            Arc::new(sink),
            EngineConfig {
                max_batch_length: 8,
                ..threshold(3)
            },
            GroupConfig {
                enabled: false,
                ..GroupConfig::default()
            },
        );
        let prepared = h
            .gateway
            .handle_inbound(inbound("alice", Some("g1"), "héllo wörld"))
            .expect("relay")
            .expect("prompt");
        assert!(prepared.truncated);
        assert_eq!(prepared.text, "alice: h");
    }

    #[tokio::test]
    async fn ingest_after_engine_shutdown_is_reported() {
        let (h, _events) = harness(GroupConfig::default());
        h.engine.shutdown().await;
        assert!(h.gateway.handle_inbound(inbound("alice", None, "late")).is_err());
    }

    #[tokio::test]
    async fn shutdown_token_stops_the_loop() {
        let (h, _events) = harness(GroupConfig::default());
        let handle = h.gateway.clone().start();
        h.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop exits on cancel")
            .expect("gateway task");
        drop(h.tx);
    }

    struct GatedSink {
        started: mpsc::UnboundedSender<String>,
        gate: Notify,
    }

    #[async_trait]
    impl FlushSink for GatedSink {
        async fn on_flush(&self, batch: &FlushedBatch) -> anyhow::Result<()> {
            let _ = self.started.send(batch.text.clone());
            self.gate.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn blocked_delivery_does_not_stall_other_senders() {
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let sink = Arc::new(GatedSink {
            started: started_tx,
            gate: Notify::new(),
        });
        let h = harness_with(sink.clone(), threshold(3), GroupConfig::default());
        let handle = h.gateway.clone().start();

        for content in ["a", "b", "c"] {
            h.tx.send(inbound("alice", None, content)).await.expect("send");
        }
        assert_eq!(started.recv().await.expect("alice flushed"), "a b c");

        // alice's delivery is still parked in the sink.
        h.tx.send(inbound("bob", None, "x")).await.expect("send");
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.engine.pending_items("console/bob") == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("bob is buffered while alice's sink call is blocked");
        assert_eq!(h.engine.delivering_sessions(), 1);

        sink.gate.notify_one();
        drop(h.tx);
        handle.await.expect("gateway task");
        h.engine.shutdown().await;
    }
}
