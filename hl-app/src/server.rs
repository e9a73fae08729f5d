use crate::config::{DownstreamTarget, HumanlikeConfig};
use crate::gateway::Gateway;
use crate::relay::{Downstream, Relay, RelaySink, WebhookClient};
use anyhow::Result;
use hl_batcher::{DebounceEngine, MentionCache};
use hl_channels::{ChannelAdapter, ConsoleAdapter};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const INBOUND_QUEUE_CAPACITY: usize = 256;

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = HumanlikeConfig::load_with_path(config_path).await?;
    let engine = cfg.batching.engine_config()?;
    tracing::info!(
        config_path = %path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "<defaults>".to_string()),
        intercept_count = engine.threshold,
        timeout_ms = engine.timeout.as_millis() as u64,
        staleness_ms = engine.staleness.as_millis() as u64,
        max_length = engine.max_batch_length,
        clean_interval_secs = engine.reap_interval.as_secs(),
        group_enabled = cfg.group.enabled,
        mention_prefixes = ?cfg.group.mention_prefixes,
        prompt_style = ?cfg.prompt.style,
        downstream = ?cfg.downstream.target,
        "config ok"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = HumanlikeConfig::load_with_path(config_path).await?;
    tracing::info!(
        config_path = ?path,
        downstream = ?cfg.downstream.target,
        "humanlike starting"
    );

    let console = Arc::new(ConsoleAdapter::stdio());
    let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
    channels.insert(console.channel_id().to_string(), console);

    let downstream = match cfg.downstream.target {
        DownstreamTarget::Echo => Downstream::Echo,
        DownstreamTarget::Webhook => Downstream::Webhook(WebhookClient::new(
            cfg.downstream.webhook_url.as_deref().unwrap_or_default(),
            cfg.downstream.auth_token.clone(),
        )?),
    };
    let relay = Arc::new(Relay::new(channels.clone(), downstream, cfg.prompt.style));
    let engine_cfg = cfg.batching.engine_config()?;
    let timeout = engine_cfg.timeout;
    let engine = Arc::new(DebounceEngine::new(
        engine_cfg,
        Arc::new(RelaySink::new(relay.clone())),
    )?);
    let mentions = Arc::new(MentionCache::new(cfg.group.mention_config())?);

    let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    for (channel_id, adapter) in &channels {
        adapter
            .start(tx.clone())
            .await
            .map_err(|e| anyhow::anyhow!("start channel {channel_id}: {e}"))?;
        tracing::info!(channel_id = %channel_id, "channel started");
    }
    drop(tx);

    let shutdown = CancellationToken::new();
    let gateway = Arc::new(Gateway::new(
        cfg.group.clone(),
        Duration::from_secs(cfg.batching.clean_interval_seconds),
        engine.clone(),
        mentions,
        relay,
        rx,
        shutdown.clone(),
    ));
    let mut gateway_handle = gateway.start();

    let interrupted = tokio::select! {
        _ = shutdown_signal() => true,
        joined = &mut gateway_handle => {
            if let Err(e) = joined {
                tracing::error!(error = %e, "gateway task join failed");
            }
            false
        }
    };

    if interrupted {
        shutdown.cancel();
        match gateway_handle.await {
            Ok(()) => tracing::info!("gateway shutdown completed"),
            Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
        }
    } else {
        // Input ended; let buffered sessions reach their timeout flush.
        tokio::select! {
            _ = shutdown_signal() => {}
            _ = drain_buffered(&engine, timeout + Duration::from_secs(1)) => {}
        }
    }

    engine.shutdown().await;
    let stats = engine.stats();
    tracing::info!(
        ingested = stats.ingested,
        threshold_flushes = stats.threshold_flushes,
        timeout_flushes = stats.timeout_flushes,
        empty_flushes = stats.empty_flushes,
        truncated_batches = stats.truncated_batches,
        sink_failures = stats.sink_failures,
        reaped_sessions = stats.reaped_sessions,
        discarded_items = stats.discarded_items,
        "humanlike stopped"
    );
    Ok(())
}

/// Upper bound on waiting for sink calls already in flight once nothing is
/// buffered. Covers the webhook client's request timeout.
const DELIVERY_GRACE: Duration = Duration::from_secs(65);

async fn drain_buffered(engine: &DebounceEngine, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    while engine.buffered_items() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let left = engine.buffered_items();
    if left > 0 {
        tracing::warn!(buffered_items = left, "input closed with items still buffered");
    }

    let deadline = tokio::time::Instant::now() + DELIVERY_GRACE;
    while engine.delivering_sessions() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let delivering = engine.delivering_sessions();
    if delivering > 0 {
        tracing::warn!(
            delivering_sessions = delivering,
            "deliveries still in flight at shutdown"
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        }
        tracing::warn!("received ctrl-c; beginning graceful shutdown");
    }
}
