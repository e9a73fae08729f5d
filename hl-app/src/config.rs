//! humanlike configuration loader.

use crate::prompt::PromptStyle;
use crate::relay::normalize_http_url;
use hl_batcher::{EngineConfig, MentionCacheConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HumanlikeConfig {
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub group: GroupConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub downstream: DownstreamConfig,
}

/// Private-chat batching knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchingConfig {
    /// Messages that force an immediate flush.
    #[serde(default = "default_intercept_count")]
    pub intercept_count: usize,
    /// Quiet period before a timeout flush.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    /// Idle age after which buffered messages are discarded.
    /// Default: twice `timeout_seconds`.
    #[serde(default)]
    pub staleness_seconds: Option<f64>,
    /// Cap on the batch text, in characters.
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_clean_interval_seconds")]
    pub clean_interval_seconds: u64,
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_intercept_count() -> usize {
    5
}

fn default_timeout_seconds() -> f64 {
    10.0
}

fn default_max_length() -> usize {
    8192
}

fn default_clean_interval_seconds() -> u64 {
    300
}

fn default_separator() -> String {
    " ".to_string()
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            intercept_count: default_intercept_count(),
            timeout_seconds: default_timeout_seconds(),
            staleness_seconds: None,
            max_length: default_max_length(),
            clean_interval_seconds: default_clean_interval_seconds(),
            separator: default_separator(),
        }
    }
}

impl BatchingConfig {
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let timeout = seconds("batching.timeout_seconds", self.timeout_seconds)?;
        let staleness = match self.staleness_seconds {
            Some(v) => seconds("batching.staleness_seconds", v)?,
            None => timeout.checked_mul(2).ok_or_else(|| {
                anyhow::anyhow!("batching.timeout_seconds is too large ({})", self.timeout_seconds)
            })?,
        };
        let cfg = EngineConfig {
            threshold: self.intercept_count,
            timeout,
            staleness,
            max_batch_length: self.max_length,
            reap_interval: Duration::from_secs(self.clean_interval_seconds),
            separator: self.separator.clone(),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

fn seconds(field: &str, value: f64) -> anyhow::Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return Err(anyhow::anyhow!("{field} must be > 0 (got {value})"));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|e| anyhow::anyhow!("{field} is out of range ({value}): {e}"))
}

/// Group chats are cached until the bot is mentioned.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    /// When false, group messages are relayed immediately without caching.
    #[serde(default = "default_group_enabled")]
    pub enabled: bool,
    /// A group message starting with one of these (case-insensitive) mentions the bot.
    #[serde(default = "default_mention_prefixes")]
    pub mention_prefixes: Vec<String>,
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,
    #[serde(default = "default_max_message_age_seconds")]
    pub max_message_age_seconds: u64,
}

fn default_group_enabled() -> bool {
    true
}

fn default_mention_prefixes() -> Vec<String> {
    vec!["@bot".to_string()]
}

fn default_max_cache_size() -> usize {
    20
}

fn default_max_message_age_seconds() -> u64 {
    3600
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            enabled: default_group_enabled(),
            mention_prefixes: default_mention_prefixes(),
            max_cache_size: default_max_cache_size(),
            max_message_age_seconds: default_max_message_age_seconds(),
        }
    }
}

impl GroupConfig {
    pub fn mention_config(&self) -> MentionCacheConfig {
        MentionCacheConfig {
            capacity: self.max_cache_size,
            max_age: Duration::from_secs(self.max_message_age_seconds),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptConfig {
    #[serde(default)]
    pub style: PromptStyle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownstreamTarget {
    /// Send the prepared prompt back through the originating channel.
    #[default]
    Echo,
    /// POST the prepared prompt to `webhook_url`.
    Webhook,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownstreamConfig {
    #[serde(default)]
    pub target: DownstreamTarget,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl HumanlikeConfig {
    /// Loads `path`, or the default path when it exists, or built-in defaults.
    /// Returns the file actually read, if any.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        let (mut cfg, source) = match path {
            Some(path) => (Self::read(&path).await?, Some(path)),
            None => {
                let path = default_config_path();
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    (Self::read(&path).await?, Some(path))
                } else {
                    (Self::default(), None)
                }
            }
        };
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok((cfg, source))
    }

    async fn read(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        toml::from_str(&contents).map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = var("HUMANLIKE_INTERCEPT_COUNT") {
            self.batching.intercept_count = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("HUMANLIKE_INTERCEPT_COUNT={v:?}: {e}"))?;
        }
        if let Some(v) = var("HUMANLIKE_TIMEOUT_SECONDS") {
            self.batching.timeout_seconds = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("HUMANLIKE_TIMEOUT_SECONDS={v:?}: {e}"))?;
        }
        if let Some(v) = var("HUMANLIKE_WEBHOOK_URL") {
            self.downstream.webhook_url = Some(v);
            self.downstream.target = DownstreamTarget::Webhook;
        }
        if let Some(v) = var("HUMANLIKE_WEBHOOK_TOKEN") {
            self.downstream.auth_token = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.batching.engine_config()?;
        if self.group.enabled {
            self.group.mention_config().validate()?;
            if self.group.mention_prefixes.iter().all(|p| p.trim().is_empty()) {
                return Err(anyhow::anyhow!(
                    "group.mention_prefixes must contain a non-empty prefix when group.enabled"
                ));
            }
        }
        if self.downstream.target == DownstreamTarget::Webhook {
            normalize_http_url(
                self.downstream.webhook_url.as_deref().unwrap_or_default(),
                "downstream.webhook_url",
            )?;
        }
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".humanlike").join("config.toml")
}
