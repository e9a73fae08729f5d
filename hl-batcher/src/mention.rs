use crate::config::MentionCacheConfig;
use crate::error::Result;
use crate::types::SessionId;
use dashmap::DashMap;
use std::collections::VecDeque;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    pub sender: String,
    pub content: String,
    pub received_at: Instant,
}

/// Recent group-chat history, released only when the bot is mentioned.
///
/// No count or timeout flush applies here: history accumulates (bounded by
/// `capacity` and `max_age`) until `take_on_mention` drains it.
pub struct MentionCache {
    cfg: MentionCacheConfig,
    groups: DashMap<SessionId, VecDeque<CachedMessage>>,
}

impl MentionCache {
    pub fn new(cfg: MentionCacheConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            groups: DashMap::new(),
        })
    }

    pub fn record(
        &self,
        group: impl Into<SessionId>,
        sender: impl Into<String>,
        content: impl Into<String>,
        now: Instant,
    ) {
        let mut history = self.groups.entry(group.into()).or_default();
        self.expire(&mut history, now);
        history.push_back(CachedMessage {
            sender: sender.into(),
            content: content.into(),
            received_at: now,
        });
        while history.len() > self.cfg.capacity {
            history.pop_front();
        }
    }

    /// Appends the mentioning message and drains the group's live history,
    /// oldest first.
    pub fn take_on_mention(
        &self,
        group: impl Into<SessionId>,
        sender: impl Into<String>,
        content: impl Into<String>,
        now: Instant,
    ) -> Vec<CachedMessage> {
        let group = group.into();
        self.record(group.clone(), sender, content, now);
        match self.groups.remove(&group) {
            Some((_, history)) => history.into(),
            None => Vec::new(),
        }
    }

    pub fn peek(&self, group: &str, now: Instant) -> Vec<CachedMessage> {
        self.groups
            .get(group)
            .map(|history| {
                history
                    .iter()
                    .filter(|message| now.saturating_duration_since(message.received_at) < self.cfg.max_age)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drops aged messages across all groups. Returns how many were dropped.
    pub fn prune(&self, now: Instant) -> usize {
        let mut dropped = 0;
        self.groups.retain(|_, history| {
            let before = history.len();
            self.expire(history, now);
            dropped += before - history.len();
            !history.is_empty()
        });
        dropped
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn expire(&self, history: &mut VecDeque<CachedMessage>, now: Instant) {
        while let Some(oldest) = history.front() {
            if now.saturating_duration_since(oldest.received_at) < self.cfg.max_age {
                break;
            }
            history.pop_front();
        }
    }
}

/// One `sender: content` line per message.
pub fn render_history(messages: &[CachedMessage]) -> String {
    messages
        .iter()
        .map(|message| format!("{}: {}", message.sender, message.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cache(capacity: usize, max_age_secs: u64) -> MentionCache {
        MentionCache::new(MentionCacheConfig {
            capacity,
            max_age: Duration::from_secs(max_age_secs),
        })
        .expect("new cache")
    }

    #[test]
    fn mention_drains_history_with_trigger_last() {
        let cache = cache(20, 3600);
        let now = Instant::now();
        cache.record("g1", "alice", "lunch?", now);
        cache.record("g1", "bob", "sure", now);
        cache.record("g2", "carol", "elsewhere", now);

        let history = cache.take_on_mention("g1", "alice", "@bot where should we go", now);
        assert_eq!(
            render_history(&history),
            "alice: lunch?\nbob: sure\nalice: @bot where should we go"
        );
        assert!(cache.peek("g1", now).is_empty());
        assert_eq!(cache.peek("g2", now).len(), 1);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = cache(3, 3600);
        let now = Instant::now();
        for i in 0..5 {
            cache.record("g1", "alice", format!("m{i}"), now);
        }
        let contents: Vec<String> = cache
            .peek("g1", now)
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn aged_messages_are_not_forwarded() {
        let cache = cache(20, 60);
        let start = Instant::now();
        cache.record("g1", "alice", "old", start);
        cache.record("g1", "bob", "recent", start + Duration::from_secs(50));

        let later = start + Duration::from_secs(70);
        let history = cache.take_on_mention("g1", "carol", "@bot hi", later);
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["recent", "@bot hi"]);
    }

    #[test]
    fn prune_removes_empty_groups() {
        let cache = cache(20, 60);
        let start = Instant::now();
        cache.record("g1", "alice", "a", start);
        cache.record("g2", "bob", "b", start + Duration::from_secs(30));

        assert_eq!(cache.prune(start + Duration::from_secs(61)), 1);
        assert_eq!(cache.group_count(), 1);
        assert_eq!(cache.prune(start + Duration::from_secs(120)), 1);
        assert_eq!(cache.group_count(), 0);
    }
}
