//! In-memory conversation history with bounded, time-windowed records.
//!
//! Each conversation is keyed by `(channel, participant)` and holds a FIFO
//! buffer of messages. The map is guarded by an `RwLock` and every record by
//! its own `Mutex`, so appends to one key apply in arrival order while
//! unrelated conversations proceed in parallel. Eviction takes the same
//! per-record lock, so it can never drop a record mid-append.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_WINDOW_DAYS: i64 = 30;

/// Returned by `recent_context` when a conversation has no visible history.
pub const NO_HISTORY: &str = "No previous conversation history.";

/// Identifies one message thread: the transport channel plus the remote party.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    pub channel: String,
    pub participant: String,
}

impl ConversationKey {
    pub fn new(channel: impl Into<String>, participant: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            participant: participant.into(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.participant)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ConversationRecord {
    messages: VecDeque<Message>,
    first_message_at: Option<DateTime<Utc>>,
    last_activity_at: Option<DateTime<Utc>>,
}

/// Per-conversation summary (counts and activity span).
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub message_count: usize,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub days_active: i64,
    pub recent_activity_7d: usize,
}

/// One `search` match together with surrounding context.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub key: ConversationKey,
    pub message: Message,
    pub context: String,
}

/// Store-wide totals, mostly for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_conversations: usize,
    pub total_messages: usize,
    pub active_conversations_7d: usize,
    pub avg_messages_per_conversation: f64,
}

pub struct ConversationStore {
    records: RwLock<HashMap<ConversationKey, Arc<Mutex<ConversationRecord>>>>,
    capacity: usize,
    window_days: i64,
}

impl ConversationStore {
    pub fn new(capacity: usize, window_days: i64) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            capacity,
            window_days,
        }
    }

    /// Appends a message, creating the record on first use. Oldest messages
    /// are evicted once the record exceeds capacity. Never fails.
    pub async fn append(
        &self,
        key: &ConversationKey,
        content: impl Into<String>,
        role: Role,
        timestamp: DateTime<Utc>,
    ) {
        let record = self.record_for(key).await;
        let mut record = record.lock().await;

        record.messages.push_back(Message {
            content: content.into(),
            role,
            timestamp,
        });
        while record.messages.len() > self.capacity {
            record.messages.pop_front();
        }

        if record.first_message_at.is_none() {
            record.first_message_at = Some(timestamp);
        }
        record.last_activity_at = Some(timestamp);

        tracing::debug!("Appended {:?} message to {}", role, key);
    }

    async fn record_for(&self, key: &ConversationKey) -> Arc<Mutex<ConversationRecord>> {
        if let Some(record) = self.records.read().await.get(key) {
            return record.clone();
        }
        let mut map = self.records.write().await;
        map.entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ConversationRecord::default())))
            .clone()
    }

    /// Messages inside the store's context window, most recent `limit` when
    /// one is given, chronological order preserved.
    pub async fn history(&self, key: &ConversationKey, limit: Option<usize>) -> Vec<Message> {
        self.history_within(key, limit, self.window_days).await
    }

    pub async fn history_within(
        &self,
        key: &ConversationKey,
        limit: Option<usize>,
        window_days: i64,
    ) -> Vec<Message> {
        let record = match self.records.read().await.get(key) {
            Some(record) => record.clone(),
            None => return Vec::new(),
        };
        let record = record.lock().await;

        let cutoff = Utc::now() - Duration::days(window_days);
        let mut messages: Vec<Message> = record
            .messages
            .iter()
            .filter(|message| message.timestamp >= cutoff)
            .cloned()
            .collect();

        if let Some(limit) = limit {
            if messages.len() > limit {
                messages.drain(..messages.len() - limit);
            }
        }
        messages
    }

    /// Recent history formatted as `[HH:MM] You|Them: content` lines for
    /// prompt embedding. "You" is the persona's own side.
    pub async fn recent_context(&self, key: &ConversationKey, max_messages: usize) -> String {
        let messages = self.history(key, Some(max_messages)).await;
        if messages.is_empty() {
            return NO_HISTORY.to_string();
        }

        messages
            .iter()
            .map(|message| {
                let label = match message.role {
                    Role::Assistant => "You",
                    Role::User => "Them",
                };
                format!(
                    "[{}] {}: {}",
                    message.timestamp.format("%H:%M"),
                    label,
                    message.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub async fn summary(&self, key: &ConversationKey) -> ConversationSummary {
        let record = match self.records.read().await.get(key) {
            Some(record) => record.clone(),
            None => {
                return ConversationSummary {
                    message_count: 0,
                    first_message_at: None,
                    last_activity_at: None,
                    days_active: 0,
                    recent_activity_7d: 0,
                }
            }
        };
        let record = record.lock().await;

        if record.messages.is_empty() {
            return ConversationSummary {
                message_count: 0,
                first_message_at: None,
                last_activity_at: None,
                days_active: 0,
                recent_activity_7d: 0,
            };
        }

        // Metadata survives FIFO eviction, so days_active spans the whole
        // conversation, not just the buffered tail.
        let first = record.first_message_at;
        let last = record.last_activity_at;
        let days_active = match (first, last) {
            (Some(first), Some(last)) => (last - first).num_days() + 1,
            _ => 0,
        };
        let week_ago = Utc::now() - Duration::days(7);
        let recent = record
            .messages
            .iter()
            .filter(|m| m.timestamp >= week_ago)
            .count();

        ConversationSummary {
            message_count: record.messages.len(),
            first_message_at: first,
            last_activity_at: last,
            days_active,
            recent_activity_7d: recent,
        }
    }

    /// Keys with activity inside the last `within_days` days.
    pub async fn active_conversations(&self, within_days: i64) -> Vec<ConversationKey> {
        let cutoff = Utc::now() - Duration::days(within_days);
        let map = self.records.read().await;
        let mut active = Vec::new();
        for (key, record) in map.iter() {
            let record = record.lock().await;
            if matches!(record.last_activity_at, Some(at) if at >= cutoff) {
                active.push(key.clone());
            }
        }
        active
    }

    /// Case-insensitive substring search over all conversations. Scan order
    /// is sorted keys then chronological, so results are stable for a fixed
    /// store state. Stops once `limit` matches are collected.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        let needle = query.to_lowercase();
        let mut keys: Vec<ConversationKey> = self.records.read().await.keys().cloned().collect();
        keys.sort();

        let mut hits = Vec::new();
        for key in keys {
            let record = match self.records.read().await.get(&key) {
                Some(record) => record.clone(),
                None => continue,
            };
            let matched: Vec<Message> = {
                let record = record.lock().await;
                record
                    .messages
                    .iter()
                    .filter(|m| m.content.to_lowercase().contains(&needle))
                    .cloned()
                    .collect()
            };
            if matched.is_empty() {
                continue;
            }

            let context = self.recent_context(&key, 3).await;
            for message in matched {
                hits.push(SearchHit {
                    key: key.clone(),
                    message,
                    context: context.clone(),
                });
                if hits.len() >= limit {
                    return hits;
                }
            }
        }
        hits
    }

    /// Removes conversations whose last activity precedes the retention
    /// cutoff. Returns the number of records dropped. A record handle held
    /// outside the map (an append between `record_for` and its lock, or a
    /// reader) keeps the record alive until the next pass, so an in-flight
    /// append can never land in an orphaned record.
    pub async fn evict_stale(&self, retention_days: i64) -> usize {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let mut map = self.records.write().await;

        let mut stale = Vec::new();
        for (key, record) in map.iter() {
            if Arc::strong_count(record) > 1 {
                continue;
            }
            // No outside handle and the map is write-locked: uncontended.
            let record = record.lock().await;
            if matches!(record.last_activity_at, Some(at) if at < cutoff) {
                stale.push(key.clone());
            }
        }

        for key in &stale {
            map.remove(key);
            tracing::info!("Evicted stale conversation: {}", key);
        }
        stale.len()
    }

    pub async fn stats(&self) -> StoreStats {
        let map = self.records.read().await;
        let total_conversations = map.len();
        let mut total_messages = 0usize;
        let week_ago = Utc::now() - Duration::days(7);
        let mut active = 0usize;
        for record in map.values() {
            let record = record.lock().await;
            total_messages += record.messages.len();
            if matches!(record.last_activity_at, Some(at) if at >= week_ago) {
                active += 1;
            }
        }

        StoreStats {
            total_conversations,
            total_messages,
            active_conversations_7d: active,
            avg_messages_per_conversation: if total_conversations > 0 {
                total_messages as f64 / total_conversations as f64
            } else {
                0.0
            },
        }
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_WINDOW_DAYS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConversationKey {
        ConversationKey::new("test", "alice")
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_first() {
        let store = ConversationStore::new(3, 30);
        let k = key();
        for content in ["m1", "m2", "m3", "m4"] {
            store.append(&k, content, Role::User, Utc::now()).await;
        }

        let history = store.history(&k, None).await;
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn history_filters_by_window() {
        let store = ConversationStore::new(10, 30);
        let k = key();
        store
            .append(&k, "old", Role::User, Utc::now() - Duration::days(31))
            .await;
        store.append(&k, "fresh", Role::User, Utc::now()).await;

        let history = store.history(&k, None).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "fresh");
    }

    #[tokio::test]
    async fn history_limit_keeps_most_recent_in_order() {
        let store = ConversationStore::default();
        let k = key();
        for content in ["a", "b", "c", "d"] {
            store.append(&k, content, Role::User, Utc::now()).await;
        }

        let history = store.history(&k, Some(2)).await;
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn recent_context_formats_lines_and_sentinel() {
        let store = ConversationStore::default();
        let k = key();
        assert_eq!(store.recent_context(&k, 10).await, NO_HISTORY);

        store.append(&k, "hi there", Role::User, Utc::now()).await;
        store.append(&k, "hello", Role::Assistant, Utc::now()).await;

        let context = store.recent_context(&k, 10).await;
        let lines: Vec<&str> = context.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Them: hi there"));
        assert!(lines[1].contains("You: hello"));
        assert!(lines[0].starts_with('['));
    }

    #[tokio::test]
    async fn summary_counts_days_active() {
        let store = ConversationStore::default();
        let k = key();

        let empty = store.summary(&k).await;
        assert_eq!(empty.message_count, 0);
        assert_eq!(empty.days_active, 0);
        assert!(empty.first_message_at.is_none());

        store
            .append(&k, "first", Role::User, Utc::now() - Duration::days(2))
            .await;
        store.append(&k, "latest", Role::Assistant, Utc::now()).await;

        let summary = store.summary(&k).await;
        assert_eq!(summary.message_count, 2);
        assert_eq!(summary.days_active, 3);
        assert_eq!(summary.recent_activity_7d, 2);
    }

    #[tokio::test]
    async fn evict_stale_respects_retention_boundary() {
        let store = ConversationStore::default();
        let stale_key = ConversationKey::new("test", "old-friend");
        let live_key = ConversationKey::new("test", "recent-friend");
        store
            .append(&stale_key, "bye", Role::User, Utc::now() - Duration::days(31))
            .await;
        store
            .append(&live_key, "hey", Role::User, Utc::now() - Duration::days(29))
            .await;

        let removed = store.evict_stale(30).await;
        assert_eq!(removed, 1);
        assert!(store.history(&stale_key, None).await.is_empty());
        assert_eq!(store.summary(&live_key).await.message_count, 1);
    }

    #[tokio::test]
    async fn evict_spares_records_with_an_append_in_flight() {
        let store = ConversationStore::default();
        let k = key();
        store
            .append(&k, "old", Role::User, Utc::now() - Duration::days(31))
            .await;

        // First half of an append: the handle is out, the lock not yet
        // taken. Eviction must leave the record alone.
        let record = store.record_for(&k).await;
        assert_eq!(store.evict_stale(30).await, 0);

        // Second half: the push still lands in the live record.
        let now = Utc::now();
        {
            let mut record = record.lock().await;
            record.messages.push_back(Message {
                content: "late".to_string(),
                role: Role::User,
                timestamp: now,
            });
            record.last_activity_at = Some(now);
        }
        drop(record);

        let history = store.history(&k, None).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "late");
    }

    #[tokio::test]
    async fn evict_removes_stale_records_once_handles_are_gone() {
        let store = ConversationStore::default();
        let k = key();
        store
            .append(&k, "bye", Role::User, Utc::now() - Duration::days(31))
            .await;

        let record = store.record_for(&k).await;
        assert_eq!(store.evict_stale(30).await, 0);
        drop(record);
        assert_eq!(store.evict_stale(30).await, 1);
        assert!(store.summary(&k).await.first_message_at.is_none());
    }

    #[tokio::test]
    async fn search_is_case_insensitive_and_ordered() {
        let store = ConversationStore::default();
        let a = ConversationKey::new("test", "anna");
        let b = ConversationKey::new("test", "bob");
        store.append(&b, "Lunch tomorrow?", Role::User, Utc::now()).await;
        store.append(&a, "lunch was great", Role::User, Utc::now()).await;
        store.append(&a, "unrelated", Role::User, Utc::now()).await;

        let hits = store.search("LUNCH", 50).await;
        assert_eq!(hits.len(), 2);
        // Sorted key order: anna before bob.
        assert_eq!(hits[0].key, a);
        assert_eq!(hits[1].key, b);
        assert!(hits[0].context.contains("lunch was great"));

        let limited = store.search("lunch", 1).await;
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn active_conversations_windowed() {
        let store = ConversationStore::default();
        let active = ConversationKey::new("test", "active");
        let idle = ConversationKey::new("test", "idle");
        store.append(&active, "ping", Role::User, Utc::now()).await;
        store
            .append(&idle, "ping", Role::User, Utc::now() - Duration::days(8))
            .await;

        let keys = store.active_conversations(7).await;
        assert_eq!(keys, vec![active]);
    }

    #[tokio::test]
    async fn appends_across_keys_do_not_interleave_within_a_key() {
        let store = Arc::new(ConversationStore::default());
        let k = key();
        // Sequential issue order must survive concurrent completion.
        for i in 0..20 {
            store
                .append(&k, format!("msg-{i}"), Role::User, Utc::now())
                .await;
        }
        let history = store.history(&k, None).await;
        for (i, message) in history.iter().enumerate() {
            assert_eq!(message.content, format!("msg-{i}"));
        }
    }

    #[tokio::test]
    async fn stats_reflect_store_totals() {
        let store = ConversationStore::default();
        store.append(&key(), "one", Role::User, Utc::now()).await;
        store
            .append(&ConversationKey::new("test", "bob"), "two", Role::User, Utc::now())
            .await;

        let stats = store.stats().await;
        assert_eq!(stats.total_conversations, 2);
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.active_conversations_7d, 2);
        assert!((stats.avg_messages_per_conversation - 1.0).abs() < f64::EPSILON);
    }
}
