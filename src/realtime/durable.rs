use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::streams::StreamRangeReply;
use redis::{AsyncCommands, Client};
use serde_json::Value;

use crate::errors::Result;

/// Opaque resume cursor for a per-channel log.
///
/// Ids are monotonically increasing within a channel. Callers never
/// interpret or compare them, only hand them back to [`DurableLog::read_after`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntryId(String);

impl EntryId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for EntryId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One appended event.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub id: EntryId,
    pub payload: Value,
}

/// Append-only per-channel event log.
///
/// This is the capability the broker polls against in durable mode. The
/// polling loop is one concrete consumption strategy; a push-capable
/// backend can implement the same trait and be substituted without
/// touching any caller.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Append a payload to the channel's log and return its id. Safe under
    /// concurrent appends from multiple producers; ordering within a
    /// channel is the log's responsibility.
    async fn append(&self, channel: &str, payload: &Value) -> Result<EntryId>;

    /// Entries strictly newer than `cursor` (all entries when `None`),
    /// oldest first, capped at `limit`.
    async fn read_after(
        &self,
        channel: &str,
        cursor: Option<&EntryId>,
        limit: usize,
    ) -> Result<Vec<LogEntry>>;

    /// Id of the newest entry, or `None` for an empty channel. Used to
    /// start new subscribers at "now" instead of replaying backlog.
    async fn latest_id(&self, channel: &str) -> Result<Option<EntryId>>;
}

/// Redis Streams implementation of [`DurableLog`].
///
/// Each channel maps to a stream key `sse:<channel>`; the JSON payload is
/// stored under a single `d` field. Entries are never deleted here;
/// trimming and retention belong to the deployment.
pub struct RedisLog {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisLog {
    /// Connect to the given Redis URL. The connection manager reconnects
    /// on its own, so a `RedisLog` stays usable across broker restarts.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            key_prefix: "sse:".to_string(),
        })
    }

    fn key(&self, channel: &str) -> String {
        format!("{}{}", self.key_prefix, channel)
    }
}

#[async_trait]
impl DurableLog for RedisLog {
    async fn append(&self, channel: &str, payload: &Value) -> Result<EntryId> {
        let body = serde_json::to_string(payload)?;
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(self.key(channel), "*", &[("d", body.as_str())])
            .await?;
        Ok(EntryId::from(id))
    }

    async fn read_after(
        &self,
        channel: &str,
        cursor: Option<&EntryId>,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        // Exclusive start: "(id" skips the cursor entry itself.
        let start = match cursor {
            Some(id) => format!("({}", id.as_str()),
            None => "-".to_string(),
        };
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn
            .xrange_count(self.key(channel), start, "+", limit)
            .await?;

        let mut entries = Vec::with_capacity(reply.ids.len());
        for item in reply.ids {
            let Some(raw) = item.get::<String>("d") else {
                continue;
            };
            match serde_json::from_str(&raw) {
                Ok(payload) => entries.push(LogEntry {
                    id: EntryId::from(item.id),
                    payload,
                }),
                Err(err) => {
                    log::warn!(
                        "skipping undecodable log entry {} on {}: {}",
                        item.id,
                        channel,
                        err
                    );
                }
            }
        }
        Ok(entries)
    }

    async fn latest_id(&self, channel: &str) -> Result<Option<EntryId>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrevrange_count(self.key(channel), "+", "-", 1).await?;
        Ok(reply.ids.into_iter().next().map(|e| EntryId::from(e.id)))
    }
}

#[derive(Default)]
struct ChannelLog {
    next_id: u64,
    entries: Vec<(u64, Value)>,
}

/// In-process [`DurableLog`] for single-node deployments and tests.
///
/// Ids are per-channel counters rendered as strings, so cursors behave
/// exactly like the Redis ones from the caller's point of view.
#[derive(Default)]
pub struct MemoryLog {
    inner: RwLock<HashMap<String, ChannelLog>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_cursor(cursor: Option<&EntryId>) -> u64 {
        cursor
            .and_then(|id| id.as_str().parse::<u64>().ok())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DurableLog for MemoryLog {
    async fn append(&self, channel: &str, payload: &Value) -> Result<EntryId> {
        let mut inner = self.inner.write();
        let channel_log = inner.entry(channel.to_string()).or_default();
        channel_log.next_id += 1;
        let id = channel_log.next_id;
        channel_log.entries.push((id, payload.clone()));
        Ok(EntryId::from(id.to_string()))
    }

    async fn read_after(
        &self,
        channel: &str,
        cursor: Option<&EntryId>,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let after = Self::parse_cursor(cursor);
        let inner = self.inner.read();
        let Some(channel_log) = inner.get(channel) else {
            return Ok(Vec::new());
        };
        Ok(channel_log
            .entries
            .iter()
            .filter(|(id, _)| *id > after)
            .take(limit)
            .map(|(id, payload)| LogEntry {
                id: EntryId::from(id.to_string()),
                payload: payload.clone(),
            })
            .collect())
    }

    async fn latest_id(&self, channel: &str) -> Result<Option<EntryId>> {
        let inner = self.inner.read();
        Ok(inner
            .get(channel)
            .and_then(|log| log.entries.last())
            .map(|(id, _)| EntryId::from(id.to_string())))
    }
}
