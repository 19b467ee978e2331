//! Keyed session store
//!
//! Live session aggregates are hashes in a keyed store with per-key TTL.
//! The expected backend is Redis; an in-process map with the same hash
//! semantics serves single-node deployments and tests. Each session's hash
//! is only touched by the partition worker that owns the session, so the
//! per-field operations here need no cross-store transactions.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::Client;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;

/// Set index of sessions with live state
const ACTIVE_SET: &str = "sessions:active";

fn session_key(session_id: Uuid) -> String {
    format!("session:{}", session_id)
}

/// One event's worth of hash mutations, applied as a unit
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub session_id: Uuid,

    /// Fields written only when absent (identity, device, started_at)
    pub init: Vec<(&'static str, String)>,

    /// Fields overwritten every time (ended_at, exit_page)
    pub set: Vec<(&'static str, String)>,

    /// Counter increments
    pub incr: Vec<(&'static str, i64)>,

    /// Idle TTL refreshed on the entry
    pub ttl_secs: u64,
}

/// Hash-semantics keyed store for live session state
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Apply one event's mutations and refresh the TTL
    async fn record_event(&self, update: &SessionUpdate) -> Result<()>;

    /// Set a boolean flag field (insight processors mark
    /// has_rage_click/has_dead_click through this)
    async fn set_flag(&self, session_id: Uuid, field: &'static str) -> Result<()>;

    /// Read every field of a session's hash
    async fn snapshot(&self, session_id: Uuid) -> Result<Option<HashMap<String, String>>>;

    /// Drop a session's state after it was flushed to the store
    async fn remove(&self, session_id: Uuid) -> Result<()>;

    /// Sessions that currently hold live state
    async fn active_sessions(&self) -> Result<Vec<Uuid>>;
}

/// Redis-backed store; every `record_event` is one pipelined round trip
pub struct RedisSessionStore {
    conn: ConnectionManager,
}

impl RedisSessionStore {
    pub async fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn record_event(&self, update: &SessionUpdate) -> Result<()> {
        let key = session_key(update.session_id);
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        for (field, value) in &update.init {
            pipe.hset_nx(&key, *field, value).ignore();
        }
        for (field, value) in &update.set {
            pipe.hset(&key, *field, value).ignore();
        }
        for (field, by) in &update.incr {
            pipe.hincr(&key, *field, *by).ignore();
        }
        pipe.sadd(ACTIVE_SET, update.session_id.to_string()).ignore();
        pipe.expire(&key, update.ttl_secs as i64).ignore();

        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn set_flag(&self, session_id: Uuid, field: &'static str) -> Result<()> {
        let key = session_key(session_id);
        let mut conn = self.conn.clone();

        redis::pipe()
            .hset(&key, field, 1).ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn snapshot(&self, session_id: Uuid) -> Result<Option<HashMap<String, String>>> {
        let key = session_key(session_id);
        let mut conn = self.conn.clone();

        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&key)
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(fields))
        }
    }

    async fn remove(&self, session_id: Uuid) -> Result<()> {
        let key = session_key(session_id);
        let mut conn = self.conn.clone();

        redis::pipe()
            .del(&key).ignore()
            .srem(ACTIVE_SET, session_id.to_string()).ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn active_sessions(&self) -> Result<Vec<Uuid>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(ACTIVE_SET)
            .query_async(&mut conn)
            .await?;

        Ok(members
            .iter()
            .filter_map(|m| Uuid::parse_str(m).ok())
            .collect())
    }
}

/// In-process store with the same hash semantics.
///
/// TTLs are not enforced here; the idle-session scan is what reclaims
/// state in single-node mode.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<Uuid, HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn record_event(&self, update: &SessionUpdate) -> Result<()> {
        let mut entry = self.sessions.entry(update.session_id).or_default();

        for (field, value) in &update.init {
            entry
                .entry((*field).to_string())
                .or_insert_with(|| value.clone());
        }
        for (field, value) in &update.set {
            entry.insert((*field).to_string(), value.clone());
        }
        for (field, by) in &update.incr {
            let counter = entry.entry((*field).to_string()).or_insert_with(|| "0".into());
            let current: i64 = counter.parse().unwrap_or(0);
            *counter = (current + by).to_string();
        }
        Ok(())
    }

    async fn set_flag(&self, session_id: Uuid, field: &'static str) -> Result<()> {
        self.sessions
            .entry(session_id)
            .or_default()
            .insert(field.to_string(), "1".to_string());
        Ok(())
    }

    async fn snapshot(&self, session_id: Uuid) -> Result<Option<HashMap<String, String>>> {
        Ok(self.sessions.get(&session_id).map(|e| e.value().clone()))
    }

    async fn remove(&self, session_id: Uuid) -> Result<()> {
        self.sessions.remove(&session_id);
        Ok(())
    }

    async fn active_sessions(&self) -> Result<Vec<Uuid>> {
        Ok(self.sessions.iter().map(|e| *e.key()).collect())
    }
}
