//! Replay Processor
//!
//! Buffers rrweb chunk messages per session and persists them in
//! `chunk_index` order. A session's buffer flushes when it grows past the
//! configured size, when a full-snapshot chunk arrives (a playback seek
//! checkpoint), when the session goes idle, and at shutdown.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::common::config::ReplayConfig;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::models::rows::ReplayChunkRow;
use crate::schemas::replay::ReplayChunkMessage;

/// Destination for flushed chunk rows
#[async_trait]
pub trait ChunkWriter: Send + Sync {
    async fn write_chunks(&self, rows: &[ReplayChunkRow]) -> Result<()>;
}

struct SessionChunks {
    chunks: Vec<ReplayChunkRow>,
    last_update: Instant,
}

pub struct ReplayProcessor {
    config: ReplayConfig,
    writer: Arc<dyn ChunkWriter>,
    metrics: Arc<Metrics>,
    buffers: DashMap<Uuid, SessionChunks>,
}

impl ReplayProcessor {
    pub fn new(config: ReplayConfig, writer: Arc<dyn ChunkWriter>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            writer,
            metrics,
            buffers: DashMap::new(),
        }
    }

    /// Accept one chunk; flushes the session when it hits a checkpoint or
    /// the buffer limit
    pub async fn handle_chunk(&self, msg: &ReplayChunkMessage) -> Result<()> {
        let row = ReplayChunkRow::from_message(msg);
        let session_id = msg.session_id;

        let should_flush = {
            let mut buffer = self.buffers.entry(session_id).or_insert_with(|| SessionChunks {
                chunks: Vec::new(),
                last_update: Instant::now(),
            });
            buffer.chunks.push(row);
            buffer.last_update = Instant::now();

            msg.has_full_snapshot || buffer.chunks.len() >= self.config.max_chunks_per_session
        };

        self.metrics
            .events_processed
            .with_label_values(&["replay"])
            .inc();

        if should_flush {
            self.flush_session(session_id).await?;
        }
        Ok(())
    }

    /// Persist one session's buffered chunks in index order
    async fn flush_session(&self, session_id: Uuid) -> Result<()> {
        let Some((_, mut buffered)) = self.buffers.remove(&session_id) else {
            return Ok(());
        };
        buffered.chunks.sort_by_key(|c| c.chunk_index);

        let timer = self
            .metrics
            .flush_duration
            .with_label_values(&["replay_chunks"])
            .start_timer();
        let result = self.writer.write_chunks(&buffered.chunks).await;
        timer.observe_duration();

        match result {
            Ok(()) => {
                self.metrics
                    .rows_written
                    .with_label_values(&["replay_chunks"])
                    .inc_by(buffered.chunks.len() as u64);
                debug!(
                    %session_id,
                    chunks = buffered.chunks.len(),
                    "Flushed replay chunks"
                );
                Ok(())
            }
            Err(e) => {
                warn!("Replay flush for {} failed, buffer kept: {}", session_id, e);
                self.metrics
                    .flush_failures
                    .with_label_values(&["replay_chunks"])
                    .inc();

                // Put the chunks back so the next flush retries them;
                // anything that arrived meanwhile stays behind them
                let mut entry = self.buffers.entry(session_id).or_insert_with(|| SessionChunks {
                    chunks: Vec::new(),
                    last_update: Instant::now(),
                });
                let newer = std::mem::take(&mut entry.chunks);
                entry.chunks = buffered.chunks;
                entry.chunks.extend(newer);
                Err(e)
            }
        }
    }

    /// Flush sessions whose buffers have not seen a chunk for the idle
    /// timeout
    pub async fn sweep_idle(&self) -> Result<()> {
        let idle = Duration::from_secs(self.config.idle_timeout_secs);
        let stale: Vec<Uuid> = self
            .buffers
            .iter()
            .filter(|entry| entry.value().last_update.elapsed() >= idle)
            .map(|entry| *entry.key())
            .collect();

        for session_id in stale {
            self.flush_session(session_id).await.ok();
        }
        Ok(())
    }

    /// Flush every buffered session; called at shutdown
    pub async fn flush(&self) -> Result<()> {
        let sessions: Vec<Uuid> = self.buffers.iter().map(|entry| *entry.key()).collect();
        for session_id in sessions {
            self.flush_session(session_id).await.ok();
        }
        Ok(())
    }

    pub fn buffered_sessions(&self) -> usize {
        self.buffers.len()
    }
}

#[async_trait]
impl crate::pipeline::consumer::Processor for ReplayProcessor {
    type Msg = ReplayChunkMessage;

    fn name(&self) -> &'static str {
        "replay"
    }

    async fn process(&self, msg: ReplayChunkMessage) -> Result<()> {
        self.handle_chunk(&msg).await
    }

    async fn flush(&self) -> Result<()> {
        ReplayProcessor::flush(self).await
    }
}
