use chrono::{DateTime, SubsecRound, Utc};
use futures::future::try_join_all;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{ChannelFilter, ChannelRecord, ChannelUpdate, Database, NewChannel};
use crate::error::IndexError;
use crate::merge::{into_chunks, MessageMerger};
use crate::scheduler::SyncGate;
use crate::source::MessageSource;
use crate::vecdb::{collection_metadata, QueryFilter, QueryMatch, VectorIndex};
use crate::worker::WorkerPool;

/// A channel as the command layer sees it: its id and the guild it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTarget {
    pub id: u64,
    pub guild: u64,
}

/// Rejects a channel outside the guild the caller is acting in.
pub fn ensure_scope(target: ChannelTarget, caller_guild: u64) -> Result<(), IndexError> {
    if target.guild == caller_guild {
        Ok(())
    } else {
        Err(IndexError::Validation {
            channel: target.id,
            guild: caller_guild,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub channel_id: u64,
    pub messages: usize,
    pub documents: usize,
    pub chunks: usize,
    pub watermark: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatus {
    pub record: ChannelRecord,
    /// `None` when the vector index could not be asked.
    pub documents: Option<usize>,
}

fn collection(channel_id: u64) -> String {
    channel_id.to_string()
}

/// Channel lifecycle and the per-channel sync pipeline.
///
/// A row exists only while its collection does: collections are created
/// before rows and removed before rows, and a failed vector index call leaves
/// the table untouched.
pub struct ChannelIndexer {
    db: Database,
    index: Arc<dyn VectorIndex>,
    workers: Arc<WorkerPool>,
    source: Arc<dyn MessageSource>,
    merger: MessageMerger,
    chunk_size: usize,
    metadata: Value,
    gate: SyncGate,
}

impl ChannelIndexer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        index: Arc<dyn VectorIndex>,
        workers: Arc<WorkerPool>,
        source: Arc<dyn MessageSource>,
        merger: MessageMerger,
        chunk_size: usize,
        metric: &str,
        gate: SyncGate,
    ) -> Self {
        Self {
            db,
            index,
            workers,
            source,
            merger,
            chunk_size: chunk_size.max(1),
            metadata: collection_metadata(metric),
            gate,
        }
    }

    /// Creates the channel's collection, then its row.
    ///
    /// The vector index is called before the write transaction starts, so a
    /// slow index never holds the database write lock. If the row cannot be
    /// written afterwards, a collection created by this call is removed again.
    pub async fn enable(&self, target: ChannelTarget) -> Result<ChannelRecord, IndexError> {
        let existing = self.db.get(ChannelFilter::id(target.id)).await?;
        if let Some(existing) = &existing {
            if existing.guild != target.guild {
                return Err(IndexError::Validation {
                    channel: target.id,
                    guild: target.guild,
                });
            }
        }
        self.index
            .get_or_create(&collection(target.id), &self.metadata)
            .await?;

        match self.write_enabled(target).await {
            Ok(record) => {
                info!("Indexing enabled for channel {}", target.id);
                Ok(record)
            }
            Err(e) => {
                if existing.is_none() {
                    self.drop_orphan(target.id).await;
                }
                Err(e)
            }
        }
    }

    async fn write_enabled(&self, target: ChannelTarget) -> Result<ChannelRecord, IndexError> {
        let mut tx = self.db.begin().await?;
        if let Some(existing) = tx.get(ChannelFilter::id(target.id)).await? {
            if existing.guild != target.guild {
                return Err(IndexError::Validation {
                    channel: target.id,
                    guild: target.guild,
                });
            }
        }
        let new = NewChannel {
            id: target.id,
            guild: target.guild,
        };
        tx.get_or_insert(new).await?;
        tx.update(ChannelUpdate::enabled(true), ChannelFilter::id(target.id))
            .await?;
        let record = tx
            .get(ChannelFilter::id(target.id))
            .await?
            .ok_or(IndexError::NotFound(target.id))?;
        tx.commit().await?;
        Ok(record)
    }

    /// Best effort: a collection left without a row is removed.
    async fn drop_orphan(&self, channel_id: u64) {
        match self.index.delete(&collection(channel_id)).await {
            Ok(()) => debug!("Removed collection of channel {} after failed enable", channel_id),
            Err(e) if e.status() == Some(404) => {}
            Err(e) => warn!("Collection of channel {} left without a row: {}", channel_id, e),
        }
    }

    /// Pauses scheduled syncs; row, collection and watermark stay.
    pub async fn disable(&self, channel_id: u64, guild: u64) -> Result<(), IndexError> {
        let mut tx = self.db.begin().await?;
        let changed = tx
            .update(
                ChannelUpdate::enabled(false),
                ChannelFilter::id(channel_id).with_guild(guild),
            )
            .await?;
        if changed == 0 {
            return Err(IndexError::NotFound(channel_id));
        }
        tx.commit().await?;
        info!("Indexing disabled for channel {}", channel_id);
        Ok(())
    }

    /// Drops the channel's row and its collection.
    pub async fn forget(&self, channel_id: u64, guild: u64) -> Result<(), IndexError> {
        if self
            .remove(ChannelFilter::id(channel_id).with_guild(guild))
            .await?
        {
            Ok(())
        } else {
            Err(IndexError::NotFound(channel_id))
        }
    }

    /// Like [`forget`](Self::forget) but for channels deleted upstream, where
    /// no caller scope applies. Returns whether anything was indexed.
    pub async fn forget_channel(&self, channel_id: u64) -> Result<bool, IndexError> {
        self.remove(ChannelFilter::id(channel_id)).await
    }

    /// Deletes the collection first and the row second, neither under the
    /// write lock of the other. A failed row delete leaves a row whose
    /// collection is already gone; forgetting again finishes the job.
    async fn remove(&self, filter: ChannelFilter) -> Result<bool, IndexError> {
        let Some(record) = self.db.get(filter.clone()).await? else {
            return Ok(false);
        };
        match self.index.delete(&collection(record.id)).await {
            Ok(()) => {}
            Err(e) if e.status() == Some(404) => {
                warn!("Collection of channel {} was already gone", record.id)
            }
            Err(e) => return Err(e.into()),
        }
        let mut tx = self.db.begin().await?;
        tx.delete(filter).await?;
        tx.commit().await?;
        info!("Forgot channel {}", record.id);
        Ok(true)
    }

    /// Out-of-schedule sync of one channel, serialized with scheduled cycles.
    pub async fn sync_channel(&self, channel_id: u64, guild: u64) -> Result<SyncReport, IndexError> {
        let _gate = self.gate.enter().await;
        let record = self
            .db
            .get(ChannelFilter::id(channel_id).with_guild(guild))
            .await?
            .ok_or(IndexError::NotFound(channel_id))?;
        self.collect(&record).await
    }

    /// Indexes everything in `[record.last_sync, now)` and then advances the
    /// watermark to `now`. Callers must hold the sync gate.
    ///
    /// The watermark only moves once every chunk has been upserted; a failure
    /// leaves it in place and the next run reprocesses the same window.
    pub async fn collect(&self, record: &ChannelRecord) -> Result<SyncReport, IndexError> {
        let now = Utc::now().trunc_subsecs(0);
        let messages = self
            .source
            .history(record.id, record.last_sync, now)
            .await
            .map_err(IndexError::Source)?;
        let message_count = messages.len();

        let documents = self.merger.merge(messages, self.source.as_ref());
        let document_count = documents.len();
        let chunks = into_chunks(documents, self.chunk_size);
        let chunk_count = chunks.len();
        debug!(
            "Channel {}: {} messages, {} documents, {} chunks",
            record.id, message_count, document_count, chunk_count
        );

        try_join_all(
            chunks
                .into_iter()
                .map(|chunk| self.workers.insert(record.id, chunk)),
        )
        .await?;

        let mut tx = self.db.begin().await?;
        tx.update(ChannelUpdate::watermark(now), ChannelFilter::id(record.id))
            .await?;
        tx.commit().await?;

        if document_count > 0 {
            info!(
                "Channel {}: indexed {} documents from {} messages",
                record.id, document_count, message_count
            );
        }
        Ok(SyncReport {
            channel_id: record.id,
            messages: message_count,
            documents: document_count,
            chunks: chunk_count,
            watermark: now,
        })
    }

    /// The `k` documents closest to `text` in the channel's collection.
    pub async fn query(
        &self,
        channel_id: u64,
        guild: u64,
        text: &str,
        k: usize,
    ) -> Result<Vec<QueryMatch>, IndexError> {
        self.db
            .get(ChannelFilter::id(channel_id).with_guild(guild))
            .await?
            .ok_or(IndexError::NotFound(channel_id))?;
        self.workers
            .query(channel_id, text.to_string(), k.max(1), QueryFilter::default())
            .await
    }

    pub async fn list(&self, guild: u64) -> Result<Vec<ChannelStatus>, IndexError> {
        let records = self.db.select(ChannelFilter::guild(guild)).await?;
        let mut statuses = Vec::with_capacity(records.len());
        for record in records {
            let documents = match self.index.count(&collection(record.id)).await {
                Ok(n) => Some(n),
                Err(e) => {
                    warn!("Could not count documents of channel {}: {}", record.id, e);
                    None
                }
            };
            statuses.push(ChannelStatus { record, documents });
        }
        Ok(statuses)
    }

    pub async fn enabled_channels(&self) -> Result<Vec<ChannelRecord>, IndexError> {
        Ok(self.db.select(ChannelFilter::enabled()).await?)
    }
}
