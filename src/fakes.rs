//! In-process stand-ins for the Discord API, the embedding service, the vector
//! index and the presence indicator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::db::{Database, NewChannel};
use crate::embedding::Embedder;
use crate::error::{RemoteError, SourceError};
use crate::indexer::ChannelIndexer;
use crate::merge::{MessageMerger, RawMessage, ReplyResolver};
use crate::scheduler::{StatusIndicator, SyncGate};
use crate::source::MessageSource;
use crate::vecdb::{IndexEntry, QueryFilter, QueryMatch, VectorIndex};
use crate::worker::{WorkerContext, WorkerPool};

/// User id the fake bot runs as.
pub const BOT_ID: u64 = 999;

fn status(code: u16, body: &str) -> RemoteError {
    RemoteError::Status {
        url: "memory://".to_string(),
        status: code,
        body: body.to_string(),
        retry_after: None,
    }
}

/// Letter-frequency vectors: identical texts embed identically.
#[derive(Clone, Default)]
pub struct FakeEmbedder {
    fail_on: Option<String>,
    delay: Duration,
    pub calls: Arc<AtomicUsize>,
}

impl FakeEmbedder {
    pub fn failing_on(needle: &str) -> Self {
        Self {
            fail_on: Some(needle.to_string()),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 27];
        for c in text.to_lowercase().chars() {
            match c {
                'a'..='z' => v[(c as u8 - b'a') as usize] += 1.0,
                _ => v[26] += 0.1,
            }
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(f32::EPSILON);
        v.iter().map(|x| x / norm).collect()
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(needle) = &self.fail_on {
            if texts.iter().any(|t| t.contains(needle.as_str())) {
                return Err(status(500, "embedding failed"));
            }
        }
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Shared in-memory vector index; clones see the same collections.
#[derive(Clone, Default)]
pub struct MemoryIndex {
    collections: Arc<Mutex<HashMap<String, BTreeMap<String, IndexEntry>>>>,
    fail_create: Arc<Mutex<bool>>,
}

impl MemoryIndex {
    pub fn exists(&self, collection: &str) -> bool {
        self.collections.lock().unwrap().contains_key(collection)
    }

    /// Entries ordered by id, or `None` when the collection does not exist.
    pub fn entries(&self, collection: &str) -> Option<Vec<IndexEntry>> {
        self.collections
            .lock()
            .unwrap()
            .get(collection)
            .map(|c| c.values().cloned().collect())
    }

    pub fn fail_creates(&self, fail: bool) {
        *self.fail_create.lock().unwrap() = fail;
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn get_or_create(&self, collection: &str, _metadata: &Value) -> Result<(), RemoteError> {
        if *self.fail_create.lock().unwrap() {
            return Err(status(503, "index unavailable"));
        }
        self.collections
            .lock()
            .unwrap()
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn delete(&self, collection: &str) -> Result<(), RemoteError> {
        match self.collections.lock().unwrap().remove(collection) {
            Some(_) => Ok(()),
            None => Err(status(404, "no such collection")),
        }
    }

    async fn upsert(&self, collection: &str, entries: Vec<IndexEntry>) -> Result<(), RemoteError> {
        let mut collections = self.collections.lock().unwrap();
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| status(404, "no such collection"))?;
        for entry in entries {
            target.insert(entry.id.clone(), entry);
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        embedding: Vec<f32>,
        k: usize,
        _filter: &QueryFilter,
    ) -> Result<Vec<QueryMatch>, RemoteError> {
        let collections = self.collections.lock().unwrap();
        let target = collections
            .get(collection)
            .ok_or_else(|| status(404, "no such collection"))?;
        let mut matches: Vec<QueryMatch> = target
            .values()
            .map(|entry| {
                let dot: f32 = entry
                    .embedding
                    .iter()
                    .zip(&embedding)
                    .map(|(a, b)| a * b)
                    .sum();
                QueryMatch {
                    id: entry.id.clone(),
                    distance: 1.0 - dot,
                    document: Some(entry.document.clone()),
                    at: Some(entry.at),
                }
            })
            .collect();
        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        matches.truncate(k);
        Ok(matches)
    }

    async fn count(&self, collection: &str) -> Result<usize, RemoteError> {
        self.collections
            .lock()
            .unwrap()
            .get(collection)
            .map(BTreeMap::len)
            .ok_or_else(|| status(404, "no such collection"))
    }
}

/// [`MemoryIndex`] whose collection creation is slow, and can write a row
/// claiming the channel for another guild while it is in progress.
pub struct HookedIndex {
    pub inner: MemoryIndex,
    pub create_delay: Duration,
    pub on_create: Option<(Database, NewChannel)>,
}

#[async_trait]
impl VectorIndex for HookedIndex {
    async fn get_or_create(&self, collection: &str, metadata: &Value) -> Result<(), RemoteError> {
        tokio::time::sleep(self.create_delay).await;
        if let Some((db, claim)) = &self.on_create {
            let mut tx = db.begin().await.unwrap();
            tx.insert(*claim).await.unwrap();
            tx.commit().await.unwrap();
        }
        self.inner.get_or_create(collection, metadata).await
    }

    async fn delete(&self, collection: &str) -> Result<(), RemoteError> {
        self.inner.delete(collection).await
    }

    async fn upsert(&self, collection: &str, entries: Vec<IndexEntry>) -> Result<(), RemoteError> {
        self.inner.upsert(collection, entries).await
    }

    async fn query(
        &self,
        collection: &str,
        embedding: Vec<f32>,
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<QueryMatch>, RemoteError> {
        self.inner.query(collection, embedding, k, filter).await
    }

    async fn count(&self, collection: &str) -> Result<usize, RemoteError> {
        self.inner.count(collection).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryCall {
    pub channel_id: u64,
    pub after: DateTime<Utc>,
    pub before: DateTime<Utc>,
}

/// Channel histories held in memory, with call tracing.
#[derive(Default)]
pub struct FakeSource {
    messages: Mutex<HashMap<u64, Vec<RawMessage>>>,
    replies: Mutex<HashMap<u64, RawMessage>>,
    failing: Mutex<HashSet<u64>>,
    delay: Mutex<Duration>,
    calls: Mutex<Vec<HistoryCall>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeSource {
    pub fn push(&self, channel_id: u64, message: RawMessage) {
        self.replies
            .lock()
            .unwrap()
            .insert(message.id, message.clone());
        self.messages
            .lock()
            .unwrap()
            .entry(channel_id)
            .or_default()
            .push(message);
    }

    pub fn fail(&self, channel_id: u64, fail: bool) {
        let mut failing = self.failing.lock().unwrap();
        if fail {
            failing.insert(channel_id);
        } else {
            failing.remove(&channel_id);
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<HistoryCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl ReplyResolver for FakeSource {
    fn resolve_reply(&self, message: &RawMessage) -> Option<RawMessage> {
        let id = message.reply_to?;
        self.replies.lock().unwrap().get(&id).cloned()
    }
}

#[async_trait]
impl MessageSource for FakeSource {
    async fn history(
        &self,
        channel_id: u64,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Vec<RawMessage>, SourceError> {
        self.calls.lock().unwrap().push(HistoryCall {
            channel_id,
            after,
            before,
        });
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(&channel_id) {
            return Err(format!("history of {channel_id} unavailable").into());
        }
        let messages = self
            .messages
            .lock()
            .unwrap()
            .get(&channel_id)
            .map(|all| {
                all.iter()
                    .filter(|m| m.created_at >= after && m.created_at < before)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(messages)
    }
}

#[derive(Default)]
pub struct RecordingStatus {
    history: Mutex<Vec<Option<String>>>,
}

impl RecordingStatus {
    pub fn history(&self) -> Vec<Option<String>> {
        self.history.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusIndicator for RecordingStatus {
    async fn set(&self, status: Option<&str>) {
        self.history
            .lock()
            .unwrap()
            .push(status.map(str::to_string));
    }
}

/// Indexer wired to fakes over a fresh on-disk database.
pub struct Harness {
    _dir: tempfile::TempDir,
    pub db: Database,
    pub index: MemoryIndex,
    pub source: Arc<FakeSource>,
    pub workers: Arc<WorkerPool>,
    pub gate: SyncGate,
    pub indexer: Arc<ChannelIndexer>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_embedder(FakeEmbedder::default(), 128).await
    }

    pub async fn with_embedder(embedder: FakeEmbedder, chunk_size: usize) -> Self {
        Self::build(embedder, chunk_size, |index, _| Arc::new(index)).await
    }

    /// The indexer talks to whatever `wrap` builds around the shared index;
    /// the workers always use the plain one.
    pub async fn with_index<F>(wrap: F) -> Self
    where
        F: FnOnce(MemoryIndex, Database) -> Arc<dyn VectorIndex>,
    {
        Self::build(FakeEmbedder::default(), 128, wrap).await
    }

    async fn build<F>(embedder: FakeEmbedder, chunk_size: usize, wrap: F) -> Self
    where
        F: FnOnce(MemoryIndex, Database) -> Arc<dyn VectorIndex>,
    {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("faqdex.db"), 4).await.unwrap();
        let index = MemoryIndex::default();
        let source = Arc::new(FakeSource::default());
        let workers = Arc::new(
            WorkerPool::start(2, |_| {
                Ok(WorkerContext {
                    embedder: Box::new(embedder.clone()),
                    index: Box::new(index.clone()),
                })
            })
            .unwrap(),
        );
        let gate = SyncGate::new();
        let indexer = Arc::new(ChannelIndexer::new(
            db.clone(),
            wrap(index.clone(), db.clone()),
            Arc::clone(&workers),
            Arc::clone(&source) as Arc<dyn MessageSource>,
            MessageMerger::new(BOT_ID, "?"),
            chunk_size,
            "cosine",
            gate.clone(),
        ));
        Self {
            _dir: dir,
            db,
            index,
            source,
            workers,
            gate,
            indexer,
        }
    }
}
