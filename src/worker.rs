//! Embedding worker pool.
//!
//! Each worker owns a [`WorkerContext`] built once at startup: its own HTTP
//! session to the embedding service and its own vector index handle. Jobs are
//! pulled from one bounded queue, so at most `count` chunks are in flight and
//! the caller's task is never blocked by network I/O it does not await.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embedding::{Embedder, EmbeddingClient};
use crate::error::{IndexError, RemoteError};
use crate::merge::MergedDocument;
use crate::vecdb::{ChromaClient, IndexEntry, QueryFilter, QueryMatch, VectorIndex};

pub struct WorkerContext {
    pub embedder: Box<dyn Embedder>,
    pub index: Box<dyn VectorIndex>,
}

impl WorkerContext {
    pub fn connect(config: &Config) -> Result<Self, RemoteError> {
        let timeout = Duration::from_secs(config.embedding_timeout_secs);
        Ok(Self {
            embedder: Box::new(EmbeddingClient::new(
                &config.embedding_url,
                timeout,
                config.embedding_backoff(),
            )?),
            index: Box::new(ChromaClient::new(&config.vector_db_url, timeout)?),
        })
    }

    /// Embeds every document of `chunk` and upserts it into the channel's
    /// collection, keyed by document id.
    pub async fn insert_chunk(
        &self,
        channel_id: u64,
        chunk: Vec<MergedDocument>,
    ) -> Result<usize, RemoteError> {
        let texts: Vec<String> = chunk.iter().map(|d| d.content.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        let entries: Vec<IndexEntry> = chunk
            .into_iter()
            .zip(vectors)
            .map(|(doc, embedding)| IndexEntry {
                id: doc.id.to_string(),
                document: doc.content,
                at: doc.created_at.timestamp(),
                embedding,
            })
            .collect();
        let count = entries.len();
        self.index.upsert(&channel_id.to_string(), entries).await?;
        Ok(count)
    }

    pub async fn query(
        &self,
        channel_id: u64,
        text: String,
        k: usize,
        filter: QueryFilter,
    ) -> Result<Vec<QueryMatch>, RemoteError> {
        let embedding = self
            .embedder
            .embed(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::Malformed("no embedding for query".to_string()))?;
        self.index
            .query(&channel_id.to_string(), embedding, k, &filter)
            .await
    }
}

enum Job {
    Insert {
        channel_id: u64,
        chunk: Vec<MergedDocument>,
        reply: oneshot::Sender<Result<usize, RemoteError>>,
    },
    Query {
        channel_id: u64,
        text: String,
        k: usize,
        filter: QueryFilter,
        reply: oneshot::Sender<Result<Vec<QueryMatch>, RemoteError>>,
    },
}

type JobQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>;

pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawns `count` workers, building each one's context with `factory`.
    pub fn start<F>(count: usize, mut factory: F) -> Result<Self, RemoteError>
    where
        F: FnMut(usize) -> Result<WorkerContext, RemoteError>,
    {
        let count = count.max(1);
        let (sender, receiver) = mpsc::channel(count);
        let queue: JobQueue = Arc::new(tokio::sync::Mutex::new(receiver));
        let mut handles = Vec::with_capacity(count);
        for id in 0..count {
            let context = factory(id)?;
            handles.push(tokio::spawn(work(id, context, Arc::clone(&queue))));
        }
        info!("Started {} embedding workers", count);
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handles: tokio::sync::Mutex::new(handles),
            size: count,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>, IndexError> {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(IndexError::WorkersClosed)
    }

    pub async fn insert(&self, channel_id: u64, chunk: Vec<MergedDocument>) -> Result<usize, IndexError> {
        let (reply, response) = oneshot::channel();
        self.sender()?
            .send(Job::Insert {
                channel_id,
                chunk,
                reply,
            })
            .await
            .map_err(|_| IndexError::WorkersClosed)?;
        Ok(response.await.map_err(|_| IndexError::WorkersClosed)??)
    }

    pub async fn query(
        &self,
        channel_id: u64,
        text: String,
        k: usize,
        filter: QueryFilter,
    ) -> Result<Vec<QueryMatch>, IndexError> {
        let (reply, response) = oneshot::channel();
        self.sender()?
            .send(Job::Query {
                channel_id,
                text,
                k,
                filter,
                reply,
            })
            .await
            .map_err(|_| IndexError::WorkersClosed)?;
        Ok(response.await.map_err(|_| IndexError::WorkersClosed)??)
    }

    /// Stops accepting jobs, lets queued and running jobs finish, and waits for
    /// every worker to exit.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().unwrap_or_else(|e| e.into_inner()).take());
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Embedding worker ended abnormally: {}", e);
            }
        }
        info!("Embedding workers stopped");
    }
}

async fn work(id: usize, context: WorkerContext, queue: JobQueue) {
    loop {
        let job = queue.lock().await.recv().await;
        let Some(job) = job else { break };
        match job {
            Job::Insert {
                channel_id,
                chunk,
                reply,
            } => {
                debug!(
                    "Worker {} embedding {} documents for channel {}",
                    id,
                    chunk.len(),
                    channel_id
                );
                let _ = reply.send(context.insert_chunk(channel_id, chunk).await);
            }
            Job::Query {
                channel_id,
                text,
                k,
                filter,
                reply,
            } => {
                let _ = reply.send(context.query(channel_id, text, k, filter).await);
            }
        }
    }
    debug!("Worker {} stopped", id);
}
