pub mod channel;
pub mod schema;

use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::error::StoreError;
pub use channel::{ChannelFilter, ChannelRecord, ChannelUpdate, NewChannel};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed set of SQLite connections opened at startup.
///
/// `acquire` suspends until a connection is idle. The returned guard hands the
/// connection back on drop, so early returns and `?` never leak one.
pub struct ConnectionPool {
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    size: usize,
    lost: AtomicUsize,
}

impl ConnectionPool {
    fn new(connections: Vec<Connection>) -> Arc<Self> {
        let size = connections.len();
        Arc::new(Self {
            idle: Mutex::new(connections),
            permits: Arc::new(Semaphore::new(size)),
            size,
            lost: AtomicUsize::new(0),
        })
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, StoreError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::PoolClosed)?;
        let conn = self
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .ok_or(StoreError::PoolClosed)?;
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            permit: Some(permit),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for every outstanding connection to come back, then closes them all.
    pub async fn close(&self) {
        let outstanding = self.size - self.lost.load(Ordering::SeqCst);
        let drained = self.permits.acquire_many(outstanding as u32).await;
        self.permits.close();
        let connections: Vec<Connection> = self
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let count = connections.len();
        for conn in connections {
            if let Err((_, e)) = conn.close() {
                warn!("Database: failed to close connection: {}", e);
            }
        }
        drop(drained);
        info!("Database: closed {} pooled connections", count);
    }
}

pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    /// Runs `f` on the blocking thread pool with exclusive use of the connection.
    pub async fn run<F, T>(&mut self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.take().ok_or(StoreError::PoolClosed)?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&conn);
            (conn, result)
        })
        .await?;
        self.conn = Some(conn);
        Ok(result?)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        match self.conn.take() {
            Some(conn) => self
                .pool
                .idle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(conn),
            None => {
                // The connection died with a cancelled or panicked blocking task;
                // retire its permit so the pool never hands out a phantom slot.
                warn!("Database: pooled connection lost, shrinking pool");
                self.pool.lost.fetch_add(1, Ordering::SeqCst);
                if let Some(permit) = self.permit.take() {
                    permit.forget();
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: Arc<ConnectionPool>,
}

impl Database {
    /// Opens `pool_size` connections to the file at `path` and applies the schema.
    ///
    /// Every pooled connection must see the same database, so `:memory:` is not
    /// a valid path here.
    pub async fn open(path: impl AsRef<Path>, pool_size: usize) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let connections = tokio::task::spawn_blocking(move || -> rusqlite::Result<_> {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        warn!("Database: could not create {}: {}", parent.display(), e);
                    }
                }
            }
            let mut connections = Vec::with_capacity(pool_size);
            for i in 0..pool_size {
                let conn = Connection::open(&path)?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                if i == 0 {
                    conn.pragma_update(None, "journal_mode", "WAL")?;
                    conn.execute_batch(schema::SCHEMA)?;
                }
                connections.push(conn);
            }
            info!(
                "Database: opened {} connections to {}",
                pool_size,
                path.display()
            );
            Ok(connections)
        })
        .await??;

        Ok(Self {
            pool: ConnectionPool::new(connections),
        })
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Runs `f` outside any explicit transaction (autocommit).
    pub async fn run<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = self.pool.acquire().await?;
        conn.run(f).await
    }

    pub async fn get(&self, filter: ChannelFilter) -> Result<Option<ChannelRecord>, StoreError> {
        self.run(move |conn| channel::get(conn, &filter)).await
    }

    pub async fn select(&self, filter: ChannelFilter) -> Result<Vec<ChannelRecord>, StoreError> {
        self.run(move |conn| channel::select(conn, &filter)).await
    }

    /// Starts a write transaction on a pooled connection.
    ///
    /// Dropping the returned [`Transaction`] without calling
    /// [`Transaction::commit`] rolls it back; the connection goes back to the
    /// pool either way.
    pub async fn begin(&self) -> Result<Transaction, StoreError> {
        let mut conn = self.pool.acquire().await?;
        conn.run(|c| c.execute_batch("BEGIN IMMEDIATE")).await?;
        debug!("Database: transaction started");
        Ok(Transaction {
            conn: Some(conn),
            finished: false,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub struct Transaction {
    conn: Option<PooledConnection>,
    finished: bool,
}

impl Transaction {
    async fn run<F, T>(&mut self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .as_mut()
            .ok_or(StoreError::PoolClosed)?
            .run(f)
            .await
    }

    pub async fn get(&mut self, filter: ChannelFilter) -> Result<Option<ChannelRecord>, StoreError> {
        self.run(move |conn| channel::get(conn, &filter)).await
    }

    pub async fn select(&mut self, filter: ChannelFilter) -> Result<Vec<ChannelRecord>, StoreError> {
        self.run(move |conn| channel::select(conn, &filter)).await
    }

    pub async fn insert(&mut self, new: NewChannel) -> Result<ChannelRecord, StoreError> {
        self.run(move |conn| channel::insert(conn, &new)).await
    }

    pub async fn get_or_insert(&mut self, new: NewChannel) -> Result<ChannelRecord, StoreError> {
        self.run(move |conn| channel::get_or_insert(conn, &new)).await
    }

    pub async fn update(
        &mut self,
        changes: ChannelUpdate,
        filter: ChannelFilter,
    ) -> Result<usize, StoreError> {
        self.run(move |conn| channel::update(conn, &changes, &filter))
            .await
    }

    pub async fn delete(&mut self, filter: ChannelFilter) -> Result<usize, StoreError> {
        self.run(move |conn| channel::delete(conn, &filter)).await
    }

    pub async fn commit(mut self) -> Result<(), StoreError> {
        self.finished = true;
        let result = self.run(|c| c.execute_batch("COMMIT")).await;
        if result.is_err() {
            self.finished = false;
        }
        result
    }

    pub async fn rollback(mut self) -> Result<(), StoreError> {
        self.finished = true;
        self.run(|c| c.execute_batch("ROLLBACK")).await
    }
}

fn roll_back(pooled: PooledConnection) {
    if let Some(conn) = pooled.conn.as_ref() {
        debug!("Database: rolling back unfinished transaction");
        if let Err(e) = conn.execute_batch("ROLLBACK") {
            warn!("Database: rollback failed: {}", e);
        }
    }
}

impl Drop for Transaction {
    /// The connection only goes back to the pool once the rollback has run,
    /// on the blocking pool when a runtime is available.
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(pooled) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || roll_back(pooled));
            }
            Err(_) => roll_back(pooled),
        }
    }
}
