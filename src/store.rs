//! Durable Store: the crash-safe record of processed deposits, pending
//! mirrors, and the source-chain watermark. One logical writer — the
//! Relayer — goes through this trait for every mutation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::StoreError;
use crate::model::{
    BridgeState, DepositEvent, PendingMirror, ProcessedDeposit, ProcessedStatus, Watermark,
};

/// Durable Store contract. Expressed with return-position
/// `impl Future` rather than `async_trait` since every call site in
/// this crate holds a concrete store type (`SqliteStore` in
/// production, `InMemoryStore` in tests) — no `dyn` dispatch needed.
pub trait DurableStore: Send + Sync + 'static {
    fn add_processed_deposit(
        &self,
        processed: &ProcessedDeposit,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn add_pending_mirror(
        &self,
        pending: &PendingMirror,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn update_pending_mirror(
        &self,
        deposit_tx_hash: &str,
        retry_count: u32,
        error_message: Option<String>,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    fn remove_pending_mirror(
        &self,
        deposit_tx_hash: &str,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Removes the pending mirror and inserts the processed deposit in
    /// one durable transaction — the exactly-once boundary between
    /// at-least-once delivery and confirmed state.
    fn promote_to_processed(
        &self,
        deposit_tx_hash: &str,
        processed: &ProcessedDeposit,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn load_bridge_state(
        &self,
    ) -> impl std::future::Future<Output = Result<BridgeState, StoreError>> + Send;

    fn save_watermark(
        &self,
        watermark: &Watermark,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn close(&self) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// SQLite-backed production store
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    conn: AsyncMutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS processed_deposits (
                transaction_hash TEXT PRIMARY KEY,
                processed_at INTEGER NOT NULL,
                mirror_tx_hash TEXT NOT NULL,
                status INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS pending_mirrors (
                deposit_tx_hash TEXT PRIMARY KEY,
                deposit_data TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                last_retry_at INTEGER NOT NULL,
                error_message TEXT
            );
            CREATE TABLE IF NOT EXISTS bridge_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self {
            conn: AsyncMutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }
}

fn status_to_int(status: ProcessedStatus) -> i64 {
    match status {
        ProcessedStatus::Confirmed => 0,
        ProcessedStatus::FailedTerminal => 1,
    }
}

fn int_to_status(value: i64) -> ProcessedStatus {
    match value {
        0 => ProcessedStatus::Confirmed,
        _ => ProcessedStatus::FailedTerminal,
    }
}

fn deposit_row_to_processed(
    tx_hash: String,
    processed_at: i64,
    mirror_tx_hash: String,
    status: i64,
) -> ProcessedDeposit {
    ProcessedDeposit {
        deposit_tx_hash: tx_hash,
        processed_at: processed_at as u64,
        mirror_tx_hash,
        status: int_to_status(status),
    }
}

fn encode_deposit(deposit: &DepositEvent) -> Result<String, StoreError> {
    serde_json::to_string(deposit).map_err(|e| StoreError::Backend(e.to_string()))
}

fn decode_deposit(raw: &str) -> Result<DepositEvent, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Backend(e.to_string()))
}

impl DurableStore for SqliteStore {
    async fn add_processed_deposit(&self, processed: &ProcessedDeposit) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let processed = processed.clone();
        conn.execute(
            "INSERT INTO processed_deposits (transaction_hash, processed_at, mirror_tx_hash, status)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(transaction_hash) DO UPDATE SET
                processed_at = excluded.processed_at,
                mirror_tx_hash = excluded.mirror_tx_hash,
                status = excluded.status",
            params![
                processed.deposit_tx_hash,
                processed.processed_at as i64,
                processed.mirror_tx_hash,
                status_to_int(processed.status),
            ],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn add_pending_mirror(&self, pending: &PendingMirror) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let deposit_data = encode_deposit(&pending.deposit)?;
        conn.execute(
            "INSERT INTO pending_mirrors
                (deposit_tx_hash, deposit_data, retry_count, last_retry_at, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(deposit_tx_hash) DO UPDATE SET
                deposit_data = excluded.deposit_data,
                retry_count = excluded.retry_count,
                last_retry_at = excluded.last_retry_at,
                error_message = excluded.error_message",
            params![
                pending.deposit_tx_hash,
                deposit_data,
                pending.retry_count,
                pending.last_retry_at as i64,
                pending.error_message,
            ],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn update_pending_mirror(
        &self,
        deposit_tx_hash: &str,
        retry_count: u32,
        error_message: Option<String>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE pending_mirrors
                 SET retry_count = ?2, last_retry_at = ?3, error_message = ?4
                 WHERE deposit_tx_hash = ?1",
                params![deposit_tx_hash, retry_count, now_epoch_ms() as i64, error_message],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(changed > 0)
    }

    async fn remove_pending_mirror(&self, deposit_tx_hash: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM pending_mirrors WHERE deposit_tx_hash = ?1",
            params![deposit_tx_hash],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn promote_to_processed(
        &self,
        deposit_tx_hash: &str,
        processed: &ProcessedDeposit,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        tx.execute(
            "DELETE FROM pending_mirrors WHERE deposit_tx_hash = ?1",
            params![deposit_tx_hash],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        tx.execute(
            "INSERT INTO processed_deposits (transaction_hash, processed_at, mirror_tx_hash, status)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(transaction_hash) DO UPDATE SET
                processed_at = excluded.processed_at,
                mirror_tx_hash = excluded.mirror_tx_hash,
                status = excluded.status",
            params![
                processed.deposit_tx_hash,
                processed.processed_at as i64,
                processed.mirror_tx_hash,
                status_to_int(processed.status),
            ],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        tx.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn load_bridge_state(&self) -> Result<BridgeState, StoreError> {
        let conn = self.conn.lock().await;

        let mut processed_stmt = conn
            .prepare("SELECT transaction_hash, processed_at, mirror_tx_hash, status FROM processed_deposits")
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let processed_deposits = processed_stmt
            .query_map([], |row| {
                Ok(deposit_row_to_processed(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                ))
            })
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut pending_stmt = conn
            .prepare(
                "SELECT deposit_tx_hash, deposit_data, retry_count, last_retry_at, error_message
                 FROM pending_mirrors",
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let pending_rows = pending_stmt
            .query_map([], |row| {
                let tx_hash: String = row.get(0)?;
                let deposit_data: String = row.get(1)?;
                let retry_count: u32 = row.get(2)?;
                let last_retry_at: i64 = row.get(3)?;
                let error_message: Option<String> = row.get(4)?;
                Ok((tx_hash, deposit_data, retry_count, last_retry_at, error_message))
            })
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut pending_mirrors = Vec::with_capacity(pending_rows.len());
        for (tx_hash, deposit_data, retry_count, last_retry_at, error_message) in pending_rows {
            let deposit = decode_deposit(&deposit_data)?;
            pending_mirrors.push(PendingMirror {
                deposit_tx_hash: tx_hash,
                deposit,
                retry_count,
                last_retry_at: last_retry_at as u64,
                error_message,
            });
        }

        let watermark = load_watermark(&conn)?;

        Ok(BridgeState {
            processed_deposits,
            pending_mirrors,
            watermark,
        })
    }

    async fn save_watermark(&self, watermark: &Watermark) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO bridge_config (key, value) VALUES ('lastProcessedSlot', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![watermark.last_processed_slot.to_string()],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute(
            "INSERT INTO bridge_config (key, value) VALUES ('lastProcessedBlockHash', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![watermark.last_processed_block_hash],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        debug!("closing sqlite durable store");
        Ok(())
    }
}

fn load_watermark(conn: &Connection) -> Result<Watermark, StoreError> {
    let slot: Option<String> = conn
        .query_row(
            "SELECT value FROM bridge_config WHERE key = 'lastProcessedSlot'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let block_hash: Option<String> = conn
        .query_row(
            "SELECT value FROM bridge_config WHERE key = 'lastProcessedBlockHash'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StoreError::Backend(e.to_string()))?;

    match (slot, block_hash) {
        (Some(slot), Some(block_hash)) => Ok(Watermark {
            last_processed_slot: slot.parse().unwrap_or(0),
            last_processed_block_hash: block_hash,
        }),
        _ => Ok(Watermark::genesis()),
    }
}

// ---------------------------------------------------------------------------
// In-memory store (tests / fake-adapter harness)
// ---------------------------------------------------------------------------

pub struct InMemoryStore {
    processed: DashMap<String, ProcessedDeposit>,
    pending: DashMap<String, PendingMirror>,
    watermark: AsyncMutex<Watermark>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            processed: DashMap::new(),
            pending: DashMap::new(),
            watermark: AsyncMutex::new(Watermark::genesis()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableStore for InMemoryStore {
    async fn add_processed_deposit(&self, processed: &ProcessedDeposit) -> Result<(), StoreError> {
        self.processed
            .insert(processed.deposit_tx_hash.clone(), processed.clone());
        Ok(())
    }

    async fn add_pending_mirror(&self, pending: &PendingMirror) -> Result<(), StoreError> {
        self.pending
            .insert(pending.deposit_tx_hash.clone(), pending.clone());
        Ok(())
    }

    async fn update_pending_mirror(
        &self,
        deposit_tx_hash: &str,
        retry_count: u32,
        error_message: Option<String>,
    ) -> Result<bool, StoreError> {
        match self.pending.get_mut(deposit_tx_hash) {
            Some(mut entry) => {
                entry.retry_count = retry_count;
                entry.last_retry_at = now_epoch_ms();
                entry.error_message = error_message;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_pending_mirror(&self, deposit_tx_hash: &str) -> Result<(), StoreError> {
        self.pending.remove(deposit_tx_hash);
        Ok(())
    }

    async fn promote_to_processed(
        &self,
        deposit_tx_hash: &str,
        processed: &ProcessedDeposit,
    ) -> Result<(), StoreError> {
        self.pending.remove(deposit_tx_hash);
        self.processed
            .insert(processed.deposit_tx_hash.clone(), processed.clone());
        Ok(())
    }

    async fn load_bridge_state(&self) -> Result<BridgeState, StoreError> {
        let processed_deposits = self.processed.iter().map(|e| e.value().clone()).collect();
        let pending_mirrors = self.pending.iter().map(|e| e.value().clone()).collect();
        let watermark = self.watermark.lock().await.clone();
        Ok(BridgeState {
            processed_deposits,
            pending_mirrors,
            watermark,
        })
    }

    async fn save_watermark(&self, watermark: &Watermark) -> Result<(), StoreError> {
        *self.watermark.lock().await = watermark.clone();
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Opens the production SQLite-backed store at the given path, wrapped
/// for shared ownership across the Relayer and Supervisor.
pub fn build_sqlite_store(path: &str) -> Result<Arc<SqliteStore>, StoreError> {
    Ok(Arc::new(SqliteStore::open(path)?))
}
