//! SQLite state manager

use super::model::{
    HistoryRecord, NewPendingTx, NewReadyTx, NewTxHistory, OperatorSignature, PendingTx,
    ReadyTx, TokenAmount, TxHistory, TxStatus, UNASSIGNED_ORDER,
};
use crate::config::DatabaseConfig;
use crate::error::{WatcherError, WatcherResult};

use ethers::types::H256;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info};

const READY_COLUMNS: &str =
    "id, from_amount, to_amount, tx_hash, payload, available_from, send_date, progress_here";
const PENDING_COLUMNS: &str =
    "id, ready_tx_id, round, order_index, proof_hash, operator_signature, progress_here";
const HISTORY_COLUMNS: &str = "id, pending_tx_id, tx_id, tx_date, from_amount, to_amount, status";

/// State manager for SQLite persistence
pub struct StateManager {
    pool: SqlitePool,
    /// Serialises find-then-mutate on cycles
    cycle_lock: Mutex<()>,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> WatcherResult<Self> {
        // An in-memory database lives only as long as its connection
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(&config.url)
            .await?;

        Ok(Self {
            pool,
            cycle_lock: Mutex::new(()),
        })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> WatcherResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ready_txs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_amount TEXT NOT NULL,
                to_amount TEXT NOT NULL,
                tx_hash TEXT NOT NULL,
                payload TEXT NOT NULL,
                available_from INTEGER NOT NULL,
                send_date INTEGER NOT NULL,
                progress_here INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_txs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ready_tx_id INTEGER NOT NULL,
                round INTEGER NOT NULL,
                order_index INTEGER NOT NULL DEFAULT -1,
                proof_hash TEXT NOT NULL,
                operator_signature TEXT,
                progress_here INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pending_ready
            ON pending_txs (ready_tx_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pending_progress
            ON pending_txs (progress_here)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tx_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pending_tx_id INTEGER NOT NULL,
                tx_id TEXT NOT NULL,
                tx_date INTEGER NOT NULL,
                from_amount TEXT NOT NULL,
                to_amount TEXT NOT NULL,
                status TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_history_pending
            ON tx_history (pending_tx_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> WatcherResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // Ready transactions

    /// Store a ready transaction
    pub async fn insert_ready_tx(&self, ready: &NewReadyTx) -> WatcherResult<ReadyTx> {
        let result = sqlx::query(
            r#"
            INSERT INTO ready_txs
                (from_amount, to_amount, tx_hash, payload, available_from, send_date, progress_here)
            VALUES ($1, $2, $3, $4, $5, $6, 1)
            "#,
        )
        .bind(serde_json::to_string(&ready.from)?)
        .bind(serde_json::to_string(&ready.to)?)
        .bind(hash_to_hex(&ready.tx_hash))
        .bind(serde_json::to_string(&ready.tx)?)
        .bind(ready.available_from as i64)
        .bind(ready.send_date)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("Stored ready tx {} ({:?})", id, ready.tx_hash);

        Ok(ReadyTx {
            id,
            from: ready.from.clone(),
            to: ready.to.clone(),
            tx_hash: ready.tx_hash,
            tx: ready.tx.clone(),
            available_from: ready.available_from,
            send_date: ready.send_date,
            progress_here: true,
        })
    }

    /// Get a ready transaction by id
    pub async fn get_ready_tx(&self, id: i64) -> WatcherResult<Option<ReadyTx>> {
        let row = sqlx::query(&format!("SELECT {} FROM ready_txs WHERE id = $1", READY_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| ready_from_row(&r)).transpose()
    }

    /// Set the progress flag of a ready transaction
    pub async fn set_ready_progress(&self, id: i64, progress_here: bool) -> WatcherResult<()> {
        sqlx::query("UPDATE ready_txs SET progress_here = $1 WHERE id = $2")
            .bind(progress_here)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Pending cycles

    /// Store a tracking cycle
    pub async fn insert_pending_tx(&self, pending: &NewPendingTx) -> WatcherResult<PendingTx> {
        let _guard = self.cycle_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE pending_txs SET progress_here = 0 WHERE ready_tx_id = $1")
            .bind(pending.ready_tx_id)
            .execute(&mut *tx)
            .await?;
        let inserted = insert_cycle(&mut tx, pending).await?;

        tx.commit().await?;
        Ok(inserted)
    }

    /// Get a cycle by id
    pub async fn get_pending_tx(&self, id: i64) -> WatcherResult<Option<PendingTx>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM pending_txs WHERE id = $1",
            PENDING_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| pending_from_row(&r)).transpose()
    }

    /// Open cycles whose order is not resolved yet
    pub async fn unordered_pending_txs(&self) -> WatcherResult<Vec<PendingTx>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pending_txs WHERE order_index = $1 AND progress_here = 1 ORDER BY id",
            PENDING_COLUMNS
        ))
        .bind(UNASSIGNED_ORDER)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pending_from_row).collect()
    }

    /// Cycles still awaiting an outcome
    pub async fn open_cycles(&self) -> WatcherResult<Vec<PendingTx>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pending_txs WHERE progress_here = 1 ORDER BY id",
            PENDING_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pending_from_row).collect()
    }

    /// The open cycle of a ready transaction, if any
    pub async fn find_open_cycle(&self, ready_tx_id: i64) -> WatcherResult<Option<PendingTx>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM pending_txs WHERE ready_tx_id = $1 AND progress_here = 1 \
             ORDER BY id DESC LIMIT 1",
            PENDING_COLUMNS
        ))
        .bind(ready_tx_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| pending_from_row(&r)).transpose()
    }

    /// Record the resolved position of an unassigned cycle.
    ///
    /// Returns false when the cycle was already resolved by someone else.
    pub async fn assign_order(&self, id: i64, round: u64, order: i64) -> WatcherResult<bool> {
        let result = sqlx::query(
            "UPDATE pending_txs SET round = $1, order_index = $2 WHERE id = $3 AND order_index = $4",
        )
        .bind(round as i64)
        .bind(order)
        .bind(id)
        .bind(UNASSIGNED_ORDER)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Re-file a ready transaction under a fresh open cycle.
    ///
    /// The new cycle inherits the position of the most recent cycle; an
    /// unassigned one restarts its scan at `unassigned_round`. Every earlier
    /// cycle of the ready transaction loses its progress flag. Returns the
    /// prior cycle (if any) and the new one.
    pub async fn open_new_cycle(
        &self,
        ready_tx_id: i64,
        unassigned_round: u64,
    ) -> WatcherResult<(Option<PendingTx>, PendingTx)> {
        let _guard = self.cycle_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the write lock before it reads
        sqlx::query("UPDATE pending_txs SET progress_here = 0 WHERE ready_tx_id = $1")
            .bind(ready_tx_id)
            .execute(&mut *tx)
            .await?;

        let prior = sqlx::query(&format!(
            "SELECT {} FROM pending_txs WHERE ready_tx_id = $1 ORDER BY id DESC LIMIT 1",
            PENDING_COLUMNS
        ))
        .bind(ready_tx_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| pending_from_row(&r))
        .transpose()?;

        let next = match &prior {
            Some(p) => NewPendingTx {
                ready_tx_id,
                round: if p.is_unassigned() { unassigned_round } else { p.round },
                order: p.order,
                proof_hash: p.proof_hash,
                operator_signature: p.operator_signature,
            },
            None => NewPendingTx {
                ready_tx_id,
                round: unassigned_round,
                order: UNASSIGNED_ORDER,
                proof_hash: H256::zero(),
                operator_signature: None,
            },
        };

        let opened = insert_cycle(&mut tx, &next).await?;

        tx.commit().await?;

        info!(
            "Opened cycle {} for ready tx {} (round {}, order {})",
            opened.id, ready_tx_id, opened.round, opened.order
        );
        Ok((prior, opened))
    }

    // History

    /// Close an open cycle with its outcome row.
    ///
    /// The progress flag is cleared with a compare-and-set; the row is only
    /// appended when this caller flipped it. Returns `None` when the cycle was
    /// already closed.
    pub async fn close_cycle(
        &self,
        pending_tx_id: i64,
        history: &NewTxHistory,
    ) -> WatcherResult<Option<TxHistory>> {
        let mut tx = self.pool.begin().await?;

        let flipped = sqlx::query(
            "UPDATE pending_txs SET progress_here = 0 WHERE id = $1 AND progress_here = 1",
        )
        .bind(pending_tx_id)
        .execute(&mut *tx)
        .await?;

        if flipped.rows_affected() != 1 {
            tx.rollback().await?;
            debug!("Cycle {} already closed, dropping {} row", pending_tx_id, history.status);
            return Ok(None);
        }

        let row = insert_history(&mut tx, history).await?;
        tx.commit().await?;

        Ok(Some(row))
    }

    /// Append a history row without touching any cycle
    pub async fn append_history(&self, history: &NewTxHistory) -> WatcherResult<TxHistory> {
        let mut tx = self.pool.begin().await?;
        let row = insert_history(&mut tx, history).await?;
        tx.commit().await?;
        Ok(row)
    }

    /// Get a history row by id
    pub async fn get_history(&self, id: i64) -> WatcherResult<Option<TxHistory>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM tx_history WHERE id = $1",
            HISTORY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| history_from_row(&r)).transpose()
    }

    /// All history rows, newest first
    pub async fn list_history(&self) -> WatcherResult<Vec<TxHistory>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tx_history ORDER BY id DESC",
            HISTORY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(history_from_row).collect()
    }

    /// History rows of one cycle, oldest first
    pub async fn history_for_cycle(&self, pending_tx_id: i64) -> WatcherResult<Vec<TxHistory>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tx_history WHERE pending_tx_id = $1 ORDER BY id",
            HISTORY_COLUMNS
        ))
        .bind(pending_tx_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(history_from_row).collect()
    }

    /// A history row joined with its cycle and ready transaction
    pub async fn history_record(&self, history_id: i64) -> WatcherResult<Option<HistoryRecord>> {
        let Some(history) = self.get_history(history_id).await? else {
            return Ok(None);
        };
        let Some(pending) = self.get_pending_tx(history.pending_tx_id).await? else {
            return Ok(None);
        };
        let Some(ready) = self.get_ready_tx(pending.ready_tx_id).await? else {
            return Ok(None);
        };

        Ok(Some(HistoryRecord {
            history,
            pending,
            ready,
        }))
    }

    /// Get cycle and outcome statistics
    pub async fn get_stats(&self) -> WatcherResult<TrackingStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM pending_txs WHERE progress_here = 1) as open_cycles,
                (SELECT COUNT(*) FROM pending_txs WHERE order_index = -1 AND progress_here = 1) as unordered,
                (SELECT COUNT(*) FROM tx_history WHERE status = 'PENDING') as pending,
                (SELECT COUNT(*) FROM tx_history WHERE status = 'COMPLETED') as completed,
                (SELECT COUNT(*) FROM tx_history WHERE status = 'REJECTED') as rejected,
                (SELECT COUNT(*) FROM tx_history WHERE status = 'REIMBURSE_AVAILABLE') as reimburse_available
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TrackingStats {
            open_cycles: row.try_get::<i64, _>("open_cycles")? as u64,
            unordered: row.try_get::<i64, _>("unordered")? as u64,
            pending: row.try_get::<i64, _>("pending")? as u64,
            completed: row.try_get::<i64, _>("completed")? as u64,
            rejected: row.try_get::<i64, _>("rejected")? as u64,
            reimburse_available: row.try_get::<i64, _>("reimburse_available")? as u64,
        })
    }
}

/// Cycle and outcome statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingStats {
    pub open_cycles: u64,
    pub unordered: u64,
    pub pending: u64,
    pub completed: u64,
    pub rejected: u64,
    pub reimburse_available: u64,
}

async fn insert_cycle(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    pending: &NewPendingTx,
) -> WatcherResult<PendingTx> {
    let signature = pending
        .operator_signature
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let result = sqlx::query(
        r#"
        INSERT INTO pending_txs
            (ready_tx_id, round, order_index, proof_hash, operator_signature, progress_here)
        VALUES ($1, $2, $3, $4, $5, 1)
        "#,
    )
    .bind(pending.ready_tx_id)
    .bind(pending.round as i64)
    .bind(pending.order)
    .bind(hash_to_hex(&pending.proof_hash))
    .bind(signature)
    .execute(&mut **tx)
    .await?;

    Ok(PendingTx {
        id: result.last_insert_rowid(),
        ready_tx_id: pending.ready_tx_id,
        round: pending.round,
        order: pending.order,
        proof_hash: pending.proof_hash,
        operator_signature: pending.operator_signature,
        progress_here: true,
    })
}

async fn insert_history(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    history: &NewTxHistory,
) -> WatcherResult<TxHistory> {
    let result = sqlx::query(
        r#"
        INSERT INTO tx_history (pending_tx_id, tx_id, tx_date, from_amount, to_amount, status)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(history.pending_tx_id)
    .bind(hash_to_hex(&history.tx_id))
    .bind(history.tx_date as i64)
    .bind(serde_json::to_string(&history.from)?)
    .bind(serde_json::to_string(&history.to)?)
    .bind(history.status.as_str())
    .execute(&mut **tx)
    .await?;

    Ok(TxHistory {
        id: result.last_insert_rowid(),
        pending_tx_id: history.pending_tx_id,
        tx_id: history.tx_id,
        tx_date: history.tx_date,
        from: history.from.clone(),
        to: history.to.clone(),
        status: history.status,
    })
}

fn hash_to_hex(hash: &H256) -> String {
    format!("0x{}", hex::encode(hash.as_bytes()))
}

fn parse_hash(raw: &str) -> WatcherResult<H256> {
    H256::from_str(raw).map_err(|e| WatcherError::Internal(format!("bad stored hash {}: {}", raw, e)))
}

fn parse_amount(raw: &str) -> WatcherResult<TokenAmount> {
    Ok(serde_json::from_str(raw)?)
}

fn ready_from_row(row: &SqliteRow) -> WatcherResult<ReadyTx> {
    Ok(ReadyTx {
        id: row.try_get("id")?,
        from: parse_amount(row.try_get("from_amount")?)?,
        to: parse_amount(row.try_get("to_amount")?)?,
        tx_hash: parse_hash(row.try_get("tx_hash")?)?,
        tx: serde_json::from_str(row.try_get("payload")?)?,
        available_from: row.try_get::<i64, _>("available_from")? as u64,
        send_date: row.try_get("send_date")?,
        progress_here: row.try_get("progress_here")?,
    })
}

fn pending_from_row(row: &SqliteRow) -> WatcherResult<PendingTx> {
    let signature: Option<String> = row.try_get("operator_signature")?;
    let operator_signature = signature
        .map(|s| serde_json::from_str::<OperatorSignature>(&s))
        .transpose()?;

    Ok(PendingTx {
        id: row.try_get("id")?,
        ready_tx_id: row.try_get("ready_tx_id")?,
        round: row.try_get::<i64, _>("round")? as u64,
        order: row.try_get("order_index")?,
        proof_hash: parse_hash(row.try_get("proof_hash")?)?,
        operator_signature,
        progress_here: row.try_get("progress_here")?,
    })
}

fn history_from_row(row: &SqliteRow) -> WatcherResult<TxHistory> {
    let status: String = row.try_get("status")?;

    Ok(TxHistory {
        id: row.try_get("id")?,
        pending_tx_id: row.try_get("pending_tx_id")?,
        tx_id: parse_hash(row.try_get("tx_id")?)?,
        tx_date: row.try_get::<i64, _>("tx_date")? as u64,
        from: parse_amount(row.try_get("from_amount")?)?,
        to: parse_amount(row.try_get("to_amount")?)?,
        status: status.parse().map_err(WatcherError::Internal)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::state::model::SwapPayload;
    use ethers::types::{Address, U256};
    use std::sync::Arc;

    pub(crate) async fn memory_store() -> StateManager {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
        };
        let store = StateManager::new(&config).await.unwrap();
        store.run_migrations().await.unwrap();
        store
    }

    pub(crate) fn sample_ready(tx_hash: H256, available_from: u64) -> NewReadyTx {
        NewReadyTx {
            from: TokenAmount::from_units("WETH", U256::from(5u64), 18),
            to: TokenAmount::from_units("USDC", U256::from(1000u64), 6),
            tx_hash,
            tx: SwapPayload {
                tx_owner: Address::from_low_u64_be(0xaa),
                function_selector: [0x38, 0xed, 0x17, 0x39],
                amount_in: U256::from(5u64),
                amount_out: U256::from(990u64),
                path: vec![Address::from_low_u64_be(1), Address::from_low_u64_be(2)],
                to: Address::from_low_u64_be(0xaa),
                nonce: U256::from(7u64),
                available_from,
                deadline: available_from + 600,
            },
            available_from,
            send_date: 1_700_000_000,
        }
    }

    fn unassigned(ready_tx_id: i64, round: u64) -> NewPendingTx {
        NewPendingTx {
            ready_tx_id,
            round,
            order: UNASSIGNED_ORDER,
            proof_hash: H256::zero(),
            operator_signature: None,
        }
    }

    fn outcome(pending_tx_id: i64, status: TxStatus) -> NewTxHistory {
        NewTxHistory {
            pending_tx_id,
            tx_id: H256::repeat_byte(0x42),
            tx_date: 0,
            from: TokenAmount::from_units("WETH", U256::from(5u64), 18),
            to: TokenAmount::from_units("USDC", U256::from(1000u64), 6),
            status,
        }
    }

    #[tokio::test]
    async fn test_ready_and_pending_round_trip() {
        let store = memory_store().await;
        let ready = store
            .insert_ready_tx(&sample_ready(H256::repeat_byte(1), 100))
            .await
            .unwrap();
        let loaded = store.get_ready_tx(ready.id).await.unwrap().unwrap();
        assert_eq!(loaded, ready);

        let signature = OperatorSignature {
            v: 27,
            r: H256::repeat_byte(3),
            s: H256::repeat_byte(4),
        };
        let pending = store
            .insert_pending_tx(&NewPendingTx {
                ready_tx_id: ready.id,
                round: 3,
                order: 2,
                proof_hash: H256::repeat_byte(9),
                operator_signature: Some(signature),
            })
            .await
            .unwrap();
        let loaded = store.get_pending_tx(pending.id).await.unwrap().unwrap();
        assert_eq!(loaded, pending);
        assert_eq!(loaded.operator_signature, Some(signature));
    }

    #[tokio::test]
    async fn test_assign_order_only_touches_unassigned() {
        let store = memory_store().await;
        let ready = store
            .insert_ready_tx(&sample_ready(H256::repeat_byte(1), 100))
            .await
            .unwrap();
        let pending = store.insert_pending_tx(&unassigned(ready.id, 3)).await.unwrap();

        assert_eq!(store.unordered_pending_txs().await.unwrap().len(), 1);
        assert!(store.assign_order(pending.id, 4, 1).await.unwrap());
        assert!(!store.assign_order(pending.id, 5, 0).await.unwrap());

        let loaded = store.get_pending_tx(pending.id).await.unwrap().unwrap();
        assert_eq!((loaded.round, loaded.order), (4, 1));
        assert!(store.unordered_pending_txs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restarted_cycles_leave_no_unordered_backlog() {
        let store = memory_store().await;
        let ready = store
            .insert_ready_tx(&sample_ready(H256::repeat_byte(1), 100))
            .await
            .unwrap();
        store.insert_pending_tx(&unassigned(ready.id, 3)).await.unwrap();
        store.open_new_cycle(ready.id, 8).await.unwrap();
        let (_, open) = store.open_new_cycle(ready.id, 8).await.unwrap();

        let unordered = store.unordered_pending_txs().await.unwrap();
        assert_eq!(unordered.len(), 1);
        assert_eq!(unordered[0].id, open.id);
        assert_eq!(store.get_stats().await.unwrap().unordered, 1);
    }

    #[tokio::test]
    async fn test_close_cycle_appends_once() {
        let store = memory_store().await;
        let ready = store
            .insert_ready_tx(&sample_ready(H256::repeat_byte(1), 100))
            .await
            .unwrap();
        let pending = store.insert_pending_tx(&unassigned(ready.id, 3)).await.unwrap();

        let first = store
            .close_cycle(pending.id, &outcome(pending.id, TxStatus::Completed))
            .await
            .unwrap();
        let second = store
            .close_cycle(pending.id, &outcome(pending.id, TxStatus::Rejected))
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        let rows = store.history_for_cycle(pending.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TxStatus::Completed);
        assert!(store.open_cycles().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_close_has_single_winner() {
        let store = Arc::new(memory_store().await);
        let ready = store
            .insert_ready_tx(&sample_ready(H256::repeat_byte(1), 100))
            .await
            .unwrap();
        let pending = store.insert_pending_tx(&unassigned(ready.id, 3)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let id = pending.id;
            handles.push(tokio::spawn(async move {
                store
                    .close_cycle(id, &outcome(id, TxStatus::Pending))
                    .await
                    .unwrap()
                    .is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.history_for_cycle(pending.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_new_cycle_keeps_single_open_cycle() {
        let store = memory_store().await;
        let ready = store
            .insert_ready_tx(&sample_ready(H256::repeat_byte(1), 100))
            .await
            .unwrap();
        let first = store.insert_pending_tx(&unassigned(ready.id, 3)).await.unwrap();

        let (prior, second) = store.open_new_cycle(ready.id, 8).await.unwrap();
        assert_eq!(prior.map(|p| p.id), Some(first.id));
        assert_eq!(second.round, 8);
        assert!(second.is_unassigned());

        let first = store.get_pending_tx(first.id).await.unwrap().unwrap();
        assert!(!first.progress_here);

        let open = store.find_open_cycle(ready.id).await.unwrap().unwrap();
        assert_eq!(open.id, second.id);
        assert_eq!(store.open_cycles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_new_cycle_inherits_assigned_position() {
        let store = memory_store().await;
        let ready = store
            .insert_ready_tx(&sample_ready(H256::repeat_byte(1), 100))
            .await
            .unwrap();
        store
            .insert_pending_tx(&NewPendingTx {
                ready_tx_id: ready.id,
                round: 3,
                order: 2,
                proof_hash: H256::repeat_byte(9),
                operator_signature: None,
            })
            .await
            .unwrap();

        let (_, next) = store.open_new_cycle(ready.id, 8).await.unwrap();
        assert_eq!((next.round, next.order), (3, 2));
        assert_eq!(next.proof_hash, H256::repeat_byte(9));
    }

    #[tokio::test]
    async fn test_concurrent_open_new_cycle() {
        let store = Arc::new(memory_store().await);
        let ready = store
            .insert_ready_tx(&sample_ready(H256::repeat_byte(1), 100))
            .await
            .unwrap();

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.open_new_cycle(ready.id, 4).await.unwrap() })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.open_new_cycle(ready.id, 4).await.unwrap() })
        };
        let (first, second) = (a.await.unwrap(), b.await.unwrap());

        // Exactly one caller saw no prior cycle
        assert_eq!(
            [first.0.is_none(), second.0.is_none()]
                .iter()
                .filter(|none| **none)
                .count(),
            1
        );
        assert_eq!(store.open_cycles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_history_record_join_and_stats() {
        let store = memory_store().await;
        let ready = store
            .insert_ready_tx(&sample_ready(H256::repeat_byte(1), 100))
            .await
            .unwrap();
        let pending = store.insert_pending_tx(&unassigned(ready.id, 3)).await.unwrap();
        let row = store
            .close_cycle(pending.id, &outcome(pending.id, TxStatus::ReimburseAvailable))
            .await
            .unwrap()
            .unwrap();

        let record = store.history_record(row.id).await.unwrap().unwrap();
        assert_eq!(record.pending.id, pending.id);
        assert_eq!(record.ready.id, ready.id);
        assert!(store.history_record(row.id + 10).await.unwrap().is_none());

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.reimburse_available, 1);
        assert_eq!(stats.open_cycles, 0);
        assert_eq!(stats.unordered, 0);
    }

    #[tokio::test]
    async fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("watcher.db").display()
        );
        let config = DatabaseConfig {
            url,
            max_connections: 2,
            min_connections: 1,
        };

        let id = {
            let store = StateManager::new(&config).await.unwrap();
            store.run_migrations().await.unwrap();
            store
                .insert_ready_tx(&sample_ready(H256::repeat_byte(1), 100))
                .await
                .unwrap()
                .id
        };

        let store = StateManager::new(&config).await.unwrap();
        store.run_migrations().await.unwrap();
        assert!(store.get_ready_tx(id).await.unwrap().is_some());
    }
}
