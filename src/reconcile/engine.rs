//! Reconciliation engine
//!
//! Each pass resolves the round position of unassigned cycles, then looks for
//! an outcome for every open cycle: the sequencer's assigned batch hash, its
//! receipt, the account's transfers inside it and the order verdict. Passes
//! may overlap; `StateManager::close_cycle` makes the outcome append
//! at-most-once per cycle.

use crate::chain::Ledger;
use crate::error::WatcherResult;
use crate::events::{scan_transfers, TokenTransfer};
use crate::notify::{Notification, NotificationStatus, Notifier, OUTCOME_REMOVE_AFTER_MS};
use crate::sequencer::Sequencer;
use crate::state::{NewTxHistory, PendingTx, StateManager, TokenAmount, TxHistory, TxStatus};
use crate::verify::{verify_order, OrderCheck, Verdict, ORDER_INDEX_OFFSET};

use dashmap::DashMap;
use ethers::types::{Address, H256};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Notify, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Fractional digits shown in outcome notifications
const DISPLAY_PRECISION: usize = 6;

/// Decimals assumed for a token whose metadata cannot be read
const FALLBACK_DECIMALS: u8 = 18;

/// What the engine needs to know about the tracked account
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub chain_id: u64,
    pub router: Address,
    pub account: Address,
    pub poll_interval_ms: u64,
}

/// Work done by one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub orders_resolved: usize,
    pub outcomes: usize,
    /// Records left for the next pass after a transient failure
    pub deferred: usize,
}

/// Polls the sequencer and the ledger and records outcomes
pub struct ReconciliationEngine {
    state_manager: Arc<StateManager>,
    sequencer: Arc<dyn Sequencer>,
    ledger: Arc<dyn Ledger>,
    notifier: Arc<Notifier>,
    config: ReconcileConfig,
    /// Token decimals and symbol by address
    token_cache: DashMap<Address, (u8, String)>,
    trigger: Notify,
    /// Shutdown flag
    shutdown: RwLock<bool>,
}

impl ReconciliationEngine {
    pub fn new(
        state_manager: Arc<StateManager>,
        sequencer: Arc<dyn Sequencer>,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<Notifier>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            state_manager,
            sequencer,
            ledger,
            notifier,
            config,
            token_cache: DashMap::new(),
            trigger: Notify::new(),
            shutdown: RwLock::new(false),
        }
    }

    /// Main reconciliation loop
    pub async fn run(&self) -> WatcherResult<()> {
        let mut poll_interval = interval(Duration::from_millis(self.config.poll_interval_ms));
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Reconciliation engine started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            let source = tokio::select! {
                _ = poll_interval.tick() => "interval",
                _ = self.trigger.notified() => "trigger",
            };

            if *self.shutdown.read().await {
                break;
            }

            self.run_tick(source).await;
        }

        info!("Reconciliation engine stopped");
        Ok(())
    }

    /// Request an immediate pass (account or chain change)
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop the reconciliation loop
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        self.trigger.notify_one();
        info!("Reconciliation engine shutdown initiated");
    }

    async fn run_tick(&self, source: &str) {
        let started = Instant::now();
        crate::metrics::record_tick(source);

        match self.tick().await {
            Ok(report) => {
                if report != TickReport::default() {
                    debug!("Pass ({}) finished: {:?}", source, report);
                }
            }
            Err(e) => error!("Reconciliation pass failed: {}", e),
        }

        crate::metrics::record_tick_latency(started.elapsed().as_secs_f64());
    }

    /// One reconciliation pass
    pub async fn tick(&self) -> WatcherResult<TickReport> {
        let mut report = TickReport::default();
        self.resolve_orders(&mut report).await?;
        self.resolve_outcomes(&mut report).await?;

        if let Ok(open) = self.state_manager.open_cycles().await {
            crate::metrics::record_open_cycles(open.len() as u64);
        }
        Ok(report)
    }

    /// Find the round position of every unassigned cycle
    async fn resolve_orders(&self, report: &mut TickReport) -> WatcherResult<()> {
        let unordered = self.state_manager.unordered_pending_txs().await?;
        if unordered.is_empty() {
            return Ok(());
        }

        let current_round = match self.sequencer.current_round().await {
            Ok(round) => round,
            Err(e) if e.is_retryable() => {
                warn!("Order resolution deferred: {}", e);
                crate::metrics::record_transient_error("sequencer");
                report.deferred += unordered.len();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for pending in unordered {
            let Some(ready) = self.state_manager.get_ready_tx(pending.ready_tx_id).await? else {
                warn!(
                    "Cycle {} points at missing ready tx {}",
                    pending.id, pending.ready_tx_id
                );
                continue;
            };

            match self
                .find_position(ready.tx_hash, pending.round, current_round)
                .await
            {
                Ok(Some((round, index))) => {
                    let order = index as i64 + ORDER_INDEX_OFFSET;
                    if self
                        .state_manager
                        .assign_order(pending.id, round, order)
                        .await?
                    {
                        info!(
                            "Cycle {} resolved to round {} order {}",
                            pending.id, round, order
                        );
                        crate::metrics::record_order_resolved();
                        report.orders_resolved += 1;
                    }
                }
                Ok(None) => {
                    debug!(
                        "Ready tx {:?} not in rounds {}..={} yet",
                        ready.tx_hash, pending.round, current_round
                    );
                }
                Err(e) if e.is_retryable() => {
                    warn!("Order resolution of cycle {} deferred: {}", pending.id, e);
                    crate::metrics::record_transient_error("sequencer");
                    report.deferred += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// First round in `from..=to` holding `tx_hash`, with its index
    async fn find_position(
        &self,
        tx_hash: H256,
        from: u64,
        to: u64,
    ) -> WatcherResult<Option<(u64, usize)>> {
        for round in from..=to {
            let hashes = self.sequencer.round_hashes(round).await?;
            if let Some(index) = hashes.iter().position(|h| *h == tx_hash) {
                return Ok(Some((round, index)));
            }
        }
        Ok(None)
    }

    /// Look for an outcome of every open, ordered cycle
    async fn resolve_outcomes(&self, report: &mut TickReport) -> WatcherResult<()> {
        let open = self.state_manager.open_cycles().await?;

        for pending in open.iter().filter(|p| !p.is_unassigned()) {
            match self.resolve_outcome(pending).await {
                Ok(Some(_)) => report.outcomes += 1,
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    warn!("Outcome of cycle {} deferred: {}", pending.id, e);
                    crate::metrics::record_transient_error("ledger");
                    report.deferred += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn resolve_outcome(&self, pending: &PendingTx) -> WatcherResult<Option<TxHistory>> {
        let Some(ready) = self.state_manager.get_ready_tx(pending.ready_tx_id).await? else {
            warn!(
                "Cycle {} points at missing ready tx {}",
                pending.id, pending.ready_tx_id
            );
            return Ok(None);
        };

        let Some(assigned) = self
            .sequencer
            .assigned_tx_hash(self.config.chain_id, self.config.router, pending.round)
            .await?
        else {
            debug!("Round {} has no assigned batch yet", pending.round);
            return Ok(None);
        };

        let inherited = |status: TxStatus, tx_date: u64| NewTxHistory {
            pending_tx_id: pending.id,
            tx_id: assigned,
            tx_date,
            from: ready.from.clone(),
            to: ready.to.clone(),
            status,
        };

        let history = match self.ledger.receipt(assigned).await? {
            None => inherited(TxStatus::Pending, 0),
            Some(receipt) => {
                let index = (pending.order - ORDER_INDEX_OFFSET).max(0) as usize;
                let group = scan_transfers(&receipt.logs, index, self.config.account);

                let round_hashes = self.sequencer.round_hashes(pending.round).await?;
                let current_round = self.sequencer.current_round().await?;
                let verdict = verify_order(&OrderCheck {
                    round_hashes: &round_hashes,
                    recorded_round: pending.round,
                    current_round,
                    order: pending.order,
                    proof_hash: pending.proof_hash,
                    tx_hash: ready.tx_hash,
                });
                let tx_date = self.ledger.block_timestamp(receipt.block_number).await?;

                match (verdict, group.sent, group.received) {
                    (Verdict::Honored, Some(sent), Some(received)) => NewTxHistory {
                        from: self.token_amount(sent).await?,
                        to: self.token_amount(received).await?,
                        ..inherited(TxStatus::Completed, tx_date)
                    },
                    (Verdict::Honored, _, _) => inherited(TxStatus::Rejected, tx_date),
                    (Verdict::Violated(reason), _, _) => {
                        warn!(
                            "Cycle {} (round {} order {}) order violated: {}",
                            pending.id, pending.round, pending.order, reason
                        );
                        inherited(TxStatus::ReimburseAvailable, tx_date)
                    }
                }
            }
        };

        let Some(row) = self.state_manager.close_cycle(pending.id, &history).await? else {
            debug!("Cycle {} closed by a concurrent pass", pending.id);
            return Ok(None);
        };

        info!(
            "Cycle {} (round {} order {}) recorded as {}",
            pending.id, pending.round, pending.order, row.status
        );
        crate::metrics::record_outcome(row.status);
        self.notifier.emit(outcome_notification(pending, &row));

        Ok(Some(row))
    }

    async fn token_amount(&self, transfer: TokenTransfer) -> WatcherResult<TokenAmount> {
        let cached = self
            .token_cache
            .get(&transfer.token)
            .map(|entry| entry.value().clone());

        let (decimals, symbol) = match cached {
            Some(meta) => meta,
            None => match self.ledger.decimals_and_symbol(transfer.token).await {
                Ok(meta) => {
                    self.token_cache.insert(transfer.token, meta.clone());
                    meta
                }
                Err(e) if e.is_retryable() => return Err(e),
                // Not an ERC-20 the ledger can describe; label it by address
                Err(e) => {
                    warn!("No metadata for token {:?}: {}", transfer.token, e);
                    (FALLBACK_DECIMALS, format!("{:?}", transfer.token))
                }
            },
        };

        Ok(TokenAmount::from_units(symbol, transfer.amount, decimals))
    }
}

fn outcome_notification(pending: &PendingTx, row: &TxHistory) -> Notification {
    let (title, status) = match row.status {
        TxStatus::Completed => ("Success", NotificationStatus::Success),
        TxStatus::Rejected => ("Rejected", NotificationStatus::Rejected),
        TxStatus::ReimburseAvailable => {
            ("Reimbursement available", NotificationStatus::Reimbursement)
        }
        TxStatus::Pending => ("Pending", NotificationStatus::Pending),
    };

    Notification {
        key: pending.notification_key(),
        title: title.to_string(),
        status,
        data: serde_json::json!({
            "historyId": row.id,
            "txId": row.tx_id,
            "from": row.from,
            "to": row.to,
            "fromDisplay": row.from.format(DISPLAY_PRECISION),
            "toDisplay": row.to.format(DISPLAY_PRECISION),
        }),
        remove_after_ms: OUTCOME_REMOVE_AFTER_MS,
    }
}
