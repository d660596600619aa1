//! Lifecycle controller
//!
//! User-initiated transitions of a ready transaction: filing a submitted swap,
//! cancelling or proceeding (both restart the tracking cycle), and claiming a
//! reimbursement for a broken order.

use crate::chain::{Ledger, ReimbursementClaim};
use crate::error::{WatcherError, WatcherResult};
use crate::notify::{Notification, NotificationStatus, Notifier, RESTART_REMOVE_AFTER_MS};
use crate::sequencer::Sequencer;
use crate::state::{
    HistoryRecord, NewPendingTx, NewReadyTx, NewTxHistory, OperatorSignature, PendingTx, ReadyTx,
    StateManager, SwapPayload, TokenAmount, TxHistory, TxStatus, UNASSIGNED_ORDER,
};

use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Receipt the sequencer operator returns when it accepts a swap
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorReceipt {
    /// Receipt body exactly as signed (JSON without the signature)
    pub body: String,
    pub tx_hash: H256,
    pub round: u64,
    pub order: i64,
    pub proof_hash: H256,
    pub signature: OperatorSignature,
}

/// A signed swap handed over for tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapSubmission {
    pub from: TokenAmount,
    pub to: TokenAmount,
    pub tx_hash: H256,
    pub tx: SwapPayload,
    #[serde(default)]
    pub operator_receipt: Option<OperatorReceipt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmittedSwap {
    pub ready: ReadyTx,
    pub pending: PendingTx,
}

/// Result of a cancel or proceed action
#[derive(Debug, Clone, Serialize)]
pub struct CycleRestart {
    pub previous: Option<PendingTx>,
    pub cycle: PendingTx,
    pub history: TxHistory,
    /// Hash of the cancel transaction, when one was sent
    pub cancel_tx: Option<H256>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReimbursementDetails {
    pub record: HistoryRecord,
    pub amount: U256,
}

/// Applies user actions to the store and the ledger
pub struct LifecycleController {
    state_manager: Arc<StateManager>,
    sequencer: Arc<dyn Sequencer>,
    ledger: Arc<dyn Ledger>,
    notifier: Arc<Notifier>,
    /// Pause after a cancel is sent so the recorder reflects it
    cancel_settle: Duration,
}

impl LifecycleController {
    pub fn new(
        state_manager: Arc<StateManager>,
        sequencer: Arc<dyn Sequencer>,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<Notifier>,
        cancel_settle: Duration,
    ) -> Self {
        Self {
            state_manager,
            sequencer,
            ledger,
            notifier,
            cancel_settle,
        }
    }

    /// File a submitted swap and open its first tracking cycle
    pub async fn submit_swap(&self, submission: SwapSubmission) -> WatcherResult<SubmittedSwap> {
        if submission.tx.available_from == 0 {
            return Err(WatcherError::InvalidSubmission(
                "availableFrom must be set".to_string(),
            ));
        }

        let position = match &submission.operator_receipt {
            Some(receipt) => {
                self.check_receipt(receipt, submission.tx_hash).await?;
                (receipt.round, receipt.order, receipt.proof_hash, Some(receipt.signature))
            }
            None => {
                let round = self.sequencer.current_round().await?;
                (round, UNASSIGNED_ORDER, H256::zero(), None)
            }
        };
        let (round, order, proof_hash, operator_signature) = position;

        let ready = self
            .state_manager
            .insert_ready_tx(&NewReadyTx {
                from: submission.from,
                to: submission.to,
                tx_hash: submission.tx_hash,
                available_from: submission.tx.available_from,
                tx: submission.tx,
                send_date: chrono::Utc::now().timestamp(),
            })
            .await?;

        let pending = self
            .state_manager
            .insert_pending_tx(&NewPendingTx {
                ready_tx_id: ready.id,
                round,
                order,
                proof_hash,
                operator_signature,
            })
            .await?;

        info!(
            "Submitted swap {:?} filed as ready tx {} (round {}, order {})",
            ready.tx_hash, ready.id, pending.round, pending.order
        );

        Ok(SubmittedSwap { ready, pending })
    }

    /// Verify the operator receipt belongs to this swap and to the operator
    async fn check_receipt(&self, receipt: &OperatorReceipt, tx_hash: H256) -> WatcherResult<()> {
        if receipt.tx_hash != tx_hash {
            return Err(WatcherError::InvalidSubmission(format!(
                "operator receipt is for {:?}, not {:?}",
                receipt.tx_hash, tx_hash
            )));
        }
        if receipt.order < 0 {
            return Err(WatcherError::InvalidSubmission(format!(
                "operator receipt carries order {}",
                receipt.order
            )));
        }

        let operator = self.ledger.operator().await?;
        let recovered = receipt
            .signature
            .to_signature()
            .recover(receipt.body.as_str())
            .map_err(|e| WatcherError::InvalidOperatorSignature {
                recovered: e.to_string(),
                expected: format!("{:?}", operator),
            })?;

        if recovered != operator {
            return Err(WatcherError::InvalidOperatorSignature {
                recovered: format!("{:?}", recovered),
                expected: format!("{:?}", operator),
            });
        }
        Ok(())
    }

    /// Cancel (`proceed = false`) or proceed with a ready transaction.
    ///
    /// Both restart tracking under a new cycle; cancelling first withdraws
    /// the transaction on the recorder and is only offered until
    /// `available_from`.
    pub async fn cancel_or_proceed(
        &self,
        ready_tx_id: i64,
        proceed: bool,
    ) -> WatcherResult<CycleRestart> {
        let ready = self
            .state_manager
            .get_ready_tx(ready_tx_id)
            .await?
            .ok_or(WatcherError::NotFound {
                entity: "ready tx",
                id: ready_tx_id,
            })?;

        let cancel_tx = if proceed {
            None
        } else {
            let now = chrono::Utc::now().timestamp();
            if (ready.available_from as i64) - now < 0 {
                return Err(WatcherError::CancelWindowClosed {
                    ready_tx_id,
                    available_from: ready.available_from,
                });
            }

            let sent = self.ledger.cancel(ready.tx_hash).await;
            crate::metrics::record_ledger_write("cancel", sent.is_ok());
            let sent = sent.map_err(|e| {
                warn!("Cancel of ready tx {} not sent: {}", ready_tx_id, e);
                e
            })?;

            if !self.cancel_settle.is_zero() {
                tokio::time::sleep(self.cancel_settle).await;
            }
            Some(sent)
        };

        let current_round = self.sequencer.current_round().await?;

        self.state_manager.set_ready_progress(ready.id, false).await?;
        let (previous, cycle) = self
            .state_manager
            .open_new_cycle(ready.id, current_round.saturating_sub(1))
            .await?;

        // Marks the restarted cycle in the history; its outcome row comes later
        let history = self
            .state_manager
            .append_history(&NewTxHistory {
                pending_tx_id: cycle.id,
                tx_id: ready.tx_hash,
                tx_date: 0,
                from: ready.from.clone(),
                to: ready.to.clone(),
                status: TxStatus::Pending,
            })
            .await?;

        if let Some(previous) = &previous {
            self.notifier.remove(&previous.notification_key());
        }
        self.notifier.emit(Notification {
            key: cycle.notification_key(),
            title: if proceed { "Transaction Pending" } else { "Cancel pending" }.to_string(),
            status: NotificationStatus::Pending,
            data: serde_json::json!({
                "hash": ready.tx_hash,
                "readyTxId": ready.id,
            }),
            remove_after_ms: RESTART_REMOVE_AFTER_MS,
        });

        info!(
            "Ready tx {} {} under cycle {} (round {}, order {})",
            ready.id,
            if proceed { "proceeds" } else { "cancelled" },
            cycle.id,
            cycle.round,
            cycle.order
        );

        Ok(CycleRestart {
            previous,
            cycle,
            history,
            cancel_tx,
        })
    }

    /// Claim the reimbursement of a broken order
    pub async fn claim_reimbursement(&self, history_id: i64) -> WatcherResult<H256> {
        let record = self.reimbursable_record(history_id).await?;

        let operator_signature = record.pending.operator_signature.ok_or_else(|| {
            WatcherError::InvalidSubmission(format!(
                "cycle {} carries no operator signature",
                record.pending.id
            ))
        })?;

        let claim = ReimbursementClaim {
            round: record.pending.round,
            order: record.pending.order as u64,
            tx: record.ready.tx.clone(),
            proof_hash: record.pending.proof_hash,
            operator_signature,
        };

        let sent = self.ledger.claim_reimbursement(claim).await;
        crate::metrics::record_ledger_write("reimbursement", sent.is_ok());
        let sent = sent?;

        info!("Reimbursement for history {} claimed in {:?}", history_id, sent);
        Ok(sent)
    }

    /// The reimbursable record and the amount a claim pays out
    pub async fn reimbursement_details(
        &self,
        history_id: i64,
    ) -> WatcherResult<ReimbursementDetails> {
        let record = self.reimbursable_record(history_id).await?;
        let amount = self.ledger.reimbursement_amount().await?;
        Ok(ReimbursementDetails { record, amount })
    }

    /// History rows, newest first
    pub async fn history(&self) -> WatcherResult<Vec<TxHistory>> {
        self.state_manager.list_history().await
    }

    /// A joined history record
    pub async fn record(&self, history_id: i64) -> WatcherResult<HistoryRecord> {
        self.state_manager
            .history_record(history_id)
            .await?
            .ok_or(WatcherError::NotFound {
                entity: "history",
                id: history_id,
            })
    }

    async fn reimbursable_record(&self, history_id: i64) -> WatcherResult<HistoryRecord> {
        let record = self.record(history_id).await?;
        if record.history.status != TxStatus::ReimburseAvailable || record.pending.order < 0 {
            return Err(WatcherError::NotReimbursable { history_id });
        }
        Ok(record)
    }
}
