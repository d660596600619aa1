//! Transaction sender with retry logic

use crate::chain::ChainProvider;
use crate::config::{ChainConfig, WalletConfig};
use crate::error::{WatcherError, WatcherResult};

use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

const DEFAULT_KEY_ENV: &str = "WATCHER_PRIVATE_KEY";
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Signs and submits ledger writes on behalf of the tracked account
pub struct TransactionSender {
    provider: Arc<ChainProvider>,
    /// Wallet for signing
    wallet: LocalWallet,
    max_retries: u32,
    retry_delay_ms: u64,
}

impl TransactionSender {
    /// Create a new transaction sender
    pub fn new(
        provider: Arc<ChainProvider>,
        chain: &ChainConfig,
        wallet: &WalletConfig,
    ) -> WatcherResult<Self> {
        let key_env = wallet
            .private_key_env
            .as_deref()
            .unwrap_or(DEFAULT_KEY_ENV);
        let wallet = Self::load_wallet(key_env)?.with_chain_id(chain.chain_id);

        info!("Transaction sender initialized with wallet: {:?}", wallet.address());

        Ok(Self {
            provider,
            wallet,
            max_retries: chain.max_retries.max(1),
            retry_delay_ms: chain.retry_delay_ms,
        })
    }

    /// Load wallet from the configured environment variable
    fn load_wallet(key_env: &str) -> WatcherResult<LocalWallet> {
        let key = std::env::var(key_env).map_err(|_| {
            WatcherError::Wallet(format!("No wallet configured. Set {}", key_env))
        })?;

        key.trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| WatcherError::Wallet(format!("Invalid private key: {}", e)))
    }

    /// Get wallet address
    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    /// Send a contract call carrying `data` to `to`
    pub async fn send_call(&self, to: Address, data: Bytes) -> WatcherResult<H256> {
        let request = TransactionRequest::new()
            .from(self.wallet.address())
            .to(to)
            .data(data)
            .chain_id(self.provider.chain_id());
        let mut tx: TypedTransaction = request.into();

        self.provider
            .http()
            .fill_transaction(&mut tx, None)
            .await
            .map_err(|e| classify_send_error(self.provider.chain_id(), e.to_string()))?;

        self.send_with_retry(tx).await
    }

    /// Send transaction with retry logic
    async fn send_with_retry(&self, tx: TypedTransaction) -> WatcherResult<H256> {
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < self.max_retries {
            attempts += 1;

            // Sign transaction
            let signed_tx = match self.wallet.sign_transaction(&tx).await {
                Ok(sig) => tx.rlp_signed(&sig),
                Err(e) => {
                    error!("Failed to sign transaction: {}", e);
                    return Err(WatcherError::Wallet(e.to_string()));
                }
            };

            // Send with timeout; the pending handle borrows the provider
            let http = self.provider.http();
            let result = timeout(SEND_TIMEOUT, http.send_raw_transaction(signed_tx)).await;

            match result {
                Ok(Ok(pending_tx)) => {
                    let tx_hash = pending_tx.tx_hash();
                    info!(
                        "Transaction sent: {:?} (attempt {}/{})",
                        tx_hash, attempts, self.max_retries
                    );
                    return Ok(tx_hash);
                }
                Ok(Err(e)) => {
                    let classified = classify_send_error(self.provider.chain_id(), e.to_string());
                    if !classified.is_retryable() {
                        return Err(classified);
                    }
                    warn!("Transaction send failed (attempt {}): {}", attempts, classified);
                    self.provider.failover();
                    last_error = Some(classified);
                }
                Err(_) => {
                    warn!("Transaction send timeout (attempt {})", attempts);
                    last_error = Some(WatcherError::Timeout {
                        operation: "send transaction".to_string(),
                    });
                }
            }

            // Wait before retry
            if attempts < self.max_retries {
                tokio::time::sleep(Duration::from_millis(self.retry_delay_ms)).await;
            }
        }

        Err(last_error.unwrap_or(WatcherError::Transaction("Unknown error".to_string())))
    }
}

/// Map a node or signer error message onto the error taxonomy
pub fn classify_send_error(chain_id: u64, message: String) -> WatcherError {
    let lower = message.to_lowercase();

    if lower.contains("user rejected")
        || lower.contains("user denied")
        || lower.contains("4001")
    {
        WatcherError::UserDeclined(message)
    } else if lower.contains("execution reverted") {
        WatcherError::Contract(message)
    } else if lower.contains("insufficient funds")
        || lower.contains("nonce too low")
        || lower.contains("underpriced")
    {
        WatcherError::Transaction(message)
    } else if lower.contains("429") || lower.contains("rate limit") {
        WatcherError::RateLimited {
            service: "rpc".to_string(),
        }
    } else {
        WatcherError::ChainConnection { chain_id, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_send_error() {
        assert!(matches!(
            classify_send_error(
                1,
                "MetaMask Tx Signature: User denied transaction signature.".into()
            ),
            WatcherError::UserDeclined(_)
        ));
        assert!(matches!(
            classify_send_error(1, "execution reverted: not owner".into()),
            WatcherError::Contract(_)
        ));
        assert!(matches!(
            classify_send_error(1, "insufficient funds for gas * price + value".into()),
            WatcherError::Transaction(_)
        ));
        assert!(classify_send_error(1, "HTTP 429 Too Many Requests".into()).is_retryable());
        assert!(classify_send_error(1, "connection reset by peer".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_node_exhausts_retries() {
        let provider = ChainProvider::new(ChainConfig {
            chain_id: 80001,
            name: "mumbai".to_string(),
            rpc_urls: vec!["http://127.0.0.1:1".to_string()],
            router_address: "0x00000000000000000000000000000000000000b1".to_string(),
            recorder_address: "0x00000000000000000000000000000000000000b2".to_string(),
            vault_address: "0x00000000000000000000000000000000000000b3".to_string(),
            max_retries: 2,
            retry_delay_ms: 1,
        })
        .unwrap();
        let wallet: LocalWallet = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
            .parse()
            .unwrap();
        let sender = TransactionSender {
            provider: Arc::new(provider),
            wallet: wallet.with_chain_id(80001u64),
            max_retries: 2,
            retry_delay_ms: 1,
        };

        let tx: TypedTransaction = TransactionRequest::new()
            .to(Address::from_low_u64_be(0xb2))
            .nonce(0)
            .gas(21_000)
            .gas_price(1)
            .chain_id(80001)
            .into();

        let err = sender.send_with_retry(tx).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_missing_wallet_env_is_wallet_error() {
        let err = TransactionSender::load_wallet("SWAP_WATCHER_TEST_NO_SUCH_KEY").unwrap_err();
        assert!(matches!(err, WatcherError::Wallet(_)));
    }

    #[test]
    fn test_load_wallet_accepts_prefixed_key() {
        std::env::set_var(
            "SWAP_WATCHER_TEST_KEY",
            "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
        );
        let wallet = TransactionSender::load_wallet("SWAP_WATCHER_TEST_KEY").unwrap();
        assert_ne!(wallet.address(), Address::zero());
    }
}
