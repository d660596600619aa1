//! Chain provider with multi-RPC support and automatic failover

use crate::config::ChainConfig;
use crate::error::{WatcherError, WatcherResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Arc<Provider<Http>>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Last known block number
    last_block: RwLock<u64>,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: ChainConfig) -> WatcherResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(Arc::new(provider));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(WatcherError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            last_block: RwLock::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> Arc<Provider<Http>> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        self.http_providers[idx % self.http_providers.len()].clone()
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        if self.http_providers.len() < 2 {
            return;
        }
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Wrap an RPC failure, rotating to the next provider
    pub fn connection_error(&self, message: impl Into<String>) -> WatcherError {
        self.failover();
        WatcherError::ChainConnection {
            chain_id: self.config.chain_id,
            message: message.into(),
        }
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> WatcherResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => {
                    let block_num = block.as_u64();
                    *self.last_block.write().await = block_num;
                    return Ok(block_num);
                }
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(WatcherError::ChainConnection {
            chain_id: self.config.chain_id,
            message: "All providers failed".to_string(),
        })
    }

    /// Last block number seen by `get_block_number`
    pub async fn last_block(&self) -> u64 {
        *self.last_block.read().await
    }

    /// Get a block header
    pub async fn get_block(&self, block_number: u64) -> WatcherResult<Option<Block<H256>>> {
        self.http()
            .get_block(block_number)
            .await
            .map_err(|e| self.connection_error(e.to_string()))
    }

    /// Get transaction receipt with failover
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> WatcherResult<Option<TransactionReceipt>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction_receipt(tx_hash).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    warn!(
                        "Failed to get receipt {:?} from chain {}: {}",
                        tx_hash, self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(WatcherError::ChainConnection {
            chain_id: self.config.chain_id,
            message: format!("All providers failed to get receipt {:?}", tx_hash),
        })
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    /// Get chain ID
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_config(rpc_urls: Vec<&str>) -> ChainConfig {
        ChainConfig {
            chain_id: 80001,
            name: "mumbai".to_string(),
            rpc_urls: rpc_urls.into_iter().map(String::from).collect(),
            router_address: "0x00000000000000000000000000000000000000b1".to_string(),
            recorder_address: "0x00000000000000000000000000000000000000b2".to_string(),
            vault_address: "0x00000000000000000000000000000000000000b3".to_string(),
            max_retries: 3,
            retry_delay_ms: 10,
        }
    }

    #[test]
    fn test_rejects_config_without_valid_urls() {
        let err = ChainProvider::new(chain_config(vec!["not a url"])).err().unwrap();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_failover_rotates_providers() {
        let provider = ChainProvider::new(chain_config(vec![
            "http://localhost:8545",
            "http://localhost:8546",
        ]))
        .unwrap();

        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 0);
        provider.failover();
        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 1);
        provider.failover();
        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 0);
        assert_eq!(provider.chain_id(), 80001);
    }
}
