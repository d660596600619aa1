//! Sequencer access
//!
//! Round assignments come from the operator's HTTP API; finalized round
//! contents and the current round come from the recorder contract.

use crate::chain::contracts::Recorder;
use crate::chain::ChainProvider;
use crate::config::SequencerConfig;
use crate::error::{WatcherError, WatcherResult};

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Read access to the sequencing service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Sequencer: Send + Sync {
    /// Batch transaction hash executing `round` for this router, once decided
    async fn assigned_tx_hash(
        &self,
        chain_id: u64,
        router: Address,
        round: u64,
    ) -> WatcherResult<Option<H256>>;

    /// Ordered transaction hashes of a round
    async fn round_hashes(&self, round: u64) -> WatcherResult<Vec<H256>>;

    /// Round currently accepting transactions
    async fn current_round(&self) -> WatcherResult<u64>;
}

#[derive(Debug, Deserialize)]
struct AssignedTxResponse {
    #[serde(rename = "txHash")]
    tx_hash: Option<String>,
}

/// Rounds are counted in `u64`; a larger value means a broken recorder
fn round_to_u64(round: U256) -> WatcherResult<u64> {
    u64::try_from(round)
        .map_err(|_| WatcherError::Contract(format!("currentRound {} exceeds u64", round)))
}

fn parse_assigned(response: AssignedTxResponse) -> WatcherResult<Option<H256>> {
    match response.tx_hash.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => H256::from_str(raw)
            .map(Some)
            .map_err(|e| WatcherError::Sequencer(format!("bad txHash {:?}: {}", raw, e))),
    }
}

/// Operator API plus recorder contract
pub struct SequencerClient {
    http: Client,
    operator_url: String,
    provider: Arc<ChainProvider>,
    recorder: Address,
}

impl SequencerClient {
    pub fn new(
        config: &SequencerConfig,
        provider: Arc<ChainProvider>,
        recorder: Address,
    ) -> WatcherResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| WatcherError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            operator_url: config.operator_url.trim_end_matches('/').to_string(),
            provider,
            recorder,
        })
    }

    fn assigned_tx_url(&self, chain_id: u64, router: Address, round: u64) -> WatcherResult<Url> {
        Url::parse_with_params(
            &format!("{}/tx", self.operator_url),
            &[
                ("chainId", chain_id.to_string()),
                ("routerAddress", format!("{:?}", router)),
                ("round", round.to_string()),
            ],
        )
        .map_err(|e| WatcherError::Config(format!("sequencer.operator_url: {}", e)))
    }

    fn recorder(&self) -> Recorder<ethers::providers::Provider<ethers::providers::Http>> {
        Recorder::new(self.recorder, self.provider.http())
    }
}

#[async_trait]
impl Sequencer for SequencerClient {
    async fn assigned_tx_hash(
        &self,
        chain_id: u64,
        router: Address,
        round: u64,
    ) -> WatcherResult<Option<H256>> {
        let url = self.assigned_tx_url(chain_id, router, round)?;
        let resp = self.http.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                WatcherError::Timeout {
                    operation: format!("assigned tx of round {}", round),
                }
            } else {
                WatcherError::Sequencer(e.to_string())
            }
        })?;

        match resp.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(WatcherError::RateLimited {
                    service: "sequencer".to_string(),
                })
            }
            status if !status.is_success() => {
                return Err(WatcherError::Sequencer(format!(
                    "operator returned {} for round {}",
                    status, round
                )))
            }
            _ => {}
        }

        let body: AssignedTxResponse = resp
            .json()
            .await
            .map_err(|e| WatcherError::Sequencer(e.to_string()))?;
        let assigned = parse_assigned(body)?;
        debug!("Round {} assignment: {:?}", round, assigned);
        Ok(assigned)
    }

    async fn round_hashes(&self, round: u64) -> WatcherResult<Vec<H256>> {
        let hashes = self
            .recorder()
            .get_round_tx_hashes(U256::from(round))
            .call()
            .await
            .map_err(|e| self.provider.connection_error(format!("getRoundTxHashes: {}", e)))?;

        Ok(hashes.into_iter().map(H256::from).collect())
    }

    async fn current_round(&self) -> WatcherResult<u64> {
        let round = self
            .recorder()
            .current_round()
            .call()
            .await
            .map_err(|e| self.provider.connection_error(format!("currentRound: {}", e)))?;

        round_to_u64(round)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;

    fn client(operator_url: &str) -> SequencerClient {
        let provider = ChainProvider::new(ChainConfig {
            chain_id: 80001,
            name: "mumbai".to_string(),
            rpc_urls: vec!["http://localhost:8545".to_string()],
            router_address: "0x00000000000000000000000000000000000000b1".to_string(),
            recorder_address: "0x00000000000000000000000000000000000000b2".to_string(),
            vault_address: "0x00000000000000000000000000000000000000b3".to_string(),
            max_retries: 1,
            retry_delay_ms: 10,
        })
        .unwrap();

        SequencerClient::new(
            &SequencerConfig {
                operator_url: operator_url.to_string(),
                request_timeout_ms: 1000,
            },
            Arc::new(provider),
            Address::from_low_u64_be(0xb2),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_assigned_response() {
        let missing: AssignedTxResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(parse_assigned(missing).unwrap(), None);

        let empty: AssignedTxResponse = serde_json::from_str(r#"{"txHash": ""}"#).unwrap();
        assert_eq!(parse_assigned(empty).unwrap(), None);

        let hash = H256::repeat_byte(0x42);
        let present: AssignedTxResponse =
            serde_json::from_str(&format!(r#"{{"txHash": "{:?}"}}"#, hash)).unwrap();
        assert_eq!(parse_assigned(present).unwrap(), Some(hash));

        let garbage: AssignedTxResponse =
            serde_json::from_str(r#"{"txHash": "0xnothex"}"#).unwrap();
        assert!(parse_assigned(garbage).unwrap_err().is_retryable());
    }

    #[test]
    fn test_round_conversion_rejects_overflow() {
        assert_eq!(round_to_u64(U256::from(9u64)).unwrap(), 9);
        assert_eq!(round_to_u64(U256::from(u64::MAX)).unwrap(), u64::MAX);

        let err = round_to_u64(U256::MAX).unwrap_err();
        assert!(matches!(err, WatcherError::Contract(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_assigned_tx_url() {
        let client = client("https://operator.example/");
        let url = client
            .assigned_tx_url(80001, Address::from_low_u64_be(0xb1), 3)
            .unwrap();

        assert_eq!(url.path(), "/tx");
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            query,
            vec![
                ("chainId".to_string(), "80001".to_string()),
                (
                    "routerAddress".to_string(),
                    "0x00000000000000000000000000000000000000b1".to_string()
                ),
                ("round".to_string(), "3".to_string()),
            ]
        );
    }
}
