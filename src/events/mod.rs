//! Receipt log parsing
//!
//! Recovers the tokens an account actually sent and received from a batch
//! transaction's logs. A batch receipt carries the Transfer and Swap events of
//! every swap in the round; the swaps are told apart by counting Swap events.

use ethers::prelude::*;

/// Event topic signatures (keccak256 of event signature)
pub mod topics {
    use ethers::types::H256;
    use lazy_static::lazy_static;

    lazy_static! {
        /// Transfer(address,address,uint256)
        pub static ref TRANSFER: H256 =
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
                .parse()
                .unwrap_or_default();
        /// Swap event of the batch router's pairs
        pub static ref SWAP: H256 =
            "0xcbdaf2fdec4361aa4e9cafe49671d841695df07b12b53d1ce10464489a98dd49"
                .parse()
                .unwrap_or_default();
    }
}

/// A token movement of the tracked account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenTransfer {
    pub token: Address,
    pub amount: U256,
}

/// What the tracked account sent and received within one swap of a batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferGroup {
    pub sent: Option<TokenTransfer>,
    pub received: Option<TokenTransfer>,
}

/// Address held in an indexed topic
fn topic_address(topic: &H256) -> Address {
    Address::from_slice(&topic.as_bytes()[12..32])
}

/// First data word of a log
fn data_amount(log: &Log) -> Option<U256> {
    (log.data.len() >= 32).then(|| U256::from_big_endian(&log.data[0..32]))
}

/// Collect the account's transfers belonging to the swap at `order`.
///
/// Transfers seen after `order` Swap events and before the next one form the
/// group. Several outgoing transfers can precede a swap (fees, wrapping); the
/// largest one is the input leg. The last incoming transfer is the output leg.
pub fn scan_transfers(logs: &[Log], order: usize, account: Address) -> TransferGroup {
    let mut group = TransferGroup::default();
    let mut swaps_seen = 0usize;

    for log in logs {
        let Some(topic) = log.topics.first() else {
            continue;
        };

        if *topic == *topics::SWAP {
            swaps_seen += 1;
            if swaps_seen > order {
                break;
            }
            continue;
        }

        if *topic != *topics::TRANSFER || swaps_seen != order || log.topics.len() < 3 {
            continue;
        }

        let Some(amount) = data_amount(log) else {
            continue;
        };
        let transfer = TokenTransfer {
            token: log.address,
            amount,
        };

        if topic_address(&log.topics[1]) == account {
            let larger = group.sent.map_or(true, |current| amount > current.amount);
            if larger {
                group.sent = Some(transfer);
            }
        }

        if topic_address(&log.topics[2]) == account {
            group.received = Some(transfer);
        }
    }

    group
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address_topic(address: Address) -> H256 {
        H256::from(address)
    }

    fn amount_data(amount: u64) -> Bytes {
        let mut word = [0u8; 32];
        U256::from(amount).to_big_endian(&mut word);
        Bytes::from(word.to_vec())
    }

    fn transfer(token: u64, from: Address, to: Address, amount: u64) -> Log {
        Log {
            address: Address::from_low_u64_be(token),
            topics: vec![*topics::TRANSFER, address_topic(from), address_topic(to)],
            data: amount_data(amount),
            ..Default::default()
        }
    }

    fn swap() -> Log {
        Log {
            address: Address::from_low_u64_be(0xfeed),
            topics: vec![*topics::SWAP, H256::zero(), H256::zero()],
            data: amount_data(0),
            ..Default::default()
        }
    }

    #[test]
    fn test_topics_parse() {
        assert_ne!(*topics::TRANSFER, H256::zero());
        assert_ne!(*topics::SWAP, H256::zero());
        assert_eq!(
            *topics::TRANSFER,
            H256::from(ethers::utils::keccak256("Transfer(address,address,uint256)"))
        );
    }

    #[test]
    fn test_scan_picks_group_by_swap_count() {
        let account = Address::from_low_u64_be(0xaa);
        let pool = Address::from_low_u64_be(0xbb);
        let other = Address::from_low_u64_be(0xcc);

        let logs = vec![
            // order 0 belongs to someone else
            transfer(1, other, pool, 50),
            swap(),
            // order 1 is ours
            transfer(1, account, pool, 3),
            transfer(1, account, pool, 500),
            transfer(2, pool, account, 90),
            swap(),
            transfer(1, account, pool, 999),
        ];

        let group = scan_transfers(&logs, 1, account);
        assert_eq!(
            group.sent,
            Some(TokenTransfer {
                token: Address::from_low_u64_be(1),
                amount: U256::from(500u64)
            })
        );
        assert_eq!(
            group.received,
            Some(TokenTransfer {
                token: Address::from_low_u64_be(2),
                amount: U256::from(90u64)
            })
        );
    }

    #[test]
    fn test_scan_without_matches_is_empty() {
        let account = Address::from_low_u64_be(0xaa);
        let logs = vec![swap(), transfer(1, account, account, 10)];

        let group = scan_transfers(&logs, 0, account);
        assert_eq!(group, TransferGroup::default());
        assert!(group.sent.is_none() && group.received.is_none());

        assert_eq!(scan_transfers(&[], 3, account), TransferGroup::default());
    }

    #[test]
    fn test_short_logs_are_skipped() {
        let account = Address::from_low_u64_be(0xaa);
        let mut short = transfer(1, account, Address::zero(), 10);
        short.data = Bytes::from(vec![1u8; 4]);

        let group = scan_transfers(&[short], 0, account);
        assert!(group.sent.is_none());
    }
}
