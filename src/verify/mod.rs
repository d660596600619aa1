//! Order verification against the sequencer's committed hash chain
//!
//! The sequencer commits to a round's order with a rolling digest:
//! `chain[0] = H[0]`, `chain[i] = keccak256(chain[i-1] ‖ H[i])`. A transaction
//! at position `order > 0` carries `chain[order - 1]` as its proof hash; the
//! first transaction of a round carries the zero hash.

use ethers::types::H256;
use sha3::{Digest, Keccak256};
use std::fmt;

/// Offset between a hash's index in the round list and the stored order.
///
/// Orders are zero-based everywhere: the resolver, the verifier and the
/// receipt log scan all index the round with the same value.
pub const ORDER_INDEX_OFFSET: i64 = 0;

/// Packed keccak256 of two 32-byte words
pub fn digest(previous: &H256, next: &H256) -> H256 {
    let mut hasher = Keccak256::new();
    hasher.update(previous.as_bytes());
    hasher.update(next.as_bytes());
    H256::from_slice(&hasher.finalize())
}

/// Chain value at `index`, without materialising the rest
pub fn chain_at(hashes: &[H256], index: usize) -> Option<H256> {
    let (first, rest) = hashes.split_first()?;
    if index >= hashes.len() {
        return None;
    }
    Some(rest[..index].iter().fold(*first, |acc, h| digest(&acc, h)))
}

/// Proof hash a transaction at `order` must carry
pub fn expected_proof(hashes: &[H256], order: usize) -> Option<H256> {
    match order {
        0 => Some(H256::zero()),
        n => chain_at(hashes, n - 1),
    }
}

/// What the verifier is asked to check
#[derive(Debug, Clone)]
pub struct OrderCheck<'a> {
    /// Finalized hash list of the recorded round
    pub round_hashes: &'a [H256],
    pub recorded_round: u64,
    pub current_round: u64,
    pub order: i64,
    pub proof_hash: H256,
    pub tx_hash: H256,
}

/// Why a committed position was not honored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    RoundNotFinalized { round: u64, current_round: u64 },
    OrderUnassigned,
    OrderOutOfRange { order: i64, len: usize },
    HashMismatch { expected: H256, found: H256 },
    ProofMismatch { expected: H256, recorded: H256 },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::RoundNotFinalized {
                round,
                current_round,
            } => write!(f, "round {} not finalized (current {})", round, current_round),
            Violation::OrderUnassigned => write!(f, "order not assigned"),
            Violation::OrderOutOfRange { order, len } => {
                write!(f, "order {} outside round of {} hashes", order, len)
            }
            Violation::HashMismatch { expected, found } => {
                write!(f, "round holds {:?} where {:?} was committed", found, expected)
            }
            Violation::ProofMismatch { expected, recorded } => {
                write!(f, "proof hash {:?} does not match chain {:?}", recorded, expected)
            }
        }
    }
}

/// Verification result; a violation is a classification, not an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Honored,
    Violated(Violation),
}

/// Check that a transaction's committed position was honored
pub fn verify_order(check: &OrderCheck<'_>) -> Verdict {
    if check.current_round <= check.recorded_round {
        return Verdict::Violated(Violation::RoundNotFinalized {
            round: check.recorded_round,
            current_round: check.current_round,
        });
    }

    if check.order < 0 {
        return Verdict::Violated(Violation::OrderUnassigned);
    }

    let index = (check.order - ORDER_INDEX_OFFSET) as usize;
    let Some(found) = check.round_hashes.get(index) else {
        return Verdict::Violated(Violation::OrderOutOfRange {
            order: check.order,
            len: check.round_hashes.len(),
        });
    };

    if *found != check.tx_hash {
        return Verdict::Violated(Violation::HashMismatch {
            expected: check.tx_hash,
            found: *found,
        });
    }

    // index < len, so the expected proof always exists
    let expected = expected_proof(check.round_hashes, index).unwrap_or_default();
    if expected != check.proof_hash {
        return Verdict::Violated(Violation::ProofMismatch {
            expected,
            recorded: check.proof_hash,
        });
    }

    Verdict::Honored
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(byte: u8) -> H256 {
        H256::repeat_byte(byte)
    }

    fn keccak_pair(a: &H256, b: &H256) -> H256 {
        let mut packed = Vec::with_capacity(64);
        packed.extend_from_slice(a.as_bytes());
        packed.extend_from_slice(b.as_bytes());
        H256::from(ethers::utils::keccak256(packed))
    }

    fn check<'a>(hashes: &'a [H256], order: i64, proof_hash: H256, tx_hash: H256) -> OrderCheck<'a> {
        OrderCheck {
            round_hashes: hashes,
            recorded_round: 3,
            current_round: 5,
            order,
            proof_hash,
            tx_hash,
        }
    }

    /// Full rolling chain over a round's hashes
    fn hash_chain(hashes: &[H256]) -> Vec<H256> {
        let mut chain: Vec<H256> = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let next = match chain.last() {
                Some(previous) => digest(previous, hash),
                None => *hash,
            };
            chain.push(next);
        }
        chain
    }

    #[test]
    fn test_digest_matches_packed_keccak() {
        assert_eq!(digest(&h(1), &h(2)), keccak_pair(&h(1), &h(2)));
    }

    #[test]
    fn test_hash_chain_law() {
        let hashes = [h(1), h(2), h(3)];
        let chain = hash_chain(&hashes);

        assert_eq!(chain[0], h(1));
        assert_eq!(chain[1], digest(&h(1), &h(2)));
        assert_eq!(chain[2], digest(&chain[1], &h(3)));

        for (i, value) in chain.iter().enumerate() {
            assert_eq!(chain_at(&hashes, i), Some(*value));
        }
        assert_eq!(chain_at(&hashes, 3), None);
        assert_eq!(chain_at(&[], 0), None);
    }

    #[test]
    fn test_verify_order_two_needs_chain_one() {
        let hashes = [h(1), h(2), h(3)];
        let chain_one = digest(&h(1), &h(2));

        assert_eq!(verify_order(&check(&hashes, 2, chain_one, h(3))), Verdict::Honored);

        let wrong = verify_order(&check(&hashes, 2, h(1), h(3)));
        assert!(matches!(wrong, Verdict::Violated(Violation::ProofMismatch { .. })));

        let chain_two = hash_chain(&hashes)[2];
        assert_ne!(verify_order(&check(&hashes, 2, chain_two, h(3))), Verdict::Honored);
    }

    #[test]
    fn test_order_zero_needs_zero_sentinel() {
        let hashes = [h(1), h(2)];
        assert_eq!(verify_order(&check(&hashes, 0, H256::zero(), h(1))), Verdict::Honored);
        assert_ne!(verify_order(&check(&hashes, 0, h(1), h(1))), Verdict::Honored);
    }

    #[test]
    fn test_order_one_needs_first_hash() {
        let hashes = [h(1), h(2)];
        assert_eq!(verify_order(&check(&hashes, 1, h(1), h(2))), Verdict::Honored);
    }

    #[test]
    fn test_open_round_is_a_violation() {
        let hashes = [h(1), h(2)];
        let mut open = check(&hashes, 0, H256::zero(), h(1));
        open.current_round = 3;
        assert_eq!(
            verify_order(&open),
            Verdict::Violated(Violation::RoundNotFinalized {
                round: 3,
                current_round: 3
            })
        );
    }

    #[test]
    fn test_bad_positions_never_panic() {
        let hashes = [h(1), h(2)];
        assert_eq!(
            verify_order(&check(&hashes, -1, H256::zero(), h(1))),
            Verdict::Violated(Violation::OrderUnassigned)
        );
        assert!(matches!(
            verify_order(&check(&hashes, 7, H256::zero(), h(1))),
            Verdict::Violated(Violation::OrderOutOfRange { order: 7, len: 2 })
        ));
        assert!(matches!(
            verify_order(&check(&[], 0, H256::zero(), h(1))),
            Verdict::Violated(Violation::OrderOutOfRange { .. })
        ));
        assert!(matches!(
            verify_order(&check(&hashes, 1, h(1), h(9))),
            Verdict::Violated(Violation::HashMismatch { .. })
        ));
    }
}
