//! Contract bindings for the sequencer's on-chain side

use ethers::prelude::abigen;

abigen!(
    Recorder,
    r#"[
        function currentRound() external view returns (uint256)
        function getRoundTxHashes(uint256 round) external view returns (bytes32[])
        function disableTxHash(bytes32 txHash) external
    ]"#
);

abigen!(
    Router,
    r#"[
        struct SwapTx { address txOwner; bytes4 functionSelector; uint256 amountIn; uint256 amountOut; address[] path; address to; uint256 nonce; uint256 availableFrom; uint256 deadline; }
        struct Sig { uint8 v; bytes32 r; bytes32 s; }
        function reimbursement(uint256 round, uint256 order, SwapTx tx, bytes32 proofHash, Sig operatorSig) external
        function operator() external view returns (address)
    ]"#
);

abigen!(
    Vault,
    r#"[
        function reimbursementAmount() external view returns (uint256)
    ]"#
);

abigen!(
    Erc20,
    r#"[
        function decimals() external view returns (uint8)
        function symbol() external view returns (string)
    ]"#
);
