//! ERC-4337 user operation types and the contract surfaces the relay
//! touches.
//!
//! The entry point and paymaster ABIs are treated as opaque encoders: the
//! relay packs `handleOps` calldata and asks the paymaster for the digest to
//! sign, nothing more.

use alloy::{
    primitives::{keccak256, Address, B256, U256},
    sol,
    sol_types::{SolCall, SolValue},
};
use serde::{Deserialize, Serialize};

sol! {
    /// An ERC-4337 user operation as submitted by wallets.
    #[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    struct UserOperation {
        /// The smart account sending the operation.
        address sender;
        /// Anti-replay nonce. The upper 192 bits are a sequence key.
        uint256 nonce;
        /// Factory address + calldata deploying the account, when it does
        /// not exist yet.
        bytes initCode;
        /// The call the account will execute.
        bytes callData;
        uint256 callGasLimit;
        uint256 verificationGasLimit;
        uint256 preVerificationGas;
        uint256 maxFeePerGas;
        uint256 maxPriorityFeePerGas;
        /// `[20-byte paymaster | 32-byte validUntil | 32-byte validAfter |
        /// 65-byte sponsor signature]` once sponsored.
        bytes paymasterAndData;
        /// The account owner's signature over the op hash.
        bytes signature;
    }

    #[sol(rpc)]
    contract EntryPoint {
        function handleOps(UserOperation[] calldata ops, address payable beneficiary) external;
    }

    #[sol(rpc)]
    contract SponsorPaymaster {
        function getHash(UserOperation calldata userOp, uint48 validUntil, uint48 validAfter)
            external
            view
            returns (bytes32);
    }

    /// The account-side execution entrypoints the paymaster is willing to
    /// sponsor.
    contract SmartAccount {
        function execute(address dest, uint256 value, bytes calldata func) external;
        function executeBatch(address[] calldata dest, uint256[] calldata value, bytes[] calldata func) external;
        function execTransactionFromModule(address to, uint256 value, bytes memory data, uint8 operation)
            external
            returns (bool);
    }
}

/// Selector of `execute(address,uint256,bytes)`.
pub const SELECTOR_EXECUTE: [u8; 4] = SmartAccount::executeCall::SELECTOR;
/// Selector of `executeBatch(address[],uint256[],bytes[])`.
pub const SELECTOR_EXECUTE_BATCH: [u8; 4] = SmartAccount::executeBatchCall::SELECTOR;
/// Selector of `execTransactionFromModule(address,uint256,bytes,uint8)`.
pub const SELECTOR_EXEC_FROM_MODULE: [u8; 4] = SmartAccount::execTransactionFromModuleCall::SELECTOR;

impl UserOperation {
    /// A deterministic hash identifying this operation within a chain.
    pub fn op_hash(&self) -> B256 {
        keccak256(self.abi_encode())
    }

    /// The paymaster address embedded in `paymasterAndData`, if any.
    pub fn paymaster(&self) -> Option<Address> {
        (self.paymasterAndData.len() >= 20)
            .then(|| Address::from_slice(&self.paymasterAndData[..20]))
    }

    /// The `(validUntil, validAfter)` window packed into `paymasterAndData`.
    pub fn sponsorship_window(&self) -> Option<(u64, u64)> {
        if self.paymasterAndData.len() < 84 {
            return None;
        }
        let (until, after) =
            <(U256, U256)>::abi_decode_params(&self.paymasterAndData[20..84]).ok()?;
        Some((until.saturating_to(), after.saturating_to()))
    }

    /// The 65-byte sponsor signature at the tail of `paymasterAndData`.
    pub fn sponsorship_signature(&self) -> Option<&[u8]> {
        let sig = self.paymasterAndData.get(84..)?;
        (sig.len() == 65).then_some(sig)
    }
}

/// Extracts the destination address from sponsored account calldata.
///
/// All allow-listed selectors put the destination first, so decoding the
/// single-call layout covers every variant.
pub fn parse_destination(call_data: &[u8]) -> Option<Address> {
    if call_data.len() < 4 {
        return None;
    }
    let args = call_data.get(4..)?;
    let (dest, _value, _data) = <(Address, U256, alloy::primitives::Bytes)>::abi_decode_params(args).ok()?;
    Some(dest)
}

/// A user operation travelling through the bundler queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserOpMessage {
    /// The paymaster contract sponsoring the op.
    pub paymaster: Address,
    /// The entry point the bundle will be submitted to.
    pub entry_point: Address,
    /// Chain the op targets.
    pub chain_id: u64,
    /// The signed operation itself.
    pub userop: UserOperation,
    /// Application payload that will later be indexed from the chain.
    pub data: Option<serde_json::Value>,
    /// Optional human-readable description, attached to the indexed log
    /// once it is observed on chain.
    pub extra_data: Option<serde_json::Value>,
    /// How many fee bumps this message has accumulated through replacement
    /// requests.
    pub bump_gas: u8,
}

impl UserOpMessage {
    /// The deduplication identity of this message within the queue.
    pub fn identity(&self) -> String {
        format!("userop:{}{}", self.chain_id, self.userop.op_hash())
    }
}
