//! Paymaster sponsorship engine.
//!
//! Validates user-operation shape and signs time-bounded sponsorship
//! payloads with the paymaster's stored key. Every rejection carries a
//! user-visible reason and is never retried.

use crate::{
    constants::{
        MIN_PAYMASTER_AND_DATA_LEN, OO_SPONSOR_VALID_FOR, SPONSOR_VALID_FOR, SPONSOR_VALID_SLACK,
    },
    error::{RelayError, StorageError},
    evm::DynEvm,
    storage::RelayStorage,
    types::{
        SponsorPaymaster, UserOperation, SELECTOR_EXECUTE, SELECTOR_EXECUTE_BATCH,
        SELECTOR_EXEC_FROM_MODULE,
    },
};
use alloy::{
    primitives::{
        aliases::U48, eip191_hash_message, Address, Bytes, Signature, B256, U256,
    },
    signers::{local::PrivateKeySigner, SignerSync},
    sol_types::{sol_data, SolCall, SolType, SolValue},
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Optional hint selecting the calldata layout to validate against.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymasterType {
    /// `"cw-safe"` adds a trailing `uint8` operation argument.
    #[serde(default, rename = "type")]
    pub kind: String,
}

impl PaymasterType {
    fn is_safe(&self) -> bool {
        self.kind == "cw-safe"
    }
}

/// The sponsorship payload returned to the wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymasterData {
    /// `paymaster ‖ pack(validUntil, validAfter) ‖ signature`, hex.
    pub paymaster_and_data: String,
    /// Passed-through gas limit, hex quantity.
    pub pre_verification_gas: String,
    /// Passed-through gas limit, hex quantity.
    pub verification_gas_limit: String,
    /// Passed-through gas limit, hex quantity.
    pub call_gas_limit: String,
}

/// Signs sponsorship payloads for user operations.
#[derive(Debug, Clone)]
pub struct PaymasterService {
    evm: DynEvm,
    storage: RelayStorage,
}

impl PaymasterService {
    /// Creates a paymaster service.
    pub fn new(evm: DynEvm, storage: RelayStorage) -> Self {
        Self { evm, storage }
    }

    /// Sponsors a single user operation with a short validity window.
    pub async fn sponsor(
        &self,
        paymaster: Address,
        userop: &UserOperation,
        entry_point: &str,
        pt: &PaymasterType,
    ) -> Result<PaymasterData, RelayError> {
        if entry_point.is_empty() {
            return Err(RelayError::validation("error entrypoint address is empty"));
        }

        self.require_deployed(paymaster, "paymaster contract not deployed").await?;
        self.validate_account_state(userop).await?;
        validate_call_data(&userop.callData, pt)?;

        let now = chrono::Utc::now().timestamp() as u64;
        let valid_until = now + SPONSOR_VALID_FOR.as_secs();
        let valid_after = now - SPONSOR_VALID_SLACK.as_secs();

        let signer = self.sponsor_signer(paymaster).await?;
        let paymaster_and_data =
            self.sign_sponsorship(paymaster, userop, valid_until, valid_after, &signer).await?;

        Ok(PaymasterData {
            paymaster_and_data: format!("0x{}", alloy::hex::encode(paymaster_and_data)),
            pre_verification_gas: hex_quantity(userop.preVerificationGas),
            verification_gas_limit: hex_quantity(userop.verificationGasLimit),
            call_gas_limit: hex_quantity(userop.callGasLimit),
        })
    }

    /// Pre-signs `amount` copies of the operation with fresh random nonces
    /// and a 7-day validity window, for offline use.
    pub async fn oo_sponsor(
        &self,
        paymaster: Address,
        userop: &UserOperation,
        entry_point: &str,
        pt: &PaymasterType,
        amount: usize,
    ) -> Result<Vec<UserOperation>, RelayError> {
        if entry_point.is_empty() {
            return Err(RelayError::validation("error entrypoint address is empty"));
        }

        self.require_deployed(paymaster, "error paymaster contract not deployed").await?;
        validate_call_data(&userop.callData, pt)?;

        let now = chrono::Utc::now().timestamp() as u64;
        let valid_until = now + OO_SPONSOR_VALID_FOR.as_secs();
        let valid_after = now - SPONSOR_VALID_SLACK.as_secs();

        let signer = self.sponsor_signer(paymaster).await?;

        let mut userops = Vec::with_capacity(amount);
        for _ in 0..amount {
            let mut op = userop.clone();
            op.nonce = random_sequence_nonce();

            op.paymasterAndData = self
                .sign_sponsorship(paymaster, &op, valid_until, valid_after, &signer)
                .await?
                .into();

            userops.push(op);
        }

        Ok(userops)
    }

    /// Checks a sponsored operation before it enters the queue: the
    /// signature window must be open and the embedded signature must
    /// recover to the stored sponsor key.
    pub async fn verify_sponsorship(
        &self,
        paymaster: Address,
        userop: &UserOperation,
    ) -> Result<(), RelayError> {
        if userop.paymasterAndData.len() < MIN_PAYMASTER_AND_DATA_LEN {
            return Err(RelayError::validation("paymaster data is malformed"));
        }

        let (valid_until, valid_after) = userop
            .sponsorship_window()
            .ok_or_else(|| RelayError::validation("paymaster data is malformed"))?;

        let now = chrono::Utc::now().timestamp() as u64;
        if valid_until < now {
            return Err(RelayError::validation("paymaster signature has expired"));
        }
        if valid_after > now {
            return Err(RelayError::validation("paymaster signature is not valid yet"));
        }

        let sig = userop
            .sponsorship_signature()
            .ok_or_else(|| RelayError::validation("paymaster signature is malformed"))?;

        let digest = self.sponsorship_digest(paymaster, userop, valid_until, valid_after).await?;

        let signature = Signature::try_from(sig)
            .map_err(|_| RelayError::validation("paymaster signature is malformed"))?;
        let recovered = signature
            .recover_address_from_prehash(&digest)
            .map_err(|_| RelayError::validation("error recovering public key"))?;

        let signer = self.sponsor_signer(paymaster).await?;
        if recovered != signer.address() {
            return Err(RelayError::validation("paymaster signature does not match"));
        }

        Ok(())
    }

    async fn require_deployed(&self, address: Address, reason: &str) -> Result<(), RelayError> {
        let code = self.evm.code_at(address).await?;
        if code.is_empty() {
            return Err(RelayError::validation(reason));
        }
        Ok(())
    }

    /// Nonce and init code must agree: an existing account never redeploys,
    /// a fresh account's factory must exist.
    async fn validate_account_state(&self, userop: &UserOperation) -> Result<(), RelayError> {
        if userop.nonce > U256::ZERO && !userop.initCode.is_empty() {
            return Err(RelayError::validation(
                "error init code is not empty even though nonce is not 0",
            ));
        }

        if userop.nonce == U256::ZERO && userop.initCode.len() >= 20 {
            let factory = Address::from_slice(&userop.initCode[..20]);
            let code = self.evm.code_at(factory).await?;
            if code.is_empty() {
                return Err(RelayError::validation("error factory contract not found"));
            }
        }

        Ok(())
    }

    async fn sponsor_signer(&self, paymaster: Address) -> Result<PrivateKeySigner, RelayError> {
        let sponsor = match self.storage.get_sponsor(&paymaster.to_string()).await {
            Ok(sponsor) => sponsor,
            Err(StorageError::NotFound) => {
                return Err(RelayError::validation("error not allowed to operate this paymaster"))
            }
            Err(err) => return Err(err.into()),
        };

        sponsor
            .private_key
            .parse()
            .map_err(|_| RelayError::validation("error invalid private key"))
    }

    /// Asks the paymaster contract for the op hash and converts it to the
    /// EIP-191 personal-sign digest.
    async fn sponsorship_digest(
        &self,
        paymaster: Address,
        userop: &UserOperation,
        valid_until: u64,
        valid_after: u64,
    ) -> Result<B256, RelayError> {
        let (valid_until, valid_after) = validity_window(valid_until, valid_after)?;

        let call = SponsorPaymaster::getHashCall {
            userOp: userop.clone(),
            validUntil: valid_until,
            validAfter: valid_after,
        };

        let returned = self.evm.call(paymaster, call.abi_encode().into()).await?;
        let hash = SponsorPaymaster::getHashCall::abi_decode_returns(&returned)
            .map_err(|_| RelayError::validation("error generating hash"))?;

        Ok(eip191_hash_message(hash.as_slice()))
    }

    async fn sign_sponsorship(
        &self,
        paymaster: Address,
        userop: &UserOperation,
        valid_until: u64,
        valid_after: u64,
        signer: &PrivateKeySigner,
    ) -> Result<Vec<u8>, RelayError> {
        let digest = self.sponsorship_digest(paymaster, userop, valid_until, valid_after).await?;

        let signature = signer
            .sign_hash_sync(&digest)
            .map_err(|_| RelayError::validation("error signing hash"))?;

        // 65-byte r ‖ s ‖ v with the recovery id in its 27/28 form.
        let mut sig_bytes = [0u8; 65];
        sig_bytes[..32].copy_from_slice(&signature.r().to_be_bytes::<32>());
        sig_bytes[32..64].copy_from_slice(&signature.s().to_be_bytes::<32>());
        sig_bytes[64] = 27 + signature.v() as u8;

        let (valid_until, valid_after) = validity_window(valid_until, valid_after)?;
        let validity = (valid_until, valid_after).abi_encode_params();

        let mut data = paymaster.to_vec();
        data.extend_from_slice(&validity);
        data.extend_from_slice(&sig_bytes);
        Ok(data)
    }
}

/// Converts the window to `uint48`, rejecting values that do not fit.
fn validity_window(valid_until: u64, valid_after: u64) -> Result<(U48, U48), RelayError> {
    let until = U48::try_from(valid_until)
        .map_err(|_| RelayError::validation("error invalid validity period"))?;
    let after = U48::try_from(valid_after)
        .map_err(|_| RelayError::validation("error invalid validity period"))?;
    Ok((until, after))
}

/// A fresh random 192-bit sequence key in the nonce's upper bits.
fn random_sequence_nonce() -> U256 {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    U256::from_be_slice(&bytes) << 64
}

fn hex_quantity(value: U256) -> String {
    format!("0x{value:x}")
}

/// Rejects calldata that does not target an allow-listed account entrypoint
/// or does not decode against its layout.
fn validate_call_data(call_data: &Bytes, pt: &PaymasterType) -> Result<(), RelayError> {
    if call_data.len() < 4 {
        return Err(RelayError::validation("error call data is too short"));
    }

    let selector: [u8; 4] = call_data[..4].try_into().expect("length checked above");
    if selector != SELECTOR_EXECUTE
        && selector != SELECTOR_EXECUTE_BATCH
        && selector != SELECTOR_EXEC_FROM_MODULE
    {
        return Err(RelayError::validation(
            "error invalid function signature. supported signatures: execute, executeBatch, execTransactionFromModule",
        ));
    }

    let args = &call_data[4..];
    if pt.is_safe() {
        <(sol_data::Address, sol_data::Uint<256>, sol_data::Bytes, sol_data::Uint<8>)>::abi_decode_params(args)
            .map_err(|_| RelayError::validation("error invalid call arguments"))?;
    } else {
        <(Address, U256, Bytes)>::abi_decode_params(args)
            .map_err(|_| RelayError::validation("error invalid call arguments"))?;
    }

    Ok(())
}
