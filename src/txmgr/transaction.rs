//! Signed transaction wrapper handed between the manager and its callbacks

use super::error::{TxMgrError, TxMgrResult};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Bytes, Signature, H256, U256};

/// A transaction together with its signature.
///
/// The manager treats it as opaque apart from its hash; the fee accessors are
/// used for logging and by callers that key behavior off the fee cap.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    tx: TypedTransaction,
    signature: Signature,
    hash: H256,
}

impl SignedTransaction {
    pub fn new(tx: TypedTransaction, signature: Signature) -> Self {
        let hash = tx.hash(&signature);
        Self {
            tx,
            signature,
            hash,
        }
    }

    /// Signs `tx` with `wallet`, defaulting the chain id to the wallet's.
    pub fn sign(mut tx: TypedTransaction, wallet: &LocalWallet) -> TxMgrResult<Self> {
        if tx.chain_id().is_none() {
            tx.set_chain_id(wallet.chain_id());
        }
        let signature = wallet
            .sign_transaction_sync(&tx)
            .map_err(|e| TxMgrError::Signing(e.to_string()))?;
        Ok(Self::new(tx, signature))
    }

    pub fn hash(&self) -> H256 {
        self.hash
    }

    pub fn nonce(&self) -> Option<U256> {
        self.tx.nonce().copied()
    }

    /// Priority fee cap (`maxPriorityFeePerGas`), or the gas price for legacy txs
    pub fn gas_tip_cap(&self) -> Option<U256> {
        match &self.tx {
            TypedTransaction::Eip1559(inner) => inner.max_priority_fee_per_gas,
            other => other.gas_price(),
        }
    }

    /// Total fee cap (`maxFeePerGas`), or the gas price for legacy txs
    pub fn gas_fee_cap(&self) -> Option<U256> {
        match &self.tx {
            TypedTransaction::Eip1559(inner) => inner.max_fee_per_gas,
            other => other.gas_price(),
        }
    }

    /// RLP encoding suitable for `eth_sendRawTransaction`
    pub fn raw(&self) -> Bytes {
        self.tx.rlp_signed(&self.signature)
    }

    pub fn tx(&self) -> &TypedTransaction {
        &self.tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{dynamic_fee_tx, test_wallet};

    #[test]
    fn test_fee_accessors_and_hash() {
        let wallet = test_wallet();
        let a = SignedTransaction::sign(dynamic_fee_tx(5, 19), &wallet).unwrap();
        let b = SignedTransaction::sign(dynamic_fee_tx(10, 38), &wallet).unwrap();

        assert_eq!(a.gas_tip_cap(), Some(U256::from(5)));
        assert_eq!(a.gas_fee_cap(), Some(U256::from(19)));
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), a.tx().hash(&a.signature));
    }

    #[test]
    fn test_sign_defaults_chain_id() {
        let wallet = test_wallet();
        let tx: TypedTransaction = ethers::types::Eip1559TransactionRequest::new().into();
        let signed = SignedTransaction::sign(tx, &wallet).unwrap();
        assert_eq!(signed.tx().chain_id(), Some(wallet.chain_id().into()));
        assert!(!signed.raw().is_empty());
    }
}
