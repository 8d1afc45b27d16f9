//! In-process store with the same semantics as the Postgres tables.
//!
//! Used by tests and by deployments that accept losing pending state on restart.

use super::{Deposit, DepositStore, Disbursement, PendingTx, PendingTxStore};
use crate::error::SubmitterResult;
use crate::txmgr::is_confirmed;

use async_trait::async_trait;
use ethers::types::H256;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    pending_txs: RwLock<HashMap<H256, PendingTx>>,
    deposits: RwLock<BTreeMap<u64, Deposit>>,
    disbursements: RwLock<BTreeMap<u64, Disbursement>>,
    last_processed_block: RwLock<Option<u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded disbursement for `deposit_id`, if any
    pub async fn disbursement(&self, deposit_id: u64) -> Option<Disbursement> {
        self.disbursements.read().await.get(&deposit_id).cloned()
    }
}

#[async_trait]
impl PendingTxStore for MemoryStore {
    async fn upsert_pending_tx(&self, pending_tx: &PendingTx) -> SubmitterResult<()> {
        self.pending_txs
            .write()
            .await
            .insert(pending_tx.tx_hash, pending_tx.clone());
        Ok(())
    }

    async fn list_pending_txs(&self) -> SubmitterResult<Vec<PendingTx>> {
        let mut pending: Vec<PendingTx> = self.pending_txs.read().await.values().cloned().collect();
        pending.sort_by(|a, b| {
            b.start_id
                .cmp(&a.start_id)
                .then(b.end_id.cmp(&a.end_id))
                .then(a.tx_hash.cmp(&b.tx_hash))
        });
        Ok(pending)
    }

    async fn delete_pending_txs(&self, start_id: u64, end_id: u64) -> SubmitterResult<()> {
        self.pending_txs
            .write()
            .await
            .retain(|_, tx| !(tx.start_id == start_id && tx.end_id == end_id));
        Ok(())
    }
}

#[async_trait]
impl DepositStore for MemoryStore {
    async fn confirmed_deposits(
        &self,
        block_number: u64,
        num_confirmations: u64,
    ) -> SubmitterResult<Vec<Deposit>> {
        let deposits = self.deposits.read().await;
        let disbursements = self.disbursements.read().await;
        Ok(deposits
            .values()
            .filter(|d| !disbursements.contains_key(&d.id))
            .filter(|d| is_confirmed(d.block_number, num_confirmations, block_number))
            .cloned()
            .collect())
    }

    async fn upsert_deposits(
        &self,
        deposits: &[Deposit],
        last_processed_block: u64,
    ) -> SubmitterResult<()> {
        let mut stored = self.deposits.write().await;
        let mut cursor = self.last_processed_block.write().await;
        for deposit in deposits {
            stored.insert(deposit.id, deposit.clone());
        }
        *cursor = Some(last_processed_block);
        Ok(())
    }

    async fn last_processed_block(&self) -> SubmitterResult<Option<u64>> {
        Ok(*self.last_processed_block.read().await)
    }

    async fn latest_disbursement_id(&self) -> SubmitterResult<Option<u64>> {
        Ok(self.disbursements.read().await.keys().next_back().copied())
    }

    async fn upsert_disbursement(&self, disbursement: &Disbursement) -> SubmitterResult<()> {
        self.disbursements
            .write()
            .await
            .insert(disbursement.deposit_id, disbursement.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ethers::types::{Address, U256};

    fn pending(hash: u8, start_id: u64, end_id: u64) -> PendingTx {
        PendingTx {
            tx_hash: H256::repeat_byte(hash),
            start_id,
            end_id,
        }
    }

    fn deposit(id: u64, block_number: u64) -> Deposit {
        Deposit {
            id,
            tx_hash: H256::from_low_u64_be(id),
            block_number,
            block_timestamp: Utc::now(),
            address: Address::repeat_byte(0xaa),
            amount: U256::from(1000 + id),
        }
    }

    #[tokio::test]
    async fn test_pending_tx_ordering() {
        let store = MemoryStore::new();
        store.upsert_pending_tx(&pending(3, 0, 2)).await.unwrap();
        store.upsert_pending_tx(&pending(2, 2, 4)).await.unwrap();
        store.upsert_pending_tx(&pending(1, 2, 4)).await.unwrap();
        store.upsert_pending_tx(&pending(4, 2, 3)).await.unwrap();

        let listed = store.list_pending_txs().await.unwrap();
        assert_eq!(
            listed,
            vec![pending(1, 2, 4), pending(2, 2, 4), pending(4, 2, 3), pending(3, 0, 2)]
        );
    }

    #[tokio::test]
    async fn test_pending_tx_upsert_replaces_by_hash() {
        let store = MemoryStore::new();
        store.upsert_pending_tx(&pending(1, 0, 2)).await.unwrap();
        store.upsert_pending_tx(&pending(1, 5, 7)).await.unwrap();

        assert_eq!(store.list_pending_txs().await.unwrap(), vec![pending(1, 5, 7)]);
    }

    #[tokio::test]
    async fn test_delete_pending_txs_by_range() {
        let store = MemoryStore::new();
        store.upsert_pending_tx(&pending(1, 0, 2)).await.unwrap();
        store.upsert_pending_tx(&pending(2, 0, 2)).await.unwrap();
        store.upsert_pending_tx(&pending(3, 0, 3)).await.unwrap();

        store.delete_pending_txs(0, 2).await.unwrap();
        assert_eq!(store.list_pending_txs().await.unwrap(), vec![pending(3, 0, 3)]);
    }

    #[tokio::test]
    async fn test_confirmed_deposits_respect_depth_and_disbursements() {
        let store = MemoryStore::new();
        store
            .upsert_deposits(&[deposit(0, 10), deposit(1, 11), deposit(2, 12)], 12)
            .await
            .unwrap();

        // Three confirmations at block 12 only covers block 10.
        let confirmed = store.confirmed_deposits(12, 3).await.unwrap();
        assert_eq!(confirmed.iter().map(|d| d.id).collect::<Vec<_>>(), vec![0]);

        store
            .upsert_disbursement(&Disbursement {
                deposit_id: 0,
                tx_hash: H256::repeat_byte(9),
                block_number: 1,
                block_timestamp: Utc::now(),
                success: true,
            })
            .await
            .unwrap();

        let confirmed = store.confirmed_deposits(14, 3).await.unwrap();
        assert_eq!(confirmed.iter().map(|d| d.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(store.latest_disbursement_id().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_upsert_deposits_moves_cursor() {
        let store = MemoryStore::new();
        assert_eq!(store.last_processed_block().await.unwrap(), None);

        store.upsert_deposits(&[deposit(0, 10)], 15).await.unwrap();
        // An empty window still advances the cursor.
        store.upsert_deposits(&[], 20).await.unwrap();
        assert_eq!(store.last_processed_block().await.unwrap(), Some(20));

        let mut replaced = deposit(0, 11);
        replaced.amount = U256::from(5);
        store.upsert_deposits(&[replaced.clone()], 21).await.unwrap();
        assert_eq!(store.confirmed_deposits(30, 1).await.unwrap(), vec![replaced]);
    }

    #[tokio::test]
    async fn test_latest_disbursement_id_empty() {
        let store = MemoryStore::new();
        assert_eq!(store.latest_disbursement_id().await.unwrap(), None);
    }
}
