//! Fee helpers shared by the clearing procedure and batch drivers

use crate::txmgr::{PublisherBackend, TxMgrError, TxMgrResult};

use ethers::types::U256;
use tracing::warn;

/// Tip cap used when the backend does not implement `eth_maxPriorityFeePerGas`
/// (1.5 gwei).
pub const FALLBACK_GAS_TIP_CAP: u64 = 1_500_000_000;

/// Fee cap that stays valid for the next few blocks even if the base fee keeps
/// rising: `gas_tip_cap + 2 * base_fee`.
pub fn calc_gas_fee_cap(base_fee: U256, gas_tip_cap: U256) -> U256 {
    gas_tip_cap.saturating_add(base_fee.saturating_mul(U256::from(2)))
}

/// Suggested tip cap, or [`FALLBACK_GAS_TIP_CAP`] on backends that do not
/// support the query. Any other failure is returned.
pub async fn suggest_gas_tip_cap_or_fallback<B>(backend: &B) -> TxMgrResult<U256>
where
    B: PublisherBackend + ?Sized,
{
    match backend.suggest_gas_tip_cap().await {
        Ok(tip) => Ok(tip),
        Err(e) if e.is_max_priority_fee_not_found() => {
            warn!("eth_maxPriorityFeePerGas is unsupported by current backend, using fallback gasTipCap");
            Ok(U256::from(FALLBACK_GAS_TIP_CAP))
        }
        Err(e) => Err(e),
    }
}

/// Current `(gas_tip_cap, gas_fee_cap)` pair from the latest header.
pub async fn current_fees<B>(backend: &B) -> TxMgrResult<(U256, U256)>
where
    B: PublisherBackend + ?Sized,
{
    let gas_tip_cap = suggest_gas_tip_cap_or_fallback(backend).await?;
    let header = backend.header_by_number(None).await?;
    let base_fee = header
        .base_fee_per_gas
        .ok_or_else(|| TxMgrError::Rpc("latest header has no base fee".to_string()))?;
    Ok((gas_tip_cap, calc_gas_fee_cap(base_fee, gas_tip_cap)))
}
