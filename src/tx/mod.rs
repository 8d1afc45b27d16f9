//! Transaction helpers built on top of the transaction manager: fee
//! computation and the startup clearing procedure.

pub mod clearing;
pub mod gas;

pub use clearing::{clear_pending_tx, sign_clearing_tx, DEFAULT_CLEAR_PENDING_TIMEOUT};
pub use gas::{calc_gas_fee_cap, current_fees, suggest_gas_tip_cap_or_fallback, FALLBACK_GAS_TIP_CAP};
