//! Identifier minting for persisted entities
//!
//! Every stored record carries a uuid7 encoded as a bech32m string with a
//! human-readable prefix, so ids sort roughly by creation time and their
//! kind is visible in logs and keys.

use bech32::Bech32m;
use uuid7::uuid7;

/// Human-readable prefixes for each entity family.
pub mod hrp {
    pub const REQUEST: &str = "req_";
    pub const TRANSACTION: &str = "txn_";
    pub const ACCRUAL_RULE: &str = "rule_";
    pub const ENTITLEMENT: &str = "ent_";
    pub const DELEGATION: &str = "dlg_";
    pub const SYNC_LOG: &str = "log_";
    pub const AUDIT: &str = "adt_";
}

// construct a unique entity id then encode using bech32
pub fn mint_id(prefix: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(prefix)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}
