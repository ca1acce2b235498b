//! Zcash-specific transaction serialization and consensus constants.

mod transaction;

pub use transaction::{decode_transaction, encode_transaction, ZcashExtra};

/// Version group id for Sapling (v4) transactions.
pub const SAPLING_VERSION_GROUP_ID: u32 = 0x892F2085;
