//! Transaction building, signing and PSBT handling for Bitcoin and the
//! UTXO networks that forked off it (Bitcoin Cash, Bitcoin Gold, Bitcoin SV,
//! eCash, Dash, Dogecoin, Litecoin, Zcash).

pub mod dash;
mod error;
mod networks;
pub mod psbt;
pub mod scripts;
mod transaction;
pub mod zcash;

// re-export bitcoin from the miniscript crate so callers share our types
pub use ::miniscript::bitcoin;

pub use error::Error;
pub use networks::{ChainFamily, Network, SighashVariant};
pub use psbt::{HdSigner, InputUpdate, UtxoPsbt, DEFAULT_SIGHASH_WHITELIST};
pub use transaction::{ChainMeta, ChainTransaction};
