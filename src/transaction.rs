//! Network-tagged transactions.
//!
//! [`ChainTransaction`] pairs a Bitcoin-compatible [`Transaction`] with the
//! fields its serialization family adds on top, so callers can move
//! transaction bytes across any supported network through one type.

use crate::bitcoin::consensus::{deserialize, serialize};
use crate::bitcoin::hashes::{sha256d, Hash};
use crate::bitcoin::{Transaction, Txid};
use crate::error::Error;
use crate::networks::{ChainFamily, Network};
use crate::zcash::ZcashExtra;
use crate::{dash, zcash};

/// Family-specific fields carried alongside the Bitcoin-compatible core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainMeta {
    Bitcoin,
    Dash { tx_type: u16, extra_payload: Vec<u8> },
    Zcash(ZcashExtra),
}

impl ChainMeta {
    /// Default metadata for a fresh transaction on the given network.
    pub fn new(network: Network) -> ChainMeta {
        match network.family() {
            ChainFamily::Bitcoin => ChainMeta::Bitcoin,
            ChainFamily::Dash => ChainMeta::Dash {
                tx_type: 0,
                extra_payload: Vec::new(),
            },
            ChainFamily::Zcash => ChainMeta::Zcash(ZcashExtra::sapling_v4()),
        }
    }

    fn family(&self) -> ChainFamily {
        match self {
            ChainMeta::Bitcoin => ChainFamily::Bitcoin,
            ChainMeta::Dash { .. } => ChainFamily::Dash,
            ChainMeta::Zcash(_) => ChainFamily::Zcash,
        }
    }
}

/// A transaction tagged with the network it belongs to.
#[derive(Debug, Clone)]
pub struct ChainTransaction {
    pub network: Network,
    pub tx: Transaction,
    pub meta: ChainMeta,
}

impl ChainTransaction {
    pub fn new(network: Network, tx: Transaction, meta: ChainMeta) -> Result<Self, Error> {
        if meta.family() != network.family() {
            return Err(Error::Structural(format!(
                "metadata family {:?} does not match network {}",
                meta.family(),
                network
            )));
        }
        Ok(ChainTransaction { network, tx, meta })
    }

    /// Decode transaction bytes in the network's wire format.
    pub fn from_bytes(bytes: &[u8], network: Network) -> Result<Self, Error> {
        match network.family() {
            ChainFamily::Bitcoin => {
                let tx: Transaction = deserialize(bytes)
                    .map_err(|e| Error::Decode(format!("transaction: {}", e)))?;
                Ok(ChainTransaction {
                    network,
                    tx,
                    meta: ChainMeta::Bitcoin,
                })
            }
            ChainFamily::Dash => {
                let (tx, tx_type, extra_payload) = dash::decode_transaction(bytes)?;
                Ok(ChainTransaction {
                    network,
                    tx,
                    meta: ChainMeta::Dash {
                        tx_type,
                        extra_payload,
                    },
                })
            }
            ChainFamily::Zcash => {
                let (tx, extra) = zcash::decode_transaction(bytes)?;
                Ok(ChainTransaction {
                    network,
                    tx,
                    meta: ChainMeta::Zcash(extra),
                })
            }
        }
    }

    /// Encode the transaction in the network's wire format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        match &self.meta {
            ChainMeta::Bitcoin => Ok(serialize(&self.tx)),
            ChainMeta::Dash {
                tx_type,
                extra_payload,
            } => dash::encode_transaction(&self.tx, *tx_type, extra_payload),
            ChainMeta::Zcash(extra) => zcash::encode_transaction(&self.tx, extra),
        }
    }

    /// The transaction id: the double-SHA256 of the network's wire encoding
    /// (without witness data on networks that have it).
    pub fn txid(&self) -> Result<Txid, Error> {
        match &self.meta {
            ChainMeta::Bitcoin => Ok(self.tx.compute_txid()),
            _ => Ok(txid_of_bytes(&self.to_bytes()?)),
        }
    }
}

/// Hash raw wire bytes into a transaction id.
pub(crate) fn txid_of_bytes(bytes: &[u8]) -> Txid {
    Txid::from_raw_hash(sha256d::Hash::hash(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::locktime::absolute::LockTime;
    use crate::bitcoin::transaction::Version;
    use crate::bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Witness};

    fn sample_tx() -> Transaction {
        Transaction {
            version: Version(1),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::all_zeros(),
                    vout: 7,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::from_bytes(vec![0x6a, 0x01, 0x02]),
            }],
        }
    }

    #[test]
    fn bitcoin_round_trip_and_txid() {
        let tx = sample_tx();
        let chain_tx =
            ChainTransaction::new(Network::Litecoin, tx.clone(), ChainMeta::Bitcoin).unwrap();
        let bytes = chain_tx.to_bytes().unwrap();
        assert_eq!(bytes, serialize(&tx));

        let decoded = ChainTransaction::from_bytes(&bytes, Network::Litecoin).unwrap();
        assert_eq!(decoded.to_bytes().unwrap(), bytes);
        assert_eq!(decoded.txid().unwrap(), tx.compute_txid());
    }

    #[test]
    fn bitcoin_encoding_matches_fixture() {
        let chain_tx =
            ChainTransaction::new(Network::Bitcoin, sample_tx(), ChainMeta::Bitcoin).unwrap();
        assert_eq!(
            hex::encode(chain_tx.to_bytes().unwrap()),
            "0100000001000000000000000000000000000000000000000000000000000000000000000007000000\
             00ffffffff01e803000000000000036a010200000000"
        );
    }

    #[test]
    fn dash_round_trip() {
        let meta = ChainMeta::Dash {
            tx_type: 1,
            extra_payload: vec![9, 9, 9],
        };
        let chain_tx = ChainTransaction::new(Network::Dash, sample_tx(), meta).unwrap();
        let bytes = chain_tx.to_bytes().unwrap();
        let decoded = ChainTransaction::from_bytes(&bytes, Network::Dash).unwrap();
        assert_eq!(decoded.meta, chain_tx.meta);
        assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn zcash_txid_hashes_full_encoding() {
        let meta = ChainMeta::new(Network::Zcash);
        let chain_tx = ChainTransaction::new(Network::Zcash, sample_tx(), meta).unwrap();
        let bytes = chain_tx.to_bytes().unwrap();
        assert_eq!(chain_tx.txid().unwrap(), txid_of_bytes(&bytes));
        // differs from the Bitcoin txid because of the Zcash-only fields
        assert_ne!(chain_tx.txid().unwrap(), chain_tx.tx.compute_txid());
    }

    #[test]
    fn rejects_family_mismatch() {
        assert!(
            ChainTransaction::new(Network::Bitcoin, sample_tx(), ChainMeta::new(Network::Dash))
                .is_err()
        );
    }
}
