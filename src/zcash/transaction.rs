//! Zcash wire format.
//!
//! Overwintered transactions set the high bit of the version field and add a
//! version group id after the version, an expiry height after `lock_time`,
//! and shielded (Sapling/Orchard) fields at the end. The shielded fields are
//! preserved verbatim so a decoded transaction re-encodes to the exact same
//! bytes.

use crate::bitcoin::consensus::{Decodable, Encodable};
use crate::bitcoin::locktime::absolute::LockTime;
use crate::bitcoin::transaction::Version;
use crate::bitcoin::{Transaction, TxIn, TxOut};
use crate::error::Error;

use super::SAPLING_VERSION_GROUP_ID;

/// Zcash fields that have no place in a Bitcoin [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZcashExtra {
    /// Whether the encoding had the overwintered bit set.
    pub overwintered: bool,
    /// Present only when overwintered.
    pub version_group_id: Option<u32>,
    /// Present only when overwintered.
    pub expiry_height: Option<u32>,
    /// Bytes after the expiry height, kept verbatim.
    pub sapling_fields: Vec<u8>,
}

impl ZcashExtra {
    /// Fields for a fresh transparent Sapling (v4) transaction.
    pub fn sapling_v4() -> Self {
        ZcashExtra {
            overwintered: true,
            version_group_id: Some(SAPLING_VERSION_GROUP_ID),
            expiry_height: Some(0),
            // valueBalance = 0, nShieldedSpend = 0, nShieldedOutput = 0, nJoinSplit = 0
            sapling_fields: vec![0u8; 11],
        }
    }
}

/// Decode a Zcash transaction into its Bitcoin-compatible core plus the
/// Zcash-only fields.
pub fn decode_transaction(bytes: &[u8]) -> Result<(Transaction, ZcashExtra), Error> {
    let mut slice = bytes;

    let header = u32::consensus_decode(&mut slice)?;
    let overwintered = header & 0x8000_0000 != 0;
    let version = (header & 0x7FFF_FFFF) as i32;

    let version_group_id = if overwintered {
        Some(u32::consensus_decode(&mut slice)?)
    } else {
        None
    };

    let input: Vec<TxIn> = Vec::consensus_decode(&mut slice)?;
    let output: Vec<TxOut> = Vec::consensus_decode(&mut slice)?;
    let lock_time = LockTime::consensus_decode(&mut slice)?;

    let expiry_height = if overwintered {
        Some(u32::consensus_decode(&mut slice)?)
    } else {
        None
    };

    let tx = Transaction {
        version: Version(version),
        input,
        output,
        lock_time,
    };
    let extra = ZcashExtra {
        overwintered,
        version_group_id,
        expiry_height,
        sapling_fields: slice.to_vec(),
    };
    Ok((tx, extra))
}

/// Encode a Zcash transaction from its Bitcoin-compatible core plus the
/// Zcash-only fields.
pub fn encode_transaction(tx: &Transaction, extra: &ZcashExtra) -> Result<Vec<u8>, Error> {
    let version = u32::try_from(tx.version.0).map_err(|_| {
        Error::Structural(format!("negative transaction version {}", tx.version.0))
    })?;
    if version & 0x8000_0000 != 0 {
        return Err(Error::Structural(format!(
            "transaction version {} collides with the overwintered bit",
            version
        )));
    }

    let mut bytes = Vec::new();
    if extra.overwintered {
        let version_group_id = extra.version_group_id.ok_or_else(|| {
            Error::Structural("overwintered transaction without a version group id".into())
        })?;
        (version | 0x8000_0000).consensus_encode(&mut bytes)?;
        version_group_id.consensus_encode(&mut bytes)?;
    } else {
        if extra.version_group_id.is_some() || extra.expiry_height.is_some() {
            return Err(Error::Structural(
                "version group id and expiry height require the overwintered bit".into(),
            ));
        }
        version.consensus_encode(&mut bytes)?;
    }

    tx.input.consensus_encode(&mut bytes)?;
    tx.output.consensus_encode(&mut bytes)?;
    tx.lock_time.consensus_encode(&mut bytes)?;

    if extra.overwintered {
        let expiry_height = extra
            .expiry_height
            .ok_or_else(|| Error::Structural("overwintered transaction without an expiry height".into()))?;
        expiry_height.consensus_encode(&mut bytes)?;
        bytes.extend_from_slice(&extra.sapling_fields);
    } else if !extra.sapling_fields.is_empty() {
        return Err(Error::Structural(
            "shielded fields require the overwintered bit".into(),
        ));
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::hashes::Hash;
    use crate::bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Txid, Witness};

    fn sample_tx() -> Transaction {
        Transaction {
            version: Version(4),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::all_zeros(),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(600),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
            }],
        }
    }

    #[test]
    fn sapling_v4_round_trip() {
        let tx = sample_tx();
        let extra = ZcashExtra::sapling_v4();
        let encoded = encode_transaction(&tx, &extra).unwrap();

        // header = 4 | overwintered bit, then the Sapling version group id
        assert_eq!(&encoded[0..4], &[0x04, 0x00, 0x00, 0x80]);
        assert_eq!(&encoded[4..8], &SAPLING_VERSION_GROUP_ID.to_le_bytes());

        let (decoded, decoded_extra) = decode_transaction(&encoded).unwrap();
        assert_eq!(decoded.version, Version(4));
        assert_eq!(decoded_extra, extra);
        assert_eq!(encode_transaction(&decoded, &decoded_extra).unwrap(), encoded);
    }

    #[test]
    fn sprout_format_round_trip() {
        let tx = Transaction {
            version: Version(1),
            ..sample_tx()
        };
        let extra = ZcashExtra {
            overwintered: false,
            version_group_id: None,
            expiry_height: None,
            sapling_fields: Vec::new(),
        };
        let encoded = encode_transaction(&tx, &extra).unwrap();
        let (decoded, decoded_extra) = decode_transaction(&encoded).unwrap();
        assert_eq!(decoded.version, Version(1));
        assert_eq!(decoded_extra, extra);
    }

    #[test]
    fn rejects_group_id_without_overwinter_bit() {
        let tx = sample_tx();
        let extra = ZcashExtra {
            overwintered: false,
            version_group_id: Some(SAPLING_VERSION_GROUP_ID),
            expiry_height: None,
            sapling_fields: Vec::new(),
        };
        assert!(encode_transaction(&tx, &extra).is_err());
    }

    #[test]
    fn rejects_overwinter_without_group_id() {
        let tx = sample_tx();
        let extra = ZcashExtra {
            overwintered: true,
            version_group_id: None,
            expiry_height: Some(0),
            sapling_fields: Vec::new(),
        };
        assert!(encode_transaction(&tx, &extra).is_err());
    }
}
