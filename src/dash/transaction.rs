//! Dash wire format.
//!
//! Dash "special transactions" (DIP-2) pack a type into the high 16 bits of
//! the version field and append an extra payload after `lock_time`:
//! - version: u32, low 16 bits base version, high 16 bits special tx type
//! - if type != 0: varint payload length + payload bytes
//!
//! Dash never carries witness data, so the input/output vectors use the plain
//! pre-segwit layout.

use crate::bitcoin::consensus::{Decodable, Encodable};
use crate::bitcoin::locktime::absolute::LockTime;
use crate::bitcoin::transaction::Version;
use crate::bitcoin::{Transaction, TxIn, TxOut, VarInt};
use crate::error::Error;

/// Decode a Dash transaction into its Bitcoin-compatible core plus the
/// special tx type and extra payload. The whole byte slice must be consumed.
pub fn decode_transaction(bytes: &[u8]) -> Result<(Transaction, u16, Vec<u8>), Error> {
    let mut slice = bytes;

    let version_u32 = u32::consensus_decode(&mut slice)?;
    let base_version = (version_u32 & 0xFFFF) as i32;
    let tx_type = (version_u32 >> 16) as u16;

    let input: Vec<TxIn> = Vec::consensus_decode(&mut slice)?;
    let output: Vec<TxOut> = Vec::consensus_decode(&mut slice)?;
    let lock_time = LockTime::consensus_decode(&mut slice)?;

    let extra_payload = if tx_type != 0 {
        let payload_len = VarInt::consensus_decode(&mut slice)?.0 as usize;
        if slice.len() < payload_len {
            return Err(Error::Decode(format!(
                "extra payload length {} exceeds remaining {} bytes",
                payload_len,
                slice.len()
            )));
        }
        let payload = slice[..payload_len].to_vec();
        slice = &slice[payload_len..];
        payload
    } else {
        Vec::new()
    };

    if !slice.is_empty() {
        return Err(Error::Decode(format!(
            "{} trailing bytes after Dash transaction",
            slice.len()
        )));
    }

    let tx = Transaction {
        version: Version(base_version),
        input,
        output,
        lock_time,
    };
    Ok((tx, tx_type, extra_payload))
}

/// Encode a Dash transaction from its Bitcoin-compatible core plus the
/// special tx type and extra payload.
pub fn encode_transaction(
    tx: &Transaction,
    tx_type: u16,
    extra_payload: &[u8],
) -> Result<Vec<u8>, Error> {
    let base_version = u32::try_from(tx.version.0).map_err(|_| {
        Error::Structural(format!("negative transaction version {}", tx.version.0))
    })?;
    if base_version > 0xFFFF {
        return Err(Error::Structural(format!(
            "transaction version {} does not fit in 16 bits",
            base_version
        )));
    }
    if tx_type == 0 && !extra_payload.is_empty() {
        return Err(Error::Structural(
            "standard Dash transaction must not carry an extra payload".into(),
        ));
    }

    let mut bytes = Vec::new();
    let version_u32 = base_version | (u32::from(tx_type) << 16);
    version_u32.consensus_encode(&mut bytes)?;
    tx.input.consensus_encode(&mut bytes)?;
    tx.output.consensus_encode(&mut bytes)?;
    tx.lock_time.consensus_encode(&mut bytes)?;

    if tx_type != 0 {
        VarInt(extra_payload.len() as u64).consensus_encode(&mut bytes)?;
        bytes.extend_from_slice(extra_payload);
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::consensus::serialize;
    use crate::bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Txid, Witness};
    use crate::bitcoin::hashes::Hash;

    fn sample_tx(version: i32) -> Transaction {
        Transaction {
            version: Version(version),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::all_zeros(),
                    vout: 1,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(5_000),
                script_pubkey: ScriptBuf::from_bytes(vec![0x6a]),
            }],
        }
    }

    #[test]
    fn standard_tx_matches_bitcoin_encoding() {
        let tx = sample_tx(1);
        let encoded = encode_transaction(&tx, 0, &[]).unwrap();
        assert_eq!(encoded, serialize(&tx));

        let (decoded, tx_type, payload) = decode_transaction(&encoded).unwrap();
        assert_eq!(serialize(&decoded), serialize(&tx));
        assert_eq!(tx_type, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn special_tx_round_trip() {
        let tx = sample_tx(3);
        let payload = vec![0xde, 0xad, 0xbe, 0xef];
        let encoded = encode_transaction(&tx, 5, &payload).unwrap();

        // version u32 = base | type << 16
        assert_eq!(&encoded[0..4], &[0x03, 0x00, 0x05, 0x00]);

        let (decoded, tx_type, decoded_payload) = decode_transaction(&encoded).unwrap();
        assert_eq!(decoded.version, Version(3));
        assert_eq!(tx_type, 5);
        assert_eq!(decoded_payload, payload);
        assert_eq!(encode_transaction(&decoded, tx_type, &decoded_payload).unwrap(), encoded);
    }

    #[test]
    fn rejects_payload_on_standard_type() {
        let tx = sample_tx(1);
        assert!(encode_transaction(&tx, 0, &[1, 2, 3]).is_err());
    }

    #[test]
    fn rejects_truncated_payload() {
        let tx = sample_tx(3);
        let encoded = encode_transaction(&tx, 5, &[1, 2, 3, 4]).unwrap();
        assert!(decode_transaction(&encoded[..encoded.len() - 2]).is_err());
    }

    #[test]
    fn rejects_trailing_bytes() {
        let tx = sample_tx(1);
        let mut encoded = encode_transaction(&tx, 0, &[]).unwrap();
        encoded.push(0x00);
        assert!(decode_transaction(&encoded).is_err());
    }
}
