//! Signature digests for legacy (pre-taproot) inputs.
//!
//! Three algorithms cover the supported networks: the original Bitcoin
//! digest, the BIP143 digest for segwit v0 inputs, and the BIP143-with-FORKID
//! digest used by the Bitcoin Cash family (same preimage layout, fork id
//! folded into the high bits of the sighash type, applied to non-segwit
//! inputs). Zcash (ZIP-243) digests are rejected.

use crate::bitcoin::consensus::Encodable;
use crate::bitcoin::hashes::{sha256d, Hash};
use crate::bitcoin::secp256k1::Message;
use crate::bitcoin::sighash::SighashCache;
use crate::bitcoin::{Amount, EcdsaSighashType, Script, Transaction};
use crate::error::Error;
use crate::networks::SighashVariant;

pub(crate) const SIGHASH_ALL: u32 = 0x01;
const SIGHASH_NONE: u32 = 0x02;
const SIGHASH_SINGLE: u32 = 0x03;
pub(crate) const SIGHASH_FORKID: u32 = 0x40;
const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Digest for a non-segwit input spending `script_code`, using the digest
/// algorithm of the network's sighash variant.
///
/// On fork-id networks a signature whose type lacks the FORKID bit falls back
/// to the original Bitcoin digest, mirroring pre-fork signatures remaining
/// valid there.
pub(crate) fn script_code_digest(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    hash_type: u32,
    value: Amount,
    variant: SighashVariant,
) -> Result<Message, Error> {
    match variant {
        SighashVariant::Legacy => legacy_digest(tx, input_index, script_code, hash_type),
        SighashVariant::ForkId(fork_id) => {
            if hash_type & SIGHASH_FORKID == 0 {
                return legacy_digest(tx, input_index, script_code, hash_type);
            }
            fork_id_digest(
                tx,
                input_index,
                script_code,
                value,
                hash_type | (fork_id << 8),
            )
        }
        SighashVariant::Zcash => Err(Error::Unsupported(
            "ZIP-243 signature digests are not supported".into(),
        )),
    }
}

fn legacy_digest(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    hash_type: u32,
) -> Result<Message, Error> {
    let cache = SighashCache::new(tx);
    let sighash = cache
        .legacy_signature_hash(input_index, script_code, hash_type)
        .map_err(|e| Error::Structural(format!("input {}: {}", input_index, e)))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

/// Digest for a segwit v0 input (P2WSH or P2WPKH, wrapped or native).
/// `script_code` is the witness script for P2WSH and the reconstructed
/// pay-to-pubkey-hash script for P2WPKH.
pub(crate) fn segwit_v0_digest(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    value: Amount,
    hash_type: u32,
) -> Result<Message, Error> {
    let ty = EcdsaSighashType::from_standard(hash_type)
        .map_err(|_| Error::Structural(format!("non-standard sighash type 0x{:02x}", hash_type)))?;
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .p2wsh_signature_hash(input_index, script_code, value, ty)
        .map_err(|e| Error::Structural(format!("input {}: {}", input_index, e)))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

/// BIP143 preimage with the full (fork-id-extended) sighash type, hashed with
/// double-SHA256. The preimage commits to the spent output's value, which is
/// why fork-id signing needs the previous output even for non-segwit scripts.
fn fork_id_digest(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    value: Amount,
    full_hash_type: u32,
) -> Result<Message, Error> {
    let zero = [0u8; 32];
    let base_type = full_hash_type & 0x1f;
    let anyone_can_pay = full_hash_type & SIGHASH_ANYONECANPAY != 0;

    let hash_prevouts = if anyone_can_pay {
        zero
    } else {
        let mut enc = Vec::new();
        for input in &tx.input {
            input.previous_output.consensus_encode(&mut enc)?;
        }
        sha256d::Hash::hash(&enc).to_byte_array()
    };

    let hash_sequence = if anyone_can_pay || base_type == SIGHASH_SINGLE || base_type == SIGHASH_NONE
    {
        zero
    } else {
        let mut enc = Vec::new();
        for input in &tx.input {
            input.sequence.consensus_encode(&mut enc)?;
        }
        sha256d::Hash::hash(&enc).to_byte_array()
    };

    let hash_outputs = if base_type != SIGHASH_SINGLE && base_type != SIGHASH_NONE {
        let mut enc = Vec::new();
        for output in &tx.output {
            output.consensus_encode(&mut enc)?;
        }
        sha256d::Hash::hash(&enc).to_byte_array()
    } else if base_type == SIGHASH_SINGLE && input_index < tx.output.len() {
        let mut enc = Vec::new();
        tx.output[input_index].consensus_encode(&mut enc)?;
        sha256d::Hash::hash(&enc).to_byte_array()
    } else {
        zero
    };

    let input = &tx.input[input_index];
    let mut preimage = Vec::new();
    tx.version.consensus_encode(&mut preimage)?;
    preimage.extend_from_slice(&hash_prevouts);
    preimage.extend_from_slice(&hash_sequence);
    input.previous_output.consensus_encode(&mut preimage)?;
    script_code.to_owned().consensus_encode(&mut preimage)?;
    value.consensus_encode(&mut preimage)?;
    input.sequence.consensus_encode(&mut preimage)?;
    preimage.extend_from_slice(&hash_outputs);
    tx.lock_time.consensus_encode(&mut preimage)?;
    full_hash_type.consensus_encode(&mut preimage)?;

    Ok(Message::from_digest(
        sha256d::Hash::hash(&preimage).to_byte_array(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::locktime::absolute::LockTime;
    use crate::bitcoin::transaction::Version;
    use crate::bitcoin::{OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Txid, Witness};

    fn spend_tx() -> Transaction {
        Transaction {
            version: Version(2),
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
                value: Amount::from_sat(900),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    #[test]
    fn fork_id_digest_differs_from_legacy() {
        let tx = spend_tx();
        let script = ScriptBuf::from_bytes(vec![0x51]);
        let legacy = script_code_digest(
            &tx,
            0,
            &script,
            SIGHASH_ALL,
            Amount::from_sat(1_000),
            SighashVariant::Legacy,
        )
        .unwrap();
        let forkid = script_code_digest(
            &tx,
            0,
            &script,
            SIGHASH_ALL | SIGHASH_FORKID,
            Amount::from_sat(1_000),
            SighashVariant::ForkId(0),
        )
        .unwrap();
        assert_ne!(legacy, forkid);
    }

    #[test]
    fn fork_id_without_forkid_bit_falls_back_to_legacy() {
        let tx = spend_tx();
        let script = ScriptBuf::from_bytes(vec![0x51]);
        let legacy = script_code_digest(
            &tx,
            0,
            &script,
            SIGHASH_ALL,
            Amount::from_sat(1_000),
            SighashVariant::Legacy,
        )
        .unwrap();
        let on_fork = script_code_digest(
            &tx,
            0,
            &script,
            SIGHASH_ALL,
            Amount::from_sat(1_000),
            SighashVariant::ForkId(0),
        )
        .unwrap();
        assert_eq!(legacy, on_fork);
    }

    #[test]
    fn fork_id_value_changes_digest() {
        let tx = spend_tx();
        let script = ScriptBuf::from_bytes(vec![0x51]);
        let bch = script_code_digest(
            &tx,
            0,
            &script,
            SIGHASH_ALL | SIGHASH_FORKID,
            Amount::from_sat(1_000),
            SighashVariant::ForkId(0),
        )
        .unwrap();
        let btg = script_code_digest(
            &tx,
            0,
            &script,
            SIGHASH_ALL | SIGHASH_FORKID,
            Amount::from_sat(1_000),
            SighashVariant::ForkId(79),
        )
        .unwrap();
        assert_ne!(bch, btg);
    }

    #[test]
    fn zcash_digest_is_rejected() {
        let tx = spend_tx();
        let script = ScriptBuf::from_bytes(vec![0x51]);
        let err = script_code_digest(
            &tx,
            0,
            &script,
            SIGHASH_ALL,
            Amount::from_sat(1_000),
            SighashVariant::Zcash,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }
}
