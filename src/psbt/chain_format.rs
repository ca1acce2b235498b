//! PSBT container translation for non-Bitcoin serialization families.
//!
//! A PSBT for Dash or Zcash embeds family-format transaction bytes in two
//! places: the global unsigned transaction (key type 0x00) and each input's
//! non-witness UTXO (key type 0x00). Everything else in the container is
//! plain Bitcoin PSBT. Deserialization splices those values into Bitcoin
//! consensus encoding before handing the bytes to [`Psbt::deserialize`],
//! keeping the family-specific fields and original non-witness bytes on the
//! side; serialization reverses the splice.

use std::io::Read;

use crate::bitcoin::consensus::{Decodable, Encodable};
use crate::bitcoin::psbt::Psbt;
use crate::bitcoin::{Transaction, VarInt};
use crate::error::Error;
use crate::networks::Network;
use crate::transaction::{ChainMeta, ChainTransaction};

const PSBT_MAGIC: &[u8; 5] = b"psbt\xff";
const KEY_TYPE_TX: u8 = 0x00;

pub(crate) struct ChainPsbtParts {
    pub psbt: Psbt,
    pub meta: ChainMeta,
    /// Original family-format non-witness UTXO bytes per input.
    pub raw_non_witness_utxos: Vec<Option<Vec<u8>>>,
}

/// Parse PSBT bytes whose embedded transactions use the network's wire
/// format.
pub(crate) fn deserialize(bytes: &[u8], network: Network) -> Result<ChainPsbtParts, Error> {
    let mut r = bytes;
    if bytes.len() < 5 || &bytes[0..5] != PSBT_MAGIC {
        return Err(Error::Decode("invalid PSBT magic".into()));
    }
    r = &r[5..];

    let mut modified = Vec::with_capacity(bytes.len());
    modified.extend_from_slice(PSBT_MAGIC);

    // global map: splice the unsigned transaction into bitcoin encoding
    let mut unsigned: Option<ChainTransaction> = None;
    while let Some((key, val)) = read_pair(&mut r)? {
        if key == [KEY_TYPE_TX] {
            let chain_tx = ChainTransaction::from_bytes(&val, network)?;
            let mut tx_bytes = Vec::new();
            chain_tx.tx.consensus_encode(&mut tx_bytes)?;
            write_pair(&mut modified, &key, &tx_bytes)?;
            unsigned = Some(chain_tx);
        } else {
            write_pair(&mut modified, &key, &val)?;
        }
    }
    modified.push(0x00);

    let unsigned =
        unsigned.ok_or_else(|| Error::Decode("PSBT has no unsigned transaction".into()))?;
    let num_inputs = unsigned.tx.input.len();

    // input maps: splice each non-witness UTXO
    let mut raw_non_witness_utxos: Vec<Option<Vec<u8>>> = vec![None; num_inputs];
    for slot in raw_non_witness_utxos.iter_mut() {
        while let Some((key, val)) = read_pair(&mut r)? {
            if key == [KEY_TYPE_TX] {
                let prev = ChainTransaction::from_bytes(&val, network)?;
                let mut tx_bytes = Vec::new();
                prev.tx.consensus_encode(&mut tx_bytes)?;
                write_pair(&mut modified, &key, &tx_bytes)?;
                *slot = Some(val);
            } else {
                write_pair(&mut modified, &key, &val)?;
            }
        }
        modified.push(0x00);
    }

    // output maps carry nothing family-specific
    modified.extend_from_slice(r);

    let psbt = Psbt::deserialize(&modified)?;
    if psbt.inputs.len() != num_inputs {
        return Err(Error::Decode(format!(
            "{} input maps for {} transaction inputs",
            psbt.inputs.len(),
            num_inputs
        )));
    }

    Ok(ChainPsbtParts {
        psbt,
        meta: unsigned.meta,
        raw_non_witness_utxos,
    })
}

/// Serialize a PSBT with its embedded transactions re-encoded into the
/// network's wire format.
pub(crate) fn serialize(
    psbt: &Psbt,
    network: Network,
    meta: &ChainMeta,
    raw_non_witness_utxos: &[Option<Vec<u8>>],
) -> Result<Vec<u8>, Error> {
    let bitcoin_bytes = psbt.serialize();
    let mut r = bitcoin_bytes.as_slice();
    debug_assert_eq!(&bitcoin_bytes[0..5], PSBT_MAGIC);
    r = &r[5..];

    let mut result = Vec::with_capacity(bitcoin_bytes.len());
    result.extend_from_slice(PSBT_MAGIC);

    while let Some((key, val)) = read_pair(&mut r)? {
        if key == [KEY_TYPE_TX] {
            let tx = Transaction::consensus_decode(&mut &val[..])?;
            let chain_tx = ChainTransaction::new(network, tx, meta.clone())?;
            write_pair(&mut result, &key, &chain_tx.to_bytes()?)?;
        } else {
            write_pair(&mut result, &key, &val)?;
        }
    }
    result.push(0x00);

    for slot in raw_non_witness_utxos.iter().take(psbt.inputs.len()) {
        while let Some((key, val)) = read_pair(&mut r)? {
            if key == [KEY_TYPE_TX] {
                match slot {
                    // original family bytes preserved on deserialize/fetch
                    Some(raw) => write_pair(&mut result, &key, raw)?,
                    // never seen in family format; its bitcoin encoding is
                    // also its family encoding (standard Dash transaction)
                    None => write_pair(&mut result, &key, &val)?,
                }
            } else {
                write_pair(&mut result, &key, &val)?;
            }
        }
        result.push(0x00);
    }

    result.extend_from_slice(r);
    Ok(result)
}

fn read_pair(r: &mut &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error> {
    let key_len = VarInt::consensus_decode(r)?;
    if key_len.0 == 0 {
        return Ok(None);
    }
    let mut key = vec![0u8; key_len.0 as usize];
    r.read_exact(&mut key)
        .map_err(|_| Error::Decode("truncated PSBT key".into()))?;
    let val_len = VarInt::consensus_decode(r)?;
    let mut val = vec![0u8; val_len.0 as usize];
    r.read_exact(&mut val)
        .map_err(|_| Error::Decode("truncated PSBT value".into()))?;
    Ok(Some((key, val)))
}

fn write_pair(out: &mut Vec<u8>, key: &[u8], val: &[u8]) -> Result<(), Error> {
    VarInt(key.len() as u64).consensus_encode(out)?;
    out.extend_from_slice(key);
    VarInt(val.len() as u64).consensus_encode(out)?;
    out.extend_from_slice(val);
    Ok(())
}
