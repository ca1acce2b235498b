//! Final scriptSig and witness assembly for non-taproot inputs.
//!
//! The stacks are built directly from the recorded scripts and partial
//! signatures, in multisig key order with the CHECKMULTISIG dummy in front,
//! so finalization reproduces exactly the bytes the unsign transform
//! started from. No signature verification happens here.

use std::collections::BTreeMap;

use crate::bitcoin::blockdata::opcodes::all::OP_PUSHBYTES_0;
use crate::bitcoin::blockdata::script::Builder;
use crate::bitcoin::psbt::{Psbt, PsbtSighashType};
use crate::bitcoin::script::PushBytesBuf;
use crate::bitcoin::{ecdsa, PublicKey, Script, ScriptBuf, TxOut, Witness};
use crate::error::Error;
use crate::scripts::parse_multisig;

use super::clear_signing_fields;

/// Finalize one legacy input: P2PKH, P2SH multisig, P2WPKH and P2WSH
/// (native or P2SH-wrapped).
pub(crate) fn finalize_input(psbt: &mut Psbt, index: usize, utxo: &TxOut) -> Result<(), Error> {
    let input = &psbt.inputs[index];
    let declared_type = input.sighash_type;

    let (final_script_sig, final_script_witness) = if let Some(witness_script) =
        &input.witness_script
    {
        // P2WSH multisig: witness = [dummy, signatures..., witnessScript]
        let mut items = multisig_stack(witness_script, &input.partial_sigs, declared_type, index)?;
        items.push(witness_script.to_bytes());
        let script_sig = match &input.redeem_script {
            Some(redeem) => Some(push_only(redeem, index)?),
            None => None,
        };
        (script_sig, Some(Witness::from_slice(&items)))
    } else if let Some(redeem) = input.redeem_script.clone() {
        let redeem = &redeem;
        if is_p2wpkh_program(redeem) {
            // P2SH-wrapped P2WPKH
            let (pubkey, signature) = single_signature(input, index)?;
            let witness = Witness::from_slice(&[signature, pubkey.to_bytes()]);
            (Some(push_only(redeem, index)?), Some(witness))
        } else {
            // P2SH multisig: scriptSig = [dummy, signatures..., redeemScript]
            let mut builder = Builder::new().push_opcode(OP_PUSHBYTES_0);
            for signature in multisig_stack(redeem, &input.partial_sigs, declared_type, index)?
                .into_iter()
                .skip(1)
            {
                builder = builder.push_slice(push_bytes(&signature, index)?);
            }
            builder = builder.push_slice(push_bytes(redeem.as_bytes(), index)?);
            (Some(builder.into_script()), None)
        }
    } else if utxo.script_pubkey.is_p2pkh() {
        let (pubkey, signature) = single_signature(input, index)?;
        let script_sig = Builder::new()
            .push_slice(push_bytes(&signature, index)?)
            .push_slice(push_bytes(&pubkey.to_bytes(), index)?)
            .into_script();
        (Some(script_sig), None)
    } else if is_p2wpkh_program(&utxo.script_pubkey) {
        let (pubkey, signature) = single_signature(input, index)?;
        (
            None,
            Some(Witness::from_slice(&[signature, pubkey.to_bytes()])),
        )
    } else {
        return Err(Error::Structural(format!(
            "input {}: no finalizable script shape",
            index
        )));
    };

    let input = &mut psbt.inputs[index];
    input.final_script_sig = final_script_sig;
    input.final_script_witness = final_script_witness;
    clear_signing_fields(input);
    Ok(())
}

/// The multisig satisfaction stack `[dummy, signatures...]` with signatures
/// in script key order. Every one of the threshold signatures must be
/// present.
fn multisig_stack(
    script: &Script,
    partial_sigs: &BTreeMap<PublicKey, ecdsa::Signature>,
    declared_type: Option<PsbtSighashType>,
    index: usize,
) -> Result<Vec<Vec<u8>>, Error> {
    let (threshold, pubkeys) = parse_multisig(script)
        .map_err(|e| Error::Structural(format!("input {}: {}", index, e)))?;
    let mut items: Vec<Vec<u8>> = vec![Vec::new()];
    for pubkey in &pubkeys {
        if let Some(signature) = partial_sigs.get(pubkey) {
            items.push(signature_bytes(signature, declared_type));
        }
    }
    if items.len() - 1 != threshold {
        return Err(Error::State(format!(
            "input {}: {} of {} required signatures present",
            index,
            items.len() - 1,
            threshold
        )));
    }
    Ok(items)
}

fn single_signature(
    input: &crate::bitcoin::psbt::Input,
    index: usize,
) -> Result<(PublicKey, Vec<u8>), Error> {
    if input.partial_sigs.len() != 1 {
        return Err(Error::State(format!(
            "input {}: expected exactly one signature, found {}",
            index,
            input.partial_sigs.len()
        )));
    }
    let (pubkey, signature) = input
        .partial_sigs
        .iter()
        .next()
        .map(|(pk, sig)| (*pk, signature_bytes(sig, input.sighash_type)))
        .ok_or_else(|| Error::State(format!("input {}: no signature", index)))?;
    Ok((pubkey, signature))
}

/// Script signature bytes: DER body plus the sighash byte. The input's
/// declared sighash type wins over the one stored inside the signature,
/// since fork-id extended types collapse to their base type in storage.
fn signature_bytes(signature: &ecdsa::Signature, declared_type: Option<PsbtSighashType>) -> Vec<u8> {
    let mut bytes = signature.signature.serialize_der().to_vec();
    let hash_type = declared_type
        .map(|t| t.to_u32())
        .unwrap_or_else(|| signature.sighash_type.to_u32());
    bytes.push(hash_type as u8);
    bytes
}

fn push_only(script: &Script, index: usize) -> Result<ScriptBuf, Error> {
    Ok(Builder::new()
        .push_slice(push_bytes(script.as_bytes(), index)?)
        .into_script())
}

fn push_bytes(bytes: &[u8], index: usize) -> Result<PushBytesBuf, Error> {
    PushBytesBuf::try_from(bytes.to_vec())
        .map_err(|e| Error::Structural(format!("input {}: push too large: {}", index, e)))
}

fn is_p2wpkh_program(script: &Script) -> bool {
    let bytes = script.as_bytes();
    bytes.len() == 22 && bytes[0] == 0x00 && bytes[1] == 0x14
}
