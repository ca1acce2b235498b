//! Taproot script-path signing, validation, and finalization.
//!
//! Only single-leaf spends of the two-key `<keyA> CHECKSIGVERIFY <keyB>
//! CHECKSIG` template are supported. Key-path signing and inputs with more
//! than one leaf script are rejected outright.

use crate::bitcoin::hashes::Hash;
use crate::bitcoin::key::Secp256k1;
use crate::bitcoin::psbt::Psbt;
use crate::bitcoin::secp256k1::{All, Message};
use crate::bitcoin::sighash::{Prevouts, SighashCache};
use crate::bitcoin::taproot::{self, TapLeafHash};
use crate::bitcoin::{TapSighashType, Witness, XOnlyPublicKey};
use crate::error::Error;
use crate::scripts::parse_taproot_pair_script;

use super::hd::HdSigner;
use super::{clear_signing_fields, collect_prevouts};

/// Assemble the final witness for a taproot script-path input:
/// `[sigB, sigA, leafScript, controlBlock]`, signatures prepended in script
/// key order. Both leaf keys must have signed.
pub(crate) fn finalize_input(psbt: &mut Psbt, index: usize) -> Result<(), Error> {
    let input = &psbt.inputs[index];
    let (control, (leaf_script, leaf_version)) = single_leaf(psbt, index)?;
    let keys = parse_taproot_pair_script(&leaf_script)
        .map_err(|e| Error::Structural(format!("input {}: {}", index, e)))?;
    let leaf_hash = TapLeafHash::from_script(&leaf_script, leaf_version);

    let mut items: Vec<Vec<u8>> = vec![leaf_script.to_bytes(), control.serialize()];
    for key in keys {
        let signature = input.tap_script_sigs.get(&(key, leaf_hash)).ok_or_else(|| {
            Error::State(format!(
                "input {}: missing signature for a leaf script key",
                index
            ))
        })?;
        items.insert(0, signature.to_vec());
    }

    let input = &mut psbt.inputs[index];
    input.final_script_witness = Some(Witness::from_slice(&items));
    clear_signing_fields(input);
    Ok(())
}

/// Sign the input's single leaf script with `signer`, whose key must be one
/// of the leaf keys and whose coverage must include the leaf hash. The
/// input's sighash type (default if absent) must be whitelisted, checked
/// before any digest is computed.
pub(crate) fn sign_input<S: HdSigner>(
    psbt: &mut Psbt,
    raw_non_witness: &[Option<Vec<u8>>],
    index: usize,
    secp: &Secp256k1<All>,
    signer: &S,
    leaf_hashes: &[TapLeafHash],
    sighash_whitelist: &[u32],
) -> Result<(), Error> {
    let (control, (leaf_script, leaf_version)) = single_leaf(psbt, index)?;
    if control.leaf_version != leaf_version {
        return Err(Error::Structural(format!(
            "input {}: control block leaf version 0x{:02x} does not match the leaf script version 0x{:02x}",
            index,
            control.leaf_version.to_consensus(),
            leaf_version.to_consensus()
        )));
    }
    let keys = parse_taproot_pair_script(&leaf_script)
        .map_err(|e| Error::Structural(format!("input {}: {}", index, e)))?;
    let (signer_key, _) = signer.public_key(secp).x_only_public_key();
    if !keys.contains(&signer_key) {
        return Err(Error::Structural(format!(
            "input {}: signer key is not part of the leaf script",
            index
        )));
    }

    let leaf_hash = TapLeafHash::from_script(&leaf_script, leaf_version);
    if !leaf_hashes.contains(&leaf_hash) {
        return Err(Error::State(format!(
            "input {}: signer does not cover leaf hash {}",
            index, leaf_hash
        )));
    }

    let hash_type = psbt.inputs[index]
        .sighash_type
        .map(|t| t.to_u32())
        .unwrap_or(TapSighashType::Default as u32);
    if !sighash_whitelist.contains(&hash_type) {
        return Err(Error::State(format!(
            "input {}: sighash type 0x{:02x} is not in the whitelist",
            index, hash_type
        )));
    }
    let hash_type_u8 = u8::try_from(hash_type)
        .map_err(|_| Error::Structural(format!("sighash type 0x{:x} out of range", hash_type)))?;
    let sighash_type = TapSighashType::from_consensus_u8(hash_type_u8)
        .map_err(|e| Error::Structural(format!("input {}: {}", index, e)))?;

    let msg = script_spend_digest(psbt, raw_non_witness, index, sighash_type, leaf_hash)?;
    let signature = signer.sign_schnorr(secp, &msg);
    psbt.inputs[index].tap_script_sigs.insert(
        (signer_key, leaf_hash),
        taproot::Signature {
            signature,
            sighash_type,
        },
    );
    Ok(())
}

/// Sign via every taproot derivation entry whose master fingerprint matches
/// the signer, once per leaf hash the entry covers.
pub(crate) fn sign_input_hd<S: HdSigner>(
    psbt: &mut Psbt,
    raw_non_witness: &[Option<Vec<u8>>],
    index: usize,
    secp: &Secp256k1<All>,
    signer: &S,
    sighash_whitelist: &[u32],
) -> Result<(), Error> {
    let origins = psbt.inputs[index].tap_key_origins.clone();
    if origins.is_empty() {
        return Err(Error::State(format!(
            "input {}: need taproot derivation entries to sign with an HD signer",
            index
        )));
    }
    let fingerprint = signer.fingerprint(secp);
    let matching: Vec<_> = origins
        .into_iter()
        .filter(|(_, (_, (origin, _)))| *origin == fingerprint)
        .collect();
    if matching.is_empty() {
        return Err(Error::State(format!(
            "input {}: no taproot derivation entry matches the signer fingerprint",
            index
        )));
    }

    for (recorded_key, (leaf_hashes, (_, path))) in matching {
        let child = signer.derive_path(secp, &path)?;
        let (child_key, _) = child.public_key(secp).x_only_public_key();
        if child_key != recorded_key {
            return Err(Error::Structural(format!(
                "input {}: derived public key does not match the derivation entry",
                index
            )));
        }
        sign_input(
            psbt,
            raw_non_witness,
            index,
            secp,
            &child,
            &leaf_hashes,
            sighash_whitelist,
        )?;
    }
    Ok(())
}

/// Verify every recorded taproot script signature of the input. Returns
/// false if any signature fails; errors if there is nothing to validate.
pub(crate) fn validate_input(
    psbt: &Psbt,
    raw_non_witness: &[Option<Vec<u8>>],
    index: usize,
    secp: &Secp256k1<All>,
) -> Result<bool, Error> {
    let signatures: Vec<((XOnlyPublicKey, TapLeafHash), taproot::Signature)> = psbt.inputs[index]
        .tap_script_sigs
        .iter()
        .map(|(k, v)| (*k, *v))
        .collect();
    if signatures.is_empty() {
        return Err(Error::State(format!(
            "input {}: no taproot signatures to validate",
            index
        )));
    }

    let mut all_valid = true;
    for ((key, leaf_hash), signature) in signatures {
        let msg = script_spend_digest(psbt, raw_non_witness, index, signature.sighash_type, leaf_hash)?;
        if secp.verify_schnorr(&signature.signature, &msg, &key).is_err() {
            all_valid = false;
        }
    }
    Ok(all_valid)
}

/// The input's single leaf script entry. Zero entries means the caller asked
/// for key-path signing, which is rejected; more than one is unsupported.
fn single_leaf(
    psbt: &Psbt,
    index: usize,
) -> Result<
    (
        taproot::ControlBlock,
        (crate::bitcoin::ScriptBuf, taproot::LeafVersion),
    ),
    Error,
> {
    let input = &psbt.inputs[index];
    match input.tap_scripts.len() {
        0 => Err(Error::Unsupported(format!(
            "input {}: taproot key path spending is not supported",
            index
        ))),
        1 => {
            let (control, script) = input
                .tap_scripts
                .iter()
                .next()
                .map(|(c, s)| (c.clone(), s.clone()))
                .ok_or_else(|| Error::Structural(format!("input {}: no leaf script", index)))?;
            Ok((control, script))
        }
        n => Err(Error::Unsupported(format!(
            "input {}: {} taproot leaf scripts, only one is supported",
            index, n
        ))),
    }
}

/// BIP341 script-spend digest over all spent outputs. Gathering the spent
/// outputs performs the non-witness hash check, so a mismatched previous
/// transaction fails here before any digest is computed.
fn script_spend_digest(
    psbt: &Psbt,
    raw_non_witness: &[Option<Vec<u8>>],
    index: usize,
    sighash_type: TapSighashType,
    leaf_hash: TapLeafHash,
) -> Result<Message, Error> {
    let prevouts = collect_prevouts(psbt, raw_non_witness)?;
    let mut cache = SighashCache::new(&psbt.unsigned_tx);
    let sighash = cache
        .taproot_script_spend_signature_hash(
            index,
            &Prevouts::All(&prevouts),
            leaf_hash,
            sighash_type,
        )
        .map_err(|e| Error::Structural(format!("input {}: {}", index, e)))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}
