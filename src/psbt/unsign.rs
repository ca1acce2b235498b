//! Recovering structured signing data from signed transaction inputs.
//!
//! A fully or partially signed transaction carries its signatures inside
//! scriptSig and witness stacks. To rebuild a PSBT from it, each input is
//! classified by shape, its signatures are paired with public keys (by trial
//! verification for multisig stacks), and the stacks are cleared so the
//! remaining transaction is unsigned. Finalizing the rebuilt PSBT must
//! reproduce the original bytes.
//!
//! Supported shapes: P2PKH, P2SH multisig, P2SH-wrapped and native P2WSH
//! multisig and P2WPKH, taproot two-key script path, and taproot key path
//! (signature carried through without verification). Anything else is
//! rejected.

use std::collections::VecDeque;

use crate::bitcoin::blockdata::script::Instruction;
use crate::bitcoin::key::Secp256k1;
use crate::bitcoin::psbt::PsbtSighashType;
use crate::bitcoin::secp256k1::{self, Message};
use crate::bitcoin::taproot::{self, ControlBlock, TapLeafHash};
use crate::bitcoin::{
    ecdsa, EcdsaSighashType, PublicKey, Script, ScriptBuf, Transaction, TxOut, Witness,
};
use crate::error::Error;
use crate::networks::Network;
use crate::scripts::{parse_multisig_pubkeys, parse_taproot_pair_script};

use super::sighash;
use super::InputUpdate;

const TAPROOT_ANNEX_TAG: u8 = 0x50;

/// Strip the signatures off every input of `tx`, returning per-input update
/// records that rebuild them. `prev_outputs` must have one entry per input.
pub(crate) fn unsign_inputs(
    tx: &mut Transaction,
    prev_outputs: &[TxOut],
    network: Network,
) -> Result<Vec<InputUpdate>, Error> {
    if prev_outputs.len() != tx.input.len() {
        return Err(Error::Structural(format!(
            "{} previous outputs supplied for {} inputs",
            prev_outputs.len(),
            tx.input.len()
        )));
    }

    let updates = (0..tx.input.len())
        .map(|vin| classify_input(tx, vin, &prev_outputs[vin], network))
        .collect::<Result<Vec<_>, _>>()?;

    for input in &mut tx.input {
        input.script_sig = ScriptBuf::new();
        input.witness = Witness::new();
    }
    Ok(updates)
}

/// Classify one signed input and recover its update record. The transaction
/// is left untouched; digests over it ignore existing scriptSigs by
/// construction.
fn classify_input(
    tx: &Transaction,
    vin: usize,
    prev_output: &TxOut,
    network: Network,
) -> Result<InputUpdate, Error> {
    let secp = Secp256k1::new();
    let input = &tx.input[vin];
    let mut update = InputUpdate::default();
    let mut redeem_script: Option<ScriptBuf> = None;

    if !input.script_sig.is_empty() {
        let mut stack = decompile_pushes(&input.script_sig)
            .map_err(|e| Error::Structural(format!("input {}: {}", vin, e)))?;

        if input.witness.is_empty() && stack.len() == 2 {
            // P2PKH: [signature, pubkey]
            let pubkey = stack.pop().and_then(|b| PublicKey::from_slice(&b).ok());
            let signature = stack.pop();
            match (pubkey, signature) {
                (Some(pubkey), Some(signature)) => {
                    let (signature, hash_type) = storage_signature(&signature, vin)?;
                    update.partial_sigs.push((pubkey, signature));
                    record_sighash_type(&mut update, hash_type);
                    return Ok(update);
                }
                _ => {
                    return Err(Error::Structural(format!(
                        "input {}: malformed pay-to-pubkey-hash scriptSig",
                        vin
                    )))
                }
            }
        }

        let redeem_bytes = stack
            .pop()
            .ok_or_else(|| Error::Structural(format!("input {}: empty scriptSig stack", vin)))?;
        let redeem = ScriptBuf::from_bytes(redeem_bytes);
        update.redeem_script = Some(redeem.clone());

        if !is_witness_program(redeem.as_bytes()) {
            // P2SH multisig: remaining stack is [dummy, signatures...]
            let value = prev_output.value;
            let variant = network.sighash_variant();
            update.partial_sigs = match_signatures(
                &secp,
                &redeem,
                &stack,
                vin,
                |hash_type| sighash::script_code_digest(tx, vin, &redeem, hash_type, value, variant),
            )?;
            record_stack_sighash_type(&mut update, &stack);
            return Ok(update);
        }
        redeem_script = Some(redeem);
    }

    if !input.witness.is_empty() {
        let mut witness: Vec<Vec<u8>> = input.witness.to_vec();

        if witness.len() > 2
            && witness
                .last()
                .and_then(|item| item.first())
                .is_some_and(|tag| *tag == TAPROOT_ANNEX_TAG)
        {
            return Err(Error::Structural(format!(
                "input {}: taproot annex is not supported",
                vin
            )));
        }

        if witness.len() == 1 {
            // taproot key path
            let item = witness.pop().unwrap_or_default();
            update.tap_key_sig = Some(taproot::Signature::from_slice(&item).map_err(|e| {
                Error::Structural(format!("input {}: taproot key signature: {}", vin, e))
            })?);
            return Ok(update);
        }

        let program = redeem_script
            .as_deref()
            .unwrap_or(&prev_output.script_pubkey);
        let program_bytes = program.as_bytes();

        if program_bytes.len() == 34 && program_bytes[0] == 0x51 {
            classify_taproot_script_path(&mut witness, vin, &mut update)?;
            return Ok(update);
        }

        if program_bytes.len() == 34 && program_bytes[0] == 0x00 {
            // P2WSH multisig: [dummy, signatures..., witnessScript]
            let script_bytes = witness.pop().ok_or_else(|| {
                Error::Structural(format!("input {}: empty P2WSH witness", vin))
            })?;
            let witness_script = ScriptBuf::from_bytes(script_bytes);
            update.witness_script = Some(witness_script.clone());
            let value = prev_output.value;
            update.partial_sigs = match_signatures(
                &secp,
                &witness_script,
                &witness,
                vin,
                |hash_type| sighash::segwit_v0_digest(tx, vin, &witness_script, value, hash_type),
            )?;
            record_stack_sighash_type(&mut update, &witness);
            return Ok(update);
        }

        if program_bytes.len() == 22 && program_bytes[0] == 0x00 && witness.len() == 2 {
            // P2WPKH: [signature, pubkey]
            let pubkey = PublicKey::from_slice(&witness[1]).map_err(|e| {
                Error::Structural(format!("input {}: P2WPKH public key: {}", vin, e))
            })?;
            let (signature, hash_type) = storage_signature(&witness[0], vin)?;
            update.partial_sigs.push((pubkey, signature));
            record_sighash_type(&mut update, hash_type);
            return Ok(update);
        }

        return Err(Error::Structural(format!(
            "input {}: unsupported witness shape ({} elements)",
            vin,
            witness.len()
        )));
    }

    // unsigned input, nothing to recover
    Ok(update)
}

/// Taproot script path: [signatures..., leafScript, controlBlock], where the
/// leaf script must be the two-key template. Signatures sit in reverse script
/// order on the stack, so popping from the end pairs them with the keys in
/// script order; an empty element stands for a key that has not signed.
fn classify_taproot_script_path(
    witness: &mut Vec<Vec<u8>>,
    vin: usize,
    update: &mut InputUpdate,
) -> Result<(), Error> {
    let control_bytes = witness
        .pop()
        .ok_or_else(|| Error::Structural(format!("input {}: missing control block", vin)))?;
    let control = ControlBlock::decode(&control_bytes)
        .map_err(|e| Error::Structural(format!("input {}: control block: {}", vin, e)))?;
    let script_bytes = witness
        .pop()
        .ok_or_else(|| Error::Structural(format!("input {}: missing leaf script", vin)))?;
    let leaf_script = ScriptBuf::from_bytes(script_bytes);
    let leaf_version = control.leaf_version;

    let keys = parse_taproot_pair_script(&leaf_script)
        .map_err(|e| Error::Structural(format!("input {}: {}", vin, e)))?;
    if witness.len() != 2 {
        return Err(Error::Structural(format!(
            "input {}: expected 2 taproot signature slots, found {}",
            vin,
            witness.len()
        )));
    }

    let leaf_hash = TapLeafHash::from_script(&leaf_script, leaf_version);
    let mut pending: VecDeque<_> = keys.into_iter().collect();
    while let Some(item) = witness.pop() {
        let key = pending.pop_front().ok_or_else(|| {
            Error::Structural(format!("input {}: more signatures than leaf keys", vin))
        })?;
        if item.is_empty() {
            continue;
        }
        let signature = taproot::Signature::from_slice(&item).map_err(|e| {
            Error::Structural(format!("input {}: taproot signature: {}", vin, e))
        })?;
        update.tap_script_sigs.push((key, leaf_hash, signature));
    }

    update.tap_leaf_script = Some((control, leaf_script, leaf_version));
    Ok(())
}

/// Pair each signature of a multisig stack with the script key it verifies
/// against. The first stack element is the CHECKMULTISIG dummy and is
/// skipped, as are empty placeholder elements. The first key that verifies
/// wins; a signature that verifies against no key aborts the recovery.
pub(crate) fn match_signatures<C, F>(
    secp: &Secp256k1<C>,
    script: &Script,
    stack: &[Vec<u8>],
    vin: usize,
    digest: F,
) -> Result<Vec<(PublicKey, ecdsa::Signature)>, Error>
where
    C: secp256k1::Verification,
    F: Fn(u32) -> Result<Message, Error>,
{
    let pubkeys = parse_multisig_pubkeys(script)
        .map_err(|e| Error::Structural(format!("input {}: {}", vin, e)))?;
    if pubkeys.len() != 3 {
        return Err(Error::Structural(format!(
            "input {}: expected a multisig script with 3 keys, found {}",
            vin,
            pubkeys.len()
        )));
    }

    let mut matched = Vec::new();
    for item in stack.iter().skip(1) {
        if item.is_empty() {
            continue;
        }
        let (signature, hash_type) = decode_script_signature(item)
            .map_err(|e| Error::Structural(format!("input {}: {}", vin, e)))?;
        let msg = digest(hash_type)?;
        let key = pubkeys
            .iter()
            .find(|pubkey| secp.verify_ecdsa(&msg, &signature, &pubkey.inner).is_ok());
        match key {
            Some(pubkey) => matched.push((
                *pubkey,
                ecdsa::Signature {
                    signature,
                    sighash_type: storage_sighash_type(hash_type),
                },
            )),
            None => {
                return Err(Error::SignatureMismatch(format!(
                    "input {}: signature does not verify against any multisig key",
                    vin
                )))
            }
        }
    }
    Ok(matched)
}

/// Split a script signature into its DER body and trailing sighash byte.
pub(crate) fn decode_script_signature(
    bytes: &[u8],
) -> Result<(secp256k1::ecdsa::Signature, u32), Error> {
    let (hash_type, der) = bytes
        .split_last()
        .ok_or_else(|| Error::Structural("empty signature".into()))?;
    let signature = secp256k1::ecdsa::Signature::from_der(der)
        .map_err(|e| Error::Structural(format!("signature DER: {}", e)))?;
    Ok((signature, u32::from(*hash_type)))
}

/// The sighash type a recovered signature is stored under. Fork-id types are
/// not representable in standard PSBT fields and collapse to their base type.
pub(crate) fn storage_sighash_type(hash_type: u32) -> EcdsaSighashType {
    EcdsaSighashType::from_standard(hash_type)
        .unwrap_or_else(|_| EcdsaSighashType::from_consensus(hash_type))
}

fn storage_signature(bytes: &[u8], vin: usize) -> Result<(ecdsa::Signature, u32), Error> {
    let (signature, hash_type) = decode_script_signature(bytes)
        .map_err(|e| Error::Structural(format!("input {}: {}", vin, e)))?;
    Ok((
        ecdsa::Signature {
            signature,
            sighash_type: storage_sighash_type(hash_type),
        },
        hash_type,
    ))
}

/// Record a non-default sighash type on the update so signatures whose type
/// the standard PSBT field cannot carry (fork-id extended) can still be
/// reassembled byte for byte.
fn record_sighash_type(update: &mut InputUpdate, hash_type: u32) {
    if hash_type != sighash::SIGHASH_ALL {
        update.sighash_type = Some(PsbtSighashType::from_u32(hash_type));
    }
}

fn record_stack_sighash_type(update: &mut InputUpdate, stack: &[Vec<u8>]) {
    let observed = stack
        .iter()
        .skip(1)
        .find(|item| !item.is_empty())
        .and_then(|item| decode_script_signature(item).ok());
    if let Some((_, hash_type)) = observed {
        record_sighash_type(update, hash_type);
    }
}

/// Whether redeem script bytes are a segwit witness program wrapper
/// (P2SH-wrapped P2WPKH or P2WSH).
fn is_witness_program(bytes: &[u8]) -> bool {
    (bytes.len() == 22 || bytes.len() == 34) && bytes.first() == Some(&0x00)
}

/// Flatten a scriptSig into its pushed elements. Opcode pushes of small
/// integers do not occur in the supported shapes, so any non-push opcode is
/// an error; `OP_0` decompiles to an empty push (the CHECKMULTISIG dummy).
fn decompile_pushes(script: &Script) -> Result<Vec<Vec<u8>>, Error> {
    script
        .instructions()
        .map(|instruction| match instruction {
            Ok(Instruction::PushBytes(push)) => Ok(push.as_bytes().to_vec()),
            Ok(Instruction::Op(op)) => Err(Error::Structural(format!(
                "unexpected opcode {} in scriptSig",
                op
            ))),
            Err(e) => Err(Error::Structural(format!("scriptSig: {}", e))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::blockdata::opcodes::all::OP_PUSHBYTES_0;
    use crate::bitcoin::blockdata::script::Builder;
    use crate::bitcoin::hashes::Hash;
    use crate::bitcoin::locktime::absolute::LockTime;
    use crate::bitcoin::script::PushBytesBuf;
    use crate::bitcoin::transaction::Version;
    use crate::bitcoin::{Amount, OutPoint, Sequence, TxIn, Txid};
    use crate::psbt::hd::tests::{wallet_xprivs, xpriv_from_seed};
    use crate::psbt::HdSigner;
    use crate::scripts::build_multisig_script;

    fn spend_tx() -> Transaction {
        Transaction {
            version: Version(1),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::all_zeros(),
                    vout: 3,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(40_000),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    fn der_sig(secp: &Secp256k1<secp256k1::All>, xpriv: &crate::bitcoin::bip32::Xpriv, msg: &Message) -> Vec<u8> {
        let mut bytes = xpriv.sign_ecdsa(secp, msg).serialize_der().to_vec();
        bytes.push(sighash::SIGHASH_ALL as u8);
        bytes
    }

    fn push(builder: Builder, bytes: &[u8]) -> Builder {
        builder.push_slice(PushBytesBuf::try_from(bytes.to_vec()).unwrap())
    }

    #[test]
    fn recovers_p2sh_multisig_in_key_order() {
        let secp = Secp256k1::new();
        let xprivs = wallet_xprivs("unsign-p2sh");
        let pubkeys: Vec<PublicKey> = xprivs
            .iter()
            .map(|x| PublicKey::new(x.public_key(&secp)))
            .collect();
        let redeem = build_multisig_script(2, &pubkeys).unwrap();

        let mut tx = spend_tx();
        let prev_output = TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: ScriptBuf::new_p2sh(&redeem.script_hash()),
        };
        let msg = sighash::script_code_digest(
            &tx,
            0,
            &redeem,
            sighash::SIGHASH_ALL,
            prev_output.value,
            Network::Bitcoin.sighash_variant(),
        )
        .unwrap();

        // signed by the holders of keys A and C
        let sig_a = der_sig(&secp, &xprivs[0], &msg);
        let sig_c = der_sig(&secp, &xprivs[2], &msg);
        let mut builder = Builder::new().push_opcode(OP_PUSHBYTES_0);
        builder = push(builder, &sig_a);
        builder = push(builder, &sig_c);
        builder = push(builder, redeem.as_bytes());
        tx.input[0].script_sig = builder.into_script();

        let updates = unsign_inputs(&mut tx, &[prev_output], Network::Bitcoin).unwrap();
        assert!(tx.input[0].script_sig.is_empty());

        let update = &updates[0];
        assert_eq!(update.redeem_script.as_ref(), Some(&redeem));
        assert_eq!(update.partial_sigs.len(), 2);
        assert_eq!(update.partial_sigs[0].0, pubkeys[0]);
        assert_eq!(update.partial_sigs[1].0, pubkeys[2]);
        assert!(!update.partial_sigs.iter().any(|(pk, _)| *pk == pubkeys[1]));
    }

    #[test]
    fn foreign_signature_aborts_recovery() {
        let secp = Secp256k1::new();
        let xprivs = wallet_xprivs("unsign-mismatch");
        let outsider = xpriv_from_seed("unsign-mismatch/outsider");
        let pubkeys: Vec<PublicKey> = xprivs
            .iter()
            .map(|x| PublicKey::new(x.public_key(&secp)))
            .collect();
        let redeem = build_multisig_script(2, &pubkeys).unwrap();

        let mut tx = spend_tx();
        let prev_output = TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: ScriptBuf::new_p2sh(&redeem.script_hash()),
        };
        let msg = sighash::script_code_digest(
            &tx,
            0,
            &redeem,
            sighash::SIGHASH_ALL,
            prev_output.value,
            Network::Bitcoin.sighash_variant(),
        )
        .unwrap();

        let sig = der_sig(&secp, &outsider, &msg);
        let mut builder = Builder::new().push_opcode(OP_PUSHBYTES_0);
        builder = push(builder, &sig);
        builder = push(builder, redeem.as_bytes());
        tx.input[0].script_sig = builder.into_script();

        let err = unsign_inputs(&mut tx, &[prev_output], Network::Bitcoin).unwrap_err();
        assert!(matches!(err, Error::SignatureMismatch(_)));
    }

    #[test]
    fn recovers_p2pkh() {
        let secp = Secp256k1::new();
        let xpriv = xpriv_from_seed("unsign-p2pkh");
        let pubkey = PublicKey::new(xpriv.public_key(&secp));

        let mut tx = spend_tx();
        let script_pubkey = ScriptBuf::new_p2pkh(&pubkey.pubkey_hash());
        let prev_output = TxOut {
            value: Amount::from_sat(20_000),
            script_pubkey: script_pubkey.clone(),
        };
        let msg = sighash::script_code_digest(
            &tx,
            0,
            &script_pubkey,
            sighash::SIGHASH_ALL,
            prev_output.value,
            Network::Bitcoin.sighash_variant(),
        )
        .unwrap();
        let sig = der_sig(&secp, &xpriv, &msg);

        let mut builder = Builder::new();
        builder = push(builder, &sig);
        builder = push(builder, &pubkey.to_bytes());
        tx.input[0].script_sig = builder.into_script();

        let updates = unsign_inputs(&mut tx, &[prev_output], Network::Bitcoin).unwrap();
        assert_eq!(updates[0].partial_sigs.len(), 1);
        assert_eq!(updates[0].partial_sigs[0].0, pubkey);
        assert!(updates[0].redeem_script.is_none());
    }

    #[test]
    fn recovers_p2wpkh() {
        let secp = Secp256k1::new();
        let xpriv = xpriv_from_seed("unsign-p2wpkh");
        let pubkey = PublicKey::new(xpriv.public_key(&secp));
        let compressed =
            crate::bitcoin::CompressedPublicKey::try_from(pubkey).unwrap();

        let mut tx = spend_tx();
        let prev_output = TxOut {
            value: Amount::from_sat(30_000),
            script_pubkey: ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash()),
        };
        let script_code =
            crate::scripts::p2wpkh_script_code(&prev_output.script_pubkey).unwrap();
        let msg = sighash::segwit_v0_digest(
            &tx,
            0,
            &script_code,
            prev_output.value,
            sighash::SIGHASH_ALL,
        )
        .unwrap();
        let sig = der_sig(&secp, &xpriv, &msg);
        tx.input[0].witness = Witness::from_slice(&[sig, pubkey.to_bytes()]);

        let updates = unsign_inputs(&mut tx, &[prev_output], Network::Bitcoin).unwrap();
        assert!(tx.input[0].witness.is_empty());
        assert_eq!(updates[0].partial_sigs.len(), 1);
        assert_eq!(updates[0].partial_sigs[0].0, pubkey);
    }

    #[test]
    fn rejects_annex() {
        let mut tx = spend_tx();
        let prev_output = TxOut {
            value: Amount::from_sat(10_000),
            script_pubkey: ScriptBuf::from_bytes([&[0x51, 0x20][..], &[0x11; 32][..]].concat()),
        };
        tx.input[0].witness =
            Witness::from_slice(&[vec![0u8; 64], vec![0u8; 34], vec![TAPROOT_ANNEX_TAG, 0x01]]);

        let err = unsign_inputs(&mut tx, &[prev_output], Network::Bitcoin).unwrap_err();
        assert!(matches!(err, Error::Structural(_)));
    }

    #[test]
    fn rejects_unknown_witness_shape() {
        let mut tx = spend_tx();
        // three witness elements against a P2WPKH program
        let prev_output = TxOut {
            value: Amount::from_sat(10_000),
            script_pubkey: ScriptBuf::from_bytes([&[0x00, 0x14][..], &[0x22; 20][..]].concat()),
        };
        tx.input[0].witness = Witness::from_slice(&[vec![1u8], vec![2u8], vec![3u8]]);

        let err = unsign_inputs(&mut tx, &[prev_output], Network::Bitcoin).unwrap_err();
        assert!(matches!(err, Error::Structural(_)));
    }

    #[test]
    fn rejects_prevout_count_mismatch() {
        let mut tx = spend_tx();
        let err = unsign_inputs(&mut tx, &[], Network::Bitcoin).unwrap_err();
        assert!(matches!(err, Error::Structural(_)));
    }

    #[test]
    fn unsigned_input_yields_empty_update() {
        let mut tx = spend_tx();
        let prev_output = TxOut {
            value: Amount::from_sat(10_000),
            script_pubkey: ScriptBuf::new(),
        };
        let updates = unsign_inputs(&mut tx, &[prev_output], Network::Bitcoin).unwrap();
        assert!(updates[0].partial_sigs.is_empty());
        assert!(updates[0].redeem_script.is_none());
        assert!(updates[0].tap_script_sigs.is_empty());
    }
}
