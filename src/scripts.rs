//! The fixed script templates this engine understands, and their parsers.
//!
//! Legacy multisig inputs spend `OP_m <key...> OP_n OP_CHECKMULTISIG`
//! scripts; taproot inputs spend a single-leaf two-key chain
//! `<keyA> OP_CHECKSIGVERIFY <keyB> OP_CHECKSIG`.

use crate::bitcoin::blockdata::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_DUP, OP_EQUALVERIFY, OP_HASH160,
};
use crate::bitcoin::blockdata::script::{Builder, Instruction};
use crate::bitcoin::{PublicKey, Script, ScriptBuf, XOnlyPublicKey};
use crate::error::Error;

/// Build an m-of-n CHECKMULTISIG script over compressed keys in the given
/// order.
pub fn build_multisig_script(threshold: usize, keys: &[PublicKey]) -> Result<ScriptBuf, Error> {
    if threshold == 0 || threshold > keys.len() || keys.len() > 16 {
        return Err(Error::Structural(format!(
            "invalid multisig shape {}-of-{}",
            threshold,
            keys.len()
        )));
    }
    let mut builder = Builder::new().push_int(threshold as i64);
    for key in keys {
        builder = builder.push_slice(key.inner.serialize());
    }
    Ok(builder
        .push_int(keys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script())
}

/// Parse a CHECKMULTISIG script, returning its public keys in script order.
pub fn parse_multisig_pubkeys(script: &Script) -> Result<Vec<PublicKey>, Error> {
    parse_multisig(script).map(|(_, keys)| keys)
}

/// Parse a CHECKMULTISIG script into its threshold and public keys.
pub fn parse_multisig(script: &Script) -> Result<(usize, Vec<PublicKey>), Error> {
    let instructions: Vec<Instruction> = script
        .instructions()
        .collect::<Result<_, _>>()
        .map_err(|e| Error::Structural(format!("multisig script: {}", e)))?;
    if instructions.len() < 4 {
        return Err(Error::Structural("multisig script too short".into()));
    }
    if instructions[instructions.len() - 1] != Instruction::Op(OP_CHECKMULTISIG) {
        return Err(Error::Structural(
            "multisig script does not end in OP_CHECKMULTISIG".into(),
        ));
    }
    let threshold = pushnum(&instructions[0])
        .ok_or_else(|| Error::Structural("multisig script does not start with a threshold".into()))?;
    let total = pushnum(&instructions[instructions.len() - 2])
        .ok_or_else(|| Error::Structural("multisig script has no key count".into()))?;

    let keys = instructions[1..instructions.len() - 2]
        .iter()
        .map(|instruction| match instruction {
            Instruction::PushBytes(push) => PublicKey::from_slice(push.as_bytes())
                .map_err(|e| Error::Structural(format!("multisig public key: {}", e))),
            Instruction::Op(op) => Err(Error::Structural(format!(
                "unexpected opcode {} between multisig keys",
                op
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    if keys.len() != total as usize || threshold == 0 || threshold > total {
        return Err(Error::Structural(format!(
            "inconsistent multisig shape {}-of-{} with {} keys",
            threshold,
            total,
            keys.len()
        )));
    }
    Ok((threshold as usize, keys))
}

/// Build the two-key taproot leaf script `<keyA> CHECKSIGVERIFY <keyB>
/// CHECKSIG`.
pub fn build_taproot_pair_script(keys: &[XOnlyPublicKey; 2]) -> ScriptBuf {
    Builder::new()
        .push_slice(keys[0].serialize())
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_slice(keys[1].serialize())
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// Parse a taproot leaf script that must be exactly the two-key template,
/// returning the keys in script order.
pub fn parse_taproot_pair_script(script: &Script) -> Result<[XOnlyPublicKey; 2], Error> {
    let instructions: Vec<Instruction> = script
        .instructions()
        .collect::<Result<_, _>>()
        .map_err(|e| Error::Structural(format!("taproot leaf script: {}", e)))?;
    match instructions.as_slice() {
        [Instruction::PushBytes(first), Instruction::Op(verify), Instruction::PushBytes(second), Instruction::Op(check)]
            if *verify == OP_CHECKSIGVERIFY && *check == OP_CHECKSIG =>
        {
            let key_a = XOnlyPublicKey::from_slice(first.as_bytes())
                .map_err(|e| Error::Structural(format!("taproot leaf key: {}", e)))?;
            let key_b = XOnlyPublicKey::from_slice(second.as_bytes())
                .map_err(|e| Error::Structural(format!("taproot leaf key: {}", e)))?;
            Ok([key_a, key_b])
        }
        _ => Err(Error::Structural(
            "taproot leaf script is not the two-key CHECKSIGVERIFY/CHECKSIG template".into(),
        )),
    }
}

/// The BIP143 script code for a P2WPKH witness program.
pub(crate) fn p2wpkh_script_code(program: &Script) -> Result<ScriptBuf, Error> {
    let bytes = program.as_bytes();
    if bytes.len() != 22 || bytes[0] != 0x00 || bytes[1] != 0x14 {
        return Err(Error::Structural(
            "script is not a P2WPKH witness program".into(),
        ));
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&bytes[2..22]);
    Ok(Builder::new()
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(hash)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .into_script())
}

fn pushnum(instruction: &Instruction) -> Option<u8> {
    match instruction {
        Instruction::Op(op) if (0x51..=0x60).contains(&op.to_u8()) => Some(op.to_u8() - 0x50),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::key::Secp256k1;
    use crate::psbt::hd::tests::wallet_xprivs;
    use crate::psbt::HdSigner;

    fn test_pubkeys() -> Vec<PublicKey> {
        let secp = Secp256k1::new();
        wallet_xprivs("scripts")
            .iter()
            .map(|x| PublicKey::new(x.public_key(&secp)))
            .collect()
    }

    #[test]
    fn multisig_round_trip() {
        let keys = test_pubkeys();
        let script = build_multisig_script(2, &keys).unwrap();
        let parsed = parse_multisig_pubkeys(&script).unwrap();
        assert_eq!(parsed, keys);
    }

    #[test]
    fn multisig_rejects_bad_shapes() {
        let keys = test_pubkeys();
        assert!(build_multisig_script(0, &keys).is_err());
        assert!(build_multisig_script(4, &keys).is_err());
        assert!(parse_multisig_pubkeys(Script::from_bytes(&[0x51, 0xae])).is_err());
        assert!(parse_multisig_pubkeys(&build_taproot_pair_script(&pair())).is_err());
    }

    fn pair() -> [XOnlyPublicKey; 2] {
        let secp = Secp256k1::new();
        let [a, b, _] = wallet_xprivs("scripts-pair");
        [
            a.public_key(&secp).x_only_public_key().0,
            b.public_key(&secp).x_only_public_key().0,
        ]
    }

    #[test]
    fn taproot_pair_round_trip() {
        let keys = pair();
        let script = build_taproot_pair_script(&keys);
        assert_eq!(parse_taproot_pair_script(&script).unwrap(), keys);
    }

    #[test]
    fn taproot_pair_rejects_other_shapes() {
        let keys = pair();
        // single-key CHECKSIG
        let script = Builder::new()
            .push_slice(keys[0].serialize())
            .push_opcode(OP_CHECKSIG)
            .into_script();
        assert!(parse_taproot_pair_script(&script).is_err());
        // multisig is not a leaf template
        let multisig = build_multisig_script(2, &test_pubkeys()).unwrap();
        assert!(parse_taproot_pair_script(&multisig).is_err());
    }

    #[test]
    fn p2wpkh_script_code_shape() {
        let program = ScriptBuf::from_bytes([&[0x00, 0x14][..], &[0xab; 20][..]].concat());
        let code = p2wpkh_script_code(&program).unwrap();
        assert_eq!(code.len(), 25);
        assert!(p2wpkh_script_code(Script::from_bytes(&[0x00, 0x20])).is_err());
    }
}
