//! Hierarchical signer contract.
//!
//! Signing walks BIP32 derivation entries recorded in the PSBT: an entry
//! whose master fingerprint matches the signer is resolved by deriving a
//! child signer along the recorded path and checking the derived public key
//! against the recorded one. [`Xpriv`] is the stock implementation; anything
//! that can derive children and produce ECDSA and Schnorr signatures over a
//! digest can stand in for it (hardware wallets, remote signers).

use crate::bitcoin::bip32::{DerivationPath, Fingerprint, Xpriv};
use crate::bitcoin::key::Secp256k1;
use crate::bitcoin::secp256k1::{self, All, Message};
use crate::error::Error;

pub trait HdSigner: Sized {
    /// Fingerprint of this signer's key, matched against the master
    /// fingerprint of recorded derivation entries.
    fn fingerprint(&self, secp: &Secp256k1<All>) -> Fingerprint;

    fn public_key(&self, secp: &Secp256k1<All>) -> secp256k1::PublicKey;

    /// Derive the child signer for a recorded derivation path.
    fn derive_path(&self, secp: &Secp256k1<All>, path: &DerivationPath) -> Result<Self, Error>;

    fn sign_ecdsa(&self, secp: &Secp256k1<All>, msg: &Message) -> secp256k1::ecdsa::Signature;

    fn sign_schnorr(&self, secp: &Secp256k1<All>, msg: &Message) -> secp256k1::schnorr::Signature;
}

impl HdSigner for Xpriv {
    fn fingerprint(&self, secp: &Secp256k1<All>) -> Fingerprint {
        Xpriv::fingerprint(self, secp)
    }

    fn public_key(&self, secp: &Secp256k1<All>) -> secp256k1::PublicKey {
        self.private_key.public_key(secp)
    }

    fn derive_path(&self, secp: &Secp256k1<All>, path: &DerivationPath) -> Result<Self, Error> {
        self.derive_priv(secp, path)
            .map_err(|e| Error::Structural(format!("key derivation failed: {}", e)))
    }

    fn sign_ecdsa(&self, secp: &Secp256k1<All>, msg: &Message) -> secp256k1::ecdsa::Signature {
        secp.sign_ecdsa(msg, &self.private_key)
    }

    fn sign_schnorr(&self, secp: &Secp256k1<All>, msg: &Message) -> secp256k1::schnorr::Signature {
        // deterministic signatures keep fixture-style tests byte-stable
        secp.sign_schnorr_no_aux_rand(msg, &self.to_keypair(secp))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bitcoin::hashes::{sha256, Hash};
    use crate::bitcoin::Network as BitcoinNetwork;
    use std::str::FromStr;

    pub fn xpriv_from_seed(seed: &str) -> Xpriv {
        let seed_hash = sha256::Hash::hash(seed.as_bytes()).to_byte_array();
        Xpriv::new_master(BitcoinNetwork::Testnet, &seed_hash)
            .expect("could not create xpriv from seed")
    }

    /// Three deterministic wallet keys, in the fixed key order used by
    /// multisig scripts throughout the tests.
    pub fn wallet_xprivs(seed: &str) -> [Xpriv; 3] {
        [
            xpriv_from_seed(&format!("{}/0", seed)),
            xpriv_from_seed(&format!("{}/1", seed)),
            xpriv_from_seed(&format!("{}/2", seed)),
        ]
    }

    #[test]
    fn derive_path_matches_xpub_derivation() {
        let secp = Secp256k1::new();
        let xpriv = xpriv_from_seed("hd-signer");
        let path = DerivationPath::from_str("m/0/5").unwrap();
        let child = HdSigner::derive_path(&xpriv, &secp, &path).unwrap();
        let expected = xpriv.derive_priv(&secp, &path).unwrap();
        assert_eq!(
            HdSigner::public_key(&child, &secp),
            expected.private_key.public_key(&secp)
        );
    }

    #[test]
    fn schnorr_signing_is_deterministic() {
        let secp = Secp256k1::new();
        let xpriv = xpriv_from_seed("schnorr");
        let msg = Message::from_digest([7u8; 32]);
        assert_eq!(
            xpriv.sign_schnorr(&secp, &msg),
            xpriv.sign_schnorr(&secp, &msg)
        );
    }
}
