//! Crate-wide error type.
//!
//! Every fallible operation in this crate reports one of five kinds of
//! failure, so callers can tell malformed bytes apart from well-formed
//! transactions that simply do not fit the supported script shapes, and
//! signature mismatches apart from missing signatures.

use std::fmt;

use crate::bitcoin::consensus::encode;
use crate::bitcoin::psbt;

#[derive(Debug)]
pub enum Error {
    /// Raw bytes could not be parsed (consensus encoding, PSBT key-value
    /// maps, DER signatures, control blocks).
    Decode(String),
    /// Well-formed input that does not match a supported shape: unknown
    /// witness layout, a multisig script without exactly three keys, a leaf
    /// script that is not the two-key template.
    Structural(String),
    /// A signature verified against none of the candidate keys.
    SignatureMismatch(String),
    /// Operation not allowed in the current container state: mutating a
    /// script after a signature exists, finalizing with zero inputs, a
    /// sighash type outside the caller's whitelist.
    State(String),
    /// Recognized but deliberately unsupported: taproot annex, taproot key
    /// path signing, Zcash digests.
    Unsupported(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Decode(msg) => write!(f, "decode error: {}", msg),
            Error::Structural(msg) => write!(f, "structural error: {}", msg),
            Error::SignatureMismatch(msg) => write!(f, "signature mismatch: {}", msg),
            Error::State(msg) => write!(f, "state error: {}", msg),
            Error::Unsupported(msg) => write!(f, "unsupported: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<encode::Error> for Error {
    fn from(e: encode::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<psbt::Error> for Error {
    fn from(e: psbt::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<crate::bitcoin::io::Error> for Error {
    fn from(e: crate::bitcoin::io::Error) -> Self {
        Error::Decode(e.to_string())
    }
}
