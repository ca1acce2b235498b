//! Supported networks and their chain-level parameters.
//!
//! Every network maps onto one of three serialization families: the plain
//! Bitcoin format, the Dash format (type and extra payload packed around the
//! version field), or the Zcash format (overwintered header and trailing
//! Sapling fields). Signing parameters (fork id, digest variant) hang off the
//! network as well so the PSBT layer never matches on network names directly.

use std::fmt;

/// A supported network, mainnet or testnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Bitcoin,
    BitcoinTestnet,
    BitcoinCash,
    BitcoinCashTestnet,
    BitcoinGold,
    BitcoinGoldTestnet,
    BitcoinSV,
    BitcoinSVTestnet,
    Ecash,
    EcashTestnet,
    Dash,
    DashTestnet,
    Dogecoin,
    DogecoinTestnet,
    Litecoin,
    LitecoinTestnet,
    Zcash,
    ZcashTestnet,
}

/// The serialization family a network's transactions follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFamily {
    Bitcoin,
    Dash,
    Zcash,
}

/// Which sighash algorithm legacy (pre-taproot) inputs use on a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SighashVariant {
    /// Original Bitcoin digest.
    Legacy,
    /// BIP143-style digest with the FORKID bit and a fork id folded into the
    /// sighash type (Bitcoin Cash, eCash, Bitcoin SV, Bitcoin Gold).
    ForkId(u32),
    /// ZIP-243 digest. Recognized but not computed by this crate.
    Zcash,
}

impl Network {
    pub const ALL: &'static [Network] = &[
        Network::Bitcoin,
        Network::BitcoinTestnet,
        Network::BitcoinCash,
        Network::BitcoinCashTestnet,
        Network::BitcoinGold,
        Network::BitcoinGoldTestnet,
        Network::BitcoinSV,
        Network::BitcoinSVTestnet,
        Network::Ecash,
        Network::EcashTestnet,
        Network::Dash,
        Network::DashTestnet,
        Network::Dogecoin,
        Network::DogecoinTestnet,
        Network::Litecoin,
        Network::LitecoinTestnet,
        Network::Zcash,
        Network::ZcashTestnet,
    ];

    /// The mainnet counterpart of this network (identity for mainnets).
    pub fn mainnet(self) -> Network {
        match self {
            Network::Bitcoin | Network::BitcoinTestnet => Network::Bitcoin,
            Network::BitcoinCash | Network::BitcoinCashTestnet => Network::BitcoinCash,
            Network::BitcoinGold | Network::BitcoinGoldTestnet => Network::BitcoinGold,
            Network::BitcoinSV | Network::BitcoinSVTestnet => Network::BitcoinSV,
            Network::Ecash | Network::EcashTestnet => Network::Ecash,
            Network::Dash | Network::DashTestnet => Network::Dash,
            Network::Dogecoin | Network::DogecoinTestnet => Network::Dogecoin,
            Network::Litecoin | Network::LitecoinTestnet => Network::Litecoin,
            Network::Zcash | Network::ZcashTestnet => Network::Zcash,
        }
    }

    pub fn is_testnet(self) -> bool {
        !matches!(
            self,
            Network::Bitcoin
                | Network::BitcoinCash
                | Network::BitcoinGold
                | Network::BitcoinSV
                | Network::Ecash
                | Network::Dash
                | Network::Dogecoin
                | Network::Litecoin
                | Network::Zcash
        )
    }

    pub fn family(self) -> ChainFamily {
        match self.mainnet() {
            Network::Dash => ChainFamily::Dash,
            Network::Zcash => ChainFamily::Zcash,
            _ => ChainFamily::Bitcoin,
        }
    }

    /// The transaction version new transactions are built with.
    pub fn default_transaction_version(self) -> i32 {
        match self.mainnet() {
            Network::BitcoinCash | Network::BitcoinSV | Network::BitcoinGold | Network::Ecash => 2,
            Network::Zcash => 4,
            _ => 1,
        }
    }

    /// The fork id folded into the sighash type on BIP143-with-FORKID chains.
    pub fn fork_id(self) -> Option<u32> {
        match self.mainnet() {
            Network::BitcoinCash | Network::BitcoinSV | Network::Ecash => Some(0),
            Network::BitcoinGold => Some(79),
            _ => None,
        }
    }

    pub fn sighash_variant(self) -> SighashVariant {
        if let Some(fork_id) = self.fork_id() {
            return SighashVariant::ForkId(fork_id);
        }
        match self.family() {
            ChainFamily::Zcash => SighashVariant::Zcash,
            _ => SighashVariant::Legacy,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Bitcoin => "bitcoin",
            Network::BitcoinTestnet => "bitcoinTestnet",
            Network::BitcoinCash => "bitcoincash",
            Network::BitcoinCashTestnet => "bitcoincashTestnet",
            Network::BitcoinGold => "bitcoingold",
            Network::BitcoinGoldTestnet => "bitcoingoldTestnet",
            Network::BitcoinSV => "bitcoinsv",
            Network::BitcoinSVTestnet => "bitcoinsvTestnet",
            Network::Ecash => "ecash",
            Network::EcashTestnet => "ecashTestnet",
            Network::Dash => "dash",
            Network::DashTestnet => "dashTestnet",
            Network::Dogecoin => "dogecoin",
            Network::DogecoinTestnet => "dogecoinTestnet",
            Network::Litecoin => "litecoin",
            Network::LitecoinTestnet => "litecoinTestnet",
            Network::Zcash => "zcash",
            Network::ZcashTestnet => "zcashTestnet",
        };
        write!(f, "{}", name)
    }
}
