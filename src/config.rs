use serde::{Deserialize, Serialize};

/// Which address/key encoding a wallet speaks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum NetworkType {
    #[default]
    Mainnet,
    Testnet,
}

impl NetworkType {
    /// Version byte for P2PKH addresses.
    pub fn address_version(&self) -> u8 {
        match self {
            NetworkType::Mainnet => 0x00,
            NetworkType::Testnet => 0x6F,
        }
    }

    /// Version byte for Wallet Import Format private keys.
    pub fn wif_version(&self) -> u8 {
        match self {
            NetworkType::Mainnet => 0x80,
            NetworkType::Testnet => 0xEF,
        }
    }

    pub fn from_address_version(version: u8) -> Option<NetworkType> {
        match version {
            0x00 => Some(NetworkType::Mainnet),
            0x6F => Some(NetworkType::Testnet),
            _ => None,
        }
    }

    pub fn from_wif_version(version: u8) -> Option<NetworkType> {
        match version {
            0x80 => Some(NetworkType::Mainnet),
            0xEF => Some(NetworkType::Testnet),
            _ => None,
        }
    }
}
