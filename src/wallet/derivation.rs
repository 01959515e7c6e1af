//! Per-Account Key Derivation
//!
//! Derives a BIP84 receiving key for each account from the master extended
//! key. The account's derivation index is the only variable path component:
//!
//! ```text
//! m / 84' / coin_type' / account' / 0 / 0
//! ```
//!
//! Derivation is pure and deterministic; keys are recomputed on demand and
//! never persisted. The master key lives only inside [`KeyVault`] and must
//! never be logged or serialized.

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::key::{CompressedPublicKey, Secp256k1};
use bitcoin::secp256k1::All;
use bitcoin::{Address, Network, PrivateKey};
use thiserror::Error;

/// Derivation index reserved for the house hot wallet.
pub const HOUSE_ACCOUNT_INDEX: u32 = 0;

/// BIP84 purpose level.
const PURPOSE: u32 = 84;

/// Derivation errors
#[derive(Debug, Error)]
pub enum DerivationError {
    #[error("derivation index {0} outside the hardened range")]
    InvalidIndex(u32),

    #[error("bip32 derivation failed: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),
}

/// Key material derived for one account.
#[derive(Clone)]
pub struct DerivedKey {
    pub index: u32,
    pub private_key: PrivateKey,
    pub public_key: CompressedPublicKey,
    pub address: Address,
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Private key intentionally omitted.
        f.debug_struct("DerivedKey")
            .field("index", &self.index)
            .field("address", &self.address)
            .finish()
    }
}

/// Holds the master extended key and derives per-account receiving keys.
pub struct KeyVault {
    master: Xpriv,
    network: Network,
    secp: Secp256k1<All>,
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault")
            .field("network", &self.network)
            .finish()
    }
}

impl KeyVault {
    pub fn new(master: Xpriv, network: Network) -> Self {
        Self {
            master,
            network,
            secp: Secp256k1::new(),
        }
    }

    /// Build a vault from raw seed bytes (tests and provisioning).
    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self, DerivationError> {
        let master = Xpriv::new_master(network, seed)?;
        Ok(Self::new(master, network))
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Derive the receiving key for `account_index`.
    ///
    /// Deterministic: the same index always yields the same key. Fails with
    /// `InvalidIndex` if the index cannot be hardened (>= 2^31).
    pub fn derive_receiving_key(&self, account_index: u32) -> Result<DerivedKey, DerivationError> {
        let account = ChildNumber::from_hardened_idx(account_index)
            .map_err(|_| DerivationError::InvalidIndex(account_index))?;

        let coin_type = match self.network {
            Network::Bitcoin => 0,
            _ => 1,
        };

        let path = DerivationPath::from(vec![
            ChildNumber::from_hardened_idx(PURPOSE).expect("constant in range"),
            ChildNumber::from_hardened_idx(coin_type).expect("constant in range"),
            account,
            ChildNumber::from_normal_idx(0).expect("constant in range"),
            ChildNumber::from_normal_idx(0).expect("constant in range"),
        ]);

        let derived = self.master.derive_priv(&self.secp, &path)?;
        let private_key = derived.to_priv();
        let public_key = CompressedPublicKey::from_private_key(&self.secp, &private_key)
            .expect("bip32 keys are compressed");
        let address = Address::p2wpkh(&public_key, self.network);

        Ok(DerivedKey {
            index: account_index,
            private_key,
            public_key,
            address,
        })
    }

    /// Receiving key of the house hot wallet (index 0).
    pub fn house_key(&self) -> Result<DerivedKey, DerivationError> {
        self.derive_receiving_key(HOUSE_ACCOUNT_INDEX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> KeyVault {
        KeyVault::from_seed(&[7u8; 32], Network::Testnet).unwrap()
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let vault = vault();
        let a = vault.derive_receiving_key(42).unwrap();
        let b = vault.derive_receiving_key(42).unwrap();
        assert_eq!(a.address, b.address);
        assert_eq!(a.private_key.to_bytes(), b.private_key.to_bytes());
    }

    #[test]
    fn test_different_indexes_yield_different_addresses() {
        let vault = vault();
        let a = vault.derive_receiving_key(1).unwrap();
        let b = vault.derive_receiving_key(2).unwrap();
        assert_ne!(a.address, b.address);
    }

    #[test]
    fn test_index_outside_hardened_range() {
        let vault = vault();
        let result = vault.derive_receiving_key(1 << 31);
        assert!(matches!(result, Err(DerivationError::InvalidIndex(_))));
    }

    #[test]
    fn test_house_key_is_index_zero() {
        let vault = vault();
        let house = vault.house_key().unwrap();
        let zero = vault.derive_receiving_key(0).unwrap();
        assert_eq!(house.address, zero.address);
    }

    #[test]
    fn test_debug_never_prints_key_material() {
        let vault = vault();
        let key = vault.derive_receiving_key(1).unwrap();
        let rendered = format!("{:?} {:?}", vault, key);
        let wif = key.private_key.to_wif();
        assert!(!rendered.contains(&wif));
    }
}
