//! Wallet Layer
//!
//! Deterministic per-account key derivation and bitcoin payment
//! construction for the house hot wallet.

pub mod derivation;
pub mod payment;

pub use derivation::{DerivationError, DerivedKey, KeyVault, HOUSE_ACCOUNT_INDEX};
pub use payment::{FeeUrgency, PaymentBuilder, PaymentError, SignedPayment, UnspentCoin};
