//! Payment Builder
//!
//! Builds, signs, and validates P2WPKH payout transactions for the house
//! hot wallet. The builder never broadcasts: callers get back a fully
//! signed, structurally validated transaction and decide separately
//! whether to hand it to the node. That split is what makes the
//! affordability pre-check possible (build-and-validate, then throw the
//! result away).
//!
//! All amounts in this module are integer satoshis (`bitcoin::Amount`).
//! No floating point is allowed anywhere on this path.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::key::{CompressedPublicKey, Secp256k1};
use bitcoin::secp256k1::{All, Message};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use thiserror::Error;

use super::derivation::DerivedKey;

/// Dust threshold below which change is absorbed into the fee.
const DUST_LIMIT_SATS: u64 = 546;

/// Approximate virtual sizes for fee estimation.
const TX_OVERHEAD_VBYTES: u64 = 11;
const P2WPKH_INPUT_VBYTES: u64 = 68;
const P2WPKH_OUTPUT_VBYTES: u64 = 31;

/// Payment construction errors
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("insufficient funds: need {required} sats, have {available} sats")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("zero payment amount")]
    ZeroAmount,

    #[error("transaction invalid: {0}")]
    TransactionInvalid(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("value overflow while summing amounts")]
    ValueOverflow,
}

/// How quickly the payout should confirm. Maps to the fee estimator's
/// confirmation-target window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeUrgency {
    /// Routine customer payout
    Routine,
    /// Operator-initiated transfer
    Priority,
}

impl FeeUrgency {
    pub fn target_blocks(&self) -> u16 {
        match self {
            Self::Routine => 36,
            Self::Priority => 8,
        }
    }
}

/// A spendable output, sourced fresh from the node per payment attempt.
/// Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentCoin {
    pub outpoint: OutPoint,
    pub amount: Amount,
    pub confirmations: u32,
    pub script_pubkey: ScriptBuf,
}

/// A signed, validated transaction ready for broadcast.
#[derive(Debug, Clone)]
pub struct SignedPayment {
    pub tx: Transaction,
    pub txid: Txid,
    /// Amount delivered to the receiver
    pub amount: Amount,
    /// Implicit fee (inputs minus outputs)
    pub fee: Amount,
    /// Change returned to the sender, zero if absorbed
    pub change: Amount,
}

/// Builds and signs payout transactions.
pub struct PaymentBuilder {
    network: Network,
    secp: Secp256k1<All>,
}

impl PaymentBuilder {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            secp: Secp256k1::new(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Estimated fee in satoshis for a transaction shape at `rate` sat/vB.
    pub fn estimate_fee(&self, rate_sat_vb: u64, inputs: usize, outputs: usize) -> u64 {
        let vsize = TX_OVERHEAD_VBYTES
            + P2WPKH_INPUT_VBYTES * inputs as u64
            + P2WPKH_OUTPUT_VBYTES * outputs as u64;
        vsize * rate_sat_vb
    }

    /// Parse and network-check a receiver address.
    pub fn parse_address(&self, address: &str) -> Result<Address, PaymentError> {
        address
            .parse::<Address<_>>()
            .map_err(|e| PaymentError::TransactionInvalid(format!("bad address: {}", e)))?
            .require_network(self.network)
            .map_err(|e| PaymentError::TransactionInvalid(format!("bad address: {}", e)))
    }

    /// Build, sign, and validate a payment of `amount` to `receiver`.
    ///
    /// Coin selection is first-fit: coins are consumed in the given order
    /// until they cover `amount` plus the estimated fee. The transaction
    /// has one payment output and, unless it would be dust, one change
    /// output returning the remainder to the sender's own address.
    pub fn build_payment(
        &self,
        sender: &DerivedKey,
        coins: &[UnspentCoin],
        receiver: &Address,
        amount: Amount,
        fee_rate_sat_vb: u64,
    ) -> Result<SignedPayment, PaymentError> {
        if amount == Amount::ZERO {
            return Err(PaymentError::ZeroAmount);
        }

        let total_available = sum_amounts(coins.iter().map(|c| c.amount))?;
        if total_available < amount {
            return Err(PaymentError::InsufficientFunds {
                required: amount.to_sat(),
                available: total_available.to_sat(),
            });
        }

        // First-fit selection, re-estimating the fee as inputs accumulate.
        let mut selected: Vec<UnspentCoin> = Vec::new();
        let mut total = Amount::ZERO;
        let mut fee = Amount::ZERO;
        let mut covered = false;

        for coin in coins {
            selected.push(coin.clone());
            total = total
                .checked_add(coin.amount)
                .ok_or(PaymentError::ValueOverflow)?;
            fee = Amount::from_sat(self.estimate_fee(fee_rate_sat_vb, selected.len(), 2));

            let required = amount.checked_add(fee).ok_or(PaymentError::ValueOverflow)?;
            if total >= required {
                covered = true;
                break;
            }
        }

        if !covered {
            let required = amount.checked_add(fee).ok_or(PaymentError::ValueOverflow)?;
            return Err(PaymentError::InsufficientFunds {
                required: required.to_sat(),
                available: total_available.to_sat(),
            });
        }

        let mut change = total
            .checked_sub(amount)
            .and_then(|r| r.checked_sub(fee))
            .ok_or(PaymentError::ValueOverflow)?;

        let mut outputs = vec![TxOut {
            value: amount,
            script_pubkey: receiver.script_pubkey(),
        }];

        if change.to_sat() >= DUST_LIMIT_SATS {
            outputs.push(TxOut {
                value: change,
                script_pubkey: sender.address.script_pubkey(),
            });
        } else {
            // Dust change is cheaper to burn as fee than to carry.
            fee = fee.checked_add(change).ok_or(PaymentError::ValueOverflow)?;
            change = Amount::ZERO;
        }

        let inputs: Vec<TxIn> = selected
            .iter()
            .map(|coin| TxIn {
                previous_output: coin.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect();

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs,
            output: outputs,
        };

        self.sign(&mut tx, sender, &selected)?;
        self.validate(&tx, &selected)?;

        let txid = tx.compute_txid();
        Ok(SignedPayment {
            tx,
            txid,
            amount,
            fee,
            change,
        })
    }

    /// Sign every input with the sender's key (all inputs are the
    /// sender's own P2WPKH outputs).
    fn sign(
        &self,
        tx: &mut Transaction,
        sender: &DerivedKey,
        spent: &[UnspentCoin],
    ) -> Result<(), PaymentError> {
        let mut witnesses = Vec::with_capacity(spent.len());
        {
            let mut cache = SighashCache::new(&*tx);
            for (index, coin) in spent.iter().enumerate() {
                let sighash = cache
                    .p2wpkh_signature_hash(
                        index,
                        &coin.script_pubkey,
                        coin.amount,
                        EcdsaSighashType::All,
                    )
                    .map_err(|e| PaymentError::SigningFailed(e.to_string()))?;

                let message = Message::from_digest(sighash.to_byte_array());
                let signature = self.secp.sign_ecdsa(&message, &sender.private_key.inner);
                let signature = bitcoin::ecdsa::Signature {
                    signature,
                    sighash_type: EcdsaSighashType::All,
                };
                witnesses.push(Witness::p2wpkh(&signature, &sender.public_key.0));
            }
        }

        for (input, witness) in tx.input.iter_mut().zip(witnesses) {
            input.witness = witness;
        }
        Ok(())
    }

    /// Structural validation of a fully built transaction.
    ///
    /// Checks: not a coinbase, no value overflow, outputs never exceed
    /// inputs, every input's witness carries a signature that verifies
    /// against the spent output's script.
    pub fn validate(&self, tx: &Transaction, spent: &[UnspentCoin]) -> Result<(), PaymentError> {
        if tx.is_coinbase() {
            return Err(PaymentError::TransactionInvalid(
                "coinbase transaction".to_string(),
            ));
        }

        if tx.input.len() != spent.len() {
            return Err(PaymentError::TransactionInvalid(format!(
                "{} inputs but {} spent coins",
                tx.input.len(),
                spent.len()
            )));
        }

        let total_in = sum_amounts(spent.iter().map(|c| c.amount))?;
        let total_out = sum_amounts(tx.output.iter().map(|o| o.value))?;
        if total_out > total_in {
            return Err(PaymentError::TransactionInvalid(format!(
                "outputs {} exceed inputs {}",
                total_out.to_sat(),
                total_in.to_sat()
            )));
        }

        let mut cache = SighashCache::new(tx);
        for (index, (input, coin)) in tx.input.iter().zip(spent).enumerate() {
            let sig_bytes = input.witness.nth(0).ok_or_else(|| {
                PaymentError::TransactionInvalid(format!("input {} missing signature", index))
            })?;
            let pk_bytes = input.witness.nth(1).ok_or_else(|| {
                PaymentError::TransactionInvalid(format!("input {} missing pubkey", index))
            })?;

            let signature = bitcoin::ecdsa::Signature::from_slice(sig_bytes).map_err(|e| {
                PaymentError::TransactionInvalid(format!("input {}: {}", index, e))
            })?;
            let pubkey = bitcoin::secp256k1::PublicKey::from_slice(pk_bytes).map_err(|e| {
                PaymentError::TransactionInvalid(format!("input {}: {}", index, e))
            })?;

            let expected_spk = ScriptBuf::new_p2wpkh(&CompressedPublicKey(pubkey).wpubkey_hash());
            if coin.script_pubkey != expected_spk {
                return Err(PaymentError::TransactionInvalid(format!(
                    "input {} witness key does not match spent output",
                    index
                )));
            }

            let sighash = cache
                .p2wpkh_signature_hash(index, &coin.script_pubkey, coin.amount, signature.sighash_type)
                .map_err(|e| PaymentError::TransactionInvalid(e.to_string()))?;
            let message = Message::from_digest(sighash.to_byte_array());

            self.secp
                .verify_ecdsa(&message, &signature.signature, &pubkey)
                .map_err(|_| {
                    PaymentError::TransactionInvalid(format!(
                        "input {} signature does not verify",
                        index
                    ))
                })?;
        }

        Ok(())
    }
}

fn sum_amounts(amounts: impl Iterator<Item = Amount>) -> Result<Amount, PaymentError> {
    let mut total = Amount::ZERO;
    for amount in amounts {
        total = total
            .checked_add(amount)
            .ok_or(PaymentError::ValueOverflow)?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::derivation::KeyVault;
    use std::str::FromStr;

    fn sender() -> DerivedKey {
        KeyVault::from_seed(&[1u8; 32], Network::Testnet)
            .unwrap()
            .house_key()
            .unwrap()
    }

    fn receiver() -> Address {
        KeyVault::from_seed(&[2u8; 32], Network::Testnet)
            .unwrap()
            .derive_receiving_key(5)
            .unwrap()
            .address
    }

    fn coin(sender: &DerivedKey, vout: u32, sats: u64) -> UnspentCoin {
        let txid =
            Txid::from_str("1111111111111111111111111111111111111111111111111111111111111111")
                .unwrap();
        UnspentCoin {
            outpoint: OutPoint::new(txid, vout),
            amount: Amount::from_sat(sats),
            confirmations: 6,
            script_pubkey: sender.address.script_pubkey(),
        }
    }

    #[test]
    fn test_insufficient_funds_before_any_selection() {
        let builder = PaymentBuilder::new(Network::Testnet);
        let sender = sender();
        let coins = vec![coin(&sender, 0, 10_000)];

        let result =
            builder.build_payment(&sender, &coins, &receiver(), Amount::from_sat(20_000), 1);
        assert!(matches!(
            result,
            Err(PaymentError::InsufficientFunds { required: 20_000, available: 10_000 })
        ));
    }

    #[test]
    fn test_builds_payment_with_change() {
        let builder = PaymentBuilder::new(Network::Testnet);
        let sender = sender();
        let coins = vec![coin(&sender, 0, 50_000), coin(&sender, 1, 70_000)];

        let payment = builder
            .build_payment(&sender, &coins, &receiver(), Amount::from_sat(60_000), 1)
            .unwrap();

        // First coin alone cannot cover amount + fee, so both are selected.
        assert_eq!(payment.tx.input.len(), 2);
        assert_eq!(payment.tx.output.len(), 2);
        assert_eq!(payment.tx.output[0].value, Amount::from_sat(60_000));
        assert_eq!(payment.tx.output[1].script_pubkey, sender.address.script_pubkey());

        // Fee is implicit: inputs minus outputs.
        let total_out: u64 = payment.tx.output.iter().map(|o| o.value.to_sat()).sum();
        assert_eq!(120_000 - total_out, payment.fee.to_sat());
        assert_eq!(payment.fee.to_sat(), builder.estimate_fee(1, 2, 2));
    }

    #[test]
    fn test_first_fit_stops_when_covered() {
        let builder = PaymentBuilder::new(Network::Testnet);
        let sender = sender();
        let coins = vec![coin(&sender, 0, 100_000), coin(&sender, 1, 100_000)];

        let payment = builder
            .build_payment(&sender, &coins, &receiver(), Amount::from_sat(40_000), 1)
            .unwrap();
        assert_eq!(payment.tx.input.len(), 1);
    }

    #[test]
    fn test_dust_change_absorbed_into_fee() {
        let builder = PaymentBuilder::new(Network::Testnet);
        let sender = sender();
        // fee(1 input, 2 outputs) at 1 sat/vB = 141 sats; change would be 359.
        let coins = vec![coin(&sender, 0, 60_500)];

        let payment = builder
            .build_payment(&sender, &coins, &receiver(), Amount::from_sat(60_000), 1)
            .unwrap();

        assert_eq!(payment.tx.output.len(), 1);
        assert_eq!(payment.change, Amount::ZERO);
        assert_eq!(payment.fee, Amount::from_sat(500));
    }

    #[test]
    fn test_zero_amount_rejected() {
        let builder = PaymentBuilder::new(Network::Testnet);
        let sender = sender();
        let coins = vec![coin(&sender, 0, 10_000)];

        let result = builder.build_payment(&sender, &coins, &receiver(), Amount::ZERO, 1);
        assert!(matches!(result, Err(PaymentError::ZeroAmount)));
    }

    #[test]
    fn test_validate_rejects_tampered_outputs() {
        let builder = PaymentBuilder::new(Network::Testnet);
        let sender = sender();
        let coins = vec![coin(&sender, 0, 100_000)];

        let payment = builder
            .build_payment(&sender, &coins, &receiver(), Amount::from_sat(40_000), 1)
            .unwrap();

        let mut tampered = payment.tx.clone();
        tampered.output[0].value = Amount::from_sat(40_001);

        let spent: Vec<_> = coins[..1].to_vec();
        assert!(builder.validate(&tampered, &spent).is_err());
    }

    #[test]
    fn test_validate_rejects_inflated_outputs() {
        let builder = PaymentBuilder::new(Network::Testnet);
        let sender = sender();
        let coins = vec![coin(&sender, 0, 100_000)];

        let payment = builder
            .build_payment(&sender, &coins, &receiver(), Amount::from_sat(40_000), 1)
            .unwrap();

        let mut tampered = payment.tx.clone();
        tampered.output[0].value = Amount::from_sat(200_000);

        let result = builder.validate(&tampered, &coins);
        assert!(matches!(result, Err(PaymentError::TransactionInvalid(_))));
    }

    #[test]
    fn test_signed_payment_verifies() {
        let builder = PaymentBuilder::new(Network::Testnet);
        let sender = sender();
        let coins = vec![coin(&sender, 0, 100_000)];

        let payment = builder
            .build_payment(&sender, &coins, &receiver(), Amount::from_sat(40_000), 2)
            .unwrap();
        assert!(builder.validate(&payment.tx, &coins).is_ok());
        assert_eq!(payment.txid, payment.tx.compute_txid());
    }

    #[test]
    fn test_fee_urgency_targets() {
        assert_eq!(FeeUrgency::Routine.target_blocks(), 36);
        assert_eq!(FeeUrgency::Priority.target_blocks(), 8);
    }
}
