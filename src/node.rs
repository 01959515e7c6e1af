//! Bitcoin Node Access
//!
//! [`UtxoSource`] abstracts the three node operations the engine needs:
//! listing spendable outputs, estimating a fee rate for a confirmation
//! target, and broadcasting a signed transaction. [`EsploraNode`] is the
//! production implementation against an Esplora HTTP API. Every request
//! carries a bounded timeout; a timed-out call surfaces as an error the
//! callers treat like any other unavailable upstream.

use async_trait::async_trait;
use bitcoin::{Address, Amount, OutPoint, Transaction, Txid};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::wallet::UnspentCoin;

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),

    #[error("no fee estimate for target {0}")]
    NoFeeEstimate(u16),

    #[error("parse error: {0}")]
    Parse(String),
}

/// Interface to a bitcoin full node or indexer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UtxoSource: Send + Sync {
    /// Spendable outputs of `address` with at least `min_confirmations`.
    async fn list_unspent(
        &self,
        address: &Address,
        min_confirmations: u32,
    ) -> Result<Vec<UnspentCoin>, NodeError>;

    /// Fee rate in sat/vB expected to confirm within `target_blocks`.
    async fn estimate_fee_rate(&self, target_blocks: u16) -> Result<u64, NodeError>;

    /// Broadcast a signed transaction, returning its txid.
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, NodeError>;
}

/// Esplora-backed node client.
#[derive(Debug, Clone)]
pub struct EsploraNode {
    client: Client,
    base_url: String,
}

impl EsploraNode {
    /// Create a client against `base_url` with per-request `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, NodeError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Current chain tip height.
    pub async fn tip_height(&self) -> Result<u64, NodeError> {
        let url = format!("{}/blocks/tip/height", self.base_url);
        let resp = self.client.get(&url).send().await?.error_for_status()?;
        resp.text()
            .await?
            .trim()
            .parse()
            .map_err(|e| NodeError::Parse(format!("invalid tip height: {}", e)))
    }

    /// Confirmed balance of an address, summed over its UTXOs.
    pub async fn address_balance(&self, address: &Address) -> Result<Amount, NodeError> {
        let coins = self.list_unspent(address, 1).await?;
        let mut total = Amount::ZERO;
        for coin in coins {
            total = total
                .checked_add(coin.amount)
                .ok_or_else(|| NodeError::Parse("utxo sum overflow".to_string()))?;
        }
        Ok(total)
    }
}

#[async_trait]
impl UtxoSource for EsploraNode {
    async fn list_unspent(
        &self,
        address: &Address,
        min_confirmations: u32,
    ) -> Result<Vec<UnspentCoin>, NodeError> {
        let url = format!("{}/address/{}/utxo", self.base_url, address);
        let resp = self.client.get(&url).send().await?.error_for_status()?;
        let raw: Vec<EsploraUtxo> = resp.json().await?;

        let tip = self.tip_height().await?;
        let script_pubkey = address.script_pubkey();

        let mut coins = Vec::new();
        for utxo in raw {
            let confirmations = match utxo.status.block_height {
                Some(height) if utxo.status.confirmed => {
                    (tip.saturating_sub(height) + 1) as u32
                }
                _ => 0,
            };
            if confirmations < min_confirmations {
                continue;
            }

            let txid = Txid::from_str(&utxo.txid)
                .map_err(|e| NodeError::Parse(format!("invalid txid: {}", e)))?;

            coins.push(UnspentCoin {
                outpoint: OutPoint::new(txid, utxo.vout),
                amount: Amount::from_sat(utxo.value),
                confirmations,
                script_pubkey: script_pubkey.clone(),
            });
        }

        Ok(coins)
    }

    async fn estimate_fee_rate(&self, target_blocks: u16) -> Result<u64, NodeError> {
        let url = format!("{}/fee-estimates", self.base_url);
        let resp = self.client.get(&url).send().await?.error_for_status()?;
        let estimates: HashMap<String, f64> = resp.json().await?;

        pick_fee_rate(&estimates, target_blocks).ok_or(NodeError::NoFeeEstimate(target_blocks))
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, NodeError> {
        let tx_hex = bitcoin::consensus::encode::serialize_hex(tx);
        let url = format!("{}/tx", self.base_url);
        let resp = self.client.post(&url).body(tx_hex).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(NodeError::BroadcastRejected(error_text));
        }

        let txid = resp.text().await?;
        Txid::from_str(txid.trim())
            .map_err(|e| NodeError::Parse(format!("invalid txid from broadcast: {}", e)))
    }
}

/// Pick the estimate for the closest confirmation target at or below the
/// requested one. Esplora keys the estimate map by target block count.
fn pick_fee_rate(estimates: &HashMap<String, f64>, target_blocks: u16) -> Option<u64> {
    let mut best: Option<(u16, f64)> = None;
    for (key, rate) in estimates {
        let Ok(target) = key.parse::<u16>() else {
            continue;
        };
        if target <= target_blocks {
            match best {
                Some((t, _)) if t >= target => {}
                _ => best = Some((target, *rate)),
            }
        }
    }

    // Float exists only at the API edge; round up to whole sat/vB.
    best.map(|(_, rate)| (rate.ceil() as u64).max(1))
}

// =============================================================================
// Esplora API Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    value: u64,
    status: EsploraUtxoStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraUtxoStatus {
    confirmed: bool,
    block_height: Option<u64>,
}
