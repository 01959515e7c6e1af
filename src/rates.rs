//! Market Rates
//!
//! [`RateSource`] is the engine's view of the market: one quoted rate plus
//! an open/closed flag. [`MarketData`] implements it with a cached ticker
//! map refreshed by a background poll against the upstream exchange API.
//! Any failed refresh, and any quote of exactly zero, closes the market:
//! a zero rate is a sentinel for "no valid quote", never a price, and no
//! order may execute against it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Rate source errors
#[derive(Debug, Error)]
pub enum RateError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no ticker for pair {0}")]
    UnknownPair(String),

    #[error("upstream returned a zero quote for {0}")]
    ZeroQuote(String),
}

/// A quoted rate for one pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    /// Units of fiat per bitcoin. Zero means "no valid quote".
    pub rate: Decimal,
    pub market_open: bool,
}

/// Source of the current market rate.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateSource: Send + Sync {
    /// Current rate for `pair`. A closed market or a zero rate means no
    /// trade is possible.
    async fn current_rate(&self, pair: &str) -> Result<Quote, RateError>;
}

/// Whether orders may currently execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketState {
    Open,
    Closed,
}

/// One cached ticker.
#[derive(Debug, Clone)]
pub struct Ticker {
    pub ask: Decimal,
    pub bid: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Cache {
    tickers: HashMap<String, Ticker>,
    state: Option<MarketState>,
}

/// Cached market data refreshed from an upstream ticker endpoint.
///
/// The market starts closed and only opens after a successful refresh in
/// which every quote is non-zero.
pub struct MarketData {
    client: Client,
    ticker_url: String,
    refresh_interval: Duration,
    cache: Arc<RwLock<Cache>>,
    running: Arc<RwLock<bool>>,
}

impl MarketData {
    pub fn new(
        ticker_url: &str,
        timeout: Duration,
        refresh_interval: Duration,
    ) -> Result<Self, RateError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            ticker_url: ticker_url.to_string(),
            refresh_interval,
            cache: Arc::new(RwLock::new(Cache::default())),
            running: Arc::new(RwLock::new(false)),
        })
    }

    pub async fn market_state(&self) -> MarketState {
        self.cache
            .read()
            .await
            .state
            .unwrap_or(MarketState::Closed)
    }

    /// Pull fresh tickers. Closes the market on any failure or zero quote.
    pub async fn refresh(&self) -> Result<(), RateError> {
        let tickers = match self.fetch_tickers().await {
            Ok(tickers) => tickers,
            Err(e) => {
                warn!("ticker update failed, closing market: {}", e);
                self.close_market().await;
                return Err(e);
            }
        };

        for (pair, ticker) in &tickers {
            if ticker.ask == Decimal::ZERO || ticker.bid == Decimal::ZERO {
                warn!(pair = %pair, "zero quote from upstream, closing market");
                self.close_market().await;
                return Err(RateError::ZeroQuote(pair.clone()));
            }
        }

        let mut cache = self.cache.write().await;
        let was_closed = cache.state != Some(MarketState::Open);
        cache.tickers = tickers;
        cache.state = Some(MarketState::Open);
        if was_closed {
            info!("market open");
        }
        Ok(())
    }

    async fn fetch_tickers(&self) -> Result<HashMap<String, Ticker>, RateError> {
        let resp = self
            .client
            .get(&self.ticker_url)
            .send()
            .await?
            .error_for_status()?;
        let raw: HashMap<String, UpstreamTicker> = resp.json().await?;

        let now = Utc::now();
        Ok(raw
            .into_iter()
            .map(|(pair, t)| {
                (
                    pair,
                    Ticker {
                        ask: t.ask,
                        bid: t.bid,
                        updated_at: now,
                    },
                )
            })
            .collect())
    }

    async fn close_market(&self) {
        let mut cache = self.cache.write().await;
        if cache.state != Some(MarketState::Closed) {
            info!("market closed");
        }
        cache.state = Some(MarketState::Closed);
    }

    /// Run the refresh loop until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        {
            let mut running = self.running.write().await;
            *running = true;
        }

        info!(
            interval_secs = self.refresh_interval.as_secs(),
            "market data service started"
        );

        loop {
            {
                let running = self.running.read().await;
                if !*running {
                    break;
                }
            }

            // Errors already closed the market and were logged.
            let _ = self.refresh().await;

            tokio::time::sleep(self.refresh_interval).await;
        }

        info!("market data service stopped");
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }
}

#[async_trait]
impl RateSource for MarketData {
    async fn current_rate(&self, pair: &str) -> Result<Quote, RateError> {
        let cache = self.cache.read().await;

        if cache.state != Some(MarketState::Open) {
            return Ok(Quote {
                rate: Decimal::ZERO,
                market_open: false,
            });
        }

        let ticker = cache
            .tickers
            .get(pair)
            .ok_or_else(|| RateError::UnknownPair(pair.to_string()))?;

        // Orders buy at the ask.
        Ok(Quote {
            rate: ticker.ask,
            market_open: true,
        })
    }
}

#[derive(Debug, Deserialize)]
struct UpstreamTicker {
    ask: Decimal,
    bid: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_market_starts_closed() {
        let market = MarketData::new(
            "http://localhost:0/tickers",
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
        .unwrap();

        assert_eq!(market.market_state().await, MarketState::Closed);

        let quote = market.current_rate("btcisk").await.unwrap();
        assert!(!quote.market_open);
        assert_eq!(quote.rate, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_market_closed() {
        let market = MarketData::new(
            "http://localhost:0/tickers",
            Duration::from_millis(100),
            Duration::from_secs(60),
        )
        .unwrap();

        assert!(market.refresh().await.is_err());
        assert_eq!(market.market_state().await, MarketState::Closed);
    }
}
