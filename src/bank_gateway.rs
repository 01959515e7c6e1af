//! Banking Collaborator
//!
//! [`BankGateway`] wraps the bank's integration API: pulling today's
//! settled incoming transactions for reconciliation, and instructing
//! outgoing fiat payments for withdrawals. The bank exposes no event feed,
//! so deposits are polled.
//!
//! `fetch_todays_transactions` distinguishes "no statement data available
//! today" (`None`) from a normal zero-transaction day (`Some(vec![])`);
//! only the former is worth a warning.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::types::BankTransaction;

/// Bank gateway errors
#[derive(Debug, Error)]
pub enum BankError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bank rejected the payment: {0}")]
    PaymentRejected(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Interface to the banking collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BankGateway: Send + Sync {
    /// Today's settled incoming transactions. `None` means the bank had no
    /// statement data to give, which is not an error.
    async fn fetch_todays_transactions(&self) -> Result<Option<Vec<BankTransaction>>, BankError>;

    /// Pay `amount` to `account_number`, returning the bank's reference id.
    async fn pay(
        &self,
        account_number: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<String, BankError>;
}

/// HTTP implementation against the bank's integration API.
pub struct HttpBankGateway {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpBankGateway {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, BankError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

impl std::fmt::Debug for HttpBankGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Credentials intentionally omitted.
        f.debug_struct("HttpBankGateway")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl BankGateway for HttpBankGateway {
    async fn fetch_todays_transactions(&self) -> Result<Option<Vec<BankTransaction>>, BankError> {
        let url = format!("{}/statements/today", self.base_url);
        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?
            .error_for_status()?;

        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let transactions: Vec<BankTransaction> = resp.json().await?;
        Ok(Some(transactions))
    }

    async fn pay(
        &self,
        account_number: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<String, BankError> {
        let url = format!("{}/payments", self.base_url);
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&PaymentRequest {
                account_number,
                amount,
                reference,
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(BankError::PaymentRejected(error_text));
        }

        let receipt: serde_json::Value = resp.json().await?;
        receipt
            .get("reference")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                BankError::UnexpectedResponse("payment receipt missing reference".to_string())
            })
    }
}

#[derive(Debug, Serialize)]
struct PaymentRequest<'a> {
    account_number: &'a str,
    amount: Decimal,
    reference: &'a str,
}
