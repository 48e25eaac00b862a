//! Balance source backed by a wallet server's REST API.
//!
//! Queries `GET {base}/wallets/{walletID}` and reads the available quantity:
//!
//! ```json
//! { "balance": { "available": { "quantity": 420133769, "unit": "lovelace" } } }
//! ```

use crate::domain::account::Account;
use crate::domain::ports::BalanceSource;
use crate::error::{BalanceQueryError, PaymentError, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct WalletResponse {
    balance: WalletBalance,
}

#[derive(Debug, Deserialize)]
struct WalletBalance {
    available: Quantity,
}

#[derive(Debug, Deserialize)]
struct Quantity {
    quantity: i64,
    unit: String,
}

const LOVELACE: &str = "lovelace";

/// Reads on-chain balances from a wallet server.
pub struct WalletBalanceSource {
    base_url: Url,
    client: reqwest::Client,
}

impl WalletBalanceSource {
    /// Creates a source for the server at `base_url`. Every request is
    /// bounded by `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into();
        let base_url = Url::parse(&base_url).map_err(|e| {
            PaymentError::ConfigError(format!("invalid wallet url {base_url}: {e}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(PaymentError::ConfigError(format!(
                "wallet url {base_url} cannot have a path"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::ConfigError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base}/wallets/{wallet_id}`, with the id as a single path segment.
    fn url(&self, wallet_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("wallets").push(wallet_id);
        }
        url
    }

    /// Fetches the available balance of `wallet_id` in smallest units.
    pub async fn query_wallet(&self, wallet_id: &str) -> std::result::Result<i64, BalanceQueryError> {
        let url = self.url(wallet_id);
        debug!(%url, "Querying wallet balance");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(BalanceQueryError::Transport)?;

        let status = response.status();
        let body = response.text().await.map_err(BalanceQueryError::Transport)?;
        if !status.is_success() {
            return Err(BalanceQueryError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let wallet: WalletResponse =
            serde_json::from_str(&body).map_err(|e| BalanceQueryError::Decode(e.to_string()))?;
        let available = wallet.balance.available;
        if available.unit != LOVELACE {
            return Err(BalanceQueryError::Decode(format!(
                "expected {LOVELACE}, got unit {}",
                available.unit
            )));
        }
        Ok(available.quantity)
    }
}

#[async_trait]
impl BalanceSource for WalletBalanceSource {
    async fn query_balance(&self, account: &Account) -> Result<i64> {
        Ok(self.query_wallet(account.wallet_id()).await?)
    }
}
