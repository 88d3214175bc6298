//! Wallet Data Sources
//!
//! Where balances and prices come from. `StaticWalletData` serves a fixed
//! wallet snapshot and the illustrative stock prices.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::{Result, WalletError};
use crate::model::{TokenBalance, WalletSummary};
use crate::price;

/// Snapshot of a Polygon wallet used for every address
const WALLET_TOKENS_JSON: &str = include_str!("../data/wallet_tokens.json");

/// Wallet data source trait (Strategy pattern)
///
/// Implement this for a live indexer or price feed.
#[async_trait]
pub trait WalletDataSource: Send + Sync {
    /// Token balances held by `address`
    async fn wallet_tokens(&self, address: &str) -> Result<Vec<TokenBalance>>;

    /// Current price of a stock ticker in USD
    async fn stock_price(&self, ticker: &str) -> Result<Decimal>;

    /// Balances plus their total USD value
    async fn wallet_summary(&self, address: &str) -> Result<WalletSummary> {
        let tokens = self.wallet_tokens(address).await?;
        Ok(WalletSummary::new(address, tokens))
    }

    /// Source name
    fn name(&self) -> &str;
}

/// Fixed data, no network access
#[derive(Clone, Debug)]
pub struct StaticWalletData {
    tokens: Vec<TokenBalance>,
}

impl StaticWalletData {
    /// Load the embedded wallet snapshot
    pub fn new() -> Result<Self> {
        Ok(Self {
            tokens: wallet_tokens()?,
        })
    }

    /// Serve the given balances instead of the snapshot
    pub fn with_tokens(tokens: Vec<TokenBalance>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl WalletDataSource for StaticWalletData {
    async fn wallet_tokens(&self, address: &str) -> Result<Vec<TokenBalance>> {
        tracing::debug!(%address, tokens = self.tokens.len(), "serving static wallet snapshot");
        Ok(self.tokens.clone())
    }

    async fn stock_price(&self, ticker: &str) -> Result<Decimal> {
        let ticker = ticker.trim();
        if ticker.is_empty() {
            return Err(WalletError::InvalidArguments {
                function: "getStockPrice".into(),
                reason: "ticker is empty".into(),
            });
        }
        Ok(price::stock_price(ticker))
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// The embedded wallet snapshot, identical for every address
pub fn wallet_tokens() -> Result<Vec<TokenBalance>> {
    Ok(serde_json::from_str(WALLET_TOKENS_JSON)?)
}
