//! Wallet Chat Functions
//!
//! The functions the model may call instead of answering in prose, and the
//! typed results they produce. Nothing here executes a trade: a placed trade
//! only becomes a ticket for the user to review.

use chat_core::{FunctionCallPayload, FunctionDefinition, FunctionRegistry, ParameterSchema};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, WalletError};
use crate::model::WalletSummary;
use crate::price::format_usd;
use crate::source::WalletDataSource;

pub const PLACE_TRADE: &str = "placeTrade";
pub const GET_STOCK_PRICE: &str = "getStockPrice";
pub const SHOW_WALLET_BALANCE: &str = "showWalletBalance";

/// Holdings listed when describing a wallet
const TOP_HOLDINGS: usize = 5;

/// Registry of every wallet chat function
pub fn wallet_functions() -> chat_core::Result<FunctionRegistry> {
    FunctionRegistry::new()
        .with(
            FunctionDefinition::new(PLACE_TRADE, "Show the UI to buy or sell shares of a stock.")
                .param(ParameterSchema::required("ticker", "string", "The ticker symbol of the stock, e.g. MSFT"))
                .param(ParameterSchema::required("quantity", "number", "The number of shares to trade")),
        )?
        .with(
            FunctionDefinition::new(GET_STOCK_PRICE, "Get the current price of a stock.")
                .param(ParameterSchema::required("ticker", "string", "The ticker symbol of the stock")),
        )?
        .with(
            FunctionDefinition::new(SHOW_WALLET_BALANCE, "Show the token balances of a web3 wallet.")
                .param(ParameterSchema::optional("address", "string", "Wallet address; the connected wallet if omitted")),
        )
}

#[derive(Deserialize)]
struct TradeArgs {
    ticker: String,
    quantity: Decimal,
}

#[derive(Deserialize)]
struct PriceArgs {
    ticker: String,
}

#[derive(Deserialize)]
struct BalanceArgs {
    #[serde(default)]
    address: Option<String>,
}

fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_uppercase()
}

fn arguments<T: serde::de::DeserializeOwned>(payload: &FunctionCallPayload) -> Result<T> {
    payload.parse_arguments().map_err(|e| WalletError::InvalidArguments {
        function: payload.name.clone(),
        reason: e.to_string(),
    })
}

/// A proposed trade awaiting the user's confirmation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TradeTicket {
    pub id: Uuid,
    pub ticker: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub total: Decimal,
    pub created_at: DateTime<Utc>,
}

impl TradeTicket {
    pub fn new(ticker: impl Into<String>, quantity: Decimal, price: Decimal) -> Result<Self> {
        let ticker = normalize_ticker(&ticker.into());
        if ticker.is_empty() {
            return Err(WalletError::InvalidTrade("ticker is empty".into()));
        }
        if quantity <= Decimal::ZERO {
            return Err(WalletError::InvalidTrade(format!("quantity must be positive, got {}", quantity)));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            ticker,
            quantity,
            price,
            total: quantity * price,
            created_at: Utc::now(),
        })
    }

    /// Build a ticket from a `placeTrade` call, priced by `source`
    pub async fn from_payload(payload: &FunctionCallPayload, source: &dyn WalletDataSource) -> Result<Self> {
        if payload.name != PLACE_TRADE {
            return Err(WalletError::UnknownFunction(payload.name.clone()));
        }
        let args: TradeArgs = arguments(payload)?;
        let ticker = normalize_ticker(&args.ticker);
        let price = source.stock_price(&ticker).await?;
        Self::new(ticker, args.quantity, price)
    }
}

/// Price of one stock
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PriceQuote {
    pub ticker: String,
    pub price: Decimal,
}

/// Result of running one wallet function
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FunctionOutput {
    TradeTicket(TradeTicket),
    StockPrice(PriceQuote),
    WalletBalance(WalletSummary),
}

impl FunctionOutput {
    /// Plain-text rendering, fit for a `function` message in the history
    pub fn describe(&self) -> String {
        match self {
            FunctionOutput::TradeTicket(ticket) => format!(
                "Trade ticket for {} shares of {} at {} (total {}). Awaiting confirmation; nothing has been executed.",
                ticket.quantity.normalize(),
                ticket.ticker,
                format_usd(ticket.price),
                format_usd(ticket.total)
            ),
            FunctionOutput::StockPrice(quote) => {
                format!("{} is trading at {}.", quote.ticker, format_usd(quote.price))
            }
            FunctionOutput::WalletBalance(summary) => {
                let holdings: Vec<String> = summary
                    .top_holdings(TOP_HOLDINGS)
                    .iter()
                    .map(|t| {
                        format!(
                            "{} ({})",
                            t.contract_ticker_symbol,
                            format_usd(t.quote_usd().unwrap_or(Decimal::ZERO))
                        )
                    })
                    .collect();
                format!(
                    "Wallet {} holds {} tokens worth {} in total. Largest: {}.",
                    summary.address,
                    summary.tokens.len(),
                    format_usd(summary.total_quote),
                    holdings.join(", ")
                )
            }
        }
    }
}

/// Run a resolved wallet function call against `source`.
///
/// `default_address` is used when `showWalletBalance` names no address.
pub async fn run_function(
    payload: &FunctionCallPayload,
    source: &dyn WalletDataSource,
    default_address: &str,
) -> Result<FunctionOutput> {
    tracing::debug!(function = %payload.name, "running wallet function");

    match payload.name.as_str() {
        PLACE_TRADE => Ok(FunctionOutput::TradeTicket(TradeTicket::from_payload(payload, source).await?)),
        GET_STOCK_PRICE => {
            let args: PriceArgs = arguments(payload)?;
            let ticker = normalize_ticker(&args.ticker);
            let price = source.stock_price(&ticker).await?;
            Ok(FunctionOutput::StockPrice(PriceQuote { ticker, price }))
        }
        SHOW_WALLET_BALANCE => {
            let args: BalanceArgs = arguments(payload)?;
            let address = args
                .address
                .filter(|a| !a.trim().is_empty())
                .unwrap_or_else(|| default_address.to_string());
            Ok(FunctionOutput::WalletBalance(source.wallet_summary(&address).await?))
        }
        other => Err(WalletError::UnknownFunction(other.to_string())),
    }
}
