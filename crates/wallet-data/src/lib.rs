//! # wallet-data
//!
//! Data and functions behind the wallet chat: token balances of a web3
//! wallet, illustrative stock prices, and the function declarations the
//! model may call.
//!
//! ## Functions
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────┬───────────────────────────┐
//! │ function             │ arguments                │ result                    │
//! ├──────────────────────┼──────────────────────────┼───────────────────────────┤
//! │ placeTrade           │ ticker, quantity         │ TradeTicket (not executed)│
//! │ getStockPrice        │ ticker                   │ PriceQuote                │
//! │ showWalletBalance    │ address (optional)       │ WalletSummary             │
//! └──────────────────────┴──────────────────────────┴───────────────────────────┘
//! ```

pub mod error;
pub mod functions;
pub mod model;
pub mod price;
pub mod source;

use serde::Serialize;

pub use error::{Result, WalletError};
pub use functions::{run_function, wallet_functions, FunctionOutput, PriceQuote, TradeTicket};
pub use model::{TokenBalance, WalletSummary};
pub use price::{format_usd, stock_price};
pub use source::{wallet_tokens, StaticWalletData, WalletDataSource};

/// A suggested first prompt
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ExampleMessage {
    /// Label shown to the user
    pub heading: &'static str,

    /// Text submitted when chosen
    pub message: &'static str,
}

pub const TITLE: &str = "Wallet Chat";
pub const SUBTITLE: &str = "Interact with your web3 wallet address.";

pub const EXAMPLE_MESSAGES: &[ExampleMessage] = &[
    ExampleMessage {
        heading: "What are the trending stocks?",
        message: "Get trending stocks",
    },
    ExampleMessage {
        heading: "I'd like to buy 10 shares of MSFT",
        message: "Buy 10 shares of MSFT",
    },
];

/// System prompt for the wallet chat assistant
pub const SYSTEM_PROMPT: &str = r#"You are a wallet and stock trading assistant. You help users look up stock prices, review the tokens in their web3 wallet, and prepare trades.

## Functions

- Call `getStockPrice` when the user asks for the price of a stock.
- Call `placeTrade` when the user wants to buy or sell shares. This only shows a ticket for the user to confirm; never claim a trade was executed.
- Call `showWalletBalance` when the user asks what their wallet holds.

## Rules

- Call at most one function per reply.
- If the user asks for something you cannot do, answer in plain text and say so.
- Prices shown here are illustrative and do not come from a live market feed."#;
