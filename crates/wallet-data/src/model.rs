//! Domain Models
//!
//! Wallet token balances as reported by the balance indexer. Monetary
//! fields arrive as decimal strings and are parsed into `rust_decimal`
//! on demand.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// One token held by a wallet
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenBalance {
    /// Token name (e.g., "Matic", "(PoS) Tether USD")
    pub contract_name: String,

    /// Ticker symbol (e.g., "MATIC", "USDT")
    pub contract_ticker_symbol: String,

    /// Decimals of the raw balance
    pub contract_decimals: u32,

    pub contract_address: String,

    /// Chain id (137 = Polygon)
    pub coin: u64,

    /// Raw balance in the token's smallest unit
    pub balance: String,

    /// USD value of the balance
    pub quote: String,

    /// USD price of one token
    pub quote_rate: String,

    pub logo_url: String,

    /// Absolute USD price change over 24h
    pub quote_rate_24h: String,

    /// Percentage price change over 24h
    pub quote_pct_change_24h: f64,

    pub quote_price: String,
}

impl TokenBalance {
    /// USD value of the holding
    pub fn quote_usd(&self) -> Option<Decimal> {
        Decimal::from_str(&self.quote).ok()
    }

    /// USD price of one token
    pub fn rate_usd(&self) -> Option<Decimal> {
        Decimal::from_str(&self.quote_rate).ok()
    }

    /// Balance in whole tokens (raw balance shifted by `contract_decimals`)
    pub fn amount(&self) -> Option<Decimal> {
        let raw: i128 = self.balance.parse().ok()?;
        Decimal::try_from_i128_with_scale(raw, self.contract_decimals)
            .ok()
            .map(|d| d.normalize())
    }
}

/// All balances of one wallet address
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalletSummary {
    pub address: String,
    pub tokens: Vec<TokenBalance>,

    /// Sum of every parseable `quote`
    pub total_quote: Decimal,
}

impl WalletSummary {
    pub fn new(address: impl Into<String>, tokens: Vec<TokenBalance>) -> Self {
        let total_quote = tokens.iter().filter_map(TokenBalance::quote_usd).sum();
        Self {
            address: address.into(),
            tokens,
            total_quote,
        }
    }

    /// Tokens ordered by USD value, largest first
    pub fn top_holdings(&self, limit: usize) -> Vec<&TokenBalance> {
        let mut ranked: Vec<&TokenBalance> = self.tokens.iter().collect();
        ranked.sort_by(|a, b| {
            b.quote_usd()
                .unwrap_or(Decimal::ZERO)
                .cmp(&a.quote_usd().unwrap_or(Decimal::ZERO))
        });
        ranked.truncate(limit);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn usdt() -> TokenBalance {
        TokenBalance {
            contract_name: "(PoS) Tether USD".into(),
            contract_ticker_symbol: "USDT".into(),
            contract_decimals: 6,
            contract_address: "0xc2132d05d31c914a87c6611c10748aeb04b58e8f".into(),
            coin: 137,
            balance: "32891".into(),
            quote: "0.03292389099999999".into(),
            quote_rate: "1.001".into(),
            logo_url: String::new(),
            quote_rate_24h: "0.00149526".into(),
            quote_pct_change_24h: 0.14966,
            quote_price: "0.03292389099999999".into(),
        }
    }

    #[test]
    fn test_amount_applies_decimals() {
        assert_eq!(usdt().amount(), Some(dec!(0.032891)));
    }

    #[test]
    fn test_quote_parsing() {
        let token = usdt();
        assert_eq!(token.rate_usd(), Some(dec!(1.001)));
        assert_eq!(token.quote_usd(), Some(dec!(0.03292389099999999)));

        let broken = TokenBalance {
            quote: "n/a".into(),
            ..usdt()
        };
        assert_eq!(broken.quote_usd(), None);
    }

    #[test]
    fn test_summary_totals_and_ranking() {
        let big = TokenBalance {
            contract_ticker_symbol: "WETH".into(),
            quote: "1.5".into(),
            ..usdt()
        };
        let summary = WalletSummary::new("0xabc", vec![usdt(), big]);

        assert_eq!(summary.total_quote, dec!(1.53292389099999999));
        assert_eq!(summary.top_holdings(1)[0].contract_ticker_symbol, "WETH");
    }
}
