//! Illustrative stock prices
//!
//! Deterministic prices derived from the ticker text. There is no market
//! feed behind them; the same ticker always yields the same price.

use rust_decimal::Decimal;

const MULTIPLIER: i64 = 9_999_121;
const MODULUS: i64 = 9_999;

/// Price of `name` in USD, between 0.00 and 99.98.
///
/// Folds the UTF-16 code units of `name` into `(total + unit * 9999121) % 9999`
/// and reads the result as cents.
pub fn stock_price(name: &str) -> Decimal {
    let total = name
        .encode_utf16()
        .fold(0i64, |total, unit| (total + i64::from(unit) * MULTIPLIER) % MODULUS);
    Decimal::new(total, 2)
}

/// Format a USD amount as `$1,234.56` (negative as `-$1,234.56`)
pub fn format_usd(value: Decimal) -> String {
    let rounded = value.round_dp(2);
    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    let digits = format!("{:.2}", rounded.abs());
    let (whole, cents) = digits.split_once('.').unwrap_or((digits.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, c) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    format!("{}${}.{}", sign, grouped, cents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_known_prices() {
        assert_eq!(stock_price("MSFT"), dec!(79.97));
        assert_eq!(stock_price("AAPL"), dec!(46.09));
        assert_eq!(stock_price("A"), dec!(78.65));
    }

    #[test]
    fn test_empty_name_is_zero() {
        assert_eq!(stock_price(""), Decimal::ZERO);
    }

    #[test]
    fn test_deterministic_and_bounded() {
        for ticker in ["NVDA", "TSLA", "GOOG", "ünïcödé", "🚀"] {
            let price = stock_price(ticker);
            assert_eq!(price, stock_price(ticker));
            assert!(price >= Decimal::ZERO && price < dec!(99.99));
        }
    }

    #[test]
    fn test_format_usd() {
        assert_eq!(format_usd(dec!(79.97)), "$79.97");
        assert_eq!(format_usd(dec!(1234567.891)), "$1,234,567.89");
        assert_eq!(format_usd(dec!(0.001)), "$0.00");
        assert_eq!(format_usd(dec!(-799.7)), "-$799.70");
        assert_eq!(format_usd(dec!(100)), "$100.00");
    }
}
