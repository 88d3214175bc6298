//! Offline demo provider
//!
//! Scripted replies for `CHAT_PROVIDER=mock`: trade requests become a
//! streamed `placeTrade` call, price questions a `getStockPrice` call,
//! wallet questions a `showWalletBalance` call, anything else streamed text.

use std::time::Duration;

use chat_core::{CompletionRequest, FinishReason, ProviderEvent, Role, ScriptStep, ScriptedProvider};
use serde_json::json;
use wallet_data::functions::{GET_STOCK_PRICE, PLACE_TRADE, SHOW_WALLET_BALANCE};

/// Delay between streamed chunks
const CHUNK_DELAY: Duration = Duration::from_millis(40);

pub fn demo_provider() -> ScriptedProvider {
    ScriptedProvider::from_fn(script_for)
}

fn script_for(request: &CompletionRequest) -> Vec<ScriptStep> {
    let prompt = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or_default();
    let lower = prompt.to_lowercase();
    let declared = |name: &str| request.functions.iter().any(|f| f.name == name);

    if declared(PLACE_TRADE) && (lower.contains("buy") || lower.contains("sell")) {
        if let Some((ticker, quantity)) = parse_trade(prompt) {
            let arguments = json!({ "ticker": ticker, "quantity": quantity }).to_string();
            return call_script(PLACE_TRADE, &arguments);
        }
    }
    if declared(GET_STOCK_PRICE) && lower.contains("price") {
        if let Some(ticker) = find_ticker(prompt) {
            return call_script(GET_STOCK_PRICE, &json!({ "ticker": ticker }).to_string());
        }
    }
    if declared(SHOW_WALLET_BALANCE) && (lower.contains("wallet") || lower.contains("balance")) {
        return call_script(SHOW_WALLET_BALANCE, "{}");
    }

    let reply = if lower.contains("trending") {
        "Trending today: NVDA, MSFT, AAPL and TSLA are seeing the most activity. Ask me for a price or place a trade."
    } else {
        "I can look up stock prices, show your wallet balance, or prepare a trade for you to confirm."
    };
    text_script(reply)
}

/// Stream `text` word by word
fn text_script(text: &str) -> Vec<ScriptStep> {
    let mut steps = Vec::new();
    for (i, word) in text.split(' ').enumerate() {
        let chunk = if i == 0 { word.to_string() } else { format!(" {}", word) };
        steps.push(ScriptStep::Delay(CHUNK_DELAY));
        steps.push(ScriptStep::Event(ProviderEvent::Token(chunk)));
    }
    steps.push(finished(FinishReason::Stop));
    steps
}

/// Stream a function call the way OpenAI does: name first, arguments in pieces
fn call_script(name: &str, arguments: &str) -> Vec<ScriptStep> {
    let mut steps = vec![ScriptStep::Event(ProviderEvent::FunctionCallDelta {
        name: Some(name.to_string()),
        arguments: String::new(),
    })];

    let chars: Vec<char> = arguments.chars().collect();
    for piece in chars.chunks(8) {
        steps.push(ScriptStep::Delay(CHUNK_DELAY));
        steps.push(ScriptStep::Event(ProviderEvent::FunctionCallDelta {
            name: None,
            arguments: piece.iter().collect(),
        }));
    }
    steps.push(finished(FinishReason::FunctionCall));
    steps
}

fn finished(reason: FinishReason) -> ScriptStep {
    ScriptStep::Event(ProviderEvent::Finished { reason, usage: None })
}

/// Pull `(ticker, quantity)` out of e.g. "Buy 10 shares of MSFT"
fn parse_trade(prompt: &str) -> Option<(String, u64)> {
    let quantity = prompt
        .split_whitespace()
        .find_map(|w| w.trim_matches(|c: char| !c.is_ascii_digit()).parse().ok())?;
    Some((find_ticker(prompt)?, quantity))
}

/// First all-caps word of 2 to 5 letters
fn find_ticker(prompt: &str) -> Option<String> {
    prompt
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_ascii_alphabetic()))
        .find(|w| (2..=5).contains(&w.len()) && w.chars().all(|c| c.is_ascii_uppercase()))
        .map(str::to_string)
}
