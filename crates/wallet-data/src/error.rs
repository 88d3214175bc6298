//! Error Types for Wallet Data

use chat_core::ChatError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WalletError>;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Unknown wallet function: {0}")]
    UnknownFunction(String),

    #[error("Invalid arguments for '{function}': {reason}")]
    InvalidArguments { function: String, reason: String },

    #[error("Invalid trade: {0}")]
    InvalidTrade(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Chat(#[from] ChatError),
}
