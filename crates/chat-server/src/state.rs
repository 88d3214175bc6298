//! Application State

use std::sync::Arc;

use chat_core::{Dispatcher, FunctionRegistry};
use wallet_data::WalletDataSource;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Dispatcher over the configured completion provider
    pub dispatcher: Arc<Dispatcher>,

    /// Wallet functions declared on every invocation
    pub functions: FunctionRegistry,

    /// Balances and prices behind the functions
    pub wallet: Arc<dyn WalletDataSource>,

    /// Model used when a request names none
    pub default_model: String,

    /// Wallet shown when `showWalletBalance` names no address
    pub wallet_address: String,
}
