// =============================================================================
// Broker capability — the exchange surface the trading engine depends on
// =============================================================================
//
// Every exchange adapter exposes the same five operations: quote, market
// order, close-by-index, list positions, balance. The engine only ever sees
// this trait; credentials live inside the adapter and are never persisted.
// =============================================================================

pub mod hyperliquid;
pub mod ostium;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::Side;

/// Errors an adapter can surface. Rejections are persisted as risk events;
/// network failures are transient and only logged.
#[derive(Debug, Clone)]
pub enum BrokerError {
    /// The exchange refused the request (bad params, insufficient margin…).
    Rejected(String),
    /// Transport-level failure; the next signal or watchdog tick retries.
    Network(String),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(msg) => write!(f, "broker rejected: {msg}"),
            Self::Network(msg) => write!(f, "broker network error: {msg}"),
        }
    }
}

impl std::error::Error for BrokerError {}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Parameters for a market order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    /// Collateral amount committed to the trade.
    pub quantity: f64,
    pub leverage: u32,
}

/// Fill receipt for a placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub price: f64,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub tx_hash: Option<String>,
    /// Venue-side trade index parsed from the fill event, when available.
    #[serde(default)]
    pub trade_index: Option<i64>,
    #[serde(default)]
    pub pair_id: Option<i64>,
}

/// Receipt for a successful close.
#[derive(Debug, Clone)]
pub struct CloseReceipt {
    pub tx_hash: Option<String>,
    pub timestamp_ms: i64,
}

/// A position as reported by the venue.
#[derive(Debug, Clone)]
pub struct BrokerPosition {
    pub symbol: String,
    pub side: Side,
    pub collateral: f64,
    pub index: i64,
    pub pair_id: i64,
    pub opened_at_ms: i64,
}

/// The capability set shared by every exchange adapter.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Latest mark/mid price for `symbol`.
    async fn get_price(&self, symbol: &str) -> BrokerResult<f64>;

    /// Submit a market order; returns the fill receipt.
    async fn place_order(&self, request: &OrderRequest) -> BrokerResult<OrderFill>;

    /// Close the position addressed by `(pair_id, trade_index)`.
    /// `trade_index = 0` asks the venue to match the latest trade.
    async fn close_position(
        &self,
        pair_id: i64,
        trade_index: i64,
        market_price: f64,
    ) -> BrokerResult<CloseReceipt>;

    /// Open positions, optionally filtered by symbol.
    async fn get_positions(&self, symbol: Option<&str>) -> BrokerResult<Vec<BrokerPosition>>;

    /// Free collateral balance in the account's quote currency.
    async fn get_balance(&self) -> BrokerResult<f64>;
}
