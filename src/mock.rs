// =============================================================================
// Test doubles — scripted market data, recording alert sink, mock broker
// =============================================================================
//
// Used by the unit tests across the crate. Everything records its calls so
// tests can assert on interaction counts as well as state.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::alert::AlertSink;
use crate::broker::{
    BrokerClient, BrokerError, BrokerPosition, BrokerResult, CloseReceipt, OrderFill,
    OrderRequest,
};
use crate::market::fetcher::CandleSource;
use crate::market::Candle;

// ---------------------------------------------------------------------------
// ScriptedCandles
// ---------------------------------------------------------------------------

/// Candle source fed from pre-scripted batches per symbol. Each `klines`
/// call pops the next batch; once the script runs out the final batch keeps
/// being served (a market that stopped moving). A symbol with no script at
/// all errors like a dead transport.
pub struct ScriptedCandles {
    queues: Mutex<HashMap<String, VecDeque<Vec<Candle>>>>,
    last: Mutex<HashMap<String, Vec<Candle>>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedCandles {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            last: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn push(&self, symbol: &str, candles: Vec<Candle>) {
        self.queues
            .lock()
            .entry(symbol.to_uppercase())
            .or_default()
            .push_back(candles);
    }

    pub fn calls_for(&self, symbol: &str) -> u32 {
        *self.calls.lock().get(&symbol.to_uppercase()).unwrap_or(&0)
    }
}

impl Default for ScriptedCandles {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CandleSource for ScriptedCandles {
    async fn klines(&self, symbol: &str, _interval: &str, _limit: u32) -> Result<Vec<Candle>> {
        let key = symbol.to_uppercase();
        *self.calls.lock().entry(key.clone()).or_insert(0) += 1;

        if let Some(batch) = self.queues.lock().get_mut(&key).and_then(|q| q.pop_front()) {
            self.last.lock().insert(key, batch.clone());
            return Ok(batch);
        }
        if let Some(batch) = self.last.lock().get(&key) {
            return Ok(batch.clone());
        }
        anyhow::bail!("no scripted candles for {key}")
    }
}

// ---------------------------------------------------------------------------
// RecordingAlerts
// ---------------------------------------------------------------------------

/// Alert sink that records every delivery instead of sending it.
pub struct RecordingAlerts {
    sent: Mutex<Vec<(String, String, String)>>,
    notices: Mutex<Vec<String>>,
}

impl RecordingAlerts {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            notices: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().clone()
    }

    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().clone()
    }
}

impl Default for RecordingAlerts {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn send(&self, symbol: &str, timeframe: &str, body: &str) -> bool {
        self.sent
            .lock()
            .push((symbol.to_string(), timeframe.to_string(), body.to_string()));
        true
    }

    async fn notify(&self, message: &str) -> bool {
        self.notices.lock().push(message.to_string());
        true
    }
}

// ---------------------------------------------------------------------------
// MockBroker
// ---------------------------------------------------------------------------

/// Broker that fills everything at a configurable price and records calls.
pub struct MockBroker {
    price: Mutex<f64>,
    positions: Mutex<Vec<BrokerPosition>>,
    positions_after_fill: Mutex<Vec<BrokerPosition>>,
    orders: Mutex<Vec<OrderRequest>>,
    closes: Mutex<Vec<(i64, i64, f64)>>,
    balance: Mutex<f64>,
    fill_trade_index: Mutex<Option<i64>>,
    fill_pair_id: Mutex<Option<i64>>,
    reject_orders: AtomicBool,
    next_order_id: AtomicU64,
}

impl MockBroker {
    pub fn new(price: f64) -> Self {
        Self {
            price: Mutex::new(price),
            positions: Mutex::new(Vec::new()),
            positions_after_fill: Mutex::new(Vec::new()),
            orders: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
            balance: Mutex::new(1000.0),
            fill_trade_index: Mutex::new(Some(1)),
            fill_pair_id: Mutex::new(Some(12)),
            reject_orders: AtomicBool::new(false),
            next_order_id: AtomicU64::new(1),
        }
    }

    pub fn set_price(&self, price: f64) {
        *self.price.lock() = price;
    }

    pub fn set_positions(&self, positions: Vec<BrokerPosition>) {
        *self.positions.lock() = positions;
    }

    /// Positions the venue will report only once an order has filled
    /// (models the position list lagging the quote stream).
    pub fn set_positions_after_fill(&self, positions: Vec<BrokerPosition>) {
        *self.positions_after_fill.lock() = positions;
    }

    pub fn set_fill_indices(&self, trade_index: Option<i64>, pair_id: Option<i64>) {
        *self.fill_trade_index.lock() = trade_index;
        *self.fill_pair_id.lock() = pair_id;
    }

    pub fn reject_orders(&self, reject: bool) {
        self.reject_orders.store(reject, Ordering::SeqCst);
    }

    pub fn orders(&self) -> Vec<OrderRequest> {
        self.orders.lock().clone()
    }

    pub fn closes(&self) -> Vec<(i64, i64, f64)> {
        self.closes.lock().clone()
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn get_price(&self, _symbol: &str) -> BrokerResult<f64> {
        Ok(*self.price.lock())
    }

    async fn place_order(&self, request: &OrderRequest) -> BrokerResult<OrderFill> {
        if self.reject_orders.load(Ordering::SeqCst) {
            return Err(BrokerError::Rejected("scripted rejection".into()));
        }
        self.orders.lock().push(request.clone());
        let after_fill = std::mem::take(&mut *self.positions_after_fill.lock());
        if !after_fill.is_empty() {
            self.positions.lock().extend(after_fill);
        }
        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        Ok(OrderFill {
            order_id: id.to_string(),
            price: *self.price.lock(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            tx_hash: Some(format!("0xmock{id}")),
            trade_index: *self.fill_trade_index.lock(),
            pair_id: *self.fill_pair_id.lock(),
        })
    }

    async fn close_position(
        &self,
        pair_id: i64,
        trade_index: i64,
        market_price: f64,
    ) -> BrokerResult<CloseReceipt> {
        self.closes.lock().push((pair_id, trade_index, market_price));
        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        Ok(CloseReceipt {
            tx_hash: Some(format!("0xclose{id}")),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        })
    }

    async fn get_positions(&self, symbol: Option<&str>) -> BrokerResult<Vec<BrokerPosition>> {
        let positions = self.positions.lock();
        Ok(positions
            .iter()
            .filter(|p| symbol.map_or(true, |s| crate::types::symbol_base_matches(&p.symbol, s)))
            .cloned()
            .collect())
    }

    async fn get_balance(&self) -> BrokerResult<f64> {
        Ok(*self.balance.lock())
    }
}
