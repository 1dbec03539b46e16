// =============================================================================
// Trading Engine — per-instance signal state machine with self-healing
// =============================================================================
//
// One engine per registered instance, bound to one exchange account and one
// symbol. Every public operation serializes on the engine lock, so signals
// for an instance apply strictly in arrival order.
//
// State machine:
//   FLAT / LONG / SHORT   — current_position
//   HALTED                — is_stopped; set by a stop-loss breach, cleared
//                           only by an operator reset
//   SYNCING               — skip_next_opposite; set by the lost-signal
//                           self-heal, consumes exactly one signal
//
// Self-heal: an open-intent signal identical to the previous one while a
// position is held means the close in between was lost. The engine force-
// closes, alerts, and skips the next signal to fall back in step with the
// sender.
//
// An opposite-side open flattens only; the position is NOT reversed in the
// same step. The sender's next signal re-establishes the new side.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use chrono_tz::Asia::Shanghai;
use parking_lot::RwLock;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alert::AlertSink;
use crate::broker::{BrokerClient, BrokerError, OrderRequest};
use crate::engine::signal::{Signal, SignalIntent};
use crate::store::{decimal_from_f64, NewOrder, NewTrade, PositionRecord, SignalStore};
use crate::types::{symbol_base_matches, Exchange, Side};

/// Risk watchdog cadence.
const RISK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);
/// Market-hours watchdog cadence.
const MARKET_HOURS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);
/// Prices below this are treated as bad quotes and excluded from PnL math.
const MIN_SANE_PRICE: Decimal = dec!(0.01);

// ---------------------------------------------------------------------------
// Margin spec
// ---------------------------------------------------------------------------

/// Collateral committed per trade: a fixed amount or a uniform range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MarginSpec {
    Fixed(f64),
    Range(f64, f64),
}

impl Default for MarginSpec {
    fn default() -> Self {
        Self::Fixed(5.0)
    }
}

impl MarginSpec {
    /// Parse "5", "5.5" or "5-6.5". Returns `None` on malformed input or a
    /// reversed range.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Some((lo, hi)) = raw.split_once('-') {
            let lo: f64 = lo.trim().parse().ok()?;
            let hi: f64 = hi.trim().parse().ok()?;
            if lo <= hi && lo.is_finite() && hi.is_finite() {
                Some(Self::Range(lo, hi))
            } else {
                None
            }
        } else {
            let v: f64 = raw.parse().ok()?;
            v.is_finite().then_some(Self::Fixed(v))
        }
    }

    /// Sample a concrete margin amount: rounded to 4 decimals, never below
    /// 0.1.
    pub fn sample(&self) -> f64 {
        let raw = match self {
            Self::Fixed(v) => *v,
            Self::Range(lo, hi) => {
                if hi > lo {
                    rand::thread_rng().gen_range(*lo..=*hi)
                } else {
                    *lo
                }
            }
        };
        ((raw * 10_000.0).round() / 10_000.0).max(0.1)
    }

    fn describe(&self) -> String {
        match self {
            Self::Fixed(v) => format!("{v}"),
            Self::Range(lo, hi) => format!("{lo}-{hi}"),
        }
    }
}

impl Serialize for MarginSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.describe())
    }
}

impl<'de> Deserialize<'de> for MarginSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid margin spec '{raw}'")))
    }
}

// ---------------------------------------------------------------------------
// Instance configuration
// ---------------------------------------------------------------------------

/// Per-instance trading configuration, mutable at runtime under the engine
/// lock. Replaces the env-slot margin carry of earlier generations with a
/// typed record.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceConfig {
    pub exchange: Exchange,
    pub symbol: String,
    pub leverage: u32,
    /// Stop-loss as a fraction (0.03 = 3 %).
    pub stop_loss_percent: f64,
    /// Take-profit as a fraction.
    pub take_profit_percent: f64,
    #[serde(rename = "margin_amount")]
    pub margin: MarginSpec,
    pub forbidden_hours: BTreeSet<u8>,
    pub strategy_name: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            exchange: Exchange::Ostium,
            symbol: "ETH/USD".to_string(),
            leverage: 50,
            stop_loss_percent: 0.03,
            take_profit_percent: 0.06,
            margin: MarginSpec::default(),
            forbidden_hours: BTreeSet::new(),
            strategy_name: String::new(),
        }
    }
}

/// Partial config update accepted by the router.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub margin_amount: Option<serde_json::Value>,
    #[serde(default)]
    pub stop_loss_ratio: Option<f64>,
    #[serde(default)]
    pub take_profit_ratio: Option<f64>,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub forbidden_hours: Option<String>,
    #[serde(default)]
    pub strategy_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct EngineState {
    position: Option<Side>,
    last_signal: Option<String>,
    last_intent: Option<SignalIntent>,
    skip_next_opposite: bool,
    is_stopped: bool,
    last_reset_at: Option<chrono::DateTime<Utc>>,
}

pub struct TradingEngine {
    instance_id: String,
    source: String,
    cfg: RwLock<InstanceConfig>,
    state: Mutex<EngineState>,
    broker: Arc<dyn BrokerClient>,
    store: SignalStore,
    alerts: Arc<dyn AlertSink>,
}

impl TradingEngine {
    pub fn new(
        instance_id: impl Into<String>,
        cfg: InstanceConfig,
        broker: Arc<dyn BrokerClient>,
        store: SignalStore,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let instance_id = instance_id.into();
        let source = format!("{}_{}", cfg.exchange, instance_id);
        info!(
            instance_id = %instance_id,
            source = %source,
            symbol = %cfg.symbol,
            leverage = cfg.leverage,
            stop_loss = cfg.stop_loss_percent,
            "trading engine created"
        );
        Self {
            instance_id,
            source,
            cfg: RwLock::new(cfg),
            state: Mutex::new(EngineState::default()),
            broker,
            store,
            alerts,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn broker(&self) -> &Arc<dyn BrokerClient> {
        &self.broker
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> InstanceConfig {
        self.cfg.read().clone()
    }

    /// Apply a partial configuration update in place. Returns a description
    /// of every applied change.
    pub fn update_config(&self, update: &ConfigUpdate) -> Vec<String> {
        let mut cfg = self.cfg.write();
        let mut changes = Vec::new();

        if let Some(raw) = &update.margin_amount {
            let as_string = match raw {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match MarginSpec::parse(&as_string) {
                Some(spec) => {
                    cfg.margin = spec;
                    changes.push(format!("margin_amount={as_string}"));
                }
                None => warn!(raw = %as_string, "ignoring invalid margin_amount"),
            }
        }
        if let Some(sl) = update.stop_loss_ratio {
            cfg.stop_loss_percent = sl;
            changes.push(format!("stop_loss={}%", sl * 100.0));
        }
        if let Some(tp) = update.take_profit_ratio {
            cfg.take_profit_percent = tp;
            changes.push(format!("take_profit={}%", tp * 100.0));
        }
        if let Some(lev) = update.leverage {
            cfg.leverage = lev;
            changes.push(format!("leverage={lev}x"));
        }
        if let Some(symbol) = &update.symbol {
            cfg.symbol = symbol.clone();
            changes.push(format!("symbol={symbol}"));
        }
        if let Some(raw) = &update.forbidden_hours {
            match crate::config::parse_forbidden_hours(raw) {
                Some(hours) => {
                    changes.push(format!("forbidden_hours={hours:?}"));
                    cfg.forbidden_hours = hours;
                }
                None => warn!(raw = %raw, "ignoring invalid forbidden_hours"),
            }
        }
        if let Some(name) = &update.strategy_name {
            cfg.strategy_name = name.clone();
            changes.push(format!("strategy_name={name}"));
        }

        if !changes.is_empty() {
            info!(instance_id = %self.instance_id, changes = ?changes, "config updated");
        }
        changes
    }

    /// Clear the halt flag. Returns whether the engine was halted.
    /// `last_signal`/`last_intent` deliberately survive: the first signal
    /// after a reset re-enters the state machine as a fresh signal.
    pub async fn reset(&self) -> bool {
        let mut state = self.state.lock().await;
        let was_stopped = state.is_stopped;
        state.is_stopped = false;
        state.last_reset_at = Some(Utc::now());
        if was_stopped {
            info!(instance_id = %self.instance_id, "halt cleared by operator reset");
        }
        was_stopped
    }

    pub async fn is_stopped(&self) -> bool {
        self.state.lock().await.is_stopped
    }

    /// Authoritative position resync from the store and the venue.
    pub async fn sync_position(&self) {
        let mut state = self.state.lock().await;
        self.sync_position_locked(&mut state).await;
    }

    // -------------------------------------------------------------------------
    // Signal entry point
    // -------------------------------------------------------------------------

    /// Process one external signal. `raw_payload` is the original webhook
    /// body, carried along for diagnostics.
    pub async fn execute_signal(&self, signal: Signal, raw_payload: Option<serde_json::Value>) {
        let mut state = self.state.lock().await;

        if state.is_stopped {
            warn!(instance_id = %self.instance_id, "engine halted, signal dropped");
            return;
        }

        let signal_type = signal.signal_type();
        info!(
            instance_id = %self.instance_id,
            signal = %signal_type,
            symbol = %signal.symbol,
            "signal received"
        );
        if let Some(raw) = &raw_payload {
            debug!(payload = %raw, "raw webhook payload");
        }

        // Signals for a different base asset are not ours.
        let engine_symbol = self.cfg.read().symbol.clone();
        if !signal.symbol.is_empty() && !symbol_base_matches(&signal.symbol, &engine_symbol) {
            warn!(
                instance_id = %self.instance_id,
                signal_symbol = %signal.symbol,
                engine_symbol = %engine_symbol,
                "symbol mismatch, signal dropped"
            );
            return;
        }

        // Re-sync before acting; the store and the venue are authoritative.
        self.sync_position_locked(&mut state).await;

        let intent = signal.intent();
        debug!(
            intent = %intent,
            prev_position = %signal.prev_position,
            prev_size = %signal.prev_size,
            "intent parsed"
        );

        // Lost-signal self-heal: a held position plus a repeat of the same
        // open signal means the close in between never arrived.
        if state.position.is_some()
            && state.last_signal.as_deref() == Some(signal_type.as_str())
            && intent == SignalIntent::Open
            && state.last_intent == Some(SignalIntent::Open)
        {
            warn!(
                instance_id = %self.instance_id,
                position = ?state.position,
                signal = %signal_type,
                "lost signal detected, force-closing to resync"
            );
            self.close_locked(&mut state, "lost-signal self-heal").await;
            state.skip_next_opposite = true;
            self.alerts
                .notify("Lost signal detected: position force-closed, entering sync mode.")
                .await;
            state.last_signal = Some(signal_type);
            state.last_intent = Some(intent);
            return;
        }

        // Sync mode consumes exactly one signal.
        if state.skip_next_opposite {
            info!(instance_id = %self.instance_id, signal = %signal_type, "sync mode, signal skipped");
            state.skip_next_opposite = false;
            state.last_signal = Some(signal_type);
            state.last_intent = Some(intent);
            return;
        }

        if signal_type == "close" || intent == SignalIntent::Close {
            state.last_signal = Some(signal_type);
            state.last_intent = Some(intent);
            self.handle_close_signal(&mut state).await;
            return;
        }

        // Open (or unknown, treated as open for backward compatibility).
        let Some(side) = signal.target_side() else {
            warn!(signal = %signal_type, "unrecognized signal type, ignored");
            return;
        };
        state.last_signal = Some(signal_type);
        state.last_intent = Some(intent);
        self.handle_open(&mut state, side).await;
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    async fn handle_open(&self, state: &mut EngineState, side: Side) {
        let (symbol, leverage, margin, forbidden) = {
            let cfg = self.cfg.read();
            (
                cfg.symbol.clone(),
                cfg.leverage,
                cfg.margin,
                cfg.forbidden_hours.clone(),
            )
        };

        if forbidden.contains(&self.current_hour()) {
            warn!(instance_id = %self.instance_id, "market closed, open refused");
            return;
        }

        // Flatten-then-reverse: an opposite-side open only closes; the next
        // signal re-establishes the new side.
        if let Some(current) = state.position {
            if current != side {
                info!(current = %current, target = %side, "opposite signal, flattening first");
                self.close_locked(state, "opposite signal flatten").await;
                return;
            }
            info!(side = %side, "position already open on this side, skipping");
            return;
        }

        let amount = margin.sample();
        info!(
            instance_id = %self.instance_id,
            side = %side,
            symbol = %symbol,
            amount,
            leverage,
            "opening position"
        );

        let request = OrderRequest {
            symbol: symbol.clone(),
            side,
            quantity: amount,
            leverage,
        };
        let fill = match self.broker.place_order(&request).await {
            Ok(fill) => fill,
            Err(BrokerError::Rejected(msg)) => {
                error!(instance_id = %self.instance_id, error = %msg, "open rejected by broker");
                if let Err(e) = self
                    .store
                    .save_risk_event(
                        &self.source,
                        "broker_rejected",
                        "medium",
                        &format!("open {side} {symbol} rejected: {msg}"),
                        Some(&symbol),
                    )
                    .await
                {
                    error!(error = %e, "failed to persist broker rejection");
                }
                return;
            }
            Err(BrokerError::Network(msg)) => {
                error!(instance_id = %self.instance_id, error = %msg, "open failed on transport");
                return;
            }
        };

        // Prefer the trade index straight from the fill receipt; fall back
        // to the venue's position list, newest index wins.
        let (trade_index, pair_id) = if fill.trade_index.is_some() {
            (fill.trade_index, fill.pair_id)
        } else {
            match self.broker.get_positions(Some(&symbol)).await {
                Ok(positions) => match positions.iter().max_by_key(|p| p.index) {
                    Some(latest) => {
                        debug!(trade_index = latest.index, pair_id = latest.pair_id,
                            "trade index recovered from venue positions");
                        (Some(latest.index), Some(latest.pair_id))
                    }
                    None => {
                        warn!("trade index unavailable; stored as NULL, later close will match latest");
                        (None, fill.pair_id)
                    }
                },
                Err(e) => {
                    warn!(error = %e, "position query after fill failed; trade index stored as NULL");
                    (None, fill.pair_id)
                }
            }
        };

        let opened_at = Utc
            .timestamp_millis_opt(fill.timestamp_ms)
            .single()
            .unwrap_or_else(Utc::now);
        let amount_dec = decimal_from_f64(amount);
        let price_dec = decimal_from_f64(fill.price);

        let persisted = async {
            self.store
                .save_order(
                    &self.source,
                    &NewOrder {
                        order_id: fill.order_id.clone(),
                        symbol: symbol.clone(),
                        side: side.as_order_str().to_lowercase(),
                        order_type: "market".to_string(),
                        quantity: amount_dec,
                        price: Some(price_dec),
                        status: "filled".to_string(),
                        tx_hash: fill.tx_hash.clone(),
                        created_at: opened_at,
                    },
                )
                .await?;
            self.store
                .save_position(
                    &self.source,
                    &PositionRecord {
                        symbol: symbol.clone(),
                        side,
                        quantity: amount_dec,
                        entry_price: price_dec,
                        current_price: None,
                        collateral: Some(amount_dec),
                        trade_index,
                        pair_id,
                        opened_at,
                        closed_at: None,
                    },
                )
                .await?;
            self.store
                .save_trade(
                    &self.source,
                    &NewTrade {
                        trade_id: fill
                            .tx_hash
                            .clone()
                            .unwrap_or_else(|| format!("OPEN_{}", fill.timestamp_ms)),
                        order_id: fill.order_id.clone(),
                        symbol: symbol.clone(),
                        side: side.as_order_str().to_lowercase(),
                        quantity: amount_dec,
                        price: price_dec,
                        close_price: None,
                        pnl_percent: None,
                        pnl_amount: None,
                        reason: None,
                        created_at: opened_at,
                    },
                )
                .await?;
            anyhow::Ok(())
        }
        .await;
        if let Err(e) = persisted {
            error!(error = %e, "failed to persist open");
        }

        state.position = Some(side);
        info!(instance_id = %self.instance_id, side = %side, price = fill.price, "position opened");
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close on an explicit close signal: the store is consulted first so a
    /// position opened by a previous process incarnation still closes.
    async fn handle_close_signal(&self, state: &mut EngineState) {
        match self.store.get_open_position(&self.source, None).await {
            Ok(Some(pos)) => {
                state.position = Some(pos.side);
                self.close_locked(state, "signal close").await;
            }
            Ok(None) => {
                if state.position.is_some() {
                    self.close_locked(state, "signal close").await;
                } else {
                    info!(instance_id = %self.instance_id, "no position to close");
                }
            }
            Err(e) => {
                error!(error = %e, "open-position lookup failed");
                if state.position.is_some() {
                    self.close_locked(state, "signal close").await;
                }
            }
        }
    }

    async fn close_locked(&self, state: &mut EngineState, reason: &str) {
        let Some(position_side) = state.position else {
            return;
        };
        let (engine_symbol, leverage) = {
            let cfg = self.cfg.read();
            (cfg.symbol.clone(), cfg.leverage)
        };

        let stored = match self.store.get_open_position(&self.source, None).await {
            Ok(row) => row,
            Err(e) => {
                error!(error = %e, "open-position lookup failed before close");
                None
            }
        };

        let (symbol, side, quantity, entry_price, collateral, trade_index, pair_id, opened_at) =
            match &stored {
                Some(pos) => (
                    pos.symbol.clone(),
                    pos.side,
                    pos.quantity,
                    pos.entry_price,
                    pos.collateral.unwrap_or_else(|| {
                        pos.quantity / Decimal::from(leverage.max(1))
                    }),
                    // A missing trade index is sent as 0: the venue matches
                    // the account's latest trade in that case. The open path
                    // always tries to store the real index first.
                    pos.trade_index.unwrap_or(0),
                    pos.pair_id.unwrap_or(0),
                    pos.opened_at,
                ),
                None => {
                    warn!(instance_id = %self.instance_id,
                        "no stored position, blind-closing latest trade on venue");
                    (
                        engine_symbol.clone(),
                        position_side,
                        Decimal::ZERO,
                        Decimal::ZERO,
                        Decimal::ZERO,
                        0,
                        0,
                        Utc::now(),
                    )
                }
            };

        let current_price = match self.broker.get_price(&symbol).await {
            Ok(price) => price,
            Err(e) => {
                error!(error = %e, "price fetch failed, close aborted for this attempt");
                return;
            }
        };

        info!(
            instance_id = %self.instance_id,
            pair_id,
            trade_index,
            reason,
            "closing position"
        );
        let receipt = match self
            .broker
            .close_position(pair_id, trade_index, current_price)
            .await
        {
            Ok(receipt) => receipt,
            Err(BrokerError::Rejected(msg)) => {
                error!(instance_id = %self.instance_id, error = %msg, "close rejected by broker");
                if let Err(e) = self
                    .store
                    .save_risk_event(
                        &self.source,
                        "broker_rejected",
                        "medium",
                        &format!("close {symbol} rejected: {msg}"),
                        Some(&symbol),
                    )
                    .await
                {
                    error!(error = %e, "failed to persist broker rejection");
                }
                return;
            }
            Err(BrokerError::Network(msg)) => {
                error!(instance_id = %self.instance_id, error = %msg, "close failed on transport");
                return;
            }
        };

        let current_dec = decimal_from_f64(current_price);
        if stored.is_some() {
            let update = PositionRecord {
                symbol: symbol.clone(),
                side,
                quantity,
                entry_price,
                current_price: Some(current_dec),
                collateral: (collateral > Decimal::ZERO).then_some(collateral),
                trade_index: Some(trade_index),
                pair_id: Some(pair_id),
                opened_at,
                closed_at: Some(Utc::now()),
            };
            if let Err(e) = self.store.save_position(&self.source, &update).await {
                error!(error = %e, "failed to persist position close");
            }
        }

        let pnl = compute_pnl(entry_price, current_dec, side, leverage);
        if let Some((pnl_pct, _)) = pnl {
            let pnl_display = pnl_pct * dec!(100);
            info!(
                entry = %entry_price,
                current = %current_dec,
                leverage,
                pnl_percent = %pnl_display,
                "close PnL computed"
            );
        }

        let trade_id = receipt
            .tx_hash
            .clone()
            .unwrap_or_else(|| format!("CLOSE_{}", receipt.timestamp_ms));
        let trade = NewTrade {
            trade_id: trade_id.clone(),
            order_id: trade_id,
            symbol: symbol.clone(),
            side: match position_side {
                Side::Long => "sell".to_string(),
                Side::Short => "buy".to_string(),
            },
            quantity,
            price: current_dec,
            close_price: Some(current_dec),
            pnl_percent: pnl.map(|(pct, _)| pct.round_dp(8)),
            pnl_amount: pnl.map(|(pct, _)| (pct * collateral).round_dp(8)),
            reason: Some(reason.to_string()),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.save_trade(&self.source, &trade).await {
            error!(error = %e, "failed to persist close trade");
        }

        state.position = None;
        info!(instance_id = %self.instance_id, reason, "position closed");
    }

    // -------------------------------------------------------------------------
    // Resync
    // -------------------------------------------------------------------------

    async fn sync_position_locked(&self, state: &mut EngineState) {
        let symbol = self.cfg.read().symbol.clone();

        match self.store.get_open_position(&self.source, Some(&symbol)).await {
            Ok(Some(pos)) => {
                state.position = Some(pos.side);
                debug!(side = %pos.side, quantity = %pos.quantity, "position restored from store");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "store position lookup failed during sync");
                return;
            }
        }

        // Nothing stored: the venue is the fallback source of truth.
        match self.broker.get_positions(Some(&symbol)).await {
            Ok(positions) => {
                if let Some(p) = positions.first() {
                    state.position = Some(p.side);
                    let entry = self.broker.get_price(&symbol).await.unwrap_or(0.0);
                    let record = PositionRecord {
                        symbol: symbol.clone(),
                        side: p.side,
                        quantity: decimal_from_f64(p.collateral),
                        entry_price: decimal_from_f64(entry),
                        current_price: None,
                        collateral: Some(decimal_from_f64(p.collateral)),
                        trade_index: Some(p.index),
                        pair_id: Some(p.pair_id),
                        opened_at: Utc
                            .timestamp_millis_opt(p.opened_at_ms)
                            .single()
                            .unwrap_or_else(Utc::now),
                        closed_at: None,
                    };
                    if let Err(e) = self.store.save_position(&self.source, &record).await {
                        error!(error = %e, "failed to persist venue position during sync");
                    }
                    info!(side = %p.side, "position adopted from venue");
                } else {
                    state.position = None;
                }
            }
            Err(e) => {
                warn!(error = %e, "venue position lookup failed during sync");
                state.position = None;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Watchdogs
    // -------------------------------------------------------------------------

    /// Spawn the risk and market-hours watchdogs for this engine. The
    /// returned handles are aborted when the instance unregisters.
    pub fn spawn_watchdogs(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let risk_engine = self.clone();
        let risk = tokio::spawn(async move {
            info!(instance_id = %risk_engine.instance_id, "risk watchdog started");
            let mut ticker = tokio::time::interval(RISK_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                risk_engine.risk_tick().await;
            }
        });

        let hours_engine = self.clone();
        let hours = tokio::spawn(async move {
            info!(instance_id = %hours_engine.instance_id, "market-hours watchdog started");
            let mut ticker = tokio::time::interval(MARKET_HOURS_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                hours_engine.market_hours_tick().await;
            }
        });

        vec![risk, hours]
    }

    /// One risk-watchdog evaluation: close and halt on a stop-loss breach.
    async fn risk_tick(&self) {
        let mut state = self.state.lock().await;
        if state.is_stopped || state.position.is_none() {
            return;
        }
        let (symbol, leverage, stop_loss) = {
            let cfg = self.cfg.read();
            (cfg.symbol.clone(), cfg.leverage, cfg.stop_loss_percent)
        };

        let pos = match self.store.get_open_position(&self.source, Some(&symbol)).await {
            Ok(Some(pos)) => pos,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "risk watchdog store lookup failed");
                return;
            }
        };
        let current = match self.broker.get_price(&symbol).await {
            Ok(price) => price,
            Err(e) => {
                error!(error = %e, "risk watchdog price fetch failed");
                return;
            }
        };

        let Some((pnl_pct, _)) = compute_pnl(
            pos.entry_price,
            decimal_from_f64(current),
            pos.side,
            leverage,
        ) else {
            return;
        };

        let stop_loss_dec = decimal_from_f64(stop_loss);
        if pnl_pct <= -stop_loss_dec {
            let pnl_display = pnl_pct * dec!(100);
            warn!(
                instance_id = %self.instance_id,
                pnl_percent = %pnl_display,
                stop_loss = stop_loss,
                "stop-loss breached, halting instance"
            );
            if let Err(e) = self
                .store
                .save_risk_event(
                    &self.source,
                    "stop_loss_triggered",
                    "high",
                    &format!(
                        "stop-loss close at {pnl_display:.2}% (limit {:.2}%)",
                        stop_loss * 100.0
                    ),
                    Some(&symbol),
                )
                .await
            {
                error!(error = %e, "failed to persist stop-loss risk event");
            }

            self.close_locked(&mut state, "single-trade stop-loss").await;
            state.is_stopped = true;
            self.alerts
                .notify(&format!(
                    "Stop-loss halt\nloss: {pnl_display:.2}%\nlimit: {:.2}%\nTrading paused until manual reset.",
                    stop_loss * 100.0
                ))
                .await;
        }
    }

    /// One market-hours evaluation: auto-close during forbidden hours.
    async fn market_hours_tick(&self) {
        let forbidden = self.cfg.read().forbidden_hours.clone();
        if !forbidden.contains(&self.current_hour()) {
            return;
        }
        let mut state = self.state.lock().await;
        if state.position.is_some() {
            info!(instance_id = %self.instance_id, "forbidden hour entered, auto-closing position");
            self.close_locked(&mut state, "market-hours auto-close").await;
        }
    }

    fn current_hour(&self) -> u8 {
        use chrono::Timelike;
        Utc::now().with_timezone(&Shanghai).hour() as u8
    }
}

impl std::fmt::Debug for TradingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingEngine")
            .field("instance_id", &self.instance_id)
            .field("source", &self.source)
            .field("config", &self.cfg.read().clone())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PnL
// ---------------------------------------------------------------------------

/// Leveraged PnL fraction and the raw price delta fraction. Returns `None`
/// when either price is below the sanity floor.
fn compute_pnl(
    entry: Decimal,
    current: Decimal,
    side: Side,
    leverage: u32,
) -> Option<(Decimal, Decimal)> {
    if entry < MIN_SANE_PRICE || current < MIN_SANE_PRICE {
        warn!(%entry, %current, "implausible price, PnL skipped");
        return None;
    }
    let mut diff = (current - entry) / entry;
    if side == Side::Short {
        diff = -diff;
    }
    Some((diff * Decimal::from(leverage), diff))
}
