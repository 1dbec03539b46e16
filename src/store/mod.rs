// =============================================================================
// Signal Store — SQLite persistence for orders, trades, positions and config
// =============================================================================
//
// One pooled connection set, one short transaction per write. Decimal
// columns are stored as canonical decimal strings and surfaced as
// `rust_decimal::Decimal`; idempotency on `trades.trade_id` replaces any
// need for cross-entity transactions.
//
// Every table that crosses exchanges carries a `source` discriminator
// ("ostium_{instance}", "hyperliquid_{instance}", …).
// =============================================================================

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info, warn};

use crate::types::Side;

/// Instance type labels for user-instance bindings.
pub const INSTANCE_TYPE_LIVE: &str = "live";
pub const INSTANCE_TYPE_CURRENCY_MONITOR: &str = "currency_monitor";
/// Binding row id that carries the process-wide monitor configuration.
const MONITOR_SINGLETON_ID: &str = "singleton";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A new order row (append-only).
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub status: String,
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A new trade row; inserts are idempotent on `trade_id`.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub trade_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub close_price: Option<Decimal>,
    pub pnl_percent: Option<Decimal>,
    pub pnl_amount: Option<Decimal>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Upsert payload for a position. Merged into the open row matching
/// `(source, symbol, side)` when one exists, otherwise inserted.
#[derive(Debug, Clone)]
pub struct PositionRecord {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Option<Decimal>,
    pub collateral: Option<Decimal>,
    pub trade_index: Option<i64>,
    pub pair_id: Option<i64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// A stored position row.
#[derive(Debug, Clone)]
pub struct PositionRow {
    pub id: i64,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub collateral: Option<Decimal>,
    pub trade_index: Option<i64>,
    pub pair_id: Option<i64>,
    pub opened_at: DateTime<Utc>,
}

/// A stored risk event row.
#[derive(Debug, Clone)]
pub struct RiskEventRow {
    pub event_type: String,
    pub severity: String,
    pub description: String,
}

/// A stored trade row.
#[derive(Debug, Clone)]
pub struct TradeRow {
    pub trade_id: String,
    pub symbol: String,
    pub side: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub pnl_percent: Option<Decimal>,
    pub pnl_amount: Option<Decimal>,
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SignalStore {
    pool: SqlitePool,
}

impl SignalStore {
    /// Connect to `url` (e.g. "sqlite://data/borealis.db" or
    /// "sqlite::memory:") and bootstrap the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        if let Some(path_part) = url.strip_prefix("sqlite://") {
            if let Some(parent) = std::path::Path::new(path_part).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)
                        .context("failed to create database directory")?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(url)
            .context("invalid database url")?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        // A pooled `:memory:` database is one database per connection;
        // collapse the pool so every caller sees the same schema.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("failed to connect to SQLite database")?;

        info!(url, "signal store connected");

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS market_data (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL DEFAULT 'backpack',
                symbol TEXT NOT NULL,
                timestamp DATETIME NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL
            );
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_market_symbol_ts_source
            ON market_data (symbol, timestamp, source);
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT 'backpack',
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT,
                status TEXT NOT NULL,
                tx_hash TEXT,
                created_at DATETIME NOT NULL,
                UNIQUE (order_id, source)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL DEFAULT 'backpack',
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                current_price TEXT,
                unrealized_pnl TEXT,
                unrealized_pnl_percent TEXT,
                trade_index INTEGER,
                pair_id INTEGER,
                collateral TEXT,
                opened_at DATETIME NOT NULL,
                updated_at DATETIME,
                closed_at DATETIME
            );
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_positions_open
            ON positions (source, symbol, side, closed_at);
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id TEXT NOT NULL UNIQUE,
                order_id TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT 'backpack',
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                close_price TEXT,
                pnl_percent TEXT,
                pnl_amount TEXT,
                reason TEXT,
                created_at DATETIME NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS risk_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL DEFAULT 'backpack',
                event_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                description TEXT NOT NULL,
                affected_symbols TEXT,
                created_at DATETIME NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS portfolio_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL DEFAULT 'backpack',
                portfolio_value TEXT NOT NULL,
                cash_balance TEXT NOT NULL,
                position_value TEXT NOT NULL,
                daily_return TEXT,
                timestamp DATETIME NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                created_at DATETIME NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS user_instances (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                instance_type TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                config_json TEXT,
                created_at DATETIME NOT NULL,
                UNIQUE (user_id, instance_type, instance_id)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS strategy_config (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                params_json TEXT,
                enabled INTEGER NOT NULL DEFAULT 1
            );
            "#,
        ];

        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context("schema bootstrap statement failed")?;
        }
        debug!("signal store schema ready");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    pub async fn save_order(&self, source: &str, order: &NewOrder) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (order_id, source, symbol, side, order_type,
                                quantity, price, status, tx_hash, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (order_id, source) DO UPDATE SET
                status = excluded.status,
                tx_hash = excluded.tx_hash
            "#,
        )
        .bind(truncate_id(&order.order_id))
        .bind(source)
        .bind(&order.symbol)
        .bind(&order.side)
        .bind(&order.order_type)
        .bind(order.quantity.to_string())
        .bind(order.price.map(|p| p.to_string()))
        .bind(&order.status)
        .bind(order.tx_hash.as_deref().map(truncate_id))
        .bind(order.created_at)
        .execute(&self.pool)
        .await
        .context("failed to save order")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    /// Insert a trade. A duplicate `trade_id` is silently dropped.
    pub async fn save_trade(&self, source: &str, trade: &NewTrade) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO trades (trade_id, order_id, source, symbol, side,
                                          quantity, price, close_price, pnl_percent,
                                          pnl_amount, reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(truncate_id(&trade.trade_id))
        .bind(truncate_id(&trade.order_id))
        .bind(source)
        .bind(&trade.symbol)
        .bind(&trade.side)
        .bind(trade.quantity.to_string())
        .bind(trade.price.to_string())
        .bind(trade.close_price.map(|p| p.to_string()))
        .bind(trade.pnl_percent.map(|p| p.to_string()))
        .bind(trade.pnl_amount.map(|p| p.to_string()))
        .bind(trade.reason.as_deref())
        .bind(trade.created_at)
        .execute(&self.pool)
        .await
        .context("failed to save trade")?;

        if result.rows_affected() == 0 {
            debug!(trade_id = %trade.trade_id, "duplicate trade insert dropped");
        }
        Ok(())
    }

    /// Recent trades for `source`, newest first.
    pub async fn list_trades(&self, source: &str, limit: i64) -> Result<Vec<TradeRow>> {
        type Row = (
            String,
            String,
            String,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
        );
        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT trade_id, symbol, side, quantity, price,
                   pnl_percent, pnl_amount, reason
            FROM trades WHERE source = $1
            ORDER BY id DESC LIMIT $2
            "#,
        )
        .bind(source)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list trades")?;

        Ok(rows
            .into_iter()
            .map(
                |(trade_id, symbol, side, quantity, price, pnl_pct, pnl_amt, reason)| TradeRow {
                    trade_id,
                    symbol,
                    side,
                    quantity: parse_decimal(&quantity),
                    price: parse_decimal(&price),
                    pnl_percent: pnl_pct.as_deref().map(parse_decimal),
                    pnl_amount: pnl_amt.as_deref().map(parse_decimal),
                    reason,
                },
            )
            .collect())
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// Merge-save a position: the open row matching `(source, symbol, side)`
    /// is updated in place (including setting `closed_at`), otherwise a new
    /// row is inserted.
    pub async fn save_position(&self, source: &str, record: &PositionRecord) -> Result<()> {
        let existing: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM positions
            WHERE source = $1 AND symbol = $2 AND side = $3 AND closed_at IS NULL
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(source)
        .bind(&record.symbol)
        .bind(record.side.as_db_str())
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up open position")?;

        if let Some((id,)) = existing {
            sqlx::query(
                r#"
                UPDATE positions SET
                    quantity = $1, entry_price = $2, current_price = $3,
                    trade_index = $4, pair_id = $5,
                    collateral = COALESCE($6, collateral),
                    updated_at = $7, closed_at = $8
                WHERE id = $9
                "#,
            )
            .bind(record.quantity.to_string())
            .bind(record.entry_price.to_string())
            .bind(record.current_price.map(|p| p.to_string()))
            .bind(record.trade_index)
            .bind(record.pair_id)
            .bind(record.collateral.map(|c| c.to_string()))
            .bind(Utc::now())
            .bind(record.closed_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to update position")?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO positions (source, symbol, side, quantity, entry_price,
                                       current_price, trade_index, pair_id, collateral,
                                       opened_at, updated_at, closed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(source)
            .bind(&record.symbol)
            .bind(record.side.as_db_str())
            .bind(record.quantity.to_string())
            .bind(record.entry_price.to_string())
            .bind(record.current_price.map(|p| p.to_string()))
            .bind(record.trade_index)
            .bind(record.pair_id)
            .bind(record.collateral.map(|c| c.to_string()))
            .bind(record.opened_at)
            .bind(Utc::now())
            .bind(record.closed_at)
            .execute(&self.pool)
            .await
            .context("failed to insert position")?;
        }
        Ok(())
    }

    /// Newest open position for `source`, optionally narrowed to a symbol.
    pub async fn get_open_position(
        &self,
        source: &str,
        symbol: Option<&str>,
    ) -> Result<Option<PositionRow>> {
        type Row = (
            i64,
            String,
            String,
            String,
            String,
            Option<String>,
            Option<i64>,
            Option<i64>,
            DateTime<Utc>,
        );
        let query = match symbol {
            Some(_) => {
                r#"
                SELECT id, symbol, side, quantity, entry_price, collateral,
                       trade_index, pair_id, opened_at
                FROM positions
                WHERE source = $1 AND closed_at IS NULL AND symbol = $2
                ORDER BY id DESC LIMIT 1
                "#
            }
            None => {
                r#"
                SELECT id, symbol, side, quantity, entry_price, collateral,
                       trade_index, pair_id, opened_at
                FROM positions
                WHERE source = $1 AND closed_at IS NULL
                ORDER BY id DESC LIMIT 1
                "#
            }
        };

        let mut q = sqlx::query_as::<_, Row>(query).bind(source);
        if let Some(sym) = symbol {
            q = q.bind(sym);
        }
        let row = q
            .fetch_optional(&self.pool)
            .await
            .context("failed to query open position")?;

        Ok(row.and_then(
            |(id, symbol, side, quantity, entry_price, collateral, trade_index, pair_id, opened_at)| {
                let side = Side::from_db_str(&side)?;
                Some(PositionRow {
                    id,
                    symbol,
                    side,
                    quantity: parse_decimal(&quantity),
                    entry_price: parse_decimal(&entry_price),
                    collateral: collateral.as_deref().map(parse_decimal),
                    trade_index,
                    pair_id,
                    opened_at,
                })
            },
        ))
    }

    /// Number of open positions for `source` (optionally per symbol).
    pub async fn open_position_count(&self, source: &str, symbol: Option<&str>) -> Result<i64> {
        let (count,): (i64,) = match symbol {
            Some(sym) => {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM positions WHERE source = $1 AND closed_at IS NULL AND symbol = $2",
                )
                .bind(source)
                .bind(sym)
                .fetch_one(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM positions WHERE source = $1 AND closed_at IS NULL",
                )
                .bind(source)
                .fetch_one(&self.pool)
                .await
            }
        }
        .context("failed to count open positions")?;
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Risk events & portfolio snapshots
    // -------------------------------------------------------------------------

    pub async fn save_risk_event(
        &self,
        source: &str,
        event_type: &str,
        severity: &str,
        description: &str,
        affected_symbols: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO risk_events (source, event_type, severity, description,
                                     affected_symbols, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(source)
        .bind(event_type)
        .bind(severity)
        .bind(description)
        .bind(affected_symbols)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to save risk event")?;
        Ok(())
    }

    /// Recent risk events for `source`, newest first.
    pub async fn list_risk_events(
        &self,
        source: &str,
        limit: i64,
    ) -> Result<Vec<RiskEventRow>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT event_type, severity, description
            FROM risk_events WHERE source = $1
            ORDER BY id DESC LIMIT $2
            "#,
        )
        .bind(source)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list risk events")?;
        Ok(rows
            .into_iter()
            .map(|(event_type, severity, description)| RiskEventRow {
                event_type,
                severity,
                description,
            })
            .collect())
    }

    pub async fn save_portfolio_snapshot(
        &self,
        source: &str,
        portfolio_value: Decimal,
        cash_balance: Decimal,
        position_value: Decimal,
        daily_return: Option<Decimal>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO portfolio_history (source, portfolio_value, cash_balance,
                                           position_value, daily_return, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(source)
        .bind(portfolio_value.to_string())
        .bind(cash_balance.to_string())
        .bind(position_value.to_string())
        .bind(daily_return.map(|d| d.to_string()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to save portfolio snapshot")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    pub async fn save_market_data(
        &self,
        source: &str,
        symbol: &str,
        candles: &[crate::market::Candle],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to begin tx")?;
        for candle in candles {
            let ts = DateTime::<Utc>::from_timestamp_millis(candle.close_time)
                .unwrap_or_else(Utc::now);
            sqlx::query(
                r#"
                INSERT INTO market_data (source, symbol, timestamp, open, high, low, close, volume)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(source)
            .bind(symbol)
            .bind(ts)
            .bind(decimal_from_f64(candle.open).to_string())
            .bind(decimal_from_f64(candle.high).to_string())
            .bind(decimal_from_f64(candle.low).to_string())
            .bind(decimal_from_f64(candle.close).to_string())
            .bind(decimal_from_f64(candle.volume).to_string())
            .execute(&mut *tx)
            .await
            .context("failed to insert market data row")?;
        }
        tx.commit().await.context("failed to commit market data")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Users & instance bindings
    // -------------------------------------------------------------------------

    /// Insert a user if absent and return its id.
    pub async fn ensure_user(&self, username: &str) -> Result<i64> {
        sqlx::query("INSERT OR IGNORE INTO users (username, created_at) VALUES ($1, $2)")
            .bind(username)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("failed to insert user")?;
        let (id,): (i64,) = sqlx::query_as("SELECT id FROM users WHERE username = $1")
            .bind(username)
            .fetch_one(&self.pool)
            .await
            .context("failed to read back user id")?;
        Ok(id)
    }

    pub async fn get_first_user_id(&self) -> Result<Option<i64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM users ORDER BY id LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .context("failed to query first user")?;
        Ok(row.map(|(id,)| id))
    }

    /// Upsert a user-instance binding. `config_json` must never contain
    /// secrets.
    pub async fn save_user_instance(
        &self,
        user_id: i64,
        instance_type: &str,
        instance_id: &str,
        config_json: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_instances (user_id, instance_type, instance_id, config_json, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, instance_type, instance_id) DO UPDATE SET
                config_json = excluded.config_json
            "#,
        )
        .bind(user_id)
        .bind(instance_type)
        .bind(instance_id)
        .bind(config_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to save user instance")?;
        Ok(())
    }

    pub async fn delete_user_instance(
        &self,
        user_id: i64,
        instance_type: &str,
        instance_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM user_instances WHERE user_id = $1 AND instance_type = $2 AND instance_id = $3",
        )
        .bind(user_id)
        .bind(instance_type)
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .context("failed to delete user instance")?;
        Ok(())
    }

    pub async fn get_user_instance_ids(
        &self,
        user_id: i64,
        instance_type: &str,
    ) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT instance_id FROM user_instances WHERE user_id = $1 AND instance_type = $2 ORDER BY id",
        )
        .bind(user_id)
        .bind(instance_type)
        .fetch_all(&self.pool)
        .await
        .context("failed to query user instance ids")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn get_user_instance_configs(
        &self,
        user_id: i64,
        instance_type: &str,
    ) -> Result<Vec<(String, Option<String>)>> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT instance_id, config_json FROM user_instances WHERE user_id = $1 AND instance_type = $2 ORDER BY id",
        )
        .bind(user_id)
        .bind(instance_type)
        .fetch_all(&self.pool)
        .await
        .context("failed to query user instance configs")?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Currency-monitor singleton config
    // -------------------------------------------------------------------------

    /// Store the process-wide monitor configuration under the first user's
    /// binding row. Skipped with a warning when no user exists yet.
    pub async fn save_currency_monitor_config(&self, config_json: &str) -> Result<()> {
        self.delete_currency_monitor_config().await?;
        match self.get_first_user_id().await? {
            Some(user_id) => {
                self.save_user_instance(
                    user_id,
                    INSTANCE_TYPE_CURRENCY_MONITOR,
                    MONITOR_SINGLETON_ID,
                    Some(config_json),
                )
                .await
            }
            None => {
                warn!("monitor config not saved: no users exist yet");
                Ok(())
            }
        }
    }

    /// The process-wide monitor configuration, regardless of owning user.
    pub async fn get_currency_monitor_config(&self) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT config_json FROM user_instances WHERE instance_type = $1 AND instance_id = $2 LIMIT 1",
        )
        .bind(INSTANCE_TYPE_CURRENCY_MONITOR)
        .bind(MONITOR_SINGLETON_ID)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query monitor config")?;
        Ok(row.and_then(|(json,)| json))
    }

    pub async fn delete_currency_monitor_config(&self) -> Result<()> {
        sqlx::query("DELETE FROM user_instances WHERE instance_type = $1 AND instance_id = $2")
            .bind(INSTANCE_TYPE_CURRENCY_MONITOR)
            .bind(MONITOR_SINGLETON_ID)
            .execute(&self.pool)
            .await
            .context("failed to delete monitor config")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Exchange order ids and transaction hashes can be arbitrarily long; keep
/// them inside the column budget.
fn truncate_id(id: &str) -> String {
    id.chars().take(250).collect()
}

fn parse_decimal(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or_default()
}

/// Convert boundary floats into decimals, falling back to zero on
/// non-finite input.
pub fn decimal_from_f64(value: f64) -> Decimal {
    use rust_decimal::prelude::FromPrimitive;
    Decimal::from_f64(value).unwrap_or_default()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn memory_store() -> SignalStore {
        SignalStore::connect("sqlite::memory:").await.unwrap()
    }

    fn sample_trade(trade_id: &str) -> NewTrade {
        NewTrade {
            trade_id: trade_id.to_string(),
            order_id: "1".to_string(),
            symbol: "ETHUSDT".to_string(),
            side: "buy".to_string(),
            quantity: dec!(5),
            price: dec!(3000.5),
            close_price: None,
            pnl_percent: None,
            pnl_amount: None,
            reason: None,
            created_at: Utc::now(),
        }
    }

    fn sample_position(symbol: &str, side: Side) -> PositionRecord {
        PositionRecord {
            symbol: symbol.to_string(),
            side,
            quantity: dec!(5),
            entry_price: dec!(3000),
            current_price: None,
            collateral: Some(dec!(5)),
            trade_index: Some(7),
            pair_id: Some(12),
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    #[tokio::test]
    async fn duplicate_trade_insert_is_dropped() {
        let store = memory_store().await;
        store.save_trade("ostium_a", &sample_trade("0xdup")).await.unwrap();
        store.save_trade("ostium_a", &sample_trade("0xdup")).await.unwrap();

        let trades = store.list_trades("ostium_a", 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].trade_id, "0xdup");
    }

    #[tokio::test]
    async fn position_merge_keeps_single_open_row() {
        let store = memory_store().await;
        store
            .save_position("ostium_a", &sample_position("ETHUSDT", Side::Long))
            .await
            .unwrap();
        store
            .save_position("ostium_a", &sample_position("ETHUSDT", Side::Long))
            .await
            .unwrap();

        assert_eq!(store.open_position_count("ostium_a", None).await.unwrap(), 1);

        let pos = store
            .get_open_position("ostium_a", Some("ETHUSDT"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pos.side, Side::Long);
        assert_eq!(pos.entry_price, dec!(3000));
        assert_eq!(pos.trade_index, Some(7));
    }

    #[tokio::test]
    async fn closing_position_clears_open_lookup() {
        let store = memory_store().await;
        store
            .save_position("ostium_a", &sample_position("ETHUSDT", Side::Long))
            .await
            .unwrap();

        let mut closed = sample_position("ETHUSDT", Side::Long);
        closed.closed_at = Some(Utc::now());
        closed.current_price = Some(dec!(3100));
        store.save_position("ostium_a", &closed).await.unwrap();

        assert!(store
            .get_open_position("ostium_a", None)
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.open_position_count("ostium_a", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn open_positions_are_isolated_by_source() {
        let store = memory_store().await;
        store
            .save_position("ostium_a", &sample_position("ETHUSDT", Side::Long))
            .await
            .unwrap();
        store
            .save_position("hyperliquid_b", &sample_position("ETHUSDT", Side::Short))
            .await
            .unwrap();

        let a = store.get_open_position("ostium_a", None).await.unwrap().unwrap();
        let b = store
            .get_open_position("hyperliquid_b", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.side, Side::Long);
        assert_eq!(b.side, Side::Short);
    }

    #[tokio::test]
    async fn order_save_and_conflict_update() {
        let store = memory_store().await;
        let mut order = NewOrder {
            order_id: "o-1".into(),
            symbol: "ETHUSDT".into(),
            side: "buy".into(),
            order_type: "market".into(),
            quantity: dec!(5),
            price: Some(dec!(3000)),
            status: "new".into(),
            tx_hash: None,
            created_at: Utc::now(),
        };
        store.save_order("ostium_a", &order).await.unwrap();
        order.status = "filled".into();
        order.tx_hash = Some("0xabc".into());
        store.save_order("ostium_a", &order).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn risk_event_and_portfolio_rows_persist() {
        let store = memory_store().await;
        store
            .save_risk_event("ostium_a", "stop_loss_triggered", "high", "breach", Some("ETHUSDT"))
            .await
            .unwrap();
        store
            .save_portfolio_snapshot("ostium_a", dec!(100), dec!(60), dec!(40), Some(dec!(0.5)))
            .await
            .unwrap();

        let (events,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM risk_events")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let (snaps,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM portfolio_history")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!((events, snaps), (1, 1));
    }

    #[tokio::test]
    async fn market_data_batch_insert() {
        let store = memory_store().await;
        let candles = vec![
            crate::market::Candle {
                open_time: 0,
                close_time: 59_999,
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 10.0,
            };
            3
        ];
        store.save_market_data("backpack", "ETHUSDT", &candles).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM market_data")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn user_instance_binding_roundtrip() {
        let store = memory_store().await;
        let uid = store.ensure_user("operator").await.unwrap();

        store
            .save_user_instance(uid, INSTANCE_TYPE_LIVE, "acct1", Some(r#"{"symbol":"ETH"}"#))
            .await
            .unwrap();
        store
            .save_user_instance(uid, INSTANCE_TYPE_LIVE, "acct1", Some(r#"{"symbol":"BTC"}"#))
            .await
            .unwrap();

        let ids = store.get_user_instance_ids(uid, INSTANCE_TYPE_LIVE).await.unwrap();
        assert_eq!(ids, vec!["acct1"]);

        let configs = store
            .get_user_instance_configs(uid, INSTANCE_TYPE_LIVE)
            .await
            .unwrap();
        assert_eq!(configs[0].1.as_deref(), Some(r#"{"symbol":"BTC"}"#));

        store
            .delete_user_instance(uid, INSTANCE_TYPE_LIVE, "acct1")
            .await
            .unwrap();
        assert!(store
            .get_user_instance_ids(uid, INSTANCE_TYPE_LIVE)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn monitor_config_singleton_roundtrip() {
        let store = memory_store().await;

        // Without a user the save is skipped.
        store.save_currency_monitor_config("{}").await.unwrap();
        assert!(store.get_currency_monitor_config().await.unwrap().is_none());

        store.ensure_user("operator").await.unwrap();
        store
            .save_currency_monitor_config(r#"{"pairs":[]}"#)
            .await
            .unwrap();
        assert_eq!(
            store.get_currency_monitor_config().await.unwrap().as_deref(),
            Some(r#"{"pairs":[]}"#)
        );

        store.delete_currency_monitor_config().await.unwrap();
        assert!(store.get_currency_monitor_config().await.unwrap().is_none());
    }

    #[test]
    fn decimal_boundary_conversion() {
        assert_eq!(decimal_from_f64(2.5), dec!(2.5));
        assert_eq!(decimal_from_f64(f64::NAN), Decimal::ZERO);
    }

    #[test]
    fn id_truncation() {
        let long = "x".repeat(400);
        assert_eq!(truncate_id(&long).len(), 250);
        assert_eq!(truncate_id("short"), "short");
    }
}
