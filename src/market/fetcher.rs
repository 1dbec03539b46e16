// =============================================================================
// Candle Fetcher — REST market data with paging, back-off and symbol cache
// =============================================================================
//
// Public (unsigned) perpetual-futures endpoints only. Batch retrieval pages
// backwards through history using the first bar's open time minus 1 ms as
// the next end time, sleeping at least one second between pages to stay
// inside the provider's rate limits. A transport error mid-batch returns
// whatever was already collected; only a failing first page is an error.
// =============================================================================

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::market::Candle;

/// Futures REST API base.
const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";

/// Kline and exchange-info request timeout.
const KLINES_TIMEOUT: Duration = Duration::from_secs(20);
/// Order-book depth request timeout.
const DEPTH_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause between backward pages of a batch fetch.
const PAGE_PAUSE: Duration = Duration::from_secs(1);
/// How long the perpetual-symbol list stays fresh.
const SYMBOLS_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Fallback symbol list when the exchange has never answered.
const FALLBACK_SYMBOLS: [&str; 8] = [
    "BTCUSDT",
    "ETHUSDT",
    "BNBUSDT",
    "SOLUSDT",
    "XRPUSDT",
    "1000SHIBUSDT",
    "1000PEPEUSDT",
    "DOGEUSDT",
];

/// Top-of-book depth snapshot: `(price, quantity)` levels, best first.
#[derive(Debug, Clone, Default)]
pub struct DepthSnapshot {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

/// Seam between the monitor loops and the transport, so tests can script
/// candle batches without a network.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Most recent `limit` candles for `(symbol, interval)`, ascending.
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>>;
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// REST candle fetcher with a cached symbol list.
pub struct CandleFetcher {
    client: reqwest::Client,
    base_url: String,
    symbols_cache: RwLock<Option<(Vec<String>, Instant)>>,
}

impl CandleFetcher {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Construct against a custom base URL (used by tests against a local
    /// stub server).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(KLINES_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: base_url.into(),
            symbols_cache: RwLock::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Klines
    // -------------------------------------------------------------------------

    /// Fetch up to `limit` most recent candles, ascending by time.
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        self.fetch_klines_page(symbol, interval, limit, None).await
    }

    async fn fetch_klines_page(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        end_time: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let mut url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol.to_uppercase(),
            interval,
            limit
        );
        if let Some(end) = end_time {
            url.push_str(&format!("&endTime={end}"));
        }

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("klines request for {symbol} returned {status}: {body}");
        }

        let raw = body.as_array().context("klines response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 7 {
                warn!(len = arr.len(), "skipping malformed kline entry");
                continue;
            }
            candles.push(Candle {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: parse_str_f64(&arr[1])?,
                high: parse_str_f64(&arr[2])?,
                low: parse_str_f64(&arr[3])?,
                close: parse_str_f64(&arr[4])?,
                volume: parse_str_f64(&arr[5])?,
                close_time: arr[6].as_i64().unwrap_or(0),
            });
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// Fetch up to `total_limit` candles by paging backwards from
    /// `end_time` (or from now). Pages are `batch_size` bars long and the
    /// fetcher sleeps between pages. The result is ascending and may be
    /// shorter than requested: a transport error after the first page
    /// returns the partial batch.
    pub async fn fetch_batch(
        &self,
        symbol: &str,
        interval: &str,
        total_limit: u32,
        batch_size: u32,
        end_time: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let batch_size = batch_size.max(1);
        let mut result: Vec<Candle> = Vec::new();
        let mut remaining = total_limit;
        let mut end = end_time;

        while remaining > 0 {
            let limit = remaining.min(batch_size);
            let page = match self.fetch_klines_page(symbol, interval, limit, end).await {
                Ok(page) => page,
                Err(e) => {
                    if result.is_empty() {
                        return Err(e.context("first page of batch fetch failed"));
                    }
                    warn!(symbol, error = %e, collected = result.len(),
                        "batch fetch aborted mid-way, returning partial result");
                    return Ok(result);
                }
            };
            if page.is_empty() {
                break;
            }

            let page_len = page.len() as u32;
            let first_open = page[0].open_time;
            // Earlier pages are prepended so the result stays ascending.
            let mut merged = page;
            merged.extend(result);
            result = merged;

            if page_len < limit {
                break;
            }
            end = Some(first_open - 1);
            remaining = remaining.saturating_sub(page_len);
            if remaining > 0 {
                tokio::time::sleep(PAGE_PAUSE).await;
            }
        }

        Ok(result)
    }

    // -------------------------------------------------------------------------
    // Depth
    // -------------------------------------------------------------------------

    /// Fetch the top `limit` order-book levels per side.
    pub async fn fetch_depth(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot> {
        let url = format!(
            "{}/fapi/v1/depth?symbol={}&limit={}",
            self.base_url,
            symbol.to_uppercase(),
            limit
        );

        let resp = self
            .client
            .get(&url)
            .timeout(DEPTH_TIMEOUT)
            .send()
            .await
            .context("GET /fapi/v1/depth request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse depth response")?;
        if !status.is_success() {
            anyhow::bail!("depth request for {symbol} returned {status}: {body}");
        }

        Ok(DepthSnapshot {
            bids: parse_depth_levels(body.get("bids")),
            asks: parse_depth_levels(body.get("asks")),
        })
    }

    // -------------------------------------------------------------------------
    // Symbol list (cached)
    // -------------------------------------------------------------------------

    /// Sorted list of USDT perpetual symbols in TRADING status.
    ///
    /// Cached for one hour. On failure the previous cache is served; with no
    /// cache at all a hard-coded list of common perpetuals is returned.
    pub async fn fetch_symbols_usdt(&self) -> Vec<String> {
        if let Some((cached, at)) = self.symbols_cache.read().as_ref() {
            if at.elapsed() < SYMBOLS_CACHE_TTL {
                return cached.clone();
            }
        }

        match self.fetch_exchange_symbols().await {
            Ok(symbols) => {
                info!(count = symbols.len(), "perpetual symbol list cached");
                *self.symbols_cache.write() = Some((symbols.clone(), Instant::now()));
                symbols
            }
            Err(e) => {
                warn!(error = %e, "symbol list fetch failed");
                if let Some((cached, _)) = self.symbols_cache.read().as_ref() {
                    return cached.clone();
                }
                FALLBACK_SYMBOLS.iter().map(|s| s.to_string()).collect()
            }
        }
    }

    async fn fetch_exchange_symbols(&self) -> Result<Vec<String>> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/exchangeInfo request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse exchangeInfo response")?;
        if !status.is_success() {
            anyhow::bail!("exchangeInfo returned {status}");
        }

        let mut symbols: Vec<String> = body["symbols"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter(|s| {
                        s["quoteAsset"].as_str() == Some("USDT")
                            && s["status"].as_str() == Some("TRADING")
                            && s["contractType"].as_str() == Some("PERPETUAL")
                    })
                    .filter_map(|s| s["symbol"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        symbols.sort();
        Ok(symbols)
    }
}

impl Default for CandleFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CandleSource for CandleFetcher {
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        self.fetch_klines(symbol, interval, limit).await
    }
}

// ---------------------------------------------------------------------------
// Parse helpers
// ---------------------------------------------------------------------------

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

fn parse_depth_levels(levels: Option<&serde_json::Value>) -> Vec<(f64, f64)> {
    let Some(arr) = levels.and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|lv| {
            let pair = lv.as_array()?;
            let px = parse_str_f64(pair.first()?).ok()?;
            let qty = parse_str_f64(pair.get(1)?).ok()?;
            Some((px, qty))
        })
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_str_f64_accepts_both_forms() {
        assert_eq!(parse_str_f64(&serde_json::json!("3.14")).unwrap(), 3.14);
        assert_eq!(parse_str_f64(&serde_json::json!(2.5)).unwrap(), 2.5);
        assert!(parse_str_f64(&serde_json::json!("abc")).is_err());
        assert!(parse_str_f64(&serde_json::json!(null)).is_err());
    }

    #[test]
    fn depth_levels_skip_malformed_entries() {
        let raw = serde_json::json!([["100.5", "2"], ["bad"], ["101.0", "0.5"]]);
        let levels = parse_depth_levels(Some(&raw));
        assert_eq!(levels, vec![(100.5, 2.0), (101.0, 0.5)]);
    }

    #[test]
    fn depth_levels_tolerate_missing_array() {
        assert!(parse_depth_levels(None).is_empty());
        assert!(parse_depth_levels(Some(&serde_json::json!("nope"))).is_empty());
    }

    #[test]
    fn fallback_symbols_are_eight_sorted_perps() {
        assert_eq!(FALLBACK_SYMBOLS.len(), 8);
        assert!(FALLBACK_SYMBOLS.contains(&"ETHUSDT"));
    }

    // -----------------------------------------------------------------------
    // Stub-server tests for paging and caching semantics
    // -----------------------------------------------------------------------

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Stub {
        kline_responses: parking_lot::Mutex<VecDeque<(u16, serde_json::Value)>>,
        kline_queries: parking_lot::Mutex<Vec<String>>,
        exchange_info: serde_json::Value,
        exchange_info_hits: AtomicU32,
    }

    fn kline_entry(open_time: i64) -> serde_json::Value {
        serde_json::json!([
            open_time, "100.0", "101.0", "99.0", "100.5", "10.0", open_time + 59_999
        ])
    }

    async fn spawn_stub(stub: Arc<Stub>) -> String {
        use axum::extract::{RawQuery, State};
        use axum::http::StatusCode;
        use axum::routing::get;

        async fn klines(
            State(stub): State<Arc<Stub>>,
            RawQuery(query): RawQuery,
        ) -> (StatusCode, axum::Json<serde_json::Value>) {
            stub.kline_queries.lock().push(query.unwrap_or_default());
            match stub.kline_responses.lock().pop_front() {
                Some((status, body)) => (
                    StatusCode::from_u16(status).unwrap(),
                    axum::Json(body),
                ),
                None => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    axum::Json(serde_json::json!({"msg": "no scripted response"})),
                ),
            }
        }

        async fn exchange_info(
            State(stub): State<Arc<Stub>>,
        ) -> axum::Json<serde_json::Value> {
            stub.exchange_info_hits.fetch_add(1, Ordering::SeqCst);
            axum::Json(stub.exchange_info.clone())
        }

        let app = axum::Router::new()
            .route("/fapi/v1/klines", get(klines))
            .route("/fapi/v1/exchangeInfo", get(exchange_info))
            .with_state(stub);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn stub_with_pages(pages: Vec<(u16, serde_json::Value)>) -> Arc<Stub> {
        Arc::new(Stub {
            kline_responses: parking_lot::Mutex::new(pages.into()),
            kline_queries: parking_lot::Mutex::new(Vec::new()),
            exchange_info: serde_json::json!({
                "symbols": [
                    {"symbol": "ETHUSDT", "quoteAsset": "USDT", "status": "TRADING", "contractType": "PERPETUAL"},
                    {"symbol": "BTCUSDT", "quoteAsset": "USDT", "status": "TRADING", "contractType": "PERPETUAL"},
                    {"symbol": "ETHBTC", "quoteAsset": "BTC", "status": "TRADING", "contractType": "PERPETUAL"},
                    {"symbol": "OLDUSDT", "quoteAsset": "USDT", "status": "BREAK", "contractType": "PERPETUAL"},
                    {"symbol": "ETHUSDT_240628", "quoteAsset": "USDT", "status": "TRADING", "contractType": "CURRENT_QUARTER"}
                ]
            }),
            exchange_info_hits: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn batch_fetch_pages_backwards_and_merges_ascending() {
        let stub = stub_with_pages(vec![
            (200, serde_json::json!([kline_entry(300), kline_entry(400)])),
            (200, serde_json::json!([kline_entry(100), kline_entry(200)])),
        ]);
        let base = spawn_stub(stub.clone()).await;
        let fetcher = CandleFetcher::with_base_url(base);

        let batch = fetcher
            .fetch_batch("ethusdt", "1h", 4, 2, None)
            .await
            .unwrap();
        let open_times: Vec<i64> = batch.iter().map(|c| c.open_time).collect();
        assert_eq!(open_times, vec![100, 200, 300, 400]);

        // The second page ends 1 ms before the first page's first open.
        let queries = stub.kline_queries.lock();
        assert_eq!(queries.len(), 2);
        assert!(!queries[0].contains("endTime"));
        assert!(queries[1].contains("endTime=299"));
    }

    #[tokio::test]
    async fn batch_fetch_returns_partial_on_mid_failure() {
        let stub = stub_with_pages(vec![
            (200, serde_json::json!([kline_entry(300), kline_entry(400)])),
            (500, serde_json::json!({"msg": "rate limited"})),
        ]);
        let base = spawn_stub(stub).await;
        let fetcher = CandleFetcher::with_base_url(base);

        let batch = fetcher
            .fetch_batch("ETHUSDT", "1h", 4, 2, None)
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].open_time, 300);
    }

    #[tokio::test]
    async fn batch_fetch_errors_when_first_page_fails() {
        let stub = stub_with_pages(vec![(500, serde_json::json!({"msg": "down"}))]);
        let base = spawn_stub(stub).await;
        let fetcher = CandleFetcher::with_base_url(base);

        assert!(fetcher.fetch_batch("ETHUSDT", "1h", 4, 2, None).await.is_err());
    }

    #[tokio::test]
    async fn batch_fetch_stops_on_short_page() {
        // A short page means history is exhausted: no further requests.
        let stub = stub_with_pages(vec![(200, serde_json::json!([kline_entry(100)]))]);
        let base = spawn_stub(stub.clone()).await;
        let fetcher = CandleFetcher::with_base_url(base);

        let batch = fetcher
            .fetch_batch("ETHUSDT", "1h", 10, 2, None)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(stub.kline_queries.lock().len(), 1);
    }

    #[tokio::test]
    async fn symbols_filtered_sorted_and_cached() {
        let stub = stub_with_pages(vec![]);
        let base = spawn_stub(stub.clone()).await;
        let fetcher = CandleFetcher::with_base_url(base);

        let symbols = fetcher.fetch_symbols_usdt().await;
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"]);

        // Second call is served from the cache.
        let again = fetcher.fetch_symbols_usdt().await;
        assert_eq!(again, symbols);
        assert_eq!(stub.exchange_info_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn symbols_fall_back_when_unreachable() {
        let fetcher = CandleFetcher::with_base_url("http://127.0.0.1:9");
        let symbols = fetcher.fetch_symbols_usdt().await;
        assert_eq!(symbols.len(), 8);
        assert!(symbols.contains(&"ETHUSDT".to_string()));
    }
}
