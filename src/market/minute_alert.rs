// =============================================================================
// Minute Alert Service — short-horizon anomaly detection on 1m bars
// =============================================================================
//
// Each minute, per watched symbol: fetch the last two bars plus order-book
// depth and raise a reason for
//   - intra-bar range        (high-low)/open >= 5 %
//   - volume spike           current >= 20x previous bar
//   - order-book wall        >= 200k notional within 0.3 % of mid
//
// Reasons are cooldown-gated per (symbol, reason-class) so a persistent
// condition does not spam the channel. Bars are deduplicated on close time
// for intervals longer than the sweep cadence.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::alert::AlertSink;
use crate::market::fetcher::{CandleFetcher, DepthSnapshot};
use crate::market::Candle;

/// Detection thresholds.
#[derive(Debug, Clone)]
pub struct MinuteAlertParams {
    pub interval: String,
    /// Intra-bar range threshold in percent.
    pub vol_pct_threshold: f64,
    /// Volume multiple vs the previous bar.
    pub volume_mult_threshold: f64,
    /// Order-book wall notional threshold.
    pub ob_notional_threshold: f64,
    /// Wall search distance from mid as a fraction.
    pub ob_distance_pct: f64,
    /// Depth levels scanned per side.
    pub depth_levels: usize,
    /// Per-(symbol, reason) alert cooldown.
    pub cooldown: Duration,
}

impl Default for MinuteAlertParams {
    fn default() -> Self {
        Self {
            interval: "1m".to_string(),
            vol_pct_threshold: 5.0,
            volume_mult_threshold: 20.0,
            ob_notional_threshold: 200_000.0,
            ob_distance_pct: 0.003,
            depth_levels: 50,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// Evaluate the detection conditions over the latest bars and depth.
/// Returns zero or more reason strings, each prefixed with its class
/// ("range:", "volume:", "orderbook:") for cooldown keying.
pub fn detect_minute_alerts(
    klines: &[Candle],
    depth: Option<&DepthSnapshot>,
    params: &MinuteAlertParams,
) -> Vec<String> {
    let mut reasons = Vec::new();
    if klines.len() < 2 {
        return reasons;
    }
    let current = &klines[klines.len() - 1];
    let previous = &klines[klines.len() - 2];

    // Intra-bar range relative to the open.
    if current.open > 0.0 && current.high > 0.0 && current.low > 0.0 {
        let range_pct = (current.high - current.low) / current.open * 100.0;
        if range_pct >= params.vol_pct_threshold {
            reasons.push(format!(
                "range: {} bar moved {range_pct:.2}% (>= {:.2}%)",
                params.interval, params.vol_pct_threshold
            ));
        }
    }

    // Volume spike vs the previous bar.
    if previous.volume > 0.0 {
        let mult = current.volume / previous.volume;
        if mult >= params.volume_mult_threshold {
            reasons.push(format!(
                "volume: {mult:.1}x previous bar (current {:.4}, previous {:.4})",
                current.volume, previous.volume
            ));
        }
    }

    // Large resting orders near mid; first hit per side is enough.
    if let Some(depth) = depth {
        if let (Some((best_bid, _)), Some((best_ask, _))) =
            (depth.bids.first(), depth.asks.first())
        {
            if *best_bid > 0.0 && *best_ask > 0.0 {
                let mid = (best_bid + best_ask) / 2.0;
                let max_dist = mid * params.ob_distance_pct;
                let mut walls = Vec::new();
                for (side_name, levels) in
                    [("BID", &depth.bids), ("ASK", &depth.asks)]
                {
                    for (px, qty) in levels.iter().take(params.depth_levels) {
                        if *px <= 0.0 || *qty <= 0.0 || (px - mid).abs() > max_dist {
                            continue;
                        }
                        let notional = px * qty;
                        if notional >= params.ob_notional_threshold {
                            walls.push(format!(
                                "{side_name} wall @{px:.2} qty={qty:.4} notional={notional:.0}"
                            ));
                            break;
                        }
                    }
                }
                if !walls.is_empty() {
                    reasons.push(format!("orderbook: {}", walls.join(" | ")));
                }
            }
        }
    }

    reasons
}

/// Cooldown gate: returns `true` (and stamps the key) when the previous
/// alert for this key is old enough.
fn cooldown_ok(
    map: &Mutex<HashMap<(String, String), Instant>>,
    symbol: &str,
    key: &str,
    cooldown: Duration,
) -> bool {
    let mut map = map.lock();
    let entry = (symbol.to_string(), key.to_string());
    let ok = map
        .get(&entry)
        .map(|at| at.elapsed() >= cooldown)
        .unwrap_or(true);
    if ok {
        map.insert(entry, Instant::now());
    }
    ok
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct MinuteAlertService {
    symbols: Vec<String>,
    params: MinuteAlertParams,
    fetcher: Arc<CandleFetcher>,
    alerts: Arc<dyn AlertSink>,
    last_alert: Arc<Mutex<HashMap<(String, String), Instant>>>,
    last_bar_close: Arc<Mutex<HashMap<String, i64>>>,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MinuteAlertService {
    pub fn new(
        symbols: Vec<String>,
        params: MinuteAlertParams,
        fetcher: Arc<CandleFetcher>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            symbols: symbols
                .into_iter()
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
            params,
            fetcher,
            alerts,
            last_alert: Arc::new(Mutex::new(HashMap::new())),
            last_bar_close: Arc::new(Mutex::new(HashMap::new())),
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// Start the minute loop. Idempotent.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if let Some(h) = handle.as_ref() {
            if !h.is_finished() {
                return;
            }
        }
        self.stop_tx.send_replace(false);

        let symbols = self.symbols.clone();
        let params = self.params.clone();
        let fetcher = self.fetcher.clone();
        let alerts = self.alerts.clone();
        let last_alert = self.last_alert.clone();
        let last_bar_close = self.last_bar_close.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        *handle = Some(tokio::spawn(async move {
            loop {
                for symbol in &symbols {
                    if *stop_rx.borrow() {
                        break;
                    }
                    sweep_symbol(
                        symbol,
                        &params,
                        &fetcher,
                        alerts.as_ref(),
                        &last_alert,
                        &last_bar_close,
                    )
                    .await;
                }

                // Align the next pass to the minute boundary.
                let now = chrono::Utc::now().timestamp();
                let sleep_secs = (60 - (now % 60)).max(1) as u64;
                tokio::select! {
                    _ = stop_rx.changed() => {}
                    _ = tokio::time::sleep(Duration::from_secs(sleep_secs)) => {}
                }
                if *stop_rx.borrow() {
                    break;
                }
            }
            info!("minute alert worker stopped");
        }));

        info!(symbols = ?self.symbols, "minute alert service started");
    }

    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(h) = handle {
            if tokio::time::timeout(Duration::from_secs(2), h).await.is_err() {
                warn!("minute alert worker did not stop in time, abandoning");
            }
        }
        info!("minute alert service stopped");
    }
}

async fn sweep_symbol(
    symbol: &str,
    params: &MinuteAlertParams,
    fetcher: &CandleFetcher,
    alerts: &dyn AlertSink,
    last_alert: &Mutex<HashMap<(String, String), Instant>>,
    last_bar_close: &Mutex<HashMap<String, i64>>,
) {
    let klines = match fetcher.fetch_klines(symbol, &params.interval, 2).await {
        Ok(k) => k,
        Err(e) => {
            error!(symbol, error = %e, "minute kline fetch failed");
            return;
        }
    };

    // Same terminal bar as last time: nothing new to evaluate.
    if let Some(bar) = klines.last() {
        let mut seen = last_bar_close.lock();
        if seen.get(symbol) == Some(&bar.close_time) {
            return;
        }
        seen.insert(symbol.to_string(), bar.close_time);
    }

    let depth = match fetcher
        .fetch_depth(symbol, params.depth_levels.max(5) as u32)
        .await
    {
        Ok(d) => Some(d),
        Err(e) => {
            error!(symbol, error = %e, "depth fetch failed, evaluating bars only");
            None
        }
    };

    let reasons = detect_minute_alerts(&klines, depth.as_ref(), params);
    if reasons.is_empty() {
        return;
    }

    let lines: Vec<String> = reasons
        .into_iter()
        .filter(|reason| {
            let key = reason.split(':').next().unwrap_or(reason).to_string();
            cooldown_ok(last_alert, symbol, &key, params.cooldown)
        })
        .collect();
    if !lines.is_empty() {
        alerts
            .send(symbol, &format!("{}预警", params.interval), &lines.join("\n"))
            .await;
    }
}
