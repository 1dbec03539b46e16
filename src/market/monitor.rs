// =============================================================================
// Monitor Service — candle polling, dedup, cooldown-gated SpecialK alerts
// =============================================================================
//
// One background loop sweeps the active (symbol, timeframe) pairs in
// insertion order. Per pair the last 500 candles of the subject and of the
// ETHUSDT reference are fetched; a tick whose terminal bar close time was
// already seen is skipped, so the detector runs at most once per closed bar.
// A trigger alerts through the sink at most once per 10 minutes per pair,
// while the "red" timestamp refreshes on every trigger.
//
// Per-pair fetch failures are logged and skipped; the sweep never aborts.
// `stop()` cancels the 60 s inter-sweep sleep immediately and joins the
// worker within 2 s, after which it is abandoned.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::alert::AlertSink;
use crate::market::fetcher::CandleSource;
use crate::market::interval_for_timeframe;
use crate::strategy::{run_special_k, SpecialKParams};

/// Reference asset every subject is measured against.
const REFERENCE_SYMBOL: &str = "ETHUSDT";
/// Candles fetched per evaluation.
const CANDLE_LIMIT: u32 = 500;
/// Pause between sweeps.
const SWEEP_PAUSE: Duration = Duration::from_secs(60);
/// Alert cooldown / "red" highlight duration.
const ALERT_RED_DURATION: Duration = Duration::from_secs(600);
/// How long `stop()` waits for the worker before abandoning it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Persisted monitor configuration (the signal-store singleton row).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub pairs: Vec<PairSpec>,
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    #[serde(default = "default_ratio")]
    pub ratio: f64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PairSpec {
    pub symbol: String,
    pub timeframe: String,
}

fn default_lookback() -> usize {
    4
}

fn default_ratio() -> f64 {
    1.5
}

impl MonitorConfig {
    pub fn params(&self) -> SpecialKParams {
        SpecialKParams {
            lookback: self.lookback,
            ratio: self.ratio,
        }
    }

    pub fn pairs(&self) -> Vec<Pair> {
        self.pairs
            .iter()
            .map(|p| Pair::new(&p.symbol, &p.timeframe))
            .collect()
    }
}

/// A monitored (symbol, timeframe) tuple. Symbols are stored uppercase.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct Pair {
    pub symbol: String,
    pub timeframe: String,
}

impl Pair {
    pub fn new(symbol: &str, timeframe: &str) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            timeframe: timeframe.to_string(),
        }
    }
}

impl std::fmt::Display for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct MonitorService {
    inner: Arc<MonitorInner>,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct MonitorInner {
    pairs: RwLock<Vec<Pair>>,
    last_seen: RwLock<HashMap<Pair, i64>>,
    alerted_at: RwLock<HashMap<Pair, Instant>>,
    params: SpecialKParams,
    source: Arc<dyn CandleSource>,
    alerts: Arc<dyn AlertSink>,
}

impl MonitorService {
    pub fn new(
        pairs: Vec<Pair>,
        params: SpecialKParams,
        source: Arc<dyn CandleSource>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(MonitorInner {
                pairs: RwLock::new(pairs),
                last_seen: RwLock::new(HashMap::new()),
                alerted_at: RwLock::new(HashMap::new()),
                params,
                source,
                alerts,
            }),
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// Start the background sweep loop. Idempotent: a running worker is left
    /// alone.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if let Some(h) = handle.as_ref() {
            if !h.is_finished() {
                return;
            }
        }
        self.stop_tx.send_replace(false);

        let inner = self.inner.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        *handle = Some(tokio::spawn(async move {
            loop {
                inner.sweep(&stop_rx).await;
                tokio::select! {
                    _ = stop_rx.changed() => {}
                    _ = tokio::time::sleep(SWEEP_PAUSE) => {}
                }
                if *stop_rx.borrow() {
                    break;
                }
            }
            info!("monitor worker stopped");
        }));

        let pairs = self.inner.pairs.read();
        info!(pairs = %pairs.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", "),
            "monitor started");
    }

    /// Signal the loop to terminate and join it, abandoning the worker after
    /// two seconds.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(h) = handle {
            if tokio::time::timeout(JOIN_TIMEOUT, h).await.is_err() {
                warn!("monitor worker did not stop in time, abandoning");
            }
        }
        info!("monitor stopped");
    }

    /// Add a pair to the active set (no-op when already present).
    pub fn add_pair(&self, symbol: &str, timeframe: &str) {
        let pair = Pair::new(symbol, timeframe);
        let mut pairs = self.inner.pairs.write();
        if !pairs.contains(&pair) {
            info!(pair = %pair, "monitor pair added");
            pairs.push(pair);
        }
    }

    /// Remove a pair, dropping its dedup and cooldown state. Returns whether
    /// anything was removed.
    pub fn remove_pair(&self, symbol: &str, timeframe: &str) -> bool {
        let pair = Pair::new(symbol, timeframe);
        let mut pairs = self.inner.pairs.write();
        let before = pairs.len();
        pairs.retain(|p| p != &pair);
        let removed = pairs.len() < before;
        if removed {
            self.inner.last_seen.write().remove(&pair);
            self.inner.alerted_at.write().remove(&pair);
            info!(pair = %pair, "monitor pair removed");
        }
        removed
    }

    /// Pairs whose last trigger is within the red-highlight window.
    pub fn alerted_pairs(&self) -> Vec<Pair> {
        self.inner
            .alerted_at
            .read()
            .iter()
            .filter(|(_, at)| at.elapsed() < ALERT_RED_DURATION)
            .map(|(pair, _)| pair.clone())
            .collect()
    }

    /// Snapshot of the active pair set in insertion order.
    pub fn pairs(&self) -> Vec<Pair> {
        self.inner.pairs.read().clone()
    }
}

impl MonitorInner {
    /// One full sweep over the current pair set.
    async fn sweep(&self, stop_rx: &watch::Receiver<bool>) {
        let pairs = self.pairs.read().clone();
        for pair in pairs {
            if *stop_rx.borrow() {
                break;
            }
            self.check_pair(&pair).await;
        }
    }

    async fn check_pair(&self, pair: &Pair) {
        let interval = interval_for_timeframe(&pair.timeframe);

        let subject = match self.source.klines(&pair.symbol, interval, CANDLE_LIMIT).await {
            Ok(c) => c,
            Err(e) => {
                error!(pair = %pair, error = %e, "subject candle fetch failed");
                return;
            }
        };
        let reference = match self
            .source
            .klines(REFERENCE_SYMBOL, interval, CANDLE_LIMIT)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                error!(pair = %pair, error = %e, "reference candle fetch failed");
                return;
            }
        };
        if subject.is_empty() || reference.is_empty() {
            return;
        }

        // Dedup: only evaluate each terminal bar once.
        let close_time = subject[subject.len() - 1].close_time;
        if self.last_seen.read().get(pair) == Some(&close_time) {
            return;
        }
        self.last_seen.write().insert(pair.clone(), close_time);

        let closes: Vec<f64> = subject.iter().map(|c| c.close).collect();
        let opens: Vec<f64> = subject.iter().map(|c| c.open).collect();
        let ref_closes: Vec<f64> = reference.iter().map(|c| c.close).collect();

        if run_special_k(&closes, &opens, &ref_closes, self.params) {
            let cooled_down = self
                .alerted_at
                .read()
                .get(pair)
                .map(|at| at.elapsed() > ALERT_RED_DURATION)
                .unwrap_or(true);
            if cooled_down {
                self.alerts
                    .send(&pair.symbol, &pair.timeframe, "品种涨幅强于ETH且满足连阳")
                    .await;
            }
            // Refresh the red window on every trigger, alerted or not.
            self.alerted_at.write().insert(pair.clone(), Instant::now());
        }
    }
}
