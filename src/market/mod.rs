pub mod fetcher;
pub mod minute_alert;
pub mod monitor;

pub use fetcher::{CandleFetcher, CandleSource, DepthSnapshot};
pub use monitor::{MonitorService, Pair};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle from the perpetual-futures kline endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Timeframe labels accepted by the monitor API, mapped to provider
/// intervals. Unknown labels pass through unchanged so raw intervals such as
/// "15m" keep working.
pub fn interval_for_timeframe(timeframe: &str) -> &str {
    match timeframe {
        "1小时" => "1h",
        "2小时" => "2h",
        "4小时" => "4h",
        "天" => "1d",
        "周" => "1w",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_labels_map_to_intervals() {
        assert_eq!(interval_for_timeframe("1小时"), "1h");
        assert_eq!(interval_for_timeframe("天"), "1d");
        assert_eq!(interval_for_timeframe("周"), "1w");
    }

    #[test]
    fn raw_intervals_pass_through() {
        assert_eq!(interval_for_timeframe("15m"), "15m");
        assert_eq!(interval_for_timeframe("4h"), "4h");
    }
}
