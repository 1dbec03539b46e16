// =============================================================================
// Signal wire model — external strategy signals and intent parsing
// =============================================================================
//
// Upstream signal senders attach prior-position hints under the non-ASCII
// keys `先前仓位` (prior position) and `先前仓位大小` (prior position size).
// Those keys are part of the wire contract and must match byte-exact; the
// serde renames below preserve them.
//
// Intent is the caller-declared meaning of a signal:
//   flat + size 0          => open a new position
//   long/short + size != 0 => close the existing position
//   anything else          => unknown, treated as open for backward compat
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Side;

/// Caller-declared meaning of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalIntent {
    Open,
    Close,
    Unknown,
}

impl std::fmt::Display for SignalIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Close => write!(f, "close"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// An external strategy signal as received over the webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// "buy" / "long" / "sell" / "short" / "close".
    pub signal: String,
    pub symbol: String,
    /// Routes to a single instance when present.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Broadcast filter.
    #[serde(default)]
    pub strategy_name: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Prior-position hint: "flat", "long" or "short".
    #[serde(rename = "先前仓位", default = "default_prev_position")]
    pub prev_position: String,
    /// Prior-position size hint as the sender formatted it ("0", "1.0", …).
    #[serde(rename = "先前仓位大小", default = "default_prev_size")]
    pub prev_size: String,
}

fn default_prev_position() -> String {
    "flat".to_string()
}

fn default_prev_size() -> String {
    "0".to_string()
}

impl Signal {
    /// Normalized signal type ("buy", "sell", "close", …).
    pub fn signal_type(&self) -> String {
        self.signal.trim().to_lowercase()
    }

    /// Target side for an opening signal, if the type names one.
    pub fn target_side(&self) -> Option<Side> {
        match self.signal_type().as_str() {
            "buy" | "long" => Some(Side::Long),
            "sell" | "short" => Some(Side::Short),
            _ => None,
        }
    }

    /// Parse the caller-declared intent from the prior-position hints.
    pub fn intent(&self) -> SignalIntent {
        parse_intent(&self.prev_position, &self.prev_size)
    }
}

/// Intent parsing over the raw hint strings.
pub fn parse_intent(prev_position: &str, prev_size: &str) -> SignalIntent {
    let pos = prev_position.trim().to_lowercase();
    let size = prev_size.trim();
    let size_is_zero = size == "0" || size == "0.0";

    if pos == "flat" && size_is_zero {
        SignalIntent::Open
    } else if (pos == "long" || pos == "short") && !size_is_zero {
        SignalIntent::Close
    } else {
        SignalIntent::Unknown
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_keys_are_byte_exact() {
        let raw = r#"{
            "signal": "buy",
            "symbol": "ETH",
            "先前仓位": "long",
            "先前仓位大小": "1.0"
        }"#;
        let signal: Signal = serde_json::from_str(raw).unwrap();
        assert_eq!(signal.prev_position, "long");
        assert_eq!(signal.prev_size, "1.0");

        let out = serde_json::to_string(&signal).unwrap();
        assert!(out.contains("先前仓位"));
        assert!(out.contains("先前仓位大小"));
    }

    #[test]
    fn hints_default_to_flat_zero() {
        let signal: Signal =
            serde_json::from_str(r#"{"signal":"buy","symbol":"ETH"}"#).unwrap();
        assert_eq!(signal.prev_position, "flat");
        assert_eq!(signal.prev_size, "0");
        assert_eq!(signal.intent(), SignalIntent::Open);
    }

    #[test]
    fn intent_open_on_flat_zero() {
        assert_eq!(parse_intent("flat", "0"), SignalIntent::Open);
        assert_eq!(parse_intent("Flat ", "0.0"), SignalIntent::Open);
    }

    #[test]
    fn intent_close_on_held_position() {
        assert_eq!(parse_intent("long", "1.0"), SignalIntent::Close);
        assert_eq!(parse_intent("short", "0.25"), SignalIntent::Close);
    }

    #[test]
    fn intent_unknown_on_contradictory_hints() {
        // Flat but with a size, or a held position with size zero.
        assert_eq!(parse_intent("flat", "1.0"), SignalIntent::Unknown);
        assert_eq!(parse_intent("long", "0"), SignalIntent::Unknown);
        assert_eq!(parse_intent("", ""), SignalIntent::Unknown);
    }

    #[test]
    fn target_side_parsing() {
        let mk = |s: &str| Signal {
            signal: s.into(),
            symbol: "ETH".into(),
            instance_id: None,
            strategy_name: None,
            price: None,
            timestamp: None,
            prev_position: "flat".into(),
            prev_size: "0".into(),
        };
        assert_eq!(mk("BUY").target_side(), Some(Side::Long));
        assert_eq!(mk("long").target_side(), Some(Side::Long));
        assert_eq!(mk("short").target_side(), Some(Side::Short));
        assert_eq!(mk("close").target_side(), None);
    }
}
