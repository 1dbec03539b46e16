// =============================================================================
// Shared types used across the Borealis trading orchestrator
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The opposite direction.
    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// +1 for longs, -1 for shorts — the sign applied to price deltas in
    /// PnL arithmetic.
    pub fn direction(self) -> i32 {
        match self {
            Self::Long => 1,
            Self::Short => -1,
        }
    }

    /// Lowercase persistence label ("long" / "short").
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    /// Order side sent to brokers ("BUY" / "SELL").
    pub fn as_order_str(self) -> &'static str {
        match self {
            Self::Long => "BUY",
            Self::Short => "SELL",
        }
    }

    /// Parse a persistence label back into a side.
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "long" => Some(Self::Long),
            "short" => Some(Self::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Which exchange an instance trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Ostium,
    Hyperliquid,
}

impl Default for Exchange {
    fn default() -> Self {
        Self::Ostium
    }
}

impl Exchange {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "hyperliquid" => Self::Hyperliquid,
            _ => Self::Ostium,
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ostium => write!(f, "ostium"),
            Self::Hyperliquid => write!(f, "hyperliquid"),
        }
    }
}

/// Compare two symbols by base asset only, tolerating quote suffixes and
/// separators: "ETH", "ETH/USD", "eth-usdc" and "ETHUSDT" all match.
pub fn symbol_base_matches(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && symbol_base(a) == symbol_base(b)
}

fn symbol_base(symbol: &str) -> String {
    let prefix = symbol
        .split(['/', '-'])
        .next()
        .unwrap_or(symbol)
        .to_uppercase();
    // Bare-concatenation forms like ETHUSDT / ETHUSD / ETHUSDC.
    for quote in ["USDT", "USDC", "USD"] {
        if let Some(base) = prefix.strip_suffix(quote) {
            if !base.is_empty() {
                return base.to_string();
            }
        }
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_opposite_and_direction() {
        assert_eq!(Side::Long.opposite(), Side::Short);
        assert_eq!(Side::Short.opposite(), Side::Long);
        assert_eq!(Side::Long.direction(), 1);
        assert_eq!(Side::Short.direction(), -1);
    }

    #[test]
    fn side_db_roundtrip() {
        assert_eq!(Side::from_db_str("long"), Some(Side::Long));
        assert_eq!(Side::from_db_str("short"), Some(Side::Short));
        assert_eq!(Side::from_db_str("LONG"), None);
        assert_eq!(Side::Long.as_db_str(), "long");
        assert_eq!(Side::Short.as_order_str(), "SELL");
    }

    #[test]
    fn symbol_fuzz_matching() {
        assert!(symbol_base_matches("ETH", "ETH/USD"));
        assert!(symbol_base_matches("eth-usdc", "ETHUSDT"));
        assert!(symbol_base_matches("ETHUSD", "ETH"));
        assert!(!symbol_base_matches("ETH", "BTCUSDT"));
        assert!(!symbol_base_matches("", "ETH"));
    }

    #[test]
    fn exchange_parse_defaults_to_ostium() {
        assert_eq!(Exchange::parse("hyperliquid"), Exchange::Hyperliquid);
        assert_eq!(Exchange::parse("HYPERLIQUID"), Exchange::Hyperliquid);
        assert_eq!(Exchange::parse("ostium"), Exchange::Ostium);
        assert_eq!(Exchange::parse("anything"), Exchange::Ostium);
    }
}
