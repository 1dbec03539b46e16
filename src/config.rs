// =============================================================================
// Application Configuration — environment-driven startup settings
// =============================================================================
//
// Everything here is read once at startup. Per-instance trading settings are
// NOT here: they live in each engine's typed config record and change at
// runtime through the API. This struct only carries process-wide knobs and
// the defaults new instances inherit.
// =============================================================================

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::engine::trading::MarginSpec;

/// Forbidden trading hours applied when an instance registers without its own
/// list (Asia/Shanghai local hours).
pub const DEFAULT_FORBIDDEN_HOURS: [u8; 9] = [3, 4, 5, 6, 7, 11, 12, 19, 20];

/// Process-wide configuration assembled from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Address the signal router binds to.
    pub bind_addr: String,
    /// SQLite connection string for the signal store.
    pub database_url: String,
    /// Chat-webhook access token; alerts are skipped when unset.
    pub dingtalk_token: Option<String>,
    /// Chat-webhook signing secret; URL signing is skipped when unset.
    pub dingtalk_secret: Option<String>,
    /// Shared secret for `X-Signature` verification on incoming webhooks.
    pub webhook_secret: Option<String>,
    /// Default forbidden hours for new instances.
    pub default_forbidden_hours: BTreeSet<u8>,
    /// Default margin spec for instances registered without one.
    pub default_margin: MarginSpec,
    /// Symbols for the minute-bar alert service; the service stays off when
    /// empty.
    pub minute_alert_symbols: Vec<String>,
}

impl AppConfig {
    /// Assemble the configuration from the process environment.
    pub fn from_env() -> Self {
        let bind_addr =
            std::env::var("BOREALIS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8005".into());
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://data/borealis.db".into());

        let dingtalk_token = non_empty_env("DINGTALK_TOKEN");
        let dingtalk_secret = non_empty_env("DINGTALK_SECRET");
        let webhook_secret = non_empty_env("WEBHOOK_SECRET");

        let default_forbidden_hours = match std::env::var("OSTIUM_FORBIDDEN_HOURS") {
            Ok(raw) if !raw.trim().is_empty() => match parse_forbidden_hours(&raw) {
                Some(hours) => {
                    info!(hours = ?hours, "using forbidden hours from environment");
                    hours
                }
                None => {
                    warn!(raw = %raw, "failed to parse OSTIUM_FORBIDDEN_HOURS, using defaults");
                    DEFAULT_FORBIDDEN_HOURS.into_iter().collect()
                }
            },
            _ => DEFAULT_FORBIDDEN_HOURS.into_iter().collect(),
        };

        let default_margin = match std::env::var("WEBHOOK_MARGIN_AMOUNT") {
            Ok(raw) if !raw.trim().is_empty() => match MarginSpec::parse(&raw) {
                Some(spec) => spec,
                None => {
                    warn!(raw = %raw, "failed to parse WEBHOOK_MARGIN_AMOUNT, using default");
                    MarginSpec::default()
                }
            },
            _ => MarginSpec::default(),
        };

        let minute_alert_symbols = std::env::var("MINUTE_ALERT_SYMBOLS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            bind_addr,
            database_url,
            dingtalk_token,
            dingtalk_secret,
            webhook_secret,
            default_forbidden_hours,
            default_margin,
            minute_alert_symbols,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a CSV of hours ("3,4,5,19") into a set, rejecting anything outside
/// 0–23. Returns `None` when no valid hour survives.
pub fn parse_forbidden_hours(raw: &str) -> Option<BTreeSet<u8>> {
    let hours: BTreeSet<u8> = raw
        .split(',')
        .filter_map(|h| h.trim().parse::<u8>().ok())
        .filter(|h| *h < 24)
        .collect();
    if hours.is_empty() {
        None
    } else {
        Some(hours)
    }
}
