// =============================================================================
// Hyperliquid adapter — info/exchange gateway client
// =============================================================================
//
// Hyperliquid's surface splits into a public `info` endpoint (mids,
// clearinghouse state) and an authenticated `exchange` endpoint for actions.
// Like the Ostium adapter, the account key stays inside this struct and the
// gateway carries out on-chain signing.
//
// Symbols here are coin names ("ETH"), so incoming pair symbols are reduced
// to their base asset before hitting the API.
// =============================================================================

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

use crate::broker::{
    BrokerClient, BrokerError, BrokerPosition, BrokerResult, CloseReceipt, OrderFill,
    OrderRequest,
};
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_BASE_URL: &str = "https://api.hyperliquid.xyz";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub struct HyperliquidBroker {
    private_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl HyperliquidBroker {
    pub fn new(private_key: impl Into<String>) -> Self {
        Self::with_base_url(private_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(private_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self {
            private_key: private_key.into(),
            base_url: base_url.into(),
            client,
        }
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.private_key.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> BrokerResult<serde_json::Value> {
        let raw = body.to_string();
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("X-HL-SIGNATURE", self.sign(&raw))
            .json(body)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;

        let status = resp.status();
        let parsed: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Network(format!("invalid JSON response: {e}")))?;
        if !status.is_success() {
            return Err(BrokerError::Rejected(format!("HTTP {status}: {parsed}")));
        }
        Ok(parsed)
    }
}

/// Reduce a pair symbol to the coin name the API expects.
fn coin_name(symbol: &str) -> String {
    let prefix = symbol
        .split(['/', '-'])
        .next()
        .unwrap_or(symbol)
        .to_uppercase();
    for quote in ["USDT", "USDC", "USD"] {
        if let Some(base) = prefix.strip_suffix(quote) {
            if !base.is_empty() {
                return base.to_string();
            }
        }
    }
    prefix
}

#[async_trait]
impl BrokerClient for HyperliquidBroker {
    async fn get_price(&self, symbol: &str) -> BrokerResult<f64> {
        let body = self.post("/info", &serde_json::json!({"type": "allMids"})).await?;
        let coin = coin_name(symbol);
        body[&coin]
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| body[&coin].as_f64())
            .ok_or_else(|| BrokerError::Rejected(format!("no mid price for {coin}")))
    }

    async fn place_order(&self, request: &OrderRequest) -> BrokerResult<OrderFill> {
        let body = serde_json::json!({
            "action": "marketOrder",
            "coin": coin_name(&request.symbol),
            "is_buy": request.side == Side::Long,
            "collateral": request.quantity,
            "leverage": request.leverage,
        });
        let resp = self.post("/exchange", &body).await?;

        if resp["status"].as_str() != Some("FILLED") {
            return Err(BrokerError::Rejected(format!(
                "order not filled: {}",
                resp["error"].as_str().unwrap_or("unknown")
            )));
        }

        debug!(coin = %coin_name(&request.symbol), side = %request.side, "hyperliquid order filled");
        Ok(OrderFill {
            order_id: resp["oid"]
                .as_i64()
                .map(|v| v.to_string())
                .or_else(|| resp["oid"].as_str().map(str::to_string))
                .unwrap_or_default(),
            price: resp["avgPx"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .or_else(|| resp["avgPx"].as_f64())
                .unwrap_or(0.0),
            timestamp_ms: resp["time"]
                .as_i64()
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            tx_hash: resp["hash"].as_str().map(str::to_string),
            trade_index: resp["tid"].as_i64(),
            pair_id: resp["asset"].as_i64(),
        })
    }

    async fn close_position(
        &self,
        pair_id: i64,
        trade_index: i64,
        _market_price: f64,
    ) -> BrokerResult<CloseReceipt> {
        let body = serde_json::json!({
            "action": "closePosition",
            "asset": pair_id,
            "tid": trade_index,
        });
        let resp = self.post("/exchange", &body).await?;

        if resp["status"].as_str() != Some("CLOSED") {
            return Err(BrokerError::Rejected(format!(
                "close not confirmed: {}",
                resp["error"].as_str().unwrap_or("unknown")
            )));
        }
        Ok(CloseReceipt {
            tx_hash: resp["hash"].as_str().map(str::to_string),
            timestamp_ms: resp["time"]
                .as_i64()
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        })
    }

    async fn get_positions(&self, symbol: Option<&str>) -> BrokerResult<Vec<BrokerPosition>> {
        let body = self
            .post("/info", &serde_json::json!({"type": "clearinghouseState"}))
            .await?;

        let Some(arr) = body["assetPositions"].as_array() else {
            return Ok(Vec::new());
        };
        let want = symbol.map(coin_name);
        let positions = arr
            .iter()
            .filter_map(|entry| {
                let pos = &entry["position"];
                let coin = pos["coin"].as_str()?.to_string();
                if let Some(want) = &want {
                    if &coin != want {
                        return None;
                    }
                }
                let szi: f64 = pos["szi"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .or_else(|| pos["szi"].as_f64())?;
                if szi == 0.0 {
                    return None;
                }
                Some(BrokerPosition {
                    symbol: coin,
                    side: if szi > 0.0 { Side::Long } else { Side::Short },
                    collateral: pos["marginUsed"]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .or_else(|| pos["marginUsed"].as_f64())
                        .unwrap_or(0.0),
                    index: pos["tid"].as_i64().unwrap_or(0),
                    pair_id: entry["asset"].as_i64().unwrap_or(0),
                    opened_at_ms: pos["openedAt"]
                        .as_i64()
                        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
                })
            })
            .collect();
        Ok(positions)
    }

    async fn get_balance(&self) -> BrokerResult<f64> {
        let body = self
            .post("/info", &serde_json::json!({"type": "clearinghouseState"}))
            .await?;
        body["withdrawable"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| body["withdrawable"].as_f64())
            .ok_or_else(|| BrokerError::Rejected("withdrawable balance missing".into()))
    }
}

impl std::fmt::Debug for HyperliquidBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperliquidBroker")
            .field("private_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coin_name_reduction() {
        assert_eq!(coin_name("ETHUSDT"), "ETH");
        assert_eq!(coin_name("ETH/USD"), "ETH");
        assert_eq!(coin_name("btc-usdc"), "BTC");
        assert_eq!(coin_name("SOL"), "SOL");
    }

    #[test]
    fn debug_redacts_private_key() {
        let broker = HyperliquidBroker::new("0xdeadbeef");
        let out = format!("{broker:?}");
        assert!(!out.contains("deadbeef"));
    }
}
