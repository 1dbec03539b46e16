// =============================================================================
// Ostium adapter — signed REST gateway client
// =============================================================================
//
// Talks to the Ostium trade gateway. Requests are authenticated with an
// HMAC-SHA256 signature over the query string, keyed by the account private
// key. The key never leaves this struct and is redacted from Debug output.
//
// The gateway inherits an SDK quirk: `trade_index = 0` on a close matches
// the account's latest trade instead of addressing a specific one. Callers
// should carry the real index from the fill receipt whenever they have it.
// =============================================================================

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};

use crate::broker::{
    BrokerClient, BrokerError, BrokerPosition, BrokerResult, CloseReceipt, OrderFill,
    OrderRequest,
};
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_BASE_URL: &str = "https://gateway.ostium.io";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub struct OstiumBroker {
    private_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OstiumBroker {
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

    /// HMAC-SHA256 hex signature over `payload`, keyed by the private key.
    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.private_key.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn get_json(&self, path: &str, query: &str) -> BrokerResult<serde_json::Value> {
        let ts = chrono::Utc::now().timestamp_millis();
        let base = if query.is_empty() {
            format!("timestamp={ts}")
        } else {
            format!("{query}&timestamp={ts}")
        };
        let sig = self.sign(&base);
        let url = format!("{}{}?{}&signature={}", self.base_url, path, base, sig);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        read_json(resp).await
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> BrokerResult<serde_json::Value> {
        let raw = body.to_string();
        let sig = self.sign(&raw);
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .header("X-OSTIUM-SIGNATURE", sig)
            .json(body)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        read_json(resp).await
    }
}

#[async_trait]
impl BrokerClient for OstiumBroker {
    async fn get_price(&self, symbol: &str) -> BrokerResult<f64> {
        let body = self
            .get_json("/v1/price", &format!("symbol={}", symbol.to_uppercase()))
            .await?;
        body["price"]
            .as_f64()
            .or_else(|| body["price"].as_str().and_then(|s| s.parse().ok()))
            .ok_or_else(|| BrokerError::Rejected(format!("price missing in response: {body}")))
    }

    async fn place_order(&self, request: &OrderRequest) -> BrokerResult<OrderFill> {
        let body = serde_json::json!({
            "symbol": request.symbol,
            "side": request.side.as_order_str(),
            "type": "MARKET",
            "quantity": request.quantity,
            "leverage": request.leverage,
        });
        let resp = self.post_json("/v1/order", &body).await?;

        if resp["status"].as_str() != Some("FILLED") {
            return Err(BrokerError::Rejected(format!(
                "order not filled: {}",
                resp["error"].as_str().unwrap_or("unknown")
            )));
        }

        debug!(symbol = %request.symbol, side = %request.side, "ostium order filled");
        Ok(parse_fill(&resp))
    }

    async fn close_position(
        &self,
        pair_id: i64,
        trade_index: i64,
        market_price: f64,
    ) -> BrokerResult<CloseReceipt> {
        let body = serde_json::json!({
            "pair_id": pair_id,
            "trade_index": trade_index,
            "market_price": market_price,
        });
        let resp = self.post_json("/v1/close", &body).await?;

        if resp["status"].as_str() != Some("CLOSED") {
            return Err(BrokerError::Rejected(format!(
                "close not confirmed: {}",
                resp["error"].as_str().unwrap_or("unknown")
            )));
        }

        Ok(CloseReceipt {
            tx_hash: resp["transactionHash"]
                .as_str()
                .or_else(|| resp["tx_hash"].as_str())
                .map(str::to_string),
            timestamp_ms: resp["timestamp"]
                .as_i64()
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        })
    }

    async fn get_positions(&self, symbol: Option<&str>) -> BrokerResult<Vec<BrokerPosition>> {
        let query = symbol
            .map(|s| format!("symbol={}", s.to_uppercase()))
            .unwrap_or_default();
        let body = self.get_json("/v1/positions", &query).await?;

        let Some(arr) = body["positions"].as_array().or_else(|| body.as_array()) else {
            return Ok(Vec::new());
        };
        Ok(arr.iter().filter_map(parse_position).collect())
    }

    async fn get_balance(&self) -> BrokerResult<f64> {
        let body = self.get_json("/v1/balance", "").await?;
        body["USDC"]
            .as_f64()
            .or_else(|| body["usdc"].as_f64())
            .ok_or_else(|| BrokerError::Rejected(format!("balance missing in response: {body}")))
    }
}

impl std::fmt::Debug for OstiumBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OstiumBroker")
            .field("private_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

async fn read_json(resp: reqwest::Response) -> BrokerResult<serde_json::Value> {
    let status = resp.status();
    let body: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| BrokerError::Network(format!("invalid JSON response: {e}")))?;
    if !status.is_success() {
        return Err(BrokerError::Rejected(format!("HTTP {status}: {body}")));
    }
    Ok(body)
}

fn parse_fill(resp: &serde_json::Value) -> OrderFill {
    // A trade_index echoing the order id means the gateway could not parse
    // the fill event; treat it as absent so callers fall back to a position
    // query.
    let order_id = resp["orderId"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| resp["orderId"].as_i64().unwrap_or(0).to_string());
    let trade_index = resp["trade_index"]
        .as_i64()
        .filter(|idx| idx.to_string() != order_id);

    OrderFill {
        order_id,
        price: resp["price"]
            .as_f64()
            .or_else(|| resp["price"].as_str().and_then(|s| s.parse().ok()))
            .unwrap_or(0.0),
        timestamp_ms: resp["timestamp"]
            .as_i64()
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        tx_hash: resp["tx_hash"].as_str().map(str::to_string),
        trade_index,
        pair_id: resp["pair_id"].as_i64(),
    }
}

fn parse_position(raw: &serde_json::Value) -> Option<BrokerPosition> {
    let symbol = raw["symbol"].as_str()?.to_string();
    // `direction: true` is long on this venue.
    let side = if raw["direction"].as_bool()? {
        Side::Long
    } else {
        Side::Short
    };
    let collateral = raw["collateral"]
        .as_f64()
        .or_else(|| raw["collateral"].as_str().and_then(|s| s.parse().ok()))?;
    Some(BrokerPosition {
        symbol,
        side,
        collateral,
        index: raw["index"].as_i64().unwrap_or(0),
        pair_id: raw["pair_id"].as_i64().unwrap_or(0),
        opened_at_ms: raw["opened_at"].as_i64().unwrap_or_else(|| {
            warn!("position missing opened_at, defaulting to now");
            chrono::Utc::now().timestamp_millis()
        }),
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_parsing_drops_echoed_trade_index() {
        let resp = serde_json::json!({
            "orderId": 42, "price": "3001.5", "timestamp": 1700000000000i64,
            "trade_index": 42, "pair_id": 12, "tx_hash": "0xabc",
        });
        let fill = parse_fill(&resp);
        assert_eq!(fill.order_id, "42");
        assert_eq!(fill.price, 3001.5);
        assert_eq!(fill.trade_index, None);
        assert_eq!(fill.pair_id, Some(12));
        assert_eq!(fill.tx_hash.as_deref(), Some("0xabc"));
    }

    #[test]
    fn fill_parsing_keeps_distinct_trade_index() {
        let resp = serde_json::json!({
            "orderId": "42", "price": 10.0, "timestamp": 1i64, "trade_index": 7,
        });
        let fill = parse_fill(&resp);
        assert_eq!(fill.trade_index, Some(7));
    }

    #[test]
    fn position_parsing_maps_direction() {
        let raw = serde_json::json!({
            "symbol": "ETH/USD", "direction": false, "collateral": "25.5",
            "index": 3, "pair_id": 12, "opened_at": 1700000000000i64,
        });
        let pos = parse_position(&raw).unwrap();
        assert_eq!(pos.side, Side::Short);
        assert_eq!(pos.collateral, 25.5);
        assert_eq!(pos.index, 3);
    }

    #[test]
    fn position_parsing_rejects_malformed() {
        assert!(parse_position(&serde_json::json!({"symbol": "ETH"})).is_none());
    }

    #[test]
    fn debug_redacts_private_key() {
        let broker = OstiumBroker::new("super-secret-key");
        let out = format!("{broker:?}");
        assert!(!out.contains("super-secret-key"));
        assert!(out.contains("<redacted>"));
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let broker = OstiumBroker::new("key");
        let a = broker.sign("payload");
        let b = broker.sign("payload");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
