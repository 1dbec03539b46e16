// =============================================================================
// Alert Sink — signed chat-webhook notifications (DingTalk robot API)
// =============================================================================
//
// Two delivery shapes share one channel:
//   - market alerts:  "{symbol} {timeframe} 异动" plus a body line, sent by
//     the monitor when the SpecialK detector fires;
//   - engine notices: free-form messages for self-heal, stop-loss halts and
//     manual resets.
//
// When a signing secret is configured every request URL carries `timestamp`
// (ms since epoch) and `sign = urlencode(base64(HMAC_SHA256(secret,
// "{timestamp}\n{secret}")))` query parameters, per the robot API contract.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use chrono_tz::Asia::Shanghai;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{error, info, warn};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_BASE_URL: &str = "https://oapi.dingtalk.com/robot/send";
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound notification channel for monitor alerts and engine notices.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Market-move alert for a monitored pair. Returns delivery success.
    async fn send(&self, symbol: &str, timeframe: &str, body: &str) -> bool;

    /// Free-form engine notice (self-heal, halt, reset). Returns success.
    async fn notify(&self, message: &str) -> bool;
}

// ---------------------------------------------------------------------------
// DingTalk implementation
// ---------------------------------------------------------------------------

pub struct DingTalkAlerts {
    token: Option<String>,
    secret: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl DingTalkAlerts {
    pub fn new(token: Option<String>, secret: Option<String>) -> Self {
        Self::with_base_url(token, secret, DEFAULT_BASE_URL)
    }

    /// Construct against a custom endpoint (tests point this at a stub).
    pub fn with_base_url(
        token: Option<String>,
        secret: Option<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self {
            token,
            secret,
            base_url: base_url.into(),
            client,
        }
    }

    /// Build the delivery URL, appending the signature parameters when a
    /// secret is configured.
    fn delivery_url(&self, token: &str) -> String {
        let mut url = format!("{}?access_token={}", self.base_url, token);
        if let Some(secret) = &self.secret {
            let timestamp = Utc::now().timestamp_millis();
            let sign = sign_for_timestamp(secret, timestamp);
            url.push_str(&format!("&timestamp={timestamp}&sign={sign}"));
        }
        url
    }

    async fn post_text(&self, content: String) -> bool {
        let Some(token) = &self.token else {
            warn!("alert skipped: no chat-webhook token configured");
            return false;
        };

        let url = self.delivery_url(token);
        let payload = serde_json::json!({
            "msgtype": "text",
            "text": { "content": content },
        });

        match self.client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => true,
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                error!(%status, body = %body, "alert delivery rejected");
                false
            }
            Err(e) => {
                error!(error = %e, "alert delivery failed");
                false
            }
        }
    }
}

#[async_trait]
impl AlertSink for DingTalkAlerts {
    async fn send(&self, symbol: &str, timeframe: &str, body: &str) -> bool {
        let now = Utc::now().with_timezone(&Shanghai);
        let content = format!(
            "\n{symbol} {timeframe} 异动\n时间: {}\n{body}",
            now.format("%Y-%m-%d %H:%M:%S")
        );
        let ok = self.post_text(content).await;
        if ok {
            info!(symbol, timeframe, "market alert delivered");
        }
        ok
    }

    async fn notify(&self, message: &str) -> bool {
        let now = Utc::now().with_timezone(&Shanghai);
        let content = format!(
            "【Borealis Webhook】\n时间: {}\n{message}",
            now.format("%Y-%m-%d %H:%M:%S")
        );
        self.post_text(content).await
    }
}

impl std::fmt::Debug for DingTalkAlerts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DingTalkAlerts")
            .field("token", &self.token.as_deref().map(|_| "<redacted>"))
            .field("secret", &self.secret.as_deref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// URL-encoded base64 HMAC-SHA256 of `"{timestamp}\n{secret}"`, keyed by the
/// secret itself.
fn sign_for_timestamp(secret: &str, timestamp: i64) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(format!("{timestamp}\n{secret}").as_bytes());
    let digest = BASE64.encode(mac.finalize().into_bytes());
    urlencoding::encode(&digest).into_owned()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_known_answer() {
        // Precomputed against the reference implementation of the robot API.
        let sign = sign_for_timestamp("test-secret", 1_700_000_000_000);
        assert_eq!(sign, "BYMqUCZnSqbfPf1GCfZftO7Rg2g6P%2BRp3%2F4%2BbLNtSGA%3D");
    }

    #[test]
    fn delivery_url_without_secret_has_no_signature() {
        let sink = DingTalkAlerts::with_base_url(Some("tok".into()), None, "http://x");
        let url = sink.delivery_url("tok");
        assert_eq!(url, "http://x?access_token=tok");
    }

    #[test]
    fn delivery_url_with_secret_appends_timestamp_and_sign() {
        let sink =
            DingTalkAlerts::with_base_url(Some("tok".into()), Some("s3cret".into()), "http://x");
        let url = sink.delivery_url("tok");
        assert!(url.contains("&timestamp="));
        assert!(url.contains("&sign="));
    }

    #[tokio::test]
    async fn send_without_token_is_skipped() {
        let sink = DingTalkAlerts::with_base_url(None, None, "http://127.0.0.1:1");
        assert!(!sink.send("ETHUSDT", "4h", "body").await);
        assert!(!sink.notify("hello").await);
    }
}
