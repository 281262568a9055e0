//! ==============================================================================
//! notify.rs - push notifications
//! ==============================================================================
//!
//! purpose:
//!     keeps the device tokens browsers register through POST /save-token and
//!     pushes a notification to each of them over http.
//!
//!     delivery is best-effort: every failure is logged and counted, none is
//!     returned to the caller, and the real-time path never waits on it.
//!
//! alerts:
//!     when enabled, a reading whose `alert_field` moves into one of
//!     `alert_values` triggers one push to every token. the same value
//!     arriving again does not re-alert until the field has left it.
//!
//! ==============================================================================

use crate::config::NotificationsConfig;
use crate::domain::SensorReading;
use crate::store::TelemetryStore;

use anyhow::{Context, Result};
use reqwest::header::AUTHORIZATION;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failed: usize,
}

pub struct Notifier {
    client: reqwest::Client,
    config: NotificationsConfig,
    store: Arc<dyn TelemetryStore>,
    last_alert_value: Mutex<Option<String>>,
}

impl Notifier {
    pub fn new(config: NotificationsConfig, store: Arc<dyn TelemetryStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds.max(1)))
            .build()
            .context("failed to build notification http client")?;
        Ok(Self { client, config, store, last_alert_value: Mutex::new(None) })
    }

    /// false for an empty or already known token
    pub fn register(&self, token: &str) -> bool {
        let token = token.trim();
        if token.is_empty() {
            return false;
        }
        self.store.append(token.to_string())
    }

    pub fn token_count(&self) -> usize {
        self.store.tokens().len()
    }

    pub async fn send_all(&self, title: &str, body: &str) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for token in self.store.tokens() {
            match self.send_one(&token, title, body).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!("[NOTIFY] delivery to {} failed: {:#}", abbreviate(&token), e);
                }
            }
        }
        tracing::info!("[NOTIFY] \"{}\": {} sent, {} failed", title, report.sent, report.failed);
        report
    }

    async fn send_one(&self, token: &str, title: &str, body: &str) -> Result<()> {
        let message = json!({
            "to": token,
            "notification": { "title": title, "body": body },
        });
        self.client
            .post(&self.config.endpoint)
            .header(AUTHORIZATION, format!("key={}", self.config.server_key))
            .json(&message)
            .send()
            .await
            .context("request failed")?
            .error_for_status()
            .context("push service rejected the message")?;
        Ok(())
    }

    /// offer a fresh reading to the alert rule; sends in the background
    pub fn observe(self: &Arc<Self>, reading: &SensorReading) {
        if !self.config.enabled {
            return;
        }
        if let Some(body) = self.alert_for(reading) {
            let notifier = Arc::clone(self);
            tokio::spawn(async move {
                let title = notifier.config.title.clone();
                notifier.send_all(&title, &body).await;
            });
        }
    }

    /// alert body if this reading moves the alert field into an alert value
    fn alert_for(&self, reading: &SensorReading) -> Option<String> {
        let field = self.config.alert_field.as_deref()?;
        let current = match reading.get(field)? {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let mut last = self.last_alert_value.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = last.as_deref() != Some(current.as_str());
        *last = Some(current.clone());

        if changed && self.config.alert_values.iter().any(|v| *v == current) {
            Some(format!("{} is {}", field, current))
        } else {
            None
        }
    }
}

fn abbreviate(token: &str) -> String {
    if token.chars().count() <= 8 {
        return token.to_string();
    }
    let head: String = token.chars().take(8).collect();
    format!("{}…", head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Json, Router};

    fn config(endpoint: &str) -> NotificationsConfig {
        NotificationsConfig {
            enabled: true,
            endpoint: endpoint.to_string(),
            server_key: "test-key".to_string(),
            alert_field: Some("plant_status".to_string()),
            alert_values: vec!["FAULT".to_string()],
            title: "Plant alert".to_string(),
            request_timeout_seconds: 5,
        }
    }

    fn notifier(endpoint: &str) -> Notifier {
        Notifier::new(config(endpoint), Arc::new(MemoryStore::new())).unwrap()
    }

    fn reading(json: &str) -> SensorReading {
        SensorReading::from_payload(json.as_bytes()).unwrap()
    }

    type Received = Arc<Mutex<Vec<(Option<String>, Value)>>>;

    async fn record_push(
        State(log): State<Received>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> StatusCode {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let rejected = body["to"] == "bad-token";
        log.lock().unwrap().push((auth, body));
        if rejected {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::OK
        }
    }

    /// stand-in push service; rejects the token "bad-token"
    async fn push_service() -> (String, Received) {
        let received: Received = Arc::default();
        let app = Router::new()
            .route("/send", post(record_push))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{}/send", addr), received)
    }

    #[test]
    fn register_is_idempotent() {
        let n = notifier("http://127.0.0.1:1/unused");
        assert!(n.register("device-a"));
        assert!(!n.register("device-a"));
        assert!(!n.register("  device-a  "));
        assert!(!n.register("   "));
        assert_eq!(n.token_count(), 1);
    }

    #[test]
    fn alerts_on_transition_only() {
        let n = notifier("http://127.0.0.1:1/unused");
        assert_eq!(n.alert_for(&reading(r#"{"plant_status":"RUNNING"}"#)), None);
        assert_eq!(
            n.alert_for(&reading(r#"{"plant_status":"FAULT"}"#)).as_deref(),
            Some("plant_status is FAULT")
        );
        // still faulted: no repeat
        assert_eq!(n.alert_for(&reading(r#"{"plant_status":"FAULT"}"#)), None);
        // readings without the field leave the edge state alone
        assert_eq!(n.alert_for(&reading(r#"{"voltage":230}"#)), None);
        assert_eq!(n.alert_for(&reading(r#"{"plant_status":"FAULT"}"#)), None);
        assert_eq!(n.alert_for(&reading(r#"{"plant_status":"RUNNING"}"#)), None);
        assert!(n.alert_for(&reading(r#"{"plant_status":"FAULT"}"#)).is_some());
    }

    #[tokio::test]
    async fn send_all_with_no_tokens_sends_nothing() {
        let n = notifier("http://127.0.0.1:1/unused");
        assert_eq!(n.send_all("t", "b").await, DeliveryReport::default());
    }

    #[tokio::test]
    async fn send_all_counts_failures_without_stopping() {
        let (endpoint, received) = push_service().await;
        let n = notifier(&endpoint);
        n.register("device-a");
        n.register("bad-token");
        n.register("device-b");

        let report = n.send_all("Plant alert", "plant_status is FAULT").await;
        assert_eq!(report, DeliveryReport { sent: 2, failed: 1 });

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 3);
        let (auth, body) = &received[0];
        assert_eq!(auth.as_deref(), Some("key=test-key"));
        assert_eq!(body["to"], "device-a");
        assert_eq!(body["notification"]["body"], "plant_status is FAULT");
    }

    #[tokio::test]
    async fn unreachable_service_is_counted_not_raised() {
        // port 1 on loopback refuses connections
        let n = notifier("http://127.0.0.1:1/send");
        n.register("device-a");
        assert_eq!(n.send_all("t", "b").await, DeliveryReport { sent: 0, failed: 1 });
    }
}
