//! Bounded alert history plus best-effort webhook delivery.

use crate::metrics::Metrics;
use deacon_common::chrono::{DateTime, Utc};
use deacon_common::{DeaconError, Result, Severity};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    title: &'a str,
    message: &'a str,
    severity: Severity,
    timestamp: String,
    source: &'static str,
}

pub struct AlertDispatcher {
    history: Mutex<VecDeque<Alert>>,
    limit: usize,
    webhook_url: Option<String>,
    client: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl AlertDispatcher {
    pub fn new(webhook_url: Option<String>, limit: usize, metrics: Arc<Metrics>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| DeaconError::Config(format!("failed to build webhook client: {e}")))?;
        if webhook_url.is_none() {
            info!("No alert webhook configured, alerts are log-only");
        }
        Ok(Self {
            history: Mutex::new(VecDeque::with_capacity(limit.min(1024))),
            limit: limit.max(1),
            webhook_url,
            client,
            metrics,
        })
    }

    /// Records the alert and attempts one delivery. Never fails.
    pub async fn send(&self, title: &str, message: &str, severity: Severity) {
        match severity {
            Severity::Critical => error!(%title, %message, "ALERT"),
            Severity::Warning => warn!(%title, %message, "ALERT"),
            Severity::Info => info!(%title, %message, "ALERT"),
        }

        let alert = Alert {
            title: title.to_string(),
            message: message.to_string(),
            severity,
            timestamp: Utc::now(),
        };
        {
            let mut history = self.history.lock().await;
            if history.len() == self.limit {
                history.pop_front();
            }
            history.push_back(alert.clone());
        }
        self.metrics.alerts.fetch_add(1, Ordering::Relaxed);

        if let Some(url) = &self.webhook_url {
            self.deliver(url, &alert).await;
        }
    }

    async fn deliver(&self, url: &str, alert: &Alert) {
        let payload = WebhookPayload {
            title: &alert.title,
            message: &alert.message,
            severity: alert.severity,
            timestamp: alert.timestamp.to_rfc3339(),
            source: "deacon",
        };
        match self.client.post(url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(status = %resp.status(), "Alert webhook rejected delivery"),
            Err(e) => warn!(error = %e, "Alert webhook delivery failed"),
        }
    }

    /// Oldest first.
    pub async fn history(&self) -> Vec<Alert> {
        self.history.lock().await.iter().cloned().collect()
    }
}
