//! Webhook alerting.
//!
//! Severity-tagged, fire-and-forget. A remote 4xx (bad or blocked webhook)
//! permanently switches the sink to log-only for the process lifetime;
//! transient 5xx/network errors log and stay enabled for the next alert.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    KillSwitch,
}

impl AlertLevel {
    fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::KillSwitch => "kill_switch",
        }
    }

    fn color(&self) -> u32 {
        match self {
            AlertLevel::Info => 0x2B8A3E,
            AlertLevel::Warning => 0xFFC107,
            AlertLevel::Error => 0xDC3545,
            AlertLevel::KillSwitch => 0x6F42C1,
        }
    }
}

pub struct AlertSink {
    webhook_url: Option<String>,
    enabled: bool,
    app_name: String,
    http: reqwest::Client,
    remote_disabled: AtomicBool,
}

impl AlertSink {
    pub fn new(webhook_url: Option<String>, enabled: bool, app_name: &str) -> Arc<Self> {
        let active = enabled && webhook_url.is_some();
        Arc::new(Self {
            webhook_url,
            enabled: active,
            app_name: app_name.to_string(),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            remote_disabled: AtomicBool::new(false),
        })
    }

    pub async fn send(&self, level: AlertLevel, title: &str, message: &str) {
        if !self.enabled || self.remote_disabled.load(Ordering::Relaxed) {
            info!(
                "[alert:dryrun] {} | {} | {}",
                level.as_str(),
                title,
                message
            );
            return;
        }
        let Some(url) = &self.webhook_url else { return };

        let payload = json!({
            "content": if message.is_empty() { serde_json::Value::Null } else { json!(message) },
            "embeds": [{
                "title": format!("[{}] {}", self.app_name, title),
                "color": level.color(),
            }],
        });

        match self.http.post(url).json(&payload).send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_client_error() {
                    warn!(
                        "[alert] disabling remote alerts due to HTTP {}; switching to log-only",
                        status
                    );
                    self.remote_disabled.store(true, Ordering::Relaxed);
                } else if !status.is_success() {
                    warn!("[alert] post failed with HTTP {}", status);
                }
            }
            Err(err) => warn!("[alert] post failed: {err}"),
        }
    }

    pub async fn info(&self, title: &str, message: &str) {
        self.send(AlertLevel::Info, title, message).await;
    }

    pub async fn warning(&self, title: &str, message: &str) {
        self.send(AlertLevel::Warning, title, message).await;
    }

    pub async fn error(&self, title: &str, message: &str) {
        self.send(AlertLevel::Error, title, message).await;
    }

    pub async fn kill_switch(&self, title: &str, message: &str) {
        self.send(AlertLevel::KillSwitch, title, message).await;
    }
}

/// Post without blocking the caller's loop.
pub fn fire_and_forget(sink: &Arc<AlertSink>, level: AlertLevel, title: &str, message: &str) {
    let sink = sink.clone();
    let title = title.to_string();
    let message = message.to_string();
    tokio::spawn(async move {
        sink.send(level, &title, &message).await;
    });
}
