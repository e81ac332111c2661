//! Channel fan-out for fired alerts (spec.md §4.C step 4).
//!
//! Console, webhook, and chat channels are dispatched directly here;
//! email is always delegated through the injected [`crate::notify::Notifier`].
//! Webhook retries use capped exponential backoff in the shape of the
//! teacher's `BackoffCalculator` (`scrapers::binance_session`), without
//! jitter since a handful of sequential retries don't need thundering-herd
//! protection.

use crate::alerts::model::{Alert, Channel, Severity};
use crate::config::{ChannelsConfig, HttpMethod};
use crate::notify::SharedNotifier;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {0:?} is not enabled")]
    Disabled(Channel),
    #[error("webhook dispatch failed after {attempts} attempts: {source}")]
    Webhook {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("notifier error: {0}")]
    Notify(#[from] crate::notify::NotifyError),
}

pub struct ChannelDispatcher {
    config: ChannelsConfig,
    http: reqwest::Client,
    notifier: SharedNotifier,
}

impl ChannelDispatcher {
    pub fn new(config: ChannelsConfig, notifier: SharedNotifier) -> Self {
        let http = reqwest::Client::builder()
            .build()
            .expect("reqwest client builder with no custom TLS config cannot fail");
        Self {
            config,
            http,
            notifier,
        }
    }

    /// Dispatches `alert` to every channel in `alert.channels` that is
    /// enabled, concurrently. Individual channel failures are logged
    /// and do not prevent delivery to the others.
    pub async fn dispatch(&self, alert: &Alert) {
        let sends = alert.channels.iter().map(|&channel| async move {
            if !self.config.is_enabled(channel) {
                return;
            }
            if let Err(e) = self.send_one(channel, alert).await {
                tracing::warn!(channel = ?channel, alert_id = %alert.id, error = %e, "alert delivery failed");
            }
        });
        futures_util::future::join_all(sends).await;
    }

    async fn send_one(&self, channel: Channel, alert: &Alert) -> Result<(), ChannelError> {
        match channel {
            Channel::Console => {
                self.send_console(alert);
                Ok(())
            }
            Channel::Email => {
                self.notifier
                    .send("email", &alert.title, &alert.message, alert.severity)
                    .await?;
                Ok(())
            }
            Channel::Webhook => self.send_webhook(alert).await,
            Channel::Chat => self.send_chat(alert).await,
        }
    }

    fn send_console(&self, alert: &Alert) {
        let label = match alert.severity {
            Severity::Info => "INFO",
            Severity::Warning => "WARN",
            Severity::Critical => "CRIT",
            Severity::Emergency => "EMRG",
        };
        println!("[{label}] {}: {}", alert.title, alert.message);
    }

    async fn send_webhook(&self, alert: &Alert) -> Result<(), ChannelError> {
        let cfg = &self.config.webhook;
        let body = serde_json::json!({
            "id": alert.id,
            "severity": alert.severity,
            "title": alert.title,
            "message": alert.message,
            "payload": alert.payload,
        });

        let mut attempt = 0u32;
        loop {
            let mut req = match cfg.method {
                HttpMethod::Post => self.http.post(&cfg.url),
                HttpMethod::Put => self.http.put(&cfg.url),
            };
            for (key, value) in &cfg.headers {
                req = req.header(key, value);
            }
            let result = req
                .json(&body)
                .timeout(Duration::from_millis(cfg.timeout_ms))
                .send()
                .await
                .and_then(|resp| resp.error_for_status());

            match result {
                Ok(_) => return Ok(()),
                Err(e) if attempt >= cfg.retries => {
                    return Err(ChannelError::Webhook {
                        attempts: attempt + 1,
                        source: e,
                    })
                }
                Err(_) => {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn send_chat(&self, alert: &Alert) -> Result<(), ChannelError> {
        let cfg = &self.config.chat;
        let body = serde_json::json!({
            "channel": cfg.channel,
            "username": cfg.username,
            "icon_emoji": cfg.icon,
            "text": format!("*{}*\n{}", alert.title, alert.message),
        });
        self.http
            .post(&cfg.webhook_url)
            .json(&body)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| ChannelError::Webhook {
                attempts: 1,
                source: e,
            })?;
        Ok(())
    }
}

/// `base * 2^attempt`, capped at 30s. Matches the teacher's
/// `BackoffCalculator::next_backoff` multiplier/cap shape, minus jitter.
fn backoff_delay(attempt: u32) -> Duration {
    const BASE_MS: f64 = 1_000.0;
    const MAX_MS: f64 = 30_000.0;
    let ms = (BASE_MS * 2f64.powi(attempt as i32)).min(MAX_MS);
    Duration::from_millis(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(1), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(20), Duration::from_millis(30_000));
    }
}
