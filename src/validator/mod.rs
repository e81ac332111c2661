//! Deployment Validator (spec.md §4.D) — concurrent post-deploy probes
//! against HTTP/TCP services, the KV store, and streaming endpoints.
//!
//! Grounded in the teacher's `route_quality::prober::RouteQualityProber`:
//! one probe method per protocol, a bounded per-probe timeout via
//! `tokio::time::timeout`, and all endpoints probed concurrently rather
//! than sequentially.

use crate::config::{KvProbeConfig, ProbeProtocol, ServiceProbeConfig, StreamProbeConfig, ValidatorConfig};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("validation deadline of {0:?} exceeded before all probes completed")]
    DeadlineExceeded(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub name: String,
    pub kind: &'static str,
    pub outcome: ProbeOutcome,
    pub latency_ms: u64,
    pub critical: bool,
    pub detail: Option<String>,
}

impl ProbeResult {
    fn pass(name: &str, kind: &'static str, latency_ms: u64, critical: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            outcome: ProbeOutcome::Pass,
            latency_ms,
            critical,
            detail: None,
        }
    }

    fn fail(name: &str, kind: &'static str, latency_ms: u64, critical: bool, detail: String) -> Self {
        Self {
            name: name.to_string(),
            kind,
            outcome: ProbeOutcome::Fail,
            latency_ms,
            critical,
            detail: Some(detail),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub results: Vec<ProbeResult>,
    /// True only if every critical probe passed. Non-critical failures
    /// are surfaced in `results` but do not flip this to false.
    pub passed: bool,
    pub elapsed_ms: u64,
}

pub struct Validator {
    config: ValidatorConfig,
    http: reqwest::Client,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        let http = reqwest::Client::builder()
            .build()
            .expect("reqwest client builder with no custom TLS config cannot fail");
        Self { config, http }
    }

    /// Runs every configured probe concurrently, bounded by
    /// `overall_timeout_s`. In `quick` mode, only critical service
    /// probes run (spec.md §4.D "quick" mode).
    pub async fn validate(&self, quick: bool) -> Result<ValidationReport, ValidatorError> {
        let start = Instant::now();
        let overall = Duration::from_secs(self.config.overall_timeout_s);

        let services: Vec<&ServiceProbeConfig> = self
            .config
            .services
            .iter()
            .filter(|s| !quick || s.critical)
            .collect();

        let service_futs = services
            .iter()
            .map(|svc| self.probe_service(svc));
        let kv_fut = async {
            if self.config.kv.host.is_empty() {
                None
            } else {
                Some(self.probe_kv(&self.config.kv, quick).await)
            }
        };
        let stream_futs = if quick {
            Vec::new()
        } else {
            self.config
                .streams
                .iter()
                .map(|s| self.probe_stream(s))
                .collect()
        };

        let run_all = async {
            let (service_results, kv_result, stream_results) = tokio::join!(
                futures_util::future::join_all(service_futs),
                kv_fut,
                futures_util::future::join_all(stream_futs),
            );
            let mut results = service_results;
            if let Some(kv) = kv_result {
                results.push(kv);
            }
            results.extend(stream_results);
            results
        };

        let results = timeout(overall, run_all)
            .await
            .map_err(|_| ValidatorError::DeadlineExceeded(overall))?;

        let passed = results
            .iter()
            .all(|r| !r.critical || r.outcome == ProbeOutcome::Pass);

        Ok(ValidationReport {
            results,
            passed,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn probe_service(&self, svc: &ServiceProbeConfig) -> ProbeResult {
        match svc.protocol {
            ProbeProtocol::Http => self.probe_http(svc).await,
            ProbeProtocol::Tcp => self.probe_tcp(svc).await,
        }
    }

    async fn probe_http(&self, svc: &ServiceProbeConfig) -> ProbeResult {
        let start = Instant::now();
        let fut = self.http.get(&svc.target).send();
        match timeout(Duration::from_millis(svc.timeout_ms), fut).await {
            Ok(Ok(resp)) if resp.status().is_success() => {
                ProbeResult::pass(&svc.name, "http", start.elapsed().as_millis() as u64, svc.critical)
            }
            Ok(Ok(resp)) => ProbeResult::fail(
                &svc.name,
                "http",
                start.elapsed().as_millis() as u64,
                svc.critical,
                format!("unexpected status {}", resp.status()),
            ),
            Ok(Err(e)) => ProbeResult::fail(
                &svc.name,
                "http",
                start.elapsed().as_millis() as u64,
                svc.critical,
                e.to_string(),
            ),
            Err(_) => ProbeResult::fail(
                &svc.name,
                "http",
                svc.timeout_ms,
                svc.critical,
                "timed out".into(),
            ),
        }
    }

    async fn probe_tcp(&self, svc: &ServiceProbeConfig) -> ProbeResult {
        let start = Instant::now();
        match timeout(Duration::from_millis(svc.timeout_ms), TcpStream::connect(&svc.target)).await {
            Ok(Ok(_stream)) => {
                ProbeResult::pass(&svc.name, "tcp", start.elapsed().as_millis() as u64, svc.critical)
            }
            Ok(Err(e)) => ProbeResult::fail(
                &svc.name,
                "tcp",
                start.elapsed().as_millis() as u64,
                svc.critical,
                e.to_string(),
            ),
            Err(_) => ProbeResult::fail(
                &svc.name,
                "tcp",
                svc.timeout_ms,
                svc.critical,
                "timed out".into(),
            ),
        }
    }

    /// Connects to the KV store, pings it, and — unless `quick` or
    /// `test_pubsub` is unset — performs a publish/subscribe round
    /// trip on a scratch channel. `quick` mode caps the probe at 2s
    /// and always skips the round trip (spec.md §4.D quick mode).
    async fn probe_kv(&self, kv: &KvProbeConfig, quick: bool) -> ProbeResult {
        let start = Instant::now();
        let timeout_ms = if quick {
            kv.timeout_ms.min(2_000)
        } else {
            kv.timeout_ms
        };
        let result = timeout(
            Duration::from_millis(timeout_ms),
            self.kv_round_trip(kv, quick),
        )
        .await;
        match result {
            Ok(Ok(())) => ProbeResult::pass("kv", "kv", start.elapsed().as_millis() as u64, true),
            Ok(Err(e)) => ProbeResult::fail("kv", "kv", start.elapsed().as_millis() as u64, true, e),
            Err(_) => ProbeResult::fail("kv", "kv", timeout_ms, true, "timed out".into()),
        }
    }

    async fn kv_round_trip(&self, kv: &KvProbeConfig, quick: bool) -> Result<(), String> {
        let url = match &kv.password {
            Some(pass) => format!("redis://:{pass}@{}:{}", kv.host, kv.port),
            None => format!("redis://{}:{}", kv.host, kv.port),
        };
        let client = redis::Client::open(url).map_err(|e| e.to_string())?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| e.to_string())?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| e.to_string())?;

        if kv.test_pubsub && !quick {
            self.pubsub_round_trip(&client).await?;
        }
        Ok(())
    }

    /// Opens a dedicated subscriber connection, subscribes to a fresh
    /// channel, publishes the probe payload on the primary connection,
    /// and waits up to 500ms for that exact payload to arrive. Both
    /// connections are dropped on every exit path (spec.md §4.D).
    async fn pubsub_round_trip(&self, client: &redis::Client) -> Result<(), String> {
        const PAYLOAD: &str = "sentinel-probe";
        let channel = format!("sentinel:probe:{}", uuid::Uuid::new_v4());

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| e.to_string())?;
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|e| e.to_string())?;

        let mut publish_conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| e.to_string())?;
        let _: i64 = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(PAYLOAD)
            .query_async(&mut publish_conn)
            .await
            .map_err(|e| e.to_string())?;

        let mut stream = pubsub.on_message();
        let wait = timeout(Duration::from_millis(500), stream.next()).await;
        match wait {
            Ok(Some(msg)) => {
                let payload: String = msg.get_payload().map_err(|e| e.to_string())?;
                if payload == PAYLOAD {
                    Ok(())
                } else {
                    Err(format!("unexpected pub/sub payload: {payload}"))
                }
            }
            Ok(None) => Err("pub/sub channel closed before delivery".into()),
            Err(_) => Err("pub/sub round trip timed out after 500ms".into()),
        }
    }

    async fn probe_stream(&self, stream: &StreamProbeConfig) -> ProbeResult {
        let start = Instant::now();
        let fut = self.stream_round_trip(stream);
        match timeout(Duration::from_millis(stream.timeout_ms), fut).await {
            Ok(Ok(())) => ProbeResult::pass(&stream.name, "stream", start.elapsed().as_millis() as u64, false),
            Ok(Err(e)) => ProbeResult::fail(
                &stream.name,
                "stream",
                start.elapsed().as_millis() as u64,
                false,
                e,
            ),
            Err(_) => ProbeResult::fail(
                &stream.name,
                "stream",
                stream.timeout_ms,
                false,
                "timed out".into(),
            ),
        }
    }

    async fn stream_round_trip(&self, stream: &StreamProbeConfig) -> Result<(), String> {
        let (mut ws, _) = tokio_tungstenite::connect_async(&stream.url)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(probe_message) = &stream.probe_message {
            ws.send(tokio_tungstenite::tungstenite::Message::Text(
                probe_message.clone(),
            ))
            .await
            .map_err(|e| e.to_string())?;
        }

        if let Some(expected) = &stream.expected_substring {
            while let Some(msg) = ws.next().await {
                let msg = msg.map_err(|e| e.to_string())?;
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    if text.contains(expected.as_str()) {
                        return Ok(());
                    }
                }
            }
            return Err("connection closed before expected message arrived".into());
        }

        match ws.next().await {
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(e.to_string()),
            None => Err("connection closed before any frame arrived".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_config_validates_with_no_probes() {
        let validator = Validator::new(ValidatorConfig::default());
        let report = validator.validate(false).await.unwrap();
        assert!(report.passed);
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn unreachable_critical_tcp_probe_fails_overall() {
        let config = ValidatorConfig {
            services: vec![ServiceProbeConfig {
                name: "down".into(),
                protocol: ProbeProtocol::Tcp,
                target: "127.0.0.1:1".into(),
                timeout_ms: 200,
                critical: true,
            }],
            ..ValidatorConfig::default()
        };
        let validator = Validator::new(config);
        let report = validator.validate(false).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.results[0].outcome, ProbeOutcome::Fail);
    }

    #[tokio::test]
    async fn unreachable_noncritical_probe_does_not_fail_overall() {
        let config = ValidatorConfig {
            services: vec![ServiceProbeConfig {
                name: "optional".into(),
                protocol: ProbeProtocol::Tcp,
                target: "127.0.0.1:1".into(),
                timeout_ms: 200,
                critical: false,
            }],
            ..ValidatorConfig::default()
        };
        let validator = Validator::new(config);
        let report = validator.validate(false).await.unwrap();
        assert!(report.passed);
    }

    #[tokio::test]
    async fn quick_mode_skips_noncritical_services() {
        let config = ValidatorConfig {
            services: vec![ServiceProbeConfig {
                name: "optional".into(),
                protocol: ProbeProtocol::Tcp,
                target: "127.0.0.1:1".into(),
                timeout_ms: 200,
                critical: false,
            }],
            ..ValidatorConfig::default()
        };
        let validator = Validator::new(config);
        let report = validator.validate(true).await.unwrap();
        assert!(report.results.is_empty());
    }
}
