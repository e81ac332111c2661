//! Top-level configuration surface (spec.md §6).
//!
//! Loaded from TOML via `toml::from_str`, following the teacher's
//! `PerfConfig::load`/`from_env` pattern: explicit file load with a
//! logged fallback to defaults, never a panic on missing config.

use crate::alerts::model::{Channel, ThresholdRule};
use crate::failover::model::FailoverRule;
use crate::recovery::model::RecoveryComponent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents =
            std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
                path: path_ref.display().to_string(),
                source,
            })?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env_or_default() -> Self {
        let path =
            std::env::var("SENTINEL_CONFIG_PATH").unwrap_or_else(|_| "sentinel.toml".to_string());
        match Self::load(&path) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!("using default config ({path}): {e}");
                Self::default()
            }
        }
    }

    /// Fatal configuration errors detected once at load time (spec.md §7):
    /// cyclic component dependencies, non-positive intervals, duplicate
    /// rule names, and custom-type failover conditions and recovery
    /// validation steps (rejected per spec.md §9's design-flag decision).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sampler.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sampler.interval_ms must be positive".into(),
            ));
        }
        if self.recovery.max_recovery_time_s < 60 {
            return Err(ConfigError::Invalid(
                "recovery.max_recovery_time_s must be >= 60".into(),
            ));
        }

        let mut seen_rule_names = std::collections::HashSet::new();
        for rule in &self.alerts.rules {
            if !seen_rule_names.insert(rule.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate threshold rule name: {}",
                    rule.name
                )));
            }
        }

        for rule in &self.failover.rules {
            if rule.conditions.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "failover rule {} has no conditions",
                    rule.id
                )));
            }
            if rule.actions.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "failover rule {} has no actions",
                    rule.id
                )));
            }
            for cond in &rule.conditions {
                if matches!(cond.kind, crate::failover::model::ConditionKind::Custom) {
                    return Err(ConfigError::Invalid(format!(
                        "failover rule {}: custom conditions are not implemented",
                        rule.id
                    )));
                }
            }
        }

        self.recovery.dependency_graph_is_acyclic()?;

        for component in &self.recovery.components {
            for step in &component.validation_steps {
                if matches!(step.kind, crate::recovery::model::ValidationKind::Custom) {
                    return Err(ConfigError::Invalid(format!(
                        "recovery component {}: custom validation steps are not implemented",
                        component.name
                    )));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    #[serde(default = "default_sampler_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_true")]
    pub enable_host_metrics: bool,
    #[serde(default = "default_true")]
    pub enable_domain_metrics: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sampler_interval_ms(),
            enable_host_metrics: true,
            enable_domain_metrics: true,
        }
    }
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_sampler_interval_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_compress_after_days")]
    pub compress_after_days: u32,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    #[serde(default = "default_compress_interval_ms")]
    pub compress_interval_ms: u64,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_bytes: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            retention_days: default_retention_days(),
            compress_after_days: default_compress_after_days(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            compress_interval_ms: default_compress_interval_ms(),
            max_bytes: 0,
        }
    }
}

fn default_storage_dir() -> String {
    "./data/metrics".to_string()
}
fn default_retention_days() -> u32 {
    30
}
fn default_compress_after_days() -> u32 {
    7
}
fn default_cleanup_interval_ms() -> u64 {
    86_400_000
}
fn default_compress_interval_ms() -> u64 {
    21_600_000
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlertsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<ThresholdRule>,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default = "default_max_alerts_per_hour")]
    pub max_alerts_per_hour: u32,
    #[serde(default = "default_alert_retention_days")]
    pub alert_retention_days: u32,
}

fn default_max_alerts_per_hour() -> u32 {
    50
}
fn default_alert_retention_days() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub console: ConsoleChannelConfig,
    #[serde(default)]
    pub email: EmailChannelConfig,
    #[serde(default)]
    pub webhook: WebhookChannelConfig,
    #[serde(default)]
    pub chat: ChatChannelConfig,
}

impl ChannelsConfig {
    pub fn is_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Console => self.console.enabled,
            Channel::Email => self.email.enabled,
            Channel::Webhook => self.webhook.enabled,
            Channel::Chat => self.chat.enabled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleChannelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub colors: bool,
}

impl Default for ConsoleChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            colors: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EmailChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub subject: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SmtpConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_method")]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_webhook_retries")]
    pub retries: u32,
}

impl Default for WebhookChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            method: HttpMethod::Post,
            headers: HashMap::new(),
            timeout_ms: default_webhook_timeout_ms(),
            retries: default_webhook_retries(),
        }
    }
}

fn default_method() -> HttpMethod {
    HttpMethod::Post
}
fn default_webhook_timeout_ms() -> u64 {
    5_000
}
fn default_webhook_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub icon: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default)]
    pub services: Vec<ServiceProbeConfig>,
    #[serde(default)]
    pub kv: KvProbeConfig,
    #[serde(default)]
    pub streams: Vec<StreamProbeConfig>,
    #[serde(default = "default_overall_timeout_s")]
    pub overall_timeout_s: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            kv: KvProbeConfig::default(),
            streams: Vec::new(),
            overall_timeout_s: default_overall_timeout_s(),
        }
    }
}

fn default_overall_timeout_s() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeProtocol {
    Http,
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceProbeConfig {
    pub name: String,
    pub protocol: ProbeProtocol,
    pub target: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub critical: bool,
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KvProbeConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub test_pubsub: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamProbeConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub probe_message: Option<String>,
    #[serde(default)]
    pub expected_substring: Option<String>,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default)]
    pub rules: Vec<FailoverRule>,
    #[serde(default = "default_evaluate_interval_ms")]
    pub evaluate_interval_ms: u64,
    /// Consecutive rule-execution failures before the engine opens the
    /// circuit breaker and suppresses further attempts for that rule.
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    /// How long the circuit stays open before moving to half-open.
    #[serde(default = "default_circuit_breaker_timeout_s")]
    pub circuit_breaker_timeout_s: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            evaluate_interval_ms: default_evaluate_interval_ms(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_timeout_s: default_circuit_breaker_timeout_s(),
        }
    }
}

fn default_evaluate_interval_ms() -> u64 {
    5_000
}
fn default_circuit_breaker_threshold() -> u32 {
    3
}
fn default_circuit_breaker_timeout_s() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default)]
    pub components: Vec<RecoveryComponent>,
    #[serde(default = "default_max_recovery_time_s")]
    pub max_recovery_time_s: u64,
    #[serde(default = "default_validation_timeout_s")]
    pub validation_timeout_s: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_s")]
    pub retry_delay_s: u64,
    #[serde(default)]
    pub validation: RecoveryValidationConfig,
    #[serde(default)]
    pub notifications: RecoveryNotificationsConfig,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            components: Vec::new(),
            max_recovery_time_s: default_max_recovery_time_s(),
            validation_timeout_s: default_validation_timeout_s(),
            retry_attempts: default_retry_attempts(),
            retry_delay_s: default_retry_delay_s(),
            validation: RecoveryValidationConfig::default(),
            notifications: RecoveryNotificationsConfig::default(),
        }
    }
}

fn default_max_recovery_time_s() -> u64 {
    900
}
fn default_validation_timeout_s() -> u64 {
    30
}
fn default_retry_attempts() -> u32 {
    2
}
fn default_retry_delay_s() -> u64 {
    5
}

impl RecoveryConfig {
    /// Detects cycles in the component dependency graph at config-load
    /// time (spec.md §4.E step 1 / §8 invariant 8).
    pub fn dependency_graph_is_acyclic(&self) -> Result<(), ConfigError> {
        let by_name: HashMap<&str, &RecoveryComponent> =
            self.components.iter().map(|c| (c.name.as_str(), c)).collect();

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        fn visit<'a>(
            name: &'a str,
            by_name: &HashMap<&'a str, &'a RecoveryComponent>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<(), ConfigError> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(ConfigError::Invalid(format!(
                        "cyclic recovery component dependency involving {name}"
                    )))
                }
                None => {}
            }
            marks.insert(name, Mark::Visiting);
            if let Some(component) = by_name.get(name) {
                for dep in &component.dependencies {
                    visit(dep, by_name, marks)?;
                }
            }
            marks.insert(name, Mark::Done);
            Ok(())
        }

        for name in by_name.keys() {
            visit(name, &by_name, &mut marks)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecoveryValidationConfig {
    #[serde(default)]
    pub trading_checks: Vec<String>,
    #[serde(default)]
    pub perf_thresholds: HashMap<String, f64>,
    #[serde(default)]
    pub data_integrity_checks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecoveryNotificationsConfig {
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub templates: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_sampler_interval() {
        let mut cfg = Config::default();
        cfg.sampler.interval_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_short_max_recovery_time() {
        let mut cfg = Config::default();
        cfg.recovery.max_recovery_time_s = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_cyclic_components() {
        use crate::recovery::model::RecoveryComponent;
        let mut cfg = Config::default();
        cfg.recovery.components = vec![
            RecoveryComponent {
                name: "a".into(),
                priority: 1,
                dependencies: vec!["b".into()],
                steps: vec![],
                validation_steps: vec![],
                rollback_steps: vec![],
            },
            RecoveryComponent {
                name: "b".into(),
                priority: 1,
                dependencies: vec!["a".into()],
                steps: vec![],
                validation_steps: vec![],
                rollback_steps: vec![],
            },
        ];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_custom_validation_step() {
        use crate::recovery::model::{RecoveryComponent, ValidationCriteria, ValidationKind, ValidationStep};
        let mut cfg = Config::default();
        cfg.recovery.components = vec![RecoveryComponent {
            name: "a".into(),
            priority: 1,
            dependencies: vec![],
            steps: vec![],
            validation_steps: vec![ValidationStep {
                id: "check".into(),
                kind: ValidationKind::Custom,
                target: "a".into(),
                criteria: ValidationCriteria::Threshold { threshold: 1.0 },
                timeout_ms: 1000,
            }],
            rollback_steps: vec![],
        }];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.toml");
        std::fs::write(&path, "[sampler]\ninterval_ms = 15000\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.sampler.interval_ms, 15000);
    }
}
