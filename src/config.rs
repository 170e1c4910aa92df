//! Configuration management for windowgate.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LimitExceeded, LimiterError, Result, DEFAULT_REJECTION_MESSAGE};
use crate::ratelimit::{AdmissionMode, RetryPivot};

/// Prefix of environment variables overriding file configuration,
/// e.g. `WINDOWGATE__QUOTA__LIMIT=10`.
pub const ENV_PREFIX: &str = "WINDOWGATE";

/// Main configuration for the windowgate binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowgateConfig {
    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Quota applied to every key
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Optional namespace prepended to every key as `<prefix>:<key>`
    #[serde(default)]
    pub key_prefix: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            key_prefix: None,
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON formatted events
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Unvalidated quota options, as read from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Maximum entries allowed in the window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in milliseconds
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,

    /// Minimum spacing between grants in milliseconds; 0 disables
    #[serde(default)]
    pub difference_ms: u64,

    /// Key expiry in milliseconds; defaults to the window length
    #[serde(default)]
    pub ttl_ms: Option<u64>,

    /// Admission mode
    #[serde(default)]
    pub mode: AdmissionMode,

    /// Rejection error template
    #[serde(default)]
    pub error: RejectionConfig,

    /// Entry the status retry estimate is based on
    #[serde(default)]
    pub retry_pivot: RetryPivot,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            duration_ms: default_duration_ms(),
            difference_ms: 0,
            ttl_ms: None,
            mode: AdmissionMode::default(),
            error: RejectionConfig::default(),
            retry_pivot: RetryPivot::default(),
        }
    }
}

fn default_limit() -> u64 {
    1
}

fn default_duration_ms() -> u64 {
    1000
}

/// The error raised when a batch is rejected.
///
/// Missing status fields default to 429; supplied ones are kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RejectionConfig {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub status_code: Option<u16>,
}

/// A validated, immutable quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    limit: u64,
    duration_ms: u64,
    difference_ms: u64,
    ttl_ms: u64,
    mode: AdmissionMode,
    rejection: LimitExceeded,
    retry_pivot: RetryPivot,
}

impl Quota {
    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn difference_ms(&self) -> u64 {
        self.difference_ms
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn mode(&self) -> AdmissionMode {
        self.mode
    }

    pub fn retry_pivot(&self) -> RetryPivot {
        self.retry_pivot
    }

    /// Lowest score still inside the window ending at `now`.
    pub fn window_start(&self, now: i64) -> i64 {
        // duration_ms is bounded by i64::MAX during validation
        now.saturating_sub(self.duration_ms as i64)
    }

    /// A fresh rejection error.
    pub fn rejection(&self) -> LimitExceeded {
        self.rejection.clone()
    }
}

impl QuotaConfig {
    /// Validate the options and freeze them into a [`Quota`].
    pub fn validate(&self) -> Result<Quota> {
        if self.limit == 0 {
            return Err(LimiterError::Config(
                "limit must be a positive number".to_string(),
            ));
        }
        if self.duration_ms == 0 || i64::try_from(self.duration_ms).is_err() {
            return Err(LimiterError::Config(
                "duration_ms must be a positive number of milliseconds".to_string(),
            ));
        }
        if i64::try_from(self.difference_ms).is_err() {
            return Err(LimiterError::Config(
                "difference_ms must be a positive number of milliseconds or 0".to_string(),
            ));
        }

        let ttl_ms = self.ttl_ms.unwrap_or(self.duration_ms);
        if ttl_ms < self.duration_ms {
            return Err(LimiterError::Config(
                "ttl_ms must be greater than or equal to duration_ms".to_string(),
            ));
        }

        let message = self
            .error
            .message
            .clone()
            .unwrap_or_else(|| DEFAULT_REJECTION_MESSAGE.to_string());
        if message.trim().is_empty() {
            return Err(LimiterError::Config(
                "error message must not be empty".to_string(),
            ));
        }

        Ok(Quota {
            limit: self.limit,
            duration_ms: self.duration_ms,
            difference_ms: self.difference_ms,
            ttl_ms,
            mode: self.mode,
            rejection: LimitExceeded::new(message, self.error.status, self.error.status_code),
            retry_pivot: self.retry_pivot,
        })
    }
}

impl WindowgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Layer an optional configuration file and `WINDOWGATE__*` environment
    /// variables over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path));
        }

        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| LimiterError::Config(format!("Failed to load configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_defaults() {
        let quota = QuotaConfig::default().validate().unwrap();
        assert_eq!(quota.limit(), 1);
        assert_eq!(quota.duration_ms(), 1000);
        assert_eq!(quota.difference_ms(), 0);
        assert_eq!(quota.ttl_ms(), 1000);
        assert_eq!(quota.mode(), AdmissionMode::Binary);
        assert_eq!(quota.retry_pivot(), RetryPivot::LimitMinusTwo);
        assert_eq!(quota.rejection(), LimitExceeded::default());
    }

    #[test]
    fn test_quota_rejects_invalid_options() {
        let cases = [
            QuotaConfig {
                limit: 0,
                ..QuotaConfig::default()
            },
            QuotaConfig {
                duration_ms: 0,
                ..QuotaConfig::default()
            },
            QuotaConfig {
                duration_ms: 1000,
                ttl_ms: Some(999),
                ..QuotaConfig::default()
            },
            QuotaConfig {
                error: RejectionConfig {
                    message: Some("  ".to_string()),
                    ..RejectionConfig::default()
                },
                ..QuotaConfig::default()
            },
        ];

        for config in cases {
            let err = config.validate().unwrap_err();
            assert!(matches!(err, LimiterError::Config(_)), "{:?}", config);
        }
    }

    #[test]
    fn test_rejection_template_keeps_caller_codes() {
        let config = QuotaConfig {
            error: RejectionConfig {
                message: Some("Custom error".to_string()),
                status: Some(503),
                status_code: Some(503),
            },
            ..QuotaConfig::default()
        };

        let rejection = config.validate().unwrap().rejection();
        assert_eq!(rejection.message, "Custom error");
        assert_eq!(rejection.status, 503);
        assert_eq!(rejection.status_code, 503);
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
store:
  redis_url: redis://cache:6379/
  key_prefix: api
quota:
  limit: 10
  duration_ms: 300
  ttl_ms: 86400000
  mode: nary
  retry_pivot: limit_minus_one
logging:
  level: debug
"#;
        let config = WindowgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.redis_url, "redis://cache:6379/");
        assert_eq!(config.store.key_prefix.as_deref(), Some("api"));
        assert_eq!(config.quota.limit, 10);
        assert_eq!(config.quota.mode, AdmissionMode::Nary);
        assert_eq!(config.quota.retry_pivot, RetryPivot::LimitMinusOne);
        assert_eq!(config.quota.difference_ms, 0);
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let yaml = r#"
quota:
  mode: bursty
"#;
        let err = WindowgateConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, LimiterError::Config(_)));
    }

    #[test]
    fn test_load_layers_environment_over_defaults() {
        std::env::set_var("WINDOWGATE__QUOTA__LIMIT", "7");
        std::env::set_var("WINDOWGATE__QUOTA__MODE", "nary");

        let loaded = WindowgateConfig::load(None);

        std::env::remove_var("WINDOWGATE__QUOTA__LIMIT");
        std::env::remove_var("WINDOWGATE__QUOTA__MODE");

        let config = loaded.unwrap();
        assert_eq!(config.quota.limit, 7);
        assert_eq!(config.quota.mode, AdmissionMode::Nary);
        assert_eq!(config.quota.duration_ms, 1000);
    }

    #[test]
    fn test_load_reads_yaml_file() {
        let path = std::env::temp_dir().join(format!(
            "windowgate-{}.yaml",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::write(
            &path,
            "store:\n  redis_url: redis://file:6379/\nquota:\n  duration_ms: 250\n  retry_pivot: limit_minus_one\n",
        )
        .unwrap();

        let loaded = WindowgateConfig::load(Some(&path));
        std::fs::remove_file(&path).unwrap();

        // Only fields the environment test leaves alone are asserted
        let config = loaded.unwrap();
        assert_eq!(config.store.redis_url, "redis://file:6379/");
        assert_eq!(config.quota.duration_ms, 250);
        assert_eq!(config.quota.retry_pivot, RetryPivot::LimitMinusOne);
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = WindowgateConfig::from_yaml("{}").unwrap();
        assert_eq!(config.store.redis_url, "redis://127.0.0.1:6379/");
        assert_eq!(config.quota.limit, 1);
        assert_eq!(config.logging.level, "info");
    }
}
