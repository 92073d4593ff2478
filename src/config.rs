use std::env;

pub const DEFAULT_MAX_TAGS_PER_JOB: usize = 20;
pub const DEFAULT_RETENTION_DAYS: i64 = 30;
pub const DEFAULT_STUCK_TIMEOUT_HOURS: i64 = 24;

pub struct Config {
    pub database_url: String,
    pub frontend_origin: String,
    pub monitor: MonitorConfig,
}

/// Runtime options for the monitor itself. Everything here is read once at
/// startup; `enabled` is the master switch checked before any recording work.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub payload: PayloadConfig,
    pub telemetry: TelemetryConfig,
    pub tagging: TaggingConfig,
    pub retention_days: i64,
    pub stuck_timeout_hours: i64,
    /// Whether retry may fall back to a default-constructed job when no
    /// payload was ever stored. A stored-but-corrupt payload always refuses.
    pub retry_default_construct: bool,
    pub notify: NotifyConfig,
    pub environment: String,
}

#[derive(Debug, Clone)]
pub struct PayloadConfig {
    pub store_payload: bool,
    pub redact_keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub sample_rate: f64,
    pub capture_cpu: bool,
}

#[derive(Debug, Clone)]
pub struct TaggingConfig {
    pub enabled: bool,
    pub auto_queue_name: bool,
    pub auto_environment: bool,
    pub auto_hour: bool,
    pub max_tags_per_job: usize,
}

/// Targets handed to the external notifier on failures. Delivery itself is
/// not our job; we only recognize and surface the configuration.
#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub email: Option<String>,
    pub slack_webhook: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok(); // Load .env file

        let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");

        let frontend_origin =
            env::var("FRONTEND_ORIGIN").unwrap_or_else(|_| "http://localhost:5173".to_string());

        Config {
            database_url,
            frontend_origin,
            monitor: MonitorConfig::from_env(),
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        MonitorConfig {
            enabled: env_bool("MONITOR_ENABLED", true),
            payload: PayloadConfig {
                store_payload: env_bool("MONITOR_STORE_PAYLOAD", true),
                redact_keys: env::var("MONITOR_REDACT_KEYS")
                    .ok()
                    .map(|raw| {
                        raw.split(',')
                            .map(|k| k.trim().to_lowercase())
                            .filter(|k| !k.is_empty())
                            .collect()
                    })
                    .unwrap_or_else(PayloadConfig::default_redact_keys),
            },
            telemetry: TelemetryConfig {
                enabled: env_bool("MONITOR_TELEMETRY_ENABLED", true),
                sample_rate: env::var("MONITOR_TELEMETRY_SAMPLE_RATE")
                    .ok()
                    .and_then(|v| v.parse::<f64>().ok())
                    .map(|v| v.clamp(0.0, 1.0))
                    .unwrap_or(1.0),
                capture_cpu: env_bool("MONITOR_TELEMETRY_CPU", true),
            },
            tagging: TaggingConfig {
                enabled: env_bool("MONITOR_TAGGING_ENABLED", true),
                auto_queue_name: env_bool("MONITOR_TAG_QUEUE_NAME", true),
                auto_environment: env_bool("MONITOR_TAG_ENVIRONMENT", false),
                auto_hour: env_bool("MONITOR_TAG_HOUR", false),
                max_tags_per_job: env::var("MONITOR_MAX_TAGS_PER_JOB")
                    .ok()
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(DEFAULT_MAX_TAGS_PER_JOB),
            },
            retention_days: env::var("MONITOR_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(DEFAULT_RETENTION_DAYS),
            stuck_timeout_hours: env::var("MONITOR_STUCK_TIMEOUT_HOURS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(DEFAULT_STUCK_TIMEOUT_HOURS),
            retry_default_construct: env_bool("MONITOR_RETRY_DEFAULT_CONSTRUCT", true),
            notify: NotifyConfig {
                email: env::var("MONITOR_NOTIFY_EMAIL")
                    .ok()
                    .filter(|v| !v.is_empty()),
                slack_webhook: env::var("MONITOR_NOTIFY_SLACK_WEBHOOK")
                    .ok()
                    .filter(|v| !v.is_empty()),
            },
            environment: env::var("APP_ENV").unwrap_or_else(|_| "production".to_string()),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            enabled: true,
            payload: PayloadConfig {
                store_payload: true,
                redact_keys: PayloadConfig::default_redact_keys(),
            },
            telemetry: TelemetryConfig {
                enabled: true,
                sample_rate: 1.0,
                capture_cpu: true,
            },
            tagging: TaggingConfig {
                enabled: true,
                auto_queue_name: true,
                auto_environment: false,
                auto_hour: false,
                max_tags_per_job: DEFAULT_MAX_TAGS_PER_JOB,
            },
            retention_days: DEFAULT_RETENTION_DAYS,
            stuck_timeout_hours: DEFAULT_STUCK_TIMEOUT_HOURS,
            retry_default_construct: true,
            notify: NotifyConfig::default(),
            environment: "testing".to_string(),
        }
    }
}

impl PayloadConfig {
    pub fn default_redact_keys() -> Vec<String> {
        [
            "password",
            "token",
            "authorization",
            "secret",
            "api_key",
            "access_token",
        ]
        .iter()
        .map(|k| k.to_string())
        .collect()
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}
