use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    #[serde(default)]
    pub maintenance: MaintenanceSettings,
    #[serde(default)]
    pub middleware: MiddlewareSettings,
    pub application: ApplicationSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
}

/// Coordinator tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencySettings {
    /// Lifetime of a record before `cleanup_expired` may delete it.
    pub default_ttl_secs: u64,
    /// How long a claim stays valid before it counts as abandoned.
    pub lock_timeout_secs: u64,
    pub wait_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_dispatch_rounds: u32,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 86400, // 24 hours
            lock_timeout_secs: 30,
            wait_timeout_ms: 5000,
            poll_interval_ms: 100,
            max_dispatch_rounds: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    pub interval_secs: u64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MiddlewareSettings {
    pub header_name: String,
    pub derive_missing_keys: bool,
    pub scope_from_host: bool,
}

impl Default for MiddlewareSettings {
    fn default() -> Self {
        Self {
            header_name: "idempotency-key".to_string(),
            derive_missing_keys: true,
            scope_from_host: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationSettings {
    pub port: u16,
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }
}
