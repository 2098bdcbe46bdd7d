//! Process configuration loaded from the environment.

use anyhow::Result;

fn env_i64(var: &str, default: i64) -> i64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_u64(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

pub fn env_flag(var: &str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

/// Engine-wide settings. Worker loop tuning lives in `worker::WorkerConfig`.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,

    /// Alert threshold for `high_value` alerts, minor units.
    pub high_value_threshold_cents: i64,
    /// Hold expiration TTL.
    pub hold_ttl_secs: i64,
    /// First retry delay; doubles per attempt, capped at one hour.
    pub retry_base_delay_secs: i64,
    pub max_retries: u32,

    /// Idempotency cache TTL.
    pub idempotency_ttl_secs: u64,
    /// Reject replays whose payload differs instead of returning the original.
    pub idempotency_strict: bool,

    /// Remote ledger engine; in-memory ledger when unset (dev).
    pub ledger_url: Option<String>,
    /// Routing advisor endpoint; advisor is skipped when unset.
    pub routing_advisor_url: Option<String>,

    /// Run the dispatch worker inside the API process.
    pub embedded_worker: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./payrail.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        Ok(Self {
            database_path,
            port,
            high_value_threshold_cents: env_i64("HIGH_VALUE_THRESHOLD_CENTS", 1_000_000),
            hold_ttl_secs: env_i64("HOLD_TTL_SECS", 7 * 24 * 3600),
            retry_base_delay_secs: env_i64("RETRY_BASE_DELAY_SECS", 60),
            max_retries: env_u64("MAX_RETRIES", 3) as u32,
            idempotency_ttl_secs: env_u64("IDEMPOTENCY_TTL_SECS", 24 * 3600),
            idempotency_strict: env_flag("IDEMPOTENCY_STRICT", false),
            ledger_url: std::env::var("LEDGER_URL").ok().filter(|v| !v.is_empty()),
            routing_advisor_url: std::env::var("ROUTING_ADVISOR_URL")
                .ok()
                .filter(|v| !v.is_empty()),
            embedded_worker: env_flag("EMBEDDED_WORKER", true),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "./payrail.db".to_string(),
            port: 8080,
            high_value_threshold_cents: 1_000_000,
            hold_ttl_secs: 7 * 24 * 3600,
            retry_base_delay_secs: 60,
            max_retries: 3,
            idempotency_ttl_secs: 24 * 3600,
            idempotency_strict: false,
            ledger_url: None,
            routing_advisor_url: None,
            embedded_worker: true,
        }
    }
}
