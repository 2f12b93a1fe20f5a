use std::env;

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub global_concurrency: usize,
    pub claim_batch_size: i64,
    pub poll_interval_secs: u64,
    pub drain_timeout_secs: u64,
    pub stale_threshold_secs: i64,
    pub max_attempts: i32,
    pub voice_api_url: String,
    pub voice_api_key: Option<String>,
    pub browser_bridge_url: String,
    pub network_daily_cap: i64,
    pub network_min_interval_secs: u64,
    pub network_max_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .expect("DATABASE_URL must be set"),
            global_concurrency: env_or("GLOBAL_CONCURRENCY", 8),
            claim_batch_size: env_or("CLAIM_BATCH_SIZE", 32),
            poll_interval_secs: env_or("POLL_INTERVAL_SECS", 10),
            drain_timeout_secs: env_or("DRAIN_TIMEOUT_SECS", 60),
            stale_threshold_secs: env_or("STALE_THRESHOLD_SECS", 600),
            max_attempts: env_or("MAX_ATTEMPTS", 5),
            voice_api_url: env::var("VOICE_API_URL")
                .unwrap_or_else(|_| "https://api.voicereach.io/v1/calls".to_string()),
            voice_api_key: env::var("VOICE_API_KEY").ok(),
            browser_bridge_url: env::var("BROWSER_BRIDGE_URL")
                .unwrap_or_else(|_| "http://localhost:4444".to_string()),
            network_daily_cap: env_or("NETWORK_DAILY_CAP", 40),
            network_min_interval_secs: env_or("NETWORK_MIN_INTERVAL_SECS", 120),
            network_max_interval_secs: env_or("NETWORK_MAX_INTERVAL_SECS", 300),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
