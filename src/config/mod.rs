use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Bind address for the health/metrics/admin server.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SQLite connection string for the state store.
    pub database_url: String,

    /// Redis connection string for the queue store. When unset, the
    /// in-memory broker is used (single-node runs).
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Job registry base URL.
    pub registry_base_url: String,

    /// Job registry API key (sent as X-API-Key).
    pub registry_api_key: String,

    /// Vision model runtime address.
    #[serde(default = "default_model_base_url")]
    pub model_base_url: String,

    /// Root of the profile configuration tree.
    #[serde(default = "default_config_dir")]
    pub config_dir: String,

    /// Number of analysis workers.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Cap on concurrent vision-model calls, matched to the runtime's
    /// parallelism.
    #[serde(default = "default_model_parallelism")]
    pub model_parallelism: usize,

    /// Seconds between registry polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Per-queue depth limit.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Optional webhook URL for best-effort notifications.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_model_base_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_config_dir() -> String {
    "config".to_string()
}

fn default_worker_count() -> usize {
    8
}

fn default_model_parallelism() -> usize {
    8
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    1000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
