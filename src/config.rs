use ::config::{Config as CConfig, Environment, File};
use tokio::time::Duration;

// Variable names used by the legacy load scripts. They keep working next to the
// LEADERBOARD_* variables and take precedence over both the file and those.
const REQUESTS_VAR: &str = "TOTALREQUESTS";
const USERS_VAR: &str = "MAXUSERS";
const REDIS_HOST_VAR: &str = "REDISHOST";
const ENV_PREFIX: &str = "LEADERBOARD";

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub backend: Backend,
    pub redis_host: String,
    pub redis_port: u16,
    pub leaderboard_key: String,
    pub requests: usize,
    pub users: usize,
    pub score_bound: u32,
    pub max_latency_ms: u64,
    pub write_mode: WriteMode,
    pub policy: CompletionPolicy,
    // 0 means one task per request with no limit.
    pub max_in_flight: usize,
    pub top_n: usize,
    pub sample_interval_ms: u64,
    // 0 means wait for completion forever.
    pub completion_timeout_ms: u64,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Redis,
    Memory,
}

/// How each write task touches the member's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Add the drawn score to the member's current score (`ZINCRBY`).
    Increment,
    /// Replace the member's score with the drawn one (`ZADD`).
    Set,
}

/// Which write resolutions count towards the completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Successes and failures both resolve a write.
    AllResolutions,
    /// Only successes are reported. A single failed write means the batch
    /// never completes.
    SuccessOnly,
}

impl Config {
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let c = CConfig::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .set_override_option("requests", std::env::var(REQUESTS_VAR).ok())?
            .set_override_option("users", std::env::var(USERS_VAR).ok())?
            .set_override_option("redis_host", std::env::var(REDIS_HOST_VAR).ok())?
            .build()?;
        let config: Self = c.try_deserialize()?;
        let config = config.normalized();
        std::env::set_var("RUST_LOG", &config.log_level);
        Ok(config)
    }

    fn normalized(mut self) -> Self {
        self.users = self.users.max(1);
        self.score_bound = self.score_bound.max(1);
        if self.redis_host.is_empty() {
            self.redis_host = Self::default().redis_host;
        }
        self
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        (self.completion_timeout_ms > 0).then(|| Duration::from_millis(self.completion_timeout_ms))
    }

    pub fn max_in_flight(&self) -> Option<usize> {
        (self.max_in_flight > 0).then_some(self.max_in_flight)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            backend: Backend::Redis,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            leaderboard_key: "leaderboard".to_string(),
            requests: 1000,
            users: 100,
            score_bound: 1000,
            max_latency_ms: 4,
            write_mode: WriteMode::Increment,
            policy: CompletionPolicy::AllResolutions,
            max_in_flight: 0,
            top_n: 5000,
            sample_interval_ms: 1000,
            completion_timeout_ms: 0,
            seed: None,
        }
    }
}
