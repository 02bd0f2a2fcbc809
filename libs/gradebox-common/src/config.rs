// Connection settings shared by the API, worker and CLI

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_RESULT_TTL_SECS: u64 = 86400;

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    /// Lifetime of task records in Redis
    pub result_ttl_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
        let result_ttl_secs = std::env::var("GRADEBOX_RESULT_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RESULT_TTL_SECS);

        Self {
            redis_url,
            result_ttl_secs,
        }
    }

    pub async fn connect(&self) -> redis::RedisResult<redis::aio::ConnectionManager> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        redis::aio::ConnectionManager::new(client).await
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            result_ttl_secs: DEFAULT_RESULT_TTL_SECS,
        }
    }
}
