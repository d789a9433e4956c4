use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
    /// API key for the OpenAI-compatible chat completions endpoint.
    pub llm_api_key: String,
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_temperature: f32,
    /// Timeout for a single model round trip (and per-chunk idle timeout when streaming).
    pub llm_timeout_secs: u64,
    /// Maximum model rounds per prompt, including tool rounds.
    pub agent_max_steps: usize,
    pub qweather_api_key: String,
    pub qweather_base_url: String,
    pub weather_timeout_secs: u64,
    /// Forecast window requested from the weather provider (3 or 7 days).
    pub forecast_days: u8,
    /// Base URL of the IP geolocation service; the address is appended as a path segment.
    pub geoip_base_url: String,
    pub geoip_timeout_secs: u64,
    /// SQLite file backing the city name to location id cache.
    pub location_cache_path: PathBuf,
    /// Optional JSON file replacing the built-in detection lexicons.
    pub lexicon_path: Option<PathBuf>,
}

impl Default for Config {
    /// Built-in defaults with no credentials, matching an empty environment.
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            shutdown_timeout_secs: 5,
            llm_api_key: String::new(),
            llm_base_url: "https://openrouter.ai/api/v1".to_string(),
            llm_model: "openai/gpt-4o-mini".to_string(),
            llm_temperature: 0.7,
            llm_timeout_secs: 30,
            agent_max_steps: 5,
            qweather_api_key: String::new(),
            qweather_base_url: "https://devapi.qweather.com".to_string(),
            weather_timeout_secs: 30,
            forecast_days: 3,
            geoip_base_url: "http://ip-api.com/json".to_string(),
            geoip_timeout_secs: 5,
            location_cache_path: PathBuf::from("data/location_cache.db"),
            lexicon_path: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let forecast_days: u8 = env::var("FORECAST_DAYS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()?;
        if forecast_days != 3 && forecast_days != 7 {
            anyhow::bail!("FORECAST_DAYS must be 3 or 7, got {}", forecast_days);
        }

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()?,
            shutdown_timeout_secs: env::var("SHUTDOWN_TIMEOUT")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,
            llm_api_key: env::var("LLM_API_KEY").unwrap_or_default(),
            llm_base_url: env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string()),
            llm_model: env::var("LLM_MODEL")
                .unwrap_or_else(|_| "openai/gpt-4o-mini".to_string()),
            llm_temperature: env::var("LLM_TEMPERATURE")
                .unwrap_or_else(|_| "0.7".to_string())
                .parse()?,
            llm_timeout_secs: env::var("LLM_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            agent_max_steps: env::var("AGENT_MAX_STEPS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,
            qweather_api_key: env::var("QWEATHER_API_KEY").unwrap_or_default(),
            qweather_base_url: env::var("QWEATHER_BASE_URL")
                .unwrap_or_else(|_| "https://devapi.qweather.com".to_string()),
            weather_timeout_secs: env::var("WEATHER_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            forecast_days,
            geoip_base_url: env::var("GEOIP_BASE_URL")
                .unwrap_or_else(|_| "http://ip-api.com/json".to_string()),
            geoip_timeout_secs: env::var("GEOIP_TIMEOUT_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,
            location_cache_path: PathBuf::from(
                env::var("LOCATION_CACHE_PATH")
                    .unwrap_or_else(|_| "data/location_cache.db".to_string()),
            ),
            lexicon_path: env::var("LEXICON_PATH").ok().map(PathBuf::from),
        })
    }

    /// Warn about settings that leave an upstream provider unusable.
    pub fn log_missing_credentials(&self) {
        if self.llm_api_key.is_empty() {
            tracing::warn!("LLM_API_KEY is not set; model requests will be rejected upstream");
        }
        if self.qweather_api_key.is_empty() {
            tracing::warn!("QWEATHER_API_KEY is not set; weather lookups will fail");
        }
    }
}
