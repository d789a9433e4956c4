use crate::agent::{AgentSettings, OpenAiAgent};
use crate::cache::LocationCache;
use crate::config::Config;
use crate::detector::{CityDetector, Lexicon};
use crate::geoip::GeoIpResolver;
use crate::orchestrator::QueryOrchestrator;
use crate::weather::{QWeatherClient, WeatherTool};
use std::sync::Arc;
use std::time::Duration;

/// Application state shared across all request handlers.
///
/// The agent, weather client and cache are built once at startup and reused
/// by every request.
pub struct AppState {
    pub orchestrator: Arc<QueryOrchestrator>,
    pub cache: LocationCache,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the production collaborators from configuration.
    ///
    /// An unusable cache file is not fatal: the cache is disabled and every
    /// weather lookup goes to the provider.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.log_missing_credentials();

        let cache = LocationCache::open(&config.location_cache_path);
        if !cache.is_enabled() {
            tracing::warn!(
                path = %config.location_cache_path.display(),
                "Location cache disabled"
            );
        }

        let lexicon = match &config.lexicon_path {
            Some(path) => Lexicon::load(path)?,
            None => Lexicon::default(),
        };

        let weather_client = QWeatherClient::new(
            &config.qweather_base_url,
            &config.qweather_api_key,
            Duration::from_secs(config.weather_timeout_secs),
            cache.clone(),
        )?;
        let weather = WeatherTool::new(weather_client, config.forecast_days);

        let agent = OpenAiAgent::new(AgentSettings::from_config(&config), Arc::new(weather))?;
        tracing::info!(model = %config.llm_model, "Agent initialized");

        let resolver = GeoIpResolver::new(
            &config.geoip_base_url,
            Duration::from_secs(config.geoip_timeout_secs),
        )?;

        let orchestrator = QueryOrchestrator::new(Arc::new(agent), CityDetector::new(lexicon))
            .with_resolver(Arc::new(resolver));

        Ok(Self::from_parts(orchestrator, cache, config))
    }

    /// Assemble state from already-built parts.
    pub fn from_parts(orchestrator: QueryOrchestrator, cache: LocationCache, config: Config) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            cache,
            config: Arc::new(config),
        }
    }
}
