use crate::cache::LocationCache;
use crate::weather::WeatherError;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

const AUTH_HEADER: &str = "X-QW-Api-Key";

/// Longest upstream body excerpt carried in an error message.
const MAX_ERROR_BODY_CHARS: usize = 200;

/// HTTP client for the QWeather geocoding and forecast APIs.
///
/// Geocoding results are remembered in the [`LocationCache`] so repeat
/// lookups for the same city skip the geo endpoint.
#[derive(Debug, Clone)]
pub struct QWeatherClient {
    http: Client,
    base_url: String,
    api_key: String,
    cache: LocationCache,
}

impl QWeatherClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        timeout: Duration,
        cache: LocationCache,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            cache,
        })
    }

    /// Resolve a city name to the provider's location id.
    pub async fn location_id(&self, city: &str) -> Result<String, WeatherError> {
        if let Some(id) = self.cache.get(city).await {
            tracing::debug!(city, location_id = %id, "Location id served from cache");
            return Ok(id);
        }

        let body = self
            .get_json("geo", "/geo/v2/city/lookup", &[("location", city), ("lang", "zh")])
            .await?;

        let id = match (body.get("code").and_then(Value::as_str), first_location_id(&body)) {
            (Some("200"), Some(id)) => id.to_string(),
            _ => {
                return Err(WeatherError::CityNotFound {
                    city: city.to_string(),
                    detail: truncate(&body.to_string()),
                })
            }
        };

        // Best effort; a skipped write only costs a repeat geocode later
        let write = self.cache.put(city, &id).await;
        tracing::debug!(city, location_id = %id, cached = write.is_written(), "Geocoded city");

        Ok(id)
    }

    /// Current conditions for a location id.
    pub async fn current(&self, location_id: &str) -> Result<Value, WeatherError> {
        self.get_json("weather", "/v7/weather/now", &[("location", location_id)])
            .await
    }

    /// Daily forecast for a location id; `days` is 3 or 7.
    pub async fn forecast(&self, location_id: &str, days: u8) -> Result<Value, WeatherError> {
        let path = format!("/v7/weather/{}d", days);
        self.get_json("forecast", &path, &[("location", location_id)])
            .await
    }

    async fn get_json(
        &self,
        api: &'static str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, WeatherError> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .http
            .get(&url)
            .query(query)
            .header(AUTH_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|source| WeatherError::Request { api, source })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|source| WeatherError::Request { api, source })?;

        if !status.is_success() {
            return Err(WeatherError::Status {
                api,
                status: status.as_u16(),
                body: truncate(&text),
            });
        }

        if text.trim().is_empty() {
            return Err(WeatherError::EmptyBody { api });
        }

        serde_json::from_str(&text).map_err(|_| WeatherError::InvalidJson {
            api,
            body: truncate(&text),
        })
    }
}

fn first_location_id(body: &Value) -> Option<&str> {
    body.get("location")?
        .as_array()?
        .first()?
        .get("id")?
        .as_str()
}

fn truncate(body: &str) -> String {
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        body.to_string()
    } else {
        let cut: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, cache: LocationCache) -> QWeatherClient {
        QWeatherClient::new(&server.uri(), "test_key", Duration::from_secs(5), cache).unwrap()
    }

    #[tokio::test]
    async fn test_geocode_miss_queries_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/geo/v2/city/lookup"))
            .and(query_param("location", "北京"))
            .and(header("X-QW-Api-Key", "test_key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": "200",
                "location": [{"name": "北京", "id": "101010100"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cache = LocationCache::in_memory();
        let client = client(&server, cache.clone());

        assert_eq!(client.location_id("北京").await.unwrap(), "101010100");
        // Second call is served from the cache; the mock expects one request only
        assert_eq!(client.location_id("北京").await.unwrap(), "101010100");
        assert_eq!(cache.get_blocking("北京").as_deref(), Some("101010100"));
    }

    #[tokio::test]
    async fn test_geocode_hit_skips_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let cache = LocationCache::in_memory();
        cache.put_blocking("上海", "101020100");

        let id = client(&server, cache).location_id("上海").await.unwrap();
        assert_eq!(id, "101020100");
    }

    #[tokio::test]
    async fn test_geocode_without_match_is_city_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/geo/v2/city/lookup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": "404"})))
            .mount(&server)
            .await;

        let cache = LocationCache::in_memory();
        let err = client(&server, cache.clone())
            .location_id("Atlantis")
            .await
            .unwrap_err();

        assert!(matches!(err, WeatherError::CityNotFound { ref city, .. } if city == "Atlantis"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_empty_body_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v7/weather/now"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let err = client(&server, LocationCache::disabled())
            .current("101010100")
            .await
            .unwrap_err();
        assert!(matches!(err, WeatherError::EmptyBody { api: "weather" }));
    }

    #[tokio::test]
    async fn test_invalid_json_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v7/weather/3d"))
            .respond_with(ResponseTemplate::new(200).set_body_string("oops"))
            .mount(&server)
            .await;

        let err = client(&server, LocationCache::disabled())
            .forecast("101010100", 3)
            .await
            .unwrap_err();
        assert!(matches!(err, WeatherError::InvalidJson { api: "forecast", .. }));
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .mount(&server)
            .await;

        let err = client(&server, LocationCache::disabled())
            .current("101010100")
            .await
            .unwrap_err();
        assert!(matches!(err, WeatherError::Status { status: 401, .. }));
        assert!(err.to_string().contains("invalid key"));
    }

    #[test]
    fn test_truncate_long_body() {
        let long = "x".repeat(500);
        let cut = truncate(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), MAX_ERROR_BODY_CHARS + 3);
        assert_eq!(truncate("short"), "short");
    }
}
