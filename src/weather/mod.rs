//! Weather lookup tool exposed to the model.
//!
//! A lookup geocodes the city (through the location cache), then fetches the
//! current conditions and the daily forecast, returning all of it as one JSON
//! payload for the model to summarise.

pub mod client;

pub use client::QWeatherClient;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WeatherError {
    #[error("{api} request failed: {source}")]
    Request {
        api: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{api} API returned status {status}: {body}")]
    Status {
        api: &'static str,
        status: u16,
        body: String,
    },

    #[error("{api} API returned an empty response, check the API key and base URL")]
    EmptyBody { api: &'static str },

    #[error("{api} API returned invalid JSON: {body}")]
    InvalidJson { api: &'static str, body: String },

    #[error("no location id found for city {city}: {detail}")]
    CityNotFound { city: String, detail: String },
}

/// A tool that turns a city name into a structured weather payload.
#[async_trait]
pub trait WeatherLookup: Send + Sync {
    async fn lookup(&self, city: &str) -> Result<Value, WeatherError>;
}

/// The `qweather_tool` function offered to the model.
#[derive(Debug, Clone)]
pub struct WeatherTool {
    client: QWeatherClient,
    forecast_days: u8,
}

impl WeatherTool {
    pub const NAME: &'static str = "qweather_tool";

    pub fn new(client: QWeatherClient, forecast_days: u8) -> Self {
        Self {
            client,
            forecast_days,
        }
    }

    /// Function declaration in the chat-completions `tools` format.
    pub fn definition() -> Value {
        json!({
            "type": "function",
            "function": {
                "name": Self::NAME,
                "description": "获取指定城市的天气信息，返回当前天气和未来几天的天气预报。",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "city": {
                            "type": "string",
                            "description": "城市名称，如 \"北京\"、\"上海\"、\"广州\""
                        }
                    },
                    "required": ["city"]
                }
            }
        })
    }
}

#[async_trait]
impl WeatherLookup for WeatherTool {
    async fn lookup(&self, city: &str) -> Result<Value, WeatherError> {
        let location_id = self.client.location_id(city).await?;
        let current = self.client.current(&location_id).await?;
        let forecast = self.client.forecast(&location_id, self.forecast_days).await?;

        tracing::info!(city, location_id = %location_id, "Weather lookup completed");

        Ok(json!({
            "city": city,
            "location_id": location_id,
            "current": current,
            "forecast": forecast,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocationCache;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_definition_names_the_tool() {
        let def = WeatherTool::definition();
        assert_eq!(def["function"]["name"], WeatherTool::NAME);
        assert_eq!(def["function"]["parameters"]["required"][0], "city");
    }

    #[tokio::test]
    async fn test_lookup_combines_current_and_forecast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/geo/v2/city/lookup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": "200",
                "location": [{"id": "101280101"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v7/weather/now"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": "200",
                "now": {"temp": "28", "text": "晴"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v7/weather/7d"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": "200",
                "daily": [{"fxDate": "2026-10-17", "tempMax": "30"}]
            })))
            .mount(&server)
            .await;

        let client = QWeatherClient::new(
            &server.uri(),
            "key",
            Duration::from_secs(5),
            LocationCache::in_memory(),
        )
        .unwrap();
        let tool = WeatherTool::new(client, 7);

        let payload = tool.lookup("广州").await.unwrap();
        assert_eq!(payload["city"], "广州");
        assert_eq!(payload["location_id"], "101280101");
        assert_eq!(payload["current"]["now"]["temp"], "28");
        assert_eq!(payload["forecast"]["daily"][0]["tempMax"], "30");
    }
}
