//! Caller address classification and IP-to-city lookup.
//!
//! The resolver is the single place where geolocation failures are absorbed:
//! every call produces a [`GeoResolution`], and a missing city is an ordinary
//! outcome rather than an error.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

pub const PRIVATE_ADDRESS_STATUS: &str = "private address, cannot auto-resolve";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    Private,
    Public,
}

/// Classify a caller-supplied address.
///
/// Loopback and RFC1918 ranges are private. Absent, empty or unparseable input
/// is also treated as private so that no outbound lookup is made for it.
pub fn classify(ip: Option<&str>) -> AddressClass {
    let Some(raw) = ip.map(str::trim).filter(|s| !s.is_empty()) else {
        return AddressClass::Private;
    };

    match raw.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => classify_v4(v4),
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => classify_v4(v4),
            None if v6.is_loopback() => AddressClass::Private,
            None => AddressClass::Public,
        },
        Err(_) => AddressClass::Private,
    }
}

fn classify_v4(ip: Ipv4Addr) -> AddressClass {
    // is_private covers 10/8, 172.16/12 and 192.168/16
    if ip.is_loopback() || ip.is_private() {
        AddressClass::Private
    } else {
        AddressClass::Public
    }
}

/// Result of an IP-to-city resolution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoResolution {
    pub city: Option<String>,
    pub status: String,
}

impl GeoResolution {
    pub fn found(city: impl Into<String>) -> Self {
        Self {
            city: Some(city.into()),
            status: "resolved".to_string(),
        }
    }

    pub fn absent(status: impl Into<String>) -> Self {
        Self {
            city: None,
            status: status.into(),
        }
    }
}

/// Anything able to turn a caller address into a city name.
#[async_trait]
pub trait CityResolver: Send + Sync {
    async fn resolve_city(&self, ip: Option<&str>) -> GeoResolution;
}

/// Body returned by the ip-api style geolocation endpoint.
#[derive(Debug, Deserialize)]
struct GeoLookupResponse {
    status: String,
    city: Option<String>,
    country: Option<String>,
    message: Option<String>,
}

/// Resolves public addresses through an external geolocation HTTP service.
#[derive(Debug, Clone)]
pub struct GeoIpResolver {
    http: Client,
    base_url: String,
}

impl GeoIpResolver {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn lookup(&self, ip: &str) -> GeoResolution {
        let url = format!("{}/{}", self.base_url, ip);

        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(ip, error = %e, "Geolocation request failed");
                return GeoResolution::absent(format!("geolocation lookup failed: {}", e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(ip, %status, "Geolocation returned non-success status");
            return GeoResolution::absent(format!("geolocation returned status {}", status));
        }

        let body: GeoLookupResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(ip, error = %e, "Geolocation parse error");
                return GeoResolution::absent(format!("invalid geolocation response: {}", e));
            }
        };

        match body.city.filter(|c| !c.trim().is_empty()) {
            Some(city) if body.status == "success" => {
                tracing::info!(
                    ip,
                    city = %city,
                    country = body.country.as_deref().unwrap_or(""),
                    "Resolved caller city from IP"
                );
                GeoResolution::found(city)
            }
            _ => GeoResolution::absent(format!(
                "no city for address: {}",
                body.message.unwrap_or(body.status)
            )),
        }
    }
}

#[async_trait]
impl CityResolver for GeoIpResolver {
    async fn resolve_city(&self, ip: Option<&str>) -> GeoResolution {
        let address = match (classify(ip), ip) {
            (AddressClass::Public, Some(address)) => address.trim(),
            _ => {
                metrics::counter!("geoip_lookups_total", "outcome" => "skipped").increment(1);
                return GeoResolution::absent(PRIVATE_ADDRESS_STATUS);
            }
        };

        let resolution = self.lookup(address).await;
        let outcome = if resolution.city.is_some() { "found" } else { "absent" };
        metrics::counter!("geoip_lookups_total", "outcome" => outcome).increment(1);
        resolution
    }
}
