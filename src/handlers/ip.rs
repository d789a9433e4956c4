use axum::{
    extract::ConnectInfo,
    http::HeaderMap,
    Json,
};
use serde::Serialize;
use std::net::SocketAddr;

/// Set by the trusted reverse proxy in front of the service.
const REAL_IP_HEADER: &str = "x-real-ip";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressSource {
    Header,
    Client,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientAddress {
    pub ip: Option<String>,
    pub source: AddressSource,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Best guess at the caller's address.
///
/// Precedence: `X-Real-IP`, then the first `X-Forwarded-For` entry, then the
/// transport peer.
pub fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientAddress {
    let from_header = header_value(headers, REAL_IP_HEADER)
        .or_else(|| header_value(headers, FORWARDED_FOR_HEADER));

    if let Some(ip) = from_header {
        return ClientAddress {
            ip: Some(ip),
            source: AddressSource::Header,
        };
    }

    match peer {
        Some(addr) => ClientAddress {
            ip: Some(addr.ip().to_string()),
            source: AddressSource::Client,
        },
        None => ClientAddress {
            ip: None,
            source: AddressSource::Unknown,
        },
    }
}

/// GET /ip - Report the caller address as the service sees it
pub async fn ip_handler(
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Json<ClientAddress> {
    Json(client_address(&headers, peer.map(|ConnectInfo(addr)| addr)))
}
