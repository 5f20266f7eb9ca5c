use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::measure::{NO_STORE, X_ACCEL_BUFFERING};
use crate::ServiceState;

const LOOKUP_URL: &str = "http://ip-api.com/json";
const LOOKUP_FIELDS: &str = "status,isp,city,countryCode";

const UNKNOWN: &str = "Unknown";
const DEFAULT_COUNTRY: &str = "AR";

const X_FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpResponse {
    pub ip: String,
    pub processed_string: String,
    pub isp: String,
    pub city: String,
    pub country: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
}

/// First `X-Forwarded-For` hop when it is an IP address, else the peer
/// address. IPv4-mapped IPv6 addresses are reported as plain IPv4.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());

    match forwarded.unwrap_or_else(|| peer.ip()) {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        v4 => v4.to_string(),
    }
}

pub async fn handler(
    State(state): State<ServiceState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, peer);

    let mut body = IpResponse {
        ip: ip.clone(),
        processed_string: ip.clone(),
        isp: UNKNOWN.to_string(),
        city: UNKNOWN.to_string(),
        country: DEFAULT_COUNTRY.to_string(),
    };

    match lookup(state.http(), &ip).await {
        Ok(found) if found.status == "success" => {
            if let Some(isp) = found.isp.filter(|v| !v.is_empty()) {
                body.isp = isp;
            }
            if let Some(city) = found.city.filter(|v| !v.is_empty()) {
                body.city = city;
            }
            if let Some(country) = found.country_code.filter(|v| !v.is_empty()) {
                body.country = country;
            }
        }
        Ok(found) => tracing::debug!(ip = %ip, status = %found.status, "ip lookup had no result"),
        Err(e) => tracing::debug!(ip = %ip, "ip lookup failed: {}", e),
    }

    (
        [(header::CACHE_CONTROL, NO_STORE), (X_ACCEL_BUFFERING, "no")],
        Json(body),
    )
        .into_response()
}

async fn lookup(client: &reqwest::Client, ip: &str) -> Result<LookupResponse, reqwest::Error> {
    client
        .get(format!("{}/{}", LOOKUP_URL, ip))
        .query(&[("fields", LOOKUP_FIELDS)])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn test_forwarded_for_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, peer("10.0.0.1:5000")), "203.0.113.7");
    }

    #[test]
    fn test_forwarded_for_must_be_an_address() {
        let peer = peer("198.51.100.2:443");
        for bogus in ["../../admin?x=", "example.com", "203.0.113.7/evil", "unknown"] {
            let mut headers = HeaderMap::new();
            headers.insert(X_FORWARDED_FOR, bogus.parse().unwrap());
            assert_eq!(client_ip(&headers, peer), "198.51.100.2");
        }

        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, "::ffff:203.0.113.9".parse().unwrap());
        assert_eq!(client_ip(&headers, peer), "203.0.113.9");
    }

    #[test]
    fn test_peer_address_fallback() {
        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, peer("198.51.100.2:443")), "198.51.100.2");
        assert_eq!(client_ip(&headers, peer("[::ffff:192.0.2.1]:80")), "192.0.2.1");
        assert_eq!(client_ip(&headers, peer("[2001:db8::1]:80")), "2001:db8::1");
    }

    #[test]
    fn test_response_shape() {
        let body = IpResponse {
            ip: "192.0.2.1".into(),
            processed_string: "192.0.2.1".into(),
            isp: UNKNOWN.into(),
            city: UNKNOWN.into(),
            country: DEFAULT_COUNTRY.into(),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({
                "ip": "192.0.2.1",
                "processedString": "192.0.2.1",
                "isp": "Unknown",
                "city": "Unknown",
                "country": "AR"
            })
        );
    }
}
