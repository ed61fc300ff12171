//! Pulling invocation inputs out of an HTTP request.

use std::net::SocketAddr;

use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE};
use engine::Credentials;
use host::context::collect_multi;

pub const SESSION_COOKIE: &str = "session";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid request body: {0}")]
pub struct BodyError(pub String);

pub fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

/// Header names are lowercase already; non-UTF-8 values are skipped.
pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

pub fn credentials(headers: &HeaderMap, query: &[(String, String)]) -> Credentials {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        })
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());

    let session = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| name.trim() == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string());

    let query_token = query
        .iter()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.clone());

    Credentials {
        bearer,
        session,
        query_token,
    }
}

/// `x-forwarded-for` first hop, then `x-real-ip`, then the peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    forwarded
        .or(real_ip)
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_default()
}

/// JSON and form bodies become objects, anything else is text. An empty
/// body is `null`.
pub fn parse_body(headers: &HeaderMap, bytes: &[u8]) -> Result<serde_json::Value, BodyError> {
    if bytes.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .unwrap_or_default();

    if content_type == "application/json" || content_type.ends_with("+json") {
        return serde_json::from_slice(bytes).map_err(|err| BodyError(err.to_string()));
    }
    if content_type == "application/x-www-form-urlencoded" {
        let fields = collect_multi(
            url::form_urlencoded::parse(bytes).map(|(k, v)| (k.into_owned(), v.into_owned())),
        );
        return serde_json::to_value(fields).map_err(|err| BodyError(err.to_string()));
    }
    Ok(serde_json::Value::String(
        String::from_utf8_lossy(bytes).into_owned(),
    ))
}
