use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};

use crate::bridge::{self, Bridge};

/// Body as handed over by the guest shim.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum HttpBody {
    #[default]
    None,
    Json(serde_json::Value),
    Text(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub body: HttpBody,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct HttpFailure {
    pub message: String,
    pub response: Option<HttpReply>,
}

impl HttpFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            response: None,
        }
    }
}

/// Outbound HTTP for guests: one shared client, a default timeout and no
/// retries.
#[derive(Clone)]
pub struct HttpProxy {
    client: reqwest::Client,
    timeout: Duration,
    user_agent: String,
    bridge: Bridge,
}

impl HttpProxy {
    pub fn new(timeout: Duration, user_agent: impl Into<String>, bridge: Bridge) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
            user_agent: user_agent.into(),
            bridge,
        }
    }

    pub fn request(&self, request: HttpRequest) -> Result<HttpReply, HttpFailure> {
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| HttpFailure::new(format!("invalid method `{}`", request.method)))?;
        let url = merge_params(&request.url, &request.params)?;
        let (content_type, payload) = encode_body(request.body)?;
        let headers = build_headers(&request.headers, content_type, &self.user_agent)?;
        let timeout = effective_timeout(
            self.timeout,
            request.timeout.map(Duration::from_millis),
            bridge::remaining(),
        );

        tracing::debug!("guest http {} {}", method, url);
        let builder = self
            .client
            .request(method, url)
            .headers(headers)
            .timeout(timeout);
        let builder = match payload {
            Some(payload) => builder.body(payload),
            None => builder,
        };

        let result = self
            .bridge
            .run(async move {
                let response = builder.send().await?;
                let status = response.status().as_u16();
                let headers: BTreeMap<String, String> = response
                    .headers()
                    .iter()
                    .filter_map(|(name, value)| {
                        value
                            .to_str()
                            .ok()
                            .map(|value| (name.as_str().to_string(), value.to_string()))
                    })
                    .collect();
                let bytes = response.bytes().await?;
                Ok::<_, reqwest::Error>((status, headers, bytes.to_vec()))
            })
            .map_err(|err| HttpFailure::new(err.to_string()))?;

        let (status, headers, bytes) = result.map_err(|err| HttpFailure::new(err.to_string()))?;
        let data = decode_payload(headers.get("content-type").map(String::as_str), &bytes);
        let reply = HttpReply {
            status,
            headers,
            data,
        };
        if (200..400).contains(&status) {
            Ok(reply)
        } else {
            Err(HttpFailure {
                message: format!("request failed with status code {}", status),
                response: Some(reply),
            })
        }
    }
}

/// A guest may shorten the configured timeout but never extend it, and no
/// wait outlives the invocation's remaining budget.
fn effective_timeout(
    configured: Duration,
    requested: Option<Duration>,
    remaining: Option<Duration>,
) -> Duration {
    let timeout = requested.map_or(configured, |requested| requested.min(configured));
    let timeout = remaining.map_or(timeout, |remaining| remaining.min(timeout));
    timeout.max(Duration::from_millis(1))
}

/// Append `params` to the url's query string. Arrays repeat the key.
pub fn merge_params(
    url: &str,
    params: &BTreeMap<String, serde_json::Value>,
) -> Result<url::Url, HttpFailure> {
    let mut url =
        url::Url::parse(url).map_err(|err| HttpFailure::new(format!("invalid url: {}", err)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(HttpFailure::new(format!(
            "unsupported url scheme `{}`",
            url.scheme()
        )));
    }
    if params.is_empty() {
        return Ok(url);
    }
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            match value {
                serde_json::Value::Null => {}
                serde_json::Value::Array(items) => {
                    for item in items {
                        pairs.append_pair(key, &param_text(item));
                    }
                }
                other => {
                    pairs.append_pair(key, &param_text(other));
                }
            }
        }
    }
    Ok(url)
}

fn param_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Serialise the body and pick the default content type for it.
pub fn encode_body(body: HttpBody) -> Result<(Option<&'static str>, Option<Vec<u8>>), HttpFailure> {
    match body {
        HttpBody::None => Ok((None, None)),
        HttpBody::Text(text) => Ok((Some("text/plain; charset=utf-8"), Some(text.into_bytes()))),
        HttpBody::Bytes(bytes) => Ok((Some("application/octet-stream"), Some(bytes))),
        HttpBody::Json(value) => serde_json::to_vec(&value)
            .map(|bytes| (Some("application/json"), Some(bytes)))
            .map_err(|err| HttpFailure::new(err.to_string())),
    }
}

fn build_headers(
    supplied: &BTreeMap<String, String>,
    content_type: Option<&'static str>,
    user_agent: &str,
) -> Result<HeaderMap, HttpFailure> {
    let mut headers = HeaderMap::new();
    if let Some(content_type) = content_type {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    if let Ok(value) = HeaderValue::from_str(user_agent) {
        headers.insert(USER_AGENT, value);
    }
    for (name, value) in supplied {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| HttpFailure::new(format!("invalid header name `{}`", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| HttpFailure::new(format!("invalid value for header `{}`", name)))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn decode_payload(content_type: Option<&str>, bytes: &[u8]) -> serde_json::Value {
    let text = String::from_utf8_lossy(bytes);
    let looks_json = content_type.is_some_and(|ct| ct.contains("json"));
    if looks_json {
        if let Ok(value) = serde_json::from_slice(bytes) {
            return value;
        }
    }
    serde_json::Value::String(text.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_merge_into_existing_query() {
        let params: BTreeMap<String, serde_json::Value> = [
            ("q".to_string(), json!("hello world")),
            ("n".to_string(), json!(2)),
            ("tag".to_string(), json!(["a", "b"])),
            ("skip".to_string(), serde_json::Value::Null),
        ]
        .into_iter()
        .collect();
        let url = merge_params("https://api.example.com/search?lang=en", &params).expect("url");
        assert_eq!(
            url.as_str(),
            "https://api.example.com/search?lang=en&n=2&q=hello+world&tag=a&tag=b"
        );
    }

    #[test]
    fn guest_timeouts_only_shorten_the_wait() {
        let configured = Duration::from_secs(10);
        assert_eq!(effective_timeout(configured, None, None), configured);
        assert_eq!(
            effective_timeout(configured, Some(Duration::from_secs(3600)), None),
            configured
        );
        assert_eq!(
            effective_timeout(configured, Some(Duration::from_secs(2)), None),
            Duration::from_secs(2)
        );
        assert_eq!(
            effective_timeout(
                configured,
                Some(Duration::from_secs(3600)),
                Some(Duration::from_millis(300))
            ),
            Duration::from_millis(300)
        );
        assert_eq!(
            effective_timeout(configured, None, Some(Duration::ZERO)),
            Duration::from_millis(1)
        );
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(merge_params("file:///etc/passwd", &BTreeMap::new()).is_err());
        assert!(merge_params("not a url", &BTreeMap::new()).is_err());
    }

    #[test]
    fn body_content_type_defaults() {
        let (ct, body) = encode_body(HttpBody::Text("hi".into())).expect("text");
        assert_eq!(ct, Some("text/plain; charset=utf-8"));
        assert_eq!(body.as_deref(), Some(&b"hi"[..]));

        let (ct, _) = encode_body(HttpBody::Bytes(vec![1, 2])).expect("bytes");
        assert_eq!(ct, Some("application/octet-stream"));

        let (ct, body) = encode_body(HttpBody::Json(json!({ "a": 1 }))).expect("json");
        assert_eq!(ct, Some("application/json"));
        assert_eq!(body.as_deref(), Some(&b"{\"a\":1}"[..]));

        assert_eq!(encode_body(HttpBody::None).expect("none"), (None, None));
    }

    #[test]
    fn explicit_content_type_wins() {
        let supplied: BTreeMap<String, String> =
            [("Content-Type".to_string(), "text/csv".to_string())]
                .into_iter()
                .collect();
        let headers = build_headers(&supplied, Some("text/plain; charset=utf-8"), "fn/1")
            .expect("headers");
        assert_eq!(headers[CONTENT_TYPE], "text/csv");
        assert_eq!(headers[USER_AGENT], "fn/1");
    }

    #[test]
    fn body_shape_from_shim() {
        let body: HttpBody =
            serde_json::from_value(json!({ "kind": "bytes", "data": [1, 2, 3] })).expect("body");
        assert_eq!(body, HttpBody::Bytes(vec![1, 2, 3]));
        let body: HttpBody = serde_json::from_value(json!({ "kind": "none" })).expect("body");
        assert_eq!(body, HttpBody::None);
    }

    #[test]
    fn payload_decoding() {
        assert_eq!(
            decode_payload(Some("application/json; charset=utf-8"), b"{\"ok\":true}"),
            json!({ "ok": true })
        );
        assert_eq!(decode_payload(Some("text/html"), b"<p>"), json!("<p>"));
        assert_eq!(decode_payload(Some("application/json"), b"oops"), json!("oops"));
    }
}
