use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored guest script. Read-only to the runtime; `updated_at` is the
/// only signal used to invalidate compiled code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snippet {
    pub id: String,
    pub reference: String,
    pub name: String,
    pub source: String,
    /// Declared HTTP method; `None`, empty or `ALL` accept any method.
    pub method: Option<String>,
    pub enabled: bool,
    pub private: bool,
    pub built_in: bool,
    /// Opaque secret blob, JSON or `a=1&b=2`.
    pub secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Snippet {
    /// `reference/name`, used to scope storage keys and log lines.
    pub fn namespace(&self) -> String {
        format!("{}/{}", self.reference, self.name)
    }

    pub fn accepts_method(&self, method: &str) -> bool {
        match self.method.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(declared) => {
                declared.eq_ignore_ascii_case("ALL") || declared.eq_ignore_ascii_case(method)
            }
        }
    }

    pub fn projection(&self) -> SnippetProjection {
        SnippetProjection {
            id: self.id.clone(),
            reference: self.reference.clone(),
            name: self.name.clone(),
            method: self.method.clone(),
            enabled: self.enabled,
            private: self.private,
            built_in: self.built_in,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// What the guest sees of its own snippet as `context.model`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnippetProjection {
    pub id: String,
    pub reference: String,
    pub name: String,
    pub method: Option<String>,
    pub enabled: bool,
    pub private: bool,
    pub built_in: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Query string or header entry. Repeated keys keep their order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MultiValue {
    One(String),
    Many(Vec<String>),
}

impl MultiValue {
    pub fn first(&self) -> Option<&str> {
        match self {
            MultiValue::One(value) => Some(value),
            MultiValue::Many(values) => values.first().map(String::as_str),
        }
    }
}

/// Fold `(key, value)` pairs into scalars or ordered lists.
pub fn collect_multi<I, K, V>(pairs: I) -> BTreeMap<String, MultiValue>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in pairs {
        grouped.entry(key.into()).or_default().push(value.into());
    }
    grouped
        .into_iter()
        .map(|(key, mut values)| {
            let value = if values.len() == 1 {
                MultiValue::One(values.remove(0))
            } else {
                MultiValue::Many(values)
            };
            (key, value)
        })
        .collect()
}

/// Per-invocation snapshot of the inbound request. Built once before the
/// guest runs and never mutated.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    pub method: String,
    pub path: String,
    pub url: String,
    pub query: BTreeMap<String, MultiValue>,
    pub headers: BTreeMap<String, MultiValue>,
    pub params: BTreeMap<String, String>,
    pub body: serde_json::Value,
    pub ip: String,
    pub is_authenticated: bool,
    pub secret: serde_json::Map<String, serde_json::Value>,
    pub model: SnippetProjection,
}

/// Decode a snippet's secret blob. JSON objects are taken as-is, anything
/// else is treated as `application/x-www-form-urlencoded`.
pub fn decode_secret(blob: Option<&str>) -> serde_json::Map<String, serde_json::Value> {
    let Some(blob) = blob.map(str::trim).filter(|blob| !blob.is_empty()) else {
        return serde_json::Map::new();
    };
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(blob) {
        return map;
    }
    url::form_urlencoded::parse(blob.as_bytes())
        .map(|(k, v)| (k.into_owned(), serde_json::Value::String(v.into_owned())))
        .collect()
}

/// Mutable response state the guest builds through `res`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status: Option<u16>,
    pub content_type: Option<String>,
    /// `res.send` / `res.json` was called; its payload wins over the return
    /// value.
    pub sent: bool,
}

impl ResponseMeta {
    pub fn status(&self) -> u16 {
        self.status.unwrap_or(200)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn repeated_keys_become_lists() {
        let query = collect_multi([("a", "1"), ("b", "2"), ("a", "3")]);
        assert_eq!(query["a"], MultiValue::Many(vec!["1".into(), "3".into()]));
        assert_eq!(query["b"], MultiValue::One("2".into()));
        assert_eq!(
            serde_json::to_value(&query).expect("serialize"),
            json!({ "a": ["1", "3"], "b": "2" })
        );
    }

    #[test]
    fn secret_accepts_json_and_form_encoding() {
        let json_secret = decode_secret(Some(r#"{"key":"abc","n":1}"#));
        assert_eq!(json_secret["key"], json!("abc"));
        assert_eq!(json_secret["n"], json!(1));

        let form_secret = decode_secret(Some("key=abc&other=a%20b"));
        assert_eq!(form_secret["key"], json!("abc"));
        assert_eq!(form_secret["other"], json!("a b"));

        assert!(decode_secret(None).is_empty());
        assert!(decode_secret(Some("  ")).is_empty());
    }

    #[test]
    fn method_matching() {
        let mut snippet = Snippet {
            id: "1".into(),
            reference: "blog".into(),
            name: "hello".into(),
            source: String::new(),
            method: None,
            enabled: true,
            private: false,
            built_in: false,
            secret: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(snippet.accepts_method("POST"));
        snippet.method = Some("ALL".into());
        assert!(snippet.accepts_method("DELETE"));
        snippet.method = Some("get".into());
        assert!(snippet.accepts_method("GET"));
        assert!(!snippet.accepts_method("POST"));
        assert_eq!(snippet.namespace(), "blog/hello");
    }
}
