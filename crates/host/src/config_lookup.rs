//! `getService('config').get(key)` resolution.
//!
//! The configuration document is stored with snake_case keys; guests may use
//! either that or a camelCase alias, and get back objects carrying both.

use serde_json::{Map, Value};

pub fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (index, ch) in key.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if index > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

pub fn camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for ch in key.chars() {
        if ch == '_' && !out.is_empty() {
            upper = true;
        } else if upper {
            out.push(ch.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Look up a top-level key, trying it verbatim and then as snake_case.
pub fn lookup(document: &Value, key: &str) -> Option<Value> {
    let object = document.as_object()?;
    object
        .get(key)
        .or_else(|| object.get(&snake_case(key)))
        .map(with_aliases)
}

/// Copy `value` adding the other-case spelling of every object key.
pub fn with_aliases(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len() * 2);
            for (key, value) in map {
                let value = with_aliases(value);
                for alias in [camel_case(key), snake_case(key)] {
                    if alias != *key && !map.contains_key(&alias) {
                        out.insert(alias, value.clone());
                    }
                }
                out.insert(key.clone(), value);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(with_aliases).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn case_conversion() {
        assert_eq!(snake_case("mailOptions"), "mail_options");
        assert_eq!(snake_case("seo"), "seo");
        assert_eq!(camel_case("mail_options"), "mailOptions");
        assert_eq!(camel_case("_private"), "_private");
    }

    #[test]
    fn accepts_camel_alias_and_annotates_nested_keys() {
        let doc = json!({
            "mail_options": { "smtp_host": "mx", "enable": true },
            "seo": { "title": "Blog" }
        });
        let mail = lookup(&doc, "mailOptions").expect("alias lookup");
        assert_eq!(mail["smtp_host"], json!("mx"));
        assert_eq!(mail["smtpHost"], json!("mx"));
        assert_eq!(lookup(&doc, "seo").expect("direct")["title"], json!("Blog"));
        assert!(lookup(&doc, "missing").is_none());
        assert!(lookup(&json!([1]), "seo").is_none());
    }
}
