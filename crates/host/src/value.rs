use serde::{Serialize, Serializer};

/// A value crossing the guest/host boundary.
///
/// Guest values are duck-typed; the host only ever sees this closed set.
/// `undefined` has no representation here and is modelled as `Option::None`
/// by callers ("no value").
#[derive(Debug, Clone, PartialEq)]
pub enum GuestValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<GuestValue>),
    Map(Vec<(String, GuestValue)>),
}

impl GuestValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            GuestValue::String(value) => Some(value),
            _ => None,
        }
    }

    /// Look up a key on a `Map` value.
    pub fn get(&self, key: &str) -> Option<&GuestValue> {
        match self {
            GuestValue::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// JSON rendering. Bytes become an array of numbers, the same shape
    /// `JSON.stringify` gives a `Uint8Array` copied into a plain array.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            GuestValue::Null => serde_json::Value::Null,
            GuestValue::Bool(value) => serde_json::Value::Bool(*value),
            GuestValue::Number(value) => number_to_json(*value),
            GuestValue::String(value) => serde_json::Value::String(value.clone()),
            GuestValue::Bytes(bytes) => {
                serde_json::Value::Array(bytes.iter().map(|b| (*b).into()).collect())
            }
            GuestValue::List(items) => {
                serde_json::Value::Array(items.iter().map(GuestValue::to_json).collect())
            }
            GuestValue::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn number_to_json(value: f64) -> serde_json::Value {
    if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        serde_json::Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

impl From<serde_json::Value> for GuestValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => GuestValue::Null,
            serde_json::Value::Bool(value) => GuestValue::Bool(value),
            serde_json::Value::Number(value) => GuestValue::Number(value.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(value) => GuestValue::String(value),
            serde_json::Value::Array(items) => {
                GuestValue::List(items.into_iter().map(GuestValue::from).collect())
            }
            serde_json::Value::Object(map) => GuestValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, GuestValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for GuestValue {
    fn from(value: &str) -> Self {
        GuestValue::String(value.to_string())
    }
}

impl Serialize for GuestValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
