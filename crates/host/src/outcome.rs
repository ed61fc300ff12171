use deno_core::JsBuffer;
use serde::Deserialize;

use crate::value::GuestValue;

/// What `__fnLoad` and `__fnInvoke` hand back to the runtime.
#[derive(Deserialize)]
pub struct Envelope {
    pub ok: bool,
    #[serde(default)]
    pub has: bool,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub bytes: Option<JsBuffer>,
    #[serde(default)]
    pub json: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<f64>,
}

/// A guest failure: HTTP status plus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestFailure {
    pub status: u16,
    pub message: String,
}

impl Envelope {
    /// The produced value, `None` meaning "no value".
    pub fn into_result(self) -> Result<Option<GuestValue>, GuestFailure> {
        if !self.ok {
            return Err(GuestFailure {
                status: clamp_status(self.status),
                message: self
                    .message
                    .filter(|message| !message.is_empty())
                    .unwrap_or_else(|| "handler failed".to_string()),
            });
        }
        if !self.has {
            return Ok(None);
        }
        let value = match self.kind.as_deref() {
            Some("bytes") => GuestValue::Bytes(self.bytes.map(|b| b.to_vec()).unwrap_or_default()),
            Some("text") => GuestValue::String(self.text.unwrap_or_default()),
            _ => self.json.map(GuestValue::from).unwrap_or(GuestValue::Null),
        };
        Ok(Some(value))
    }
}

fn clamp_status(status: Option<f64>) -> u16 {
    match status {
        Some(code) if code.fract() == 0.0 && (100.0..=599.0).contains(&code) => code as u16,
        _ => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: serde_json::Value) -> Envelope {
        serde_json::from_value(value).expect("envelope")
    }

    #[test]
    fn success_shapes() {
        assert_eq!(envelope(json!({ "ok": true, "has": false })).into_result(), Ok(None));
        assert_eq!(
            envelope(json!({ "ok": true, "has": true, "kind": "text", "text": "hi" }))
                .into_result(),
            Ok(Some(GuestValue::from("hi")))
        );
        assert_eq!(
            envelope(json!({ "ok": true, "has": true, "kind": "json", "json": null }))
                .into_result(),
            Ok(Some(GuestValue::Null))
        );
    }

    #[test]
    fn failures_default_to_500() {
        let failure = envelope(json!({ "ok": false, "message": "nope", "status": 418 }))
            .into_result()
            .expect_err("failure");
        assert_eq!(failure.status, 418);
        let failure = envelope(json!({ "ok": false, "status": 1.5 }))
            .into_result()
            .expect_err("failure");
        assert_eq!(
            failure,
            GuestFailure {
                status: 500,
                message: "handler failed".into()
            }
        );
    }
}
