//! Synchronous ops behind the guest API.
//!
//! Every fallible op answers with a [`HostReply`]; the bootstrap shim turns it
//! into an already-settled promise so guest code can `await` it.

use std::net::{Ipv4Addr, Ipv6Addr};

use deno_core::{JsBuffer, OpState, ToJsBuffer, op2};
use serde::Serialize;

use crate::assets::AssetData;
use crate::capabilities::{AssetOptions, Capabilities, DbWrite, HostFault, HostResult};
use crate::http_proxy::HttpRequest;
use crate::value::GuestValue;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostReply {
    ok: bool,
    has_value: bool,
    value: serde_json::Value,
    bytes: Option<ToJsBuffer>,
    error: Option<HostFault>,
}

impl HostReply {
    fn empty() -> Self {
        Self {
            ok: true,
            has_value: false,
            value: serde_json::Value::Null,
            bytes: None,
            error: None,
        }
    }

    fn value(value: Option<GuestValue>) -> Self {
        match value {
            None => Self::empty(),
            Some(GuestValue::Bytes(bytes)) => Self {
                has_value: true,
                bytes: Some(bytes.into()),
                ..Self::empty()
            },
            Some(value) => Self {
                has_value: true,
                value: value.to_json(),
                ..Self::empty()
            },
        }
    }

    fn fault(fault: HostFault) -> Self {
        Self {
            ok: false,
            error: Some(fault),
            ..Self::empty()
        }
    }
}

impl From<HostResult<()>> for HostReply {
    fn from(result: HostResult<()>) -> Self {
        match result {
            Ok(()) => HostReply::empty(),
            Err(fault) => HostReply::fault(fault),
        }
    }
}

impl From<HostResult<Option<GuestValue>>> for HostReply {
    fn from(result: HostResult<Option<GuestValue>>) -> Self {
        match result {
            Ok(value) => HostReply::value(value),
            Err(fault) => HostReply::fault(fault),
        }
    }
}

fn with_caps<T>(state: &mut OpState, call: impl FnOnce(&mut Capabilities) -> T) -> Option<T> {
    state.try_borrow_mut::<Capabilities>().map(call)
}

fn unavailable() -> HostFault {
    HostFault::new(500, "host capabilities are not available")
}

fn reply<F>(state: &mut OpState, call: F) -> HostReply
where
    F: FnOnce(&mut Capabilities) -> HostReply,
{
    with_caps(state, call).unwrap_or_else(|| HostReply::fault(unavailable()))
}

#[op2]
fn op_fn_log(state: &mut OpState, #[string] level: String, #[string] message: String) {
    with_caps(state, |caps| caps.log(&level, &message));
}

#[op2]
fn op_fn_res_status(state: &mut OpState, status: u32) {
    let status = u16::try_from(status).ok().filter(|s| (100..=599).contains(s));
    with_caps(state, |caps| {
        if status.is_some() {
            caps.meta.status = status;
        }
    });
}

#[op2]
fn op_fn_res_type(state: &mut OpState, #[string] content_type: String) {
    with_caps(state, |caps| caps.meta.content_type = Some(content_type));
}

#[op2]
fn op_fn_res_sent(state: &mut OpState, json: bool) {
    with_caps(state, |caps| {
        caps.meta.sent = true;
        if json {
            caps.meta.content_type = Some("application/json; charset=utf-8".to_string());
        }
    });
}

#[op2]
fn op_fn_throws(state: &mut OpState, status: u32, #[string] message: String) {
    let status = u16::try_from(status).unwrap_or(500);
    with_caps(state, |caps| caps.throws(status, message));
}

#[op2]
fn op_fn_is_ip(#[string] value: String, version: u32) -> bool {
    match version {
        4 => value.parse::<Ipv4Addr>().is_ok(),
        6 => value.parse::<Ipv6Addr>().is_ok(),
        _ => false,
    }
}

#[op2]
#[serde]
fn op_fn_cache_get(state: &mut OpState, #[string] key: String) -> HostReply {
    reply(state, |caps| caps.cache_get(&key).into())
}

#[op2]
#[serde]
fn op_fn_cache_set(
    state: &mut OpState,
    #[string] key: String,
    #[serde] value: serde_json::Value,
    ttl: f64,
) -> HostReply {
    reply(state, |caps| caps.cache_set(&key, &value, ttl).into())
}

#[op2]
#[serde]
fn op_fn_cache_del(state: &mut OpState, #[string] key: String) -> HostReply {
    reply(state, |caps| caps.cache_del(&key).into())
}

#[op2]
#[serde]
fn op_fn_db_get(state: &mut OpState, #[string] key: String) -> HostReply {
    reply(state, |caps| caps.db_get(&key).into())
}

#[op2]
#[serde]
fn op_fn_db_find(state: &mut OpState, #[serde] key: Option<String>) -> HostReply {
    reply(state, |caps| caps.db_find(key.as_deref()).map(Some).into())
}

fn db_write(
    state: &mut OpState,
    mode: DbWrite,
    key: String,
    value: serde_json::Value,
) -> HostReply {
    reply(state, |caps| caps.db_write(mode, &key, &value).into())
}

#[op2]
#[serde]
fn op_fn_db_set(
    state: &mut OpState,
    #[string] key: String,
    #[serde] value: serde_json::Value,
) -> HostReply {
    db_write(state, DbWrite::Set, key, value)
}

#[op2]
#[serde]
fn op_fn_db_insert(
    state: &mut OpState,
    #[string] key: String,
    #[serde] value: serde_json::Value,
) -> HostReply {
    db_write(state, DbWrite::Insert, key, value)
}

#[op2]
#[serde]
fn op_fn_db_update(
    state: &mut OpState,
    #[string] key: String,
    #[serde] value: serde_json::Value,
) -> HostReply {
    db_write(state, DbWrite::Update, key, value)
}

#[op2]
#[serde]
fn op_fn_db_del(state: &mut OpState, #[string] key: String) -> HostReply {
    reply(state, |caps| caps.db_del(&key).into())
}

#[op2]
#[serde]
fn op_fn_http(state: &mut OpState, #[serde] request: HttpRequest) -> HostReply {
    reply(state, |caps| {
        caps.http(request)
            .map(|reply| serde_json::to_value(reply).ok().map(GuestValue::from))
            .into()
    })
}

#[op2]
#[serde]
fn op_fn_config_get(state: &mut OpState, #[string] key: String) -> HostReply {
    reply(state, |caps| caps.config_get(&key).into())
}

#[op2]
#[serde]
fn op_fn_master(state: &mut OpState) -> HostReply {
    reply(state, |caps| caps.master().into())
}

#[op2]
fn op_fn_broadcast(
    state: &mut OpState,
    #[string] event: String,
    #[serde] payload: serde_json::Value,
) {
    with_caps(state, |caps| caps.broadcast(&event, payload));
}

#[op2]
#[serde]
fn op_fn_write_asset_text(
    state: &mut OpState,
    #[string] path: String,
    #[string] data: String,
    #[serde] options: AssetOptions,
) -> HostReply {
    reply(state, |caps| {
        caps.write_asset(&path, AssetData::Text(data), &options).into()
    })
}

#[op2]
#[serde]
fn op_fn_write_asset_bytes(
    state: &mut OpState,
    #[string] path: String,
    #[buffer] data: JsBuffer,
    #[serde] options: AssetOptions,
) -> HostReply {
    reply(state, |caps| {
        caps.write_asset(&path, AssetData::Bytes(data.to_vec()), &options)
            .into()
    })
}

#[op2]
#[serde]
fn op_fn_read_asset(
    state: &mut OpState,
    #[string] path: String,
    #[serde] options: AssetOptions,
) -> HostReply {
    reply(state, |caps| {
        caps.read_asset(&path, &options)
            .map(|data| match data {
                AssetData::Text(text) => Some(GuestValue::String(text)),
                AssetData::Bytes(bytes) => Some(GuestValue::Bytes(bytes)),
            })
            .into()
    })
}

deno_core::extension!(
    fn_host,
    ops = [
        op_fn_log,
        op_fn_res_status,
        op_fn_res_type,
        op_fn_res_sent,
        op_fn_throws,
        op_fn_is_ip,
        op_fn_cache_get,
        op_fn_cache_set,
        op_fn_cache_del,
        op_fn_db_get,
        op_fn_db_find,
        op_fn_db_set,
        op_fn_db_insert,
        op_fn_db_update,
        op_fn_db_del,
        op_fn_http,
        op_fn_config_get,
        op_fn_master,
        op_fn_broadcast,
        op_fn_write_asset_text,
        op_fn_write_asset_bytes,
        op_fn_read_asset,
    ],
);

/// Register the guest host-API ops.
pub fn extension() -> deno_core::Extension {
    fn_host::init_ops_and_esm()
}
