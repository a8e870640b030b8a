//! Builders for the JSON-lines records shipped to the collector. Each
//! builder returns one newline-terminated JSON object; the store treats
//! the result as an opaque immutable blob.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::device::DeviceFacts;
use crate::wire;

/// Kind of a flow marker: a tagged event or a viewed screen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowKind {
    Event,
    Screen,
}

impl FlowKind {
    fn key(self) -> &'static str {
        match self {
            Self::Event => "e",
            Self::Screen => "s",
        }
    }
}

/// A lightweight (kind, name) marker recording in-session navigation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowMarker {
    pub kind: FlowKind,
    pub name: String,
}

impl FlowMarker {
    pub fn event(name: impl Into<String>) -> Self {
        Self {
            kind: FlowKind::Event,
            name: name.into(),
        }
    }

    pub fn screen(name: impl Into<String>) -> Self {
        Self {
            kind: FlowKind::Screen,
            name: name.into(),
        }
    }

    fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(self.kind.key().to_string(), Value::String(self.name.clone()));
        Value::Object(map)
    }
}

/// Session-start record (`dt` = "s"). The `u` field is the new session's
/// own uuid, not a fresh document uuid.
pub fn session_start(
    session_uuid: &str,
    client_time: i64,
    session_number: i64,
    elapsed_secs: i64,
    dims: &[String],
) -> String {
    let mut map = Map::new();
    map.insert(wire::PARAM_DATA_TYPE.into(), "s".into());
    insert_str(&mut map, wire::PARAM_UUID, session_uuid);
    map.insert(wire::PARAM_CLIENT_TIME.into(), client_time.into());
    map.insert(wire::PARAM_SESSION_NUMBER.into(), session_number.into());
    map.insert(wire::PARAM_SESSION_ELAPSE_TIME.into(), elapsed_secs.into());
    insert_dims(&mut map, dims);
    finish(map)
}

/// Session-close record (`dt` = "c"). `total_secs` is omitted when the
/// computed length is implausible (clock tampering).
#[allow(clippy::too_many_arguments)]
pub fn session_close(
    session_uuid: &str,
    session_start: i64,
    client_time: i64,
    active_secs: i64,
    total_secs: Option<i64>,
    screens: &[String],
    dims: &[String],
) -> String {
    let mut map = Map::new();
    map.insert(wire::PARAM_DATA_TYPE.into(), "c".into());
    insert_str(&mut map, wire::PARAM_SESSION_UUID, session_uuid);
    insert_str(&mut map, wire::PARAM_UUID, &random_uuid());
    map.insert(wire::PARAM_SESSION_START.into(), session_start.into());
    map.insert(wire::PARAM_SESSION_ACTIVE.into(), active_secs.into());
    map.insert(wire::PARAM_CLIENT_TIME.into(), client_time.into());
    if let Some(total) = total_secs {
        map.insert(wire::PARAM_SESSION_TOTAL.into(), total.into());
    }
    map.insert(
        wire::PARAM_SESSION_SCREENFLOW.into(),
        Value::Array(screens.iter().map(|s| Value::String(s.clone())).collect()),
    );
    insert_dims(&mut map, dims);
    finish(map)
}

/// Application event record (`dt` = "e").
pub fn app_event(
    app_key: &str,
    session_uuid: &str,
    name: &str,
    client_time: i64,
    dims: &[String],
    attributes: &BTreeMap<String, String>,
    report_attributes: &BTreeMap<String, String>,
) -> String {
    let mut map = Map::new();
    map.insert(wire::PARAM_DATA_TYPE.into(), "e".into());
    insert_str(&mut map, wire::PARAM_UUID, &random_uuid());
    insert_str(&mut map, wire::PARAM_APP_KEY, app_key);
    insert_str(&mut map, wire::PARAM_SESSION_UUID, session_uuid);
    insert_str(&mut map, wire::PARAM_EVENT_NAME, name);
    map.insert(wire::PARAM_CLIENT_TIME.into(), client_time.into());
    insert_dims(&mut map, dims);
    if !attributes.is_empty() {
        map.insert(wire::PARAM_ATTRIBUTES.into(), string_map(attributes));
    }
    if !report_attributes.is_empty() {
        map.insert(
            wire::PARAM_REPORT_ATTRIBUTES.into(),
            string_map(report_attributes),
        );
    }
    finish(map)
}

/// Application-flow record (`dt` = "f"): markers not yet staged for upload
/// under `nw`, previously staged markers under `od`.
pub fn flow(session_start: i64, unstaged: &[FlowMarker], staged: &[FlowMarker]) -> String {
    let mut map = Map::new();
    map.insert(wire::PARAM_DATA_TYPE.into(), "f".into());
    insert_str(&mut map, wire::PARAM_UUID, &random_uuid());
    map.insert(wire::PARAM_SESSION_START.into(), session_start.into());
    map.insert(
        wire::PARAM_NEW_FLOW_EVENTS.into(),
        Value::Array(unstaged.iter().map(FlowMarker::to_value).collect()),
    );
    map.insert(
        wire::PARAM_OLD_FLOW_EVENTS.into(),
        Value::Array(staged.iter().map(FlowMarker::to_value).collect()),
    );
    finish(map)
}

/// Opt record (`dt` = "o"). The wire field carries whether the user is
/// opted OUT, the opposite of the `opted_in` argument.
pub fn opt(opted_in: bool, client_time: i64) -> String {
    let mut map = Map::new();
    map.insert(wire::PARAM_DATA_TYPE.into(), "o".into());
    insert_str(&mut map, wire::PARAM_UUID, &random_uuid());
    map.insert(wire::PARAM_OPT_VALUE.into(), Value::Bool(!opted_in));
    map.insert(wire::PARAM_CLIENT_TIME.into(), client_time.into());
    finish(map)
}

/// Upload-header record (`dt` = "h") tagging one batch with its sequence
/// number and the device/application facts the collector expects.
pub fn upload_header(
    sequence_number: i64,
    persisted_at: i64,
    app_key: &str,
    install_id: &str,
    app_version: &str,
    facts: &DeviceFacts,
) -> String {
    let mut map = Map::new();
    map.insert(wire::PARAM_SEQUENCE_NUMBER.into(), sequence_number.into());
    map.insert(wire::PARAM_PERSISTED_AT.into(), persisted_at.into());
    map.insert(wire::PARAM_DATA_TYPE.into(), "h".into());
    insert_str(&mut map, wire::PARAM_UUID, &random_uuid());

    let mut attrs = Map::new();
    attrs.insert(wire::PARAM_DATA_TYPE.into(), "a".into());
    insert_str(&mut attrs, wire::PARAM_INSTALL_ID, install_id);
    insert_str(&mut attrs, wire::PARAM_APP_KEY, app_key);
    insert_str(&mut attrs, wire::PARAM_APP_VERSION, app_version);
    insert_str(&mut attrs, wire::PARAM_LIBRARY_VERSION, crate::LIBRARY_VERSION);
    insert_str(&mut attrs, wire::PARAM_DEVICE_MANUFACTURER, &facts.manufacturer);
    insert_str(&mut attrs, wire::PARAM_DEVICE_PLATFORM, &facts.platform);
    insert_str(&mut attrs, wire::PARAM_DEVICE_OS_VERSION, &facts.os_version);
    insert_str(&mut attrs, wire::PARAM_DEVICE_MODEL, &facts.model);
    if let Some(mem) = facts.available_memory {
        attrs.insert(wire::PARAM_DEVICE_MEMORY.into(), mem.into());
    }
    insert_str(&mut attrs, wire::PARAM_LOCALE_LANGUAGE, &facts.locale_language);
    insert_str(&mut attrs, wire::PARAM_LOCALE_COUNTRY, &facts.locale_country);
    attrs.insert(wire::PARAM_JAILBROKEN.into(), Value::Bool(facts.jailbroken));

    map.insert(wire::PARAM_ATTRIBUTES.into(), Value::Object(attrs));
    finish(map)
}

pub fn random_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Empty strings are sent as JSON null, matching the collector's contract.
fn insert_str(map: &mut Map<String, Value>, key: &str, value: &str) {
    let value = if value.is_empty() {
        Value::Null
    } else {
        Value::String(value.to_string())
    };
    map.insert(key.to_string(), value);
}

fn insert_dims(map: &mut Map<String, Value>, dims: &[String]) {
    for (i, dim) in dims.iter().enumerate().take(4) {
        if !dim.is_empty() {
            map.insert(format!("c{i}"), Value::String(dim.clone()));
        }
    }
}

fn string_map(entries: &BTreeMap<String, String>) -> Value {
    let mut map = Map::new();
    for (k, v) in entries {
        insert_str(&mut map, k, v);
    }
    Value::Object(map)
}

fn finish(map: Map<String, Value>) -> String {
    let mut blob = Value::Object(map).to_string();
    blob.push('\n');
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(blob: &str) -> Value {
        assert!(blob.ends_with('\n'), "blob must be newline-terminated");
        serde_json::from_str(blob.trim_end()).expect("valid JSON")
    }

    #[test]
    fn session_start_fields() {
        let dims = ["red".to_string(), String::new(), "beta".to_string(), String::new()];
        let blob = session_start("sess-uuid", 1_700_000_000, 3, 42, &dims);
        let v = parse(&blob);
        assert_eq!(v["dt"], "s");
        assert_eq!(v["u"], "sess-uuid");
        assert_eq!(v["ct"], 1_700_000_000_i64);
        assert_eq!(v["nth"], 3);
        assert_eq!(v["sl"], 42);
        assert_eq!(v["c0"], "red");
        assert_eq!(v["c2"], "beta");
        assert!(v.get("c1").is_none());
    }

    #[test]
    fn close_omits_implausible_total() {
        let blob = session_close("su", 100, 200, 50, None, &[], &[]);
        let v = parse(&blob);
        assert_eq!(v["dt"], "c");
        assert!(v.get("ctl").is_none());
        assert_eq!(v["cta"], 50);
        assert_eq!(v["fl"], serde_json::json!([]));
    }

    #[test]
    fn close_includes_total_and_screens() {
        let screens = vec!["home".to_string(), "settings".to_string()];
        let blob = session_close("su", 100, 200, 50, Some(100), &screens, &[]);
        let v = parse(&blob);
        assert_eq!(v["ctl"], 100);
        assert_eq!(v["fl"], serde_json::json!(["home", "settings"]));
    }

    #[test]
    fn event_attributes_optional() {
        let empty = BTreeMap::new();
        let blob = app_event("key", "su", "click", 5, &[], &empty, &empty);
        let v = parse(&blob);
        assert_eq!(v["dt"], "e");
        assert_eq!(v["n"], "click");
        assert!(v.get("attrs").is_none());
        assert!(v.get("rattrs").is_none());

        let mut attrs = BTreeMap::new();
        attrs.insert("color".to_string(), "blue".to_string());
        let blob = app_event("key", "su", "click", 5, &[], &attrs, &empty);
        let v = parse(&blob);
        assert_eq!(v["attrs"]["color"], "blue");
    }

    #[test]
    fn event_name_with_quotes_survives() {
        let empty = BTreeMap::new();
        let blob = app_event("key", "su", "say \"hi\"\n", 5, &[], &empty, &empty);
        let v = parse(&blob);
        assert_eq!(v["n"], "say \"hi\"\n");
    }

    #[test]
    fn flow_buckets_markers() {
        let unstaged = vec![FlowMarker::event("click"), FlowMarker::screen("home")];
        let staged = vec![FlowMarker::event("old")];
        let blob = flow(123, &unstaged, &staged);
        let v = parse(&blob);
        assert_eq!(v["dt"], "f");
        assert_eq!(v["ss"], 123);
        assert_eq!(v["nw"], serde_json::json!([{"e": "click"}, {"s": "home"}]));
        assert_eq!(v["od"], serde_json::json!([{"e": "old"}]));
    }

    #[test]
    fn opt_record_inverts_flag() {
        let v = parse(&opt(true, 9));
        assert_eq!(v["dt"], "o");
        assert_eq!(v["out"], false);
        let v = parse(&opt(false, 9));
        assert_eq!(v["out"], true);
    }

    #[test]
    fn header_carries_sequence_and_facts() {
        let facts = DeviceFacts::default();
        let blob = upload_header(7, 1_650_000_000, "key", "install", "1.2.3", &facts);
        let v = parse(&blob);
        assert_eq!(v["dt"], "h");
        assert_eq!(v["seq"], 7);
        assert_eq!(v["pa"], 1_650_000_000_i64);
        assert_eq!(v["attrs"]["dt"], "a");
        assert_eq!(v["attrs"]["au"], "key");
        assert_eq!(v["attrs"]["iu"], "install");
        assert_eq!(v["attrs"]["j"], false);
        assert_eq!(v["attrs"]["lv"], crate::LIBRARY_VERSION);
    }

    #[test]
    fn empty_strings_become_null() {
        let v = parse(&session_close("", 1, 2, 0, None, &[], &[]));
        assert_eq!(v["su"], Value::Null);
    }
}
