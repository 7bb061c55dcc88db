// ABOUTME: Wire models for the realtime socket (Phoenix channel messages)
// ABOUTME: Encodes joins, heartbeats, presence and broadcast; decodes change payloads

use seafarm_store::{
    row_id, BroadcastMessage, ChangeEvent, ChangeKind, PresenceEvent, PresenceState, Row,
    RowFilter, StoreError, StoreResult,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

pub const PHOENIX_TOPIC: &str = "phoenix";
pub const TOPIC_PREFIX: &str = "realtime:";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";
pub const EVENT_PRESENCE_STATE: &str = "presence_state";
pub const EVENT_PRESENCE_DIFF: &str = "presence_diff";
pub const EVENT_PRESENCE: &str = "presence";
pub const EVENT_BROADCAST: &str = "broadcast";
pub const EVENT_SYSTEM: &str = "system";

/// One frame on the realtime socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: None,
            join_ref: None,
        }
    }

    pub fn with_ref(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }

    pub fn heartbeat(reference: impl Into<String>) -> Self {
        Self::new(PHOENIX_TOPIC, EVENT_HEARTBEAT, json!({})).with_ref(reference)
    }

    pub fn join(topic: &str, config: &JoinConfig, access_token: &str, join_ref: &str) -> Self {
        Self::new(
            topic,
            EVENT_JOIN,
            json!({ "config": config, "access_token": access_token }),
        )
        .with_ref(join_ref)
        .with_join_ref(join_ref)
    }

    pub fn leave(topic: &str, reference: &str) -> Self {
        Self::new(topic, EVENT_LEAVE, json!({})).with_ref(reference)
    }

    pub fn track(topic: &str, payload: Value, reference: &str) -> Self {
        Self::new(
            topic,
            EVENT_PRESENCE,
            json!({ "type": "presence", "event": "track", "payload": payload }),
        )
        .with_ref(reference)
    }

    pub fn broadcast(topic: &str, message: &BroadcastMessage, reference: &str) -> Self {
        Self::new(
            topic,
            EVENT_BROADCAST,
            json!({ "type": "broadcast", "event": message.event, "payload": message.payload }),
        )
        .with_ref(reference)
    }

    pub fn to_json(&self) -> StoreResult<String> {
        serde_json::to_string(self).map_err(|e| StoreError::Malformed(e.to_string()))
    }

    pub fn from_json(text: &str) -> StoreResult<Self> {
        serde_json::from_str(text).map_err(|e| StoreError::Malformed(e.to_string()))
    }
}

pub fn topic_for(channel: &str) -> String {
    format!("{}{}", TOPIC_PREFIX, channel)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinConfig {
    pub broadcast: BroadcastConfig,
    pub presence: PresenceConfig,
    pub postgres_changes: Vec<PostgresChangesConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastConfig {
    pub ack: bool,
    #[serde(rename = "self")]
    pub receive_own: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceConfig {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostgresChangesConfig {
    pub event: String,
    pub schema: String,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl JoinConfig {
    fn base() -> Self {
        Self {
            broadcast: BroadcastConfig {
                ack: false,
                receive_own: true,
            },
            presence: PresenceConfig { key: String::new() },
            postgres_changes: Vec::new(),
        }
    }

    pub fn postgres_changes(
        schema: &str,
        table: &str,
        filter: Option<&RowFilter>,
        event: &str,
    ) -> Self {
        let mut config = Self::base();
        config.postgres_changes.push(PostgresChangesConfig {
            event: event.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
            filter: filter.map(|f| f.to_string()),
        });
        config
    }

    pub fn presence(key: &str) -> Self {
        let mut config = Self::base();
        config.presence.key = key.to_string();
        config
    }

    pub fn broadcast() -> Self {
        Self::base()
    }
}

/// Payload of a `phx_reply` frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reply {
    pub status: String,
    #[serde(default)]
    pub response: Value,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    pub fn reason(&self) -> String {
        self.response
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.response.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ChangesPayload {
    data: ChangeData,
}

#[derive(Debug, Clone, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    record: Option<Row>,
    #[serde(default)]
    old_record: Option<Row>,
}

/// Decodes a `postgres_changes` payload into a change event.
pub fn decode_change(payload: &Value) -> StoreResult<ChangeEvent> {
    let parsed: ChangesPayload = serde_json::from_value(payload.clone())
        .map_err(|e| StoreError::Malformed(format!("change payload: {}", e)))?;
    let kind = ChangeKind::parse(&parsed.data.kind)?;
    match kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let row = parsed.data.record.ok_or_else(|| {
                StoreError::Malformed(format!("{} change without a record", kind))
            })?;
            ChangeEvent::from_row(kind, row)
        }
        ChangeKind::Delete => {
            let id = parsed
                .data
                .old_record
                .as_ref()
                .and_then(row_id)
                .ok_or_else(|| StoreError::Malformed("DELETE change without an id".into()))?;
            Ok(ChangeEvent::delete(id))
        }
    }
}

/// Last tracked payload for each key, without Phoenix bookkeeping fields.
fn latest_metas(entries: &Value) -> Vec<(String, Value)> {
    let Some(entries) = entries.as_object() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|(key, entry)| {
            let meta = entry.get("metas")?.as_array()?.last()?.clone();
            let meta = match meta {
                Value::Object(mut fields) => {
                    fields.remove("phx_ref");
                    fields.remove("phx_ref_prev");
                    Value::Object(fields)
                }
                other => other,
            };
            Some((key.clone(), meta))
        })
        .collect()
}

pub fn decode_presence_state(payload: &Value) -> PresenceState {
    latest_metas(payload).into_iter().collect()
}

/// Joins first, then leaves, as the server applies them.
pub fn decode_presence_diff(payload: &Value) -> Vec<PresenceEvent> {
    let mut events: Vec<PresenceEvent> = payload
        .get("joins")
        .map(latest_metas)
        .unwrap_or_default()
        .into_iter()
        .map(|(key, payload)| PresenceEvent::Join { key, payload })
        .collect();
    events.extend(
        payload
            .get("leaves")
            .map(latest_metas)
            .unwrap_or_default()
            .into_iter()
            .map(|(key, _)| PresenceEvent::Leave { key }),
    );
    events
}

pub fn decode_broadcast(payload: &Value) -> StoreResult<BroadcastMessage> {
    let event = payload
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Malformed("broadcast without an event name".into()))?;
    let body = payload.get("payload").cloned().unwrap_or(Value::Null);
    Ok(BroadcastMessage::new(event, body))
}

/// Websocket endpoint for a project: `ws(s)://host/realtime/v1/websocket`.
pub fn socket_url(project_url: &Url, api_key: &str) -> StoreResult<Url> {
    let mut url = project_url.clone();
    let scheme = match project_url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(StoreError::Malformed(format!(
                "unsupported project URL scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| StoreError::Malformed("could not derive websocket URL".into()))?;
    url.set_path("/realtime/v1/websocket");
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", api_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_frame_carries_postgres_changes_config() {
        let config = JoinConfig::postgres_changes(
            "public",
            "modules",
            Some(&RowFilter::eq("site_id", "s1")),
            "*",
        );
        let frame = PhoenixMessage::join("realtime:modules-all-1-1", &config, "key", "3");
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();

        assert_eq!(value["event"], json!("phx_join"));
        assert_eq!(value["ref"], json!("3"));
        assert_eq!(value["join_ref"], json!("3"));
        assert_eq!(value["payload"]["access_token"], json!("key"));
        let changes = &value["payload"]["config"]["postgres_changes"][0];
        assert_eq!(changes["table"], json!("modules"));
        assert_eq!(changes["filter"], json!("site_id=eq.s1"));
        assert_eq!(value["payload"]["config"]["broadcast"]["self"], json!(true));
    }

    #[test]
    fn decodes_change_payloads() {
        let insert = json!({"data": {"type": "INSERT", "record": {"id": "a", "name": "Site A"}}});
        let event = decode_change(&insert).unwrap();
        assert_eq!(event.kind(), ChangeKind::Insert);
        assert_eq!(event.id(), "a");

        let delete = json!({"data": {"type": "DELETE", "record": null, "old_record": {"id": 7}}});
        assert_eq!(decode_change(&delete).unwrap(), ChangeEvent::delete("7"));

        let broken = json!({"data": {"type": "UPDATE"}});
        assert!(matches!(decode_change(&broken), Err(StoreError::Malformed(_))));
    }

    #[test]
    fn decodes_presence_frames() {
        let state = json!({
            "amina": {"metas": [{"phx_ref": "x", "online_at": "t1"}, {"phx_ref": "y", "online_at": "t2"}]}
        });
        let decoded = decode_presence_state(&state);
        assert_eq!(decoded["amina"], json!({"online_at": "t2"}));

        let diff = json!({
            "joins": {"omar": {"metas": [{"phx_ref": "z", "role": "diver"}]}},
            "leaves": {"amina": {"metas": [{"phx_ref": "y"}]}}
        });
        let events = decode_presence_diff(&diff);
        assert_eq!(
            events,
            vec![
                PresenceEvent::Join {
                    key: "omar".into(),
                    payload: json!({"role": "diver"})
                },
                PresenceEvent::Leave { key: "amina".into() },
            ]
        );
    }

    #[test]
    fn socket_url_follows_project_scheme() {
        let url = socket_url(&Url::parse("https://abcd.supabase.co").unwrap(), "k").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://abcd.supabase.co/realtime/v1/websocket?apikey=k&vsn=1.0.0"
        );
        let local = socket_url(&Url::parse("http://127.0.0.1:54321").unwrap(), "k").unwrap();
        assert_eq!(local.scheme(), "ws");
    }
}
