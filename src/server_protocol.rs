use serde::Serialize;
use serde_json::Value;

use crate::types::ZoneView;

#[derive(Debug, PartialEq)]
pub enum ParsedClientMessage {
    Hello {
        name: String,
        zones: Option<Vec<String>>,
    },
    Resync {
        zone: Option<String>,
    },
    Ping {
        t: f64,
    },
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        #[serde(rename = "observerId")]
        observer_id: String,
        #[serde(rename = "serverTimeMs")]
        server_time_ms: u64,
        factions: Vec<String>,
        zones: Vec<ZoneView>,
    },
    Pong {
        t: f64,
        #[serde(rename = "serverTimeMs")]
        server_time_ms: u64,
    },
    Error {
        message: String,
    },
}

pub fn parse_client_message(raw: &str) -> Option<ParsedClientMessage> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let object = value.as_object()?;
    let message_type = object.get("type")?.as_str()?;

    match message_type {
        "hello" => {
            let name = match object.get("name") {
                None => String::new(),
                Some(value) => value.as_str()?.to_string(),
            };
            let zones = match object.get("zones") {
                None | Some(Value::Null) => None,
                Some(value) => Some(parse_string_list(value)?),
            };
            Some(ParsedClientMessage::Hello { name, zones })
        }
        "resync" => {
            let zone = match object.get("zone") {
                None | Some(Value::Null) => None,
                Some(value) => Some(value.as_str()?.to_string()),
            };
            Some(ParsedClientMessage::Resync { zone })
        }
        "ping" => {
            let t = object.get("t")?.as_f64()?;
            if !t.is_finite() {
                return None;
            }
            Some(ParsedClientMessage::Ping { t })
        }
        _ => None,
    }
}

fn parse_string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|item| item.as_str().map(str::to_string))
        .collect()
}
