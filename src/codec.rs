use serde_json::Value;

use crate::store::{Fragment, SlotStatus};

/// Leaf of a `{namespace}/{id}/{leaf}` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Status,
    Heartbeat,
    Distance,
    Online,
}

impl TopicKind {
    pub fn leaf(&self) -> &'static str {
        match self {
            TopicKind::Status => "status",
            TopicKind::Heartbeat => "heartbeat",
            TopicKind::Distance => "distance",
            TopicKind::Online => "online",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    /// Status payload other than `free` / `occupied`.
    UnknownStatus(String),
    Malformed(String),
    /// Structured payload without a single numeric field we understand.
    NoUsableFields,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Fragment(Fragment),
    Drop(DropReason),
}

/// Decodes a payload for the given topic kind. Never fails outward: anything
/// unusable comes back as `Decoded::Drop`.
pub fn decode(kind: TopicKind, payload: &[u8]) -> Decoded {
    match kind {
        TopicKind::Status => decode_status(payload),
        TopicKind::Heartbeat => decode_heartbeat(payload),
        TopicKind::Distance => decode_distance(payload),
        TopicKind::Online => Decoded::Fragment(Fragment {
            online: Some(payload == b"online"),
            ..Fragment::default()
        }),
    }
}

fn decode_status(payload: &[u8]) -> Decoded {
    let status = match payload {
        b"free" => SlotStatus::Free,
        b"occupied" => SlotStatus::Occupied,
        other => {
            return Decoded::Drop(DropReason::UnknownStatus(
                String::from_utf8_lossy(other).into_owned(),
            ));
        }
    };
    Decoded::Fragment(Fragment {
        status: Some(status),
        ..Fragment::default()
    })
}

fn decode_heartbeat(payload: &[u8]) -> Decoded {
    let object = match parse_object(payload) {
        Ok(object) => object,
        Err(reason) => return Decoded::Drop(reason),
    };
    let fragment = Fragment {
        distance: number(&object, "distance_cm"),
        rssi: number(&object, "rssi"),
        uptime: number(&object, "uptime_s"),
        ..Fragment::default()
    };
    non_empty(fragment)
}

fn decode_distance(payload: &[u8]) -> Decoded {
    match parse_object(payload) {
        Ok(object) => non_empty(Fragment {
            distance: number(&object, "cm"),
            ..Fragment::default()
        }),
        Err(reason) => Decoded::Drop(reason),
    }
}

fn parse_object(payload: &[u8]) -> Result<serde_json::Map<String, Value>, DropReason> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(other) => Err(DropReason::Malformed(format!("expected a JSON object, got {other}"))),
        Err(err) => Err(DropReason::Malformed(err.to_string())),
    }
}

fn number(object: &serde_json::Map<String, Value>, key: &str) -> Option<f64> {
    object.get(key).and_then(Value::as_f64)
}

fn non_empty(fragment: Fragment) -> Decoded {
    if fragment.is_empty() {
        Decoded::Drop(DropReason::NoUsableFields)
    } else {
        Decoded::Fragment(fragment)
    }
}
