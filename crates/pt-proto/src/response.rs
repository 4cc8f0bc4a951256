use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
    /// Unsolicited chatter (boot banner, notes). Never an answer to a command.
    Info,
}

/// Single-line key/value record written back to the host.
///
/// `status` always serializes first; the remaining fields keep insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: Status,
    pub fields: Map<String, Value>,
}

impl Response {
    pub fn new(status: Status) -> Self {
        Self { status, fields: Map::new() }
    }

    pub fn ok() -> Self {
        Self::new(Status::Ok)
    }

    pub fn ok_message(msg: &str) -> Self {
        Self::ok().with("message", msg)
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::new(Status::Error).with("message", msg.into())
    }

    pub fn info(msg: impl Into<String>) -> Self {
        Self::new(Status::Info).with("message", msg.into())
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn message(&self) -> Option<&str> {
        self.fields.get("message").and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    pub fn has(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// JSON text without the trailing newline.
    pub fn to_line(&self) -> String {
        // A map of strings and JSON values always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"status\":\"error\"}"))
    }

    /// Returns `None` for anything that is not a JSON object carrying a known `status`.
    pub fn parse(line: &str) -> Option<Self> {
        let map: Map<String, Value> = serde_json::from_str(line.trim()).ok()?;
        let status = map.get("status").cloned()?;
        let status: Status = serde_json::from_value(status).ok()?;
        let fields = map.into_iter().filter(|(k, _)| k != "status").collect();
        Some(Self { status, fields })
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        map.serialize_entry("status", &self.status)?;
        for (k, v) in &self.fields {
            if k != "status" {
                map.serialize_entry(k, v)?;
            }
        }
        map.end()
    }
}
