use serde::{de::DeserializeOwned, Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{AcornError, AcornResult};

/// The unit of storage: a typed payload wrapped in replication metadata.
///
/// The JSON wire format uses PascalCase field names and RFC 3339 timestamps.
/// Optional fields missing from incoming JSON are defaulted, so envelopes
/// produced by older peers still deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
pub struct Nut<T> {
    pub id: String,
    /// `None` marks a tombstone.
    #[serde(default)]
    pub payload: Option<T>,
    #[serde(default = "OffsetDateTime::now_utc", with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default = "first_version")]
    pub version: u64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default = "Uuid::new_v4")]
    pub change_id: Uuid,
    #[serde(default)]
    pub origin_node_id: String,
    #[serde(default)]
    pub hop_count: u32,
}

fn first_version() -> u64 {
    1
}

impl<T> Nut<T> {
    /// Author a fresh envelope at version 1.
    pub fn new(id: impl Into<String>, payload: T, origin: impl Into<String>) -> Self {
        Nut {
            id: id.into(),
            payload: Some(payload),
            timestamp: OffsetDateTime::now_utc(),
            version: 1,
            expires_at: None,
            change_id: Uuid::new_v4(),
            origin_node_id: origin.into(),
            hop_count: 0,
        }
    }

    /// Author the successor of `prior` with a new payload and a fresh change id.
    pub fn next(prior_version: u64, id: impl Into<String>, payload: T, origin: impl Into<String>) -> Self {
        let mut nut = Nut::new(id, payload, origin);
        nut.version = prior_version + 1;
        nut
    }

    /// A versioned tombstone for `id`.
    pub fn tombstone(id: impl Into<String>, version: u64, origin: impl Into<String>) -> Self {
        Nut {
            id: id.into(),
            payload: None,
            timestamp: OffsetDateTime::now_utc(),
            version,
            expires_at: None,
            change_id: Uuid::new_v4(),
            origin_node_id: origin.into(),
            hop_count: 0,
        }
    }

    pub fn with_expiry(mut self, expires_at: OffsetDateTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Serialization hooks between envelopes and trunk-owned bytes.
pub trait NutCodec<T>: Send + Sync {
    fn encode(&self, nut: &Nut<T>) -> AcornResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> AcornResult<Nut<T>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> NutCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, nut: &Nut<T>) -> AcornResult<Vec<u8>> {
        serde_json::to_vec(nut).map_err(|e| AcornError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> AcornResult<Nut<T>> {
        serde_json::from_slice(bytes).map_err(|e| AcornError::Serialization(e.to_string()))
    }
}

/// Capability a user type may implement so trees can derive document ids
/// without an explicit key.
pub trait Keyed {
    fn acorn_id(&self) -> String;
}

/// Fallback id extraction: look for a conventionally named field in the
/// serialized form of the value. No silent id fabrication; extraction failure
/// is `MissingId`.
#[derive(Debug, Clone)]
pub struct IdExtractor {
    field: String,
}

impl Default for IdExtractor {
    fn default() -> Self {
        IdExtractor { field: "Id".to_string() }
    }
}

impl IdExtractor {
    pub fn new(field: impl Into<String>) -> Self {
        IdExtractor { field: field.into() }
    }

    pub fn extract<T: Serialize>(&self, value: &T) -> AcornResult<String> {
        let json = serde_json::to_value(value).map_err(|e| AcornError::Serialization(e.to_string()))?;
        let found = json.get(&self.field).or_else(|| {
            json.as_object().and_then(|map| {
                map.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(&self.field))
                    .map(|(_, v)| v)
            })
        });
        match found {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
            _ => Err(AcornError::MissingId(format!(
                "no usable `{}` field on value",
                self.field
            ))),
        }
    }
}
