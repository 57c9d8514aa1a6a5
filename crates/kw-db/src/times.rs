use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Timestamps tracked on every group and entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Times {
    pub creation: DateTime<Utc>,
    pub last_modification: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    #[serde(default)]
    pub expires: bool,
    #[serde(default)]
    pub usage_count: u64,
    pub location_changed: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Times {
    pub fn now() -> Self {
        let now = kw_core::time::now();
        Self {
            creation: now,
            last_modification: now,
            last_access: now,
            expiry: now,
            expires: false,
            usage_count: 0,
            location_changed: now,
            extra: Map::new(),
        }
    }

    pub fn is_expired(&self, at: DateTime<Utc>) -> bool {
        self.expires && self.expiry <= at
    }
}

impl Default for Times {
    fn default() -> Self {
        Self::now()
    }
}

/// Base64 (standard alphabet) encoding for byte fields in the JSON payload.
pub(crate) mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
