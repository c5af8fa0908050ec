use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use uuid::Uuid;

/// Keys the portable form owns; they are never taken from the metadata payload.
pub const RESERVED_KEYS: [&str; 4] = ["timestamp", "release_msid", "artist_msid", "recording_msid"];

/// One play of a track by a user, as held in the listen store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Listen {
    pub user_name: String,
    /// Seconds since the unix epoch.
    pub listened_at: i64,
    /// Track metadata: `artist_name`, `track_name`, optional `release_name`
    /// and `additional_info`, plus whatever else the submitter sent.
    #[sqlx(json)]
    pub data: Map<String, Value>,
    pub release_msid: Option<Uuid>,
    pub artist_msid: Option<Uuid>,
    pub recording_msid: Option<Uuid>,
}

/// Export shape of a listen: the metadata payload flattened at top level,
/// plus the timestamp and the three msids (or `null`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableListen {
    #[serde(flatten)]
    pub data: Map<String, Value>,
    pub timestamp: i64,
    pub release_msid: Option<String>,
    pub artist_msid: Option<String>,
    pub recording_msid: Option<String>,
}

impl From<&Listen> for PortableListen {
    fn from(listen: &Listen) -> Self {
        let mut data = listen.data.clone();
        for key in RESERVED_KEYS {
            data.remove(key);
        }

        PortableListen {
            data,
            timestamp: listen.listened_at,
            release_msid: listen.release_msid.map(|id| id.to_string()),
            artist_msid: listen.artist_msid.map(|id| id.to_string()),
            recording_msid: listen.recording_msid.map(|id| id.to_string()),
        }
    }
}
