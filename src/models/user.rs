use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub musicbrainz_id: String,
    /// Timestamp of the newest listen pulled in by the Last.fm importer.
    pub latest_import: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ProfileInfo {
    pub musicbrainz_id: String,
    pub latest_import: DateTime<Utc>,
    pub listen_count: i64,
}

#[derive(Debug, Serialize)]
pub struct ImportOptions {
    pub user_name: String,
    pub scraper_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetLatestImportRequest {
    pub reset: String,
}
