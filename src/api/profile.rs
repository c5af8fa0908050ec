use crate::api::middleware::RequireAuth;
use crate::error::{AppError, Result};
use crate::models::{ImportOptions, ImportResponse, ProfileInfo, ResetLatestImportRequest, User};
use crate::services::listen_store::cached_listen_count;
use crate::services::{AuthService, ImportService, ListenCountCache, ListenExporter, ListenStore};
use axum::{
    extract::{multipart::MultipartError, Multipart, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;

pub struct AppState {
    pub db: PgPool,
    pub auth_service: Arc<AuthService>,
    pub listen_store: Arc<dyn ListenStore>,
    pub listen_counts: Arc<dyn ListenCountCache>,
    pub exporter: Arc<ListenExporter>,
    pub importer: Arc<ImportService>,
    pub lastfm_api_key: Option<String>,
    pub public_url: String,
}

pub fn profile_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(info))
        .route("/export", post(export_listens))
        .route("/upload", post(upload))
        .route("/import", get(import_options))
        .route("/reset-latest-import", post(reset_latest_import))
}

async fn info(
    State(state): State<Arc<AppState>>,
    RequireAuth(claims): RequireAuth,
) -> Result<Json<ProfileInfo>> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE musicbrainz_id = $1")
        .bind(&claims.name)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

    let listen_count = cached_listen_count(
        state.listen_store.as_ref(),
        state.listen_counts.as_ref(),
        &user.musicbrainz_id,
    )
    .await?;

    Ok(Json(ProfileInfo {
        musicbrainz_id: user.musicbrainz_id,
        latest_import: user.latest_import,
        listen_count,
    }))
}

/// Download every listen of the caller as one JSON attachment.
async fn export_listens(
    State(state): State<Arc<AppState>>,
    RequireAuth(claims): RequireAuth,
) -> Result<Response> {
    let document = state.exporter.export(&claims.name, Utc::now()).await?;
    let body = document.to_json()?;

    let disposition = attachment_disposition(&document.filename)?;

    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json; charset=utf-8"),
            ),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

/// `Content-Disposition` for a download, with characters that could end the
/// quoted filename or the header replaced by `_`.
fn attachment_disposition(filename: &str) -> Result<HeaderValue> {
    let safe: String = filename
        .chars()
        .map(|c| {
            if c == '"' || c == '\\' || c == ';' || c.is_control() || !c.is_ascii() {
                '_'
            } else {
                c
            }
        })
        .collect();

    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", safe))
        .map_err(|e| anyhow::anyhow!("Invalid export filename {}: {}", filename, e).into())
}

/// Accept a Last.fm backup (or one of our own exports) zipped under
/// `json/scrobbles/` and import it for the caller.
async fn upload(
    State(state): State<Arc<AppState>>,
    RequireAuth(claims): RequireAuth,
    mut multipart: Multipart,
) -> Result<Json<ImportResponse>> {
    let limit = state.importer.max_content_length();
    let mut staged = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        if file_name.is_empty() {
            return Err(AppError::Validation("No file selected.".to_string()));
        }

        let mut upload = state.importer.stage_upload(&claims.name).await?;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| multipart_error(e, limit))?
        {
            upload.write_chunk(&chunk).await?;
        }

        tracing::info!(
            "Received {} ({} bytes) from {}",
            file_name,
            upload.len(),
            claims.name
        );
        staged = Some(upload);
        break;
    }

    let upload = staged.ok_or_else(|| AppError::Validation("No file selected.".to_string()))?;
    let result = state.importer.import_upload(&claims.name, upload).await?;

    Ok(Json(result.into()))
}

fn multipart_error(error: MultipartError, limit: usize) -> AppError {
    if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::SizeLimitExceeded { limit }
    } else {
        AppError::Validation(format!("Could not read the upload: {}", error.body_text()))
    }
}

async fn import_options(
    State(state): State<Arc<AppState>>,
    RequireAuth(claims): RequireAuth,
) -> Result<Json<ImportOptions>> {
    if state.lastfm_api_key.is_none() {
        return Err(AppError::NotFound("LASTFM_API_KEY not specified.".to_string()));
    }

    Ok(Json(ImportOptions {
        scraper_url: format!(
            "{}/user/{}/scraper.js",
            state.public_url.trim_end_matches('/'),
            claims.name
        ),
        user_name: claims.name,
    }))
}

/// Make the Last.fm importer fetch the full history again on its next run.
async fn reset_latest_import(
    State(state): State<Arc<AppState>>,
    RequireAuth(claims): RequireAuth,
    Json(req): Json<ResetLatestImportRequest>,
) -> Result<Json<serde_json::Value>> {
    if req.reset != "yes" {
        return Ok(Json(json!({ "reset": false })));
    }

    let updated = sqlx::query("UPDATE users SET latest_import = to_timestamp(0) WHERE musicbrainz_id = $1")
        .bind(&claims.name)
        .execute(&state.db)
        .await?;

    if updated.rows_affected() == 0 {
        return Err(AppError::NotFound("User not found".to_string()));
    }

    tracing::info!("Latest import timestamp reset for {}", claims.name);

    Ok(Json(json!({
        "reset": true,
        "message": "Latest import time reset, we'll now import all your data instead of stopping at your last imported listen.",
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::archive::test_support::zip_bytes;
    use crate::services::listen_store::memory::{MemoryListenCount, MemoryListenStore};
    use crate::models::Listen;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use sqlx::postgres::PgPoolOptions;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use uuid::Uuid;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";
    const BOUNDARY: &str = "listen-archive-boundary";

    struct TestApp {
        router: Router,
        store: Arc<MemoryListenStore>,
        token: String,
        _upload_dir: TempDir,
    }

    fn test_app(listens: Vec<Listen>, max_content_length: usize) -> TestApp {
        let upload_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryListenStore::with_listens(listens));
        let counts = Arc::new(MemoryListenCount::default());
        let auth_service = Arc::new(AuthService::with_secret(SECRET.to_string()));
        let token = auth_service.issue_token(Uuid::new_v4(), "rob");

        let state = Arc::new(AppState {
            db: PgPoolOptions::new()
                .connect_lazy("postgres://localhost/listen_archive_test")
                .unwrap(),
            auth_service,
            listen_store: store.clone(),
            listen_counts: counts.clone(),
            exporter: Arc::new(ListenExporter::new(store.clone(), 2)),
            importer: Arc::new(ImportService::new(
                store.clone(),
                counts,
                Some(upload_dir.path().to_path_buf()),
                max_content_length,
            )),
            lastfm_api_key: None,
            public_url: "http://localhost:8000".to_string(),
        });

        TestApp {
            router: crate::api::router(state),
            store,
            token,
            _upload_dir: upload_dir,
        }
    }

    fn multipart_body(file_name: &str, contents: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/zip\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(contents);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(token: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/profile/upload")
            .header("Authorization", format!("Bearer {}", token))
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn listen(ts: i64) -> Listen {
        Listen {
            user_name: "rob".to_string(),
            listened_at: ts,
            data: json!({"artist_name": "Kiasmos", "track_name": format!("Looped {}", ts)})
                .as_object()
                .cloned()
                .unwrap(),
            release_msid: None,
            artist_msid: None,
            recording_msid: Some(Uuid::new_v4()),
        }
    }

    #[tokio::test]
    async fn export_requires_token() {
        let app = test_app(vec![], 1024 * 1024);
        let response = app
            .router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/profile/export")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn export_returns_attachment_with_every_listen() {
        let app = test_app(vec![listen(10), listen(20), listen(30)], 1024 * 1024);
        let response = app
            .router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/profile/export")
                    .header("Authorization", format!("Bearer {}", app.token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json; charset=utf-8"
        );
        let disposition = response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .to_string();
        let expected = format!("rob_lb-{}.json", Utc::now().format("%Y-%m-%d"));
        assert!(disposition.starts_with("attachment;"));
        assert!(disposition.contains(&expected));

        let body = json_body(response).await;
        let timestamps: Vec<i64> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["timestamp"].as_i64().unwrap())
            .collect();
        assert_eq!(timestamps, vec![30, 20, 10]);
    }

    #[tokio::test]
    async fn upload_imports_scrobbles() {
        let app = test_app(vec![], 1024 * 1024);
        let page = serde_json::to_vec(&json!([{
            "name": "Blurred",
            "artist": {"#text": "Kiasmos", "mbid": ""},
            "album": {"#text": "Kiasmos", "mbid": ""},
            "date": {"uts": "1400000000"}
        }]))
        .unwrap();
        let archive = zip_bytes(&[
            ("json/scrobbles/scrobbles-1.json", page.as_slice()),
            ("json/scrobbles/scrobbles-2.json", b"not json"),
        ]);

        let response = app
            .router
            .oneshot(upload_request(&app.token, multipart_body("backup.zip", &archive)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], 1);
        assert_eq!(body["failure"], 1);
        assert_eq!(app.store.listens_for("rob").len(), 1);
    }

    #[tokio::test]
    async fn upload_rejects_non_zip() {
        let app = test_app(vec![], 1024 * 1024);
        let response = app
            .router
            .oneshot(upload_request(
                &app.token,
                multipart_body("backup.zip", b"plain text"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "Not a valid zip file.");
    }

    #[tokio::test]
    async fn upload_rejects_oversized_files() {
        let app = test_app(vec![], 1024);
        let response = app
            .router
            .oneshot(upload_request(
                &app.token,
                multipart_body("backup.zip", &vec![b'x'; 8 * 1024]),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(app.store.insert_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upload_requires_a_file_name() {
        let app = test_app(vec![], 1024 * 1024);
        let response = app
            .router
            .oneshot(upload_request(&app.token, multipart_body("", b"")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "No file selected.");
    }

    #[tokio::test]
    async fn import_options_need_lastfm_key() {
        let app = test_app(vec![], 1024 * 1024);
        let response = app
            .router
            .oneshot(
                Request::builder()
                    .uri("/api/v1/profile/import")
                    .header("Authorization", format!("Bearer {}", app.token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn attachment_filename_cannot_break_out_of_quotes() {
        let value = attachment_disposition("ro\"b; filename=evil.exe_lb-2024-03-09.json").unwrap();
        assert_eq!(
            value.to_str().unwrap(),
            "attachment; filename=\"ro_b_ filename=evil.exe_lb-2024-03-09.json\""
        );

        let value = attachment_disposition("a\\b\r\nX-Evil: 1.json").unwrap();
        assert_eq!(
            value.to_str().unwrap(),
            "attachment; filename=\"a_b__X-Evil: 1.json\""
        );
    }

    #[tokio::test]
    async fn export_rejects_token_in_query_string() {
        let app = test_app(vec![listen(10)], 1024 * 1024);
        let response = app
            .router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/v1/profile/export?token={}", app.token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
