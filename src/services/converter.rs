//! Turns the raw contents of archive entries into validated listens.
//!
//! An entry that is not a JSON list is skipped ([`EntryOutcome::ParseFailed`]);
//! a bad record inside a list rejects the whole upload ([`AppError::InvalidBackup`]).

use crate::error::AppError;
use crate::models::Listen;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;
use validator::Validate;

/// Result of decoding one archive entry.
#[derive(Debug)]
pub enum EntryOutcome {
    Parsed(Vec<Value>),
    ParseFailed(String),
}

pub fn parse_entry(bytes: &[u8]) -> EntryOutcome {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Array(records)) => EntryOutcome::Parsed(records),
        Ok(other) => EntryOutcome::ParseFailed(format!(
            "expected a list of scrobbles, found {}",
            json_kind(&other)
        )),
        Err(e) => EntryOutcome::ParseFailed(e.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// Convert every record of a parsed entry, failing on the first invalid one.
pub fn convert_and_validate(records: Vec<Value>, user_name: &str) -> crate::error::Result<Vec<Listen>> {
    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            convert_record(record, user_name)
                .map_err(|reason| AppError::InvalidBackup(format!("record {}: {}", index, reason)))
        })
        .collect()
}

fn convert_record(record: Value, user_name: &str) -> Result<Listen, String> {
    let Value::Object(object) = record else {
        return Err(format!("expected an object, found {}", json_kind(&record)));
    };

    let listen = if object.get("timestamp").is_some_and(Value::is_number) {
        from_portable(object, user_name)?
    } else {
        from_lastfm_backup(object, user_name)?
    };

    validate_listen(&listen)?;
    Ok(listen)
}

/// Records in the shape produced by our own export (numeric `timestamp`).
fn from_portable(mut object: Map<String, Value>, user_name: &str) -> Result<Listen, String> {
    let listened_at = match object.remove("timestamp") {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| format!("timestamp {} is not an integer", n))?,
        Some(other) => return Err(format!("timestamp must be an integer, found {}", json_kind(&other))),
        None => return Err("missing timestamp".to_string()),
    };

    let release_msid = take_msid(&mut object, "release_msid")?;
    let artist_msid = take_msid(&mut object, "artist_msid")?;
    let recording_msid = take_msid(&mut object, "recording_msid")?;

    Ok(Listen {
        user_name: user_name.to_string(),
        listened_at,
        data: object,
        release_msid,
        artist_msid,
        recording_msid,
    })
}

fn take_msid(object: &mut Map<String, Value>, key: &str) -> Result<Option<Uuid>, String> {
    match object.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => Uuid::parse_str(&raw)
            .map(Some)
            .map_err(|e| format!("{} {:?} is not a valid identifier: {}", key, raw, e)),
        Some(other) => Err(format!("{} must be a string, found {}", key, json_kind(&other))),
    }
}

#[derive(Debug, Deserialize)]
struct LastfmScrobble {
    name: String,
    #[serde(default)]
    mbid: Option<String>,
    artist: LastfmNamed,
    album: LastfmNamed,
    date: LastfmDate,
}

#[derive(Debug, Deserialize)]
struct LastfmNamed {
    #[serde(rename = "#text")]
    text: String,
    #[serde(default)]
    mbid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LastfmDate {
    uts: Uts,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Uts {
    Number(i64),
    Text(String),
}

/// Records from a Last.fm backup (`lastfm-backup` scrobble pages).
fn from_lastfm_backup(object: Map<String, Value>, user_name: &str) -> Result<Listen, String> {
    let scrobble: LastfmScrobble =
        serde_json::from_value(Value::Object(object)).map_err(|e| e.to_string())?;

    let listened_at = match scrobble.date.uts {
        Uts::Number(ts) => ts,
        Uts::Text(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|e| format!("date.uts {:?} is not an integer: {}", raw, e))?,
    };

    let mut additional_info = Map::new();
    if let Some(mbid) = non_empty(scrobble.mbid) {
        additional_info.insert("recording_mbid".to_string(), json!(mbid));
    }
    if let Some(mbid) = non_empty(scrobble.artist.mbid) {
        additional_info.insert("artist_mbids".to_string(), json!([mbid]));
    }
    if let Some(mbid) = non_empty(scrobble.album.mbid) {
        additional_info.insert("release_mbid".to_string(), json!(mbid));
    }

    let mut data = Map::new();
    data.insert("track_name".to_string(), json!(scrobble.name));
    data.insert("artist_name".to_string(), json!(scrobble.artist.text));
    data.insert("release_name".to_string(), json!(scrobble.album.text));
    data.insert("additional_info".to_string(), Value::Object(additional_info));

    Ok(Listen {
        user_name: user_name.to_string(),
        listened_at,
        data,
        release_msid: None,
        artist_msid: None,
        recording_msid: None,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Deserialize, Validate)]
struct TrackMetadata {
    #[validate(length(min = 1, max = 1024))]
    artist_name: String,
    #[validate(length(min = 1, max = 1024))]
    track_name: String,
    #[allow(dead_code)]
    release_name: Option<String>,
    #[allow(dead_code)]
    additional_info: Option<Map<String, Value>>,
}

fn validate_listen(listen: &Listen) -> Result<(), String> {
    if listen.listened_at < 0 {
        return Err(format!("timestamp {} is negative", listen.listened_at));
    }

    let metadata: TrackMetadata = serde_json::from_value(Value::Object(listen.data.clone()))
        .map_err(|e| format!("invalid track metadata: {}", e))?;
    metadata
        .validate()
        .map_err(|e| format!("invalid track metadata: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lastfm_record() -> Value {
        json!({
            "name": "Windowlicker",
            "mbid": "",
            "artist": {"#text": "Aphex Twin", "mbid": "f22942a1-6f70-4f48-866e-238cb2308fbd"},
            "album": {"#text": "Windowlicker", "mbid": ""},
            "date": {"uts": "1262304000", "#text": "01 Jan 2010, 00:00"}
        })
    }

    fn portable_record() -> Value {
        json!({
            "artist_name": "Aphex Twin",
            "track_name": "Xtal",
            "additional_info": {},
            "timestamp": 1262304000,
            "release_msid": "7a3a5a3e-1f3f-4b4c-9c1d-3e2f1a0b9c8d",
            "artist_msid": null,
            "recording_msid": "0f9d2a36-3a4b-4a8b-9d6c-5b3e2f1a0c7e"
        })
    }

    #[test]
    fn parse_accepts_only_lists() {
        assert!(matches!(parse_entry(b"[]"), EntryOutcome::Parsed(r) if r.is_empty()));
        assert!(matches!(parse_entry(b"[{}, 1]"), EntryOutcome::Parsed(r) if r.len() == 2));
        assert!(matches!(parse_entry(b"{\"a\": 1}"), EntryOutcome::ParseFailed(_)));
        assert!(matches!(parse_entry(b"42"), EntryOutcome::ParseFailed(_)));
        assert!(matches!(parse_entry(b"[{\"a\": "), EntryOutcome::ParseFailed(_)));
        assert!(matches!(parse_entry(&[0xff, 0xfe]), EntryOutcome::ParseFailed(_)));
    }

    #[test]
    fn converts_lastfm_backup_records() {
        let listens = convert_and_validate(vec![lastfm_record()], "rob").unwrap();
        let listen = &listens[0];

        assert_eq!(listen.user_name, "rob");
        assert_eq!(listen.listened_at, 1_262_304_000);
        assert_eq!(listen.data["track_name"], "Windowlicker");
        assert_eq!(listen.data["artist_name"], "Aphex Twin");
        assert_eq!(listen.data["release_name"], "Windowlicker");
        assert_eq!(
            listen.data["additional_info"],
            json!({"artist_mbids": ["f22942a1-6f70-4f48-866e-238cb2308fbd"]})
        );
        assert_eq!(listen.recording_msid, None);
    }

    #[test]
    fn converts_portable_records_keeping_msids() {
        let listens = convert_and_validate(vec![portable_record()], "rob").unwrap();
        let listen = &listens[0];

        assert_eq!(listen.listened_at, 1_262_304_000);
        assert_eq!(
            listen.release_msid.map(|id| id.to_string()).as_deref(),
            Some("7a3a5a3e-1f3f-4b4c-9c1d-3e2f1a0b9c8d")
        );
        assert_eq!(listen.artist_msid, None);
        assert!(!listen.data.contains_key("timestamp"));
        assert!(!listen.data.contains_key("recording_msid"));
    }

    #[test]
    fn missing_required_field_is_fatal() {
        let mut record = lastfm_record();
        record.as_object_mut().unwrap().remove("date");

        let err = convert_and_validate(vec![portable_record(), record], "rob").unwrap_err();
        match err {
            AppError::InvalidBackup(reason) => assert!(reason.starts_with("record 1:")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn non_numeric_timestamp_falls_back_to_lastfm_shape() {
        let mut record = lastfm_record();
        record["timestamp"] = json!({"unixtime": "1262304000"});

        let listens = convert_and_validate(vec![record], "rob").unwrap();
        assert_eq!(listens[0].listened_at, 1_262_304_000);
        assert_eq!(listens[0].data["track_name"], "Windowlicker");
        assert!(!listens[0].data.contains_key("timestamp"));
    }

    #[test]
    fn rejects_bad_timestamps() {
        for ts in [json!(-1), json!(1.5), json!("1262304000")] {
            let mut record = portable_record();
            record["timestamp"] = ts;
            assert!(matches!(
                convert_and_validate(vec![record], "rob"),
                Err(AppError::InvalidBackup(_))
            ));
        }

        let mut record = lastfm_record();
        record["date"]["uts"] = json!("yesterday");
        assert!(convert_and_validate(vec![record], "rob").is_err());
    }

    #[test]
    fn rejects_bad_metadata() {
        let mut empty_track = portable_record();
        empty_track["track_name"] = json!("");
        assert!(convert_and_validate(vec![empty_track], "rob").is_err());

        let mut info_not_object = portable_record();
        info_not_object["additional_info"] = json!(["nope"]);
        assert!(convert_and_validate(vec![info_not_object], "rob").is_err());

        let mut bad_msid = portable_record();
        bad_msid["artist_msid"] = json!("not-a-uuid");
        assert!(convert_and_validate(vec![bad_msid], "rob").is_err());

        assert!(convert_and_validate(vec![json!("scrobble")], "rob").is_err());
    }
}
