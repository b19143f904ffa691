use std::sync::Arc;

use chrono::{Duration, Utc};

use authgate_core::store::{FileStore, KeyValueStore, SESSION_KEY};
use authgate_core::{Session, TokenStore};

fn session(minutes: i64) -> Session {
    Session::new(
        "access",
        Some("refresh".to_string()),
        Utc::now() + Duration::minutes(minutes),
        "subject-1",
    )
}

#[test]
fn test_session_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let original = session(30);
    TokenStore::new(Arc::new(FileStore::new(dir.path()))).set(original.clone());

    let restored = TokenStore::new(Arc::new(FileStore::new(dir.path()))).get();
    assert_eq!(restored, Some(original));
}

#[test]
fn test_expired_session_reads_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    TokenStore::new(Arc::new(FileStore::new(dir.path()))).set(session(-1));

    let store = TokenStore::new(Arc::new(FileStore::new(dir.path())));
    assert_eq!(store.get(), None);
}

#[test]
fn test_persisted_record_shape() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FileStore::new(dir.path()));
    TokenStore::new(backend.clone()).set(session(30));

    let raw = backend.read(SESSION_KEY).unwrap().expect("record");
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["accessToken"], "access");
    assert_eq!(json["refreshToken"], "refresh");
    assert_eq!(json["identitySubject"], "subject-1");
    assert!(json["expiresAt"].is_string());
}

#[test]
fn test_garbage_record_reads_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FileStore::new(dir.path()));
    backend.write(SESSION_KEY, "not json at all").unwrap();

    assert_eq!(TokenStore::new(backend.clone()).get(), None);
    assert_eq!(backend.read(SESSION_KEY).unwrap(), None);
}
