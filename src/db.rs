//! Outbound database client contract (spec §6.2).
//!
//! The core never speaks a wire protocol itself; it depends on this trait
//! and lets the host application supply the real implementation. Mirrors
//! the shape of the teacher's `RacingCoachClient`, but as a trait rather
//! than a concrete `reqwest`-backed struct, since the persistence backend
//! here is a database, not an HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Errors a database client can report. Distinguishing these is what lets
/// the Lap Saver treat a duplicate insert as success and a transient
/// timeout as retryable, rather than failing everything alike.
#[derive(Debug, Error, Clone)]
pub enum DbError {
    #[error("unique constraint violation on {constraint}")]
    UniqueViolation { constraint: String },

    #[error("check constraint violation on {constraint}")]
    CheckViolation { constraint: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("database error: {0}")]
    Other(String),
}

impl DbError {
    /// Whether a retry is worth attempting. Constraint violations and
    /// auth failures are deterministic; retrying them just wastes attempts.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Connection(_) | DbError::Timeout(_) | DbError::Other(_))
    }
}

/// Async outbound database contract. One instance is shared (behind an
/// `Arc`) between the Lap Saver worker and any direct-save caller.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Insert a single row into `table`.
    async fn insert_row(&self, table: &str, row: Value) -> Result<(), DbError>;

    /// Insert a batch of rows in one round-trip.
    async fn insert_rows(&self, table: &str, rows: Vec<Value>) -> Result<(), DbError>;

    /// Patch an existing row's fields in place (used to mark
    /// `telemetry_incomplete` on a lap after a partial batch failure).
    async fn update_row(&self, table: &str, id: Uuid, patch: Value) -> Result<(), DbError>;

    /// Cheap liveness/auth check.
    async fn health_check(&self) -> Result<(), DbError>;
}

/// A client that always reports connection failure. Used as a safe
/// placeholder before a real client is wired in, analogous to the
/// teacher's `RacingCoachClient::disabled()` pattern for uploads.
pub struct NullDatabaseClient;

#[async_trait]
impl DatabaseClient for NullDatabaseClient {
    async fn insert_row(&self, _table: &str, _row: Value) -> Result<(), DbError> {
        Err(DbError::Connection("no database client configured".into()))
    }

    async fn insert_rows(&self, _table: &str, _rows: Vec<Value>) -> Result<(), DbError> {
        Err(DbError::Connection("no database client configured".into()))
    }

    async fn update_row(&self, _table: &str, _id: Uuid, _patch: Value) -> Result<(), DbError> {
        Err(DbError::Connection("no database client configured".into()))
    }

    async fn health_check(&self) -> Result<(), DbError> {
        Err(DbError::Connection("no database client configured".into()))
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory `DatabaseClient` for Saver/Supervisor tests. Not behind
    //! `#[cfg(test)]`-only visibility restrictions beyond the module
    //! itself, so integration-style tests elsewhere in the crate can use it.

    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;

    /// A fake database that enforces the one uniqueness constraint the
    /// Saver actually depends on — `(session_id, lap_number)` on `laps` —
    /// and lets tests preload specific errors to simulate outages.
    #[derive(Default)]
    pub struct FakeDatabaseClient {
        rows: Mutex<HashMap<String, Vec<Value>>>,
        lap_keys: Mutex<HashSet<(String, i64)>>,
        queued_errors: Mutex<VecDeque<DbError>>,
    }

    impl FakeDatabaseClient {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue an error to be returned by the next `insert_row`/`insert_rows`
        /// call instead of succeeding.
        pub fn queue_error(&self, err: DbError) {
            self.queued_errors.lock().unwrap().push_back(err);
        }

        pub fn rows_in(&self, table: &str) -> Vec<Value> {
            self.rows.lock().unwrap().get(table).cloned().unwrap_or_default()
        }

        fn take_queued_error(&self) -> Option<DbError> {
            self.queued_errors.lock().unwrap().pop_front()
        }
    }

    #[async_trait]
    impl DatabaseClient for FakeDatabaseClient {
        async fn insert_row(&self, table: &str, row: Value) -> Result<(), DbError> {
            if let Some(err) = self.take_queued_error() {
                return Err(err);
            }
            if table == "laps" {
                let session_id = row.get("session_id").and_then(|v| v.as_str()).unwrap_or_default();
                let lap_number = row.get("lap_number").and_then(|v| v.as_i64()).unwrap_or_default();
                let key = (session_id.to_string(), lap_number);
                let mut keys = self.lap_keys.lock().unwrap();
                if !keys.insert(key) {
                    return Err(DbError::UniqueViolation {
                        constraint: "laps_session_id_lap_number_key".into(),
                    });
                }
            }
            if table == "sessions" {
                let session_id = row.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                let key = (session_id.to_string(), -1);
                let mut keys = self.lap_keys.lock().unwrap();
                if !keys.insert(key) {
                    return Err(DbError::UniqueViolation {
                        constraint: "sessions_pkey".into(),
                    });
                }
            }
            self.rows.lock().unwrap().entry(table.to_string()).or_default().push(row);
            Ok(())
        }

        async fn insert_rows(&self, table: &str, rows: Vec<Value>) -> Result<(), DbError> {
            if let Some(err) = self.take_queued_error() {
                return Err(err);
            }
            self.rows.lock().unwrap().entry(table.to_string()).or_default().extend(rows);
            Ok(())
        }

        async fn update_row(&self, table: &str, id: Uuid, patch: Value) -> Result<(), DbError> {
            if let Some(err) = self.take_queued_error() {
                return Err(err);
            }
            let mut rows = self.rows.lock().unwrap();
            if let Some(entries) = rows.get_mut(table) {
                for entry in entries.iter_mut() {
                    if entry.get("id").and_then(|v| v.as_str()) == Some(&id.to_string()) {
                        if let (Some(obj), Some(patch_obj)) = (entry.as_object_mut(), patch.as_object()) {
                            for (k, v) in patch_obj {
                                obj.insert(k.clone(), v.clone());
                            }
                        }
                    }
                }
            }
            Ok(())
        }

        async fn health_check(&self) -> Result<(), DbError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn duplicate_lap_insert_is_rejected() {
        let db = FakeDatabaseClient::new();
        let row = serde_json::json!({"session_id": "s1", "lap_number": 1});
        db.insert_row("laps", row.clone()).await.unwrap();
        let err = db.insert_row("laps", row).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn queued_error_is_returned_once() {
        let db = FakeDatabaseClient::new();
        db.queue_error(DbError::Connection("offline".into()));
        let row = serde_json::json!({"session_id": "s1", "lap_number": 1});
        assert!(db.insert_row("laps", row.clone()).await.is_err());
        assert!(db.insert_row("laps", row).await.is_ok());
    }

    #[tokio::test]
    async fn update_row_merges_patch_fields() {
        let db = FakeDatabaseClient::new();
        let id = Uuid::new_v4();
        db.insert_row("laps", serde_json::json!({"id": id.to_string(), "telemetry_incomplete": false}))
            .await
            .unwrap();
        db.update_row("laps", id, serde_json::json!({"telemetry_incomplete": true}))
            .await
            .unwrap();
        let rows = db.rows_in("laps");
        assert_eq!(rows[0]["telemetry_incomplete"], serde_json::json!(true));
    }
}
