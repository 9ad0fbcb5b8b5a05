//! Lap Saver: durable, at-most-once persistence of finalized laps
//! (spec §4.5). Runs as a dedicated worker task, isolated from the frame
//! context; can also be driven synchronously for direct-save (§4.5.4).

pub mod disk_fallback;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::CurrentUserProvider;
use crate::db::{DatabaseClient, DbError};
use crate::lap::{FinalizedLap, LapState};
use crate::sector_buffer::SectorBuffer;
use crate::session::SessionContext;

const TELEMETRY_BATCH_SIZE: usize = 100;
const TELEMETRY_BATCH_RETRIES: usize = 3;

fn min_frames_for(state: LapState) -> usize {
    match state {
        LapState::Timed => 20,
        LapState::Out | LapState::In => 10,
        LapState::Incomplete | LapState::Invalid => 5,
    }
}

fn min_coverage_for(state: LapState) -> f32 {
    match state {
        LapState::Timed => 0.5,
        LapState::Out | LapState::In => 0.35,
        LapState::Incomplete | LapState::Invalid => 0.1,
    }
}

/// Outcome of attempting to save one finalized lap.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// Persisted; `is_personal_best` reflects whether this updated the
    /// saver's best-so-far cache for the session.
    Saved { lap_id: Uuid, is_personal_best: bool },
    /// Another writer already holds this `(session_id, lap_number)`; the
    /// lap is considered successfully recorded.
    Duplicate,
    /// No session context yet; caller should hold the lap and retry once
    /// `set_session_context` is called.
    QueuedPendingSession,
    /// Below the per-state frame-count/coverage threshold and
    /// `persist_invalid_laps` is off: written to disk fallback instead.
    DiskFallback,
}

#[derive(Debug, Error)]
pub enum SaverError {
    #[error("no authenticated user")]
    NotAuthenticated,
    #[error(transparent)]
    Database(#[from] DbError),
    #[error("failed to serialize lap record: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct LapSaverConfig {
    pub disk_fallback_dir: PathBuf,
    /// If true, laps below threshold are still persisted (with an
    /// incomplete-telemetry marker) rather than shunted to disk.
    pub persist_invalid_laps: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_batch_retries: usize,
}

impl Default for LapSaverConfig {
    fn default() -> Self {
        Self {
            disk_fallback_dir: std::env::temp_dir().join("lap-core-fallback"),
            persist_invalid_laps: false,
            telemetry_batch_size: TELEMETRY_BATCH_SIZE,
            telemetry_batch_retries: TELEMETRY_BATCH_RETRIES,
        }
    }
}

/// Internal, serializable shape of the `laps` row (spec §6.3).
#[derive(Debug, Clone, Serialize)]
struct LapRecord {
    id: Uuid,
    session_id: Uuid,
    lap_number: i64,
    lap_time: f64,
    is_valid: bool,
    is_valid_for_leaderboard: bool,
    lap_type: &'static str,
    is_personal_best: bool,
    user_id: Option<Uuid>,
    sectors: Vec<Option<f64>>,
    metadata: Value,
}

pub struct LapSaver {
    db: Arc<dyn DatabaseClient>,
    auth: Arc<dyn CurrentUserProvider>,
    session: Arc<RwLock<Option<SessionContext>>>,
    sector_buffer: Arc<Mutex<SectorBuffer>>,
    best_lap_times: Mutex<HashMap<Uuid, f64>>,
    known_sessions: Mutex<HashSet<Uuid>>,
    config: LapSaverConfig,
}

impl LapSaver {
    pub fn new(
        db: Arc<dyn DatabaseClient>,
        auth: Arc<dyn CurrentUserProvider>,
        session: Arc<RwLock<Option<SessionContext>>>,
        sector_buffer: Arc<Mutex<SectorBuffer>>,
        config: LapSaverConfig,
    ) -> Self {
        Self {
            db,
            auth,
            session,
            sector_buffer,
            best_lap_times: Mutex::new(HashMap::new()),
            known_sessions: Mutex::new(HashSet::new()),
            config,
        }
    }

    /// Run the full persistence pipeline for one lap (spec §4.5.1–4.5.3).
    pub async fn save_lap(&self, lap: &FinalizedLap) -> Result<SaveOutcome, SaverError> {
        if !self.auth.current_user().is_authenticated {
            return Err(SaverError::NotAuthenticated);
        }

        let ctx = match self.session.read().await.clone() {
            Some(ctx) => ctx,
            None => return Ok(SaveOutcome::QueuedPendingSession),
        };

        self.ensure_session_row(&ctx).await?;

        let frame_count = lap.frame_count();
        let coverage = lap.track_coverage();
        let meets_threshold =
            frame_count >= min_frames_for(lap.state) && coverage >= min_coverage_for(lap.state);

        if !meets_threshold && !self.config.persist_invalid_laps {
            self.write_disk_fallback(&ctx, lap, "below frame-count/coverage threshold");
            return Ok(SaveOutcome::DiskFallback);
        }

        let lap_id = Uuid::new_v4();
        let is_personal_best = self.maybe_update_personal_best(ctx.session_id, lap);
        let sectors = self.sector_columns(lap);

        let mut record = LapRecord {
            id: lap_id,
            session_id: ctx.session_id,
            lap_number: lap.lap_number,
            lap_time: lap.duration_seconds,
            is_valid: lap.valid_from_source,
            is_valid_for_leaderboard: lap.valid_for_leaderboard,
            lap_type: lap.state.as_str(),
            is_personal_best,
            user_id: ctx.user_id,
            sectors,
            metadata: serde_json::json!({
                "track_coverage": coverage,
                "frame_count": frame_count,
                "below_threshold": !meets_threshold,
            }),
        };

        match self.db.insert_row("laps", serde_json::to_value(&record)?).await {
            Ok(()) => {}
            Err(DbError::UniqueViolation { .. }) => {
                info!(
                    lap_number = lap.lap_number,
                    "lap already persisted by another writer, skipping telemetry"
                );
                return Ok(SaveOutcome::Duplicate);
            }
            Err(DbError::CheckViolation { constraint }) if constraint.contains("state") || constraint.contains("lap_type") => {
                warn!(
                    lap_number = lap.lap_number,
                    constraint, "lap_type rejected by check constraint, coercing to TIMED and retrying once"
                );
                record.lap_type = LapState::Timed.as_str();
                self.db.insert_row("laps", serde_json::to_value(&record)?).await?;
            }
            Err(other) => return Err(other.into()),
        }

        self.persist_telemetry(lap_id, &ctx, lap).await;

        Ok(SaveOutcome::Saved { lap_id, is_personal_best })
    }

    async fn ensure_session_row(&self, ctx: &SessionContext) -> Result<(), SaverError> {
        if self.known_sessions.lock().unwrap().contains(&ctx.session_id) {
            return Ok(());
        }

        let row = serde_json::json!({
            "id": ctx.session_id,
            "user_id": ctx.user_id,
            "track_id": ctx.track_id,
            "car_id": ctx.car_id,
            "session_type": ctx.session_type,
            "session_date": Utc::now().to_rfc3339(),
        });

        match self.db.insert_row("sessions", row).await {
            Ok(()) => {}
            Err(DbError::UniqueViolation { .. }) => {
                debug!(session_id = %ctx.session_id, "session row already exists (concurrent creation)");
            }
            Err(other) => return Err(other.into()),
        }

        self.known_sessions.lock().unwrap().insert(ctx.session_id);
        Ok(())
    }

    fn maybe_update_personal_best(&self, session_id: Uuid, lap: &FinalizedLap) -> bool {
        if !lap.valid_for_leaderboard {
            return false;
        }
        let mut best = self.best_lap_times.lock().unwrap();
        match best.get(&session_id) {
            Some(&current_best) if lap.duration_seconds >= current_best => false,
            _ => {
                best.insert(session_id, lap.duration_seconds);
                true
            }
        }
    }

    /// Sector timing is canonically keyed by lap number, but a desync
    /// correction (indexer `validate_sync`) can leave the sector feed's
    /// idea of the lap number a notch off from the Lap Saver's. Fall back
    /// to a narrow frame-id-range lookup around the known lap number
    /// before giving up.
    fn sector_columns(&self, lap: &FinalizedLap) -> Vec<Option<f64>> {
        let from_frame = lap.sector_times.clone();
        let buffer = self.sector_buffer.lock().unwrap();
        let from_buffer = buffer
            .get(lap.lap_number)
            .or_else(|| buffer.find_by_frame_id_range(lap.lap_number - 1, lap.lap_number + 1))
            .filter(|entry| !entry.partial)
            .map(|entry| entry.sector_times.clone());

        let times = from_frame.or(from_buffer).unwrap_or_default();
        let mut columns: Vec<Option<f64>> = times.into_iter().map(Some).collect();
        columns.resize(10, None);
        columns
    }

    async fn persist_telemetry(&self, lap_id: Uuid, ctx: &SessionContext, lap: &FinalizedLap) {
        let mut frames = lap.frames.clone();
        frames.sort_by(|a, b| a.lap_distance_pct.partial_cmp(&b.lap_distance_pct).unwrap());

        let mut failed_batches = Vec::new();
        for (batch_index, chunk) in frames.chunks(self.config.telemetry_batch_size).enumerate() {
            let rows: Vec<Value> = chunk
                .iter()
                .map(|frame| {
                    serde_json::json!({
                        "lap_id": lap_id,
                        "user_id": ctx.user_id,
                        "timestamp": frame.session_time,
                        "track_position": frame.lap_distance_pct,
                        "speed": frame.speed,
                        "rpm": frame.rpm,
                        "gear": frame.gear,
                        "throttle": frame.throttle,
                        "brake": frame.brake,
                        "clutch": frame.clutch,
                        "steering": frame.steering,
                        "lat_accel": frame.lateral_accel,
                        "long_accel": frame.longitudinal_accel,
                        "batch_index": batch_index,
                    })
                })
                .collect();

            let mut last_err = None;
            let mut ok = false;
            for attempt in 1..=self.config.telemetry_batch_retries {
                match self.db.insert_rows("telemetry_points", rows.clone()).await {
                    Ok(()) => {
                        ok = true;
                        break;
                    }
                    Err(err) if err.is_transient() => {
                        warn!(batch_index, attempt, "telemetry batch insert failed, retrying");
                        last_err = Some(err);
                    }
                    Err(err) => {
                        last_err = Some(err);
                        break;
                    }
                }
            }
            if !ok {
                warn!(batch_index, error = ?last_err, "telemetry batch permanently failed");
                failed_batches.push(batch_index);
            }
        }

        if !failed_batches.is_empty() {
            warn!(
                lap_number = lap.lap_number,
                ?failed_batches,
                "lap persisted with incomplete telemetry"
            );
            let patch = serde_json::json!({
                "telemetry_incomplete": true,
                "failed_batches": failed_batches,
            });
            if let Err(err) = self.db.update_row("laps", lap_id, patch).await {
                warn!(error = %err, "failed to mark lap telemetry_incomplete");
            }
        }
    }

    /// Write a lap (including all frames) to disk as a recovery aid. Never
    /// propagates a failure — matches the teacher's "log but don't fail
    /// the handler" posture for non-critical side effects.
    fn write_disk_fallback(&self, ctx: &SessionContext, lap: &FinalizedLap, reason: &str) {
        disk_fallback::write(&self.config.disk_fallback_dir, ctx, lap, reason);
    }

    /// Explicit disk-fallback entry point used by the caller when all
    /// persistence retries have been exhausted (spec §4.5.5).
    pub fn fall_back_to_disk(&self, ctx: &SessionContext, lap: &FinalizedLap, reason: &str) {
        self.write_disk_fallback(ctx, lap, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticUserProvider;
    use crate::db::fake::FakeDatabaseClient;
    use crate::frame::TelemetryFrame;

    fn frame(dist: f32) -> TelemetryFrame {
        TelemetryFrame {
            session_time: 0.0,
            laps_completed: 0,
            current_driving_lap: 1,
            lap_distance_pct: dist,
            per_car_last_lap_time: 0.0,
            global_last_lap_time: 0.0,
            lap_invalidated: false,
            on_pit_road: false,
            speed: 50.0,
            rpm: 6000.0,
            gear: 3,
            throttle: 1.0,
            brake: 0.0,
            clutch: 0.0,
            steering: 0.0,
            lateral_accel: 0.0,
            longitudinal_accel: 0.0,
        }
    }

    fn timed_lap(lap_number: i64, n_frames: usize) -> FinalizedLap {
        let frames = (0..n_frames)
            .map(|i| frame(i as f32 / n_frames as f32))
            .collect();
        FinalizedLap {
            lap_number,
            state: LapState::Timed,
            start_tick: 0.0,
            end_tick: 90.0,
            duration_seconds: 90.0,
            frames,
            valid_from_source: true,
            valid_for_leaderboard: true,
            started_on_pit_road: false,
            ended_on_pit_road: false,
            sector_times: None,
            calculated_duration: 90.0,
        }
    }

    fn saver_with(
        db: Arc<FakeDatabaseClient>,
    ) -> (LapSaver, Arc<RwLock<Option<SessionContext>>>, tempfile::TempDir) {
        let auth = Arc::new(StaticUserProvider::new());
        auth.set_user_id(Uuid::new_v4());
        let session = Arc::new(RwLock::new(Some(SessionContext::new(Uuid::new_v4(), 1, 1))));
        let sector_buffer = Arc::new(Mutex::new(SectorBuffer::new()));
        let tmp = tempfile::tempdir().unwrap();
        let config = LapSaverConfig {
            disk_fallback_dir: tmp.path().to_path_buf(),
            ..Default::default()
        };
        (LapSaver::new(db, auth, session.clone(), sector_buffer, config), session, tmp)
    }

    #[tokio::test]
    async fn unauthenticated_takes_precedence_over_missing_session() {
        let db = Arc::new(FakeDatabaseClient::new());
        let auth = Arc::new(StaticUserProvider::new());
        let session = Arc::new(RwLock::new(None));
        let sector_buffer = Arc::new(Mutex::new(SectorBuffer::new()));
        let tmp = tempfile::tempdir().unwrap();
        let saver = LapSaver::new(
            db,
            auth,
            session,
            sector_buffer,
            LapSaverConfig {
                disk_fallback_dir: tmp.path().to_path_buf(),
                ..Default::default()
            },
        );
        let err = saver.save_lap(&timed_lap(1, 50)).await.unwrap_err();
        assert!(matches!(err, SaverError::NotAuthenticated));
    }

    #[tokio::test]
    async fn no_session_context_queues_pending() {
        let db = Arc::new(FakeDatabaseClient::new());
        let (saver, session, _tmp) = saver_with(db);
        *session.write().await = None;
        let outcome = saver.save_lap(&timed_lap(1, 50)).await.unwrap();
        assert_eq!(outcome, SaveOutcome::QueuedPendingSession);
    }

    #[tokio::test]
    async fn below_threshold_lap_falls_back_to_disk() {
        let db = Arc::new(FakeDatabaseClient::new());
        let (saver, _session, _tmp) = saver_with(db);
        let outcome = saver.save_lap(&timed_lap(1, 3)).await.unwrap();
        assert_eq!(outcome, SaveOutcome::DiskFallback);
    }

    #[tokio::test]
    async fn healthy_lap_is_saved_and_marked_personal_best() {
        let db = Arc::new(FakeDatabaseClient::new());
        let (saver, _session, _tmp) = saver_with(db.clone());
        let outcome = saver.save_lap(&timed_lap(1, 50)).await.unwrap();
        match outcome {
            SaveOutcome::Saved { is_personal_best, .. } => assert!(is_personal_best),
            other => panic!("expected Saved, got {other:?}"),
        }
        assert_eq!(db.rows_in("laps").len(), 1);
        assert_eq!(db.rows_in("telemetry_points").len(), 50);
    }

    #[tokio::test]
    async fn duplicate_insert_is_treated_as_success() {
        let db = Arc::new(FakeDatabaseClient::new());
        let (saver, _session, _tmp) = saver_with(db.clone());
        saver.save_lap(&timed_lap(1, 50)).await.unwrap();
        let second = saver.save_lap(&timed_lap(1, 50)).await.unwrap();
        assert_eq!(second, SaveOutcome::Duplicate);
    }

    #[tokio::test]
    async fn unauthenticated_user_is_rejected() {
        let db = Arc::new(FakeDatabaseClient::new());
        let auth = Arc::new(StaticUserProvider::new());
        let session = Arc::new(RwLock::new(Some(SessionContext::new(Uuid::new_v4(), 1, 1))));
        let sector_buffer = Arc::new(Mutex::new(SectorBuffer::new()));
        let tmp = tempfile::tempdir().unwrap();
        let saver = LapSaver::new(
            db,
            auth,
            session,
            sector_buffer,
            LapSaverConfig {
                disk_fallback_dir: tmp.path().to_path_buf(),
                ..Default::default()
            },
        );
        let err = saver.save_lap(&timed_lap(1, 50)).await.unwrap_err();
        assert!(matches!(err, SaverError::NotAuthenticated));
    }

    #[tokio::test]
    async fn sector_lookup_falls_back_to_frame_id_range_on_lap_number_mismatch() {
        let db = Arc::new(FakeDatabaseClient::new());
        let auth = Arc::new(StaticUserProvider::new());
        auth.set_user_id(Uuid::new_v4());
        let session = Arc::new(RwLock::new(Some(SessionContext::new(Uuid::new_v4(), 1, 1))));
        let sector_buffer = Arc::new(Mutex::new(SectorBuffer::new()));
        // Sector feed reports this under the pre-desync-correction lap
        // number (6), one off from the lap the indexer actually emits (5).
        sector_buffer.lock().unwrap().push(crate::sector_buffer::SectorEntry {
            lap_number: 6,
            sector_times: vec![10.0, 10.0, 10.0],
            completion_frame_id: 5,
            partial: false,
        });
        let tmp = tempfile::tempdir().unwrap();
        let saver = LapSaver::new(
            db.clone(),
            auth,
            session,
            sector_buffer,
            LapSaverConfig {
                disk_fallback_dir: tmp.path().to_path_buf(),
                ..Default::default()
            },
        );

        saver.save_lap(&timed_lap(5, 50)).await.unwrap();
        let rows = db.rows_in("laps");
        assert_eq!(rows[0]["sectors"][0], serde_json::json!(10.0));
    }

    #[tokio::test]
    async fn check_violation_on_state_is_coerced_and_retried() {
        let db = Arc::new(FakeDatabaseClient::new());
        db.queue_error(DbError::CheckViolation {
            constraint: "laps_lap_type_check".into(),
        });
        let (saver, _session, _tmp) = saver_with(db.clone());
        let outcome = saver.save_lap(&timed_lap(1, 50)).await.unwrap();
        assert!(matches!(outcome, SaveOutcome::Saved { .. }));
    }
}
