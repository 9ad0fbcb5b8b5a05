//! Write-only recovery aid (spec §4.5.5, §6.4). A lap that reaches here
//! has exhausted all persistence attempts; the file is never re-ingested
//! by this crate, matching the original's behavior.

use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::frame::TelemetryFrame;
use crate::lap::FinalizedLap;
use crate::session::SessionContext;

#[derive(Serialize)]
struct FallbackRecord<'a> {
    lap_id: Uuid,
    session_id: Uuid,
    lap_number: i64,
    lap_time: f64,
    state: &'static str,
    valid_from_source: bool,
    valid_for_leaderboard: bool,
    reason: &'a str,
    points: &'a [TelemetryFrame],
}

/// Serialize `lap` to `lap_{number}_{yyyymmdd_hhmmss}.json` under `dir`.
/// Never propagates a failure: an unwritable disk is a last-resort
/// scenario already past the point persistence succeeded, so the only
/// remaining action is to log loudly and move on.
pub fn write(dir: &Path, ctx: &SessionContext, lap: &FinalizedLap, reason: &str) {
    if let Err(err) = std::fs::create_dir_all(dir) {
        error!(?dir, error = %err, "could not create disk-fallback directory");
        return;
    }

    let filename = format!(
        "lap_{}_{}.json",
        lap.lap_number,
        Utc::now().format("%Y%m%d_%H%M%S")
    );
    let path = dir.join(filename);

    let record = FallbackRecord {
        lap_id: Uuid::new_v4(),
        session_id: ctx.session_id,
        lap_number: lap.lap_number,
        lap_time: lap.duration_seconds,
        state: lap.state.as_str(),
        valid_from_source: lap.valid_from_source,
        valid_for_leaderboard: lap.valid_for_leaderboard,
        reason,
        points: &lap.frames,
    };

    match serde_json::to_vec_pretty(&record) {
        Ok(bytes) => {
            if let Err(err) = std::fs::write(&path, bytes) {
                error!(?path, error = %err, "failed to write disk-fallback file");
            } else {
                error!(?path, lap_number = lap.lap_number, "lap written to disk fallback");
            }
        }
        Err(err) => {
            error!(lap_number = lap.lap_number, error = %err, "failed to serialize lap for disk fallback");
        }
    }
}
