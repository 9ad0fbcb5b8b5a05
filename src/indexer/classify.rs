//! Lap-state classification precedence (spec §4.2.4).

use crate::lap::LapState;

/// Classify a lap given the signals that can disagree, in strict
/// precedence order:
///
/// 1. Started on pit road → `Out`, unconditionally.
/// 2. Finalized while the session ended mid-lap → `Incomplete`.
/// 3. Primary timing > 0 → `Timed`.
/// 4. Primary timing < 0 → `Out`.
/// 5. Primary timing == 0 → `Incomplete`.
/// 6. Lap number 0, anything else → `Out` (the warm-up out-lap).
pub fn classify_lap(
    started_on_pit_road: bool,
    session_finalized_while_active: bool,
    primary_raw: f64,
    lap_number: i64,
) -> LapState {
    if started_on_pit_road {
        return LapState::Out;
    }
    if session_finalized_while_active {
        return LapState::Incomplete;
    }

    let state = if primary_raw > 0.0 {
        LapState::Timed
    } else if primary_raw < 0.0 {
        LapState::Out
    } else {
        LapState::Incomplete
    };

    if lap_number == 0 && state != LapState::Out {
        LapState::Out
    } else {
        state
    }
}

/// Best-effort classification computed when a lap starts collecting, before
/// any timing signal exists. Always superseded by [`classify_lap`] at
/// finalization; this only feeds the diagnostic `provisional_state` field.
pub fn provisional_classify(
    started_on_pit_road: bool,
    lap_number: i64,
    mid_session_join: bool,
    initial_distance_pct: f32,
) -> LapState {
    if started_on_pit_road || lap_number == 0 {
        return LapState::Out;
    }
    if mid_session_join && initial_distance_pct > 0.1 {
        return LapState::Out;
    }
    LapState::Incomplete
}

/// `valid_for_leaderboard` per spec §3/§4.2.4: timed and never invalidated.
pub fn valid_for_leaderboard(state: LapState, seen_invalid: bool) -> bool {
    state == LapState::Timed && !seen_invalid
}
