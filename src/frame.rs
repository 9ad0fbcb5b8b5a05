//! Telemetry frame definitions.
//!
//! `FrameInput` is the loosely-typed shape an adapter hands us at the
//! edge (a simulator's native telemetry dictionary, already decoded).
//! `TelemetryFrame` is the validated, internal form the indexer works
//! with once the essential fields are known to be present.

use thiserror::Error;

/// One tick of raw simulator telemetry, as received from the producer.
///
/// All numeric channels are optional and default to zero; only
/// `session_time` and `laps_completed` are required to build a
/// [`TelemetryFrame`].
#[derive(Debug, Clone, Default)]
pub struct FrameInput {
    pub session_time: Option<f64>,
    pub laps_completed: Option<i64>,
    pub current_driving_lap: Option<i64>,
    pub lap_distance_pct: Option<f32>,
    /// Primary timing source: per-car last-lap-time, populated ~3s after
    /// the crossing. Authoritative once available.
    pub per_car_last_lap_time: Option<f64>,
    /// Fallback timing source: the sim's global last-lap-time field, used
    /// when the per-car reading is unavailable or during multi-increment
    /// recovery.
    pub global_last_lap_time: Option<f64>,
    pub lap_invalidated: Option<bool>,
    pub on_pit_road: Option<bool>,

    pub speed: Option<f32>,
    pub rpm: Option<f32>,
    pub gear: Option<i32>,
    pub throttle: Option<f32>,
    pub brake: Option<f32>,
    pub clutch: Option<f32>,
    pub steering: Option<f32>,
    pub lateral_accel: Option<f32>,
    pub longitudinal_accel: Option<f32>,
}

/// Error produced when a [`FrameInput`] cannot be turned into a
/// [`TelemetryFrame`] because an essential field is missing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameValidationError {
    #[error("frame missing session_time")]
    MissingSessionTime,
    #[error("frame missing laps_completed")]
    MissingLapsCompleted,
}

/// A validated telemetry frame. Essential fields are non-optional;
/// every other channel defaults to zero if the producer didn't supply it.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryFrame {
    pub session_time: f64,
    pub laps_completed: i64,
    pub current_driving_lap: i64,
    pub lap_distance_pct: f32,
    pub per_car_last_lap_time: f64,
    pub global_last_lap_time: f64,
    pub lap_invalidated: bool,
    pub on_pit_road: bool,

    pub speed: f32,
    pub rpm: f32,
    pub gear: i32,
    pub throttle: f32,
    pub brake: f32,
    pub clutch: f32,
    pub steering: f32,
    pub lateral_accel: f32,
    pub longitudinal_accel: f32,
}

impl TelemetryFrame {
    /// Validate and convert a raw frame. Missing essential fields are
    /// rejected; missing optional channels fall back to their defaults.
    pub fn from_input(input: &FrameInput) -> Result<Self, FrameValidationError> {
        let session_time = input
            .session_time
            .ok_or(FrameValidationError::MissingSessionTime)?;
        let laps_completed = input
            .laps_completed
            .ok_or(FrameValidationError::MissingLapsCompleted)?;

        Ok(Self {
            session_time,
            laps_completed,
            current_driving_lap: input
                .current_driving_lap
                .unwrap_or(laps_completed + 1),
            lap_distance_pct: input.lap_distance_pct.unwrap_or(0.0),
            per_car_last_lap_time: input.per_car_last_lap_time.unwrap_or(0.0),
            global_last_lap_time: input
                .global_last_lap_time
                .unwrap_or_else(|| input.per_car_last_lap_time.unwrap_or(0.0)),
            lap_invalidated: input.lap_invalidated.unwrap_or(false),
            on_pit_road: input.on_pit_road.unwrap_or(false),
            speed: input.speed.unwrap_or(0.0),
            rpm: input.rpm.unwrap_or(0.0),
            gear: input.gear.unwrap_or(0),
            throttle: input.throttle.unwrap_or(0.0),
            brake: input.brake.unwrap_or(0.0),
            clutch: input.clutch.unwrap_or(0.0),
            steering: input.steering.unwrap_or(0.0),
            lateral_accel: input.lateral_accel.unwrap_or(0.0),
            longitudinal_accel: input.longitudinal_accel.unwrap_or(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> FrameInput {
        FrameInput {
            session_time: Some(10.0),
            laps_completed: Some(2),
            ..Default::default()
        }
    }

    #[test]
    fn missing_session_time_is_rejected() {
        let mut input = base_input();
        input.session_time = None;
        assert_eq!(
            TelemetryFrame::from_input(&input),
            Err(FrameValidationError::MissingSessionTime)
        );
    }

    #[test]
    fn missing_laps_completed_is_rejected() {
        let mut input = base_input();
        input.laps_completed = None;
        assert_eq!(
            TelemetryFrame::from_input(&input),
            Err(FrameValidationError::MissingLapsCompleted)
        );
    }

    #[test]
    fn optional_channels_default_to_zero() {
        let frame = TelemetryFrame::from_input(&base_input()).unwrap();
        assert_eq!(frame.speed, 0.0);
        assert_eq!(frame.on_pit_road, false);
        assert_eq!(frame.current_driving_lap, 3);
    }

    #[test]
    fn current_driving_lap_defaults_to_laps_completed_plus_one() {
        let input = base_input();
        let frame = TelemetryFrame::from_input(&input).unwrap();
        assert_eq!(frame.current_driving_lap, frame.laps_completed + 1);
    }
}
