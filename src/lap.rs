//! Core lap data types: the mutable lap being collected, the pending
//! completion awaiting deferred timing, and the immutable finalized
//! record emitted once a lap is done.

use crate::frame::TelemetryFrame;

/// Classification of a completed or in-progress lap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LapState {
    Out,
    Timed,
    In,
    Incomplete,
    Invalid,
}

impl LapState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LapState::Out => "OUT",
            LapState::Timed => "TIMED",
            LapState::In => "IN",
            LapState::Incomplete => "INCOMPLETE",
            LapState::Invalid => "INVALID",
        }
    }
}

/// The lap currently collecting telemetry frames.
#[derive(Debug, Clone)]
pub struct ActiveLap {
    pub lap_number: i64,
    pub start_tick: f64,
    pub frames: Vec<TelemetryFrame>,
    pub seen_invalid: bool,
    pub started_on_pit_road: bool,
    pub provisional_state: LapState,
}

impl ActiveLap {
    pub fn new(
        lap_number: i64,
        start_tick: f64,
        started_on_pit_road: bool,
        provisional_state: LapState,
    ) -> Self {
        Self {
            lap_number,
            start_tick,
            frames: Vec::new(),
            seen_invalid: false,
            started_on_pit_road,
            provisional_state,
        }
    }

    /// Append a frame, enforcing the strictly non-decreasing session-time
    /// invariant. Returns `false` (and does not append) if the frame is
    /// out of order.
    pub fn append(&mut self, frame: TelemetryFrame) -> bool {
        if let Some(last) = self.frames.last() {
            if frame.session_time < last.session_time {
                return false;
            }
        } else if frame.session_time < self.start_tick {
            return false;
        }
        if frame.lap_invalidated {
            self.seen_invalid = true;
        }
        self.frames.push(frame);
        true
    }
}

/// A lap that has crossed the start/finish line but whose authoritative
/// timing has not yet been read (see the ~3s deferred-timing window).
#[derive(Debug, Clone)]
pub struct PendingCompletion {
    pub lap_number: i64,
    pub frames: Vec<TelemetryFrame>,
    pub start_tick: f64,
    pub seen_invalid: bool,
    pub started_on_pit_road: bool,
    pub ended_on_pit_road: bool,
    pub completion_time: f64,
}

/// An immutable, finalized lap record ready for persistence.
#[derive(Debug, Clone)]
pub struct FinalizedLap {
    pub lap_number: i64,
    pub state: LapState,
    pub start_tick: f64,
    pub end_tick: f64,
    pub duration_seconds: f64,
    pub frames: Vec<TelemetryFrame>,
    pub valid_from_source: bool,
    pub valid_for_leaderboard: bool,
    pub started_on_pit_road: bool,
    pub ended_on_pit_road: bool,
    pub sector_times: Option<Vec<f64>>,
    pub calculated_duration: f64,
}

impl FinalizedLap {
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Fraction of the [0.0, 1.0] track-distance range this lap's frames
    /// cover, computed over 100 buckets.
    pub fn track_coverage(&self) -> f32 {
        if self.frames.is_empty() {
            return 0.0;
        }
        let mut buckets = [false; 100];
        for frame in &self.frames {
            let pct = frame.lap_distance_pct.clamp(0.0, 0.999_999);
            let idx = (pct * 100.0) as usize;
            buckets[idx.min(99)] = true;
        }
        buckets.iter().filter(|b| **b).count() as f32 / 100.0
    }
}
