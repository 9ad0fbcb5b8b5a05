//! Bounded ring buffer of the most recent telemetry frames, used by the
//! indexer to recover the exact start/finish crossing when a lap
//! completion is detected.

use crate::frame::TelemetryFrame;
use std::collections::VecDeque;

/// Default capacity: ~2 seconds of frames at an expected 60 Hz feed.
pub const DEFAULT_CAPACITY: usize = 120;

/// Result of searching the ring for the optimal lap start.
pub struct RecoveredStart {
    /// Frames from the recovered crossing point through the triggering frame.
    pub frames: Vec<TelemetryFrame>,
    /// session-time of the recovered start.
    pub start_tick: f64,
}

pub struct FrameRing {
    capacity: usize,
    buf: VecDeque<TelemetryFrame>,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buf: VecDeque::with_capacity(capacity),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Append a frame, evicting the oldest if at capacity.
    pub fn push(&mut self, frame: TelemetryFrame) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Search backwards through the ring for the last clean start/finish
    /// crossing (distance > 0.9 immediately followed by distance < 0.1),
    /// treating the most recently pushed frame as the one that triggered
    /// completion detection. If no clean crossing is found, falls back to
    /// the frame nearest distance 0.0. The triggering frame must already
    /// have been pushed via [`Self::push`] before calling this.
    pub fn recover_start(&self) -> RecoveredStart {
        let frames: Vec<&TelemetryFrame> = self.buf.iter().collect();
        let current = match frames.last() {
            Some(f) => *f,
            None => {
                return RecoveredStart {
                    frames: Vec::new(),
                    start_tick: 0.0,
                }
            }
        };

        let mut crossing_idx: Option<usize> = None;
        let mut nearest_zero_idx = frames.len() - 1;
        let mut nearest_zero_dist = f32::INFINITY;

        for i in 0..frames.len() {
            let dist = frames[i].lap_distance_pct;
            if dist.abs() < nearest_zero_dist {
                nearest_zero_dist = dist.abs();
                nearest_zero_idx = i;
            }
            if i > 0 {
                let prev_dist = frames[i - 1].lap_distance_pct;
                if prev_dist > 0.9 && dist < 0.1 {
                    crossing_idx = Some(i);
                }
            }
        }

        let start_idx = crossing_idx.unwrap_or(nearest_zero_idx);
        let recovered: Vec<TelemetryFrame> =
            frames[start_idx..].iter().map(|f| (*f).clone()).collect();
        let start_tick = recovered
            .first()
            .map(|f| f.session_time)
            .unwrap_or(current.session_time);

        RecoveredStart {
            frames: recovered,
            start_tick,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(session_time: f64, dist: f32) -> TelemetryFrame {
        TelemetryFrame {
            session_time,
            laps_completed: 0,
            current_driving_lap: 1,
            lap_distance_pct: dist,
            per_car_last_lap_time: 0.0,
            global_last_lap_time: 0.0,
            lap_invalidated: false,
            on_pit_road: false,
            speed: 0.0,
            rpm: 0.0,
            gear: 0,
            throttle: 0.0,
            brake: 0.0,
            clutch: 0.0,
            steering: 0.0,
            lateral_accel: 0.0,
            longitudinal_accel: 0.0,
        }
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut ring = FrameRing::new(3);
        for i in 0..5 {
            ring.push(frame(i as f64, 0.5));
        }
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn finds_clean_crossing() {
        let mut ring = FrameRing::new(10);
        ring.push(frame(1.0, 0.5));
        ring.push(frame(2.0, 0.95));
        ring.push(frame(3.0, 0.02));
        ring.push(frame(4.0, 0.05));
        ring.push(frame(5.0, 0.08));
        let recovered = ring.recover_start();
        assert_eq!(recovered.start_tick, 3.0);
        assert_eq!(recovered.frames.len(), 3); // 3.0, 4.0, 5.0
    }

    #[test]
    fn falls_back_to_nearest_zero_when_no_crossing() {
        let mut ring = FrameRing::new(10);
        ring.push(frame(1.0, 0.5));
        ring.push(frame(2.0, 0.3));
        ring.push(frame(3.0, 0.1));
        ring.push(frame(4.0, 0.2));
        ring.push(frame(5.0, 0.25));
        let recovered = ring.recover_start();
        assert_eq!(recovered.start_tick, 3.0);
    }

    #[test]
    fn single_frame_ring_recovers_itself() {
        let mut ring = FrameRing::new(10);
        ring.push(frame(1.0, 0.0));
        let recovered = ring.recover_start();
        assert_eq!(recovered.frames.len(), 1);
        assert_eq!(recovered.start_tick, 1.0);
    }
}
