//! Lap Indexer: converts a stream of telemetry frames into a stream of
//! finalized lap records (spec §4.2).
//!
//! Single-threaded, cooperatively driven by [`LapIndexer::on_frame`].
//! Never blocks: finalized laps are handed to an injected sink closure,
//! whether that closure enqueues them for persistence or saves inline is
//! entirely the caller's choice (see Design Notes in SPEC_FULL.md §9).

pub mod classify;
pub mod timing;

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::frame::{FrameInput, TelemetryFrame};
use crate::frame_ring::{FrameRing, RecoveredStart};
use crate::lap::{ActiveLap, FinalizedLap, LapState, PendingCompletion};
use crate::rate_limit::RateLimiter;

/// Tunables for the indexer. Defaults match the values named in the spec.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Frame Ring capacity (≈2s at the expected frame rate).
    pub frame_ring_capacity: usize,
    /// Wall-clock delay before the per-car timing field is trusted.
    pub timing_delay_secs: f64,
    /// `laps-completed` gaps larger than this are a session anomaly,
    /// triggering reinitialization rather than reconstruction.
    pub session_anomaly_gap: i64,
    /// Minimum frames collected before a lap-number desync is forcibly
    /// corrected rather than just logged.
    pub desync_frame_threshold: usize,
    /// Minimum spacing between repeated rate-limited warnings.
    pub warning_interval: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            frame_ring_capacity: crate::frame_ring::DEFAULT_CAPACITY,
            timing_delay_secs: timing::DEFAULT_TIMING_DELAY_SECS,
            session_anomaly_gap: 10,
            desync_frame_threshold: 10,
            warning_interval: Duration::from_secs(5),
        }
    }
}

/// Sink a finalized lap is handed off to. Whether this enqueues for
/// async persistence or saves synchronously is the caller's business.
pub type LapSink = Box<dyn FnMut(FinalizedLap) + Send>;

/// In-memory diagnostic record of an emitted lap (not the full telemetry;
/// see spec §4.2.5 — the full record already went to the sink).
#[derive(Debug, Clone)]
pub struct LapDiagnostic {
    pub lap_number: i64,
    pub state: LapState,
    pub duration_seconds: f64,
    pub frame_count: usize,
}

pub struct LapIndexer {
    ring: FrameRing,
    active: Option<ActiveLap>,
    pending: Option<PendingCompletion>,
    last_laps_completed: Option<i64>,
    last_session_time: Option<f64>,
    config: IndexerConfig,
    warn_limiter: RateLimiter,
    sink: LapSink,
    diagnostics: Vec<LapDiagnostic>,
}

impl LapIndexer {
    pub fn new(config: IndexerConfig, sink: LapSink) -> Self {
        let warn_limiter = RateLimiter::new(config.warning_interval);
        Self {
            ring: FrameRing::new(config.frame_ring_capacity),
            active: None,
            pending: None,
            last_laps_completed: None,
            last_session_time: None,
            config,
            warn_limiter,
            sink,
            diagnostics: Vec::new(),
        }
    }

    pub fn with_default_config(sink: LapSink) -> Self {
        Self::new(IndexerConfig::default(), sink)
    }

    /// Diagnostic history of laps emitted this session (lightweight
    /// summaries, not full telemetry).
    pub fn diagnostics(&self) -> &[LapDiagnostic] {
        &self.diagnostics
    }

    pub fn has_active_lap(&self) -> bool {
        self.active.is_some()
    }

    pub fn has_pending_completion(&self) -> bool {
        self.pending.is_some()
    }

    /// Process one telemetry frame. Never blocks; at most does a bounded
    /// amount of Vec/HashMap work.
    pub fn on_frame(&mut self, input: FrameInput) {
        // Step 1: validate & extract.
        let frame = match TelemetryFrame::from_input(&input) {
            Ok(frame) => frame,
            Err(err) => {
                let now = self.last_session_time.unwrap_or(0.0);
                if self.warn_limiter.should_log(&err.to_string(), now) {
                    warn!("dropping frame: {err}");
                }
                return;
            }
        };

        // Out-of-order frame: drop silently.
        if let Some(last) = self.last_session_time {
            if frame.session_time < last {
                return;
            }
        }
        self.last_session_time = Some(frame.session_time);

        // Step 2: buffer the frame into the ring.
        self.ring.push(frame.clone());

        // Step 3: first-frame initialization.
        if self.last_laps_completed.is_none() {
            self.initialize_first_frame(&frame);
            self.last_laps_completed = Some(frame.laps_completed);
            return;
        }
        let prev_laps_completed = self.last_laps_completed.unwrap();

        // Step 4: session-reset detection.
        if frame.current_driving_lap == 0 && frame.laps_completed == 0 {
            if let Some(active) = &self.active {
                if active.lap_number > 0 {
                    info!("session reset detected, clearing indexer state");
                    self.active = None;
                    self.pending = None;
                    self.last_laps_completed = Some(frame.laps_completed);
                    return;
                }
            }
        }

        // Step 5: deferred timing resolution.
        if let Some(pending) = &self.pending {
            if frame.session_time - pending.completion_time >= self.config.timing_delay_secs {
                self.resolve_pending(&frame);
            }
        }

        // Step 6: boundary detection.
        let mut boundary_crossed = false;
        if frame.laps_completed > prev_laps_completed {
            boundary_crossed = true;
            let gap = frame.laps_completed - prev_laps_completed;
            if gap > self.config.session_anomaly_gap {
                warn!(
                    "lap-completed gap of {gap} exceeds anomaly threshold, reinitializing"
                );
                self.active = None;
                self.pending = None;
                self.initialize_first_frame(&frame);
                self.last_laps_completed = Some(frame.laps_completed);
                return;
            } else if gap == 1 {
                self.handle_single_increment(&frame);
            } else {
                self.handle_multi_increment(&frame, gap);
            }
        }

        // Step 7: append-to-active, only if no boundary was crossed.
        if !boundary_crossed {
            if let Some(active) = &mut self.active {
                active.append(frame.clone());
            }
        }

        // Step 8 (sticky invalid flag) is folded into append()/lap start.

        // Step 9: sync validation.
        self.validate_sync(&frame);

        self.last_laps_completed = Some(frame.laps_completed);
    }

    fn initialize_first_frame(&mut self, frame: &TelemetryFrame) {
        let lap_to_track = frame.laps_completed + 1;
        let mid_session_join = frame.laps_completed > 0;
        let joining_mid_lap = frame.lap_distance_pct > 0.1 || frame.on_pit_road;

        let (frames, start_tick) = if joining_mid_lap {
            (vec![frame.clone()], frame.session_time)
        } else {
            let recovered = self.ring.recover_start();
            if recovered.frames.len() <= 1 {
                (vec![frame.clone()], frame.session_time)
            } else {
                (recovered.frames, recovered.start_tick)
            }
        };

        let started_on_pit_road = frame.on_pit_road;
        let provisional = classify::provisional_classify(
            started_on_pit_road,
            lap_to_track,
            mid_session_join,
            frame.lap_distance_pct,
        );

        info!(
            lap_to_track,
            mid_session_join,
            "initializing lap indexer from first frame"
        );

        let mut active = ActiveLap::new(lap_to_track, start_tick, started_on_pit_road, provisional);
        for f in frames {
            if f.lap_invalidated {
                active.seen_invalid = true;
            }
            active.frames.push(f);
        }
        self.active = Some(active);
    }

    /// Normal single-lap-completion path: snapshot the active lap into a
    /// pending completion (timing resolved later), and immediately begin
    /// collecting the next lap so the frame thread never stalls.
    fn handle_single_increment(&mut self, frame: &TelemetryFrame) {
        let recovered = self.ring.recover_start();
        if let Some(mut active) = self.active.take() {
            Self::strip_transferred_tail(&mut active.frames, &recovered);
            debug!(lap_number = active.lap_number, "lap boundary detected, deferring timing");
            self.pending = Some(PendingCompletion {
                lap_number: active.lap_number,
                frames: active.frames,
                start_tick: active.start_tick,
                seen_invalid: active.seen_invalid,
                started_on_pit_road: active.started_on_pit_road,
                ended_on_pit_road: frame.on_pit_road,
                completion_time: frame.session_time,
            });
        }
        self.start_next_lap(frame, frame.current_driving_lap, recovered);
    }

    /// Recovery path for a missed boundary: finalize the lap immediately
    /// using the fallback timing source instead of waiting for the
    /// per-car reading.
    fn handle_multi_increment(&mut self, frame: &TelemetryFrame, gap: i64) {
        warn!(gap, "missed lap-completion increments, recovering");
        let recovered = self.ring.recover_start();
        if let Some(mut active) = self.active.take() {
            Self::strip_transferred_tail(&mut active.frames, &recovered);
            let calculated = frame.session_time - active.start_tick;
            let primary_raw = frame.global_last_lap_time;
            let selection = timing::select_duration(primary_raw, calculated);
            let state = classify::classify_lap(
                active.started_on_pit_road,
                false,
                primary_raw,
                active.lap_number,
            );
            let valid_for_leaderboard = classify::valid_for_leaderboard(state, active.seen_invalid);

            self.emit(FinalizedLap {
                lap_number: active.lap_number,
                state,
                start_tick: active.start_tick,
                end_tick: frame.session_time,
                duration_seconds: selection.duration,
                frames: active.frames,
                valid_from_source: !active.seen_invalid,
                valid_for_leaderboard,
                started_on_pit_road: active.started_on_pit_road,
                ended_on_pit_road: frame.on_pit_road,
                sector_times: None,
                calculated_duration: calculated,
            });
        }
        self.pending = None;
        self.start_next_lap(frame, frame.current_driving_lap, recovered);
    }

    /// Frames the Frame Ring recovers for the new lap were already
    /// appended to the old lap's frame list during their own earlier,
    /// boundary-free `on_frame` passes (the triggering frame, last in
    /// `recovered.frames`, is the only one not yet appended anywhere).
    /// Strip that shared tail so each frame ends up on exactly one lap
    /// (spec §4.1, I2) instead of being duplicated.
    fn strip_transferred_tail(frames: &mut Vec<TelemetryFrame>, recovered: &RecoveredStart) {
        if recovered.frames.len() <= 1 {
            return;
        }
        let transferred = recovered.frames.len() - 1;
        let keep = frames.len().saturating_sub(transferred);
        frames.truncate(keep);
    }

    fn start_next_lap(&mut self, frame: &TelemetryFrame, lap_number: i64, recovered: RecoveredStart) {
        let (frames, start_tick) = if recovered.frames.len() <= 1 {
            (vec![frame.clone()], frame.session_time)
        } else {
            (recovered.frames, recovered.start_tick)
        };

        let started_on_pit_road = frame.on_pit_road;
        let provisional =
            classify::provisional_classify(started_on_pit_road, lap_number, false, frame.lap_distance_pct);
        let mut active = ActiveLap::new(lap_number, start_tick, started_on_pit_road, provisional);
        for f in frames {
            if f.lap_invalidated {
                active.seen_invalid = true;
            }
            active.frames.push(f);
        }
        self.active = Some(active);
    }

    fn resolve_pending(&mut self, frame: &TelemetryFrame) {
        let pending = match self.pending.take() {
            Some(p) => p,
            None => return,
        };

        let calculated = pending.completion_time - pending.start_tick;
        let primary_raw = frame.per_car_last_lap_time;
        let selection = timing::select_duration(primary_raw, calculated);

        if matches!(selection.source, timing::TimingSource::Primary)
            && (selection.duration - calculated).abs() > timing::DISCREPANCY_LOG_THRESHOLD_SECS
        {
            debug!(
                lap_number = pending.lap_number,
                primary = selection.duration,
                calculated,
                "timing discrepancy between primary and calculated duration"
            );
        }

        let state = classify::classify_lap(
            pending.started_on_pit_road,
            false,
            primary_raw,
            pending.lap_number,
        );
        let valid_for_leaderboard = classify::valid_for_leaderboard(state, pending.seen_invalid);

        self.emit(FinalizedLap {
            lap_number: pending.lap_number,
            state,
            start_tick: pending.start_tick,
            end_tick: pending.completion_time,
            duration_seconds: selection.duration,
            frames: pending.frames,
            valid_from_source: !pending.seen_invalid,
            valid_for_leaderboard,
            started_on_pit_road: pending.started_on_pit_road,
            ended_on_pit_road: pending.ended_on_pit_road,
            sector_times: None,
            calculated_duration: calculated,
        });
    }

    fn validate_sync(&mut self, frame: &TelemetryFrame) {
        let Some(active) = &self.active else { return };
        if active.lap_number == frame.current_driving_lap {
            return;
        }

        let diff = (active.lap_number - frame.current_driving_lap).abs();
        let msg = format!(
            "lap desync: tracking {} but sim reports driving lap {}",
            active.lap_number, frame.current_driving_lap
        );
        if self.warn_limiter.should_log(&msg, frame.session_time) {
            warn!("{msg}");
        }

        if diff > 1 && active.frames.len() > self.config.desync_frame_threshold {
            warn!(
                "forcing lap-number correction: adopting sim driving lap {}",
                frame.current_driving_lap
            );
            if let Some(active) = &mut self.active {
                active.lap_number = frame.current_driving_lap;
            }
        }
    }

    fn emit(&mut self, lap: FinalizedLap) {
        info!(
            lap_number = lap.lap_number,
            state = lap.state.as_str(),
            duration = lap.duration_seconds,
            frames = lap.frames.len(),
            "lap finalized"
        );
        self.diagnostics.push(LapDiagnostic {
            lap_number: lap.lap_number,
            state: lap.state,
            duration_seconds: lap.duration_seconds,
            frame_count: lap.frames.len(),
        });
        (self.sink)(lap);
    }

    /// Called when the session ends: finalizes whatever lap is active or
    /// pending (always with calculated duration, since the primary
    /// timing field would be stale), then drains all indexer state.
    pub fn finalize_session(&mut self) {
        if let Some(pending) = self.pending.take() {
            let calculated = pending.completion_time - pending.start_tick;
            let state =
                classify::classify_lap(pending.started_on_pit_road, true, 0.0, pending.lap_number);
            let valid_for_leaderboard = classify::valid_for_leaderboard(state, pending.seen_invalid);
            self.emit(FinalizedLap {
                lap_number: pending.lap_number,
                state,
                start_tick: pending.start_tick,
                end_tick: pending.completion_time,
                duration_seconds: calculated,
                frames: pending.frames,
                valid_from_source: !pending.seen_invalid,
                valid_for_leaderboard,
                started_on_pit_road: pending.started_on_pit_road,
                ended_on_pit_road: pending.ended_on_pit_road,
                sector_times: None,
                calculated_duration: calculated,
            });
        }

        if let Some(active) = self.active.take() {
            let end_tick = active
                .frames
                .last()
                .map(|f| f.session_time)
                .unwrap_or(active.start_tick);
            let calculated = end_tick - active.start_tick;
            let state =
                classify::classify_lap(active.started_on_pit_road, true, 0.0, active.lap_number);
            let valid_for_leaderboard = classify::valid_for_leaderboard(state, active.seen_invalid);
            self.emit(FinalizedLap {
                lap_number: active.lap_number,
                state,
                start_tick: active.start_tick,
                end_tick,
                duration_seconds: calculated,
                frames: active.frames,
                valid_from_source: !active.seen_invalid,
                valid_for_leaderboard,
                started_on_pit_road: active.started_on_pit_road,
                ended_on_pit_road: false,
                sector_times: None,
                calculated_duration: calculated,
            });
        }

        self.last_laps_completed = None;
        self.last_session_time = None;
    }
}
