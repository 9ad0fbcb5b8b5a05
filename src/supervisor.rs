//! Supervisor: retry ceiling, sequence-gap tracking, and worker health
//! monitoring for the Lap Saver (spec §4.6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::save_queue::SaveQueue;
use crate::saver::{SaveOutcome, SaverError};

/// Default lap-abandonment ceiling, used when no `Config` is threaded in.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
/// Default worker-restart ceiling before permanently switching to
/// direct-save.
pub const DEFAULT_MAX_WORKER_RESTARTS: u32 = 3;
/// Default health-probe cadence.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);
const QUEUE_SIZE_UNHEALTHY_THRESHOLD: usize = 20;
const ACTIVITY_STALE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Bounded per-lap attempt counter (spec §3 `RetryState`). Entries are
/// removed on success or once the ceiling is reached, so this never grows
/// with session length.
#[derive(Default)]
struct RetryState {
    attempts: HashMap<i64, u32>,
    permanently_failed: std::collections::HashSet<i64>,
}

impl RetryState {
    /// Record a failed attempt. Returns `true` if the caller may retry,
    /// `false` if `ceiling` was just reached (circuit open).
    fn record_failure(&mut self, lap_number: i64, ceiling: u32) -> bool {
        let count = self.attempts.entry(lap_number).or_insert(0);
        *count += 1;
        if *count >= ceiling {
            self.permanently_failed.insert(lap_number);
            self.attempts.remove(&lap_number);
            false
        } else {
            true
        }
    }

    fn record_success(&mut self, lap_number: i64) {
        self.attempts.remove(&lap_number);
        self.permanently_failed.remove(&lap_number);
    }

    fn is_permanently_failed(&self, lap_number: i64) -> bool {
        self.permanently_failed.contains(&lap_number)
    }
}

/// Cheap-to-clone reporting snapshot (spec §4.6 "Reporting").
#[derive(Debug, Clone, Default)]
pub struct SupervisorSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub pending: usize,
    pub sequence_gaps: Vec<(i64, i64)>,
    pub restarts: u32,
    pub direct_save_active: bool,
}

struct SupervisorState {
    expected_next_lap: Option<i64>,
    processed: u64,
    failed: u64,
    sequence_gaps: Vec<(i64, i64)>,
    retry: RetryState,
}

/// Tracks worker liveness signals the health probe reads. Updated by the
/// Lap Saver worker loop after every lap it processes.
pub struct WorkerHealth {
    last_activity: AtomicU64,
    consecutive_failures: AtomicU32,
    started_at: Instant,
}

impl WorkerHealth {
    pub fn new() -> Self {
        Self {
            last_activity: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn mark_activity(&self) {
        let elapsed = self.started_at.elapsed().as_secs();
        self.last_activity.store(elapsed, Ordering::SeqCst);
    }

    pub fn mark_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.mark_activity();
    }

    pub fn mark_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        self.mark_activity();
    }

    pub fn is_self_unhealthy(&self) -> bool {
        self.consecutive_failures.load(Ordering::SeqCst) >= 3
    }

    pub fn seconds_since_activity(&self) -> u64 {
        self.started_at.elapsed().as_secs().saturating_sub(self.last_activity.load(Ordering::SeqCst))
    }
}

impl Default for WorkerHealth {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Supervisor {
    state: RwLock<SupervisorState>,
    restarts: AtomicU32,
    direct_save_active: std::sync::atomic::AtomicBool,
    max_retry_attempts: u32,
    max_worker_restarts: u32,
}

impl Supervisor {
    /// `max_retry_attempts` and `max_worker_restarts` come from `Config`
    /// (spec §4.6); see `DEFAULT_MAX_RETRY_ATTEMPTS`/`DEFAULT_MAX_WORKER_RESTARTS`
    /// for the values used when no override is configured.
    pub fn new(max_retry_attempts: u32, max_worker_restarts: u32) -> Self {
        Self {
            state: RwLock::new(SupervisorState {
                expected_next_lap: None,
                processed: 0,
                failed: 0,
                sequence_gaps: Vec::new(),
                retry: RetryState::default(),
            }),
            restarts: AtomicU32::new(0),
            direct_save_active: std::sync::atomic::AtomicBool::new(false),
            max_retry_attempts,
            max_worker_restarts,
        }
    }

    pub fn direct_save_active(&self) -> bool {
        self.direct_save_active.load(Ordering::SeqCst)
    }

    /// Whether this lap-number may still be attempted.
    pub fn should_attempt(&self, lap_number: i64) -> bool {
        !self.state.read().unwrap().retry.is_permanently_failed(lap_number)
    }

    /// Record the result of a save attempt, updating sequence tracking
    /// and the retry ceiling. Returns `true` if a retry should be
    /// scheduled by the caller.
    pub fn record_result(&self, lap_number: i64, result: &Result<SaveOutcome, SaverError>) -> bool {
        let mut state = self.state.write().unwrap();
        match result {
            Ok(SaveOutcome::Saved { .. }) | Ok(SaveOutcome::Duplicate) => {
                state.retry.record_success(lap_number);
                state.processed += 1;
                self.track_sequence(&mut state, lap_number);
                false
            }
            Ok(SaveOutcome::QueuedPendingSession) | Ok(SaveOutcome::DiskFallback) => {
                state.retry.record_success(lap_number);
                false
            }
            Err(err) => {
                let transient = matches!(err, SaverError::Database(db) if db.is_transient());
                if !transient {
                    state.retry.record_success(lap_number);
                    state.failed += 1;
                    return false;
                }
                let may_retry = state.retry.record_failure(lap_number, self.max_retry_attempts);
                if !may_retry {
                    state.failed += 1;
                    warn!(lap_number, "lap save permanently failed after {} attempts", self.max_retry_attempts);
                }
                may_retry
            }
        }
    }

    fn track_sequence(&self, state: &mut SupervisorState, lap_number: i64) {
        match state.expected_next_lap {
            None => state.expected_next_lap = Some(lap_number + 1),
            Some(expected) if lap_number > expected => {
                state.sequence_gaps.push((expected, lap_number - 1));
                state.expected_next_lap = Some(lap_number + 1);
            }
            _ => state.expected_next_lap = Some(lap_number + 1),
        }
    }

    pub fn snapshot(&self, pending: usize) -> SupervisorSnapshot {
        let state = self.state.read().unwrap();
        SupervisorSnapshot {
            processed: state.processed,
            failed: state.failed,
            pending,
            sequence_gaps: state.sequence_gaps.clone(),
            restarts: self.restarts.load(Ordering::SeqCst),
            direct_save_active: self.direct_save_active(),
        }
    }

    /// Periodic health probe (spec §4.6 "Worker health"). Runs until
    /// `cancel` fires. On an unhealthy reading, increments the restart
    /// counter via `on_restart`; after `max_worker_restarts`, permanently
    /// flips to direct-save mode.
    pub async fn run_health_probe(
        self: Arc<Self>,
        queue: SaveQueue,
        worker_health: Arc<WorkerHealth>,
        mut on_restart: impl FnMut(),
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if self.direct_save_active() {
                        continue;
                    }
                    let unhealthy = worker_health.is_self_unhealthy()
                        || queue.pending_len() >= QUEUE_SIZE_UNHEALTHY_THRESHOLD
                        || worker_health.seconds_since_activity() >= ACTIVITY_STALE_THRESHOLD.as_secs();

                    if unhealthy {
                        let restarts = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
                        warn!(restarts, "lap saver worker unhealthy, restarting");
                        on_restart();
                        if restarts >= self.max_worker_restarts {
                            warn!("worker restart ceiling reached, switching to direct-save permanently");
                            self.direct_save_active.store(true, Ordering::SeqCst);
                        }
                    } else {
                        info!("lap saver worker healthy");
                    }
                }
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRY_ATTEMPTS, DEFAULT_MAX_WORKER_RESTARTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbError;
    use uuid::Uuid;

    fn saved() -> Result<SaveOutcome, SaverError> {
        Ok(SaveOutcome::Saved { lap_id: Uuid::new_v4(), is_personal_best: false })
    }

    fn transient_err() -> Result<SaveOutcome, SaverError> {
        Err(SaverError::Database(DbError::Connection("down".into())))
    }

    #[test]
    fn third_consecutive_failure_opens_circuit() {
        let sup = Supervisor::default();
        assert!(sup.record_result(5, &transient_err()));
        assert!(sup.record_result(5, &transient_err()));
        assert!(!sup.record_result(5, &transient_err()));
        assert!(!sup.should_attempt(5));
    }

    #[test]
    fn success_resets_retry_state() {
        let sup = Supervisor::default();
        sup.record_result(5, &transient_err());
        sup.record_result(5, &saved());
        assert!(sup.should_attempt(5));
    }

    #[test]
    fn sequence_gap_is_recorded_and_expected_advances() {
        let sup = Supervisor::default();
        sup.record_result(1, &saved());
        sup.record_result(4, &saved());
        let snap = sup.snapshot(0);
        assert_eq!(snap.sequence_gaps, vec![(2, 3)]);
        assert_eq!(snap.processed, 2);
    }

    #[test]
    fn non_transient_error_does_not_retry() {
        let sup = Supervisor::default();
        let err: Result<SaveOutcome, SaverError> =
            Err(SaverError::Database(DbError::UniqueViolation { constraint: "x".into() }));
        assert!(!sup.record_result(1, &err));
        assert_eq!(sup.snapshot(0).failed, 1);
    }

    #[tokio::test]
    async fn health_probe_restarts_on_unhealthy_worker_then_switches_to_direct_save() {
        let sup = Arc::new(Supervisor::default());
        let (queue, _rx) = SaveQueue::new(10);
        let health = Arc::new(WorkerHealth::new());
        health.mark_failure();
        health.mark_failure();
        health.mark_failure();

        let cancel = CancellationToken::new();
        let mut restart_count = 0;
        let probe_cancel = cancel.clone();

        tokio::time::pause();
        let sup_clone = sup.clone();
        let handle = tokio::spawn(async move {
            sup_clone
                .run_health_probe(queue, health, || restart_count += 1, Duration::from_millis(10), probe_cancel)
                .await;
        });

        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::time::advance(Duration::from_millis(50)).await;
        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_millis(100), handle).await;

        assert!(sup.direct_save_active());
        assert!(sup.snapshot(0).restarts >= DEFAULT_MAX_WORKER_RESTARTS);
    }
}
