//! Lap indexing and durable persistence core for sim-racing telemetry.
//!
//! [`LapPipeline`] is the facade a host application wires up: feed it
//! frames via [`LapPipeline::on_frame`], give it a session via
//! [`LapPipeline::set_session_context`], and it takes care of boundary
//! detection, classification, queued persistence, retries, and
//! disk-fallback recovery.

pub mod auth;
pub mod config;
pub mod db;
pub mod frame;
pub mod frame_ring;
pub mod indexer;
pub mod lap;
pub mod rate_limit;
pub mod save_queue;
pub mod saver;
pub mod sector_buffer;
pub mod session;
pub mod supervisor;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use auth::CurrentUserProvider;
use config::Config;
use db::DatabaseClient;
use frame::FrameInput;
use indexer::LapIndexer;
use lap::FinalizedLap;
use save_queue::SaveQueue;
use saver::LapSaver;
use sector_buffer::{SectorBuffer, SectorEntry};
use session::SessionContext;
use supervisor::{Supervisor, WorkerHealth};

/// Bound on how long `shutdown`/`clear_session_context` wait for the Save
/// Queue to drain before cancelling workers; anything still queued past
/// this falls back to disk (spec §4.7).
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wires the Lap Indexer, Save Queue, Lap Saver, and Supervisor together,
/// following the facade/spawn/`CancellationToken` shape of the teacher's
/// `RacingCoachApp`.
pub struct LapPipeline {
    indexer: StdMutex<LapIndexer>,
    queue: SaveQueue,
    session: Arc<RwLock<Option<SessionContext>>>,
    sector_buffer: Arc<StdMutex<SectorBuffer>>,
    auth: Arc<dyn CurrentUserProvider>,
    saver: Arc<LapSaver>,
    supervisor: Arc<Supervisor>,
    worker_health: Arc<WorkerHealth>,
    cancel: CancellationToken,
}

impl LapPipeline {
    /// Build a pipeline from a resolved [`Config`] and the host's
    /// injected collaborators. Spawns the persistence worker and health
    /// probe tasks; call [`LapPipeline::shutdown`] to stop them.
    pub fn new(
        config: &Config,
        db: Arc<dyn DatabaseClient>,
        auth: Arc<dyn CurrentUserProvider>,
    ) -> (Self, tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let session: Arc<RwLock<Option<SessionContext>>> = Arc::new(RwLock::new(None));
        let sector_buffer = Arc::new(StdMutex::new(SectorBuffer::new()));
        let (queue, mut receiver) = SaveQueue::new(config.save_queue_capacity);

        let saver = Arc::new(LapSaver::new(
            db,
            auth.clone(),
            session.clone(),
            sector_buffer.clone(),
            config.saver_config(),
        ));
        let supervisor = Arc::new(Supervisor::new(config.max_retry_attempts, config.max_worker_restarts));
        let worker_health = Arc::new(WorkerHealth::new());

        let cancel = CancellationToken::new();

        // The sink runs synchronously inside `on_frame`, so it only ever
        // enqueues or kicks off a detached direct-save task; it never
        // awaits anything itself.
        let sink_queue = queue.clone();
        let sink_supervisor = supervisor.clone();
        let sink_saver = saver.clone();
        let indexer = LapIndexer::new(
            config.indexer_config(),
            Box::new(move |lap: FinalizedLap| {
                Self::dispatch(&sink_queue, &sink_supervisor, &sink_saver, lap);
            }),
        );

        let worker_handle = {
            let saver = saver.clone();
            let supervisor = supervisor.clone();
            let worker_health = worker_health.clone();
            let queue_for_retry = queue.clone();
            let session_for_drain = session.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let remaining = receiver.drain();
                            if !remaining.is_empty() {
                                let ctx = session_for_drain.read().await.clone();
                                for lap in remaining {
                                    match &ctx {
                                        Some(ctx) => saver.fall_back_to_disk(ctx, &lap, "shutdown drain timeout"),
                                        None => warn!(
                                            lap_number = lap.lap_number,
                                            "dropping queued lap at shutdown, no session to fall back against"
                                        ),
                                    }
                                }
                            }
                            return;
                        }
                        lap = receiver.recv() => {
                            let Some(lap) = lap else { return };
                            Self::process_one(&saver, &supervisor, &worker_health, &queue_for_retry, lap).await;
                        }
                    }
                }
            })
        };

        let probe_handle = {
            let supervisor = supervisor.clone();
            let worker_health = worker_health.clone();
            let queue = queue.clone();
            let cancel = cancel.clone();
            let interval = config.health_probe_interval;
            tokio::spawn(async move {
                supervisor
                    .run_health_probe(queue, worker_health, || {}, interval, cancel)
                    .await;
            })
        };

        let pipeline = Self {
            indexer: StdMutex::new(indexer),
            queue,
            session,
            sector_buffer,
            auth,
            saver,
            supervisor,
            worker_health,
            cancel,
        };

        (pipeline, worker_handle, probe_handle)
    }

    async fn process_one(
        saver: &Arc<LapSaver>,
        supervisor: &Arc<Supervisor>,
        worker_health: &Arc<WorkerHealth>,
        queue: &SaveQueue,
        lap: FinalizedLap,
    ) {
        if !supervisor.should_attempt(lap.lap_number) {
            warn!(lap_number = lap.lap_number, "skipping permanently failed lap");
            return;
        }

        let result = saver.save_lap(&lap).await;
        match &result {
            Ok(outcome) => {
                worker_health.mark_success();
                info!(lap_number = lap.lap_number, ?outcome, "lap save attempt complete");
            }
            Err(err) => {
                worker_health.mark_failure();
                error!(lap_number = lap.lap_number, error = %err, "lap save attempt failed");
            }
        }

        let should_retry = supervisor.record_result(lap.lap_number, &result);
        if should_retry {
            if queue.try_enqueue(lap).is_err() {
                warn!("retry enqueue failed, queue full or closed");
            }
        }
    }

    /// Feed one telemetry frame through the indexer. Finalized laps are
    /// handed to the save queue by the indexer's sink closure; if the
    /// queue is full (catastrophic lag) or direct-save mode has been
    /// activated, the lap is saved via a detached task instead (spec
    /// §4.4 direct-save fallback).
    pub fn on_frame(&self, input: FrameInput) {
        self.indexer.lock().unwrap().on_frame(input);
    }

    /// Route a finalized lap to the save queue, or straight to a
    /// detached direct-save task when the queue is full or direct-save
    /// mode is active. Free function (not a method) so it can be
    /// captured by the indexer's sink closure before `Self` exists.
    fn dispatch(queue: &SaveQueue, supervisor: &Arc<Supervisor>, saver: &Arc<LapSaver>, lap: FinalizedLap) {
        if supervisor.direct_save_active() {
            Self::direct_save(saver, lap);
            return;
        }
        if let Err(lap) = queue.try_enqueue(lap) {
            warn!(lap_number = lap.lap_number, "save queue full, falling back to direct save");
            Self::direct_save(saver, lap);
        }
    }

    fn direct_save(saver: &Arc<LapSaver>, lap: FinalizedLap) {
        let saver = saver.clone();
        tokio::spawn(async move {
            if let Err(err) = saver.save_lap(&lap).await {
                error!(lap_number = lap.lap_number, error = %err, "direct save failed");
            }
        });
    }

    /// Set the active session. Laps finalized before this is called are
    /// queued pending session (spec §4.5.1).
    pub async fn set_session_context(&self, ctx: SessionContext) {
        let mut guard = self.session.write().await;
        *guard = Some(ctx);
    }

    /// Tear down the active session (spec §4.7): finalize whatever lap is
    /// in progress, give the Save Queue up to [`SESSION_DRAIN_TIMEOUT`] to
    /// drain, then clear the session. Anything still queued past the
    /// timeout is handed to disk fallback once the worker observes the
    /// eventual `shutdown`/cancellation, not here — this method only
    /// clears the session host-side.
    pub async fn clear_session_context(&self) {
        self.finalize_session();
        self.wait_for_queue_drain().await;
        let mut guard = self.session.write().await;
        *guard = None;
    }

    pub fn push_sector_data(&self, entry: SectorEntry) {
        self.sector_buffer.lock().unwrap().push(entry);
    }

    /// Flush any in-progress lap at session end (spec §4.2.5).
    pub fn finalize_session(&self) {
        let mut indexer = self.indexer.lock().unwrap();
        indexer.finalize_session();
    }

    /// Authenticate the current user (spec §6.1 inbound `set_user_id`),
    /// reaching through to whatever `CurrentUserProvider` the host
    /// injected at construction.
    pub fn set_user_id(&self, user_id: Uuid) {
        self.auth.set_user_id(user_id);
    }

    pub fn supervisor_snapshot(&self) -> supervisor::SupervisorSnapshot {
        self.supervisor.snapshot(self.queue.pending_len())
    }

    /// Poll the Save Queue until it drains or [`SESSION_DRAIN_TIMEOUT`]
    /// elapses, whichever comes first.
    async fn wait_for_queue_drain(&self) {
        let deadline = tokio::time::Instant::now() + SESSION_DRAIN_TIMEOUT;
        while self.queue.pending_len() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    pending = self.queue.pending_len(),
                    "save queue did not drain within timeout, remaining laps will fall back to disk on shutdown"
                );
                return;
            }
            tokio::time::sleep(SESSION_DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Finalize the session, drain the Save Queue (bounded, spec §4.7),
    /// and stop the worker and health-probe tasks (spec §6.1). The caller
    /// is responsible for awaiting the `JoinHandle`s returned by
    /// [`LapPipeline::new`] if it wants to observe the workers' own
    /// drain-to-disk-fallback of anything still queued at the timeout.
    pub async fn shutdown(&self) {
        self.finalize_session();
        self.wait_for_queue_drain().await;
        self.cancel.cancel();
    }
}

/// Convenience re-export used by hosts that only need the auth seam.
pub fn new_static_user_id(id: Uuid) -> Arc<auth::StaticUserProvider> {
    let provider = Arc::new(auth::StaticUserProvider::new());
    provider.set_user_id(id);
    provider
}
