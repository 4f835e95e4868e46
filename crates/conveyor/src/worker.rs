//! The worker loop.
//!
//! Each iteration: sweep stale state, claim one job, gate on the attempt
//! budget, take the run lease, flip the handoff to in-progress, execute
//! the phase under a heartbeat, ack, enqueue the next phase, release.
//! The ack strictly precedes the enqueue: the queue store does not
//! enforce at-most-one-live-job-per-run itself, and a recovered job that
//! had already enqueued its successor would enqueue it again on
//! reprocessing. Workers are internally single-threaded for the critical
//! path; many workers cooperate purely through the queue store's
//! transactions.

use crate::executor::ExecutorSet;
use crate::phases::{self, PhaseCtx, PhaseError};
use crate::queue::{QueueError, QueueStore};
use crate::workspace::WorkspaceProvider;
use conveyor_core::artifacts::ArtifactKind;
use conveyor_core::{Config, Handoff, HandoffUpdate, Id, Job, Phase, RunStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Message recorded on jobs that exhausted their claim budget.
pub const MAX_ATTEMPTS_ERROR: &str = "Max attempts exceeded.";

/// What one worker iteration did. Mostly useful for tests and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Nothing queued.
    Idle,
    /// Claimed, executed, acked.
    Processed,
    /// Another worker holds the run; the job went back to the queue.
    LeaseDenied,
    /// The claim pushed the job past the attempt budget.
    AttemptsExhausted,
    /// The phase raised; the job is marked failed.
    Failed,
    /// A transient store or filesystem fault; the job went back to the
    /// queue untouched otherwise.
    TransientError,
}

pub struct Worker {
    config: Config,
    store: Arc<QueueStore>,
    executors: Arc<dyn ExecutorSet>,
    workspaces: Arc<dyn WorkspaceProvider>,
    /// Stable worker identity for lease ownership.
    owner: Id,
    shutdown: AtomicBool,
}

impl Worker {
    pub fn new(
        config: Config,
        store: Arc<QueueStore>,
        executors: Arc<dyn ExecutorSet>,
        workspaces: Arc<dyn WorkspaceProvider>,
    ) -> Self {
        Self {
            config,
            store,
            executors,
            workspaces,
            owner: Id::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn owner(&self) -> &Id {
        &self.owner
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run until shutdown. Transient store errors make the iteration a
    /// no-op followed by a poll sleep.
    pub async fn run(&self) {
        info!(owner = %self.owner, root = %self.config.root.display(), "worker started");

        while !self.is_shutdown() {
            match self.tick().await {
                Ok(Tick::Idle) | Ok(Tick::TransientError) => {
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
                Ok(Tick::LeaseDenied) => {
                    tokio::time::sleep(self.config.requeue_sleep()).await;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "worker iteration failed");
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
            }
        }

        info!(owner = %self.owner, "worker stopped");
    }

    /// One full iteration of the worker cycle.
    pub async fn tick(&self) -> Result<Tick, QueueError> {
        let report = self.store.recover_stale().await?;
        if report.did_work() {
            warn!(
                requeued_jobs = report.requeued_jobs,
                released_leases = report.released_leases,
                "recovered stale state"
            );
        }

        let Some(job) = self.store.claim_one().await? else {
            return Ok(Tick::Idle);
        };

        if job.attempt > self.config.max_attempts {
            warn!(job_id = job.id, run_id = %job.run_id, attempt = job.attempt,
                "attempt budget exhausted");
            self.store.mark_failed(job.id, MAX_ATTEMPTS_ERROR).await?;
            return Ok(Tick::AttemptsExhausted);
        }

        if !self.store.acquire_lease(&job.run_id, &self.owner).await? {
            debug!(job_id = job.id, run_id = %job.run_id, "lease denied; requeueing");
            self.store.requeue(job.id).await?;
            return Ok(Tick::LeaseDenied);
        }

        info!(job_id = job.id, run_id = %job.run_id, phase = job.phase.as_str(),
            attempt = job.attempt, "job claimed");

        let heartbeat = self.spawn_heartbeat(job.id, job.run_id.clone());
        let result = self.process_job(&job).await;
        heartbeat.abort();

        let tick = match result {
            Ok(next) => {
                // Ack first: a job recovered before this point has not
                // enqueued its successor, so reprocessing it cannot
                // produce a duplicate (run, phase) row.
                self.store.mark_done(job.id).await?;
                if let Some(next_phase) = next {
                    self.store.enqueue(&job.run_id, next_phase).await?;
                }
                info!(job_id = job.id, run_id = %job.run_id, "job done");
                Tick::Processed
            }
            Err(error) if error.is_transient() => {
                // Transport fault: not a verdict on the job. Leave the
                // handoff alone, return the job to the queue, and let
                // the loop sleep before retrying.
                warn!(job_id = job.id, run_id = %job.run_id, error = %error,
                    "transient error; requeueing job");
                self.store.requeue(job.id).await?;
                Tick::TransientError
            }
            Err(error) => {
                self.record_failure(&job, &error).await?;
                Tick::Failed
            }
        };

        if let Err(e) = self.store.release_lease(&job.run_id, &self.owner).await {
            warn!(run_id = %job.run_id, error = %e, "failed to release lease");
        }

        Ok(tick)
    }

    /// Execute one phase: flip the handoff to in-progress and dispatch.
    /// Returns the next phase for the caller to enqueue once the current
    /// job is acked.
    async fn process_job(&self, job: &Job) -> Result<Option<Phase>, PhaseError> {
        let run_dir = self.config.run_dir(&job.run_id);

        let mut handoff = Handoff::load(&run_dir)?;
        if handoff.is_cancelled() {
            return Err(PhaseError::Cancelled);
        }
        handoff.state.phase = job.phase;
        handoff.state.status = RunStatus::InProgress;
        handoff.save(&run_dir)?;

        let ctx = PhaseCtx {
            config: &self.config,
            run_id: &job.run_id,
            run_dir,
            executors: self.executors.as_ref(),
            workspaces: self.workspaces.as_ref(),
        };

        phases::dispatch(&ctx, job.phase).await
    }

    /// Mark the job failed; for validation/executor errors also mark the
    /// run failed in the handoff. Cancellations must not overwrite the
    /// cancelled handoff, and semantic failures already wrote theirs.
    /// Transient transport faults never reach here (the tick requeues
    /// them instead).
    async fn record_failure(&self, job: &Job, error: &PhaseError) -> Result<(), QueueError> {
        let message = error.to_string();
        warn!(job_id = job.id, run_id = %job.run_id, phase = job.phase.as_str(),
            error = %message, "job failed");
        self.store.mark_failed(job.id, &message).await?;

        if matches!(error, PhaseError::Cancelled | PhaseError::RunFailed(_)) {
            return Ok(());
        }

        let run_dir = self.config.run_dir(&job.run_id);
        match Handoff::load(&run_dir) {
            Ok(handoff) if !handoff.is_cancelled() => {
                let artifact = ArtifactKind::for_phase(job.phase).error_filename();
                let handoff = handoff.apply(
                    HandoffUpdate::new(job.phase, RunStatus::Failed, artifact)
                        .with_note(message),
                );
                if let Err(e) = handoff.save(&run_dir) {
                    warn!(run_id = %job.run_id, error = %e, "failed to persist run failure");
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(run_id = %job.run_id, error = %e, "no handoff to record failure on");
            }
        }
        Ok(())
    }

    /// Background heartbeat: touch the job row and the lease so neither
    /// goes stale while the phase runs. Aborted when the job settles.
    fn spawn_heartbeat(&self, job_id: i64, run_id: Id) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let owner = self.owner.clone();
        let interval = self.config.heartbeat_interval();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = store.touch(job_id).await {
                    debug!(job_id, error = %e, "job heartbeat failed");
                }
                if let Err(e) = store.touch_lease(&run_id, &owner).await {
                    debug!(%run_id, error = %e, "lease heartbeat failed");
                }
                debug!(job_id, %run_id, "heartbeat");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{
        ExecutorError, ImplementRequest, PlanRequest, ReviewRequest, StepOutput, TestRequest,
    };
    use crate::submit::{self, SubmitRequest};
    use crate::workspace::{WorkspaceError, WorkspaceInfo};
    use async_trait::async_trait;
    use conveyor_core::artifacts::{PlanArtifact, ReviewArtifact, TestArtifact};
    use conveyor_core::{JobStatus, Phase};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Executors that only know how to plan (enough for worker-level
    /// tests; full pipelines live in the integration suite).
    struct PlanOnlyExecutors;

    #[async_trait]
    impl ExecutorSet for PlanOnlyExecutors {
        async fn plan(&self, _req: PlanRequest) -> crate::executor::Result<PlanArtifact> {
            Ok(PlanArtifact::default())
        }

        async fn implement_step(
            &self,
            _req: ImplementRequest,
        ) -> crate::executor::Result<StepOutput> {
            Err(ExecutorError::NonOk {
                phase: "implementor",
                message: "not scripted".to_string(),
            })
        }

        async fn review(&self, _req: ReviewRequest) -> crate::executor::Result<ReviewArtifact> {
            Err(ExecutorError::NonOk {
                phase: "reviewer",
                message: "not scripted".to_string(),
            })
        }

        async fn test(&self, _req: TestRequest) -> crate::executor::Result<TestArtifact> {
            Err(ExecutorError::NonOk {
                phase: "tester",
                message: "not scripted".to_string(),
            })
        }
    }

    /// Workspace provider that fabricates a directory without git.
    struct DirWorkspaces {
        root: PathBuf,
    }

    #[async_trait]
    impl crate::workspace::WorkspaceProvider for DirWorkspaces {
        async fn prepare(
            &self,
            run_id: &Id,
            _url: &str,
            base_branch: Option<&str>,
            _task_prompt: &str,
        ) -> Result<WorkspaceInfo, WorkspaceError> {
            let root = self.root.join(run_id.as_ref());
            std::fs::create_dir_all(&root)?;
            Ok(WorkspaceInfo {
                root,
                branch: "conveyor/test".to_string(),
                base_branch: base_branch.unwrap_or("main").to_string(),
            })
        }

        async fn remove(&self, root: &Path) -> Result<(), WorkspaceError> {
            if root.exists() {
                std::fs::remove_dir_all(root)?;
            }
            Ok(())
        }
    }

    struct Fixture {
        worker: Worker,
        store: Arc<QueueStore>,
        config: Config,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.root = dir.path().to_path_buf();

        let store = Arc::new(
            QueueStore::new(&config.db_path(), config.lease_timeout())
                .await
                .unwrap(),
        );
        store.migrate_embedded().await.unwrap();

        let worker = Worker::new(
            config.clone(),
            Arc::clone(&store),
            Arc::new(PlanOnlyExecutors),
            Arc::new(DirWorkspaces {
                root: config.workspaces_dir(),
            }),
        );

        Fixture {
            worker,
            store,
            config,
            _dir: dir,
        }
    }

    async fn submit_run(f: &Fixture) -> Id {
        submit::submit(
            &f.config,
            &f.store,
            SubmitRequest {
                task: "hello".to_string(),
                repo_url: "https://example/x.git".to_string(),
                keep_workspace: false,
                base_branch: None,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn empty_queue_is_idle() {
        let f = fixture().await;
        assert_eq!(f.worker.tick().await.unwrap(), Tick::Idle);
    }

    #[tokio::test]
    async fn plan_tick_processes_and_enqueues_implement() {
        let f = fixture().await;
        let run_id = submit_run(&f).await;

        assert_eq!(f.worker.tick().await.unwrap(), Tick::Processed);

        let jobs = f.store.list_jobs(&run_id).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].phase, Phase::Plan);
        assert_eq!(jobs[0].status, JobStatus::Done);
        assert_eq!(jobs[0].attempt, 1);
        assert_eq!(jobs[1].phase, Phase::Implement);
        assert_eq!(jobs[1].status, JobStatus::Queued);

        let handoff = Handoff::load(&f.config.run_dir(&run_id)).unwrap();
        assert_eq!(handoff.state.phase, Phase::Plan);
        assert_eq!(handoff.state.status, RunStatus::Completed);
        assert_eq!(handoff.state.history.len(), 1);
        assert!(!handoff.run.repo.root.is_empty());
        // The empty plan requires no tests.
        assert_eq!(
            handoff
                .constraints
                .unwrap()
                .require_tests_for_behavior_change,
            Some(false)
        );

        // The lease is released once the job settles.
        assert_eq!(f.store.stats().await.unwrap().lease_count, 0);
    }

    #[tokio::test]
    async fn lease_denied_requeues_job() {
        let f = fixture().await;
        let run_id = submit_run(&f).await;

        let other = Id::new();
        assert!(f.store.acquire_lease(&run_id, &other).await.unwrap());

        assert_eq!(f.worker.tick().await.unwrap(), Tick::LeaseDenied);

        let jobs = f.store.list_jobs(&run_id).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Queued);
        assert_eq!(jobs[0].attempt, 1);

        // Holder releases; the next tick gets through.
        f.store.release_lease(&run_id, &other).await.unwrap();
        assert_eq!(f.worker.tick().await.unwrap(), Tick::Processed);
    }

    #[tokio::test]
    async fn fourth_claim_fails_the_job() {
        let f = fixture().await;
        let run_id = submit_run(&f).await;

        // Burn three attempts via claim/requeue without executing.
        for _ in 0..3 {
            let job = f.store.claim_one().await.unwrap().unwrap();
            f.store.requeue(job.id).await.unwrap();
        }

        assert_eq!(f.worker.tick().await.unwrap(), Tick::AttemptsExhausted);

        let jobs = f.store.list_jobs(&run_id).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[0].attempt, 4);
        assert_eq!(jobs[0].last_error.as_deref(), Some(MAX_ATTEMPTS_ERROR));
    }

    #[tokio::test]
    async fn recovered_job_is_reprocessed_without_duplicating_next_phase() {
        let f = fixture().await;
        let run_id = submit_run(&f).await;

        // A worker claims plan, takes the lease, and dies mid-phase.
        // The ack never happened, so neither did the enqueue of the
        // next phase.
        let dead_owner = Id::new();
        let job = f.store.claim_one().await.unwrap().unwrap();
        assert!(f.store.acquire_lease(&run_id, &dead_owner).await.unwrap());
        let stale = (chrono::Utc::now() - chrono::Duration::seconds(400))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        f.store.set_job_updated_at(job.id, &stale).await.unwrap();

        // The next iteration recovers, reclaims, and completes the phase.
        assert_eq!(f.worker.tick().await.unwrap(), Tick::Processed);

        let jobs = f.store.list_jobs(&run_id).await.unwrap();
        assert_eq!(jobs.len(), 2, "exactly one implement row enqueued");
        assert_eq!(jobs[0].phase, Phase::Plan);
        assert_eq!(jobs[0].status, JobStatus::Done);
        assert_eq!(jobs[0].attempt, 2);
        assert_eq!(jobs[1].phase, Phase::Implement);
        assert_eq!(jobs[1].status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn cancelled_handoff_fails_job_without_overwriting() {
        let f = fixture().await;
        let run_id = submit_run(&f).await;
        let run_dir = f.config.run_dir(&run_id);

        // Cancel only the handoff, leaving the job queued: the claim
        // still happens and the worker must notice before side effects.
        let handoff = Handoff::load(&run_dir).unwrap().apply(
            HandoffUpdate::new(Phase::Plan, RunStatus::Cancelled, String::new())
                .with_note("Cancelled by user."),
        );
        handoff.save(&run_dir).unwrap();

        assert_eq!(f.worker.tick().await.unwrap(), Tick::Failed);

        let jobs = f.store.list_jobs(&run_id).await.unwrap();
        assert_eq!(jobs.len(), 1, "no next phase enqueued");
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[0].last_error.as_deref(), Some("Run cancelled."));

        let after = Handoff::load(&run_dir).unwrap();
        assert!(after.is_cancelled(), "cancelled handoff preserved");
        assert!(after.next.is_none());
        assert_eq!(f.store.stats().await.unwrap().lease_count, 0);
    }

    #[tokio::test]
    async fn validation_failure_marks_run_failed() {
        let f = fixture().await;

        // A run whose handoff has no repository url fails plan validation.
        let run_id = submit::submit(
            &f.config,
            &f.store,
            SubmitRequest {
                task: "hello".to_string(),
                repo_url: String::new(),
                keep_workspace: false,
                base_branch: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(f.worker.tick().await.unwrap(), Tick::Failed);

        let run_dir = f.config.run_dir(&run_id);
        let handoff = Handoff::load(&run_dir).unwrap();
        assert_eq!(handoff.state.status, RunStatus::Failed);
        assert!(handoff.next.is_none());
        assert!(run_dir.join("plan.error.json").exists());

        let jobs = f.store.list_jobs(&run_id).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0].last_error.as_deref().unwrap().contains("repository url"));
    }

    #[tokio::test]
    async fn shutdown_flag_stops_run_loop() {
        let f = fixture().await;
        f.worker.shutdown();
        assert!(f.worker.is_shutdown());
        // run() must return promptly once the flag is set.
        f.worker.run().await;
    }
}
