//! The build worker pool. Jobs flow through per-service lanes so builds
//! for one service run in submission order, while lanes run in parallel
//! under a global concurrency cap.

pub mod backend;
pub mod pipeline;

pub use pipeline::{Stage, StageError};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{info, instrument};

use enclii_common::models::release::{BuildTrigger, Release};

use crate::artifacts::{ArtifactStore, Signer};
use crate::build::backend::BuildBackend;
use crate::build::pipeline::Pipeline;
use crate::persistence::{BuildJob, EnqueueOutcome, Persistence};
use crate::Result;

const LANE_BUFFER_SIZE: usize = 32;

/// What a build request resolved to, as reported to the caller.
#[derive(Debug)]
pub enum BuildOutcome {
    /// A fresh build was enqueued.
    Started(BuildJob),
    /// An identical build is already in flight; folded into it.
    Deduped(BuildJob),
    /// Dedup found a ready release for the pair; nothing to build.
    Existing(Release),
}

impl BuildOutcome {
    pub fn job(&self) -> Option<&BuildJob> {
        match self {
            Self::Started(job) | Self::Deduped(job) => Some(job),
            Self::Existing(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct BuildManager {
    inner: Arc<Inner>,
}

struct Inner {
    persistence: Persistence,
    pipeline: Arc<Pipeline>,
    limit: Arc<Semaphore>,
    lanes: Mutex<HashMap<uuid::Uuid, mpsc::Sender<BuildJob>>>,
}

impl BuildManager {
    pub fn new(
        persistence: Persistence,
        artifacts: Arc<ArtifactStore>,
        signer: Arc<Signer>,
        backend: Arc<dyn BuildBackend>,
        n_build: usize,
    ) -> Self {
        let pipeline = Arc::new(Pipeline {
            persistence: persistence.clone(),
            artifacts,
            signer,
            backend,
        });

        Self {
            inner: Arc::new(Inner {
                persistence,
                pipeline,
                limit: Arc::new(Semaphore::new(n_build.max(1))),
                lanes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Re-dispatch jobs that were queued or mid-build when the process
    /// died. Claim idempotency makes replays safe.
    pub async fn recover(&self) -> Result<()> {
        let jobs = self.inner.persistence.unfinished_jobs().await?;
        if !jobs.is_empty() {
            info!(count = jobs.len(), "recovering unfinished build jobs");
        }
        for job in jobs {
            self.dispatch(job).await;
        }
        Ok(())
    }

    /// Enqueue a build for `(service, git_sha)`, subject to dedup.
    #[instrument(skip(self), fields(%service_id, %git_sha))]
    pub async fn request_build(
        &self,
        service_id: uuid::Uuid,
        git_sha: &str,
        trigger: BuildTrigger,
        pr_number: Option<u32>,
        force: bool,
        actor: &str,
    ) -> Result<BuildOutcome> {
        match self
            .inner
            .persistence
            .enqueue_build(service_id, git_sha, trigger, pr_number, force, actor)
            .await?
        {
            EnqueueOutcome::Queued(job) => {
                self.dispatch(job.clone()).await;
                Ok(BuildOutcome::Started(job))
            }
            EnqueueOutcome::Deduped(job) => Ok(BuildOutcome::Deduped(job)),
            EnqueueOutcome::Existing(release) => Ok(BuildOutcome::Existing(release)),
        }
    }

    /// Route a job to its service lane, spawning the lane on first use.
    async fn dispatch(&self, job: BuildJob) {
        let mut lanes = self.inner.lanes.lock().await;
        let sender = lanes.entry(job.service_id).or_insert_with(|| {
            let (send, recv) = mpsc::channel(LANE_BUFFER_SIZE);
            let pipeline = self.inner.pipeline.clone();
            let limit = self.inner.limit.clone();
            tokio::spawn(lane_task(recv, pipeline, limit));
            send
        });

        // A full lane applies backpressure to the intake.
        let _ = sender.send(job).await;
    }
}

/// One lane per service: strict FIFO within the lane, parallelism across
/// lanes bounded by the shared semaphore.
async fn lane_task(
    mut recv: mpsc::Receiver<BuildJob>,
    pipeline: Arc<Pipeline>,
    limit: Arc<Semaphore>,
) {
    while let Some(job) = recv.recv().await {
        let permit = limit
            .clone()
            .acquire_owned()
            .await
            .expect("build semaphore closed");
        pipeline.run(job).await;
        drop(permit);
    }
}
