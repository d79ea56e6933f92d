//! The requesting side of the protocol, used from CI job steps

use crate::error::{io_at, Error, Result};
use crate::protocol::{self, Completion, Job, JobKind};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

pub struct Caller {
    dir: PathBuf,
    poll: PollSettings,
}

impl Caller {
    pub fn new(dir: impl Into<PathBuf>, poll: PollSettings) -> Self {
        Self {
            dir: dir.into(),
            poll,
        }
    }

    /// Request an image build of `context` pushed to `destination`
    #[instrument(skip(self, context))]
    pub async fn build(
        &self,
        name: &str,
        context: &Path,
        destination: &str,
    ) -> Result<Completion> {
        let job = Job::build(&self.dir, name)?;
        self.prepare(&job).await?;

        let payload = job.payload();
        tokio::fs::copy(context, &payload)
            .await
            .map_err(io_at(context))?;
        let destination = format!("{}\n", destination.trim());
        protocol::write_atomic(&job.destination(), destination.as_bytes()).await?;

        self.trigger(&job).await?;
        self.wait(&job).await
    }

    /// Request `kubectl apply` of `manifest`
    #[instrument(skip(self, manifest))]
    pub async fn deploy(&self, name: &str, manifest: &Path) -> Result<Completion> {
        let job = Job::deploy(&self.dir, name)?;
        self.prepare(&job).await?;

        let target = job.manifest();
        tokio::fs::copy(manifest, &target)
            .await
            .map_err(io_at(manifest))?;

        self.trigger(&job).await?;
        self.wait(&job).await
    }

    /// Clear every file an earlier request of the same name left behind.
    ///
    /// The stale trigger goes first so no helper can claim it afterwards. A
    /// job already claimed is still running with the old inputs; wait for it
    /// to answer before its completion and inputs are removed.
    async fn prepare(&self, job: &Job) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_at(&self.dir))?;
        if protocol::remove_if_present(&job.trigger()).await? {
            debug!(job = %job, "Withdrew trigger from an earlier run");
        }
        self.wait_for_claim(job).await?;

        let mut stale = vec![job.completion()];
        match job.kind {
            JobKind::Build => stale.extend([job.payload(), job.destination()]),
            JobKind::Deploy => stale.push(job.manifest()),
        }
        for path in stale {
            if protocol::remove_if_present(&path).await? {
                debug!(job = %job, path = %path.display(), "Removed file from an earlier run");
            }
        }
        Ok(())
    }

    async fn wait_for_claim(&self, job: &Job) -> Result<()> {
        let claimed = job.claimed();
        let deadline = Instant::now() + self.poll.timeout;
        let mut announced = false;
        while tokio::fs::try_exists(&claimed)
            .await
            .map_err(io_at(&claimed))?
        {
            if !announced {
                info!(job = %job, "Waiting for an earlier run of this job to finish");
                announced = true;
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    timeout: self.poll.timeout,
                    path: claimed,
                });
            }
            tokio::time::sleep(self.poll.interval).await;
        }
        Ok(())
    }

    /// Inputs are complete once this returns; the trigger is created last
    async fn trigger(&self, job: &Job) -> Result<()> {
        protocol::write_atomic(&job.trigger(), b"").await?;
        info!(job = %job, "Job requested");
        Ok(())
    }

    async fn wait(&self, job: &Job) -> Result<Completion> {
        let path = job.completion();
        let deadline = Instant::now() + self.poll.timeout;
        loop {
            if let Some(completion) = protocol::read_completion(&path).await? {
                info!(job = %job, code = completion.code, "Job finished");
                return Ok(completion);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    timeout: self.poll.timeout,
                    path,
                });
            }
            tokio::time::sleep(self.poll.interval).await;
        }
    }
}
