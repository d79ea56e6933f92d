//! The watching side of the protocol: claims triggers and writes completions

use crate::error::{io_at, Result};
use crate::protocol::{self, Completion, Job, JobKind, CLAIMED_SUFFIX, INVALID_INPUT_CODE};
use crate::runner::JobRunner;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Code reported for a job whose helper died while it was running
pub const ABANDONED_CODE: i32 = 1;

/// Inputs of a job that passed validation
enum Inputs {
    Build { payload: PathBuf, destination: String },
    Deploy { manifest: PathBuf },
}

async fn non_empty_file(path: &Path, what: &str) -> Result<(), String> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        Ok(_) => Err(format!("{what} {} is empty", path.display())),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(format!("{what} {} is missing", path.display()))
        }
        Err(e) => Err(format!("{what} {} is unreadable: {e}", path.display())),
    }
}

async fn validate(job: &Job) -> Result<Inputs, String> {
    match job.kind {
        JobKind::Build => {
            let payload = job.payload();
            non_empty_file(&payload, "build context").await?;

            let dest_file = job.destination();
            let destination = tokio::fs::read_to_string(&dest_file)
                .await
                .map_err(|e| format!("destination {} is unreadable: {e}", dest_file.display()))?;
            let destination = destination.trim();
            if destination.is_empty() {
                return Err(format!("destination {} is empty", dest_file.display()));
            }
            Ok(Inputs::Build {
                payload,
                destination: destination.to_string(),
            })
        }
        JobKind::Deploy => {
            let manifest = job.manifest();
            non_empty_file(&manifest, "manifest").await?;
            Ok(Inputs::Deploy { manifest })
        }
    }
}

pub struct Helper<R> {
    dir: PathBuf,
    runner: R,
    interval: Duration,
}

impl<R: JobRunner> Helper<R> {
    pub fn new(dir: impl Into<PathBuf>, runner: R, interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            runner,
            interval,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Trigger files currently waiting in the directory, sorted by job name
    async fn pending(&self) -> Result<Vec<Job>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(io_at(&self.dir))?;
        let mut jobs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_at(&self.dir))? {
            if let Some(job) = Job::from_trigger(&entry.path()) {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    /// Process every pending trigger once; returns how many jobs ran
    pub async fn scan_once(&self) -> Result<usize> {
        let mut processed = 0;
        for job in self.pending().await? {
            if self.process(&job).await? {
                processed += 1;
            }
        }
        Ok(processed)
    }

    /// Claim and run one job. `false` when another scan claimed it first.
    #[instrument(skip(self, job), fields(job = %job))]
    pub async fn process(&self, job: &Job) -> Result<bool> {
        let claimed = job.claimed();
        match tokio::fs::rename(job.trigger(), &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Trigger already claimed");
                return Ok(false);
            }
            Err(e) => return Err(io_at(&job.trigger())(e)),
        }

        let completion_path = job.completion();
        if protocol::remove_if_present(&completion_path).await? {
            debug!("Removed stale completion");
        }

        let completion = match validate(job).await {
            Err(diagnostic) => {
                warn!(%diagnostic, "Rejecting job");
                Completion::failure(INVALID_INPUT_CODE, diagnostic)
            }
            Ok(inputs) => {
                info!("Running job");
                let outcome = match &inputs {
                    Inputs::Build {
                        payload,
                        destination,
                    } => self.runner.build(&job.name, payload, destination).await,
                    Inputs::Deploy { manifest } => self.runner.deploy(&job.name, manifest).await,
                };
                outcome.unwrap_or_else(|e| {
                    error!(error = %e, "Job runner failed");
                    Completion::failure(1, e.to_string())
                })
            }
        };

        protocol::write_completion(&completion_path, &completion).await?;
        protocol::remove_if_present(&claimed).await?;
        info!(code = completion.code, "Job completed");
        Ok(true)
    }

    /// Answer claims left behind by a helper that stopped mid-job so their
    /// callers stop polling
    pub async fn recover_abandoned(&self) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(io_at(&self.dir))?;
        let mut recovered = 0;
        while let Some(entry) = entries.next_entry().await.map_err(io_at(&self.dir))? {
            let path = entry.path();
            let Some(trigger) = path
                .to_str()
                .and_then(|p| p.strip_suffix(CLAIMED_SUFFIX))
                .map(PathBuf::from)
            else {
                continue;
            };
            let Some(job) = Job::from_trigger(&trigger) else {
                continue;
            };

            warn!(job = %job, "Reporting job abandoned by a previous helper");
            protocol::write_completion(
                &job.completion(),
                &Completion::failure(
                    ABANDONED_CODE,
                    "build agent restarted while the job was running",
                ),
            )
            .await?;
            protocol::remove_if_present(&path).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Scan every interval until `shutdown` resolves
    pub async fn watch<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_at(&self.dir))?;
        let recovered = self.recover_abandoned().await?;
        if recovered > 0 {
            info!(recovered, "Answered abandoned jobs");
        }
        info!(
            dir = %self.dir.display(),
            interval = ?self.interval,
            "Watching for build and deploy triggers"
        );

        tokio::pin!(shutdown);
        loop {
            if let Err(e) = self.scan_once().await {
                error!(error = %e, "Scan failed");
            }
            tokio::select! {
                () = &mut shutdown => break,
                () = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Build agent stopped watching");
        Ok(())
    }
}
