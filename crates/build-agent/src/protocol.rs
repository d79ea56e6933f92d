//! On-disk layout of the build/deploy signal protocol
//!
//! Every job is a group of files sharing one stem inside the builds
//! directory. A build named `app` uses `app.tar.gz` (context archive),
//! `app.dest` (image reference), `app.request` (trigger) and `app.done`
//! (completion). A deploy uses `app.yaml`, `app.apply` and `app.apply-done`.
//! The helper claims a trigger by renaming it to `<trigger>.claimed`.

use crate::error::{io_at, Error, Result};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const PAYLOAD_SUFFIX: &str = ".tar.gz";
pub const DESTINATION_SUFFIX: &str = ".dest";
pub const BUILD_TRIGGER_SUFFIX: &str = ".request";
pub const BUILD_COMPLETION_SUFFIX: &str = ".done";
pub const MANIFEST_SUFFIX: &str = ".yaml";
pub const DEPLOY_TRIGGER_SUFFIX: &str = ".apply";
pub const DEPLOY_COMPLETION_SUFFIX: &str = ".apply-done";
pub const CLAIMED_SUFFIX: &str = ".claimed";
const TEMP_SUFFIX: &str = ".tmp";

/// Code written when the inputs of a job are missing or malformed
pub const INVALID_INPUT_CODE: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Build,
    Deploy,
}

impl JobKind {
    #[must_use]
    pub fn trigger_suffix(self) -> &'static str {
        match self {
            JobKind::Build => BUILD_TRIGGER_SUFFIX,
            JobKind::Deploy => DEPLOY_TRIGGER_SUFFIX,
        }
    }

    #[must_use]
    pub fn completion_suffix(self) -> &'static str {
        match self {
            JobKind::Build => BUILD_COMPLETION_SUFFIX,
            JobKind::Deploy => DEPLOY_COMPLETION_SUFFIX,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Build => f.write_str("build"),
            JobKind::Deploy => f.write_str("deploy"),
        }
    }
}

/// One job in a builds directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub kind: JobKind,
    pub name: String,
    dir: PathBuf,
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && name.trim() == name;
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidJobName(name.to_string()))
    }
}

impl Job {
    pub fn new(kind: JobKind, dir: impl Into<PathBuf>, name: &str) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            kind,
            name: name.to_string(),
            dir: dir.into(),
        })
    }

    pub fn build(dir: impl Into<PathBuf>, name: &str) -> Result<Self> {
        Self::new(JobKind::Build, dir, name)
    }

    pub fn deploy(dir: impl Into<PathBuf>, name: &str) -> Result<Self> {
        Self::new(JobKind::Deploy, dir, name)
    }

    /// Recognise a trigger file; anything else yields `None`
    #[must_use]
    pub fn from_trigger(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        let dir = path.parent()?;
        [JobKind::Build, JobKind::Deploy].into_iter().find_map(|kind| {
            let name = file_name.strip_suffix(kind.trigger_suffix())?;
            Job::new(kind, dir, name).ok()
        })
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{suffix}", self.name))
    }

    #[must_use]
    pub fn trigger(&self) -> PathBuf {
        self.file(self.kind.trigger_suffix())
    }

    #[must_use]
    pub fn claimed(&self) -> PathBuf {
        self.file(&format!("{}{CLAIMED_SUFFIX}", self.kind.trigger_suffix()))
    }

    #[must_use]
    pub fn completion(&self) -> PathBuf {
        self.file(self.kind.completion_suffix())
    }

    #[must_use]
    pub fn payload(&self) -> PathBuf {
        self.file(PAYLOAD_SUFFIX)
    }

    #[must_use]
    pub fn destination(&self) -> PathBuf {
        self.file(DESTINATION_SUFFIX)
    }

    #[must_use]
    pub fn manifest(&self) -> PathBuf {
        self.file(MANIFEST_SUFFIX)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

/// Result of a finished job as carried by its completion file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub code: i32,
    pub diagnostic: Option<String>,
}

impl Completion {
    #[must_use]
    pub fn success() -> Self {
        Self {
            code: 0,
            diagnostic: None,
        }
    }

    #[must_use]
    pub fn failure(code: i32, diagnostic: impl Into<String>) -> Self {
        Self {
            code,
            diagnostic: Some(diagnostic.into()),
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.code == 0
    }

    /// First line is the decimal code, the rest is an optional diagnostic
    pub fn parse(text: &str) -> Result<Self, String> {
        let (first, rest) = text.split_once('\n').unwrap_or((text, ""));
        let first = first.trim();
        if first.is_empty() {
            return Err("empty result code".to_string());
        }
        let code = first
            .parse::<i32>()
            .map_err(|_| format!("result code {first:?} is not an integer"))?;
        let rest = rest.trim_end();
        Ok(Self {
            code,
            diagnostic: (!rest.is_empty()).then(|| rest.to_string()),
        })
    }

    #[must_use]
    pub fn render(&self) -> String {
        match &self.diagnostic {
            Some(diagnostic) => format!("{}\n{}\n", self.code, diagnostic.trim_end()),
            None => format!("{}\n", self.code),
        }
    }
}

/// Write `contents` beside `path` and rename it into place
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidJobName(path.display().to_string()))?;
    let temp = path.with_file_name(format!(".{file_name}{TEMP_SUFFIX}"));

    tokio::fs::write(&temp, contents).await.map_err(io_at(&temp))?;
    tokio::fs::rename(&temp, path).await.map_err(io_at(path))
}

pub async fn write_completion(path: &Path, completion: &Completion) -> Result<()> {
    write_atomic(path, completion.render().as_bytes()).await
}

/// `None` while the job is still running
pub async fn read_completion(path: &Path) -> Result<Option<Completion>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Completion::parse(&text)
            .map(Some)
            .map_err(|reason| Error::MalformedCompletion {
                path: path.to_path_buf(),
                reason,
            }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_at(path)(e)),
    }
}

/// Returns whether a file was removed
pub async fn remove_if_present(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_at(path)(e)),
    }
}

fn is_signal_file(file_name: &str) -> bool {
    const SUFFIXES: [&str; 9] = [
        PAYLOAD_SUFFIX,
        DESTINATION_SUFFIX,
        BUILD_TRIGGER_SUFFIX,
        BUILD_COMPLETION_SUFFIX,
        MANIFEST_SUFFIX,
        DEPLOY_TRIGGER_SUFFIX,
        DEPLOY_COMPLETION_SUFFIX,
        CLAIMED_SUFFIX,
        TEMP_SUFFIX,
    ];
    SUFFIXES.iter().any(|suffix| file_name.ends_with(suffix))
}

/// Delete every protocol file left in `dir` by earlier runs
pub async fn purge(dir: &Path) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_at(dir)(e)),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await.map_err(io_at(dir))? {
        let file_type = entry.file_type().await.map_err(io_at(&entry.path()))?;
        if !file_type.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if is_signal_file(&name) && remove_if_present(&entry.path()).await? {
            debug!(file = %name, "Purged signal file");
            removed += 1;
        }
    }
    Ok(removed)
}
