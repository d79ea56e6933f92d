//! Execution of claimed jobs

use crate::error::{io_at, Error, Result};
use crate::protocol::Completion;
use async_trait::async_trait;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Lines of stderr kept as the completion diagnostic
const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// Runs the actual work behind a validated job
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Build `payload` (a gzipped context tarball) and push it to `destination`
    async fn build(&self, job: &str, payload: &Path, destination: &str) -> Result<Completion>;

    /// Apply the manifest at `manifest`
    async fn deploy(&self, job: &str, manifest: &Path) -> Result<Completion>;
}

/// Default runner shelling out to `kubectl`
#[derive(Debug, Clone)]
pub struct KubectlRunner {
    kubectl: String,
    builder_image: String,
    namespace: Option<String>,
}

impl KubectlRunner {
    #[must_use]
    pub fn new(builder_image: impl Into<String>, namespace: Option<String>) -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            builder_image: builder_image.into(),
            namespace,
        }
    }

    #[must_use]
    pub fn with_kubectl(mut self, kubectl: impl Into<String>) -> Self {
        self.kubectl = kubectl.into();
        self
    }

    fn namespace_args(&self) -> Vec<String> {
        self.namespace
            .iter()
            .flat_map(|ns| ["--namespace".to_string(), ns.clone()])
            .collect()
    }

    /// Arguments of the one-shot builder pod reading its context from stdin
    fn build_args(&self, job: &str, destination: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            builder_pod_name(job),
            "--rm".to_string(),
            "-i".to_string(),
            "--restart=Never".to_string(),
            format!("--image={}", self.builder_image),
        ];
        args.extend(self.namespace_args());
        args.extend([
            "--".to_string(),
            "--context=tar://stdin".to_string(),
            format!("--destination={destination}"),
        ]);
        args
    }

    fn deploy_args(&self, manifest: &Path) -> Vec<String> {
        let mut args = vec![
            "apply".to_string(),
            "-f".to_string(),
            manifest.display().to_string(),
        ];
        args.extend(self.namespace_args());
        args
    }

    fn launch_error(&self, source: std::io::Error) -> Error {
        Error::Launch {
            program: self.kubectl.clone(),
            source,
        }
    }
}

/// Pod names are DNS labels: lowercase alphanumerics and dashes, at most 63
fn builder_pod_name(job: &str) -> String {
    let sanitized: String = job
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let mut name = format!("build-{sanitized}");
    name.truncate(63);
    name.trim_end_matches('-').to_string()
}

fn completion_from_output(output: &Output) -> Completion {
    // Killed by a signal
    let code = output.status.code().unwrap_or(1);
    if code == 0 {
        return Completion::success();
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().collect();
    let tail = lines[lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES)..].join("\n");
    if tail.trim().is_empty() {
        Completion::failure(code, format!("exited with status {code}"))
    } else {
        Completion::failure(code, tail)
    }
}

#[async_trait]
impl JobRunner for KubectlRunner {
    #[instrument(skip(self, payload), fields(image = %self.builder_image))]
    async fn build(&self, job: &str, payload: &Path, destination: &str) -> Result<Completion> {
        let args = self.build_args(job, destination);
        debug!(?args, "Launching builder pod");

        let mut context = tokio::fs::File::open(payload)
            .await
            .map_err(io_at(payload))?;
        let mut child = Command::new(&self.kubectl)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.launch_error(e))?;

        // Stream the context while output is drained so neither pipe fills up
        let feeder = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                let copied = tokio::io::copy(&mut context, &mut stdin).await;
                drop(stdin);
                copied
            })
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.launch_error(e))?;

        if let Some(feeder) = feeder {
            match feeder.await {
                Ok(Ok(bytes)) => debug!(bytes, "Build context streamed"),
                Ok(Err(e)) => warn!(error = %e, "Builder closed stdin early"),
                Err(e) => warn!(error = %e, "Context feeder task failed"),
            }
        }

        let completion = completion_from_output(&output);
        info!(code = completion.code, "Build finished");
        Ok(completion)
    }

    #[instrument(skip(self, manifest))]
    async fn deploy(&self, job: &str, manifest: &Path) -> Result<Completion> {
        let output = Command::new(&self.kubectl)
            .args(self.deploy_args(manifest))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.launch_error(e))?;

        let completion = completion_from_output(&output);
        info!(code = completion.code, "Deploy finished");
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    fn output(raw_status: i32, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(raw_status),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn build_runs_a_one_shot_pod_fed_from_stdin() {
        let runner = KubectlRunner::new("kaniko:latest", Some("ci".to_string()));
        let args = runner.build_args("Web_App", "registry.local/web:1");

        assert_eq!(args[0], "run");
        assert_eq!(args[1], "build-web-app");
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"--restart=Never".to_string()));
        assert!(args.contains(&"--image=kaniko:latest".to_string()));

        let separator = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(&args[separator - 2..separator], &["--namespace", "ci"]);
        assert_eq!(
            &args[separator + 1..],
            &["--context=tar://stdin", "--destination=registry.local/web:1"]
        );
    }

    #[test]
    fn deploy_applies_the_manifest() {
        let runner = KubectlRunner::new("kaniko:latest", None);
        assert_eq!(
            runner.deploy_args(Path::new("/builds/web.yaml")),
            vec!["apply", "-f", "/builds/web.yaml"]
        );
    }

    #[test]
    fn pod_names_are_dns_labels() {
        assert_eq!(builder_pod_name("api.v2"), "build-api-v2");
        let long = builder_pod_name(&"x".repeat(100));
        assert_eq!(long.len(), 63);
        assert_eq!(builder_pod_name("trailing."), "build-trailing");
    }

    #[test]
    fn exit_status_becomes_the_completion_code() {
        assert_eq!(completion_from_output(&output(0, "noise")), Completion::success());

        // wait status: exit code in the high byte
        let failed = completion_from_output(&output(3 << 8, "error: push denied\n"));
        assert_eq!(failed, Completion::failure(3, "error: push denied"));

        let silent = completion_from_output(&output(1 << 8, ""));
        assert_eq!(silent.diagnostic.as_deref(), Some("exited with status 1"));

        // SIGKILL
        assert_eq!(completion_from_output(&output(9, "")).code, 1);
    }

    #[test]
    fn diagnostic_keeps_the_stderr_tail() {
        let stderr: String = (0..50).map(|i| format!("line {i}\n")).collect();
        let completion = completion_from_output(&output(1 << 8, &stderr));
        let diagnostic = completion.diagnostic.unwrap();
        assert_eq!(diagnostic.lines().count(), DIAGNOSTIC_TAIL_LINES);
        assert!(diagnostic.ends_with("line 49"));
    }

    #[tokio::test]
    async fn missing_kubectl_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("web.yaml");
        std::fs::write(&manifest, "kind: List\n").unwrap();

        let runner = KubectlRunner::new("kaniko", None).with_kubectl("/nonexistent/kubectl");
        let err = runner.deploy("web", &manifest).await.unwrap_err();
        assert!(matches!(err, Error::Launch { .. }));
    }
}
