/*
 * Kindling - Build Agent
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! CLI for the build agent
//!
//! Run `build-agent --help` for usage information.

// CLI binaries legitimately need eprintln! for user output
#![allow(clippy::disallowed_macros)]

use anyhow::Result;
use build_agent::{protocol, Caller, Completion, Helper, KubectlRunner, PollSettings};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "build-agent")]
#[command(about = "Build and deploy on behalf of CI runner containers")]
#[command(version)]
struct Cli {
    /// Directory shared between the runner and the build agent
    #[arg(long, env = "BUILDS_DIR", default_value = "/builds", global = true)]
    dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PollArgs {
    /// Seconds between checks for the completion file
    #[arg(long, env = "BUILD_AGENT_POLL_SECONDS", default_value_t = 2)]
    poll_seconds: u64,

    /// Give up waiting after this many seconds
    #[arg(long, env = "BUILD_AGENT_TIMEOUT_SECONDS", default_value_t = 1800)]
    timeout_seconds: u64,
}

impl From<PollArgs> for PollSettings {
    fn from(args: PollArgs) -> Self {
        Self {
            interval: Duration::from_secs(args.poll_seconds.max(1)),
            timeout: Duration::from_secs(args.timeout_seconds),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the builds directory and run requested jobs (helper side)
    Watch {
        /// Image of the one-shot builder pod
        #[arg(long, env = "BUILDER_IMAGE", default_value = "gcr.io/kaniko-project/executor:latest")]
        builder_image: String,

        /// Namespace for builder pods and applied manifests
        #[arg(long, env = "POD_NAMESPACE")]
        namespace: Option<String>,

        /// Seconds between directory scans
        #[arg(long, default_value_t = 2)]
        interval_seconds: u64,
    },

    /// Request an image build and wait for its result
    Build {
        /// Job name shared by every file of this request
        #[arg(short, long)]
        name: String,

        /// Gzipped tarball of the build context
        #[arg(short, long)]
        context: PathBuf,

        /// Image reference to push to
        #[arg(short, long)]
        destination: String,

        #[command(flatten)]
        poll: PollArgs,
    },

    /// Request a manifest apply and wait for its result
    Deploy {
        /// Job name shared by every file of this request
        #[arg(short, long)]
        name: String,

        /// Manifest to apply
        #[arg(short, long)]
        manifest: PathBuf,

        #[command(flatten)]
        poll: PollArgs,
    },

    /// Delete every signal file left by earlier runs
    Purge,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Exit code of the request; completions outside `0..=255` report failure
fn report(result: build_agent::Result<Completion>) -> ExitCode {
    match result {
        Ok(completion) => {
            if let Some(diagnostic) = &completion.diagnostic {
                eprintln!("{diagnostic}");
            }
            u8::try_from(completion.code).map_or(ExitCode::FAILURE, ExitCode::from)
        }
        Err(e) => {
            error!(error = %e, "Request failed");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Watch {
            builder_image,
            namespace,
            interval_seconds,
        } => {
            let runner = KubectlRunner::new(builder_image, namespace);
            let interval = Duration::from_secs(interval_seconds.max(1));
            let helper = Helper::new(&cli.dir, runner, interval);
            helper.watch(shutdown_signal()).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Build {
            name,
            context,
            destination,
            poll,
        } => {
            let caller = Caller::new(&cli.dir, poll.into());
            Ok(report(caller.build(&name, &context, &destination).await))
        }
        Commands::Deploy {
            name,
            manifest,
            poll,
        } => {
            let caller = Caller::new(&cli.dir, poll.into());
            Ok(report(caller.deploy(&name, &manifest).await))
        }
        Commands::Purge => {
            let removed = protocol::purge(&cli.dir).await?;
            info!(removed, dir = %cli.dir.display(), "Purged signal files");
            Ok(ExitCode::SUCCESS)
        }
    }
}
