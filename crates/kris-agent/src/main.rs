//! Entry point of every remote job launched by `kris run`.
//!
//! Usage: `kris-agent [RANK] ARCHIVE EXECUTABLE N [ARG]... [RANK]`

use std::path::PathBuf;
use std::process::{ExitCode, ExitStatus};

use anyhow::{Context, Result};
use chrono::Local;
use kris_core::agent::{AgentEnv, AgentInvocation, unpack_once, work_dir_name};
use kris_core::config::DEFAULT_REMOTE_HOME;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const JOBS_ROOT_ENV: &str = "KRIS_JOBS_ROOT";

fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("info"))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    match run() {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    info!(?argv, "job is running agent");
    let invocation = AgentInvocation::parse(&argv)?;
    if !invocation.ignored.is_empty() {
        warn!(ignored = ?invocation.ignored, "ignoring extra arguments");
    }

    let jobs_root = std::env::var_os(JOBS_ROOT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_REMOTE_HOME).join(".kris").join("jobs"));
    let env = AgentEnv::from_env();
    let work_dir = jobs_root.join(work_dir_name(
        &env,
        invocation.rank.as_ref(),
        &Local::now(),
    ));

    let fresh = unpack_once(&invocation.archive, &work_dir).with_context(|| {
        format!(
            "failed to unpack {} into {}",
            invocation.archive.display(),
            work_dir.display()
        )
    })?;
    info!(work_dir = %work_dir.display(), fresh, "project ready");
    std::env::set_current_dir(&work_dir)
        .with_context(|| format!("cannot enter {}", work_dir.display()))?;

    let mut command = invocation.command(&work_dir);
    info!(?command, "agent is running script");
    let status = command
        .status()
        .with_context(|| format!("failed to start {}", invocation.executable.display()))?;
    Ok(exit_code(status))
}

fn exit_code(status: ExitStatus) -> ExitCode {
    if let Some(code) = status.code() {
        return ExitCode::from(u8::try_from(code & 0xff).unwrap_or(1));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitCode::from(u8::try_from(128 + signal).unwrap_or(1));
        }
    }
    ExitCode::FAILURE
}
