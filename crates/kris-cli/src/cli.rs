use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use kris_core::launch::GpuSpec;

/// Run scripts on a remote GPU batch service.
#[derive(Debug, Parser)]
#[command(name = "kris", version)]
pub struct Cli {
    /// Enable debug output.
    #[arg(long, global = true, default_value_t = false)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Authorize client.
    Auth(AuthArgs),

    /// Print list of your jobs.
    List(ServiceArgs),

    #[command(hide = true)]
    Status(StatusArgs),

    /// Show job logs.
    Logs(LogsArgs),

    /// Run a script remotely. Options go before SCRIPT; everything after it
    /// is passed to the script.
    Run(RunArgs),

    #[command(hide = true)]
    Transfer(TransferArgs),

    #[command(hide = true)]
    Upload(UploadArgs),

    #[command(hide = true)]
    BuildImage(BuildImageArgs),

    /// Add bucket credentials to configuration.
    AddBucket,
}

impl Command {
    /// Setup commands run before credentials or a default bucket exist.
    pub fn is_setup(&self) -> bool {
        matches!(self, Command::Auth(_) | Command::AddBucket)
    }
}

#[derive(Debug, Args)]
pub struct AuthArgs {
    /// Force rewrite credentials.
    #[arg(short, long, default_value_t = false)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct ServiceArgs {
    /// Use this flag for service jobs (build image, copy from S3 etc).
    #[arg(long, default_value_t = false)]
    pub service: bool,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    pub job_id: String,

    #[arg(long, default_value_t = false)]
    pub service: bool,
}

#[derive(Debug, Args)]
pub struct LogsArgs {
    pub job_id: String,

    /// Use this flag for service jobs (build image, copy from S3 etc).
    #[arg(long, default_value_t = false, conflicts_with = "image")]
    pub service: bool,

    /// Logs of an image build.
    #[arg(long, hide = true, default_value_t = false)]
    pub image: bool,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Number of GPUs. --gpu 2x4 runs the job on two pods with 4 GPUs each.
    #[arg(long, value_name = "N|WxG")]
    pub gpu: Option<GpuSpec>,

    /// Set custom image.
    #[arg(long, conflicts_with = "requirements")]
    pub image: Option<String>,

    /// Path to requirements.txt. Builds a custom image.
    #[arg(long, value_name = "FILE")]
    pub requirements: Option<PathBuf>,

    /// Custom project root (default: parent directory of SCRIPT).
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    pub script: PathBuf,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(Debug, Args)]
pub struct TransferArgs {
    pub src: String,
    pub dst: String,
}

#[derive(Debug, Args)]
pub struct UploadArgs {
    pub local_path: PathBuf,
}

#[derive(Debug, Args)]
pub struct BuildImageArgs {
    pub requirements: PathBuf,
}
