//! Submitting a local script as a remote GPU job.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use tracing::info;

use crate::agent::{AgentCommand, check_agent_binary};
use crate::api::JobSpec;
use crate::cache::ImageCache;
use crate::error::{KrisError, Result};
use crate::images::ImageBuilder;
use crate::paths::is_object_path;
use crate::staging::Stager;

/// Worker and GPU counts: `"G"` or `"WxG"` (W pods with G GPUs each).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuSpec {
    pub n_workers: u32,
    pub n_gpus: u32,
}

impl Default for GpuSpec {
    fn default() -> Self {
        Self {
            n_workers: 1,
            n_gpus: 1,
        }
    }
}

impl FromStr for GpuSpec {
    type Err = KrisError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || KrisError::InvalidRequest(format!("invalid GPU format: {s:?}"));
        let count = |part: &str| -> Result<u32> {
            match part.trim().parse::<u32>() {
                Ok(n) if n > 0 => Ok(n),
                _ => Err(invalid()),
            }
        };
        match s.split_once('x') {
            Some((workers, gpus)) => Ok(Self {
                n_workers: count(workers)?,
                n_gpus: count(gpus)?,
            }),
            None => Ok(Self {
                n_workers: 1,
                n_gpus: count(s)?,
            }),
        }
    }
}

impl fmt::Display for GpuSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.n_workers, self.n_gpus)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub script: PathBuf,
    pub args: Vec<String>,
    pub gpu: GpuSpec,
    pub image: Option<String>,
    pub requirements: Option<PathBuf>,
    /// Project root to ship; defaults to the script's directory.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedJob {
    pub job_name: String,
    pub image: String,
    pub command: AgentCommand,
}

pub struct Launcher<'a> {
    stager: &'a Stager<'a>,
    cache: &'a ImageCache,
    agent_path: &'a Path,
    base_image: &'a str,
}

impl<'a> Launcher<'a> {
    pub fn new(
        stager: &'a Stager<'a>,
        cache: &'a ImageCache,
        agent_path: &'a Path,
        base_image: &'a str,
    ) -> Self {
        Self {
            stager,
            cache,
            agent_path,
            base_image,
        }
    }

    /// Resolves the image, stages the agent, the project root and every
    /// `s3://` argument, then submits the job. The agent must be a Linux
    /// executable; nothing is uploaded otherwise.
    pub async fn launch(&self, request: &RunRequest) -> Result<LaunchedJob> {
        let script = request.script.canonicalize().map_err(|_| {
            KrisError::InvalidRequest(format!("file {} doesn't exist", request.script.display()))
        })?;
        if !script.is_file() {
            return Err(KrisError::InvalidRequest(format!(
                "{} is not a file",
                script.display()
            )));
        }
        let root = match &request.root {
            Some(root) => root.canonicalize().map_err(|_| {
                KrisError::InvalidRequest(format!("root {} doesn't exist", root.display()))
            })?,
            None => script
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| KrisError::InvalidRequest("script has no parent directory".into()))?,
        };
        let executable = relative_executable(&script, &root)?;
        check_agent_binary(self.agent_path)?;

        let image = match (&request.image, &request.requirements) {
            (Some(_), Some(_)) => {
                return Err(KrisError::InvalidRequest(
                    "--image and --requirements cannot be used together".into(),
                ));
            }
            (Some(image), None) => image.clone(),
            (None, Some(requirements)) => {
                info!(requirements = %requirements.display(), "building image");
                ImageBuilder::new(self.stager, self.cache, self.base_image)
                    .build(requirements)
                    .await?
            }
            (None, None) => self.base_image.to_string(),
        };

        info!("uploading agent");
        let agent = self.stager.stage(self.agent_path).await?;
        info!(root = %root.display(), "uploading project");
        let archive = self.stager.stage(&root).await?;

        let client = self.stager.remote().client();
        let home = client.remote_home();
        let mut args = Vec::with_capacity(request.args.len());
        for arg in &request.args {
            if is_object_path(arg) {
                info!(arg, "staging argument");
                args.push(self.stager.stage_object(arg).await?.absolute(home));
            } else {
                args.push(arg.clone());
            }
        }

        let command = AgentCommand::new(agent, archive.absolute(home), executable, args)?;
        let job = client
            .run(&JobSpec {
                script: command.to_string(),
                base_image: image.clone(),
                n_workers: request.gpu.n_workers,
                n_gpus: request.gpu.n_gpus,
            })
            .await?;
        info!(job = %job.job_name, "job launched");

        Ok(LaunchedJob {
            job_name: job.job_name,
            image,
            command,
        })
    }
}

/// `script` relative to `root`, `/`-separated; the script must be inside root.
fn relative_executable(script: &Path, root: &Path) -> Result<String> {
    let outside = || {
        KrisError::InvalidRequest(format!(
            "{} is not inside project root {}",
            script.display(),
            root.display()
        ))
    };
    let relative = script.strip_prefix(root).map_err(|_| outside())?;
    let parts = relative
        .components()
        .map(|component| match component {
            Component::Normal(part) => part.to_str().ok_or_else(outside),
            _ => Err(outside()),
        })
        .collect::<Result<Vec<_>>>()?;
    if parts.is_empty() {
        return Err(outside());
    }
    Ok(parts.join("/"))
}
