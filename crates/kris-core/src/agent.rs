//! Command-line contract between the launcher and the remote agent.
//!
//! The job script is
//! `{agent} {archive} {executable} {n} {arg1} .. {argN}`, optionally preceded
//! or followed by a distributed rank token such as `--local_rank=3`. The agent
//! unpacks the archive into a per-job work directory (once, even with many
//! ranks racing), changes into it and runs the executable.

use std::fmt;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, TimeZone};
use tracing::debug;

use crate::archive::extract;
use crate::error::{KrisError, Result};
use crate::paths::RemotePath;

/// Marker written into a work directory once the archive is fully unpacked.
pub const UNPACKED_MARKER: &str = ".kris-unpacked";

/// Set by Open MPI; its third `/`-separated component identifies the job.
pub const OMPI_FILE_LOCATION_ENV: &str = "OMPI_FILE_LOCATION";
pub const JOB_NAME_ENV: &str = "JOB_NAME";

const RANK_OPTIONS: &[&str] = &["local_rank", "local-rank", "rank"];
const PYTHON: &str = "python";

// ---------- Launcher side ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    /// Relative to the remote home; the job API resolves it.
    pub agent: RemotePath,
    /// Absolute path of the staged project archive.
    pub archive: String,
    /// Path of the executable inside the archive, `/`-separated.
    pub executable: String,
    pub args: Vec<String>,
}

impl AgentCommand {
    /// The job API splits the script on whitespace, so no part may contain any.
    pub fn new(
        agent: RemotePath,
        archive: String,
        executable: String,
        args: Vec<String>,
    ) -> Result<Self> {
        let parts = [agent.as_str(), archive.as_str(), executable.as_str()];
        if let Some(bad) = parts
            .into_iter()
            .chain(args.iter().map(String::as_str))
            .find(|part| part.is_empty() || part.contains(char::is_whitespace))
        {
            return Err(KrisError::InvalidRequest(format!(
                "argument {bad:?} cannot be passed to a remote job"
            )));
        }
        Ok(Self {
            agent,
            archive,
            executable,
            args,
        })
    }
}

impl fmt::Display for AgentCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.agent,
            self.archive,
            self.executable,
            self.args.len()
        )?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const ELFCLASS64: u8 = 2;
const ELFOSABI_SYSV: u8 = 0;
const ELFOSABI_LINUX: u8 = 3;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

/// How to produce an agent the GPU nodes can run.
pub const AGENT_BUILD_HINT: &str = "build it with `cargo build --release -p kris-agent \
     --target x86_64-unknown-linux-musl` and point `agent_path` in config.toml at \
     target/x86_64-unknown-linux-musl/release/kris-agent";

/// Fails unless `path` is a 64-bit Linux executable for x86_64 or aarch64.
pub fn check_agent_binary(path: &Path) -> Result<()> {
    let not_linux = |why: &str| {
        KrisError::InvalidRequest(format!(
            "agent {} {why}; the remote nodes run Linux, {AGENT_BUILD_HINT}",
            path.display()
        ))
    };

    let mut header = [0u8; 20];
    let mut file = std::fs::File::open(path).map_err(|e| {
        KrisError::InvalidRequest(format!(
            "agent binary {} not found ({e}); {AGENT_BUILD_HINT}",
            path.display()
        ))
    })?;
    if let Err(e) = file.read_exact(&mut header) {
        return match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Err(not_linux("is not an ELF executable")),
            _ => Err(e.into()),
        };
    }

    if &header[..4] != ELF_MAGIC {
        return Err(not_linux("is not an ELF executable"));
    }
    if header[4] != ELFCLASS64 {
        return Err(not_linux("is not a 64-bit executable"));
    }
    if !matches!(header[7], ELFOSABI_SYSV | ELFOSABI_LINUX) {
        return Err(not_linux("targets a non-Linux ABI"));
    }
    // e_machine follows EI_DATA's byte order.
    let machine = match header[5] {
        1 => u16::from_le_bytes([header[18], header[19]]),
        _ => u16::from_be_bytes([header[18], header[19]]),
    };
    if !matches!(machine, EM_X86_64 | EM_AARCH64) {
        return Err(not_linux(&format!("is built for machine type {machine}")));
    }
    Ok(())
}

// ---------- Agent side ----------

/// Distributed rank argument injected by the job's launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankToken {
    pub raw: String,
    pub number: u32,
}

impl RankToken {
    pub fn parse(arg: &str) -> Option<Self> {
        let (name, value) = arg.strip_prefix("--")?.split_once('=')?;
        if !RANK_OPTIONS.contains(&name) {
            return None;
        }
        let number = value.parse().ok()?;
        Some(Self {
            raw: arg.to_string(),
            number,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    pub rank: Option<RankToken>,
    pub archive: PathBuf,
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Trailing arguments beyond the declared count that are not a rank token.
    pub ignored: Vec<String>,
}

impl AgentInvocation {
    /// Parses the agent's arguments, program name excluded.
    pub fn parse<S: AsRef<str>>(argv: &[S]) -> Result<Self> {
        let mut argv: Vec<&str> = argv.iter().map(AsRef::as_ref).collect();
        let mut rank = argv.first().and_then(|first| RankToken::parse(first));
        if rank.is_some() {
            argv.remove(0);
        }

        let [archive, executable, count, rest @ ..] = argv.as_slice() else {
            return Err(usage("expected ARCHIVE EXECUTABLE N [ARGS...]"));
        };
        let count: usize = count
            .parse()
            .map_err(|_| usage(&format!("argument count {count:?} is not a number")))?;
        if rest.len() < count {
            return Err(usage(&format!(
                "declared {count} arguments but got {}",
                rest.len()
            )));
        }
        let (args, trailing) = rest.split_at(count);

        let mut ignored = Vec::new();
        for extra in trailing {
            match RankToken::parse(extra) {
                Some(token) if rank.is_none() => rank = Some(token),
                _ => ignored.push(extra.to_string()),
            }
        }

        let executable = PathBuf::from(executable);
        if !is_contained(&executable) {
            return Err(usage(&format!(
                "executable {} must be relative to the archive root",
                executable.display()
            )));
        }

        Ok(Self {
            rank,
            archive: PathBuf::from(archive),
            executable,
            args: args.iter().map(ToString::to_string).collect(),
            ignored,
        })
    }

    /// Arguments for the child: the declared ones, then the rank token.
    pub fn child_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(rank) = &self.rank {
            args.push(rank.raw.clone());
        }
        args
    }

    /// Child process running the executable inside `work_dir`.
    pub fn command(&self, work_dir: &Path) -> Command {
        let mut command = if self.executable.extension().is_some_and(|ext| ext == "py") {
            let mut python = Command::new(PYTHON);
            python.arg(&self.executable);
            python
        } else {
            Command::new(work_dir.join(&self.executable))
        };
        command.args(self.child_args()).current_dir(work_dir);
        command
    }
}

fn usage(message: &str) -> KrisError {
    KrisError::InvalidRequest(format!("agent: {message}"))
}

fn is_contained(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_)))
        && path.components().next().is_some()
}

/// What the agent can learn about its job from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentEnv {
    pub ompi_file_location: Option<String>,
    pub job_name: Option<String>,
}

impl AgentEnv {
    pub fn from_env() -> Self {
        let read = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        Self {
            ompi_file_location: read(OMPI_FILE_LOCATION_ENV),
            job_name: read(JOB_NAME_ENV),
        }
    }

    fn job_id(&self) -> Option<&str> {
        self.ompi_file_location
            .as_deref()?
            .split('/')
            .nth(2)
            .filter(|id| !id.is_empty())
    }
}

/// Work directory name shared by every rank of one job.
///
/// The job id from the environment wins. Without one the name is built from
/// the job name (if known), `now` to the second, and the rank number.
pub fn work_dir_name<Tz>(env: &AgentEnv, rank: Option<&RankToken>, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    if let Some(id) = env.job_id() {
        return id.to_string();
    }

    let mut parts = Vec::new();
    if let Some(name) = &env.job_name {
        parts.push(sanitize(name));
    }
    parts.push(now.format("%Y-%m-%dT%H-%M-%S").to_string());
    if let Some(rank) = rank {
        parts.push(format!("rank{}", rank.number));
    }
    parts.join("-")
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Unpacks `archive` into `target` unless a previous run already did.
///
/// Extraction happens in a sibling temporary directory that is renamed into
/// place, so `target` is either absent or complete. Returns `false` when the
/// archive was already unpacked, including by a concurrent rank.
pub fn unpack_once(archive: &Path, target: &Path) -> Result<bool> {
    let marker = target.join(UNPACKED_MARKER);
    if marker.exists() {
        debug!(target = %target.display(), "already unpacked");
        return Ok(false);
    }

    let parent = target
        .parent()
        .ok_or_else(|| usage(&format!("{} has no parent directory", target.display())))?;
    std::fs::create_dir_all(parent)?;

    let staging = tempfile::Builder::new()
        .prefix(".unpack-")
        .tempdir_in(parent)?;
    extract(archive, staging.path())?;
    std::fs::write(staging.path().join(UNPACKED_MARKER), b"")?;

    match std::fs::rename(staging.path(), target) {
        Ok(()) => Ok(true),
        Err(_) if marker.exists() => {
            debug!(target = %target.display(), "another rank unpacked first");
            Ok(false)
        }
        Err(e) => Err(KrisError::Io(std::io::Error::new(
            e.kind(),
            format!("cannot move archive into {}: {e}", target.display()),
        ))),
    }
}
