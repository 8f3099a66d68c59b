use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use kris_core::KrisError;
use kris_core::api::{JobClass, JobClient, LogSource, LogStream};
use kris_core::bridge::RemoteFs;
use kris_core::buckets::{BucketConfig, DEFAULT_BUCKET_ALIAS};
use kris_core::cache::ImageCache;
use kris_core::config::Config;
use kris_core::credentials::{CredentialStore, UserCredentials};
use kris_core::images::ImageBuilder;
use kris_core::launch::{Launcher, RunRequest};
use kris_core::object_store::S3ObjectStore;
use kris_core::staging::Stager;
use tokio::io::AsyncWriteExt;

use crate::cli::{AuthArgs, LogsArgs, RunArgs, StatusArgs};
use crate::output::Printer;
use crate::prompt::{ask, ask_secret};

/// Everything a command needs, built once in `main`.
pub struct App {
    pub config: Config,
    pub store: Arc<dyn CredentialStore>,
    pub printer: Printer,
}

impl App {
    /// Refuses to run anything but setup commands on an unconfigured install.
    pub fn check_ready(&self) -> Result<()> {
        if UserCredentials::load(self.store.as_ref())?.is_none() {
            bail!("You are not authorized.\nRun `kris auth` to authorize.");
        }
        if !self.config.buckets.contains(DEFAULT_BUCKET_ALIAS) {
            bail!("No default bucket is set.\nRun `kris add-bucket` to add bucket.");
        }
        Ok(())
    }

    fn client(&self) -> Result<JobClient> {
        Ok(
            JobClient::from_store(self.config.api_url.clone(), self.store.clone())?
                .with_poll_policy(self.config.poll)
                .with_remote_home(self.config.remote_home.clone()),
        )
    }

    fn object_store(&self) -> Result<S3ObjectStore> {
        let bucket = self.config.buckets.default_bucket()?;
        Ok(S3ObjectStore::new(
            bucket,
            &self.config.s3_endpoint,
            &self.config.s3_region,
        ))
    }

    fn image_cache(&self) -> Result<ImageCache> {
        Ok(ImageCache::open(self.config.home.image_cache_file())?)
    }
}

pub async fn auth(app: &App, args: AuthArgs) -> Result<()> {
    if UserCredentials::load(app.store.as_ref())?.is_some() && !args.force {
        app.printer
            .heading("You are already authorized.\nUse -f option to rewrite credentials.");
        return Ok(());
    }

    app.printer
        .heading("Enter the email and password you use to log in to the service.");
    let email = ask("email")?;
    let password = ask_secret("password")?;
    app.printer.heading(
        "Enter your client API key.\nYou can get it by running `echo $GWAPI_KEY` inside a job terminal.",
    );
    let api_key = ask_secret("api key")?;

    JobClient::login(
        app.config.api_url.clone(),
        app.store.clone(),
        UserCredentials::new(email, password, api_key),
    )
    .await
    .context("authorization failed")?;
    app.printer.success("Authorized successfully!");
    Ok(())
}

pub async fn list(app: &App, service: bool) -> Result<()> {
    let class = job_class(service);
    let jobs = app.client()?.list_jobs(class).await?;
    app.printer.jobs(&jobs, class);
    Ok(())
}

pub async fn status(app: &App, args: StatusArgs) -> Result<()> {
    let class = job_class(args.service);
    let status = app.client()?.status(&args.job_id, class).await?;
    app.printer.status(&status, class);
    Ok(())
}

pub async fn logs(app: &App, args: LogsArgs) -> Result<()> {
    let source = if args.image {
        LogSource::Image
    } else {
        LogSource::from(job_class(args.service))
    };
    let stream = app.client()?.logs(&args.job_id, source).await?;
    print_stream(stream).await
}

pub async fn run(app: &App, args: RunArgs) -> Result<()> {
    let client = app.client()?;
    let store = app.object_store()?;
    let cache = app.image_cache()?;
    let stager = Stager::new(&store, RemoteFs::new(&client, &app.config.buckets))
        .with_scratch_dir(app.config.home.scratch_dir());
    let agent_path = app.config.agent_path()?;

    let request = RunRequest {
        script: args.script,
        args: args.args,
        gpu: args.gpu.unwrap_or_default(),
        image: args.image,
        requirements: args.requirements,
        root: args.root,
    };
    app.printer.heading("Launching job...");
    let job = Launcher::new(&stager, &cache, &agent_path, &app.config.base_image)
        .launch(&request)
        .await
        .map_err(explain)?;
    app.printer
        .success(&format!("Job launched: {}", job.job_name));

    app.printer
        .heading("Waiting for logs... You can kill kris safely now.");
    let stream = client.wait_for_logs(&job.job_name).await?;
    print_stream(stream).await
}

pub async fn transfer(app: &App, src: &str, dst: &str) -> Result<()> {
    let client = app.client()?;
    let status = RemoteFs::new(&client, &app.config.buckets)
        .transfer(src, dst)
        .await
        .map_err(explain)?;
    app.printer
        .success(&format!("Transfer {} finished: {status}", status.job_name));
    Ok(())
}

pub async fn upload(app: &App, local: &Path) -> Result<()> {
    let client = app.client()?;
    let store = app.object_store()?;
    let stager = Stager::new(&store, RemoteFs::new(&client, &app.config.buckets))
        .with_scratch_dir(app.config.home.scratch_dir());
    let remote = stager.stage(local).await.map_err(explain)?;
    app.printer
        .success(&format!("Uploaded {} to {remote}", local.display()));
    Ok(())
}

pub async fn build_image(app: &App, requirements: &Path) -> Result<()> {
    let client = app.client()?;
    let store = app.object_store()?;
    let cache = app.image_cache()?;
    let stager = Stager::new(&store, RemoteFs::new(&client, &app.config.buckets))
        .with_scratch_dir(app.config.home.scratch_dir());
    app.printer.heading("Building image...");
    let image = ImageBuilder::new(&stager, &cache, &app.config.base_image)
        .build(requirements)
        .await
        .map_err(explain)?;
    app.printer.success(&format!(
        "Image was built successfully. Identifier: {image}"
    ));
    Ok(())
}

pub fn add_bucket(app: &mut App) -> Result<()> {
    let alias = if app.config.buckets.contains(DEFAULT_BUCKET_ALIAS) {
        app.printer
            .heading("Enter alias for a new bucket, e. g. \"my-bucket\"");
        loop {
            let alias = ask("alias")?;
            if app.config.buckets.contains(&alias) {
                app.printer.failure(&format!("Bucket {alias} already exists"));
            } else {
                break alias;
            }
        }
    } else {
        DEFAULT_BUCKET_ALIAS.to_string()
    };

    app.printer.heading("Enter credentials for the new bucket:");
    let bucket = BucketConfig {
        bucket_id: ask("bucket_id")?,
        namespace: ask("namespace")?,
        access_key_id: ask("access_key_id")?,
        secret_access_key: ask_secret("secret_access_key")?,
        endpoint_url: None,
    };
    app.config.add_bucket(&alias, bucket)?;

    app.printer
        .success(&format!("Bucket {alias} was created successfully!"));
    app.printer.heading(&format!(
        "Your bucket configuration is stored here: {}",
        app.config.home.config_file.display()
    ));
    Ok(())
}

fn job_class(service: bool) -> JobClass {
    if service {
        JobClass::Service
    } else {
        JobClass::User
    }
}

async fn print_stream(mut stream: LogStream) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = stream.next().await {
        stdout.write_all(line?.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

/// Keeps "failed remotely" and "outcome unknown" distinct for the user.
fn explain(err: KrisError) -> anyhow::Error {
    let hint = if err.is_definite_failure() {
        "the remote job failed; `kris logs --service <job>` shows its output"
    } else if matches!(err, KrisError::AmbiguousRemoteStatus { .. }) {
        "the remote work may still be running; check it with `kris status --service <job>`"
    } else {
        return err.into();
    };
    anyhow::Error::new(err).context(hint)
}
