use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kris_core::config::{Config, KrisHome};
use kris_core::credentials::KeyringStore;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod output;
mod prompt;

use crate::cli::{Cli, Command};
use crate::commands::App;
use crate::output::Printer;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let printer = Printer::detect();
    match run(cli, printer).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::debug!("{err:?}");
            printer.failure(&format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        // RUST_LOG wins when it is set to a valid filter.
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn run(cli: Cli, printer: Printer) -> Result<()> {
    let home = KrisHome::find().context("cannot locate the kris configuration directory")?;
    let config = Config::load(home).context("failed to load configuration")?;
    let mut app = App {
        config,
        store: Arc::new(KeyringStore::new()),
        printer,
    };

    if !cli.command.is_setup() {
        app.check_ready()?;
    }

    match cli.command {
        Command::Auth(args) => commands::auth(&app, args).await,
        Command::List(args) => commands::list(&app, args.service).await,
        Command::Status(args) => commands::status(&app, args).await,
        Command::Logs(args) => commands::logs(&app, args).await,
        Command::Run(args) => commands::run(&app, args).await,
        Command::Transfer(args) => commands::transfer(&app, &args.src, &args.dst).await,
        Command::Upload(args) => commands::upload(&app, &args.local_path).await,
        Command::BuildImage(args) => commands::build_image(&app, &args.requirements).await,
        Command::AddBucket => commands::add_bucket(&mut app),
    }
}
