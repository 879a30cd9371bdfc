use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use run_query::RunRef;
use run_timeline::active_target;
use url::Url;

mod config;
mod watch;

use config::Config;
use watch::WatchOptions;

#[derive(Parser, Debug)]
#[command(
    name = "run-watch",
    about = "Follow a live automation run: status, timeline, screenshots and remote control"
)]
struct Args {
    /// Workflow run id (or task id with `--task`).
    run_id: String,

    /// Treat `run_id` as a task run.
    #[arg(long)]
    task: bool,

    /// Active item: `stream`, a block/action/thought id, or a page URL carrying `?active=`.
    #[arg(long)]
    active: Option<String>,

    /// Keep streaming screenshots after the run is finalized.
    #[arg(long)]
    always_stream: bool,

    /// Request remote control once the command channel connects.
    #[arg(long)]
    take_control: bool,

    /// Save decoded screenshots into this directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env().context("load run-watch configuration")?;

    let run = if args.task {
        RunRef::task(args.run_id)
    } else {
        RunRef::workflow_run(args.run_id)
    };
    if let Some(output_dir) = &args.output_dir {
        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("create output dir {}", output_dir.display()))?;
    }

    watch::run(
        config,
        WatchOptions {
            run,
            active: args.active.as_deref().and_then(parse_active),
            always_stream: args.always_stream,
            take_control: args.take_control,
            output_dir: args.output_dir,
        },
    )
    .await
}

fn parse_active(raw: &str) -> Option<String> {
    match Url::parse(raw) {
        Ok(url) => active_target(&url),
        Err(_) => Some(raw.trim().to_string()).filter(|value| !value.is_empty()),
    }
}
