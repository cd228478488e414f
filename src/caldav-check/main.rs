use std::path::PathBuf;

use clap::Parser;
use rooster::{caldav::CaldavStore, config::Settings};

/// CalDAV diagnostics: verify the connection, list calendars and show
/// where roster events will land. Optionally upload a file or prune by
/// hand.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, env = "CONFIG_PATH", default_value = "config/config.yaml")]
    config: PathBuf,

    /// Upload this .ics file after the connection check.
    #[arg(long)]
    upload: Option<PathBuf>,

    /// Delete events that ended more than this many days ago.
    #[arg(long)]
    prune: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    pretty_env_logger::init_timed();

    let args = Args::parse();
    let settings = Settings::load(&args.config)?;
    let mut store = CaldavStore::new(&settings.caldav)?;

    let names = store.calendars().await?;
    log::info!("found {} calendars: {names:?}", names.len());

    let resolved = store.resolve().await?;
    log::info!("roster events go to {:?} ({})", resolved.name, resolved.url);

    if let Some(file) = args.upload {
        let stats = store.upload(&file).await?;
        log::info!("uploaded {}, failed {}", stats.uploaded, stats.failed);
    }

    if let Some(days) = args.prune {
        let removed = store.prune(days).await?;
        log::info!("removed {removed} old events");
    }

    Ok(())
}
