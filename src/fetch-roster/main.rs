use std::path::PathBuf;

use chrono::Datelike;
use clap::Parser;
use rooster::{config::Settings, portal::RoiScraper, week::WeekRef};

/// One-shot roster download, bypassing the mail trigger.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, env = "CONFIG_PATH", default_value = "config/config.yaml")]
    config: PathBuf,

    /// ISO week number to navigate to; defaults to the portal's current
    /// view.
    #[arg(long)]
    week: Option<u32>,

    /// ISO year for --week; defaults to the current year.
    #[arg(long, requires = "week")]
    year: Option<i32>,

    /// Directory to save the .ics file into.
    #[arg(long, default_value = "downloads")]
    out: PathBuf,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    pretty_env_logger::init_timed();

    let args = Args::parse();
    let settings = Settings::load(&args.config)?;

    let target = match args.week {
        Some(week) => {
            let year = args.year.unwrap_or_else(|| chrono::Local::now().year());
            Some(
                WeekRef::new(year, week)
                    .ok_or_else(|| anyhow::anyhow!("{year} has no ISO week {week}"))?,
            )
        }
        None => None,
    };

    let path = RoiScraper::new(&settings.portal).download_roster(&args.out, target)?;
    log::info!("downloaded to {}", path.display());
    Ok(())
}
