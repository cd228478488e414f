use std::path::{Path, PathBuf};

use clap::Parser;
use rooster::{
    config::{LoggingSettings, Settings},
    schedule::Automation,
};
use tracing_subscriber::{EnvFilter, fmt::writer::MakeWriterExt};

/// Rooster automation daemon: watches the mailbox for roster
/// notifications and syncs the exported roster to a CalDAV calendar.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, env = "CONFIG_PATH", default_value = "config/config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let settings = Settings::load(&args.config)?;
    let _guard = init_logging(&settings.logging);

    Automation::new(settings)?.run().await
}

/// Console logging, plus a log file when one is configured. The file
/// writer tees with stdout rather than replacing it; the guard keeps the
/// file writer flushing until the process exits.
fn init_logging(cfg: &LoggingSettings) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    if let Some(path) = &cfg.file {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = path
            .file_name()
            .map_or_else(|| "rooster.log".into(), ToOwned::to_owned);
        let (file_writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(file_writer.and(std::io::stdout))
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io,
        sync::{Arc, Mutex},
    };
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Self;

        fn make_writer(&'a self) -> Self {
            self.clone()
        }
    }

    #[test]
    fn file_logging_tees_with_the_console() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("rooster.log");
        let (file_writer, guard) = tracing_appender::non_blocking(
            tracing_appender::rolling::never(dir.path(), "rooster.log"),
        );
        let console = Capture::default();

        let subscriber = tracing_subscriber::fmt()
            .with_writer(file_writer.and(console.clone()))
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("daemon heartbeat");
        });
        // Joining the worker flushes the file side.
        drop(guard);

        let file_out = std::fs::read_to_string(log_path).unwrap();
        assert!(file_out.contains("daemon heartbeat"));
        let console_out = String::from_utf8(console.0.lock().unwrap().clone()).unwrap();
        assert!(console_out.contains("daemon heartbeat"));
    }
}
