//! Settings: a YAML file for portal ids, schedule and logging, plus
//! required secrets from the environment. Loaded once at startup into an
//! immutable `Settings` that is passed by reference — there is no global.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use chrono::Weekday;
use serde::Deserialize;

/// Fully merged, validated settings.
#[derive(Clone, Debug)]
pub struct Settings {
    pub portal: PortalSettings,
    pub mail: MailSettings,
    pub schedule: ScheduleSettings,
    pub caldav: CaldavSettings,
    pub logging: LoggingSettings,
    pub storage: StorageSettings,
}

#[derive(Clone, Debug)]
pub struct PortalSettings {
    pub url: String,
    pub username_field_id: String,
    pub password_field_id: String,
    pub login_button_id: String,
    pub month_radio_button_id: String,
    pub calendar_export_button_id: String,
    pub week_display_id: String,
    pub prev_week_button_id: String,
    pub next_week_button_id: String,
    pub email: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub struct MailSettings {
    pub imap_host: String,
    pub check_interval_minutes: u64,
    pub address: String,
    pub app_password: String,
    pub trigger_sender: String,
    pub trigger_subject: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ScheduleSettings {
    pub active_days: Vec<Weekday>,
    pub start_hour: u32,
    pub end_hour: u32,
}

#[derive(Clone, Debug)]
pub struct CaldavSettings {
    pub url: String,
    pub username: String,
    pub password: String,
    pub calendar_name: String,
}

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub level: String,
    pub file: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct StorageSettings {
    pub download_dir: PathBuf,
    pub retention_days: i64,
}

/// The YAML side of the configuration.
#[derive(Debug, Deserialize)]
pub struct FileConfig {
    pub portal: PortalFile,
    #[serde(default)]
    pub mail: MailFile,
    pub schedule: ScheduleFile,
    #[serde(default)]
    pub logging: LoggingFile,
    #[serde(default)]
    pub storage: StorageFile,
}

#[derive(Debug, Deserialize)]
pub struct PortalFile {
    pub url: String,
    pub username_field_id: String,
    pub password_field_id: String,
    pub login_button_id: String,
    pub month_radio_button_id: String,
    pub calendar_export_button_id: String,
    pub week_display_id: String,
    pub prev_week_button_id: String,
    pub next_week_button_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MailFile {
    pub imap_host: String,
    pub check_interval_minutes: u64,
    pub trigger_subject: Option<String>,
}

impl Default for MailFile {
    fn default() -> Self {
        Self {
            imap_host: "imap.gmail.com".to_owned(),
            check_interval_minutes: 10,
            trigger_subject: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScheduleFile {
    pub active_days: Vec<String>,
    pub start_hour: u32,
    pub end_hour: u32,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingFile {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingFile {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            file: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageFile {
    pub download_dir: PathBuf,
    pub retention_days: i64,
}

impl Default for StorageFile {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("temp_downloads"),
            retention_days: 90,
        }
    }
}

/// Secrets supplied via the environment. Every required value fails fast
/// at startup when absent.
#[derive(Clone, Debug)]
pub struct EnvSecrets {
    pub portal_email: String,
    pub portal_password: String,
    pub mail_address: String,
    pub mail_app_password: String,
    pub trigger_sender: String,
    pub caldav_url: String,
    pub caldav_username: String,
    pub caldav_password: String,
    pub caldav_calendar_name: String,
}

fn require_env(name: &str) -> anyhow::Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => bail!("{name} environment variable is not set"),
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_owned())
}

impl EnvSecrets {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            portal_email: require_env("PORTAL_EMAIL")?,
            portal_password: require_env("PORTAL_PASSWORD")?,
            mail_address: require_env("MAIL_ADDRESS")?,
            mail_app_password: require_env("MAIL_APP_PASSWORD")?,
            trigger_sender: env_or("TRIGGER_EMAIL_SENDER", "noreply@staff.nl"),
            caldav_url: require_env("CALDAV_URL")?,
            caldav_username: require_env("CALDAV_USERNAME")?,
            caldav_password: require_env("CALDAV_PASSWORD")?,
            caldav_calendar_name: env_or("CALDAV_CALENDAR_NAME", "Rooster"),
        })
    }
}

impl Settings {
    /// Reads the YAML file, pulls secrets from the environment and
    /// validates the result.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let file: FileConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        let secrets = EnvSecrets::from_env()?;
        Self::from_parts(file, secrets)
    }

    pub fn from_parts(file: FileConfig, secrets: EnvSecrets) -> anyhow::Result<Self> {
        let active_days = file
            .schedule
            .active_days
            .iter()
            .map(|day| {
                day.parse::<Weekday>()
                    .map_err(|_| anyhow::anyhow!("unknown day of week in schedule: {day:?}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        if active_days.is_empty() {
            bail!("schedule.active_days must not be empty");
        }
        if file.schedule.start_hour >= file.schedule.end_hour || file.schedule.end_hour > 24 {
            bail!(
                "invalid schedule window {}:00-{}:00",
                file.schedule.start_hour,
                file.schedule.end_hour,
            );
        }
        if file.mail.check_interval_minutes == 0 {
            bail!("mail.check_interval_minutes must be at least 1");
        }

        Ok(Self {
            portal: PortalSettings {
                url: file.portal.url,
                username_field_id: file.portal.username_field_id,
                password_field_id: file.portal.password_field_id,
                login_button_id: file.portal.login_button_id,
                month_radio_button_id: file.portal.month_radio_button_id,
                calendar_export_button_id: file.portal.calendar_export_button_id,
                week_display_id: file.portal.week_display_id,
                prev_week_button_id: file.portal.prev_week_button_id,
                next_week_button_id: file.portal.next_week_button_id,
                email: secrets.portal_email,
                password: secrets.portal_password,
            },
            mail: MailSettings {
                imap_host: file.mail.imap_host,
                check_interval_minutes: file.mail.check_interval_minutes,
                address: secrets.mail_address,
                app_password: secrets.mail_app_password,
                trigger_sender: secrets.trigger_sender,
                trigger_subject: file.mail.trigger_subject,
            },
            schedule: ScheduleSettings {
                active_days,
                start_hour: file.schedule.start_hour,
                end_hour: file.schedule.end_hour,
            },
            caldav: CaldavSettings {
                url: secrets.caldav_url,
                username: secrets.caldav_username,
                password: secrets.caldav_password,
                calendar_name: secrets.caldav_calendar_name,
            },
            logging: LoggingSettings {
                level: file.logging.level,
                file: file.logging.file,
            },
            storage: StorageSettings {
                download_dir: file.storage.download_dir,
                retention_days: file.storage.retention_days,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
portal:
  url: https://portal.example/login
  username_field_id: user
  password_field_id: pass
  login_button_id: login
  month_radio_button_id: month
  calendar_export_button_id: export
  week_display_id: week-display
  prev_week_button_id: prev
  next_week_button_id: next
schedule:
  active_days: [monday, tuesday]
  start_hour: 8
  end_hour: 18
"#;

    fn secrets() -> EnvSecrets {
        EnvSecrets {
            portal_email: "me@example.com".into(),
            portal_password: "hunter2".into(),
            mail_address: "me@gmail.com".into(),
            mail_app_password: "app".into(),
            trigger_sender: "noreply@staff.nl".into(),
            caldav_url: "https://caldav.example/".into(),
            caldav_username: "me".into(),
            caldav_password: "secret".into(),
            caldav_calendar_name: "Rooster".into(),
        }
    }

    fn parse(yaml: &str) -> FileConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn minimal_yaml_gets_defaults() {
        let s = Settings::from_parts(parse(MINIMAL_YAML), secrets()).unwrap();
        assert_eq!(s.mail.imap_host, "imap.gmail.com");
        assert_eq!(s.mail.check_interval_minutes, 10);
        assert_eq!(s.logging.level, "info");
        assert_eq!(s.storage.retention_days, 90);
        assert_eq!(s.storage.download_dir, PathBuf::from("temp_downloads"));
        assert_eq!(s.schedule.active_days, vec![Weekday::Mon, Weekday::Tue]);
    }

    #[test]
    fn bad_day_name_is_rejected() {
        let yaml = MINIMAL_YAML.replace("monday", "someday");
        let err = Settings::from_parts(parse(&yaml), secrets()).unwrap_err();
        assert!(err.to_string().contains("someday"));
    }

    #[test]
    fn inverted_window_is_rejected() {
        let yaml = MINIMAL_YAML.replace("end_hour: 18", "end_hour: 5");
        assert!(Settings::from_parts(parse(&yaml), secrets()).is_err());
    }

    #[test]
    fn missing_secret_fails_fast() {
        let err = require_env("ROOSTER_TEST_UNSET_SECRET").unwrap_err();
        assert!(err.to_string().contains("ROOSTER_TEST_UNSET_SECRET"));
    }
}
