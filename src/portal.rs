//! Roster Scraper: one headless Chrome session per download.
//!
//! Login, optional week navigation, month view, export. The browser is
//! owned by the call and torn down on every exit path; sessions are never
//! reused across calls.

use core::time::Duration;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{Context, bail};
use headless_chrome::{Browser, LaunchOptions, Tab, protocol::cdp::Page};

use crate::{
    config::PortalSettings,
    navigate::{Navigator, Outcome, WeekPage},
    week::WeekRef,
};

const SETTLE: Duration = Duration::from_millis(750);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

pub struct RoiScraper<'a> {
    portal: &'a PortalSettings,
    navigator: Navigator,
}

impl<'a> RoiScraper<'a> {
    #[must_use]
    pub fn new(portal: &'a PortalSettings) -> Self {
        Self {
            portal,
            navigator: Navigator::default(),
        }
    }

    /// Downloads the roster as an `.ics` file into `output_dir` and
    /// returns its deterministic path. With `target = None` the portal's
    /// default (current) week is exported.
    pub fn download_roster(
        &self,
        output_dir: &Path,
        target: Option<WeekRef>,
    ) -> anyhow::Result<PathBuf> {
        match target {
            Some(week) => tracing::info!(target: "portal", "starting roster download for {week}"),
            None => tracing::info!(target: "portal", "starting roster download for the current view"),
        }

        let browser = Browser::new(LaunchOptions {
            headless: true,
            idle_browser_timeout: Duration::from_secs(300),
            ..LaunchOptions::default()
        })?;
        let tab = browser.new_tab()?;
        tab.set_default_timeout(Duration::from_secs(20));

        self.login(&tab)?;

        if let Some(week) = target {
            let mut page = PortalTab {
                tab: &tab,
                portal: self.portal,
            };
            match self.navigator.run(&mut page, week)? {
                Outcome::ReachedTarget => {}
                // Best effort: download whatever week is displayed.
                outcome => tracing::warn!(
                    target: "portal",
                    "week navigation ended with {outcome:?}, downloading the displayed week"
                ),
            }
        }

        self.select_month_view(&tab)?;
        let path = self.export(&tab, output_dir, target)?;
        tracing::info!(target: "portal", "roster saved to {}", path.display());
        Ok(path)
    }

    fn login(&self, tab: &Tab) -> anyhow::Result<()> {
        tracing::info!(target: "portal", "navigating to {}", self.portal.url);
        tab.navigate_to(&self.portal.url)?;
        tab.wait_until_navigated()?;

        tracing::info!(target: "portal", "logging in");
        tab.wait_for_element(&css_id(&self.portal.username_field_id))?
            .click()?;
        tab.type_str(&self.portal.email)?;
        tab.find_element(&css_id(&self.portal.password_field_id))?
            .click()?;
        tab.type_str(&self.portal.password)?;
        tab.find_element(&css_id(&self.portal.login_button_id))?
            .click()?;
        tab.wait_until_navigated()?;
        std::thread::sleep(SETTLE);
        tracing::info!(target: "portal", "logged in");
        Ok(())
    }

    fn select_month_view(&self, tab: &Tab) -> anyhow::Result<()> {
        tracing::debug!(target: "portal", "selecting month view");
        tab.wait_for_element(&css_id(&self.portal.month_radio_button_id))?
            .click()?;
        std::thread::sleep(SETTLE);
        Ok(())
    }

    fn export(
        &self,
        tab: &Tab,
        output_dir: &Path,
        target: Option<WeekRef>,
    ) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("creating {}", output_dir.display()))?;
        let dir = output_dir.canonicalize()?;

        tab.call_method(Page::SetDownloadBehavior {
            behavior: Page::SetDownloadBehaviorBehaviorOption::Allow,
            download_path: Some(dir.to_string_lossy().into_owned()),
        })?;

        let before = snapshot(&dir)?;
        tracing::info!(target: "portal", "initiating download");
        tab.wait_for_element(&css_id(&self.portal.calendar_export_button_id))?
            .click()?;

        let downloaded = wait_for_download(&dir, &before, DOWNLOAD_TIMEOUT)?;
        let path = dir.join(roster_filename(target.unwrap_or_else(WeekRef::now)));
        std::fs::rename(&downloaded, &path)
            .with_context(|| format!("renaming {} to {}", downloaded.display(), path.display()))?;
        Ok(path)
    }
}

/// Live implementation of the navigation engine's page capability.
struct PortalTab<'a> {
    tab: &'a Tab,
    portal: &'a PortalSettings,
}

impl WeekPage for PortalTab<'_> {
    fn week_display(&mut self) -> anyhow::Result<String> {
        self.tab
            .wait_for_element(&css_id(&self.portal.week_display_id))?
            .get_inner_text()
    }

    fn click_next(&mut self) -> anyhow::Result<()> {
        self.tab
            .find_element(&css_id(&self.portal.next_week_button_id))?
            .click()?;
        Ok(())
    }

    fn click_prev(&mut self) -> anyhow::Result<()> {
        self.tab
            .find_element(&css_id(&self.portal.prev_week_button_id))?
            .click()?;
        Ok(())
    }

    fn settle(&mut self, wait: Duration) {
        std::thread::sleep(wait);
    }
}

fn css_id(id: &str) -> String {
    format!("#{id}")
}

fn roster_filename(week: WeekRef) -> String {
    format!("roster_{}_week_{:02}.ics", week.year, week.week)
}

fn snapshot(dir: &Path) -> std::io::Result<HashSet<PathBuf>> {
    Ok(std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .collect())
}

/// Waits for Chrome to finish writing a new file into `dir`: anything not
/// present in `before` that is not a partial download.
fn wait_for_download(
    dir: &Path,
    before: &HashSet<PathBuf>,
    timeout: Duration,
) -> anyhow::Result<PathBuf> {
    let deadline = Instant::now() + timeout;
    loop {
        for path in snapshot(dir)? {
            if before.contains(&path) || is_partial(&path) {
                continue;
            }
            return Ok(path);
        }
        if Instant::now() >= deadline {
            bail!("download did not complete within {}s", timeout.as_secs());
        }
        std::thread::sleep(Duration::from_millis(500));
    }
}

fn is_partial(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("crdownload") || ext.eq_ignore_ascii_case("tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_deterministic_and_zero_padded() {
        assert_eq!(
            roster_filename(WeekRef::new(2025, 7).unwrap()),
            "roster_2025_week_07.ics"
        );
        assert_eq!(
            roster_filename(WeekRef::new(2024, 52).unwrap()),
            "roster_2024_week_52.ics"
        );
    }

    #[test]
    fn download_wait_picks_only_new_settled_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.ics"), "x").unwrap();
        let before = snapshot(dir.path()).unwrap();

        std::fs::write(dir.path().join("export.ics.crdownload"), "partial").unwrap();
        std::fs::write(dir.path().join("export.ics"), "BEGIN:VCALENDAR").unwrap();

        let found = wait_for_download(dir.path(), &before, Duration::from_secs(2)).unwrap();
        assert_eq!(found.file_name().unwrap().to_str(), Some("export.ics"));
    }

    #[test]
    fn download_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let before = snapshot(dir.path()).unwrap();
        let err = wait_for_download(dir.path(), &before, Duration::ZERO).unwrap_err();
        assert!(err.to_string().contains("download did not complete"));
    }
}
