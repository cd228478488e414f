//! Orchestrator: a sequential tick loop around trigger check → scrape →
//! sync. One check runs at a time; a failed cycle is logged and the next
//! scheduled tick starts over from scratch.

use core::time::Duration;
use std::time::Instant;

use chrono::{DateTime, Datelike, Local, Timelike};

use crate::{
    caldav::CaldavStore,
    config::{MailSettings, ScheduleSettings, Settings},
    mail::{TriggerCheck, TriggerMonitor},
    portal::RoiScraper,
    week::WeekRef,
};

/// Seam between the tick loop and the mailbox, so tick behavior is
/// testable without IMAP.
pub trait TriggerSource {
    fn check(&mut self, cfg: &MailSettings) -> TriggerCheck;
}

impl TriggerSource for TriggerMonitor {
    fn check(&mut self, cfg: &MailSettings) -> TriggerCheck {
        Self::check(self, cfg)
    }
}

/// What one tick did. `Idle` ticks never touch the mailbox; `NoTrigger`
/// ticks never touch the portal or the calendar server.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TickOutcome {
    Idle,
    NoTrigger,
    Synced,
    Failed,
}

pub struct Automation<S = TriggerMonitor> {
    settings: Settings,
    monitor: S,
    store: CaldavStore,
}

impl Automation {
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        Self::with_trigger_source(settings, TriggerMonitor::new())
    }
}

impl<S: TriggerSource> Automation<S> {
    pub fn with_trigger_source(settings: Settings, monitor: S) -> anyhow::Result<Self> {
        let store = CaldavStore::new(&settings.caldav)?;
        Ok(Self {
            settings,
            monitor,
            store,
        })
    }

    /// The scheduled loop: wake once a minute, run a check when the
    /// configured interval has elapsed, stop on ctrl-c after the current
    /// tick's work finishes.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let schedule = &self.settings.schedule;
        tracing::info!(target: "schedule", "rooster automation started");
        tracing::info!(
            target: "schedule",
            "active days {:?}, {}:00-{}:00, checking every {} minutes",
            schedule.active_days,
            schedule.start_hour,
            schedule.end_hour,
            self.settings.mail.check_interval_minutes,
        );

        tracing::info!(target: "schedule", "running initial check");
        self.tick(Local::now()).await;

        let interval = Duration::from_secs(self.settings.mail.check_interval_minutes * 60);
        let mut last_check = Instant::now();
        tracing::info!(target: "schedule", "entering main monitoring loop");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!(target: "schedule", "stopped by user");
                    return Ok(());
                }
                () = tokio::time::sleep(Duration::from_secs(60)) => {
                    if last_check.elapsed() >= interval {
                        last_check = Instant::now();
                        self.tick(Local::now()).await;
                    }
                }
            }
        }
    }

    pub async fn tick(&mut self, now: DateTime<Local>) -> TickOutcome {
        if !in_active_window(&self.settings.schedule, now) {
            tracing::debug!(target: "schedule", "outside active window, skipping check");
            return TickOutcome::Idle;
        }

        tracing::info!(target: "schedule", "checking for trigger mail");
        let check = tokio::task::block_in_place(|| self.monitor.check(&self.settings.mail));
        if !check.found {
            tracing::debug!(target: "schedule", "no trigger mail found");
            return TickOutcome::NoTrigger;
        }

        tracing::info!(target: "schedule", "trigger mail detected, starting download");
        match self.download_and_sync(check.week).await {
            Ok(()) => TickOutcome::Synced,
            Err(e) => {
                tracing::error!(target: "schedule", "download cycle failed: {e:#}");
                TickOutcome::Failed
            }
        }
    }

    async fn download_and_sync(&mut self, week_hint: Option<u32>) -> anyhow::Result<()> {
        let target = target_from_hint(week_hint);
        let dir = self.settings.storage.download_dir.clone();
        let portal = self.settings.portal.clone();
        let path =
            tokio::task::block_in_place(|| RoiScraper::new(&portal).download_roster(&dir, target))?;

        let stats = self.store.upload(&path).await?;
        tracing::info!(
            target: "schedule",
            "{} events synced to calendar",
            stats.uploaded,
        );
        self.store.prune(self.settings.storage.retention_days).await?;
        Ok(())
    }
}

/// A bare week hint gets the current year; hints that do not exist in the
/// current ISO year (week 53 of a short year) are dropped.
fn target_from_hint(week_hint: Option<u32>) -> Option<WeekRef> {
    let week = week_hint?;
    let target = WeekRef::new(Local::now().year(), week);
    if target.is_none() {
        tracing::warn!(target: "schedule", "ignoring invalid week hint {week}");
    }
    target
}

#[must_use]
pub fn in_active_window(cfg: &ScheduleSettings, now: DateTime<Local>) -> bool {
    cfg.active_days.contains(&now.weekday())
        && (cfg.start_hour..cfg.end_hour).contains(&now.hour())
}
