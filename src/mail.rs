//! Trigger Monitor: watches an IMAP inbox for roster notification mail.
//!
//! Each check opens a fresh session, searches for matching messages and
//! compares the highest UID against a process-lifetime watermark. The very
//! first observation only records the watermark — pre-existing mail must
//! not fire a download on startup. Any mailbox failure is reported as
//! "no trigger": the scheduler will simply look again next tick.

use core::time::Duration;

use anyhow::Context;
use mailparse::MailHeaderMap;

use crate::{config::MailSettings, retry::RetryPolicy, week};

const CONNECT_RETRY: RetryPolicy = RetryPolicy::new(3, Duration::from_secs(2), 2.0);

/// Result of one inbox check. `week` carries the target-week hint parsed
/// from the trigger subject, when present.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TriggerCheck {
    pub found: bool,
    pub week: Option<u32>,
}

#[derive(Debug, Default)]
pub struct TriggerMonitor {
    watermark: Option<u32>,
}

impl TriggerMonitor {
    #[must_use]
    pub const fn new() -> Self {
        Self { watermark: None }
    }

    /// Checks the inbox once. Fail-open: errors are logged and reported as
    /// "nothing to do".
    pub fn check(&mut self, cfg: &MailSettings) -> TriggerCheck {
        match self.poll(cfg) {
            Ok(check) => check,
            Err(e) => {
                tracing::error!(target: "mail", "error checking mail: {e:#}");
                TriggerCheck::default()
            }
        }
    }

    fn poll(&mut self, cfg: &MailSettings) -> anyhow::Result<TriggerCheck> {
        let mut session = CONNECT_RETRY.run_blocking("imap connect", || connect(cfg))?;
        let result = self.search(&mut session, cfg);
        let _ = session.logout();
        result
    }

    fn search(
        &mut self,
        session: &mut imap::Session<native_tls::TlsStream<std::net::TcpStream>>,
        cfg: &MailSettings,
    ) -> anyhow::Result<TriggerCheck> {
        session.select("INBOX").context("selecting INBOX")?;

        let criteria = match &cfg.trigger_subject {
            Some(subject) => format!(
                "OR FROM \"{}\" SUBJECT \"{}\"",
                cfg.trigger_sender, subject
            ),
            None => format!("FROM \"{}\"", cfg.trigger_sender),
        };
        tracing::debug!(target: "mail", "searching with criteria {criteria:?}");

        let uids = session.uid_search(&criteria).context("searching inbox")?;
        let latest = uids.iter().max().copied();

        if !self.observe(latest) {
            tracing::debug!(target: "mail", "no new mail since last check");
            return Ok(TriggerCheck::default());
        }

        let latest = latest.unwrap_or_default();
        tracing::info!(target: "mail", "new trigger mail, uid {latest}");

        // Header details are for the log and the week hint only; a fetch
        // failure must not cancel the trigger itself.
        let week = match self.subject_of(session, latest) {
            Ok(Some(subject)) => week::parse_week_hint(&subject),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(target: "mail", "could not fetch trigger mail {latest}: {e}");
                None
            }
        };

        Ok(TriggerCheck { found: true, week })
    }

    fn subject_of(
        &self,
        session: &mut imap::Session<native_tls::TlsStream<std::net::TcpStream>>,
        uid: u32,
    ) -> anyhow::Result<Option<String>> {
        let fetches = session.uid_fetch(uid.to_string(), "(RFC822.HEADER)")?;
        let Some(header) = fetches.iter().next().and_then(imap::types::Fetch::header) else {
            return Ok(None);
        };

        let (headers, _) = mailparse::parse_headers(header)?;
        let subject = headers.get_first_value("Subject");
        tracing::info!(
            target: "mail",
            "trigger mail: from {:?}, subject {:?}, date {:?}",
            headers.get_first_value("From"),
            subject,
            headers.get_first_value("Date"),
        );
        Ok(subject)
    }

    /// Watermark step: true only when `latest` is strictly newer than the
    /// stored watermark. The first ever observation records the watermark
    /// without triggering.
    fn observe(&mut self, latest: Option<u32>) -> bool {
        let Some(latest) = latest else {
            tracing::debug!(target: "mail", "no matching mail in inbox");
            return false;
        };
        match self.watermark {
            None => {
                tracing::info!(target: "mail", "first check, storing watermark uid {latest}");
                self.watermark = Some(latest);
                false
            }
            Some(seen) if latest > seen => {
                self.watermark = Some(latest);
                true
            }
            Some(_) => false,
        }
    }
}

fn connect(
    cfg: &MailSettings,
) -> anyhow::Result<imap::Session<native_tls::TlsStream<std::net::TcpStream>>> {
    tracing::debug!(target: "mail", "connecting to {}", cfg.imap_host);
    let tls = native_tls::TlsConnector::builder().build()?;
    let client = imap::connect((cfg.imap_host.as_str(), 993), cfg.imap_host.as_str(), &tls)?;
    client
        .login(&cfg.address, &cfg.app_password)
        .map_err(|(e, _)| anyhow::Error::from(e).context("imap login"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_never_triggers() {
        let mut monitor = TriggerMonitor::new();
        assert!(!monitor.observe(Some(5)));
        assert_eq!(monitor.watermark, Some(5));
    }

    #[test]
    fn same_uid_does_not_retrigger() {
        let mut monitor = TriggerMonitor::new();
        assert!(!monitor.observe(Some(5)));
        assert!(!monitor.observe(Some(5)));
        assert_eq!(monitor.watermark, Some(5));
    }

    #[test]
    fn newer_uid_triggers_and_advances() {
        let mut monitor = TriggerMonitor::new();
        assert!(!monitor.observe(Some(5)));
        assert!(!monitor.observe(Some(5)));
        assert!(monitor.observe(Some(7)));
        assert_eq!(monitor.watermark, Some(7));
        assert!(!monitor.observe(Some(7)));
    }

    #[test]
    fn empty_inbox_leaves_watermark_alone() {
        let mut monitor = TriggerMonitor::new();
        assert!(!monitor.observe(None));
        assert_eq!(monitor.watermark, None);
        assert!(!monitor.observe(Some(3)));
        assert!(!monitor.observe(None));
        assert_eq!(monitor.watermark, Some(3));
    }

    #[test]
    fn lower_uid_is_ignored() {
        // An expunge can shrink the highest UID; never re-trigger on it.
        let mut monitor = TriggerMonitor::new();
        monitor.observe(Some(9));
        assert!(!monitor.observe(Some(4)));
        assert_eq!(monitor.watermark, Some(9));
    }
}
