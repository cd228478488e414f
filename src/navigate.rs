//! Week-Navigation Engine.
//!
//! The portal's calendar only exposes relative next/previous-week controls
//! and a free-text "current week" label, so the engine re-reads the label
//! after every batch of clicks and recomputes the gap — click effects can
//! be dropped or duplicated under network lag, and accumulated click
//! counts cannot be trusted. Calling it repeatedly with the same target
//! converges and then becomes a no-op.

use core::time::Duration;

use crate::week::{self, WeekRef};

/// Page capabilities the engine needs. Implemented by the live portal tab
/// and by scripted fakes in tests.
pub trait WeekPage {
    /// Current text of the week-display element.
    fn week_display(&mut self) -> anyhow::Result<String>;
    fn click_next(&mut self) -> anyhow::Result<()>;
    fn click_prev(&mut self) -> anyhow::Result<()>;
    /// Give the UI time to absorb interactions before the next read.
    fn settle(&mut self, wait: Duration);
}

/// Terminal outcome of one navigation run. Anything other than
/// `ReachedTarget` is a reported status, not an error — the caller decides
/// whether to abort.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Outcome {
    /// The display was confirmed to show the target reference.
    ReachedTarget,
    /// The display text never matched the expected pattern.
    GaveUpUnparseable,
    /// The gap exceeded the click safety bound; no clicks were issued.
    GaveUpTooFar { weeks: i64 },
    /// Attempt budget exhausted without confirming the target.
    GaveUpMaxAttempts,
}

/// Navigation bounds and pacing.
#[derive(Clone, Copy, Debug)]
pub struct Navigator {
    /// Read-and-correct attempts before giving up.
    pub max_retries: u32,
    /// Total weeks of drift tolerated before refusing to click at all.
    pub max_clicks: i64,
    /// Clicks issued per batch before the display is re-sampled.
    pub click_batch: i64,
    /// Pause between individual clicks so the UI registers each one.
    pub click_pause: Duration,
    /// Longer wait after a batch before re-reading the display.
    pub settle_wait: Duration,
}

impl Default for Navigator {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_clicks: 30,
            click_batch: 5,
            click_pause: Duration::from_millis(200),
            settle_wait: Duration::from_millis(500),
        }
    }
}

impl Navigator {
    /// Drives `page` toward `target`. Read and parse problems stay in-band
    /// as outcomes; a failing click is a fatal automation error and
    /// propagates.
    pub fn run<P: WeekPage>(&self, page: &mut P, target: WeekRef) -> anyhow::Result<Outcome> {
        tracing::info!(target: "navigate", "navigating to {target}");

        for attempt in 0..self.max_retries {
            let display_text = match page.week_display() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(target: "navigate", "could not read week display: {e}, retrying");
                    page.settle(self.settle_wait);
                    continue;
                }
            };
            tracing::debug!(target: "navigate", "week display: {display_text:?}");

            // An unparseable label will not become parseable by blind
            // retries; stop instead of looping.
            let Some(current) = week::parse_week_display(&display_text) else {
                tracing::warn!(target: "navigate", "could not parse week display {display_text:?}, stopping");
                return Ok(Outcome::GaveUpUnparseable);
            };

            let Some(diff_weeks) = current.weeks_until(target) else {
                tracing::warn!(target: "navigate", "no ISO date for {target}, stopping");
                return Ok(Outcome::GaveUpUnparseable);
            };

            if diff_weeks == 0 {
                tracing::info!(target: "navigate", "reached {target}");
                return Ok(Outcome::ReachedTarget);
            }

            if diff_weeks.abs() > self.max_clicks {
                tracing::warn!(target: "navigate", "target is {diff_weeks} weeks away, safety break");
                return Ok(Outcome::GaveUpTooFar { weeks: diff_weeks });
            }

            let clicks = diff_weeks.abs().min(self.click_batch);
            tracing::info!(
                target: "navigate",
                "gap is {diff_weeks} weeks, clicking {clicks} times (attempt {}/{})",
                attempt + 1,
                self.max_retries,
            );

            for _ in 0..clicks {
                if diff_weeks > 0 {
                    page.click_next()?;
                } else {
                    page.click_prev()?;
                }
                page.settle(self.click_pause);
            }
            // The UI is the source of truth: loop back and re-read rather
            // than assuming the clicks landed.
            page.settle(self.settle_wait);
        }

        tracing::warn!(target: "navigate", "attempt budget exhausted without reaching {target}");
        Ok(Outcome::GaveUpMaxAttempts)
    }
}
