//! Calendar Sync: pushes roster events to a CalDAV server and prunes old
//! ones.
//!
//! The connection is an explicit state machine, `Disconnected → Connected
//! (principal) → Resolved (calendar)`. Each transition is idempotent and
//! `reset` drops back to `Disconnected`, so a failed upload can rebuild
//! the session for a single event without restarting the batch.
//!
//! CalDAV is plain HTTP with XML bodies; the handful of fields needed from
//! multistatus responses (href, displayname, calendar-data) are mined with
//! regexes rather than an XML tree.

use core::time::Duration;
use std::{path::Path, sync::LazyLock};

use anyhow::{Context, anyhow, bail};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use icalendar::{Calendar, CalendarComponent, Component};
use regex::Regex;
use reqwest::{Method, StatusCode, Url, header::CONTENT_TYPE};

use crate::{config::CaldavSettings, retry::RetryPolicy};

const CONNECT_RETRY: RetryPolicy = RetryPolicy::new(3, Duration::from_secs(2), 2.0);

const PRINCIPAL_QUERY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:prop><d:current-user-principal/></d:prop></d:propfind>"#;

const HOME_SET_QUERY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
<d:prop><c:calendar-home-set/></d:prop></d:propfind>"#;

const CALENDAR_LIST_QUERY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:prop><d:displayname/><d:resourcetype/></d:prop></d:propfind>"#;

const EVENT_QUERY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
<d:prop><d:getetag/><c:calendar-data/></d:prop>
<c:filter><c:comp-filter name="VCALENDAR"><c:comp-filter name="VEVENT"/></c:comp-filter></c:filter>
</c:calendar-query>"#;

/// A calendar collection on the server.
#[derive(Clone, Debug)]
pub struct CalendarRef {
    pub name: String,
    pub url: Url,
}

#[derive(Debug)]
enum ConnState {
    Disconnected,
    Connected { principal: Url },
    Resolved { calendar: CalendarRef },
}

/// Counts for one upload batch. The batch as a whole only fails when
/// nothing succeeded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub uploaded: usize,
    pub failed: usize,
}

pub struct CaldavStore {
    http: reqwest::Client,
    cfg: CaldavSettings,
    base: Url,
    state: ConnState,
}

impl CaldavStore {
    pub fn new(cfg: &CaldavSettings) -> anyhow::Result<Self> {
        let base = Url::parse(&cfg.url)
            .with_context(|| format!("invalid CalDAV url {:?}", cfg.url))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            cfg: cfg.clone(),
            base,
            state: ConnState::Disconnected,
        })
    }

    /// Drops all cached discovery state.
    pub fn reset(&mut self) {
        tracing::debug!(target: "caldav", "connection state reset");
        self.state = ConnState::Disconnected;
    }

    /// Uploads every VEVENT in `path` as an independent transaction.
    pub async fn upload(&mut self, path: &Path) -> anyhow::Result<UploadStats> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading roster file {}", path.display()))?;
        tracing::info!(target: "caldav", "uploading {}", path.display());

        let mut stats = UploadStats::default();
        let mut failed = Vec::new();
        for payload in split_events(&text)? {
            match payload {
                Ok(event) => match self.put_event(&event).await {
                    Ok(()) => {
                        tracing::debug!(target: "caldav", "uploaded {:?}", event.summary);
                        stats.uploaded += 1;
                    }
                    Err(e) => {
                        tracing::warn!(target: "caldav", "failed to upload {:?}: {e:#}", event.summary);
                        failed.push(event.summary);
                        stats.failed += 1;
                    }
                },
                Err(e) => {
                    tracing::warn!(target: "caldav", "skipping malformed event: {e}");
                    stats.failed += 1;
                }
            }
        }

        tracing::info!(
            target: "caldav",
            "\x1b[36mupload complete: {} succeeded, {} failed\x1b[0m",
            stats.uploaded,
            stats.failed,
        );
        if stats.uploaded == 0 {
            bail!("no events were successfully uploaded");
        }
        if !failed.is_empty() {
            tracing::warn!(target: "caldav", "failed events: {:?}", &failed[..failed.len().min(3)]);
        }
        Ok(stats)
    }

    /// Deletes events whose end lies before `now − retention_days`.
    /// Comparison is naive: zone information on DTEND is stripped.
    pub async fn prune(&mut self, retention_days: i64) -> anyhow::Result<usize> {
        tracing::info!(target: "caldav", "cleaning up events older than {retention_days} days");
        let calendar = self.resolve().await?;
        let cutoff = Local::now().naive_local() - TimeDelta::days(retention_days);

        let xml = self
            .dav("REPORT", calendar.url.clone(), "1", EVENT_QUERY)
            .await?;

        let mut removed = 0usize;
        for block in tag_blocks(&xml, &RESPONSE) {
            let Some(href) = first_tag(block, &HREF).map(xml_unescape) else {
                continue;
            };
            let Some(data) = first_tag(block, &CALENDAR_DATA) else {
                continue;
            };
            match event_end(&xml_unescape(data)) {
                Some(end) if end < cutoff => {
                    match self.delete(&calendar, &href).await {
                        Ok(()) => removed += 1,
                        Err(e) => {
                            tracing::warn!(target: "caldav", "could not delete {href}: {e:#}");
                        }
                    }
                }
                _ => {}
            }
        }

        tracing::info!(target: "caldav", "cleanup complete, removed {removed} old events");
        Ok(removed)
    }

    /// Names of all calendars on the server, in listing order.
    pub async fn calendars(&mut self) -> anyhow::Result<Vec<String>> {
        let list = self.list_calendars().await?;
        Ok(list.into_iter().map(|c| c.name).collect())
    }

    /// The calendar events are written to: the configured name when it
    /// exists, otherwise the first calendar on the server.
    pub async fn resolve(&mut self) -> anyhow::Result<CalendarRef> {
        if let ConnState::Resolved { calendar } = &self.state {
            return Ok(calendar.clone());
        }
        let list = self.list_calendars().await?;
        let calendar = match list.iter().find(|c| c.name == self.cfg.calendar_name) {
            Some(c) => {
                tracing::info!(target: "caldav", "found calendar {:?}", c.name);
                c.clone()
            }
            None => {
                let Some(first) = list.into_iter().next() else {
                    bail!("no calendars found on CalDAV server");
                };
                tracing::warn!(
                    target: "caldav",
                    "calendar {:?} not found, using first available: {:?}",
                    self.cfg.calendar_name,
                    first.name,
                );
                first
            }
        };
        self.state = ConnState::Resolved { calendar: calendar.clone() };
        Ok(calendar)
    }

    async fn connect(&mut self) -> anyhow::Result<Url> {
        if let ConnState::Connected { principal } = &self.state {
            return Ok(principal.clone());
        }
        tracing::info!(target: "caldav", "connecting to {}", self.base);

        let xml = CONNECT_RETRY
            .run("caldav connect", || {
                self.dav("PROPFIND", self.base.clone(), "0", PRINCIPAL_QUERY)
            })
            .await?;

        let principal = match principal_href(&xml) {
            Some(href) => self.base.join(&href)?,
            None => {
                // Some servers answer property queries only on the
                // principal itself; treat the configured url as principal.
                tracing::warn!(target: "caldav", "no current-user-principal in response, using base url");
                self.base.clone()
            }
        };
        tracing::info!(target: "caldav", "connected, principal {principal}");
        self.state = ConnState::Connected { principal: principal.clone() };
        Ok(principal)
    }

    async fn list_calendars(&mut self) -> anyhow::Result<Vec<CalendarRef>> {
        let principal = self.connect().await?;

        let xml = self
            .dav("PROPFIND", principal.clone(), "0", HOME_SET_QUERY)
            .await?;
        let home = match first_tag(&xml, &HOME_SET).and_then(|b| first_tag(b, &HREF)) {
            Some(href) => principal.join(&xml_unescape(href))?,
            None => principal,
        };

        let xml = self.dav("PROPFIND", home.clone(), "1", CALENDAR_LIST_QUERY).await?;
        let list = parse_calendar_list(&home, &xml);
        tracing::debug!(
            target: "caldav",
            "found {} calendars: {:?}",
            list.len(),
            list.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        );
        Ok(list)
    }

    async fn put_event(&mut self, event: &EventPayload) -> anyhow::Result<()> {
        let calendar = self.resolve().await?;
        match self.try_put(&calendar, event).await {
            // A dead or deauthorized session gets exactly one rebuild, for
            // this event only.
            Err(e) if connection_suspect(&e) => {
                tracing::warn!(target: "caldav", "connection error, resetting: {e:#}");
                self.reset();
                let calendar = self.resolve().await?;
                self.try_put(&calendar, event).await
            }
            r => r,
        }
    }

    async fn try_put(&self, calendar: &CalendarRef, event: &EventPayload) -> anyhow::Result<()> {
        let url = calendar.url.join(&format!("{}.ics", event.href_name))?;
        self.http
            .put(url)
            .basic_auth(&self.cfg.username, Some(&self.cfg.password))
            .header(CONTENT_TYPE, "text/calendar; charset=utf-8")
            .body(event.ics.clone())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete(&self, calendar: &CalendarRef, href: &str) -> anyhow::Result<()> {
        let url = calendar.url.join(href)?;
        self.http
            .delete(url)
            .basic_auth(&self.cfg.username, Some(&self.cfg.password))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn dav(&self, method: &str, url: Url, depth: &str, body: &str) -> anyhow::Result<String> {
        let resp = self
            .http
            .request(Method::from_bytes(method.as_bytes())?, url.clone())
            .basic_auth(&self.cfg.username, Some(&self.cfg.password))
            .header("Depth", depth)
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(body.to_owned())
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("{method} {url}"))?;
        Ok(resp.text().await?)
    }
}

fn connection_suspect(err: &anyhow::Error) -> bool {
    err.downcast_ref::<reqwest::Error>().is_some_and(|e| {
        e.is_connect()
            || e.is_timeout()
            || e.status()
                .is_some_and(|s| s == StatusCode::UNAUTHORIZED || s == StatusCode::FORBIDDEN)
    })
}

/// One VEVENT wrapped in its own VCALENDAR, ready to PUT.
#[derive(Debug)]
pub(crate) struct EventPayload {
    pub href_name: String,
    pub summary: String,
    pub ics: String,
}

/// Splits a roster `.ics` into independent per-event payloads. The outer
/// error means the file itself is unparseable; inner errors mark single
/// malformed events that must not block the rest of the batch.
pub(crate) fn split_events(text: &str) -> anyhow::Result<Vec<anyhow::Result<EventPayload>>> {
    let calendar: Calendar = text
        .parse()
        .map_err(|e: String| anyhow!("parsing roster file: {e}"))?;
    Ok(calendar
        .components
        .iter()
        .filter_map(CalendarComponent::as_event)
        .enumerate()
        .map(|(idx, event)| {
            let summary = event.get_summary().unwrap_or("(no title)").to_owned();
            let start = event
                .property_value("DTSTART")
                .ok_or_else(|| anyhow!("event {summary:?} has no DTSTART"))?
                .to_owned();

            let mut event = event.clone();
            // Deterministic UID so re-uploading a week overwrites instead
            // of duplicating.
            let uid = event.get_uid().map_or_else(
                || format!("roster-{}-{idx}", sanitize(&start)),
                str::to_owned,
            );
            if event.get_uid().is_none() {
                event.add_property("UID", uid.as_str());
            }

            let mut wrapper = Calendar::new();
            wrapper.push(event);
            Ok(EventPayload {
                href_name: sanitize(&uid),
                summary,
                ics: wrapper.to_string(),
            })
        })
        .collect())
}

/// End of the first VEVENT, zone stripped. `None` when there is no DTEND.
pub(crate) fn event_end(ics: &str) -> Option<NaiveDateTime> {
    let calendar: Calendar = ics.parse().ok()?;
    let event = calendar
        .components
        .iter()
        .find_map(CalendarComponent::as_event)?;
    parse_ics_datetime(event.property_value("DTEND")?)
}

/// `20250113T160000[Z]` or all-day `20250113`, zone designator ignored.
pub(crate) fn parse_ics_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim().trim_end_matches('Z');
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%S") {
        return Some(dt);
    }
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN))
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn tag_re(tag: &str) -> Regex {
    Regex::new(&format!(
        r"(?is)<(?:[A-Za-z0-9_-]+:)?{tag}(?:\s[^>]*)?>(.*?)</(?:[A-Za-z0-9_-]+:)?{tag}\s*>"
    ))
    .unwrap()
}

// Every namespace-prefix-agnostic pair tag mined out of multistatus
// bodies, compiled once.
static RESPONSE: LazyLock<Regex> = LazyLock::new(|| tag_re("response"));
static HREF: LazyLock<Regex> = LazyLock::new(|| tag_re("href"));
static CALENDAR_DATA: LazyLock<Regex> = LazyLock::new(|| tag_re("calendar-data"));
static RESOURCETYPE: LazyLock<Regex> = LazyLock::new(|| tag_re("resourcetype"));
static DISPLAYNAME: LazyLock<Regex> = LazyLock::new(|| tag_re("displayname"));
static HOME_SET: LazyLock<Regex> = LazyLock::new(|| tag_re("calendar-home-set"));
static PRINCIPAL: LazyLock<Regex> = LazyLock::new(|| tag_re("current-user-principal"));

fn tag_blocks<'a>(xml: &'a str, re: &Regex) -> Vec<&'a str> {
    re.captures_iter(xml)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

fn first_tag<'a>(xml: &'a str, re: &Regex) -> Option<&'a str> {
    re.captures(xml).and_then(|c| c.get(1)).map(|m| m.as_str())
}

fn xml_unescape(raw: &str) -> String {
    raw.trim()
        .replace("&#13;", "\r")
        .replace("&#10;", "\n")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Extracts calendar collections from a Depth-1 PROPFIND multistatus:
/// every response whose resourcetype carries a caldav `calendar` element.
pub(crate) fn parse_calendar_list(home: &Url, xml: &str) -> Vec<CalendarRef> {
    static CAL_MARKER: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)<(?:[A-Za-z0-9_-]+:)?calendar\s*/?>").unwrap());

    tag_blocks(xml, &RESPONSE)
        .into_iter()
        .filter_map(|block| {
            let resourcetype = first_tag(block, &RESOURCETYPE)?;
            if !CAL_MARKER.is_match(resourcetype) {
                return None;
            }
            let href = xml_unescape(first_tag(block, &HREF)?);
            let mut url = home.join(&href).ok()?;
            // Collection urls must end in a slash so event hrefs join
            // underneath instead of replacing the last segment.
            if !url.path().ends_with('/') {
                url.set_path(&format!("{}/", url.path()));
            }
            let name = first_tag(block, &DISPLAYNAME)
                .map(xml_unescape)
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| href.trim_end_matches('/').rsplit('/').next().unwrap_or("").to_owned());
            Some(CalendarRef { name, url })
        })
        .collect()
}

fn principal_href(xml: &str) -> Option<String> {
    first_tag(xml, &PRINCIPAL)
        .and_then(|block| first_tag(block, &HREF))
        .map(xml_unescape)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROSTER_ICS: &str = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
PRODID:-//ROI Online//Rooster//NL\r\n\
BEGIN:VEVENT\r\n\
UID:shift-1@roi\r\n\
SUMMARY:Vroege dienst\r\n\
DTSTART:20250324T070000\r\n\
DTEND:20250324T150000\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
SUMMARY:Kapotte dienst\r\n\
DTEND:20250325T150000\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:shift-3@roi\r\n\
SUMMARY:Late dienst\r\n\
DTSTART:20250326T150000\r\n\
DTEND:20250326T230000\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

    #[test]
    fn splits_events_and_isolates_malformed_ones() {
        let events = split_events(ROSTER_ICS).unwrap();
        assert_eq!(events.len(), 3);
        let ok = events.iter().filter(|e| e.is_ok()).count();
        let bad = events.iter().filter(|e| e.is_err()).count();
        assert_eq!((ok, bad), (2, 1));

        let first = events[0].as_ref().unwrap();
        assert_eq!(first.summary, "Vroege dienst");
        assert_eq!(first.href_name, "shift-1@roi");
        assert!(first.ics.contains("BEGIN:VEVENT"));
        assert!(first.ics.contains("UID:shift-1@roi"));
        // Each payload wraps exactly one event.
        assert_eq!(first.ics.matches("BEGIN:VEVENT").count(), 1);
    }

    #[test]
    fn missing_uid_gets_a_deterministic_one() {
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nSUMMARY:X\r\nDTSTART:20250101T080000\r\nDTEND:20250101T120000\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let a = split_events(ics).unwrap().remove(0).unwrap();
        let b = split_events(ics).unwrap().remove(0).unwrap();
        assert_eq!(a.href_name, b.href_name);
        assert!(a.ics.contains("UID:roster-"));
    }

    #[test]
    fn garbage_file_is_a_hard_error() {
        assert!(split_events("not a calendar at all").is_err());
    }

    #[test]
    fn parses_ics_datetimes_naively() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 24)
            .unwrap()
            .and_hms_opt(15, 0, 0)
            .unwrap();
        assert_eq!(parse_ics_datetime("20250324T150000"), Some(expected));
        // Zone designator is stripped, not converted.
        assert_eq!(parse_ics_datetime("20250324T150000Z"), Some(expected));
        assert_eq!(
            parse_ics_datetime("20250324"),
            NaiveDate::from_ymd_opt(2025, 3, 24).map(|d| d.and_time(NaiveTime::MIN))
        );
        assert_eq!(parse_ics_datetime("next tuesday"), None);
    }

    #[test]
    fn finds_the_event_end() {
        let end = event_end(ROSTER_ICS).unwrap();
        assert_eq!(
            end,
            NaiveDate::from_ymd_opt(2025, 3, 24).unwrap().and_hms_opt(15, 0, 0).unwrap()
        );
        assert_eq!(event_end("BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n"), None);
    }

    const MULTISTATUS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<D:multistatus xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:response>
    <D:href>/1234/calendars/</D:href>
    <D:propstat><D:prop>
      <D:displayname/>
      <D:resourcetype><D:collection/></D:resourcetype>
    </D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/1234/calendars/work/</D:href>
    <D:propstat><D:prop>
      <D:displayname>Rooster &amp; werk</D:displayname>
      <D:resourcetype><D:collection/><C:calendar/></D:resourcetype>
    </D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/1234/calendars/home</D:href>
    <D:propstat><D:prop>
      <D:displayname>Thuis</D:displayname>
      <D:resourcetype><D:collection/><C:calendar/></D:resourcetype>
    </D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;

    #[test]
    fn extracts_calendar_collections_only() {
        let home = Url::parse("https://caldav.example/1234/calendars/").unwrap();
        let list = parse_calendar_list(&home, MULTISTATUS);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "Rooster & werk");
        assert_eq!(list[0].url.as_str(), "https://caldav.example/1234/calendars/work/");
        assert_eq!(list[1].name, "Thuis");
        // Missing trailing slash is repaired.
        assert_eq!(list[1].url.as_str(), "https://caldav.example/1234/calendars/home/");
    }

    #[test]
    fn extracts_the_principal_href() {
        let xml = r#"<d:multistatus xmlns:d="DAV:"><d:response>
            <d:href>/</d:href>
            <d:propstat><d:prop><d:current-user-principal>
            <d:href>/principal/42/</d:href>
            </d:current-user-principal></d:prop></d:propstat>
        </d:response></d:multistatus>"#;
        assert_eq!(principal_href(xml), Some("/principal/42/".to_owned()));
        assert_eq!(principal_href("<d:multistatus/>"), None);
    }

    #[test]
    fn tag_patterns_ignore_namespace_prefixes() {
        assert_eq!(first_tag("<x:href>/a</x:href>", &HREF), Some("/a"));
        assert_eq!(first_tag("<href>/b</href>", &HREF), Some("/b"));
        assert_eq!(
            tag_blocks("<d:response>a</d:response><response>b</response>", &RESPONSE),
            vec!["a", "b"]
        );
    }

    #[test]
    fn unescapes_xml_entities() {
        assert_eq!(xml_unescape(" a &amp;&lt;b&gt; "), "a &<b>");
    }

    #[test]
    fn sanitizes_uids_for_hrefs() {
        assert_eq!(sanitize("shift 1/2@roi"), "shift-1-2@roi");
    }
}
