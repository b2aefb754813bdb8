//! Download statistics.
//!
//! A [StatsAggregator] collects per-site counters for the current run while
//! workers report outcomes, and merges each finished site into the persisted
//! [StatsHistory].

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Local;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ripper::downloader::{DownloadOutcome, DownloadStatus};
use crate::ripper::{format_file_size, MediaKind};

/// Date format of session records.
const SESSION_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub(crate) enum StatsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One finished download session of a site.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub(crate) struct SessionRecord {
    #[serde(default)]
    pub(crate) date: String,
    #[serde(default)]
    pub(crate) photos_downloaded: u64,
    #[serde(default)]
    pub(crate) videos_downloaded: u64,
    #[serde(default)]
    pub(crate) bytes_downloaded: u64,
    #[serde(default)]
    pub(crate) resolutions: BTreeMap<String, u64>,
    #[serde(default)]
    pub(crate) resolution_bytes: BTreeMap<String, u64>,
    #[serde(default)]
    pub(crate) duration_seconds: f64,
    #[serde(default)]
    pub(crate) files_skipped: u64,
    #[serde(default)]
    pub(crate) files_failed: u64,
    #[serde(default)]
    pub(crate) files_unresolved: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) note: Option<String>,
}

/// Cumulative totals of one site across every session.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub(crate) struct SiteTotals {
    #[serde(default)]
    pub(crate) total_photos: u64,
    #[serde(default)]
    pub(crate) total_videos: u64,
    #[serde(default)]
    pub(crate) total_bytes: u64,
    #[serde(default)]
    pub(crate) resolutions: BTreeMap<String, u64>,
    #[serde(default)]
    pub(crate) resolution_bytes: BTreeMap<String, u64>,
    #[serde(default)]
    pub(crate) download_sessions: Vec<SessionRecord>,
}

impl SiteTotals {
    pub(crate) fn total_media(&self) -> u64 {
        self.total_photos + self.total_videos
    }

    pub(crate) fn last_session(&self) -> Option<&SessionRecord> {
        self.download_sessions.last()
    }

    fn merge(&mut self, session: SessionRecord) {
        self.total_photos += session.photos_downloaded;
        self.total_videos += session.videos_downloaded;
        self.total_bytes += session.bytes_downloaded;
        for (tag, count) in &session.resolutions {
            *self.resolutions.entry(tag.clone()).or_insert(0) += count;
        }
        for (tag, bytes) in &session.resolution_bytes {
            *self.resolution_bytes.entry(tag.clone()).or_insert(0) += bytes;
        }
        self.download_sessions.push(session);
    }
}

/// Persisted mapping from site name to its totals.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub(crate) struct StatsHistory {
    sites: BTreeMap<String, SiteTotals>,
}

impl StatsHistory {
    /// Reads the history file. A missing file yields an empty history.
    pub(crate) fn load(path: &Path) -> Result<StatsHistory, StatsError> {
        if !path.exists() {
            trace!("{}: does not exist, starting with empty statistics", path.display());
            return Ok(StatsHistory::default());
        }

        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Rewrites the whole history file through a temporary file.
    pub(crate) fn save(&self, path: &Path) -> Result<(), StatsError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        let temp_path = sibling_path(path, "tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn site(&self, site: &str) -> Option<&SiteTotals> {
        self.sites.get(site)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Sites ordered by total media, most first. Ties keep name order.
    pub(crate) fn sites_by_media(&self) -> Vec<(&str, &SiteTotals)> {
        let mut sites: Vec<_> = self.sites.iter().map(|(name, totals)| (name.as_str(), totals)).collect();
        sites.sort_by_key(|(_, totals)| Reverse(totals.total_media()));
        sites
    }

    fn merge(&mut self, site: &str, session: SessionRecord) -> &SiteTotals {
        let totals = self.sites.entry(site.to_string()).or_default();
        totals.merge(session);
        totals
    }
}

/// In-memory counters of one site for the current run.
#[derive(Debug, Clone)]
pub(crate) struct SiteSession {
    started: Instant,
    pub(crate) photos_downloaded: u64,
    pub(crate) videos_downloaded: u64,
    pub(crate) photos_skipped: u64,
    pub(crate) videos_skipped: u64,
    pub(crate) bytes_downloaded: u64,
    pub(crate) resolutions: BTreeMap<String, u64>,
    pub(crate) resolution_bytes: BTreeMap<String, u64>,
    pub(crate) failed: u64,
    pub(crate) unresolved: u64,
}

impl SiteSession {
    fn new() -> Self {
        SiteSession {
            started: Instant::now(),
            photos_downloaded: 0,
            videos_downloaded: 0,
            photos_skipped: 0,
            videos_skipped: 0,
            bytes_downloaded: 0,
            resolutions: BTreeMap::new(),
            resolution_bytes: BTreeMap::new(),
            failed: 0,
            unresolved: 0,
        }
    }

    /// Items that ended as downloaded or already present.
    pub(crate) fn handled(&self) -> u64 {
        self.photos_downloaded + self.videos_downloaded + self.photos_skipped + self.videos_skipped
    }

    fn into_record(self) -> SessionRecord {
        let elapsed = self.started.elapsed().as_secs_f64();
        SessionRecord {
            date: Local::now().format(SESSION_DATE_FORMAT).to_string(),
            photos_downloaded: self.photos_downloaded,
            videos_downloaded: self.videos_downloaded,
            bytes_downloaded: self.bytes_downloaded,
            resolutions: self.resolutions,
            resolution_bytes: self.resolution_bytes,
            duration_seconds: (elapsed * 100.0).round() / 100.0,
            files_skipped: self.photos_skipped + self.videos_skipped,
            files_failed: self.failed,
            files_unresolved: self.unresolved,
            note: None,
        }
    }
}

/// Shared statistics sink. Workers record into it concurrently; the scheduler
/// opens and finishes one session per site.
pub(crate) struct StatsAggregator {
    path: PathBuf,
    history: Mutex<StatsHistory>,
    sessions: DashMap<String, SiteSession>,
}

impl StatsAggregator {
    /// Loads the history at `path`. An unreadable or corrupt file is moved
    /// aside to `<file>.backup` and the history starts empty.
    pub(crate) fn open(path: &Path) -> Self {
        let history = match StatsHistory::load(path) {
            Ok(history) => history,
            Err(e) => {
                warn!("Could not load statistics from {}: {}", path.display(), e);
                let backup = sibling_path(path, "backup");
                match fs::rename(path, &backup) {
                    Ok(()) => info!("Moved unreadable statistics file to {}", backup.display()),
                    Err(e) => warn!("Failed to back up statistics file: {}", e),
                }
                StatsHistory::default()
            }
        };

        StatsAggregator {
            path: path.to_path_buf(),
            history: Mutex::new(history),
            sessions: DashMap::new(),
        }
    }

    /// Starts a fresh session for `site`, replacing any unfinished one.
    pub(crate) fn start_site(&self, site: &str) {
        self.sessions.insert(site.to_string(), SiteSession::new());
        info!("Started downloading from {}", site);
    }

    /// Counts one terminal outcome of a work item.
    pub(crate) fn record(&self, site: &str, kind: MediaKind, outcome: &DownloadOutcome) {
        let mut session = self.sessions.entry(site.to_string()).or_insert_with(SiteSession::new);
        match outcome.status {
            DownloadStatus::Downloaded => {
                match kind {
                    MediaKind::Photo => session.photos_downloaded += 1,
                    MediaKind::Video => session.videos_downloaded += 1,
                }
                session.bytes_downloaded += outcome.bytes;
                *session.resolutions.entry(outcome.resolution.clone()).or_insert(0) += 1;
                *session.resolution_bytes.entry(outcome.resolution.clone()).or_insert(0) += outcome.bytes;
            }
            DownloadStatus::Skipped => match kind {
                MediaKind::Photo => session.photos_skipped += 1,
                MediaKind::Video => session.videos_skipped += 1,
            },
            DownloadStatus::Failed(_) => session.failed += 1,
        }
    }

    /// Counts a work item for which no URL could be resolved.
    pub(crate) fn record_unresolved(&self, site: &str) {
        self.sessions.entry(site.to_string()).or_insert_with(SiteSession::new).unresolved += 1;
    }

    /// Snapshot of the running session of `site`.
    pub(crate) fn session(&self, site: &str) -> Option<SiteSession> {
        self.sessions.get(site).map(|session| session.clone())
    }

    /// Closes the session of `site`, merges it into the history and writes the
    /// history file. A failed write is logged; the merged data stays in memory
    /// and goes out with the next successful write.
    pub(crate) fn finish_site(&self, site: &str) -> Option<SessionRecord> {
        let (_, session) = self.sessions.remove(site)?;
        let record = session.into_record();

        let mut history = self.history.lock();
        let sessions = history.merge(site, record.clone()).download_sessions.len();
        if let Err(e) = history.save(&self.path) {
            error!("Could not save statistics to {}: {}", self.path.display(), e);
        }
        trace!("{} now has {} recorded sessions", site, sessions);

        info!(
            "Finished {}: {} photos, {} videos ({} total, {}) in {}s",
            site,
            record.photos_downloaded,
            record.videos_downloaded,
            record.photos_downloaded + record.videos_downloaded,
            format_file_size(record.bytes_downloaded),
            record.duration_seconds
        );
        Some(record)
    }

    /// Copy of the merged history.
    pub(crate) fn history(&self) -> StatsHistory {
        self.history.lock().clone()
    }
}

/// `<file>.<suffix>` next to `path`.
fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Groups the digits of `value` in thousands.
fn format_number(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped
}

/// Numeric part of a `NNNpx` tag; unknown tags sort last.
fn resolution_rank(tag: &str) -> u64 {
    tag.trim_end_matches("px").parse().unwrap_or(0)
}

/// Short cross-site summary printed at the end of a crawl.
pub(crate) fn render_summary(history: &StatsHistory) -> String {
    let mut out = String::new();
    if history.is_empty() {
        out.push_str("No download statistics available yet.\n");
        return out;
    }

    let sites = history.sites_by_media();
    let total_photos: u64 = sites.iter().map(|(_, t)| t.total_photos).sum();
    let total_videos: u64 = sites.iter().map(|(_, t)| t.total_videos).sum();

    let _ = writeln!(out, "Total sites downloaded: {}", sites.len());
    let _ = writeln!(out, "Total photos: {}", total_photos);
    let _ = writeln!(out, "Total videos: {}", total_videos);
    let _ = writeln!(out, "Total media files: {}", total_photos + total_videos);
    out.push('\n');

    for (name, totals) in sites {
        let _ = writeln!(out, "{}:", name);
        let _ = writeln!(
            out,
            "   Photos: {}, Videos: {}, Total: {}",
            totals.total_photos,
            totals.total_videos,
            totals.total_media()
        );
        if let Some(last) = totals.last_session() {
            let _ = writeln!(
                out,
                "   Last download: {} ({} sessions)",
                last.date,
                totals.download_sessions.len()
            );
        }
        out.push('\n');
    }
    out
}

/// Full statistics report: overall totals, a per-site table, the resolution
/// breakdown and every recorded session.
pub(crate) fn render_report(history: &StatsHistory) -> String {
    let mut out = String::new();
    if history.is_empty() {
        out.push_str("No download statistics available yet.\n");
        return out;
    }

    let sites = history.sites_by_media();
    let total_photos: u64 = sites.iter().map(|(_, t)| t.total_photos).sum();
    let total_videos: u64 = sites.iter().map(|(_, t)| t.total_videos).sum();
    let total_bytes: u64 = sites.iter().map(|(_, t)| t.total_bytes).sum();

    out.push_str("OVERALL SUMMARY:\n");
    let _ = writeln!(out, "   Total sites downloaded: {}", sites.len());
    let _ = writeln!(out, "   Total photos: {}", format_number(total_photos));
    let _ = writeln!(out, "   Total videos: {}", format_number(total_videos));
    let _ = writeln!(out, "   Total media files: {}", format_number(total_photos + total_videos));
    let _ = writeln!(out, "   Total size: {}", format_file_size(total_bytes));
    out.push('\n');

    let rule = "-".repeat(100);
    out.push_str("SITE-BY-SITE BREAKDOWN:\n");
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(
        out,
        "{:<15} {:>10} {:>10} {:>10} {:>12} {:>15}",
        "Site", "Photos", "Videos", "Total", "Size", "Last Download"
    );
    let _ = writeln!(out, "{}", rule);
    for (name, totals) in &sites {
        let last_date = totals
            .last_session()
            .map(|s| s.date.chars().take(10).collect::<String>())
            .unwrap_or_else(|| "N/A".to_string());
        let _ = writeln!(
            out,
            "{:<15} {:>10} {:>10} {:>10} {:>12} {:>15}",
            name.chars().take(14).collect::<String>(),
            format_number(totals.total_photos),
            format_number(totals.total_videos),
            format_number(totals.total_media()),
            format_file_size(totals.total_bytes),
            last_date
        );
    }

    out.push_str("\nSESSION DETAILS:\n");
    let _ = writeln!(out, "{}", rule);
    for (name, totals) in &sites {
        let _ = writeln!(out, "\n{}:", name.to_uppercase());

        if !totals.resolutions.is_empty() {
            out.push_str("   Resolution breakdown:\n");
            let mut resolutions: Vec<_> = totals.resolutions.iter().collect();
            resolutions.sort_by_key(|(tag, _)| Reverse(resolution_rank(tag)));
            for (tag, count) in resolutions {
                let bytes = totals.resolution_bytes.get(tag).copied().unwrap_or(0);
                let _ = writeln!(
                    out,
                    "      {:>10}: {:>6} files ({})",
                    tag,
                    format_number(*count),
                    format_file_size(bytes)
                );
            }
        }

        for (i, session) in totals.download_sessions.iter().enumerate() {
            let duration = if session.duration_seconds > 0.0 {
                format!("{:.1}s", session.duration_seconds)
            } else {
                "N/A".to_string()
            };
            let note = session.note.as_ref().map(|n| format!(" ({})", n)).unwrap_or_default();
            let _ = writeln!(
                out,
                "   Session {}: {} - {} photos, {} videos, {} ({}){}",
                i + 1,
                session.date,
                format_number(session.photos_downloaded),
                format_number(session.videos_downloaded),
                format_file_size(session.bytes_downloaded),
                duration,
                note
            );
        }
    }
    out
}
