//! Download executor.
//!
//! Fetches one resolved URL into a site's destination directory:
//! 1. Derives the file name from the URL (upgrading legacy relative paths)
//! 2. Skips the download when the file already exists or another worker is
//!    already fetching it
//! 3. Streams into a `.part` file with a fixed number of attempts, stopping
//!    early on 403
//! 4. Renames the finished file into place and waits the configured delay

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dashmap::DashSet;
use thiserror::Error;

use crate::ripper::io::DownloadConfig;
use crate::ripper::resolver::ResolvedMedia;
use crate::ripper::sender::{FetchError, HttpSender};

/// Upper bound for the exponential backoff between attempts.
const MAX_BACKOFF_MS: u64 = 60_000;

/// Why a download ended in failure.
#[derive(Error, Debug)]
pub(crate) enum DownloadError {
    #[error("no file name can be derived from {0}")]
    InvalidUrl(String),

    #[error("{0}")]
    Fetch(#[from] FetchError),

    #[error("could not move finished download into place: {0}")]
    Io(#[from] io::Error),
}

/// Terminal state of one download.
#[derive(Debug)]
pub(crate) enum DownloadStatus {
    Downloaded,
    Skipped,
    Failed(DownloadError),
}

/// Result of [DownloadExecutor::execute]. `bytes` is zero unless the file was
/// actually downloaded.
#[derive(Debug)]
pub(crate) struct DownloadOutcome {
    pub(crate) status: DownloadStatus,
    pub(crate) bytes: u64,
    pub(crate) resolution: String,
    pub(crate) file_name: Option<String>,
    pub(crate) attempts: u32,
}

impl DownloadOutcome {
    fn failed(error: DownloadError, media: &ResolvedMedia, file_name: Option<String>, attempts: u32) -> Self {
        DownloadOutcome {
            status: DownloadStatus::Failed(error),
            bytes: 0,
            resolution: media.resolution().to_string(),
            file_name,
            attempts,
        }
    }
}

/// Knobs of the executor, taken from the `[download]` config section.
#[derive(Debug, Clone)]
pub(crate) struct DownloadSettings {
    pub(crate) retry_attempts: u32,
    pub(crate) delay: Duration,
    pub(crate) retry_backoff_ms: u64,
    pub(crate) cdn_host: String,
    pub(crate) legacy_prefix: String,
    pub(crate) legacy_extension: String,
}

impl From<&DownloadConfig> for DownloadSettings {
    fn from(config: &DownloadConfig) -> Self {
        DownloadSettings {
            retry_attempts: config.retry_attempts.max(1),
            delay: Duration::from_millis(config.delay_ms),
            retry_backoff_ms: config.retry_backoff_ms,
            cdn_host: config.cdn_host.clone(),
            legacy_prefix: config.legacy_prefix.clone(),
            legacy_extension: config.legacy_extension.clone(),
        }
    }
}

impl Default for DownloadSettings {
    fn default() -> Self {
        DownloadSettings::from(&DownloadConfig::default())
    }
}

/// Performs retried, rate-limited downloads through a shared [HttpSender].
pub(crate) struct DownloadExecutor {
    sender: Arc<dyn HttpSender>,
    settings: DownloadSettings,
    /// Destination files currently being written by some worker.
    in_flight: DashSet<PathBuf>,
}

/// Exclusive hold on one destination file, released on drop.
struct FileClaim<'a> {
    in_flight: &'a DashSet<PathBuf>,
    path: PathBuf,
}

impl Drop for FileClaim<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.path);
    }
}

impl DownloadExecutor {
    pub(crate) fn new(sender: Arc<dyn HttpSender>, settings: DownloadSettings) -> Self {
        DownloadExecutor {
            sender,
            settings,
            in_flight: DashSet::new(),
        }
    }

    /// Claims `file_path` for the calling worker. `None` when another worker holds it.
    fn claim(&self, file_path: &Path) -> Option<FileClaim<'_>> {
        if !self.in_flight.insert(file_path.to_path_buf()) {
            return None;
        }
        Some(FileClaim {
            in_flight: &self.in_flight,
            path: file_path.to_path_buf(),
        })
    }

    /// Downloads `media` into `destination` and reports how it ended.
    pub(crate) fn execute(&self, media: &ResolvedMedia, destination: &Path) -> DownloadOutcome {
        let url = final_url(media.url(), &self.settings);
        let Some(file_name) = file_name_from_url(&url) else {
            return DownloadOutcome::failed(DownloadError::InvalidUrl(url), media, None, 0);
        };

        let file_path = destination.join(&file_name);
        let skipped = |file_name: String| DownloadOutcome {
            status: DownloadStatus::Skipped,
            bytes: 0,
            resolution: media.resolution().to_string(),
            file_name: Some(file_name),
            attempts: 0,
        };

        let Some(_claim) = self.claim(&file_path) else {
            trace!("{} is already being downloaded, skipping", file_path.display());
            return skipped(file_name);
        };
        if file_path.is_file() {
            trace!("{} already exists, skipping", file_path.display());
            return skipped(file_name);
        }

        debug!("Downloading {} from {}", file_name, url);
        let part_path = part_path_for(&file_path);
        let max_attempts = self.settings.retry_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            if attempts > 1 {
                debug!("Retry attempt {}/{} for {}", attempts, max_attempts, url);
            }

            let error = match self.attempt(&url, &part_path) {
                Ok(bytes) => {
                    if let Err(e) = fs::rename(&part_path, &file_path) {
                        remove_partial(&part_path);
                        return DownloadOutcome::failed(e.into(), media, Some(file_name), attempts);
                    }
                    if !self.settings.delay.is_zero() {
                        thread::sleep(self.settings.delay);
                    }
                    return DownloadOutcome {
                        status: DownloadStatus::Downloaded,
                        bytes,
                        resolution: media.resolution().to_string(),
                        file_name: Some(file_name),
                        attempts,
                    };
                }
                Err(error) => error,
            };

            if error.is_terminal() {
                warn!("Access denied when retrieving {}", url);
            } else {
                warn!("Attempt {}/{} for {} failed: {}", attempts, max_attempts, url, error);
            }

            if error.is_terminal() || attempts >= max_attempts {
                remove_partial(&part_path);
                return DownloadOutcome::failed(error.into(), media, Some(file_name), attempts);
            }

            let backoff = calculate_backoff(attempts, self.settings.retry_backoff_ms);
            if backoff > 0 {
                trace!("Backing off for {}ms before retry", backoff);
                thread::sleep(Duration::from_millis(backoff));
            }
        }
    }

    /// One GET streamed into `part_path`, truncating whatever an earlier attempt left.
    fn attempt(&self, url: &str, part_path: &Path) -> Result<u64, FetchError> {
        let file = File::create(part_path)?;
        let mut writer = BufWriter::new(file);
        let bytes = self.sender.download(url, &mut writer)?;
        writer.flush()?;
        Ok(bytes)
    }
}

/// Upgrades a legacy relative media path to a full CDN URL; full URLs pass through.
///
/// A legacy name that does not start with the site's media prefix is prefixed
/// with its parent path segment before the video extension is appended.
pub(crate) fn final_url(url: &str, settings: &DownloadSettings) -> String {
    if url.starts_with("http") {
        return url.to_string();
    }

    let segments: Vec<&str> = url.split('/').collect();
    let last = segments.last().copied().unwrap_or_default();
    let mut name = last.split('?').next().unwrap_or_default().to_string();
    if !name.starts_with(&settings.legacy_prefix) {
        if let Some(parent) = segments.len().checked_sub(2).map(|i| segments[i]) {
            name = format!("{}_{}", parent, name);
        }
    }

    format!("https://{}/{}.{}", settings.cdn_host, name, settings.legacy_extension)
}

/// Final path segment of `url` without its query string.
pub(crate) fn file_name_from_url(url: &str) -> Option<String> {
    let name = url.rsplit('/').next()?.split('?').next()?;
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

fn part_path_for(file_path: &Path) -> PathBuf {
    let mut name = file_path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

fn remove_partial(part_path: &Path) {
    match fs::remove_file(part_path) {
        Ok(()) => trace!("Removed partial file {}", part_path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial file {}: {}", part_path.display(), e),
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped. A zero base disables it.
fn calculate_backoff(attempt: u32, base_delay_ms: u64) -> u64 {
    if base_delay_ms == 0 {
        return 0;
    }
    let exponent = attempt.saturating_sub(1).min(16);
    base_delay_ms.saturating_mul(1 << exponent).min(MAX_BACKOFF_MS)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use tempfile::tempdir;

    use super::*;

    /// What a scripted URL answers with on each attempt.
    #[derive(Clone)]
    pub(crate) enum Reply {
        Body(Vec<u8>),
        /// Writes the bytes, then fails mid-stream.
        Partial(Vec<u8>),
        Fail(fn() -> FetchError),
    }

    /// In-memory sender: every URL has a script of replies; the last one repeats.
    /// Unscripted URLs answer 404.
    #[derive(Default)]
    pub(crate) struct ScriptedSender {
        media: Mutex<HashMap<String, Vec<Reply>>>,
        pages: Mutex<HashMap<String, Vec<Reply>>>,
        calls: Mutex<HashMap<String, usize>>,
        pub(crate) total_downloads: AtomicUsize,
    }

    impl ScriptedSender {
        pub(crate) fn media(self, url: &str, replies: Vec<Reply>) -> Self {
            self.media.lock().insert(url.to_string(), replies);
            self
        }

        pub(crate) fn page(self, url: &str, replies: Vec<Reply>) -> Self {
            self.pages.lock().insert(url.to_string(), replies);
            self
        }

        pub(crate) fn calls(&self, url: &str) -> usize {
            self.calls.lock().get(url).copied().unwrap_or(0)
        }

        fn next_index(&self, url: &str) -> usize {
            let mut calls = self.calls.lock();
            let count = calls.entry(url.to_string()).or_insert(0);
            *count += 1;
            *count - 1
        }
    }

    impl HttpSender for ScriptedSender {
        fn get_page(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            let index = self.next_index(url);
            let pages = self.pages.lock();
            let Some(script) = pages.get(url) else {
                return Err(FetchError::NotFound);
            };
            match &script[index.min(script.len() - 1)] {
                Reply::Body(body) | Reply::Partial(body) => Ok(body.clone()),
                Reply::Fail(make) => Err(make()),
            }
        }

        fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64, FetchError> {
            self.total_downloads.fetch_add(1, Ordering::SeqCst);
            let index = self.next_index(url);
            let reply = {
                let media = self.media.lock();
                let Some(script) = media.get(url) else {
                    return Err(FetchError::NotFound);
                };
                script[index.min(script.len() - 1)].clone()
            };
            match reply {
                Reply::Body(body) => {
                    for chunk in body.chunks(3) {
                        sink.write_all(chunk)?;
                    }
                    Ok(body.len() as u64)
                }
                Reply::Partial(body) => {
                    sink.write_all(&body)?;
                    Err(FetchError::Stream("connection reset".to_string()))
                }
                Reply::Fail(make) => Err(make()),
            }
        }
    }

    pub(crate) fn fast_settings() -> DownloadSettings {
        DownloadSettings {
            retry_attempts: 5,
            delay: Duration::ZERO,
            ..DownloadSettings::default()
        }
    }

    fn executor(sender: ScriptedSender) -> (DownloadExecutor, Arc<ScriptedSender>) {
        let sender = Arc::new(sender);
        (DownloadExecutor::new(sender.clone(), fast_settings()), sender)
    }

    fn timeout() -> FetchError {
        FetchError::Timeout("timed out".to_string())
    }

    fn forbidden() -> FetchError {
        FetchError::Forbidden
    }

    #[test]
    fn test_successful_download_writes_file() {
        let url = "https://64.media.tumblr.com/abc/s1280x1920/photo.jpg?x=1";
        let (executor, _) = executor(ScriptedSender::default().media(url, vec![Reply::Body(b"0123456789".to_vec())]));
        let dir = tempdir().unwrap();

        let outcome = executor.execute(&ResolvedMedia::new(url), dir.path());

        assert!(matches!(outcome.status, DownloadStatus::Downloaded));
        assert_eq!(outcome.bytes, 10);
        assert_eq!(outcome.resolution, "1280px");
        assert_eq!(outcome.file_name.as_deref(), Some("photo.jpg"));
        assert_eq!(fs::read(dir.path().join("photo.jpg")).unwrap(), b"0123456789");
        assert!(!dir.path().join("photo.jpg.part").exists());
    }

    #[test]
    fn test_existing_file_is_skipped_without_network() {
        let url = "https://a/img1.jpg";
        let (executor, sender) = executor(ScriptedSender::default().media(url, vec![Reply::Body(b"new".to_vec())]));
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("img1.jpg"), b"old").unwrap();

        let outcome = executor.execute(&ResolvedMedia::new(url), dir.path());

        assert!(matches!(outcome.status, DownloadStatus::Skipped));
        assert_eq!(outcome.bytes, 0);
        assert_eq!(sender.calls(url), 0);
        assert_eq!(fs::read(dir.path().join("img1.jpg")).unwrap(), b"old");
    }

    /// Holds every download open for a while so concurrent callers overlap.
    struct SlowSender {
        calls: AtomicUsize,
    }

    impl HttpSender for SlowSender {
        fn get_page(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::NotFound)
        }

        fn download(&self, _url: &str, sink: &mut dyn Write) -> Result<u64, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let fill = if call == 0 { b'A' } else { b'B' };
            for _ in 0..10 {
                sink.write_all(&[fill; 100])?;
                thread::sleep(Duration::from_millis(20));
            }
            Ok(1000)
        }
    }

    #[test]
    fn test_concurrent_downloads_of_same_file() {
        let sender = Arc::new(SlowSender {
            calls: AtomicUsize::new(0),
        });
        let executor = DownloadExecutor::new(sender.clone(), fast_settings());
        let media = ResolvedMedia::new("https://x/800.jpg");
        let dir = tempdir().unwrap();

        let outcomes: Vec<DownloadOutcome> = thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| scope.spawn(|| executor.execute(&media, dir.path())))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let downloaded = outcomes
            .iter()
            .filter(|o| matches!(o.status, DownloadStatus::Downloaded))
            .count();
        let skipped = outcomes
            .iter()
            .filter(|o| matches!(o.status, DownloadStatus::Skipped))
            .count();
        assert_eq!((downloaded, skipped), (1, 1));
        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);

        let content = fs::read(dir.path().join("800.jpg")).unwrap();
        assert_eq!(content, vec![b'A'; 1000]);
        assert!(!dir.path().join("800.jpg.part").exists());
        assert!(executor.in_flight.is_empty());
    }

    #[test]
    fn test_transient_failure_exhausts_retry_ceiling() {
        let url = "https://a/flaky.mp4";
        let (executor, sender) = executor(ScriptedSender::default().media(
            url,
            vec![Reply::Partial(b"half".to_vec()), Reply::Fail(timeout)],
        ));
        let dir = tempdir().unwrap();

        let outcome = executor.execute(&ResolvedMedia::new(url), dir.path());

        assert!(matches!(outcome.status, DownloadStatus::Failed(DownloadError::Fetch(FetchError::Timeout(_)))));
        assert_eq!(outcome.attempts, 5);
        assert_eq!(sender.calls(url), 5);
        assert!(!dir.path().join("flaky.mp4").exists());
        assert!(!dir.path().join("flaky.mp4.part").exists());
    }

    #[test]
    fn test_forbidden_is_not_retried() {
        let url = "https://a/private.jpg";
        let (executor, sender) = executor(ScriptedSender::default().media(url, vec![Reply::Fail(forbidden)]));
        let dir = tempdir().unwrap();

        let outcome = executor.execute(&ResolvedMedia::new(url), dir.path());

        assert!(matches!(outcome.status, DownloadStatus::Failed(DownloadError::Fetch(FetchError::Forbidden))));
        assert_eq!(sender.calls(url), 1);
        assert!(!dir.path().join("private.jpg.part").exists());
    }

    #[test]
    fn test_recovers_after_transient_failure() {
        let url = "https://a/retry.jpg";
        let (executor, sender) = executor(ScriptedSender::default().media(
            url,
            vec![Reply::Partial(b"garbage-garbage".to_vec()), Reply::Body(b"ok".to_vec())],
        ));
        let dir = tempdir().unwrap();

        let outcome = executor.execute(&ResolvedMedia::new(url), dir.path());

        assert!(matches!(outcome.status, DownloadStatus::Downloaded));
        assert_eq!(outcome.bytes, 2);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(sender.calls(url), 2);
        assert_eq!(fs::read(dir.path().join("retry.jpg")).unwrap(), b"ok");
    }

    #[test]
    fn test_invalid_url_fails_without_attempts() {
        let (executor, sender) = executor(ScriptedSender::default());
        let dir = tempdir().unwrap();

        let outcome = executor.execute(&ResolvedMedia::new("https://a/dir/"), dir.path());

        assert!(matches!(outcome.status, DownloadStatus::Failed(DownloadError::InvalidUrl(_))));
        assert_eq!(sender.total_downloads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_legacy_url_upgrade() {
        let settings = DownloadSettings::default();
        assert_eq!(
            final_url("/video_file/123/tumblr_abc", &settings),
            "https://vt.tumblr.com/tumblr_abc.mp4"
        );
        assert_eq!(
            final_url("/video_file/123456/abc?x=1", &settings),
            "https://vt.tumblr.com/123456_abc.mp4"
        );
        assert_eq!(final_url("abc", &settings), "https://vt.tumblr.com/abc.mp4");
        assert_eq!(final_url("https://a/b.mp4", &settings), "https://a/b.mp4");
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(file_name_from_url("https://a/b/c.jpg?size=1").as_deref(), Some("c.jpg"));
        assert_eq!(file_name_from_url("https://a/b/").as_deref(), None);
    }

    #[test]
    fn test_calculate_backoff() {
        assert_eq!(calculate_backoff(1, 0), 0);
        assert_eq!(calculate_backoff(1, 100), 100);
        assert_eq!(calculate_backoff(3, 100), 400);
        assert_eq!(calculate_backoff(30, 1000), MAX_BACKOFF_MS);
    }
}
