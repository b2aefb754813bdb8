use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use console::style;

use crate::ripper::downloader::{DownloadExecutor, DownloadSettings, DownloadStatus};
use crate::ripper::io::Config;
use crate::ripper::pool::{WorkItem, WorkerPool};
use crate::ripper::resolver::resolve;
use crate::ripper::sender::HttpSender;
use crate::ripper::stats::{SessionRecord, StatsAggregator};
use crate::ripper::tui::drain_spinner;
use crate::ripper::walker::{CrawlSettings, PageWalker, WalkEnd};
use crate::ripper::{format_file_size, MediaKind};

/// How often the drain spinner refreshes the outstanding count.
const DRAIN_POLL: Duration = Duration::from_millis(200);

/// Drives the crawl: sites one after another, and for each site every media
/// kind walked and then drained through the shared worker pool.
pub(crate) struct CrawlerScheduler {
    walker: PageWalker,
    pool: WorkerPool,
    stats: Arc<StatsAggregator>,
    download_root: PathBuf,
    show_progress: bool,
}

impl CrawlerScheduler {
    /// Starts the worker pool. Workers live until the scheduler is dropped.
    pub(crate) fn new(config: &Config, sender: Arc<dyn HttpSender>, stats: Arc<StatsAggregator>) -> io::Result<Self> {
        let executor = DownloadExecutor::new(sender.clone(), DownloadSettings::from(&config.download));
        let worker_stats = stats.clone();
        let pool = WorkerPool::new(config.download.threads, move |item| {
            process_item(&executor, &worker_stats, item);
        })?;

        Ok(CrawlerScheduler {
            walker: PageWalker::new(sender, CrawlSettings::from(&config.crawl)),
            pool,
            stats,
            download_root: config.download_directory(),
            show_progress: true,
        })
    }

    pub(crate) fn show_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Crawls every site in order. A site that fails does not stop the rest.
    pub(crate) fn run(&self, sites: &[String]) -> Vec<(String, SessionRecord)> {
        let mut sessions = Vec::with_capacity(sites.len());
        for site in sites {
            match self.run_site(site) {
                Ok(record) => sessions.push((site.clone(), record)),
                Err(e) => error!("Skipping {}: {}", style(format!("\"{}\"", site)).color256(39).italic(), e),
            }
        }
        sessions
    }

    fn run_site(&self, site: &str) -> io::Result<SessionRecord> {
        let destination = self.download_root.join(site);
        fs::create_dir_all(&destination)?;

        info!("Downloading {}", style(format!("\"{}\"", site)).color256(39).italic());
        self.stats.start_site(site);

        for kind in MediaKind::CRAWL_ORDER {
            self.crawl_kind(site, kind, &destination);
        }

        self.stats
            .finish_site(site)
            .ok_or_else(|| io::Error::other(format!("no session was open for {}", site)))
    }

    fn crawl_kind(&self, site: &str, kind: MediaKind, destination: &Path) {
        let pool = &self.pool;
        let report = self.walker.walk(site, kind, destination, &mut |item| pool.enqueue(item));

        match &report.end {
            WalkEnd::Exhausted => debug!(
                "Listed {} {} of {} over {} pages",
                report.items,
                kind.plural(),
                site,
                report.pages
            ),
            WalkEnd::SiteNotFound => {}
            WalkEnd::Abandoned(e) => warn!(
                "Stopped listing {} of {} after {} pages: {}",
                kind.plural(),
                site,
                report.pages,
                e
            ),
        }

        self.drain(site, kind);
        let handled = self.stats.session(site).map(|s| s.handled()).unwrap_or(0);
        info!(
            "Finished downloading all the {} from {} ({} files present so far)",
            kind.plural(),
            site,
            handled
        );
    }

    /// Blocks until every queued item of the current phase is processed.
    fn drain(&self, site: &str, kind: MediaKind) {
        trace!("Waiting for {} queued items of {}", self.pool.outstanding(), site);
        let spinner = drain_spinner(format!("{} {}", site, kind.plural()), self.show_progress);
        loop {
            let remaining = self.pool.wait_for(DRAIN_POLL);
            if remaining == 0 {
                break;
            }
            spinner.set_message(format!("{} remaining", remaining));
        }
        spinner.finish_and_clear();
        trace!("Queue drained for {} {}", site, kind.plural());
    }
}

/// Resolves, downloads and records one work item.
fn process_item(executor: &DownloadExecutor, stats: &StatsAggregator, item: WorkItem) {
    let Some(media) = resolve(item.kind, &item.post) else {
        warn!(
            "Unable to find a {} URL in post {} of {}",
            item.kind,
            item.post.id(),
            item.site
        );
        stats.record_unresolved(&item.site);
        return;
    };

    let outcome = executor.execute(&media, &item.destination);
    let name = outcome.file_name.as_deref().unwrap_or(media.url());
    match &outcome.status {
        DownloadStatus::Downloaded => info!("Downloaded {} ({})", name, format_file_size(outcome.bytes)),
        DownloadStatus::Skipped => debug!("Skipped {}, already downloaded", name),
        DownloadStatus::Failed(e) => warn!(
            "Failed to retrieve {} from {} after {} attempts: {}",
            item.kind,
            media.url(),
            outcome.attempts,
            e
        ),
    }

    stats.record(&item.site, item.kind, &outcome);
}
