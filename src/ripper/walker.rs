//! Pagination over the listing API for one site and media kind.
//!
//! The walker keeps a single offset. Each page is fetched, dumped next to the
//! downloads, decoded, and expanded into [WorkItem]s before the offset moves on.
//! The walk ends when the listing runs dry, the site does not exist, or the
//! transport keeps failing at the same offset.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::ripper::io::{CrawlConfig, SITE_PLACEHOLDER};
use crate::ripper::pool::WorkItem;
use crate::ripper::post::{decode_page, sanitize_body, Post};
use crate::ripper::sender::{FetchError, HttpSender};
use crate::ripper::MediaKind;

#[derive(Debug, Clone)]
pub(crate) struct CrawlSettings {
    pub(crate) api_url: String,
    pub(crate) page_size: u32,
    pub(crate) start_offset: u32,
    pub(crate) page_retry_attempts: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) dump_posts_as_json: bool,
}

impl From<&CrawlConfig> for CrawlSettings {
    fn from(config: &CrawlConfig) -> Self {
        CrawlSettings {
            api_url: config.api_url.clone(),
            page_size: config.page_size.max(1),
            start_offset: config.start_offset,
            page_retry_attempts: config.page_retry_attempts.max(1),
            retry_delay: Duration::from_millis(config.page_retry_delay_ms),
            dump_posts_as_json: config.dump_posts_as_json,
        }
    }
}

/// Why a walk stopped.
#[derive(Debug)]
pub(crate) enum WalkEnd {
    /// A page came back without posts.
    Exhausted,
    /// The listing API answered 404.
    SiteNotFound,
    /// The page at one offset could not be fetched after every attempt.
    Abandoned(FetchError),
}

#[derive(Debug)]
pub(crate) struct WalkReport {
    pub(crate) pages: u32,
    pub(crate) items: usize,
    pub(crate) end: WalkEnd,
}

pub(crate) struct PageWalker {
    sender: Arc<dyn HttpSender>,
    settings: CrawlSettings,
}

impl PageWalker {
    pub(crate) fn new(sender: Arc<dyn HttpSender>, settings: CrawlSettings) -> Self {
        PageWalker { sender, settings }
    }

    /// Listing URL of the page at `offset`.
    pub(crate) fn page_url(&self, site: &str, kind: MediaKind, offset: u32) -> String {
        format!(
            "{}?type={}&num={}&start={}",
            self.settings.api_url.replace(SITE_PLACEHOLDER, site),
            kind,
            self.settings.page_size,
            offset
        )
    }

    /// Walks every page of `site` for `kind`, handing each work item to `enqueue`
    /// in listing order.
    pub(crate) fn walk(
        &self,
        site: &str,
        kind: MediaKind,
        destination: &Path,
        enqueue: &mut dyn FnMut(WorkItem),
    ) -> WalkReport {
        let mut offset = self.settings.start_offset;
        let mut pages = 0;
        let mut items = 0;
        let mut failures = 0;

        let end = loop {
            let url = self.page_url(site, kind, offset);
            trace!("Requesting {}", url);

            let body = match self.sender.get_page(&url) {
                Ok(body) => body,
                Err(FetchError::NotFound) => {
                    info!("Site {} does not exist", site);
                    break WalkEnd::SiteNotFound;
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.settings.page_retry_attempts {
                        error!("Giving up on {} after {} attempts: {}", url, failures, e);
                        break WalkEnd::Abandoned(e);
                    }
                    warn!("Failed to fetch {} (attempt {}): {}", url, failures, e);
                    self.pause_before_retry();
                    continue;
                }
            };
            failures = 0;

            let text = match sanitize_body(&body) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Cannot decode response data from URL {}: {}", url, e);
                    self.pause_before_retry();
                    continue;
                }
            };
            self.dump_page(site, kind, offset, destination, &text);

            let posts = match decode_page(&text) {
                Ok(Some(posts)) => posts,
                Ok(None) => break WalkEnd::Exhausted,
                Err(e) => {
                    warn!("Error from URL {}: {}", url, e);
                    self.pause_before_retry();
                    continue;
                }
            };

            debug!("Page at offset {} of {} lists {} {}", offset, site, posts.len(), kind.plural());
            for post in posts {
                if self.settings.dump_posts_as_json {
                    self.dump_post(site, destination, &post);
                }

                if post.has_photoset() {
                    for member in post.into_photoset() {
                        enqueue(self.work_item(site, kind, destination, member));
                        items += 1;
                    }
                } else {
                    enqueue(self.work_item(site, kind, destination, post));
                    items += 1;
                }
            }

            pages += 1;
            offset += self.settings.page_size;
        };

        WalkReport { pages, items, end }
    }

    fn pause_before_retry(&self) {
        if !self.settings.retry_delay.is_zero() {
            thread::sleep(self.settings.retry_delay);
        }
    }

    fn work_item(&self, site: &str, kind: MediaKind, destination: &Path, post: Post) -> WorkItem {
        WorkItem {
            kind,
            post,
            site: site.to_string(),
            destination: destination.to_path_buf(),
        }
    }

    /// Writes the sanitized page as `{site}_{kind}_{num}_{start}.response.xml`.
    fn dump_page(&self, site: &str, kind: MediaKind, offset: u32, destination: &Path, text: &str) {
        let name = format!("{}_{}_{}_{}.response.xml", site, kind, self.settings.page_size, offset);
        if let Err(e) = fs::write(destination.join(&name), text) {
            warn!("Failed to write {}: {}", name, e);
        }
    }

    fn dump_post(&self, site: &str, destination: &Path, post: &Post) {
        let name = format!("{}_post_id_{}.post.json", site, post.id());
        let result = serde_json::to_string(post)
            .map_err(|e| e.to_string())
            .and_then(|json| fs::write(destination.join(&name), json).map_err(|e| e.to_string()));
        if let Err(e) = result {
            warn!("Failed to write {}: {}", name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tempfile::tempdir;

    use super::*;
    use crate::ripper::downloader::tests::{Reply, ScriptedSender};
    use crate::ripper::resolver::resolve;

    const DEMO_PAGE: &str = r#"<tumblr version="1.0"><posts start="0" total="2">
<post id="1" type="photo"><photo-url max-width="1280">https://a/img1.jpg</photo-url></post>
<post id="2" type="photo"><photoset>
<photo offset="o1"><regular-body>&lt;img src="https://x/200.jpg" srcset="https://x/200.jpg 200w, https://x/800.jpg 800w"&gt;</regular-body></photo>
<photo offset="o2"><regular-body>&lt;img src="https://x/200.jpg" srcset="https://x/200.jpg 200w, https://x/800.jpg 800w"&gt;</regular-body></photo>
</photoset></post>
</posts></tumblr>"#;

    const EMPTY_PAGE: &str = r#"<tumblr version="1.0"><posts start="50" total="2"></posts></tumblr>"#;

    fn settings() -> CrawlSettings {
        CrawlSettings {
            retry_delay: Duration::ZERO,
            ..CrawlSettings::from(&CrawlConfig::default())
        }
    }

    fn walker(sender: ScriptedSender) -> (PageWalker, Arc<ScriptedSender>) {
        let sender = Arc::new(sender);
        (PageWalker::new(sender.clone(), settings()), sender)
    }

    fn url(offset: u32) -> String {
        format!("https://demo.tumblr.com/api/read?type=photo&num=50&start={}", offset)
    }

    fn connection() -> FetchError {
        FetchError::Connection("refused".to_string())
    }

    fn collect(walker: &PageWalker, destination: &Path) -> (WalkReport, Vec<WorkItem>) {
        let mut items = Vec::new();
        let report = walker.walk("demo", MediaKind::Photo, destination, &mut |item| items.push(item));
        (report, items)
    }

    #[test]
    fn test_demo_page_expands_photosets() {
        let (walker, sender) = walker(
            ScriptedSender::default()
                .page(&url(0), vec![Reply::Body(DEMO_PAGE.as_bytes().to_vec())])
                .page(&url(50), vec![Reply::Body(EMPTY_PAGE.as_bytes().to_vec())]),
        );
        let dir = tempdir().unwrap();

        let (report, items) = collect(&walker, dir.path());

        assert!(matches!(report.end, WalkEnd::Exhausted));
        assert_eq!(report.pages, 1);
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| i.site == "demo" && i.destination == dir.path()));

        let urls: Vec<String> = items
            .iter()
            .map(|i| resolve(i.kind, &i.post).unwrap().url().to_string())
            .collect();
        assert_eq!(urls, ["https://a/img1.jpg", "https://x/800.jpg", "https://x/800.jpg"]);

        assert_eq!(sender.calls(&url(0)), 1);
        assert_eq!(sender.calls(&url(50)), 1);
        assert_eq!(sender.calls(&url(100)), 0);
        assert!(dir.path().join("demo_photo_50_0.response.xml").exists());
        assert!(dir.path().join("demo_photo_50_50.response.xml").exists());
    }

    #[test]
    fn test_site_not_found_ends_walk() {
        let (walker, _) = walker(ScriptedSender::default());
        let dir = tempdir().unwrap();

        let (report, items) = collect(&walker, dir.path());

        assert!(matches!(report.end, WalkEnd::SiteNotFound));
        assert!(items.is_empty());
    }

    #[test]
    fn test_undecodable_page_retries_same_offset() {
        let (walker, sender) = walker(
            ScriptedSender::default()
                .page(
                    &url(0),
                    vec![
                        Reply::Body(vec![0x3c, 0xff, 0xfe]),
                        Reply::Body(b"<tumblr><posts><post id=\"1\"></posts>".to_vec()),
                        Reply::Body(DEMO_PAGE.as_bytes().to_vec()),
                    ],
                )
                .page(&url(50), vec![Reply::Body(EMPTY_PAGE.as_bytes().to_vec())]),
        );
        let dir = tempdir().unwrap();

        let (report, items) = collect(&walker, dir.path());

        assert!(matches!(report.end, WalkEnd::Exhausted));
        assert_eq!(sender.calls(&url(0)), 3);
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_page_retries_wait_between_attempts() {
        let sender = Arc::new(
            ScriptedSender::default()
                .page(
                    &url(0),
                    vec![
                        Reply::Body(b"<tumblr><posts><post id=\"1\"></posts>".to_vec()),
                        Reply::Fail(connection),
                        Reply::Body(DEMO_PAGE.as_bytes().to_vec()),
                    ],
                )
                .page(&url(50), vec![Reply::Body(EMPTY_PAGE.as_bytes().to_vec())]),
        );
        let walker = PageWalker::new(
            sender.clone(),
            CrawlSettings {
                retry_delay: Duration::from_millis(50),
                ..settings()
            },
        );
        let dir = tempdir().unwrap();

        let started = Instant::now();
        let (report, items) = collect(&walker, dir.path());

        assert!(matches!(report.end, WalkEnd::Exhausted));
        assert_eq!(sender.calls(&url(0)), 3);
        assert_eq!(items.len(), 3);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_transport_failures_abandon_walk() {
        let (walker, sender) = walker(ScriptedSender::default().page(&url(0), vec![Reply::Fail(connection)]));
        let dir = tempdir().unwrap();

        let (report, items) = collect(&walker, dir.path());

        assert!(matches!(report.end, WalkEnd::Abandoned(FetchError::Connection(_))));
        assert_eq!(sender.calls(&url(0)), 5);
        assert!(items.is_empty());
    }

    #[test]
    fn test_transient_transport_failure_recovers() {
        let (walker, _) = walker(
            ScriptedSender::default()
                .page(&url(0), vec![Reply::Fail(connection), Reply::Body(DEMO_PAGE.as_bytes().to_vec())])
                .page(&url(50), vec![Reply::Body(EMPTY_PAGE.as_bytes().to_vec())]),
        );
        let dir = tempdir().unwrap();

        let (report, items) = collect(&walker, dir.path());

        assert!(matches!(report.end, WalkEnd::Exhausted));
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_posts_dumped_as_json() {
        let sender = Arc::new(
            ScriptedSender::default()
                .page(&url(0), vec![Reply::Body(DEMO_PAGE.as_bytes().to_vec())])
                .page(&url(50), vec![Reply::Body(EMPTY_PAGE.as_bytes().to_vec())]),
        );
        let walker = PageWalker::new(
            sender,
            CrawlSettings {
                dump_posts_as_json: true,
                ..settings()
            },
        );
        let dir = tempdir().unwrap();

        collect(&walker, dir.path());

        let json = fs::read_to_string(dir.path().join("demo_post_id_1.post.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["id"], "1");
        assert_eq!(value["photo_urls"][0], "https://a/img1.jpg");
        assert!(dir.path().join("demo_post_id_2.post.json").exists());
    }

    #[test]
    fn test_page_url_substitutes_site() {
        let (walker, _) = walker(ScriptedSender::default());
        assert_eq!(
            walker.page_url("someone", MediaKind::Video, 100),
            "https://someone.tumblr.com/api/read?type=video&num=50&start=100"
        );
    }
}
