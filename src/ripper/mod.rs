use std::fmt;

use serde::{Deserialize, Serialize};

pub(crate) mod downloader;
pub(crate) mod io;
pub(crate) mod pool;
pub(crate) mod post;
pub(crate) mod resolver;
pub(crate) mod scheduler;
pub(crate) mod sender;
pub(crate) mod stats;
pub(crate) mod tui;
pub(crate) mod walker;

/// The two kinds of media the listing API can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    /// Order in which a site's media kinds are crawled.
    pub(crate) const CRAWL_ORDER: [MediaKind; 2] = [MediaKind::Video, MediaKind::Photo];

    /// Value used for the `type` parameter of the listing API and in dump file names.
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
        }
    }

    /// Plural label used in log lines.
    pub(crate) fn plural(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photos",
            MediaKind::Video => "videos",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Formats a byte count to a human-readable string with appropriate units.
pub(crate) fn format_file_size(size_bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;

    let size = size_bytes as f64;

    if size >= TB {
        format!("{:.2} TB", size / TB)
    } else if size >= GB {
        format!("{:.2} GB", size / GB)
    } else if size >= MB {
        format!("{:.2} MB", size / MB)
    } else if size >= KB {
        format!("{:.2} KB", size / KB)
    } else {
        format!("{} B", size_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_labels() {
        assert_eq!(MediaKind::Photo.as_str(), "photo");
        assert_eq!(MediaKind::Video.to_string(), "video");
        assert_eq!(MediaKind::Video.plural(), "videos");
        assert_eq!(MediaKind::CRAWL_ORDER, [MediaKind::Video, MediaKind::Photo]);
    }

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1024), "1.00 KB");
        assert_eq!(format_file_size(1024 * 1024), "1.00 MB");
        assert_eq!(format_file_size(3 * 1024 * 1024 * 1024 / 2), "1.50 GB");
    }
}
