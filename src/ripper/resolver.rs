//! Turns a decoded [Post] into a single downloadable URL.
//!
//! Posts arrive in several shapes depending on when they were created. Each
//! shape is handled by one rule, and the rules for a media kind are tried in a
//! fixed priority order; the first rule that yields a URL wins.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::ripper::post::Post;
use crate::ripper::MediaKind;

/// Resolution tag used when the URL carries no size hint.
pub(crate) const UNKNOWN_RESOLUTION: &str = "unknown";

static SRCSET_ATTRIBUTE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"srcset="([^"]+)""#).unwrap());
static SRCSET_ENTRY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(https://\S+)\s+(\d+)w").unwrap());
static IMG_SRC: Lazy<Regex> = Lazy::new(|| Regex::new(r#"<img[^>]*src="([^"]+)""#).unwrap());

static VIDEO_SOURCE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<source\s+src="([^"]*\.mp4[^"]*)"[^>]*>"#).unwrap());
static VIDEO_HD_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r#""hdUrl":("([^\s,]*)"|false),"#).unwrap());
static VIDEO_DEFAULT_SRC: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?s)^.*src="(\S*)" "#).unwrap());

static SIZE_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"/s(\d+)x\d+/").unwrap());
static SIZE_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"_(\d+)\.[A-Za-z0-9]+(?:[?#]|$)").unwrap());

/// A URL ready for download plus the resolution tag used for statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedMedia {
    url: String,
    resolution: String,
}

impl ResolvedMedia {
    pub(crate) fn new(url: &str) -> Self {
        ResolvedMedia {
            url: url.to_string(),
            resolution: resolution_tag(url),
        }
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn resolution(&self) -> &str {
        &self.resolution
    }
}

/// Photo extraction rules, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhotoRule {
    /// The structured `photo-url` field of photo posts.
    DirectUrl,
    /// The widest candidate of a `srcset` attribute in the post body.
    Srcset,
    /// The first `<img src>` in the post body.
    ImgSrc,
}

impl PhotoRule {
    pub(crate) const ORDER: [PhotoRule; 3] = [PhotoRule::DirectUrl, PhotoRule::Srcset, PhotoRule::ImgSrc];

    fn extract(self, post: &Post) -> Option<String> {
        match self {
            PhotoRule::DirectUrl => post.photo_urls().first().filter(|u| !u.is_empty()).cloned(),
            PhotoRule::Srcset => {
                let body = post.regular_body()?;
                let srcset = SRCSET_ATTRIBUTE.captures(body)?.get(1)?.as_str();
                best_srcset_candidate(srcset).map(str::to_string)
            }
            PhotoRule::ImgSrc => {
                let body = post.regular_body()?;
                IMG_SRC
                    .captures(body)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
            }
        }
    }
}

/// Video extraction rules, evaluated against the post's player markup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VideoRule {
    /// A `<source src="...mp4...">` tag.
    SourceTag,
    /// The legacy `"hdUrl"` JSON option, unless it is `false`.
    HdUrl,
    /// The legacy player's last `src="..."` attribute.
    DefaultSrc,
}

impl VideoRule {
    pub(crate) const ORDER: [VideoRule; 3] = [VideoRule::SourceTag, VideoRule::HdUrl, VideoRule::DefaultSrc];

    fn extract(self, player: &str) -> Option<String> {
        let url = match self {
            VideoRule::SourceTag => VIDEO_SOURCE_TAG
                .captures(player)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string()),
            VideoRule::HdUrl => VIDEO_HD_URL
                .captures(player)
                .and_then(|c| c.get(2))
                .map(|m| m.as_str().replace('\\', "")),
            VideoRule::DefaultSrc => VIDEO_DEFAULT_SRC
                .captures(player)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string()),
        };
        url.filter(|u| !u.is_empty())
    }
}

/// Resolves a post to its download URL, or `None` when no rule matches.
pub(crate) fn resolve(kind: MediaKind, post: &Post) -> Option<ResolvedMedia> {
    let url = match kind {
        MediaKind::Photo => PhotoRule::ORDER.iter().find_map(|rule| rule.extract(post)),
        MediaKind::Video => {
            let player = post.video_player()?;
            VideoRule::ORDER.iter().find_map(|rule| rule.extract(player))
        }
    }?;

    Some(ResolvedMedia::new(&url))
}

/// Picks the URL with the largest declared width from a `srcset` value.
///
/// Entries that do not look like `https://... NNNw` are ignored. Ties keep the
/// entry that appears first.
pub(crate) fn best_srcset_candidate(srcset: &str) -> Option<&str> {
    let mut best: Option<(u64, &str)> = None;

    for entry in srcset.split(',') {
        let Some(captures) = SRCSET_ENTRY.captures(entry.trim()) else {
            continue;
        };
        let (Some(url), Some(width)) = (captures.get(1), captures.get(2)) else {
            continue;
        };
        let Ok(width) = width.as_str().parse::<u64>() else {
            continue;
        };

        match best {
            Some((best_width, _)) if best_width >= width => {}
            _ => best = Some((width, url.as_str())),
        }
    }

    best.map(|(_, url)| url)
}

/// Infers a coarse resolution tag such as `1280px` from the URL structure.
pub(crate) fn resolution_tag(url: &str) -> String {
    SIZE_SEGMENT
        .captures(url)
        .or_else(|| SIZE_SUFFIX.captures(url))
        .and_then(|c| c.get(1))
        .map(|m| format!("{}px", m.as_str()))
        .unwrap_or_else(|| UNKNOWN_RESOLUTION.to_string())
}
