//! Listing page decoding.
//!
//! The listing API answers with an XML document shaped like
//! `<tumblr><posts><post id=".."> .. </post></posts></tumblr>`. Pages are first
//! sanitized (non-printable ASCII stripped), then parsed into a small element
//! tree with `quick_xml`, and finally every `<post>` element is turned into a
//! [Post] carrying only the fields the resolver cares about.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Every run of characters outside printable ASCII is dropped before parsing.
static NON_PRINTABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\x20-\x7f]+").unwrap());

/// Identifier used when a post carries no `id` attribute.
pub(crate) const UNKNOWN_POST_ID: &str = "unknown";

/// Reasons a listing page could not be decoded. Both are transient: the same
/// offset is requested again.
#[derive(Error, Debug)]
pub(crate) enum PageDecodeError {
    #[error("response body is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("response body is not well-formed XML: {0}")]
    Malformed(String),
}

/// One content item from the listing API.
///
/// A post is immutable once decoded. Photo-set members are themselves [Post]s
/// that inherit their parent's identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct Post {
    id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    photo_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    regular_body: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    video_players: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    photoset: Vec<Post>,
}

impl Post {
    pub(crate) fn new(id: &str) -> Self {
        Post {
            id: id.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// The `photo-url` entries in document order; the API lists the largest first.
    pub(crate) fn photo_urls(&self) -> &[String] {
        &self.photo_urls
    }

    pub(crate) fn regular_body(&self) -> Option<&str> {
        self.regular_body.as_deref()
    }

    /// The player markup the video rules are evaluated against.
    ///
    /// The API repeats `video-player` once per embed width; the second entry is
    /// the one that carries the source markup, the first is used when it is
    /// the only one.
    pub(crate) fn video_player(&self) -> Option<&str> {
        self.video_players
            .get(1)
            .or_else(|| self.video_players.first())
            .map(String::as_str)
    }

    pub(crate) fn has_photoset(&self) -> bool {
        !self.photoset.is_empty()
    }

    /// Consumes the post and returns its photo-set members.
    pub(crate) fn into_photoset(self) -> Vec<Post> {
        self.photoset
    }

    /// Builds a post from a `<post>` element.
    fn from_element(element: &Element) -> Self {
        let id = element.attribute("id").unwrap_or(UNKNOWN_POST_ID);
        let mut post = Post::with_media_of(id, element);

        if let Some(photoset) = element.child("photoset") {
            post.photoset = photoset
                .children_named("photo")
                .map(|photo| Post::with_media_of(id, photo))
                .collect();
        }

        post
    }

    fn with_media_of(id: &str, element: &Element) -> Self {
        let mut post = Post::new(id);
        post.photo_urls = element.texts_of("photo-url");
        post.regular_body = element.child("regular-body").map(|e| e.text.clone());
        post.video_players = element.texts_of("video-player");
        post
    }
}

#[cfg(test)]
impl Post {
    pub(crate) fn with_photo_url(mut self, url: &str) -> Self {
        self.photo_urls.push(url.to_string());
        self
    }

    pub(crate) fn with_regular_body(mut self, body: &str) -> Self {
        self.regular_body = Some(body.to_string());
        self
    }

    pub(crate) fn with_video_player(mut self, markup: &str) -> Self {
        self.video_players.push(markup.to_string());
        self
    }
}

/// Decodes the raw body as UTF-8 and strips everything outside printable ASCII.
pub(crate) fn sanitize_body(raw: &[u8]) -> Result<String, PageDecodeError> {
    let text = std::str::from_utf8(raw)?;
    Ok(NON_PRINTABLE.replace_all(text, "").into_owned())
}

/// Parses a sanitized listing page.
///
/// Returns `Ok(None)` when the document has no `tumblr/posts/post` entries,
/// which is how the API signals that the listing is exhausted.
pub(crate) fn decode_page(xml: &str) -> Result<Option<Vec<Post>>, PageDecodeError> {
    let root = parse_tree(xml)?;
    let posts: Vec<Post> = match root.child("tumblr").and_then(|t| t.child("posts")) {
        Some(posts) => posts.children_named("post").map(Post::from_element).collect(),
        None => return Ok(None),
    };

    if posts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(posts))
    }
}

/// Minimal owned XML element used while walking the page.
#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn open(start: &BytesStart<'_>) -> Result<Self, PageDecodeError> {
        let mut attributes = Vec::new();
        for attribute in start.attributes() {
            let attribute = attribute.map_err(|e| PageDecodeError::Malformed(e.to_string()))?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let value = attribute
                .unescape_value()
                .map_err(|e| PageDecodeError::Malformed(e.to_string()))?
                .into_owned();
            attributes.push((key, value));
        }

        Ok(Element {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            attributes,
            ..Default::default()
        })
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn texts_of(&self, name: &str) -> Vec<String> {
        self.children_named(name).map(|c| c.text.clone()).collect()
    }
}

fn parse_tree(xml: &str) -> Result<Element, PageDecodeError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack = vec![Element::default()];

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => stack.push(Element::open(&start)?),
            Ok(Event::Empty(start)) => {
                let element = Element::open(&start)?;
                attach(&mut stack, element)?;
            }
            Ok(Event::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| PageDecodeError::Malformed("unbalanced end tag".to_string()))?;
                attach(&mut stack, element)?;
            }
            Ok(Event::Text(text)) => {
                // Unknown entities are kept verbatim rather than failing the page.
                let value = text
                    .unescape()
                    .unwrap_or_else(|_| String::from_utf8_lossy(&text).into_owned().into());
                push_text(&mut stack, value);
            }
            Ok(Event::CData(data)) => {
                let value = String::from_utf8_lossy(&data.into_inner()).into_owned();
                push_text(&mut stack, value.into());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(PageDecodeError::Malformed(e.to_string())),
            _ => {}
        }
    }

    if stack.len() != 1 {
        return Err(PageDecodeError::Malformed("document ended inside an element".to_string()));
    }
    stack
        .pop()
        .ok_or_else(|| PageDecodeError::Malformed("empty document".to_string()))
}

fn attach(stack: &mut [Element], element: Element) -> Result<(), PageDecodeError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(element);
            Ok(())
        }
        None => Err(PageDecodeError::Malformed("unbalanced end tag".to_string())),
    }
}

fn push_text(stack: &mut [Element], value: Cow<'_, str>) {
    if let Some(current) = stack.last_mut() {
        current.text.push_str(&value);
    }
}
