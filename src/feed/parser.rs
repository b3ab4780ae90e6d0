use crate::util::extract_image;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use thiserror::Error;

/// Maximum element nesting accepted in a feed document.
pub const MAX_XML_DEPTH: usize = 64;

/// Whole-document parse failures. Any of these fails the source for the current run.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Malformed XML: {0}")]
    Xml(String),

    #[error("Document nested deeper than {0} levels")]
    MaxDepthExceeded(usize),

    #[error("Unrecognized document root <{0}>")]
    UnexpectedRoot(String),

    #[error("{dialect} document has no <{element}> element")]
    MissingElement {
        dialect: Dialect,
        element: &'static str,
    },

    #[error("Document is empty")]
    Empty,
}

/// A single entry the parser had to drop. Never fails the document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryError {
    #[error("entry {index} has neither a title nor a body")]
    MissingTitleAndBody { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Rss,
    Atom,
    Rdf,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Dialect::Rss => "RSS",
            Dialect::Atom => "Atom",
            Dialect::Rdf => "RDF",
        })
    }
}

/// An article as it appears in the document, before text normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawArticle {
    pub title: String,
    /// Possibly HTML
    pub content: String,
    /// Empty when the entry carries no usable link
    pub url: String,
    /// Fetch time when the entry has no parseable date
    pub published_at: DateTime<Utc>,
    pub image_url: Option<String>,
}

/// Channel metadata plus the entries that survived per-entry validation.
#[derive(Debug, Clone)]
pub struct FeedDocument {
    pub dialect: Dialect,
    pub title: String,
    pub description: String,
    pub link: String,
    pub category: String,
    pub articles: Vec<RawArticle>,
    pub skipped: Vec<EntryError>,
}

/// Guesses the dialect from the raw bytes without parsing.
///
/// Falls back to [`Dialect::Rss`]; the structural parse then decides whether
/// the document really is RSS.
pub fn sniff_dialect(bytes: &[u8]) -> Dialect {
    if contains(bytes, b"<rss") || contains(bytes, b"<RSS") {
        Dialect::Rss
    } else if contains(bytes, b"<feed") && (contains(bytes, b"atom") || contains(bytes, b"Atom")) {
        Dialect::Atom
    } else if contains(bytes, b"<rdf:RDF") {
        Dialect::Rdf
    } else {
        Dialect::Rss
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Parses a feed, using the current time as the fallback publish date.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedDocument, ParseError> {
    parse_feed_at(bytes, Utc::now())
}

/// Parses an RSS 2.0, Atom or RDF document.
///
/// `fetched_at` is used for entries whose date is missing or unparseable.
/// Entries without a title and a body are dropped and reported in
/// [`FeedDocument::skipped`].
///
/// # Errors
///
/// Returns [`ParseError`] when the XML is malformed or the root element is
/// not one of `<rss>`, `<feed>` or `<rdf:RDF>`.
///
/// # Security
///
/// - XXE: quick-xml 0.37 never expands `<!ENTITY>` declarations. Text that
///   references an unknown entity is kept verbatim instead of being resolved.
/// - Nesting is capped at [`MAX_XML_DEPTH`].
pub fn parse_feed_at(bytes: &[u8], fetched_at: DateTime<Utc>) -> Result<FeedDocument, ParseError> {
    let dialect = sniff_dialect(bytes);
    let root = build_tree(bytes)?;

    match (dialect, root.local.as_str()) {
        (Dialect::Atom, "feed") => Ok(parse_atom(&root, fetched_at)),
        (Dialect::Rss | Dialect::Rdf, "RDF") => parse_rdf(&root, fetched_at),
        (Dialect::Rss, local) if local.eq_ignore_ascii_case("rss") => parse_rss(&root, fetched_at),
        _ => Err(ParseError::UnexpectedRoot(root.name)),
    }
}

// ============================================================================
// Dialects
// ============================================================================

fn parse_rss(root: &Element, fetched_at: DateTime<Utc>) -> Result<FeedDocument, ParseError> {
    let channel = root.child("channel").ok_or(ParseError::MissingElement {
        dialect: Dialect::Rss,
        element: "channel",
    })?;

    let mut doc = channel_metadata(Dialect::Rss, channel);
    collect_items(&mut doc, channel.children_named("item"), fetched_at);
    Ok(doc)
}

fn parse_rdf(root: &Element, fetched_at: DateTime<Utc>) -> Result<FeedDocument, ParseError> {
    let mut doc = match root.child("channel") {
        Some(channel) => channel_metadata(Dialect::Rdf, channel),
        None => channel_metadata(Dialect::Rdf, &Element::default()),
    };
    // RSS 1.0 items are siblings of <channel>
    collect_items(&mut doc, root.children_named("item"), fetched_at);
    Ok(doc)
}

fn channel_metadata(dialect: Dialect, channel: &Element) -> FeedDocument {
    FeedDocument {
        dialect,
        title: channel.child_text("title").unwrap_or_default().to_owned(),
        description: channel
            .child_text("description")
            .unwrap_or_default()
            .to_owned(),
        link: channel.child_text("link").unwrap_or_default().to_owned(),
        category: channel.child_text("category").unwrap_or_default().to_owned(),
        articles: Vec::new(),
        skipped: Vec::new(),
    }
}

fn collect_items<'a>(
    doc: &mut FeedDocument,
    items: impl Iterator<Item = &'a Element>,
    fetched_at: DateTime<Utc>,
) {
    for (index, item) in items.enumerate() {
        match rss_item(item, index, fetched_at) {
            Ok(article) => doc.articles.push(article),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping feed entry");
                doc.skipped.push(e);
            }
        }
    }
}

fn rss_item(
    item: &Element,
    index: usize,
    fetched_at: DateTime<Utc>,
) -> Result<RawArticle, EntryError> {
    let title = item.child_text("title");
    let description = item.child_text("description");
    if title.is_none() && description.is_none() {
        return Err(EntryError::MissingTitleAndBody { index });
    }

    // content:encoded, then <content>, then <description>; never merged
    let content = item
        .child_text("encoded")
        .or_else(|| item.child_text("content"))
        .or(description)
        .unwrap_or_default();

    let url = item
        .child_text("link")
        .or_else(|| permalink_guid(item))
        .unwrap_or_default();

    let published_at = item
        .child_text("pubDate")
        .or_else(|| item.child_text("date"))
        .and_then(parse_date)
        .unwrap_or(fetched_at);

    let image_url = extract_image(content).or_else(|| image_enclosure(item));

    Ok(RawArticle {
        title: title.unwrap_or_default().to_owned(),
        content: content.to_owned(),
        url: url.to_owned(),
        published_at,
        image_url,
    })
}

/// A `<guid>` doubles as the link when it is an http(s) permalink.
fn permalink_guid(item: &Element) -> Option<&str> {
    let guid = item.child("guid")?;
    if guid.attr("isPermaLink") == Some("false") {
        return None;
    }
    let text = guid.text.trim();
    (text.starts_with("http://") || text.starts_with("https://")).then_some(text)
}

fn image_enclosure(item: &Element) -> Option<String> {
    item.children_named("enclosure")
        .find(|e| e.attr("type").is_some_and(|t| t.starts_with("image/")))
        .and_then(|e| e.attr("url"))
        .map(str::to_owned)
}

fn parse_atom(root: &Element, fetched_at: DateTime<Utc>) -> FeedDocument {
    let mut doc = FeedDocument {
        dialect: Dialect::Atom,
        title: root.child_text("title").unwrap_or_default().to_owned(),
        description: root.child_text("subtitle").unwrap_or_default().to_owned(),
        link: alternate_link(root).unwrap_or_default().to_owned(),
        category: root
            .child("category")
            .and_then(|c| c.attr("term"))
            .unwrap_or_default()
            .to_owned(),
        articles: Vec::new(),
        skipped: Vec::new(),
    };

    for (index, entry) in root.children_named("entry").enumerate() {
        match atom_entry(entry, index, fetched_at) {
            Ok(article) => doc.articles.push(article),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping feed entry");
                doc.skipped.push(e);
            }
        }
    }
    doc
}

fn atom_entry(
    entry: &Element,
    index: usize,
    fetched_at: DateTime<Utc>,
) -> Result<RawArticle, EntryError> {
    let title = entry.child_text("title");
    let summary = entry.child_text("summary");
    if title.is_none() && summary.is_none() {
        return Err(EntryError::MissingTitleAndBody { index });
    }

    let content = entry.child_text("content").or(summary).unwrap_or_default();

    let published_at = entry
        .child_text("published")
        .or_else(|| entry.child_text("updated"))
        .and_then(parse_date)
        .unwrap_or(fetched_at);

    Ok(RawArticle {
        title: title.unwrap_or_default().to_owned(),
        content: content.to_owned(),
        url: alternate_link(entry).unwrap_or_default().to_owned(),
        published_at,
        image_url: extract_image(content),
    })
}

/// First `<link>` whose `rel` is `alternate` or absent.
fn alternate_link(element: &Element) -> Option<&str> {
    element
        .children_named("link")
        .find(|link| matches!(link.attr("rel"), None | Some("") | Some("alternate")))
        .and_then(|link| link.attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty())
}

// ============================================================================
// Dates
// ============================================================================

/// Layouts with a numeric offset, tried after RFC 2822 and RFC 3339.
const OFFSET_LAYOUTS: &[&str] = &[
    "%a, %d %b %Y %H:%M:%S %z",
    "%d %b %Y %H:%M:%S %z",
    "%a, %d %b %Y %H:%M %z",
    "%Y-%m-%dT%H:%M:%S%z",
];

/// Layouts without zone information, read as UTC.
const NAIVE_LAYOUTS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%a, %d %b %Y %H:%M:%S",
    "%d %b %Y %H:%M:%S",
];

/// Best-effort publication date. The first layout that parses wins.
///
/// Order: RFC 1123/2822 (named or numeric zone), RFC 3339 (with or without
/// fractional seconds), then common non-standard layouts. Unknown zone
/// abbreviations such as `CEST` are dropped and the time is read as UTC.
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for layout in OFFSET_LAYOUTS {
        if let Ok(dt) = DateTime::parse_from_str(s, layout) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    if let Some(dt) = parse_naive(s) {
        return Some(dt);
    }

    // "Mon, 2 Jan 2006 15:04:05 MST" with an abbreviation chrono doesn't know
    if let Some((rest, zone)) = s.rsplit_once(' ') {
        if !zone.is_empty() && zone.chars().all(|c| c.is_ascii_alphabetic()) {
            return parse_naive(rest.trim_end());
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn parse_naive(s: &str) -> Option<DateTime<Utc>> {
    NAIVE_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(s, layout).ok())
        .map(|dt| dt.and_utc())
}

// ============================================================================
// Element tree
// ============================================================================

/// Minimal owned XML element. Names keep their prefix in `name`; lookups
/// go through the namespace-free `local` name.
#[derive(Debug, Default)]
struct Element {
    name: String,
    local: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn from_start(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Self {
        let attrs = e
            .attributes()
            .flatten()
            .filter_map(|attr| {
                let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
                let value = attr.decode_and_unescape_value(reader.decoder()).ok()?;
                Some((key, value.into_owned()))
            })
            .collect();

        Self {
            name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
            local: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
            attrs,
            text: String::new(),
            children: Vec::new(),
        }
    }

    fn child(&self, local: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.local == local)
    }

    fn children_named<'a>(&'a self, local: &'static str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.local == local)
    }

    /// Trimmed text of the first child with this name that has any.
    fn child_text(&self, local: &str) -> Option<&str> {
        self.children
            .iter()
            .filter(|c| c.local == local)
            .map(|c| c.text.trim())
            .find(|t| !t.is_empty())
    }

    fn attr(&self, local: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == local)
            .map(|(_, v)| v.as_str())
    }
}

fn build_tree(bytes: &[u8]) -> Result<Element, ParseError> {
    // Untrimmed, so text and CDATA segments keep the whitespace between them.
    // Readers trim the joined text.
    let mut reader = Reader::from_reader(bytes);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if stack.len() >= MAX_XML_DEPTH {
                    return Err(ParseError::MaxDepthExceeded(MAX_XML_DEPTH));
                }
                stack.push(Element::from_start(&e, &reader));
            }
            Ok(Event::Empty(e)) => {
                let element = Element::from_start(&e, &reader);
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| ParseError::Xml("unbalanced end tag".to_string()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::Text(t)) => {
                if let Some(top) = stack.last_mut() {
                    // Unknown entities (including DTD-declared ones) stay as written
                    match t.unescape() {
                        Ok(text) => top.text.push_str(&text),
                        Err(_) => top.text.push_str(&String::from_utf8_lossy(&t)),
                    }
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(ParseError::Xml(format!(
            "unexpected end of document inside <{}>",
            open.name
        )));
    }
    root.ok_or(ParseError::Empty)
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), ParseError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err(ParseError::Xml("multiple root elements".to_string())),
    }
    Ok(())
}
