use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Anything between `<` and the next `>`. Deliberately not an HTML parser.
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

/// First `<img ... src="...">`, single or double quoted.
static IMG_SRC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img[^>]+src\s*=\s*["']([^"']+)["'][^>]*>"#).expect("valid regex")
});

/// Entities decoded by [`normalize`]. Anything else is left as written.
const ENTITIES: &[(&str, &str)] = &[
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&#39;", "'"),
    ("&apos;", "'"),
    ("&nbsp;", " "),
    // Last, so "&amp;lt;" decodes to the literal "&lt;" rather than "<"
    ("&amp;", "&"),
];

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp"];

/// Ellipsis appended by [`truncate_content`]
const ELLIPSIS: &str = "...";

/// How far back from the limit [`truncate_content`] will look for a word break.
const WORD_BREAK_WINDOW: usize = 20;

/// Converts a free-form (possibly HTML) article body into plain text.
///
/// Tags are removed by tag-boundary matching, the seven common named
/// entities are decoded, control characters are dropped and every run of
/// whitespace collapses to a single space. The result is trimmed.
///
/// # Examples
///
/// ```
/// use feedbower::util::normalize;
///
/// assert_eq!(normalize("<p>Hello <b>world</b></p>"), "Hello world");
/// assert_eq!(normalize("AT&amp;T"), "AT&T");
/// ```
pub fn normalize(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let stripped = TAG_RE.replace_all(raw, "");
    let decoded = decode_entities(&stripped);

    let mut out = String::with_capacity(decoded.len());
    let mut pending_space = false;
    for c in decoded.chars() {
        if c.is_whitespace() {
            pending_space = true;
        } else if c.is_control() {
            continue;
        } else {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        }
    }
    out
}

fn decode_entities(s: &str) -> Cow<'_, str> {
    if !s.contains('&') {
        return Cow::Borrowed(s);
    }
    let mut out = s.to_owned();
    for (entity, replacement) in ENTITIES {
        if out.contains(entity) {
            out = out.replace(entity, replacement);
        }
    }
    Cow::Owned(out)
}

/// Picks a representative image from an article body.
///
/// Only the first `<img>` tag is considered, and its `src` is accepted only
/// when it is an absolute http(s) URL whose path ends in a known image
/// extension. Relative paths and unknown extensions yield `None`.
///
/// # Examples
///
/// ```
/// use feedbower::util::extract_image;
///
/// assert_eq!(
///     extract_image(r#"<img src="http://x.com/a.jpg">"#).as_deref(),
///     Some("http://x.com/a.jpg")
/// );
/// assert_eq!(extract_image(r#"<img src="relative/a.jpg">"#), None);
/// ```
pub fn extract_image(raw: &str) -> Option<String> {
    let src = IMG_SRC_RE.captures(raw)?.get(1)?.as_str().trim();

    let url = Url::parse(src).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    let path = url.path().to_ascii_lowercase();
    if IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        Some(src.to_owned())
    } else {
        None
    }
}

/// Shortens plain text to at most `max_chars` characters plus `...`.
///
/// Prefers to cut at the last space inside the final 20 characters of the
/// window so words are not split; otherwise cuts hard at the limit.
pub fn truncate_content(s: &str, max_chars: usize) -> Cow<'_, str> {
    let Some((cut, _)) = s.char_indices().nth(max_chars) else {
        return Cow::Borrowed(s);
    };

    let window = &s[..cut];
    let floor = max_chars.saturating_sub(WORD_BREAK_WINDOW);
    let end = match window.rfind(' ') {
        Some(space) if space > 0 && window[..space].chars().count() > floor => space,
        _ => cut,
    };

    Cow::Owned(format!("{}{}", &s[..end], ELLIPSIS))
}
