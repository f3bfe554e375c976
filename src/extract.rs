//! Field extraction from semi-structured lookup responses.
//!
//! Every field is resolved by an ordered list of named strategies; the first strategy
//! that yields a value wins. Each strategy is a plain `&str -> Option<T>` function so it
//! can be tested on its own.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::SyncError;

pub const TITLE_DELIMITER: &str = " - ";
pub const DEFAULT_COVER_SELECTORS: &[&str] = &[".cover", ".album-art"];

static PAGE_TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"));
static LABELED_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<h([1-6])\b[^>]*\b(?:class|id)\s*=\s*["'][^"']*title[^"']*["'][^>]*>(.*?)</h[1-6]>"#)
        .expect("valid regex")
});
static LABELED_PARAGRAPH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<p\b[^>]*\b(?:class|id)\s*=\s*["'][^"']*artist[^"']*["'][^>]*>(.*?)</p>"#)
        .expect("valid regex")
});
static MEDIA_SOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<(?:source|audio)\b[^>]*\bsrc\s*=\s*["']([^"']+)["']"#)
        .expect("valid regex")
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));
static CSS_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)url\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).expect("valid regex")
});

static OPEN_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[A-Za-z][^>]*>").expect("valid regex"));
static CLASS_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)\sclass\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid regex")
});
static ID_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)\sid\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid regex")
});
static STYLE_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)\sstyle\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid regex")
});

type ExtractFn<T> = Box<dyn Fn(&str) -> Option<T> + Send + Sync>;

pub struct Strategy<T> {
    name: String,
    extract: ExtractFn<T>,
}

impl<T> Strategy<T> {
    pub fn new<F>(name: impl Into<String>, extract: F) -> Self
    where
        F: Fn(&str) -> Option<T> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            extract: Box::new(extract),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, body: &str) -> Option<T> {
        (self.extract)(body)
    }
}

impl<T> std::fmt::Debug for Strategy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy").field("name", &self.name).finish()
    }
}

/// A value together with the name of the strategy that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted<T> {
    pub value: T,
    pub strategy: String,
}

pub fn first_match<T>(strategies: &[Strategy<T>], body: &str) -> Option<Extracted<T>> {
    strategies.iter().find_map(|strategy| {
        strategy.apply(body).map(|value| Extracted {
            value,
            strategy: strategy.name().to_string(),
        })
    })
}

#[derive(Debug)]
pub struct ExtractionPlan {
    pub title: Vec<Strategy<String>>,
    pub artist: Vec<Strategy<String>>,
    pub audio: Vec<Strategy<String>>,
    pub cover: Vec<Strategy<String>>,
}

impl ExtractionPlan {
    pub fn new<S: AsRef<str>>(cover_selectors: &[S]) -> Result<Self, SyncError> {
        Ok(Self {
            title: vec![
                Strategy::new("page-title", |body| page_title(body).map(|(title, _)| title)),
                Strategy::new("labeled-heading", labeled_heading),
            ],
            artist: vec![
                Strategy::new("page-title", |body| page_title(body).map(|(_, artist)| artist)),
                Strategy::new("labeled-paragraph", labeled_paragraph),
            ],
            audio: vec![Strategy::new("media-source", media_source)],
            cover: cover_strategies(cover_selectors)?,
        })
    }
}

impl Default for ExtractionPlan {
    fn default() -> Self {
        Self::new(DEFAULT_COVER_SELECTORS).unwrap_or_else(|_| Self {
            title: Vec::new(),
            artist: Vec::new(),
            audio: Vec::new(),
            cover: Vec::new(),
        })
    }
}

/// `<title>Song - Artist</title>` split on the first delimiter.
pub fn page_title(body: &str) -> Option<(String, String)> {
    let raw = PAGE_TITLE_RE.captures(body)?.get(1)?.as_str();
    let text = clean_text(raw);
    let (title, artist) = text.split_once(TITLE_DELIMITER)?;
    let (title, artist) = (title.trim(), artist.trim());
    if title.is_empty() || artist.is_empty() {
        return None;
    }
    Some((title.to_string(), artist.to_string()))
}

pub fn labeled_heading(body: &str) -> Option<String> {
    let raw = LABELED_HEADING_RE.captures(body)?.get(2)?.as_str();
    non_empty(clean_text(raw))
}

pub fn labeled_paragraph(body: &str) -> Option<String> {
    let raw = LABELED_PARAGRAPH_RE.captures(body)?.get(1)?.as_str();
    non_empty(clean_text(raw))
}

pub fn media_source(body: &str) -> Option<String> {
    let raw = MEDIA_SOURCE_RE.captures(body)?.get(1)?.as_str();
    non_empty(decode_entities(raw.trim()))
}

/// Stylesheet rules for every selector first, then inline `style` attributes.
fn cover_strategies<S: AsRef<str>>(selectors: &[S]) -> Result<Vec<Strategy<String>>, SyncError> {
    let mut strategies = selectors
        .iter()
        .map(|selector| style_background(selector.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    strategies.extend(
        selectors
            .iter()
            .filter_map(|selector| inline_background(selector.as_ref())),
    );
    Ok(strategies)
}

/// Image URL from a `background`/`background-image` declaration in the rule for `selector`.
pub fn style_background(selector: &str) -> Result<Strategy<String>, SyncError> {
    let rule = Regex::new(&format!(
        r"(?is){}\s*\{{([^}}]*)\}}",
        regex::escape(selector.trim())
    ))
    .map_err(|err| SyncError::InvalidConfig(format!("cover selector {selector}: {err}")))?;
    Ok(Strategy::new(format!("style:{selector}"), move |body| {
        rule.captures_iter(body).find_map(|caps| {
            let declarations = caps.get(1)?.as_str();
            let url = CSS_URL_RE.captures(declarations)?.get(1)?.as_str();
            non_empty(decode_entities(url))
        })
    }))
}

/// Image URL from the `style` attribute of an element matched by a `.class` or `#id`
/// selector. Other selector shapes have no inline form.
pub fn inline_background(selector: &str) -> Option<Strategy<String>> {
    let selector = selector.trim();
    let (attr, name): (&'static LazyLock<Regex>, String) =
        if let Some(class) = selector.strip_prefix('.') {
            (&CLASS_ATTR_RE, class.to_string())
        } else if let Some(id) = selector.strip_prefix('#') {
            (&ID_ATTR_RE, id.to_string())
        } else {
            return None;
        };
    if name.is_empty() {
        return None;
    }
    Some(Strategy::new(format!("inline:{selector}"), move |body| {
        OPEN_TAG_RE.find_iter(body).find_map(|tag| {
            let tag = tag.as_str();
            let names = attr_value(attr, tag)?;
            if !names.split_whitespace().any(|candidate| candidate == name) {
                return None;
            }
            let style = attr_value(&STYLE_ATTR_RE, tag)?;
            let url = CSS_URL_RE.captures(style)?.get(1)?.as_str();
            non_empty(decode_entities(url))
        })
    }))
}

fn attr_value<'a>(pattern: &Regex, tag: &'a str) -> Option<&'a str> {
    let caps = pattern.captures(tag)?;
    caps.get(1).or_else(|| caps.get(2)).map(|found| found.as_str())
}

fn clean_text(raw: &str) -> String {
    let stripped = TAG_RE.replace_all(raw, " ");
    let decoded = decode_entities(&stripped);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_empty(value: String) -> Option<String> {
    (!value.trim().is_empty()).then_some(value)
}

pub fn decode_entities(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let decoded = tail
            .find(';')
            .filter(|end| *end <= 10)
            .and_then(|end| decode_entity(&tail[1..end]).map(|ch| (ch, end)));
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let number = name.strip_prefix('#')?;
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}
