use std::sync::OnceLock;

use scraper::{ElementRef, Html, Node, Selector};
use serde_json::Value;
use tracing::debug;

use super::text::decode_text;
use super::{
    DEFAULT_SIZE_LIMIT, LazyRegex, ParseContext, ParserKind, SourceParser, collapse_blank_lines,
};
use crate::error::ParserError;
use crate::fetch::FetchRequest;

const META_SNIFF_BYTES: usize = 4096;

const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

/// Host-specific behavior layered on the generic HTML parser.
pub trait HtmlFallback: Send + Sync {
    /// Runs on every parsed document before text extraction.
    fn inspect(&self, _document: &Html, _context: &ParseContext<'_>) -> Result<(), ParserError> {
        Ok(())
    }

    /// Runs when the document has no visible text. The first `Some` wins.
    fn recover_empty(&self, _raw: &str, _context: &ParseContext<'_>) -> Option<String> {
        None
    }
}

pub struct HtmlParser {
    fallbacks: Vec<Box<dyn HtmlFallback>>,
}

impl HtmlParser {
    pub fn new(fallbacks: Vec<Box<dyn HtmlFallback>>) -> Self {
        Self { fallbacks }
    }

    pub fn with_default_fallbacks() -> Self {
        Self::new(vec![Box::new(WebArchivePdfViewer), Box::new(BlogspotFeed)])
    }

    pub fn bare() -> Self {
        Self::new(Vec::new())
    }
}

impl SourceParser for HtmlParser {
    fn kind(&self) -> ParserKind {
        ParserKind::Html
    }

    fn parse(&self, data: &[u8], context: &ParseContext<'_>) -> Result<String, ParserError> {
        let declared = context
            .charset
            .map(str::to_string)
            .or_else(|| meta_charset(data));
        let raw = decode_text(data, declared.as_deref());
        if !raw.contains('<') {
            return Ok(collapse_blank_lines(&raw));
        }

        let document = Html::parse_document(&raw);
        fail_if_mirror(&document, &context.args.mirror_hints)?;
        for fallback in &self.fallbacks {
            fallback.inspect(&document, context)?;
        }

        let text = visible_text(&document);
        if text.is_empty() {
            for fallback in &self.fallbacks {
                if let Some(recovered) = fallback.recover_empty(&raw, context) {
                    return Ok(recovered);
                }
            }
        }
        Ok(text)
    }
}

/// Charset named by a `<meta charset>` or `http-equiv` tag near the top of the document.
pub fn meta_charset(data: &[u8]) -> Option<String> {
    static META_CHARSET: LazyRegex =
        LazyRegex::new(r#"(?i)<meta[^>]*?charset\s*=\s*["']?\s*([a-z0-9_:.\-]+)"#);
    let head = String::from_utf8_lossy(&data[..data.len().min(META_SNIFF_BYTES)]);
    META_CHARSET
        .get()?
        .captures(&head)
        .and_then(|captures| captures.get(1))
        .map(|charset| charset.as_str().to_ascii_lowercase())
}

fn fail_if_mirror(document: &Html, hints: &[String]) -> Result<(), ParserError> {
    if hints.is_empty() {
        return Ok(());
    }
    for element in document.root_element().descendants().filter_map(ElementRef::wrap) {
        for attribute in ["href", "src"] {
            let Some(value) = element.value().attr(attribute) else {
                continue;
            };
            if hints.iter().any(|hint| value.contains(hint.as_str())) {
                debug!(attribute, value, "mirror hint matched");
                return Err(ParserError::Exclusion);
            }
        }
    }
    Ok(())
}

/// Body text without scripts, styles or comments, one collapsed line per text node.
pub fn visible_text(document: &Html) -> String {
    let root = body_selector()
        .and_then(|selector| document.select(selector).next())
        .unwrap_or_else(|| document.root_element());
    let mut lines = Vec::new();
    collect_text(root, &mut lines);
    lines.join("\n")
}

fn collect_text(element: ElementRef<'_>, lines: &mut Vec<String>) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
                if !collapsed.is_empty() {
                    lines.push(collapsed);
                }
            }
            Node::Element(inner) => {
                if HIDDEN_ELEMENTS.contains(&inner.name()) {
                    continue;
                }
                if let Some(child_element) = ElementRef::wrap(child) {
                    collect_text(child_element, lines);
                }
            }
            _ => {}
        }
    }
}

fn body_selector() -> Option<&'static Selector> {
    static SELECTOR: OnceLock<Option<Selector>> = OnceLock::new();
    SELECTOR
        .get_or_init(|| Selector::parse("body").ok())
        .as_ref()
}

/// Wayback Machine wraps archived PDFs in a viewer page whose `#playback`
/// iframe points at the real document.
pub struct WebArchivePdfViewer;

impl HtmlFallback for WebArchivePdfViewer {
    fn inspect(&self, document: &Html, context: &ParseContext<'_>) -> Result<(), ParserError> {
        let Some(url) = context.url else {
            return Ok(());
        };
        if url.host_str() != Some("web.archive.org") {
            return Ok(());
        }
        static SELECTOR: OnceLock<Option<Selector>> = OnceLock::new();
        let Some(selector) = SELECTOR
            .get_or_init(|| Selector::parse("iframe#playback").ok())
            .as_ref()
        else {
            return Ok(());
        };
        let Some(src) = document
            .select(selector)
            .next()
            .and_then(|frame| frame.value().attr("src"))
        else {
            return Ok(());
        };
        let looks_like_pdf = |value: &str| value.to_ascii_lowercase().contains(".pdf");
        if !looks_like_pdf(src) && !looks_like_pdf(url.path()) {
            return Ok(());
        }
        let target = url
            .join(src)
            .map(|target| target.to_string())
            .unwrap_or_else(|_| src.to_string());
        Err(ParserError::Redirect(target))
    }
}

/// Blogspot dynamic views render posts client-side; the post body is
/// available from the blog's JSON feed instead.
pub struct BlogspotFeed;

impl BlogspotFeed {
    fn post_id(raw: &str) -> Option<&str> {
        static POST_ID: LazyRegex = LazyRegex::new(r"'postId': '(\d+)'");
        POST_ID
            .get()?
            .captures(raw)
            .and_then(|captures| captures.get(1))
            .map(|id| id.as_str())
    }
}

impl HtmlFallback for BlogspotFeed {
    fn recover_empty(&self, raw: &str, context: &ParseContext<'_>) -> Option<String> {
        let post_id = Self::post_id(raw)?;
        let host = context.url?.host_str()?;
        let fetcher = context.fetcher?;
        let feed_url = format!(
            "https://{host}/feeds/posts/default/{post_id}?alt=json&v=2&dynamicviews=1&rewriteforssl=true"
        );
        let limit = |_: &str| Some(DEFAULT_SIZE_LIMIT);
        let request = FetchRequest {
            url: &feed_url,
            headers: context.headers,
            timeout: context.timeout,
            size_limit: &limit,
        };
        let fetched = match fetcher.fetch(&request) {
            Ok(fetched) => fetched,
            Err(error) => {
                debug!(url = %feed_url, %error, "blog feed fetch failed");
                return None;
            }
        };
        let payload: Value = serde_json::from_slice(&fetched.body).ok()?;
        let content = payload
            .get("entry")?
            .get("content")?
            .get("$t")?
            .as_str()?;
        let text = visible_text(&Html::parse_document(content));
        (!text.is_empty()).then_some(text)
    }
}
