//! Turning fetched bytes into comparable plain text.
//!
//! Source parsers are looked up by content type through a [`ParserRegistry`].
//! The article parser lives alongside them but works on the article's own
//! wikitext instead of fetched documents.

pub mod article;
pub mod html;
pub mod pdf;
pub mod text;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use reqwest::Url;

use crate::error::ParserError;
use crate::fetch::SourceFetcher;

pub use article::{ArticleTextParser, ChunkOptions, SentenceTokenizer};
pub use html::{BlogspotFeed, HtmlFallback, HtmlParser, WebArchivePdfViewer};
pub use pdf::PdfParser;
pub use text::PlainTextParser;

pub const PDF_SIZE_LIMIT: usize = 15 * 1024 * 1024;
pub const DEFAULT_SIZE_LIMIT: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    Html,
    Pdf,
    PlainText,
}

impl ParserKind {
    /// Largest body this kind of parser accepts.
    pub fn size_limit(self) -> usize {
        match self {
            Self::Pdf => PDF_SIZE_LIMIT,
            Self::Html | Self::PlainText => DEFAULT_SIZE_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParserArgs {
    /// Substrings that mark a page as a copy of the wiki itself.
    pub mirror_hints: Vec<String>,
}

/// Everything a parser may consult besides the bytes themselves.
pub struct ParseContext<'a> {
    pub url: Option<&'a Url>,
    pub args: &'a ParserArgs,
    /// Used by fallbacks that need a second request.
    pub fetcher: Option<&'a dyn SourceFetcher>,
    pub headers: &'a [(String, String)],
    pub timeout: Duration,
    /// Charset declared by the transport, if any.
    pub charset: Option<&'a str>,
}

impl<'a> ParseContext<'a> {
    /// A context with no URL and no network access.
    pub fn detached(args: &'a ParserArgs) -> Self {
        Self {
            url: None,
            args,
            fetcher: None,
            headers: &[],
            timeout: Duration::from_secs(5),
            charset: None,
        }
    }
}

pub trait SourceParser: Send + Sync {
    fn kind(&self) -> ParserKind;
    fn parse(&self, data: &[u8], context: &ParseContext<'_>) -> Result<String, ParserError>;
}

pub type ParserFactory = Arc<dyn Fn() -> Box<dyn SourceParser> + Send + Sync>;

#[derive(Clone)]
pub struct ParserRegistry {
    factories: HashMap<String, ParserFactory>,
}

impl ParserRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        let html: ParserFactory = Arc::new(|| Box::new(HtmlParser::with_default_fallbacks()));
        let pdf: ParserFactory = Arc::new(|| Box::new(PdfParser));
        let plain: ParserFactory = Arc::new(|| Box::new(PlainTextParser));
        for content_type in ["text/html", "application/xhtml+xml"] {
            registry.register_factory(content_type, html.clone());
        }
        for content_type in ["application/pdf", "application/x-pdf"] {
            registry.register_factory(content_type, pdf.clone());
        }
        registry.register_factory("text/plain", plain);
        registry
    }

    pub fn register<F>(&mut self, content_type: &str, factory: F)
    where
        F: Fn() -> Box<dyn SourceParser> + Send + Sync + 'static,
    {
        self.register_factory(content_type, Arc::new(factory));
    }

    fn register_factory(&mut self, content_type: &str, factory: ParserFactory) {
        self.factories
            .insert(normalize_content_type(content_type), factory);
    }

    /// Parser for a content type. Unregistered `text/*` types get the plain-text parser.
    pub fn lookup(&self, content_type: &str) -> Option<Box<dyn SourceParser>> {
        let content_type = normalize_content_type(content_type);
        if let Some(factory) = self.factories.get(&content_type) {
            return Some(factory());
        }
        if content_type.starts_with("text/") {
            return Some(Box::new(PlainTextParser));
        }
        None
    }

    /// Size cap for a content type, or `None` when nothing can parse it.
    pub fn size_limit(&self, content_type: &str) -> Option<usize> {
        self.lookup(content_type)
            .map(|parser| parser.kind().size_limit())
    }

    pub fn parse(
        &self,
        content_type: &str,
        data: &[u8],
        context: &ParseContext<'_>,
    ) -> Result<String, ParserError> {
        let parser = self.lookup(content_type).ok_or_else(|| {
            ParserError::Failed(format!("no parser for content type {content_type}"))
        })?;
        parser.parse(data, context)
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Bare lowercase MIME type without parameters; `text/plain` when absent.
pub fn normalize_content_type(value: &str) -> String {
    let bare = value.split(';').next().unwrap_or("").trim();
    if bare.is_empty() {
        "text/plain".to_string()
    } else {
        bare.to_ascii_lowercase()
    }
}

/// The `charset` parameter of a `Content-Type` value, lowercased and unquoted.
pub fn content_charset(value: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|parameter| {
        let (name, charset) = parameter.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let charset = charset.trim().trim_matches(|ch| ch == '"' || ch == '\'');
        (!charset.is_empty()).then(|| charset.to_ascii_lowercase())
    })
}

/// A regex compiled on first use. A pattern that fails to compile never matches.
pub(crate) struct LazyRegex {
    source: &'static str,
    compiled: OnceLock<Option<Regex>>,
}

impl LazyRegex {
    pub(crate) const fn new(source: &'static str) -> Self {
        Self {
            source,
            compiled: OnceLock::new(),
        }
    }

    pub(crate) fn get(&self) -> Option<&Regex> {
        self.compiled
            .get_or_init(|| Regex::new(self.source).ok())
            .as_ref()
    }

    pub(crate) fn replace_all(&self, text: &str, replacement: &str) -> String {
        match self.get() {
            Some(regex) => regex.replace_all(text, replacement).into_owned(),
            None => text.to_string(),
        }
    }

    pub(crate) fn is_match(&self, text: &str) -> bool {
        self.get().is_some_and(|regex| regex.is_match(text))
    }
}

/// Collapse runs of blank lines into a single line break and trim the ends.
pub(crate) fn collapse_blank_lines(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    for line in text.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(line);
    }
    output.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UpperParser;

    impl SourceParser for UpperParser {
        fn kind(&self) -> ParserKind {
            ParserKind::PlainText
        }

        fn parse(&self, data: &[u8], _context: &ParseContext<'_>) -> Result<String, ParserError> {
            Ok(String::from_utf8_lossy(data).to_uppercase())
        }
    }

    #[test]
    fn content_type_is_normalized() {
        assert_eq!(normalize_content_type("Text/HTML; charset=UTF-8"), "text/html");
        assert_eq!(normalize_content_type(""), "text/plain");
        assert_eq!(normalize_content_type("  "), "text/plain");
    }

    #[test]
    fn charset_parameter_is_extracted() {
        assert_eq!(
            content_charset("text/html; Charset=\"Windows-1251\"").as_deref(),
            Some("windows-1251")
        );
        assert_eq!(content_charset("text/plain;format=flowed; charset=utf-8").as_deref(), Some("utf-8"));
        assert_eq!(content_charset("text/html"), None);
        assert_eq!(content_charset("text/html; charset="), None);
    }

    #[test]
    fn defaults_cover_html_pdf_and_text() {
        let registry = ParserRegistry::with_defaults();
        assert_eq!(
            registry.lookup("text/html").map(|parser| parser.kind()),
            Some(ParserKind::Html)
        );
        assert_eq!(
            registry.lookup("application/x-pdf").map(|parser| parser.kind()),
            Some(ParserKind::Pdf)
        );
        assert_eq!(
            registry.lookup("text/csv").map(|parser| parser.kind()),
            Some(ParserKind::PlainText)
        );
        assert!(registry.lookup("image/png").is_none());
    }

    #[test]
    fn size_limits_follow_parser_kind() {
        let registry = ParserRegistry::with_defaults();
        assert_eq!(registry.size_limit("application/pdf"), Some(PDF_SIZE_LIMIT));
        assert_eq!(registry.size_limit("text/html"), Some(DEFAULT_SIZE_LIMIT));
        assert_eq!(registry.size_limit("video/mp4"), None);
    }

    #[test]
    fn registered_parser_overrides_default() {
        let mut registry = ParserRegistry::with_defaults();
        registry.register("text/plain", || Box::new(UpperParser));
        let args = ParserArgs::default();
        let text = registry
            .parse("text/plain", b"quiet words", &ParseContext::detached(&args))
            .expect("parse");
        assert_eq!(text, "QUIET WORDS");
    }

    #[test]
    fn blank_lines_collapse() {
        assert_eq!(collapse_blank_lines("\n\na\n\n\n b \n\nc\n"), "a\n b\nc");
    }
}
