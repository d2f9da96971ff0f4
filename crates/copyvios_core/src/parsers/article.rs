//! Plain text, search queries and external links from an article's wikitext.
//!
//! Stripping works on the raw markup with a handful of bracket scanners and
//! regexes. It does not try to be a full wikitext parser: the goal is prose
//! that tokenizes into the same n-grams a copied web page would.

use std::cell::OnceCell;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use super::{LazyRegex, collapse_blank_lines};

/// Template parameters at least this many characters long are kept as prose.
pub const TEMPLATE_MERGE_THRESHOLD: usize = 35;

const INVISIBLE_TAGS: &[&str] = &[
    "math",
    "pre",
    "nowiki",
    "gallery",
    "syntaxhighlight",
    "source",
    "timeline",
    "score",
    "imagemap",
    "templatedata",
    "graph",
    "inputbox",
    "categorytree",
    "section",
    "references",
];

const HIDDEN_LINK_NAMESPACES: &[&str] = &["file:", "image:", "category:"];

const ENGLISH_ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "inc", "ltd", "co", "corp",
    "jan", "feb", "mar", "apr", "jun", "jul", "aug", "sep", "sept", "oct", "nov", "dec", "e.g",
    "i.e", "u.s", "u.k", "no", "vol", "pp", "p", "fig", "ed", "eds", "approx", "gen", "col", "lt",
    "sgt", "rev", "hon", "mt", "ft", "ca", "c", "cf", "al",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOptions {
    pub min_query: usize,
    pub max_query: usize,
    pub split_thresh: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            min_query: 8,
            max_query: 128,
            split_thresh: 32,
        }
    }
}

/// Rule-based sentence splitter with a per-language abbreviation list.
#[derive(Debug, Clone)]
pub struct SentenceTokenizer {
    abbreviations: HashSet<String>,
}

impl SentenceTokenizer {
    pub fn english() -> Self {
        Self::from_abbreviations(ENGLISH_ABBREVIATIONS.iter().copied())
    }

    pub fn from_abbreviations<'a, I>(abbreviations: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self {
            abbreviations: abbreviations
                .into_iter()
                .map(|value| value.trim().trim_end_matches('.').to_lowercase())
                .filter(|value| !value.is_empty())
                .collect(),
        }
    }

    /// Load `<dir>/<lang>.txt` (one abbreviation per line), or the English
    /// list when no such file exists.
    pub fn load(dir: &Path, lang: &str) -> Result<Self> {
        let path = dir.join(format!("{lang}.txt"));
        if !path.exists() {
            debug!(path = %path.display(), "no abbreviation list, using English defaults");
            return Ok(Self::english());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Self::from_abbreviations(
            content.lines().filter(|line| !line.trim_start().starts_with('#')),
        ))
    }

    /// Split text into sentences. Line breaks always end a sentence.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let mut sentences = Vec::new();
        for line in text.lines() {
            let words = line.split_whitespace().collect::<Vec<_>>();
            let mut current: Vec<&str> = Vec::new();
            for (index, word) in words.iter().copied().enumerate() {
                current.push(word);
                if self.ends_sentence(word, words.get(index + 1).copied()) {
                    sentences.push(current.join(" "));
                    current.clear();
                }
            }
            if !current.is_empty() {
                sentences.push(current.join(" "));
            }
        }
        sentences
    }

    fn ends_sentence(&self, word: &str, next: Option<&str>) -> bool {
        let Some(next) = next else {
            return false;
        };
        let trimmed =
            word.trim_end_matches(|ch| matches!(ch, '"' | '\'' | ')' | ']' | '\u{201d}' | '\u{2019}'));
        let Some(last) = trimmed.chars().last() else {
            return false;
        };
        if !matches!(last, '.' | '!' | '?') {
            return false;
        }
        let next_starts_sentence = next
            .chars()
            .find(|ch| ch.is_alphanumeric())
            .is_some_and(|ch| ch.is_uppercase() || ch.is_numeric());
        if !next_starts_sentence {
            return false;
        }
        if last == '.' {
            let stem = trimmed
                .trim_end_matches('.')
                .trim_start_matches(|ch: char| !ch.is_alphanumeric())
                .to_lowercase();
            if self.abbreviations.contains(&stem) {
                return false;
            }
            let mut letters = stem.chars();
            if letters.next().is_some_and(char::is_alphabetic) && letters.next().is_none() {
                return false;
            }
        }
        true
    }
}

impl Default for SentenceTokenizer {
    fn default() -> Self {
        Self::english()
    }
}

pub struct ArticleTextParser {
    text: String,
    tokenizer: SentenceTokenizer,
    stripped: OnceCell<String>,
}

impl ArticleTextParser {
    pub fn new(text: &str, tokenizer: SentenceTokenizer) -> Self {
        Self {
            text: text.to_string(),
            tokenizer,
            stripped: OnceCell::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Article prose with markup, citations and hidden content removed.
    pub fn strip(&self) -> &str {
        self.stripped.get_or_init(|| strip_wikitext(&self.text))
    }

    /// Up to `max_chunks` query-sized fragments spread across the article.
    pub fn chunk(&self, max_chunks: usize, options: &ChunkOptions) -> Vec<String> {
        let mut sentences = Vec::new();
        for sentence in self.tokenizer.tokenize(self.strip()) {
            if char_len(&sentence) <= options.max_query {
                sentences.push(sentence);
            } else {
                sentences.extend(split_long_sentence(&sentence, options));
            }
        }
        sentences.retain(|sentence| char_len(sentence) >= options.min_query);

        if sentences.len() <= max_chunks {
            return sentences;
        }

        let mut chunks = Vec::with_capacity(max_chunks);
        let mut turn = 0usize;
        while chunks.len() < max_chunks && !sentences.is_empty() {
            let len = sentences.len();
            let index = match turn % 5 {
                0 => 0,
                1 => 3 * len / 4,
                2 => len / 2,
                3 => len / 4,
                _ => len - 1,
            };
            chunks.push(sentences.remove(index));
            turn += 1;
        }
        chunks
    }

    /// `http(s)` URLs in document order, without duplicates.
    pub fn get_links(&self) -> Vec<String> {
        static URL: LazyRegex = LazyRegex::new(r#"https?://[^\s\[\]<>{}"|]+"#);
        let Some(pattern) = URL.get() else {
            return Vec::new();
        };
        let without_comments = remove_comments(&self.text);
        let mut seen = HashSet::new();
        let mut links = Vec::new();
        for found in pattern.find_iter(&without_comments) {
            let link = trim_link(found.as_str());
            if link.len() <= "https://".len() {
                continue;
            }
            if seen.insert(link.to_string()) {
                links.push(link.to_string());
            }
        }
        links
    }
}

fn trim_link(link: &str) -> &str {
    let mut trimmed = link.trim_end_matches(|ch| matches!(ch, '.' | ',' | ';' | ':' | '!' | '?' | '\''));
    if !trimmed.contains('(') {
        trimmed = trimmed.trim_end_matches(')');
    }
    trimmed
}

fn char_len(value: &str) -> usize {
    value.chars().count()
}

fn split_long_sentence(sentence: &str, options: &ChunkOptions) -> Vec<String> {
    static CLAUSE: LazyRegex = LazyRegex::new(r"[,;]\s+");
    let clauses = match CLAUSE.get() {
        Some(pattern) => pattern
            .split(sentence)
            .map(str::trim)
            .filter(|clause| char_len(clause) > options.split_thresh)
            .map(str::to_string)
            .collect::<Vec<_>>(),
        None => Vec::new(),
    };
    let clauses = if clauses.is_empty() {
        vec![sentence.to_string()]
    } else {
        clauses
    };

    let mut pieces = Vec::new();
    for clause in clauses {
        if char_len(&clause) <= options.max_query {
            pieces.push(clause);
        } else {
            pieces.extend(wrap_words(&clause, options.max_query));
        }
    }
    pieces
}

fn wrap_words(text: &str, width: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let needed = if current.is_empty() {
            char_len(word)
        } else {
            char_len(&current) + 1 + char_len(word)
        };
        if needed > width && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

pub fn strip_wikitext(text: &str) -> String {
    static REF_SELF_CLOSING: LazyRegex = LazyRegex::new(r"(?is)<ref\b[^>]*/\s*>");
    static REF_PAIRED: LazyRegex = LazyRegex::new(r"(?is)<ref\b[^>]*>.*?</ref\s*>");
    static EXTERNAL_TITLED: LazyRegex =
        LazyRegex::new(r"\[(?:https?:)?//[^\s\]]+\s+([^\]]*)\]");
    static EXTERNAL_BARE: LazyRegex = LazyRegex::new(r"\[(?:https?:)?//[^\s\]]*\]");
    static QUOTES: LazyRegex = LazyRegex::new(r"'{2,}");
    static HTML_TAG: LazyRegex = LazyRegex::new(r"(?s)</?[A-Za-z][^<>]*>");
    static MAGIC_WORD: LazyRegex = LazyRegex::new(r"__[A-Z]+__");

    let mut output = remove_comments(text);
    output = REF_SELF_CLOSING.replace_all(&output, "");
    output = REF_PAIRED.replace_all(&output, "");
    output = remove_invisible_tags(&output);
    output = merge_templates(&output);
    output = replace_wikilinks(&output);
    output = EXTERNAL_TITLED.replace_all(&output, "$1");
    output = EXTERNAL_BARE.replace_all(&output, "");
    output = strip_line_markup(&output);
    output = QUOTES.replace_all(&output, "");
    output = HTML_TAG.replace_all(&output, " ");
    output = MAGIC_WORD.replace_all(&output, "");
    output = html_escape::decode_html_entities(&output).into_owned();

    let collapsed = output
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    collapse_blank_lines(&collapsed)
}

fn remove_comments(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<!--") {
        output.push_str(&rest[..start]);
        match rest[start + 4..].find("-->") {
            Some(end) => rest = &rest[start + 4 + end + 3..],
            None => return output,
        }
    }
    output.push_str(rest);
    output
}

fn remove_invisible_tags(text: &str) -> String {
    static PATTERNS: std::sync::OnceLock<Vec<regex::Regex>> = std::sync::OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        INVISIBLE_TAGS
            .iter()
            .flat_map(|tag| {
                [
                    format!(r"(?is)<{tag}\b[^>]*/\s*>"),
                    format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>"),
                ]
            })
            .filter_map(|pattern| regex::Regex::new(&pattern).ok())
            .collect()
    });
    let mut output = text.to_string();
    for pattern in patterns {
        output = pattern.replace_all(&output, "").into_owned();
    }
    output
}

/// Byte offset just past the `close` matching the `open` at `start`,
/// honoring nesting of the same pair.
fn find_matching(text: &str, start: usize, open: &str, close: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut cursor = start;
    while cursor < text.len() {
        let rest = &text[cursor..];
        if rest.starts_with(open) {
            depth += 1;
            cursor += open.len();
        } else if rest.starts_with(close) {
            depth = depth.saturating_sub(1);
            cursor += close.len();
            if depth == 0 {
                return Some(cursor);
            }
        } else {
            cursor += rest.chars().next().map_or(1, char::len_utf8);
        }
    }
    None
}

/// Replace each `{{template}}` with its long parameter values, or nothing.
fn merge_templates(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut cursor = 0usize;
    while let Some(offset) = text[cursor..].find("{{") {
        let start = cursor + offset;
        output.push_str(&text[cursor..start]);
        let Some(end) = find_matching(text, start, "{{", "}}") else {
            // Unbalanced: drop the rest of the markup.
            return output;
        };
        let inner = &text[start + 2..end - 2];
        let kept = template_params(inner)
            .into_iter()
            .skip(1)
            .map(param_value)
            .filter(|value| char_len(value.trim()) >= TEMPLATE_MERGE_THRESHOLD)
            .map(|value| merge_templates(value.trim()))
            .collect::<Vec<_>>();
        if !kept.is_empty() {
            output.push(' ');
            output.push_str(&kept.join(" "));
            output.push(' ');
        }
        cursor = end;
    }
    output.push_str(&text[cursor..]);
    output
}

/// Split template content on `|` outside nested links and templates.
fn template_params(inner: &str) -> Vec<&str> {
    let bytes = inner.as_bytes();
    let mut params = Vec::new();
    let mut braces = 0usize;
    let mut brackets = 0usize;
    let mut last = 0usize;
    let mut index = 0usize;
    while index < bytes.len() {
        let pair = bytes.get(index..index + 2);
        match pair {
            Some(b"{{") => {
                braces += 1;
                index += 2;
                continue;
            }
            Some(b"}}") => {
                braces = braces.saturating_sub(1);
                index += 2;
                continue;
            }
            Some(b"[[") => {
                brackets += 1;
                index += 2;
                continue;
            }
            Some(b"]]") => {
                brackets = brackets.saturating_sub(1);
                index += 2;
                continue;
            }
            _ => {}
        }
        if bytes[index] == b'|' && braces == 0 && brackets == 0 {
            params.push(&inner[last..index]);
            last = index + 1;
        }
        index += 1;
    }
    params.push(&inner[last..]);
    params
}

fn param_value(param: &str) -> &str {
    match param.split_once('=') {
        Some((name, value)) if !name.contains(['{', '[', '<', '\n']) => value,
        _ => param,
    }
}

fn replace_wikilinks(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut cursor = 0usize;
    while let Some(offset) = text[cursor..].find("[[") {
        let start = cursor + offset;
        output.push_str(&text[cursor..start]);
        let Some(end) = find_matching(text, start, "[[", "]]") else {
            output.push_str(&text[start..]);
            return output;
        };
        let inner = &text[start + 2..end - 2];
        let (target, label) = match inner.split_once('|') {
            Some((target, label)) => (target, Some(label)),
            None => (inner, None),
        };
        let target = target.trim();
        let hidden = !target.starts_with(':') && {
            let lowered = target.to_lowercase();
            HIDDEN_LINK_NAMESPACES
                .iter()
                .any(|namespace| lowered.starts_with(namespace))
        };
        if !hidden {
            match label {
                Some(label) => output.push_str(&replace_wikilinks(label)),
                None => output.push_str(target.trim_start_matches(':')),
            }
        }
        cursor = end;
    }
    output.push_str(&text[cursor..]);
    output
}

/// Headings, list markers and table syntax, handled line by line.
fn strip_line_markup(text: &str) -> String {
    static HEADING: LazyRegex = LazyRegex::new(r"^=+\s*(.*?)\s*=+$");
    static LIST: LazyRegex = LazyRegex::new(r"^[*#:;]+\s*");
    let mut lines = Vec::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.starts_with("{|") || line.starts_with("|}") || line.starts_with("|-") {
            continue;
        }
        if let Some(caption) = line.strip_prefix("|+") {
            lines.push(table_cell_content(caption).to_string());
            continue;
        }
        if let Some(cells) = line.strip_prefix('|').or_else(|| line.strip_prefix('!')) {
            let contents = cells
                .split("||")
                .flat_map(|cell| cell.split("!!"))
                .map(table_cell_content)
                .collect::<Vec<_>>();
            lines.push(contents.join(" "));
            continue;
        }
        if line.starts_with('=') {
            lines.push(HEADING.replace_all(line, "$1"));
            continue;
        }
        lines.push(LIST.replace_all(line, ""));
    }
    lines.join("\n")
}

/// Drop a `attributes |` prefix from a table cell.
fn table_cell_content(cell: &str) -> &str {
    match cell.rsplit_once('|') {
        Some((_, content)) => content.trim(),
        None => cell.trim(),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn parser(text: &str) -> ArticleTextParser {
        ArticleTextParser::new(text, SentenceTokenizer::english())
    }

    #[test]
    fn strip_removes_refs_comments_and_markup() {
        let text = "'''Foo''' is a [[bar|fictional bar]] in [[Baz]].<ref name=\"a\">{{cite web|url=http://x.example/|title=T}}</ref><!-- note -->\n\n\n== History ==\n* It opened in 1990.<ref name=\"a\" />";
        let stripped = parser(text).strip().to_string();
        assert_eq!(
            stripped,
            "Foo is a fictional bar in Baz.\nHistory\nIt opened in 1990."
        );
    }

    #[test]
    fn file_and_category_links_vanish() {
        let text = "Start [[File:Example.jpg|thumb|A [[caption]] here]] middle [[Category:Things]] end [[:Category:Things|see category]].";
        assert_eq!(parser(text).strip(), "Start middle end see category.");
    }

    #[test]
    fn long_template_parameters_are_kept() {
        let prose = "This quote is long enough to count as article prose.";
        let text = format!("Before {{{{quote|text={prose}|short}}}} after {{{{stub}}}}.");
        assert_eq!(parser(&text).strip(), format!("Before {prose} after ."));
    }

    #[test]
    fn invisible_tags_and_entities() {
        let text = "Area is <math>\\pi r^2</math> units&nbsp;wide &amp; tall.<br/>__NOTOC__";
        assert_eq!(parser(text).strip(), "Area is units wide & tall.");
    }

    #[test]
    fn external_links_keep_titles() {
        let text = "See [https://example.com the site] or [https://example.org] or https://bare.example.net.";
        assert_eq!(
            parser(text).strip(),
            "See the site or or https://bare.example.net."
        );
    }

    #[test]
    fn tables_reduce_to_cell_text() {
        let text = "{| class=\"wikitable\"\n|+ Caption text\n|-\n! Name !! Value\n|-\n| style=\"x\" | First || Second\n|}";
        assert_eq!(
            parser(text).strip(),
            "Caption text\nName Value\nFirst Second"
        );
    }

    #[test]
    fn tokenizer_respects_abbreviations() {
        let tokenizer = SentenceTokenizer::english();
        let sentences =
            tokenizer.tokenize("Dr. Smith arrived at 5 p.m. on Monday. He left soon after! Did he return? No.");
        assert_eq!(
            sentences,
            vec![
                "Dr. Smith arrived at 5 p.m. on Monday.",
                "He left soon after!",
                "Did he return?",
                "No.",
            ]
        );
    }

    #[test]
    fn tokenizer_loads_language_file() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("de.txt"), "bzw\nz.b\n").expect("write list");
        let tokenizer = SentenceTokenizer::load(temp.path(), "de").expect("load");
        let sentences = tokenizer.tokenize("Das ist z.B. Gut. Ende hier.");
        assert_eq!(sentences, vec!["Das ist z.B. Gut.", "Ende hier."]);

        let fallback = SentenceTokenizer::load(temp.path(), "fr").expect("fallback");
        assert_eq!(fallback.tokenize("Mr. Bean. Yes.").len(), 2);
    }

    #[test]
    fn chunk_samples_across_the_article() {
        let text = (1..=10)
            .map(|n| format!("Sentence number {n} has words."))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = parser(&text).chunk(5, &ChunkOptions::default());
        assert_eq!(
            chunks,
            vec![
                "Sentence number 1 has words.",
                "Sentence number 8 has words.",
                "Sentence number 6 has words.",
                "Sentence number 3 has words.",
                "Sentence number 10 has words.",
            ]
        );
    }

    #[test]
    fn chunk_returns_everything_when_short() {
        let chunks = parser("Only one sentence here. Tiny.").chunk(5, &ChunkOptions::default());
        assert_eq!(chunks, vec!["Only one sentence here."]);
    }

    #[test]
    fn long_sentences_are_split() {
        let clause = "a clause that is comfortably longer than the split threshold";
        let sentence = format!("{clause}, {clause}; {clause}, {clause}.");
        let options = ChunkOptions::default();
        let chunks = parser(&sentence).chunk(10, &options);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= options.max_query));
    }

    #[test]
    fn links_are_deduplicated_in_order() {
        let text = "<!-- https://hidden.example -->[https://a.example/page Title] text https://b.example/x. {{cite web|url=https://a.example/page|title=T}} (https://c.example)";
        assert_eq!(
            parser(text).get_links(),
            vec![
                "https://a.example/page",
                "https://b.example/x",
                "https://c.example",
            ]
        );
    }
}
