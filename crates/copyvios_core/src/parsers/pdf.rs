use std::panic::{AssertUnwindSafe, catch_unwind};

use pdf_extract::{Document, PlainTextOutput, output_doc_page};
use tracing::debug;

use super::{ParseContext, ParserKind, SourceParser, collapse_blank_lines};
use crate::error::ParserError;

pub struct PdfParser;

impl SourceParser for PdfParser {
    fn kind(&self) -> ParserKind {
        ParserKind::Pdf
    }

    /// Text of every page that can be read. Unreadable pages are skipped;
    /// only a document with no readable page at all is a failure.
    fn parse(&self, data: &[u8], _context: &ParseContext<'_>) -> Result<String, ParserError> {
        let mut document = catch_unwind(AssertUnwindSafe(|| Document::load_mem(data)))
            .map_err(|_| ParserError::Failed("PDF reader panicked".to_string()))?
            .map_err(|error| ParserError::Failed(format!("failed to load PDF: {error}")))?;
        if document.is_encrypted() {
            document
                .decrypt("")
                .map_err(|error| ParserError::Failed(format!("encrypted PDF: {error}")))?;
        }

        let page_numbers = document.get_pages().into_keys().collect::<Vec<_>>();
        let mut pages = Vec::with_capacity(page_numbers.len());
        for page in page_numbers.iter().copied() {
            match extract_page(&document, page) {
                Ok(text) => pages.push(text),
                Err(reason) => debug!(page, %reason, "skipping unreadable PDF page"),
            }
        }
        if pages.is_empty() && !page_numbers.is_empty() {
            return Err(ParserError::Failed("no readable PDF pages".to_string()));
        }

        debug!(pages = pages.len(), total = page_numbers.len(), "extracted PDF text");
        Ok(clean_pdf_text(&pages.join("\n")))
    }
}

/// pdf-extract panics on some malformed pages, so each page gets its own guard.
fn extract_page(document: &Document, page: u32) -> Result<String, String> {
    let mut text = String::new();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut output = PlainTextOutput::new(&mut text);
        output_doc_page(document, &mut output, page)
    }));
    match outcome {
        Ok(Ok(())) => Ok(text),
        Ok(Err(error)) => Err(error.to_string()),
        Err(_) => Err("PDF interpreter panicked".to_string()),
    }
}

fn clean_pdf_text(raw: &str) -> String {
    let normalized = raw.replace('\x0c', "\n").replace('\u{2022}', " ");
    collapse_blank_lines(&normalized)
}

#[cfg(test)]
mod tests {
    use pdf_extract::{Dictionary, Object, Stream};

    use super::*;
    use crate::parsers::ParserArgs;

    fn page(document: &mut Document, parent: (u32, u16), text: &str, media_box: bool) -> Object {
        let content = format!("BT /F1 18 Tf 72 700 Td ({text}) Tj ET");
        let content_id = document.add_object(Stream::new(Dictionary::new(), content.into_bytes()));
        let mut page = Dictionary::new();
        page.set("Type", "Page");
        page.set("Parent", parent);
        page.set("Contents", content_id);
        if media_box {
            page.set("MediaBox", [0, 0, 612, 792].map(Object::Integer).to_vec());
        }
        document.add_object(page).into()
    }

    /// Two pages; the second has no MediaBox anywhere in its tree.
    fn half_broken_pdf() -> Vec<u8> {
        let mut document = Document::with_version("1.5");
        let pages_id = document.new_object_id();

        let mut font = Dictionary::new();
        font.set("Type", "Font");
        font.set("Subtype", "Type1");
        font.set("BaseFont", "Helvetica");
        let font_id = document.add_object(font);
        let mut fonts = Dictionary::new();
        fonts.set("F1", font_id);
        let mut resources = Dictionary::new();
        resources.set("Font", fonts);
        let resources_id = document.add_object(resources);

        let kids = vec![
            page(&mut document, pages_id, "Hello from the readable page", true),
            page(&mut document, pages_id, "Lost words", false),
        ];
        let mut pages = Dictionary::new();
        pages.set("Type", "Pages");
        pages.set("Count", 2_i64);
        pages.set("Kids", kids);
        pages.set("Resources", resources_id);
        document.set_object(pages_id, pages);

        let mut catalog = Dictionary::new();
        catalog.set("Type", "Catalog");
        catalog.set("Pages", pages_id);
        let catalog_id = document.add_object(catalog);
        document.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        document.save_to(&mut bytes).expect("save pdf");
        bytes
    }

    #[test]
    fn form_feeds_and_bullets_are_normalized() {
        let cleaned = clean_pdf_text("First page\x0c\u{2022} item one\n\n\n\u{2022} item two");
        assert_eq!(cleaned, "First page\n  item one\n  item two");
    }

    #[test]
    fn garbage_input_is_a_parse_failure() {
        let args = ParserArgs::default();
        let result = PdfParser.parse(b"not a pdf at all", &ParseContext::detached(&args));
        assert!(matches!(result, Err(ParserError::Failed(_))));
    }

    #[test]
    fn broken_page_keeps_text_from_readable_pages() {
        let args = ParserArgs::default();
        let text = PdfParser
            .parse(&half_broken_pdf(), &ParseContext::detached(&args))
            .expect("partial text");
        assert!(text.contains("Hello"), "got {text:?}");
        assert!(!text.contains("Lost"));
    }
}
