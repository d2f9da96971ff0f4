use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8};

use super::{ParseContext, ParserKind, SourceParser};
use crate::error::ParserError;

pub struct PlainTextParser;

impl SourceParser for PlainTextParser {
    fn kind(&self) -> ParserKind {
        ParserKind::PlainText
    }

    fn parse(&self, data: &[u8], context: &ParseContext<'_>) -> Result<String, ParserError> {
        Ok(decode_text(data, context.charset).trim().to_string())
    }
}

/// Decode fetched bytes to UTF-8.
///
/// A byte order mark wins over `declared`; an unknown or missing label falls
/// through to UTF-8 when the bytes are valid UTF-8, and to a statistical guess
/// otherwise. Malformed sequences become U+FFFD.
pub fn decode_text(data: &[u8], declared: Option<&str>) -> String {
    let (encoding, body) = match Encoding::for_bom(data) {
        Some((encoding, bom_length)) => (encoding, &data[bom_length..]),
        None => (detect_encoding(data, declared), data),
    };
    encoding.decode_without_bom_handling(body).0.into_owned()
}

fn detect_encoding(data: &[u8], declared: Option<&str>) -> &'static Encoding {
    if let Some(encoding) = declared.and_then(|label| Encoding::for_label(label.trim().as_bytes())) {
        return encoding;
    }
    if std::str::from_utf8(data).is_ok() {
        return UTF_8;
    }
    let mut detector = EncodingDetector::new();
    detector.feed(data, true);
    detector.guess(None, true)
}

#[cfg(test)]
mod tests {
    use encoding_rs::WINDOWS_1251;

    use super::*;
    use crate::parsers::ParserArgs;

    const RUSSIAN: &str = "Город вырос вокруг деревянного моста, построенного первыми поселенцами долины. \
        Каждую осень на его рынок съезжались крестьяне из окрестных холмов на большую ярмарку урожая.";

    #[test]
    fn utf8_with_bom_is_decoded() {
        assert_eq!(decode_text(b"\xEF\xBB\xBFcaf\xC3\xA9", None), "café");
    }

    #[test]
    fn utf16_le_is_decoded() {
        assert_eq!(decode_text(&[0xFF, 0xFE, b'h', 0, b'i', 0], None), "hi");
    }

    #[test]
    fn bom_overrides_declared_charset() {
        assert_eq!(decode_text(b"\xEF\xBB\xBFcaf\xC3\xA9", Some("windows-1251")), "café");
    }

    #[test]
    fn declared_latin1_is_honored() {
        assert_eq!(decode_text(b"na\xEFve text", Some("ISO-8859-1")), "naïve text");
    }

    #[test]
    fn declared_cyrillic_charset_is_honored() {
        let (bytes, _, _) = WINDOWS_1251.encode(RUSSIAN);
        assert_eq!(decode_text(&bytes, Some("windows-1251")), RUSSIAN);
    }

    #[test]
    fn undeclared_cyrillic_is_detected() {
        let (bytes, _, _) = WINDOWS_1251.encode(RUSSIAN);
        assert_eq!(decode_text(&bytes, None), RUSSIAN);
    }

    #[test]
    fn unknown_label_falls_back_to_detection() {
        assert_eq!(decode_text("plain ascii".as_bytes(), Some("x-no-such-charset")), "plain ascii");
    }

    #[test]
    fn parser_uses_transport_charset() {
        let (bytes, _, _) = WINDOWS_1251.encode(RUSSIAN);
        let args = ParserArgs::default();
        let context = ParseContext {
            charset: Some("windows-1251"),
            ..ParseContext::detached(&args)
        };
        let text = PlainTextParser.parse(&bytes, &context).expect("parse");
        assert_eq!(text, RUSSIAN);
    }

    #[test]
    fn parser_trims_output() {
        let args = ParserArgs::default();
        let text = PlainTextParser
            .parse(b"\n  plain words  \n", &ParseContext::detached(&args))
            .expect("parse");
        assert_eq!(text, "plain words");
    }
}
