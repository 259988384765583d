//! Text and metadata extraction for stored artifacts.
//!
//! A [`Strategy`] is chosen from the artifact's MIME type. Every strategy
//! implements [`Extract`]; [`Strategy::extract`] runs both halves and rejects
//! documents that yield no text. Extraction is synchronous and CPU-bound, so
//! callers run it on a blocking pool.

mod cleanup;
mod date;
mod html;
mod pdf;
mod text;

use tracing::{debug, instrument};
use url::Url;

use gleaner_shared::{DocumentMetadata, GleanerError, Result};

pub use html::HtmlExtractor;
pub use pdf::PdfExtractor;
pub use text::PlainTextExtractor;

/// Failure reason recorded for artifacts with no matching strategy.
pub const UNSUPPORTED_MIME: &str = "unsupported MIME type";

/// Common capability of every extraction strategy.
pub trait Extract {
    /// Recorded as the extractor of each normalized version.
    fn name(&self) -> &'static str;

    /// Extract the document body. `base_url` resolves relative links.
    fn extract_text(&self, bytes: &[u8], base_url: Option<&Url>) -> Result<String>;

    fn extract_metadata(&self, bytes: &[u8]) -> Result<DocumentMetadata>;
}

/// Closed set of extraction strategies, keyed by MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Html,
    Pdf,
    PlainText,
    Unsupported,
}

/// Output of a successful extraction.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub text: String,
    pub metadata: DocumentMetadata,
    pub extractor: &'static str,
    pub word_count: usize,
}

impl Strategy {
    /// Pick a strategy for a MIME type. Parameters (`; charset=...`) and case
    /// are ignored.
    pub fn for_mime(mime: &str) -> Self {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "text/html" | "application/xhtml+xml" => Self::Html,
            "application/pdf" => Self::Pdf,
            "text/plain" | "text/markdown" => Self::PlainText,
            other if other.starts_with("text/") => Self::PlainText,
            _ => Self::Unsupported,
        }
    }

    fn extractor(self) -> Option<&'static dyn Extract> {
        match self {
            Self::Html => Some(&HtmlExtractor),
            Self::Pdf => Some(&PdfExtractor),
            Self::PlainText => Some(&PlainTextExtractor),
            Self::Unsupported => None,
        }
    }

    /// Extract text and metadata.
    ///
    /// Fails with an extraction error for [`Strategy::Unsupported`], corrupt
    /// input, or a document whose extracted text is empty.
    #[instrument(skip(self, bytes, base_url), fields(strategy = ?self, len = bytes.len()))]
    pub fn extract(self, bytes: &[u8], base_url: Option<&Url>) -> Result<Extraction> {
        let Some(extractor) = self.extractor() else {
            return Err(GleanerError::extraction(UNSUPPORTED_MIME));
        };

        let text = extractor.extract_text(bytes, base_url)?;
        if text.trim().is_empty() {
            return Err(GleanerError::extraction("no text extracted"));
        }
        let metadata = extractor.extract_metadata(bytes)?;
        let word_count = cleanup::count_words(&text);

        debug!(
            extractor = extractor.name(),
            word_count,
            title = metadata.title.as_deref().unwrap_or(""),
            "extraction complete"
        );
        Ok(Extraction {
            text,
            metadata,
            extractor: extractor.name(),
            word_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_dispatch() {
        assert_eq!(Strategy::for_mime("text/html; charset=utf-8"), Strategy::Html);
        assert_eq!(Strategy::for_mime("application/xhtml+xml"), Strategy::Html);
        assert_eq!(Strategy::for_mime("APPLICATION/PDF"), Strategy::Pdf);
        assert_eq!(Strategy::for_mime("text/markdown"), Strategy::PlainText);
        assert_eq!(Strategy::for_mime("text/csv"), Strategy::PlainText);
        assert_eq!(Strategy::for_mime("application/unknown-x"), Strategy::Unsupported);
        assert_eq!(Strategy::for_mime(""), Strategy::Unsupported);
    }

    #[test]
    fn unsupported_reason_is_exact() {
        let err = Strategy::Unsupported.extract(b"anything", None).unwrap_err();
        match err {
            GleanerError::Extraction { reason } => assert_eq!(reason, UNSUPPORTED_MIME),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_text_is_rejected() {
        let err = Strategy::Html
            .extract(b"<html><body><script>x()</script></body></html>", None)
            .unwrap_err();
        assert!(matches!(err, GleanerError::Extraction { .. }));
        assert!(Strategy::PlainText.extract(b"  \n\n ", None).is_err());
    }

    #[test]
    fn html_extraction_end_to_end() {
        let html = br#"<html><head><title>Guide</title></head>
            <body><main><h1>Guide</h1><p>Three small words.</p></main></body></html>"#;
        let out = Strategy::Html.extract(html, None).unwrap();
        assert_eq!(out.extractor, "html");
        assert_eq!(out.metadata.title.as_deref(), Some("Guide"));
        assert!(out.text.starts_with("# Guide"));
        assert_eq!(out.word_count, 4);
    }

    #[test]
    fn markdown_extraction() {
        let out = Strategy::for_mime("text/markdown")
            .extract(b"# Notes\n\nSome body text.", None)
            .unwrap();
        assert_eq!(out.extractor, "plain_text");
        assert_eq!(out.metadata.title.as_deref(), Some("Notes"));
    }
}
