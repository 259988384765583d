//! Plain text and Markdown.

use url::Url;

use gleaner_shared::{DocumentMetadata, Result};

use crate::Extract;
use crate::cleanup;

#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

impl Extract for PlainTextExtractor {
    fn name(&self) -> &'static str {
        "plain_text"
    }

    fn extract_text(&self, bytes: &[u8], _base_url: Option<&Url>) -> Result<String> {
        let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
        let text = String::from_utf8_lossy(bytes).replace("\r\n", "\n");
        Ok(cleanup::run(&text, None))
    }

    fn extract_metadata(&self, bytes: &[u8]) -> Result<DocumentMetadata> {
        let text = String::from_utf8_lossy(bytes);
        let title = text
            .lines()
            .find_map(|line| line.strip_prefix("# "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from);
        Ok(DocumentMetadata {
            title,
            ..DocumentMetadata::default()
        })
    }
}
