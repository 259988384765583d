//! PDF extraction: page text through `pdf-extract`, metadata from the Info
//! dictionary through `lopdf`.

use lopdf::{Dictionary, Document, Object};
use url::Url;

use gleaner_shared::{DocumentMetadata, GleanerError, Result};

use crate::Extract;
use crate::cleanup;
use crate::date::parse_date;

#[derive(Debug, Default, Clone, Copy)]
pub struct PdfExtractor;

impl Extract for PdfExtractor {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn extract_text(&self, bytes: &[u8], _base_url: Option<&Url>) -> Result<String> {
        let text = pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| GleanerError::extraction(format!("unreadable PDF: {e}")))?;
        Ok(cleanup::run(&text, None))
    }

    fn extract_metadata(&self, bytes: &[u8]) -> Result<DocumentMetadata> {
        let doc = Document::load_mem(bytes)
            .map_err(|e| GleanerError::extraction(format!("unreadable PDF: {e}")))?;

        let info = match doc.trailer.get(b"Info") {
            Ok(Object::Reference(id)) => doc.get_dictionary(*id).ok(),
            Ok(Object::Dictionary(dict)) => Some(dict),
            _ => None,
        };
        let Some(info) = info else {
            return Ok(DocumentMetadata::default());
        };

        let authors = info_string(info, b"Author")
            .map(|a| {
                a.split(';')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(DocumentMetadata {
            title: info_string(info, b"Title"),
            authors,
            organization: info_string(info, b"Company"),
            published_on: info_string(info, b"CreationDate").and_then(|d| parse_date(&d)),
        })
    }
}

/// A non-empty text entry of the Info dictionary.
fn info_string(info: &Dictionary, key: &[u8]) -> Option<String> {
    let raw = info.get(key).ok()?.as_str().ok()?;
    let text = decode_pdf_string(raw);
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// PDF text strings are UTF-16BE with a byte-order mark, or a single-byte
/// encoding that matches Latin-1 for printable text.
fn decode_pdf_string(raw: &[u8]) -> String {
    if let Some(utf16) = raw.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = utf16
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    if let Some(utf8) = raw.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8_lossy(utf8).into_owned();
    }
    raw.iter().map(|&b| char::from(b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use lopdf::{StringFormat, dictionary};

    fn pdf_with_info(info: Dictionary) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 200.into(), 200.into()],
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        let info_id = doc.add_object(info);
        doc.trailer.set("Root", catalog_id);
        doc.trailer.set("Info", info_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    fn literal(s: &str) -> Object {
        Object::String(s.as_bytes().to_vec(), StringFormat::Literal)
    }

    #[test]
    fn decodes_utf16_and_latin1() {
        let mut utf16 = vec![0xFE, 0xFF];
        for unit in "Zoë".encode_utf16() {
            utf16.extend_from_slice(&unit.to_be_bytes());
        }
        assert_eq!(decode_pdf_string(&utf16), "Zoë");
        assert_eq!(decode_pdf_string(b"Caf\xe9"), "Café");
    }

    #[test]
    fn info_dictionary_metadata() {
        let bytes = pdf_with_info(dictionary! {
            "Title" => literal("Annual Report"),
            "Author" => literal("Jane Doe; Rick Roe"),
            "Company" => literal("Acme"),
            "CreationDate" => literal("D:20220314093000Z"),
        });
        let m = PdfExtractor.extract_metadata(&bytes).unwrap();
        assert_eq!(m.title.as_deref(), Some("Annual Report"));
        assert_eq!(m.authors, vec!["Jane Doe", "Rick Roe"]);
        assert_eq!(m.organization.as_deref(), Some("Acme"));
        assert_eq!(m.published_on, NaiveDate::from_ymd_opt(2022, 3, 14));
    }

    #[test]
    fn missing_info_is_empty_metadata() {
        let bytes = pdf_with_info(dictionary! {});
        assert_eq!(
            PdfExtractor.extract_metadata(&bytes).unwrap(),
            DocumentMetadata::default()
        );
    }

    #[test]
    fn corrupt_pdf_is_an_extraction_error() {
        let err = PdfExtractor.extract_metadata(b"%PDF-1.4 garbage").unwrap_err();
        assert!(matches!(err, GleanerError::Extraction { .. }));
    }
}
