//! RSS 2.0 / RSS 1.0 (RDF) / Atom link extraction.
//!
//! Only item-level links are seeds; channel-level `<link>` elements point back
//! at the site and are ignored.

use gleaner_shared::{GleanerError, Result};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

/// Feed dialect, detected from the root element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Rss,
    Atom,
}

/// Item links found in a feed, in document order, unresolved.
#[derive(Debug, Clone)]
pub struct FeedLinks {
    pub kind: FeedKind,
    pub links: Vec<String>,
}

/// Parse a feed document and return the link of every item/entry.
pub(crate) fn parse_feed(xml: &str) -> Result<FeedLinks> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut kind: Option<FeedKind> = None;
    let mut in_item = false;
    let mut capture_link = false;
    let mut links = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                if kind.is_none() {
                    kind = Some(root_kind(name)?);
                    continue;
                }
                match name {
                    b"item" | b"entry" => in_item = true,
                    b"link" if in_item => {
                        // Atom links carry the URL in `href`; RSS links in the text.
                        match atom_href(&e)? {
                            Some(href) => links.push(href),
                            None => capture_link = kind == Some(FeedKind::Rss),
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                if in_item && e.local_name().as_ref() == b"link" {
                    if let Some(href) = atom_href(&e)? {
                        links.push(href);
                    }
                }
            }
            Ok(Event::Text(t)) if capture_link => {
                let text = t
                    .unescape()
                    .map_err(|e| GleanerError::extraction(format!("invalid feed text: {e}")))?;
                if !text.trim().is_empty() {
                    links.push(text.trim().to_string());
                }
            }
            Ok(Event::CData(c)) if capture_link => {
                let text = String::from_utf8_lossy(&c.into_inner()).trim().to_string();
                if !text.is_empty() {
                    links.push(text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"item" | b"entry" => in_item = false,
                b"link" => capture_link = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(GleanerError::extraction(format!(
                    "invalid feed XML at byte {}: {e}",
                    reader.buffer_position()
                )));
            }
            _ => {}
        }
    }

    let kind = kind.ok_or_else(|| GleanerError::extraction("empty feed document"))?;
    Ok(FeedLinks { kind, links })
}

fn root_kind(name: &[u8]) -> Result<FeedKind> {
    match name {
        b"rss" | b"RDF" => Ok(FeedKind::Rss),
        b"feed" => Ok(FeedKind::Atom),
        other => Err(GleanerError::extraction(format!(
            "not an RSS or Atom feed (root element <{}>)",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// `href` of an Atom `<link>` whose `rel` is absent or `alternate`.
fn atom_href(e: &BytesStart<'_>) -> Result<Option<String>> {
    let mut href = None;
    let mut rel_ok = true;
    for attr in e.attributes() {
        let attr =
            attr.map_err(|e| GleanerError::extraction(format!("invalid feed attribute: {e}")))?;
        let value = attr
            .unescape_value()
            .map_err(|e| GleanerError::extraction(format!("invalid feed attribute: {e}")))?;
        match attr.key.local_name().as_ref() {
            b"href" => href = Some(value.trim().to_string()),
            b"rel" => rel_ok = value == "alternate",
            _ => {}
        }
    }
    Ok(href.filter(|_| rel_ok))
}
