//! HTML extraction: main-content text as Markdown-flavoured plain text, and
//! bibliographic metadata from meta tags.

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use gleaner_shared::{DocumentMetadata, GleanerError, Result};

use crate::Extract;
use crate::cleanup;
use crate::date::parse_date;

/// Tags dropped wholesale during conversion.
const CHROME_TAGS: &[&str] = &[
    "script", "style", "noscript", "nav", "footer", "aside", "iframe", "svg", "form", "button",
];

/// Main-content containers, most specific first.
const CONTENT_SELECTORS: &[&str] = &[
    "article",
    "main",
    "[role=\"main\"]",
    "#content",
    ".content",
    ".post",
    "body",
];

static META: LazyLock<Selector> = LazyLock::new(|| Selector::parse("meta").expect("valid selector"));
static TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("head title").expect("valid selector"));
static H1: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").expect("valid selector"));
static TIME: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("time[datetime]").expect("valid selector"));
static TABLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table").expect("valid selector"));
static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("valid selector"));
static CELL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("th, td").expect("valid selector"));

#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlExtractor;

impl Extract for HtmlExtractor {
    fn name(&self) -> &'static str {
        "html"
    }

    fn extract_text(&self, bytes: &[u8], base_url: Option<&Url>) -> Result<String> {
        let html = String::from_utf8_lossy(bytes);
        let content = content_html(&html);
        let (content, tables) = extract_tables(&content);

        let converter = htmd::HtmlToMarkdown::builder()
            .skip_tags(CHROME_TAGS.to_vec())
            .build();
        let mut text = converter
            .convert(&content)
            .map_err(|e| GleanerError::extraction(format!("HTML conversion failed: {e}")))?;

        for (i, table) in tables.iter().enumerate() {
            text = text.replacen(&table_placeholder(i), table, 1);
        }
        debug!(raw_len = text.len(), tables = tables.len(), "html converted");

        Ok(cleanup::run(&text, base_url))
    }

    fn extract_metadata(&self, bytes: &[u8]) -> Result<DocumentMetadata> {
        let html = String::from_utf8_lossy(bytes);
        let doc = Html::parse_document(&html);
        let metas = meta_pairs(&doc);

        let title = first_meta(&metas, &["citation_title", "og:title", "dc.title", "twitter:title"])
            .or_else(|| first_text(&doc, &TITLE))
            .or_else(|| first_text(&doc, &H1));

        let mut authors = all_meta(&metas, "citation_author");
        if authors.is_empty() {
            authors = ["author", "dc.creator", "article:author"]
                .iter()
                .flat_map(|key| all_meta(&metas, key))
                .filter(|a| !a.starts_with("http://") && !a.starts_with("https://"))
                .flat_map(|a| a.split(';').map(|s| s.trim().to_string()).collect::<Vec<_>>())
                .filter(|a| !a.is_empty())
                .collect();
        }
        dedupe_in_order(&mut authors);

        let organization = first_meta(
            &metas,
            &["citation_publisher", "dc.publisher", "og:site_name", "citation_journal_title"],
        );

        let published_on = [
            "citation_publication_date",
            "citation_date",
            "article:published_time",
            "dc.date.issued",
            "dc.date",
            "date",
        ]
        .iter()
        .flat_map(|key| all_meta(&metas, key))
        .find_map(|v| parse_date(&v))
        .or_else(|| {
            doc.select(&TIME)
                .filter_map(|el| el.value().attr("datetime"))
                .find_map(parse_date)
        });

        Ok(DocumentMetadata {
            title,
            authors,
            organization,
            published_on,
        })
    }
}

/// Inner HTML of the first matching content container.
fn content_html(html: &str) -> String {
    let doc = Html::parse_document(html);
    CONTENT_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|sel| doc.select(&sel).next().map(|el| el.inner_html()))
        .unwrap_or_else(|| html.to_string())
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

fn table_placeholder(i: usize) -> String {
    format!("GLEANERTABLE{i}X")
}

/// Swap each `<table>` for a placeholder paragraph and return the rendered
/// pipe tables. `htmd` has no table support and would flatten them.
fn extract_tables(html: &str) -> (String, Vec<String>) {
    let fragment = Html::parse_fragment(html);
    let mut out = html.to_string();
    let mut tables = Vec::new();

    for table in fragment.select(&TABLE) {
        // Nested tables are rendered as part of their parent.
        if table.ancestors().filter_map(ElementRef::wrap).any(|a| a.value().name() == "table") {
            continue;
        }
        let rendered = render_table(&table);
        let original = table.html();
        if rendered.is_empty() || !out.contains(&original) {
            continue;
        }
        out = out.replacen(&original, &format!("<p>{}</p>", table_placeholder(tables.len())), 1);
        tables.push(rendered);
    }
    (out, tables)
}

fn render_table(table: &ElementRef) -> String {
    let rows: Vec<Vec<String>> = table
        .select(&ROW)
        .map(|tr| {
            tr.select(&CELL)
                .map(|cell| {
                    cell.text()
                        .collect::<Vec<_>>()
                        .join(" ")
                        .split_whitespace()
                        .collect::<Vec<_>>()
                        .join(" ")
                        .replace('|', "\\|")
                })
                .collect()
        })
        .filter(|cells: &Vec<String>| !cells.is_empty())
        .collect();

    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    if width == 0 {
        return String::new();
    }

    let line = |cells: &[String]| {
        let mut padded: Vec<&str> = cells.iter().map(String::as_str).collect();
        padded.resize(width, "");
        format!("| {} |", padded.join(" | "))
    };

    let mut lines = vec![line(&rows[0]), format!("|{}", " --- |".repeat(width))];
    lines.extend(rows[1..].iter().map(|r| line(r)));
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Meta tags
// ---------------------------------------------------------------------------

/// `(lowercased name or property, content)` in document order.
fn meta_pairs(doc: &Html) -> Vec<(String, String)> {
    doc.select(&META)
        .filter_map(|el| {
            let v = el.value();
            let key = v.attr("name").or_else(|| v.attr("property"))?;
            let content = v.attr("content")?.trim();
            (!content.is_empty()).then(|| (key.trim().to_ascii_lowercase(), content.to_string()))
        })
        .collect()
}

fn all_meta(metas: &[(String, String)], key: &str) -> Vec<String> {
    metas
        .iter()
        .filter(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
        .collect()
}

fn first_meta(metas: &[(String, String)], keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| metas.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone()))
}

fn first_text(doc: &Html, sel: &Selector) -> Option<String> {
    doc.select(sel)
        .map(|el| el.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" "))
        .find(|t| !t.is_empty())
}

fn dedupe_in_order(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|item| seen.insert(item.to_lowercase()));
}
