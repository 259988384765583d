//! JSON listing endpoints: every string under a `url`, `link` or `href` key is a seed.

use gleaner_shared::{GleanerError, Result};
use serde_json::Value;

const LINK_KEYS: &[&str] = &["url", "link", "href"];

/// Collect candidate links from a JSON document, depth-first.
pub(crate) fn parse_listing(body: &str) -> Result<Vec<String>> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| GleanerError::extraction(format!("invalid API listing JSON: {e}")))?;
    let mut links = Vec::new();
    collect(&value, &mut links);
    Ok(links)
}

fn collect(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let is_link_key = LINK_KEYS.iter().any(|k| key.eq_ignore_ascii_case(k));
                match child {
                    Value::String(s) if is_link_key => out.push(s.trim().to_string()),
                    _ => collect(child, out),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_listing() {
        let body = r#"{
            "data": [
                {"id": 1, "url": "https://example.org/a"},
                {"id": 2, "links": {"href": "/b"}},
                {"id": 3, "title": "https://example.org/not-a-link-key"}
            ],
            "next": {"link": "https://example.org/page/2"}
        }"#;
        let links = parse_listing(body).unwrap();
        assert!(links.contains(&"https://example.org/a".to_string()));
        assert!(links.contains(&"/b".to_string()));
        assert!(links.contains(&"https://example.org/page/2".to_string()));
        assert!(!links.iter().any(|l| l.contains("not-a-link-key")));
    }

    #[test]
    fn invalid_json() {
        let err = parse_listing("{not json").unwrap_err();
        assert!(err.to_string().contains("invalid API listing JSON"));
    }
}
