//! Cleanup passes over converted Markdown-flavoured text.
//!
//! Passes run in order; each takes the previous output.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use url::Url;

static BLANK_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid blank-run regex"));

static LEFTOVER_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"</?(?:div|span|section|article|aside|header|footer|figure|figcaption|details|summary|font|center|small|sup|sub|abbr)(?:\s[^>]*)?/?>",
    )
    .expect("valid leftover-tag regex")
});

static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(!?)\[([^\]]*)\]\(([^)\s]+)\)").expect("valid link regex"));

static CODE_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("valid code-fence regex"));

/// Run every pass.
pub(crate) fn run(text: &str, base_url: Option<&Url>) -> String {
    let text = strip_leftover_tags(text);
    let text = resolve_relative_links(&text, base_url);
    let text = trim_line_ends(&text);
    let text = collapse_blank_lines(&text);
    text.trim().to_string()
}

/// At most one empty line between blocks.
fn collapse_blank_lines(text: &str) -> String {
    BLANK_RUN_RE.replace_all(text, "\n\n").into_owned()
}

/// Drop layout tags `htmd` passed through, keeping their text. Fenced code is
/// left alone.
fn strip_leftover_tags(text: &str) -> String {
    let mut out = Vec::new();
    let mut in_fence = false;
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        if in_fence || line.trim_start().starts_with("```") {
            out.push(line.to_string());
        } else {
            out.push(LEFTOVER_TAG_RE.replace_all(line, "").into_owned());
        }
    }
    out.join("\n")
}

/// Make link and image targets absolute against the document URL.
fn resolve_relative_links(text: &str, base_url: Option<&Url>) -> String {
    let Some(base) = base_url else {
        return text.to_string();
    };
    LINK_RE
        .replace_all(text, |caps: &Captures| {
            let (bang, label, href) = (&caps[1], &caps[2], &caps[3]);
            let absolute = href.contains("://")
                || href.starts_with('#')
                || href.starts_with("mailto:")
                || href.starts_with("data:");
            if absolute {
                return caps[0].to_string();
            }
            match base.join(href) {
                Ok(resolved) => format!("{bang}[{label}]({resolved})"),
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn trim_line_ends(text: &str) -> String {
    text.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

/// Words outside fenced code blocks.
pub(crate) fn count_words(text: &str) -> usize {
    CODE_FENCE_RE
        .replace_all(text, " ")
        .split_whitespace()
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_collapse() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\nb\n\nc"), "a\n\nb\n\nc");
    }

    #[test]
    fn leftover_tags_go_but_code_stays() {
        let input = "<div class=\"note\">Important</div>\n```html\n<div>kept</div>\n```\n<span>x</span>";
        let out = strip_leftover_tags(input);
        assert!(out.contains("Important"));
        assert!(!out.contains("<div class"));
        assert!(out.contains("<div>kept</div>"));
        assert!(out.ends_with('x'));
    }

    #[test]
    fn relative_links_resolve() {
        let base = Url::parse("https://docs.example.com/guide/intro").unwrap();
        let out = resolve_relative_links(
            "[Next](/api/ref) [Up](../) ![img](logo.png) [Ext](https://other.com/) [Here](#a)",
            Some(&base),
        );
        assert_eq!(
            out,
            "[Next](https://docs.example.com/api/ref) [Up](https://docs.example.com/) \
             ![img](https://docs.example.com/guide/logo.png) [Ext](https://other.com/) [Here](#a)"
        );
        assert_eq!(resolve_relative_links("[a](/b)", None), "[a](/b)");
    }

    #[test]
    fn word_count_skips_code_and_markup() {
        let text = "# Title\n\nOne two three.\n\n```\nlots of code words here\n```\n\n- item";
        assert_eq!(count_words(text), 5);
    }

    #[test]
    fn full_run() {
        let out = run("  \n<div>Hello</div>   \n\n\n\n[x](y)\n", Url::parse("https://e.org/a/").ok().as_ref());
        assert_eq!(out, "Hello\n\n[x](https://e.org/a/y)");
    }
}
