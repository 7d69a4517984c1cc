//! HTML helpers.
//!
//! Text extraction goes through `scraper`'s html5ever tree. Discovery only
//! needs `<link>` attributes, which a plain string scan handles.

use scraper::{Html, Node};

/// Visible text of an HTML fragment, entities decoded.
///
/// Text nodes are joined with a single space so adjacent block elements do
/// not glue words together; `<script>` and `<style>` bodies are skipped.
/// Callers usually collapse whitespace afterwards.
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::with_capacity(html.len());

    for node in fragment.root_element().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| matches!(e.name(), "script" | "style"))
        });
        if hidden {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(text);
    }
    out
}

/// Iterates over every `<tag ...>` opening tag with the given name, yielding
/// the original (case-preserved) tag text including the angle brackets.
pub fn find_tags<'a>(html: &'a str, tag_name: &str) -> Vec<&'a str> {
    let html_lower = html.to_ascii_lowercase();
    let needle = format!("<{tag_name}");
    let mut tags = Vec::new();
    let mut search_from = 0;

    while let Some(rel) = html_lower[search_from..].find(&needle) {
        let abs_start = search_from + rel;
        let after = abs_start + needle.len();

        // `<linkfoo` is not `<link`
        let boundary_ok = html_lower[after..]
            .chars()
            .next()
            .is_some_and(|c| c.is_whitespace() || c == '>' || c == '/');

        let Some(tag_end) = html_lower[abs_start..].find('>') else {
            break;
        };
        if boundary_ok {
            tags.push(&html[abs_start..=abs_start + tag_end]);
        }
        search_from = abs_start + tag_end + 1;
    }

    tags
}

/// Checks if a tag contains an attribute with the given value (ASCII case-insensitive).
pub fn has_attr(tag: &str, attr_name: &str, attr_value: &str) -> bool {
    extract_attr_value(tag, attr_name).is_some_and(|v| {
        v.split_ascii_whitespace()
            .any(|token| token.eq_ignore_ascii_case(attr_value))
    })
}

/// Extracts the quoted value of an attribute from a tag string (case-preserving).
pub fn extract_attr_value<'a>(tag: &'a str, attr_name: &str) -> Option<&'a str> {
    let tag_lower = tag.to_ascii_lowercase();
    let attr_prefix = format!("{attr_name}=");
    let mut search_from = 0;

    // Require a whitespace boundary so `data-href=` is not mistaken for `href=`
    let attr_start = loop {
        let pos = search_from + tag_lower[search_from..].find(&attr_prefix)?;
        let preceded_by_space = tag_lower[..pos]
            .chars()
            .next_back()
            .is_some_and(char::is_whitespace);
        if preceded_by_space {
            break pos;
        }
        search_from = pos + attr_prefix.len();
    };
    let value_start = attr_start + attr_prefix.len();

    let rest = tag.get(value_start..)?;
    let quote = *rest.as_bytes().first()?;
    if quote != b'"' && quote != b'\'' {
        return None;
    }

    let inner = &rest[1..];
    let end = inner.find(quote as char)?;
    Some(&inner[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_to_text_skips_tags_and_scripts() {
        let html = "<p>Hello <b>world</b></p><script>alert('x')</script><style>p{}</style>done";
        let text = crate::util::collapse_whitespace(&html_to_text(html));
        assert_eq!(text, "Hello world done");
    }

    #[test]
    fn test_html_to_text_decodes_named_entities() {
        let html = "<p>Caf&eacute; costs &euro;5 &mdash; &amp; more</p>";
        assert_eq!(html_to_text(html), "Caf\u{e9} costs \u{20ac}5 \u{2014} & more");
    }

    #[test]
    fn test_html_to_text_numeric_references_and_escaped_markup() {
        assert_eq!(html_to_text("it&#8217;s &#x41;"), "it\u{2019}s A");
        assert_eq!(html_to_text("&amp;lt;b&amp;gt;"), "&lt;b&gt;");
        assert_eq!(html_to_text("a &lt; b"), "a < b");
    }

    #[test]
    fn test_html_to_text_plain_input() {
        assert_eq!(html_to_text("just text"), "just text");
        assert_eq!(html_to_text(""), "");
    }

    #[test]
    fn test_find_tags_respects_name_boundary() {
        let html = r#"<linkage><link rel="alternate" href="/a"><LINK href="/b"/>"#;
        let tags = find_tags(html, "link");
        assert_eq!(tags.len(), 2);
        assert!(tags[1].starts_with("<LINK"));
    }

    #[test]
    fn test_extract_attr_value_quotes_and_case() {
        let tag = r#"<link REL='alternate' data-href="x" href="/Feed.XML">"#;
        assert_eq!(extract_attr_value(tag, "href"), Some("/Feed.XML"));
        assert_eq!(extract_attr_value(tag, "rel"), Some("alternate"));
        assert_eq!(extract_attr_value(tag, "type"), None);
    }

    #[test]
    fn test_has_attr_token_match() {
        let tag = r#"<link rel="alternate nofollow" type="application/rss+xml">"#;
        assert!(has_attr(tag, "rel", "alternate"));
        assert!(has_attr(tag, "type", "application/rss+xml"));
        assert!(!has_attr(tag, "rel", "stylesheet"));
    }
}
