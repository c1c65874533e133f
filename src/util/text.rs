use std::sync::OnceLock;

use regex::Regex;

/// Elements whose content is never readable text and is dropped wholesale.
fn script_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>|<!--.*?-->")
            .expect("static regex")
    })
}

/// Tags that end a visual line in rendered HTML.
fn line_break() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)<br\s*/?>|</(p|div|li|h[1-6]|blockquote|pre|tr)\s*>")
            .expect("static regex")
    })
}

fn any_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)</?[A-Za-z!][^>]*>").expect("static regex"))
}

fn named_entity() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"&([A-Za-z][A-Za-z0-9]*);").expect("static regex"))
}

/// Reduces an HTML fragment from a feed to plain text.
///
/// Script/style blocks and comments are removed with their content, block-level
/// closing tags become line breaks, every remaining tag is dropped, and HTML
/// entities are decoded last so escaped markup (`&lt;b&gt;`) survives as text.
/// Whitespace is collapsed within each line and blank lines are removed.
///
/// ```
/// use rss_newsletter::util::sanitize_html;
///
/// assert_eq!(sanitize_html("<p>Hello&nbsp;<b>world</b></p>"), "Hello world");
/// assert_eq!(sanitize_html("a<script>alert(1)</script>b"), "ab");
/// ```
pub fn sanitize_html(input: &str) -> String {
    let without_scripts = script_block().replace_all(input, "");
    let with_breaks = line_break().replace_all(&without_scripts, "\n");
    let without_tags = any_tag().replace_all(&with_breaks, "");
    let decoded = html_escape::decode_html_entities(&without_tags);

    decoded
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Rewrites HTML-only named entities (`&nbsp;`, `&mdash;`, ...) into numeric
/// character references so a strict XML parser accepts the document.
///
/// The five XML entities are left alone. Names HTML does not know either are
/// escaped as literal text (`&amp;bogus;`).
pub fn xml_safe_entities(input: &str) -> std::borrow::Cow<'_, str> {
    named_entity().replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        if matches!(name, "amp" | "lt" | "gt" | "quot" | "apos") {
            return caps[0].to_string();
        }
        let decoded = html_escape::decode_html_entities(&caps[0]);
        if decoded == caps[0] {
            format!("&amp;{name};")
        } else {
            decoded.chars().map(|c| format!("&#{};", c as u32)).collect()
        }
    })
}
