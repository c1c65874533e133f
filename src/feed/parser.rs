use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::util::{sanitize_html, xml_safe_entities};

/// Errors raised when the fetched document is not a usable RSS feed.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Body is not valid UTF-8 text
    #[error("Feed is not valid UTF-8")]
    InvalidUtf8,
    /// Body is not well-formed XML
    #[error("Malformed feed XML: {0}")]
    Xml(#[from] quick_xml::Error),
    /// Document ended with elements still open
    #[error("Feed document is truncated")]
    Truncated,
    /// Well-formed XML without an `<rss><channel>` container
    #[error("Feed has no <channel> element")]
    MissingChannel,
}

/// One syndicated post, rebuilt from the feed on every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    /// Plain text; markup and entities already resolved.
    pub description: String,
    pub published_at: DateTime<Utc>,
    /// Feed guid, or the link when the feed omits it.
    pub guid: String,
}

/// Output of [`parse_feed`].
#[derive(Debug, Default)]
pub struct ParseResult {
    /// Items sorted newest first.
    pub items: Vec<FeedItem>,
    /// Items dropped because their `pubDate` could not be read.
    pub skipped: usize,
}

/// Text of the item children we read, before any cleanup.
#[derive(Debug, Default)]
struct RawItem {
    title: String,
    link: String,
    description: String,
    pub_date: String,
    guid: String,
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Title,
    Link,
    Description,
    PubDate,
    Guid,
}

impl Field {
    /// Matches the full qualified name, so `atom:link` or `media:title`
    /// never shadow the plain RSS elements.
    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"title" => Some(Field::Title),
            b"link" => Some(Field::Link),
            b"description" => Some(Field::Description),
            b"pubDate" => Some(Field::PubDate),
            b"guid" => Some(Field::Guid),
            _ => None,
        }
    }
}

impl RawItem {
    fn slot(&mut self, field: Field) -> &mut String {
        match field {
            Field::Title => &mut self.title,
            Field::Link => &mut self.link,
            Field::Description => &mut self.description,
            Field::PubDate => &mut self.pub_date,
            Field::Guid => &mut self.guid,
        }
    }
}

/// Parses an RSS 2.0 document into sanitized items, newest first.
///
/// Items without a readable `pubDate` can never fall inside a recency window,
/// so they are dropped and counted in [`ParseResult::skipped`].
pub fn parse_feed(bytes: &[u8]) -> Result<ParseResult, ParseError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ParseError::InvalidUtf8)?;
    let cleaned = xml_safe_entities(text);
    let raw = read_items(&cleaned)?;

    Ok(normalize_items(raw))
}

/// Collects the `<item>` children of `<rss><channel>`, wherever they appear
/// among the channel's other elements.
///
/// Only the first occurrence of each field in an item is kept.
fn read_items(xml: &str) -> Result<Vec<RawItem>, ParseError> {
    let mut reader = Reader::from_str(xml);
    let mut items = Vec::new();

    let mut depth = 0usize;
    let mut root_is_rss = false;
    let mut seen_channel = false;
    let mut channel_depth: Option<usize> = None;
    let mut item: Option<(usize, RawItem)> = None;
    let mut field: Option<(usize, Field)> = None;
    let mut filled = [false; 5];

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                depth += 1;
                let name = e.name();
                let name = name.as_ref();

                if depth == 1 {
                    root_is_rss = name == b"rss";
                } else if let Some((item_depth, _)) = &item {
                    if field.is_none() && depth == *item_depth + 1 {
                        field = Field::from_name(name)
                            .filter(|f| !filled[*f as usize])
                            .map(|f| (depth, f));
                    }
                } else if channel_depth.is_some_and(|d| depth == d + 1) && name == b"item" {
                    item = Some((depth, RawItem::default()));
                    filled = [false; 5];
                } else if depth == 2 && root_is_rss && name == b"channel" {
                    seen_channel = true;
                    channel_depth = Some(depth);
                }
            }
            Event::Empty(e) => {
                let name = e.name();
                let name = name.as_ref();
                if item.is_none() && channel_depth.is_some_and(|d| depth == d) && name == b"item" {
                    items.push(RawItem::default());
                } else if depth == 1 && root_is_rss && name == b"channel" {
                    seen_channel = true;
                }
            }
            Event::Text(e) => {
                if let (Some((_, raw)), Some((_, f))) = (item.as_mut(), field) {
                    raw.slot(f).push_str(&e.unescape()?);
                }
            }
            Event::CData(e) => {
                if let (Some((_, raw)), Some((_, f))) = (item.as_mut(), field) {
                    raw.slot(f).push_str(&String::from_utf8_lossy(&e));
                }
            }
            Event::End(_) => {
                if let Some((field_depth, f)) = field {
                    if field_depth == depth {
                        filled[f as usize] = true;
                        field = None;
                    }
                }
                if item.as_ref().is_some_and(|(d, _)| *d == depth) {
                    if let Some((_, raw)) = item.take() {
                        items.push(raw);
                    }
                }
                if channel_depth == Some(depth) {
                    channel_depth = None;
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(ParseError::Truncated);
    }
    if !seen_channel {
        return Err(ParseError::MissingChannel);
    }

    Ok(items)
}

/// Turns raw item records into [`FeedItem`]s with a uniform shape and order.
fn normalize_items(raw: Vec<RawItem>) -> ParseResult {
    let mut items = Vec::with_capacity(raw.len());
    let mut skipped = 0;

    for entry in raw {
        let title = sanitize_html(entry.title.trim());
        let link = entry.link.trim().to_string();
        let date_text = entry.pub_date.trim();

        let Some(published_at) = parse_pub_date(date_text) else {
            tracing::warn!(title = %title, pub_date = %date_text, "Feed item has no readable pubDate, skipping");
            skipped += 1;
            continue;
        };

        let guid = resolve_guid(entry.guid.trim(), &link, &title, published_at);
        let description = sanitize_html(entry.description.trim());

        items.push(FeedItem {
            title,
            link,
            description,
            published_at,
            guid,
        });
    }

    items.sort_by(|a, b| b.published_at.cmp(&a.published_at));

    ParseResult { items, skipped }
}

/// Reads an RFC 2822 date as RSS prescribes, tolerating RFC 3339 as well.
pub fn parse_pub_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn resolve_guid(guid: &str, link: &str, title: &str, published_at: DateTime<Utc>) -> String {
    if !guid.is_empty() {
        return guid.to_string();
    }
    if !link.is_empty() {
        return link.to_string();
    }

    let input = format!("{}|{}|{}", link, title, published_at.timestamp());
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    const TWO_ITEMS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:atom="http://www.w3.org/2005/Atom">
  <channel>
    <title>Blog</title>
    <link>https://blog.example.com</link>
    <atom:link href="https://blog.example.com/rss.xml" rel="self" type="application/rss+xml"/>
    <item>
      <title><![CDATA[Older post]]></title>
      <link>https://blog.example.com/older</link>
      <description><![CDATA[<p>First <b>words</b></p>]]></description>
      <pubDate>Mon, 01 Jan 2024 10:00:00 GMT</pubDate>
      <guid isPermaLink="false">older-guid</guid>
    </item>
    <item>
      <title>Newer &amp; better</title>
      <link>https://blog.example.com/newer</link>
      <description>&lt;p&gt;Escaped&amp;nbsp;markup&lt;/p&gt;</description>
      <pubDate>Tue, 02 Jan 2024 10:00:00 +0000</pubDate>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parses_and_sorts_newest_first() {
        let result = parse_feed(TWO_ITEMS.as_bytes()).unwrap();
        assert_eq!(result.skipped, 0);
        let titles: Vec<_> = result.items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["Newer & better", "Older post"]);
        assert_eq!(
            result.items[0].published_at,
            Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_guid_attribute_ignored_and_link_fallback() {
        let result = parse_feed(TWO_ITEMS.as_bytes()).unwrap();
        assert_eq!(result.items[1].guid, "older-guid");
        assert_eq!(result.items[0].guid, "https://blog.example.com/newer");
    }

    #[test]
    fn test_description_is_sanitized() {
        let result = parse_feed(TWO_ITEMS.as_bytes()).unwrap();
        assert_eq!(result.items[1].description, "First words");
        assert_eq!(result.items[0].description, "Escaped markup");
    }

    #[test]
    fn test_single_item_channel() {
        let xml = r#"<rss><channel><item>
            <title>Only</title><link>https://x.example/only</link>
            <pubDate>Wed, 03 Jan 2024 08:30:00 GMT</pubDate>
        </item></channel></rss>"#;
        let result = parse_feed(xml.as_bytes()).unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].description, "");
    }

    #[test]
    fn test_empty_channel_has_no_items() {
        let result = parse_feed(b"<rss version=\"2.0\"><channel><title>t</title></channel></rss>").unwrap();
        assert!(result.items.is_empty());
    }

    #[test]
    fn test_html_entities_outside_cdata() {
        let xml = r#"<rss><channel><item>
            <title>Caf&eacute;&nbsp;notes</title><link>https://x.example/cafe</link>
            <pubDate>Wed, 03 Jan 2024 08:30:00 GMT</pubDate>
        </item></channel></rss>"#;
        let result = parse_feed(xml.as_bytes()).unwrap();
        assert_eq!(result.items[0].title, "Café notes");
    }

    #[test]
    fn test_unreadable_date_is_skipped() {
        let xml = r#"<rss><channel>
            <item><title>Bad</title><link>https://x.example/bad</link><pubDate>someday</pubDate></item>
            <item><title>None</title><link>https://x.example/none</link></item>
            <item><title>Good</title><link>https://x.example/good</link><pubDate>2024-01-03T08:30:00Z</pubDate></item>
        </channel></rss>"#;
        let result = parse_feed(xml.as_bytes()).unwrap();
        assert_eq!(result.skipped, 2);
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].title, "Good");
    }

    #[test]
    fn test_namespaced_siblings_do_not_shadow_rss_fields() {
        let xml = r#"<rss xmlns:atom="http://www.w3.org/2005/Atom" xmlns:media="http://search.yahoo.com/mrss/" xmlns:dc="http://purl.org/dc/elements/1.1/">
          <channel>
            <item>
              <title>Plain title</title>
              <media:title>Media title</media:title>
              <link>https://x.example/post</link>
              <atom:link href="https://x.example/other" rel="alternate"/>
              <dc:description>Dublin Core text</dc:description>
              <description>Body text</description>
              <pubDate>Wed, 03 Jan 2024 08:30:00 GMT</pubDate>
            </item>
          </channel>
        </rss>"#;
        let result = parse_feed(xml.as_bytes()).unwrap();
        assert_eq!(result.items.len(), 1);
        let item = &result.items[0];
        assert_eq!(item.title, "Plain title");
        assert_eq!(item.link, "https://x.example/post");
        assert_eq!(item.description, "Body text");
        assert_eq!(item.guid, "https://x.example/post");
    }

    #[test]
    fn test_namespaced_field_before_plain_one() {
        let xml = r#"<rss><channel><item>
            <atom:link href="https://x.example/self"/>
            <media:title>Media title</media:title>
            <title>Plain title</title>
            <link>https://x.example/post</link>
            <pubDate>Wed, 03 Jan 2024 08:30:00 GMT</pubDate>
        </item></channel></rss>"#;
        let result = parse_feed(xml.as_bytes()).unwrap();
        assert_eq!(result.items[0].title, "Plain title");
        assert_eq!(result.items[0].link, "https://x.example/post");
    }

    #[test]
    fn test_items_interleaved_with_other_channel_elements() {
        let xml = r#"<rss><channel>
            <item><title>First</title><link>https://x.example/1</link><pubDate>Wed, 03 Jan 2024 08:30:00 GMT</pubDate></item>
            <lastBuildDate>Wed, 03 Jan 2024 09:00:00 GMT</lastBuildDate>
            <image><title>Logo</title><link>https://x.example</link></image>
            <item><title>Second</title><link>https://x.example/2</link><pubDate>Wed, 03 Jan 2024 09:30:00 GMT</pubDate></item>
            <item/>
        </channel></rss>"#;
        let result = parse_feed(xml.as_bytes()).unwrap();
        let titles: Vec<_> = result.items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["Second", "First"]);
        assert_eq!(result.skipped, 1);
    }

    #[test]
    fn test_repeated_field_keeps_first_value() {
        let xml = r#"<rss><channel><item>
            <title>One</title><title>Two</title>
            <link>https://x.example/one</link>
            <pubDate>Wed, 03 Jan 2024 08:30:00 GMT</pubDate>
        </item></channel></rss>"#;
        let result = parse_feed(xml.as_bytes()).unwrap();
        assert_eq!(result.items[0].title, "One");
    }

    #[test]
    fn test_missing_channel_is_error() {
        let err = parse_feed(b"<html><body>Not a feed</body></html>").unwrap_err();
        assert!(matches!(err, ParseError::MissingChannel), "got {err:?}");
    }

    #[test]
    fn test_malformed_xml_is_error() {
        assert!(parse_feed(b"<rss><channel><item>").is_err());
        assert!(matches!(
            parse_feed(b"<rss><channel></item></channel></rss>"),
            Err(ParseError::Xml(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_is_error() {
        let err = parse_feed(&[0xff, 0xfe, 0x00]).unwrap_err();
        assert!(matches!(err, ParseError::InvalidUtf8));
    }

    #[test]
    fn test_hash_guid_when_link_and_guid_missing() {
        let published = Utc.with_ymd_and_hms(2024, 1, 3, 8, 30, 0).unwrap();
        let a = resolve_guid("", "", "Title", published);
        let b = resolve_guid("", "", "Title", published);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, resolve_guid("", "", "Other", published));
    }
}
