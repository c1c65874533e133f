//! Feed retrieval and parsing.
//!
//! - [`fetcher`] - one HTTP GET for the configured RSS URL, size-limited
//! - [`parser`] - RSS 2.0 XML into sanitized [`FeedItem`]s, newest first

mod fetcher;
mod parser;

pub use fetcher::{fetch_feed, FetchError};
pub use parser::{parse_feed, parse_pub_date, FeedItem, ParseError, ParseResult};
