//! Text helpers shared by the feed parser and the email formatter.
//!
//! Feed entries arrive as HTML fragments; subscribers get plain text.
//!
//! ```
//! use rss_newsletter::util::sanitize_html;
//!
//! let text = sanitize_html("<p>New <b>post</b> is up</p>");
//! assert_eq!(text, "New post is up");
//! ```

mod text;

pub use text::{sanitize_html, xml_safe_entities};
