use serde::Serialize;

use crate::feed::FeedItem;

/// `status` the API is asked to give new emails unless configured otherwise.
pub const DEFAULT_EMAIL_STATUS: &str = "about_to_send";

/// JSON body for the newsletter API's create-email endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailPayload {
    pub subject: String,
    pub body: String,
    pub status: String,
}

impl EmailPayload {
    /// Formats the announcement email for one post.
    ///
    /// The body is Markdown: description, a link to the post, a rule, and the
    /// footer in italics. An empty description is left out.
    pub fn for_item(item: &FeedItem, footer: &str, status: &str) -> Self {
        let mut body = String::new();
        if !item.description.is_empty() {
            body.push_str(&item.description);
            body.push_str("\n\n");
        }
        body.push_str(&format!("[Read the full post →]({})", item.link));
        if !footer.trim().is_empty() {
            body.push_str(&format!("\n\n---\n*{}*", footer.trim()));
        }

        Self {
            subject: format!("New post: {}", item.title),
            body,
            status: status.to_string(),
        }
    }
}
