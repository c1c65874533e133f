//! Delivery of new-post announcements to the newsletter API.
//!
//! - [`message`] - formats a [`FeedItem`](crate::feed::FeedItem) into the
//!   `{subject, body, status}` payload
//! - [`client`] - POSTs the payload, retrying 429/5xx with exponential backoff

mod client;
mod message;

pub use client::{Acknowledgement, Announce, Notifier, NotifyError, RetryPolicy};
pub use message::{EmailPayload, DEFAULT_EMAIL_STATUS};
