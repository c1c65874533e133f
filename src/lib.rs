//! Polls a blog's RSS feed and announces new posts through an
//! email-newsletter API, remembering what was already sent.
//!
//! The binary in `main.rs` is a thin wrapper around [`poller::run`].

pub mod config;
pub mod events;
pub mod feed;
pub mod ledger;
pub mod notify;
pub mod poller;
pub mod util;
