//! One poll-and-notify run.
//!
//! ```text
//! config ─▶ fetch_feed ─▶ parse_feed ─▶ Ledger::load ─▶ select_new_posts
//!                                                            │
//!          Ledger::save ◀─ DeliveryReport::apply_to ◀─ deliver (sequential)
//! ```
//!
//! Feed, configuration and ledger failures abort the run. A post that cannot
//! be delivered is recorded in the [`DeliveryReport`] and the loop moves on.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::events::{LogRecord, RunLog};
use crate::feed::{fetch_feed, parse_feed, FeedItem, FetchError, ParseError};
use crate::ledger::{Ledger, LedgerError};
use crate::notify::{Announce, Notifier, NotifyError, RetryPolicy};

/// Errors that end a run with a non-zero exit.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to fetch feed: {0}")]
    Fetch(#[from] FetchError),
    #[error("Failed to parse feed: {0}")]
    Parse(#[from] ParseError),
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

// ============================================================================
// Selection
// ============================================================================

/// Posts chosen for delivery, plus counts of what was passed over.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Eligible posts, in feed order (newest first).
    pub posts: Vec<FeedItem>,
    /// Posts dated in the future.
    pub scheduled: usize,
    /// Posts whose guid is already in the ledger, or repeats a guid
    /// selected earlier in the same feed.
    pub already_sent: usize,
}

/// Picks the posts that should be announced now.
///
/// A post qualifies when it is already published (`published_at <= now`),
/// newer than the window (`published_at > now - window`, exclusive), and not
/// in the ledger. Future-dated posts are reported to `log` and skipped.
/// Each guid is selected at most once, even if the feed repeats it.
pub fn select_new_posts(
    items: &[FeedItem],
    ledger: &Ledger,
    now: DateTime<Utc>,
    window: TimeDelta,
    log: &dyn RunLog,
) -> Selection {
    let cutoff = now.checked_sub_signed(window);
    let mut selection = Selection::default();
    let mut chosen: HashSet<&str> = HashSet::new();

    for item in items {
        if item.published_at > now {
            log.record(
                LogRecord::info("Skipping scheduled post")
                    .with("title", &item.title)
                    .with("scheduled_for", item.published_at.to_rfc3339()),
            );
            selection.scheduled += 1;
            continue;
        }

        let recent = cutoff.map_or(true, |cutoff| item.published_at > cutoff);
        if !recent {
            continue;
        }

        if ledger.contains(&item.guid) || !chosen.insert(item.guid.as_str()) {
            selection.already_sent += 1;
            continue;
        }

        selection.posts.push(item.clone());
    }

    selection
}

// ============================================================================
// Delivery
// ============================================================================

/// A post the API did not accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDelivery {
    pub guid: String,
    pub title: String,
    pub status: Option<u16>,
    pub error: String,
}

/// Outcome of the notification loop.
///
/// Successes are kept here rather than written straight into the ledger, so
/// the loop's bookkeeping can be inspected on its own and the ledger is
/// updated in one step afterwards.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    sent: Vec<String>,
    failed: Vec<FailedDelivery>,
}

impl DeliveryReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self, item: &FeedItem) {
        self.sent.push(item.guid.clone());
    }

    pub fn record_failure(&mut self, item: &FeedItem, error: &NotifyError) {
        self.failed.push(FailedDelivery {
            guid: item.guid.clone(),
            title: item.title.clone(),
            status: error.status(),
            error: error.to_string(),
        });
    }

    /// Guids delivered this run, in delivery order.
    pub fn sent(&self) -> &[String] {
        &self.sent
    }

    pub fn failed(&self) -> &[FailedDelivery] {
        &self.failed
    }

    /// Adds every delivered guid to `ledger`; returns how many were new to it.
    pub fn apply_to(&self, ledger: &mut Ledger) -> usize {
        self.sent
            .iter()
            .filter(|guid| ledger.record(guid.as_str()))
            .count()
    }
}

/// Announces each post in turn, pausing `delay` between consecutive sends.
///
/// There is no pause before the first post or after the last one.
pub async fn deliver<A: Announce>(
    notifier: &A,
    posts: &[FeedItem],
    delay: Duration,
    log: &dyn RunLog,
) -> DeliveryReport {
    let mut report = DeliveryReport::new();

    for (index, post) in posts.iter().enumerate() {
        if index > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match notifier.announce(post, log).await {
            Ok(ack) => {
                log.record(
                    LogRecord::info("Sent newsletter email")
                        .with("title", &post.title)
                        .with("guid", &post.guid)
                        .with("email_id", ack.email_id.as_deref().unwrap_or("-")),
                );
                report.record_sent(post);
            }
            Err(e) => {
                log.record(
                    LogRecord::error("Failed to send newsletter email")
                        .with("title", &post.title)
                        .with("guid", &post.guid)
                        .with("error", &e),
                );
                report.record_failure(post, &e);
            }
        }
    }

    report
}

// ============================================================================
// Run
// ============================================================================

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Select posts but neither call the API nor write the ledger.
    pub dry_run: bool,
}

/// Counters describing a completed run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub items_found: usize,
    pub unreadable_items: usize,
    pub selected: usize,
    pub scheduled: usize,
    pub sent: usize,
    pub failed: usize,
    pub ledger_saved: bool,
}

/// Shared HTTP client for the feed request and the API calls.
pub fn build_client(config: &Config) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .pool_idle_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(30))
        .build()
}

/// Executes one run at time `now`.
///
/// Fatal errors are recorded to `log` before being returned.
pub async fn run(
    config: &Config,
    options: RunOptions,
    now: DateTime<Utc>,
    log: &dyn RunLog,
) -> Result<RunSummary, RunError> {
    match run_inner(config, options, now, log).await {
        Ok(summary) => Ok(summary),
        Err(e) => {
            log.record(LogRecord::error("Newsletter run failed").with("error", &e));
            Err(e)
        }
    }
}

async fn run_inner(
    config: &Config,
    options: RunOptions,
    now: DateTime<Utc>,
    log: &dyn RunLog,
) -> Result<RunSummary, RunError> {
    let api_key = config.require_api_key()?;
    config.validate()?;

    let client = build_client(config).map_err(RunError::Client)?;
    let mut summary = RunSummary::default();

    log.record(LogRecord::info("Fetching RSS feed").with("url", &config.feed_url));
    let raw = fetch_feed(&client, &config.feed_url).await?;
    let parsed = parse_feed(&raw)?;
    summary.items_found = parsed.items.len();
    summary.unreadable_items = parsed.skipped;

    if parsed.skipped > 0 {
        log.record(
            LogRecord::warn("Feed items without a readable pubDate were ignored")
                .with("count", parsed.skipped),
        );
    }

    let Some(latest) = parsed.items.first() else {
        log.record(LogRecord::info("No posts found in RSS feed"));
        return Ok(summary);
    };

    let mut ledger = Ledger::load(&config.ledger_path)?;
    log.record(
        LogRecord::debug("Loaded sent-posts ledger")
            .with("path", config.ledger_path.display())
            .with("guids", ledger.len()),
    );

    let selection = select_new_posts(&parsed.items, &ledger, now, config.window(), log);
    summary.selected = selection.posts.len();
    summary.scheduled = selection.scheduled;

    if selection.posts.is_empty() {
        log.record(
            LogRecord::info("No new published posts to send")
                .with("latest_title", &latest.title)
                .with("latest_published", latest.published_at.to_rfc3339())
                .with("now", now.to_rfc3339()),
        );
        return Ok(summary);
    }

    if options.dry_run {
        for post in &selection.posts {
            log.record(
                LogRecord::info("Dry run: would send newsletter email")
                    .with("title", &post.title)
                    .with("guid", &post.guid),
            );
        }
        return Ok(summary);
    }

    let notifier = Notifier::new(client, &config.api_url, &config.auth_scheme, api_key)
        .with_email_status(&config.email_status)
        .with_footer(&config.footer)
        .with_retry(RetryPolicy {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
        });

    let report = deliver(&notifier, &selection.posts, config.notify_delay(), log).await;
    summary.sent = report.sent().len();
    summary.failed = report.failed().len();

    report.apply_to(&mut ledger);
    ledger.save(&config.ledger_path)?;
    summary.ledger_saved = true;

    log.record(
        LogRecord::info("Processed new posts")
            .with("selected", summary.selected)
            .with("sent", summary.sent)
            .with("failed", summary.failed)
            .with("scheduled", summary.scheduled),
    );

    Ok(summary)
}
