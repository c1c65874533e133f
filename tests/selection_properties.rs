//! Property tests for post selection against arbitrary feeds and ledgers.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::HashSet;
use rss_newsletter::events::MemoryLog;
use rss_newsletter::feed::FeedItem;
use rss_newsletter::ledger::Ledger;
use rss_newsletter::poller::select_new_posts;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// Items published within ±6 hours of `now`, with guids drawn from a small
/// pool so ledger hits are common.
fn arb_items() -> impl Strategy<Value = Vec<FeedItem>> {
    prop::collection::vec((0u8..12, -6 * 3600i64..6 * 3600), 0..20).prop_map(|specs| {
        specs
            .into_iter()
            .map(|(id, offset_secs)| FeedItem {
                title: format!("Post {id}"),
                link: format!("https://blog.example.com/{id}"),
                description: String::new(),
                published_at: now() + TimeDelta::seconds(offset_secs),
                guid: format!("guid-{id}"),
            })
            .collect()
    })
}

fn arb_ledger() -> impl Strategy<Value = Ledger> {
    prop::collection::vec(0u8..12, 0..8)
        .prop_map(|ids| Ledger::from_guids(ids.into_iter().map(|id| format!("guid-{id}"))))
}

proptest! {
    #[test]
    fn selected_posts_satisfy_every_rule(
        items in arb_items(),
        ledger in arb_ledger(),
        window_hours in 1i64..5,
    ) {
        let window = TimeDelta::hours(window_hours);
        let selection = select_new_posts(&items, &ledger, now(), window, &MemoryLog::new());

        for post in &selection.posts {
            prop_assert!(post.published_at <= now());
            prop_assert!(post.published_at > now() - window);
            prop_assert!(!ledger.contains(&post.guid));
        }
    }

    #[test]
    fn every_eligible_post_is_selected(
        items in arb_items(),
        ledger in arb_ledger(),
        window_hours in 1i64..5,
    ) {
        let window = TimeDelta::hours(window_hours);
        let selection = select_new_posts(&items, &ledger, now(), window, &MemoryLog::new());

        let eligible: HashSet<&str> = items
            .iter()
            .filter(|i| i.published_at <= now())
            .filter(|i| i.published_at > now() - window)
            .filter(|i| !ledger.contains(&i.guid))
            .map(|i| i.guid.as_str())
            .collect();
        let selected: HashSet<&str> = selection.posts.iter().map(|p| p.guid.as_str()).collect();
        prop_assert_eq!(selection.posts.len(), eligible.len());
        prop_assert_eq!(selected, eligible);
    }

    #[test]
    fn no_guid_is_selected_twice(items in arb_items(), ledger in arb_ledger()) {
        let selection = select_new_posts(&items, &ledger, now(), TimeDelta::MAX, &MemoryLog::new());
        let unique: HashSet<&str> = selection.posts.iter().map(|p| p.guid.as_str()).collect();
        prop_assert_eq!(unique.len(), selection.posts.len());
    }

    #[test]
    fn every_future_post_is_logged(items in arb_items()) {
        let log = MemoryLog::new();
        let selection = select_new_posts(&items, &Ledger::new(), now(), TimeDelta::hours(2), &log);

        let future = items.iter().filter(|i| i.published_at > now()).count();
        prop_assert_eq!(selection.scheduled, future);
        prop_assert_eq!(log.matching("Skipping scheduled post").len(), future);
    }

    #[test]
    fn ledger_hits_are_never_selected(items in arb_items()) {
        let ledger = Ledger::from_guids(items.iter().map(|i| i.guid.clone()));
        let selection = select_new_posts(&items, &ledger, now(), TimeDelta::MAX, &MemoryLog::new());
        prop_assert!(selection.posts.is_empty());
    }
}
