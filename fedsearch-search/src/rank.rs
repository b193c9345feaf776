//! Result ranking. Entries without a `datetime` always sort last. Among
//! dated entries, how strongly recency dominates depends on how far apart
//! two entries are:
//!
//! - within 1 day of each other: treated as contemporaneous, so a scan for
//!   keyword-priority domain tokens in the title decides order before date
//! - more than 30 days apart: recency alone decides, the priority scan is
//!   skipped entirely
//! - in between: date decides first, priority tokens are only a tiebreak
//!
//! Title is the final tiebreak in every band.

use std::cmp::Ordering;

use chrono::Duration;
use fedsearch_core::SearchResult;

const NEAR_THRESHOLD: i64 = 1; // days
const FAR_THRESHOLD: i64 = 30; // days

/// Domain tokens that mark a result as a more complete/higher-quality
/// share, in priority order (earlier entries outrank later ones). Only the
/// first match in a title counts.
const KEYWORD_PRIORITY_TOKENS: &[&str] = &["全", "合集", "系列", "完", "最新", "附", "花园墙外"];

pub(crate) fn priority_score(title: &str) -> usize {
    let lower = title.to_lowercase();
    KEYWORD_PRIORITY_TOKENS
        .iter()
        .position(|tok| lower.contains(tok))
        .map(|idx| KEYWORD_PRIORITY_TOKENS.len() - idx)
        .unwrap_or(0)
}

pub fn compare(a: &SearchResult, b: &SearchResult) -> Ordering {
    match (a.datetime, b.datetime) {
        (None, None) => a.title.cmp(&b.title),
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(at), Some(bt)) => {
            let delta = (at - bt).num_days().abs();
            let by_date = bt.cmp(&at); // newer first
            let by_priority = priority_score(&b.title).cmp(&priority_score(&a.title));

            let primary = if delta <= NEAR_THRESHOLD {
                by_priority.then(by_date)
            } else if delta >= FAR_THRESHOLD {
                by_date
            } else {
                by_date.then(by_priority)
            };

            primary.then_with(|| a.title.cmp(&b.title))
        }
    }
}

pub fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(compare);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn result_at(title: &str, days_ago: i64) -> SearchResult {
        let dt = Utc::now() - Duration::days(days_ago);
        SearchResult::new("p", "m", title, "", vec![], vec![], Some(dt)).unwrap()
    }

    fn result_undated(title: &str) -> SearchResult {
        SearchResult::new("p", "m", title, "", vec![], vec![], None).unwrap()
    }

    #[test]
    fn undated_results_sort_last() {
        let mut results = vec![result_undated("no date"), result_at("dated", 1)];
        sort_results(&mut results);
        assert_eq!(results[0].title, "dated");
        assert_eq!(results[1].title, "no date");
    }

    #[test]
    fn far_apart_results_rank_strictly_by_recency() {
        let mut results = vec![result_at("older 合集", 60), result_at("newer", 1)];
        sort_results(&mut results);
        assert_eq!(results[0].title, "newer");
    }

    #[test]
    fn near_simultaneous_results_rank_by_priority_tokens_first() {
        let mut results = vec![result_at("plain title", 0), result_at("special 合集", 0)];
        sort_results(&mut results);
        assert_eq!(results[0].title, "special 合集");
    }

    #[test]
    fn exact_timestamp_tie_falls_back_to_title() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut a = result_at("Zebra", 0);
        a.datetime = Some(dt);
        let mut b = result_at("Apple", 0);
        b.datetime = Some(dt);
        let mut results = vec![a, b];
        sort_results(&mut results);
        assert_eq!(results[0].title, "Apple");
    }
}
