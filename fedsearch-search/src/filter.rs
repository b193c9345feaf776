//! Keyword filtering. Every token in the normalized keyword must be present
//! (case-insensitive) in a result's title or content to keep it, with one
//! reserved token: `pwd` additionally matches when any link URL carries a
//! `pwd=` query parameter, since extraction passwords are often embedded in
//! the link itself rather than spelled out in the title or content.

use fedsearch_core::SearchResult;

const PASSWORD_TOKEN: &str = "pwd";
const PASSWORD_URL_MARKER: &str = "pwd=";

pub fn filter_results(results: Vec<SearchResult>, tokens: &[String]) -> Vec<SearchResult> {
    results
        .into_iter()
        .filter(|r| {
            let haystack = format!("{} {}", r.title, r.content).to_lowercase();
            tokens.iter().all(|token| {
                if token == PASSWORD_TOKEN {
                    haystack.contains(token.as_str())
                        || r.links
                            .iter()
                            .any(|l| l.url.to_lowercase().contains(PASSWORD_URL_MARKER))
                } else {
                    haystack.contains(token.as_str())
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedsearch_core::{Link, LinkType};

    fn result(title: &str, content: &str, links: Vec<Link>) -> SearchResult {
        SearchResult::new("p", "m", title, content, links, vec![], None).unwrap()
    }

    #[test]
    fn keeps_results_matching_every_token() {
        let results = vec![
            result("Rust Book", "a great read", vec![]),
            result("Cooking", "not it", vec![]),
        ];
        let filtered = filter_results(results, &["rust".into(), "book".into()]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].title, "Rust Book");
    }

    #[test]
    fn pwd_token_matches_on_content_or_link_url_marker() {
        let url_marker_only = result(
            "album X",
            "",
            vec![Link::new(LinkType::Baidu, "https://pan.baidu.com/s/x?pwd=abc", None)],
        );
        let content_mention = result("album Y", "share pwd included below", vec![]);
        let neither = result("album Z", "nothing relevant", vec![]);

        let filtered = filter_results(
            vec![url_marker_only, content_mention, neither],
            &["album".into(), "pwd".into()],
        );
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[0].title, "album X");
        assert_eq!(filtered[1].title, "album Y");
    }

    #[test]
    fn empty_token_list_keeps_everything() {
        let results = vec![result("a", "b", vec![])];
        assert_eq!(filter_results(results, &[]).len(), 1);
    }
}
