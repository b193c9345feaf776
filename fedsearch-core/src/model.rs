//! Shared data model: search results, links, and the cache-facing shapes
//! derived from them (`SearchResponse`, `MergedLink`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// The handful of cloud-drive / share-link kinds a provider can return.
/// `Unknown` is the bucket for anything `merged_by_type` can't classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Baidu,
    Aliyun,
    Quark,
    Tianyi,
    Uc,
    Mobile,
    Caiyun,
    Lanzou,
    Xunlei,
    Pikpak,
    Magnet,
    Ed2k,
    Unknown,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Baidu => "baidu",
            LinkType::Aliyun => "aliyun",
            LinkType::Quark => "quark",
            LinkType::Tianyi => "tianyi",
            LinkType::Uc => "uc",
            LinkType::Mobile => "mobile",
            LinkType::Caiyun => "caiyun",
            LinkType::Lanzou => "lanzou",
            LinkType::Xunlei => "xunlei",
            LinkType::Pikpak => "pikpak",
            LinkType::Magnet => "magnet",
            LinkType::Ed2k => "ed2k",
            LinkType::Unknown => "unknown",
        }
    }
}

impl Default for LinkType {
    fn default() -> Self {
        LinkType::Unknown
    }
}

/// A single share link extracted from a result's content, with its
/// (optional) extraction password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    #[serde(rename = "type")]
    pub link_type: LinkType,
    pub url: String,
    pub password: Option<String>,
}

impl Link {
    pub fn new(link_type: LinkType, url: impl Into<String>, password: Option<String>) -> Self {
        Self {
            link_type,
            url: url.into(),
            password,
        }
    }
}

/// One provider's raw hit for a keyword. `title` is never empty; use
/// [`SearchResult::new`] rather than constructing the struct literal
/// directly so that invariant is enforced at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub provider_id: String,
    pub message_id: String,
    pub title: String,
    pub content: String,
    pub links: Vec<Link>,
    pub tags: Vec<String>,
    pub datetime: Option<DateTime<Utc>>,
}

impl SearchResult {
    pub fn new(
        provider_id: impl Into<String>,
        message_id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        links: Vec<Link>,
        tags: Vec<String>,
        datetime: Option<DateTime<Utc>>,
    ) -> Result<Self, ModelError> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(ModelError::EmptyTitle);
        }
        Ok(Self {
            provider_id: provider_id.into(),
            message_id: message_id.into(),
            title,
            content: content.into(),
            links,
            tags,
            datetime,
        })
    }
}

/// A link deduplicated by URL across every result that carried it, keeping
/// the newest `datetime` and the title of the result it was last seen in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedLink {
    pub url: String,
    pub password: Option<String>,
    pub note: String,
    pub datetime: Option<DateTime<Utc>>,
}

/// The full response shape handed back to a caller and the shape stored
/// (bincode-encoded) at the cache boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub total: usize,
    pub results: Vec<SearchResult>,
    pub merged_by_type: BTreeMap<LinkType, Vec<MergedLink>>,
}

impl SearchResponse {
    pub fn new(results: Vec<SearchResult>) -> Self {
        let merged_by_type = merge_links_by_type(&results);
        Self {
            total: results.len(),
            results,
            merged_by_type,
        }
    }
}

/// Buckets every link across `results` by its type, deduplicating by URL
/// alone — a URL appears at most once across the whole map, even if it
/// shows up under more than one `LinkType` across results — and keeping
/// the newest `datetime` seen for each URL. Buckets are sorted newest-first.
pub fn merge_links_by_type(results: &[SearchResult]) -> BTreeMap<LinkType, Vec<MergedLink>> {
    let mut by_url: BTreeMap<String, (LinkType, MergedLink)> = BTreeMap::new();

    for result in results {
        for link in &result.links {
            let candidate = MergedLink {
                url: link.url.clone(),
                password: link.password.clone(),
                note: result.title.clone(),
                datetime: result.datetime,
            };
            by_url
                .entry(link.url.clone())
                .and_modify(|(existing_type, existing)| {
                    if candidate.datetime > existing.datetime {
                        *existing_type = link.link_type;
                        *existing = candidate.clone();
                    }
                })
                .or_insert((link.link_type, candidate));
        }
    }

    let mut buckets: BTreeMap<LinkType, Vec<MergedLink>> = BTreeMap::new();
    for (_, (link_type, merged)) in by_url {
        buckets.entry(link_type).or_default().push(merged);
    }
    for links in buckets.values_mut() {
        links.sort_by(|a, b| b.datetime.cmp(&a.datetime));
    }
    buckets
}
