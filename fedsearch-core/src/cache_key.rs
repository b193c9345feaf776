//! Deterministic cache key: a canonicalized, fingerprinted identity for a
//! search request's cacheable shape (keyword, source type, channel set,
//! plugin set), independent of argument order or casing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which class of backend a request was scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    All,
    Tg,
    Plugin,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::All => "all",
            SourceType::Tg => "tg",
            SourceType::Plugin => "plugin",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cache-ready fingerprint of a request's cacheable parameters. Two
/// requests that differ only by channel/plugin ordering or keyword casing
/// produce the same `CacheKey`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// `channels` and `plugins` are sorted before hashing so argument order
    /// never affects the fingerprint. `plugins: None` means "all registered
    /// plugins", distinct from `Some(vec![])` ("no plugins").
    pub fn build(
        keyword: &str,
        source_type: SourceType,
        channels: &[String],
        plugins: Option<&[String]>,
    ) -> Self {
        let normalized_keyword = keyword.trim().to_lowercase();

        let mut channels: Vec<String> = channels.iter().map(|c| c.to_lowercase()).collect();
        channels.sort();

        let plugins_part = match plugins {
            None => "*".to_string(),
            Some(plugins) => {
                let mut plugins: Vec<String> = plugins.iter().map(|p| p.to_lowercase()).collect();
                plugins.sort();
                plugins.join(",")
            }
        };

        let canonical = format!(
            "kw={}|src={}|ch={}|pl={}",
            normalized_keyword,
            source_type,
            channels.join(","),
            plugins_part
        );

        let hash = blake3::hash(canonical.as_bytes());
        CacheKey(hash.to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
