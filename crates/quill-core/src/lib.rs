//! Core domain model for Quill content sync and serving.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "quill-core";

/// Raw content item as returned by the external content API.
///
/// Held transiently during a sync run; never persisted in this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    #[serde(default)]
    pub properties: JsonValue,
    #[serde(default)]
    pub cover: Option<CoverRef>,
    pub created_time: DateTime<Utc>,
}

/// Cover reference in one of the two shapes the content API emits:
/// an externally-hosted URL or a file hosted by the API itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoverRef {
    External { external: CoverUrl },
    File { file: CoverUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverUrl {
    pub url: String,
}

impl CoverRef {
    pub fn url(&self) -> &str {
        match self {
            CoverRef::External { external } => &external.url,
            CoverRef::File { file } => &file.url,
        }
    }
}

/// Canonical internal representation of a post, produced by the normalizer
/// and discarded once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPost {
    /// Stable external identifier; the upsert key.
    pub id: String,
    pub title: String,
    pub slug: String,
    pub tags: Vec<String>,
    /// Raw markdown body.
    pub body: String,
    pub cover_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Publication status of a stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Draft,
    Review,
    Published,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Draft => "draft",
            RowStatus::Review => "review",
            RowStatus::Published => "published",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(RowStatus::Draft),
            "review" => Some(RowStatus::Review),
            "published" => Some(RowStatus::Published),
            _ => None,
        }
    }
}

/// The on-disk relational row. Mutated only by the sync writer; the serving
/// application treats it as read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedRow {
    pub id: String,
    pub slug: String,
    pub title: String,
    /// Gzip-compressed, base64-encoded body. Decoding must reproduce the
    /// normalized body byte-for-byte.
    pub content_base64: String,
    /// Tag list serialized as a JSON array string.
    pub tags_json: String,
    pub cover_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub status: RowStatus,
    pub canonical_url: Option<String>,
}

/// An image moved from source hosting to durable object storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelocatedAsset {
    pub source_url: String,
    /// Hex sha256 of the raw bytes.
    pub content_hash: String,
    /// Hash-derived key; identical bytes always map to the same key.
    pub storage_key: String,
    pub public_url: String,
}

/// Derive a URL-safe slug from a title: lowercased, with every run of
/// non-alphanumeric characters collapsed to a single `-` and leading/trailing
/// separators stripped. Non-ASCII letters (e.g. Hangul) are kept.
///
/// Collisions between similar titles are not resolved; last write wins.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_separator = false;
    for ch in title.chars() {
        if ch.is_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('-');
            }
            pending_separator = false;
            for lower in ch.to_lowercase() {
                slug.push(lower);
            }
        } else {
            pending_separator = true;
        }
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_is_deterministic() {
        assert_eq!(slugify("My Trip"), slugify("My Trip"));
        assert_eq!(slugify("My Trip"), "my-trip");
    }

    #[test]
    fn slug_collapses_runs_and_trims_separators() {
        assert_eq!(slugify("  Hello,   World!  "), "hello-world");
        assert_eq!(slugify("--a--b--"), "a-b");
        assert_eq!(slugify("Tokyo 2024 (day 1)"), "tokyo-2024-day-1");
    }

    #[test]
    fn slug_keeps_non_ascii_letters() {
        assert_eq!(slugify("도쿄 여행"), "도쿄-여행");
        assert_eq!(slugify("일본/오사카 먹방"), "일본-오사카-먹방");
    }

    #[test]
    fn slug_of_symbol_only_title_is_empty() {
        assert_eq!(slugify("!!!"), "");
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn slug_never_has_leading_trailing_or_doubled_separators() {
        for title in ["?My Trip?", "a  -  b", "한국, 제주도!", "X", "#1 best"] {
            let slug = slugify(title);
            assert!(!slug.starts_with('-'), "leading separator in {slug:?}");
            assert!(!slug.ends_with('-'), "trailing separator in {slug:?}");
            assert!(!slug.contains("--"), "doubled separator in {slug:?}");
        }
    }

    #[test]
    fn cover_ref_extracts_url_from_both_shapes() {
        let external = CoverRef::External {
            external: CoverUrl {
                url: "https://img.example/x.jpg".into(),
            },
        };
        let file = CoverRef::File {
            file: CoverUrl {
                url: "https://files.example/y.png".into(),
            },
        };
        assert_eq!(external.url(), "https://img.example/x.jpg");
        assert_eq!(file.url(), "https://files.example/y.png");
    }

    #[test]
    fn cover_ref_deserializes_from_api_shape() {
        let value: CoverRef = serde_json::from_value(serde_json::json!({
            "type": "external",
            "external": { "url": "https://img.example/x.jpg" }
        }))
        .expect("cover shape");
        assert_eq!(value.url(), "https://img.example/x.jpg");
    }

    #[test]
    fn row_status_round_trips_through_text() {
        for status in [RowStatus::Draft, RowStatus::Review, RowStatus::Published] {
            assert_eq!(RowStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RowStatus::parse("archived"), None);
    }
}
