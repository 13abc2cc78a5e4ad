//! Content-source client + record normalizer for the external content API.

use anyhow::Context;
use async_trait::async_trait;
use quill_core::{slugify, NormalizedPost, SourceRecord};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "quill-notion";

/// API revision pinned by the sync scripts.
pub const API_VERSION: &str = "2022-06-28";

const DEFAULT_BASE_URL: &str = "https://api.notion.com";
const PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("content api status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// One page of records plus the continuation cursor, or `None` when the
/// source has no more pages.
#[derive(Debug, Clone)]
pub struct RecordPage {
    pub records: Vec<SourceRecord>,
    pub next_cursor: Option<String>,
}

/// Paginated content source. The listing call is fatal on failure; the
/// per-record body fetch is record-skippable and handled by the caller.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<RecordPage, SourceError>;

    /// Fetch and render the markdown body for one record.
    async fn fetch_body(&self, record_id: &str) -> Result<String, SourceError>;
}

/// Loop fetch → append → advance-cursor until the source reports no more
/// pages. Content volume is small, so everything is accumulated in memory.
pub async fn fetch_all_records(
    source: &dyn ContentSource,
    start_cursor: Option<String>,
) -> Result<Vec<SourceRecord>, SourceError> {
    let mut records = Vec::new();
    let mut cursor = start_cursor;
    loop {
        let page = source.fetch_page(cursor.as_deref()).await?;
        records.extend(page.records);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(records)
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<SourceRecord>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockChildrenResponse {
    #[serde(default)]
    results: Vec<JsonValue>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// HTTP client for the hosted content API.
#[derive(Debug, Clone)]
pub struct NotionClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    database_id: String,
}

impl NotionClient {
    pub fn new(token: &str, database_id: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("building content api client")?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.to_string(),
            database_id: database_id.to_string(),
        })
    }

    /// Point the client at a different host. Used by tests and self-hosted
    /// proxies.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn fetch_block_children(
        &self,
        block_id: &str,
        cursor: Option<&str>,
    ) -> Result<BlockChildrenResponse, SourceError> {
        let mut url = format!(
            "{}/v1/blocks/{}/children?page_size={}",
            self.base_url, block_id, PAGE_SIZE
        );
        if let Some(cursor) = cursor {
            url.push_str("&start_cursor=");
            url.push_str(cursor);
        }
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .header("Notion-Version", API_VERSION)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<BlockChildrenResponse>().await?)
    }
}

#[async_trait]
impl ContentSource for NotionClient {
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<RecordPage, SourceError> {
        let url = format!(
            "{}/v1/databases/{}/query",
            self.base_url, self.database_id
        );
        let mut body = serde_json::json!({ "page_size": PAGE_SIZE });
        if let Some(cursor) = cursor {
            body["start_cursor"] = JsonValue::String(cursor.to_string());
        }

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .header("Notion-Version", API_VERSION)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed = response.json::<QueryResponse>().await?;
        let next_cursor = if parsed.has_more {
            parsed.next_cursor
        } else {
            None
        };
        Ok(RecordPage {
            records: parsed.results,
            next_cursor,
        })
    }

    async fn fetch_body(&self, record_id: &str) -> Result<String, SourceError> {
        let mut blocks = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .fetch_block_children(record_id, cursor.as_deref())
                .await?;
            blocks.extend(page.results);
            if !page.has_more {
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(render_blocks_markdown(&blocks))
    }
}

/// Concatenate the `plain_text` fragments of a rich-text array.
fn plain_text_of(rich_text: &JsonValue) -> String {
    let Some(items) = rich_text.as_array() else {
        return String::new();
    };
    items
        .iter()
        .filter_map(|item| item.get("plain_text").and_then(JsonValue::as_str))
        .collect::<String>()
}

fn image_url_of(image: &JsonValue) -> Option<&str> {
    image
        .get("external")
        .and_then(|v| v.get("url"))
        .or_else(|| image.get("file").and_then(|v| v.get("url")))
        .and_then(JsonValue::as_str)
}

/// Render the source's block representation to markdown. Stands in for the
/// original's markdown-rendering collaborator; unknown block types are
/// skipped rather than erroring.
pub fn render_blocks_markdown(blocks: &[JsonValue]) -> String {
    let mut lines: Vec<String> = Vec::new();
    for block in blocks {
        let Some(block_type) = block.get("type").and_then(JsonValue::as_str) else {
            continue;
        };
        let payload = &block[block_type];
        let rendered = match block_type {
            "paragraph" => Some(plain_text_of(&payload["rich_text"])),
            "heading_1" => Some(format!("# {}", plain_text_of(&payload["rich_text"]))),
            "heading_2" => Some(format!("## {}", plain_text_of(&payload["rich_text"]))),
            "heading_3" => Some(format!("### {}", plain_text_of(&payload["rich_text"]))),
            "bulleted_list_item" => Some(format!("- {}", plain_text_of(&payload["rich_text"]))),
            "numbered_list_item" => Some(format!("1. {}", plain_text_of(&payload["rich_text"]))),
            "quote" => Some(format!("> {}", plain_text_of(&payload["rich_text"]))),
            "code" => {
                let language = payload
                    .get("language")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default();
                Some(format!(
                    "```{}\n{}\n```",
                    language,
                    plain_text_of(&payload["rich_text"])
                ))
            }
            "image" => {
                let caption = plain_text_of(&payload["caption"]);
                image_url_of(payload).map(|url| format!("![{caption}]({url})"))
            }
            "divider" => Some("---".to_string()),
            _ => None,
        };
        if let Some(rendered) = rendered {
            lines.push(rendered);
        }
    }
    lines.join("\n\n")
}

/// First property whose type marks it as the title field.
pub fn extract_title(properties: &JsonValue) -> Option<String> {
    let object = properties.as_object()?;
    for property in object.values() {
        if property.get("type").and_then(JsonValue::as_str) != Some("title") {
            continue;
        }
        let text = plain_text_of(&property["title"]);
        if !text.is_empty() {
            return Some(text);
        }
    }
    None
}

/// All values across every multi-valued categorical property, in property
/// order, not just the first matching property.
pub fn extract_tags(properties: &JsonValue) -> Vec<String> {
    let Some(object) = properties.as_object() else {
        return Vec::new();
    };
    let mut tags = Vec::new();
    for property in object.values() {
        if property.get("type").and_then(JsonValue::as_str) != Some("multi_select") {
            continue;
        }
        if let Some(options) = property["multi_select"].as_array() {
            tags.extend(
                options
                    .iter()
                    .filter_map(|option| option.get("name").and_then(JsonValue::as_str))
                    .map(ToString::to_string),
            );
        }
    }
    tags
}

pub fn extract_cover_url(record: &SourceRecord) -> Option<String> {
    record.cover.as_ref().map(|cover| cover.url().to_string())
}

/// Map a source record plus its rendered body to the canonical post shape.
/// Pure function of its inputs; the body is rendered by the caller.
pub fn normalize_record(record: &SourceRecord, body: String) -> NormalizedPost {
    let title = extract_title(&record.properties).unwrap_or_else(|| "Untitled".to_string());
    let slug = slugify(&title);
    NormalizedPost {
        id: record.id.clone(),
        slug,
        title,
        tags: extract_tags(&record.properties),
        body,
        cover_url: extract_cover_url(record),
        created_at: record.created_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn record(properties: JsonValue, cover: JsonValue) -> SourceRecord {
        let mut value = json!({
            "id": "abc123",
            "properties": properties,
            "created_time": "2025-06-01T09:30:00Z",
        });
        if !cover.is_null() {
            value["cover"] = cover;
        }
        serde_json::from_value(value).expect("record fixture")
    }

    #[test]
    fn normalizes_title_slug_and_external_cover() {
        let record = record(
            json!({ "title": { "type": "title", "title": [{ "plain_text": "My Trip" }] } }),
            json!({ "type": "external", "external": { "url": "https://img.example/x.jpg" } }),
        );
        let post = normalize_record(&record, String::new());
        assert_eq!(post.id, "abc123");
        assert_eq!(post.title, "My Trip");
        assert_eq!(post.slug, "my-trip");
        assert_eq!(post.cover_url.as_deref(), Some("https://img.example/x.jpg"));
        assert_eq!(
            post.created_at,
            Utc.with_ymd_and_hms(2025, 6, 1, 9, 30, 0).single().unwrap()
        );
    }

    #[test]
    fn falls_back_to_untitled_when_no_title_property() {
        let record = record(
            json!({ "note": { "type": "rich_text", "rich_text": [] } }),
            JsonValue::Null,
        );
        let post = normalize_record(&record, String::new());
        assert_eq!(post.title, "Untitled");
        assert_eq!(post.slug, "untitled");
    }

    #[test]
    fn skips_title_property_with_empty_array() {
        let properties = json!({
            "empty": { "type": "title", "title": [] },
            "real": { "type": "title", "title": [{ "plain_text": "Found" }] },
        });
        assert_eq!(extract_title(&properties).as_deref(), Some("Found"));
    }

    #[test]
    fn concatenates_tags_across_all_multi_select_properties() {
        let properties = json!({
            "categories": {
                "type": "multi_select",
                "multi_select": [{ "name": "spot" }, { "name": "travel" }]
            },
            "ignored": { "type": "select", "select": { "name": "nope" } },
            "moods": {
                "type": "multi_select",
                "multi_select": [{ "name": "lifelog" }]
            },
        });
        assert_eq!(extract_tags(&properties), vec!["spot", "travel", "lifelog"]);
    }

    #[test]
    fn file_hosted_cover_is_recognized() {
        let record = record(
            json!({}),
            json!({ "type": "file", "file": { "url": "https://files.example/c.png" } }),
        );
        assert_eq!(
            extract_cover_url(&record).as_deref(),
            Some("https://files.example/c.png")
        );
    }

    #[test]
    fn renders_common_block_types() {
        let blocks = vec![
            json!({ "type": "heading_1", "heading_1": { "rich_text": [{ "plain_text": "Day 1" }] } }),
            json!({ "type": "paragraph", "paragraph": { "rich_text": [{ "plain_text": "We " }, { "plain_text": "landed." }] } }),
            json!({ "type": "bulleted_list_item", "bulleted_list_item": { "rich_text": [{ "plain_text": "ramen" }] } }),
            json!({ "type": "image", "image": { "caption": [], "external": { "url": "https://img.example/a.jpg" } } }),
            json!({ "type": "code", "code": { "language": "sql", "rich_text": [{ "plain_text": "SELECT 1;" }] } }),
            json!({ "type": "unsupported_widget", "unsupported_widget": {} }),
        ];
        let markdown = render_blocks_markdown(&blocks);
        assert_eq!(
            markdown,
            "# Day 1\n\nWe landed.\n\n- ramen\n\n![](https://img.example/a.jpg)\n\n```sql\nSELECT 1;\n```"
        );
    }

    #[test]
    fn renders_internally_hosted_image_blocks() {
        let blocks = vec![json!({
            "type": "image",
            "image": { "caption": [{ "plain_text": "cover" }], "file": { "url": "https://files.example/b.png" } }
        })];
        assert_eq!(
            render_blocks_markdown(&blocks),
            "![cover](https://files.example/b.png)"
        );
    }

    struct PagedSource {
        pages: Vec<RecordPage>,
        calls: std::sync::Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl ContentSource for PagedSource {
        async fn fetch_page(&self, cursor: Option<&str>) -> Result<RecordPage, SourceError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(cursor.map(ToString::to_string));
            let index = calls.len() - 1;
            Ok(self.pages[index].clone())
        }

        async fn fetch_body(&self, _record_id: &str) -> Result<String, SourceError> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn fetch_all_follows_cursors_until_exhausted() {
        let mk = |id: &str| {
            serde_json::from_value::<SourceRecord>(json!({
                "id": id,
                "properties": {},
                "created_time": "2025-01-01T00:00:00Z",
            }))
            .unwrap()
        };
        let source = PagedSource {
            pages: vec![
                RecordPage {
                    records: vec![mk("a"), mk("b")],
                    next_cursor: Some("cur-1".into()),
                },
                RecordPage {
                    records: vec![mk("c")],
                    next_cursor: None,
                },
            ],
            calls: std::sync::Mutex::new(Vec::new()),
        };

        let records = fetch_all_records(&source, None).await.expect("fetch all");
        assert_eq!(
            records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            *source.calls.lock().unwrap(),
            vec![None, Some("cur-1".to_string())]
        );
    }
}
