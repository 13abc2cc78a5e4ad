//! Read-only JSON API over the synced posts table.

use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use quill_core::{EncodedRow, RowStatus};
use quill_storage::decode_body;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::net::TcpListener;
use tracing::error;

pub const CRATE_NAME: &str = "quill-web";

/// Edge caches may hold list/detail responses for a few minutes.
const CACHE_CONTROL_VALUE: &str = "public, max-age=300";

/// Serving shape of a post: body decoded, tags parsed.
#[derive(Debug, Clone, Serialize)]
pub struct PostView {
    pub id: String,
    pub slug: String,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub cover_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub status: RowStatus,
    pub canonical_url: Option<String>,
}

/// Tags are stored as a JSON array string; anything unparsable degrades to an
/// empty list rather than failing the request.
pub fn parse_tags(tags_json: &str) -> Vec<String> {
    match serde_json::from_str::<JsonValue>(tags_json) {
        Ok(JsonValue::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                JsonValue::String(tag) => Some(tag),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Decode a stored row for serving. A body that fails to decode is a backend
/// error, surfaced as a structured 500.
pub fn row_to_view(row: &EncodedRow) -> anyhow::Result<PostView> {
    let content = decode_body(&row.content_base64)
        .with_context(|| format!("decoding body of post {}", row.id))?;
    Ok(PostView {
        id: row.id.clone(),
        slug: row.slug.clone(),
        title: row.title.clone(),
        content,
        tags: parse_tags(&row.tags_json),
        cover_url: row.cover_url.clone(),
        created_at: row.created_at,
        published_at: row.published_at,
        status: row.status,
        canonical_url: row.canonical_url.clone(),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ListFilter {
    /// Single tag/category filter.
    pub tag: Option<String>,
    /// Title search.
    pub q: Option<String>,
}

/// Read seam over the posts table.
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn list(&self, filter: &ListFilter) -> anyhow::Result<Vec<EncodedRow>>;

    /// Fetch one row by slug, falling back to the identifier.
    async fn get(&self, key: &str) -> anyhow::Result<Option<EncodedRow>>;
}

const POST_COLUMNS: &str = "id, slug, title, content_base64, tags, cover_url, \
                            created_at, published_at, status, canonical_url";

pub struct PgPostStore {
    pool: PgPool,
}

impl PgPostStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_row(row: &PgRow) -> anyhow::Result<EncodedRow> {
    let status_text: String = row.try_get("status")?;
    let Some(status) = RowStatus::parse(&status_text) else {
        bail!("unknown post status {status_text:?}");
    };
    Ok(EncodedRow {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        title: row.try_get("title")?,
        content_base64: row.try_get("content_base64")?,
        tags_json: row.try_get("tags")?,
        cover_url: row.try_get("cover_url")?,
        created_at: row.try_get("created_at")?,
        published_at: row.try_get("published_at")?,
        status,
        canonical_url: row.try_get("canonical_url")?,
    })
}

#[async_trait]
impl PostStore for PgPostStore {
    async fn list(&self, filter: &ListFilter) -> anyhow::Result<Vec<EncodedRow>> {
        let query = format!(
            r#"
            SELECT {POST_COLUMNS}
              FROM posts
             WHERE ($1::text IS NULL OR tags LIKE '%"' || $1 || '"%')
               AND ($2::text IS NULL OR title ILIKE '%' || $2 || '%')
             ORDER BY created_at DESC
            "#
        );
        let rows = sqlx::query(&query)
            .bind(filter.tag.as_deref())
            .bind(filter.q.as_deref())
            .fetch_all(&self.pool)
            .await
            .context("listing posts")?;
        rows.iter().map(map_row).collect()
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<EncodedRow>> {
        let by_slug = format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE slug = $1 \
             ORDER BY created_at DESC LIMIT 1"
        );
        if let Some(row) = sqlx::query(&by_slug)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("fetching post by slug")?
        {
            return Ok(Some(map_row(&row)?));
        }

        let by_id = format!("SELECT {POST_COLUMNS} FROM posts WHERE id = $1 LIMIT 1");
        let row = sqlx::query(&by_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("fetching post by id")?;
        row.as_ref().map(map_row).transpose()
    }
}

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn PostStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn PostStore>) -> Self {
        Self { store }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/posts", get(list_posts_handler))
        .route("/api/posts/{key}", get(post_detail_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("QUILL_WEB_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let database_url =
        std::env::var("DATABASE_URL").context("missing required environment variable DATABASE_URL")?;
    let pool = PgPool::connect(&database_url)
        .await
        .context("connecting to database")?;
    let state = AppState::new(Arc::new(PgPostStore::new(pool)));

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn list_posts_handler(
    State(state): State<AppState>,
    Query(filter): Query<ListFilter>,
) -> Response {
    match state.store.list(&filter).await {
        Ok(rows) => match rows.iter().map(row_to_view).collect::<anyhow::Result<Vec<_>>>() {
            Ok(posts) => json_cached(serde_json::json!({ "posts": posts })),
            Err(err) => server_error(err),
        },
        Err(err) => server_error(err),
    }
}

async fn post_detail_handler(
    State(state): State<AppState>,
    AxumPath(key): AxumPath<String>,
) -> Response {
    match state.store.get(&key).await {
        Ok(Some(row)) => match row_to_view(&row) {
            Ok(post) => json_cached(serde_json::json!({ "post": post })),
            Err(err) => server_error(err),
        },
        Ok(None) => not_found(),
        Err(err) => server_error(err),
    }
}

fn json_cached(body: JsonValue) -> Response {
    let mut response = Json(body).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static(CACHE_CONTROL_VALUE),
    );
    response
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "post not found" })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "error": "failed to fetch posts",
            "message": err.to_string(),
        })),
    )
        .into_response()
}
