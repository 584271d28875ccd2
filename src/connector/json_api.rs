//! Configuration-driven connector for JSON search APIs
//!
//! Works against any endpoint that pages results with an offset and a limit.
//! Where fields live in a response is described by JSON pointers in the
//! source config, so one implementation covers many simple providers.
//!
//! Recognized options (all resolved through the job's `ConfigResolver`):
//!
//! | Option | Default | Meaning |
//! |--------|---------|---------|
//! | `base-url` | required | Search endpoint |
//! | `query-param` | `q` | Parameter carrying the search term |
//! | `offset-param` / `limit-param` | `offset` / `limit` | Paging parameters |
//! | `since-param` | `since` | Parameter carrying the lower time bound when tailing |
//! | `page-size` | 20 | Items requested per page |
//! | `max-pages` | 5 | Pages fetched per unit of work |
//! | `items-pointer` | `""` | Location of the result array |
//! | `id-pointer`, `title-pointer`, ... | `/id`, `/title`, ... | Field locations inside an item |
//! | `detail-url` | none | Detail endpoint; `{id}` is replaced by the external id |
//! | `detail-pointer` | `""` | Location of the item inside a detail response |

use crate::config::ConfigResolver;
use crate::connector::{
    Connector, ConnectorError, ConnectorResult, Extracted, RawItem, SearchContext,
};
use crate::state::CursorPhase;
use crate::storage::NormalizedDocument;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::debug;

const DEFAULT_PAGE_SIZE: u64 = 20;
const DEFAULT_MAX_PAGES: u64 = 5;

/// Generic offset-paged JSON API connector
#[derive(Debug, Clone)]
pub struct JsonApiConnector {
    client: Client,
}

impl JsonApiConnector {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetches one page and maps its items into the canonical payload shape
    async fn fetch_page(
        &self,
        ctx: &SearchContext<'_>,
        term: &str,
        offset: u64,
        page_size: u64,
        since: Option<DateTime<Utc>>,
    ) -> ConnectorResult<Vec<RawItem>> {
        let resolver = ctx.resolver;
        let base_url = resolver
            .str("base-url")
            .ok_or_else(|| ConnectorError::MissingOption("base-url".to_string()))?;

        let mut params: Vec<(String, String)> = vec![
            (
                resolver.str_or("offset-param", "offset").to_string(),
                offset.to_string(),
            ),
            (
                resolver.str_or("limit-param", "limit").to_string(),
                page_size.to_string(),
            ),
        ];
        if !ctx.is_wholesale() {
            params.push((resolver.str_or("query-param", "q").to_string(), term.to_string()));
        }
        if let Some(since) = since {
            params.push((
                resolver.str_or("since-param", "since").to_string(),
                since.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }

        ctx.throttle().await;
        let body = self.get_json(base_url, &params).await?;

        let items_pointer = resolver.str_or("items-pointer", "");
        let items = body
            .pointer(items_pointer)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ConnectorError::Payload(format!("no result array at '{}'", items_pointer))
            })?;

        Ok(items.iter().map(|item| map_item(resolver, item)).collect())
    }

    async fn get_json(&self, url: &str, params: &[(String, String)]) -> ConnectorResult<Value> {
        let response = self.client.get(url).query(params).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectorError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl Connector for JsonApiConnector {
    fn kind(&self) -> &'static str {
        "json_api"
    }

    async fn search(&self, ctx: &SearchContext<'_>, term: &str) -> ConnectorResult<Vec<RawItem>> {
        let page_size = ctx.resolver.u64_or("page-size", DEFAULT_PAGE_SIZE).max(1);
        let max_pages = ctx.resolver.u64_or("max-pages", DEFAULT_MAX_PAGES);
        let phase = ctx.cursor.phase()?;

        let mut items = Vec::new();
        match phase {
            CursorPhase::Backfilling { offset, .. } => {
                let mut offset = offset;
                for _ in 0..max_pages {
                    let page = self.fetch_page(ctx, term, offset, page_size, None).await?;
                    let count = page.len() as u64;
                    offset += count;

                    record_newest(ctx, &page)?;
                    ctx.cursor.advance_offset(offset)?;
                    items.extend(page);

                    if count < page_size {
                        debug!("Backfill of '{}' exhausted at offset {}", term, offset);
                        ctx.cursor.mark_exhausted()?;
                        break;
                    }
                }
            }
            CursorPhase::Tailing { newest_seen } => {
                let since = match (ctx.since, newest_seen) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
                let mut offset = 0;
                for _ in 0..max_pages {
                    let page = self.fetch_page(ctx, term, offset, page_size, since).await?;
                    let count = page.len() as u64;
                    offset += count;

                    record_newest(ctx, &page)?;
                    items.extend(page);

                    if count < page_size {
                        break;
                    }
                }
            }
        }

        Ok(items)
    }

    async fn fetch_details(
        &self,
        ctx: &SearchContext<'_>,
        external_id: &str,
    ) -> ConnectorResult<Option<RawItem>> {
        let Some(template) = ctx.resolver.str("detail-url") else {
            return Ok(None);
        };
        let url = template.replace("{id}", external_id);

        ctx.throttle().await;
        let body = self.get_json(&url, &[]).await?;

        let pointer = ctx.resolver.str_or("detail-pointer", "");
        let item = body.pointer(pointer).ok_or_else(|| {
            ConnectorError::Payload(format!("no detail item at '{}'", pointer))
        })?;

        let mut detailed = map_item(ctx.resolver, item);
        if detailed.external_id.is_empty() {
            detailed.external_id = external_id.to_string();
            if let Value::Object(fields) = &mut detailed.payload {
                fields.insert("id".to_string(), Value::String(external_id.to_string()));
            }
        }
        Ok(Some(detailed))
    }

    fn extract(&self, raw: &RawItem) -> ConnectorResult<Extracted> {
        let payload = raw
            .payload
            .as_object()
            .ok_or_else(|| ConnectorError::Payload("item is not an object".to_string()))?;

        let external_id = text(payload.get("id"))
            .ok_or_else(|| ConnectorError::MissingField("id".to_string()))?;
        let title = text(payload.get("title"))
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ConnectorError::MissingField("title".to_string()))?;

        let source_updated_at = match text(payload.get("updated_at")) {
            Some(raw_ts) => Some(parse_timestamp(&raw_ts).ok_or_else(|| {
                ConnectorError::Payload(format!("unparseable timestamp '{}'", raw_ts))
            })?),
            None => None,
        };

        let metadata = payload
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        Ok(Extracted {
            document: NormalizedDocument {
                external_id,
                url: text(payload.get("url")),
                title,
                content: text(payload.get("content")),
                summary: text(payload.get("summary")),
                metadata,
                relevance_score: payload.get("relevance").and_then(Value::as_f64),
            },
            source_updated_at,
        })
    }
}

/// Pulls configured fields out of a provider item into the canonical shape
fn map_item(resolver: &ConfigResolver, item: &Value) -> RawItem {
    let field = |option: &str, default: &str| -> Value {
        let pointer = resolver.str_or(option, default);
        if pointer.is_empty() && !default.is_empty() {
            return Value::Null;
        }
        item.pointer(pointer).cloned().unwrap_or(Value::Null)
    };

    let id = field("id-pointer", "/id");
    let external_id = text(Some(&id)).unwrap_or_default();

    let mut payload = Map::new();
    payload.insert("id".to_string(), id);
    payload.insert("title".to_string(), field("title-pointer", "/title"));
    payload.insert("url".to_string(), field("url-pointer", "/url"));
    payload.insert("content".to_string(), field("content-pointer", "/content"));
    payload.insert("summary".to_string(), field("summary-pointer", "/summary"));
    payload.insert(
        "updated_at".to_string(),
        field("updated-at-pointer", "/updated_at"),
    );
    payload.insert(
        "relevance".to_string(),
        resolver
            .str("relevance-pointer")
            .and_then(|p| item.pointer(p).cloned())
            .unwrap_or(Value::Null),
    );
    payload.insert(
        "metadata".to_string(),
        resolver
            .str("metadata-pointer")
            .and_then(|p| item.pointer(p).cloned())
            .unwrap_or_else(|| json!({})),
    );

    RawItem::new(external_id, Value::Object(payload))
}

/// Records the newest source timestamp of a page in the cursor
fn record_newest(ctx: &SearchContext<'_>, page: &[RawItem]) -> ConnectorResult<()> {
    let newest = page
        .iter()
        .filter_map(|item| text(item.payload.get("updated_at")))
        .filter_map(|raw| parse_timestamp(&raw))
        .max();

    if let Some(newest) = newest {
        ctx.cursor.record_newest_seen(newest)?;
    }
    Ok(())
}

/// Renders strings and numbers as text; anything else is absent
fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or a bare date (midnight UTC)
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
