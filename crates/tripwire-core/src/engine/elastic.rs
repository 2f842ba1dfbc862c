//! Elasticsearch engine over the REST API.
//!
//! Talks plain JSON over HTTP with `reqwest`; no cluster-management features
//! are used. Connection failures are reported as [`Error::Unavailable`] so
//! callers can tell "engine down" apart from "engine rejected this request".

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{Client, Response, StatusCode, Url};
use serde_json::{Map, Value, json};

use super::{
    Aggregation, Bucket, FieldType, Hit, IndexEngine, IndexSchema, SearchQuery, SearchResult,
};
use crate::{Error, Result};

/// Longest engine error body kept in [`Error::Engine`].
const MAX_ERROR_BODY: usize = 512;

/// Configuration for the Elasticsearch engine.
#[derive(Debug, Clone)]
pub struct ElasticConfig {
    /// Base URL (e.g., "http://localhost:9200").
    pub url: String,

    /// Per-request timeout.
    pub timeout: Duration,

    /// Optional basic-auth credentials.
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            timeout: Duration::from_secs(10),
            username: None,
            password: None,
        }
    }
}

/// Elasticsearch-backed [`IndexEngine`].
#[derive(Debug, Clone)]
pub struct ElasticEngine {
    client: Client,
    base: Url,
    config: ElasticConfig,
}

impl ElasticEngine {
    /// Create a new engine handle. Does not contact the cluster.
    pub fn new(config: ElasticConfig) -> Result<Self> {
        let base = Url::parse(&config.url).map_err(|e| Error::InvalidField {
            field: "url",
            reason: format!("{}: {}", config.url, e),
        })?;
        if base.cannot_be_a_base() {
            return Err(Error::InvalidField {
                field: "url",
                reason: format!("{} cannot be used as a base URL", config.url),
            });
        }

        let client = Client::builder().timeout(config.timeout).build()?;

        tracing::info!(
            url = %config.url,
            timeout = ?config.timeout,
            "elasticsearch engine configured"
        );

        Ok(Self {
            client,
            base,
            config,
        })
    }

    /// Build `<base>/<segments...>` with each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.username {
            Some(user) => builder.basic_auth(user, self.config.password.as_deref()),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Response> {
        builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                Error::Unavailable(e.to_string())
            } else {
                Error::Http(e)
            }
        })
    }
}

/// Turn a non-success response into [`Error::Engine`].
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(Error::Engine {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl IndexEngine for ElasticEngine {
    async fn ping(&self) -> Result<()> {
        let response = self
            .send(self.request(reqwest::Method::GET, self.url(&[])))
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn ensure_index(&self, index: &str, schema: &IndexSchema) -> Result<bool> {
        let exists = self
            .send(self.request(reqwest::Method::HEAD, self.url(&[index])))
            .await?;

        match exists.status() {
            StatusCode::OK => {
                tracing::debug!(index, "index already exists");
                return Ok(false);
            }
            StatusCode::NOT_FOUND => {}
            _ => {
                check(exists).await?;
            }
        }

        let body = json!({ "mappings": schema_to_mappings(schema) });
        let response = self
            .send(self.request(reqwest::Method::PUT, self.url(&[index])).json(&body))
            .await?;

        match check(response).await {
            Ok(_) => {
                tracing::info!(index, "created index");
                Ok(true)
            }
            // Another process created it between HEAD and PUT.
            Err(Error::Engine { status: 400, body })
                if body.contains("resource_already_exists_exception") =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn upsert(&self, index: &str, id: Option<&str>, document: &Value) -> Result<String> {
        let builder = match id {
            Some(id) => self.request(reqwest::Method::PUT, self.url(&[index, "_doc", id])),
            None => self.request(reqwest::Method::POST, self.url(&[index, "_doc"])),
        };

        let response = check(self.send(builder.json(document)).await?).await?;
        let body: Value = response.json().await?;

        body.get("_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::UnexpectedResponse("index response without _id".to_string()))
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> Result<SearchResult> {
        let body = query_to_dsl(query);
        let response = self
            .send(
                self.request(reqwest::Method::POST, self.url(&[index, "_search"]))
                    .json(&body),
            )
            .await?;
        let body: Value = check(response).await?.json().await?;
        parse_search_response(query, &body)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Translation
// ═══════════════════════════════════════════════════════════════════════════

fn field_mapping(kind: &FieldType) -> Value {
    match kind {
        FieldType::Date => json!({ "type": "date" }),
        FieldType::Keyword => json!({ "type": "keyword" }),
        FieldType::Ip => json!({ "type": "ip" }),
        FieldType::Text => json!({ "type": "text" }),
        FieldType::GeoPoint => json!({ "type": "geo_point" }),
        FieldType::Object(fields) => json!({ "properties": properties(fields) }),
        FieldType::Nested(fields) => json!({ "type": "nested", "properties": properties(fields) }),
    }
}

fn properties(fields: &[super::Field]) -> Value {
    let map: Map<String, Value> = fields
        .iter()
        .map(|f| (f.name.clone(), field_mapping(&f.kind)))
        .collect();
    Value::Object(map)
}

/// Index mappings body for a schema.
pub(crate) fn schema_to_mappings(schema: &IndexSchema) -> Value {
    json!({ "properties": properties(&schema.fields) })
}

/// Render a duration as an Elasticsearch fixed interval (`1h`, `5m`, `30s`).
fn fixed_interval(interval: Duration) -> String {
    let secs = interval.as_secs().max(1);
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Query DSL body for a typed search.
pub(crate) fn query_to_dsl(query: &SearchQuery) -> Value {
    let mut body = Map::new();
    body.insert("size".to_string(), json!(query.size));
    body.insert("track_total_hits".to_string(), json!(true));

    if let Some(sort) = &query.sort {
        let order = if sort.descending { "desc" } else { "asc" };
        body.insert("sort".to_string(), json!([{ sort.field.as_str(): { "order": order } }]));
    }

    if !query.aggregations.is_empty() {
        let mut aggs = Map::new();
        for agg in &query.aggregations {
            let dsl = match agg {
                Aggregation::Terms { field, size, .. } => {
                    json!({ "terms": { "field": field, "size": size } })
                }
                Aggregation::DateHistogram {
                    name,
                    field,
                    interval,
                    since,
                } => {
                    let histogram = json!({
                        "date_histogram": {
                            "field": field,
                            "fixed_interval": fixed_interval(*interval),
                        }
                    });
                    match since {
                        Some(since) => json!({
                            "filter": {
                                "range": {
                                    field.as_str(): {
                                        "gte": since.to_rfc3339_opts(SecondsFormat::Millis, true)
                                    }
                                }
                            },
                            "aggs": { name.as_str(): histogram },
                        }),
                        None => histogram,
                    }
                }
            };
            aggs.insert(agg.name().to_string(), dsl);
        }
        body.insert("aggs".to_string(), Value::Object(aggs));
    }

    Value::Object(body)
}

/// Parse a `_search` response body.
pub(crate) fn parse_search_response(query: &SearchQuery, body: &Value) -> Result<SearchResult> {
    let hits_obj = body
        .get("hits")
        .ok_or_else(|| Error::UnexpectedResponse("search response without hits".to_string()))?;

    // `total` is an object on 7.x+ and a bare number on older clusters.
    let total = match hits_obj.get("total") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(obj) => obj.get("value").and_then(Value::as_u64).unwrap_or(0),
        None => 0,
    };

    let hits = hits_obj
        .get("hits")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .map(|hit| Hit {
                    id: hit
                        .get("_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    source: hit.get("_source").cloned().unwrap_or(Value::Null),
                })
                .collect()
        })
        .unwrap_or_default();

    let mut aggregations = HashMap::new();
    for agg in &query.aggregations {
        let name = agg.name();
        let mut node = body.get("aggregations").and_then(|a| a.get(name));
        if let Aggregation::DateHistogram { since: Some(_), .. } = agg {
            node = node.and_then(|n| n.get(name));
        }
        let buckets = match node.and_then(|n| n.get("buckets")) {
            Some(raw) => serde_json::from_value::<Vec<Bucket>>(raw.clone())?,
            None => Vec::new(),
        };
        aggregations.insert(name.to_string(), buckets);
    }

    Ok(SearchResult {
        total,
        hits,
        aggregations,
    })
}
