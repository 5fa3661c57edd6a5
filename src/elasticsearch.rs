use async_trait::async_trait;
use elasticsearch::auth::Credentials;
use elasticsearch::cert::CertificateValidation;
use elasticsearch::http::headers::HeaderMap;
use elasticsearch::http::transport::{SingleNodeConnectionPool, TransportBuilder};
use elasticsearch::http::Method;
use elasticsearch::{Elasticsearch, SearchParts};
use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument};
use url::Url;

use crate::compression::Compression;
use crate::split::{Step, TimeChunk};
use crate::stats::ChunkStats;
use crate::time::format_instant;

/// Name of the histogram aggregation added to every chunk query.
pub const STEPS_AGGREGATION: &str = "steps";

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Runs the query for a single chunk and returns the raw response body.
#[async_trait]
pub trait ChunkQuery: Send + Sync {
    async fn query_chunk(&self, chunk: &TimeChunk, step: Step) -> anyhow::Result<String>;
}

#[derive(Deserialize, Debug)]
pub struct ClusterInfo {
    pub version: ClusterVersion,
}

#[derive(Deserialize, Debug)]
pub struct ClusterVersion {
    pub number: String,
    // Only OpenSearch reports this.
    pub distribution: Option<String>,
}

#[derive(Deserialize, Debug)]
struct HistogramResponse<'a> {
    #[serde(borrow)]
    aggregations: Aggregations<'a>,
}

#[derive(Deserialize, Debug)]
struct Aggregations<'a> {
    #[serde(borrow)]
    steps: StepBuckets<'a>,
}

#[derive(Deserialize, Debug)]
struct StepBuckets<'a> {
    #[serde(borrow)]
    buckets: Vec<&'a RawValue>,
}

/// Builds the search body for one chunk.
///
/// Anything in `query` is carried over. Its `query` clause becomes a filter
/// next to the chunk's time range, and its `aggs` are nested under the step
/// histogram.
pub fn search_body(
    query: &Map<String, Value>,
    timestamp_field: &str,
    chunk: &TimeChunk,
    step: Step,
) -> Value {
    let mut body = query.clone();
    let user_query = body.remove("query");
    let user_aggs = body.remove("aggs");

    let mut filters: Vec<Value> = user_query.into_iter().collect();
    filters.push(json!({
        "range": {
            timestamp_field: {
                "gte": chunk.start,
                "lt": chunk.document_end(step),
                "format": "epoch_millis",
            }
        }
    }));

    let mut histogram = json!({
        "date_histogram": {
            "field": timestamp_field,
            "fixed_interval": format!("{}ms", step.millis()),
            "min_doc_count": 0,
            "extended_bounds": {"min": chunk.start, "max": chunk.end},
        }
    });
    if let Some(aggs) = user_aggs {
        histogram["aggs"] = aggs;
    }

    body.insert("size".to_string(), json!(0));
    body.insert("query".to_string(), json!({"bool": {"filter": filters}}));
    body.insert("aggs".to_string(), json!({ STEPS_AGGREGATION: histogram }));
    Value::Object(body)
}

/// Writes each step bucket of a chunk response as one JSON line through the encoder.
pub fn encode_buckets(
    compression: Compression,
    body: String,
    output_buffer: Vec<u8>,
) -> anyhow::Result<(ChunkStats, Vec<u8>)> {
    let json_parse_start = Instant::now();
    let response: HistogramResponse = serde_json::from_str(&body).with_context(|| {
        let end_item = body.len().min(500);
        format!(
            "Error deserializing response. First 500 bytes: {}",
            body.get(0..end_item).unwrap_or(&body)
        )
    })?;
    let json_duration = json_parse_start.elapsed();

    let compression_start = Instant::now();
    let buckets = response.aggregations.steps.buckets;
    let mut encoder = compression.encoder(output_buffer)?;
    for bucket in &buckets {
        encoder.write_all(bucket.get().as_bytes())?;
        encoder.write_all(b"\n")?;
    }
    let compressed_bytes = encoder.finish()?;

    let stats = ChunkStats {
        json: json_duration,
        compression: compression_start.elapsed(),
        buckets: buckets.len() as u64,
        response_bytes: body.len() as u64,
        compressed_bytes: compressed_bytes.len() as u64,
        ..Default::default()
    };
    Ok((stats, compressed_bytes))
}

pub struct ElasticsearchClient {
    client: Elasticsearch,
    index: String,
    timestamp_field: String,
    query: Map<String, Value>,
}

impl ElasticsearchClient {
    pub async fn new(
        url: Url,
        creds: Credentials,
        index: &str,
        timestamp_field: &str,
        query: Map<String, Value>,
    ) -> anyhow::Result<Self> {
        let conn_pool = SingleNodeConnectionPool::new(url);
        let transport = TransportBuilder::new(conn_pool)
            .auth(creds)
            .cert_validation(CertificateValidation::None)
            .disable_proxy()
            .build()?;
        let client = Elasticsearch::new(transport);

        let cluster_info: ClusterInfo = client
            .send::<(), ()>(Method::Get, "/", HeaderMap::new(), None, None, None)
            .await
            .context("Error reaching cluster")?
            .json()
            .await
            .context("Error reading cluster info")?;
        info!(
            "Connected to {} {}",
            cluster_info
                .version
                .distribution
                .as_deref()
                .unwrap_or("elasticsearch"),
            cluster_info.version.number
        );

        Ok(ElasticsearchClient {
            client,
            index: index.to_string(),
            timestamp_field: timestamp_field.to_string(),
            query,
        })
    }
}

#[async_trait]
impl ChunkQuery for ElasticsearchClient {
    #[instrument(skip_all, level = "debug")]
    async fn query_chunk(&self, chunk: &TimeChunk, step: Step) -> anyhow::Result<String> {
        let body = search_body(&self.query, &self.timestamp_field, chunk, step);
        debug!("Chunk: {:?}, Query: {}", chunk, body);

        let mut attempt = 0;
        let response = loop {
            attempt += 1;
            let result = self
                .client
                .search(SearchParts::Index(&[&self.index]))
                .allow_partial_search_results(false)
                .body(&body)
                .send()
                .await;
            match result {
                Ok(r) => break r,
                Err(e) => {
                    if attempt >= MAX_ATTEMPTS || e.is_json() {
                        // JSON errors are not recoverable
                        return Err(e.into());
                    }
                    error!(
                        "Attempt {attempt} for chunk {}..{} failed: {e}",
                        format_instant(chunk.start),
                        format_instant(chunk.end)
                    );
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        };

        let status = response.status_code();
        let text = response.text().await.context("Error reading content")?;
        if !status.is_success() {
            let end_item = text.len().min(500);
            bail!(
                "Search failed with status {status}: {}",
                text.get(0..end_item).unwrap_or(&text)
            );
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(ms: i64) -> Step {
        Step::new(ms).unwrap()
    }

    #[test]
    fn builds_range_and_histogram() {
        let chunk = TimeChunk {
            start: 20_000,
            end: 40_000,
        };
        let body = search_body(&Map::new(), "@timestamp", &chunk, step(10_000));

        assert_eq!(body["size"], 0);
        assert_eq!(
            body["query"]["bool"]["filter"],
            json!([{"range": {"@timestamp": {
                "gte": 20_000,
                "lt": 50_000,
                "format": "epoch_millis",
            }}}])
        );
        let histogram = &body["aggs"][STEPS_AGGREGATION]["date_histogram"];
        assert_eq!(histogram["field"], "@timestamp");
        assert_eq!(histogram["fixed_interval"], "10000ms");
        assert_eq!(histogram["min_doc_count"], 0);
        assert_eq!(
            histogram["extended_bounds"],
            json!({"min": 20_000, "max": 40_000})
        );
    }

    #[test]
    fn merges_user_query() {
        let query: Map<String, Value> = serde_json::from_value(json!({
            "query": {"term": {"service": "api"}},
            "aggs": {"latency": {"avg": {"field": "latency_ms"}}},
            "runtime_mappings": {"x": {"type": "long"}},
            "size": 100,
        }))
        .unwrap();
        let chunk = TimeChunk { start: 0, end: 0 };
        let body = search_body(&query, "ts", &chunk, step(1_000));

        assert_eq!(body["size"], 0);
        assert_eq!(body["runtime_mappings"], query["runtime_mappings"]);
        let filters = body["query"]["bool"]["filter"].as_array().unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0], json!({"term": {"service": "api"}}));
        assert_eq!(filters[1]["range"]["ts"]["lt"], 1_000);
        assert_eq!(
            body["aggs"][STEPS_AGGREGATION]["aggs"],
            json!({"latency": {"avg": {"field": "latency_ms"}}})
        );
    }

    #[test]
    fn encodes_buckets_as_lines() {
        let response = r#"{
            "took": 3,
            "hits": {"total": {"value": 4}, "hits": []},
            "aggregations": {"steps": {"buckets": [
                {"key_as_string": "2022-02-06T14:10:20.000Z", "key": 1644156620000, "doc_count": 3},
                {"key_as_string": "2022-02-06T14:10:30.000Z", "key": 1644156630000, "doc_count": 0},
                {"key_as_string": "2022-02-06T14:10:40.000Z", "key": 1644156640000, "doc_count": 1}
            ]}}
        }"#;
        let (stats, output) =
            encode_buckets(Compression::None, response.to_string(), Vec::new()).unwrap();

        let lines: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["key"], 1_644_156_620_000_i64);
        assert_eq!(lines[2]["doc_count"], 1);
        assert_eq!(stats.buckets, 3);
        assert_eq!(stats.response_bytes, response.len() as u64);
    }

    #[test]
    fn reports_unexpected_responses() {
        let err = encode_buckets(
            Compression::None,
            r#"{"error": {"type": "index_not_found_exception"}}"#.to_string(),
            Vec::new(),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("index_not_found_exception"));
    }
}
