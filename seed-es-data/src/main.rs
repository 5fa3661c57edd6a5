use chrono::{DateTime, SecondsFormat};
use clap::Parser;
use elasticsearch::auth::Credentials;
use elasticsearch::cert::CertificateValidation;
use elasticsearch::http::transport::{SingleNodeConnectionPool, TransportBuilder};
use elasticsearch::http::StatusCode;
use elasticsearch::indices::{
    IndicesCreateParts, IndicesDeleteParts, IndicesExistsParts, IndicesRefreshParts,
};
use elasticsearch::{BulkParts, CountParts, Elasticsearch};
use futures_util::StreamExt;
use indicatif::ProgressBar;
use itertools::Itertools;
use serde_json::{json, Value};
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

const SERVICES: [&str; 4] = ["api", "worker", "scheduler", "gateway"];

#[derive(Parser)]
#[command(version, about = "Fill an index with timestamped metric documents", long_about = None)]
struct Cli {
    es_url: Url,
    index_name: String,

    /// First timestamp, in epoch milliseconds
    #[arg(long)]
    start: i64,

    /// Timestamps stop before this, in epoch milliseconds
    #[arg(long)]
    end: i64,

    #[arg(long, default_value = "@timestamp")]
    timestamp_field: String,

    #[arg(long, default_value = "100000")]
    count: usize,

    #[arg(long, default_value = "1000")]
    chunk_size: usize,

    #[arg(long, default_value = "16")]
    concurrency: usize,

    #[arg(long, default_value = "256B")]
    text_size: byte_unit::Byte,
}

fn format_timestamp(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| millis.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    anyhow::ensure!(args.end > args.start, "--end must be after --start");
    anyhow::ensure!(args.count > 0, "--count must be positive");

    dotenv::from_filename("test.env")?;

    let username = "admin".to_string();
    let password = dotenv::var("OPENSEARCH_INITIAL_ADMIN_PASSWORD")?;

    let creds = Credentials::Basic(username, password);
    let conn_pool = SingleNodeConnectionPool::new(args.es_url);
    let transport = TransportBuilder::new(conn_pool)
        .auth(creds)
        .cert_validation(CertificateValidation::None)
        .disable_proxy()
        .build()?;
    let client = Arc::new(Elasticsearch::new(transport));

    if client
        .indices()
        .exists(IndicesExistsParts::Index(&[&args.index_name]))
        .send()
        .await?
        .status_code()
        != StatusCode::NOT_FOUND
    {
        client
            .indices()
            .delete(IndicesDeleteParts::Index(&[&args.index_name]))
            .send()
            .await?
            .error_for_status_code()?;
    };

    client
        .indices()
        .create(IndicesCreateParts::Index(&args.index_name))
        .body(json!({
            "mappings": {
                "properties": {
                    args.timestamp_field.as_str(): {"type": "date", "format": "strict_date_optional_time||epoch_millis"},
                    "service": {"type": "keyword"},
                    "latency_ms": {"type": "long"},
                    "message": {"type": "text"},
                }
            }
        }))
        .send()
        .await?
        .error_for_status_code()?;

    // Spread documents evenly over [start, end)
    let span = (args.end - args.start) as i128;
    let count = args.count as i128;
    let timestamp_field = args.timestamp_field.clone();
    let text_size = args.text_size.as_u64() as usize;

    let data = (0..args.count)
        .map(move |idx| {
            let offset = (idx as i128 * span / count) as i64;
            let timestamp = args.start + offset;
            pub static ALPHANUMERIC_WITH_SPACE: &str =
                "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789 ";
            let message = random_string::generate(text_size, ALPHANUMERIC_WITH_SPACE);

            let document = json!({
                timestamp_field.as_str(): format_timestamp(timestamp),
                "id": Uuid::now_v7(),
                "service": SERVICES[idx % SERVICES.len()],
                "latency_ms": (idx * 37) % 1_000,
                "message": message,
            });
            document.to_string()
        })
        .chunks(args.chunk_size);

    let futures = data.into_iter().map(|chunk| {
        let items: Vec<_> = chunk.collect();
        let client = client.clone();
        let index = BulkParts::Index(&args.index_name);

        let action = json!({"create": {}}).to_string();

        async move {
            let body_size: usize = items.iter().map(|r| r.len()).sum();

            let items: Vec<_> = std::iter::repeat(action)
                .interleave_shortest(items.into_iter())
                .collect();

            client
                .bulk(index)
                .body(items)
                .send()
                .await?
                .error_for_status_code()?;
            Ok::<_, anyhow::Error>(body_size)
        }
    });

    let mut stream = futures_util::stream::iter(futures).buffer_unordered(args.concurrency);

    let pbar = ProgressBar::new(args.count.div_ceil(args.chunk_size) as u64);

    let mut total_bytes = 0;
    while let Some(result) = stream.next().await {
        total_bytes += result?;
        pbar.inc(1);
    }

    pbar.finish();

    client
        .indices()
        .refresh(IndicesRefreshParts::Index(&[&args.index_name]))
        .send()
        .await?
        .error_for_status_code()?;

    let result = client
        .count(CountParts::Index(&[&args.index_name]))
        .send()
        .await?;
    println!("Index count: {:#}", result.json::<Value>().await?);

    println!(
        "Inserted {} of data between {} and {}",
        human_bytes::human_bytes(total_bytes as f64),
        format_timestamp(args.start),
        format_timestamp(args.end)
    );

    Ok(())
}
