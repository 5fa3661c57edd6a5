mod compression;
mod elasticsearch;
mod execute;
mod plan;
mod split;
mod stats;
mod storage;
mod time;

use indicatif::ProgressStyle;
use std::fs::File;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use ::elasticsearch::auth::Credentials;
use anyhow::Context;
use tracing::{info, warn};

use crate::elasticsearch::ElasticsearchClient;
use crate::execute::ExecuteOptions;
use crate::plan::QueryPlan;
use crate::split::Step;
use clap::Parser;
use clap_num::number_range;
use serde_json::{Map, Value};

use tracing_indicatif::IndicatifLayer;

use crate::compression::Compression;
use crate::storage::StorageBackend;
use crate::time::format_instant;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use url::Url;

fn valid_chunks_per_file(s: &str) -> Result<u16, String> {
    number_range(s, 1, 1_000)
}

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Elasticsearch cluster to query
    elasticsearch_url: Url,

    /// Location to write results.
    /// Can be a file://, s3://, gs://, az:// or memory:// URL.
    output_location: Url,

    /// Index (or index pattern) to query
    #[arg(short, long)]
    index: String,

    /// Date field the histogram buckets on
    #[arg(long, default_value = "@timestamp")]
    timestamp_field: String,

    /// Start of the range: epoch milliseconds, RFC 3339, or YYYY-MM-DDTHH:MM:SS (UTC)
    #[arg(long, allow_hyphen_values = true, value_parser = time::parse_instant)]
    start: i64,

    /// End of the range, same formats as --start
    #[arg(long, allow_hyphen_values = true, value_parser = time::parse_instant)]
    end: i64,

    /// Histogram step, e.g. 10s or 5m
    #[arg(long, value_parser = time::parse_step)]
    step: Step,

    /// Longest time range a single sub-query may cover
    #[arg(long, default_value = "1d", value_parser = time::parse_duration_ms)]
    max_chunk_duration: i64,

    /// Number of files to write concurrently
    #[arg(short, long, default_value = "4")]
    concurrency: NonZeroUsize,

    /// Number of chunks to write per file
    #[arg(long, default_value = "10", value_parser = valid_chunks_per_file)]
    chunks_per_file: u16,

    /// A file path containing a query (and optional aggs) to run for each chunk
    #[arg(short, long)]
    query: Option<PathBuf>,

    /// Compress the output files
    #[arg(value_enum, long, default_value_t = Compression::Zstd)]
    compression: Compression,

    /// Max parts to concurrently upload *per file*
    #[arg(long)]
    concurrent_uploads: Option<NonZeroUsize>,

    /// Size of each uploaded part
    #[arg(long, default_value = "15MB")]
    upload_size: byte_unit::Byte,

    /// File to load environment variables from
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Print the chunk plan as JSON and exit
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let footer_style =
        ProgressStyle::with_template("...and {pending_progress_bars} more not shown above.")?;
    let indicatif_layer = IndicatifLayer::default().with_max_progress_bars(40, Some(footer_style));

    let filter_builder = EnvFilter::builder();
    let filter = filter_builder
        .try_from_env()
        .unwrap_or_else(|_| filter_builder.parse_lossy("warn,es_timesplit=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();

    let plan = QueryPlan::build(args.start, args.end, args.step, args.max_chunk_duration)?;
    info!(
        "Querying {}..{} every {} in {} chunks ({} points)",
        format_instant(plan.start),
        format_instant(plan.end),
        plan.step,
        plan.chunks.len(),
        plan.points()
    );

    if args.dry_run {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    if let Err(e) = dotenv::from_filename(&args.env_file) {
        warn!("Error reading env file: {}", e);
    };

    let creds = Credentials::Basic(
        std::env::var("ES_TIMESPLIT_USERNAME").context("ES_TIMESPLIT_USERNAME env var not set")?,
        std::env::var("ES_TIMESPLIT_PASSWORD").context("ES_TIMESPLIT_PASSWORD env var not set")?,
    );

    let query: Map<String, Value> = match args.query {
        None => Map::new(),
        Some(query_file) => {
            let query_file = File::open(query_file).context("Error reading query file")?;
            serde_json::from_reader(query_file).context("Error parsing query file JSON")?
        }
    };

    info!(
        "Querying index {} on {} into {}",
        args.index, args.elasticsearch_url, args.output_location
    );
    info!("Using query {}", serde_json::to_string_pretty(&query)?);

    let storage = StorageBackend::from_url(
        &args.output_location,
        args.upload_size,
        args.concurrent_uploads,
    )?;

    let es_client = ElasticsearchClient::new(
        args.elasticsearch_url,
        creds,
        &args.index,
        &args.timestamp_field,
        query,
    )
    .await
    .context("Error creating ES client")?;

    let options = ExecuteOptions {
        compression: args.compression,
        chunks_per_file: args.chunks_per_file as usize,
        concurrency: args.concurrency,
    };
    let summary = execute::run_plan(Arc::new(es_client), Rc::new(storage), &plan, options).await?;

    info!(
        "Completed! Wrote {} files. Total stats: {}",
        summary.files.len(),
        summary.stats
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_range_arguments() {
        let cli = Cli::try_parse_from([
            "es-timesplit",
            "http://localhost:9200",
            "memory:///out",
            "--index",
            "metrics-*",
            "--start",
            "2022-02-06T14:10:03",
            "--end",
            "2022-02-06T14:11:03Z",
            "--step",
            "10s",
            "--max-chunk-duration",
            "35s",
            "--dry-run",
        ])
        .unwrap();

        assert_eq!(cli.start, 1_644_156_603_000);
        assert_eq!(cli.end, 1_644_156_663_000);
        assert_eq!(cli.step.millis(), 10_000);
        assert_eq!(cli.max_chunk_duration, 35_000);
        assert_eq!(cli.chunks_per_file, 10);
        assert_eq!(cli.compression, Compression::Zstd);
        assert!(cli.dry_run);
    }

    #[test]
    fn rejects_zero_step() {
        let result = Cli::try_parse_from([
            "es-timesplit",
            "http://localhost:9200",
            "memory:///out",
            "--index",
            "metrics",
            "--start",
            "0",
            "--end",
            "1000",
            "--step",
            "0s",
        ]);
        assert!(result.is_err());
    }
}
