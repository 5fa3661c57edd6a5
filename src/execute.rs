use anyhow::Context;
use futures_util::StreamExt;
use indicatif::ProgressStyle;
use std::num::NonZeroUsize;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, Instrument};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use url::Url;

use crate::compression::Compression;
use crate::elasticsearch::{encode_buckets, ChunkQuery};
use crate::plan::QueryPlan;
use crate::stats::ChunkStats;
use crate::storage::StorageBackend;
use crate::time::format_instant;

#[derive(Debug, Clone, Copy)]
pub struct ExecuteOptions {
    pub compression: Compression,
    pub chunks_per_file: usize,
    pub concurrency: NonZeroUsize,
}

#[derive(Debug)]
pub struct RunSummary {
    pub stats: ChunkStats,
    /// Uploaded objects in time order.
    pub files: Vec<Url>,
}

/// Runs every chunk of the plan and uploads the step buckets.
///
/// Files are written concurrently. The chunks inside a file are queried one
/// after another in ascending order, so every file is sorted by time.
pub async fn run_plan(
    runner: Arc<dyn ChunkQuery>,
    storage: Rc<StorageBackend>,
    plan: &QueryPlan,
    options: ExecuteOptions,
) -> anyhow::Result<RunSummary> {
    let files = plan.files(options.chunks_per_file);
    info!(
        "Got {chunk_count} chunks to process in {file_count} files",
        chunk_count = plan.chunks.len(),
        file_count = files.len()
    );

    let header_span = info_span!("fetch_chunks");
    header_span.pb_set_style(&ProgressStyle::with_template(
        "[{elapsed} {percent}%] {wide_bar} {pos}/{len} [ETA {eta}]",
    )?);
    header_span.pb_set_length(plan.chunks.len() as u64);

    let step = plan.step;
    let futures = files.into_iter().enumerate().map(|(idx, chunks)| {
        let runner = runner.clone();
        let storage = storage.clone();
        let parent_span = tracing::Span::current();
        let chunk_count = chunks.len();

        async move {
            let suffix = uuid::Uuid::now_v7();
            let file_name = format!("{idx:0>5}-{}-{suffix}.jsonl", chunks[0].start);
            let (object_url, mut upload) = storage
                .create_streaming_upload(&file_name, options.compression)
                .await
                .with_context(|| format!("Error creating streaming upload for file {file_name}"))?;
            let mut buffer = Vec::with_capacity(1024 * 1024);
            let mut file_stats = ChunkStats::default();

            for (chunk_idx, chunk) in chunks.iter().enumerate() {
                let storage_time = Instant::now();
                storage.wait_for_capacity(&mut upload).await?;
                file_stats.storage += storage_time.elapsed();

                let chunk_number = chunk_idx + 1;
                let es_time = Instant::now();
                let body = runner
                    .query_chunk(chunk, step)
                    .instrument(info_span!("fetch_chunk",
                        chunk = chunk_number,
                        chunks = chunk_count,
                        file = idx,
                        start = %format_instant(chunk.start),
                    ))
                    .await
                    .with_context(|| format!("Error querying chunk {chunk_number} for file {file_name}"))?;
                let elasticsearch = es_time.elapsed();

                let compression = options.compression;
                let (mut chunk_stats, mut encoded) =
                    tokio::task::spawn_blocking(move || encode_buckets(compression, body, buffer))
                        .await?
                        .with_context(|| format!("Error encoding chunk {chunk_number} for file {file_name}"))?;
                chunk_stats.elasticsearch = elasticsearch;
                chunk_stats.chunks = 1;

                let buffers_time = Instant::now();
                upload.write(&encoded);
                encoded.clear();
                buffer = encoded;
                chunk_stats.buffers = buffers_time.elapsed();

                file_stats += chunk_stats;
                parent_span.pb_inc(1);
            }

            let storage_time = Instant::now();
            upload
                .finish()
                .await
                .with_context(|| format!("Error finishing streaming upload for file {file_name}"))?;
            file_stats.storage += storage_time.elapsed();

            Ok::<_, anyhow::Error>((idx, file_stats, object_url))
        }
    });

    // Files pick up the header span as their progress parent when first polled.
    let drive = async {
        let mut total = ChunkStats::default();
        let mut uploaded = Vec::new();
        let mut stream =
            futures_util::stream::iter(futures).buffer_unordered(options.concurrency.get());
        while let Some(result) = stream.next().await {
            let (idx, stats, object_url) = result?;
            info!("File {idx} uploaded to {object_url}. Stats: {stats}");
            total += stats;
            uploaded.push((idx, object_url));
        }
        Ok::<_, anyhow::Error>((total, uploaded))
    };
    let (total, mut uploaded) = drive.instrument(header_span).await?;

    uploaded.sort_by_key(|(idx, _)| *idx);
    Ok(RunSummary {
        stats: total,
        files: uploaded.into_iter().map(|(_, url)| url).collect(),
    })
}
