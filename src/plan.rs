use anyhow::Context;
use serde::Serialize;
use tracing::{debug, warn};

use crate::split::{split_time_range, unsplit, NotSplittable, Step, TimeChunk};
use crate::time::format_instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Strategy {
    Split,
    /// The splitter refused, and the whole range runs as one query.
    Unsplit { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryPlan {
    pub start: i64,
    pub end: i64,
    pub step: Step,
    pub strategy: Strategy,
    pub chunks: Vec<TimeChunk>,
}

impl QueryPlan {
    pub fn build(start: i64, end: i64, step: Step, max_chunk_duration: i64) -> anyhow::Result<Self> {
        let (strategy, chunks) = match split_time_range(start, end, step, max_chunk_duration) {
            Ok(chunks) => (Strategy::Split, chunks),
            Err(e @ NotSplittable::EmptyRange { .. }) => {
                return Err(e).context("Nothing to query");
            }
            Err(reason) => {
                warn!("Not splitting {}..{}: {reason}", format_instant(start), format_instant(end));
                let chunk = unsplit(start, end, step).context("Error aligning query range")?;
                (
                    Strategy::Unsplit {
                        reason: reason.to_string(),
                    },
                    vec![chunk],
                )
            }
        };
        debug!(chunks = chunks.len(), ?strategy, "Built query plan");
        Ok(QueryPlan {
            start,
            end,
            step,
            strategy,
            chunks,
        })
    }

    pub fn is_split(&self) -> bool {
        self.strategy == Strategy::Split
    }

    /// Consecutive groups of chunks, one per output file.
    pub fn files(&self, chunks_per_file: usize) -> Vec<&[TimeChunk]> {
        self.chunks.chunks(chunks_per_file.max(1)).collect()
    }

    pub fn points(&self) -> i64 {
        self.chunks
            .iter()
            .fold(0i64, |total, c| total.saturating_add(c.points(self.step)))
    }
}
