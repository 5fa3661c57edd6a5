//! Splitting a query time range into step-aligned chunks.
//!
//! Chunk bounds are step points and both are included in the chunk: a chunk
//! `[start, end]` covers `start, start + step, ..., end`. Consecutive chunks
//! meet on the step grid (`next.start == prev.end + step`), so each step point
//! is queried exactly once.
use serde::Serialize;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Upper bound on the number of chunks a single split may produce.
pub const MAX_CHUNK_COUNT: usize = 50;

/// A positive step size in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Step(i64);

impl Step {
    pub fn new(millis: i64) -> Option<Step> {
        (millis > 0).then_some(Step(millis))
    }

    pub fn millis(&self) -> i64 {
        self.0
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let duration = std::time::Duration::from_millis(self.0 as u64);
        write!(f, "{}", humantime::format_duration(duration))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeChunk {
    pub start: i64,
    pub end: i64,
}

impl TimeChunk {
    /// Number of step points in the chunk, saturating at `i64::MAX`.
    pub fn points(&self, step: Step) -> i64 {
        (self.end.saturating_sub(self.start) / step.millis()).saturating_add(1)
    }

    /// Exclusive upper bound of the documents that fall into this chunk's
    /// last step bucket.
    pub fn document_end(&self, step: Step) -> i64 {
        self.end.saturating_add(step.millis())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NotSplittable {
    #[error("max chunk duration of {max_chunk_duration}ms is shorter than one step of {step}ms")]
    StepTooLarge { step: i64, max_chunk_duration: i64 },
    #[error("split would produce {count} chunks, more than the limit of {max}")]
    TooManyChunks { count: usize, max: usize },
    #[error("end {end} is not after start {start}")]
    EmptyRange { start: i64, end: i64 },
    #[error("time range does not fit in 64-bit milliseconds once aligned")]
    OutOfRange,
}

/// Largest multiple of `step` at or before `time`.
pub fn align_down(time: i64, step: Step) -> Option<i64> {
    time.checked_sub(time.rem_euclid(step.millis()))
}

/// Smallest multiple of `step` at or after `time`.
pub fn align_up(time: i64, step: Step) -> Option<i64> {
    match time.rem_euclid(step.millis()) {
        0 => Some(time),
        rem => time.checked_add(step.millis() - rem),
    }
}

/// Splits `[start, end)` into chunks of at most `max_chunk_duration`, each a
/// whole number of steps.
///
/// The first chunk starts at `start` rounded down to a step boundary and the
/// last one ends at `end` rounded up, so the chunks may extend past the
/// requested range on both sides. Chunks are laid out backwards from the end,
/// which leaves any shorter chunk at the start.
///
/// Returns [`NotSplittable`] when the chunk duration can't hold a single step,
/// when the range is empty, or when more than [`MAX_CHUNK_COUNT`] chunks would
/// be needed. Callers should treat every error the same way and run the range
/// as a single query.
pub fn split_time_range(
    start: i64,
    end: i64,
    step: Step,
    max_chunk_duration: i64,
) -> Result<Vec<TimeChunk>, NotSplittable> {
    let step_ms = step.millis();
    let chunk_steps = max_chunk_duration / step_ms;
    if chunk_steps < 1 {
        return Err(NotSplittable::StepTooLarge {
            step: step_ms,
            max_chunk_duration,
        });
    }
    if end <= start {
        return Err(NotSplittable::EmptyRange { start, end });
    }

    let chunk_size = chunk_steps * step_ms;
    let aligned_start = align_down(start, step).ok_or(NotSplittable::OutOfRange)?;
    let aligned_end = align_up(end, step).ok_or(NotSplittable::OutOfRange)?;

    let points = (aligned_end
        .checked_sub(aligned_start)
        .ok_or(NotSplittable::OutOfRange)?
        / step_ms)
        .checked_add(1)
        .ok_or(NotSplittable::OutOfRange)?;
    let count = points / chunk_steps + i64::from(points % chunk_steps != 0);
    let count = usize::try_from(count).map_err(|_| NotSplittable::OutOfRange)?;
    if count > MAX_CHUNK_COUNT {
        return Err(NotSplittable::TooManyChunks {
            count,
            max: MAX_CHUNK_COUNT,
        });
    }

    let mut chunks = Vec::with_capacity(count);
    let mut cursor = aligned_end;
    loop {
        let chunk_start = cursor
            .saturating_sub(chunk_size - step_ms)
            .max(aligned_start);
        chunks.push(TimeChunk {
            start: chunk_start,
            end: cursor,
        });
        match chunk_start.checked_sub(step_ms) {
            Some(next) if next >= aligned_start => cursor = next,
            _ => break,
        }
    }
    chunks.reverse();
    Ok(chunks)
}

/// A single aligned chunk covering all of `[start, end)`.
pub fn unsplit(start: i64, end: i64, step: Step) -> Result<TimeChunk, NotSplittable> {
    if end <= start {
        return Err(NotSplittable::EmptyRange { start, end });
    }
    Ok(TimeChunk {
        start: align_down(start, step).ok_or(NotSplittable::OutOfRange)?,
        end: align_up(end, step).ok_or(NotSplittable::OutOfRange)?,
    })
}
