use human_duration::human_duration;
use std::fmt::{Display, Formatter};
use std::ops::AddAssign;
use std::time::Duration;

#[derive(Default, Debug, Clone, PartialEq)]
pub struct ChunkStats {
    pub elasticsearch: Duration,
    pub json: Duration,
    pub compression: Duration,
    pub storage: Duration,
    pub buffers: Duration,
    pub chunks: u64,
    pub buckets: u64,
    pub response_bytes: u64,
    pub compressed_bytes: u64,
}

impl AddAssign for ChunkStats {
    fn add_assign(&mut self, rhs: Self) {
        self.elasticsearch += rhs.elasticsearch;
        self.json += rhs.json;
        self.compression += rhs.compression;
        self.storage += rhs.storage;
        self.buffers += rhs.buffers;
        self.chunks += rhs.chunks;
        self.buckets += rhs.buckets;
        self.response_bytes += rhs.response_bytes;
        self.compressed_bytes += rhs.compressed_bytes;
    }
}

impl Display for ChunkStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} chunks / {} buckets", self.chunks, self.buckets)?;
        write!(f, " / elasticsearch: {}", human_duration(&self.elasticsearch))?;
        write!(f, " / json: {}", human_duration(&self.json))?;
        write!(f, " / compression: {}", human_duration(&self.compression))?;
        write!(f, " / storage: {}", human_duration(&self.storage))?;
        write!(f, " / buffers: {}", human_duration(&self.buffers))?;
        write!(
            f,
            " / response bytes: {}",
            bytesize::ByteSize(self.response_bytes)
        )?;
        write!(
            f,
            " / compressed bytes: {}",
            bytesize::ByteSize(self.compressed_bytes)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_up() {
        let mut total = ChunkStats::default();
        total += ChunkStats {
            elasticsearch: Duration::from_millis(200),
            chunks: 1,
            buckets: 3,
            response_bytes: 1_000,
            ..Default::default()
        };
        total += ChunkStats {
            elasticsearch: Duration::from_millis(300),
            chunks: 1,
            buckets: 2,
            compressed_bytes: 10,
            ..Default::default()
        };
        assert_eq!(total.elasticsearch, Duration::from_millis(500));
        assert_eq!(total.chunks, 2);
        assert_eq!(total.buckets, 5);
        assert_eq!(total.response_bytes, 1_000);
        assert_eq!(total.compressed_bytes, 10);
        assert!(total.to_string().starts_with("2 chunks / 5 buckets"));
    }
}
