use clap::ValueEnum;
use std::io::Write;

#[derive(Clone, Copy, ValueEnum, Debug, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
    None,
}

impl Compression {
    /// File extension to append, if any.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Compression::Gzip => Some("gz"),
            Compression::Zstd => Some("zst"),
            Compression::None => None,
        }
    }

    pub fn encoder(&self, output_buffer: Vec<u8>) -> std::io::Result<Encoder> {
        Ok(match self {
            Compression::Gzip => Encoder::Gzip(flate2::write::GzEncoder::new(
                output_buffer,
                flate2::Compression::default(),
            )),
            Compression::Zstd => Encoder::Zstd(zstd::Encoder::new(
                output_buffer,
                zstd::DEFAULT_COMPRESSION_LEVEL,
            )?),
            Compression::None => Encoder::Plain(output_buffer),
        })
    }
}

pub enum Encoder {
    Gzip(flate2::write::GzEncoder<Vec<u8>>),
    Zstd(zstd::Encoder<'static, Vec<u8>>),
    Plain(Vec<u8>),
}

impl Encoder {
    pub fn finish(self) -> std::io::Result<Vec<u8>> {
        match self {
            Encoder::Gzip(e) => e.finish(),
            Encoder::Zstd(e) => e.finish(),
            Encoder::Plain(buffer) => Ok(buffer),
        }
    }
}

impl Write for Encoder {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Encoder::Gzip(e) => e.write(buf),
            Encoder::Zstd(e) => e.write(buf),
            Encoder::Plain(buffer) => buffer.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Encoder::Gzip(e) => e.flush(),
            Encoder::Zstd(e) => e.flush(),
            Encoder::Plain(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn encode(compression: Compression, data: &[u8]) -> Vec<u8> {
        let mut encoder = compression.encoder(Vec::new()).unwrap();
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn gzip_output_decodes() {
        let data = b"{\"key\":0}\n{\"key\":10000}\n";
        let encoded = encode(Compression::Gzip, data);
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(encoded.as_slice())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn zstd_output_decodes() {
        let data = b"{\"key\":0}\n";
        let encoded = encode(Compression::Zstd, data);
        assert_eq!(zstd::decode_all(encoded.as_slice()).unwrap(), data);
    }

    #[test]
    fn plain_output_is_untouched() {
        assert_eq!(encode(Compression::None, b"abc"), b"abc");
        assert_eq!(Compression::None.extension(), None);
        assert_eq!(Compression::Zstd.extension(), Some("zst"));
    }
}
