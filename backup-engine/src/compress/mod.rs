//! Content-aware compression.
//!
//! Every payload starts with a 4-byte ASCII algorithm tag so it can be
//! decompressed without out-of-band knowledge:
//!
//! | tag    | algorithm            |
//! |--------|----------------------|
//! | `NONE` | stored raw           |
//! | `LZ4_` | LZ4 frame            |
//! | `ZSTD` | Zstandard            |
//! | `GZIP` | gzip                 |
//! | `BZP2` | bzip2                |
//!
//! Files are compressed as streams; the algorithm is chosen from a sample
//! taken at the start of the file.

pub mod content;

pub use content::{detect_content_type, ContentType};

use crate::config::CompressionConfig;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const TAG_LEN: usize = 4;

/// Bytes of a file examined to choose its algorithm
pub const SAMPLE_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    None,
    Lz4,
    Zstd,
    Gzip,
    Bzip2,
}

impl Algorithm {
    pub const CANDIDATES: [Algorithm; 4] =
        [Algorithm::Lz4, Algorithm::Zstd, Algorithm::Gzip, Algorithm::Bzip2];

    pub fn tag(self) -> &'static [u8; TAG_LEN] {
        match self {
            Algorithm::None => b"NONE",
            Algorithm::Lz4 => b"LZ4_",
            Algorithm::Zstd => b"ZSTD",
            Algorithm::Gzip => b"GZIP",
            Algorithm::Bzip2 => b"BZP2",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"NONE" => Some(Algorithm::None),
            b"LZ4_" => Some(Algorithm::Lz4),
            b"ZSTD" => Some(Algorithm::Zstd),
            b"GZIP" => Some(Algorithm::Gzip),
            b"BZP2" => Some(Algorithm::Bzip2),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::None => "none",
            Algorithm::Lz4 => "lz4",
            Algorithm::Zstd => "zstd",
            Algorithm::Gzip => "gzip",
            Algorithm::Bzip2 => "bzip2",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub algorithm: Algorithm,
    pub original_size: usize,
    pub compressed_size: usize,
    /// compressed / original; lower is better
    pub ratio: f64,
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionOutcome {
    pub algorithm: Algorithm,
    pub content_type: ContentType,
    pub original_size: u64,
    /// Payload size including the tag
    pub compressed_size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn select_algorithm(&self, data: &[u8]) -> Algorithm {
        if data.len() < self.config.min_size {
            return Algorithm::None;
        }

        match detect_content_type(data) {
            ContentType::Text if self.config.benchmark_text => self
                .benchmark(data)
                .into_iter()
                .min_by(|a, b| a.ratio.total_cmp(&b.ratio))
                .map(|best| best.algorithm)
                .unwrap_or(Algorithm::Zstd),
            ContentType::Text | ContentType::Binary => Algorithm::Zstd,
            _ => Algorithm::Lz4,
        }
    }

    /// Compress with the selected algorithm and prepend its tag
    pub fn compress(&self, data: &[u8]) -> Result<(Vec<u8>, Algorithm)> {
        let algorithm = self.select_algorithm(data);
        match self.compress_with(data, algorithm) {
            Ok(payload) => Ok((payload, algorithm)),
            Err(e) if algorithm == Algorithm::Zstd => {
                warn!(error = %e, "Zstandard failed, falling back to LZ4");
                Ok((self.compress_with(data, Algorithm::Lz4)?, Algorithm::Lz4))
            }
            Err(e) => Err(e),
        }
    }

    /// Compress with a fixed algorithm and prepend its tag
    pub fn compress_with(&self, data: &[u8], algorithm: Algorithm) -> Result<Vec<u8>> {
        let mut payload = algorithm.tag().to_vec();
        self.encode(&mut &data[..], &mut payload, algorithm)
            .map_err(|e| compression_failed(algorithm, e))?;
        Ok(payload)
    }

    /// Stream `reader` through `algorithm` into `writer`
    fn encode<R: Read, W: Write>(&self, reader: &mut R, writer: W, algorithm: Algorithm) -> io::Result<W> {
        match algorithm {
            Algorithm::None => {
                let mut writer = writer;
                io::copy(reader, &mut writer)?;
                Ok(writer)
            }
            Algorithm::Lz4 => {
                let mut encoder = lz4_flex::frame::FrameEncoder::new(writer);
                io::copy(reader, &mut encoder)?;
                encoder.finish().map_err(io::Error::other)
            }
            Algorithm::Zstd => {
                let mut encoder = zstd::stream::write::Encoder::new(writer, self.config.zstd_level)?;
                io::copy(reader, &mut encoder)?;
                encoder.finish()
            }
            Algorithm::Gzip => {
                let mut encoder =
                    flate2::write::GzEncoder::new(writer, flate2::Compression::new(self.config.gzip_level));
                io::copy(reader, &mut encoder)?;
                encoder.finish()
            }
            Algorithm::Bzip2 => {
                let mut encoder =
                    bzip2::write::BzEncoder::new(writer, bzip2::Compression::new(self.config.bzip2_level));
                io::copy(reader, &mut encoder)?;
                encoder.finish()
            }
        }
    }

    /// Run every candidate over `data`. Failed candidates are left out.
    pub fn benchmark(&self, data: &[u8]) -> Vec<BenchmarkResult> {
        let original_size = data.len().max(1);
        Algorithm::CANDIDATES
            .iter()
            .filter_map(|&algorithm| {
                let started = Instant::now();
                let compressed = self.encode(&mut &data[..], Vec::new(), algorithm).ok()?;
                let result = BenchmarkResult {
                    algorithm,
                    original_size: data.len(),
                    compressed_size: compressed.len(),
                    ratio: compressed.len() as f64 / original_size as f64,
                    duration: started.elapsed(),
                };
                debug!(
                    algorithm = %algorithm,
                    ratio = result.ratio,
                    micros = result.duration.as_micros() as u64,
                    "Benchmark"
                );
                Some(result)
            })
            .collect()
    }

    /// Stream `input` into `output`, choosing the algorithm from a sample
    /// of the input
    pub fn compress_file(&self, input: &Path, output: &Path) -> Result<CompressionOutcome> {
        let mut sample = Vec::with_capacity(SAMPLE_LEN);
        File::open(input)?
            .take(SAMPLE_LEN as u64)
            .read_to_end(&mut sample)?;
        let content_type = detect_content_type(&sample);
        let algorithm = self.select_algorithm(&sample);

        let (algorithm, compressed_size) = match self.compress_file_with(input, output, algorithm) {
            Ok(size) => (algorithm, size),
            Err(e) if algorithm == Algorithm::Zstd => {
                warn!(error = %e, "Zstandard failed, falling back to LZ4");
                (Algorithm::Lz4, self.compress_file_with(input, output, Algorithm::Lz4)?)
            }
            Err(e) => return Err(e),
        };
        Ok(CompressionOutcome {
            algorithm,
            content_type,
            original_size: std::fs::metadata(input)?.len(),
            compressed_size,
        })
    }

    /// Stream `input` into `output` with a fixed algorithm, returning the
    /// payload size
    pub fn compress_file_with(&self, input: &Path, output: &Path, algorithm: Algorithm) -> Result<u64> {
        let mut reader = BufReader::new(File::open(input)?);
        let mut writer = BufWriter::new(File::create(output)?);
        writer.write_all(algorithm.tag())?;
        let mut writer = self
            .encode(&mut reader, writer, algorithm)
            .map_err(|e| compression_failed(algorithm, e))?;
        writer.flush()?;
        Ok(std::fs::metadata(output)?.len())
    }
}

fn compression_failed(algorithm: Algorithm, e: io::Error) -> EngineError {
    EngineError::Compression(format!("{} compression failed: {}", algorithm, e))
}

/// Decode a tagged payload
pub fn decompress(payload: &[u8]) -> Result<Vec<u8>> {
    let (algorithm, mut decoder) = decompressing_reader(payload)?;
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| decompression_failed(algorithm, e))?;
    Ok(out)
}

/// Read the tag from `reader` and return a reader over the decoded bytes
pub fn decompressing_reader<'a, R: Read + 'a>(mut reader: R) -> Result<(Algorithm, Box<dyn Read + 'a>)> {
    let mut tag = [0u8; TAG_LEN];
    let mut filled = 0;
    while filled < TAG_LEN {
        let n = reader.read(&mut tag[filled..])?;
        if n == 0 {
            return Err(EngineError::crypto("compressed payload shorter than its tag"));
        }
        filled += n;
    }
    let algorithm = Algorithm::from_tag(&tag).ok_or_else(|| {
        EngineError::crypto(format!(
            "unknown compression tag {:?}",
            String::from_utf8_lossy(&tag)
        ))
    })?;

    let decoder: Box<dyn Read + 'a> = match algorithm {
        Algorithm::None => Box::new(reader),
        Algorithm::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(reader)),
        Algorithm::Zstd => Box::new(
            zstd::stream::read::Decoder::new(reader).map_err(|e| decompression_failed(algorithm, e))?,
        ),
        Algorithm::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
        Algorithm::Bzip2 => Box::new(bzip2::read::BzDecoder::new(reader)),
    };
    Ok((algorithm, decoder))
}

fn decompression_failed(algorithm: Algorithm, e: io::Error) -> EngineError {
    EngineError::Compression(format!("{} decompression failed: {}", algorithm, e))
}
