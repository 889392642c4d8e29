//! Content sniffing by magic number, with a printable-byte fallback.

use serde::{Deserialize, Serialize};

/// Leading bytes examined by the text heuristic
const SAMPLE_SIZE: usize = 8192;

/// Share of printable bytes needed to call a sample text
const TEXT_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Png,
    Jpeg,
    Gif,
    Bmp,
    Pdf,
    Zip,
    Rar,
    Gzip,
    Bzip2,
    Text,
    Binary,
}

impl ContentType {
    /// Formats that are already compressed or are images
    pub fn is_precompressed(self) -> bool {
        !matches!(self, ContentType::Text | ContentType::Binary)
    }
}

const SIGNATURES: &[(&[u8], ContentType)] = &[
    (b"\x89PNG\r\n\x1a\n", ContentType::Png),
    (b"\xff\xd8\xff", ContentType::Jpeg),
    (b"GIF87a", ContentType::Gif),
    (b"GIF89a", ContentType::Gif),
    (b"%PDF", ContentType::Pdf),
    (b"PK\x03\x04", ContentType::Zip),
    (b"PK\x05\x06", ContentType::Zip),
    (b"Rar!\x1a\x07", ContentType::Rar),
    (b"\x1f\x8b", ContentType::Gzip),
];

/// First bzip2 block, or the end-of-stream marker of an empty stream
const BZIP2_BLOCK_MAGIC: &[u8; 6] = b"1AY&SY";
const BZIP2_END_MAGIC: &[u8; 6] = b"\x17\x72\x45\x38\x50\x90";

/// DIB header sizes of the BMP variants in use
const BMP_DIB_SIZES: [u32; 7] = [12, 40, 52, 56, 64, 108, 124];

pub fn detect_content_type(data: &[u8]) -> ContentType {
    if let Some((_, kind)) = SIGNATURES.iter().find(|(magic, _)| data.starts_with(magic)) {
        return *kind;
    }
    if is_bzip2(data) {
        return ContentType::Bzip2;
    }
    if is_bmp(data) {
        return ContentType::Bmp;
    }
    if data.is_empty() {
        return ContentType::Binary;
    }

    let sample = &data[..data.len().min(SAMPLE_SIZE)];
    let printable = sample
        .iter()
        .filter(|&&b| matches!(b, 0x20..=0x7e | b'\t' | b'\n' | b'\r'))
        .count();
    if printable as f64 / sample.len() as f64 >= TEXT_THRESHOLD {
        ContentType::Text
    } else {
        ContentType::Binary
    }
}

/// `BZh`, a block size digit, then a block or end-of-stream marker
fn is_bzip2(data: &[u8]) -> bool {
    data.len() >= 10
        && data.starts_with(b"BZh")
        && matches!(data[3], b'1'..=b'9')
        && (data[4..10] == BZIP2_BLOCK_MAGIC[..] || data[4..10] == BZIP2_END_MAGIC[..])
}

/// `BM`, zeroed reserved fields and a known DIB header size
fn is_bmp(data: &[u8]) -> bool {
    if data.len() < 18 || !data.starts_with(b"BM") {
        return false;
    }
    let dib_size = u32::from_le_bytes([data[14], data[15], data[16], data[17]]);
    data[6..10] == [0u8; 4] && BMP_DIB_SIZES.contains(&dib_size)
}
