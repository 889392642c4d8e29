//! Tar packing of changed files and member extraction for restore.
//!
//! Archives are streamed to a file. Each member is hashed while it is copied
//! in and rolled back when its bytes no longer match the hash recorded
//! during the scan, so an archive never holds content the snapshot does not
//! describe.

use crate::utils::errors::{EngineError, Result};
use crate::utils::hashing::HashingReader;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tar::{Archive, Builder, EntryType, Header};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ArchiveInput {
    /// Member name inside the archive
    pub key: String,
    pub path: PathBuf,
    /// Size and hash seen by the scan; the file's current size when `None`
    pub expected: Option<(u64, String)>,
    pub mtime: i64,
}

#[derive(Debug, Default)]
pub struct BuiltArchive {
    /// (key, size) of every member written
    pub members: Vec<(String, u64)>,
    /// (key, reason) for inputs left out
    pub skipped: Vec<(String, String)>,
    /// Size of the tar stream
    pub archive_size: u64,
}

impl BuiltArchive {
    pub fn content_size(&self) -> u64 {
        self.members.iter().map(|(_, size)| size).sum()
    }
}

/// Pack `inputs` into `file`, replacing its contents. Blocking.
pub fn build(inputs: &[ArchiveInput], file: &mut File) -> Result<BuiltArchive> {
    file.set_len(0)?;
    file.rewind()?;
    let mut builder = Builder::new(BufWriter::new(&mut *file));
    let mut built = BuiltArchive::default();

    for input in inputs {
        let start = builder.get_mut().stream_position()?;
        match append_member(&mut builder, input) {
            Ok(size) => built.members.push((input.key.clone(), size)),
            Err(reason) => {
                warn!(key = %input.key, reason = %reason, "File left out of the archive");
                builder.get_mut().seek(SeekFrom::Start(start))?;
                built.skipped.push((input.key.clone(), reason));
            }
        }
    }

    let mut writer = builder.into_inner()?;
    writer.flush()?;
    let end = writer.stream_position()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    // A rolled back last member can leave bytes past the trailer
    file.set_len(end)?;
    built.archive_size = end;
    Ok(built)
}

/// Append one file. `Err` carries the reason it was left out; the caller
/// rolls the stream back to where the member started.
fn append_member<W: Write>(
    builder: &mut Builder<W>,
    input: &ArchiveInput,
) -> std::result::Result<u64, String> {
    let file = File::open(&input.path).map_err(|e| format!("vanished before archiving: {}", e))?;
    let size = match &input.expected {
        Some((size, _)) => *size,
        None => file.metadata().map_err(|e| e.to_string())?.len(),
    };

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o600);
    header.set_mtime(input.mtime.max(0) as u64);
    header.set_cksum();

    let mut reader = HashingReader::new(file.take(size));
    builder
        .append_data(&mut header, &input.key, &mut reader)
        .map_err(|e| e.to_string())?;

    if HashingReader::bytes(&reader) != size {
        return Err("changed during backup (shrank)".to_string());
    }
    if let Some((_, expected_hash)) = &input.expected {
        if reader.finish() != *expected_hash {
            return Err("changed during backup".to_string());
        }
    }
    Ok(size)
}

/// Stream the members named in `wanted` to `visit`, in archive order.
/// Returns the keys that were found.
pub fn visit_members<R, F>(reader: R, wanted: &HashSet<String>, mut visit: F) -> Result<HashSet<String>>
where
    R: Read,
    F: FnMut(&str, &mut dyn Read) -> Result<()>,
{
    let mut archive = Archive::new(reader);
    let mut found = HashSet::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let key = entry
            .path()?
            .to_str()
            .ok_or_else(|| EngineError::integrity("archive member name is not valid UTF-8"))?
            .to_string();
        if !wanted.contains(&key) || found.contains(&key) {
            continue;
        }
        visit(&key, &mut entry)?;
        found.insert(key);
        if found.len() == wanted.len() {
            break;
        }
    }
    Ok(found)
}
