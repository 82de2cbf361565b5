//! Tar stream of the files being packaged.
//!
//! The stream holds the checksum manifest at its root followed by every input
//! file under [`CONTENT_FOLDER`]. It is gzip-compressed unless the level is 0.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sdt_core::metadata::COMPRESSION_GZIP;
use sdt_core::Progress;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
    /// File on disk, streamed when the archive is written
    File(PathBuf),
    /// Bytes generated in memory (the checksum manifest)
    InMemory(Vec<u8>),
}

/// One archive member: POSIX-style relative path plus its data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    pub archive_path: String,
    pub source: ArchiveSource,
}

impl ArchiveFile {
    pub fn file(archive_path: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            archive_path: archive_path.into(),
            source: ArchiveSource::File(path.into()),
        }
    }

    pub fn in_memory(archive_path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            archive_path: archive_path.into(),
            source: ArchiveSource::InMemory(data),
        }
    }
}

/// Value stored in `MetaData.compression_algorithm` for a level.
pub fn compression_algorithm(level: u32) -> &'static str {
    if level > 0 {
        COMPRESSION_GZIP
    } else {
        ""
    }
}

/// Write `entries` as a tar stream into `writer`, gzip-compressed when
/// `level > 0`. Returns the writer once the stream is complete.
pub fn write_tar<W: Write>(entries: &[ArchiveFile], level: u32, writer: W) -> io::Result<W> {
    if level == 0 {
        return append_all(tar::Builder::new(writer), entries);
    }
    let gz = GzEncoder::new(writer, Compression::new(level));
    append_all(tar::Builder::new(gz), entries)?.finish()
}

fn append_all<W: Write>(mut builder: tar::Builder<W>, entries: &[ArchiveFile]) -> io::Result<W> {
    for entry in entries {
        match &entry.source {
            ArchiveSource::File(path) => builder.append_path_with_name(path, &entry.archive_path)?,
            ArchiveSource::InMemory(data) => {
                let mut header = tar::Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_mtime(unix_now());
                header.set_cksum();
                builder.append_data(&mut header, &entry.archive_path, data.as_slice())?;
            }
        }
    }
    builder.into_inner()
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Unpack a tar stream (gzip-compressed when `compressed`) into `dest`.
///
/// Member paths that would escape `dest` are skipped by `tar`.
pub fn unpack_tar<R: Read>(reader: R, compressed: bool, dest: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dest)?;
    if compressed {
        tar::Archive::new(GzDecoder::new(reader)).unpack(dest)
    } else {
        tar::Archive::new(reader).unpack(dest)
    }
}

/// Counts bytes passing through and reports them as progress.
pub struct ProgressWriter<'a, W> {
    inner: W,
    done: u64,
    total: u64,
    label: &'a str,
    progress: &'a dyn Progress,
}

impl<'a, W: Write> ProgressWriter<'a, W> {
    pub fn new(inner: W, total: u64, label: &'a str, progress: &'a dyn Progress) -> Self {
        Self {
            inner,
            done: 0,
            total,
            label,
            progress,
        }
    }
}

impl<W: Write> Write for ProgressWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.done += n as u64;
        // tar headers and padding push the byte count past the input size
        self.progress
            .update(self.done.min(self.total), self.total, self.label);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
