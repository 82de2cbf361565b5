//! SHA-256 hashing for files, readers and write-through sinks
//!
//! Everything streams in [`BLOCK_SIZE`] blocks; no input is ever loaded
//! into memory as a whole.

use anyhow::Context;
use sdt_core::SdtResult;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::Path;

/// Default read block size (64KB)
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Hex SHA-256 of a byte slice.
pub fn compute_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Hex SHA-256 of a file's content.
pub fn compute(path: &Path) -> SdtResult<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("opening file for checksum: {}", path.display()))?;
    let digest = compute_reader(&mut file, BLOCK_SIZE)
        .with_context(|| format!("reading file for checksum: {}", path.display()))?;
    Ok(digest)
}

/// Hex SHA-256 of everything left in `reader`.
pub fn compute_reader<R: Read + ?Sized>(reader: &mut R, block_size: usize) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; block_size.max(1)];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Copy `input` into `output` in one pass, hashing exactly the bytes written.
///
/// Returns the sink together with the hex digest of the copied stream.
pub fn compute_on_write<R, W>(input: &mut R, output: W, block_size: usize) -> std::io::Result<(W, String)>
where
    R: Read + ?Sized,
    W: Write,
{
    let mut sink = HashingWriter::new(output);
    let mut buf = vec![0u8; block_size.max(1)];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n])?;
    }
    sink.flush()?;
    Ok(sink.finish())
}

/// Write-through decorator: forwards bytes to `inner` and hashes them.
///
/// The digest is only reachable through [`HashingWriter::finish`], which
/// consumes the writer, so a partially written stream cannot be reported.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Close the stream: returns the inner sink and the hex digest.
    pub fn finish(self) -> (W, String) {
        (self.inner, format!("{:x}", self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
