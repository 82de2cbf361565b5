//! Checksum manifests in `sha256sum` layout.
//!
//! One `"<64 hex chars> <posix relative path>\n"` line per file, in input
//! order. Hashing fans out on a rayon pool; results are collected by index
//! so completion order never leaks into the output.

use crate::sha256::compute;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use sdt_core::metadata::is_sha256_hex;
use sdt_core::{SdtError, SdtResult};
use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::debug;

/// Hash every `(archive_path, source_path)` entry and serialize the manifest.
pub fn generate_manifest(
    entries: &[(String, PathBuf)],
    max_workers: Option<usize>,
) -> SdtResult<Vec<u8>> {
    let sources: Vec<&Path> = entries.iter().map(|(_, src)| src.as_path()).collect();
    let digests = hash_all(&sources, max_workers)?;

    let mut out = Vec::new();
    for ((archive_path, _), digest) in entries.iter().zip(digests) {
        let digest = digest?;
        out.extend_from_slice(digest.as_bytes());
        out.push(b' ');
        out.extend_from_slice(archive_path.as_bytes());
        out.push(b'\n');
    }
    debug!(files = entries.len(), "checksum manifest generated");
    Ok(out)
}

/// Lazily parse manifest lines into `(checksum, path)` pairs.
pub fn read_manifest<R: BufRead>(reader: R) -> impl Iterator<Item = SdtResult<(String, String)>> {
    reader
        .lines()
        .enumerate()
        .map(|(idx, line)| parse_line(idx + 1, &line?))
}

fn parse_line(line_no: usize, line: &str) -> SdtResult<(String, String)> {
    let malformed = || {
        SdtError::user(format!(
            "checksum file line {line_no}: expected '<checksum> <path>', got '{line}'"
        ))
    };
    let (checksum, path) = line.split_once(char::is_whitespace).ok_or_else(malformed)?;
    let path = path.trim_start();
    if path.is_empty() || !is_sha256_hex(checksum) {
        return Err(malformed());
    }
    if is_absolute(path) {
        return Err(SdtError::user(format!(
            "checksum file line {line_no}: absolute path '{path}' is not allowed"
        )));
    }
    if path.split(['/', '\\']).any(|c| c == "..") {
        return Err(SdtError::user(format!(
            "checksum file line {line_no}: path '{path}' escapes the archive root"
        )));
    }
    Ok((checksum.to_ascii_lowercase(), path.to_string()))
}

fn is_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with('/')
        || path.starts_with('\\')
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

/// Recompute every `(expected, path)` entry and fail on the first mismatch.
///
/// All files are hashed before any result is inspected; the error names the
/// first offending entry in input order.
pub fn verify_many(entries: &[(String, PathBuf)], max_workers: Option<usize>) -> SdtResult<()> {
    let paths: Vec<&Path> = entries.iter().map(|(_, p)| p.as_path()).collect();
    let digests = hash_all(&paths, max_workers)?;

    debug!(files = entries.len(), "checksums computed");

    for (digest, (expected, path)) in digests.into_iter().zip(entries) {
        let actual = digest?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(SdtError::ChecksumMismatch {
                path: path.clone(),
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(())
}

/// Verify a manifest whose paths are relative to `root`.
pub fn verify_manifest<R: BufRead>(reader: R, root: &Path, max_workers: Option<usize>) -> SdtResult<usize> {
    let entries = read_manifest(reader)
        .map(|entry| entry.map(|(sum, path)| (sum, root.join(path))))
        .collect::<SdtResult<Vec<_>>>()?;
    verify_many(&entries, max_workers)?;
    Ok(entries.len())
}

fn hash_all(paths: &[&Path], max_workers: Option<usize>) -> SdtResult<Vec<SdtResult<String>>> {
    let hash = || -> Vec<SdtResult<String>> { paths.par_iter().map(|p| compute(p)).collect() };
    match max_workers {
        None => Ok(hash()),
        Some(workers) => Ok(worker_pool(workers)?.install(hash)),
    }
}

/// Capped pools are built once per worker count and reused; uncapped work
/// runs on rayon's global pool.
fn worker_pool(workers: usize) -> SdtResult<Arc<ThreadPool>> {
    static POOLS: OnceLock<Mutex<HashMap<usize, Arc<ThreadPool>>>> = OnceLock::new();
    let mut pools = POOLS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(pool) = pools.get(&workers) {
        return Ok(Arc::clone(pool));
    }
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("sdt-checksum-{i}"))
        .build()
        .map(Arc::new)
        .map_err(|e| SdtError::Other(anyhow::anyhow!("building checksum worker pool: {e}")))?;
    debug!(workers, "checksum worker pool started");
    pools.insert(workers, Arc::clone(&pool));
    Ok(pool)
}
