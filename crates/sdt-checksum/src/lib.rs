//! sdt-checksum: SHA-256 checksums for package building and verification
//!
//! # Overview
//! - `sha256`: streaming file hashing and a write-through hashing sink
//! - `manifest`: parallel `sha256sum`-compatible manifest generation, parsing and verification

pub mod manifest;
pub mod sha256;

pub use manifest::{generate_manifest, read_manifest, verify_manifest, verify_many};
pub use sha256::{compute, compute_bytes, compute_on_write, compute_reader, HashingWriter, BLOCK_SIZE};
