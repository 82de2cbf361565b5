//! Decrypt workflow: verify a package, decrypt it and check its content.

use crate::archive::{unpack_tar, ProgressWriter};
use crate::container::Container;
use crate::filesystem::DeleteOnError;
use crate::naming::check_writable_dir;
use crate::session::Session;
use sdt_checksum::{verify_manifest, HashingWriter};
use sdt_core::metadata::CHECKSUM_FILE;
use sdt_core::{MetaData, Progress, SdtError, SdtResult, Warnings};
use sdt_crypto::PassphraseSource;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct DecryptOptions {
    pub package: PathBuf,
    /// Defaults to `output_dir` from the config, then the current directory.
    pub output_dir: Option<PathBuf>,
    /// Write the decrypted tar as-is instead of extracting it.
    pub decrypt_only: bool,
    pub dry_run: bool,
}

#[derive(Debug)]
pub struct DecryptReport {
    /// Extracted directory or decrypted tar; `None` for a dry run
    pub output: Option<PathBuf>,
    pub metadata: MetaData,
    /// Fingerprints of the valid signatures on the payload
    pub signers: Vec<String>,
    pub warnings: Warnings,
}

/// Open `path` and check the metadata signature against the sender it names.
pub fn open_verified(session: &Session<'_>, path: &Path) -> SdtResult<(Container, MetaData)> {
    let mut container = Container::open(path)?;
    let (metadata, raw, signature) = container.read_metadata()?;
    let signer = session
        .crypto
        .verify_detached_signature(&raw, &signature)
        .map_err(|e| {
            SdtError::user(format!(
                "Invalid metadata signature in '{}': {e}",
                path.display()
            ))
        })?;
    if !signer.eq_ignore_ascii_case(&metadata.sender) {
        return Err(SdtError::user(format!(
            "Metadata of '{}' is signed by {signer}, not by its sender {}",
            path.display(),
            metadata.sender
        )));
    }
    Ok((container, metadata))
}

pub fn decrypt(
    session: &Session<'_>,
    opts: &DecryptOptions,
    passphrase: &PassphraseSource,
    progress: &dyn Progress,
) -> SdtResult<DecryptReport> {
    let config = session.config;
    let mut warnings = Warnings::new();

    let (mut container, metadata) = open_verified(session, &opts.package)?;
    info!(package = %opts.package.display(), sender = %metadata.sender, "metadata signature verified");

    let out_dir = match opts.output_dir.as_ref().or(config.output_dir.as_ref()) {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    check_writable_dir(&out_dir)?;
    let stem = opts
        .package
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "package".into());
    let target = if opts.decrypt_only {
        let ext = if metadata.is_compressed() { "tar.gz" } else { "tar" };
        out_dir.join(format!("{stem}.{ext}"))
    } else {
        out_dir.join(&stem)
    };
    if target.exists() {
        return Err(SdtError::user(format!(
            "Output '{}' already exists",
            target.display()
        )));
    }

    if opts.dry_run {
        info!(output = %target.display(), "dry run completed successfully");
        return Ok(DecryptReport {
            output: None,
            metadata,
            signers: Vec::new(),
            warnings,
        });
    }

    let mut payload = tempfile::tempfile_in(&out_dir)?;
    let mut hashing = HashingWriter::new(&mut payload);
    let size = container.copy_payload(&mut hashing)?;
    let (_, checksum) = hashing.finish();
    if !checksum.eq_ignore_ascii_case(&metadata.checksum) {
        return Err(SdtError::ChecksumMismatch {
            path: opts.package.clone(),
            expected: metadata.checksum,
            actual: checksum,
        });
    }
    payload.seek(SeekFrom::Start(0))?;

    let passphrase = passphrase.resolve()?;
    let guard = DeleteOnError::new(&target);
    let signers = if opts.decrypt_only {
        let mut out = ProgressWriter::new(File::create(&target)?, size, "decrypt", progress);
        session.crypto.decrypt(&mut payload, &mut out, &passphrase)?
    } else {
        let mut plain = tempfile::tempfile_in(&out_dir)?;
        let signers = {
            let mut out = ProgressWriter::new(&mut plain, size, "decrypt", progress);
            session.crypto.decrypt(&mut payload, &mut out, &passphrase)?
        };
        plain.seek(SeekFrom::Start(0))?;
        info!(output = %target.display(), "extracting");
        unpack_tar(BufReader::new(plain), metadata.is_compressed(), &target)?;

        let manifest = File::open(target.join(CHECKSUM_FILE)).map_err(|e| {
            SdtError::user(format!("Package has no readable {CHECKSUM_FILE}: {e}"))
        })?;
        let verified = verify_manifest(BufReader::new(manifest), &target, config.max_workers())?;
        info!(files = verified, "content checksums verified");
        signers
    };
    guard.disarm();

    match signers.as_slice() {
        [] => warnings.push("Decrypted data carries no valid signature"),
        [signer] if !signer.eq_ignore_ascii_case(&metadata.sender) => warnings.push(format!(
            "Decrypted data is signed by {signer}, not by the package sender {}",
            metadata.sender
        )),
        [_] => {}
        many => warnings.push(format!(
            "Decrypted data carries {} signatures: {}",
            many.len(),
            many.join(", ")
        )),
    }

    info!(output = %target.display(), "data decryption completed");
    Ok(DecryptReport {
        output: Some(target),
        metadata,
        signers,
        warnings,
    })
}
