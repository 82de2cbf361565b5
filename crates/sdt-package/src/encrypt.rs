//! Package Assembler: files in, one signed and encrypted container out.
//!
//! Stages run strictly in order and each one is a hard gate. Nothing is
//! written before the dry-run point; from the passphrase check on, a failure
//! removes the partially written container.

use crate::archive::{compression_algorithm, write_tar, ArchiveFile, ProgressWriter};
use crate::container::{self, member_options, zip_error};
use crate::dtr::verify_dtr_info;
use crate::filesystem::{
    archive_paths, check_paths_on_posix, check_read_permission, check_space, compression_stats,
    search_files_recursively, total_size, DeleteOnError,
};
use crate::naming::{generate_output_archive_name, resolve_output_path};
use crate::session::Session;
use chrono::Local;
use sdt_checksum::{generate_manifest, HashingWriter};
use sdt_core::metadata::{CHECKSUM_FILE, DATA_FILE_ENCRYPTED, METADATA_FILE, METADATA_FILE_SIG};
use sdt_core::{MetaData, Progress, Purpose, SdtError, SdtResult, Warnings};
use sdt_crypto::{check_passphrase, ensure_secret_key, retrieve_and_validate, KeyInfo, PassphraseSource};
use secrecy::SecretString;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct EncryptOptions {
    pub files: Vec<PathBuf>,
    /// Email, fingerprint or key ID; falls back to `default_sender`.
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    /// DTR ID recorded as `transfer_id`
    pub transfer_id: Option<u64>,
    pub purpose: Option<Purpose>,
    /// Output directory or file name overriding the generated one
    pub output: Option<PathBuf>,
    pub output_suffix: Option<String>,
    /// 0 to 9; overrides `compression_level` from the config
    pub compression_level: Option<u32>,
    pub force: bool,
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct EncryptReport {
    /// `None` for a dry run
    pub output: Option<PathBuf>,
    pub warnings: Warnings,
}

fn invalid_arg(arg: &str, reason: impl std::fmt::Display) -> SdtError {
    SdtError::user(format!("Invalid value for argument '{arg}': {reason}."))
}

pub fn encrypt(
    session: &Session<'_>,
    opts: &EncryptOptions,
    passphrase: &PassphraseSource,
    progress: &dyn Progress,
) -> SdtResult<EncryptReport> {
    let config = session.config;
    let mut warnings = Warnings::new();

    let level = opts.compression_level.unwrap_or(config.compression_level);
    if level > 9 {
        return Err(invalid_arg(
            "compression level",
            format!("Value must be in the range: [0-9], got {level}"),
        ));
    }
    let sender = opts
        .sender
        .as_deref()
        .or(config.default_sender.as_deref())
        .ok_or_else(|| invalid_arg("sender", "no sender given and no default_sender configured"))?;
    if opts.recipients.is_empty() {
        return Err(invalid_arg("recipients", "at least one recipient is required"));
    }

    info!("retrieving sender and recipient keys");
    let identifiers: Vec<String> = std::iter::once(sender.to_string())
        .chain(opts.recipients.iter().cloned())
        .collect();
    let mut keys = retrieve_and_validate(session.crypto, &identifiers, config, session.portal, &mut warnings)?;
    let sender_key = keys.remove(0);
    ensure_secret_key(session.crypto, &sender_key.fingerprint)?;
    let recipients: Vec<String> = keys.iter().map(|k| k.fingerprint.clone()).collect();
    info!(sender = %sender_key.describe(), "sender");
    for key in &keys {
        info!(recipient = %key.describe(), "recipient");
    }

    let project_code = if config.verify_dtr {
        Some(verify_dtr_info(
            session.portal,
            opts.transfer_id,
            opts.purpose,
            &sender_key.fingerprint,
            &recipients,
        )?)
    } else {
        None
    };

    let output_dir = match &config.output_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let suffix = opts
        .output_suffix
        .as_deref()
        .or(config.package_name_suffix.as_deref());
    let default_name = generate_output_archive_name(project_code.as_deref(), &Local::now(), suffix);
    let output = resolve_output_path(&output_dir, &default_name, opts.output.as_deref())?;

    let files = search_files_recursively(&opts.files)?;
    if files.is_empty() {
        return Err(SdtError::user(
            "No input files found. Did you try encrypting an empty directory?",
        ));
    }
    check_read_permission(&files)?;
    let archive_paths = archive_paths(&files)?;
    check_paths_on_posix(&archive_paths)?;

    let total = total_size(&files)?;
    let destination = output.parent().unwrap_or(Path::new("."));
    check_space(
        total.saturating_add(config.min_free_space),
        destination,
        opts.force,
        &mut warnings,
    )?;

    if opts.dry_run {
        info!(files = files.len(), "dry run completed successfully");
        return Ok(EncryptReport {
            output: None,
            warnings,
        });
    }

    // A wrong passphrase must fail before any output exists.
    let passphrase = passphrase.resolve()?;
    check_passphrase(session.crypto, &sender_key.fingerprint, &passphrase)?;

    let guard = DeleteOnError::new(&output);

    info!(files = files.len(), "computing checksums of input files");
    let entries: Vec<(String, PathBuf)> = archive_paths.into_iter().zip(files).collect();
    let manifest = generate_manifest(&entries, config.max_workers())?;
    let mut archive = Vec::with_capacity(entries.len() + 1);
    archive.push(ArchiveFile::in_memory(CHECKSUM_FILE, manifest));
    archive.extend(entries.into_iter().map(|(path, src)| ArchiveFile::file(path, src)));

    info!(output = %output.display(), "compressing and encrypting");
    let package = PackageContents {
        archive: &archive,
        level,
        total,
        sender: &sender_key,
        recipients: &recipients,
        transfer_id: opts.transfer_id,
        purpose: opts.purpose,
    };
    write_package(session, &output, &package, &passphrase, progress)?;
    guard.disarm();

    let size = std::fs::metadata(&output)?.len();
    info!(
        output = %output.display(),
        stats = %compression_stats(total, size),
        "data encryption completed"
    );
    Ok(EncryptReport {
        output: Some(output),
        warnings,
    })
}

struct PackageContents<'a> {
    archive: &'a [ArchiveFile],
    level: u32,
    total: u64,
    sender: &'a KeyInfo,
    recipients: &'a [String],
    transfer_id: Option<u64>,
    purpose: Option<Purpose>,
}

/// Stream tar, compression, encryption and hashing into the container in one
/// pass, then add the signed metadata.
fn write_package(
    session: &Session<'_>,
    output: &Path,
    package: &PackageContents<'_>,
    passphrase: &SecretString,
    progress: &dyn Progress,
) -> SdtResult<MetaData> {
    let mut zip = container::create(output)?;
    zip.start_file(DATA_FILE_ENCRYPTED, member_options())
        .map_err(zip_error)?;

    let mut hashing = HashingWriter::new(&mut zip);
    let mut source = |sink: &mut dyn Write| {
        let sink = ProgressWriter::new(sink, package.total, "compress and encrypt", progress);
        write_tar(package.archive, package.level, sink).map(|_| ())
    };
    session.crypto.encrypt_and_sign(
        &mut source,
        &mut hashing,
        package.recipients,
        &package.sender.fingerprint,
        passphrase,
        session.config.always_trust_recipient_key,
    )?;
    let (_, checksum) = hashing.finish();

    let metadata = MetaData::new(
        package.transfer_id,
        package.sender.fingerprint.clone(),
        package.recipients.to_vec(),
        package.purpose,
        checksum,
        compression_algorithm(package.level),
    )?;
    let json = metadata.to_json()?;
    let signature = session
        .crypto
        .create_detached_signature(&json, &package.sender.fingerprint, passphrase)?;
    container::write_member(&mut zip, METADATA_FILE, &json)?;
    container::write_member(&mut zip, METADATA_FILE_SIG, &signature)?;
    zip.finish().map_err(zip_error)?.sync_all()?;
    Ok(metadata)
}
