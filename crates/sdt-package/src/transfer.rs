//! Package Verifier: re-check finished packages, then hand them to a
//! transfer protocol grouped by recipient set.
//!
//! Every package is verified before anything is uploaded. One failing
//! package does not stop the verification of the others, but it does stop
//! the whole upload. A dry run reports the outcome of every package instead
//! of failing.

use crate::container::Container;
use crate::dtr::verify_package_dtr;
use crate::naming::check_package_name;
use crate::session::Session;
use sdt_core::{MetaData, Progress, SdtError, SdtResult};
use sdt_crypto::{resolve_identity, KeyType};
use sdt_transfer::{TransferProtocol, TwoFactor};
use secrecy::SecretString;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    pub packages: Vec<PathBuf>,
    /// Verify every package, upload nothing.
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct VerifiedPackage {
    pub path: PathBuf,
    pub metadata: MetaData,
    pub recipient_emails: BTreeSet<String>,
    /// Set when the DTR was re-verified.
    pub project_code: Option<String>,
}

#[derive(Debug, Default)]
pub struct TransferReport {
    pub verified: Vec<VerifiedPackage>,
    /// Packages that failed verification; only a dry run returns these.
    pub failed: Vec<(PathBuf, SdtError)>,
    /// One entry per upload call, in upload order.
    pub uploads: Vec<Vec<PathBuf>>,
}

impl TransferReport {
    /// Every package passed verification.
    pub fn all_verified(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Structure, metadata, recipient identities, DTR and name, in that order.
pub fn verify_package(session: &Session<'_>, path: &Path) -> SdtResult<VerifiedPackage> {
    let config = session.config;
    let mut container = Container::open(path)?;
    let (metadata, _, _) = container.read_metadata()?;

    let mut recipient_emails = BTreeSet::new();
    for fingerprint in &metadata.recipients {
        let key = resolve_identity(session.crypto, fingerprint, KeyType::Public)?;
        let emails = key.emails();
        if emails.is_empty() {
            return Err(SdtError::user(format!(
                "Recipient key {} has no email address",
                key.describe()
            )));
        }
        recipient_emails.extend(emails);
    }

    let file_name = container.file_name();
    let project_code = if config.verify_dtr {
        Some(verify_package_dtr(session.portal, &metadata, &file_name)?)
    } else {
        None
    };
    if config.verify_package_name {
        check_package_name(
            &file_name,
            project_code.as_deref(),
            config.package_name_suffix.as_deref(),
        )?;
    }

    Ok(VerifiedPackage {
        path: path.to_path_buf(),
        metadata,
        recipient_emails,
        project_code,
    })
}

/// Verify each package independently; results keep the input order.
pub fn verify_packages(
    session: &Session<'_>,
    paths: &[PathBuf],
) -> Vec<(PathBuf, SdtResult<VerifiedPackage>)> {
    paths
        .iter()
        .map(|path| {
            let result = verify_package(session, path);
            match &result {
                Ok(pkg) => info!(
                    package = %path.display(),
                    recipients = ?pkg.recipient_emails,
                    "package verified"
                ),
                Err(e) => warn!(package = %path.display(), error = %e, "package verification failed"),
            }
            (path.clone(), result)
        })
        .collect()
}

/// Packages going to exactly the same set of recipient emails share a group.
pub fn group_by_recipients(packages: &[VerifiedPackage]) -> BTreeMap<BTreeSet<String>, Vec<PathBuf>> {
    let mut groups: BTreeMap<BTreeSet<String>, Vec<PathBuf>> = BTreeMap::new();
    for pkg in packages {
        groups
            .entry(pkg.recipient_emails.clone())
            .or_default()
            .push(pkg.path.clone());
    }
    groups
}

/// Verify all packages, then upload them one recipient group at a time.
///
/// Secrets the protocol still lacks are requested through `secret_prompt`
/// once, before the first upload. A real run fails if any package fails
/// verification; a dry run returns both lists in the report.
pub fn transfer(
    session: &Session<'_>,
    opts: &TransferOptions,
    protocol: &mut dyn TransferProtocol,
    secret_prompt: &dyn Fn(&str) -> SdtResult<SecretString>,
    two_factor: TwoFactor<'_>,
    progress: &dyn Progress,
) -> SdtResult<TransferReport> {
    if opts.packages.is_empty() {
        return Err(SdtError::user("No packages given"));
    }

    let mut report = TransferReport::default();
    for (path, result) in verify_packages(session, &opts.packages) {
        match result {
            Ok(pkg) => report.verified.push(pkg),
            Err(e) => report.failed.push((path, e)),
        }
    }

    let groups = group_by_recipients(&report.verified);
    if opts.dry_run {
        info!(
            verified = report.verified.len(),
            failed = report.failed.len(),
            groups = groups.len(),
            "dry run completed"
        );
        return Ok(report);
    }
    if !report.all_verified() {
        let failures: Vec<String> = report
            .failed
            .iter()
            .map(|(path, e)| format!("{}: {e}", path.display()))
            .collect();
        return Err(SdtError::user(format!(
            "{} of {} package(s) failed verification, nothing was transferred:\n{}",
            failures.len(),
            opts.packages.len(),
            failures.join("\n")
        )));
    }

    for name in protocol.required_password_args() {
        if !protocol.has_secret(name) {
            let value = secret_prompt(name)?;
            protocol.set_secret(name, value)?;
        }
    }
    for (recipients, files) in groups {
        info!(
            protocol = protocol.name(),
            recipients = ?recipients,
            files = files.len(),
            "transferring"
        );
        protocol.upload(&files, two_factor, progress)?;
        report.uploads.push(files);
    }
    info!(packages = report.verified.len(), "data transfer completed");
    Ok(report)
}
