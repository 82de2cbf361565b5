//! Key resolution and the checks every workflow runs on the keys it uses.

use crate::backend::CryptoBackend;
use crate::error::CryptoError;
use crate::key::{is_hex_id, normalize_id, KeyInfo, KeyType};
use crate::policy::verify_key_policy;
use sdt_core::config::SdtConfig;
use sdt_core::portal::{KeyStatus, PortalApi};
use sdt_core::{SdtError, SdtResult, Warnings};
use secrecy::SecretString;
use tracing::debug;

const PASSPHRASE_PROBE: &[u8] = b"sdt passphrase check";

/// Resolve `term` (email, fingerprint or key ID) to exactly one key.
pub fn resolve_identity(backend: &dyn CryptoBackend, term: &str, key_type: KeyType) -> SdtResult<KeyInfo> {
    let mut keys = backend.search_keys(term, key_type)?;
    match keys.len() {
        0 => Err(CryptoError::KeyResolution(format!("No {key_type} key matching '{term}' found")).into()),
        1 => Ok(keys.remove(0)),
        _ => {
            let listing: Vec<String> = keys.iter().map(KeyInfo::describe).collect();
            Err(CryptoError::KeyResolution(format!(
                "Multiple {key_type} keys match '{term}': {}. Use the full fingerprint instead",
                listing.join(", ")
            ))
            .into())
        }
    }
}

/// Resolve the sender's secret key and make sure it can still be used.
pub fn ensure_secret_key(backend: &dyn CryptoBackend, term: &str) -> SdtResult<KeyInfo> {
    let key = resolve_identity(backend, term, KeyType::Secret)?;
    if !key.validity.is_usable() {
        return Err(CryptoError::KeyPolicy(format!("secret key {} is {}", key.describe(), key.validity)).into());
    }
    Ok(key)
}

/// Resolve, refresh and vet the public keys behind `identifiers`.
///
/// Keys are refreshed from the key server when the config allows it. With
/// `verify_key_approval` set every key must be approved by the portal; a
/// single unapproved key fails the whole batch.
pub fn retrieve_and_validate(
    backend: &dyn CryptoBackend,
    identifiers: &[String],
    config: &SdtConfig,
    portal: Option<&dyn PortalApi>,
    warnings: &mut Warnings,
) -> SdtResult<Vec<KeyInfo>> {
    let mut keys = Vec::with_capacity(identifiers.len());
    for term in identifiers {
        keys.push(retrieve(backend, term, config, warnings)?);
    }
    for key in &keys {
        if !key.validity.is_usable() {
            return Err(CryptoError::KeyPolicy(format!("key {} is {}", key.describe(), key.validity)).into());
        }
        if let Some(warning) = verify_key_policy(key, config.min_rsa_key_length)? {
            warnings.push(warning);
        }
    }
    if config.verify_key_approval {
        check_approval(&keys, portal)?;
    }
    Ok(keys)
}

fn retrieve(
    backend: &dyn CryptoBackend,
    term: &str,
    config: &SdtConfig,
    warnings: &mut Warnings,
) -> SdtResult<KeyInfo> {
    let keyserver = config
        .keyserver_url
        .as_deref()
        .filter(|_| config.allow_key_download);
    if let Some(url) = keyserver {
        let local = backend.search_keys(term, KeyType::Public)?;
        let id = normalize_id(term);
        if local.is_empty() && is_hex_id(&id) && id.len() >= 40 {
            debug!(fingerprint = %id, keyserver = url, "key not in local store, downloading");
            backend
                .refresh_key(&id, url)
                .map_err(|e| SdtError::service(format!("downloading key {id} from {url}"), e))?;
        } else if let [key] = local.as_slice() {
            if let Err(e) = backend.refresh_key(&key.fingerprint, url) {
                warnings.push(format!("could not refresh key {} from {url}: {e}", key.describe()));
            }
        }
    }
    resolve_identity(backend, term, KeyType::Public)
}

fn check_approval(keys: &[KeyInfo], portal: Option<&dyn PortalApi>) -> SdtResult<()> {
    let portal = portal.ok_or_else(|| {
        SdtError::user("Key approval verification is enabled but no portal is configured")
    })?;
    let fingerprints: Vec<String> = keys.iter().map(|k| k.fingerprint.clone()).collect();
    let statuses = portal
        .verify_key_approval(&fingerprints)
        .map_err(|e| SdtError::service("key approval check failed", e))?;

    let unapproved: Vec<String> = keys
        .iter()
        .filter_map(|key| {
            let status = statuses
                .iter()
                .find(|(fpr, _)| normalize_id(fpr) == key.fingerprint)
                .map(|(_, status)| *status)
                .unwrap_or(KeyStatus::UnknownKey);
            (!status.is_approved()).then(|| format!("{} ({status})", key.describe()))
        })
        .collect();
    if !unapproved.is_empty() {
        return Err(CryptoError::KeyNotApproved(format!(
            "The following keys are not approved: {}",
            unapproved.join(", ")
        ))
        .into());
    }
    Ok(())
}

/// Check a passphrase by signing a small payload with the secret key.
pub fn check_passphrase(
    backend: &dyn CryptoBackend,
    fingerprint: &str,
    passphrase: &SecretString,
) -> SdtResult<()> {
    backend.create_detached_signature(PASSPHRASE_PROBE, fingerprint, passphrase)?;
    Ok(())
}
