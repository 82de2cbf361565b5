//! Contracts for the remote services the workflows consult.
//!
//! Neither trait has an HTTP implementation in this workspace; callers plug
//! in their own client and tests use in-memory fakes.

use crate::metadata::MetaData;
use serde::{Deserialize, Serialize};

/// Approval state of a key as recorded by the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStatus {
    Approved,
    Pending,
    Rejected,
    Revoked,
    Deleted,
    KeyRevoked,
    UnknownKey,
}

impl KeyStatus {
    pub fn is_approved(self) -> bool {
        self == KeyStatus::Approved
    }
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KeyStatus::Approved => "APPROVED",
            KeyStatus::Pending => "PENDING",
            KeyStatus::Rejected => "REJECTED",
            KeyStatus::Revoked => "REVOKED",
            KeyStatus::Deleted => "DELETED",
            KeyStatus::KeyRevoked => "KEY_REVOKED",
            KeyStatus::UnknownKey => "UNKNOWN_KEY",
        };
        f.write_str(s)
    }
}

/// Authorization service ("portal") that knows about Data Transfer Requests.
pub trait PortalApi: Send + Sync {
    /// Approval status for each fingerprint. Fingerprints missing from the
    /// answer are treated as [`KeyStatus::UnknownKey`].
    fn verify_key_approval(&self, fingerprints: &[String])
        -> anyhow::Result<Vec<(String, KeyStatus)>>;

    /// Validate a package's metadata against its DTR and return the project code.
    fn verify_dpkg_metadata(&self, metadata: &MetaData, file_name: &str) -> anyhow::Result<String>;
}

/// Key server client used by the certificate-store backend to refresh keys.
pub trait KeyServer: Send + Sync {
    /// Armored or binary certificate for `fingerprint`.
    fn fetch(&self, keyserver_url: &str, fingerprint: &str) -> anyhow::Result<Vec<u8>>;
}
