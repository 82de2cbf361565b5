//! Package metadata record and container layout.
//!
//! A package is a zip container holding exactly three members:
//! - [`DATA_FILE_ENCRYPTED`]: the signed and encrypted (optionally gzipped) tar
//! - [`METADATA_FILE`]: the [`MetaData`] record as JSON
//! - [`METADATA_FILE_SIG`]: a detached signature over the metadata bytes
//!
//! `MetaData::checksum` always covers the encrypted member, never plaintext.
//! Plaintext integrity is carried by the [`CHECKSUM_FILE`] manifest that
//! lives inside the encrypted tar.

use crate::error::{SdtError, SdtResult};
use serde::{Deserialize, Serialize};

pub const DATA_FILE_ENCRYPTED: &str = "data.tar.gz.gpg";
pub const METADATA_FILE: &str = "metadata.json";
pub const METADATA_FILE_SIG: &str = "metadata.json.sig";
pub const CHECKSUM_FILE: &str = "checksum.sha256";
pub const CONTENT_FOLDER: &str = "content";

/// Members every container must hold, in the order they are written.
pub const CONTAINER_MEMBERS: [&str; 3] = [DATA_FILE_ENCRYPTED, METADATA_FILE, METADATA_FILE_SIG];

pub const COMPRESSION_GZIP: &str = "gzip";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Purpose {
    Production,
    Test,
}

impl std::str::FromStr for Purpose {
    type Err = SdtError;

    fn from_str(s: &str) -> SdtResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PRODUCTION" => Ok(Purpose::Production),
            "TEST" => Ok(Purpose::Test),
            other => Err(SdtError::user(format!(
                "invalid purpose '{other}': expected PRODUCTION or TEST"
            ))),
        }
    }
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Purpose::Production => f.write_str("PRODUCTION"),
            Purpose::Test => f.write_str("TEST"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    pub transfer_id: Option<u64>,
    pub sender: String,
    pub recipients: Vec<String>,
    pub purpose: Option<Purpose>,
    pub checksum: String,
    pub compression_algorithm: String,
}

impl MetaData {
    pub fn new(
        transfer_id: Option<u64>,
        sender: impl Into<String>,
        recipients: Vec<String>,
        purpose: Option<Purpose>,
        checksum: impl Into<String>,
        compression_algorithm: impl Into<String>,
    ) -> SdtResult<Self> {
        let metadata = Self {
            transfer_id,
            sender: sender.into(),
            recipients,
            purpose,
            checksum: checksum.into(),
            compression_algorithm: compression_algorithm.into(),
        };
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn validate(&self) -> SdtResult<()> {
        if !is_fingerprint(&self.sender) {
            return Err(SdtError::user(format!(
                "metadata: invalid sender fingerprint '{}'",
                self.sender
            )));
        }
        if self.recipients.is_empty() {
            return Err(SdtError::user("metadata: recipient list is empty"));
        }
        if let Some(bad) = self.recipients.iter().find(|r| !is_fingerprint(r)) {
            return Err(SdtError::user(format!(
                "metadata: invalid recipient fingerprint '{bad}'"
            )));
        }
        if !is_sha256_hex(&self.checksum) {
            return Err(SdtError::user(format!(
                "metadata: invalid checksum '{}'",
                self.checksum
            )));
        }
        match self.compression_algorithm.as_str() {
            "" | COMPRESSION_GZIP => Ok(()),
            other => Err(SdtError::user(format!(
                "metadata: unsupported compression algorithm '{other}'"
            ))),
        }
    }

    /// Pretty JSON, four-space indent. These exact bytes are what gets signed.
    pub fn to_json(&self) -> SdtResult<Vec<u8>> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)
            .map_err(|e| SdtError::Other(anyhow::anyhow!("serializing metadata: {e}")))?;
        Ok(buf)
    }

    pub fn from_json(bytes: &[u8]) -> SdtResult<Self> {
        let metadata: Self = serde_json::from_slice(bytes)
            .map_err(|e| SdtError::user(format!("invalid metadata file: {e}")))?;
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn is_compressed(&self) -> bool {
        self.compression_algorithm == COMPRESSION_GZIP
    }
}

/// v4 (40 hex chars) or v6 (64 hex chars) OpenPGP fingerprint.
pub fn is_fingerprint(s: &str) -> bool {
    matches!(s.len(), 40 | 64) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}
