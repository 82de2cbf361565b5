//! Backend-neutral description of an OpenPGP key.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Public,
    Secret,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Public => f.write_str("public"),
            KeyType::Secret => f.write_str("secret"),
        }
    }
}

/// Primary key algorithm family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    Dsa,
    Elgamal,
    /// Any elliptic-curve algorithm (ECDH, ECDSA, EdDSA, X25519, Ed25519, ...)
    Ecc,
    Unknown(String),
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa => f.write_str("RSA"),
            KeyAlgorithm::Dsa => f.write_str("DSA"),
            KeyAlgorithm::Elgamal => f.write_str("Elgamal"),
            KeyAlgorithm::Ecc => f.write_str("ECC"),
            KeyAlgorithm::Unknown(name) => write!(f, "unknown ({name})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Expired,
    Revoked,
    Invalid,
    Unknown,
}

impl Validity {
    pub fn is_usable(self) -> bool {
        matches!(self, Validity::Valid | Validity::Unknown)
    }
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Validity::Valid => "valid",
            Validity::Expired => "expired",
            Validity::Revoked => "revoked",
            Validity::Invalid => "invalid",
            Validity::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub key_type: KeyType,
    /// Uppercase hex fingerprint of the primary key
    pub fingerprint: String,
    pub key_id: String,
    pub uids: Vec<String>,
    pub algorithm: KeyAlgorithm,
    /// Key length in bits, when the backend reports one
    pub length: Option<u32>,
    pub validity: Validity,
}

impl KeyInfo {
    /// Email addresses from the user IDs, `Name <addr>` or bare `addr` form.
    pub fn emails(&self) -> Vec<String> {
        self.uids.iter().filter_map(|uid| email_of(uid)).collect()
    }

    pub fn primary_uid(&self) -> &str {
        self.uids.first().map(String::as_str).unwrap_or("")
    }

    /// `FINGERPRINT (Name <email>)` for messages.
    pub fn describe(&self) -> String {
        match self.uids.first() {
            Some(uid) => format!("{} ({uid})", self.fingerprint),
            None => self.fingerprint.clone(),
        }
    }
}

pub(crate) fn email_of(uid: &str) -> Option<String> {
    if let (Some(start), Some(end)) = (uid.rfind('<'), uid.rfind('>')) {
        if start < end {
            let addr = uid[start + 1..end].trim();
            return addr.contains('@').then(|| addr.to_ascii_lowercase());
        }
    }
    let bare = uid.trim();
    (bare.contains('@') && !bare.contains(char::is_whitespace)).then(|| bare.to_ascii_lowercase())
}

/// Canonical form for comparing fingerprints and key IDs.
pub fn normalize_id(input: &str) -> String {
    input
        .trim()
        .trim_start_matches("0x")
        .replace([' ', '\t'], "")
        .to_uppercase()
}

pub(crate) fn is_hex_id(s: &str) -> bool {
    matches!(s.len(), 8 | 16 | 40 | 64) && s.bytes().all(|b| b.is_ascii_hexdigit())
}
