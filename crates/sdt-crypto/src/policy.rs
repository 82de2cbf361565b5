//! Key algorithm and length policy.

use crate::error::CryptoError;
use crate::key::{KeyAlgorithm, KeyInfo};

/// Default minimum RSA key length in bits
pub const MIN_RSA_KEY_LENGTH: u32 = 4096;

/// Check a key against the algorithm/length policy.
///
/// DSA and Elgamal primaries are rejected, RSA keys must be at least
/// `min_rsa_bits` long. ECC keys pass, and the returned message should be
/// surfaced as a warning since older OpenPGP implementations cannot use them.
pub fn verify_key_policy(key: &KeyInfo, min_rsa_bits: u32) -> Result<Option<String>, CryptoError> {
    match &key.algorithm {
        KeyAlgorithm::Rsa => match key.length {
            Some(bits) if bits >= min_rsa_bits => Ok(None),
            Some(bits) => Err(CryptoError::KeyPolicy(format!(
                "key {} is RSA {bits} bits; at least {min_rsa_bits} bits are required",
                key.describe()
            ))),
            None => Err(CryptoError::KeyPolicy(format!(
                "key {} is RSA of unknown length; at least {min_rsa_bits} bits are required",
                key.describe()
            ))),
        },
        KeyAlgorithm::Dsa => Err(CryptoError::KeyPolicy(format!(
            "key {} uses DSA, which is not supported",
            key.describe()
        ))),
        KeyAlgorithm::Elgamal => Err(CryptoError::KeyPolicy(format!(
            "key {} has an Elgamal primary key, which is not supported",
            key.describe()
        ))),
        KeyAlgorithm::Ecc => Ok(Some(format!(
            "key {} uses elliptic-curve cryptography; recipients with older OpenPGP \
             software may not be able to decrypt",
            key.describe()
        ))),
        KeyAlgorithm::Unknown(name) => Err(CryptoError::KeyPolicy(format!(
            "key {} uses an unsupported algorithm ({name})",
            key.describe()
        ))),
    }
}
