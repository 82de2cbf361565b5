use crate::error::CryptoError;
use crate::key::{KeyInfo, KeyType};
use secrecy::SecretString;
use std::io::{Read, Write};

/// Produces the plaintext by writing it into the sink it is handed.
///
/// Encryption pulls data through this callback so that archive building,
/// compression and encryption run as one streaming pass.
pub type PlaintextSource<'a> = &'a mut dyn FnMut(&mut dyn Write) -> std::io::Result<()>;

/// One capability surface over the GnuPG keyring and the certificate store.
///
/// Callers hold a `&dyn CryptoBackend` and never learn which engine is
/// behind it; both implementations share [`CryptoError`] as their error
/// taxonomy.
pub trait CryptoBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Keys whose fingerprint, key ID, email or user ID matches `term`.
    fn search_keys(&self, term: &str, key_type: KeyType) -> Result<Vec<KeyInfo>, CryptoError>;

    /// Re-fetch a key from `keyserver_url`. Returns `false` when the backend
    /// has no way to reach a key server.
    fn refresh_key(&self, fingerprint: &str, keyserver_url: &str) -> Result<bool, CryptoError>;

    /// Import armored or binary key material, returning the imported fingerprints.
    fn import_keys(&self, data: &[u8]) -> Result<Vec<String>, CryptoError>;

    /// Delete a key. `KeyType::Secret` removes the secret and public parts.
    fn delete_key(&self, fingerprint: &str, key_type: KeyType) -> Result<(), CryptoError>;

    /// Encrypt `source` for every recipient and sign it with `signer`.
    ///
    /// `always_trust = false` makes the operation fail for recipient keys the
    /// local keyring does not trust.
    fn encrypt_and_sign(
        &self,
        source: PlaintextSource<'_>,
        output: &mut (dyn Write + Send),
        recipients: &[String],
        signer: &str,
        passphrase: &SecretString,
        always_trust: bool,
    ) -> Result<(), CryptoError>;

    /// Decrypt `source` into `output`, returning the fingerprints of every
    /// valid signature found (possibly none).
    fn decrypt(
        &self,
        source: &mut (dyn Read + Send + Sync),
        output: &mut (dyn Write + Send),
        passphrase: &SecretString,
    ) -> Result<Vec<String>, CryptoError>;

    /// ASCII-armored detached signature over `data`.
    fn create_detached_signature(
        &self,
        data: &[u8],
        signer: &str,
        passphrase: &SecretString,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Verify a detached signature and return the signer's fingerprint.
    fn verify_detached_signature(&self, data: &[u8], signature: &[u8]) -> Result<String, CryptoError>;
}
