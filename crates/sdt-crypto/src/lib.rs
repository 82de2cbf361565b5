//! sdt-crypto: OpenPGP operations behind one [`CryptoBackend`] trait.
//!
//! Two engines implement it: [`GpgBackend`] drives a GnuPG keyring
//! (legacy mode) and [`CertStoreBackend`] uses Sequoia with a file-based
//! certificate store. [`open_backend`] picks one from the config; nothing
//! else in the workspace looks at which one is active.

pub mod backend;
pub mod certstore;
pub mod error;
pub mod gpg;
pub mod identity;
pub mod key;
pub mod passphrase;
pub mod policy;

pub use backend::{CryptoBackend, PlaintextSource};
pub use certstore::CertStoreBackend;
pub use error::CryptoError;
pub use gpg::GpgBackend;
pub use identity::{check_passphrase, ensure_secret_key, resolve_identity, retrieve_and_validate};
pub use key::{normalize_id, KeyAlgorithm, KeyInfo, KeyType, Validity};
pub use passphrase::PassphraseSource;
pub use policy::{verify_key_policy, MIN_RSA_KEY_LENGTH};

use sdt_core::config::SdtConfig;

/// Construct the backend selected by `legacy_mode`.
pub fn open_backend(config: &SdtConfig) -> Box<dyn CryptoBackend> {
    let backend: Box<dyn CryptoBackend> = if config.legacy_mode {
        Box::new(GpgBackend::from_config(&config.gpg))
    } else {
        Box::new(CertStoreBackend::from_config(&config.cert_store))
    };
    tracing::debug!(backend = backend.name(), "crypto backend selected");
    backend
}
