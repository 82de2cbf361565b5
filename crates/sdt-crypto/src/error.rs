use sdt_core::SdtError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// No key, or more than one key, matched a search term.
    #[error("{0}")]
    KeyResolution(String),

    /// Key algorithm, length or validity is not acceptable.
    #[error("{0}")]
    KeyPolicy(String),

    #[error("{0}")]
    KeyNotApproved(String),

    #[error("wrong passphrase for key {0}")]
    WrongPassphrase(String),

    #[error(
        "recipient key {0} is not trusted: sign it with your own key, \
         or enable always_trust_recipient_key in the config"
    )]
    UntrustedRecipient(String),

    #[error("{0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CryptoError {
    pub(crate) fn backend(context: &str, err: impl std::fmt::Display) -> Self {
        CryptoError::Backend(format!("{context}: {err}"))
    }
}

impl From<CryptoError> for SdtError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Io(e) => SdtError::Io(e),
            CryptoError::Backend(msg) => {
                SdtError::service("OpenPGP backend error", anyhow::anyhow!(msg))
            }
            other => SdtError::User(other.to_string()),
        }
    }
}
