//! Where a signing passphrase comes from.

use sdt_core::{SdtError, SdtResult};
use secrecy::{ExposeSecret, SecretString};
use std::process::{Command, Stdio};
use zeroize::Zeroizing;

pub type PromptFn = Box<dyn Fn() -> std::io::Result<SecretString> + Send + Sync>;

pub enum PassphraseSource {
    /// Passphrase given directly.
    Value(SecretString),
    /// Shell command whose stdout (trailing newline stripped) is the passphrase.
    Command(String),
    /// Interactive prompt, typically a terminal or dialog.
    Prompt(PromptFn),
}

impl std::fmt::Debug for PassphraseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassphraseSource::Value(_) => f.write_str("Value([REDACTED])"),
            PassphraseSource::Command(cmd) => f.debug_tuple("Command").field(cmd).finish(),
            PassphraseSource::Prompt(_) => f.write_str("Prompt"),
        }
    }
}

impl PassphraseSource {
    pub fn resolve(&self) -> SdtResult<SecretString> {
        match self {
            PassphraseSource::Value(secret) => Ok(SecretString::from(secret.expose_secret().to_owned())),
            PassphraseSource::Command(cmd) => run_command(cmd),
            PassphraseSource::Prompt(prompt) => {
                prompt().map_err(|e| SdtError::user(format!("failed to read passphrase: {e}")))
            }
        }
    }
}

fn run_command(cmd: &str) -> SdtResult<SecretString> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .output()
        .map_err(|e| SdtError::user(format!("failed to run passphrase command '{cmd}': {e}")))?;
    let stdout = Zeroizing::new(output.stdout);
    if !output.status.success() {
        return Err(SdtError::user(format!(
            "passphrase command '{cmd}' exited with {}",
            output.status
        )));
    }
    let text = std::str::from_utf8(&stdout)
        .map_err(|_| SdtError::user(format!("passphrase command '{cmd}' printed non-UTF-8 output")))?;
    let passphrase = text.trim_end_matches(['\r', '\n']);
    if passphrase.is_empty() {
        return Err(SdtError::user(format!("passphrase command '{cmd}' printed nothing")));
    }
    Ok(SecretString::from(passphrase.to_owned()))
}
