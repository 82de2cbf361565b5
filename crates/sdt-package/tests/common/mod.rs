//! In-memory crypto backend and portal for workflow tests.
#![allow(dead_code)]

use sdt_checksum::compute_bytes;
use sdt_core::config::SdtConfig;
use sdt_core::portal::{KeyStatus, PortalApi};
use sdt_core::{MetaData, SdtResult};
use sdt_crypto::{CryptoBackend, CryptoError, KeyAlgorithm, KeyInfo, KeyType, PassphraseSource, PlaintextSource, Validity};
use sdt_transfer::{TransferProtocol, TwoFactor};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const SENDER: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
pub const BOB: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";
pub const CAROL: &str = "CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC";
pub const SENDER_PASS: &str = "sender-pass";
pub const BOB_PASS: &str = "bob-pass";

const MAGIC: &[u8] = b"FAKE";

/// Keys are plain records; "encryption" prepends a header naming the signer
/// and recipients, signatures are `SIG:<signer>:<sha256 of data>`.
pub struct FakeBackend {
    keys: Vec<KeyInfo>,
    /// Fingerprint to passphrase, for keys with a secret part
    secrets: HashMap<String, String>,
    /// Abort `encrypt_and_sign` after the header has been written
    broken_stream: bool,
}

fn key(fingerprint: &str, email: &str) -> KeyInfo {
    KeyInfo {
        key_type: KeyType::Public,
        fingerprint: fingerprint.to_string(),
        key_id: fingerprint[24..].to_string(),
        uids: vec![format!("Test User <{email}>")],
        algorithm: KeyAlgorithm::Rsa,
        length: Some(4096),
        validity: Validity::Valid,
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            keys: vec![
                key(SENDER, "sender@example.org"),
                key(BOB, "bob@example.org"),
                key(CAROL, "carol@example.org"),
            ],
            secrets: HashMap::from([
                (SENDER.to_string(), SENDER_PASS.to_string()),
                (BOB.to_string(), BOB_PASS.to_string()),
            ]),
            broken_stream: false,
        }
    }

    /// Encryption fails midway, leaving a partial payload behind.
    pub fn with_broken_stream(mut self) -> Self {
        self.broken_stream = true;
        self
    }

    /// Drop a key, as if it was never imported.
    pub fn without(mut self, fingerprint: &str) -> Self {
        self.keys.retain(|k| k.fingerprint != fingerprint);
        self.secrets.remove(fingerprint);
        self
    }

    fn unlock(&self, fingerprint: &str, passphrase: &SecretString) -> Result<(), CryptoError> {
        match self.secrets.get(fingerprint) {
            Some(p) if p == passphrase.expose_secret() => Ok(()),
            Some(_) => Err(CryptoError::WrongPassphrase(fingerprint.to_string())),
            None => Err(CryptoError::KeyResolution(format!("no secret key {fingerprint}"))),
        }
    }
}

impl CryptoBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn search_keys(&self, term: &str, key_type: KeyType) -> Result<Vec<KeyInfo>, CryptoError> {
        let id = sdt_crypto::normalize_id(term);
        Ok(self
            .keys
            .iter()
            .filter(|k| k.fingerprint.ends_with(&id) || k.emails().contains(&term.to_lowercase()))
            .filter(|k| key_type == KeyType::Public || self.secrets.contains_key(&k.fingerprint))
            .map(|k| KeyInfo {
                key_type,
                ..k.clone()
            })
            .collect())
    }

    fn refresh_key(&self, _fingerprint: &str, _keyserver_url: &str) -> Result<bool, CryptoError> {
        Ok(false)
    }

    fn import_keys(&self, _data: &[u8]) -> Result<Vec<String>, CryptoError> {
        Err(CryptoError::Backend("import not supported".into()))
    }

    fn delete_key(&self, _fingerprint: &str, _key_type: KeyType) -> Result<(), CryptoError> {
        Err(CryptoError::Backend("delete not supported".into()))
    }

    fn encrypt_and_sign(
        &self,
        source: PlaintextSource<'_>,
        output: &mut (dyn Write + Send),
        recipients: &[String],
        signer: &str,
        passphrase: &SecretString,
        _always_trust: bool,
    ) -> Result<(), CryptoError> {
        self.unlock(signer, passphrase)?;
        output.write_all(MAGIC)?;
        writeln!(output)?;
        writeln!(output, "{signer}")?;
        writeln!(output, "{}", recipients.join(","))?;
        if self.broken_stream {
            return Err(CryptoError::Backend("encryption stream interrupted".into()));
        }
        source(&mut *output)?;
        Ok(())
    }

    fn decrypt(
        &self,
        source: &mut (dyn Read + Send + Sync),
        output: &mut (dyn Write + Send),
        passphrase: &SecretString,
    ) -> Result<Vec<String>, CryptoError> {
        let mut data = Vec::new();
        source.read_to_end(&mut data)?;
        let parts: Vec<&[u8]> = data.splitn(4, |b| *b == b'\n').collect();
        let [magic, signer, recipients, body] = parts.as_slice() else {
            return Err(CryptoError::Backend("truncated stream".into()));
        };
        if *magic != MAGIC {
            return Err(CryptoError::Backend("not a fake-encrypted stream".into()));
        }
        let recipients = String::from_utf8_lossy(recipients);
        let unlocked = recipients
            .split(',')
            .any(|r| self.unlock(r, passphrase).is_ok());
        if !unlocked {
            return Err(CryptoError::WrongPassphrase(recipients.into_owned()));
        }
        output.write_all(body)?;
        Ok(vec![String::from_utf8_lossy(signer).into_owned()])
    }

    fn create_detached_signature(
        &self,
        data: &[u8],
        signer: &str,
        passphrase: &SecretString,
    ) -> Result<Vec<u8>, CryptoError> {
        self.unlock(signer, passphrase)?;
        Ok(format!("SIG:{signer}:{}", compute_bytes(data)).into_bytes())
    }

    fn verify_detached_signature(&self, data: &[u8], signature: &[u8]) -> Result<String, CryptoError> {
        let text = String::from_utf8_lossy(signature);
        match text.split(':').collect::<Vec<_>>().as_slice() {
            ["SIG", signer, digest] if *digest == compute_bytes(data) => Ok(signer.to_string()),
            _ => Err(CryptoError::Backend("bad signature".into())),
        }
    }
}

/// Portal that knows a fixed set of DTR IDs and records every package it sees.
#[derive(Default)]
pub struct FakePortal {
    pub dtrs: HashMap<u64, String>,
    pub approvals: HashMap<String, KeyStatus>,
    pub checked: Mutex<Vec<String>>,
}

impl PortalApi for FakePortal {
    fn verify_key_approval(&self, fingerprints: &[String]) -> anyhow::Result<Vec<(String, KeyStatus)>> {
        Ok(fingerprints
            .iter()
            .filter_map(|f| self.approvals.get(f).map(|s| (f.clone(), *s)))
            .collect())
    }

    fn verify_dpkg_metadata(&self, metadata: &MetaData, file_name: &str) -> anyhow::Result<String> {
        self.checked.lock().unwrap().push(file_name.to_string());
        let id = metadata.transfer_id.ok_or_else(|| anyhow::anyhow!("no DTR ID"))?;
        self.dtrs
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("DTR {id} is not approved"))
    }
}

/// Records upload calls instead of sending anything.
#[derive(Default)]
pub struct RecordingProtocol {
    pub secrets: HashMap<String, String>,
    pub uploads: Mutex<Vec<Vec<PathBuf>>>,
}

impl TransferProtocol for RecordingProtocol {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn required_password_args(&self) -> &'static [&'static str] {
        &["api_key"]
    }

    fn has_secret(&self, name: &str) -> bool {
        self.secrets.contains_key(name)
    }

    fn set_secret(&mut self, name: &str, value: SecretString) -> SdtResult<()> {
        self.secrets.insert(name.to_string(), value.expose_secret().to_string());
        Ok(())
    }

    fn upload(&self, files: &[PathBuf], _two_factor: TwoFactor<'_>, _progress: &dyn sdt_core::Progress) -> SdtResult<()> {
        self.uploads.lock().unwrap().push(files.to_vec());
        Ok(())
    }
}

pub fn config(output_dir: &Path) -> SdtConfig {
    SdtConfig {
        allow_key_download: false,
        output_dir: Some(output_dir.to_path_buf()),
        ..SdtConfig::default()
    }
}

pub fn passphrase(value: &str) -> PassphraseSource {
    PassphraseSource::Value(SecretString::from(value.to_string()))
}

/// A prompt that fails the test when it is called.
pub fn no_prompt() -> PassphraseSource {
    PassphraseSource::Prompt(Box::new(|| -> std::io::Result<SecretString> {
        panic!("passphrase must not be requested")
    }))
}

pub fn no_progress(_done: u64, _total: u64, _label: &str) {}

/// `input/a.txt` and `input/sub/b.txt` under `root`.
pub fn input_tree(root: &Path) -> PathBuf {
    let input = root.join("input");
    std::fs::create_dir_all(input.join("sub")).unwrap();
    std::fs::write(input.join("a.txt"), b"alpha\n".repeat(100)).unwrap();
    std::fs::write(input.join("sub/b.txt"), b"bravo").unwrap();
    input
}
