//! Certificate-store backend built on Sequoia.
//!
//! Certificates are kept as `<FINGERPRINT>.pgp` files: every certificate
//! under `public/`, and certificates we hold secret material for also under
//! `secret/` (as TSKs). There is no separate trust database; importing a
//! certificate into the store is the trust decision.

use crate::backend::{CryptoBackend, PlaintextSource};
use crate::error::CryptoError;
use crate::key::{email_of, is_hex_id, normalize_id, KeyAlgorithm, KeyInfo, KeyType, Validity};
use openpgp::armor::Kind as ArmorKind;
use openpgp::cert::prelude::*;
use openpgp::crypto::{KeyPair, Password, SessionKey};
use openpgp::packet::key::{SecretParts, UnspecifiedRole};
use openpgp::packet::{Key, PKESK, SKESK};
use openpgp::parse::stream::{
    DecryptionHelper, DecryptorBuilder, DetachedVerifierBuilder, MessageLayer, MessageStructure,
    VerificationError, VerificationHelper,
};
use openpgp::parse::Parse;
use openpgp::policy::StandardPolicy;
use openpgp::serialize::stream::{Armorer, Encryptor, LiteralWriter, Message, Recipient, Signer};
use openpgp::serialize::SerializeInto;
use openpgp::types::{PublicKeyAlgorithm, RevocationStatus, SymmetricAlgorithm};
use openpgp::{Cert, KeyHandle};
use sdt_core::config::CertStoreConfig;
use sdt_core::portal::KeyServer;
use secrecy::{ExposeSecret, SecretString};
use sequoia_openpgp as openpgp;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::debug;

#[derive(Clone)]
pub struct CertStoreBackend {
    home: PathBuf,
    keyserver: Option<Arc<dyn KeyServer>>,
}

impl std::fmt::Debug for CertStoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertStoreBackend")
            .field("home", &self.home)
            .field("keyserver", &self.keyserver.is_some())
            .finish()
    }
}

impl CertStoreBackend {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            keyserver: None,
        }
    }

    pub fn from_config(config: &CertStoreConfig) -> Self {
        Self::new(config.home.clone())
    }

    /// Attach a key server client used by [`CryptoBackend::refresh_key`].
    pub fn with_keyserver(mut self, keyserver: Arc<dyn KeyServer>) -> Self {
        self.keyserver = Some(keyserver);
        self
    }

    fn public_dir(&self) -> PathBuf {
        self.home.join("public")
    }

    fn secret_dir(&self) -> PathBuf {
        self.home.join("secret")
    }

    fn cert_file(dir: &Path, fingerprint: &str) -> PathBuf {
        dir.join(format!("{}.pgp", normalize_id(fingerprint)))
    }

    fn load_dir(&self, dir: &Path) -> Result<Vec<Cert>, CryptoError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut certs = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let bytes = std::fs::read(entry.path())?;
            let cert = Cert::from_bytes(&bytes).map_err(|e| {
                CryptoError::backend(&format!("invalid certificate {}", entry.path().display()), e)
            })?;
            certs.push(cert);
        }
        Ok(certs)
    }

    /// Every certificate, with secret material where we have it.
    fn load_all(&self) -> Result<Vec<Cert>, CryptoError> {
        let mut certs: HashMap<String, Cert> = HashMap::new();
        for cert in self.load_dir(&self.public_dir())? {
            certs.insert(cert.fingerprint().to_hex(), cert);
        }
        for cert in self.load_dir(&self.secret_dir())? {
            certs.insert(cert.fingerprint().to_hex(), cert);
        }
        Ok(certs.into_values().collect())
    }

    fn load_one(&self, fingerprint: &str, key_type: KeyType) -> Result<Option<Cert>, CryptoError> {
        let mut candidates = vec![Self::cert_file(&self.secret_dir(), fingerprint)];
        if key_type == KeyType::Public {
            candidates.push(Self::cert_file(&self.public_dir(), fingerprint));
        }
        for path in candidates {
            if path.exists() {
                let bytes = std::fs::read(&path)?;
                let cert = Cert::from_bytes(&bytes)
                    .map_err(|e| CryptoError::backend(&format!("invalid certificate {}", path.display()), e))?;
                return Ok(Some(cert));
            }
        }
        Ok(None)
    }

    fn require(&self, fingerprint: &str, key_type: KeyType) -> Result<Cert, CryptoError> {
        self.load_one(fingerprint, key_type)?.ok_or_else(|| {
            CryptoError::KeyResolution(format!("no {key_type} key with fingerprint {fingerprint} in the certificate store"))
        })
    }

    fn store(&self, cert: &Cert) -> Result<(), CryptoError> {
        let fingerprint = cert.fingerprint().to_hex();
        let public = cert
            .to_vec()
            .map_err(|e| CryptoError::backend("serializing certificate", e))?;
        write_atomic(&self.public_dir(), &fingerprint, &public)?;
        if cert.is_tsk() {
            let secret = cert
                .as_tsk()
                .to_vec()
                .map_err(|e| CryptoError::backend("serializing secret key", e))?;
            write_atomic(&self.secret_dir(), &fingerprint, &secret)?;
        }
        Ok(())
    }

    fn signing_keypair(&self, signer: &str, passphrase: &SecretString) -> Result<KeyPair, CryptoError> {
        let cert = self.require(signer, KeyType::Secret)?;
        let policy = StandardPolicy::new();
        let key = cert
            .keys()
            .secret()
            .with_policy(&policy, None)
            .supported()
            .alive()
            .revoked(false)
            .for_signing()
            .next()
            .ok_or_else(|| CryptoError::KeyPolicy(format!("key {signer} has no usable signing key")))?
            .key()
            .clone();
        unlock(key, passphrase, signer)?
            .into_keypair()
            .map_err(|e| CryptoError::backend("loading signing key", e))
    }
}

fn write_atomic(dir: &Path, fingerprint: &str, bytes: &[u8]) -> Result<(), CryptoError> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(CertStoreBackend::cert_file(dir, fingerprint))
        .map_err(|e| CryptoError::Io(e.error))?;
    Ok(())
}

fn unlock(
    key: Key<SecretParts, UnspecifiedRole>,
    passphrase: &SecretString,
    id: &str,
) -> Result<Key<SecretParts, UnspecifiedRole>, CryptoError> {
    if !key.secret().is_encrypted() {
        return Ok(key);
    }
    key.decrypt_secret(&Password::from(passphrase.expose_secret()))
        .map_err(|_| CryptoError::WrongPassphrase(id.to_string()))
}

fn cert_matches(cert: &Cert, term: &str) -> bool {
    let term = term.trim();
    let id = normalize_id(term);
    if is_hex_id(&id) {
        return cert.fingerprint().to_hex().ends_with(&id);
    }
    if term.contains('@') {
        let wanted = term.trim_start_matches('<').trim_end_matches('>').to_ascii_lowercase();
        return cert
            .userids()
            .filter_map(|u| email_of(&String::from_utf8_lossy(u.userid().value())))
            .any(|email| email == wanted);
    }
    let needle = term.to_lowercase();
    cert.userids()
        .any(|u| String::from_utf8_lossy(u.userid().value()).to_lowercase().contains(&needle))
}

fn cert_info(cert: &Cert, key_type: KeyType) -> KeyInfo {
    let policy = StandardPolicy::new();
    let validity = match cert.with_policy(&policy, None) {
        Err(_) => Validity::Invalid,
        Ok(valid) => match valid.revocation_status() {
            RevocationStatus::Revoked(_) => Validity::Revoked,
            _ if valid.alive().is_err() => Validity::Expired,
            _ => Validity::Valid,
        },
    };
    let primary = cert.primary_key();
    let key = primary.key();
    KeyInfo {
        key_type,
        fingerprint: cert.fingerprint().to_hex(),
        key_id: cert.keyid().to_hex(),
        uids: cert
            .userids()
            .map(|u| String::from_utf8_lossy(u.userid().value()).into_owned())
            .collect(),
        algorithm: algorithm_of(key.pk_algo()),
        length: key.mpis().bits().map(|bits| bits as u32),
        validity,
    }
}

#[allow(deprecated)]
fn algorithm_of(algo: PublicKeyAlgorithm) -> KeyAlgorithm {
    use PublicKeyAlgorithm::*;
    match algo {
        RSAEncryptSign | RSAEncrypt | RSASign => KeyAlgorithm::Rsa,
        DSA => KeyAlgorithm::Dsa,
        ElGamalEncrypt | ElGamalEncryptSign => KeyAlgorithm::Elgamal,
        ECDH | ECDSA | EdDSA => KeyAlgorithm::Ecc,
        other => {
            let name = format!("{other:?}");
            if name.contains("25519") || name.contains("448") {
                KeyAlgorithm::Ecc
            } else {
                KeyAlgorithm::Unknown(name)
            }
        }
    }
}

/// Sequoia's writer stack wants `Send + Sync` sinks; this makes any
/// `Send` sink qualify. The lock is never contended.
struct SyncWriter<'a>(Mutex<&'a mut (dyn Write + Send)>);

impl<'a> SyncWriter<'a> {
    fn new(inner: &'a mut (dyn Write + Send)) -> Self {
        Self(Mutex::new(inner))
    }

    fn inner(&mut self) -> &mut (dyn Write + Send + 'a) {
        let w = match self.0.get_mut() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        &mut **w
    }
}

impl Write for SyncWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner().flush()
    }
}

impl CryptoBackend for CertStoreBackend {
    fn name(&self) -> &'static str {
        "cert-store"
    }

    fn search_keys(&self, term: &str, key_type: KeyType) -> Result<Vec<KeyInfo>, CryptoError> {
        let certs = match key_type {
            KeyType::Public => self.load_all()?,
            KeyType::Secret => self.load_dir(&self.secret_dir())?,
        };
        let mut keys: Vec<KeyInfo> = certs
            .iter()
            .filter(|cert| cert_matches(cert, term))
            .map(|cert| cert_info(cert, key_type))
            .collect();
        keys.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(keys)
    }

    fn refresh_key(&self, fingerprint: &str, keyserver_url: &str) -> Result<bool, CryptoError> {
        let Some(keyserver) = &self.keyserver else {
            debug!(fingerprint, "no key server client configured, skipping refresh");
            return Ok(false);
        };
        let data = keyserver.fetch(keyserver_url, fingerprint).map_err(|e| {
            CryptoError::Backend(format!("fetching key {fingerprint} from {keyserver_url}: {e:#}"))
        })?;
        self.import_keys(&data)?;
        Ok(true)
    }

    fn import_keys(&self, data: &[u8]) -> Result<Vec<String>, CryptoError> {
        let ppr = openpgp::parse::PacketParser::from_bytes(data)
            .map_err(|e| CryptoError::backend("parsing key data", e))?;
        let mut imported = Vec::new();
        for cert in CertParser::from(ppr) {
            let cert = cert.map_err(|e| CryptoError::backend("invalid certificate", e))?;
            let fingerprint = cert.fingerprint().to_hex();
            let merged = match self.load_one(&fingerprint, KeyType::Public)? {
                Some(existing) => existing
                    .merge_public_and_secret(cert)
                    .map_err(|e| CryptoError::backend("merging certificate", e))?,
                None => cert,
            };
            self.store(&merged)?;
            debug!(fingerprint = %fingerprint, secret = merged.is_tsk(), "imported certificate");
            imported.push(fingerprint);
        }
        if imported.is_empty() {
            return Err(CryptoError::KeyResolution("no certificates found in key data".into()));
        }
        Ok(imported)
    }

    fn delete_key(&self, fingerprint: &str, key_type: KeyType) -> Result<(), CryptoError> {
        let public = Self::cert_file(&self.public_dir(), fingerprint);
        let secret = Self::cert_file(&self.secret_dir(), fingerprint);
        match key_type {
            KeyType::Public if secret.exists() => Err(CryptoError::KeyPolicy(format!(
                "key {fingerprint} has a secret part; delete the secret key instead"
            ))),
            KeyType::Public => std::fs::remove_file(&public).map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    CryptoError::KeyResolution(format!("no public key with fingerprint {fingerprint}"))
                }
                _ => CryptoError::Io(e),
            }),
            KeyType::Secret => {
                if !secret.exists() {
                    return Err(CryptoError::KeyResolution(format!(
                        "no secret key with fingerprint {fingerprint}"
                    )));
                }
                std::fs::remove_file(&secret)?;
                if public.exists() {
                    std::fs::remove_file(&public)?;
                }
                Ok(())
            }
        }
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
        let certs = recipients
            .iter()
            .map(|r| self.require(r, KeyType::Public))
            .collect::<Result<Vec<_>, _>>()?;

        let policy = StandardPolicy::new();
        let mut encryption_keys: Vec<Recipient<'_>> = Vec::new();
        for cert in &certs {
            let before = encryption_keys.len();
            for key in cert
                .keys()
                .with_policy(&policy, None)
                .supported()
                .alive()
                .revoked(false)
                .for_transport_encryption()
            {
                encryption_keys.push(key.into());
            }
            if encryption_keys.len() == before {
                return Err(CryptoError::KeyPolicy(format!(
                    "key {} has no usable encryption key",
                    cert.fingerprint().to_hex()
                )));
            }
        }
        let keypair = self.signing_keypair(signer, passphrase)?;

        let message = Message::new(SyncWriter::new(output));
        let message = Encryptor::for_recipients(message, encryption_keys)
            .build()
            .map_err(|e| CryptoError::backend("setting up encryption", e))?;
        let message = Signer::new(message, keypair)
            .map_err(|e| CryptoError::backend("setting up signer", e))?
            .build()
            .map_err(|e| CryptoError::backend("setting up signer", e))?;
        let mut literal = LiteralWriter::new(message)
            .build()
            .map_err(|e| CryptoError::backend("setting up literal data", e))?;
        source(&mut literal)?;
        literal
            .finalize()
            .map_err(|e| CryptoError::backend("finishing encrypted message", e))?;
        Ok(())
    }

    fn decrypt(
        &self,
        source: &mut (dyn Read + Send + Sync),
        output: &mut (dyn Write + Send),
        passphrase: &SecretString,
    ) -> Result<Vec<String>, CryptoError> {
        let locked = Arc::new(OnceLock::new());
        let helper = Helper {
            certs: self.load_all()?,
            passphrase: Some(Password::from(passphrase.expose_secret())),
            signers: Vec::new(),
            locked: Arc::clone(&locked),
        };
        let policy = StandardPolicy::new();
        let wrong_passphrase = |err: &dyn std::fmt::Display| match locked.get() {
            Some(fingerprint) => CryptoError::WrongPassphrase(String::clone(fingerprint)),
            None => CryptoError::Backend(format!("decryption failed: {err}")),
        };

        let mut decryptor = DecryptorBuilder::from_reader(source)
            .map_err(|e| CryptoError::backend("reading encrypted data", e))?
            .with_policy(&policy, None, helper)
            .map_err(|e| wrong_passphrase(&e))?;
        io::copy(&mut decryptor, output).map_err(|e| wrong_passphrase(&e))?;
        Ok(decryptor.into_helper().signers)
    }

    fn create_detached_signature(
        &self,
        data: &[u8],
        signer: &str,
        passphrase: &SecretString,
    ) -> Result<Vec<u8>, CryptoError> {
        let keypair = self.signing_keypair(signer, passphrase)?;
        let mut sink = Vec::new();
        let message = Message::new(&mut sink);
        let message = Armorer::new(message)
            .kind(ArmorKind::Signature)
            .build()
            .map_err(|e| CryptoError::backend("setting up armor", e))?;
        let mut message = Signer::new(message, keypair)
            .map_err(|e| CryptoError::backend("setting up signer", e))?
            .detached()
            .build()
            .map_err(|e| CryptoError::backend("setting up signer", e))?;
        message.write_all(data)?;
        message
            .finalize()
            .map_err(|e| CryptoError::backend("finishing signature", e))?;
        Ok(sink)
    }

    fn verify_detached_signature(&self, data: &[u8], signature: &[u8]) -> Result<String, CryptoError> {
        let helper = Helper {
            certs: self.load_all()?,
            passphrase: None,
            signers: Vec::new(),
            locked: Arc::new(OnceLock::new()),
        };
        let policy = StandardPolicy::new();
        let mut verifier = DetachedVerifierBuilder::from_bytes(signature)
            .map_err(|e| CryptoError::backend("reading signature", e))?
            .with_policy(&policy, None, helper)
            .map_err(|e| CryptoError::backend("signature verification failed", e))?;
        verifier
            .verify_bytes(data)
            .map_err(|e| CryptoError::backend("signature verification failed", e))?;
        verifier
            .into_helper()
            .signers
            .into_iter()
            .next()
            .ok_or_else(|| CryptoError::Backend("signature was not made by any known key".into()))
    }
}

struct Helper {
    certs: Vec<Cert>,
    passphrase: Option<Password>,
    signers: Vec<String>,
    /// Fingerprint of a secret key whose passphrase did not unlock it.
    locked: Arc<OnceLock<String>>,
}

impl VerificationHelper for Helper {
    fn get_certs(&mut self, ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        if ids.is_empty() {
            return Ok(self.certs.clone());
        }
        Ok(self
            .certs
            .iter()
            .filter(|cert| {
                ids.iter().any(|id| {
                    cert.fingerprint().aliases(id)
                        || cert.keys().any(|key| key.key().fingerprint().aliases(id))
                })
            })
            .cloned()
            .collect())
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        let mut bad = 0usize;
        for layer in structure.iter() {
            if let MessageLayer::SignatureGroup { results } = layer {
                for result in results {
                    match result {
                        Ok(good) => {
                            let fingerprint = good.ka.cert().fingerprint().to_hex();
                            if !self.signers.contains(&fingerprint) {
                                self.signers.push(fingerprint);
                            }
                        }
                        Err(VerificationError::BadSignature { .. }) => bad += 1,
                        Err(err) => debug!(error = %err, "signature could not be checked"),
                    }
                }
            }
        }
        if bad > 0 {
            return Err(anyhow::anyhow!("{bad} bad signature(s) on message"));
        }
        Ok(())
    }
}

impl DecryptionHelper for Helper {
    fn decrypt(
        &mut self,
        pkesks: &[PKESK],
        _skesks: &[SKESK],
        sym_algo: Option<SymmetricAlgorithm>,
        decrypt: &mut dyn FnMut(Option<SymmetricAlgorithm>, &SessionKey) -> bool,
    ) -> openpgp::Result<Option<Cert>> {
        let policy = StandardPolicy::new();
        for pkesk in pkesks {
            for cert in &self.certs {
                for ka in cert
                    .keys()
                    .secret()
                    .with_policy(&policy, None)
                    .supported()
                    .revoked(false)
                    .for_transport_encryption()
                {
                    let mut key = ka.key().clone();
                    if key.secret().is_encrypted() {
                        let Some(passphrase) = self.passphrase.as_ref() else {
                            continue;
                        };
                        match key.decrypt_secret(passphrase) {
                            Ok(unlocked) => key = unlocked,
                            Err(_) => {
                                let _ = self.locked.set(cert.fingerprint().to_hex());
                                continue;
                            }
                        }
                    }
                    let mut keypair = key.into_keypair()?;
                    if let Some((algo, session_key)) = pkesk.decrypt(&mut keypair, sym_algo) {
                        if decrypt(algo, &session_key) {
                            return Ok(Some(cert.clone()));
                        }
                    }
                }
            }
        }
        Ok(None)
    }
}
