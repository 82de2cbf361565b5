//! Legacy backend: drives the `gpg` executable against a GnuPG keyring.
//!
//! Every operation is one `gpg --batch` invocation. Data flows through the
//! child's stdin/stdout on scoped threads so nothing is buffered whole, and
//! machine-readable `[GNUPG:]` status lines are read from stderr
//! (`--status-fd 2`) to classify failures and collect signers.

use crate::backend::{CryptoBackend, PlaintextSource};
use crate::error::CryptoError;
use crate::key::{is_hex_id, normalize_id, KeyAlgorithm, KeyInfo, KeyType, Validity};
use sdt_core::config::GpgConfig;
use secrecy::{ExposeSecret, SecretString};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use tempfile::NamedTempFile;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct GpgBackend {
    program: PathBuf,
    home: Option<PathBuf>,
}

/// Exit status and diagnostics of one gpg run.
struct GpgRun {
    status: ExitStatus,
    stderr: String,
}

impl GpgRun {
    fn status_lines(&self) -> impl Iterator<Item = &str> {
        self.stderr.lines().filter_map(|l| l.strip_prefix("[GNUPG:] "))
    }

    fn ensure_success(&self, key: &str) -> Result<(), CryptoError> {
        if self.status.success() {
            Ok(())
        } else {
            Err(self.failure(key))
        }
    }

    /// Map gpg's status output to the shared error taxonomy.
    fn failure(&self, key: &str) -> CryptoError {
        for line in self.status_lines() {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some("BAD_PASSPHRASE"), _, _) => return CryptoError::WrongPassphrase(key.to_string()),
                (Some("INV_RECP"), Some("10"), Some(recipient)) => {
                    return CryptoError::UntrustedRecipient(recipient.to_string())
                }
                (Some("INV_RECP"), _, Some(recipient)) => {
                    return CryptoError::KeyResolution(format!("recipient key {recipient} is not usable"))
                }
                (Some("INV_SGNR"), _, Some(signer)) => {
                    return CryptoError::KeyResolution(format!("signing key {signer} is not usable"))
                }
                (Some("NO_SECKEY"), Some(id), _) => {
                    return CryptoError::Backend(format!("no secret key available for key ID {id}"))
                }
                (Some("BADSIG"), Some(id), _) => {
                    return CryptoError::Backend(format!("bad signature made by key ID {id}"))
                }
                _ => {}
            }
        }

        if self.stderr.to_ascii_lowercase().contains("bad passphrase") {
            return CryptoError::WrongPassphrase(key.to_string());
        }
        let diagnostics: Vec<&str> = self.stderr.lines().filter(|l| !l.starts_with("[GNUPG:]")).collect();
        CryptoError::Backend(format!("gpg exited with {}: {}", self.status, diagnostics.join("; ")))
    }

    /// Fingerprints of valid signatures, primary key preferred, deduplicated.
    fn valid_signers(&self) -> Vec<String> {
        let mut signers: Vec<String> = Vec::new();
        for line in self.status_lines() {
            if let Some(rest) = line.strip_prefix("VALIDSIG ") {
                let fields: Vec<&str> = rest.split_whitespace().collect();
                let fpr = fields.get(9).or_else(|| fields.first());
                if let Some(fpr) = fpr.map(|f| f.to_uppercase()) {
                    if !signers.contains(&fpr) {
                        signers.push(fpr);
                    }
                }
            }
        }
        signers
    }

    fn imported(&self) -> Vec<String> {
        let mut fprs: Vec<String> = Vec::new();
        for line in self.status_lines() {
            if let Some(rest) = line.strip_prefix("IMPORT_OK ") {
                if let Some(fpr) = rest.split_whitespace().nth(1).map(str::to_uppercase) {
                    if !fprs.contains(&fpr) {
                        fprs.push(fpr);
                    }
                }
            }
        }
        fprs
    }
}

impl GpgBackend {
    pub fn new(program: impl Into<PathBuf>, home: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            home,
        }
    }

    pub fn from_config(config: &GpgConfig) -> Self {
        Self::new(config.program.clone(), config.home.clone())
    }

    /// Common options. The passphrase goes through a private temp file that
    /// must outlive the child process.
    fn base_args(
        &self,
        passphrase: Option<&SecretString>,
    ) -> Result<(Vec<String>, Option<NamedTempFile>), CryptoError> {
        let mut args: Vec<String> = ["--batch", "--no-tty", "--status-fd", "2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(home) = &self.home {
            args.push("--homedir".into());
            args.push(home.display().to_string());
        }

        let mut passphrase_file = None;
        if let Some(passphrase) = passphrase {
            let mut file = NamedTempFile::new()?;
            file.write_all(passphrase.expose_secret().as_bytes())?;
            file.flush()?;
            args.push("--pinentry-mode".into());
            args.push("loopback".into());
            args.push("--passphrase-file".into());
            args.push(file.path().display().to_string());
            passphrase_file = Some(file);
        }
        Ok((args, passphrase_file))
    }

    /// Run gpg, feeding stdin from `feed` and streaming stdout into `output`.
    fn run_streaming(
        &self,
        args: &[&str],
        passphrase: Option<&SecretString>,
        feed: PlaintextSource<'_>,
        output: &mut (dyn Write + Send),
    ) -> Result<GpgRun, CryptoError> {
        let (base, _passphrase_file) = self.base_args(passphrase)?;
        debug!(program = %self.program.display(), ?args, "running gpg");

        let mut child = Command::new(&self.program)
            .args(&base)
            .args(args)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CryptoError::backend(&format!("failed to run {}", self.program.display()), e))?;

        let (Some(mut stdin), Some(mut stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(CryptoError::Backend("gpg pipes are not available".into()));
        };

        let (fed, copied, diagnostics) = std::thread::scope(|s| {
            let copier = s.spawn(move || io::copy(&mut stdout, output));
            let reader = s.spawn(move || {
                let mut buf = Vec::new();
                stderr.read_to_end(&mut buf).map(|_| buf)
            });
            let fed = feed(&mut stdin).and_then(|()| stdin.flush());
            drop(stdin);
            (fed, copier.join(), reader.join())
        });

        let status = child.wait()?;
        let stderr = diagnostics
            .map_err(|_| CryptoError::Backend("gpg stderr reader panicked".into()))??;
        let copied = copied.map_err(|_| CryptoError::Backend("gpg output writer panicked".into()))?;
        let run = GpgRun {
            status,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        };

        // A failing gpg usually breaks the pipe first; its own diagnostics win.
        if run.status.success() {
            fed?;
            copied?;
        }
        Ok(run)
    }

    fn run(
        &self,
        args: &[&str],
        passphrase: Option<&SecretString>,
        input: &[u8],
    ) -> Result<(Vec<u8>, GpgRun), CryptoError> {
        let mut out = Vec::new();
        let run = self.run_streaming(args, passphrase, &mut |w: &mut dyn Write| w.write_all(input), &mut out)?;
        Ok((out, run))
    }
}

impl CryptoBackend for GpgBackend {
    fn name(&self) -> &'static str {
        "gpg"
    }

    fn search_keys(&self, term: &str, key_type: KeyType) -> Result<Vec<KeyInfo>, CryptoError> {
        let list = match key_type {
            KeyType::Public => "--list-keys",
            KeyType::Secret => "--list-secret-keys",
        };
        let pattern = search_pattern(term);
        let mut args = vec!["--with-colons", "--fixed-list-mode", list];
        // An empty term lists the whole keyring.
        if !pattern.is_empty() {
            args.extend(["--", pattern.as_str()]);
        }
        let (out, run) = self.run(&args, None, b"")?;
        if !run.status.success() {
            if run.stderr.contains("No public key") || run.stderr.contains("No secret key") {
                return Ok(Vec::new());
            }
            return Err(run.failure(term));
        }
        Ok(parse_colons(&out, key_type))
    }

    fn refresh_key(&self, fingerprint: &str, keyserver_url: &str) -> Result<bool, CryptoError> {
        let (_, run) = self.run(&["--keyserver", keyserver_url, "--recv-keys", fingerprint], None, b"")?;
        run.ensure_success(fingerprint)?;
        Ok(true)
    }

    fn import_keys(&self, data: &[u8]) -> Result<Vec<String>, CryptoError> {
        let (_, run) = self.run(&["--import"], None, data)?;
        run.ensure_success("")?;
        Ok(run.imported())
    }

    fn delete_key(&self, fingerprint: &str, key_type: KeyType) -> Result<(), CryptoError> {
        let command = match key_type {
            KeyType::Public => "--delete-keys",
            KeyType::Secret => "--delete-secret-and-public-key",
        };
        let (_, run) = self.run(&["--yes", command, fingerprint], None, b"")?;
        run.ensure_success(fingerprint)
    }

    fn encrypt_and_sign(
        &self,
        source: PlaintextSource<'_>,
        output: &mut (dyn Write + Send),
        recipients: &[String],
        signer: &str,
        passphrase: &SecretString,
        always_trust: bool,
    ) -> Result<(), CryptoError> {
        // Input is already gzipped (or deliberately stored) by the archive builder.
        let mut args = vec!["--compress-algo", "none", "--local-user", signer];
        if always_trust {
            args.extend(["--trust-model", "always"]);
        }
        for recipient in recipients {
            args.extend(["--recipient", recipient.as_str()]);
        }
        args.extend(["--output", "-", "--sign", "--encrypt"]);

        let run = self.run_streaming(&args, Some(passphrase), source, output)?;
        run.ensure_success(signer)
    }

    fn decrypt(
        &self,
        source: &mut (dyn Read + Send + Sync),
        output: &mut (dyn Write + Send),
        passphrase: &SecretString,
    ) -> Result<Vec<String>, CryptoError> {
        let mut feed = |w: &mut dyn Write| io::copy(&mut *source, w).map(|_| ());
        let run = self.run_streaming(&["--output", "-", "--decrypt"], Some(passphrase), &mut feed, output)?;
        run.ensure_success("")?;
        Ok(run.valid_signers())
    }

    fn create_detached_signature(
        &self,
        data: &[u8],
        signer: &str,
        passphrase: &SecretString,
    ) -> Result<Vec<u8>, CryptoError> {
        let (signature, run) = self.run(
            &["--armor", "--local-user", signer, "--output", "-", "--detach-sign"],
            Some(passphrase),
            data,
        )?;
        run.ensure_success(signer)?;
        Ok(signature)
    }

    fn verify_detached_signature(&self, data: &[u8], signature: &[u8]) -> Result<String, CryptoError> {
        let mut sig_file = NamedTempFile::new()?;
        sig_file.write_all(signature)?;
        sig_file.flush()?;
        let sig_path = sig_file.path().display().to_string();

        let (_, run) = self.run(&["--verify", &sig_path, "-"], None, data)?;
        run.ensure_success("")?;
        run.valid_signers()
            .into_iter()
            .next()
            .ok_or_else(|| CryptoError::Backend("signature verification reported no valid signer".into()))
    }
}

/// gpg matches `<addr>` exactly, bare addresses by substring.
fn search_pattern(term: &str) -> String {
    let term = term.trim();
    let id = normalize_id(term);
    if is_hex_id(&id) {
        id
    } else if term.contains('@') && !term.starts_with('<') {
        format!("<{term}>")
    } else {
        term.to_string()
    }
}

/// Parse `--with-colons --fixed-list-mode` key listings.
fn parse_colons(output: &[u8], key_type: KeyType) -> Vec<KeyInfo> {
    let text = String::from_utf8_lossy(output);
    let mut keys = Vec::new();
    let mut current: Option<KeyInfo> = None;
    let mut in_primary = false;

    for line in text.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        let field = |i: usize| fields.get(i).copied().unwrap_or("");
        match field(0) {
            "pub" | "sec" => {
                keys.extend(current.take());
                in_primary = true;
                current = Some(KeyInfo {
                    key_type,
                    fingerprint: String::new(),
                    key_id: field(4).to_uppercase(),
                    uids: Vec::new(),
                    algorithm: gpg_algorithm(field(3)),
                    length: field(2).parse().ok(),
                    validity: gpg_validity(field(1)),
                });
            }
            "fpr" if in_primary => {
                if let Some(key) = current.as_mut() {
                    key.fingerprint = field(9).to_uppercase();
                }
                in_primary = false;
            }
            "sub" | "ssb" => in_primary = false,
            "uid" => {
                if let Some(key) = current.as_mut() {
                    let uid = unescape_colon_field(field(9));
                    if !uid.is_empty() {
                        key.uids.push(uid);
                    }
                }
            }
            _ => {}
        }
    }
    keys.extend(current);
    keys.retain(|k| !k.fingerprint.is_empty());
    keys
}

fn gpg_algorithm(code: &str) -> KeyAlgorithm {
    match code {
        "1" | "2" | "3" => KeyAlgorithm::Rsa,
        "16" | "20" => KeyAlgorithm::Elgamal,
        "17" => KeyAlgorithm::Dsa,
        "18" | "19" | "22" | "25" | "26" | "27" | "28" => KeyAlgorithm::Ecc,
        other => KeyAlgorithm::Unknown(format!("algo-{other}")),
    }
}

fn gpg_validity(code: &str) -> Validity {
    match code {
        "r" => Validity::Revoked,
        "e" => Validity::Expired,
        "i" | "d" => Validity::Invalid,
        "f" | "u" | "m" => Validity::Valid,
        _ => Validity::Unknown,
    }
}

/// Colon listings escape bytes as `\xHH` (notably `:` as `\x3a`).
fn unescape_colon_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1] == b'x' {
            let hex = std::str::from_utf8(&bytes[i + 2..i + 4]).unwrap_or("");
            if let Ok(b) = u8::from_str_radix(hex, 16) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
tru::1:1700000000:0:3:1:5
pub:u:4096:1:1111222233334444:1700000000:::u:::scESC::::::23::0:
fpr:::::::::AAAABBBBCCCCDDDDEEEEFFFF1111222233334444:
uid:u::::1700000000::HASH::Alice Example <alice@example.org>::::::::::0:
uid:u::::1700000000::HASH::Alice \\x3a Work <alice@work.example>::::::::::0:
sub:u:4096:1:5555666677778888:1700000000::::::e::::::23:
fpr:::::::::99990000111122223333444455556666777788889:
pub:r:2048:17:0000111122223333:1600000000:::-:::sc::::::23::0:
fpr:::::::::0000000000000000000000000000111122223333:
uid:r::::1600000000::HASH::Old Key <old@example.org>::::::::::0:
pub:-:255:22:ABCDABCDABCDABCD:1700000000:::-:::scESC::::::ed25519::0:
fpr:::::::::1234123412341234123412341234ABCDABCDABCD:
uid:-::::1700000000::HASH::Ed <ed@example.org>::::::::::0:
";

    #[test]
    fn parses_primary_keys_only() {
        let keys = parse_colons(LISTING.as_bytes(), KeyType::Public);
        assert_eq!(keys.len(), 3);

        let alice = &keys[0];
        assert_eq!(alice.fingerprint, "AAAABBBBCCCCDDDDEEEEFFFF1111222233334444");
        assert_eq!(alice.key_id, "1111222233334444");
        assert_eq!(alice.algorithm, KeyAlgorithm::Rsa);
        assert_eq!(alice.length, Some(4096));
        assert_eq!(alice.validity, Validity::Valid);
        assert_eq!(alice.uids[1], "Alice : Work <alice@work.example>");
        assert_eq!(alice.emails(), vec!["alice@example.org", "alice@work.example"]);

        assert_eq!(keys[1].algorithm, KeyAlgorithm::Dsa);
        assert_eq!(keys[1].validity, Validity::Revoked);
        assert_eq!(keys[2].algorithm, KeyAlgorithm::Ecc);
        assert_eq!(keys[2].validity, Validity::Unknown);
    }

    #[test]
    fn search_pattern_forms() {
        assert_eq!(search_pattern("alice@example.org"), "<alice@example.org>");
        assert_eq!(search_pattern("<alice@example.org>"), "<alice@example.org>");
        assert_eq!(search_pattern("0xabcdabcdabcdabcd"), "ABCDABCDABCDABCD");
        assert_eq!(search_pattern("Alice"), "Alice");
    }

    #[cfg(unix)]
    fn run_with(stderr: &str, success: bool) -> GpgRun {
        use std::os::unix::process::ExitStatusExt;
        GpgRun {
            status: ExitStatus::from_raw(if success { 0 } else { 2 << 8 }),
            stderr: stderr.to_string(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn classifies_failures() {
        let run = run_with("[GNUPG:] BAD_PASSPHRASE 1111222233334444\n", false);
        assert!(matches!(run.failure("ALICE"), CryptoError::WrongPassphrase(k) if k == "ALICE"));

        let run = run_with("[GNUPG:] INV_RECP 10 BOBFPR\ngpg: BOBFPR: There is no assurance\n", false);
        assert!(matches!(run.failure(""), CryptoError::UntrustedRecipient(r) if r == "BOBFPR"));

        let run = run_with("gpg: signing failed: Bad passphrase\n", false);
        assert!(matches!(run.failure("X"), CryptoError::WrongPassphrase(_)));

        let run = run_with("gpg: something odd\n", false);
        let err = run.failure("");
        assert!(matches!(&err, CryptoError::Backend(msg) if msg.contains("something odd")));
    }

    #[cfg(unix)]
    #[test]
    fn collects_valid_signers_and_imports() {
        let run = run_with(
            "[GNUPG:] VALIDSIG SUBKEYFPR 2024-01-01 1700000000 0 4 0 1 10 00 PRIMARYFPR\n\
             [GNUPG:] VALIDSIG OTHERFPR 2024-01-01 1700000000 0 4 0 1 10 00\n\
             [GNUPG:] VALIDSIG SUBKEYFPR 2024-01-01 1700000000 0 4 0 1 10 00 PRIMARYFPR\n\
             [GNUPG:] IMPORT_OK 1 AAAA\n[GNUPG:] IMPORT_OK 16 aaaa\n",
            true,
        );
        assert_eq!(run.valid_signers(), vec!["PRIMARYFPR", "OTHERFPR"]);
        assert_eq!(run.imported(), vec!["AAAA"]);
    }
}
