//! sdt: secure data transfer CLI
//!
//! Commands:
//!   encrypt <files>...       - build a signed, encrypted data package
//!   decrypt <package>        - verify, decrypt and unpack a data package
//!   transfer <packages>...   - re-verify packages and upload them
//!   keys list|import|delete  - manage the active key store
//!   config show              - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use sdt_core::config::{self, SdtConfig};
use sdt_core::{Purpose, SdtError, SdtResult};
use sdt_crypto::{CryptoBackend, KeyType, PassphraseSource};
use sdt_package::{DecryptOptions, EncryptOptions, Session, TransferOptions};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sdt",
    version,
    about = "Secure data packaging and transfer",
    long_about = "sdt: encrypt, sign, verify and transfer data packages"
)]
struct Cli {
    /// Path to config.toml (default: $XDG_CONFIG_HOME/sdt/config.toml)
    #[arg(long, short = 'c', env = "SDT_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter, overrides [log] level
    #[arg(long, env = "SDT_LOG")]
    log: Option<String>,

    /// Log format, overrides [log] format
    #[arg(long, env = "SDT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Package files into a signed, encrypted data package
    Encrypt {
        /// Files or directories to package
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Sender key: fingerprint, key ID or email (default: default_sender)
        #[arg(long, short = 's')]
        sender: Option<String>,
        /// Recipient key; repeat for several recipients
        #[arg(long = "recipient", short = 'r', required = true)]
        recipients: Vec<String>,
        /// Data Transfer Request ID
        #[arg(long = "dtr-id")]
        transfer_id: Option<u64>,
        /// PRODUCTION or TEST
        #[arg(long)]
        purpose: Option<Purpose>,
        /// Output directory or file name
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        /// Suffix for the generated package name (overrides package_name_suffix)
        #[arg(long)]
        output_suffix: Option<String>,
        /// gzip level 0-9, 0 disables compression
        #[arg(long)]
        compression_level: Option<u32>,
        /// Continue when the destination looks short on disk space
        #[arg(long)]
        force: bool,
        /// Run every check, write nothing
        #[arg(long)]
        dry_run: bool,
        /// Command printing the passphrase on stdout (overrides passphrase_cmd)
        #[arg(long, env = "SDT_PASSPHRASE_CMD")]
        passphrase_cmd: Option<String>,
    },

    /// Verify, decrypt and unpack a data package
    Decrypt {
        package: PathBuf,
        /// Directory to extract into (default: output_dir or current directory)
        #[arg(long, short = 'o')]
        output_dir: Option<PathBuf>,
        /// Keep the decrypted tar instead of extracting it
        #[arg(long)]
        decrypt_only: bool,
        /// Only check the container and its metadata signature
        #[arg(long)]
        dry_run: bool,
        #[arg(long, env = "SDT_PASSPHRASE_CMD")]
        passphrase_cmd: Option<String>,
    },

    /// Re-verify packages and upload them, one call per recipient group
    ///
    /// Protocol secrets are read from SDT_<NAME> environment variables
    /// (e.g. SDT_SECRET_ACCESS_KEY) or prompted for.
    Transfer {
        #[arg(required = true)]
        packages: Vec<PathBuf>,
        /// Transfer protocol (s3, local), overrides [transfer] protocol
        #[arg(long)]
        protocol: Option<String>,
        /// Destination directory for the local protocol
        #[arg(long)]
        destination: Option<PathBuf>,
        /// Verify every package, upload nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// Key store management
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum KeysAction {
    /// List keys, optionally filtered by fingerprint, key ID, email or name
    List {
        search: Option<String>,
        /// List secret keys instead of public keys
        #[arg(long)]
        secret: bool,
    },
    /// Import armored or binary key material from a file
    Import { file: PathBuf },
    /// Delete a key by fingerprint
    Delete {
        fingerprint: String,
        /// Delete the secret key together with its public part
        #[arg(long)]
        secret: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config::config_dir().join("config.toml"));
    let config = load_config(&config_path)?;

    let level = cli.log.as_deref().unwrap_or(&config.log.level);
    let format = cli
        .log_format
        .unwrap_or_else(|| LogFormat::from_str(&config.log.format, true).unwrap_or(LogFormat::Text));
    init_logging(level, format);
    if !config_path.exists() {
        warn!("config file not found: {}  (using defaults)", config_path.display());
    }

    let crypto = sdt_crypto::open_backend(&config);
    let session = Session::new(&config, crypto.as_ref());

    match cli.command {
        Commands::Encrypt {
            files,
            sender,
            recipients,
            transfer_id,
            purpose,
            output,
            output_suffix,
            compression_level,
            force,
            dry_run,
            passphrase_cmd,
        } => {
            let opts = EncryptOptions {
                files,
                sender,
                recipients,
                transfer_id,
                purpose,
                output,
                output_suffix,
                compression_level,
                force,
                dry_run,
            };
            cmd_encrypt(&session, &opts, passphrase_cmd)
        }
        Commands::Decrypt {
            package,
            output_dir,
            decrypt_only,
            dry_run,
            passphrase_cmd,
        } => {
            let opts = DecryptOptions {
                package,
                output_dir,
                decrypt_only,
                dry_run,
            };
            cmd_decrypt(&session, &opts, passphrase_cmd)
        }
        Commands::Transfer {
            packages,
            protocol,
            destination,
            dry_run,
        } => cmd_transfer(&session, packages, protocol, destination, dry_run),
        Commands::Keys { action } => match action {
            KeysAction::List { search, secret } => cmd_keys_list(session.crypto, search.as_deref(), secret),
            KeysAction::Import { file } => cmd_keys_import(session.crypto, &file),
            KeysAction::Delete { fingerprint, secret } => {
                cmd_keys_delete(session.crypto, &fingerprint, secret)
            }
        },
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
    }
}

// ── Config loading / logging ──────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<SdtConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(SdtConfig::default())
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Prompts and progress ──────────────────────────────────────────────────────

fn passphrase_source(cmd: Option<String>) -> PassphraseSource {
    match cmd {
        Some(cmd) => PassphraseSource::Command(cmd),
        None => PassphraseSource::Prompt(Box::new(|| {
            rpassword::prompt_password("Passphrase: ").map(SecretString::from)
        })),
    }
}

/// Protocol secret from `SDT_<NAME>`, else from the terminal.
fn secret_var(name: &str) -> String {
    format!("SDT_{}", name.to_ascii_uppercase())
}

fn prompt_secret(name: &str) -> SdtResult<SecretString> {
    if let Ok(value) = std::env::var(secret_var(name)) {
        return Ok(SecretString::from(value));
    }
    rpassword::prompt_password(format!("{name}: "))
        .map(SecretString::from)
        .map_err(|e| SdtError::user(format!("failed to read {name}: {e}")))
}

fn make_progress_bar(prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .context("progress bar template")?
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    Ok(pb)
}

fn progress_sink(pb: &ProgressBar) -> impl Fn(u64, u64, &str) + Send + Sync {
    let pb = pb.clone();
    move |done, total, label| {
        pb.set_length(total);
        pb.set_position(done);
        pb.set_message(label.to_string());
    }
}

// ── `sdt encrypt` ─────────────────────────────────────────────────────────────

fn cmd_encrypt(session: &Session<'_>, opts: &EncryptOptions, passphrase_cmd: Option<String>) -> Result<()> {
    let passphrase = passphrase_source(passphrase_cmd.or_else(|| session.config.passphrase_cmd.clone()));
    let pb = make_progress_bar("encrypt")?;
    let result = sdt_package::encrypt(session, opts, &passphrase, &progress_sink(&pb));
    pb.finish_and_clear();
    let report = result.context("encryption failed")?;

    match report.output {
        Some(path) => println!("{}", path.display()),
        None => println!("dry run: all checks passed, no package written"),
    }
    if !report.warnings.is_empty() {
        info!(warnings = report.warnings.len(), "completed with warnings");
    }
    Ok(())
}

// ── `sdt decrypt` ─────────────────────────────────────────────────────────────

fn cmd_decrypt(session: &Session<'_>, opts: &DecryptOptions, passphrase_cmd: Option<String>) -> Result<()> {
    let passphrase = passphrase_source(passphrase_cmd.or_else(|| session.config.passphrase_cmd.clone()));
    let pb = make_progress_bar("decrypt")?;
    let result = sdt_package::decrypt(session, opts, &passphrase, &progress_sink(&pb));
    pb.finish_and_clear();
    let report = result.context("decryption failed")?;

    println!("sender:     {}", report.metadata.sender);
    println!("recipients: {}", report.metadata.recipients.join(", "));
    if let Some(id) = report.metadata.transfer_id {
        println!("DTR ID:     {id}");
    }
    if let Some(purpose) = report.metadata.purpose {
        println!("purpose:    {purpose}");
    }
    match report.output {
        Some(path) => println!("output:     {}", path.display()),
        None => println!("dry run: package and metadata signature are valid"),
    }
    Ok(())
}

// ── `sdt transfer` ────────────────────────────────────────────────────────────

fn cmd_transfer(
    session: &Session<'_>,
    packages: Vec<PathBuf>,
    protocol: Option<String>,
    destination: Option<PathBuf>,
    dry_run: bool,
) -> Result<()> {
    let mut transfer_config = session.config.transfer.clone();
    if let Some(protocol) = protocol {
        transfer_config.protocol = protocol;
    }
    if destination.is_some() {
        transfer_config.destination = destination;
    }
    let mut protocol =
        sdt_transfer::protocol_from_config(&transfer_config).context("configuring transfer protocol")?;
    // Optional secrets only come from the environment; unset or empty means none.
    for name in protocol.optional_password_args() {
        if let Some(value) = std::env::var(secret_var(name)).ok().filter(|v| !v.is_empty()) {
            protocol
                .set_secret(name, SecretString::from(value))
                .with_context(|| format!("setting {name}"))?;
        }
    }

    let two_factor = || rpassword::prompt_password("Two-factor code: ").ok();
    let pb = make_progress_bar("transfer")?;
    let opts = TransferOptions { packages, dry_run };
    let result = sdt_package::transfer(
        session,
        &opts,
        &mut *protocol,
        &prompt_secret,
        &two_factor,
        &progress_sink(&pb),
    );
    pb.finish_and_clear();
    let report = result.context("transfer failed")?;

    for pkg in &report.verified {
        let recipients: Vec<&str> = pkg.recipient_emails.iter().map(String::as_str).collect();
        println!("{}  ->  {}", pkg.path.display(), recipients.join(", "));
    }
    for (path, err) in &report.failed {
        println!("{}  FAILED: {err}", path.display());
    }
    if dry_run {
        println!(
            "dry run: {} package(s) verified, {} failed, nothing uploaded",
            report.verified.len(),
            report.failed.len()
        );
        if !report.all_verified() {
            anyhow::bail!("{} package(s) failed verification", report.failed.len());
        }
    } else {
        println!(
            "{} package(s) transferred in {} upload(s) via {}",
            report.verified.len(),
            report.uploads.len(),
            protocol.name()
        );
    }
    Ok(())
}

// ── `sdt keys` ────────────────────────────────────────────────────────────────

fn cmd_keys_list(crypto: &dyn CryptoBackend, search: Option<&str>, secret: bool) -> Result<()> {
    let key_type = if secret { KeyType::Secret } else { KeyType::Public };
    let keys = crypto
        .search_keys(search.unwrap_or(""), key_type)
        .context("listing keys")?;
    if keys.is_empty() {
        println!("no {key_type} keys found ({} backend)", crypto.name());
        return Ok(());
    }
    for key in keys {
        let length = key.length.map(|l| l.to_string()).unwrap_or_default();
        println!("{}  {}{length}  [{}]", key.fingerprint, key.algorithm, key.validity);
        for uid in &key.uids {
            println!("    {uid}");
        }
    }
    Ok(())
}

fn cmd_keys_import(crypto: &dyn CryptoBackend, file: &Path) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let imported = crypto.import_keys(&data).context("importing keys")?;
    for fingerprint in &imported {
        println!("imported {fingerprint}");
    }
    Ok(())
}

fn cmd_keys_delete(crypto: &dyn CryptoBackend, fingerprint: &str, secret: bool) -> Result<()> {
    let key_type = if secret { KeyType::Secret } else { KeyType::Public };
    crypto
        .delete_key(&sdt_crypto::normalize_id(fingerprint), key_type)
        .with_context(|| format!("deleting {key_type} key {fingerprint}"))?;
    println!("deleted {key_type} key {fingerprint}");
    Ok(())
}

// ── `sdt config show` ─────────────────────────────────────────────────────────

fn cmd_config_show(config: &SdtConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn encrypt_arguments_parse() {
        let cli = Cli::try_parse_from([
            "sdt", "encrypt", "data/", "-r", "bob@example.org", "-r", "carol@example.org", "--dtr-id",
            "42", "--purpose", "test", "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Encrypt {
                recipients,
                transfer_id,
                purpose,
                dry_run,
                ..
            } => {
                assert_eq!(recipients, ["bob@example.org", "carol@example.org"]);
                assert_eq!(transfer_id, Some(42));
                assert_eq!(purpose, Some(Purpose::Test));
                assert!(dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn encrypt_requires_a_recipient() {
        assert!(Cli::try_parse_from(["sdt", "encrypt", "data/"]).is_err());
    }

    #[test]
    fn missing_config_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.compression_level, 5);
    }
}
