use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration (loaded from config.toml)
///
/// Workflows receive this as an immutable snapshot; nothing in the library
/// crates mutates it after loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SdtConfig {
    /// Use the GnuPG keyring instead of the certificate store
    pub legacy_mode: bool,
    /// Fingerprint, key ID or email of the default sender key
    pub default_sender: Option<String>,
    /// gzip level for the data archive, 0 disables compression (default: 5)
    pub compression_level: u32,
    /// Checksum worker cap; zero or negative means all logical cores
    pub max_cpu: i64,
    /// Check DTR id, purpose and keys against the portal
    pub verify_dtr: bool,
    /// Ask the portal whether every key is approved before use
    pub verify_key_approval: bool,
    /// Enforce the `[<project>_]<timestamp>[_<suffix>]` package name convention on transfer
    pub verify_package_name: bool,
    /// Optional suffix appended to generated package names
    pub package_name_suffix: Option<String>,
    /// Key server used to refresh keys
    pub keyserver_url: Option<String>,
    /// Refresh keys from the key server before use
    pub allow_key_download: bool,
    /// Portal (authorization service) base URL
    pub portal_url: Option<String>,
    /// Skip the local trust check on recipient keys (legacy backend)
    pub always_trust_recipient_key: bool,
    /// Minimum accepted RSA key length in bits (default: 4096)
    pub min_rsa_key_length: u32,
    /// Default directory for encrypted packages (default: current directory)
    pub output_dir: Option<PathBuf>,
    /// Bytes that must stay free at the destination on top of the input size
    pub min_free_space: u64,
    /// Shell command printing the key passphrase on stdout
    pub passphrase_cmd: Option<String>,
    pub gpg: GpgConfig,
    pub cert_store: CertStoreConfig,
    pub transfer: TransferConfig,
    pub log: LogConfig,
}

impl Default for SdtConfig {
    fn default() -> Self {
        Self {
            legacy_mode: false,
            default_sender: None,
            compression_level: 5,
            max_cpu: 0,
            verify_dtr: false,
            verify_key_approval: false,
            verify_package_name: true,
            package_name_suffix: None,
            keyserver_url: Some("https://keys.openpgp.org".into()),
            allow_key_download: true,
            portal_url: None,
            always_trust_recipient_key: true,
            min_rsa_key_length: 4096,
            output_dir: None,
            min_free_space: 0,
            passphrase_cmd: None,
            gpg: GpgConfig::default(),
            cert_store: CertStoreConfig::default(),
            transfer: TransferConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl SdtConfig {
    /// Worker count for parallel checksumming, `None` meaning "use every core".
    pub fn max_workers(&self) -> Option<usize> {
        (self.max_cpu > 0).then_some(self.max_cpu as usize)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpgConfig {
    /// gpg executable (default: gpg from PATH)
    pub program: PathBuf,
    /// GNUPGHOME override; unset means gpg's own default
    pub home: Option<PathBuf>,
}

impl Default for GpgConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("gpg"),
            home: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertStoreConfig {
    /// Certificate store directory (default: $XDG_DATA_HOME/sdt/certs)
    pub home: PathBuf,
}

impl Default for CertStoreConfig {
    fn default() -> Self {
        Self {
            home: data_dir().join("certs"),
        }
    }
}

/// Default destination for `sdt transfer`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// "s3" or "local"
    pub protocol: String,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// S3 bucket
    pub bucket: String,
    /// S3 access key id (the secret key is prompted for)
    pub access_key_id: Option<String>,
    /// Object key prefix inside the bucket
    pub prefix: String,
    /// Destination directory for the "local" protocol
    pub destination: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            protocol: "s3".into(),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "sdt".into(),
            access_key_id: None,
            prefix: String::new(),
            destination: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// `$XDG_CONFIG_HOME/sdt`, falling back to `~/.config/sdt`
pub fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config")
}

/// `$XDG_DATA_HOME/sdt`, falling back to `~/.local/share/sdt`
pub fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share")
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(fallback)
        })
        .join("sdt")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
legacy_mode = true
default_sender = "alice@example.org"
compression_level = 9
max_cpu = 4
verify_dtr = true
verify_key_approval = true
verify_package_name = false
package_name_suffix = "upload"
keyserver_url = "https://keys.example.org"
allow_key_download = false
portal_url = "https://portal.example.org"
always_trust_recipient_key = false
min_rsa_key_length = 3072
output_dir = "/srv/outbox"
min_free_space = 1073741824
passphrase_cmd = "pass show sdt"

[gpg]
program = "/usr/bin/gpg2"
home = "/tmp/gnupg"

[cert_store]
home = "/tmp/certs"

[transfer]
protocol = "local"
destination = "/srv/landing"

[log]
level = "debug"
format = "json"
"#;
        let config: SdtConfig = toml::from_str(toml_str).unwrap();

        assert!(config.legacy_mode);
        assert_eq!(config.default_sender.as_deref(), Some("alice@example.org"));
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.max_workers(), Some(4));
        assert!(config.verify_dtr);
        assert!(config.verify_key_approval);
        assert!(!config.verify_package_name);
        assert_eq!(config.package_name_suffix.as_deref(), Some("upload"));
        assert!(!config.allow_key_download);
        assert!(!config.always_trust_recipient_key);
        assert_eq!(config.min_rsa_key_length, 3072);
        assert_eq!(config.output_dir, Some(PathBuf::from("/srv/outbox")));
        assert_eq!(config.min_free_space, 1 << 30);
        assert_eq!(config.gpg.program, PathBuf::from("/usr/bin/gpg2"));
        assert_eq!(config.gpg.home, Some(PathBuf::from("/tmp/gnupg")));
        assert_eq!(config.cert_store.home, PathBuf::from("/tmp/certs"));
        assert_eq!(config.transfer.protocol, "local");
        assert_eq!(config.transfer.destination, Some(PathBuf::from("/srv/landing")));
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_parse_defaults() {
        let config: SdtConfig = toml::from_str("").unwrap();

        assert!(!config.legacy_mode);
        assert_eq!(config.compression_level, 5);
        assert_eq!(config.max_workers(), None);
        assert!(!config.verify_dtr);
        assert!(config.verify_package_name);
        assert!(config.always_trust_recipient_key);
        assert_eq!(config.min_rsa_key_length, 4096);
        assert_eq!(config.min_free_space, 0);
        assert_eq!(config.gpg.program, PathBuf::from("gpg"));
        assert_eq!(config.transfer.region, "us-east-1");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_non_positive_max_cpu_means_all_cores() {
        let config: SdtConfig = toml::from_str("max_cpu = -2").unwrap();
        assert_eq!(config.max_workers(), None);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[transfer]
bucket = "landing-zone"
"#;
        let config: SdtConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.transfer.bucket, "landing-zone");
        // Defaults
        assert_eq!(config.transfer.protocol, "s3");
        assert_eq!(config.compression_level, 5);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = SdtConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: SdtConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.compression_level, parsed.compression_level);
        assert_eq!(config.keyserver_url, parsed.keyserver_url);
        assert_eq!(config.cert_store.home, parsed.cert_store.home);
        assert_eq!(config.transfer.endpoint, parsed.transfer.endpoint);
    }
}
