//! The transfer protocol capability and its S3 and local-directory implementations.
//!
//! Workflows stay synchronous: each protocol drives its async OpenDAL
//! operator on a runtime it builds for the duration of an upload.

use crate::operator::{build_fs_operator, build_s3_operator, upload_files, S3Settings};
use opendal::Operator;
use sdt_core::config::TransferConfig;
use sdt_core::{Progress, SdtError, SdtResult};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

/// Callback returning a two-factor code when a protocol asks for one.
pub type TwoFactor<'a> = &'a dyn Fn() -> Option<String>;

pub trait TransferProtocol: Send {
    fn name(&self) -> &'static str;

    /// Names of the secret arguments this protocol needs before `upload`.
    fn required_password_args(&self) -> &'static [&'static str];

    /// Secrets that are used when supplied but never prompted for.
    fn optional_password_args(&self) -> &'static [&'static str] {
        &[]
    }

    fn has_secret(&self, name: &str) -> bool;

    fn set_secret(&mut self, name: &str, value: SecretString) -> SdtResult<()>;

    /// Send `files` to the destination. All files go in one call.
    fn upload(&self, files: &[PathBuf], two_factor: TwoFactor<'_>, progress: &dyn Progress) -> SdtResult<()>;
}

/// Build the protocol named by `[transfer] protocol`.
pub fn protocol_from_config(cfg: &TransferConfig) -> SdtResult<Box<dyn TransferProtocol>> {
    match cfg.protocol.as_str() {
        "s3" => Ok(Box::new(S3Protocol::from_config(cfg)?)),
        "local" => Ok(Box::new(LocalProtocol::from_config(cfg)?)),
        other => Err(SdtError::user(format!(
            "Unknown transfer protocol '{other}' (expected 's3' or 'local')"
        ))),
    }
}

fn block_on<F: std::future::Future>(future: F) -> SdtResult<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| SdtError::service("starting transfer runtime", e))?;
    Ok(runtime.block_on(future))
}

fn run_upload(
    protocol: &str,
    op: Operator,
    prefix: &str,
    files: &[PathBuf],
    progress: &dyn Progress,
) -> SdtResult<()> {
    info!(protocol, files = files.len(), "starting upload");
    block_on(upload_files(&op, prefix, files, progress))?
        .map_err(|e| SdtError::service(format!("{protocol} upload failed"), e))
}

pub struct S3Protocol {
    endpoint: String,
    region: String,
    bucket: String,
    access_key_id: String,
    prefix: String,
    secrets: HashMap<&'static str, SecretString>,
}

impl S3Protocol {
    const SECRET_ARGS: &'static [&'static str] = &["secret_access_key"];
    const OPTIONAL_ARGS: &'static [&'static str] = &["session_token"];

    pub fn from_config(cfg: &TransferConfig) -> SdtResult<Self> {
        let access_key_id = cfg
            .access_key_id
            .clone()
            .ok_or_else(|| SdtError::user("S3 transfer requires [transfer] access_key_id in the config"))?;
        Ok(Self {
            endpoint: cfg.endpoint.clone(),
            region: cfg.region.clone(),
            bucket: cfg.bucket.clone(),
            access_key_id,
            prefix: cfg.prefix.clone(),
            secrets: HashMap::new(),
        })
    }

    fn settings(&self) -> SdtResult<S3Settings> {
        let secret_access_key = self
            .secrets
            .get("secret_access_key")
            .ok_or_else(|| SdtError::user("S3 secret_access_key has not been provided"))?;
        Ok(S3Settings {
            endpoint: self.endpoint.clone(),
            region: self.region.clone(),
            bucket: self.bucket.clone(),
            access_key_id: self.access_key_id.clone(),
            secret_access_key: secret_access_key.expose_secret().to_owned(),
            session_token: self
                .secrets
                .get("session_token")
                .map(|t| t.expose_secret().to_owned()),
        })
    }
}

impl TransferProtocol for S3Protocol {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn required_password_args(&self) -> &'static [&'static str] {
        Self::SECRET_ARGS
    }

    fn optional_password_args(&self) -> &'static [&'static str] {
        Self::OPTIONAL_ARGS
    }

    fn has_secret(&self, name: &str) -> bool {
        self.secrets.contains_key(name)
    }

    fn set_secret(&mut self, name: &str, value: SecretString) -> SdtResult<()> {
        let key = Self::SECRET_ARGS
            .iter()
            .chain(Self::OPTIONAL_ARGS)
            .find(|arg| **arg == name)
            .ok_or_else(|| SdtError::user(format!("S3 protocol has no secret argument '{name}'")))?;
        if Self::OPTIONAL_ARGS.contains(key) && value.expose_secret().is_empty() {
            self.secrets.remove(*key);
            return Ok(());
        }
        self.secrets.insert(*key, value);
        Ok(())
    }

    fn upload(&self, files: &[PathBuf], _two_factor: TwoFactor<'_>, progress: &dyn Progress) -> SdtResult<()> {
        let op = build_s3_operator(&self.settings()?)
            .map_err(|e| SdtError::service("configuring S3 transfer", e))?;
        run_upload(self.name(), op, &self.prefix, files, progress)
    }
}

/// Copies packages into a local (or mounted) directory.
pub struct LocalProtocol {
    destination: PathBuf,
}

impl LocalProtocol {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
        }
    }

    pub fn from_config(cfg: &TransferConfig) -> SdtResult<Self> {
        cfg.destination
            .clone()
            .map(Self::new)
            .ok_or_else(|| SdtError::user("Local transfer requires [transfer] destination in the config"))
    }
}

impl TransferProtocol for LocalProtocol {
    fn name(&self) -> &'static str {
        "local"
    }

    fn required_password_args(&self) -> &'static [&'static str] {
        &[]
    }

    fn has_secret(&self, _name: &str) -> bool {
        false
    }

    fn set_secret(&mut self, name: &str, _value: SecretString) -> SdtResult<()> {
        Err(SdtError::user(format!("local protocol has no secret argument '{name}'")))
    }

    fn upload(&self, files: &[PathBuf], _two_factor: TwoFactor<'_>, progress: &dyn Progress) -> SdtResult<()> {
        let op = build_fs_operator(&self.destination)
            .map_err(|e| SdtError::service("configuring local transfer", e))?;
        run_upload(self.name(), op, "", files, progress)
    }
}
