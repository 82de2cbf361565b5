//! OpenDAL operator factories and the streaming upload loop

use anyhow::{Context, Result};
use opendal::Operator;
use sdt_core::Progress;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// Size of each part handed to the storage writer
pub const UPLOAD_CHUNK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

/// Build an OpenDAL operator for any S3-compatible endpoint (path-style addressing).
pub fn build_s3_operator(cfg: &S3Settings) -> Result<Operator> {
    if cfg.endpoint.starts_with("http://") {
        warn!(
            endpoint = %cfg.endpoint,
            "S3 endpoint uses plaintext HTTP, credentials are transmitted unencrypted"
        );
    }
    let mut builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&cfg.access_key_id)
        .secret_access_key(&cfg.secret_access_key);
    if let Some(token) = cfg.session_token.as_deref().filter(|t| !t.is_empty()) {
        builder = builder.session_token(token);
    }

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();
    Ok(op)
}

/// Build an operator rooted at a local directory.
pub fn build_fs_operator(root: &Path) -> Result<Operator> {
    let root = root
        .to_str()
        .with_context(|| format!("destination path is not valid UTF-8: {}", root.display()))?;
    let op = Operator::new(opendal::services::Fs::default().root(root))
        .context("creating OpenDAL fs operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();
    Ok(op)
}

/// Object key for a package: `<prefix>/<file name>`.
pub fn object_key(prefix: &str, path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("invalid package file name: {}", path.display()))?;
    let prefix = prefix.trim_matches('/');
    Ok(if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    })
}

/// Stream every file to `op` under `prefix`, reporting bytes sent across the batch.
pub async fn upload_files(
    op: &Operator,
    prefix: &str,
    files: &[PathBuf],
    progress: &dyn Progress,
) -> Result<()> {
    let mut total = 0u64;
    for path in files {
        total += tokio::fs::metadata(path)
            .await
            .with_context(|| format!("reading metadata: {}", path.display()))?
            .len();
    }

    let mut done = 0u64;
    let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
    for path in files {
        let key = object_key(prefix, path)?;
        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let mut writer = op
            .writer_with(&key)
            .chunk(UPLOAD_CHUNK_SIZE)
            .await
            .with_context(|| format!("opening upload for {key}"))?;
        loop {
            let n = file
                .read(&mut buf)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            if n == 0 {
                break;
            }
            writer
                .write(buf[..n].to_vec())
                .await
                .with_context(|| format!("uploading {key}"))?;
            done += n as u64;
            progress.update(done, total, &key);
        }
        writer
            .close()
            .await
            .with_context(|| format!("finishing upload of {key}"))?;
        debug!(key = %key, "uploaded");
    }
    info!(files = files.len(), bytes = total, "upload complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_operator_builds_with_and_without_token() {
        let mut cfg = S3Settings {
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "test-bucket".into(),
            access_key_id: "key".into(),
            secret_access_key: "secret".into(),
            session_token: None,
        };
        assert!(build_s3_operator(&cfg).is_ok());
        cfg.session_token = Some("token".into());
        assert!(build_s3_operator(&cfg).is_ok());
    }

    #[test]
    fn object_key_joins_prefix() {
        let path = Path::new("/tmp/out/proj_20240101T000000.zip");
        assert_eq!(object_key("", path).unwrap(), "proj_20240101T000000.zip");
        assert_eq!(object_key("/inbox/", path).unwrap(), "inbox/proj_20240101T000000.zip");
    }

    #[tokio::test]
    async fn upload_streams_into_memory_backend() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.zip");
        let b = dir.path().join("b.zip");
        std::fs::write(&a, vec![1u8; 1000]).unwrap();
        std::fs::write(&b, b"second").unwrap();

        let op = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        let last = std::sync::Mutex::new((0u64, 0u64));
        let progress = |done: u64, total: u64, _key: &str| *last.lock().unwrap() = (done, total);
        upload_files(&op, "batch", &[a, b], &progress).await.unwrap();

        assert_eq!(op.read("batch/a.zip").await.unwrap().to_vec(), vec![1u8; 1000]);
        assert_eq!(op.read("batch/b.zip").await.unwrap().to_vec(), b"second");
        assert_eq!(*last.lock().unwrap(), (1006, 1006));
    }
}
