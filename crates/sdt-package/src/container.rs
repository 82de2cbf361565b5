//! The on-disk package: a zip (legacy: tar) holding the encrypted payload,
//! the metadata JSON and its detached signature.

use sdt_core::metadata::{CONTAINER_MEMBERS, DATA_FILE_ENCRYPTED, METADATA_FILE, METADATA_FILE_SIG};
use sdt_core::{MetaData, SdtError, SdtResult};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Members are stored uncompressed; the payload is already compressed and encrypted.
pub fn member_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(true)
}

/// Start a new container at `path`.
pub fn create(path: &Path) -> SdtResult<ZipWriter<File>> {
    let file = File::create(path)
        .map_err(|e| SdtError::user(format!("Cannot create '{}': {e}", path.display())))?;
    Ok(ZipWriter::new(file))
}

pub fn write_member<W: Write + io::Seek>(zip: &mut ZipWriter<W>, name: &str, data: &[u8]) -> SdtResult<()> {
    zip.start_file(name, member_options()).map_err(zip_error)?;
    zip.write_all(data)?;
    Ok(())
}

pub(crate) fn zip_error(e: zip::result::ZipError) -> SdtError {
    match e {
        zip::result::ZipError::Io(io) => SdtError::Io(io),
        other => SdtError::Other(anyhow::anyhow!("zip: {other}")),
    }
}

enum Kind {
    Zip(ZipArchive<File>),
    Tar,
}

/// A package opened for reading, with its structure already checked.
pub struct Container {
    path: PathBuf,
    kind: Kind,
}

impl Container {
    /// Open `path` and check its extension and required members.
    pub fn open(path: &Path) -> SdtResult<Self> {
        let invalid = |reason: String| {
            SdtError::user(format!("'{}' is not a valid data package: {reason}", path.display()))
        };
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let (kind, members) = match ext {
            "zip" => {
                let file = File::open(path)?;
                let archive = ZipArchive::new(file).map_err(|e| invalid(e.to_string()))?;
                let members: BTreeSet<String> = archive.file_names().map(str::to_string).collect();
                (Kind::Zip(archive), members)
            }
            "tar" => {
                let mut archive = tar::Archive::new(File::open(path)?);
                let mut members = BTreeSet::new();
                for entry in archive.entries().map_err(|e| invalid(e.to_string()))? {
                    let entry = entry.map_err(|e| invalid(e.to_string()))?;
                    members.insert(entry.path()?.to_string_lossy().into_owned());
                }
                (Kind::Tar, members)
            }
            _ => return Err(invalid("expected a .zip or .tar file".into())),
        };

        let missing: Vec<&str> = CONTAINER_MEMBERS
            .iter()
            .copied()
            .filter(|m| !members.contains(*m))
            .collect();
        if !missing.is_empty() {
            return Err(invalid(format!("missing member(s) {}", missing.join(", "))));
        }
        Ok(Self {
            path: path.to_path_buf(),
            kind,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Stream member `name` into `out`, returning the bytes copied.
    pub fn copy_member(&mut self, name: &str, out: &mut dyn Write) -> SdtResult<u64> {
        match &mut self.kind {
            Kind::Zip(archive) => {
                let mut member = archive.by_name(name).map_err(zip_error)?;
                Ok(io::copy(&mut member, out)?)
            }
            Kind::Tar => {
                let mut archive = tar::Archive::new(File::open(&self.path)?);
                for entry in archive.entries()? {
                    let mut entry = entry?;
                    if entry.path()?.to_string_lossy() == name {
                        return Ok(io::copy(&mut entry, out)?);
                    }
                }
                Err(SdtError::user(format!(
                    "member '{name}' not found in '{}'",
                    self.path.display()
                )))
            }
        }
    }

    pub fn read_member(&mut self, name: &str) -> SdtResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.copy_member(name, &mut buf)?;
        Ok(buf)
    }

    /// Parsed metadata plus the exact signed bytes and their signature.
    pub fn read_metadata(&mut self) -> SdtResult<(MetaData, Vec<u8>, Vec<u8>)> {
        let raw = self.read_member(METADATA_FILE)?;
        let signature = self.read_member(METADATA_FILE_SIG)?;
        let metadata = MetaData::from_json(&raw).map_err(|e| {
            SdtError::user(format!("{}: {e}", self.path.display()))
        })?;
        Ok((metadata, raw, signature))
    }

    /// Stream the encrypted payload into `out`.
    pub fn copy_payload(&mut self, out: &mut dyn Write) -> SdtResult<u64> {
        self.copy_member(DATA_FILE_ENCRYPTED, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(path: &Path, members: &[(&str, &str)]) {
        let mut zip = create(path).unwrap();
        for (name, data) in members {
            write_member(&mut zip, name, data.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn missing_members_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.zip");
        build(&path, &[(DATA_FILE_ENCRYPTED, "x"), (METADATA_FILE, "{}")]);
        let err = Container::open(&path).err().unwrap();
        assert!(err.to_string().contains(METADATA_FILE_SIG), "{err}");
    }

    #[test]
    fn wrong_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.7z");
        std::fs::write(&path, b"x").unwrap();
        assert!(Container::open(&path).is_err());
    }

    #[test]
    fn members_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.zip");
        build(
            &path,
            &[(DATA_FILE_ENCRYPTED, "payload"), (METADATA_FILE, "{}"), (METADATA_FILE_SIG, "sig")],
        );
        let mut container = Container::open(&path).unwrap();
        assert_eq!(container.file_name(), "p.zip");
        assert_eq!(container.read_member(METADATA_FILE_SIG).unwrap(), b"sig");
        let mut payload = Vec::new();
        assert_eq!(container.copy_payload(&mut payload).unwrap(), 7);
        assert_eq!(payload, b"payload");
        assert!(container.read_metadata().is_err(), "empty JSON object is not valid metadata");
    }

    #[test]
    fn legacy_tar_containers_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.tar");
        let mut builder = tar::Builder::new(File::create(&path).unwrap());
        for name in CONTAINER_MEMBERS {
            let data = name.as_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        }
        builder.into_inner().unwrap();

        let mut container = Container::open(&path).unwrap();
        assert_eq!(container.read_member(METADATA_FILE).unwrap(), METADATA_FILE.as_bytes());
    }
}
