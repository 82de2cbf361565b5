//! Input enumeration and the filesystem gates of the encrypt workflow.

use sdt_core::metadata::CONTENT_FOLDER;
use sdt_core::{SdtError, SdtResult, Warnings};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Expand `paths` into regular files; directories are walked recursively.
///
/// Files keep the order of `paths`; each directory's content is sorted.
pub fn search_files_recursively(paths: &[PathBuf]) -> SdtResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            files.push(path.clone());
        } else if path.is_dir() {
            let mut found = Vec::new();
            walk(path, &mut found)?;
            found.sort();
            files.extend(found);
        } else {
            return Err(SdtError::user(format!(
                "Path '{}' is neither a file nor a directory",
                path.display()
            )));
        }
    }
    debug!(inputs = paths.len(), files = files.len(), "input files enumerated");
    Ok(files)
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> SdtResult<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| SdtError::user(format!("Cannot read directory '{}': {e}", dir.display())))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            walk(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// Fail on the first file the current user cannot open for reading.
pub fn check_read_permission(files: &[PathBuf]) -> SdtResult<()> {
    for file in files {
        std::fs::File::open(file).map_err(|e| {
            SdtError::user(format!("No read permission for '{}': {e}", file.display()))
        })?;
    }
    Ok(())
}

pub fn total_size(files: &[PathBuf]) -> SdtResult<u64> {
    let mut total = 0;
    for file in files {
        total += std::fs::metadata(file)?.len();
    }
    Ok(total)
}

/// Require strictly more free space than `required` at `dir`.
///
/// With `force`, a shortfall is only recorded as a warning.
pub fn check_space(required: u64, dir: &Path, force: bool, warnings: &mut Warnings) -> SdtResult<()> {
    let available = fs2::available_space(dir)?;
    if available > required {
        return Ok(());
    }
    let err = SdtError::OutOfSpace {
        path: dir.to_path_buf(),
        required,
        available,
    };
    if force {
        warnings.push(format!("{err}; continuing because --force was given"));
        return Ok(());
    }
    Err(err)
}

/// Reject Windows-style separators in archive paths on POSIX hosts.
pub fn check_paths_on_posix<S: AsRef<str>>(paths: &[S]) -> SdtResult<()> {
    if !cfg!(unix) {
        return Ok(());
    }
    match paths.iter().map(AsRef::as_ref).find(|p| p.contains('\\')) {
        Some(path) => Err(SdtError::user(format!(
            "On POSIX systems (this machine), backslashes are NOT allowed as path separators. \
             Offending value is [{path}]."
        ))),
        None => Ok(()),
    }
}

/// `content/<path relative to the deepest directory shared by all files>`.
///
/// Names must be UTF-8 without line breaks, as they are stored verbatim in
/// the line-based checksum manifest.
pub fn archive_paths(files: &[PathBuf]) -> SdtResult<Vec<String>> {
    let absolute: Vec<PathBuf> = files
        .iter()
        .map(std::path::absolute)
        .collect::<std::io::Result<_>>()?;
    let root = common_parent(&absolute)
        .ok_or_else(|| SdtError::user("Input files do not share a common root directory"))?;

    absolute
        .iter()
        .map(|file| {
            let rel = file.strip_prefix(&root).map_err(|_| {
                SdtError::user(format!("'{}' is outside '{}'", file.display(), root.display()))
            })?;
            let mut parts = vec![CONTENT_FOLDER.to_string()];
            for component in rel.components() {
                match component {
                    Component::Normal(part) => parts.push(archive_name(part, file)?.to_string()),
                    other => {
                        return Err(SdtError::user(format!(
                            "unexpected path component {other:?} in '{}'",
                            file.display()
                        )))
                    }
                }
            }
            Ok(parts.join("/"))
        })
        .collect()
}

fn archive_name<'a>(part: &'a std::ffi::OsStr, file: &Path) -> SdtResult<&'a str> {
    let name = part.to_str().ok_or_else(|| {
        SdtError::user(format!(
            "File name of '{}' is not valid UTF-8; rename it before packaging",
            file.display()
        ))
    })?;
    if name.contains(['\n', '\r']) {
        return Err(SdtError::user(format!(
            "File name {name:?} contains a line break; rename it before packaging"
        )));
    }
    Ok(name)
}

fn common_parent(files: &[PathBuf]) -> Option<PathBuf> {
    let mut parents = files.iter().filter_map(|f| f.parent());
    let mut common: PathBuf = parents.next()?.to_path_buf();
    for parent in parents {
        while !parent.starts_with(&common) {
            if !common.pop() {
                return None;
            }
        }
    }
    Some(common)
}

/// Removes the file or directory at `path` on drop unless
/// [`DeleteOnError::disarm`] was called.
pub struct DeleteOnError {
    path: PathBuf,
    armed: bool,
}

impl DeleteOnError {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DeleteOnError {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let removed = if self.path.is_dir() {
            std::fs::remove_dir_all(&self.path)
        } else {
            std::fs::remove_file(&self.path)
        };
        match removed {
            Ok(()) => debug!(path = %self.path.display(), "removed incomplete output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove incomplete output"),
        }
    }
}

/// `12.3 MiB -> 4.5 MiB (36.6%)` for the completion log line.
pub fn compression_stats(input: u64, output: u64) -> String {
    let ratio = if input == 0 {
        100.0
    } else {
        output as f64 / input as f64 * 100.0
    };
    format!("{} -> {} ({ratio:.1}%)", human_size(input), human_size(output))
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
