//! Package file names: `[<project_code>_]<timestamp>[_<suffix>].zip`.

use chrono::{DateTime, Local, NaiveDateTime};
use sdt_core::{SdtError, SdtResult};
use std::path::{Path, PathBuf};

pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";
pub const PACKAGE_EXTENSION: &str = "zip";
const LEGACY_EXTENSION: &str = "tar";
const MAX_NAME_LEN: usize = 60;

/// Default package name for `timestamp`, e.g. `proj_20240101T120000_suffix.zip`.
pub fn generate_output_archive_name(
    prefix: Option<&str>,
    timestamp: &DateTime<Local>,
    suffix: Option<&str>,
) -> String {
    let ts = timestamp.format(TIMESTAMP_FORMAT).to_string();
    let parts: Vec<&str> = [prefix, Some(ts.as_str()), suffix]
        .into_iter()
        .flatten()
        .filter(|p| !p.is_empty())
        .collect();
    format!("{}.{PACKAGE_EXTENSION}", parts.join("_"))
}

/// Final output path: `override_path` when given (a directory, or a file name
/// with or without directory and `.zip`), otherwise `default_name` in `dir`.
pub fn resolve_output_path(
    dir: &Path,
    default_name: &str,
    override_path: Option<&Path>,
) -> SdtResult<PathBuf> {
    let path = match override_path {
        None => dir.join(default_name),
        Some(p) if p.is_dir() => p.join(default_name),
        Some(p) => {
            let mut p = p.to_path_buf();
            if p.extension().and_then(|e| e.to_str()) != Some(PACKAGE_EXTENSION) {
                let mut name = p.file_name().map(|n| n.to_os_string()).unwrap_or_default();
                name.push(format!(".{PACKAGE_EXTENSION}"));
                p.set_file_name(name);
            }
            if p.is_relative() && p.parent().is_none_or(|parent| parent.as_os_str().is_empty()) {
                dir.join(p)
            } else {
                p
            }
        }
    };

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| invalid_output(&path, "file name is not valid UTF-8"))?;
    validate_name(stem).map_err(|reason| invalid_output(&path, &reason))?;
    if path.exists() {
        return Err(invalid_output(&path, "file already exists"));
    }
    let parent = path.parent().unwrap_or(Path::new("."));
    check_writable_dir(parent)?;
    Ok(path)
}

fn invalid_output(path: &Path, reason: &str) -> SdtError {
    SdtError::user(format!(
        "Invalid value for argument 'output': '{}': {reason}",
        path.display()
    ))
}

fn validate_name(stem: &str) -> Result<(), String> {
    if stem.is_empty() || stem.len() > MAX_NAME_LEN {
        return Err(format!("name must be 1 to {MAX_NAME_LEN} characters long"));
    }
    if let Some(c) = stem
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        return Err(format!(
            "character '{c}' is not allowed (use letters, digits, '_', '.' and '-')"
        ));
    }
    Ok(())
}

/// The directory must exist and accept new files.
pub fn check_writable_dir(dir: &Path) -> SdtResult<()> {
    if !dir.is_dir() {
        return Err(SdtError::user(format!(
            "Invalid path: '{}'. Path is not a directory.",
            dir.display()
        )));
    }
    tempfile::tempfile_in(dir).map_err(|_| {
        SdtError::user(format!("Invalid path: '{}'. Path is not writable.", dir.display()))
    })?;
    Ok(())
}

/// Check a package file name against the naming convention.
///
/// With `project_code = None` any `[A-Za-z0-9-]+` prefix is accepted. A
/// configured `suffix` must be either fully present or absent.
pub fn check_package_name(name: &str, project_code: Option<&str>, suffix: Option<&str>) -> SdtResult<()> {
    let violation = || {
        let prefix = project_code.map_or_else(|| "[<project_code>_]".to_string(), |c| format!("{c}_"));
        let suffix = suffix.map_or_else(String::new, |s| format!("[_{s}]"));
        SdtError::user(format!(
            "Package name '{name}' does not match the naming convention \
             '{prefix}<YYYYMMDDThhmmss>{suffix}.{PACKAGE_EXTENSION}'"
        ))
    };

    let (stem, ext) = name.rsplit_once('.').ok_or_else(violation)?;
    if ext != PACKAGE_EXTENSION && ext != LEGACY_EXTENSION {
        return Err(violation());
    }

    let rest = match project_code {
        Some(code) => stem
            .strip_prefix(code)
            .and_then(|r| r.strip_prefix('_'))
            .ok_or_else(violation)?,
        None => match stem.split_once('_') {
            Some((head, tail))
                if !is_timestamp(head)
                    && !head.is_empty()
                    && head.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') =>
            {
                tail
            }
            _ => stem,
        },
    };

    let (ts, tail) = match rest.split_once('_') {
        Some((ts, tail)) => (ts, Some(tail)),
        None => (rest, None),
    };
    if !is_timestamp(ts) {
        return Err(violation());
    }
    match (tail, suffix) {
        (None, _) => Ok(()),
        (Some(t), Some(s)) if t == s => Ok(()),
        _ => Err(violation()),
    }
}

fn is_timestamp(s: &str) -> bool {
    s.len() == 15 && NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn ts() -> DateTime<Local> {
        Local.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn default_names() {
        assert_eq!(generate_output_archive_name(None, &ts(), None), "20230101T120000.zip");
        assert_eq!(
            generate_output_archive_name(Some("proj"), &ts(), Some("suffix")),
            "proj_20230101T120000_suffix.zip"
        );
        assert_eq!(
            generate_output_archive_name(Some(""), &ts(), Some("s")),
            "20230101T120000_s.zip"
        );
    }

    #[test]
    fn naming_convention_suffix_present_or_absent() {
        check_package_name("proj_20230101T120000_suffix.zip", Some("proj"), Some("suffix")).unwrap();
        check_package_name("proj_20230101T120000.zip", Some("proj"), Some("suffix")).unwrap();
        assert!(check_package_name("proj_20230101T120000_wrong.zip", Some("proj"), Some("suffix")).is_err());
        assert!(check_package_name("proj_20230101T120000_suffixx.zip", Some("proj"), Some("suffix")).is_err());
    }

    #[test]
    fn naming_convention_project_code() {
        assert!(check_package_name("other_20230101T120000.zip", Some("proj"), None).is_err());
        check_package_name("20230101T120000.zip", None, None).unwrap();
        check_package_name("any-code_20230101T120000.tar", None, None).unwrap();
        assert!(check_package_name("proj_20230101T120000.txt", Some("proj"), None).is_err());
        assert!(check_package_name("proj_2023-01-01.zip", Some("proj"), None).is_err());
        assert!(check_package_name("proj_20230101T120000_x.zip", Some("proj"), None).is_err());
    }

    #[test]
    fn output_path_validation() {
        let dir = tempfile::tempdir().unwrap();
        let default = "20230101T120000.zip";
        assert_eq!(resolve_output_path(dir.path(), default, None).unwrap(), dir.path().join(default));
        assert_eq!(
            resolve_output_path(dir.path(), default, Some(Path::new("my_package"))).unwrap(),
            dir.path().join("my_package.zip")
        );
        assert_eq!(
            resolve_output_path(dir.path(), default, Some(dir.path())).unwrap(),
            dir.path().join(default)
        );
        assert!(resolve_output_path(dir.path(), default, Some(Path::new("bad name"))).is_err());
        assert!(resolve_output_path(dir.path(), default, Some(&dir.path().join("missing/p.zip"))).is_err());

        let too_long = "a".repeat(61);
        assert!(resolve_output_path(dir.path(), default, Some(Path::new(&too_long))).is_err());

        std::fs::write(dir.path().join(default), b"").unwrap();
        assert!(resolve_output_path(dir.path(), default, None).is_err());
    }

    proptest! {
        #[test]
        fn generated_names_pass_the_check(
            code in "[A-Za-z0-9-]{1,12}",
            suffix in proptest::option::of("[A-Za-z0-9]{1,8}"),
            secs in 0i64..4_000_000_000,
        ) {
            let when = Local.timestamp_opt(secs, 0).single().unwrap_or_else(ts);
            let name = generate_output_archive_name(Some(&code), &when, suffix.as_deref());
            prop_assert!(check_package_name(&name, Some(&code), suffix.as_deref()).is_ok());
            prop_assert!(check_package_name(&name, None, suffix.as_deref()).is_ok());
        }
    }
}
