mod common;

use common::*;
use sdt_checksum::compute_bytes;
use sdt_core::metadata::{CONTAINER_MEMBERS, DATA_FILE_ENCRYPTED};
use sdt_core::{Purpose, SdtError};
use sdt_crypto::CryptoBackend;
use sdt_package::{encrypt, Container, EncryptOptions, Session};
use std::path::Path;

fn options(input: &Path, output: &Path) -> EncryptOptions {
    EncryptOptions {
        files: vec![input.to_path_buf()],
        sender: Some("sender@example.org".into()),
        recipients: vec!["bob@example.org".into()],
        transfer_id: Some(42),
        purpose: Some(Purpose::Test),
        output: Some(output.to_path_buf()),
        ..EncryptOptions::default()
    }
}

#[test]
fn package_holds_signed_metadata_over_encrypted_payload() {
    let dir = tempfile::tempdir().unwrap();
    let input = input_tree(dir.path());
    let output = dir.path().join("proj_20240101T000001.zip");
    let backend = FakeBackend::new();
    let config = config(dir.path());
    let session = Session::new(&config, &backend);

    let report = encrypt(&session, &options(&input, &output), &passphrase(SENDER_PASS), &no_progress).unwrap();
    assert_eq!(report.output.as_deref(), Some(output.as_path()));
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);

    let archive = zip::ZipArchive::new(std::fs::File::open(&output).unwrap()).unwrap();
    let mut names: Vec<&str> = archive.file_names().collect();
    names.sort();
    let mut expected = CONTAINER_MEMBERS.to_vec();
    expected.sort();
    assert_eq!(names, expected);

    let mut container = Container::open(&output).unwrap();
    let (metadata, raw, signature) = container.read_metadata().unwrap();
    assert_eq!(metadata.sender, SENDER);
    assert_eq!(metadata.recipients, [BOB]);
    assert_eq!(metadata.transfer_id, Some(42));
    assert_eq!(metadata.compression_algorithm, "gzip");
    assert_eq!(backend.verify_detached_signature(&raw, &signature).unwrap(), SENDER);

    let payload = container.read_member(DATA_FILE_ENCRYPTED).unwrap();
    assert_eq!(metadata.checksum, compute_bytes(&payload));
}

#[test]
fn level_zero_records_no_compression() {
    let dir = tempfile::tempdir().unwrap();
    let input = input_tree(dir.path());
    let output = dir.path().join("proj_20240101T000002.zip");
    let backend = FakeBackend::new();
    let config = config(dir.path());
    let opts = EncryptOptions {
        compression_level: Some(0),
        ..options(&input, &output)
    };

    encrypt(&Session::new(&config, &backend), &opts, &passphrase(SENDER_PASS), &no_progress).unwrap();
    let (metadata, _, _) = Container::open(&output).unwrap().read_metadata().unwrap();
    assert_eq!(metadata.compression_algorithm, "");
}

#[test]
fn compression_level_above_nine_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let input = input_tree(dir.path());
    let output = dir.path().join("proj_20240101T000003.zip");
    let backend = FakeBackend::new();
    let config = config(dir.path());
    let opts = EncryptOptions {
        compression_level: Some(10),
        ..options(&input, &output)
    };

    let err = encrypt(&Session::new(&config, &backend), &opts, &no_prompt(), &no_progress).unwrap_err();
    assert!(err.to_string().contains("[0-9]"), "{err}");
    assert!(!output.exists());
}

#[test]
fn empty_directory_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let empty = dir.path().join("empty");
    std::fs::create_dir(&empty).unwrap();
    let output = dir.path().join("proj_20240101T000004.zip");
    let backend = FakeBackend::new();
    let config = config(dir.path());

    let err = encrypt(
        &Session::new(&config, &backend),
        &options(&empty, &output),
        &passphrase(SENDER_PASS),
        &no_progress,
    )
    .unwrap_err();
    assert!(err.to_string().contains("No input files found"), "{err}");
    assert!(!output.exists());
}

#[test]
fn dry_run_writes_nothing_and_never_asks_for_a_passphrase() {
    let dir = tempfile::tempdir().unwrap();
    let input = input_tree(dir.path());
    let output = dir.path().join("proj_20240101T000005.zip");
    let backend = FakeBackend::new();
    let config = config(dir.path());
    let opts = EncryptOptions {
        dry_run: true,
        ..options(&input, &output)
    };

    let report = encrypt(&Session::new(&config, &backend), &opts, &no_prompt(), &no_progress).unwrap();
    assert!(report.output.is_none());
    assert!(!output.exists());
}

#[test]
fn wrong_passphrase_fails_before_output_exists() {
    let dir = tempfile::tempdir().unwrap();
    let input = input_tree(dir.path());
    let output = dir.path().join("proj_20240101T000006.zip");
    let backend = FakeBackend::new();
    let config = config(dir.path());

    let err = encrypt(
        &Session::new(&config, &backend),
        &options(&input, &output),
        &passphrase("not it"),
        &no_progress,
    )
    .unwrap_err();
    assert!(matches!(err, SdtError::User(_)), "{err:?}");
    assert!(err.to_string().contains("wrong passphrase"), "{err}");
    assert!(!output.exists());
}

#[test]
fn existing_output_is_never_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let input = input_tree(dir.path());
    let output = dir.path().join("proj_20240101T000007.zip");
    std::fs::write(&output, b"precious").unwrap();
    let backend = FakeBackend::new();
    let config = config(dir.path());

    let err = encrypt(
        &Session::new(&config, &backend),
        &options(&input, &output),
        &passphrase(SENDER_PASS),
        &no_progress,
    )
    .unwrap_err();
    assert!(err.to_string().contains("already exists"), "{err}");
    assert_eq!(std::fs::read(&output).unwrap(), b"precious");
}

#[test]
fn sender_without_secret_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let input = input_tree(dir.path());
    let output = dir.path().join("proj_20240101T000008.zip");
    let backend = FakeBackend::new();
    let config = config(dir.path());
    let opts = EncryptOptions {
        sender: Some(CAROL.into()),
        ..options(&input, &output)
    };

    let err = encrypt(&Session::new(&config, &backend), &opts, &no_prompt(), &no_progress).unwrap_err();
    assert!(err.to_string().contains("No secret key"), "{err}");
}

#[test]
fn dtr_check_supplies_the_project_code() {
    let dir = tempfile::tempdir().unwrap();
    let input = input_tree(dir.path());
    let backend = FakeBackend::new();
    let portal = FakePortal {
        dtrs: [(42, "proj".to_string())].into(),
        ..FakePortal::default()
    };
    let config = sdt_core::config::SdtConfig {
        verify_dtr: true,
        ..config(dir.path())
    };
    let opts = EncryptOptions {
        output: None,
        ..options(&input, dir.path())
    };
    let session = Session::new(&config, &backend).with_portal(&portal);

    let report = encrypt(&session, &opts, &passphrase(SENDER_PASS), &no_progress).unwrap();
    let name = report.output.unwrap().file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("proj_"), "{name}");
    sdt_package::check_package_name(&name, Some("proj"), None).unwrap();

    let unknown = EncryptOptions {
        transfer_id: Some(7),
        ..opts
    };
    let err = encrypt(&session, &unknown, &no_prompt(), &no_progress).unwrap_err();
    assert!(err.to_string().contains("Cannot verify DTR"), "{err}");
}

#[test]
fn shortage_of_space_blocks_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let input = input_tree(dir.path());
    let output = dir.path().join("proj_20240101T000009.zip");
    let backend = FakeBackend::new();
    let config = sdt_core::config::SdtConfig {
        min_free_space: u64::MAX,
        ..config(dir.path())
    };
    let session = Session::new(&config, &backend);

    let err = encrypt(&session, &options(&input, &output), &no_prompt(), &no_progress).unwrap_err();
    assert!(matches!(err, SdtError::OutOfSpace { .. }), "{err:?}");
    assert!(err.to_string().contains("--force"), "{err}");
    assert!(!output.exists());

    let forced = EncryptOptions {
        force: true,
        ..options(&input, &output)
    };
    let report = encrypt(&session, &forced, &passphrase(SENDER_PASS), &no_progress).unwrap();
    assert_eq!(report.output.as_deref(), Some(output.as_path()));
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings.iter().any(|w| w.contains("--force")));
}

#[test]
fn failure_while_encrypting_removes_the_partial_package() {
    let dir = tempfile::tempdir().unwrap();
    let input = input_tree(dir.path());
    let output = dir.path().join("proj_20240101T000010.zip");
    let backend = FakeBackend::new().with_broken_stream();
    let config = config(dir.path());

    let err = encrypt(
        &Session::new(&config, &backend),
        &options(&input, &output),
        &passphrase(SENDER_PASS),
        &no_progress,
    )
    .unwrap_err();
    assert!(err.to_string().contains("interrupted"), "{err}");
    assert!(!output.exists());
}

#[cfg(target_os = "linux")]
#[test]
fn non_utf8_file_names_are_refused() {
    use std::os::unix::ffi::OsStrExt;

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    std::fs::create_dir(&input).unwrap();
    std::fs::write(input.join(std::ffi::OsStr::from_bytes(b"f\xff.txt")), b"one").unwrap();
    std::fs::write(input.join(std::ffi::OsStr::from_bytes(b"f\xfe.txt")), b"two").unwrap();
    let output = dir.path().join("proj_20240101T000011.zip");
    let backend = FakeBackend::new();
    let config = config(dir.path());

    let err = encrypt(&Session::new(&config, &backend), &options(&input, &output), &no_prompt(), &no_progress)
        .unwrap_err();
    assert!(matches!(err, SdtError::User(_)), "{err:?}");
    assert!(err.to_string().contains("not valid UTF-8"), "{err}");
    assert!(!output.exists());
}

#[cfg(unix)]
#[test]
fn line_breaks_in_file_names_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    std::fs::create_dir(&input).unwrap();
    std::fs::write(input.join("a\nb.txt"), b"one").unwrap();
    std::fs::write(input.join("c.txt"), b"two").unwrap();
    let output = dir.path().join("proj_20240101T000012.zip");
    let backend = FakeBackend::new();
    let config = config(dir.path());

    let err = encrypt(&Session::new(&config, &backend), &options(&input, &output), &no_prompt(), &no_progress)
        .unwrap_err();
    assert!(matches!(err, SdtError::User(_)), "{err:?}");
    assert!(err.to_string().contains("line break"), "{err}");
    assert!(!output.exists());
}
