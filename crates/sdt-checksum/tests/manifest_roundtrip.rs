//! Manifest generation and parsing across real files on disk.

use proptest::prelude::*;
use sdt_checksum::{compute, generate_manifest, read_manifest, verify_manifest, verify_many};
use std::path::PathBuf;

fn file_set() -> impl Strategy<Value = Vec<Vec<u8>>> {
    proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..512), 0..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn generated_manifest_reads_back_in_order(contents in file_set()) {
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<(String, PathBuf)> = contents
            .iter()
            .enumerate()
            .map(|(i, data)| {
                let path = dir.path().join(format!("f{i}"));
                std::fs::write(&path, data).unwrap();
                (format!("content/sub dir/f{i}"), path)
            })
            .collect();

        let manifest = generate_manifest(&entries, Some(3)).unwrap();
        let parsed: Vec<(String, String)> = read_manifest(manifest.as_slice())
            .collect::<Result<_, _>>()
            .unwrap();

        prop_assert_eq!(parsed.len(), entries.len());
        for ((sum, path), (archive_path, source)) in parsed.iter().zip(&entries) {
            prop_assert_eq!(path, archive_path);
            prop_assert_eq!(sum, &compute(source).unwrap());
        }
    }
}

#[test]
fn one_corrupted_file_among_many() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("content")).unwrap();
    let mut manifest = String::new();
    for i in 0..20 {
        let rel = format!("content/file{i}");
        std::fs::write(root.join(&rel), format!("payload {i}")).unwrap();
        manifest.push_str(&format!("{} {rel}\n", compute(&root.join(&rel)).unwrap()));
    }
    assert_eq!(verify_manifest(manifest.as_bytes(), root, Some(4)).unwrap(), 20);

    std::fs::write(root.join("content/file13"), "tampered").unwrap();
    let err = verify_manifest(manifest.as_bytes(), root, Some(4)).unwrap_err();
    assert!(err.to_string().contains("file13"), "{err}");
}

#[test]
fn verify_many_with_default_workers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a");
    std::fs::write(&path, "a").unwrap();
    verify_many(&[(compute(&path).unwrap().to_uppercase(), path)], None).unwrap();
}
