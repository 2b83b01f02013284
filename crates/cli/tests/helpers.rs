use std::fs;

use privgate::{emit, load_policy, sha256_file, verbosity_filter};
use privgate_core::model::PrivilegeLevel;
use tempfile::tempdir;

#[test]
fn sha256_file_matches_known_digest() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("abc.bin");
    fs::write(&path, b"abc").expect("write");
    assert_eq!(
        sha256_file(&path).expect("hash"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

#[test]
fn sha256_file_reports_missing_file() {
    let dir = tempdir().expect("tempdir");
    let err = sha256_file(&dir.path().join("missing")).expect_err("missing file");
    assert!(err.to_string().contains("Failed to open image for hashing"));
}

#[test]
fn load_policy_defaults_without_path() {
    let config = load_policy(None).expect("default policy");
    assert_eq!(config.default_executable, PrivilegeLevel::Unprivileged);
    assert!(!config.section_rules.is_empty());
}

#[test]
fn load_policy_wraps_errors_with_path() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("broken.yaml");
    fs::write(&path, "section_rules: [ { pattern: 1 ").expect("write");
    let err = load_policy(Some(&path)).expect_err("broken policy");
    assert!(format!("{err:#}").contains("broken.yaml"));
}

#[test]
fn verbosity_maps_to_filters() {
    assert_eq!(verbosity_filter(0), "warn");
    assert_eq!(verbosity_filter(1), "info");
    assert_eq!(verbosity_filter(2), "debug");
    assert_eq!(verbosity_filter(9), "trace");
}

#[test]
fn emit_writes_to_file() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("out.txt");
    emit(Some(&path), "body").expect("emit");
    assert_eq!(fs::read_to_string(&path).expect("read"), "body");
}
