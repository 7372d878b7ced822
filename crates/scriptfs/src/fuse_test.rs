// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use rstest::{fixture, rstest};

use super::Session;
use crate::{Config, Procedure};

#[fixture]
fn tmpdir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("scriptfs-test-")
        .tempdir()
        .expect("failed to create dir for test")
}

fn session(dir: &Path, specs: &[&str], eager_size: bool) -> Session {
    let mut config = Config::new(dir);
    config.procedures = specs
        .iter()
        .map(|s| Procedure::from_spec(s).expect("test spec should parse"))
        .collect();
    config.eager_size = eager_size;
    Session::new(config).expect("failed to build test session")
}

fn write_exe(dir: &Path, name: &str, content: &str) {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[rstest]
fn test_root_inode_is_the_mirror(tmpdir: tempfile::TempDir) {
    let session = session(tmpdir.path(), &[], false);
    assert_eq!(session.rel_for(super::ROOT_INO), Some(PathBuf::from(".")));
}

#[rstest]
fn test_inode_allocation_is_stable(tmpdir: tempfile::TempDir) {
    let session = session(tmpdir.path(), &[], false);
    let first = session.ino_for(Path::new("some/file"));
    let second = session.ino_for(Path::new("some/file"));
    assert_eq!(first, second);
    assert_ne!(first, super::ROOT_INO);
    assert_eq!(session.rel_for(first), Some(PathBuf::from("some/file")));
}

#[rstest]
fn test_children_of_the_root_have_bare_paths(tmpdir: tempfile::TempDir) {
    let session = session(tmpdir.path(), &[], false);
    let rel = session
        .child_rel(super::ROOT_INO, std::ffi::OsStr::new("hello_script"))
        .unwrap();
    assert_eq!(rel, PathBuf::from("hello_script"));
}

#[rstest]
fn test_attr_clears_write_bits_on_scripts(tmpdir: tempfile::TempDir) {
    write_exe(tmpdir.path(), "hello_script", "#!/bin/sh\necho Hi\n");
    std::fs::write(tmpdir.path().join("hello_text"), "A\nB\n").unwrap();
    std::fs::set_permissions(
        tmpdir.path().join("hello_text"),
        std::fs::Permissions::from_mode(0o644),
    )
    .unwrap();
    let session = session(tmpdir.path(), &[], false);

    let script = session.ino_for(Path::new("hello_script"));
    let attr = session.attr_at(script, Path::new("hello_script")).unwrap();
    assert_eq!(attr.perm & 0o222, 0, "scripts must not advertise write bits");
    assert_eq!(attr.perm, 0o555);

    let text = session.ino_for(Path::new("hello_text"));
    let attr = session.attr_at(text, Path::new("hello_text")).unwrap();
    assert_eq!(attr.perm, 0o644);
}

#[rstest]
fn test_attr_reports_source_size_by_default(tmpdir: tempfile::TempDir) {
    let source = "#!/bin/sh\necho 12345\n";
    write_exe(tmpdir.path(), "gen", source);
    let session = session(tmpdir.path(), &[], false);

    let ino = session.ino_for(Path::new("gen"));
    let attr = session.attr_at(ino, Path::new("gen")).unwrap();
    assert_eq!(attr.size, source.len() as u64);
}

#[rstest]
fn test_attr_reports_output_size_when_eager(tmpdir: tempfile::TempDir) {
    write_exe(tmpdir.path(), "gen", "#!/bin/sh\necho 12345\n");
    let session = session(tmpdir.path(), &[], true);

    let ino = session.ino_for(Path::new("gen"));
    let attr = session.attr_at(ino, Path::new("gen")).unwrap();
    assert_eq!(attr.size, 6, "eager stat must measure the script output");
}

#[rstest]
fn test_protects_only_classified_regular_files(tmpdir: tempfile::TempDir) {
    write_exe(tmpdir.path(), "hello_script", "#!/bin/sh\necho Hi\n");
    std::fs::write(tmpdir.path().join("hello_text"), "A\nB\n").unwrap();
    std::fs::create_dir(tmpdir.path().join("sub")).unwrap();
    let session = session(tmpdir.path(), &[], false);

    assert!(session.protects(Path::new("hello_script")));
    assert!(!session.protects(Path::new("hello_text")));
    assert!(!session.protects(Path::new("sub")));
    assert!(!session.protects(Path::new("missing")));
}

#[rstest]
fn test_move_tree_follows_renames(tmpdir: tempfile::TempDir) {
    let session = session(tmpdir.path(), &[], false);
    let dir = session.ino_for(Path::new("dir"));
    let child = session.ino_for(Path::new("dir/a"));
    let nested = session.ino_for(Path::new("dir/sub/b"));
    let outside = session.ino_for(Path::new("dirty"));

    session.move_tree(Path::new("dir"), Path::new("newdir"));

    assert_eq!(session.rel_for(dir), Some(PathBuf::from("newdir")));
    assert_eq!(session.rel_for(child), Some(PathBuf::from("newdir/a")));
    assert_eq!(session.rel_for(nested), Some(PathBuf::from("newdir/sub/b")));
    assert_eq!(session.rel_for(outside), Some(PathBuf::from("dirty")));
}

#[rstest]
fn test_forget_path_releases_the_mapping(tmpdir: tempfile::TempDir) {
    let session = session(tmpdir.path(), &[], false);
    let ino = session.ino_for(Path::new("victim"));
    session.forget_path(Path::new("victim"));
    assert_eq!(session.rel_for(ino), None);
}
