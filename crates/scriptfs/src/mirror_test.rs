// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

use std::io::{Read, Write};
use std::path::Path;

use nix::fcntl::{OFlag, RenameFlags};
use nix::sys::stat::Mode;
use rstest::{fixture, rstest};

use super::Mirror;

#[fixture]
fn tmpdir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("scriptfs-test-")
        .tempdir()
        .expect("failed to create dir for test")
}

#[rstest]
fn test_open_and_stat(tmpdir: tempfile::TempDir) {
    std::fs::write(tmpdir.path().join("data"), b"payload").unwrap();
    let mirror = Mirror::new(tmpdir.path()).unwrap();

    let st = mirror.stat(Path::new("data")).unwrap();
    assert_eq!(st.st_size, 7);

    let mut file = mirror
        .open(Path::new("data"), OFlag::O_RDONLY, Mode::empty())
        .unwrap();
    let mut content = String::new();
    file.read_to_string(&mut content).unwrap();
    assert_eq!(content, "payload");

    assert!(mirror.stat(Path::new("missing")).is_err());
}

#[rstest]
fn test_mkdir_rename_unlink(tmpdir: tempfile::TempDir) {
    let mirror = Mirror::new(tmpdir.path()).unwrap();
    mirror
        .mkdir(Path::new("sub"), Mode::from_bits_truncate(0o755))
        .unwrap();
    let mut file = mirror
        .open(
            Path::new("sub/note"),
            OFlag::O_CREAT | OFlag::O_WRONLY,
            Mode::from_bits_truncate(0o644),
        )
        .unwrap();
    file.write_all(b"x").unwrap();
    drop(file);

    mirror
        .rename(Path::new("sub/note"), Path::new("note"), RenameFlags::empty())
        .unwrap();
    assert!(tmpdir.path().join("note").exists());
    assert!(!tmpdir.path().join("sub/note").exists());

    mirror.unlink(Path::new("note")).unwrap();
    mirror.rmdir(Path::new("sub")).unwrap();
    assert!(!tmpdir.path().join("note").exists());
    assert!(!tmpdir.path().join("sub").exists());
}

#[rstest]
fn test_read_dir_lists_mirror_entries(tmpdir: tempfile::TempDir) {
    std::fs::write(tmpdir.path().join("one"), b"1").unwrap();
    std::fs::write(tmpdir.path().join("two"), b"2").unwrap();
    let mirror = Mirror::new(tmpdir.path()).unwrap();

    let entries = mirror.read_dir(Path::new(".")).unwrap();
    let mut names: Vec<_> = entries
        .iter()
        .map(|e| e.name.to_string_lossy().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec![".", "..", "one", "two"]);
}

#[rstest]
fn test_symlink_and_readlink(tmpdir: tempfile::TempDir) {
    let mirror = Mirror::new(tmpdir.path()).unwrap();
    mirror
        .symlink(Path::new("somewhere/else"), Path::new("pointer"))
        .unwrap();
    let target = mirror.readlink(Path::new("pointer")).unwrap();
    assert_eq!(target, "somewhere/else");
}
