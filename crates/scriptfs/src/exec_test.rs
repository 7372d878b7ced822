// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

use std::ffi::OsString;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use rstest::{fixture, rstest};

use super::{execute, launch, parse_shebang, read_shebang, Env};
use crate::mirror::Mirror;
use crate::TempSpace;

#[fixture]
fn tmpdir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("scriptfs-test-")
        .tempdir()
        .expect("failed to create dir for test")
}

fn env() -> Env {
    std::env::vars_os().collect()
}

fn argv(args: &[&str]) -> Vec<OsString> {
    args.iter().map(|a| OsString::from(*a)).collect()
}

fn read_back(artifact: &mut std::fs::File) -> String {
    use std::io::Seek;
    artifact.rewind().unwrap();
    let mut out = String::new();
    artifact.read_to_string(&mut out).unwrap();
    out
}

fn write_script(dir: &Path, name: &str, content: &str) {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[rstest]
#[case(b"#!/bin/sh\n", Some("/bin/sh"))]
#[case(b"#! \t/usr/bin/env\n", Some("/usr/bin/env"))]
#[case(b"#!/opt/my\\ tools/run extra args\n", Some("/opt/my tools/run"))]
#[case(b"#!interp arg\n", Some("interp"))]
#[case(b"#!\n", None)]
#[case(b"#!   \n", None)]
#[case(b"echo hello\n", None)]
#[case(b"", None)]
fn test_parse_shebang(#[case] line: &[u8], #[case] expected: Option<&str>) {
    assert_eq!(parse_shebang(line), expected.map(PathBuf::from));
}

#[rstest]
fn test_read_shebang_from_mirror(tmpdir: tempfile::TempDir) {
    write_script(tmpdir.path(), "hello_script", "#!/bin/bash\n\necho Hi\n");
    std::fs::write(tmpdir.path().join("hello_text"), "A\nB\n").unwrap();
    let mirror = Mirror::new(tmpdir.path()).unwrap();

    assert_eq!(
        read_shebang(&mirror, Path::new("hello_script")).unwrap(),
        Some(PathBuf::from("/bin/bash"))
    );
    assert_eq!(read_shebang(&mirror, Path::new("hello_text")).unwrap(), None);
}

#[rstest]
fn test_execute_captures_stdout(tmpdir: tempfile::TempDir) {
    let mirror = Mirror::new(tmpdir.path()).unwrap();
    let mut artifact = TempSpace::probe().artifact().unwrap();

    let argv = argv(&["sh", "-c", "echo hi"]);
    let code = execute(
        &mirror,
        &env(),
        Path::new("/bin/sh"),
        &argv,
        Some(&artifact),
        None,
    )
    .unwrap();
    assert_eq!(code, 0);
    assert_eq!(read_back(&mut artifact), "hi\n");
}

#[rstest]
fn test_execute_reports_exit_code(tmpdir: tempfile::TempDir) {
    let mirror = Mirror::new(tmpdir.path()).unwrap();
    let argv = argv(&["sh", "-c", "exit 3"]);
    let code = execute(&mirror, &env(), Path::new("/bin/sh"), &argv, None, None).unwrap();
    assert_eq!(code, 3);
}

#[rstest]
fn test_execute_streams_stdin_source(tmpdir: tempfile::TempDir) {
    std::fs::write(tmpdir.path().join("hello_text"), "A\nB\n").unwrap();
    let mirror = Mirror::new(tmpdir.path()).unwrap();
    let mut artifact = TempSpace::probe().artifact().unwrap();

    let argv = argv(&["cat"]);
    let code = execute(
        &mirror,
        &env(),
        Path::new("/bin/cat"),
        &argv,
        Some(&artifact),
        Some(Path::new("hello_text")),
    )
    .unwrap();
    assert_eq!(code, 0);
    assert_eq!(read_back(&mut artifact), "A\nB\n");
}

#[rstest]
fn test_execute_degrades_on_missing_stdin_source(tmpdir: tempfile::TempDir) {
    let mirror = Mirror::new(tmpdir.path()).unwrap();
    let mut artifact = TempSpace::probe().artifact().unwrap();

    let argv = argv(&["cat"]);
    let code = execute(
        &mirror,
        &env(),
        Path::new("/bin/cat"),
        &argv,
        Some(&artifact),
        Some(Path::new("no_such_file")),
    )
    .unwrap();
    assert_eq!(code, 0);
    assert_eq!(read_back(&mut artifact), "");
}

#[rstest]
fn test_execute_resolves_programs_in_the_mirror(tmpdir: tempfile::TempDir) {
    write_script(tmpdir.path(), "gen.sh", "#!/bin/sh\necho from-mirror\n");
    let mirror = Mirror::new(tmpdir.path()).unwrap();
    let mut artifact = TempSpace::probe().artifact().unwrap();

    let argv = argv(&["gen.sh"]);
    let code = execute(
        &mirror,
        &env(),
        Path::new("gen.sh"),
        &argv,
        Some(&artifact),
        None,
    )
    .unwrap();
    assert_eq!(code, 0);
    assert_eq!(read_back(&mut artifact), "from-mirror\n");
}

#[rstest]
fn test_launch_resolves_shebang(tmpdir: tempfile::TempDir) {
    write_script(tmpdir.path(), "hello_script", "#!/bin/bash\n\necho Hi\n");
    let mirror = Mirror::new(tmpdir.path()).unwrap();
    let mut artifact = TempSpace::probe().artifact().unwrap();

    let code = launch(&mirror, &env(), Path::new("hello_script"), &artifact).unwrap();
    assert_eq!(code, 0);
    assert_eq!(read_back(&mut artifact), "Hi\n");
}

#[rstest]
fn test_launch_passes_the_mirror_path_to_the_interpreter(tmpdir: tempfile::TempDir) {
    // a script whose interpreter just echoes its argument back
    write_script(tmpdir.path(), "show_me", "#!/bin/echo\n");
    let mirror = Mirror::new(tmpdir.path()).unwrap();
    let mut artifact = TempSpace::probe().artifact().unwrap();

    let code = launch(&mirror, &env(), Path::new("show_me"), &artifact).unwrap();
    assert_eq!(code, 0);
    let out = read_back(&mut artifact);
    assert_eq!(out.trim_end(), mirror.locate("show_me").to_string_lossy());
}
