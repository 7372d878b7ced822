// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

use std::ffi::OsString;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use crate::mirror::Mirror;
use crate::Result;

#[cfg(test)]
#[path = "./exec_test.rs"]
mod exec_test;

/// The environment that spawned programs inherit, captured at mount time.
pub type Env = Vec<(OsString, OsString)>;

/// Spawn `program` with `argv` and wait for it to finish.
///
/// This is the single chokepoint that all script and test execution
/// flows through:
/// - `argv` is the complete argument list, `argv[0]` included
/// - when `stdout` is given the child's standard output is redirected
///   into it, otherwise it goes to this process' standard error so the
///   filesystem's own output stream stays clean
/// - when `stdin_source` names a mirror-relative file, its bytes are
///   streamed into the child's standard input; a source that cannot be
///   opened degrades to an empty standard input rather than failing
///
/// Returns the child's exit code, treating abnormal termination as a
/// nonzero status.
pub fn execute(
    mirror: &Mirror,
    env: &Env,
    program: &Path,
    argv: &[OsString],
    stdout: Option<&File>,
    stdin_source: Option<&Path>,
) -> Result<i32> {
    let resolved = resolve_program(mirror, program);
    tracing::trace!(program = ?resolved, ?argv, "execute");
    let mut cmd = Command::new(&resolved);
    if let Some((first, rest)) = argv.split_first() {
        cmd.arg0(first);
        cmd.args(rest);
    }
    cmd.env_clear();
    cmd.envs(env.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str())));
    match stdout {
        Some(file) => cmd.stdout(Stdio::from(file.try_clone()?)),
        None => cmd.stdout(Stdio::from(std::io::stderr().as_fd().try_clone_to_owned()?)),
    };
    let mut input = match stdin_source {
        Some(rel) => match mirror.open(rel, OFlag::O_RDONLY, Mode::empty()) {
            Ok(file) => Some(file),
            Err(err) => {
                tracing::debug!(?err, path = ?rel, "stdin source not readable, running without input");
                None
            }
        },
        None => None,
    };
    match input {
        Some(_) => cmd.stdin(Stdio::piped()),
        None => cmd.stdin(Stdio::null()),
    };
    let mut child = cmd.spawn()?;
    if let Some(source) = input.as_mut() {
        if let Some(mut sink) = child.stdin.take() {
            // the child may exit before consuming everything, which is
            // its own business and not an error for the filesystem
            let _ = std::io::copy(source, &mut sink);
        }
    }
    let status = child.wait()?;
    Ok(status.code().unwrap_or(1))
}

/// Launch a mirror file the way a shell would, resolving its `#!` line
/// in-core.
///
/// Interpreter resolution happens against the mirror root rather than
/// this process' environment, which is why the kernel's own shebang
/// handling cannot be used here. Files without a shebang are executed
/// directly as program images.
pub fn launch(mirror: &Mirror, env: &Env, rel: &Path, stdout: &File) -> Result<i32> {
    match read_shebang(mirror, rel)? {
        Some(interpreter) => {
            let argv = [
                interpreter.clone().into_os_string(),
                mirror.locate(rel).into_os_string(),
            ];
            execute(mirror, env, &interpreter, &argv, Some(stdout), None)
        }
        None => {
            let argv = [rel.as_os_str().to_owned()];
            execute(mirror, env, rel, &argv, Some(stdout), None)
        }
    }
}

/// Read the interpreter named on the first line of a mirror file, if any.
pub fn read_shebang(mirror: &Mirror, rel: &Path) -> Result<Option<PathBuf>> {
    let file = mirror.open(rel, OFlag::O_RDONLY, Mode::empty())?;
    let mut line = Vec::new();
    BufReader::new(file).read_until(b'\n', &mut line)?;
    Ok(parse_shebang(&line))
}

/// Extract the interpreter path from a `#!` line.
///
/// Whitespace after the `!` is skipped and the path runs to the first
/// unescaped blank; a backslash makes the following character literal,
/// so interpreters living under paths with spaces remain reachable.
fn parse_shebang(line: &[u8]) -> Option<PathBuf> {
    let rest = line.strip_prefix(b"#!")?;
    let mut bytes = rest
        .iter()
        .copied()
        .skip_while(|b| *b == b' ' || *b == b'\t');
    let mut path = Vec::new();
    while let Some(b) = bytes.next() {
        match b {
            b'\\' => match bytes.next() {
                Some(escaped) => path.push(escaped),
                None => break,
            },
            b' ' | b'\t' | b'\n' => break,
            _ => path.push(b),
        }
    }
    if path.is_empty() {
        return None;
    }
    Some(PathBuf::from(OsString::from_vec(path)))
}

/// Resolve a program path the way the mount resolves it: absolute paths
/// are taken as-is, relative ones prefer the mirror tree and fall back
/// to a normal `PATH` lookup for bare command names.
fn resolve_program(mirror: &Mirror, program: &Path) -> PathBuf {
    if program.is_absolute() {
        return program.to_path_buf();
    }
    let in_mirror = mirror.locate(program);
    if in_mirror.exists() {
        return in_mirror;
    }
    program.to_path_buf()
}
