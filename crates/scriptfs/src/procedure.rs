// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::AccessFlags;
use regex::Regex;

use crate::config::Persistent;
use crate::{exec, Error, Result};

#[cfg(test)]
#[path = "./procedure_test.rs"]
mod procedure_test;

/// A parsed shell-style command from a `-p` spec.
///
/// The argv is a template: when a `!` token is present its position is
/// remembered and a fresh argument list is synthesized for every call,
/// substituting the file being processed. A command without a `!`
/// token is a filter and receives the file on its standard input.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    path: PathBuf,
    argv: Vec<String>,
    file_slot: Option<usize>,
}

impl CommandSpec {
    fn from_tokens(tokens: Vec<String>) -> Option<Self> {
        let path = PathBuf::from(tokens.first()?);
        let file_slot = tokens.iter().skip(1).position(|t| t == "!").map(|i| i + 1);
        Some(Self {
            path,
            argv: tokens,
            file_slot,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this command reads the file from standard input instead
    /// of taking it as an argument.
    pub fn is_filter(&self) -> bool {
        self.file_slot.is_none()
    }

    /// Build the argument list for one invocation, substituting `file`
    /// at the placeholder position.
    pub fn expand(&self, file: Option<&OsStr>) -> Vec<OsString> {
        self.argv
            .iter()
            .enumerate()
            .map(|(i, arg)| match (self.file_slot, file) {
                (Some(slot), Some(file)) if slot == i => file.to_owned(),
                _ => OsString::from(arg),
            })
            .collect()
    }
}

/// What to run when a file has been classified as a script.
#[derive(Debug, Clone)]
pub enum Program {
    /// Launch the file itself, resolving its shebang line in-core.
    Auto,
    /// Invoke the file directly as a program image, without any
    /// shebang rewriting.
    SelfExec,
    /// Run an external command over the file.
    External(CommandSpec),
}

impl Program {
    /// Run this program over the classified file `rel`, capturing its
    /// standard output into `stdout`.
    ///
    /// External programs with a `!` placeholder receive a temporary
    /// copy of the file, never the virtual path, and the copy is
    /// removed once the child has exited.
    pub fn run(&self, persist: &Persistent, rel: &Path, stdout: &File) -> Result<i32> {
        match self {
            Program::Auto => exec::launch(&persist.mirror, &persist.env, rel, stdout),
            Program::SelfExec => {
                let argv = [rel.as_os_str().to_owned()];
                exec::execute(&persist.mirror, &persist.env, rel, &argv, Some(stdout), None)
            }
            Program::External(spec) => {
                let copy = match spec.is_filter() {
                    true => None,
                    false => Some(persist.temp.copy_of(&persist.mirror, rel)?),
                };
                let argv = spec.expand(copy.as_ref().map(|c| c.path().as_os_str()));
                let stdin = spec.is_filter().then_some(rel);
                exec::execute(
                    &persist.mirror,
                    &persist.env,
                    spec.path(),
                    &argv,
                    Some(stdout),
                    stdin,
                )
                // the temp copy is unlinked here, after the child exited
            }
        }
    }
}

/// The predicate deciding whether a file counts as a script.
#[derive(Debug, Clone)]
pub enum Test {
    Always,
    /// The caller has execute permission on the mirror file.
    Executable,
    /// The file starts with `#!` or is executable (the `auto` default).
    ShebangOrExecutable,
    /// The virtual path matches a pattern, anywhere in the string.
    Pattern(Regex),
    /// An external command decides; exit status zero means match.
    External(CommandSpec),
}

impl Test {
    /// Evaluate this test against a mirror-relative path.
    ///
    /// External tests receive the virtual path verbatim where their
    /// spec says `!`, in contrast to program invocations which receive
    /// a temp copy. Any failure to evaluate counts as a non-match.
    pub fn matches(&self, persist: &Persistent, rel: &Path) -> bool {
        match self {
            Test::Always => true,
            Test::Executable => persist.mirror.access(rel, AccessFlags::X_OK).is_ok(),
            Test::ShebangOrExecutable => {
                starts_with_shebang(persist, rel)
                    || persist.mirror.access(rel, AccessFlags::X_OK).is_ok()
            }
            Test::Pattern(regex) => regex.is_match(&rel.to_string_lossy()),
            Test::External(spec) => {
                let argv = spec.expand(Some(rel.as_os_str()));
                let stdin = spec.is_filter().then_some(rel);
                matches!(
                    exec::execute(&persist.mirror, &persist.env, spec.path(), &argv, None, stdin),
                    Ok(0)
                )
            }
        }
    }
}

fn starts_with_shebang(persist: &Persistent, rel: &Path) -> bool {
    let Ok(mut file) = persist.mirror.open(rel, OFlag::O_RDONLY, Mode::empty()) else {
        return false;
    };
    let mut magic = [0u8; 2];
    matches!(file.read(&mut magic), Ok(2) if &magic == b"#!")
}

/// One entry of the classification chain: a program to run and the
/// test that elects files for it.
#[derive(Debug, Clone)]
pub struct Procedure {
    pub program: Program,
    pub test: Test,
}

impl Default for Procedure {
    fn default() -> Self {
        Self {
            program: Program::Auto,
            test: Test::ShebangOrExecutable,
        }
    }
}

impl Procedure {
    /// Parse a `PROGRAM[;TEST]` spec as given to `-p`.
    ///
    /// When the test is omitted it is derived from the program:
    /// `auto` tests for a shebang or execute permission, `self` for
    /// execute permission, and an external command is reused verbatim
    /// as its own test.
    pub fn from_spec(spec: &str) -> Result<Self> {
        let (program_part, test_part) = match spec.split_once(';') {
            Some((program, test)) => (program, Some(test)),
            None => (spec, None),
        };
        let program = parse_program(spec, program_part)?;
        let test = match test_part {
            Some(test) => parse_test(spec, test)?,
            None => match &program {
                Program::Auto => Test::ShebangOrExecutable,
                Program::SelfExec => Test::Executable,
                Program::External(command) => Test::External(command.clone()),
            },
        };
        Ok(Self { program, test })
    }

    /// Run this procedure's program over `rel` and return the artifact
    /// holding its output, positioned for random-access reads.
    ///
    /// A program that could not be spawned or that terminated
    /// abnormally is not an open error: the reader simply sees
    /// whatever output was produced, possibly nothing, and the cause
    /// is reported on the server's log.
    pub fn materialize(&self, persist: &Persistent, rel: &Path) -> Result<File> {
        let artifact = persist.temp.artifact()?;
        match self.program.run(persist, rel, &artifact) {
            Ok(0) => (),
            Ok(code) => tracing::debug!(code, path = ?rel, "script exited nonzero"),
            Err(err) => tracing::warn!(?err, path = ?rel, "failed to run script"),
        }
        Ok(artifact)
    }

    /// Run the program once and measure the size of its output.
    pub fn output_size(&self, persist: &Persistent, rel: &Path) -> Result<u64> {
        let artifact = self.materialize(persist, rel)?;
        Ok(artifact.metadata()?.len())
    }
}

fn parse_program(spec: &str, part: &str) -> Result<Program> {
    match part.trim() {
        "auto" => Ok(Program::Auto),
        "self" => Ok(Program::SelfExec),
        _ => {
            let tokens = tokenize(spec, part)?;
            match CommandSpec::from_tokens(tokens) {
                Some(command) => Ok(Program::External(command)),
                None => Err(invalid(spec, "empty program")),
            }
        }
    }
}

fn parse_test(spec: &str, part: &str) -> Result<Test> {
    let trimmed = part.trim();
    match trimmed {
        "always" => Ok(Test::Always),
        "executable" => Ok(Test::Executable),
        _ => {
            if let Some(pattern) = trimmed.strip_prefix('&') {
                return Ok(Test::Pattern(Regex::new(pattern)?));
            }
            let tokens = tokenize(spec, part)?;
            match CommandSpec::from_tokens(tokens) {
                Some(command) => Ok(Test::External(command)),
                None => Err(invalid(spec, "empty test")),
            }
        }
    }
}

/// Split a command string on blanks, folding runs of space, tab and
/// newline and ignoring leading and trailing ones. Quoting follows the
/// shell: single quotes protect everything, double quotes and bare
/// backslashes protect the next character.
fn tokenize(spec: &str, s: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\n' => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => return Err(invalid(spec, "trailing backslash")),
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => return Err(invalid(spec, "unterminated single quote")),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => return Err(invalid(spec, "unterminated double quote")),
                        },
                        Some(inner) => current.push(inner),
                        None => return Err(invalid(spec, "unterminated double quote")),
                    }
                }
            }
            _ => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn invalid(spec: &str, reason: &str) -> Error {
    Error::InvalidSpec {
        spec: spec.to_string(),
        reason: reason.to_string(),
    }
}
