// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

use std::fs::{File, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tempfile::NamedTempFile;

use crate::mirror::Mirror;
use crate::Result;

#[cfg(test)]
#[path = "./artifact_test.rs"]
mod artifact_test;

const TEMP_PREFIX: &str = "sfs.";
const TEMP_RAND_LEN: usize = 6;

/// The RAM-backed scratch area where script output and temp copies live.
///
/// Probed once at startup and never changed afterwards.
#[derive(Debug, Clone)]
pub struct TempSpace {
    dir: PathBuf,
}

impl TempSpace {
    /// Choose the backing directory, preferring `/dev/shm` when it
    /// exists and is a directory, falling back to `/tmp`.
    pub fn probe() -> Self {
        let shm = Path::new("/dev/shm");
        let dir = match shm.metadata() {
            Ok(meta) if meta.is_dir() => shm.to_path_buf(),
            _ => PathBuf::from("/tmp"),
        };
        tracing::debug!("using {dir:?} for temporary files");
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocate an anonymous file to capture one script's output.
    ///
    /// The file has no name from the moment it is returned, so its
    /// storage is reclaimed as soon as the descriptor is closed. One
    /// artifact serves exactly one open (or one eager size probe).
    pub fn artifact(&self) -> Result<File> {
        Ok(tempfile::tempfile_in(&self.dir)?)
    }

    /// Materialize a private copy of a mirror file.
    ///
    /// The copy keeps only the owner read and execute bits of the
    /// original, and is deleted when the returned handle is dropped.
    pub fn copy_of(&self, mirror: &Mirror, rel: &Path) -> Result<NamedTempFile> {
        let mut source = mirror.open(rel, OFlag::O_RDONLY, Mode::empty())?;
        let mut copy = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .rand_bytes(TEMP_RAND_LEN)
            .tempfile_in(&self.dir)?;
        std::io::copy(&mut source, copy.as_file_mut())?;
        match source.metadata() {
            Ok(meta) => {
                let mode = meta.permissions().mode() & (libc::S_IRUSR | libc::S_IXUSR);
                copy.as_file().set_permissions(Permissions::from_mode(mode))?;
            }
            Err(err) => {
                tracing::warn!(?err, path = ?rel, "cannot stat mode for temp copy");
            }
        }
        Ok(copy)
    }
}
