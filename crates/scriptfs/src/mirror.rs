// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

use std::ffi::OsString;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::dir::Dir;
use nix::fcntl::{AtFlags, OFlag};
use nix::sys::stat::{FchmodatFlags, FileStat, Mode, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{AccessFlags, LinkatFlags, UnlinkatFlags};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./mirror_test.rs"]
mod mirror_test;

/// One entry of a mirror directory, captured while enumerating it.
pub struct DirEntry {
    pub name: OsString,
    pub kind: Option<nix::dir::Type>,
}

/// The real directory that backs the mounted filesystem.
///
/// All pass-through operations resolve against a long-lived descriptor
/// of this directory using the *-at family of system calls, so the
/// mirror remains reachable even if its path is mounted over.
pub struct Mirror {
    root: PathBuf,
    dir: File,
}

impl Mirror {
    /// Canonicalize and open the mirror directory.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().canonicalize().map_err(|err| {
            Error::wrap_io(err, format!("invalid mirror folder {:?}", root.as_ref()))
        })?;
        let dir = File::open(&root)
            .map_err(|err| Error::wrap_io(err, format!("can't open mirror folder {root:?}")))?;
        Ok(Self { root, dir })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn raw(&self) -> RawFd {
        self.dir.as_raw_fd()
    }

    /// The location of a mirror-relative file on the real filesystem.
    pub fn locate<P: AsRef<Path>>(&self, rel: P) -> PathBuf {
        self.root.join(rel)
    }

    pub fn open(&self, rel: &Path, oflag: OFlag, mode: Mode) -> Result<File> {
        let fd = nix::fcntl::openat(self.raw(), rel, oflag, mode)?;
        // Safety: openat returned a fresh descriptor that we now own
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    /// lstat the given entry, leaving symlinks unfollowed.
    pub fn stat(&self, rel: &Path) -> Result<FileStat> {
        Ok(nix::sys::stat::fstatat(
            self.raw(),
            rel,
            AtFlags::AT_SYMLINK_NOFOLLOW,
        )?)
    }

    /// stat the given entry, following symlinks.
    pub fn stat_follow(&self, rel: &Path) -> Result<FileStat> {
        Ok(nix::sys::stat::fstatat(self.raw(), rel, AtFlags::empty())?)
    }

    pub fn access(&self, rel: &Path, amode: AccessFlags) -> Result<()> {
        Ok(nix::unistd::faccessat(
            Some(self.raw()),
            rel,
            amode,
            AtFlags::empty(),
        )?)
    }

    pub fn readlink(&self, rel: &Path) -> Result<OsString> {
        Ok(nix::fcntl::readlinkat(self.raw(), rel)?)
    }

    /// Enumerate a mirror directory in the order the OS reports it,
    /// including the `.` and `..` entries.
    pub fn read_dir(&self, rel: &Path) -> Result<Vec<DirEntry>> {
        let mut dir = Dir::openat(
            self.raw(),
            rel,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY,
            Mode::empty(),
        )?;
        let mut entries = Vec::new();
        for entry in dir.iter() {
            let entry = entry?;
            entries.push(DirEntry {
                name: OsString::from(std::ffi::OsStr::from_bytes(entry.file_name().to_bytes())),
                kind: entry.file_type(),
            });
        }
        Ok(entries)
    }

    pub fn mkdir(&self, rel: &Path, mode: Mode) -> Result<()> {
        Ok(nix::sys::stat::mkdirat(self.raw(), rel, mode)?)
    }

    pub fn rmdir(&self, rel: &Path) -> Result<()> {
        Ok(nix::unistd::unlinkat(
            Some(self.raw()),
            rel,
            UnlinkatFlags::RemoveDir,
        )?)
    }

    pub fn unlink(&self, rel: &Path) -> Result<()> {
        Ok(nix::unistd::unlinkat(
            Some(self.raw()),
            rel,
            UnlinkatFlags::NoRemoveDir,
        )?)
    }

    pub fn symlink(&self, target: &Path, rel: &Path) -> Result<()> {
        Ok(nix::unistd::symlinkat(target, Some(self.raw()), rel)?)
    }

    pub fn link(&self, rel_from: &Path, rel_to: &Path) -> Result<()> {
        Ok(nix::unistd::linkat(
            Some(self.raw()),
            rel_from,
            Some(self.raw()),
            rel_to,
            LinkatFlags::NoSymlinkFollow,
        )?)
    }

    pub fn rename(&self, rel_from: &Path, rel_to: &Path, flags: nix::fcntl::RenameFlags) -> Result<()> {
        Ok(nix::fcntl::renameat2(
            Some(self.raw()),
            rel_from,
            Some(self.raw()),
            rel_to,
            flags,
        )?)
    }

    pub fn chmod(&self, rel: &Path, mode: Mode) -> Result<()> {
        Ok(nix::sys::stat::fchmodat(
            Some(self.raw()),
            rel,
            mode,
            FchmodatFlags::FollowSymlink,
        )?)
    }

    pub fn utimens(&self, rel: &Path, atime: &TimeSpec, mtime: &TimeSpec) -> Result<()> {
        Ok(nix::sys::stat::utimensat(
            Some(self.raw()),
            rel,
            atime,
            mtime,
            UtimensatFlags::FollowSymlink,
        )?)
    }
}
