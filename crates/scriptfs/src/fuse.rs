// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

use std::ffi::OsStr;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::prelude::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fuser::consts::FOPEN_DIRECT_IO;
use fuser::{
    FileAttr,
    FileType,
    KernelConfig,
    ReplyAttr,
    ReplyCreate,
    ReplyData,
    ReplyDirectory,
    ReplyEmpty,
    ReplyEntry,
    ReplyLseek,
    ReplyOpen,
    ReplyStatfs,
    ReplyWrite,
    Request,
    TimeOrNow,
};
use nix::fcntl::{OFlag, RenameFlags};
use nix::sys::stat::{FileStat, Mode};
use nix::sys::time::TimeSpec;
use nix::unistd::AccessFlags;

use crate::config::{Config, Persistent};
use crate::mirror::DirEntry;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./fuse_test.rs"]
mod fuse_test;

const ROOT_INO: u64 = 1;

/// Extract the ok value from a result, or reply with an error to FUSE
macro_rules! unwrap {
    ($reply:ident, $op:expr) => {{
        match $op {
            Ok(r) => r,
            Err(err) => err!($reply, err),
        }
    }};
}

/// Reply with an error to FUSE and return
macro_rules! err {
    ($reply:ident, $err:expr) => {{
        let err: Error = $err;
        tracing::debug!("{err}");
        let errno = err.raw_os_error().unwrap_or(libc::EIO);
        $reply.error(errno);
        return;
    }};
}

/// The per-open state carried between an open call and its release.
enum Handle {
    /// An open directory, enumerated when it was opened.
    Dir { rel: PathBuf, entries: Vec<DirEntry> },
    /// A pass-through file backed by a descriptor on the mirror.
    Regular { rel: PathBuf, file: File },
    /// A script whose output was captured into an anonymous artifact;
    /// reads are served from the artifact for the life of this open.
    Script { rel: PathBuf, file: File },
}

impl Handle {
    fn rel(&self) -> &Path {
        match self {
            Self::Dir { rel, .. } => rel,
            Self::Regular { rel, .. } => rel,
            Self::Script { rel, .. } => rel,
        }
    }
}

/// A mounted scriptfs filesystem session.
///
/// This implements [`fuser::Filesystem`], classifying every file
/// against the configured procedures and either passing operations
/// through to the mirror or serving materialized script output.
pub struct Session {
    persist: Persistent,
    ttl: Duration,
    next_inode: AtomicU64,
    next_handle: AtomicU64,
    paths: DashMap<u64, PathBuf>,
    inodes: DashMap<PathBuf, u64>,
    handles: DashMap<u64, Handle>,
}

impl Session {
    /// Construct a session serving the mirror described by `config`.
    pub fn new(config: Config) -> Result<Self> {
        let session = Self {
            persist: Persistent::from_config(config)?,
            ttl: Duration::from_secs(1),
            // the root inode must be 1, and is allocated up front
            next_inode: AtomicU64::new(ROOT_INO + 1),
            // we do not allocate handle 0, so skip it for now
            next_handle: AtomicU64::new(1),
            paths: Default::default(),
            inodes: Default::default(),
            handles: Default::default(),
        };
        session.paths.insert(ROOT_INO, PathBuf::from("."));
        session.inodes.insert(PathBuf::from("."), ROOT_INO);
        Ok(session)
    }

    fn rel_for(&self, ino: u64) -> Option<PathBuf> {
        self.paths.get(&ino).map(|rel| rel.clone())
    }

    fn ino_for(&self, rel: &Path) -> u64 {
        let ino = *self
            .inodes
            .entry(rel.to_path_buf())
            .or_insert_with(|| self.next_inode.fetch_add(1, Ordering::Relaxed));
        self.paths.insert(ino, rel.to_path_buf());
        ino
    }

    fn child_rel(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.rel_for(parent).map(|rel| join_child(&rel, name))
    }

    fn forget_path(&self, rel: &Path) {
        if let Some((_, ino)) = self.inodes.remove(rel) {
            self.paths.remove(&ino);
        }
    }

    /// Rewrite the remembered paths of an entry and everything below it.
    fn move_tree(&self, from: &Path, to: &Path) {
        let moved: Vec<(PathBuf, u64)> = self
            .inodes
            .iter()
            .filter(|kv| kv.key().starts_with(from))
            .map(|kv| (kv.key().clone(), *kv.value()))
            .collect();
        for (old, ino) in moved {
            let Ok(suffix) = old.strip_prefix(from) else {
                continue;
            };
            let new = match suffix.as_os_str().is_empty() {
                true => to.to_path_buf(),
                false => to.join(suffix),
            };
            self.inodes.remove(&old);
            self.inodes.insert(new.clone(), ino);
            self.paths.insert(ino, new);
        }
    }

    fn allocate_handle(&self, data: Handle) -> u64 {
        loop {
            let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                // the 'empty/zero' handle value is never allocated so
                // that a missing handle can be told apart from a real one
                continue;
            }
            match self.handles.entry(id) {
                // continue until we find a vacant entry for this handle
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(data);
                    break id;
                }
            }
        }
    }

    /// The attributes of a mirror entry as the mount advertises them.
    ///
    /// Classified regular files lose their write bits, and under eager
    /// size reporting their size becomes the measured length of the
    /// script's output. A failing measurement falls back to the source
    /// size rather than failing the whole stat.
    fn attr_at(&self, ino: u64, rel: &Path) -> Result<FileAttr> {
        let mut st = self.persist.mirror.stat(rel)?;
        if st.st_mode & libc::S_IFMT == libc::S_IFREG {
            if let Some(procedure) = self.persist.classify(rel) {
                st.st_mode &= !(libc::S_IWUSR | libc::S_IWGRP | libc::S_IWOTH);
                if self.persist.eager_size {
                    match procedure.output_size(&self.persist, rel) {
                        Ok(size) => st.st_size = size as libc::off_t,
                        Err(err) => {
                            tracing::debug!(?err, path = ?rel, "size probe failed, reporting source size");
                        }
                    }
                }
            }
        }
        Ok(attr_from_stat(ino, &st))
    }

    /// Whether writing to this path must be refused because it is a
    /// classified script.
    fn protects(&self, rel: &Path) -> bool {
        match self.persist.mirror.stat_follow(rel) {
            Ok(st) => {
                st.st_mode & libc::S_IFMT == libc::S_IFREG && self.persist.classify(rel).is_some()
            }
            Err(_) => false,
        }
    }
}

fn join_child(rel: &Path, name: &OsStr) -> PathBuf {
    match rel == Path::new(".") {
        true => PathBuf::from(name),
        false => rel.join(name),
    }
}

fn filetype_of(kind: Option<nix::dir::Type>) -> FileType {
    match kind {
        Some(nix::dir::Type::Directory) => FileType::Directory,
        Some(nix::dir::Type::Symlink) => FileType::Symlink,
        Some(nix::dir::Type::Fifo) => FileType::NamedPipe,
        Some(nix::dir::Type::Socket) => FileType::Socket,
        Some(nix::dir::Type::CharacterDevice) => FileType::CharDevice,
        Some(nix::dir::Type::BlockDevice) => FileType::BlockDevice,
        Some(nix::dir::Type::File) | None => FileType::RegularFile,
    }
}

fn kind_from_mode(mode: libc::mode_t) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        _ => FileType::RegularFile,
    }
}

fn systime(sec: i64, nsec: i64) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(sec.unsigned_abs())
    }
}

fn attr_from_stat(ino: u64, st: &FileStat) -> FileAttr {
    FileAttr {
        ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: systime(st.st_atime, st.st_atime_nsec),
        mtime: systime(st.st_mtime, st.st_mtime_nsec),
        ctime: systime(st.st_ctime, st.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind: kind_from_mode(st.st_mode),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

fn timespec_of(t: Option<TimeOrNow>) -> TimeSpec {
    let ts = match t {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(TimeOrNow::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(TimeOrNow::SpecificTime(at)) => {
            let since_epoch = at.duration_since(UNIX_EPOCH).unwrap_or_default();
            libc::timespec {
                tv_sec: since_epoch.as_secs() as libc::time_t,
                tv_nsec: since_epoch.subsec_nanos() as libc::c_long,
            }
        }
    };
    TimeSpec::from(ts)
}

// these functions mirror the actual fuse ones and
// so we don't have much control over the shape
#[allow(clippy::too_many_arguments)]
impl fuser::Filesystem for Session {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), libc::c_int> {
        tracing::info!(mirror = ?self.persist.mirror.root(), "filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("filesystem shutting down");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(rel) = self.child_rel(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let ino = self.ino_for(&rel);
        let attr = unwrap!(reply, self.attr_at(ino, &rel));
        reply.entry(&self.ttl, &attr, 0);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(rel) = self.rel_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let attr = unwrap!(reply, self.attr_at(ino, &rel));
        reply.attr(&self.ttl, &attr);
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(rel) = self.rel_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if uid.is_some() || gid.is_some() {
            reply.error(libc::ENOSYS);
            return;
        }
        let adds_write_bits = mode.map(|m| m & 0o222 != 0).unwrap_or(false);
        let touches_times = atime.is_some() || mtime.is_some();
        if (adds_write_bits || size.is_some() || touches_times) && self.protects(&rel) {
            tracing::debug!(path = ?rel, "refusing to modify a script");
            reply.error(libc::EACCES);
            return;
        }
        if let Some(mode) = mode {
            unwrap!(
                reply,
                self.persist
                    .mirror
                    .chmod(&rel, Mode::from_bits_truncate(mode as libc::mode_t))
            );
        }
        if let Some(size) = size {
            let file = unwrap!(
                reply,
                self.persist.mirror.open(&rel, OFlag::O_WRONLY, Mode::empty())
            );
            unwrap!(reply, file.set_len(size).map_err(Error::from));
        }
        if touches_times {
            unwrap!(
                reply,
                self.persist
                    .mirror
                    .utimens(&rel, &timespec_of(atime), &timespec_of(mtime))
            );
        }
        let attr = unwrap!(reply, self.attr_at(ino, &rel));
        reply.attr(&self.ttl, &attr);
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(rel) = self.rel_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        unwrap!(
            reply,
            self.persist
                .mirror
                .access(&rel, AccessFlags::from_bits_truncate(mask))
        );
        if mask & libc::W_OK != 0 && self.protects(&rel) {
            reply.error(libc::EACCES);
            return;
        }
        reply.ok();
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(rel) = self.rel_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let target = unwrap!(reply, self.persist.mirror.readlink(&rel));
        reply.data(target.as_bytes());
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(rel) = self.child_rel(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mode = Mode::from_bits_truncate((mode & !umask) as libc::mode_t);
        unwrap!(reply, self.persist.mirror.mkdir(&rel, mode));
        let ino = self.ino_for(&rel);
        let attr = unwrap!(reply, self.attr_at(ino, &rel));
        reply.entry(&self.ttl, &attr, 0);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(rel) = self.child_rel(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        unwrap!(reply, self.persist.mirror.rmdir(&rel));
        self.forget_path(&rel);
        reply.ok();
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(rel) = self.child_rel(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        unwrap!(reply, self.persist.mirror.unlink(&rel));
        self.forget_path(&rel);
        reply.ok();
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(rel) = self.child_rel(parent, link_name) else {
            reply.error(libc::ENOENT);
            return;
        };
        unwrap!(reply, self.persist.mirror.symlink(target, &rel));
        let ino = self.ino_for(&rel);
        let attr = unwrap!(reply, self.attr_at(ino, &rel));
        reply.entry(&self.ttl, &attr, 0);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let Some(rel) = self.rel_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(new_rel) = self.child_rel(newparent, newname) else {
            reply.error(libc::ENOENT);
            return;
        };
        unwrap!(reply, self.persist.mirror.link(&rel, &new_rel));
        let new_ino = self.ino_for(&new_rel);
        let attr = unwrap!(reply, self.attr_at(new_ino, &new_rel));
        reply.entry(&self.ttl, &attr, 0);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let Some(rel_from) = self.child_rel(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(rel_to) = self.child_rel(newparent, newname) else {
            reply.error(libc::ENOENT);
            return;
        };
        let flags = RenameFlags::from_bits_truncate(flags);
        unwrap!(reply, self.persist.mirror.rename(&rel_from, &rel_to, flags));
        self.move_tree(&rel_from, &rel_to);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        // the mount lives on whatever filesystem hosts the mirror, so
        // report the numbers of the host root like the mirror would
        let st = unwrap!(reply, nix::sys::statvfs::statvfs("/").map_err(Error::from));
        reply.statfs(
            st.blocks() as u64,
            st.blocks_free() as u64,
            st.blocks_available() as u64,
            st.files() as u64,
            st.files_free() as u64,
            st.block_size() as u32,
            st.name_max() as u32,
            st.fragment_size() as u32,
        );
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(rel) = self.rel_for(ino) else {
            tracing::debug!("open {ino} = ENOENT");
            reply.error(libc::ENOENT);
            return;
        };
        match self.persist.classify(&rel) {
            Some(procedure) => {
                if flags & (libc::O_WRONLY | libc::O_RDWR) != 0 {
                    tracing::debug!(path = ?rel, "open for write on a script = EACCES");
                    reply.error(libc::EACCES);
                    return;
                }
                let file = unwrap!(reply, procedure.materialize(&self.persist, &rel));
                let fh = self.allocate_handle(Handle::Script { rel, file });
                tracing::trace!("open {ino} = {fh} [script]");
                // the advertised size may be smaller than the artifact,
                // so the kernel must not clamp reads to it
                reply.opened(fh, FOPEN_DIRECT_IO);
            }
            None => {
                let oflag = OFlag::from_bits_truncate(flags);
                let file = unwrap!(reply, self.persist.mirror.open(&rel, oflag, Mode::empty()));
                let fh = self.allocate_handle(Handle::Regular { rel, file });
                tracing::trace!("open {ino} = {fh}");
                reply.opened(fh, 0);
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.handles.get(&fh) else {
            tracing::debug!("read {fh} = EBADF");
            reply.error(libc::EBADF);
            return;
        };
        let file = match handle.value() {
            Handle::Dir { .. } => {
                reply.error(libc::EISDIR);
                return;
            }
            Handle::Regular { file, .. } | Handle::Script { file, .. } => file,
        };
        let mut buf = vec![0; size as usize];
        let mut consumed = 0;
        while consumed < size as usize {
            let count = unwrap!(
                reply,
                file.read_at(&mut buf[consumed..], offset as u64 + consumed as u64)
                    .map_err(Error::from)
            );
            if count == 0 {
                // the end of the file has been reached
                break;
            }
            consumed += count;
        }
        tracing::trace!("read {fh} = {consumed}/{size}");
        reply.data(&buf[..consumed]);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(handle) = self.handles.get(&fh) else {
            tracing::debug!("write {fh} = EBADF");
            reply.error(libc::EBADF);
            return;
        };
        let file = match handle.value() {
            Handle::Dir { .. } => {
                reply.error(libc::EISDIR);
                return;
            }
            Handle::Script { .. } => {
                // script handles are only ever opened for reading
                reply.error(libc::EBADF);
                return;
            }
            Handle::Regular { file, .. } => file,
        };
        let mut written = 0;
        while written < data.len() {
            let count = unwrap!(
                reply,
                file.write_at(&data[written..], offset as u64 + written as u64)
                    .map_err(Error::from)
            );
            written += count;
        }
        reply.written(written as u32);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(handle) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match handle.value() {
            Handle::Dir { .. } => reply.error(libc::EISDIR),
            // nothing of a script ever needs to reach the disk
            Handle::Script { .. } => reply.ok(),
            Handle::Regular { file, .. } => {
                unwrap!(reply, file.sync_all().map_err(Error::from));
                reply.ok();
            }
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let Some(handle) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let file = match handle.value() {
            Handle::Dir { .. } => {
                reply.error(libc::EISDIR);
                return;
            }
            Handle::Regular { file, .. } | Handle::Script { file, .. } => file,
        };
        let synced = match datasync {
            true => file.sync_data(),
            false => file.sync_all(),
        };
        unwrap!(reply, synced.map_err(Error::from));
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some((_, handle)) = self.handles.remove(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        if let Handle::Dir { .. } = handle {
            reply.error(libc::EISDIR);
            return;
        }
        // dropping the handle closes the descriptor; a script artifact
        // was never linked anywhere so its storage is gone with it
        tracing::trace!(path = ?handle.rel(), "release {fh}");
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(rel) = self.child_rel(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let oflag = OFlag::from_bits_truncate(flags) | OFlag::O_CREAT;
        let mode = Mode::from_bits_truncate((mode & !umask) as libc::mode_t);
        let file = unwrap!(reply, self.persist.mirror.open(&rel, oflag, mode));
        let ino = self.ino_for(&rel);
        let attr = unwrap!(reply, self.attr_at(ino, &rel));
        let fh = self.allocate_handle(Handle::Regular { rel, file });
        reply.created(&self.ttl, &attr, 0, fh, 0);
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(rel) = self.rel_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let entries = unwrap!(reply, self.persist.mirror.read_dir(&rel));
        let fh = self.allocate_handle(Handle::Dir { rel, entries });
        tracing::trace!("opendir {ino} = {fh}");
        reply.opened(fh, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(handle) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let Handle::Dir { rel, entries } = handle.value() else {
            reply.error(libc::ENOTDIR);
            return;
        };
        let parent_ino = rel
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| self.ino_for(p))
            .unwrap_or(ROOT_INO);
        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            let child_ino = match entry.name.as_bytes() {
                b"." => ino,
                b".." => parent_ino,
                _ => self.ino_for(&join_child(rel, &entry.name)),
            };
            let buffer_full = reply.add(
                child_ino,
                (i + 1) as i64,
                filetype_of(entry.kind),
                &entry.name,
            );
            if buffer_full {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        let Some((_, handle)) = self.handles.remove(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        if !matches!(handle, Handle::Dir { .. }) {
            reply.error(libc::ENOTDIR);
            return;
        }
        reply.ok();
    }

    fn lseek(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        let Some(mut handle) = self.handles.get_mut(&fh) else {
            tracing::debug!("lseek {fh} = EBADF");
            reply.error(libc::EBADF);
            return;
        };
        let file = match handle.value_mut() {
            Handle::Dir { .. } => {
                reply.error(libc::EISDIR);
                return;
            }
            Handle::Regular { file, .. } | Handle::Script { file, .. } => file,
        };
        let pos = match whence {
            libc::SEEK_CUR => SeekFrom::Current(offset),
            libc::SEEK_END => SeekFrom::End(offset),
            libc::SEEK_SET => SeekFrom::Start(offset as u64),

            // From linux man pages: In the simplest implementation, a
            // filesystem can support the operations by making SEEK_HOLE
            // always return the offset of the end of the file, and
            // making SEEK_DATA always return offset
            libc::SEEK_HOLE => SeekFrom::End(0),
            libc::SEEK_DATA => SeekFrom::Start(offset as u64),

            _ => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        let new_offset = unwrap!(reply, file.seek(pos).map_err(Error::from));
        reply.offset(new_offset as i64);
    }
}
