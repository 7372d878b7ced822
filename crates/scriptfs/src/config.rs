// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use fuser::MountOption;

use crate::artifact::TempSpace;
use crate::exec::Env;
use crate::mirror::Mirror;
use crate::procedure::Procedure;
use crate::Result;

/// Options to configure the filesystem and its behavior at runtime
#[derive(Debug, Clone)]
pub struct Config {
    /// The real directory whose contents the mount surfaces
    pub mirror: PathBuf,
    /// Classification chain, evaluated in order with first match winning.
    ///
    /// An empty list is equivalent to a single `auto` procedure.
    pub procedures: Vec<Procedure>,
    /// Report the true output length of scripts from stat, by running
    /// them, instead of the size of their source
    pub eager_size: bool,
    /// Mount options to be used when setting up
    pub mount_options: HashSet<MountOption>,
}

impl Config {
    pub fn new<P: AsRef<Path>>(mirror: P) -> Self {
        Self {
            mirror: mirror.as_ref().to_path_buf(),
            procedures: Vec::new(),
            eager_size: false,
            mount_options: HashSet::new(),
        }
    }
}

/// The process-wide state of a mounted filesystem.
///
/// Initialized once when the mount is established and never mutated
/// afterwards; every operation handler reads from it.
pub struct Persistent {
    pub mirror: Mirror,
    pub procedures: Vec<Procedure>,
    pub eager_size: bool,
    pub temp: TempSpace,
    pub env: Env,
}

impl Persistent {
    /// Open the mirror and freeze the runtime state described by `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let mirror = Mirror::new(&config.mirror)?;
        let mut procedures = config.procedures;
        if procedures.is_empty() {
            procedures.push(Procedure::default());
        }
        Ok(Self {
            mirror,
            procedures,
            eager_size: config.eager_size,
            temp: TempSpace::probe(),
            env: std::env::vars_os().collect(),
        })
    }

    /// Find the procedure governing a mirror-relative path, if any.
    ///
    /// Tests run in list order and the first match wins; a file that
    /// matches nothing is an ordinary pass-through file. Note that
    /// external tests execute here, on every call.
    pub fn classify(&self, rel: &Path) -> Option<&Procedure> {
        self.procedures.iter().find(|p| p.test.matches(self, rel))
    }
}
