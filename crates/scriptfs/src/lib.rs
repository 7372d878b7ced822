// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! A mirror filesystem that executes scripts in place of reading them.
//!
//! A directory (the mirror) is surfaced at an empty mount point.
//! Files classified as scripts by a configurable chain of procedures
//! are served as the standard output of running a program over them;
//! everything else passes straight through to the mirror.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

mod artifact;
mod config;
mod error;
mod exec;
mod fuse;
mod mirror;
mod procedure;

pub use artifact::TempSpace;
pub use config::{Config, Persistent};
pub use error::{Error, Result};
pub use fuse::Session;
pub use mirror::Mirror;
pub use procedure::{CommandSpec, Procedure, Program, Test};
