// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use fuser::MountOption;
use scriptfs::{Config, Procedure, Session};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::prelude::*;

const SCRIPTFS_LOG: &str = "SCRIPTFS_LOG";

/// Exit status for a mirror that exists but cannot be opened,
/// following the sysexits convention.
const EX_NOPERM: i32 = 77;

fn main() {
    // because this function exits right away it does not
    // properly handle destruction of data, so we put the actual
    // logic into a separate function/scope
    std::process::exit(main2())
}

fn main2() -> i32 {
    let opt = CmdScriptfs::parse();
    configure_logging(opt.verbose);

    match opt.run() {
        Err(err) => {
            tracing::error!("{err:#}");
            1
        }
        Ok(code) => code,
    }
}

/// Mount a mirror of a folder in which scripts read as their own output
#[derive(Debug, Parser)]
#[clap(name = "scriptfs", version = scriptfs::VERSION)]
pub struct CmdScriptfs {
    /// Make logging more verbose (can be specified more than once)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Report the final output size for scripts instead of the size
    /// of their source, by running them on every stat
    #[clap(short = 'l', long)]
    eager_size: bool,

    /// Add a procedure telling what to do with files, as
    /// PROGRAM[;TEST]
    ///
    /// PROGRAM is `auto`, `self` or a command whose `!` argument is
    /// replaced with a copy of the file being read (without `!` the
    /// file is piped on its standard input). TEST is `always`,
    /// `executable`, `&PATTERN` or a command run the same way over the
    /// virtual path; exit status zero classifies the file as a script.
    /// Procedures are tried in the order given and the first matching
    /// test wins. The default is `auto`.
    #[clap(short = 'p', long = "procedure", value_parser = parse_procedure)]
    procedures: Vec<Procedure>,

    /// Do not daemonize the filesystem, run it in the foreground instead
    #[clap(long, short)]
    foreground: bool,

    /// Do not disconnect the filesystem logs from stderr
    ///
    /// Although the filesystem will still daemonize, the logs will
    /// still appear in the stderr of the calling process/shell
    #[clap(long, short = 'd', env = "SCRIPTFS_LOG_FOREGROUND")]
    log_foreground: bool,

    /// Options for the mount in the form opt1,opt2=value, passed
    /// through to the FUSE layer
    #[clap(long, short, value_delimiter = ',')]
    options: Vec<String>,

    /// Actual folder on the disk that will be the base of the mounted
    /// structure
    mirror: PathBuf,

    /// Empty folder that will be used as the mount point
    mountpoint: PathBuf,
}

fn parse_procedure(spec: &str) -> Result<Procedure, String> {
    Procedure::from_spec(spec).map_err(|err| err.to_string())
}

impl CmdScriptfs {
    pub fn run(&self) -> Result<i32> {
        if !self.mirror.is_dir() {
            tracing::error!(
                "mirror folder {:?} doesn't exist or is not a directory",
                self.mirror
            );
            return Ok(libc::ENOENT);
        }
        if !self.mountpoint.is_dir() {
            tracing::error!(
                "mount point {:?} doesn't exist or is not a directory",
                self.mountpoint
            );
            return Ok(libc::ENOENT);
        }
        let mut children = std::fs::read_dir(&self.mountpoint)
            .context("failed to inspect the mount point")?;
        if children.next().is_some() {
            bail!("mount point {:?} is not empty", self.mountpoint);
        }

        let mut mount_options: HashSet<_> = [
            MountOption::NoDev,
            MountOption::NoSuid,
            MountOption::FSName("scriptfs".into()),
        ]
        .into_iter()
        .collect();
        mount_options.extend(self.options.iter().map(|opt| mount_option(opt)));

        let config = Config {
            mirror: self.mirror.clone(),
            procedures: self.procedures.clone(),
            eager_size: self.eager_size,
            mount_options,
        };
        tracing::debug!("config: {config:#?}");

        let mount_opts = config.mount_options.iter().cloned().collect::<Vec<_>>();
        let session = match Session::new(config) {
            Ok(session) => session,
            Err(err) => {
                tracing::error!("{err}");
                return Ok(EX_NOPERM);
            }
        };

        tracing::debug!("establishing fuse session...");
        let mut session = fuser::Session::new(session, &self.mountpoint, &mount_opts)
            .context("failed to create a FUSE session")?;

        if !self.foreground {
            tracing::debug!("moving into background...");
            // We cannot daemonize until the session is established above,
            // otherwise initial use of the filesystem may not show any mount
            // at all.
            nix::unistd::daemon(false, self.log_foreground)?;
        }

        // We also cannot go multi-thread until the daemonization process
        // above is complete, otherwise we can end up with deadlocks.
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to establish runtime")?;

        let result = rt.block_on(async move {
            let mut interrupt =
                signal(SignalKind::interrupt()).context("interrupt signal handler")?;
            let mut quit = signal(SignalKind::quit()).context("quit signal handler")?;
            let mut terminate =
                signal(SignalKind::terminate()).context("terminate signal handler")?;

            tracing::info!("starting FUSE filesystem");
            // Although the filesystem could run in the current thread, we
            // prefer a blocking future that tokio can manage and schedule
            // alongside the signal listeners
            let fut = tokio::task::spawn_blocking(move || session.run());
            tokio::select! {
                res = fut => {
                    tracing::info!("filesystem shutting down");
                    res.context("FUSE session failed")
                }
                // we explicitly catch any signal related to interruption
                // and will act by shutting down the filesystem early
                _ = terminate.recv() => Err(anyhow!("terminate signal received, filesystem shutting down")),
                _ = interrupt.recv() => Err(anyhow!("interrupt signal received, filesystem shutting down")),
                _ = quit.recv() => Err(anyhow!("quit signal received, filesystem shutting down")),
            }
        });

        // it's possible that we've launched long running tasks that are
        // waiting for events which will never come, so don't block forever
        // when the runtime is dropped
        rt.shutdown_timeout(std::time::Duration::from_secs(2));
        result??;
        Ok(0)
    }
}

pub fn configure_logging(verbosity: u8) {
    let mut config = match verbosity {
        0 => {
            if let Ok(existing) = std::env::var(SCRIPTFS_LOG) {
                existing
            } else {
                "scriptfs=info,warn".to_string()
            }
        }
        1 => "scriptfs=debug,info".to_string(),
        2 => "scriptfs=trace,info".to_string(),
        _ => "trace".to_string(),
    };
    std::env::set_var(SCRIPTFS_LOG, &config);
    if let Ok(overrides) = std::env::var("RUST_LOG") {
        config.push(',');
        config.push_str(&overrides);
    }
    let env_filter = tracing_subscriber::filter::EnvFilter::new(config);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(verbosity > 2);
    let sub = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(fmt_layer);
    tracing::subscriber::set_global_default(sub).unwrap();
}

/// Translate one `-o` option string into a [`MountOption`].
///
/// The binding keeps its own string parser private, so the handful of
/// named options are mapped here and anything unrecognized is handed
/// through as a custom option for the kernel to judge.
fn mount_option(opt: &str) -> MountOption {
    if let Some((key, value)) = opt.split_once('=') {
        return match key {
            "fsname" => MountOption::FSName(value.to_string()),
            "subtype" => MountOption::Subtype(value.to_string()),
            _ => MountOption::CUSTOM(opt.to_string()),
        };
    }
    match opt {
        "ro" => MountOption::RO,
        "rw" => MountOption::RW,
        "dev" => MountOption::Dev,
        "nodev" => MountOption::NoDev,
        "suid" => MountOption::Suid,
        "nosuid" => MountOption::NoSuid,
        "exec" => MountOption::Exec,
        "noexec" => MountOption::NoExec,
        "atime" => MountOption::Atime,
        "noatime" => MountOption::NoAtime,
        "sync" => MountOption::Sync,
        "async" => MountOption::Async,
        "dirsync" => MountOption::DirSync,
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "auto_unmount" => MountOption::AutoUnmount,
        "default_permissions" => MountOption::DefaultPermissions,
        other => MountOption::CUSTOM(other.to_string()),
    }
}

#[cfg(test)]
mod main_test {
    use super::*;

    #[test]
    fn test_parse_args_with_procedures() {
        let cmd = CmdScriptfs::try_parse_from([
            "scriptfs",
            "-l",
            "-p",
            "auto",
            "-p",
            "/bin/echo !;&file_[0-4]",
            "/srv/mirror",
            "/mnt/view",
        ])
        .unwrap();
        assert!(cmd.eager_size);
        assert_eq!(cmd.procedures.len(), 2);
        assert_eq!(cmd.mirror, PathBuf::from("/srv/mirror"));
        assert_eq!(cmd.mountpoint, PathBuf::from("/mnt/view"));
    }

    #[test]
    fn test_parse_args_rejects_bad_procedure() {
        let res = CmdScriptfs::try_parse_from([
            "scriptfs",
            "-p",
            "sed 's/incomplete quote",
            "/srv/mirror",
            "/mnt/view",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn test_parse_mount_options() {
        assert_eq!(mount_option("allow_other"), MountOption::AllowOther);
        assert_eq!(mount_option("fsname=custom"), MountOption::FSName("custom".into()));
        assert_eq!(
            mount_option("whatever=1"),
            MountOption::CUSTOM("whatever=1".into())
        );
        assert_eq!(mount_option("nonsense"), MountOption::CUSTOM("nonsense".into()));
    }
}
