/*!
The `arca` binary: a thin wrapper over the engine, mapping command line
options onto the backup and restore pipelines and engine errors onto exit
codes.

Exit codes: 0 success, 1 user error, 2 integrity failure, 3 transport or
disk I/O error, 4 canceled.
*/

mod backup;
mod cli;
mod host;
mod restore;
mod util;

use anyhow::Result;
use arca::{BackupError, RestoreError, TransportError};
use clap::Parser;
use cli::{Command, Opt};
use host::FsInventory;
use tracing_subscriber::EnvFilter;

fn main() {
    let opt = match Opt::try_parse() {
        Ok(opt) => opt,
        Err(e) => {
            // help and version are not errors
            if e.use_stderr() {
                eprintln!("{e}");
                std::process::exit(1);
            }
            e.print().ok();
            std::process::exit(0);
        }
    };

    let default_level = match opt.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(opt) {
        eprintln!("error: {e:#}");
        std::process::exit(exit_code(&e));
    }
}

fn run(opt: Opt) -> Result<()> {
    let mut inventory = FsInventory::load(&opt.inventory_root)?;
    match opt.command {
        Command::Backup(args) => backup::run(args, &mut inventory),
        Command::Restore(args) => restore::run(args, &mut inventory),
    }
}

/// Maps engine errors onto the documented exit codes; anything
/// unclassified is a user error
fn exit_code(error: &anyhow::Error) -> i32 {
    if let Some(e) = error.downcast_ref::<BackupError>() {
        return match e {
            BackupError::Canceled => 4,
            BackupError::WriteFailed(_)
            | BackupError::ReadFailed(..)
            | BackupError::Io(_) => 3,
            BackupError::Transport(t) => transport_code(t),
            BackupError::NoPassphrase
            | BackupError::NoSuchVm(_)
            | BackupError::VmRunning(_)
            | BackupError::Filter(_)
            | BackupError::Catalog(_) => 1,
        };
    }
    if let Some(e) = error.downcast_ref::<RestoreError>() {
        return match e {
            RestoreError::Canceled => 4,
            RestoreError::Header(_)
            | RestoreError::UnsafeName(_)
            | RestoreError::OrphanChunk(_)
            | RestoreError::BadMac(_)
            | RestoreError::PrematureEof(_)
            | RestoreError::Integrity(_) => 2,
            RestoreError::Transport(t) => transport_code(t),
            RestoreError::ExtractFailed(_)
            | RestoreError::ReadFailed(_)
            | RestoreError::Io(_) => 3,
            RestoreError::LegacyRefused
            | RestoreError::UnresolvedProblems(_)
            | RestoreError::Catalog(_)
            | RestoreError::Cipher(_)
            | RestoreError::Filter(_) => 1,
        };
    }
    1
}

fn transport_code(error: &TransportError) -> i32 {
    match error {
        TransportError::QuotaExceeded { .. } => 2,
        _ => 3,
    }
}
